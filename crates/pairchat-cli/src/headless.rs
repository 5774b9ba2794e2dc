//! Capabilities for a terminal host: no camera, no media transport, and a
//! player that only reports what it was asked to do.

use pairchat_core::PairchatError;
use pairchat_core::peer::{MediaDevices, MediaStream, PeerConnection, PeerConnector, PeerEvents};
use pairchat_core::playback::{PlaybackWidget, PlayerNotice};
use pairchat_core::protocol::Role;
use tokio::sync::mpsc;

pub struct HeadlessDevices;

impl MediaDevices for HeadlessDevices {
    fn request_capture(&mut self, events: PeerEvents) {
        events.capture_failed("no capture device on this host");
    }

    fn release(&mut self, _stream: &MediaStream) {}
}

pub struct HeadlessConnector;

impl PeerConnector for HeadlessConnector {
    fn create(
        &mut self,
        _role: Role,
        _local: &MediaStream,
        _events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>, PairchatError> {
        Err(PairchatError::Peer("no media transport available".into()))
    }
}

/// Reports every transport change straight back, the way an embedded
/// player would after it actually started or paused.
pub struct HeadlessPlayer {
    notices: mpsc::UnboundedSender<PlayerNotice>,
}

impl HeadlessPlayer {
    pub fn new(notices: mpsc::UnboundedSender<PlayerNotice>) -> Self {
        let _ = notices.send(PlayerNotice::Ready);
        Self { notices }
    }

    fn report(&self, playing: bool) {
        let _ = self.notices.send(PlayerNotice::StateChanged { playing });
    }
}

impl PlaybackWidget for HeadlessPlayer {
    fn load(&mut self, media_id: &str) {
        println!("* now showing https://www.youtube.com/watch?v={media_id}");
    }

    fn play(&mut self) {
        self.report(true);
    }

    fn pause(&mut self) {
        self.report(false);
    }
}
