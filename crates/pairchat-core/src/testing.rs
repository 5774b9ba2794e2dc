//! Recording fakes for the host capabilities, shared by unit tests.

use std::sync::{Arc, Mutex};

use crate::channel::Outbound;
use crate::errors::PairchatError;
use crate::events::{SessionEvent, SessionEventListener};
use crate::peer::{MediaDevices, MediaStream, PeerConnection, PeerConnector, PeerEvents, TrackKind};
use crate::playback::PlaybackWidget;
use crate::protocol::{ClientMessage, Role, SignalingBlob};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetCall {
    Load(String),
    Play,
    Pause,
}

#[derive(Clone, Default)]
pub struct RecordingWidget {
    calls: Arc<Mutex<Vec<WidgetCall>>>,
}

impl RecordingWidget {
    pub fn calls(&self) -> Vec<WidgetCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl PlaybackWidget for RecordingWidget {
    fn load(&mut self, media_id: &str) {
        self.calls.lock().unwrap().push(WidgetCall::Load(media_id.to_string()));
    }

    fn play(&mut self) {
        self.calls.lock().unwrap().push(WidgetCall::Play);
    }

    fn pause(&mut self) {
        self.calls.lock().unwrap().push(WidgetCall::Pause);
    }
}

pub fn stream(id: &str) -> MediaStream {
    MediaStream {
        id: id.to_string(),
        tracks: vec![TrackKind::Audio, TrackKind::Video],
    }
}

#[derive(Clone, Default)]
pub struct FakeDevices {
    requests: Arc<Mutex<Vec<PeerEvents>>>,
    released: Arc<Mutex<Vec<String>>>,
}

impl FakeDevices {
    pub fn requests(&self) -> Vec<PeerEvents> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> PeerEvents {
        self.requests().pop().expect("no capture requested")
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

impl MediaDevices for FakeDevices {
    fn request_capture(&mut self, events: PeerEvents) {
        self.requests.lock().unwrap().push(events);
    }

    fn release(&mut self, stream: &MediaStream) {
        self.released.lock().unwrap().push(stream.id.clone());
    }
}

#[derive(Debug, Default)]
pub struct ConnectionLog {
    pub applied: Vec<SignalingBlob>,
    pub destroyed: u32,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    created: Arc<Mutex<Vec<(Role, PeerEvents)>>>,
    connections: Arc<Mutex<Vec<Arc<Mutex<ConnectionLog>>>>>,
    fail_create: Arc<Mutex<bool>>,
}

impl FakeConnector {
    pub fn roles(&self) -> Vec<Role> {
        self.created.lock().unwrap().iter().map(|(r, _)| *r).collect()
    }

    pub fn events(&self, index: usize) -> PeerEvents {
        self.created.lock().unwrap()[index].1.clone()
    }

    pub fn connection(&self, index: usize) -> Arc<Mutex<ConnectionLog>> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn fail_next_create(&self) {
        *self.fail_create.lock().unwrap() = true;
    }
}

struct FakeConnection {
    log: Arc<Mutex<ConnectionLog>>,
}

impl PeerConnection for FakeConnection {
    fn apply_signal(&mut self, blob: &SignalingBlob) -> Result<(), PairchatError> {
        self.log.lock().unwrap().applied.push(blob.clone());
        Ok(())
    }

    fn destroy(&mut self) {
        self.log.lock().unwrap().destroyed += 1;
    }
}

impl PeerConnector for FakeConnector {
    fn create(
        &mut self,
        role: Role,
        _local: &MediaStream,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>, PairchatError> {
        if std::mem::take(&mut *self.fail_create.lock().unwrap()) {
            return Err(PairchatError::Peer("ice failure".into()));
        }
        let log = Arc::new(Mutex::new(ConnectionLog::default()));
        self.created.lock().unwrap().push((role, events));
        self.connections.lock().unwrap().push(log.clone());
        Ok(Box::new(FakeConnection { log }))
    }
}

#[derive(Clone, Default)]
pub struct RecordingOutbound {
    sent: Arc<Mutex<Vec<ClientMessage>>>,
}

impl RecordingOutbound {
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl Outbound for RecordingOutbound {
    fn send(&self, msg: ClientMessage) -> Result<(), PairchatError> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct EventCapture {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl EventCapture {
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl SessionEventListener for EventCapture {
    fn on_event(&self, event: SessionEvent) {
        self.events.lock().unwrap().push(event);
    }
}
