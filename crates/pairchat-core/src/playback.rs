use std::sync::LazyLock;

use regex::Regex;

use crate::errors::PairchatError;
use crate::pairing::{Generation, PairingMachine};
use crate::protocol::ClientMessage;

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.*(?:youtu\.be/|v/|u/\w/|embed/|watch\?v=|&v=)([^#&?]*).*").unwrap()
});
static BARE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap());

/// Extract an 11-character video id from a share link or a bare id.
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim();
    if BARE_ID_RE.is_match(input) {
        return Some(input.to_string());
    }
    let id = LINK_RE.captures(input)?.get(1)?.as_str();
    (id.len() == 11).then(|| id.to_string())
}

/// The embedded third-party player.
pub trait PlaybackWidget: Send {
    fn load(&mut self, media_id: &str);
    fn play(&mut self);
    fn pause(&mut self);
}

/// Notifications raised by the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerNotice {
    Ready,
    StateChanged { playing: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackState {
    pub media_id: Option<String>,
    pub playing: bool,
}

/// Keeps the local player in step with the partner's.
///
/// Remote intents are applied without re-broadcasting, and the player's
/// own state change that follows a remote intent is swallowed so the two
/// sides never ping-pong.
pub struct PlaybackSync {
    widget: Box<dyn PlaybackWidget>,
    state: PlaybackState,
    ready: bool,
    pending_load: Option<String>,
    pending_playing: Option<bool>,
    expected_echo: Option<bool>,
}

impl PlaybackSync {
    pub fn new(widget: Box<dyn PlaybackWidget>) -> Self {
        Self {
            widget,
            state: PlaybackState::default(),
            ready: false,
            pending_load: None,
            pending_playing: None,
            expected_echo: None,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    /// Load a link locally and build the frame telling the partner.
    pub fn share_media(
        &mut self,
        pairing: &PairingMachine,
        link: &str,
    ) -> Result<(String, ClientMessage), PairchatError> {
        if !pairing.state().is_paired() {
            return Err(PairchatError::NotPaired);
        }
        let media_id = extract_video_id(link)
            .ok_or_else(|| PairchatError::InvalidMedia(link.trim().to_string()))?;

        self.load(media_id.clone());
        tracing::info!(%media_id, "sharing media");
        Ok((media_id.clone(), ClientMessage::MediaShare(media_id)))
    }

    /// Returns true when the share was applied.
    pub fn on_inbound_media(
        &mut self,
        pairing: &PairingMachine,
        generation: Generation,
        media_id: String,
    ) -> bool {
        if !pairing.accepts(generation) {
            tracing::debug!(%media_id, "dropping stale media share");
            return false;
        }
        self.load(media_id);
        true
    }

    /// Returns true when the play/pause was applied.
    pub fn on_inbound_play_pause(
        &mut self,
        pairing: &PairingMachine,
        generation: Generation,
        playing: bool,
    ) -> bool {
        if !pairing.accepts(generation) {
            tracing::debug!(playing, "dropping stale play/pause");
            return false;
        }
        self.state.playing = playing;
        if self.ready {
            self.expected_echo = Some(playing);
            self.drive(playing);
        } else {
            self.pending_playing = Some(playing);
        }
        true
    }

    /// Local player changed state; returns the frame to broadcast, if any.
    pub fn on_local_playback_changed(
        &mut self,
        pairing: &PairingMachine,
        playing: bool,
    ) -> Option<ClientMessage> {
        self.state.playing = playing;
        if self.expected_echo.take() == Some(playing) {
            return None;
        }
        if !pairing.state().is_paired() || self.state.media_id.is_none() {
            return None;
        }
        Some(if playing {
            ClientMessage::MediaPlay
        } else {
            ClientMessage::MediaPause
        })
    }

    pub fn on_player_notice(
        &mut self,
        pairing: &PairingMachine,
        notice: PlayerNotice,
    ) -> Option<ClientMessage> {
        match notice {
            PlayerNotice::Ready => {
                self.ready = true;
                if let Some(media_id) = self.pending_load.take() {
                    tracing::debug!(%media_id, "player ready, applying queued load");
                    self.widget.load(&media_id);
                }
                if let Some(playing) = self.pending_playing.take() {
                    self.expected_echo = Some(playing);
                    self.drive(playing);
                }
                None
            }
            PlayerNotice::StateChanged { playing } => {
                self.on_local_playback_changed(pairing, playing)
            }
        }
    }

    /// Local transport control from the user; the player reports back
    /// through [`PlayerNotice::StateChanged`].
    pub fn set_playing(&mut self, playing: bool) -> Result<(), PairchatError> {
        if !self.ready {
            return Err(PairchatError::PlayerNotReady);
        }
        self.drive(playing);
        Ok(())
    }

    /// Forget the current pairing's media and stop the player if it is
    /// still running it.
    pub fn reset(&mut self) {
        let was_playing = self.ready && self.state.playing;
        self.state = PlaybackState::default();
        self.pending_load = None;
        self.pending_playing = None;
        self.expected_echo = None;
        if was_playing {
            tracing::debug!("pausing media left over from the previous pairing");
            self.expected_echo = Some(false);
            self.widget.pause();
        }
    }

    fn load(&mut self, media_id: String) {
        self.state.media_id = Some(media_id.clone());
        self.state.playing = false;
        self.pending_playing = None;
        if self.ready {
            self.widget.load(&media_id);
        } else {
            tracing::debug!(%media_id, "player not ready, queueing load");
            self.pending_load = Some(media_id);
        }
    }

    fn drive(&mut self, playing: bool) {
        if playing {
            self.widget.play();
        } else {
            self.widget.pause();
        }
    }
}
