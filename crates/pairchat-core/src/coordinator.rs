//! Session coordinator: the one place that owns session state.
//!
//! Every input (relay event, capability callback, user intent) is handled
//! on a single task, so the pairing state, the peer session, chat and
//! playback are never touched concurrently. Asynchronous results carry the
//! generation they were started under and are discarded when it no longer
//! matches.
//!
//! Relay frames are judged by their [`Epoch`] instead: a pairing-scoped
//! frame is accepted only if it arrived in the epoch of the last scope
//! frame applied and nothing local (partner left, find-new-partner, channel
//! loss) ended that scope since.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelInput, Epoch, Outbound};
use crate::chat::{ChatMessage, ChatRelay};
use crate::errors::{ErrorClass, PairchatError};
use crate::events::{ConnectionState, EventEmitter, SessionEvent, SessionEventListener};
use crate::pairing::{
    Generation, GenerationWatch, Outcome, PairingInput, PairingMachine, PairingState, Stamped,
};
use crate::peer::{BlobRoute, MediaDevices, PeerConnector, PeerNotice, PeerSession, PeerUpdate};
use crate::playback::{PlaybackState, PlaybackSync, PlaybackWidget, PlayerNotice};
use crate::protocol::{ClientMessage, RelayEvent, Role, SessionIdentity, SignalingBlob};

/// Sender label for our own chat messages when no display name is set.
const LOCAL_SENDER_LABEL: &str = "You";

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub display_name: Option<String>,
    /// Start the call as soon as the relay makes us initiator.
    pub auto_start_call: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            display_name: None,
            auto_start_call: true,
        }
    }
}

/// Host-provided capabilities.
pub struct Capabilities {
    pub devices: Box<dyn MediaDevices>,
    pub connector: Box<dyn PeerConnector>,
    pub player: Box<dyn PlaybackWidget>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserIntent {
    SendChat(String),
    StartCall,
    EndCall,
    ShareMedia(String),
    SetPlaying(bool),
    FindNewPartner,
    Shutdown,
}

impl UserIntent {
    /// Intents addressed to the partner the user was looking at.
    fn is_pairing_scoped(&self) -> bool {
        matches!(
            self,
            UserIntent::SendChat(_) | UserIntent::StartCall | UserIntent::ShareMedia(_)
        )
    }
}

#[derive(Debug)]
pub enum SessionInput {
    Channel(ChannelInput),
    Peer(PeerNotice),
    Player(PlayerNotice),
    Intent(Stamped<UserIntent>),
}

/// Cloneable intent sender for the host. Each intent is stamped with the
/// generation current at submission time.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Stamped<UserIntent>>,
    watch: GenerationWatch,
}

impl SessionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Stamped<UserIntent>>, watch: GenerationWatch) -> Self {
        Self { tx, watch }
    }

    pub fn submit(&self, intent: UserIntent) -> Result<(), PairchatError> {
        self.tx
            .send(Stamped::new(self.watch.current(), intent))
            .map_err(|_| PairchatError::Channel("session stopped".into()))
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), PairchatError> {
        self.submit(UserIntent::SendChat(text.into()))
    }

    pub fn find_new_partner(&self) -> Result<(), PairchatError> {
        self.submit(UserIntent::FindNewPartner)
    }

    pub fn shutdown(&self) -> Result<(), PairchatError> {
        self.submit(UserIntent::Shutdown)
    }
}

pub struct SessionCoordinator {
    options: SessionOptions,
    pairing: PairingMachine,
    identity: Option<SessionIdentity>,
    connection: ConnectionState,
    ever_connected: bool,
    /// Epoch whose pairing-scoped frames belong to the current pairing.
    scope: Option<Epoch>,
    peer: PeerSession,
    chat: ChatRelay,
    playback: PlaybackSync,
    outbound: Box<dyn Outbound>,
    emitter: EventEmitter,
}

impl SessionCoordinator {
    /// `peer_notices` is where capabilities report back.
    pub fn new(
        options: SessionOptions,
        capabilities: Capabilities,
        outbound: Box<dyn Outbound>,
        peer_notices: mpsc::UnboundedSender<PeerNotice>,
    ) -> Self {
        Self {
            options,
            pairing: PairingMachine::new(),
            identity: None,
            connection: ConnectionState::Disconnected,
            ever_connected: false,
            scope: None,
            peer: PeerSession::new(capabilities.devices, capabilities.connector, peer_notices),
            chat: ChatRelay::new(),
            playback: PlaybackSync::new(capabilities.player),
            outbound,
            emitter: EventEmitter::new(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub fn state(&self) -> &PairingState {
        self.pairing.state()
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.as_ref()
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.chat.messages()
    }

    pub fn playback(&self) -> &PlaybackState {
        self.playback.state()
    }

    pub fn generation(&self) -> Generation {
        self.pairing.generation()
    }

    /// Hand this to [`SessionHandle::new`].
    pub fn watch(&self) -> GenerationWatch {
        self.pairing.watch()
    }

    pub fn call_active(&self) -> bool {
        self.peer.is_active()
    }

    /// Handle one input. Returns false once the session has ended.
    pub fn handle(&mut self, input: SessionInput) -> bool {
        match input {
            SessionInput::Channel(input) => self.on_channel_event(input),
            SessionInput::Peer(notice) => self.on_peer_notice(notice),
            SessionInput::Player(notice) => self.on_player_notice(notice),
            SessionInput::Intent(stamped) => self.on_intent(stamped),
        }
        !matches!(self.pairing.state(), PairingState::Ended)
    }

    /// Drive the session until it ends or every [`SessionHandle`] is dropped.
    pub async fn run(
        mut self,
        mut channel_rx: mpsc::Receiver<ChannelInput>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerNotice>,
        mut player_rx: mpsc::UnboundedReceiver<PlayerNotice>,
        mut intent_rx: mpsc::UnboundedReceiver<Stamped<UserIntent>>,
    ) {
        let mut channel_open = true;
        let mut player_open = true;

        loop {
            let input = tokio::select! {
                intent = intent_rx.recv() => match intent {
                    Some(intent) => SessionInput::Intent(intent),
                    None => {
                        info!("intent senders dropped");
                        self.shutdown();
                        break;
                    }
                },
                Some(notice) = peer_rx.recv() => SessionInput::Peer(notice),
                event = channel_rx.recv(), if channel_open => match event {
                    Some(event) => SessionInput::Channel(event),
                    None => {
                        debug!("channel adapter stopped");
                        channel_open = false;
                        continue;
                    }
                },
                notice = player_rx.recv(), if player_open => match notice {
                    Some(notice) => SessionInput::Player(notice),
                    None => {
                        player_open = false;
                        continue;
                    }
                },
            };

            if !self.handle(input) {
                break;
            }
        }
        info!("session loop ended");
    }

    pub fn on_channel_event(&mut self, input: ChannelInput) {
        let ChannelInput { epoch, event } = input;
        match event {
            ChannelEvent::Connecting { attempt } => {
                let state = if self.ever_connected || attempt > 1 {
                    ConnectionState::Reconnecting { attempt }
                } else {
                    ConnectionState::Connecting
                };
                self.set_connection(state);
            }
            ChannelEvent::Opened => {
                self.scope = None;
                self.ever_connected = true;
                self.set_connection(ConnectionState::Connected);
            }
            ChannelEvent::Relay(event) => self.on_relay_event(epoch, event),
            ChannelEvent::Dropped { reason } => self.channel_lost(&reason),
            ChannelEvent::ConnectFailed { reason } => {
                debug!(%reason, "relay dial failed");
            }
            ChannelEvent::GaveUp { attempts } => {
                self.set_connection(ConnectionState::Disconnected);
                self.emitter.emit(SessionEvent::Status(format!(
                    "could not reach the relay after {attempts} attempts"
                )));
            }
        }
    }

    fn on_relay_event(&mut self, epoch: Epoch, event: RelayEvent) {
        if event.is_pairing_scoped() && self.scope != Some(epoch) {
            debug!(
                epoch = epoch.value(),
                scope = self.scope.map(Epoch::value),
                ?event,
                "dropping relay event from a past pairing"
            );
            return;
        }

        let opens_scope = event.opens_scope();
        let generation = self.pairing.generation();
        match event {
            RelayEvent::Connect(identity) => {
                info!(%identity, "session identity assigned");
                self.identity = Some(identity.clone());
                self.emitter.emit(SessionEvent::IdentityAssigned(identity));
                self.transition(PairingInput::ChannelUp);
            }
            RelayEvent::Waiting => {
                self.transition(PairingInput::RelayWaiting);
            }
            RelayEvent::Paired(info) => {
                self.transition(PairingInput::Paired(info));
            }
            RelayEvent::PartnerLeft => {
                if self.transition(PairingInput::PartnerLeft) {
                    self.emitter
                        .emit(SessionEvent::Status("partner left".to_string()));
                }
            }
            RelayEvent::Signal(blob) => self.on_remote_signal(generation, blob),
            RelayEvent::Chat(chat) => {
                if let Some(msg) =
                    self.chat
                        .on_inbound(&self.pairing, generation, chat, self.identity.as_ref())
                {
                    self.emitter.emit(SessionEvent::ChatMessageAdded(msg));
                }
            }
            RelayEvent::MediaShare(media_id) => {
                if self
                    .playback
                    .on_inbound_media(&self.pairing, generation, media_id.clone())
                {
                    self.emitter.emit(SessionEvent::MediaLoaded(media_id));
                    self.emit_playback();
                }
            }
            RelayEvent::MediaPlay => self.on_remote_transport(generation, true),
            RelayEvent::MediaPause => self.on_remote_transport(generation, false),
            RelayEvent::Disconnect(reason) => self.channel_lost(&reason),
        }
        if opens_scope {
            self.scope = Some(epoch);
        }
    }

    fn on_remote_transport(&mut self, generation: Generation, playing: bool) {
        if self
            .playback
            .on_inbound_play_pause(&self.pairing, generation, playing)
        {
            self.emit_playback();
        }
    }

    fn on_remote_signal(&mut self, generation: Generation, blob: SignalingBlob) {
        let Some(partner) = self.pairing.state().partner() else {
            debug!("dropping signal received without a partner");
            return;
        };
        if partner.role == Some(Role::Initiator) && !self.peer.is_active() {
            debug!("dropping signal: this side initiates the call");
            return;
        }

        match self.peer.apply_remote_blob(generation, blob) {
            Ok(BlobRoute::StartedResponder) => {
                self.emitter.emit(SessionEvent::CallStarted {
                    role: Role::Responder,
                });
            }
            Ok(BlobRoute::Applied | BlobRoute::Buffered) => {}
            Err(e) => {
                self.emitter.emit(SessionEvent::CallEnded);
                self.report(e);
            }
        }
    }

    pub fn on_peer_notice(&mut self, notice: PeerNotice) {
        let generation = notice.ticket.generation;
        match self.peer.on_notice(notice) {
            PeerUpdate::Stale => {}
            PeerUpdate::LocalStream(stream) => {
                self.emitter.emit(SessionEvent::LocalStreamReady(stream));
            }
            PeerUpdate::RemoteStream(stream) => {
                info!(stream = %stream.id, "remote stream attached");
                self.emitter.emit(SessionEvent::RemoteStreamReady(stream));
            }
            PeerUpdate::Outbound(msg) => {
                if self.pairing.accepts(generation) {
                    self.forward(msg);
                } else {
                    debug!("dropping local signal for a past pairing");
                }
            }
            PeerUpdate::Failed(e) => {
                self.emitter.emit(SessionEvent::CallEnded);
                self.report(e);
            }
            PeerUpdate::Ended => self.emitter.emit(SessionEvent::CallEnded),
        }
    }

    pub fn on_player_notice(&mut self, notice: PlayerNotice) {
        if let Some(msg) = self.playback.on_player_notice(&self.pairing, notice) {
            self.forward(msg);
        }
        if matches!(notice, PlayerNotice::StateChanged { .. }) {
            self.emit_playback();
        }
    }

    fn on_intent(&mut self, stamped: Stamped<UserIntent>) {
        let Stamped { generation, event } = stamped;
        if event.is_pairing_scoped() && generation != self.pairing.generation() {
            debug!(?event, "rejecting intent addressed to a past pairing");
            self.emitter.emit(SessionEvent::IntentRejected(
                "partner changed before the request was handled".to_string(),
            ));
            return;
        }

        let result = match event {
            UserIntent::SendChat(text) => self.send_chat(&text).map(|_| ()),
            UserIntent::StartCall => self.start_call(),
            UserIntent::EndCall => {
                self.end_call();
                Ok(())
            }
            UserIntent::ShareMedia(link) => self.share_media(&link).map(|_| ()),
            UserIntent::SetPlaying(playing) => self.set_playing(playing),
            UserIntent::FindNewPartner => self.find_new_partner(),
            UserIntent::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };
        if let Err(e) = result {
            self.report(e);
        }
    }

    pub fn send_chat(&mut self, text: &str) -> Result<ChatMessage, PairchatError> {
        let sender = self
            .options
            .display_name
            .clone()
            .unwrap_or_else(|| LOCAL_SENDER_LABEL.to_string());
        let (msg, frame) = self.chat.send(&self.pairing, &sender, text)?;
        self.forward(frame);
        self.emitter.emit(SessionEvent::ChatMessageAdded(msg.clone()));
        Ok(msg)
    }

    /// Start the call, or answer again if an earlier answer failed to get
    /// capture.
    pub fn start_call(&mut self) -> Result<(), PairchatError> {
        let role = self
            .pairing
            .state()
            .partner()
            .ok_or(PairchatError::NotPaired)?
            .role;
        let generation = self.pairing.generation();
        if self.peer.resume_responder(generation)? {
            self.emitter.emit(SessionEvent::CallStarted {
                role: Role::Responder,
            });
            return Ok(());
        }
        if role == Some(Role::Responder) {
            return Err(PairchatError::NotInitiator);
        }
        self.peer.start_as_initiator(generation)?;
        self.emitter.emit(SessionEvent::CallStarted {
            role: Role::Initiator,
        });
        Ok(())
    }

    /// Hang up but keep the pairing. Returns false when no call was up.
    pub fn end_call(&mut self) -> bool {
        let ended = self.peer.teardown();
        if ended {
            self.emitter.emit(SessionEvent::CallEnded);
        }
        ended
    }

    pub fn share_media(&mut self, link: &str) -> Result<String, PairchatError> {
        let (media_id, frame) = self.playback.share_media(&self.pairing, link)?;
        self.forward(frame);
        self.emitter.emit(SessionEvent::MediaLoaded(media_id.clone()));
        self.emit_playback();
        Ok(media_id)
    }

    pub fn set_playing(&mut self, playing: bool) -> Result<(), PairchatError> {
        self.playback.set_playing(playing)
    }

    /// Move to `Waiting` right away, then ask the relay for someone else.
    pub fn find_new_partner(&mut self) -> Result<(), PairchatError> {
        if matches!(
            self.pairing.state(),
            PairingState::Idle | PairingState::Ended
        ) {
            return Err(PairchatError::NotConnected);
        }
        self.transition(PairingInput::FindNewPartner);
        self.forward(ClientMessage::FindNewPartner);
        Ok(())
    }

    /// Tear everything down. The session cannot be restarted.
    pub fn shutdown(&mut self) {
        if self.transition(PairingInput::Close) {
            self.identity = None;
            info!("session shut down");
        }
    }

    fn channel_lost(&mut self, reason: &str) {
        warn!(%reason, "relay channel lost");
        self.scope = None;
        self.ever_connected = true;
        self.identity = None;
        self.set_connection(ConnectionState::Disconnected);
        self.transition(PairingInput::ChannelDown);
        self.emitter
            .emit(SessionEvent::Status(format!("disconnected: {reason}")));
    }

    /// Apply a pairing input and run the side effects of the edge taken.
    /// Returns true when the state changed.
    fn transition(&mut self, input: PairingInput) -> bool {
        // Leaving a pairing keeps its conversation on screen; starting a
        // new one (or asking for one) clears it.
        let clears_chat = matches!(
            input,
            PairingInput::ChannelUp | PairingInput::Paired(_) | PairingInput::FindNewPartner
        );

        match self.pairing.apply(input) {
            Outcome::Moved { teardown, .. } => {
                // Frames still queued for the old pairing must not match.
                self.scope = None;
                if teardown {
                    self.end_call();
                }
                if clears_chat && !self.chat.messages().is_empty() {
                    self.chat.clear();
                    self.emitter.emit(SessionEvent::ChatCleared);
                }
                let had_media = self.playback.state() != &PlaybackState::default();
                self.playback.reset();
                if had_media {
                    self.emit_playback();
                }

                let state = self.pairing.state().clone();
                self.emitter.emit(SessionEvent::PairingChanged(state.clone()));

                if let PairingState::Paired(partner) = state {
                    if partner.role == Some(Role::Initiator) && self.options.auto_start_call {
                        if let Err(e) = self.start_call() {
                            self.report(e);
                        }
                    }
                }
                true
            }
            Outcome::Unchanged => false,
            Outcome::Rejected(reason) => {
                debug!(reason, state = self.pairing.state().name(), "ignoring pairing input");
                false
            }
        }
    }

    /// Best-effort send; a message that cannot be written is lost.
    fn forward(&self, msg: ClientMessage) {
        let event = msg.event_name();
        if let Err(e) = self.outbound.send(msg) {
            warn!(error = %e, event, "dropping outbound message");
        }
    }

    fn report(&self, error: PairchatError) {
        match error.class() {
            ErrorClass::Capability => {
                warn!(error = %error, "capability error");
                self.emitter
                    .emit(SessionEvent::CapabilityError(error.to_string()));
            }
            ErrorClass::Usage => {
                debug!(error = %error, "intent rejected");
                self.emitter
                    .emit(SessionEvent::IntentRejected(error.to_string()));
            }
            ErrorClass::Channel => {
                self.emitter.emit(SessionEvent::Status(error.to_string()));
            }
            ErrorClass::Protocol => debug!(error = %error, "ignoring protocol error"),
        }
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            self.connection = state.clone();
            self.emitter.emit(SessionEvent::ConnectionStateChanged(state));
        }
    }

    fn emit_playback(&self) {
        self.emitter
            .emit(SessionEvent::PlaybackChanged(self.playback.state().clone()));
    }
}
