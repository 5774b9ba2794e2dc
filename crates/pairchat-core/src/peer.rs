//! The one real-time peer connection of a pairing.
//!
//! Capture acquisition and connection negotiation are asynchronous: the
//! host capabilities report back through [`PeerEvents`], and every report
//! carries the [`CallTicket`] it was issued for. Reports for a ticket that
//! is no longer current are discarded (and any capture they hand over is
//! released straight away).

use tokio::sync::mpsc;

use crate::errors::PairchatError;
use crate::pairing::Generation;
use crate::protocol::{ClientMessage, Role, SignalingBlob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Opaque handle to a local or remote media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<TrackKind>,
}

/// Identifies one call attempt within one pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTicket {
    pub generation: Generation,
    pub attempt: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerNoticeKind {
    CaptureReady(MediaStream),
    CaptureFailed(String),
    LocalSignal(SignalingBlob),
    RemoteStream(MediaStream),
    ConnectionFailed(String),
    ConnectionClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerNotice {
    pub ticket: CallTicket,
    pub kind: PeerNoticeKind,
}

/// Callback sink handed to capabilities, bound to one call attempt.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    ticket: CallTicket,
    tx: mpsc::UnboundedSender<PeerNotice>,
}

impl PeerEvents {
    pub fn new(ticket: CallTicket, tx: mpsc::UnboundedSender<PeerNotice>) -> Self {
        Self { ticket, tx }
    }

    pub fn capture_ready(&self, stream: MediaStream) {
        self.emit(PeerNoticeKind::CaptureReady(stream));
    }

    pub fn capture_failed(&self, reason: impl Into<String>) {
        self.emit(PeerNoticeKind::CaptureFailed(reason.into()));
    }

    pub fn signal(&self, blob: SignalingBlob) {
        self.emit(PeerNoticeKind::LocalSignal(blob));
    }

    pub fn remote_stream(&self, stream: MediaStream) {
        self.emit(PeerNoticeKind::RemoteStream(stream));
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.emit(PeerNoticeKind::ConnectionFailed(reason.into()));
    }

    pub fn closed(&self) {
        self.emit(PeerNoticeKind::ConnectionClosed);
    }

    fn emit(&self, kind: PeerNoticeKind) {
        // The coordinator may already be gone; nothing left to tell.
        let _ = self.tx.send(PeerNotice {
            ticket: self.ticket,
            kind,
        });
    }
}

/// Local camera/microphone access.
pub trait MediaDevices: Send {
    /// Begin acquiring capture; the result is reported through `events`.
    fn request_capture(&mut self, events: PeerEvents);
    /// Stop every track of a stream obtained from `request_capture`.
    fn release(&mut self, stream: &MediaStream);
}

/// Factory for the underlying real-time transport.
pub trait PeerConnector: Send {
    /// Local signaling blobs and the remote stream are reported through `events`.
    fn create(
        &mut self,
        role: Role,
        local: &MediaStream,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>, PairchatError>;
}

pub trait PeerConnection: Send {
    fn apply_signal(&mut self, blob: &SignalingBlob) -> Result<(), PairchatError>;
    fn destroy(&mut self);
}

/// Where an inbound signaling blob ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobRoute {
    Applied,
    /// Session still acquiring capture; applied once the connection exists.
    Buffered,
    StartedResponder,
}

/// What the coordinator should surface after a notice.
#[derive(Debug)]
pub enum PeerUpdate {
    Stale,
    LocalStream(MediaStream),
    RemoteStream(MediaStream),
    Outbound(ClientMessage),
    Failed(PairchatError),
    Ended,
}

enum Phase {
    Inactive,
    Acquiring {
        ticket: CallTicket,
        role: Role,
        pending: Vec<SignalingBlob>,
    },
    Active {
        ticket: CallTicket,
        role: Role,
        connection: Box<dyn PeerConnection>,
        local: MediaStream,
    },
}

pub struct PeerSession {
    devices: Box<dyn MediaDevices>,
    connector: Box<dyn PeerConnector>,
    notices: mpsc::UnboundedSender<PeerNotice>,
    phase: Phase,
    attempts: u64,
    /// Remote blobs of a responder attempt whose capture failed, kept so
    /// the call can be answered once capture is retried.
    retained: Option<(Generation, Vec<SignalingBlob>)>,
}

impl PeerSession {
    pub fn new(
        devices: Box<dyn MediaDevices>,
        connector: Box<dyn PeerConnector>,
        notices: mpsc::UnboundedSender<PeerNotice>,
    ) -> Self {
        Self {
            devices,
            connector,
            notices,
            phase: Phase::Inactive,
            attempts: 0,
            retained: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.phase, Phase::Inactive)
    }

    pub fn start_as_initiator(&mut self, generation: Generation) -> Result<(), PairchatError> {
        if self.is_active() {
            return Err(PairchatError::CallActive);
        }
        self.begin(generation, Role::Initiator, Vec::new());
        Ok(())
    }

    pub fn start_as_responder(
        &mut self,
        generation: Generation,
        initial: SignalingBlob,
    ) -> Result<(), PairchatError> {
        if self.is_active() {
            return Err(PairchatError::CallActive);
        }
        let mut pending = self.take_retained(generation);
        pending.push(initial);
        self.begin(generation, Role::Responder, pending);
        Ok(())
    }

    /// Answer again with the blobs kept from a failed responder attempt of
    /// this pairing. Returns false when there is nothing to answer.
    pub fn resume_responder(&mut self, generation: Generation) -> Result<bool, PairchatError> {
        if self.is_active() {
            return Err(PairchatError::CallActive);
        }
        let pending = self.take_retained(generation);
        if pending.is_empty() {
            return Ok(false);
        }
        tracing::info!(blobs = pending.len(), "retrying responder with kept signals");
        self.begin(generation, Role::Responder, pending);
        Ok(true)
    }

    /// Route an inbound blob to the live session, creating a responder
    /// session only when none exists.
    pub fn apply_remote_blob(
        &mut self,
        generation: Generation,
        blob: SignalingBlob,
    ) -> Result<BlobRoute, PairchatError> {
        match &mut self.phase {
            Phase::Active { connection, .. } => {
                if let Err(e) = connection.apply_signal(&blob) {
                    tracing::warn!(error = %e, "applying remote signal failed, tearing down");
                    self.teardown();
                    return Err(e);
                }
                Ok(BlobRoute::Applied)
            }
            Phase::Acquiring { pending, .. } => {
                pending.push(blob);
                Ok(BlobRoute::Buffered)
            }
            Phase::Inactive => {
                self.start_as_responder(generation, blob)?;
                Ok(BlobRoute::StartedResponder)
            }
        }
    }

    pub fn on_notice(&mut self, notice: PeerNotice) -> PeerUpdate {
        let current = match &self.phase {
            Phase::Acquiring { ticket, .. } | Phase::Active { ticket, .. } => Some(*ticket),
            Phase::Inactive => None,
        };
        if current != Some(notice.ticket) {
            tracing::debug!(
                generation = notice.ticket.generation.value(),
                attempt = notice.ticket.attempt,
                "discarding stale peer notice"
            );
            if let PeerNoticeKind::CaptureReady(stream) = &notice.kind {
                self.devices.release(stream);
            }
            return PeerUpdate::Stale;
        }

        match notice.kind {
            PeerNoticeKind::CaptureReady(stream) => self.connect(notice.ticket, stream),
            PeerNoticeKind::CaptureFailed(reason) => {
                if !matches!(self.phase, Phase::Acquiring { .. }) {
                    return PeerUpdate::Stale;
                }
                let Phase::Acquiring { role, pending, .. } =
                    std::mem::replace(&mut self.phase, Phase::Inactive)
                else {
                    return PeerUpdate::Stale;
                };
                tracing::warn!(%reason, ?role, "capture acquisition failed");
                if role == Role::Responder && !pending.is_empty() {
                    self.retained = Some((notice.ticket.generation, pending));
                }
                PeerUpdate::Failed(PairchatError::Capture(reason))
            }
            PeerNoticeKind::LocalSignal(blob) => match self.phase {
                Phase::Active { .. } => PeerUpdate::Outbound(ClientMessage::Signal(blob)),
                _ => PeerUpdate::Stale,
            },
            PeerNoticeKind::RemoteStream(stream) => PeerUpdate::RemoteStream(stream),
            PeerNoticeKind::ConnectionFailed(reason) => {
                tracing::warn!(%reason, "peer connection failed");
                self.teardown();
                PeerUpdate::Failed(PairchatError::Peer(reason))
            }
            PeerNoticeKind::ConnectionClosed => {
                tracing::info!("peer connection closed");
                self.teardown();
                PeerUpdate::Ended
            }
        }
    }

    /// Release the connection and local capture. Safe to call in any state.
    ///
    /// Returns true when something was actually released.
    pub fn teardown(&mut self) -> bool {
        self.retained = None;
        match std::mem::replace(&mut self.phase, Phase::Inactive) {
            Phase::Inactive => false,
            Phase::Acquiring { ticket, .. } => {
                // The in-flight capture is released when its stale result lands.
                tracing::debug!(attempt = ticket.attempt, "abandoning capture in flight");
                true
            }
            Phase::Active {
                mut connection,
                local,
                ..
            } => {
                connection.destroy();
                self.devices.release(&local);
                tracing::info!("peer session torn down");
                true
            }
        }
    }

    fn take_retained(&mut self, generation: Generation) -> Vec<SignalingBlob> {
        match self.retained.take() {
            Some((kept, blobs)) if kept == generation => blobs,
            _ => Vec::new(),
        }
    }

    fn begin(&mut self, generation: Generation, role: Role, pending: Vec<SignalingBlob>) {
        self.retained = None;
        self.attempts += 1;
        let ticket = CallTicket {
            generation,
            attempt: self.attempts,
        };
        tracing::info!(?role, generation = generation.value(), "starting peer session");
        self.phase = Phase::Acquiring {
            ticket,
            role,
            pending,
        };
        self.devices
            .request_capture(PeerEvents::new(ticket, self.notices.clone()));
    }

    fn connect(&mut self, ticket: CallTicket, stream: MediaStream) -> PeerUpdate {
        let Phase::Acquiring { role, pending, .. } =
            std::mem::replace(&mut self.phase, Phase::Inactive)
        else {
            // A second capture for an already connected attempt.
            self.devices.release(&stream);
            return PeerUpdate::Stale;
        };

        let events = PeerEvents::new(ticket, self.notices.clone());
        let mut connection = match self.connector.create(role, &stream, events) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(error = %e, "creating peer connection failed");
                self.devices.release(&stream);
                return PeerUpdate::Failed(e);
            }
        };

        for blob in &pending {
            if let Err(e) = connection.apply_signal(blob) {
                tracing::warn!(error = %e, "applying buffered signal failed");
                connection.destroy();
                self.devices.release(&stream);
                return PeerUpdate::Failed(e);
            }
        }

        self.phase = Phase::Active {
            ticket,
            role,
            connection,
            local: stream.clone(),
        };
        PeerUpdate::LocalStream(stream)
    }
}
