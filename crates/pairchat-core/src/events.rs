use std::sync::{Arc, PoisonError, RwLock};

use crate::chat::ChatMessage;
use crate::pairing::PairingState;
use crate::peer::MediaStream;
use crate::playback::PlaybackState;
use crate::protocol::{Role, SessionIdentity};

/// Events emitted by the core to UI listeners.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    IdentityAssigned(SessionIdentity),
    PairingChanged(PairingState),
    ChatMessageAdded(ChatMessage),
    ChatCleared,
    CallStarted { role: Role },
    LocalStreamReady(MediaStream),
    RemoteStreamReady(MediaStream),
    /// Peer session released; any bound media views should be detached.
    CallEnded,
    MediaLoaded(String),
    PlaybackChanged(PlaybackState),
    /// Non-fatal capability problem (camera denied, player not ready, ...).
    CapabilityError(String),
    /// An intent that was not allowed in the current state.
    IntentRejected(String),
    /// Human-readable status line.
    Status(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (the session may run on a tokio task).
pub trait SessionEventListener: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn SessionEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: SessionEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
