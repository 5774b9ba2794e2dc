use thiserror::Error;

#[derive(Debug, Error)]
pub enum PairchatError {
    #[error("channel error: {0}")]
    Channel(String),
    #[error("not connected to the relay")]
    NotConnected,
    #[error("no partner connected")]
    NotPaired,
    #[error("message is empty")]
    EmptyMessage,
    #[error("a call is already in progress")]
    CallActive,
    #[error("the partner starts this call")]
    NotInitiator,
    #[error("capture unavailable: {0}")]
    Capture(String),
    #[error("player not ready")]
    PlayerNotReady,
    #[error("peer connection error: {0}")]
    Peer(String),
    #[error("invalid media link: {0}")]
    InvalidMedia(String),
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("settings error: {0}")]
    Settings(String),
}

/// Coarse grouping used to decide how an error is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Camera/mic denied, player not ready: tell the user, keep the pairing.
    Capability,
    /// Channel-level failure: pairing is reset to idle.
    Channel,
    /// Malformed relay input: ignored.
    Protocol,
    /// Intent not allowed in the current state.
    Usage,
}

impl PairchatError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Capture(_) | Self::PlayerNotReady | Self::Peer(_) => ErrorClass::Capability,
            Self::Channel(_) | Self::NotConnected => ErrorClass::Channel,
            Self::Protocol(_) => ErrorClass::Protocol,
            Self::NotPaired
            | Self::EmptyMessage
            | Self::CallActive
            | Self::NotInitiator
            | Self::InvalidMedia(_)
            | Self::InvalidUrl(_)
            | Self::Settings(_) => ErrorClass::Usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_errors_are_capability_class() {
        assert_eq!(
            PairchatError::Capture("denied".into()).class(),
            ErrorClass::Capability
        );
        assert_eq!(PairchatError::PlayerNotReady.class(), ErrorClass::Capability);
        assert_eq!(PairchatError::PlayerNotReady.to_string(), "player not ready");
    }

    #[test]
    fn gating_errors_are_usage_class() {
        assert_eq!(PairchatError::NotPaired.class(), ErrorClass::Usage);
        assert_eq!(PairchatError::EmptyMessage.class(), ErrorClass::Usage);
    }

    #[test]
    fn display_includes_reason() {
        let err = PairchatError::Channel("connection reset".into());
        assert_eq!(err.to_string(), "channel error: connection reset");
    }
}
