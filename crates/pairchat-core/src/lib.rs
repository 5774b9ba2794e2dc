//! Pairchat core: anonymous one-to-one pairing sessions.
//!
//! Pure Rust crate with no platform dependencies. Capture devices, the
//! real-time peer transport and the video player are host capabilities
//! behind traits; the relay is reached over a WebSocket channel.

pub mod channel;
pub mod chat;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod pairing;
pub mod peer;
pub mod playback;
pub mod protocol;
pub mod settings;

#[cfg(test)]
mod testing;

pub use channel::{
    BackoffPolicy, ChannelAdapter, ChannelConfig, ChannelEvent, ChannelHandle, ChannelInput, Epoch,
    Outbound,
};
pub use coordinator::{
    Capabilities, SessionCoordinator, SessionHandle, SessionInput, SessionOptions, UserIntent,
};
pub use errors::{ErrorClass, PairchatError};
pub use events::{ConnectionState, SessionEvent, SessionEventListener};
pub use pairing::{Generation, GenerationWatch, PairingState, Stamped};
pub use settings::{Settings, SettingsStore};
