//! Wire format spoken with the matchmaking relay.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`. The relay is an external
//! actor, so decoding is lenient about payload shape (bare value or
//! object) and strict about nothing else: anything it cannot make sense
//! of comes back as [`PairchatError::Protocol`] and is dropped by the
//! caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::PairchatError;

/// Label shown for a partner whose relay payload carries no name.
pub const DEFAULT_PARTNER_LABEL: &str = "Stranger";

/// Identity assigned by the relay for the lifetime of one channel connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity(String);

impl SessionIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the peer connection creates the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Opaque negotiation payload. Relayed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalingBlob(Value);

impl SignalingBlob {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Payload of a `paired` notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PairedInfo {
    pub partner_label: String,
    pub partner_id: Option<String>,
    /// `None` when the relay did not assign one; the local side then waits
    /// for either an inbound signal or an explicit call start.
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundChat {
    pub text: String,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
}

/// Relay-originated events.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connect(SessionIdentity),
    Waiting,
    Paired(PairedInfo),
    PartnerLeft,
    Signal(SignalingBlob),
    Chat(InboundChat),
    MediaShare(String),
    MediaPlay,
    MediaPause,
    /// Relay announced it is closing the channel.
    Disconnect(String),
}

/// Client-originated messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    FindNewPartner,
    Signal(SignalingBlob),
    Chat(String),
    MediaShare(String),
    MediaPlay,
    MediaPause,
}

#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

impl RelayEvent {
    pub fn decode(text: &str) -> Result<Self, PairchatError> {
        let frame: Frame = serde_json::from_str(text)
            .map_err(|e| PairchatError::Protocol(format!("malformed frame: {e}")))?;
        let data = frame.data;

        let event = match frame.event.as_str() {
            "connect" | "me" => {
                let id = string_field(&data, &["id", "sessionId"])
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| missing(&frame.event, "session identity"))?;
                RelayEvent::Connect(SessionIdentity::new(id))
            }
            "waiting" => RelayEvent::Waiting,
            "paired" => RelayEvent::Paired(decode_paired(&data)),
            "partner-left" | "partner left" => RelayEvent::PartnerLeft,
            "signal" | "webrtc-signal" => {
                if data.is_null() {
                    return Err(missing(&frame.event, "signaling blob"));
                }
                RelayEvent::Signal(SignalingBlob::new(data))
            }
            "chat" | "chat message" => {
                let text = string_field(&data, &["text", "message"])
                    .ok_or_else(|| missing(&frame.event, "text"))?;
                RelayEvent::Chat(InboundChat {
                    text,
                    sender_id: object_string(&data, &["senderId"]),
                    sender_name: object_string(&data, &["senderName"]),
                })
            }
            "media-share" | "youtube-url" => {
                let media_id = string_field(&data, &["mediaId", "id"])
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| missing(&frame.event, "media id"))?;
                RelayEvent::MediaShare(media_id)
            }
            "media-play" => RelayEvent::MediaPlay,
            "media-pause" => RelayEvent::MediaPause,
            "disconnect" | "connect_error" => {
                let reason = string_field(&data, &["reason"]).unwrap_or_else(|| frame.event.clone());
                RelayEvent::Disconnect(reason)
            }
            other => {
                return Err(PairchatError::Protocol(format!("unknown event '{other}'")));
            }
        };

        Ok(event)
    }

    /// Whether the event starts a new pairing scope on the relay side.
    pub fn opens_scope(&self) -> bool {
        matches!(
            self,
            RelayEvent::Connect(_) | RelayEvent::Waiting | RelayEvent::Paired(_)
        )
    }

    /// Whether the event only makes sense inside the pairing it was sent for.
    pub fn is_pairing_scoped(&self) -> bool {
        matches!(
            self,
            RelayEvent::PartnerLeft
                | RelayEvent::Signal(_)
                | RelayEvent::Chat(_)
                | RelayEvent::MediaShare(_)
                | RelayEvent::MediaPlay
                | RelayEvent::MediaPause
        )
    }
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::FindNewPartner => "find-new-partner",
            ClientMessage::Signal(_) => "signal",
            ClientMessage::Chat(_) => "chat",
            ClientMessage::MediaShare(_) => "media-share",
            ClientMessage::MediaPlay => "media-play",
            ClientMessage::MediaPause => "media-pause",
        }
    }

    pub fn encode(&self) -> String {
        let data = match self {
            ClientMessage::Signal(blob) => Some(blob.as_value().clone()),
            ClientMessage::Chat(text) => Some(Value::String(text.clone())),
            ClientMessage::MediaShare(id) => Some(Value::String(id.clone())),
            ClientMessage::FindNewPartner | ClientMessage::MediaPlay | ClientMessage::MediaPause => {
                None
            }
        };

        let mut frame = serde_json::Map::new();
        frame.insert("event".into(), Value::String(self.event_name().into()));
        if let Some(data) = data {
            frame.insert("data".into(), data);
        }
        Value::Object(frame).to_string()
    }
}

fn decode_paired(data: &Value) -> PairedInfo {
    let partner_label = object_string(data, &["partnerLabel", "partnerName", "label"])
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| DEFAULT_PARTNER_LABEL.to_string());

    let role = match data.get("role") {
        None | Some(Value::Null) => None,
        Some(raw) => match serde_json::from_value::<Role>(raw.clone()) {
            Ok(role) => Some(role),
            Err(_) => {
                tracing::debug!(?raw, "paired: unrecognised role, waiting for signal");
                None
            }
        },
    };

    PairedInfo {
        partner_label,
        partner_id: object_string(data, &["partnerId"]),
        role,
    }
}

/// A bare string payload, or the first of `keys` holding a string.
fn string_field(data: &Value, keys: &[&str]) -> Option<String> {
    match data {
        Value::String(s) => Some(s.clone()),
        _ => object_string(data, keys),
    }
}

fn object_string(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| data.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn missing(event: &str, what: &str) -> PairchatError {
    PairchatError::Protocol(format!("'{event}' without {what}"))
}
