use crate::errors::PairchatError;
use crate::pairing::{Generation, PairingMachine};
use crate::protocol::{ClientMessage, InboundChat, SessionIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Peer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub origin: Origin,
    pub sender_name: String,
    pub text: String,
    /// Position within the pairing, in channel-delivery order.
    pub sequence: u64,
    pub generation: Generation,
    pub timestamp_ms: u64,
}

/// Message list for the current pairing.
///
/// At-most-once and best-effort: no retries, no acknowledgements. The list
/// is cleared on every pairing transition.
#[derive(Debug, Default)]
pub struct ChatRelay {
    messages: Vec<ChatMessage>,
    next_sequence: u64,
}

impl ChatRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local message and build the frame to forward to the partner.
    pub fn send(
        &mut self,
        pairing: &PairingMachine,
        sender_name: &str,
        text: &str,
    ) -> Result<(ChatMessage, ClientMessage), PairchatError> {
        if !pairing.state().is_paired() {
            return Err(PairchatError::NotPaired);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(PairchatError::EmptyMessage);
        }

        let msg = self.push(Origin::Local, sender_name.to_string(), text, pairing.generation());
        Ok((msg, ClientMessage::Chat(text.to_string())))
    }

    /// Append a partner message, unless it belongs to a past pairing or is
    /// the relay echoing our own message back.
    pub fn on_inbound(
        &mut self,
        pairing: &PairingMachine,
        generation: Generation,
        chat: InboundChat,
        local_identity: Option<&SessionIdentity>,
    ) -> Option<ChatMessage> {
        if !pairing.accepts(generation) {
            tracing::debug!(
                generation = generation.value(),
                current = pairing.generation().value(),
                "dropping stale chat message"
            );
            return None;
        }
        if let (Some(sender), Some(me)) = (chat.sender_id.as_deref(), local_identity) {
            if sender == me.as_str() {
                tracing::debug!("dropping relay echo of own chat message");
                return None;
            }
        }

        let sender_name = chat
            .sender_name
            .filter(|n| !n.trim().is_empty())
            .or_else(|| pairing.state().partner().map(|p| p.label.clone()))
            .unwrap_or_default();

        Some(self.push(Origin::Peer, sender_name, &chat.text, generation))
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.next_sequence = 0;
    }

    fn push(
        &mut self,
        origin: Origin,
        sender_name: String,
        text: &str,
        generation: Generation,
    ) -> ChatMessage {
        let msg = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            origin,
            sender_name,
            text: text.to_string(),
            sequence: self.next_sequence,
            generation,
            timestamp_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
        };
        self.next_sequence += 1;
        self.messages.push(msg.clone());
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PairingInput;
    use crate::protocol::PairedInfo;

    fn paired_machine() -> PairingMachine {
        let mut m = PairingMachine::new();
        m.apply(PairingInput::ChannelUp);
        m.apply(PairingInput::Paired(PairedInfo {
            partner_label: "Ada".into(),
            partner_id: None,
            role: None,
        }));
        m
    }

    fn inbound(text: &str) -> InboundChat {
        InboundChat {
            text: text.into(),
            sender_id: None,
            sender_name: None,
        }
    }

    #[test]
    fn send_requires_pairing() {
        let mut relay = ChatRelay::new();
        let m = PairingMachine::new();
        assert!(matches!(
            relay.send(&m, "me", "hi"),
            Err(PairchatError::NotPaired)
        ));
        assert!(relay.messages().is_empty());
    }

    #[test]
    fn send_trims_and_rejects_empty() {
        let mut relay = ChatRelay::new();
        let m = paired_machine();
        assert!(matches!(
            relay.send(&m, "me", "   "),
            Err(PairchatError::EmptyMessage)
        ));
        let (msg, frame) = relay.send(&m, "me", "  hi  ").unwrap();
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.origin, Origin::Local);
        assert_eq!(frame, ClientMessage::Chat("hi".into()));
    }

    #[test]
    fn messages_keep_delivery_order() {
        let mut relay = ChatRelay::new();
        let m = paired_machine();
        relay.send(&m, "me", "one").unwrap();
        relay.on_inbound(&m, m.generation(), inbound("two"), None);
        relay.send(&m, "me", "three").unwrap();

        let texts: Vec<_> = relay.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["one", "two", "three"]);
        let seqs: Vec<_> = relay.messages().iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, [0, 1, 2]);
    }

    #[test]
    fn inbound_from_past_generation_is_dropped() {
        let mut relay = ChatRelay::new();
        let mut m = paired_machine();
        let old = m.generation();
        m.apply(PairingInput::PartnerLeft);
        m.apply(PairingInput::Paired(PairedInfo {
            partner_label: "Bo".into(),
            partner_id: None,
            role: None,
        }));
        assert!(relay.on_inbound(&m, old, inbound("late"), None).is_none());
        assert!(relay.messages().is_empty());
    }

    #[test]
    fn inbound_uses_partner_label_when_unnamed() {
        let mut relay = ChatRelay::new();
        let m = paired_machine();
        let msg = relay.on_inbound(&m, m.generation(), inbound("hey"), None).unwrap();
        assert_eq!(msg.sender_name, "Ada");
        assert_eq!(msg.origin, Origin::Peer);
    }

    #[test]
    fn relay_echo_is_dropped() {
        let mut relay = ChatRelay::new();
        let m = paired_machine();
        let me = SessionIdentity::new("sock-1");
        let echo = InboundChat {
            text: "hi".into(),
            sender_id: Some("sock-1".into()),
            sender_name: Some("Me".into()),
        };
        assert!(relay.on_inbound(&m, m.generation(), echo, Some(&me)).is_none());
    }

    #[test]
    fn clear_resets_sequence() {
        let mut relay = ChatRelay::new();
        let m = paired_machine();
        relay.send(&m, "me", "a").unwrap();
        relay.clear();
        let (msg, _) = relay.send(&m, "me", "b").unwrap();
        assert_eq!(msg.sequence, 0);
        assert_eq!(relay.messages().len(), 1);
    }
}
