//! Pairing lifecycle: `Idle → Waiting → Paired → Waiting …`, terminal `Ended`.
//!
//! The machine is pure: it decides whether an input is a legal edge and
//! bumps the pairing generation, the coordinator performs the side effects
//! (peer teardown, chat/playback reset, relay messages).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::{PairedInfo, Role};

/// Monotonic tag distinguishing the current pairing from past ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    pub fn value(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Read-only, thread-safe view of the current generation.
///
/// Host-side intent senders stamp each submission with it, so an intent
/// aimed at a partner who has since left can be told apart.
#[derive(Debug, Clone, Default)]
pub struct GenerationWatch(Arc<AtomicU64>);

impl GenerationWatch {
    pub fn current(&self) -> Generation {
        Generation(self.0.load(Ordering::Acquire))
    }

    fn publish(&self, generation: Generation) {
        self.0.store(generation.0, Ordering::Release);
    }
}

/// An event tagged with the generation it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub generation: Generation,
    pub event: T,
}

impl<T> Stamped<T> {
    pub fn new(generation: Generation, event: T) -> Self {
        Self { generation, event }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partner {
    pub label: String,
    pub id: Option<String>,
    pub role: Option<Role>,
}

impl From<PairedInfo> for Partner {
    fn from(info: PairedInfo) -> Self {
        Self {
            label: info.partner_label,
            id: info.partner_id,
            role: info.role,
        }
    }
}

impl Partner {
    fn same_as(&self, other: &Partner) -> bool {
        match (&self.id, &other.id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.label == other.label,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    Waiting,
    Paired(Partner),
    Ended,
}

impl PairingState {
    pub fn is_paired(&self) -> bool {
        matches!(self, PairingState::Paired(_))
    }

    pub fn partner(&self) -> Option<&Partner> {
        match self {
            PairingState::Paired(p) => Some(p),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PairingState::Idle => "idle",
            PairingState::Waiting => "waiting",
            PairingState::Paired(_) => "paired",
            PairingState::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PairingInput {
    /// Channel established and an identity assigned.
    ChannelUp,
    /// Relay says no partner is assigned yet.
    RelayWaiting,
    Paired(PairedInfo),
    PartnerLeft,
    ChannelDown,
    FindNewPartner,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// State changed and the generation was bumped. When `teardown` is set
    /// the previous pairing's peer session must be released first.
    Moved {
        from: PairingState,
        teardown: bool,
    },
    /// Harmless in the current state (duplicate or already applied).
    Unchanged,
    /// Not an edge from the current state; the input is ignored.
    Rejected(&'static str),
}

#[derive(Debug)]
pub struct PairingMachine {
    state: PairingState,
    generation: Generation,
    watch: GenerationWatch,
}

impl Default for PairingMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingMachine {
    pub fn new() -> Self {
        Self {
            state: PairingState::Idle,
            generation: Generation::default(),
            watch: GenerationWatch::default(),
        }
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn watch(&self) -> GenerationWatch {
        self.watch.clone()
    }

    /// True when `generation` is the current one and a partner is assigned.
    pub fn accepts(&self, generation: Generation) -> bool {
        self.state.is_paired() && generation == self.generation
    }

    pub fn apply(&mut self, input: PairingInput) -> Outcome {
        use PairingState::*;

        let (next, teardown) = match (&self.state, input) {
            (Ended, _) => return Outcome::Rejected("session ended"),
            (_, PairingInput::Close) => (Ended, true),

            (Idle, PairingInput::ChannelUp) => (Waiting, false),
            // A fresh identity while connected means the relay restarted us.
            (Waiting | Paired(_), PairingInput::ChannelUp) => (Waiting, true),

            (Idle, PairingInput::RelayWaiting) => return Outcome::Rejected("waiting before connect"),
            (Waiting, PairingInput::RelayWaiting) => return Outcome::Unchanged,
            (Paired(_), PairingInput::RelayWaiting) => (Waiting, true),

            (Idle, PairingInput::Paired(_)) => return Outcome::Rejected("paired before waiting"),
            (Waiting, PairingInput::Paired(info)) => (Paired(info.into()), false),
            (Paired(current), PairingInput::Paired(info)) => {
                let partner = Partner::from(info);
                if current.same_as(&partner) {
                    return Outcome::Unchanged;
                }
                tracing::info!(
                    old = %current.label,
                    new = %partner.label,
                    "forced re-pairing"
                );
                (Paired(partner), true)
            }

            (Paired(_), PairingInput::PartnerLeft) => (Waiting, true),
            (Idle | Waiting, PairingInput::PartnerLeft) => {
                return Outcome::Rejected("partner-left without a partner");
            }

            (Idle, PairingInput::ChannelDown) => return Outcome::Unchanged,
            (Waiting | Paired(_), PairingInput::ChannelDown) => (Idle, true),

            (Idle, PairingInput::FindNewPartner) => return Outcome::Rejected("not connected"),
            (Waiting | Paired(_), PairingInput::FindNewPartner) => (Waiting, true),
        };

        let from = std::mem::replace(&mut self.state, next);
        self.generation = self.generation.next();
        self.watch.publish(self.generation);
        tracing::info!(
            from = from.name(),
            to = self.state.name(),
            generation = self.generation.value(),
            "pairing transition"
        );
        Outcome::Moved { from, teardown }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired(label: &str, id: Option<&str>) -> PairingInput {
        PairingInput::Paired(PairedInfo {
            partner_label: label.to_string(),
            partner_id: id.map(str::to_string),
            role: None,
        })
    }

    fn alphabet() -> Vec<PairingInput> {
        vec![
            PairingInput::ChannelUp,
            PairingInput::RelayWaiting,
            paired("Ada", Some("a")),
            paired("Bo", Some("b")),
            PairingInput::PartnerLeft,
            PairingInput::ChannelDown,
            PairingInput::FindNewPartner,
            PairingInput::Close,
        ]
    }

    fn legal_edge(from: &PairingState, to: &PairingState) -> bool {
        use PairingState::*;
        matches!(
            (from, to),
            (Idle, Waiting)
                | (Waiting, Waiting)
                | (Waiting, Paired(_))
                | (Paired(_), Paired(_))
                | (Paired(_), Waiting)
                | (Waiting, Idle)
                | (Paired(_), Idle)
                | (Idle, Ended)
                | (Waiting, Ended)
                | (Paired(_), Ended)
        )
    }

    #[test]
    fn every_event_sequence_follows_defined_edges() {
        let inputs = alphabet();
        let mut sequences: Vec<Vec<usize>> = vec![vec![]];
        for _ in 0..4 {
            sequences = sequences
                .into_iter()
                .flat_map(|s| {
                    (0..inputs.len()).map(move |i| {
                        let mut s = s.clone();
                        s.push(i);
                        s
                    })
                })
                .collect();
        }

        for seq in sequences {
            let mut machine = PairingMachine::new();
            for &i in &seq {
                let before_gen = machine.generation();
                match machine.apply(inputs[i].clone()) {
                    Outcome::Moved { from, .. } => {
                        assert!(
                            legal_edge(&from, machine.state()),
                            "illegal edge {from:?} -> {:?} in {seq:?}",
                            machine.state()
                        );
                        assert!(machine.generation() > before_gen);
                    }
                    Outcome::Unchanged | Outcome::Rejected(_) => {
                        assert_eq!(machine.generation(), before_gen);
                    }
                }
            }
        }
    }

    #[test]
    fn idle_cannot_jump_to_paired() {
        let mut m = PairingMachine::new();
        assert!(matches!(m.apply(paired("Ada", None)), Outcome::Rejected(_)));
        assert_eq!(m.state(), &PairingState::Idle);
    }

    #[test]
    fn connect_then_pair() {
        let mut m = PairingMachine::new();
        assert!(matches!(
            m.apply(PairingInput::ChannelUp),
            Outcome::Moved { teardown: false, .. }
        ));
        assert_eq!(m.apply(PairingInput::RelayWaiting), Outcome::Unchanged);
        m.apply(paired("Ada", Some("a")));
        assert_eq!(m.state().partner().map(|p| p.label.as_str()), Some("Ada"));
        assert_eq!(m.generation().value(), 2);
    }

    #[test]
    fn duplicate_paired_is_ignored_but_new_partner_forces_repair() {
        let mut m = PairingMachine::new();
        m.apply(PairingInput::ChannelUp);
        m.apply(paired("Ada", Some("a")));
        let gen_before = m.generation();

        assert_eq!(m.apply(paired("Ada", Some("a"))), Outcome::Unchanged);
        assert_eq!(m.generation(), gen_before);

        let outcome = m.apply(paired("Bo", Some("b")));
        assert!(matches!(outcome, Outcome::Moved { teardown: true, .. }));
        assert_eq!(m.state().partner().map(|p| p.label.as_str()), Some("Bo"));
        assert!(m.generation() > gen_before);
    }

    #[test]
    fn find_new_partner_requires_channel() {
        let mut m = PairingMachine::new();
        assert!(matches!(
            m.apply(PairingInput::FindNewPartner),
            Outcome::Rejected(_)
        ));
    }

    #[test]
    fn channel_drop_returns_to_idle() {
        let mut m = PairingMachine::new();
        m.apply(PairingInput::ChannelUp);
        m.apply(paired("Ada", None));
        assert!(matches!(
            m.apply(PairingInput::ChannelDown),
            Outcome::Moved { teardown: true, .. }
        ));
        assert_eq!(m.state(), &PairingState::Idle);
    }

    #[test]
    fn ended_is_terminal() {
        let mut m = PairingMachine::new();
        m.apply(PairingInput::Close);
        assert_eq!(m.state(), &PairingState::Ended);
        for input in alphabet() {
            assert!(matches!(m.apply(input), Outcome::Rejected(_)));
        }
    }

    #[test]
    fn watch_tracks_generation() {
        let mut m = PairingMachine::new();
        let watch = m.watch();
        m.apply(PairingInput::ChannelUp);
        m.apply(paired("Ada", None));
        assert_eq!(watch.current(), m.generation());
    }

    #[test]
    fn accepts_only_current_generation_while_paired() {
        let mut m = PairingMachine::new();
        m.apply(PairingInput::ChannelUp);
        assert!(!m.accepts(m.generation()));
        m.apply(paired("Ada", None));
        let p1 = m.generation();
        assert!(m.accepts(p1));
        m.apply(PairingInput::PartnerLeft);
        m.apply(paired("Bo", None));
        assert!(!m.accepts(p1));
        assert!(m.accepts(m.generation()));
    }
}
