//! Debate state machine: phases, transitions, and session tracking.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::consensus::Decision;
use super::guardrails::AbandonReason;
use crate::ids::{AgentId, SessionId};
use crate::state::{EntityKind, Persist};

/// Phase of a debate session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebatePhase {
    /// Session created, no argument yet.
    Open,
    /// Participants are submitting arguments.
    Arguing,
    /// Arguments closed; participants vote.
    Voting,
    /// A decision was reached.
    Resolved,
    /// Closed without a decision.
    Abandoned,
}

impl DebatePhase {
    /// Whether this is a terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Abandoned)
    }

    /// Whether arguments are still accepted.
    pub fn accepts_arguments(self) -> bool {
        matches!(self, Self::Open | Self::Arguing)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [DebatePhase] {
        match self {
            Self::Open => &[Self::Arguing, Self::Abandoned],
            Self::Arguing => &[Self::Voting, Self::Abandoned],
            Self::Voting => &[Self::Resolved, Self::Abandoned],
            Self::Resolved | Self::Abandoned => &[],
        }
    }
}

impl std::fmt::Display for DebatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Arguing => write!(f, "arguing"),
            Self::Voting => write!(f, "voting"),
            Self::Resolved => write!(f, "resolved"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// One submitted argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    /// Author.
    pub agent: AgentId,
    /// Position argued for.
    pub position: String,
    /// Free-form rationale.
    pub rationale: String,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
}

/// A participant's current vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Position voted for.
    pub position: String,
    /// Time of the latest vote.
    pub cast_at: DateTime<Utc>,
}

/// A phase transition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateTransition {
    /// Previous phase.
    pub from: DebatePhase,
    /// New phase.
    pub to: DebatePhase,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition.
    pub reason: String,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: DebatePhase,
    pub to: DebatePhase,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} → {} (allowed: {:?})",
            self.from,
            self.to,
            self.from.valid_transitions()
        )
    }
}

impl std::error::Error for TransitionError {}

/// A debate session tracking state and history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateSession {
    /// Unique session identifier.
    pub id: SessionId,
    /// Question under debate.
    pub topic: String,
    /// Agents allowed to argue and vote.
    pub participants: BTreeSet<AgentId>,
    /// Arguments in submission order.
    pub arguments: Vec<Argument>,
    /// Latest vote per participant.
    pub votes: BTreeMap<AgentId, Vote>,
    /// Current phase.
    pub phase: DebatePhase,
    /// Set once resolved.
    pub decision: Option<Decision>,
    /// Set once abandoned.
    pub abandon_reason: Option<AbandonReason>,
    /// When the session was opened.
    pub opened_at: DateTime<Utc>,
    /// Arguing must reach quorum by this time.
    pub argument_deadline: DateTime<Utc>,
    /// Set when voting begins.
    pub voting_deadline: Option<DateTime<Utc>>,
    /// Pending administrative cancellation, applied at the next step.
    pub cancel_requested: Option<String>,
    /// Transition history.
    pub transitions: Vec<DebateTransition>,
}

impl DebateSession {
    /// Create a new session in `Open`.
    pub fn new(
        id: impl Into<SessionId>,
        topic: impl Into<String>,
        participants: BTreeSet<AgentId>,
        now: DateTime<Utc>,
        argument_window: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            participants,
            arguments: Vec::new(),
            votes: BTreeMap::new(),
            phase: DebatePhase::Open,
            decision: None,
            abandon_reason: None,
            opened_at: now,
            argument_deadline: now + argument_window,
            voting_deadline: None,
            cancel_requested: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new phase with a reason.
    pub fn transition(
        &mut self,
        to: DebatePhase,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }

        self.transitions.push(DebateTransition {
            from: self.phase,
            to,
            timestamp: now,
            reason: reason.to_string(),
        });
        self.phase = to;
        Ok(())
    }

    /// Whether `agent` may argue and vote.
    pub fn is_participant(&self, agent: &AgentId) -> bool {
        self.participants.contains(agent)
    }

    /// Distinct positions in order of their first argument.
    pub fn argued_positions(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.arguments
            .iter()
            .filter(|a| seen.insert(a.position.as_str()))
            .map(|a| a.position.as_str())
            .collect()
    }

    /// Whether any argument was made for `position`.
    pub fn was_argued(&self, position: &str) -> bool {
        self.arguments.iter().any(|a| a.position == position)
    }

    /// Number of distinct participants who submitted an argument.
    pub fn arguing_count(&self) -> usize {
        self.arguments
            .iter()
            .map(|a| &a.agent)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Whether the debate has ended.
    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] {} | {} participants, {} arguments, {} votes",
            self.phase,
            self.topic,
            self.participants.len(),
            self.arguments.len(),
            self.votes.len()
        )
    }
}

impl Persist for DebateSession {
    const KIND: EntityKind = EntityKind::Debate;

    fn storage_id(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> DebateSession {
        let participants = ["a", "b", "c"].into_iter().map(AgentId::from).collect();
        DebateSession::new("d-001", "which cache", participants, Utc::now(), Duration::seconds(60))
    }

    fn argue(s: &mut DebateSession, agent: &str, position: &str) {
        s.arguments.push(Argument {
            agent: AgentId::from(agent),
            position: position.to_string(),
            rationale: String::new(),
            submitted_at: Utc::now(),
        });
    }

    #[test]
    fn test_new_session() {
        let s = session();
        assert_eq!(s.phase, DebatePhase::Open);
        assert_eq!(s.argument_deadline - s.opened_at, Duration::seconds(60));
        assert!(s.voting_deadline.is_none());
        assert!(!s.is_complete());
    }

    #[test]
    fn test_full_phase_cycle() {
        let mut s = session();
        let now = Utc::now();
        s.transition(DebatePhase::Arguing, "first argument", now).unwrap();
        s.transition(DebatePhase::Voting, "arguments closed", now).unwrap();
        s.transition(DebatePhase::Resolved, "decided", now).unwrap();
        assert!(s.is_complete());
        assert_eq!(s.transitions.len(), 3);
        assert_eq!(s.transitions[0].from, DebatePhase::Open);
        assert_eq!(s.transitions[2].to, DebatePhase::Resolved);
    }

    #[test]
    fn test_invalid_transition() {
        let mut s = session();
        let err = s
            .transition(DebatePhase::Resolved, "skip", Utc::now())
            .unwrap_err();
        assert_eq!(err.from, DebatePhase::Open);
        assert_eq!(err.to, DebatePhase::Resolved);
        assert!(s.transitions.is_empty());
    }

    #[test]
    fn test_terminal_no_transitions() {
        let mut s = session();
        s.transition(DebatePhase::Abandoned, "cancelled", Utc::now())
            .unwrap();
        for phase in [DebatePhase::Open, DebatePhase::Arguing, DebatePhase::Voting] {
            assert!(s.transition(phase, "restart", Utc::now()).is_err());
        }
    }

    #[test]
    fn test_argued_positions_keep_first_order() {
        let mut s = session();
        argue(&mut s, "a", "lru");
        argue(&mut s, "b", "arc");
        argue(&mut s, "c", "lru");
        assert_eq!(s.argued_positions(), vec!["lru", "arc"]);
        assert!(s.was_argued("arc"));
        assert!(!s.was_argued("fifo"));
        assert_eq!(s.arguing_count(), 3);
    }

    #[test]
    fn test_arguing_count_distinct() {
        let mut s = session();
        argue(&mut s, "a", "lru");
        argue(&mut s, "a", "arc");
        assert_eq!(s.arguing_count(), 1);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(DebatePhase::Open.to_string(), "open");
        assert_eq!(DebatePhase::Arguing.to_string(), "arguing");
        assert_eq!(DebatePhase::Voting.to_string(), "voting");
        assert_eq!(DebatePhase::Resolved.to_string(), "resolved");
        assert_eq!(DebatePhase::Abandoned.to_string(), "abandoned");
    }
}
