//! Quorum and deadline guardrails for debate sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{DebatePhase, DebateSession};

/// Why a session was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbandonReason {
    /// A deadline passed without enough participation.
    QuorumNotReached {
        phase: DebatePhase,
        have: usize,
        need: usize,
    },
    /// Voting closed without the strategy being satisfied.
    NoConsensus { detail: String },
    /// Administrative cancellation.
    Cancelled { reason: String },
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QuorumNotReached { phase, have, need } => {
                write!(f, "quorum_not_reached ({} {}/{})", phase, have, need)
            }
            Self::NoConsensus { detail } => write!(f, "no_consensus: {}", detail),
            Self::Cancelled { reason } => write!(f, "cancelled: {}", reason),
        }
    }
}

/// What a deadline check asks the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadlineVerdict {
    /// No deadline passed.
    Continue,
    /// Argument deadline passed with quorum.
    BeginVoting,
    /// Voting deadline passed; resolve or abandon.
    Resolve,
    /// Deadline passed without quorum.
    Abandon(AbandonReason),
}

impl DeadlineVerdict {
    /// Whether the engine has to act.
    pub fn should_act(&self) -> bool {
        !matches!(self, Self::Continue)
    }
}

/// Participation needed out of `participants` for `fraction`.
///
/// Rounded up and never below one.
pub fn quorum(participants: usize, fraction: f64) -> usize {
    let needed = (participants as f64 * fraction).ceil() as usize;
    needed.clamp(1, participants.max(1))
}

/// Quorum and deadline rules.
#[derive(Debug, Clone, Copy)]
pub struct Guardrails {
    quorum_fraction: f64,
}

impl Guardrails {
    /// Guardrails requiring `quorum_fraction` of participants.
    pub fn new(quorum_fraction: f64) -> Self {
        Self { quorum_fraction }
    }

    /// Quorum for a session.
    pub fn quorum_for(&self, session: &DebateSession) -> usize {
        quorum(session.participants.len(), self.quorum_fraction)
    }

    /// Whether enough distinct participants have argued.
    pub fn arguing_quorum(&self, session: &DebateSession) -> bool {
        session.arguing_count() >= self.quorum_for(session)
    }

    /// Whether enough participants have voted.
    pub fn voting_quorum(&self, session: &DebateSession) -> bool {
        session.votes.len() >= self.quorum_for(session)
    }

    /// Check the session's deadlines at `now`.
    pub fn check_deadline(&self, session: &DebateSession, now: DateTime<Utc>) -> DeadlineVerdict {
        match session.phase {
            DebatePhase::Open | DebatePhase::Arguing => {
                if now < session.argument_deadline {
                    return DeadlineVerdict::Continue;
                }
                if !session.arguments.is_empty() && self.arguing_quorum(session) {
                    DeadlineVerdict::BeginVoting
                } else {
                    DeadlineVerdict::Abandon(AbandonReason::QuorumNotReached {
                        phase: session.phase,
                        have: session.arguing_count(),
                        need: self.quorum_for(session),
                    })
                }
            }
            DebatePhase::Voting => match session.voting_deadline {
                Some(deadline) if now >= deadline => DeadlineVerdict::Resolve,
                _ => DeadlineVerdict::Continue,
            },
            DebatePhase::Resolved | DebatePhase::Abandoned => DeadlineVerdict::Continue,
        }
    }
}

impl Default for Guardrails {
    fn default() -> Self {
        Self::new(0.5)
    }
}
