//! Agent lifecycle states and the events that move between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Known to the registry, not yet activated.
    Registered,
    /// Ready for work.
    Idle,
    /// Taking in inputs.
    Observing,
    /// Choosing what to do with an input.
    Deciding,
    /// Executing the chosen action.
    Acting,
    /// Held by an intervention until it is cleared.
    Suspended,
    /// Deregistered. Absorbing.
    Inactive,
}

impl AgentState {
    /// Whether the agent participates in the work loop.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Observing | Self::Deciding | Self::Acting
        )
    }

    /// Whether the agent is mid-cycle (stuck-duration applies).
    pub fn is_working(self) -> bool {
        matches!(self, Self::Observing | Self::Deciding | Self::Acting)
    }

    /// Whether this is the absorbing state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Inactive)
    }

    /// State reached by applying `event`, or `None` if the edge is illegal.
    ///
    /// Suspension and its clear are not events; only the intervention
    /// manager moves agents into and out of [`AgentState::Suspended`].
    pub fn next(self, event: LifecycleEvent) -> Option<AgentState> {
        use AgentState::*;
        use LifecycleEvent::*;
        match (self, event) {
            (Inactive, _) => None,
            (_, Deregister) => Some(Inactive),
            (Registered, Activate) => Some(Idle),
            (Idle, Observe) => Some(Observing),
            (Observing, Decide) => Some(Deciding),
            (Deciding, Act) => Some(Acting),
            (Acting, Complete) => Some(Idle),
            (Deciding | Acting, Fail) => Some(Idle),
            _ => None,
        }
    }

    /// Events accepted in this state.
    pub fn valid_events(self) -> &'static [LifecycleEvent] {
        use LifecycleEvent::*;
        match self {
            Self::Registered => &[Activate, Deregister],
            Self::Idle => &[Observe, Deregister],
            Self::Observing => &[Decide, Deregister],
            Self::Deciding => &[Act, Fail, Deregister],
            Self::Acting => &[Complete, Fail, Deregister],
            Self::Suspended => &[Deregister],
            Self::Inactive => &[],
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered => write!(f, "registered"),
            Self::Idle => write!(f, "idle"),
            Self::Observing => write!(f, "observing"),
            Self::Deciding => write!(f, "deciding"),
            Self::Acting => write!(f, "acting"),
            Self::Suspended => write!(f, "suspended"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// Event requesting a lifecycle move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// `Registered → Idle`.
    Activate,
    /// `Idle → Observing`.
    Observe,
    /// `Observing → Deciding`, held without a pending input.
    Decide,
    /// `Deciding → Acting`, refused while the system is halted.
    Act,
    /// `Acting → Idle`, counts a completed cycle.
    Complete,
    /// `Deciding | Acting → Idle`, counts an error.
    Fail,
    /// Any state → `Inactive`.
    Deregister,
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Activate => write!(f, "activate"),
            Self::Observe => write!(f, "observe"),
            Self::Decide => write!(f, "decide"),
            Self::Act => write!(f, "act"),
            Self::Complete => write!(f, "complete"),
            Self::Fail => write!(f, "fail"),
            Self::Deregister => write!(f, "deregister"),
        }
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTransition {
    /// Previous state.
    pub from: AgentState,
    /// New state.
    pub to: AgentState,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Event or authority that caused it.
    pub reason: String,
}
