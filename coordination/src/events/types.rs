//! Event types published at cycle boundaries.
//!
//! These events feed the bus and are persisted for replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::debate::{AbandonReason, Decision};
use crate::ids::SessionId;
use crate::metrics::MetricEvent;
use crate::state::HaltNotice;

/// Unique identifier for events
pub type EventId = String;

/// All coordination events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    /// A cycle closed; summary of what its pipeline did.
    CycleClosed {
        cycle: u64,
        pipeline: String,
        steps_run: usize,
        failed_steps: Vec<String>,
        aborted: bool,
        delivered: usize,
        rejected: usize,
        timestamp: DateTime<Utc>,
    },

    /// A state change recorded during a cycle.
    Metric {
        cycle: u64,
        metric: MetricEvent,
        timestamp: DateTime<Utc>,
    },

    /// A debate produced a decision.
    DebateResolved {
        cycle: u64,
        decision: Decision,
        timestamp: DateTime<Utc>,
    },

    /// A debate closed without a decision.
    DebateAbandoned {
        cycle: u64,
        session_id: SessionId,
        reason: AbandonReason,
        timestamp: DateTime<Utc>,
    },

    /// The system halt switch is up.
    EmergencyRaised {
        cycle: u64,
        notice: HaltNotice,
        timestamp: DateTime<Utc>,
    },
}

impl CoordinationEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::CycleClosed { timestamp, .. }
            | Self::Metric { timestamp, .. }
            | Self::DebateResolved { timestamp, .. }
            | Self::DebateAbandoned { timestamp, .. }
            | Self::EmergencyRaised { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CycleClosed { .. } => "cycle_closed",
            Self::Metric { metric, .. } => metric.event_type(),
            Self::DebateResolved { .. } => "debate_resolved",
            Self::DebateAbandoned { .. } => "debate_abandoned",
            Self::EmergencyRaised { .. } => "emergency_raised",
        }
    }

    /// Cycle the event belongs to
    pub fn cycle(&self) -> u64 {
        match self {
            Self::CycleClosed { cycle, .. }
            | Self::Metric { cycle, .. }
            | Self::DebateResolved { cycle, .. }
            | Self::DebateAbandoned { cycle, .. }
            | Self::EmergencyRaised { cycle, .. } => *cycle,
        }
    }

    /// Entity the event is about: agent, message, session, record or step.
    pub fn subject(&self) -> Option<String> {
        match self {
            Self::CycleClosed { .. } => None,
            Self::Metric { metric, .. } => Some(match metric {
                MetricEvent::MessageStatus { message_id, .. } => message_id.to_string(),
                MetricEvent::AgentTransition { agent_id, .. } => agent_id.to_string(),
                MetricEvent::DebatePhase { session_id, .. } => session_id.clone(),
                MetricEvent::Intervention { record_id, .. } => record_id.clone(),
                MetricEvent::StepFinished { step, .. } => step.clone(),
            }),
            Self::DebateResolved { decision, .. } => Some(decision.session_id.clone()),
            Self::DebateAbandoned { session_id, .. } => Some(session_id.clone()),
            Self::EmergencyRaised { notice, .. } => Some(notice.record_id.clone()),
        }
    }

    /// Generate a new event ID
    pub fn new_id() -> EventId {
        uuid::Uuid::new_v4().to_string()
    }
}

impl std::fmt::Display for CoordinationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.subject() {
            Some(subject) => write!(f, "[cycle {}] {} {}", self.cycle(), self.event_type(), subject),
            None => write!(f, "[cycle {}] {}", self.cycle(), self.event_type()),
        }
    }
}
