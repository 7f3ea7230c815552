//! Metric events emitted into the execution context.
//!
//! Subsystems push a [`MetricEvent`] for every state transition they make;
//! the cycle-closed hook forwards them to the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentState;
use crate::debate::DebatePhase;
use crate::ids::{AgentId, MessageId, RecordId, SessionId};
use crate::intervention::Severity;
use crate::router::{DeliveryStatus, StatusCounts};

/// A single observable state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricEvent {
    /// A message changed delivery status.
    MessageStatus {
        message_id: MessageId,
        /// `None` when the message was first enqueued.
        from: Option<DeliveryStatus>,
        to: DeliveryStatus,
        /// Messages per status after the change.
        counts: StatusCounts,
        at: DateTime<Utc>,
    },
    /// An agent changed lifecycle state.
    AgentTransition {
        agent_id: AgentId,
        from: AgentState,
        to: AgentState,
        at: DateTime<Utc>,
    },
    /// A debate session changed phase.
    DebatePhase {
        session_id: SessionId,
        from: DebatePhase,
        to: DebatePhase,
        at: DateTime<Utc>,
    },
    /// An intervention action was applied or undone.
    Intervention {
        record_id: RecordId,
        severity: Severity,
        action: String,
        at: DateTime<Utc>,
    },
    /// A pipeline step finished.
    StepFinished {
        step: String,
        ok: bool,
        elapsed_ms: u64,
    },
}

impl MetricEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageStatus { .. } => "message_status",
            Self::AgentTransition { .. } => "agent_transition",
            Self::DebatePhase { .. } => "debate_phase",
            Self::Intervention { .. } => "intervention",
            Self::StepFinished { .. } => "step_finished",
        }
    }
}
