//! Per-cycle execution context.
//!
//! An [`ExecutionContext`] is created for one pipeline run and dropped after
//! the cycle-closed hooks have seen it. It carries the cycle's inputs and
//! every result the steps produce, plus handles to the shared state the
//! steps operate on. Steps never talk to each other directly; anything one
//! step produces for another goes through the context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{AdvanceOutcome, LifecycleCommand, TaskEvent};
use crate::debate::{DebateCommand, DebateOutcome, Decision};
use crate::ids::{AgentId, CorrelationId};
use crate::intervention::{ActionResult, SignalSample};
use crate::metrics::MetricEvent;
use crate::router::{AckOutcome, DeliveryResult, Message};
use crate::state::{HaltNotice, SharedState};

/// External input fed into one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "input", rename_all = "snake_case")]
pub enum CycleInput {
    /// A message received for an agent.
    Message(Message),
    /// A task event for an agent.
    Task(TaskEvent),
    /// Delivery acknowledgement from the transport side.
    Ack { correlation_id: CorrelationId },
    /// Raw health sample from outside the core.
    Health(SignalSample),
    /// Registration or lifecycle event request.
    Lifecycle(LifecycleCommand),
    /// Debate request from a front end.
    Debate(DebateCommand),
}

/// A lifecycle move made during the cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleReport {
    /// Agent moved.
    pub agent_id: AgentId,
    /// Result of the command.
    pub outcome: AdvanceOutcome,
}

/// Acknowledgement handled during the cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckRecord {
    /// Correlation id acknowledged.
    pub correlation_id: CorrelationId,
    /// What the router did with it.
    pub outcome: AckOutcome,
}

/// Input or command a step refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Step that refused it.
    pub step: String,
    /// Error text.
    pub reason: String,
}

/// State handed from step to step within one cycle.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Cycle number.
    pub cycle: u64,
    /// When the context was created.
    pub started_at: DateTime<Utc>,
    /// Shared structures the steps operate on.
    pub shared: SharedState,
    /// Inputs of this cycle.
    pub inputs: Vec<CycleInput>,
    /// Outgoing messages staged for the router.
    pub outbox: Vec<Message>,
    /// Lifecycle moves made.
    pub lifecycle: Vec<LifecycleReport>,
    /// Delivery attempts made by the router.
    pub deliveries: Vec<DeliveryResult>,
    /// Acknowledgements processed.
    pub acks: Vec<AckRecord>,
    /// Debate sessions opened, resolved or abandoned.
    pub debates: Vec<DebateOutcome>,
    /// Intervention actions applied or undone.
    pub interventions: Vec<ActionResult>,
    /// Refused inputs and commands.
    pub rejections: Vec<Rejection>,
    /// Metric events, in emission order.
    pub metrics: Vec<MetricEvent>,
    /// Halt raised during this cycle, if any.
    pub emergency: Option<HaltNotice>,
}

impl ExecutionContext {
    /// Fresh context for one cycle.
    pub fn new(cycle: u64, shared: SharedState, inputs: Vec<CycleInput>) -> Self {
        let started_at = shared.clock.now();
        Self {
            cycle,
            started_at,
            shared,
            inputs,
            outbox: Vec::new(),
            lifecycle: Vec::new(),
            deliveries: Vec::new(),
            acks: Vec::new(),
            debates: Vec::new(),
            interventions: Vec::new(),
            rejections: Vec::new(),
            metrics: Vec::new(),
            emergency: None,
        }
    }

    /// Current time from the shared clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }

    /// Whether the system halt switch is raised.
    pub fn halted(&self) -> bool {
        self.shared.halt.is_raised()
    }

    /// Stage an outgoing message for the router step.
    pub fn stage_outbound(&mut self, message: Message) {
        self.outbox.push(message);
    }

    /// Record a refused input.
    pub fn reject(&mut self, step: &str, reason: impl Into<String>) {
        self.rejections.push(Rejection {
            step: step.to_string(),
            reason: reason.into(),
        });
    }

    /// Record a metric event.
    pub fn emit(&mut self, event: MetricEvent) {
        self.metrics.push(event);
    }

    /// Decisions reached this cycle.
    pub fn decisions(&self) -> Vec<&Decision> {
        self.debates
            .iter()
            .filter_map(|outcome| match outcome {
                DebateOutcome::Resolved(decision) => Some(decision),
                _ => None,
            })
            .collect()
    }

    /// Health samples supplied as inputs.
    pub fn health_samples(&self) -> impl Iterator<Item = &SignalSample> {
        self.inputs.iter().filter_map(|input| match input {
            CycleInput::Health(sample) => Some(sample),
            _ => None,
        })
    }

    /// Acknowledgements supplied as inputs.
    pub fn ack_inputs(&self) -> impl Iterator<Item = &CorrelationId> {
        self.inputs.iter().filter_map(|input| match input {
            CycleInput::Ack { correlation_id } => Some(correlation_id),
            _ => None,
        })
    }

    /// Debate commands supplied as inputs.
    pub fn debate_commands(&self) -> impl Iterator<Item = &DebateCommand> {
        self.inputs.iter().filter_map(|input| match input {
            CycleInput::Debate(cmd) => Some(cmd),
            _ => None,
        })
    }
}
