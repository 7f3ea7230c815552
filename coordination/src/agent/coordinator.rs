//! Lifecycle coordinator: the only way agent state changes.
//!
//! Front ends call [`LifecycleCoordinator::advance`] directly; inside a
//! pipeline the coordinator runs as the `lifecycle` step, ingesting the
//! cycle's messages and tasks into per-agent queues and applying staged
//! lifecycle commands.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::{Agent, PendingInput, SharedAgentRegistry, TaskEvent};
use super::state::{AgentState, LifecycleEvent};
use crate::clock::SharedClock;
use crate::config::LifecycleConfig;
use crate::context::{CycleInput, ExecutionContext, LifecycleReport};
use crate::contracts::{Queryable, Step, StepOutcome, StepResult};
use crate::ids::AgentId;
use crate::metrics::MetricEvent;
use crate::router::{Message, Recipient};
use crate::state::{lock, HaltSwitch, SharedState};

/// Step name of the lifecycle coordinator.
pub const LIFECYCLE_STEP: &str = "lifecycle";

/// Error type for lifecycle operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("agent already registered: {0}")]
    AlreadyRegistered(AgentId),

    #[error("agent id must not be empty")]
    InvalidAgentId,

    #[error("agent {0} is inactive")]
    Inactive(AgentId),

    #[error("illegal transition for {agent}: {event} in state {current}")]
    IllegalTransition {
        agent: AgentId,
        current: AgentState,
        event: LifecycleEvent,
    },

    #[error("system halted: {agent} may not act (state {current})")]
    Halted { agent: AgentId, current: AgentState },

    #[error("agent {agent} cannot be suspended from {current}")]
    NotSuspendable { agent: AgentId, current: AgentState },

    #[error("agent {agent} is not suspended (state {current})")]
    NotSuspended { agent: AgentId, current: AgentState },

    #[error("suspension of {agent} held by {expected:?}, not {got}")]
    ClearNotAuthorized {
        agent: AgentId,
        expected: Option<String>,
        got: String,
    },

    #[error("backlog of {agent} is full ({limit} inputs)")]
    BacklogFull { agent: AgentId, limit: usize },
}

impl LifecycleError {
    /// State the agent was left in, when the error carries it.
    pub fn current_state(&self) -> Option<AgentState> {
        match self {
            Self::IllegalTransition { current, .. }
            | Self::Halted { current, .. }
            | Self::NotSuspendable { current, .. }
            | Self::NotSuspended { current, .. } => Some(*current),
            _ => None,
        }
    }
}

/// Result type for lifecycle operations
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Why an advance was held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// `Decide` without anything to decide on.
    NoPendingInput,
}

/// Outcome of a legal advance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// The agent moved.
    Transitioned { from: AgentState, to: AgentState },
    /// Nothing changed; not an error.
    Held { state: AgentState, reason: HoldReason },
}

/// Lifecycle request staged as a cycle input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum LifecycleCommand {
    /// Register a new agent.
    Register {
        agent_id: AgentId,
        #[serde(default)]
        roles: BTreeSet<String>,
    },
    /// Apply an event.
    Advance {
        agent_id: AgentId,
        event: LifecycleEvent,
    },
}

/// Owner of agent lifecycle transitions.
pub struct LifecycleCoordinator {
    agents: SharedAgentRegistry,
    halt: Arc<HaltSwitch>,
    clock: SharedClock,
    config: LifecycleConfig,
}

impl LifecycleCoordinator {
    /// Coordinator over the shared registry.
    pub fn new(shared: &SharedState, config: LifecycleConfig) -> Self {
        lock(&shared.agents).set_limits(config.max_pending_inputs, config.transition_history);
        Self {
            agents: Arc::clone(&shared.agents),
            halt: Arc::clone(&shared.halt),
            clock: Arc::clone(&shared.clock),
            config,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Register an agent in `Registered`.
    pub fn register(&self, id: AgentId, roles: BTreeSet<String>) -> LifecycleResult<AgentState> {
        let now = self.clock.now();
        let mut agents = lock(&self.agents);
        agents.register(id, roles, now).map(|agent| agent.state)
    }

    /// Request a lifecycle move.
    pub fn advance(&self, id: &str, event: LifecycleEvent) -> LifecycleResult<AdvanceOutcome> {
        let now = self.clock.now();
        let halted = self.halt.is_raised();
        let result = lock(&self.agents).advance(id, event, now, halted);
        if let Err(e) = &result {
            debug!(agent_id = id, %event, error = %e, "advance rejected");
        }
        result
    }

    /// Mark an agent `Inactive`.
    pub fn deregister(&self, id: &str) -> LifecycleResult<AdvanceOutcome> {
        let outcome = self.advance(id, LifecycleEvent::Deregister)?;
        info!(agent_id = id, "agent deregistered");
        Ok(outcome)
    }

    /// Queue an input for an agent. Returns the new backlog.
    pub fn submit_input(&self, id: &str, input: PendingInput) -> LifecycleResult<usize> {
        let now = self.clock.now();
        lock(&self.agents).push_input(id, input, now)
    }

    /// Current state of an agent.
    pub fn state(&self, id: &str) -> Option<AgentState> {
        lock(&self.agents).state(id)
    }

    /// Queue each received message for its recipients.
    fn ingest_message(
        &self,
        message: &Message,
        now: chrono::DateTime<chrono::Utc>,
        rejections: &mut Vec<String>,
    ) -> usize {
        let mut agents = lock(&self.agents);
        let recipients: Vec<AgentId> = match &message.recipient {
            Recipient::Agent(id) => vec![id.clone()],
            Recipient::Broadcast => agents
                .active_ids()
                .into_iter()
                .filter(|id| id != &message.sender)
                .collect(),
        };

        let mut queued = 0;
        for recipient in recipients {
            let input = PendingInput::Message {
                message_id: message.id,
                sender: message.sender.clone(),
            };
            match agents.push_input(recipient.as_str(), input, now) {
                Ok(_) => queued += 1,
                Err(e) => {
                    warn!(agent_id = %recipient, message_id = %message.id, error = %e, "inbound message dropped");
                    rejections.push(e.to_string());
                }
            }
        }
        queued
    }

    fn ingest_task(
        &self,
        task: &TaskEvent,
        now: chrono::DateTime<chrono::Utc>,
        rejections: &mut Vec<String>,
    ) -> usize {
        let input = PendingInput::Task(task.clone());
        match lock(&self.agents).push_input(task.agent_id.as_str(), input, now) {
            Ok(_) => 1,
            Err(e) => {
                warn!(agent_id = %task.agent_id, task_id = %task.task_id, error = %e, "task dropped");
                rejections.push(e.to_string());
                0
            }
        }
    }

    /// Apply a staged command. Registrations produce no report.
    fn apply_command(&self, command: &LifecycleCommand) -> LifecycleResult<Option<LifecycleReport>> {
        match command {
            LifecycleCommand::Register { agent_id, roles } => {
                self.register(agent_id.clone(), roles.clone())?;
                Ok(None)
            }
            LifecycleCommand::Advance { agent_id, event } => {
                let outcome = self.advance(agent_id.as_str(), *event)?;
                Ok(Some(LifecycleReport {
                    agent_id: agent_id.clone(),
                    outcome,
                }))
            }
        }
    }
}

#[async_trait]
impl Step for LifecycleCoordinator {
    fn name(&self) -> &str {
        LIFECYCLE_STEP
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> StepResult {
        let now = ctx.now();
        let mut rejections = Vec::new();
        let mut reports = Vec::new();
        let mut ingested = 0;
        let mut registered = 0;

        for input in &ctx.inputs {
            match input {
                CycleInput::Message(message) => {
                    ingested += self.ingest_message(message, now, &mut rejections);
                }
                CycleInput::Task(task) => {
                    ingested += self.ingest_task(task, now, &mut rejections);
                }
                CycleInput::Lifecycle(command) => match self.apply_command(command) {
                    Ok(Some(report)) => reports.push(report),
                    Ok(None) => registered += 1,
                    Err(e) => rejections.push(e.to_string()),
                },
                _ => {}
            }
        }

        let applied = reports.len() + registered;
        for report in reports {
            if let AdvanceOutcome::Transitioned { from, to } = report.outcome {
                ctx.emit(MetricEvent::AgentTransition {
                    agent_id: report.agent_id.clone(),
                    from,
                    to,
                    at: now,
                });
            }
            ctx.lifecycle.push(report);
        }
        for reason in rejections {
            ctx.reject(LIFECYCLE_STEP, reason);
        }

        Ok(StepOutcome::processed(ingested + applied)
            .with_detail(format!("{} inputs queued, {} commands applied", ingested, applied)))
    }
}

impl Queryable for LifecycleCoordinator {
    type Key = str;
    type View = Agent;

    fn query(&self, key: &str) -> Option<Agent> {
        lock(&self.agents).get(key).cloned()
    }

    fn list(&self) -> Vec<Agent> {
        lock(&self.agents).snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::router::{Payload, Priority};
    use crate::state::HaltNotice;

    fn setup() -> (LifecycleCoordinator, SharedState) {
        let shared = SharedState::new(Arc::new(ManualClock::starting_now()));
        let coordinator = LifecycleCoordinator::new(&shared, LifecycleConfig::default());
        (coordinator, shared)
    }

    fn activate(coord: &LifecycleCoordinator, id: &str) {
        coord.register(AgentId::from(id), BTreeSet::new()).unwrap();
        coord.advance(id, LifecycleEvent::Activate).unwrap();
    }

    #[test]
    fn test_unknown_agent() {
        let (coord, _) = setup();
        let err = coord.advance("ghost", LifecycleEvent::Observe).unwrap_err();
        assert_eq!(err, LifecycleError::UnknownAgent(AgentId::from("ghost")));
    }

    #[test]
    fn test_illegal_transition_reports_current_state() {
        let (coord, _) = setup();
        activate(&coord, "w1");
        let err = coord.advance("w1", LifecycleEvent::Complete).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::IllegalTransition {
                current: AgentState::Idle,
                event: LifecycleEvent::Complete,
                ..
            }
        ));
        assert_eq!(coord.state("w1"), Some(AgentState::Idle));
    }

    #[test]
    fn test_halt_blocks_act() {
        let (coord, shared) = setup();
        activate(&coord, "w1");
        coord.advance("w1", LifecycleEvent::Observe).unwrap();
        coord
            .submit_input(
                "w1",
                PendingInput::Task(TaskEvent {
                    task_id: "t1".to_string(),
                    agent_id: AgentId::from("w1"),
                    summary: String::new(),
                }),
            )
            .unwrap();
        coord.advance("w1", LifecycleEvent::Decide).unwrap();
        shared.halt.raise(HaltNotice {
            record_id: "r1".to_string(),
            reason: "test".to_string(),
            raised_at: chrono::Utc::now(),
        });
        assert!(matches!(
            coord.advance("w1", LifecycleEvent::Act),
            Err(LifecycleError::Halted { .. })
        ));
        shared.halt.release("r1");
        assert!(coord.advance("w1", LifecycleEvent::Act).is_ok());
    }

    #[test]
    fn test_deregister_is_final() {
        let (coord, _) = setup();
        activate(&coord, "w1");
        coord.deregister("w1").unwrap();
        assert_eq!(coord.state("w1"), Some(AgentState::Inactive));
        assert!(coord.deregister("w1").is_err());
        assert!(coord.query("w1").is_some());
    }

    #[tokio::test]
    async fn test_step_ingests_inputs_and_commands() {
        let (coord, shared) = setup();
        activate(&coord, "w1");
        activate(&coord, "w2");
        activate(&coord, "w3");

        let broadcast = Message::new(
            AgentId::from("w1"),
            Recipient::Broadcast,
            Priority::Normal,
            Payload::default(),
        );
        let direct = Message::new(
            AgentId::from("w1"),
            Recipient::Agent(AgentId::from("w2")),
            Priority::High,
            Payload::default(),
        );
        let inputs = vec![
            CycleInput::Message(broadcast),
            CycleInput::Message(direct),
            CycleInput::Task(TaskEvent {
                task_id: "t1".to_string(),
                agent_id: AgentId::from("nobody"),
                summary: String::new(),
            }),
            CycleInput::Lifecycle(LifecycleCommand::Advance {
                agent_id: AgentId::from("w2"),
                event: LifecycleEvent::Observe,
            }),
        ];
        let mut ctx = ExecutionContext::new(1, shared.clone(), inputs);
        let outcome = coord.run(&mut ctx).await.unwrap();

        // Broadcast reaches w2 and w3 (not the sender), direct reaches w2.
        assert_eq!(outcome.processed, 4);
        assert_eq!(coord.query("w2").unwrap().backlog(), 2);
        assert_eq!(coord.query("w3").unwrap().backlog(), 1);
        assert_eq!(coord.query("w1").unwrap().backlog(), 0);
        assert_eq!(coord.state("w2"), Some(AgentState::Observing));
        assert_eq!(ctx.rejections.len(), 1);
        assert_eq!(ctx.lifecycle.len(), 1);
        assert!(matches!(
            ctx.metrics[0],
            MetricEvent::AgentTransition {
                to: AgentState::Observing,
                ..
            }
        ));
    }
}
