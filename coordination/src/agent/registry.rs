//! Agent records and the registry that owns them.
//!
//! The registry is the single writer for agent state. Every mutation goes
//! through a method here while the caller holds the registry lock, so
//! transitions for one agent are serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::coordinator::{AdvanceOutcome, HoldReason, LifecycleError, LifecycleResult};
use super::state::{AgentState, AgentTransition, LifecycleEvent};
use crate::ids::{AgentId, MessageId, RecordId};
use crate::router::Priority;
use crate::state::{EntityKind, Persist};

/// Shared reference to the agent registry.
pub type SharedAgentRegistry = Arc<Mutex<AgentRegistry>>;

/// Default bound on an agent's pending input queue.
pub const DEFAULT_MAX_PENDING_INPUTS: usize = 1024;

/// Default number of transitions kept per agent.
pub const DEFAULT_TRANSITION_HISTORY: usize = 256;

/// Highest throttle penalty; one tier per step down from `Critical`.
pub const MAX_DISPATCH_PENALTY: u8 = 4;

/// A task assigned to an agent from outside the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Caller's task identifier.
    pub task_id: String,
    /// Agent the task is for.
    pub agent_id: AgentId,
    /// Short description.
    pub summary: String,
}

/// Work waiting for an agent to decide on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingInput {
    /// A message routed to the agent.
    Message {
        /// Message id.
        message_id: MessageId,
        /// Who sent it.
        sender: AgentId,
    },
    /// A task event.
    Task(TaskEvent),
}

/// Per-agent work counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCounters {
    /// Completed `Acting → Idle` cycles.
    pub cycles_completed: u64,
    /// Completed cycles that consumed a message.
    pub messages_processed: u64,
    /// Completed cycles that consumed a task.
    pub tasks_processed: u64,
    /// Failed cycles.
    pub errors: u64,
    /// Intervention actions applied to this agent.
    pub interventions_received: u64,
}

impl AgentCounters {
    /// Errors over finished cycles, or `None` before any cycle finished.
    pub fn error_rate(&self) -> Option<f64> {
        let finished = self.cycles_completed + self.errors;
        if finished == 0 {
            return None;
        }
        Some(self.errors as f64 / finished as f64)
    }
}

/// A registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent id.
    pub id: AgentId,
    /// Current lifecycle state.
    pub state: AgentState,
    /// Declared roles, e.g. `reviewer`.
    pub roles: BTreeSet<String>,
    /// When the agent was registered.
    pub registered_at: DateTime<Utc>,
    /// Last transition or input.
    pub last_activity: DateTime<Utc>,
    /// When the current state was entered.
    pub state_entered_at: DateTime<Utc>,
    /// Work counters.
    pub counters: AgentCounters,
    /// Inputs waiting for a decision.
    pub pending_inputs: VecDeque<PendingInput>,
    /// Input taken at the last `Decide`, released on completion or failure.
    pub current_input: Option<PendingInput>,
    /// Priority tiers removed from this agent's outgoing messages.
    pub dispatch_penalty: u8,
    /// Record that suspended the agent, if suspended.
    pub suspended_by: Option<RecordId>,
    /// Recent transitions, oldest first.
    pub transitions: Vec<AgentTransition>,
}

impl Agent {
    /// A freshly registered agent.
    pub fn new(id: AgentId, roles: BTreeSet<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: AgentState::Registered,
            roles,
            registered_at: now,
            last_activity: now,
            state_entered_at: now,
            counters: AgentCounters::default(),
            pending_inputs: VecDeque::new(),
            current_input: None,
            dispatch_penalty: 0,
            suspended_by: None,
            transitions: Vec::new(),
        }
    }

    /// Number of inputs waiting.
    pub fn backlog(&self) -> usize {
        self.pending_inputs.len()
    }

    /// Seconds spent in the current state.
    pub fn seconds_in_state(&self, now: DateTime<Utc>) -> i64 {
        (now - self.state_entered_at).num_seconds().max(0)
    }

    /// Apply a lifecycle event.
    ///
    /// Illegal edges and halted `Act`s return an error and leave the agent
    /// untouched. `Decide` without a pending input is held.
    pub fn advance(
        &mut self,
        event: LifecycleEvent,
        now: DateTime<Utc>,
        halted: bool,
        history_cap: usize,
    ) -> LifecycleResult<AdvanceOutcome> {
        let current = self.state;
        let next = current
            .next(event)
            .ok_or_else(|| LifecycleError::IllegalTransition {
                agent: self.id.clone(),
                current,
                event,
            })?;

        match event {
            LifecycleEvent::Decide if self.pending_inputs.is_empty() => {
                return Ok(AdvanceOutcome::Held {
                    state: current,
                    reason: HoldReason::NoPendingInput,
                });
            }
            LifecycleEvent::Act if halted => {
                return Err(LifecycleError::Halted {
                    agent: self.id.clone(),
                    current,
                });
            }
            _ => {}
        }

        match event {
            LifecycleEvent::Decide => {
                self.current_input = self.pending_inputs.pop_front();
            }
            LifecycleEvent::Complete => {
                self.counters.cycles_completed += 1;
                match self.current_input.take() {
                    Some(PendingInput::Message { .. }) => self.counters.messages_processed += 1,
                    Some(PendingInput::Task(_)) => self.counters.tasks_processed += 1,
                    None => {}
                }
            }
            LifecycleEvent::Fail => {
                self.counters.errors += 1;
                self.current_input = None;
            }
            _ => {}
        }

        self.record(next, &event.to_string(), now, history_cap);
        Ok(AdvanceOutcome::Transitioned {
            from: current,
            to: next,
        })
    }

    fn record(&mut self, to: AgentState, reason: &str, now: DateTime<Utc>, history_cap: usize) {
        self.transitions.push(AgentTransition {
            from: self.state,
            to,
            timestamp: now,
            reason: reason.to_string(),
        });
        if self.transitions.len() > history_cap {
            let excess = self.transitions.len() - history_cap;
            self.transitions.drain(..excess);
        }
        self.state = to;
        self.state_entered_at = now;
        self.last_activity = now;
    }
}

impl Persist for Agent {
    const KIND: EntityKind = EntityKind::Agent;

    fn storage_id(&self) -> String {
        self.id.to_string()
    }
}

/// Owner of every agent record.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: HashMap<AgentId, Agent>,
    dirty: BTreeSet<AgentId>,
    max_pending_inputs: usize,
    history_cap: usize,
}

impl AgentRegistry {
    /// Empty registry with default limits.
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            dirty: BTreeSet::new(),
            max_pending_inputs: DEFAULT_MAX_PENDING_INPUTS,
            history_cap: DEFAULT_TRANSITION_HISTORY,
        }
    }

    /// Override queue and history bounds.
    pub fn set_limits(&mut self, max_pending_inputs: usize, history_cap: usize) {
        self.max_pending_inputs = max_pending_inputs.max(1);
        self.history_cap = history_cap.max(1);
    }

    /// Add a new agent in `Registered`.
    pub fn register(
        &mut self,
        id: AgentId,
        roles: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> LifecycleResult<&Agent> {
        if id.is_blank() {
            return Err(LifecycleError::InvalidAgentId);
        }
        if self.agents.contains_key(&id) {
            return Err(LifecycleError::AlreadyRegistered(id));
        }
        info!(agent_id = %id, "agent registered");
        self.dirty.insert(id.clone());
        Ok(self
            .agents
            .entry(id.clone())
            .or_insert_with(|| Agent::new(id, roles, now)))
    }

    /// Restore a persisted agent record.
    pub fn restore(&mut self, agent: Agent) {
        self.agents.insert(agent.id.clone(), agent);
    }

    /// Agent by id.
    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    /// Current state of an agent.
    pub fn state(&self, id: &str) -> Option<AgentState> {
        self.agents.get(id).map(|a| a.state)
    }

    fn agent_mut(&mut self, id: &str) -> LifecycleResult<&mut Agent> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| LifecycleError::UnknownAgent(AgentId::from(id)))
    }

    /// Apply a lifecycle event to one agent.
    pub fn advance(
        &mut self,
        id: &str,
        event: LifecycleEvent,
        now: DateTime<Utc>,
        halted: bool,
    ) -> LifecycleResult<AdvanceOutcome> {
        let history_cap = self.history_cap;
        let agent = self.agent_mut(id)?;
        let outcome = agent.advance(event, now, halted, history_cap)?;
        if let AdvanceOutcome::Transitioned { from, to } = outcome {
            debug!(agent_id = %id, %from, %to, %event, "agent transitioned");
            self.dirty.insert(AgentId::from(id));
        }
        Ok(outcome)
    }

    /// Queue an input for an agent. Returns the new backlog.
    pub fn push_input(
        &mut self,
        id: &str,
        input: PendingInput,
        now: DateTime<Utc>,
    ) -> LifecycleResult<usize> {
        let max = self.max_pending_inputs;
        let agent = self.agent_mut(id)?;
        if agent.state.is_terminal() {
            return Err(LifecycleError::Inactive(agent.id.clone()));
        }
        if agent.pending_inputs.len() >= max {
            return Err(LifecycleError::BacklogFull {
                agent: agent.id.clone(),
                limit: max,
            });
        }
        agent.pending_inputs.push_back(input);
        agent.last_activity = now;
        Ok(agent.pending_inputs.len())
    }

    /// Move an active agent to `Suspended` on behalf of a record.
    ///
    /// Returns the state the agent was suspended from.
    pub fn suspend(
        &mut self,
        id: &str,
        record_id: &str,
        now: DateTime<Utc>,
    ) -> LifecycleResult<AgentState> {
        let history_cap = self.history_cap;
        let agent = self.agent_mut(id)?;
        let current = agent.state;
        if !current.is_active() {
            return Err(LifecycleError::NotSuspendable {
                agent: agent.id.clone(),
                current,
            });
        }
        agent.suspended_by = Some(record_id.to_string());
        agent.current_input = None;
        agent.counters.interventions_received += 1;
        agent.record(
            AgentState::Suspended,
            &format!("suspended by {}", record_id),
            now,
            history_cap,
        );
        info!(agent_id = %id, record_id, from = %current, "agent suspended");
        self.dirty.insert(AgentId::from(id));
        Ok(current)
    }

    /// Return a suspended agent to `Idle`.
    ///
    /// Only the record that suspended the agent may clear it.
    pub fn clear_suspension(
        &mut self,
        id: &str,
        record_id: &str,
        now: DateTime<Utc>,
    ) -> LifecycleResult<()> {
        let history_cap = self.history_cap;
        let agent = self.agent_mut(id)?;
        if agent.state != AgentState::Suspended {
            return Err(LifecycleError::NotSuspended {
                agent: agent.id.clone(),
                current: agent.state,
            });
        }
        if agent.suspended_by.as_deref() != Some(record_id) {
            return Err(LifecycleError::ClearNotAuthorized {
                agent: agent.id.clone(),
                expected: agent.suspended_by.clone(),
                got: record_id.to_string(),
            });
        }
        agent.suspended_by = None;
        agent.record(
            AgentState::Idle,
            &format!("cleared by {}", record_id),
            now,
            history_cap,
        );
        info!(agent_id = %id, record_id, "agent suspension cleared");
        self.dirty.insert(AgentId::from(id));
        Ok(())
    }

    /// Demote an agent's outgoing traffic by one more tier.
    pub fn throttle(&mut self, id: &str) -> LifecycleResult<u8> {
        let agent = self.agent_mut(id)?;
        agent.dispatch_penalty = (agent.dispatch_penalty + 1).min(MAX_DISPATCH_PENALTY);
        agent.counters.interventions_received += 1;
        let penalty = agent.dispatch_penalty;
        self.dirty.insert(AgentId::from(id));
        Ok(penalty)
    }

    /// Lift one tier of throttling.
    pub fn unthrottle(&mut self, id: &str) -> LifecycleResult<u8> {
        let agent = self.agent_mut(id)?;
        agent.dispatch_penalty = agent.dispatch_penalty.saturating_sub(1);
        let penalty = agent.dispatch_penalty;
        self.dirty.insert(AgentId::from(id));
        Ok(penalty)
    }

    /// Priority a message from `sender` is dispatched at.
    pub fn effective_priority(&self, sender: &str, requested: Priority) -> Priority {
        let penalty = self.agents.get(sender).map_or(0, |a| a.dispatch_penalty);
        requested.demote(penalty)
    }

    /// Agents in the work loop, sorted by id.
    pub fn active_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .agents
            .values()
            .filter(|a| a.state.is_active())
            .map(|a| a.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of every agent, sorted by id.
    pub fn snapshot(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Flag agents for the next [`take_dirty`](Self::take_dirty) again,
    /// after a failed write.
    pub fn mark_dirty(&mut self, ids: impl IntoIterator<Item = AgentId>) {
        self.dirty.extend(ids);
    }

    /// Agents changed since the last call.
    pub fn take_dirty(&mut self) -> Vec<Agent> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .iter()
            .filter_map(|id| self.agents.get(id).cloned())
            .collect()
    }

    /// Number of registered agents, inactive included.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent was ever registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(id: &str) -> (AgentRegistry, DateTime<Utc>) {
        let now = Utc::now();
        let mut reg = AgentRegistry::new();
        reg.register(AgentId::from(id), BTreeSet::new(), now).unwrap();
        (reg, now)
    }

    fn task(id: &str, agent: &str) -> PendingInput {
        PendingInput::Task(TaskEvent {
            task_id: id.to_string(),
            agent_id: AgentId::from(agent),
            summary: "do it".to_string(),
        })
    }

    fn drive_to_observing(reg: &mut AgentRegistry, id: &str, now: DateTime<Utc>) {
        reg.advance(id, LifecycleEvent::Activate, now, false).unwrap();
        reg.advance(id, LifecycleEvent::Observe, now, false).unwrap();
    }

    #[test]
    fn test_register_twice_rejected() {
        let (mut reg, now) = registry_with("w1");
        let err = reg
            .register(AgentId::from("w1"), BTreeSet::new(), now)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRegistered(_)));
        assert!(matches!(
            reg.register(AgentId::from(" "), BTreeSet::new(), now),
            Err(LifecycleError::InvalidAgentId)
        ));
    }

    #[test]
    fn test_decide_held_without_input() {
        let (mut reg, now) = registry_with("w1");
        drive_to_observing(&mut reg, "w1", now);
        let outcome = reg.advance("w1", LifecycleEvent::Decide, now, false).unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Held {
                state: AgentState::Observing,
                reason: HoldReason::NoPendingInput
            }
        );
        assert_eq!(reg.state("w1"), Some(AgentState::Observing));
    }

    #[test]
    fn test_complete_counts_consumed_input() {
        let (mut reg, now) = registry_with("w1");
        drive_to_observing(&mut reg, "w1", now);
        reg.push_input("w1", task("t1", "w1"), now).unwrap();
        reg.advance("w1", LifecycleEvent::Decide, now, false).unwrap();
        assert_eq!(reg.get("w1").unwrap().backlog(), 0);
        reg.advance("w1", LifecycleEvent::Act, now, false).unwrap();
        reg.advance("w1", LifecycleEvent::Complete, now, false).unwrap();

        let counters = &reg.get("w1").unwrap().counters;
        assert_eq!(counters.cycles_completed, 1);
        assert_eq!(counters.tasks_processed, 1);
        assert_eq!(counters.messages_processed, 0);
    }

    #[test]
    fn test_illegal_transition_leaves_state() {
        let (mut reg, now) = registry_with("w1");
        let before = reg.get("w1").unwrap().clone();
        let err = reg.advance("w1", LifecycleEvent::Act, now, false).unwrap_err();
        assert_eq!(err.current_state(), Some(AgentState::Registered));
        assert_eq!(reg.get("w1").unwrap(), &before);
    }

    #[test]
    fn test_act_refused_while_halted() {
        let (mut reg, now) = registry_with("w1");
        drive_to_observing(&mut reg, "w1", now);
        reg.push_input("w1", task("t1", "w1"), now).unwrap();
        reg.advance("w1", LifecycleEvent::Decide, now, false).unwrap();
        let err = reg.advance("w1", LifecycleEvent::Act, now, true).unwrap_err();
        assert!(matches!(err, LifecycleError::Halted { .. }));
        assert_eq!(reg.state("w1"), Some(AgentState::Deciding));
        // Failing out is still allowed under halt.
        reg.advance("w1", LifecycleEvent::Fail, now, true).unwrap();
        assert_eq!(reg.get("w1").unwrap().counters.errors, 1);
    }

    #[test]
    fn test_suspend_requires_matching_clear() {
        let (mut reg, now) = registry_with("w1");
        reg.advance("w1", LifecycleEvent::Activate, now, false).unwrap();
        assert_eq!(reg.suspend("w1", "rec-1", now).unwrap(), AgentState::Idle);

        let err = reg.clear_suspension("w1", "rec-2", now).unwrap_err();
        assert!(matches!(err, LifecycleError::ClearNotAuthorized { .. }));
        assert_eq!(reg.state("w1"), Some(AgentState::Suspended));

        reg.clear_suspension("w1", "rec-1", now).unwrap();
        assert_eq!(reg.state("w1"), Some(AgentState::Idle));
        assert!(reg.get("w1").unwrap().suspended_by.is_none());
    }

    #[test]
    fn test_registered_agent_not_suspendable() {
        let (mut reg, now) = registry_with("w1");
        let err = reg.suspend("w1", "rec-1", now).unwrap_err();
        assert!(matches!(err, LifecycleError::NotSuspendable { .. }));
    }

    #[test]
    fn test_backlog_bound() {
        let (mut reg, now) = registry_with("w1");
        reg.set_limits(2, 16);
        reg.push_input("w1", task("a", "w1"), now).unwrap();
        reg.push_input("w1", task("b", "w1"), now).unwrap();
        let err = reg.push_input("w1", task("c", "w1"), now).unwrap_err();
        assert!(matches!(err, LifecycleError::BacklogFull { limit: 2, .. }));
    }

    #[test]
    fn test_throttle_demotes_priority() {
        let (mut reg, _) = registry_with("w1");
        assert_eq!(reg.throttle("w1").unwrap(), 1);
        assert_eq!(
            reg.effective_priority("w1", Priority::High),
            Priority::Normal
        );
        assert_eq!(reg.unthrottle("w1").unwrap(), 0);
        assert_eq!(reg.effective_priority("w1", Priority::High), Priority::High);
        assert_eq!(
            reg.effective_priority("nobody", Priority::Low),
            Priority::Low
        );
    }

    #[test]
    fn test_history_is_capped() {
        let (mut reg, now) = registry_with("w1");
        reg.set_limits(16, 3);
        reg.advance("w1", LifecycleEvent::Activate, now, false).unwrap();
        for _ in 0..5 {
            reg.push_input("w1", task("t", "w1"), now).unwrap();
            reg.advance("w1", LifecycleEvent::Observe, now, false).unwrap();
            reg.advance("w1", LifecycleEvent::Decide, now, false).unwrap();
            reg.advance("w1", LifecycleEvent::Fail, now, false).unwrap();
        }
        assert_eq!(reg.get("w1").unwrap().transitions.len(), 3);
    }

    #[test]
    fn test_take_dirty_drains() {
        let (mut reg, _) = registry_with("w1");
        assert_eq!(reg.take_dirty().len(), 1);
        assert!(reg.take_dirty().is_empty());
        reg.mark_dirty([AgentId::from("w1")]);
        assert_eq!(reg.take_dirty()[0].id, AgentId::from("w1"));
    }

    #[test]
    fn test_error_rate() {
        let mut counters = AgentCounters::default();
        assert_eq!(counters.error_rate(), None);
        counters.cycles_completed = 3;
        counters.errors = 1;
        assert_eq!(counters.error_rate(), Some(0.25));
    }
}
