//! Intervention manager: classifies health signals, applies escalating
//! actions, and undoes them once the condition clears.
//!
//! # Escalation Ladder
//!
//! ```text
//! Warning    log only
//!     │
//! Degraded   + throttle the agent one priority tier
//!     │
//! Critical   + suspend the agent
//!     │
//! Emergency  + raise the system halt switch
//! ```
//!
//! One record exists per open condition (signal + scope). Its severity only
//! rises while it is open; it closes when the signal drops below the warning
//! bound or an operator cancels it. A cancelled condition stays quiet until
//! its reading rises above the value seen at cancellation or clears.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::record::{InterventionAction, InterventionRecord, ResolutionStatus, Severity};
use super::signals::{
    builtin_samples, merge_samples, ConditionKey, HealthSignalSource, Scope, SignalSample,
};
use crate::agent::{AgentState, LifecycleError, LIFECYCLE_STEP};
use crate::config::InterventionConfig;
use crate::context::ExecutionContext;
use crate::contracts::{Escalatable, Queryable, Step, StepOutcome, StepResult};
use crate::ids::{prefixed_id, AgentId, RecordId};
use crate::metrics::MetricEvent;
use crate::router::ROUTER_STEP;
use crate::state::{lock, HaltNotice, SharedState};

/// Step name of the intervention manager.
pub const INTERVENTION_STEP: &str = "intervention";

/// Error type for intervention operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterventionError {
    #[error("unknown intervention record: {0}")]
    UnknownRecord(RecordId),

    #[error("intervention record {record} is already {status}")]
    NotOpen {
        record: RecordId,
        status: ResolutionStatus,
    },
}

/// Result type for intervention operations
pub type InterventionResult<T> = Result<T, InterventionError>;

/// What applying or reverting a record did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub record_id: RecordId,
    pub severity: Severity,
    pub scope: Scope,
    /// Actions applied, or undone when `reverted`.
    pub actions: Vec<InterventionAction>,
    /// Whether this result closes the record.
    pub reverted: bool,
    /// Failures and notes.
    pub detail: String,
}

impl ActionResult {
    /// Whether anything changed.
    pub fn changed(&self) -> bool {
        !self.actions.is_empty() || self.reverted
    }
}

/// Condition bookkeeping behind the record table.
#[derive(Debug, Default)]
struct Conditions {
    /// Open record per condition.
    open: BTreeMap<ConditionKey, RecordId>,
    /// Cancelled conditions and the reading at cancellation.
    suppressed: BTreeMap<ConditionKey, f64>,
}

/// Owner of intervention records.
pub struct InterventionManager {
    shared: SharedState,
    source: Option<Arc<dyn HealthSignalSource>>,
    config: InterventionConfig,
    conditions: Mutex<Conditions>,
}

impl InterventionManager {
    /// Manager over the shared record table.
    pub fn new(shared: &SharedState, config: InterventionConfig) -> Self {
        Self {
            shared: shared.clone(),
            source: None,
            config,
            conditions: Mutex::new(Conditions::default()),
        }
    }

    /// Add an external signal source.
    pub fn with_source(mut self, source: Arc<dyn HealthSignalSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &InterventionConfig {
        &self.config
    }

    /// Every sample visible to this cycle, one per condition.
    pub fn samples(&self, ctx: &ExecutionContext) -> Vec<SignalSample> {
        let now = ctx.now();
        let mut samples = builtin_samples(&self.shared, now, self.config.error_rate_min_samples);
        if let Some(source) = &self.source {
            let external = source.sample(now);
            debug!(source = source.name(), count = external.len(), "external health samples");
            samples.extend(external);
        }
        samples.extend(ctx.health_samples().cloned());
        merge_samples(samples)
    }

    /// Records the current signals call for, without changing anything.
    ///
    /// Existing open records come back with the new observation and any
    /// escalation applied to the copy.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Vec<InterventionRecord> {
        self.evaluate_samples(&self.samples(ctx), ctx.now())
    }

    /// [`evaluate`](Self::evaluate) over given samples.
    pub fn evaluate_samples(
        &self,
        samples: &[SignalSample],
        now: DateTime<Utc>,
    ) -> Vec<InterventionRecord> {
        let conditions = lock(&self.conditions);
        samples
            .iter()
            .filter_map(|sample| {
                let severity = self.config.thresholds.classify(sample.kind, sample.value)?;
                let key = sample.key();
                if conditions
                    .suppressed
                    .get(&key)
                    .is_some_and(|at_cancel| sample.value <= *at_cancel)
                {
                    return None;
                }
                let existing = conditions
                    .open
                    .get(&key)
                    .and_then(|id| self.shared.interventions.lookup(id))
                    .filter(|r| r.is_open());
                Some(match existing {
                    Some(mut record) => {
                        record.observe(sample.value, now);
                        let reason = record.condition.clone();
                        record.escalate_to(severity, &reason, now);
                        record
                    }
                    None => InterventionRecord::open(
                        prefixed_id("intv"),
                        sample.kind,
                        sample.scope.clone(),
                        severity,
                        sample.value,
                        now,
                    ),
                })
            })
            .collect()
    }

    /// Open or update the record for a condition and apply the actions its
    /// severity requires that are not yet in effect.
    ///
    /// Applying the same record twice changes nothing the second time.
    pub fn apply(&self, ctx: &mut ExecutionContext, record: InterventionRecord) -> ActionResult {
        let now = ctx.now();
        let mut conditions = lock(&self.conditions);
        let key = record.key();

        let id = match conditions.open.get(&key) {
            Some(id) if self.shared.interventions.contains(id) => id.clone(),
            _ => {
                let id = record.id.clone();
                let mut fresh = record.clone();
                fresh.actions.clear();
                info!(
                    record_id = %id,
                    signal = %fresh.signal,
                    scope = %fresh.scope,
                    severity = %fresh.severity,
                    value = fresh.observed_value,
                    "intervention opened"
                );
                self.shared.interventions.insert(id.clone(), fresh);
                conditions.suppressed.remove(&key);
                conditions.open.insert(key, id.clone());
                id
            }
        };

        let outcome = self.shared.interventions.with(&id, |stored| {
            stored.observe(record.observed_value, now);
            if stored.escalate_to(record.severity, &record.condition, now) {
                warn!(
                    record_id = %stored.id,
                    severity = %stored.severity,
                    condition = %stored.condition,
                    "intervention escalated"
                );
            }
            if stored.cancel_requested.is_some() {
                return (stored.severity, stored.scope.clone(), Vec::new(), vec![
                    "cancellation pending".to_string(),
                ]);
            }

            let mut applied = Vec::new();
            let mut notes = Vec::new();
            for action in stored.missing_actions() {
                match self.perform(&action, stored, now) {
                    Ok(()) => {
                        stored.actions.push(action.clone());
                        applied.push(action);
                    }
                    Err(reason) => notes.push(format!("{}: {}", action, reason)),
                }
            }
            (stored.severity, stored.scope.clone(), applied, notes)
        });
        drop(conditions);

        let Some((severity, scope, actions, notes)) = outcome else {
            return ActionResult {
                record_id: id,
                severity: record.severity,
                scope: record.scope,
                actions: Vec::new(),
                reverted: false,
                detail: "record closed concurrently".to_string(),
            };
        };

        for action in &actions {
            ctx.emit(MetricEvent::Intervention {
                record_id: id.clone(),
                severity,
                action: action.to_string(),
                at: now,
            });
            if *action == InterventionAction::SystemHalt {
                ctx.emergency = self.shared.halt.notice();
            }
        }

        ActionResult {
            record_id: id,
            severity,
            scope,
            actions,
            reverted: false,
            detail: notes.join("; "),
        }
    }

    /// Close records whose condition cleared or that were cancelled, undoing
    /// their actions.
    pub fn recover(&self, ctx: &mut ExecutionContext) -> Vec<ActionResult> {
        let samples = self.samples(ctx);
        self.recover_with(ctx, &samples)
    }

    /// [`recover`](Self::recover) over given samples.
    pub fn recover_with(
        &self,
        ctx: &mut ExecutionContext,
        samples: &[SignalSample],
    ) -> Vec<ActionResult> {
        let now = ctx.now();
        let active: BTreeSet<ConditionKey> = samples
            .iter()
            .filter(|s| self.config.thresholds.classify(s.kind, s.value).is_some())
            .map(SignalSample::key)
            .collect();

        let mut results = Vec::new();
        let mut conditions = lock(&self.conditions);
        conditions.suppressed.retain(|key, _| active.contains(key));
        let tracked: Vec<(ConditionKey, RecordId)> = conditions
            .open
            .iter()
            .map(|(k, id)| (k.clone(), id.clone()))
            .collect();

        for (key, id) in tracked {
            let closed = self.shared.interventions.with(&id, |record| {
                let status = if record.cancel_requested.is_some() {
                    ResolutionStatus::Cancelled
                } else if !active.contains(&key) {
                    ResolutionStatus::Closed
                } else {
                    return None;
                };

                let undone: Vec<InterventionAction> = record.actions.iter().rev().cloned().collect();
                let mut notes = Vec::new();
                for action in &undone {
                    if let Err(reason) = self.undo(action, &record.id, now) {
                        notes.push(format!("{}: {}", action, reason));
                    }
                }
                if let Some(reason) = &record.cancel_requested {
                    notes.push(format!("cancelled: {}", reason));
                }
                record.close(status, now);
                info!(record_id = %record.id, %status, undone = undone.len(), "intervention closed");
                let quiet_until = (status == ResolutionStatus::Cancelled && active.contains(&key))
                    .then_some(record.observed_value);
                Some((quiet_until, ActionResult {
                    record_id: record.id.clone(),
                    severity: record.severity,
                    scope: record.scope.clone(),
                    actions: undone,
                    reverted: true,
                    detail: notes.join("; "),
                }))
            });

            match closed {
                Some(Some((quiet_until, result))) => {
                    self.shared.interventions.archive(&id);
                    conditions.open.remove(&key);
                    if let Some(value) = quiet_until {
                        let value = samples
                            .iter()
                            .filter(|s| s.key() == key)
                            .map(|s| s.value)
                            .fold(value, f64::max);
                        debug!(record_id = %id, value, "condition suppressed after cancellation");
                        conditions.suppressed.insert(key, value);
                    }
                    results.push(result);
                }
                Some(None) => {}
                None => {
                    conditions.open.remove(&key);
                }
            }
        }
        drop(conditions);

        for result in &results {
            for action in &result.actions {
                ctx.emit(MetricEvent::Intervention {
                    record_id: result.record_id.clone(),
                    severity: result.severity,
                    action: format!("revert_{}", action),
                    at: now,
                });
            }
        }
        results
    }

    /// Request cancellation; applied at the next run of the step.
    pub fn cancel_record(&self, record_id: &str, reason: &str) -> InterventionResult<()> {
        let updated = self.shared.interventions.with(record_id, |record| {
            if record.is_open() {
                record.cancel_requested = Some(reason.to_string());
            }
        });
        match updated {
            Some(()) => {
                info!(record_id, reason, "intervention cancellation requested");
                Ok(())
            }
            None => match self.shared.interventions.lookup(record_id) {
                Some(closed) => Err(InterventionError::NotOpen {
                    record: closed.id,
                    status: closed.status,
                }),
                None => Err(InterventionError::UnknownRecord(record_id.to_string())),
            },
        }
    }

    /// Snapshot of an open or archived record.
    pub fn record(&self, record_id: &str) -> Option<InterventionRecord> {
        self.shared.interventions.lookup(record_id)
    }

    /// Reinstate open records loaded from a state store.
    ///
    /// Closed records, ids already present and conditions already tracked
    /// are skipped. A record holding the halt raises it again. Returns the
    /// number of records reinstated.
    pub fn restore(&self, records: impl IntoIterator<Item = InterventionRecord>) -> usize {
        let mut conditions = lock(&self.conditions);
        let mut restored = 0;
        for record in records {
            if !record.is_open() || self.shared.interventions.contains(&record.id) {
                continue;
            }
            let key = record.key();
            if let Some(tracked) = conditions.open.get(&key) {
                warn!(record_id = %record.id, %tracked, "condition already tracked, record not restored");
                continue;
            }
            if record.actions.contains(&InterventionAction::SystemHalt) {
                self.shared.halt.raise(HaltNotice {
                    record_id: record.id.clone(),
                    reason: record.condition.clone(),
                    raised_at: record.updated_at,
                });
            }
            debug!(record_id = %record.id, severity = %record.severity, "intervention restored");
            conditions.open.insert(key, record.id.clone());
            self.shared.interventions.insert(record.id.clone(), record);
            restored += 1;
        }
        restored
    }

    /// Return to `Idle` every suspended agent whose suspending record is no
    /// longer open.
    pub fn release_orphaned_suspensions(&self) -> Vec<AgentId> {
        let now = self.shared.clock.now();
        let open: BTreeSet<RecordId> = self.shared.interventions.ids().into_iter().collect();
        let mut agents = lock(&self.shared.agents);
        let orphaned: Vec<(AgentId, RecordId)> = agents
            .snapshot()
            .into_iter()
            .filter(|agent| agent.state == AgentState::Suspended)
            .filter_map(|agent| {
                let record_id = agent.suspended_by?;
                (!open.contains(&record_id)).then_some((agent.id, record_id))
            })
            .collect();

        let mut released = Vec::new();
        for (agent, record_id) in orphaned {
            match agents.clear_suspension(agent.as_str(), &record_id, now) {
                Ok(()) => {
                    info!(agent_id = %agent, %record_id, "orphaned suspension cleared");
                    released.push(agent);
                }
                Err(e) => warn!(agent_id = %agent, error = %e, "orphaned suspension not cleared"),
            }
        }
        released
    }

    fn perform(
        &self,
        action: &InterventionAction,
        record: &InterventionRecord,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        match action {
            InterventionAction::LogOnly => {
                warn!(
                    record_id = %record.id,
                    signal = %record.signal,
                    scope = %record.scope,
                    severity = %record.severity,
                    value = record.observed_value,
                    "health condition"
                );
                Ok(())
            }
            InterventionAction::Throttle { agent } => {
                let penalty = lock(&self.shared.agents)
                    .throttle(agent.as_str())
                    .map_err(|e| e.to_string())?;
                info!(record_id = %record.id, agent_id = %agent, penalty, "agent throttled");
                Ok(())
            }
            InterventionAction::Suspend { agent } => {
                match lock(&self.shared.agents).suspend(agent.as_str(), &record.id, now) {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        debug!(record_id = %record.id, agent_id = %agent, error = %e, "suspension deferred");
                        Err(e.to_string())
                    }
                }
            }
            InterventionAction::SystemHalt => {
                let raised = self.shared.halt.raise(HaltNotice {
                    record_id: record.id.clone(),
                    reason: record.condition.clone(),
                    raised_at: now,
                });
                if raised {
                    error!(record_id = %record.id, condition = %record.condition, "system halt raised");
                }
                Ok(())
            }
        }
    }

    fn undo(
        &self,
        action: &InterventionAction,
        record_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        match action {
            InterventionAction::LogOnly => Ok(()),
            InterventionAction::Throttle { agent } => lock(&self.shared.agents)
                .unthrottle(agent.as_str())
                .map(|_| ())
                .map_err(|e| e.to_string()),
            InterventionAction::Suspend { agent } => {
                match lock(&self.shared.agents).clear_suspension(agent.as_str(), record_id, now) {
                    Ok(()) => Ok(()),
                    // Deregistered while suspended; nothing to clear.
                    Err(LifecycleError::NotSuspended { .. }) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            }
            InterventionAction::SystemHalt => {
                if self.shared.halt.release(record_id) {
                    info!(record_id, "system halt lifted");
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Step for InterventionManager {
    fn name(&self) -> &str {
        INTERVENTION_STEP
    }

    fn dependencies(&self) -> &[&'static str] {
        &[LIFECYCLE_STEP, ROUTER_STEP]
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> StepResult {
        let samples = self.samples(ctx);
        let recovered = self.recover_with(ctx, &samples);
        let closed = recovered.len();
        ctx.interventions.extend(recovered);

        let mut applied = 0;
        for record in self.evaluate_samples(&samples, ctx.now()) {
            let result = self.apply(ctx, record);
            if result.changed() || !result.detail.is_empty() {
                applied += result.actions.len();
                ctx.interventions.push(result);
            }
        }

        if self.shared.halt.is_raised() {
            ctx.emergency = self.shared.halt.notice();
        }

        Ok(StepOutcome::processed(applied + closed).with_detail(format!(
            "{} actions applied, {} records closed, {} open",
            applied,
            closed,
            self.shared.interventions.len()
        )))
    }
}

impl Queryable for InterventionManager {
    type Key = str;
    type View = InterventionRecord;

    fn query(&self, key: &str) -> Option<InterventionRecord> {
        self.record(key)
    }

    fn list(&self) -> Vec<InterventionRecord> {
        self.shared.interventions.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentState, LifecycleEvent};
    use crate::clock::{Clock, ManualClock};
    use crate::context::CycleInput;
    use crate::ids::AgentId;
    use crate::intervention::{SignalKind, StaticSignalSource};

    struct Fixture {
        manager: InterventionManager,
        shared: SharedState,
        source: Arc<StaticSignalSource>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let shared = SharedState::new(clock.clone());
        let source = Arc::new(StaticSignalSource::new());
        let manager = InterventionManager::new(&shared, InterventionConfig::default())
            .with_source(source.clone());
        {
            let mut agents = lock(&shared.agents);
            let now = clock.now();
            agents.register(AgentId::from("w1"), Default::default(), now).unwrap();
            agents.advance("w1", LifecycleEvent::Activate, now, false).unwrap();
        }
        Fixture {
            manager,
            shared,
            source,
        }
    }

    fn backlog(value: f64) -> SignalSample {
        SignalSample::new(SignalKind::AgentBacklog, Scope::Agent(AgentId::from("w1")), value)
    }

    fn ctx(f: &Fixture) -> ExecutionContext {
        ExecutionContext::new(1, f.shared.clone(), Vec::new())
    }

    #[test]
    fn test_evaluate_is_pure() {
        let f = fixture();
        f.source.set(vec![backlog(30.0)]);
        let c = ctx(&f);
        let proposed = f.manager.evaluate(&c);
        assert_eq!(proposed.len(), 1);
        assert_eq!(proposed[0].severity, Severity::Degraded);
        assert!(f.shared.interventions.is_empty());
        assert_eq!(lock(&f.shared.agents).get("w1").unwrap().dispatch_penalty, 0);
    }

    #[test]
    fn test_degraded_throttles_once() {
        let f = fixture();
        f.source.set(vec![backlog(30.0)]);
        let mut c = ctx(&f);
        let record = f.manager.evaluate(&c).remove(0);
        let first = f.manager.apply(&mut c, record.clone());
        assert_eq!(first.actions.len(), 2);
        let again = f.manager.apply(&mut c, record);
        assert!(again.actions.is_empty());
        assert_eq!(lock(&f.shared.agents).get("w1").unwrap().dispatch_penalty, 1);
        assert_eq!(f.shared.interventions.len(), 1);
    }

    #[test]
    fn test_escalation_keeps_record_and_suspends() {
        let f = fixture();
        f.source.set(vec![backlog(30.0)]);
        let mut c = ctx(&f);
        for r in f.manager.evaluate(&c) {
            f.manager.apply(&mut c, r);
        }
        f.source.set(vec![backlog(60.0)]);
        let proposed = f.manager.evaluate(&c);
        assert_eq!(proposed[0].severity, Severity::Critical);
        let result = f.manager.apply(&mut c, proposed[0].clone());
        assert_eq!(
            result.actions,
            vec![InterventionAction::Suspend {
                agent: AgentId::from("w1")
            }]
        );
        assert_eq!(lock(&f.shared.agents).state("w1"), Some(AgentState::Suspended));
        let record = f.manager.record(&result.record_id).unwrap();
        assert_eq!(record.history.len(), 2);

        // A lower reading never lowers an open record.
        f.source.set(vec![backlog(12.0)]);
        assert_eq!(f.manager.evaluate(&c)[0].severity, Severity::Critical);
    }

    #[test]
    fn test_recovery_undoes_actions() {
        let f = fixture();
        f.source.set(vec![backlog(60.0)]);
        let mut c = ctx(&f);
        let id = {
            let r = f.manager.evaluate(&c).remove(0);
            f.manager.apply(&mut c, r).record_id
        };
        assert_eq!(lock(&f.shared.agents).state("w1"), Some(AgentState::Suspended));

        f.source.clear();
        let closed = f.manager.recover(&mut c);
        assert_eq!(closed.len(), 1);
        assert!(closed[0].reverted);
        let agents = lock(&f.shared.agents);
        assert_eq!(agents.state("w1"), Some(AgentState::Idle));
        assert_eq!(agents.get("w1").unwrap().dispatch_penalty, 0);
        drop(agents);
        let record = f.manager.record(&id).unwrap();
        assert_eq!(record.status, ResolutionStatus::Closed);
        assert!(f.shared.interventions.is_empty());
    }

    #[test]
    fn test_emergency_raises_and_releases_halt() {
        let f = fixture();
        let mut c = ExecutionContext::new(
            1,
            f.shared.clone(),
            vec![CycleInput::Health(SignalSample::new(
                SignalKind::QueueDepth,
                Scope::System,
                20_000.0,
            ))],
        );
        let record = f.manager.evaluate(&c).remove(0);
        assert_eq!(record.severity, Severity::Emergency);
        f.manager.apply(&mut c, record);
        assert!(f.shared.halt.is_raised());
        assert!(c.emergency.is_some());

        let mut next = ctx(&f);
        f.manager.recover(&mut next);
        assert!(!f.shared.halt.is_raised());
    }

    #[test]
    fn test_cancel_record_applied_at_recovery() {
        let f = fixture();
        f.source.set(vec![backlog(30.0)]);
        let mut c = ctx(&f);
        let id = {
            let r = f.manager.evaluate(&c).remove(0);
            f.manager.apply(&mut c, r).record_id
        };
        f.manager.cancel_record(&id, "operator").unwrap();
        assert!(f.manager.record(&id).unwrap().is_open());
        let closed = f.manager.recover(&mut c);
        assert_eq!(closed.len(), 1);
        assert_eq!(
            f.manager.record(&id).unwrap().status,
            ResolutionStatus::Cancelled
        );
        assert_eq!(
            f.manager.cancel_record(&id, "again"),
            Err(InterventionError::NotOpen {
                record: id.clone(),
                status: ResolutionStatus::Cancelled
            })
        );
        assert_eq!(
            f.manager.cancel_record("nope", "x"),
            Err(InterventionError::UnknownRecord("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_step_reports_actions() {
        let f = fixture();
        f.source.set(vec![backlog(11.0)]);
        let mut c = ctx(&f);
        f.manager.run(&mut c).await.unwrap();
        assert_eq!(c.interventions.len(), 1);
        assert_eq!(c.interventions[0].severity, Severity::Warning);
        assert!(c
            .metrics
            .iter()
            .any(|m| matches!(m, MetricEvent::Intervention { action, .. } if action == "log_only")));

        // Steady condition: nothing new to report.
        let mut c2 = ctx(&f);
        f.manager.run(&mut c2).await.unwrap();
        assert!(c2.interventions.is_empty());
    }
}
