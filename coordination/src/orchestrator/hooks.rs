//! Cycle-closed hooks.
//!
//! Hooks run after every pipeline run, including runs stopped by a fatal
//! step error, so state is flushed and observable either way. A failing
//! hook is logged and noted on the report; it never fails the cycle.

use tracing::{debug, warn};

use super::report::CycleReport;
use crate::context::ExecutionContext;
use crate::debate::DebateOutcome;
use crate::events::{CoordinationEvent, EventBusError, SharedEventBus};
use crate::state::{lock, save, Persist, SharedState, SharedStateStore, StateStore, StoreError};

/// Error type for hook failures
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),

    #[error("event publish failed: {0}")]
    Publish(#[from] EventBusError),
}

/// Called once per cycle after the last step.
pub trait CycleHook: Send + Sync {
    /// Hook name for logs and reports.
    fn name(&self) -> &str;

    /// Observe the closed cycle.
    fn on_cycle_closed(&self, ctx: &ExecutionContext, report: &CycleReport)
        -> Result<(), HookError>;
}

/// Writes changed agents, open intervention records, and settled messages,
/// sessions and records to a state store.
///
/// Entities whose write fails are handed back to their owners and retried
/// on the next cycle.
pub struct PersistenceHook {
    shared: SharedState,
    store: SharedStateStore,
}

impl PersistenceHook {
    pub fn new(shared: &SharedState, store: SharedStateStore) -> Self {
        Self {
            shared: shared.clone(),
            store,
        }
    }
}

/// Write tally for one hook run.
#[derive(Default)]
struct Flush {
    written: usize,
    first_error: Option<StoreError>,
}

impl Flush {
    /// Save each entity; return those whose write failed.
    fn save_all<T: Persist>(&mut self, store: &dyn StateStore, cycle: u64, items: Vec<T>) -> Vec<T> {
        let mut failed = Vec::new();
        for item in items {
            match save(store, &item) {
                Ok(()) => self.written += 1,
                Err(e) => {
                    warn!(
                        cycle,
                        kind = %T::KIND,
                        id = %item.storage_id(),
                        error = %e,
                        "failed to persist entity"
                    );
                    self.first_error.get_or_insert(e);
                    failed.push(item);
                }
            }
        }
        failed
    }
}

impl CycleHook for PersistenceHook {
    fn name(&self) -> &str {
        "persistence"
    }

    fn on_cycle_closed(
        &self,
        _ctx: &ExecutionContext,
        report: &CycleReport,
    ) -> Result<(), HookError> {
        let cycle = report.cycle;
        let store = self.store.as_ref();
        let mut flush = Flush::default();

        let agents = lock(&self.shared.agents).take_dirty();
        let failed = flush.save_all(store, cycle, agents);
        if !failed.is_empty() {
            lock(&self.shared.agents).mark_dirty(failed.into_iter().map(|a| a.id));
        }

        let messages = lock(&self.shared.queue).take_unpersisted();
        let failed = flush.save_all(store, cycle, messages);
        if !failed.is_empty() {
            lock(&self.shared.queue).requeue_unpersisted(failed);
        }

        let debates = self.shared.debates.drain_unpersisted();
        let failed = flush.save_all(store, cycle, debates);
        if !failed.is_empty() {
            self.shared.debates.requeue_unpersisted(failed);
        }

        // Open records first so a record archived meanwhile ends up closed.
        let open = self.shared.interventions.snapshot();
        let closed = self.shared.interventions.drain_unpersisted();
        let open: Vec<_> = open
            .into_iter()
            .filter(|r| !closed.iter().any(|c| c.id == r.id))
            .collect();
        flush.save_all(store, cycle, open);
        let failed = flush.save_all(store, cycle, closed);
        if !failed.is_empty() {
            self.shared.interventions.requeue_unpersisted(failed);
        }

        debug!(cycle, written = flush.written, "cycle state persisted");
        match flush.first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Publishes the cycle's outcomes on the event bus.
pub struct EventHook {
    bus: SharedEventBus,
}

impl EventHook {
    pub fn new(bus: SharedEventBus) -> Self {
        Self { bus }
    }
}

impl CycleHook for EventHook {
    fn name(&self) -> &str {
        "events"
    }

    fn on_cycle_closed(&self, ctx: &ExecutionContext, report: &CycleReport) -> Result<(), HookError> {
        let cycle = report.cycle;
        let timestamp = report.finished_at;

        for metric in &ctx.metrics {
            self.bus.publish(CoordinationEvent::Metric {
                cycle,
                metric: metric.clone(),
                timestamp,
            })?;
        }

        for outcome in &ctx.debates {
            let event = match outcome {
                DebateOutcome::Opened { .. } => continue,
                DebateOutcome::Resolved(decision) => CoordinationEvent::DebateResolved {
                    cycle,
                    decision: decision.clone(),
                    timestamp,
                },
                DebateOutcome::Abandoned { session_id, reason } => {
                    CoordinationEvent::DebateAbandoned {
                        cycle,
                        session_id: session_id.clone(),
                        reason: reason.clone(),
                        timestamp,
                    }
                }
            };
            self.bus.publish(event)?;
        }

        if let Some(notice) = &report.emergency {
            self.bus.publish(CoordinationEvent::EmergencyRaised {
                cycle,
                notice: notice.clone(),
                timestamp,
            })?;
        }

        self.bus.publish(CoordinationEvent::CycleClosed {
            cycle,
            pipeline: report.pipeline.clone(),
            steps_run: report.steps.len(),
            failed_steps: report.failed_steps(),
            aborted: report.aborted_by.is_some(),
            delivered: report.delivered,
            rejected: report.rejected,
            timestamp,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LifecycleEvent;
    use crate::clock::ManualClock;
    use crate::events::EventBus;
    use crate::ids::AgentId;
    use crate::intervention::{InterventionRecord, ResolutionStatus, Scope, Severity, SignalKind};
    use crate::metrics::MetricEvent;
    use crate::state::{EntityKind, MemoryStore, StoreResult};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn shared() -> SharedState {
        SharedState::new(Arc::new(ManualClock::starting_now()))
    }

    /// Memory store that refuses writes while `down` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl StateStore for FlakyStore {
        fn put(&self, kind: EntityKind, id: &str, value: &Value) -> StoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk unavailable".to_string()));
            }
            self.inner.put(kind, id, value)
        }

        fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Value>> {
            self.inner.get(kind, id)
        }

        fn delete(&self, kind: EntityKind, id: &str) -> StoreResult<()> {
            self.inner.delete(kind, id)
        }

        fn list(&self, kind: EntityKind) -> StoreResult<Vec<String>> {
            self.inner.list(kind)
        }
    }

    fn record(id: &str, agent: &str, now: chrono::DateTime<chrono::Utc>) -> InterventionRecord {
        InterventionRecord::open(
            id.to_string(),
            SignalKind::ErrorRate,
            Scope::Agent(AgentId::from(agent)),
            Severity::Critical,
            0.7,
            now,
        )
    }

    #[test]
    fn test_persistence_hook_writes_dirty_agents_once() {
        let shared = shared();
        let store = Arc::new(MemoryStore::new());
        {
            let mut agents = lock(&shared.agents);
            let now = shared.clock.now();
            agents.register(AgentId::from("w1"), Default::default(), now).unwrap();
            agents.advance("w1", LifecycleEvent::Activate, now, false).unwrap();
        }
        let hook = PersistenceHook::new(&shared, store.clone());
        let ctx = ExecutionContext::new(1, shared.clone(), Vec::new());
        let report = CycleReport::new(1, "default", ctx.now());

        hook.on_cycle_closed(&ctx, &report).unwrap();
        assert_eq!(store.count(EntityKind::Agent), 1);
        assert!(lock(&shared.agents).take_dirty().is_empty());
    }

    #[test]
    fn test_persistence_hook_retries_after_store_error() {
        let shared = shared();
        let store = Arc::new(FlakyStore::default());
        let now = shared.clock.now();
        lock(&shared.agents)
            .register(AgentId::from("w1"), Default::default(), now)
            .unwrap();
        shared.interventions.insert("intv-open", record("intv-open", "w1", now));
        shared.interventions.insert("intv-done", record("intv-done", "w2", now));
        shared
            .interventions
            .with("intv-done", |r| r.close(ResolutionStatus::Closed, now));
        shared.interventions.archive("intv-done");

        let hook = PersistenceHook::new(&shared, store.clone());
        let ctx = ExecutionContext::new(1, shared.clone(), Vec::new());
        let report = CycleReport::new(1, "default", ctx.now());

        store.down.store(true, Ordering::SeqCst);
        assert!(matches!(
            hook.on_cycle_closed(&ctx, &report),
            Err(HookError::Store(StoreError::Backend(_)))
        ));
        assert_eq!(store.inner.count(EntityKind::Agent), 0);

        // Nothing was lost: the next run writes everything.
        store.down.store(false, Ordering::SeqCst);
        hook.on_cycle_closed(&ctx, &report).unwrap();
        assert_eq!(store.inner.count(EntityKind::Agent), 1);
        assert_eq!(store.inner.count(EntityKind::Intervention), 2);
        let done: InterventionRecord = crate::state::load(&*store, "intv-done")
            .unwrap()
            .unwrap();
        assert!(!done.is_open());
        let open: InterventionRecord = crate::state::load(&*store, "intv-open")
            .unwrap()
            .unwrap();
        assert!(open.is_open());
    }

    #[tokio::test]
    async fn test_event_hook_publishes_metrics_then_summary() {
        let shared = shared();
        let bus = EventBus::new().shared();
        let mut rx = bus.subscribe();
        let hook = EventHook::new(bus);

        let mut ctx = ExecutionContext::new(4, shared, Vec::new());
        ctx.emit(MetricEvent::StepFinished {
            step: "router".to_string(),
            ok: true,
            elapsed_ms: 1,
        });
        let report = CycleReport::new(4, "default", ctx.now());
        hook.on_cycle_closed(&ctx, &report).unwrap();

        assert_eq!(rx.recv().await.unwrap().event_type(), "step_finished");
        let closed = rx.recv().await.unwrap();
        assert_eq!(closed.event_type(), "cycle_closed");
        assert_eq!(closed.cycle(), 4);
    }
}
