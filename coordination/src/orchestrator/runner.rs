//! Pipeline runner.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use super::hooks::CycleHook;
use super::registry::StepRegistry;
use super::report::{CycleReport, StepRecord};
use super::{OrchestratorError, OrchestratorResult};
use crate::config::OrchestratorConfig;
use crate::context::{CycleInput, ExecutionContext};
use crate::contracts::{Step, StepError, StepResult};
use crate::metrics::MetricEvent;
use crate::router::DeliveryStatus;
use crate::state::SharedState;
use crate::telemetry;

/// A finished cycle: its report and the context the steps filled in.
#[derive(Debug)]
pub struct CycleRun {
    pub report: CycleReport,
    pub context: ExecutionContext,
}

/// Runs pipelines of registered steps against execution contexts.
///
/// Running takes `&self`; share the orchestrator in an `Arc` to run
/// several contexts concurrently.
pub struct Orchestrator {
    shared: SharedState,
    registry: StepRegistry,
    hooks: Vec<Arc<dyn CycleHook>>,
    config: OrchestratorConfig,
    next_cycle: AtomicU64,
}

impl Orchestrator {
    /// Orchestrator over shared state, with no steps yet.
    pub fn new(shared: &SharedState, config: OrchestratorConfig) -> Self {
        Self {
            shared: shared.clone(),
            registry: StepRegistry::new(),
            hooks: Vec::new(),
            config,
            next_cycle: AtomicU64::new(1),
        }
    }

    /// Register a step under `name`.
    pub fn register(&mut self, name: &str, step: Arc<dyn Step>) -> OrchestratorResult<()> {
        self.registry.register(name, step)
    }

    /// Register a step under its own name.
    pub fn register_step(&mut self, step: Arc<dyn Step>) -> OrchestratorResult<()> {
        let name = step.name().to_string();
        self.registry.register(&name, step)
    }

    /// Define a named pipeline.
    pub fn define_pipeline<S: AsRef<str>>(&mut self, name: &str, steps: &[S]) -> OrchestratorResult<()> {
        self.registry.define_pipeline(name, steps)
    }

    /// Add a cycle-closed hook. Hooks run in registration order.
    pub fn add_hook(&mut self, hook: Arc<dyn CycleHook>) {
        self.hooks.push(hook);
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Fresh context with the next cycle number.
    pub fn new_context(&self, inputs: Vec<CycleInput>) -> ExecutionContext {
        let cycle = self.next_cycle.fetch_add(1, Ordering::Relaxed);
        ExecutionContext::new(cycle, self.shared.clone(), inputs)
    }

    /// Run the given steps in order against `ctx`.
    ///
    /// A fatal step error skips the remaining steps. Non-fatal errors are
    /// recorded and the next step runs. A panicking step counts as a fatal
    /// error. Hooks always run last.
    pub async fn run_pipeline<S: AsRef<str>>(
        &self,
        names: &[S],
        ctx: &mut ExecutionContext,
    ) -> OrchestratorResult<CycleReport> {
        let label = names.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",");
        self.execute(&label, names, ctx).await
    }

    /// Run a pipeline defined with [`define_pipeline`](Self::define_pipeline).
    pub async fn run_named(
        &self,
        pipeline: &str,
        ctx: &mut ExecutionContext,
    ) -> OrchestratorResult<CycleReport> {
        let steps = self
            .registry
            .pipeline(pipeline)
            .ok_or_else(|| OrchestratorError::UnknownPipeline(pipeline.to_string()))?
            .to_vec();
        self.execute(pipeline, &steps, ctx).await
    }

    /// Build a context for `inputs` and run the default pipeline on it.
    pub async fn run_cycle(&self, inputs: Vec<CycleInput>) -> OrchestratorResult<CycleRun> {
        let mut context = self.new_context(inputs);
        let steps = self.config.default_pipeline.clone();
        let report = self.execute("default", &steps, &mut context).await?;
        Ok(CycleRun { report, context })
    }

    async fn execute<S: AsRef<str>>(
        &self,
        label: &str,
        names: &[S],
        ctx: &mut ExecutionContext,
    ) -> OrchestratorResult<CycleReport> {
        let resolved = self.registry.resolve(names)?;
        let cycle = ctx.cycle;
        let span = telemetry::cycle_span(cycle, label);
        let started = Instant::now();
        let mut report = CycleReport::new(cycle, label, ctx.now());

        async {
            let mut remaining = resolved.iter();
            while let Some((name, step)) = remaining.next() {
                let step_span = telemetry::step_span(cycle, name);
                let step_started = Instant::now();
                let result = AssertUnwindSafe(step.run(ctx))
                    .catch_unwind()
                    .instrument(step_span.clone())
                    .await
                    .unwrap_or_else(|payload| panicked(name, payload));
                let elapsed_ms = step_started.elapsed().as_millis() as u64;
                ctx.emit(MetricEvent::StepFinished {
                    step: name.clone(),
                    ok: result.is_ok(),
                    elapsed_ms,
                });

                match result {
                    Ok(outcome) => {
                        telemetry::record_step_result(&step_span, true, outcome.processed, elapsed_ms);
                        debug!(cycle, step = %name, processed = outcome.processed, "step finished");
                        report.steps.push(StepRecord::succeeded(name, outcome, elapsed_ms));
                    }
                    Err(e) => {
                        telemetry::record_step_result(&step_span, false, 0, elapsed_ms);
                        report.steps.push(StepRecord::failed(name, &e, elapsed_ms));
                        if e.is_fatal() {
                            error!(cycle, step = %name, error = %e, "fatal step error, aborting pipeline");
                            report.aborted_by = Some(name.clone());
                            report.skipped = remaining.by_ref().map(|(n, _)| n.clone()).collect();
                            break;
                        }
                        warn!(cycle, step = %name, error = %e, "step failed");
                    }
                }
            }
        }
        .instrument(span.clone())
        .await;

        if ctx.emergency.is_none() {
            ctx.emergency = self.shared.halt.notice();
        }
        report.emergency = ctx.emergency.clone();
        report.finished_at = ctx.now();
        report.delivered = ctx
            .deliveries
            .iter()
            .filter(|d| d.success)
            .count();
        report.dead_lettered = ctx
            .deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::Failed)
            .count();
        report.rejected = ctx.rejections.len();
        report.metric_events = ctx.metrics.len();

        if let Some(notice) = &report.emergency {
            error!(
                cycle,
                record_id = %notice.record_id,
                reason = %notice.reason,
                "system halted: emergency intervention in effect"
            );
        }

        for hook in &self.hooks {
            if let Err(e) = hook.on_cycle_closed(ctx, &report) {
                warn!(cycle, hook = hook.name(), error = %e, "cycle hook failed");
                report.hook_errors.push(format!("{}: {}", hook.name(), e));
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        telemetry::record_cycle_result(&span, report.succeeded(), elapsed_ms);
        info!(
            cycle,
            pipeline = label,
            steps = report.steps.len(),
            delivered = report.delivered,
            rejected = report.rejected,
            elapsed_ms,
            "cycle closed"
        );
        Ok(report)
    }
}

/// Fatal error for a step that panicked.
fn panicked(step: &str, payload: Box<dyn Any + Send>) -> StepResult {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    error!(step, %reason, "step panicked");
    Err(StepError::fatal(step, format!("panicked: {}", reason)))
}
