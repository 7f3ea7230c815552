//! Tracing span helpers for the coordination pipeline.
//!
//! Field names use dot notation so spans export cleanly to OpenTelemetry
//! collectors.
//!
//! # Span Hierarchy
//!
//! ```text
//! coord.cycle                  (one per pipeline run)
//!   └─ coord.step              (one per step)
//!       └─ coord.dispatch      (one transport call in the router step)
//! ```

use tracing::Span;
use tracing_subscriber::EnvFilter;

// ── Span Name Constants ──────────────────────────────────────────────

/// One pipeline run against one execution context.
pub const SPAN_CYCLE: &str = "coord.cycle";

/// One step within a cycle.
pub const SPAN_STEP: &str = "coord.step";

/// One delivery attempt.
pub const SPAN_DISPATCH: &str = "coord.dispatch";

// ── Field Name Constants ─────────────────────────────────────────────

pub const FIELD_CYCLE: &str = "coord.cycle.number";
pub const FIELD_PIPELINE: &str = "coord.pipeline";
pub const FIELD_STEP: &str = "coord.step.name";
pub const FIELD_MESSAGE_ID: &str = "coord.message.id";
pub const FIELD_RECIPIENT: &str = "coord.message.recipient";
pub const FIELD_SUCCESS: &str = "coord.success";
pub const FIELD_PROCESSED: &str = "coord.processed";
pub const FIELD_DURATION_MS: &str = "coord.duration_ms";

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "coordination=info";

// ── Span Builders ────────────────────────────────────────────────────

/// Create a span for one cycle.
///
/// Fields filled later via [`record_cycle_result`]: success and duration.
pub fn cycle_span(cycle: u64, pipeline: &str) -> Span {
    tracing::info_span!(
        "coord.cycle",
        "coord.cycle.number" = cycle,
        "coord.pipeline" = %pipeline,
        "coord.success" = tracing::field::Empty,
        "coord.duration_ms" = tracing::field::Empty,
    )
}

/// Record the outcome of a cycle.
pub fn record_cycle_result(span: &Span, success: bool, duration_ms: u64) {
    span.record(FIELD_SUCCESS, success);
    span.record(FIELD_DURATION_MS, duration_ms);
}

/// Create a span for one step.
pub fn step_span(cycle: u64, step: &str) -> Span {
    tracing::debug_span!(
        "coord.step",
        "coord.cycle.number" = cycle,
        "coord.step.name" = %step,
        "coord.success" = tracing::field::Empty,
        "coord.processed" = tracing::field::Empty,
        "coord.duration_ms" = tracing::field::Empty,
    )
}

/// Record the outcome of a step.
pub fn record_step_result(span: &Span, success: bool, processed: usize, duration_ms: u64) {
    span.record(FIELD_SUCCESS, success);
    span.record(FIELD_PROCESSED, processed as u64);
    span.record(FIELD_DURATION_MS, duration_ms);
}

/// Create a span for one transport call.
pub fn dispatch_span(message_id: &str, recipient: &str) -> Span {
    tracing::debug_span!(
        "coord.dispatch",
        "coord.message.id" = %message_id,
        "coord.message.recipient" = %recipient,
    )
}

/// Install the stderr `fmt` subscriber with an `RUST_LOG` filter.
///
/// Returns `false` when a global subscriber was already set.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
