//! Small traits at the seams between subsystems.
//!
//! - [`Step`]: one unit of a pipeline, run against an execution context.
//! - [`Queryable`]: read access for front ends and dashboards.
//! - [`Escalatable`]: entities whose severity may only rise while open.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::context::ExecutionContext;
use crate::intervention::Severity;

/// Result of a successful step run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    /// Items the step handled this cycle.
    pub processed: usize,
    /// Optional short summary.
    pub detail: Option<String>,
}

impl StepOutcome {
    /// Nothing to do this cycle.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Handled `count` items.
    pub fn processed(count: usize) -> Self {
        Self {
            processed: count,
            detail: None,
        }
    }

    /// Attach a summary.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Step failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Stops the rest of the pipeline.
    #[error("step '{step}' failed fatally: {reason}")]
    Fatal { step: String, reason: String },

    /// Recorded; the pipeline continues.
    #[error("step '{step}' failed: {reason}")]
    Failed { step: String, reason: String },
}

impl StepError {
    /// Fatal failure of `step`.
    pub fn fatal(step: &str, reason: impl Into<String>) -> Self {
        Self::Fatal {
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    /// Recoverable failure of `step`.
    pub fn failed(step: &str, reason: impl Into<String>) -> Self {
        Self::Failed {
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the pipeline must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Result type for step runs
pub type StepResult = Result<StepOutcome, StepError>;

/// One unit of a pipeline.
///
/// A step only touches state through the context it is handed. Holding
/// `&mut ExecutionContext` means at most one step runs per context.
#[async_trait]
pub trait Step: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Steps that must run earlier in any pipeline containing this one.
    fn dependencies(&self) -> &[&'static str] {
        &[]
    }

    /// Run against the cycle's context.
    async fn run(&self, ctx: &mut ExecutionContext) -> StepResult;
}

/// Read access to a subsystem's entities.
pub trait Queryable {
    /// Lookup key.
    type Key: ?Sized;
    /// Snapshot type handed out.
    type View;

    /// Snapshot of one entity.
    fn query(&self, key: &Self::Key) -> Option<Self::View>;

    /// Snapshots of all live entities.
    fn list(&self) -> Vec<Self::View>;
}

/// An entity with a severity that only moves upward.
pub trait Escalatable {
    /// Current severity.
    fn severity(&self) -> Severity;

    /// Raise the severity. Returns `false`, changing nothing, unless `to`
    /// is strictly higher and the entity is still open.
    fn escalate_to(&mut self, to: Severity, reason: &str, now: DateTime<Utc>) -> bool;
}
