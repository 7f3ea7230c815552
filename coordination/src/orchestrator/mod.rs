//! Orchestrator: step registry, pipelines, and cycle execution.
//!
//! # Cycle
//!
//! ```text
//! inputs ──► ExecutionContext ──► lifecycle ──► router ──► debate ──► intervention
//!                                      (fatal error: skip the rest)        │
//!                                                                          ▼
//!                                                    cycle-closed hooks (always)
//!                                                                          │
//!                                                                          ▼
//!                                                                     CycleReport
//! ```
//!
//! One context runs through one pipeline at a time; any number of contexts
//! may run concurrently against the same shared state.

pub mod hooks;
pub mod registry;
pub mod report;
pub mod runner;

pub use hooks::{CycleHook, EventHook, HookError, PersistenceHook};
pub use registry::{ResolvedPipeline, StepRegistry};
pub use report::{CycleReport, StepRecord};
pub use runner::{CycleRun, Orchestrator};

/// Error type for registry and pipeline operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("step and pipeline names must not be empty")]
    InvalidName,

    #[error("step already registered: {0}")]
    DuplicateStep(String),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("pipeline has no steps")]
    EmptyPipeline,

    #[error("step '{0}' appears more than once in the pipeline")]
    RepeatedStep(String),

    #[error("step '{step}' depends on '{dependency}', which is not in the pipeline")]
    MissingDependency { step: String, dependency: String },

    #[error("step '{step}' must run after '{dependency}'")]
    DependencyOrder { step: String, dependency: String },
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
