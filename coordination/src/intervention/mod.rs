//! Intervention Manager
//!
//! Watches health signals and escalates through four severities, each
//! adding an action on top of the previous ones. Actions are undone in
//! reverse order when the condition clears or the record is cancelled.

pub mod manager;
pub mod record;
pub mod signals;
pub mod thresholds;

pub use manager::{
    ActionResult, InterventionError, InterventionManager, InterventionResult, INTERVENTION_STEP,
};
pub use record::{
    InterventionAction, InterventionRecord, ResolutionStatus, Severity, SeverityChange,
};
pub use signals::{
    builtin_samples, merge_samples, ConditionKey, HealthSignalSource, Scope, SignalKind,
    SignalSample, StaticSignalSource,
};
pub use thresholds::{ThresholdTable, Thresholds};
