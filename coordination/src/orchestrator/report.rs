//! What one pipeline run did.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contracts::{StepError, StepOutcome};
use crate::state::HaltNotice;

/// Result of one step within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub ok: bool,
    pub processed: usize,
    pub detail: Option<String>,
    /// Error text when the step failed.
    pub error: Option<String>,
    pub fatal: bool,
    pub elapsed_ms: u64,
}

impl StepRecord {
    /// Record of a successful run.
    pub fn succeeded(name: &str, outcome: StepOutcome, elapsed_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            processed: outcome.processed,
            detail: outcome.detail,
            error: None,
            fatal: false,
            elapsed_ms,
        }
    }

    /// Record of a failed run.
    pub fn failed(name: &str, error: &StepError, elapsed_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            ok: false,
            processed: 0,
            detail: None,
            error: Some(error.to_string()),
            fatal: error.is_fatal(),
            elapsed_ms,
        }
    }
}

/// Summary handed to hooks and returned to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    /// Comma-separated step names, or the pipeline name.
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Steps that ran, in order.
    pub steps: Vec<StepRecord>,
    /// Step whose fatal error stopped the pipeline.
    pub aborted_by: Option<String>,
    /// Steps never reached because of a fatal error.
    pub skipped: Vec<String>,
    /// Halt in effect when the cycle closed.
    pub emergency: Option<HaltNotice>,
    pub delivered: usize,
    pub dead_lettered: usize,
    pub rejected: usize,
    pub metric_events: usize,
    /// Hooks that failed, as `name: error`.
    pub hook_errors: Vec<String>,
}

impl CycleReport {
    /// Empty report for a cycle that has just started.
    pub fn new(cycle: u64, pipeline: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle,
            pipeline: pipeline.into(),
            started_at,
            finished_at: started_at,
            steps: Vec::new(),
            aborted_by: None,
            skipped: Vec::new(),
            emergency: None,
            delivered: 0,
            dead_lettered: 0,
            rejected: 0,
            metric_events: 0,
            hook_errors: Vec::new(),
        }
    }

    /// Whether every step ran and succeeded.
    pub fn succeeded(&self) -> bool {
        self.aborted_by.is_none() && self.steps.iter().all(|s| s.ok)
    }

    /// Names of failed steps.
    pub fn failed_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| !s.ok)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Whether the host should stop accepting cycles.
    pub fn is_emergency(&self) -> bool {
        self.emergency.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_status() {
        let mut report = CycleReport::new(1, "default", Utc::now());
        report
            .steps
            .push(StepRecord::succeeded("lifecycle", StepOutcome::processed(2), 1));
        assert!(report.succeeded());

        let err = StepError::failed("router", "transport down");
        report.steps.push(StepRecord::failed("router", &err, 3));
        assert!(!report.succeeded());
        assert_eq!(report.failed_steps(), vec!["router"]);
        assert!(!report.steps[1].fatal);
        assert!(!report.is_emergency());
    }
}
