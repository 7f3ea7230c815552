//! Per-signal severity thresholds.

use serde::{Deserialize, Serialize};

use super::record::Severity;
use super::signals::SignalKind;

/// Lower bounds of each severity for one signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: f64,
    pub degraded: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl Thresholds {
    /// Thresholds from the four bounds, lowest first.
    pub const fn new(warning: f64, degraded: f64, critical: f64, emergency: f64) -> Self {
        Self {
            warning,
            degraded,
            critical,
            emergency,
        }
    }

    /// Severity of `value`, or `None` below the warning bound.
    pub fn classify(&self, value: f64) -> Option<Severity> {
        if value >= self.emergency {
            Some(Severity::Emergency)
        } else if value >= self.critical {
            Some(Severity::Critical)
        } else if value >= self.degraded {
            Some(Severity::Degraded)
        } else if value >= self.warning {
            Some(Severity::Warning)
        } else {
            None
        }
    }

    /// Check that the bounds are finite and non-decreasing.
    pub fn validate(&self) -> Result<(), String> {
        let bounds = [self.warning, self.degraded, self.critical, self.emergency];
        if bounds.iter().any(|b| !b.is_finite()) {
            return Err(format!("thresholds must be finite: {:?}", bounds));
        }
        if bounds.windows(2).any(|w| w[0] > w[1]) {
            return Err(format!("thresholds must not decrease: {:?}", bounds));
        }
        Ok(())
    }
}

/// Thresholds for every watched signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    pub dead_letter_depth: Thresholds,
    pub queue_depth: Thresholds,
    pub agent_backlog: Thresholds,
    pub stuck_seconds: Thresholds,
    pub error_rate: Thresholds,
}

impl ThresholdTable {
    /// Thresholds for one signal.
    pub fn get(&self, kind: SignalKind) -> &Thresholds {
        match kind {
            SignalKind::DeadLetterDepth => &self.dead_letter_depth,
            SignalKind::QueueDepth => &self.queue_depth,
            SignalKind::AgentBacklog => &self.agent_backlog,
            SignalKind::StuckSeconds => &self.stuck_seconds,
            SignalKind::ErrorRate => &self.error_rate,
        }
    }

    /// Severity of a value of `kind`.
    pub fn classify(&self, kind: SignalKind, value: f64) -> Option<Severity> {
        self.get(kind).classify(value)
    }

    /// Validate every row.
    pub fn validate(&self) -> Result<(), String> {
        for kind in SignalKind::ALL {
            self.get(kind)
                .validate()
                .map_err(|e| format!("{}: {}", kind, e))?;
        }
        Ok(())
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            dead_letter_depth: Thresholds::new(1.0, 5.0, 20.0, 100.0),
            queue_depth: Thresholds::new(500.0, 1_000.0, 5_000.0, 10_000.0),
            agent_backlog: Thresholds::new(10.0, 25.0, 50.0, 200.0),
            stuck_seconds: Thresholds::new(60.0, 300.0, 900.0, 3_600.0),
            error_rate: Thresholds::new(0.2, 0.4, 0.6, 0.9),
        }
    }
}
