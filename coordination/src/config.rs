//! Configuration for the coordination core.
//!
//! Every section defaults sensibly, so an empty TOML file is a valid
//! configuration. Values are resolved in order:
//!
//! 1. Defaults
//! 2. TOML file (`--config`)
//! 3. `COORD_*` environment variables
//!
//! ```toml
//! [router]
//! delivery_timeout_ms = 5000
//!
//! [router.retry]
//! max_retries = 3
//!
//! [debate]
//! quorum_fraction = 0.5
//! strategy = { kind = "majority" }
//!
//! [intervention.thresholds.agent_backlog]
//! warning = 10.0
//! degraded = 25.0
//! critical = 50.0
//! emergency = 200.0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::agent::LIFECYCLE_STEP;
use crate::debate::{ConsensusStrategy, DEBATE_STEP};
use crate::intervention::{ThresholdTable, INTERVENTION_STEP};
use crate::router::{RetryPolicy, ROUTER_STEP};
use crate::state::table::DEFAULT_ARCHIVE_CAPACITY;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    Override { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Message router settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Backoff between delivery attempts.
    pub retry: RetryPolicy,
    /// Upper bound on one transport call.
    pub delivery_timeout_ms: u64,
    /// How long an accepted correlated message may wait for its ack.
    pub ack_timeout_ms: u64,
    /// Messages dispatched per step run.
    pub dispatch_batch: usize,
    /// Enqueue is refused beyond this many pending messages.
    pub max_queue_depth: usize,
    /// Settled correlation ids remembered for duplicate detection.
    pub ack_history: usize,
    /// Consecutive failures that open a recipient's circuit (0 disables).
    pub breaker_failure_threshold: u32,
    /// Seconds an open circuit waits before a trial delivery.
    pub breaker_cooldown_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            delivery_timeout_ms: 5_000,
            ack_timeout_ms: 30_000,
            dispatch_batch: 64,
            max_queue_depth: 10_000,
            ack_history: 10_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
        }
    }
}

/// Lifecycle coordinator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Inputs queued per agent before new ones are refused.
    pub max_pending_inputs: usize,
    /// Transitions kept per agent.
    pub transition_history: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_pending_inputs: 1_024,
            transition_history: 256,
        }
    }
}

/// Debate engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebateConfig {
    /// Share of participants needed to vote or argue, rounded up.
    pub quorum_fraction: f64,
    /// Seconds the argument phase stays open.
    pub argument_window_secs: u64,
    /// Seconds the voting phase stays open.
    pub voting_window_secs: u64,
    /// Rule turning a tally into a decision.
    pub strategy: ConsensusStrategy,
    /// Participants a session needs (never below two).
    pub min_participants: usize,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            quorum_fraction: 0.5,
            argument_window_secs: 300,
            voting_window_secs: 120,
            strategy: ConsensusStrategy::default(),
            min_participants: 2,
        }
    }
}

/// Intervention manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterventionConfig {
    /// Severity bounds per signal.
    pub thresholds: ThresholdTable,
    /// Finished cycles before an agent's error rate is trusted.
    pub error_rate_min_samples: u64,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdTable::default(),
            error_rate_min_samples: 5,
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Steps run by `run_cycle`, in order.
    pub default_pipeline: Vec<String>,
    /// Milliseconds between cycles in the host loop.
    pub cycle_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_pipeline: [LIFECYCLE_STEP, ROUTER_STEP, DEBATE_STEP, INTERVENTION_STEP]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            cycle_interval_ms: 1_000,
        }
    }
}

/// Shared state settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Closed sessions and records kept in memory.
    pub archive_capacity: usize,
    /// Directory of the JSON file store; in-memory when unset.
    pub dir: Option<PathBuf>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            archive_capacity: DEFAULT_ARCHIVE_CAPACITY,
            dir: None,
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub router: RouterConfig,
    pub lifecycle: LifecycleConfig,
    pub debate: DebateConfig,
    pub intervention: InterventionConfig,
    pub orchestrator: OrchestratorConfig,
    pub state: StateConfig,
}

impl CoordinationConfig {
    /// Load from a TOML file, apply `COORD_*` overrides, and validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `COORD_*` overrides, validated.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without overrides or validation.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides read through `lookup`.
    ///
    /// Recognised keys:
    /// `COORD_DELIVERY_TIMEOUT_MS`, `COORD_ACK_TIMEOUT_MS`,
    /// `COORD_MAX_RETRIES`, `COORD_MAX_QUEUE_DEPTH`,
    /// `COORD_QUORUM_FRACTION`, `COORD_ARGUMENT_WINDOW_SECS`,
    /// `COORD_VOTING_WINDOW_SECS`, `COORD_CYCLE_INTERVAL_MS`,
    /// `COORD_STATE_DIR`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> ConfigResult<T> {
            value.trim().parse().map_err(|_| ConfigError::Override {
                key: key.to_string(),
                value,
            })
        }

        if let Some(v) = lookup("COORD_DELIVERY_TIMEOUT_MS") {
            self.router.delivery_timeout_ms = parse("COORD_DELIVERY_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("COORD_ACK_TIMEOUT_MS") {
            self.router.ack_timeout_ms = parse("COORD_ACK_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("COORD_MAX_RETRIES") {
            self.router.retry.max_retries = parse("COORD_MAX_RETRIES", v)?;
        }
        if let Some(v) = lookup("COORD_MAX_QUEUE_DEPTH") {
            self.router.max_queue_depth = parse("COORD_MAX_QUEUE_DEPTH", v)?;
        }
        if let Some(v) = lookup("COORD_QUORUM_FRACTION") {
            self.debate.quorum_fraction = parse("COORD_QUORUM_FRACTION", v)?;
        }
        if let Some(v) = lookup("COORD_ARGUMENT_WINDOW_SECS") {
            self.debate.argument_window_secs = parse("COORD_ARGUMENT_WINDOW_SECS", v)?;
        }
        if let Some(v) = lookup("COORD_VOTING_WINDOW_SECS") {
            self.debate.voting_window_secs = parse("COORD_VOTING_WINDOW_SECS", v)?;
        }
        if let Some(v) = lookup("COORD_CYCLE_INTERVAL_MS") {
            self.orchestrator.cycle_interval_ms = parse("COORD_CYCLE_INTERVAL_MS", v)?;
        }
        if let Some(dir) = lookup("COORD_STATE_DIR") {
            self.state.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Reject values the subsystems cannot work with.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        self.router
            .retry
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("router.retry: {}", e)))?;
        if self.router.delivery_timeout_ms == 0 {
            return invalid("router.delivery_timeout_ms must be positive".to_string());
        }
        if self.router.dispatch_batch == 0 {
            return invalid("router.dispatch_batch must be positive".to_string());
        }
        if self.router.max_queue_depth == 0 {
            return invalid("router.max_queue_depth must be positive".to_string());
        }
        if self.lifecycle.max_pending_inputs == 0 {
            return invalid("lifecycle.max_pending_inputs must be positive".to_string());
        }

        let q = self.debate.quorum_fraction;
        if !(q > 0.0 && q <= 1.0) {
            return invalid(format!("debate.quorum_fraction must be in (0, 1], got {}", q));
        }
        if self.debate.argument_window_secs == 0 || self.debate.voting_window_secs == 0 {
            return invalid("debate windows must be positive".to_string());
        }
        self.debate
            .strategy
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("debate.strategy: {}", e)))?;

        self.intervention
            .thresholds
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("intervention.thresholds.{}", e)))?;

        if self.orchestrator.default_pipeline.is_empty() {
            return invalid("orchestrator.default_pipeline must not be empty".to_string());
        }
        if self.orchestrator.cycle_interval_ms == 0 {
            return invalid("orchestrator.cycle_interval_ms must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_toml_is_default() {
        let config = CoordinationConfig::from_toml_str("").unwrap();
        assert_eq!(config, CoordinationConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config = CoordinationConfig::from_toml_str(
            r#"
            [router]
            delivery_timeout_ms = 250

            [router.retry]
            max_retries = 7

            [debate]
            strategy = { kind = "supermajority", threshold = 0.75 }

            [intervention.thresholds.queue_depth]
            warning = 1.0
            degraded = 2.0
            critical = 3.0
            emergency = 4.0
            "#,
        )
        .unwrap();
        assert_eq!(config.router.delivery_timeout_ms, 250);
        assert_eq!(config.router.retry.max_retries, 7);
        assert_eq!(config.router.retry.initial_backoff_ms, 500);
        assert_eq!(
            config.debate.strategy,
            ConsensusStrategy::Supermajority { threshold: 0.75 }
        );
        assert_eq!(config.intervention.thresholds.queue_depth.critical, 3.0);
        assert_eq!(config.intervention.thresholds.agent_backlog.warning, 10.0);
        assert_eq!(config.orchestrator.default_pipeline.len(), 4);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("COORD_MAX_RETRIES", "9"),
            ("COORD_QUORUM_FRACTION", "0.75"),
            ("COORD_STATE_DIR", "/tmp/coord"),
        ]
        .into_iter()
        .collect();
        let mut config = CoordinationConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.router.retry.max_retries, 9);
        assert_eq!(config.debate.quorum_fraction, 0.75);
        assert_eq!(config.state.dir, Some(PathBuf::from("/tmp/coord")));
    }

    #[test]
    fn test_bad_override() {
        let mut config = CoordinationConfig::default();
        let err = config
            .apply_overrides(|k| (k == "COORD_ACK_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Override { ref key, .. } if key == "COORD_ACK_TIMEOUT_MS"));
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = CoordinationConfig::default();
        config.debate.quorum_fraction = 0.0;
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig::default();
        config.router.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig::default();
        config.intervention.thresholds.error_rate.critical = 0.1;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("error_rate"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coord.toml");
        std::fs::write(&path, "[orchestrator]\ncycle_interval_ms = 20\n").unwrap();
        let config = CoordinationConfig::load(&path).unwrap();
        assert_eq!(config.orchestrator.cycle_interval_ms, 20);

        let missing = CoordinationConfig::load(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
