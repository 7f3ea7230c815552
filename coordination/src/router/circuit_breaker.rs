//! Per-recipient circuit breaker.
//!
//! Tracks consecutive delivery failures per recipient. Once failures reach
//! the threshold the circuit *opens* and the router stops dispatching to
//! that recipient; queued messages wait without consuming retries. After a
//! cooldown the circuit turns *half-open* and traffic is let through again;
//! the next success closes it, the next failure re-opens it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Circuit breaker state for a single recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy: dispatch allowed.
    Closed,
    /// Tripped: dispatch blocked until cooldown expires.
    Open,
    /// Cooldown expired: probing allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker keyed by recipient.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: HashMap<String, u32>,
    last_failure: HashMap<String, DateTime<Utc>>,
    /// Consecutive failures before the circuit opens (0 disables the breaker).
    pub failure_threshold: u32,
    /// Seconds after last failure before Open → HalfOpen.
    pub cooldown_secs: u64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(failure_threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            consecutive_failures: HashMap::new(),
            last_failure: HashMap::new(),
            failure_threshold,
            cooldown_secs,
        }
    }

    /// Record a success: resets the circuit to Closed.
    pub fn record_success(&mut self, recipient: &str) {
        self.consecutive_failures.remove(recipient);
        self.last_failure.remove(recipient);
    }

    /// Record a failure: may trip the circuit to Open.
    pub fn record_failure(&mut self, recipient: &str, now: DateTime<Utc>) {
        let count = self
            .consecutive_failures
            .entry(recipient.to_string())
            .or_insert(0);
        *count += 1;
        self.last_failure.insert(recipient.to_string(), now);
    }

    /// Current state of the circuit for `recipient`.
    pub fn state(&self, recipient: &str, now: DateTime<Utc>) -> CircuitState {
        if self.failure_threshold == 0 {
            return CircuitState::Closed;
        }
        let failures = self.failure_count(recipient);
        if failures < self.failure_threshold {
            return CircuitState::Closed;
        }
        let elapsed = self
            .last_failure
            .get(recipient)
            .map(|last| (now - *last).num_seconds().max(0) as u64)
            .unwrap_or(u64::MAX);
        if elapsed >= self.cooldown_secs {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Whether the recipient may receive traffic (Closed or HalfOpen).
    pub fn is_available(&self, recipient: &str, now: DateTime<Utc>) -> bool {
        !matches!(self.state(recipient, now), CircuitState::Open)
    }

    /// Consecutive failures recorded for `recipient`.
    pub fn failure_count(&self, recipient: &str) -> u32 {
        self.consecutive_failures.get(recipient).copied().unwrap_or(0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, 30)
    }
}
