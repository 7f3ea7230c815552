//! Health signals: what the intervention manager watches.
//!
//! Built-in signals are read from the shared state every cycle: router
//! dead-letter size and queue depth, and per-agent backlog, time stuck in a
//! working state, and error rate. External samples come from a
//! [`HealthSignalSource`] or from `Health` cycle inputs. A condition with no
//! sample in a cycle counts as cleared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::agent::AgentState;
use crate::ids::AgentId;
use crate::state::{lock, SharedState};

/// Watched health signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Messages in the router dead-letter list.
    DeadLetterDepth,
    /// Messages waiting for dispatch.
    QueueDepth,
    /// Inputs waiting for one agent.
    AgentBacklog,
    /// Seconds an agent has stayed in one working state.
    StuckSeconds,
    /// Failed over finished cycles for one agent.
    ErrorRate,
}

impl SignalKind {
    /// All signal kinds.
    pub const ALL: [SignalKind; 5] = [
        Self::DeadLetterDepth,
        Self::QueueDepth,
        Self::AgentBacklog,
        Self::StuckSeconds,
        Self::ErrorRate,
    ];
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeadLetterDepth => write!(f, "dead_letter_depth"),
            Self::QueueDepth => write!(f, "queue_depth"),
            Self::AgentBacklog => write!(f, "agent_backlog"),
            Self::StuckSeconds => write!(f, "stuck_seconds"),
            Self::ErrorRate => write!(f, "error_rate"),
        }
    }
}

/// What a signal is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The coordination core as a whole.
    System,
    /// One agent.
    Agent(AgentId),
}

impl Scope {
    /// Agent targeted by agent-level actions.
    pub fn agent(&self) -> Option<&AgentId> {
        match self {
            Self::System => None,
            Self::Agent(id) => Some(id),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Agent(id) => write!(f, "agent:{}", id),
        }
    }
}

/// Identity of a watched condition: one signal on one scope.
pub type ConditionKey = (SignalKind, Scope);

/// One observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    /// Signal observed.
    pub kind: SignalKind,
    /// Subject of the observation.
    pub scope: Scope,
    /// Observed value.
    pub value: f64,
}

impl SignalSample {
    /// A sample of `kind` on `scope`.
    pub fn new(kind: SignalKind, scope: Scope, value: f64) -> Self {
        Self { kind, scope, value }
    }

    /// Condition this sample belongs to.
    pub fn key(&self) -> ConditionKey {
        (self.kind, self.scope.clone())
    }
}

/// External provider of raw health samples.
pub trait HealthSignalSource: Send + Sync {
    /// Samples observed at `now`.
    fn sample(&self, now: DateTime<Utc>) -> Vec<SignalSample>;

    /// Source name for logs.
    fn name(&self) -> &str {
        "signal_source"
    }
}

/// Source returning whatever samples were last set.
#[derive(Debug, Default)]
pub struct StaticSignalSource {
    samples: Mutex<Vec<SignalSample>>,
}

impl StaticSignalSource {
    /// Source with no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the reported samples.
    pub fn set(&self, samples: Vec<SignalSample>) {
        *lock(&self.samples) = samples;
    }

    /// Stop reporting anything.
    pub fn clear(&self) {
        lock(&self.samples).clear();
    }
}

impl HealthSignalSource for StaticSignalSource {
    fn sample(&self, _now: DateTime<Utc>) -> Vec<SignalSample> {
        lock(&self.samples).clone()
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Read the built-in signals from shared state.
///
/// Agents are sampled while active or suspended; an agent with fewer than
/// `min_error_samples` finished cycles reports an error rate of zero.
/// A suspended agent cannot consume inputs or finish cycles, so all of its
/// signals read as zero; it is measured again once the suspension clears.
pub fn builtin_samples(
    shared: &SharedState,
    now: DateTime<Utc>,
    min_error_samples: u64,
) -> Vec<SignalSample> {
    let mut samples = Vec::new();
    {
        let queue = lock(&shared.queue);
        samples.push(SignalSample::new(
            SignalKind::DeadLetterDepth,
            Scope::System,
            queue.dead_letter_len() as f64,
        ));
        samples.push(SignalSample::new(
            SignalKind::QueueDepth,
            Scope::System,
            queue.depth() as f64,
        ));
    }

    let agents = lock(&shared.agents);
    for agent in agents.snapshot() {
        if !(agent.state.is_active() || agent.state == AgentState::Suspended) {
            continue;
        }
        let scope = Scope::Agent(agent.id.clone());
        let suspended = agent.state == AgentState::Suspended;
        let backlog = if suspended { 0.0 } else { agent.backlog() as f64 };
        samples.push(SignalSample::new(SignalKind::AgentBacklog, scope.clone(), backlog));

        let stuck = if agent.state.is_working() {
            agent.seconds_in_state(now) as f64
        } else {
            0.0
        };
        samples.push(SignalSample::new(SignalKind::StuckSeconds, scope.clone(), stuck));

        let finished = agent.counters.cycles_completed + agent.counters.errors;
        let rate = if !suspended && finished >= min_error_samples {
            agent.counters.error_rate().unwrap_or(0.0)
        } else {
            0.0
        };
        samples.push(SignalSample::new(SignalKind::ErrorRate, scope, rate));
    }
    samples
}

/// Merge samples per condition, keeping the highest value.
pub fn merge_samples(samples: impl IntoIterator<Item = SignalSample>) -> Vec<SignalSample> {
    let mut merged: BTreeMap<ConditionKey, SignalSample> = BTreeMap::new();
    for sample in samples {
        merged
            .entry(sample.key())
            .and_modify(|kept| {
                if sample.value > kept.value {
                    kept.value = sample.value;
                }
            })
            .or_insert(sample);
    }
    merged.into_values().collect()
}
