//! Coordination core for multi-agent swarms.
//!
//! This library provides:
//! - A message router with priority queues, acknowledgements, retries and
//!   a dead-letter list
//! - An agent lifecycle state machine with intervention-driven suspension
//! - A debate engine that turns arguments and votes into decisions
//! - An intervention manager that escalates on health signals
//! - An orchestrator that runs all four as steps of one pipeline per cycle
//!
//! # Cycle
//!
//! Every cycle gets its own [`ExecutionContext`]. The orchestrator hands it
//! to each step of the pipeline in order (`lifecycle → router → debate →
//! intervention` by default); steps read the cycle's inputs from it and
//! write their outcomes back. Cycle-closed hooks then persist changed state
//! and publish [`CoordinationEvent`]s on the [`EventBus`].
//!
//! # Usage
//!
//! ```ignore
//! use coordination::{CoordinationConfig, CoordinationRuntime, AgentId, LifecycleEvent};
//!
//! let runtime = CoordinationRuntime::builder(CoordinationConfig::default()).build()?;
//! runtime.lifecycle().register(AgentId::from("w1"), Default::default())?;
//! runtime.lifecycle().advance("w1", LifecycleEvent::Activate)?;
//! let run = runtime.run_cycle(Vec::new()).await?;
//! assert!(run.report.succeeded());
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod agent;
pub mod clock;
pub mod config;
pub mod context;
pub mod contracts;
pub mod debate;
pub mod events;
pub mod ids;
pub mod intervention;
pub mod metrics;
pub mod orchestrator;
pub mod router;
pub mod runtime;
pub mod state;
pub mod telemetry;

// Re-export identifiers and time
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use ids::{AgentId, CorrelationId, MessageId, RecordId, SessionId};

// Re-export the shared context and seams
pub use context::{CycleInput, ExecutionContext};
pub use contracts::{Escalatable, Queryable, Step, StepError, StepOutcome, StepResult};
pub use metrics::MetricEvent;

// Re-export subsystem entry points
pub use agent::{AgentState, LifecycleCoordinator, LifecycleError, LifecycleEvent};
pub use debate::{ConsensusStrategy, DebateCommand, DebateEngine, DebateError, DebatePhase, Decision};
pub use intervention::{
    InterventionAction, InterventionManager, InterventionRecord, Severity, SignalKind, SignalSample,
};
pub use router::{
    DeliveryStatus, DeliveryTransport, LoopbackTransport, Message, MessageRouter, Priority,
    Recipient, RouterError,
};

// Re-export orchestration and runtime
pub use config::{ConfigError, CoordinationConfig};
pub use events::{CoordinationEvent, EventBus, EventFilter, SharedEventBus};
pub use orchestrator::{CycleReport, CycleRun, Orchestrator, OrchestratorError, StepRegistry};
pub use runtime::{CoordinationRuntime, RuntimeBuilder, RuntimeError};
pub use state::{HaltNotice, SharedState, StateStore};
