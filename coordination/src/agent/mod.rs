//! Agent lifecycle.
//!
//! Agents move `Registered → Idle → Observing → Deciding → Acting → Idle`,
//! can be deregistered from any state, and are suspended only by the
//! intervention manager.

pub mod coordinator;
pub mod registry;
pub mod state;

pub use coordinator::{
    AdvanceOutcome, HoldReason, LifecycleCommand, LifecycleCoordinator, LifecycleError,
    LifecycleResult, LIFECYCLE_STEP,
};
pub use registry::{
    Agent, AgentCounters, AgentRegistry, PendingInput, SharedAgentRegistry, TaskEvent,
};
pub use state::{AgentState, AgentTransition, LifecycleEvent};
