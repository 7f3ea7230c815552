//! Wiring of the coordination subsystems into one runnable unit.
//!
//! [`CoordinationRuntime`] owns the shared state, the four subsystem steps,
//! the orchestrator with its default pipeline, the event bus, and the state
//! store. Hosts and tests build one through [`RuntimeBuilder`].

use std::sync::Arc;
use tracing::info;

use crate::agent::{Agent, LifecycleCoordinator};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{CoordinationConfig, ConfigError};
use crate::context::CycleInput;
use crate::debate::DebateEngine;
use crate::events::{EventBus, SharedEventBus};
use crate::intervention::{HealthSignalSource, InterventionManager, InterventionRecord};
use crate::orchestrator::{
    CycleRun, EventHook, Orchestrator, OrchestratorError, OrchestratorResult, PersistenceHook,
};
use crate::router::{DeliveryTransport, LoopbackTransport, MessageRouter};
use crate::state::{
    load_all, lock, JsonFileStore, MemoryStore, SharedState, SharedStateStore, StoreError,
};

/// Error type for building a runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

/// Result type for runtime construction
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Builder for [`CoordinationRuntime`].
pub struct RuntimeBuilder {
    config: CoordinationConfig,
    clock: Option<SharedClock>,
    transport: Option<Arc<dyn DeliveryTransport>>,
    store: Option<SharedStateStore>,
    signal_source: Option<Arc<dyn HealthSignalSource>>,
}

impl RuntimeBuilder {
    /// Time source; the system clock by default.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Delivery transport; a [`LoopbackTransport`] by default.
    pub fn transport(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// State store; otherwise a JSON file store when `state.dir` is set,
    /// else an in-memory store.
    pub fn store(mut self, store: SharedStateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// External health signals for the intervention manager.
    pub fn signal_source(mut self, source: Arc<dyn HealthSignalSource>) -> Self {
        self.signal_source = Some(source);
        self
    }

    /// Validate the configuration and assemble the runtime.
    ///
    /// Agents and open intervention records found in the store are
    /// restored. Suspensions whose record did not survive are cleared.
    pub fn build(self) -> RuntimeResult<CoordinationRuntime> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let shared = SharedState::with_archive_capacity(clock, config.state.archive_capacity);

        let store: SharedStateStore = match (self.store, &config.state.dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => JsonFileStore::open(dir)?.shared(),
            (None, None) => MemoryStore::new().shared(),
        };

        let restored: Vec<Agent> = load_all(store.as_ref())?;
        if !restored.is_empty() {
            let mut agents = lock(&shared.agents);
            for agent in restored.iter().cloned() {
                agents.restore(agent);
            }
            info!(count = restored.len(), "agents restored from state store");
        }

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LoopbackTransport::new()));

        let lifecycle = Arc::new(LifecycleCoordinator::new(&shared, config.lifecycle.clone()));
        let router = Arc::new(MessageRouter::new(&shared, transport, config.router.clone()));
        let debates = Arc::new(DebateEngine::new(&shared, config.debate.clone()));
        let mut manager = InterventionManager::new(&shared, config.intervention.clone());
        if let Some(source) = self.signal_source {
            manager = manager.with_source(source);
        }
        let records: Vec<InterventionRecord> = load_all(store.as_ref())?;
        let reopened = manager.restore(records);
        let released = manager.release_orphaned_suspensions();
        if reopened > 0 || !released.is_empty() {
            info!(
                records = reopened,
                released = released.len(),
                "interventions restored from state store"
            );
        }
        let interventions = Arc::new(manager);

        let bus = EventBus::with_persistence(store.clone()).shared();

        let mut orchestrator = Orchestrator::new(&shared, config.orchestrator.clone());
        orchestrator.register_step(lifecycle.clone())?;
        orchestrator.register_step(router.clone())?;
        orchestrator.register_step(debates.clone())?;
        orchestrator.register_step(interventions.clone())?;
        orchestrator.define_pipeline("default", &config.orchestrator.default_pipeline)?;
        orchestrator.add_hook(Arc::new(PersistenceHook::new(&shared, store.clone())));
        orchestrator.add_hook(Arc::new(EventHook::new(bus.clone())));

        info!(
            pipeline = ?config.orchestrator.default_pipeline,
            agents = restored.len(),
            "coordination runtime ready"
        );

        Ok(CoordinationRuntime {
            config,
            shared,
            store,
            bus,
            lifecycle,
            router,
            debates,
            interventions,
            orchestrator,
        })
    }
}

/// Every coordination subsystem, wired into one orchestrator.
pub struct CoordinationRuntime {
    config: CoordinationConfig,
    shared: SharedState,
    store: SharedStateStore,
    bus: SharedEventBus,
    lifecycle: Arc<LifecycleCoordinator>,
    router: Arc<MessageRouter>,
    debates: Arc<DebateEngine>,
    interventions: Arc<InterventionManager>,
    orchestrator: Orchestrator,
}

impl CoordinationRuntime {
    /// Start building a runtime from `config`.
    pub fn builder(config: CoordinationConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            clock: None,
            transport: None,
            store: None,
            signal_source: None,
        }
    }

    /// Run one cycle of the default pipeline.
    pub async fn run_cycle(&self, inputs: Vec<CycleInput>) -> OrchestratorResult<CycleRun> {
        self.orchestrator.run_cycle(inputs).await
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn lifecycle(&self) -> &LifecycleCoordinator {
        &self.lifecycle
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn debates(&self) -> &DebateEngine {
        &self.debates
    }

    pub fn interventions(&self) -> &InterventionManager {
        &self.interventions
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Mutable access for registering extra steps, pipelines, or hooks.
    pub fn orchestrator_mut(&mut self) -> &mut Orchestrator {
        &mut self.orchestrator
    }
}
