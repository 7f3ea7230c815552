//! Shared coordination state and its persistence.
//!
//! [`SharedState`] is the set of long-lived structures an execution context
//! points at: the agent registry, the router queue, the open debate and
//! intervention tables, and the system halt switch. The registry and queue
//! are single-writer structures behind a `Mutex`; sessions and records sit in
//! [`SessionTable`]s so distinct ids never contend.
//!
//! # Persistence
//!
//! The [`StateStore`] trait stores JSON documents per [`EntityKind`]:
//!
//! - `agents`: agent records
//! - `messages`: delivered and dead-lettered messages
//! - `debates`: resolved and abandoned sessions
//! - `interventions`: closed and cancelled records
//! - `events`: coordination event history
//!
//! Backends: [`MemoryStore`], [`JsonFileStore`], and `RocksStore` behind the
//! `heavy-state` feature.

pub mod halt;
pub mod schema;
pub mod store;
pub mod table;

#[cfg(feature = "heavy-state")]
pub mod rocks;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::agent::{AgentRegistry, SharedAgentRegistry};
use crate::clock::SharedClock;
use crate::debate::DebateSession;
use crate::intervention::InterventionRecord;
use crate::router::{MessageQueue, SharedMessageQueue};

pub use halt::{HaltNotice, HaltSwitch};
pub use schema::EntityKind;
pub use store::{
    load, load_all, save, JsonFileStore, MemoryStore, Persist, SharedStateStore, StateStore,
    StoreError, StoreResult,
};
pub use table::SessionTable;

#[cfg(feature = "heavy-state")]
pub use rocks::RocksStore;

/// Handles to every long-lived coordination structure.
#[derive(Clone)]
pub struct SharedState {
    /// Agent registry.
    pub agents: SharedAgentRegistry,
    /// Router queue, in-flight map and dead letters.
    pub queue: SharedMessageQueue,
    /// Open debate sessions.
    pub debates: Arc<SessionTable<DebateSession>>,
    /// Open intervention records.
    pub interventions: Arc<SessionTable<InterventionRecord>>,
    /// System halt switch.
    pub halt: Arc<HaltSwitch>,
    /// Time source.
    pub clock: SharedClock,
}

impl SharedState {
    /// Fresh empty state.
    pub fn new(clock: SharedClock) -> Self {
        Self::with_archive_capacity(clock, table::DEFAULT_ARCHIVE_CAPACITY)
    }

    /// Fresh empty state keeping `archive_capacity` closed sessions and records.
    pub fn with_archive_capacity(clock: SharedClock, archive_capacity: usize) -> Self {
        Self {
            agents: Arc::new(Mutex::new(AgentRegistry::new())),
            queue: Arc::new(Mutex::new(MessageQueue::new())),
            debates: Arc::new(SessionTable::with_capacity(archive_capacity)),
            interventions: Arc::new(SessionTable::with_capacity(archive_capacity)),
            halt: Arc::new(HaltSwitch::new()),
            clock,
        }
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("debates", &self.debates.len())
            .field("interventions", &self.interventions.len())
            .field("halted", &self.halt.is_raised())
            .finish_non_exhaustive()
    }
}

/// Lock a mutex, recovering the data if a writer panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
