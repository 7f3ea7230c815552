//! Cycle events for hosts and observers.
//!
//! Hooks publish here once per cycle. Every event goes to a Tokio broadcast
//! channel and, when the bus was built over a
//! [`StateStore`](crate::state::StateStore), to the store first so
//! [`EventHistory`](super::EventHistory) can replay it.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::CoordinationEvent;
use crate::state::{schema::keys, EntityKind, SharedStateStore, StoreError};

/// Events buffered per subscriber before the slowest one lags.
pub const CHANNEL_CAPACITY: usize = 256;

/// Publishing failure. A failed event is not broadcast.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event {event_type} could not be encoded: {reason}")]
    Encode {
        event_type: &'static str,
        reason: String,
    },

    #[error("event {event_type} could not be stored: {source}")]
    Store {
        event_type: &'static str,
        #[source]
        source: StoreError,
    },
}

/// Result of publishing.
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Bus handle shared between the runtime and its hooks.
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast fan-out of coordination events, optionally written to a store first.
pub struct EventBus {
    sender: broadcast::Sender<CoordinationEvent>,
    store: Option<SharedStateStore>,
}

impl EventBus {
    /// Bus that only broadcasts.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            store: None,
        }
    }

    /// Bus that writes each event to `store` before broadcasting it.
    pub fn with_persistence(store: SharedStateStore) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            store: Some(store),
        }
    }

    /// Wrap in an `Arc`.
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Store (when a store is attached) and broadcast.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: CoordinationEvent) -> EventBusResult<()> {
        let event_type = event.event_type();

        if let Some(store) = &self.store {
            let nanos = event.timestamp().timestamp_nanos_opt().unwrap_or(0);
            let key = keys::event(nanos, &CoordinationEvent::new_id());
            let doc = serde_json::to_value(&event).map_err(|e| EventBusError::Encode {
                event_type,
                reason: e.to_string(),
            })?;
            store.put(EntityKind::Event, &key, &doc).map_err(|source| {
                warn!(event_type, cycle = event.cycle(), error = %source, "event not stored");
                EventBusError::Store { event_type, source }
            })?;
        }

        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "event published"),
            Err(_) => debug!(event_type, "event published (no receivers)"),
        }
        Ok(())
    }

    /// Receiver for every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.sender.subscribe()
    }

    /// Receiver that yields only events matching `filter`.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }

    /// Live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Selects events by cycle window, subject, or type. Unset criteria match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Inclusive cycle window.
    pub cycles: Option<(u64, u64)>,
    /// Agent, message, session, record or step id.
    pub subject: Option<String>,
    /// Accepted event types.
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emergency notices only.
    pub fn emergencies() -> Self {
        Self::new().types(&["emergency_raised"])
    }

    /// Events of one cycle.
    pub fn cycle(self, cycle: u64) -> Self {
        self.cycles(cycle, cycle)
    }

    /// Events from `first` to `last`, both included.
    pub fn cycles(mut self, first: u64, last: u64) -> Self {
        self.cycles = Some((first.min(last), first.max(last)));
        self
    }

    /// Events from `first` on.
    pub fn since(self, first: u64) -> Self {
        self.cycles(first, u64::MAX)
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn types(mut self, event_types: &[&str]) -> Self {
        self.event_types = Some(event_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Whether `event` passes every set criterion.
    pub fn matches(&self, event: &CoordinationEvent) -> bool {
        let in_window = self
            .cycles
            .map_or(true, |(first, last)| (first..=last).contains(&event.cycle()));
        let about = self
            .subject
            .as_deref()
            .map_or(true, |subject| event.subject().as_deref() == Some(subject));
        let typed = self
            .event_types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == event.event_type()));
        in_window && about && typed
    }
}

/// Subscription that yields only events passing its filter.
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<CoordinationEvent>,
    filter: EventFilter,
    missed: u64,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<CoordinationEvent>, filter: EventFilter) -> Self {
        Self {
            receiver,
            filter,
            missed: 0,
        }
    }

    /// Next matching event, or `None` once the bus is gone.
    ///
    /// Events dropped because this subscriber lagged are counted in
    /// [`missed`](Self::missed) and skipped.
    pub async fn recv(&mut self) -> Option<CoordinationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                    self.missed += skipped;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events lost to lag so far.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}
