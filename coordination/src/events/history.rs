//! Event history and replay
//!
//! Reads events persisted by the bus back from the state store. Keys are
//! prefixed with a zero-padded timestamp, so store order is time order.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::bus::EventFilter;
use super::types::CoordinationEvent;
use crate::state::{EntityKind, SharedStateStore};

/// Error type for history operations
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Event parsing error: {0}")]
    ParseError(String),
}

/// Result type for history operations
pub type HistoryResult<T> = Result<T, HistoryError>;

/// Persisted event reader
pub struct EventHistory {
    store: SharedStateStore,
}

impl EventHistory {
    /// Create a new event history reader
    pub fn new(store: SharedStateStore) -> Self {
        Self { store }
    }

    /// Every stored event, oldest first
    pub fn all(&self) -> HistoryResult<Vec<CoordinationEvent>> {
        self.collect(|_| true)
    }

    /// Events timestamped within `[start, end]`
    pub fn between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HistoryResult<Vec<CoordinationEvent>> {
        self.collect(|e| e.timestamp() >= start && e.timestamp() <= end)
    }

    /// Stored events matching a filter
    pub fn matching(&self, filter: &EventFilter) -> HistoryResult<Vec<CoordinationEvent>> {
        self.collect(|e| filter.matches(e))
    }

    fn collect(
        &self,
        keep: impl Fn(&CoordinationEvent) -> bool,
    ) -> HistoryResult<Vec<CoordinationEvent>> {
        let ids = self
            .store
            .list(EntityKind::Event)
            .map_err(|e| HistoryError::StoreError(e.to_string()))?;

        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(doc) = self
                .store
                .get(EntityKind::Event, &id)
                .map_err(|e| HistoryError::StoreError(e.to_string()))?
            else {
                continue;
            };
            let event: CoordinationEvent =
                serde_json::from_value(doc).map_err(|e| HistoryError::ParseError(e.to_string()))?;
            if keep(&event) {
                events.push(event);
            }
        }
        debug!(count = events.len(), "events read from history");
        Ok(events)
    }

    /// Replay matching events through a callback
    pub async fn replay<F, Fut>(&self, filter: &EventFilter, mut callback: F) -> HistoryResult<ReplayStats>
    where
        F: FnMut(CoordinationEvent) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let events = self.matching(filter)?;
        info!(total = events.len(), "starting event replay");

        let mut stats = ReplayStats::default();
        for event in events {
            stats.record_event(&event);
            callback(event).await;
        }

        info!(total = stats.total_events, cycles = stats.cycles_seen, "event replay finished");
        Ok(stats)
    }
}

/// Statistics from a replay
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayStats {
    /// Events replayed
    pub total_events: usize,
    /// Distinct cycles seen
    pub cycles_seen: usize,
    /// Events per type
    pub by_type: BTreeMap<String, usize>,
    last_cycle: Option<u64>,
}

impl ReplayStats {
    /// Count one replayed event
    pub fn record_event(&mut self, event: &CoordinationEvent) {
        self.total_events += 1;
        *self.by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
        if self.last_cycle != Some(event.cycle()) {
            self.cycles_seen += 1;
            self.last_cycle = Some(event.cycle());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::state::JsonFileStore;
    use chrono::Duration;

    fn closed(cycle: u64, at: DateTime<Utc>) -> CoordinationEvent {
        CoordinationEvent::CycleClosed {
            cycle,
            pipeline: "default".to_string(),
            steps_run: 1,
            failed_steps: Vec::new(),
            aborted: false,
            delivered: 0,
            rejected: 0,
            timestamp: at,
        }
    }

    #[test]
    fn test_history_in_time_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap().shared();
        let bus = EventBus::with_persistence(store.clone());
        let t0 = Utc::now();
        bus.publish(closed(2, t0 + Duration::seconds(1))).unwrap();
        bus.publish(closed(1, t0)).unwrap();

        let history = EventHistory::new(store);
        let all = history.all().unwrap();
        assert_eq!(all.iter().map(|e| e.cycle()).collect::<Vec<_>>(), vec![1, 2]);

        let late = history
            .between(t0 + Duration::milliseconds(500), t0 + Duration::seconds(5))
            .unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].cycle(), 2);
    }

    #[tokio::test]
    async fn test_replay_stats() {
        let store = crate::state::MemoryStore::new().shared();
        let bus = EventBus::with_persistence(store.clone());
        let t0 = Utc::now();
        for cycle in 1..=3 {
            bus.publish(closed(cycle, t0 + Duration::seconds(cycle as i64))).unwrap();
        }

        let history = EventHistory::new(store);
        let mut seen = Vec::new();
        let stats = history
            .replay(&EventFilter::new(), |e| {
                seen.push(e.cycle());
                async {}
            })
            .await
            .unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.cycles_seen, 3);
        assert_eq!(stats.by_type.get("cycle_closed"), Some(&3));
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
