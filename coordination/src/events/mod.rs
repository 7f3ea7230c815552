//! Coordination events for external observers
//!
//! The cycle-closed hook turns each finished cycle into events on the
//! [`EventBus`]: one `cycle_closed` summary, the cycle's metric events,
//! debate outcomes, and an `emergency_raised` event while the system is
//! halted.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  EventHook   │────▶│  Event Bus   │────▶│  Subscribers │
//! │ (cycle end)  │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │  StateStore  │
//!                      │  (persist)   │
//!                      └──────────────┘
//! ```

pub mod bus;
pub mod history;
pub mod types;

pub use bus::{
    EventBus, EventBusError, EventBusResult, EventFilter, FilteredReceiver, SharedEventBus,
    CHANNEL_CAPACITY,
};
pub use history::{EventHistory, HistoryError, HistoryResult, ReplayStats};
pub use types::{CoordinationEvent, EventId};
