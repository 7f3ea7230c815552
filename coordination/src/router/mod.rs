//! Message Router Module
//!
//! Priority queue delivery between agents with acknowledgement tracking:
//! - Ordering: `Critical > Urgent > High > Normal > Low`, FIFO within a tier
//! - Retries: capped exponential backoff, then the dead-letter list
//! - Acks: correlation ids settle in-flight messages exactly once
//!
//! # Delivery Status Flow
//!
//! ```text
//! Pending ──► InFlight ──► Delivered
//!                │  ▲
//!                ▼  │
//!             Retrying      InFlight ──► Failed (dead letter)
//! ```

pub mod circuit_breaker;
pub mod engine;
pub mod message;
pub mod queue;
pub mod retry;
pub mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use engine::{MessageRouter, RouterError, RouterResult, ROUTER_STEP};
pub use message::{
    AckOutcome, DeliveryResult, DeliveryStatus, Message, MessageEnvelope, Payload, Priority,
    Recipient, RoutingHint, ROUTING_HINT_SCHEMA_VERSION,
};
pub use queue::{MessageQueue, SharedMessageQueue, StatusChange, StatusCounts};
pub use retry::RetryPolicy;
pub use transport::{DeliveryReceipt, DeliveryTransport, LoopbackTransport, TransportError};
