//! Delivery transport seam.
//!
//! The router hands each dispatched message to a [`DeliveryTransport`].
//! Acceptance by the transport does not settle the message; the matching
//! acknowledgement does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;

use super::message::Message;
use crate::ids::CorrelationId;
use crate::state::lock;

/// Transport acceptance of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Correlation id the transport will acknowledge with.
    pub correlation_id: CorrelationId,
    /// When the transport accepted it.
    pub accepted_at: DateTime<Utc>,
}

/// Error type for transport operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("recipient unreachable: {0}")]
    Unreachable(String),

    #[error("rejected by transport: {0}")]
    Rejected(String),

    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Outbound delivery to agents.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Hand a message to its recipient.
    async fn deliver(&self, message: &Message) -> Result<DeliveryReceipt, TransportError>;

    /// Transport name for logs.
    fn name(&self) -> &str {
        "transport"
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    delivered: Vec<Message>,
    fail_remaining: u32,
    unreachable: HashSet<String>,
}

/// In-process transport that records every accepted message.
///
/// Hosts drain accepted messages with [`LoopbackTransport::take_delivered`]
/// and feed their correlation ids back as acknowledgements.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    /// Transport that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` deliveries.
    pub fn fail_next(&self, count: u32) {
        lock(&self.state).fail_remaining = count;
    }

    /// Treat a recipient key as unreachable until restored.
    pub fn mark_unreachable(&self, recipient: &str) {
        lock(&self.state).unreachable.insert(recipient.to_string());
    }

    /// Make a recipient reachable again.
    pub fn restore(&self, recipient: &str) {
        lock(&self.state).unreachable.remove(recipient);
    }

    /// Messages accepted so far.
    pub fn delivered(&self) -> Vec<Message> {
        lock(&self.state).delivered.clone()
    }

    /// Drain accepted messages.
    pub fn take_delivered(&self) -> Vec<Message> {
        std::mem::take(&mut lock(&self.state).delivered)
    }
}

#[async_trait]
impl DeliveryTransport for LoopbackTransport {
    async fn deliver(&self, message: &Message) -> Result<DeliveryReceipt, TransportError> {
        let mut state = lock(&self.state);
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(TransportError::Io("injected failure".to_string()));
        }
        let key = message.recipient.key();
        if state.unreachable.contains(key) {
            return Err(TransportError::Unreachable(key.to_string()));
        }
        state.delivered.push(message.clone());
        Ok(DeliveryReceipt {
            correlation_id: message.correlation_id.clone(),
            accepted_at: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "loopback"
    }
}
