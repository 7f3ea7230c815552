//! Message model: priorities, delivery status, routing hints, envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use super::engine::{RouterError, RouterResult};
use crate::ids::{AgentId, CorrelationId, MessageId};
use crate::state::{EntityKind, Persist};

/// Version of the routing hint vocabulary accepted by [`RoutingHint::from_tag`].
pub const ROUTING_HINT_SCHEMA_VERSION: u32 = 1;

/// Message priority, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl Priority {
    /// All tiers, lowest first.
    pub const ALL: [Priority; 5] = [
        Self::Low,
        Self::Normal,
        Self::High,
        Self::Urgent,
        Self::Critical,
    ];

    /// Priority from its numeric tier (0 = low … 4 = critical).
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Numeric tier.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Drop `tiers` levels, stopping at `Low`.
    pub fn demote(self, tiers: u8) -> Self {
        Self::ALL[self.as_u8().saturating_sub(tiers) as usize]
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Queued, never attempted.
    Pending,
    /// Handed to the transport, awaiting result or acknowledgement.
    InFlight,
    /// Acknowledged.
    Delivered,
    /// Retries exhausted; moved to the dead-letter set.
    Failed,
    /// Waiting for its backoff to expire.
    Retrying,
}

impl DeliveryStatus {
    /// Whether the message is finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Valid transitions from this status. Forward only, except the
    /// `Retrying → InFlight` re-attempt.
    pub fn valid_transitions(self) -> &'static [DeliveryStatus] {
        match self {
            Self::Pending => &[Self::InFlight],
            Self::InFlight => &[Self::Delivered, Self::Retrying, Self::Failed],
            Self::Retrying => &[Self::InFlight],
            Self::Delivered | Self::Failed => &[],
        }
    }

    /// Whether `to` is reachable in one step.
    pub fn can_transition_to(self, to: DeliveryStatus) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InFlight => write!(f, "in_flight"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

/// Closed set of routing hints carried by a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingHint {
    /// Work item traffic.
    Task,
    /// Debate traffic.
    Debate,
    /// Intervention notices.
    Intervention,
    /// Control-plane traffic; never throttled.
    Control,
    /// Liveness ping; never retried.
    Heartbeat,
}

impl RoutingHint {
    /// Parse a wire tag. Unknown tags are rejected at ingestion.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "task" => Some(Self::Task),
            "debate" => Some(Self::Debate),
            "intervention" => Some(Self::Intervention),
            "control" => Some(Self::Control),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }

    /// Wire tag.
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Debate => "debate",
            Self::Intervention => "intervention",
            Self::Control => "control",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for RoutingHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Message body plus routing hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Opaque body.
    #[serde(default)]
    pub body: Value,
    /// Routing hints.
    #[serde(default)]
    pub hints: BTreeSet<RoutingHint>,
}

impl Payload {
    /// Payload with a body and no hints.
    pub fn new(body: Value) -> Self {
        Self {
            body,
            hints: BTreeSet::new(),
        }
    }

    /// Add a routing hint.
    pub fn with_hint(mut self, hint: RoutingHint) -> Self {
        self.hints.insert(hint);
        self
    }

    /// Whether the payload carries `hint`.
    pub fn has_hint(&self, hint: RoutingHint) -> bool {
        self.hints.contains(&hint)
    }
}

/// Message destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// One agent.
    Agent(AgentId),
    /// Every active agent except the sender.
    Broadcast,
}

impl Recipient {
    /// Key used for per-recipient bookkeeping.
    pub fn key(&self) -> &str {
        match self {
            Self::Agent(id) => id.as_str(),
            Self::Broadcast => "*",
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "{}", id),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// A routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id.
    pub id: MessageId,
    /// Sending agent.
    pub sender: AgentId,
    /// Destination.
    pub recipient: Recipient,
    /// Dispatch priority, after any throttle demotion.
    pub priority: Priority,
    /// Priority the sender asked for.
    pub requested_priority: Priority,
    /// Body and hints.
    pub payload: Payload,
    /// Creation time, restamped from the router clock at enqueue.
    pub created_at: DateTime<Utc>,
    /// Delivery status.
    pub status: DeliveryStatus,
    /// Failed delivery attempts so far.
    pub attempt_count: u32,
    /// Links the message to its acknowledgement.
    pub correlation_id: CorrelationId,
    /// Earliest next attempt while `Retrying`.
    pub retry_at: Option<DateTime<Utc>>,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
    /// Set once the transport accepted the message.
    pub awaiting_ack_since: Option<DateTime<Utc>>,
    /// When the message reached a terminal status.
    pub closed_at: Option<DateTime<Utc>>,
}

impl Message {
    /// New pending message with a fresh id and correlation id.
    pub fn new(sender: AgentId, recipient: Recipient, priority: Priority, payload: Payload) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            sender,
            recipient,
            priority,
            requested_priority: priority,
            payload,
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            correlation_id: CorrelationId::generate(),
            retry_at: None,
            last_error: None,
            awaiting_ack_since: None,
            closed_at: None,
        }
    }

    /// Use a caller-supplied correlation id.
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Whether the message may be dispatched at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            DeliveryStatus::Pending => true,
            DeliveryStatus::Retrying => self.retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}

impl Persist for Message {
    const KIND: EntityKind = EntityKind::Message;

    fn storage_id(&self) -> String {
        self.id.to_string()
    }
}

/// Unvalidated message as received at the API boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Sending agent.
    pub sender: String,
    /// Destination agent; must be absent for broadcasts.
    #[serde(default)]
    pub recipient: Option<String>,
    /// Deliver to every active agent.
    #[serde(default)]
    pub broadcast: bool,
    /// Numeric priority tier, 0..=4.
    pub priority: u8,
    /// Routing tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Opaque body.
    #[serde(default)]
    pub body: Value,
    /// Optional caller-supplied correlation id.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl MessageEnvelope {
    /// Validate and convert into a pending [`Message`].
    pub fn into_message(self, now: DateTime<Utc>) -> RouterResult<Message> {
        if self.sender.trim().is_empty() {
            return Err(RouterError::EmptySender);
        }

        let recipient = match (self.recipient, self.broadcast) {
            (Some(_), true) => return Err(RouterError::AmbiguousRecipient),
            (None, true) => Recipient::Broadcast,
            (Some(id), false) if !id.trim().is_empty() => Recipient::Agent(AgentId::new(id)),
            _ => return Err(RouterError::MissingRecipient),
        };

        let priority =
            Priority::from_u8(self.priority).ok_or(RouterError::InvalidPriority(self.priority))?;

        let mut hints = BTreeSet::new();
        for tag in &self.tags {
            let hint =
                RoutingHint::from_tag(tag).ok_or_else(|| RouterError::UnknownRoutingTag(tag.clone()))?;
            hints.insert(hint);
        }

        let mut message = Message::new(
            AgentId::new(self.sender),
            recipient,
            priority,
            Payload {
                body: self.body,
                hints,
            },
        );
        message.created_at = now;
        if let Some(correlation) = self.correlation_id.filter(|c| !c.trim().is_empty()) {
            message.correlation_id = CorrelationId::new(correlation);
        }
        Ok(message)
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// Message attempted.
    pub message_id: MessageId,
    /// Its correlation id.
    pub correlation_id: CorrelationId,
    /// Destination.
    pub recipient: Recipient,
    /// Priority it was dispatched at.
    pub priority: Priority,
    /// Whether the transport accepted it.
    pub success: bool,
    /// Status after the attempt.
    pub status: DeliveryStatus,
    /// Failed attempts so far.
    pub attempt_count: u32,
    /// Transport error or timeout, on failure.
    pub error: Option<String>,
}

/// Result of an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    /// An in-flight message became `Delivered`.
    Delivered,
    /// The message was already delivered; nothing changed.
    Duplicate,
    /// No in-flight message has this correlation id.
    Unknown,
}

impl std::fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> MessageEnvelope {
        MessageEnvelope {
            sender: "w1".to_string(),
            recipient: Some("w2".to_string()),
            priority: 2,
            tags: vec!["task".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_priority_ordering_and_demotion() {
        assert!(Priority::Critical > Priority::Urgent);
        assert!(Priority::Low < Priority::Normal);
        assert_eq!(Priority::High.demote(1), Priority::Normal);
        assert_eq!(Priority::Normal.demote(9), Priority::Low);
        assert_eq!(Priority::from_u8(4), Some(Priority::Critical));
        assert_eq!(Priority::from_u8(5), None);
    }

    #[test]
    fn test_status_forward_only() {
        use DeliveryStatus::*;
        assert!(Pending.can_transition_to(InFlight));
        assert!(Retrying.can_transition_to(InFlight));
        assert!(!Delivered.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Retrying));
        assert!(!InFlight.can_transition_to(Pending));
    }

    #[test]
    fn test_routing_tags_closed() {
        assert_eq!(RoutingHint::from_tag("Heartbeat"), Some(RoutingHint::Heartbeat));
        assert_eq!(RoutingHint::from_tag("gossip"), None);
        assert_eq!(RoutingHint::Control.as_tag(), "control");
    }

    #[test]
    fn test_envelope_valid() {
        let msg = envelope().into_message(Utc::now()).unwrap();
        assert_eq!(msg.priority, Priority::High);
        assert_eq!(msg.recipient, Recipient::Agent(AgentId::from("w2")));
        assert!(msg.payload.has_hint(RoutingHint::Task));
        assert_eq!(msg.status, DeliveryStatus::Pending);
    }

    #[test]
    fn test_envelope_rejections() {
        let mut e = envelope();
        e.recipient = None;
        assert_eq!(e.into_message(Utc::now()), Err(RouterError::MissingRecipient));

        let mut e = envelope();
        e.priority = 7;
        assert_eq!(e.into_message(Utc::now()), Err(RouterError::InvalidPriority(7)));

        let mut e = envelope();
        e.tags.push("gossip".to_string());
        assert_eq!(
            e.into_message(Utc::now()),
            Err(RouterError::UnknownRoutingTag("gossip".to_string()))
        );

        let mut e = envelope();
        e.sender = " ".to_string();
        assert_eq!(e.into_message(Utc::now()), Err(RouterError::EmptySender));

        let mut e = envelope();
        e.broadcast = true;
        assert_eq!(e.into_message(Utc::now()), Err(RouterError::AmbiguousRecipient));
    }

    #[test]
    fn test_envelope_broadcast_and_correlation() {
        let mut e = envelope();
        e.recipient = None;
        e.broadcast = true;
        e.correlation_id = Some("corr-9".to_string());
        let msg = e.into_message(Utc::now()).unwrap();
        assert_eq!(msg.recipient, Recipient::Broadcast);
        assert_eq!(msg.correlation_id, CorrelationId::from("corr-9"));
    }

    #[test]
    fn test_retrying_ready_after_backoff() {
        let now = Utc::now();
        let mut msg = envelope().into_message(now).unwrap();
        assert!(msg.is_ready(now));
        msg.status = DeliveryStatus::Retrying;
        msg.retry_at = Some(now + chrono::Duration::seconds(1));
        assert!(!msg.is_ready(now));
        assert!(msg.is_ready(now + chrono::Duration::seconds(1)));
    }
}
