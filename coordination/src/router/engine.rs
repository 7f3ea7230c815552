//! Message router: admission, dispatch, retries and acknowledgements.
//!
//! The router is the only component that changes a message's delivery
//! status. Dispatch takes ready messages under the queue lock, releases the
//! lock, and awaits the transport under a timeout; results are applied under
//! the lock again.

use async_trait::async_trait;
use chrono::Duration;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn, Instrument};

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::message::{
    AckOutcome, DeliveryResult, DeliveryStatus, Message, MessageEnvelope, Priority, RoutingHint,
};
use super::queue::{SharedMessageQueue, StatusCounts};
use super::transport::DeliveryTransport;
use crate::agent::{SharedAgentRegistry, LIFECYCLE_STEP};
use crate::clock::SharedClock;
use crate::config::RouterConfig;
use crate::context::{AckRecord, ExecutionContext};
use crate::contracts::{Queryable, Step, StepOutcome, StepResult};
use crate::ids::{CorrelationId, MessageId};
use crate::metrics::MetricEvent;
use crate::state::{lock, HaltSwitch, SharedState};
use crate::telemetry;

/// Step name of the router.
pub const ROUTER_STEP: &str = "router";

/// Error type for router operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouterError {
    #[error("sender must not be empty")]
    EmptySender,

    #[error("recipient missing and message is not a broadcast")]
    MissingRecipient,

    #[error("message names a recipient and is also a broadcast")]
    AmbiguousRecipient,

    #[error("priority {0} out of range (0..=4)")]
    InvalidPriority(u8),

    #[error("unknown routing tag: {0}")]
    UnknownRoutingTag(String),

    #[error("message already queued: {0}")]
    DuplicateMessage(MessageId),

    #[error("correlation id already in use: {0}")]
    DuplicateCorrelation(CorrelationId),

    #[error("only fresh messages can be enqueued (status {status}, {attempt_count} attempts)")]
    NotFresh {
        status: DeliveryStatus,
        attempt_count: u32,
    },

    #[error("queue full ({limit} messages waiting)")]
    QueueFull { limit: usize },
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Priority queue router over an injected transport.
pub struct MessageRouter {
    queue: SharedMessageQueue,
    agents: SharedAgentRegistry,
    halt: Arc<HaltSwitch>,
    clock: SharedClock,
    transport: Arc<dyn DeliveryTransport>,
    breaker: Mutex<CircuitBreaker>,
    config: RouterConfig,
}

impl MessageRouter {
    /// Router over the shared queue.
    pub fn new(
        shared: &SharedState,
        transport: Arc<dyn DeliveryTransport>,
        config: RouterConfig,
    ) -> Self {
        lock(&shared.queue).set_history(config.ack_history);
        Self {
            queue: Arc::clone(&shared.queue),
            agents: Arc::clone(&shared.agents),
            halt: Arc::clone(&shared.halt),
            clock: Arc::clone(&shared.clock),
            transport,
            breaker: Mutex::new(CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_cooldown_secs,
            )),
            config,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Validate and queue a message.
    ///
    /// Messages from throttled senders are demoted unless they carry the
    /// `control` hint. A rejected message leaves the queue unchanged.
    pub fn enqueue(&self, mut message: Message) -> RouterResult<MessageId> {
        if message.sender.is_blank() {
            return Err(RouterError::EmptySender);
        }
        if let super::message::Recipient::Agent(id) = &message.recipient {
            if id.is_blank() {
                return Err(RouterError::MissingRecipient);
            }
        }

        message.requested_priority = message.priority;
        if !message.payload.has_hint(RoutingHint::Control) {
            message.priority = lock(&self.agents)
                .effective_priority(message.sender.as_str(), message.requested_priority);
        }

        let now = self.clock.now();
        message.created_at = now;
        let mut queue = lock(&self.queue);
        if queue.depth() >= self.config.max_queue_depth {
            return Err(RouterError::QueueFull {
                limit: self.config.max_queue_depth,
            });
        }
        let priority = message.priority;
        let demoted = priority != message.requested_priority;
        let recipient = message.recipient.to_string();
        let id = queue.push(message, now)?;
        debug!(message_id = %id, %recipient, %priority, demoted, "message enqueued");
        Ok(id)
    }

    /// Validate a boundary envelope and queue it.
    pub fn enqueue_envelope(&self, envelope: MessageEnvelope) -> RouterResult<MessageId> {
        let message = envelope.into_message(self.clock.now())?;
        self.enqueue(message)
    }

    /// Dispatch every ready message, in priority order.
    ///
    /// Overdue acknowledgements are counted as failed attempts first. While
    /// the system is halted only `Critical` messages leave the queue.
    pub async fn dispatch_ready(&self) -> Vec<DeliveryResult> {
        let now = self.clock.now();
        let halted = self.halt.is_raised();
        let mut results = Vec::new();

        let batch = {
            let mut queue = lock(&self.queue);
            let ack_timeout = Duration::milliseconds(self.config.ack_timeout_ms as i64);
            for id in queue.overdue_acks(now, ack_timeout) {
                if let Some(result) =
                    self.apply_failure(&mut queue, id, "acknowledgement timed out".to_string())
                {
                    results.push(result);
                }
            }

            let breaker = lock(&self.breaker);
            queue.take_ready(now, self.config.dispatch_batch, |m| {
                (!halted || m.priority == Priority::Critical)
                    && breaker.is_available(m.recipient.key(), now)
            })
        };

        if !batch.is_empty() {
            debug!(count = batch.len(), halted, "dispatching batch");
        }

        let timeout = std::time::Duration::from_millis(self.config.delivery_timeout_ms);
        for message in batch {
            let span = telemetry::dispatch_span(&message.id.to_string(), message.recipient.key());
            let outcome = tokio::time::timeout(timeout, self.transport.deliver(&message))
                .instrument(span)
                .await;
            let error = match outcome {
                Ok(Ok(receipt)) => {
                    if receipt.correlation_id != message.correlation_id {
                        warn!(
                            message_id = %message.id,
                            expected = %message.correlation_id,
                            got = %receipt.correlation_id,
                            "transport receipt with foreign correlation id"
                        );
                    }
                    None
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!(
                    "delivery timed out after {}ms",
                    self.config.delivery_timeout_ms
                )),
            };

            let mut queue = lock(&self.queue);
            let result = match error {
                None => {
                    let accepted_at = self.clock.now();
                    queue.mark_accepted(message.id, accepted_at);
                    lock(&self.breaker).record_success(message.recipient.key());
                    Some(Self::result_for(&message, true, DeliveryStatus::InFlight, None))
                }
                Some(error) => self.apply_failure(&mut queue, message.id, error),
            };
            results.push(result.unwrap_or_else(|| {
                Self::result_for(&message, false, message.status, Some("superseded".to_string()))
            }));
        }

        results
    }

    /// Record a failed attempt; heartbeats are never retried.
    fn apply_failure(
        &self,
        queue: &mut super::queue::MessageQueue,
        id: MessageId,
        error: String,
    ) -> Option<DeliveryResult> {
        let now = self.clock.now();
        let message = queue.message(id)?;
        let retryable = !message.payload.has_hint(RoutingHint::Heartbeat);
        let status = queue.record_failure(id, &error, now, &self.config.retry, retryable)?;
        lock(&self.breaker).record_failure(message.recipient.key(), now);
        if status == DeliveryStatus::Failed {
            info!(message_id = %id, recipient = %message.recipient, "message dead-lettered");
        }
        let updated = queue.message(id)?;
        Some(Self::result_for(&updated, false, status, Some(error)))
    }

    fn result_for(
        message: &Message,
        success: bool,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> DeliveryResult {
        DeliveryResult {
            message_id: message.id,
            correlation_id: message.correlation_id.clone(),
            recipient: message.recipient.clone(),
            priority: message.priority,
            success,
            status,
            attempt_count: message.attempt_count,
            error,
        }
    }

    /// Apply an acknowledgement. Never fails; unknown ids are logged.
    pub fn acknowledge(&self, correlation_id: &CorrelationId) -> AckOutcome {
        let now = self.clock.now();
        lock(&self.queue).acknowledge(correlation_id, now)
    }

    /// Current status of a message.
    pub fn status(&self, id: MessageId) -> Option<DeliveryStatus> {
        lock(&self.queue).message(id).map(|m| m.status)
    }

    /// Dead-lettered messages.
    pub fn dead_letters(&self) -> Vec<Message> {
        lock(&self.queue).dead_letters().to_vec()
    }

    /// Number of dead-lettered messages.
    pub fn dead_letter_len(&self) -> usize {
        lock(&self.queue).dead_letter_len()
    }

    /// Remove the dead-letter list and return it for inspection elsewhere.
    pub fn drain_dead_letters(&self) -> Vec<Message> {
        let drained = lock(&self.queue).drain_dead_letters();
        if !drained.is_empty() {
            info!(count = drained.len(), "dead letters drained");
        }
        drained
    }

    /// Give every dead-lettered message a fresh retry budget.
    pub fn requeue_dead_letters(&self) -> Vec<MessageId> {
        let now = self.clock.now();
        let requeued = lock(&self.queue).requeue_dead_letters(now);
        if !requeued.is_empty() {
            info!(count = requeued.len(), "dead letters requeued");
        }
        requeued
    }

    /// Messages waiting for dispatch.
    pub fn depth(&self) -> usize {
        lock(&self.queue).depth()
    }

    /// Messages per status.
    pub fn counts(&self) -> StatusCounts {
        lock(&self.queue).counts()
    }

    /// Circuit state for a recipient key.
    pub fn circuit_state(&self, recipient: &str) -> CircuitState {
        lock(&self.breaker).state(recipient, self.clock.now())
    }
}

#[async_trait]
impl Step for MessageRouter {
    fn name(&self) -> &str {
        ROUTER_STEP
    }

    fn dependencies(&self) -> &[&'static str] {
        &[LIFECYCLE_STEP]
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> StepResult {
        let acks: Vec<CorrelationId> = ctx.ack_inputs().cloned().collect();
        for correlation_id in acks {
            let outcome = self.acknowledge(&correlation_id);
            ctx.acks.push(AckRecord {
                correlation_id,
                outcome,
            });
        }

        let mut enqueued = 0;
        for message in std::mem::take(&mut ctx.outbox) {
            match self.enqueue(message) {
                Ok(_) => enqueued += 1,
                Err(e) => ctx.reject(ROUTER_STEP, e.to_string()),
            }
        }

        let deliveries = self.dispatch_ready().await;
        let attempted = deliveries.len();
        ctx.deliveries.extend(deliveries);

        let changes = lock(&self.queue).take_changes();
        for change in changes {
            ctx.emit(MetricEvent::MessageStatus {
                message_id: change.message_id,
                from: change.from,
                to: change.to,
                counts: change.counts,
                at: change.at,
            });
        }

        Ok(StepOutcome::processed(ctx.acks.len() + enqueued + attempted).with_detail(format!(
            "{} acks, {} enqueued, {} attempts",
            ctx.acks.len(),
            enqueued,
            attempted
        )))
    }
}

impl Queryable for MessageRouter {
    type Key = MessageId;
    type View = Message;

    fn query(&self, key: &MessageId) -> Option<Message> {
        lock(&self.queue).message(*key)
    }

    fn list(&self) -> Vec<Message> {
        lock(&self.queue).live_messages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::ids::AgentId;
    use crate::router::transport::{DeliveryReceipt, LoopbackTransport, TransportError};
    use crate::router::{Payload, Recipient};
    use crate::state::HaltNotice;
    use mockall::mock;

    mock! {
        Transport {}

        #[async_trait]
        impl DeliveryTransport for Transport {
            async fn deliver(&self, message: &Message) -> Result<DeliveryReceipt, TransportError>;
            fn name(&self) -> &str;
        }
    }

    fn msg(to: &str, priority: Priority) -> Message {
        Message::new(
            AgentId::from("sender"),
            Recipient::Agent(AgentId::from(to)),
            priority,
            Payload::default(),
        )
    }

    fn router_with(transport: Arc<dyn DeliveryTransport>) -> (MessageRouter, SharedState, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let shared = SharedState::new(clock.clone());
        let config = RouterConfig {
            breaker_failure_threshold: 0,
            ..Default::default()
        };
        (MessageRouter::new(&shared, transport, config), shared, clock)
    }

    #[tokio::test]
    async fn test_dispatch_in_priority_order() {
        let transport = Arc::new(LoopbackTransport::new());
        let (router, _, _) = router_with(transport.clone());
        let low = router.enqueue(msg("a", Priority::Low)).unwrap();
        let crit = router.enqueue(msg("b", Priority::Critical)).unwrap();
        let normal = router.enqueue(msg("c", Priority::Normal)).unwrap();

        let results = router.dispatch_ready().await;
        let order: Vec<MessageId> = results.iter().map(|r| r.message_id).collect();
        assert_eq!(order, vec![crit, normal, low]);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(router.status(crit), Some(DeliveryStatus::InFlight));
        assert_eq!(transport.delivered().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_transport_failure_schedules_retry() {
        let mut mock = MockTransport::new();
        mock.expect_deliver()
            .times(1)
            .returning(|_| Err(TransportError::Unreachable("b".to_string())));
        let (router, _, _) = router_with(Arc::new(mock));
        let id = router.enqueue(msg("b", Priority::High)).unwrap();

        let results = router.dispatch_ready().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].status, DeliveryStatus::Retrying);
        assert_eq!(results[0].attempt_count, 1);
        assert_eq!(router.status(id), Some(DeliveryStatus::Retrying));

        // Backoff not yet elapsed: nothing dispatched, mock not called again.
        assert!(router.dispatch_ready().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_never_retried() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.fail_next(1);
        let (router, _, _) = router_with(transport);
        let mut hb = msg("a", Priority::Low);
        hb.payload = Payload::default().with_hint(RoutingHint::Heartbeat);
        let id = router.enqueue(hb).unwrap();
        let results = router.dispatch_ready().await;
        assert_eq!(results[0].status, DeliveryStatus::Failed);
        assert_eq!(router.status(id), Some(DeliveryStatus::Failed));
        assert_eq!(router.dead_letter_len(), 1);
    }

    #[tokio::test]
    async fn test_requeued_dead_letter_delivers() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.fail_next(1);
        let (router, _, _) = router_with(transport.clone());
        let mut hb = msg("a", Priority::Low);
        hb.payload = Payload::default().with_hint(RoutingHint::Heartbeat);
        let id = router.enqueue(hb).unwrap();
        router.dispatch_ready().await;
        assert_eq!(router.dead_letter_len(), 1);

        assert_eq!(router.requeue_dead_letters(), vec![id]);
        assert_eq!(router.dead_letter_len(), 0);
        let results = router.dispatch_ready().await;
        assert!(results[0].success);
        assert_eq!(router.status(id), Some(DeliveryStatus::InFlight));
        assert!(router.drain_dead_letters().is_empty());
    }

    #[test]
    fn test_enqueue_stamps_router_clock() {
        let (router, _, clock) = router_with(Arc::new(LoopbackTransport::new()));
        clock.advance_secs(3_600);
        let mut m = msg("a", Priority::Normal);
        m.created_at = clock.now() - chrono::Duration::days(1);
        let id = router.enqueue(m).unwrap();
        let queued = lock(&router.queue).message(id).unwrap();
        assert_eq!(queued.created_at, clock.now());
    }

    #[tokio::test]
    async fn test_halt_only_dispatches_critical() {
        let transport = Arc::new(LoopbackTransport::new());
        let (router, shared, _) = router_with(transport);
        shared.halt.raise(HaltNotice {
            record_id: "r".to_string(),
            reason: "test".to_string(),
            raised_at: chrono::Utc::now(),
        });
        let normal = router.enqueue(msg("a", Priority::Urgent)).unwrap();
        let crit = router.enqueue(msg("b", Priority::Critical)).unwrap();
        let results = router.dispatch_ready().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message_id, crit);
        assert_eq!(router.status(normal), Some(DeliveryStatus::Pending));
    }

    #[tokio::test]
    async fn test_ack_timeout_counts_as_attempt() {
        let transport = Arc::new(LoopbackTransport::new());
        let (router, _, clock) = router_with(transport);
        let id = router.enqueue(msg("a", Priority::Normal)).unwrap();
        router.dispatch_ready().await;
        clock.advance_ms(router.config().ack_timeout_ms as i64);
        let results = router.dispatch_ready().await;
        assert_eq!(results[0].message_id, id);
        assert_eq!(results[0].status, DeliveryStatus::Retrying);
        assert_eq!(results[0].error.as_deref(), Some("acknowledgement timed out"));
    }

    #[tokio::test]
    async fn test_throttled_sender_demoted_unless_control() {
        let transport = Arc::new(LoopbackTransport::new());
        let (router, shared, _) = router_with(transport);
        {
            let mut agents = lock(&shared.agents);
            agents
                .register(AgentId::from("sender"), Default::default(), chrono::Utc::now())
                .unwrap();
            agents.throttle("sender").unwrap();
        }
        let plain = router.enqueue(msg("a", Priority::High)).unwrap();
        let mut control = msg("a", Priority::High);
        control.payload = Payload::default().with_hint(RoutingHint::Control);
        let control = router.enqueue(control).unwrap();

        assert_eq!(router.query(&plain).unwrap().priority, Priority::Normal);
        assert_eq!(router.query(&plain).unwrap().requested_priority, Priority::High);
        assert_eq!(router.query(&control).unwrap().priority, Priority::High);
    }

    #[tokio::test]
    async fn test_queue_full_rejects() {
        let clock = Arc::new(ManualClock::starting_now());
        let shared = SharedState::new(clock);
        let config = RouterConfig {
            max_queue_depth: 1,
            ..Default::default()
        };
        let router = MessageRouter::new(&shared, Arc::new(LoopbackTransport::new()), config);
        router.enqueue(msg("a", Priority::Low)).unwrap();
        assert_eq!(
            router.enqueue(msg("a", Priority::Low)),
            Err(RouterError::QueueFull { limit: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_times_out() {
        struct Stalled;

        #[async_trait]
        impl DeliveryTransport for Stalled {
            async fn deliver(&self, _message: &Message) -> Result<DeliveryReceipt, TransportError> {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Err(TransportError::Io("unreachable".to_string()))
            }
        }

        let (router, _, _) = router_with(Arc::new(Stalled));
        let id = router.enqueue(msg("a", Priority::Normal)).unwrap();
        let results = router.dispatch_ready().await;
        assert_eq!(results[0].message_id, id);
        assert_eq!(results[0].status, DeliveryStatus::Retrying);
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_step_acks_enqueues_and_emits_metrics() {
        let transport = Arc::new(LoopbackTransport::new());
        let (router, shared, _) = router_with(transport.clone());
        let first = msg("a", Priority::Normal);
        let corr = first.correlation_id.clone();
        router.enqueue(first).unwrap();
        router.dispatch_ready().await;

        let mut ctx = ExecutionContext::new(
            1,
            shared,
            vec![crate::context::CycleInput::Ack {
                correlation_id: corr,
            }],
        );
        ctx.stage_outbound(msg("b", Priority::High));
        let mut bad = msg("b", Priority::High);
        bad.sender = AgentId::from("");
        ctx.stage_outbound(bad);

        router.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.acks[0].outcome, AckOutcome::Delivered);
        assert_eq!(ctx.deliveries.len(), 1);
        assert_eq!(ctx.rejections.len(), 1);
        assert!(ctx.outbox.is_empty());
        assert!(ctx
            .metrics
            .iter()
            .any(|m| matches!(m, MetricEvent::MessageStatus { to: DeliveryStatus::Delivered, .. })));
    }
}
