//! Router queue: priority heap, in-flight tracking, dead letters.
//!
//! Ordering is priority first, then enqueue sequence, so equal-priority
//! messages leave in arrival order. A retried message keeps its original
//! sequence number.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::engine::{RouterError, RouterResult};
use super::message::{AckOutcome, DeliveryStatus, Message, Priority};
use super::retry::RetryPolicy;
use crate::ids::{CorrelationId, MessageId};

/// Shared reference to the router queue.
pub type SharedMessageQueue = Arc<Mutex<MessageQueue>>;

/// Default number of settled messages remembered for duplicate acks and lookups.
pub const DEFAULT_ACK_HISTORY: usize = 10_000;

/// Number of messages per delivery status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retrying: u64,
}

impl StatusCounts {
    /// Count for one status.
    pub fn get(&self, status: DeliveryStatus) -> u64 {
        match status {
            DeliveryStatus::Pending => self.pending,
            DeliveryStatus::InFlight => self.in_flight,
            DeliveryStatus::Delivered => self.delivered,
            DeliveryStatus::Failed => self.failed,
            DeliveryStatus::Retrying => self.retrying,
        }
    }

    fn slot(&mut self, status: DeliveryStatus) -> &mut u64 {
        match status {
            DeliveryStatus::Pending => &mut self.pending,
            DeliveryStatus::InFlight => &mut self.in_flight,
            DeliveryStatus::Delivered => &mut self.delivered,
            DeliveryStatus::Failed => &mut self.failed,
            DeliveryStatus::Retrying => &mut self.retrying,
        }
    }

    fn shift(&mut self, from: Option<DeliveryStatus>, to: DeliveryStatus) {
        if let Some(from) = from {
            let slot = self.slot(from);
            *slot = slot.saturating_sub(1);
        }
        *self.slot(to) += 1;
    }

    /// Messages not yet settled.
    pub fn live(&self) -> u64 {
        self.pending + self.in_flight + self.retrying
    }
}

/// A recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Message that changed.
    pub message_id: MessageId,
    /// Previous status; `None` on enqueue.
    pub from: Option<DeliveryStatus>,
    /// New status.
    pub to: DeliveryStatus,
    /// Counts after the change.
    pub counts: StatusCounts,
    /// When it happened.
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    seq: u64,
    id: MessageId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Slot {
    message: Message,
    seq: u64,
}

/// Live messages plus the settled-message bookkeeping.
#[derive(Debug)]
pub struct MessageQueue {
    live: HashMap<MessageId, Slot>,
    heap: BinaryHeap<QueueEntry>,
    by_correlation: HashMap<CorrelationId, MessageId>,
    dead_letters: Vec<Message>,
    settled: VecDeque<Message>,
    delivered: HashSet<CorrelationId>,
    unpersisted: Vec<Message>,
    changes: Vec<StatusChange>,
    counts: StatusCounts,
    next_seq: u64,
    history: usize,
}

impl MessageQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self {
            live: HashMap::new(),
            heap: BinaryHeap::new(),
            by_correlation: HashMap::new(),
            dead_letters: Vec::new(),
            settled: VecDeque::new(),
            delivered: HashSet::new(),
            unpersisted: Vec::new(),
            changes: Vec::new(),
            counts: StatusCounts::default(),
            next_seq: 0,
            history: DEFAULT_ACK_HISTORY,
        }
    }

    /// Bound the settled-message history.
    pub fn set_history(&mut self, history: usize) {
        self.history = history.max(1);
    }

    /// Admit a fresh message.
    ///
    /// Nothing is modified when the message is rejected.
    pub fn push(&mut self, mut message: Message, now: DateTime<Utc>) -> RouterResult<MessageId> {
        if message.status != DeliveryStatus::Pending || message.attempt_count != 0 {
            return Err(RouterError::NotFresh {
                status: message.status,
                attempt_count: message.attempt_count,
            });
        }
        if self.live.contains_key(&message.id) {
            return Err(RouterError::DuplicateMessage(message.id));
        }
        if self.by_correlation.contains_key(&message.correlation_id)
            || self.delivered.contains(&message.correlation_id)
        {
            return Err(RouterError::DuplicateCorrelation(
                message.correlation_id.clone(),
            ));
        }

        let id = message.id;
        let seq = self.next_seq;
        self.next_seq += 1;
        message.retry_at = None;

        self.by_correlation.insert(message.correlation_id.clone(), id);
        self.heap.push(QueueEntry {
            priority: message.priority,
            seq,
            id,
        });
        self.live.insert(id, Slot { message, seq });
        self.record(id, None, DeliveryStatus::Pending, now);
        Ok(id)
    }

    /// Take up to `limit` ready messages in priority order and mark them
    /// `InFlight`. Messages refused by `admit` stay queued untouched.
    pub fn take_ready(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
        mut admit: impl FnMut(&Message) -> bool,
    ) -> Vec<Message> {
        let mut taken = Vec::new();
        let mut deferred = Vec::new();

        while taken.len() < limit {
            let Some(entry) = self.heap.pop() else {
                break;
            };
            let Some(slot) = self.live.get(&entry.id) else {
                continue;
            };
            if slot.seq != entry.seq || !slot.message.is_ready(now) {
                if matches!(
                    slot.message.status,
                    DeliveryStatus::Pending | DeliveryStatus::Retrying
                ) && slot.seq == entry.seq
                {
                    deferred.push(entry);
                }
                continue;
            }
            if !admit(&slot.message) {
                deferred.push(entry);
                continue;
            }
            if let Some(message) = self.transition(entry.id, DeliveryStatus::InFlight, now) {
                taken.push(message);
            }
        }

        self.heap.extend(deferred);
        taken
    }

    /// The transport accepted an in-flight message; start the ack clock.
    pub fn mark_accepted(&mut self, id: MessageId, now: DateTime<Utc>) -> bool {
        match self.live.get_mut(&id) {
            Some(slot) if slot.message.status == DeliveryStatus::InFlight => {
                slot.message.awaiting_ack_since = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Count a failed attempt for an in-flight message.
    ///
    /// Returns the new status, or `None` if the message is not in flight.
    pub fn record_failure(
        &mut self,
        id: MessageId,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
        retryable: bool,
    ) -> Option<DeliveryStatus> {
        let slot = self.live.get_mut(&id)?;
        if slot.message.status != DeliveryStatus::InFlight {
            return None;
        }
        slot.message.last_error = Some(error.to_string());
        slot.message.awaiting_ack_since = None;

        if retryable && policy.should_retry(slot.message.attempt_count) {
            slot.message.attempt_count += 1;
            let attempt = slot.message.attempt_count;
            slot.message.retry_at = Some(now + policy.backoff(attempt));
            let entry = QueueEntry {
                priority: slot.message.priority,
                seq: slot.seq,
                id,
            };
            self.heap.push(entry);
            self.transition(id, DeliveryStatus::Retrying, now);
            debug!(message_id = %id, attempt, error, "delivery failed, retry scheduled");
            Some(DeliveryStatus::Retrying)
        } else {
            let message = self.settle(id, DeliveryStatus::Failed, now)?;
            warn!(
                message_id = %id,
                attempts = message.attempt_count,
                error,
                "delivery failed permanently, dead-lettered"
            );
            self.dead_letters.push(message);
            Some(DeliveryStatus::Failed)
        }
    }

    /// Apply an acknowledgement.
    pub fn acknowledge(&mut self, correlation_id: &CorrelationId, now: DateTime<Utc>) -> AckOutcome {
        if let Some(id) = self.by_correlation.get(correlation_id).copied() {
            let in_flight = self
                .live
                .get(&id)
                .is_some_and(|slot| slot.message.status == DeliveryStatus::InFlight);
            if in_flight {
                self.settle(id, DeliveryStatus::Delivered, now);
                self.delivered.insert(correlation_id.clone());
                return AckOutcome::Delivered;
            }
            warn!(correlation_id = %correlation_id, "ack for message not in flight");
            return AckOutcome::Unknown;
        }
        if self.delivered.contains(correlation_id) {
            debug!(correlation_id = %correlation_id, "duplicate ack");
            return AckOutcome::Duplicate;
        }
        warn!(correlation_id = %correlation_id, "ack for unknown correlation id");
        AckOutcome::Unknown
    }

    /// In-flight messages whose acknowledgement is overdue.
    pub fn overdue_acks(&self, now: DateTime<Utc>, ack_timeout: Duration) -> Vec<MessageId> {
        let mut overdue: Vec<(u64, MessageId)> = self
            .live
            .values()
            .filter(|slot| slot.message.status == DeliveryStatus::InFlight)
            .filter(|slot| {
                slot.message
                    .awaiting_ack_since
                    .is_some_and(|since| since + ack_timeout <= now)
            })
            .map(|slot| (slot.seq, slot.message.id))
            .collect();
        overdue.sort();
        overdue.into_iter().map(|(_, id)| id).collect()
    }

    /// Snapshot of a live, settled or dead-lettered message.
    pub fn message(&self, id: MessageId) -> Option<Message> {
        if let Some(slot) = self.live.get(&id) {
            return Some(slot.message.clone());
        }
        self.dead_letters
            .iter()
            .chain(self.settled.iter())
            .find(|m| m.id == id)
            .cloned()
    }

    /// Snapshots of live messages in dispatch order.
    pub fn live_messages(&self) -> Vec<Message> {
        let mut slots: Vec<&Slot> = self.live.values().collect();
        slots.sort_by(|a, b| {
            b.message
                .priority
                .cmp(&a.message.priority)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        slots.into_iter().map(|s| s.message.clone()).collect()
    }

    /// Messages that exhausted their retries.
    pub fn dead_letters(&self) -> &[Message] {
        &self.dead_letters
    }

    /// Number of dead-lettered messages.
    pub fn dead_letter_len(&self) -> usize {
        self.dead_letters.len()
    }

    /// Remove every dead-lettered message and hand it to the caller.
    pub fn drain_dead_letters(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.dead_letters)
    }

    /// Put every dead-lettered message back in the queue with a fresh retry
    /// budget. Messages whose id or correlation id is live again stay
    /// dead-lettered.
    pub fn requeue_dead_letters(&mut self, now: DateTime<Utc>) -> Vec<MessageId> {
        let mut requeued = Vec::new();
        let mut kept = Vec::new();
        for mut message in std::mem::take(&mut self.dead_letters) {
            let original = message.clone();
            message.status = DeliveryStatus::Pending;
            message.attempt_count = 0;
            message.last_error = None;
            message.closed_at = None;
            message.awaiting_ack_since = None;
            match self.push(message, now) {
                Ok(id) => {
                    self.counts.failed = self.counts.failed.saturating_sub(1);
                    requeued.push(id);
                }
                Err(e) => {
                    warn!(message_id = %original.id, error = %e, "dead letter not requeued");
                    kept.push(original);
                }
            }
        }
        self.dead_letters = kept;
        requeued
    }

    /// Live messages waiting for dispatch.
    pub fn depth(&self) -> usize {
        (self.counts.pending + self.counts.retrying) as usize
    }

    /// Live messages.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether nothing is live.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Messages per status.
    pub fn counts(&self) -> StatusCounts {
        self.counts
    }

    /// Drain recorded status changes.
    pub fn take_changes(&mut self) -> Vec<StatusChange> {
        std::mem::take(&mut self.changes)
    }

    /// Drain settled messages not yet persisted.
    pub fn take_unpersisted(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.unpersisted)
    }

    /// Hand back messages whose write failed so the next drain retries them.
    pub fn requeue_unpersisted(&mut self, messages: Vec<Message>) {
        self.unpersisted.extend(messages);
    }

    fn transition(&mut self, id: MessageId, to: DeliveryStatus, now: DateTime<Utc>) -> Option<Message> {
        let slot = self.live.get_mut(&id)?;
        let from = slot.message.status;
        if !from.can_transition_to(to) {
            warn!(message_id = %id, %from, %to, "refused status transition");
            return None;
        }
        slot.message.status = to;
        let snapshot = slot.message.clone();
        self.record(id, Some(from), to, now);
        Some(snapshot)
    }

    /// Move a live message to a terminal status and out of the live set.
    fn settle(&mut self, id: MessageId, to: DeliveryStatus, now: DateTime<Utc>) -> Option<Message> {
        self.transition(id, to, now)?;
        let mut slot = self.live.remove(&id)?;
        self.by_correlation.remove(&slot.message.correlation_id);
        slot.message.closed_at = Some(now);
        slot.message.retry_at = None;
        slot.message.awaiting_ack_since = None;

        let message = slot.message;
        self.unpersisted.push(message.clone());
        if to == DeliveryStatus::Delivered {
            self.settled.push_back(message.clone());
            while self.settled.len() > self.history {
                if let Some(old) = self.settled.pop_front() {
                    self.delivered.remove(&old.correlation_id);
                }
            }
        }
        Some(message)
    }

    fn record(
        &mut self,
        id: MessageId,
        from: Option<DeliveryStatus>,
        to: DeliveryStatus,
        now: DateTime<Utc>,
    ) {
        self.counts.shift(from, to);
        self.changes.push(StatusChange {
            message_id: id,
            from,
            to,
            counts: self.counts,
            at: now,
        });
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentId;
    use crate::router::{Payload, Recipient};

    fn msg(to: &str, priority: Priority) -> Message {
        Message::new(
            AgentId::from("sender"),
            Recipient::Agent(AgentId::from(to)),
            priority,
            Payload::default(),
        )
    }

    fn take_all(queue: &mut MessageQueue, now: DateTime<Utc>) -> Vec<Message> {
        queue.take_ready(now, usize::MAX, |_| true)
    }

    #[test]
    fn test_priority_then_fifo() {
        let now = Utc::now();
        let mut q = MessageQueue::new();
        let a = q.push(msg("a", Priority::Normal), now).unwrap();
        let b = q.push(msg("b", Priority::Critical), now).unwrap();
        let c = q.push(msg("c", Priority::Normal), now).unwrap();
        let order: Vec<MessageId> = take_all(&mut q, now).iter().map(|m| m.id).collect();
        assert_eq!(order, vec![b, a, c]);
        assert_eq!(q.counts().in_flight, 3);
        assert_eq!(q.counts().pending, 0);
    }

    #[test]
    fn test_rejected_push_leaves_queue_untouched() {
        let now = Utc::now();
        let mut q = MessageQueue::new();
        let first = msg("a", Priority::Low);
        let dup = first.clone();
        q.push(first, now).unwrap();
        let changes_before = q.take_changes().len();
        assert!(matches!(q.push(dup, now), Err(RouterError::DuplicateMessage(_))));
        assert_eq!(q.len(), 1);
        assert_eq!(changes_before, 1);
        assert!(q.take_changes().is_empty());

        let mut stale = msg("a", Priority::Low);
        stale.attempt_count = 2;
        assert!(matches!(q.push(stale, now), Err(RouterError::NotFresh { .. })));
    }

    #[test]
    fn test_retry_then_dead_letter() {
        let now = Utc::now();
        let policy = RetryPolicy::default();
        let mut q = MessageQueue::new();
        let id = q.push(msg("a", Priority::High), now).unwrap();

        let mut clock = now;
        for expected_attempt in 1..=3 {
            let taken = take_all(&mut q, clock);
            assert_eq!(taken.len(), 1);
            let status = q.record_failure(id, "boom", clock, &policy, true);
            assert_eq!(status, Some(DeliveryStatus::Retrying));
            let m = q.message(id).unwrap();
            assert_eq!(m.attempt_count, expected_attempt);
            // Not ready before its backoff expires.
            assert!(take_all(&mut q, clock).is_empty());
            clock = m.retry_at.unwrap();
        }

        take_all(&mut q, clock);
        assert_eq!(
            q.record_failure(id, "boom", clock, &policy, true),
            Some(DeliveryStatus::Failed)
        );
        assert_eq!(q.dead_letter_len(), 1);
        assert_eq!(q.dead_letters()[0].attempt_count, 3);
        assert!(q.is_empty());
        assert_eq!(q.counts().failed, 1);
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let now = Utc::now();
        let mut q = MessageQueue::new();
        let id = q.push(msg("a", Priority::Low), now).unwrap();
        take_all(&mut q, now);
        assert_eq!(
            q.record_failure(id, "gone", now, &RetryPolicy::default(), false),
            Some(DeliveryStatus::Failed)
        );
        assert_eq!(q.dead_letters()[0].attempt_count, 0);
    }

    #[test]
    fn test_requeue_dead_letters_resets_budget() {
        let now = Utc::now();
        let mut q = MessageQueue::new();
        let id = q.push(msg("a", Priority::Low), now).unwrap();
        take_all(&mut q, now);
        q.record_failure(id, "gone", now, &RetryPolicy::default(), false);
        assert_eq!(q.counts().failed, 1);
        assert_eq!(q.depth(), 0);

        assert_eq!(q.requeue_dead_letters(now), vec![id]);
        assert_eq!(q.dead_letter_len(), 0);
        assert_eq!(q.counts().failed, 0);
        assert_eq!(q.depth(), 1);
        let live = q.message(id).unwrap();
        assert_eq!(live.status, DeliveryStatus::Pending);
        assert_eq!(live.attempt_count, 0);
        assert!(live.last_error.is_none());
        assert!(live.closed_at.is_none());
        assert_eq!(take_all(&mut q, now)[0].id, id);
    }

    #[test]
    fn test_drain_dead_letters_empties_list() {
        let now = Utc::now();
        let mut q = MessageQueue::new();
        let id = q.push(msg("a", Priority::Low), now).unwrap();
        take_all(&mut q, now);
        q.record_failure(id, "gone", now, &RetryPolicy::default(), false);

        let drained = q.drain_dead_letters();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].status, DeliveryStatus::Failed);
        assert_eq!(q.dead_letter_len(), 0);
        assert!(q.requeue_dead_letters(now).is_empty());
    }

    #[test]
    fn test_ack_outcomes() {
        let now = Utc::now();
        let mut q = MessageQueue::new();
        let m = msg("a", Priority::Low);
        let corr = m.correlation_id.clone();
        q.push(m, now).unwrap();

        // Not yet in flight.
        assert_eq!(q.acknowledge(&corr, now), AckOutcome::Unknown);
        take_all(&mut q, now);
        assert_eq!(q.acknowledge(&corr, now), AckOutcome::Delivered);
        assert_eq!(q.acknowledge(&corr, now), AckOutcome::Duplicate);
        assert_eq!(
            q.acknowledge(&CorrelationId::from("nope"), now),
            AckOutcome::Unknown
        );
        assert_eq!(q.counts().delivered, 1);
        assert_eq!(q.take_unpersisted().len(), 1);
    }

    #[test]
    fn test_admit_defers_without_consuming() {
        let now = Utc::now();
        let mut q = MessageQueue::new();
        q.push(msg("a", Priority::Normal), now).unwrap();
        let crit = q.push(msg("b", Priority::Critical), now).unwrap();
        let taken = q.take_ready(now, usize::MAX, |m| m.priority == Priority::Critical);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].id, crit);
        assert_eq!(q.depth(), 1);
        assert_eq!(take_all(&mut q, now).len(), 1);
    }

    #[test]
    fn test_overdue_acks() {
        let now = Utc::now();
        let mut q = MessageQueue::new();
        let id = q.push(msg("a", Priority::Low), now).unwrap();
        take_all(&mut q, now);
        assert!(q.overdue_acks(now, Duration::seconds(5)).is_empty());
        q.mark_accepted(id, now);
        assert!(q.overdue_acks(now + Duration::seconds(4), Duration::seconds(5)).is_empty());
        assert_eq!(q.overdue_acks(now + Duration::seconds(5), Duration::seconds(5)), vec![id]);
    }

    #[test]
    fn test_limit_respected() {
        let now = Utc::now();
        let mut q = MessageQueue::new();
        for _ in 0..5 {
            q.push(msg("a", Priority::Low), now).unwrap();
        }
        assert_eq!(q.take_ready(now, 2, |_| true).len(), 2);
        assert_eq!(q.depth(), 3);
    }
}
