use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use courier_core::{BrokerMessageId, Clock, DeliveryPolicy, EmailPayload, SystemClock};

use super::{Broker, BrokerError, Delivery, FailDisposition, FailedMessage};

/// How often a waiting `reserve` re-checks delayed messages.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

#[derive(Debug)]
struct Entry {
    payload: EmailPayload,
    policy: DeliveryPolicy,
    attempts_made: u32,
    state: EntryState,
    failure: Option<(String, DateTime<Utc>)>,
}

#[derive(Debug, Default)]
struct Queue {
    last_id: u64,
    entries: HashMap<BrokerMessageId, Entry>,
    waiting: VecDeque<BrokerMessageId>,
    delayed: Vec<(DateTime<Utc>, BrokerMessageId)>,
    failed: Vec<BrokerMessageId>,
}

impl Queue {
    /// Move delayed messages whose backoff has elapsed to the back of the wait list.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(at, _)| *at);
        let due = self.delayed.partition_point(|(at, _)| *at <= now);
        for (_, id) in self.delayed.drain(..due) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.state = EntryState::Waiting;
                self.waiting.push_back(id);
            }
        }
    }

    fn active_entry(&mut self, id: &BrokerMessageId) -> Result<&mut Entry, BrokerError> {
        match self.entries.get_mut(id) {
            Some(entry) if entry.state == EntryState::Active => Ok(entry),
            _ => Err(BrokerError::UnknownMessage(id.clone())),
        }
    }
}

/// In-process broker for tests/dev.
///
/// Backoff readiness is judged by the injected [`Clock`], so tests can drive
/// retries by advancing a manual clock instead of sleeping.
pub struct InMemoryBroker {
    clock: Arc<dyn Clock>,
    queue: Mutex<Queue>,
    ready: Notify,
}

impl core::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryBroker").finish_non_exhaustive()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queue: Mutex::new(Queue::default()),
            ready: Notify::new(),
        }
    }

    /// Total number of messages ever enqueued.
    pub fn enqueued_count(&self) -> u64 {
        self.lock().last_id
    }

    /// Messages waiting or backing off.
    pub fn pending_count(&self) -> usize {
        let queue = self.lock();
        queue.waiting.len() + queue.delayed.len()
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_reserve(&self) -> Option<Delivery> {
        let mut queue = self.lock();
        queue.promote_due(self.clock.now());

        let id = queue.waiting.pop_front()?;
        let entry = queue.entries.get_mut(&id)?;
        entry.state = EntryState::Active;
        entry.attempts_made += 1;

        Some(Delivery {
            message_id: id,
            payload: entry.payload.clone(),
            attempt: entry.attempts_made,
            max_attempts: entry.policy.retry.max_attempts,
        })
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(
        &self,
        payload: &EmailPayload,
        policy: &DeliveryPolicy,
    ) -> Result<BrokerMessageId, BrokerError> {
        let id = {
            let mut queue = self.lock();
            queue.last_id += 1;
            let id = BrokerMessageId::new(queue.last_id.to_string());
            queue.entries.insert(
                id.clone(),
                Entry {
                    payload: payload.clone(),
                    policy: policy.clone(),
                    attempts_made: 0,
                    state: EntryState::Waiting,
                    failure: None,
                },
            );
            queue.waiting.push_back(id.clone());
            id
        };
        self.ready.notify_one();
        Ok(id)
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.ready.notified();
            if let Some(delivery) = self.try_reserve() {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout((deadline - now).min(POLL_INTERVAL), notified).await;
        }
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut queue = self.lock();
        let entry = queue.active_entry(&delivery.message_id)?;
        if entry.policy.remove_on_complete {
            queue.entries.remove(&delivery.message_id);
        } else {
            entry.state = EntryState::Completed;
        }
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailDisposition, BrokerError> {
        let now = self.clock.now();
        let disposition = {
            let mut queue = self.lock();
            let entry = queue.active_entry(&delivery.message_id)?;
            let attempts = entry.attempts_made;

            if entry.policy.retry.should_retry(attempts) {
                let delay = entry.policy.retry.delay_after_attempt(attempts);
                let ready_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
                entry.state = EntryState::Delayed;
                queue.delayed.push((ready_at, delivery.message_id.clone()));
                FailDisposition::Retrying {
                    next_attempt: attempts + 1,
                    ready_at,
                }
            } else {
                if entry.policy.retain_failed {
                    entry.state = EntryState::Failed;
                    entry.failure = Some((reason.to_string(), now));
                    queue.failed.push(delivery.message_id.clone());
                } else {
                    queue.entries.remove(&delivery.message_id);
                }
                FailDisposition::Exhausted { attempts }
            }
        };

        if matches!(disposition, FailDisposition::Retrying { .. }) {
            self.ready.notify_one();
        }
        Ok(disposition)
    }

    async fn failed_messages(&self) -> Result<Vec<FailedMessage>, BrokerError> {
        let queue = self.lock();
        Ok(queue
            .failed
            .iter()
            .filter_map(|id| {
                let entry = queue.entries.get(id)?;
                let (reason, failed_at) = entry.failure.clone()?;
                Some(FailedMessage {
                    message_id: id.clone(),
                    payload: entry.payload.clone(),
                    attempts: entry.attempts_made,
                    reason,
                    failed_at,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ManualClock, RetryPolicy};

    fn payload() -> EmailPayload {
        EmailPayload::new("a@b.com", "Hi", None, Some("hello".into())).unwrap()
    }

    fn broker() -> (Arc<ManualClock>, InMemoryBroker) {
        let clock = Arc::new(ManualClock::default());
        let broker = InMemoryBroker::with_clock(clock.clone());
        (clock, broker)
    }

    #[tokio::test]
    async fn messages_are_delivered_in_enqueue_order_to_one_consumer() {
        let (_, broker) = broker();
        let first = broker.enqueue(&payload(), &DeliveryPolicy::default()).await.unwrap();
        let second = broker.enqueue(&payload(), &DeliveryPolicy::default()).await.unwrap();
        assert_ne!(first, second);

        let a = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        let b = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a.message_id, first);
        assert_eq!(b.message_id, second);
        assert_eq!(a.attempt, 1);
        assert!(broker.reserve(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_attempt_is_redelivered_only_after_backoff() {
        let (clock, broker) = broker();
        let id = broker.enqueue(&payload(), &DeliveryPolicy::default()).await.unwrap();

        let delivery = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        let disposition = broker.fail(&delivery, "smtp down").await.unwrap();
        assert!(matches!(disposition, FailDisposition::Retrying { next_attempt: 2, .. }));

        assert!(broker.reserve(Duration::from_millis(10)).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(5));
        let retry = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(retry.message_id, id);
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn exhausted_messages_are_retained_for_inspection() {
        let (clock, broker) = broker();
        broker.enqueue(&payload(), &DeliveryPolicy::default()).await.unwrap();

        for attempt in 1..=3 {
            let delivery = broker.reserve(Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(delivery.attempt, attempt);
            assert_eq!(delivery.is_last_attempt(), attempt == 3);
            let disposition = broker.fail(&delivery, "rejected").await.unwrap();
            if attempt == 3 {
                assert_eq!(disposition, FailDisposition::Exhausted { attempts: 3 });
            }
            clock.advance(chrono::Duration::seconds(5));
        }

        assert!(broker.reserve(Duration::ZERO).await.unwrap().is_none());
        let failed = broker.failed_messages().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(failed[0].reason, "rejected");
    }

    #[tokio::test]
    async fn completed_messages_cannot_be_acknowledged_twice() {
        let (_, broker) = broker();
        broker.enqueue(&payload(), &DeliveryPolicy::default()).await.unwrap();
        let delivery = broker.reserve(Duration::ZERO).await.unwrap().unwrap();

        broker.complete(&delivery).await.unwrap();
        assert_eq!(
            broker.complete(&delivery).await,
            Err(BrokerError::UnknownMessage(delivery.message_id.clone()))
        );
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn single_attempt_policy_without_retention_drops_on_failure() {
        let (_, broker) = broker();
        let policy = DeliveryPolicy {
            retry: RetryPolicy::fixed(1, Duration::from_secs(1)),
            remove_on_complete: true,
            retain_failed: false,
        };
        broker.enqueue(&payload(), &policy).await.unwrap();
        let delivery = broker.reserve(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(
            broker.fail(&delivery, "nope").await.unwrap(),
            FailDisposition::Exhausted { attempts: 1 }
        );
        assert!(broker.failed_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn waiting_reserve_wakes_on_enqueue() {
        let (_, broker) = broker();
        let broker = Arc::new(broker);

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.reserve(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.enqueue(&payload(), &DeliveryPolicy::default()).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap();
        assert!(delivery.is_some());
    }
}
