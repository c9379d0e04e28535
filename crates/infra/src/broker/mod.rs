//! Message broker: durable, at-least-once hand-off of payloads to workers.
//!
//! A message is delivered to one worker at a time. The worker either
//! completes it or reports a failure; the broker then applies the
//! message's [`DeliveryPolicy`] to decide whether and when to redeliver.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use courier_core::{BrokerMessageId, DeliveryPolicy, EmailPayload};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_queue;

pub use memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis_queue::RedisBroker;

/// A reserved message, owned by one worker until completed or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: BrokerMessageId,
    pub payload: EmailPayload,
    /// 1-indexed attempt number of this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Delivery {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// What the broker decided after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Redelivery is scheduled.
    Retrying { next_attempt: u32, ready_at: DateTime<Utc> },
    /// The attempt budget is spent; the message is parked (or dropped).
    Exhausted { attempts: u32 },
}

/// An exhausted message kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedMessage {
    pub message_id: BrokerMessageId,
    pub payload: EmailPayload,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown broker message: {0}")]
    UnknownMessage(BrokerMessageId),
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Persist a message and make it available for delivery.
    async fn enqueue(
        &self,
        payload: &EmailPayload,
        policy: &DeliveryPolicy,
    ) -> Result<BrokerMessageId, BrokerError>;

    /// Wait up to `wait` for a ready message and reserve it.
    async fn reserve(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a successful attempt.
    async fn complete(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Report a failed attempt and let the retry policy decide what follows.
    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailDisposition, BrokerError>;

    /// Messages that exhausted their attempts and were retained.
    async fn failed_messages(&self) -> Result<Vec<FailedMessage>, BrokerError>;
}
