//! Redis-backed broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - `{prefix}:seq`: message id counter (`INCR`)
//! - `{prefix}:msg:{id}`: hash with `payload`, `policy`, `attempts`, `state`,
//!   `reserved_at`, and for exhausted messages `reason` and `failed_at`
//! - `{prefix}:wait`: list of ready ids (`LPUSH` in, `RPOPLPUSH` out)
//! - `{prefix}:active`: list of reserved ids
//! - `{prefix}:delayed`: sorted set of backing-off ids scored by ready time (ms)
//! - `{prefix}:failed`: list of exhausted, retained ids
//!
//! A reservation moves the id from `wait` to `active` atomically, so a
//! message is held by one consumer at a time. Reservations older than the
//! lease are returned to `wait`; a crashed worker's message is redelivered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use courier_core::{BrokerMessageId, Clock, DeliveryPolicy, EmailPayload, SystemClock};

use super::{Broker, BrokerError, Delivery, FailDisposition, FailedMessage};

/// Default key prefix
const DEFAULT_PREFIX: &str = "courier:mail";

/// How long a reservation may stay unacknowledged before it is redelivered
const DEFAULT_LEASE: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct RedisBroker {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    prefix: String,
    lease: Duration,
    clock: Arc<dyn Clock>,
    last_stall_check: Mutex<Option<Instant>>,
}

impl core::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Create a broker for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// The connection is opened on first use.
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            conn: OnceCell::new(),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            lease: DEFAULT_LEASE,
            clock: Arc::new(SystemClock),
            last_stall_check: Mutex::new(None),
        })
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Open the connection now instead of on first use.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.conn
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| BrokerError::Connection(e.to_string()))
            })
            .await
            .cloned()
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn message_key(&self, id: &BrokerMessageId) -> String {
        format!("{}:msg:{}", self.prefix, id)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Move delayed messages whose backoff has elapsed onto the wait list.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<(), BrokerError> {
        let delayed_key = self.key("delayed");
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed_key)
            .arg("-inf")
            .arg(self.now_ms())
            .query_async(conn)
            .await
            .map_err(|e| command_error("ZRANGEBYSCORE", e))?;

        for id in due {
            // Only the consumer that wins the ZREM promotes the message.
            let removed: u64 = redis::cmd("ZREM")
                .arg(&delayed_key)
                .arg(&id)
                .query_async(conn)
                .await
                .map_err(|e| command_error("ZREM", e))?;
            if removed == 1 {
                let _: u64 = redis::cmd("LPUSH")
                    .arg(self.key("wait"))
                    .arg(&id)
                    .query_async(conn)
                    .await
                    .map_err(|e| command_error("LPUSH", e))?;
            }
        }
        Ok(())
    }

    /// Return reservations older than the lease to the wait list.
    async fn requeue_stalled(&self, conn: &mut MultiplexedConnection) -> Result<(), BrokerError> {
        {
            let mut last = self.last_stall_check.lock().unwrap_or_else(|e| e.into_inner());
            if last.is_some_and(|at| at.elapsed() < self.lease / 2) {
                return Ok(());
            }
            *last = Some(Instant::now());
        }

        let active_key = self.key("active");
        let active: Vec<String> = redis::cmd("LRANGE")
            .arg(&active_key)
            .arg(0)
            .arg(-1)
            .query_async(conn)
            .await
            .map_err(|e| command_error("LRANGE", e))?;

        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);
        let now = self.now_ms();
        for id in active {
            let reserved_at: Option<i64> = redis::cmd("HGET")
                .arg(self.message_key(&BrokerMessageId::new(id.clone())))
                .arg("reserved_at")
                .query_async(conn)
                .await
                .map_err(|e| command_error("HGET", e))?;

            if reserved_at.is_some_and(|at| now - at > lease_ms) {
                let removed: u64 = redis::cmd("LREM")
                    .arg(&active_key)
                    .arg(1)
                    .arg(&id)
                    .query_async(conn)
                    .await
                    .map_err(|e| command_error("LREM", e))?;
                if removed == 1 {
                    warn!(message_id = %id, "reservation lease expired, requeueing");
                    let _: u64 = redis::cmd("LPUSH")
                        .arg(self.key("wait"))
                        .arg(&id)
                        .query_async(conn)
                        .await
                        .map_err(|e| command_error("LPUSH", e))?;
                }
            }
        }
        Ok(())
    }

    async fn try_reserve(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.connection().await?;
        self.requeue_stalled(&mut conn).await?;
        self.promote_due(&mut conn).await?;

        let id: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(self.key("wait"))
            .arg(self.key("active"))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("RPOPLPUSH", e))?;
        let Some(id) = id else {
            return Ok(None);
        };
        let message_id = BrokerMessageId::new(id);
        let key = self.message_key(&message_id);

        let (attempt, _, payload, policy): (u32, u64, Option<String>, Option<String>) = redis::pipe()
            .atomic()
            .cmd("HINCRBY")
            .arg(&key)
            .arg("attempts")
            .arg(1)
            .cmd("HSET")
            .arg(&key)
            .arg("state")
            .arg("active")
            .arg("reserved_at")
            .arg(self.now_ms())
            .cmd("HGET")
            .arg(&key)
            .arg("payload")
            .cmd("HGET")
            .arg(&key)
            .arg("policy")
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("reserve", e))?;

        let (Some(payload), Some(policy)) = (payload, policy) else {
            // The hash vanished (e.g. expired by an operator); drop the orphaned id.
            let _: u64 = redis::cmd("LREM")
                .arg(self.key("active"))
                .arg(1)
                .arg(message_id.as_str())
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("LREM", e))?;
            return Err(BrokerError::UnknownMessage(message_id));
        };

        let payload: EmailPayload = decode(&payload)?;
        let policy: DeliveryPolicy = decode(&policy)?;

        Ok(Some(Delivery {
            message_id,
            payload,
            attempt,
            max_attempts: policy.retry.max_attempts,
        }))
    }

    /// Remove the id from the active list; errors if it was not reserved.
    async fn release(
        &self,
        conn: &mut MultiplexedConnection,
        id: &BrokerMessageId,
    ) -> Result<(), BrokerError> {
        let removed: u64 = redis::cmd("LREM")
            .arg(self.key("active"))
            .arg(1)
            .arg(id.as_str())
            .query_async(conn)
            .await
            .map_err(|e| command_error("LREM", e))?;
        if removed == 0 {
            return Err(BrokerError::UnknownMessage(id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip(self, payload, policy), fields(prefix = %self.prefix), err)]
    async fn enqueue(
        &self,
        payload: &EmailPayload,
        policy: &DeliveryPolicy,
    ) -> Result<BrokerMessageId, BrokerError> {
        let payload = encode(payload)?;
        let policy = encode(policy)?;
        let mut conn = self.connection().await?;

        let seq: u64 = redis::cmd("INCR")
            .arg(self.key("seq"))
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("INCR", e))?;
        let id = BrokerMessageId::new(seq.to_string());

        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.message_key(&id))
            .arg("payload")
            .arg(&payload)
            .arg("policy")
            .arg(&policy)
            .arg("attempts")
            .arg(0)
            .arg("state")
            .arg("waiting")
            .ignore()
            .cmd("LPUSH")
            .arg(self.key("wait"))
            .arg(id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("enqueue", e))?;

        debug!(message_id = %id, "message enqueued");
        Ok(id)
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_reserve().await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(POLL_INTERVAL)).await;
        }
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        self.release(&mut conn, &delivery.message_id).await?;

        let key = self.message_key(&delivery.message_id);
        let policy: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg("policy")
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("HGET", e))?;
        let remove = match policy {
            Some(raw) => decode::<DeliveryPolicy>(&raw)?.remove_on_complete,
            None => true,
        };

        if remove {
            let _: u64 = redis::cmd("DEL")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("DEL", e))?;
        } else {
            let _: u64 = redis::cmd("HSET")
                .arg(&key)
                .arg("state")
                .arg("completed")
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("HSET", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id, attempt = delivery.attempt), err)]
    async fn fail(&self, delivery: &Delivery, reason: &str) -> Result<FailDisposition, BrokerError> {
        let mut conn = self.connection().await?;
        self.release(&mut conn, &delivery.message_id).await?;

        let key = self.message_key(&delivery.message_id);
        let (policy, attempts): (Option<String>, Option<u32>) = redis::cmd("HMGET")
            .arg(&key)
            .arg("policy")
            .arg("attempts")
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("HMGET", e))?;
        let policy: DeliveryPolicy = match policy {
            Some(raw) => decode(&raw)?,
            None => return Err(BrokerError::UnknownMessage(delivery.message_id.clone())),
        };
        let attempts = attempts.unwrap_or(delivery.attempt);
        let now = self.clock.now();

        if policy.retry.should_retry(attempts) {
            let delay = policy.retry.delay_after_attempt(attempts);
            let ready_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));

            let _: () = redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(&key)
                .arg("state")
                .arg("delayed")
                .ignore()
                .cmd("ZADD")
                .arg(self.key("delayed"))
                .arg(ready_at.timestamp_millis())
                .arg(delivery.message_id.as_str())
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("fail", e))?;

            return Ok(FailDisposition::Retrying {
                next_attempt: attempts + 1,
                ready_at,
            });
        }

        if policy.retain_failed {
            let _: () = redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(&key)
                .arg("state")
                .arg("failed")
                .arg("reason")
                .arg(reason)
                .arg("failed_at")
                .arg(now.timestamp_millis())
                .ignore()
                .cmd("RPUSH")
                .arg(self.key("failed"))
                .arg(delivery.message_id.as_str())
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("fail", e))?;
        } else {
            let _: u64 = redis::cmd("DEL")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("DEL", e))?;
        }

        warn!(
            message_id = %delivery.message_id,
            attempts,
            retained = policy.retain_failed,
            "message exhausted its delivery attempts"
        );
        Ok(FailDisposition::Exhausted { attempts })
    }

    async fn failed_messages(&self) -> Result<Vec<FailedMessage>, BrokerError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key("failed"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("LRANGE", e))?;

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let message_id = BrokerMessageId::new(id);
            let (payload, attempts, reason, failed_at): (Option<String>, Option<u32>, Option<String>, Option<i64>) =
                redis::cmd("HMGET")
                    .arg(self.message_key(&message_id))
                    .arg("payload")
                    .arg("attempts")
                    .arg("reason")
                    .arg("failed_at")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| command_error("HMGET", e))?;

            let Some(payload) = payload else {
                continue;
            };
            messages.push(FailedMessage {
                message_id,
                payload: decode(&payload)?,
                attempts: attempts.unwrap_or(0),
                reason: reason.unwrap_or_default(),
                failed_at: failed_at
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            });
        }
        Ok(messages)
    }
}

fn command_error(command: &str, err: redis::RedisError) -> BrokerError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        BrokerError::Connection(format!("{command} failed: {err}"))
    } else {
        BrokerError::Command(format!("{command} failed: {err}"))
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, BrokerError> {
    serde_json::to_string(value).map_err(|e| BrokerError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, BrokerError> {
    serde_json::from_str(raw).map_err(|e| BrokerError::Serialization(e.to_string()))
}
