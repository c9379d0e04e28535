//! Processing of a single reserved message.
//!
//! Per delivery:
//! - mark the record `pending` (best effort)
//! - send through the transport, bounded by a timeout
//! - mirror the result into the record (best effort)
//! - acknowledge success to the broker, or report the failure so its retry
//!   policy decides about redelivery
//!
//! Record writes never decide the broker outcome. The one exception is a
//! record that refuses the pickup because it is already `sent`: that message
//! is a duplicate delivery and is acknowledged without sending again.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use courier_core::{Clock, Transition};

use crate::broker::{Broker, Delivery, FailDisposition};
use crate::store::{JobKey, RecordStore, StoreError};
use crate::transport::{MailTransport, TransportError};

/// How many times a terminal write is retried when the record is not there yet.
const MISSING_RECORD_RETRIES: u32 = 3;
const MISSING_RECORD_BACKOFF: Duration = Duration::from_millis(50);

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Failed(String),
    /// The record was already sent; acknowledged without calling the transport.
    Duplicate,
}

/// Result of mirroring a status change into the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Applied,
    /// No record matched.
    Missing,
    /// The record refused the change (already sent).
    Refused,
    /// The store failed; the change was not recorded.
    Deferred(StoreError),
}

pub struct MailWorker {
    broker: Arc<dyn Broker>,
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn MailTransport>,
    clock: Arc<dyn Clock>,
    send_timeout: Duration,
}

impl MailWorker {
    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            store,
            transport,
            clock,
            send_timeout: Self::DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Handle one reserved message to completion.
    pub async fn process(&self, delivery: &Delivery) -> DeliveryOutcome {
        let key = match delivery.payload.job_id {
            Some(id) => JobKey::Id(id),
            None => JobKey::BrokerMessage(delivery.message_id.clone()),
        };
        debug!(
            message_id = %delivery.message_id,
            attempt = delivery.attempt,
            key = %key,
            "processing delivery"
        );

        if self.mirror(&key, &Transition::Pickup, 0).await == MirrorOutcome::Refused {
            info!(message_id = %delivery.message_id, "record already sent, acknowledging duplicate delivery");
            self.acknowledge(delivery).await;
            return DeliveryOutcome::Duplicate;
        }

        match self.send(delivery).await {
            Ok(()) => {
                self.mirror(&key, &Transition::Delivered, MISSING_RECORD_RETRIES).await;
                self.acknowledge(delivery).await;
                info!(
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt,
                    recipient = %delivery.payload.recipient,
                    "email sent"
                );
                DeliveryOutcome::Sent
            }
            Err(err) => {
                let reason = err.to_string();
                self.mirror(
                    &key,
                    &Transition::DeliveryFailed {
                        error: reason.clone(),
                    },
                    MISSING_RECORD_RETRIES,
                )
                .await;
                self.report_failure(delivery, &reason).await;
                DeliveryOutcome::Failed(reason)
            }
        }
    }

    async fn send(&self, delivery: &Delivery) -> Result<(), TransportError> {
        match tokio::time::timeout(self.send_timeout, self.transport.send(&delivery.payload)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.send_timeout)),
        }
    }

    /// Apply a transition to the record, logging anything other than success.
    ///
    /// `missing_retries` covers the window where the gateway has enqueued a
    /// message but not yet written its record.
    async fn mirror(&self, key: &JobKey, transition: &Transition, missing_retries: u32) -> MirrorOutcome {
        let mut tries = 0;
        loop {
            let outcome = match self.store.transition(key, transition, self.clock.now()).await {
                Ok(_) => MirrorOutcome::Applied,
                Err(StoreError::NotFound(_)) => MirrorOutcome::Missing,
                Err(StoreError::Transition(_)) => MirrorOutcome::Refused,
                Err(err) => MirrorOutcome::Deferred(err),
            };

            if outcome == MirrorOutcome::Missing && tries < missing_retries {
                tries += 1;
                tokio::time::sleep(MISSING_RECORD_BACKOFF * tries).await;
                continue;
            }

            match &outcome {
                MirrorOutcome::Applied => {}
                MirrorOutcome::Missing => {
                    warn!(key = %key, transition = transition.name(), "no job record to update")
                }
                MirrorOutcome::Refused => {
                    debug!(key = %key, transition = transition.name(), "job record refused transition")
                }
                MirrorOutcome::Deferred(err) => error!(
                    key = %key,
                    transition = transition.name(),
                    error = %err,
                    "failed to update job record"
                ),
            }
            return outcome;
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) {
        if let Err(err) = self.broker.complete(delivery).await {
            error!(message_id = %delivery.message_id, error = %err, "failed to acknowledge message");
        }
    }

    async fn report_failure(&self, delivery: &Delivery, reason: &str) {
        match self.broker.fail(delivery, reason).await {
            Ok(FailDisposition::Retrying { next_attempt, ready_at }) => warn!(
                message_id = %delivery.message_id,
                attempt = delivery.attempt,
                next_attempt,
                ready_at = %ready_at,
                error = %reason,
                "email send failed, retry scheduled"
            ),
            Ok(FailDisposition::Exhausted { attempts }) => error!(
                message_id = %delivery.message_id,
                attempts,
                error = %reason,
                "email send failed, attempts exhausted"
            ),
            Err(err) => error!(
                message_id = %delivery.message_id,
                error = %err,
                "failed to report send failure to broker"
            ),
        }
    }
}
