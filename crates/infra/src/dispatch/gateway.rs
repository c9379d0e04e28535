use std::sync::Arc;

use tracing::{error, info, instrument};

use courier_core::{BrokerMessageId, Clock, DeliveryPolicy, EmailPayload, JobId, NewJob};

use super::DispatchError;
use crate::broker::Broker;
use crate::store::RecordStore;

/// Result of an accepted submission.
///
/// `job_id` is absent when the message was enqueued but its record could not
/// be written; the message is still delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: Option<JobId>,
    pub broker_message_id: BrokerMessageId,
}

/// Accepts send requests: validate, enqueue, then record.
pub struct DispatchGateway {
    broker: Arc<dyn Broker>,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    policy: DeliveryPolicy,
}

impl DispatchGateway {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            broker,
            store,
            clock,
            policy: DeliveryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Validate and enqueue a message.
    ///
    /// Nothing is enqueued or written when validation fails. Success means
    /// the broker durably holds the message, not that it was delivered.
    #[instrument(skip(self, subject, html, text), fields(recipient = %recipient), err)]
    pub async fn submit(
        &self,
        recipient: &str,
        subject: &str,
        html: Option<String>,
        text: Option<String>,
    ) -> Result<Submission, DispatchError> {
        let payload = EmailPayload::new(recipient, subject, html, text)?;
        let broker_message_id = self.broker.enqueue(&payload, &self.policy).await?;

        let new_job = NewJob::from_payload(broker_message_id.clone(), &payload);
        let job_id = match self.store.insert_job(new_job, self.clock.now()).await {
            Ok(job) => Some(job.id),
            Err(err) => {
                error!(
                    message_id = %broker_message_id,
                    error = %err,
                    "message enqueued but its job record could not be written"
                );
                None
            }
        };

        info!(message_id = %broker_message_id, job_id = ?job_id, "email accepted");
        Ok(Submission {
            job_id,
            broker_message_id,
        })
    }
}
