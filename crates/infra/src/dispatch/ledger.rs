use std::sync::Arc;

use tracing::{info, instrument};

use courier_core::{
    BrokerMessageId, Clock, DeliveryPolicy, EmailJob, JobId, JobStatus, ListQuery, Page,
    RetentionConfig, RetentionUpdate, StatusCounts, Transition,
};

use super::DispatchError;
use crate::broker::Broker;
use crate::store::{JobKey, RecordStore};

/// Outcome of an administrative retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReceipt {
    pub job_id: JobId,
    pub broker_message_id: BrokerMessageId,
}

/// Query and administration surface over job records and retention settings.
pub struct StatusLedger {
    store: Arc<dyn RecordStore>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    policy: DeliveryPolicy,
}

impl StatusLedger {
    pub fn new(store: Arc<dyn RecordStore>, broker: Arc<dyn Broker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            broker,
            clock,
            policy: DeliveryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn list(&self, query: &ListQuery) -> Result<Page<EmailJob>, DispatchError> {
        Ok(self.store.list_jobs(query).await?)
    }

    pub async fn get(&self, id: JobId) -> Result<EmailJob, DispatchError> {
        self.store
            .job(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("email {id} not found")))
    }

    pub async fn get_by_broker_message_id(&self, id: &BrokerMessageId) -> Result<EmailJob, DispatchError> {
        self.store
            .job_by_broker_message(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("no email for broker message {id}")))
    }

    #[instrument(skip(self), err)]
    pub async fn delete(&self, id: JobId) -> Result<(), DispatchError> {
        if self.store.delete_job(id).await? {
            info!(job_id = %id, "email record deleted");
            Ok(())
        } else {
            Err(DispatchError::NotFound(format!("email {id} not found")))
        }
    }

    /// Re-enqueue a job that has not been sent.
    ///
    /// The new message carries a link to this record, so the worker keeps
    /// updating the same record. Sent jobs are refused before anything is
    /// enqueued.
    #[instrument(skip(self), err)]
    pub async fn retry(&self, id: JobId) -> Result<RetryReceipt, DispatchError> {
        let job = self.get(id).await?;
        if job.status == JobStatus::Sent {
            return Err(DispatchError::InvalidState(
                "cannot retry an email that was already sent".into(),
            ));
        }

        let broker_message_id = self.broker.enqueue(&job.payload(), &self.policy).await?;
        // A worker finishing the previous message in between makes this a
        // refusal; the new message is then acknowledged as a duplicate.
        self.store
            .transition(
                &JobKey::Id(id),
                &Transition::Requeued {
                    broker_message_id: broker_message_id.clone(),
                },
                self.clock.now(),
            )
            .await?;

        info!(job_id = %id, message_id = %broker_message_id, "email re-enqueued");
        Ok(RetryReceipt {
            job_id: id,
            broker_message_id,
        })
    }

    pub async fn stats(&self) -> Result<StatusCounts, DispatchError> {
        Ok(self.store.count_by_status().await?)
    }

    pub async fn retention_config(&self) -> Result<RetentionConfig, DispatchError> {
        Ok(self.store.retention_config(self.clock.now()).await?)
    }

    #[instrument(skip(self), err)]
    pub async fn update_retention_config(
        &self,
        update: &RetentionUpdate,
    ) -> Result<RetentionConfig, DispatchError> {
        let config = self
            .store
            .update_retention_config(update, self.clock.now())
            .await?;
        info!(
            auto_delete_enabled = config.auto_delete_enabled,
            delete_after_days = config.delete_after_days,
            delete_cycle = %config.delete_cycle,
            "retention config updated"
        );
        Ok(config)
    }
}
