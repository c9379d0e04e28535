//! Record store: durable job records and the retention configuration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{
    BrokerMessageId, EmailJob, JobId, ListQuery, NewJob, Page, RetentionConfig, RetentionUpdate,
    StatusCounts, Transition, TransitionError,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;

/// How a transition locates its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKey {
    Id(JobId),
    BrokerMessage(BrokerMessageId),
}

impl core::fmt::Display for JobKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            JobKey::Id(id) => write!(f, "job {id}"),
            JobKey::BrokerMessage(id) => write!(f, "broker message {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("storage error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Persistence boundary for job records and retention configuration.
///
/// Implementations must apply transitions atomically per record, using
/// [`EmailJob::apply`] so that the lifecycle rules hold for every backend.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Create a `queued` record and assign its id.
    async fn insert_job(&self, job: NewJob, created_at: DateTime<Utc>) -> Result<EmailJob, StoreError>;

    async fn job(&self, id: JobId) -> Result<Option<EmailJob>, StoreError>;

    async fn job_by_broker_message(&self, id: &BrokerMessageId) -> Result<Option<EmailJob>, StoreError>;

    /// Apply a status transition and return the updated record.
    ///
    /// Fails with `NotFound` when no record matches and with `Transition`
    /// when the record refuses the change (it was already sent).
    async fn transition(
        &self,
        key: &JobKey,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<EmailJob, StoreError>;

    async fn list_jobs(&self, query: &ListQuery) -> Result<Page<EmailJob>, StoreError>;

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError>;

    /// Returns whether a record was removed.
    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError>;

    /// Remove records created strictly before `cutoff`; returns how many.
    async fn delete_jobs_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Read the retention configuration, creating it with defaults on first use.
    async fn retention_config(&self, now: DateTime<Utc>) -> Result<RetentionConfig, StoreError>;

    async fn update_retention_config(
        &self,
        update: &RetentionUpdate,
        now: DateTime<Utc>,
    ) -> Result<RetentionConfig, StoreError>;

    /// Stamp `last_cleanup_at`.
    async fn record_cleanup(&self, at: DateTime<Utc>) -> Result<RetentionConfig, StoreError>;
}
