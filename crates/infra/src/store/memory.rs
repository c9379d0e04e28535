use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{
    BrokerMessageId, EmailJob, JobId, ListQuery, NewJob, Page, RetentionConfig, RetentionUpdate,
    StatusCounts, Transition,
};

use super::{JobKey, RecordStore, StoreError};

#[derive(Debug, Default)]
struct Tables {
    jobs: BTreeMap<JobId, EmailJob>,
    last_id: i64,
    retention: Option<RetentionConfig>,
}

/// In-memory record store for tests/dev.
///
/// Writes can be switched off with [`InMemoryRecordStore::fail_writes`] to
/// simulate an unavailable database.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    tables: RwLock<Tables>,
    reject_writes: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every subsequent write fail with a backend error (or stop doing so).
    pub fn fail_writes(&self, fail: bool) {
        self.reject_writes.store(fail, Ordering::SeqCst);
    }

    /// Insert a fully formed record, keeping its id. Test fixtures use this to
    /// seed records with arbitrary timestamps.
    pub fn seed(&self, job: EmailJob) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.last_id = tables.last_id.max(job.id.get());
        tables.jobs.insert(job.id, job);
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::backend("record store is unavailable"));
        }
        Ok(self.tables.write().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_job(&self, job: NewJob, created_at: DateTime<Utc>) -> Result<EmailJob, StoreError> {
        let mut tables = self.write()?;
        if tables
            .jobs
            .values()
            .any(|j| j.broker_message_id == job.broker_message_id)
        {
            return Err(StoreError::backend(format!(
                "duplicate broker message id {}",
                job.broker_message_id
            )));
        }
        tables.last_id += 1;
        let record = EmailJob::queued(JobId::new(tables.last_id), job, created_at);
        tables.jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn job(&self, id: JobId) -> Result<Option<EmailJob>, StoreError> {
        Ok(self.read().jobs.get(&id).cloned())
    }

    async fn job_by_broker_message(&self, id: &BrokerMessageId) -> Result<Option<EmailJob>, StoreError> {
        Ok(self
            .read()
            .jobs
            .values()
            .find(|j| &j.broker_message_id == id)
            .cloned())
    }

    async fn transition(
        &self,
        key: &JobKey,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<EmailJob, StoreError> {
        let mut tables = self.write()?;
        let record = match key {
            JobKey::Id(id) => tables.jobs.get_mut(id),
            JobKey::BrokerMessage(message_id) => tables
                .jobs
                .values_mut()
                .find(|j| &j.broker_message_id == message_id),
        }
        .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        // Work on a copy so a refused transition leaves the record untouched.
        let mut updated = record.clone();
        updated.apply(transition, now)?;
        *record = updated.clone();
        Ok(updated)
    }

    async fn list_jobs(&self, query: &ListQuery) -> Result<Page<EmailJob>, StoreError> {
        let tables = self.read();
        let mut matching: Vec<&EmailJob> = tables.jobs.values().filter(|j| query.matches(j)).collect();
        matching.sort_by(|a, b| query.compare(a, b));

        let total = matching.len() as u64;
        let data = matching
            .into_iter()
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(query.per_page as usize)
            .cloned()
            .collect();

        Ok(Page::new(data, total, query))
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let mut counts = StatusCounts::default();
        for job in self.read().jobs.values() {
            counts.record(job.status, 1);
        }
        Ok(counts)
    }

    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.write()?.jobs.remove(&id).is_some())
    }

    async fn delete_jobs_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let before = tables.jobs.len();
        tables.jobs.retain(|_, j| j.created_at >= cutoff);
        Ok((before - tables.jobs.len()) as u64)
    }

    async fn retention_config(&self, now: DateTime<Utc>) -> Result<RetentionConfig, StoreError> {
        if let Some(config) = self.read().retention.clone() {
            return Ok(config);
        }
        let mut tables = self.write()?;
        Ok(tables
            .retention
            .get_or_insert_with(|| RetentionConfig::defaults(now))
            .clone())
    }

    async fn update_retention_config(
        &self,
        update: &RetentionUpdate,
        now: DateTime<Utc>,
    ) -> Result<RetentionConfig, StoreError> {
        let mut tables = self.write()?;
        let config = tables
            .retention
            .get_or_insert_with(|| RetentionConfig::defaults(now));
        config.apply(update, now);
        Ok(config.clone())
    }

    async fn record_cleanup(&self, at: DateTime<Utc>) -> Result<RetentionConfig, StoreError> {
        let mut tables = self.write()?;
        let config = tables
            .retention
            .get_or_insert_with(|| RetentionConfig::defaults(at));
        config.last_cleanup_at = Some(at);
        config.updated_at = at;
        Ok(config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use courier_core::{DeleteCycle, EmailPayload, JobStatus};

    fn new_job(message_id: &str, recipient: &str) -> NewJob {
        let payload = EmailPayload::new(recipient, "Hello", None, Some("body".into())).unwrap();
        NewJob::from_payload(BrokerMessageId::new(message_id), &payload)
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids_and_queued_status() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();

        let a = store.insert_job(new_job("m1", "a@x.io"), now).await.unwrap();
        let b = store.insert_job(new_job("m2", "b@x.io"), now).await.unwrap();

        assert!(b.id > a.id);
        assert_eq!(a.status, JobStatus::Queued);
        assert_eq!(a.attempts, 0);
        assert_eq!(
            store
                .job_by_broker_message(&BrokerMessageId::new("m2"))
                .await
                .unwrap()
                .map(|j| j.id),
            Some(b.id)
        );
    }

    #[tokio::test]
    async fn refused_transition_leaves_record_untouched() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let job = store.insert_job(new_job("m1", "a@x.io"), now).await.unwrap();
        let key = JobKey::Id(job.id);

        store.transition(&key, &Transition::Delivered, now).await.unwrap();
        let err = store
            .transition(&key, &Transition::DeliveryFailed { error: "late".into() }, now)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Transition(_)));
        let stored = store.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Sent);
        assert_eq!(stored.attempts, 1);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn transition_on_unknown_key_is_not_found() {
        let store = InMemoryRecordStore::new();
        let err = store
            .transition(
                &JobKey::BrokerMessage(BrokerMessageId::new("nope")),
                &Transition::Pickup,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn purge_removes_only_strictly_older_records() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let cutoff = now - Duration::days(30);

        store.insert_job(new_job("old", "a@x.io"), cutoff - Duration::seconds(1)).await.unwrap();
        store.insert_job(new_job("edge", "a@x.io"), cutoff).await.unwrap();
        store.insert_job(new_job("new", "a@x.io"), now).await.unwrap();

        assert_eq!(store.delete_jobs_created_before(cutoff).await.unwrap(), 1);
        assert_eq!(store.count_by_status().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn retention_config_is_created_once_with_defaults() {
        let store = InMemoryRecordStore::new();
        let t0 = Utc::now();

        let first = store.retention_config(t0).await.unwrap();
        let second = store.retention_config(t0 + Duration::hours(1)).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.auto_delete_enabled);
        assert_eq!(first.delete_after_days, 30);
        assert_eq!(first.delete_cycle, DeleteCycle::Daily);

        let update = RetentionUpdate::new(Some(true), Some(7), Some("weekly")).unwrap();
        let updated = store.update_retention_config(&update, t0).await.unwrap();
        assert!(updated.auto_delete_enabled);
        assert_eq!(updated.delete_cycle, DeleteCycle::Weekly);

        let stamped = store.record_cleanup(t0).await.unwrap();
        assert_eq!(stamped.last_cleanup_at, Some(t0));
        assert_eq!(stamped.delete_after_days, 7);
    }

    #[tokio::test]
    async fn unavailable_store_rejects_writes_but_serves_reads() {
        let store = InMemoryRecordStore::new();
        let job = store.insert_job(new_job("m1", "a@x.io"), Utc::now()).await.unwrap();

        store.fail_writes(true);
        assert!(store.insert_job(new_job("m2", "a@x.io"), Utc::now()).await.is_err());
        assert!(store.job(job.id).await.unwrap().is_some());

        store.fail_writes(false);
        assert!(store.insert_job(new_job("m2", "a@x.io"), Utc::now()).await.is_ok());
    }
}
