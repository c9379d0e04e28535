//! Retention scheduler: periodic purge of old job records.
//!
//! Each tick reads the retention configuration and purges when automatic
//! deletion is enabled and the cycle period has elapsed since the last
//! cleanup. Due-ness is derived from the stored `last_cleanup_at`, so a
//! restart never causes an extra purge and a tick right after a purge is a
//! no-op. Two instances ticking at the same moment may both purge; the
//! second deletes whatever the first left, which is harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use courier_core::{Clock, RetentionConfig};

use crate::store::{RecordStore, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("retention cleanup failed: {0}")]
    Store(#[from] StoreError),

    #[error("retention cutoff out of range for delete_after_days = {delete_after_days}")]
    CutoffOutOfRange { delete_after_days: u32 },
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    NotDue,
    Purged { deleted: u64 },
}

/// Result of a purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted: u64,
    pub delete_after_days: u32,
    pub ran_at: DateTime<Utc>,
}

pub struct RetentionScheduler {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    /// Serializes purges started by ticks and by administrators.
    running: Mutex<()>,
}

impl RetentionScheduler {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);

    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            interval: Self::DEFAULT_INTERVAL,
            running: Mutex::new(()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Evaluate the configuration once and purge if due.
    pub async fn tick(&self) -> Result<TickOutcome, SchedulerError> {
        let _guard = self.running.lock().await;
        let now = self.clock.now();
        let config = self.store.retention_config(now).await?;

        if !config.auto_delete_enabled {
            debug!("automatic retention cleanup disabled");
            return Ok(TickOutcome::Disabled);
        }
        if !config.is_due(now) {
            debug!(
                last_cleanup_at = ?config.last_cleanup_at,
                delete_cycle = %config.delete_cycle,
                "retention cleanup not due"
            );
            return Ok(TickOutcome::NotDue);
        }

        let report = self.purge(&config, now).await?;
        Ok(TickOutcome::Purged {
            deleted: report.deleted,
        })
    }

    /// Purge immediately, regardless of whether automatic deletion is
    /// enabled or due.
    pub async fn purge_now(&self) -> Result<CleanupReport, SchedulerError> {
        let _guard = self.running.lock().await;
        let now = self.clock.now();
        let config = self.store.retention_config(now).await?;
        self.purge(&config, now).await
    }

    async fn purge(&self, config: &RetentionConfig, now: DateTime<Utc>) -> Result<CleanupReport, SchedulerError> {
        let cutoff = config
            .cutoff(now)
            .ok_or(SchedulerError::CutoffOutOfRange {
                delete_after_days: config.delete_after_days,
            })?;
        let deleted = self.store.delete_jobs_created_before(cutoff).await?;
        self.store.record_cleanup(now).await?;

        info!(
            deleted,
            delete_after_days = config.delete_after_days,
            cutoff = %cutoff,
            "retention cleanup completed"
        );
        Ok(CleanupReport {
            deleted,
            delete_after_days: config.delete_after_days,
            ran_at: now,
        })
    }

    /// Run a check now and then on every interval until stopped.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = scheduler.interval.as_secs(), "retention scheduler started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        match scheduler.tick().await {
                            Ok(outcome) => debug!(?outcome, "retention tick finished"),
                            Err(err) => error!(error = %err, "retention tick failed"),
                        }
                    }
                }
            }

            info!("retention scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to a started scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop ticking; a tick in progress finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "retention scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    use courier_core::{
        BrokerMessageId, EmailJob, EmailPayload, JobId, ManualClock, NewJob, RetentionUpdate,
    };

    use crate::store::InMemoryRecordStore;

    fn job(id: i64, created_at: DateTime<Utc>) -> EmailJob {
        let payload = EmailPayload::new("a@b.com", "Hi", None, Some("x".into())).unwrap();
        EmailJob::queued(
            JobId::new(id),
            NewJob::from_payload(BrokerMessageId::new(id.to_string()), &payload),
            created_at,
        )
    }

    async fn setup(enabled: bool, last_cleanup: Option<DateTime<Utc>>) -> (Arc<ManualClock>, Arc<InMemoryRecordStore>, RetentionScheduler) {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let store = InMemoryRecordStore::arc();
        store
            .update_retention_config(
                &RetentionUpdate::new(Some(enabled), Some(30), Some("daily")).unwrap(),
                now,
            )
            .await
            .unwrap();
        if let Some(at) = last_cleanup {
            store.record_cleanup(at).await.unwrap();
        }

        store.seed(job(1, now - ChronoDuration::days(31)));
        store.seed(job(2, now - ChronoDuration::days(29)));
        store.seed(job(3, now));

        let scheduler = RetentionScheduler::new(store.clone(), clock.clone());
        (clock, store, scheduler)
    }

    #[tokio::test]
    async fn due_tick_purges_expired_records_and_stamps_cleanup() {
        let (clock, store, scheduler) = setup(true, Some(Utc::now() - ChronoDuration::days(2))).await;

        assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Purged { deleted: 1 });

        let config = store.retention_config(clock.now()).await.unwrap();
        assert_eq!(config.last_cleanup_at, Some(clock.now()));
        assert_eq!(store.count_by_status().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn second_tick_right_after_a_purge_is_not_due() {
        let (clock, store, scheduler) = setup(true, None).await;

        assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Purged { deleted: 1 });
        clock.advance(ChronoDuration::seconds(1));
        assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::NotDue);
        assert_eq!(store.count_by_status().await.unwrap().total, 2);

        clock.advance(ChronoDuration::hours(24));
        assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Purged { deleted: 1 });
    }

    #[tokio::test]
    async fn disabled_config_never_purges_automatically() {
        let (_, store, scheduler) = setup(false, None).await;

        assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Disabled);
        assert_eq!(store.count_by_status().await.unwrap().total, 3);
    }

    #[tokio::test]
    async fn manual_purge_ignores_enabled_flag_and_due_ness() {
        let (clock, store, scheduler) = setup(false, Some(Utc::now())).await;

        let report = scheduler.purge_now().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.delete_after_days, 30);
        assert_eq!(
            store.retention_config(clock.now()).await.unwrap().last_cleanup_at,
            Some(clock.now())
        );

        assert_eq!(scheduler.purge_now().await.unwrap().deleted, 0);
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_scheduler_error() {
        let (_, store, scheduler) = setup(true, None).await;
        store.fail_writes(true);

        assert!(matches!(scheduler.tick().await, Err(SchedulerError::Store(_))));
        store.fail_writes(false);
        assert!(matches!(scheduler.tick().await, Ok(TickOutcome::Purged { .. })));
    }

    async fn set_unrepresentable_retention(store: &InMemoryRecordStore, now: DateTime<Utc>) {
        // Written past validation, as a hand-edited row would be.
        let update = RetentionUpdate {
            delete_after_days: Some(u32::MAX),
            ..RetentionUpdate::default()
        };
        store.update_retention_config(&update, now).await.unwrap();
    }

    #[tokio::test]
    async fn unrepresentable_cutoff_is_an_error_not_a_panic() {
        let (clock, store, scheduler) = setup(true, None).await;
        set_unrepresentable_retention(&store, clock.now()).await;

        assert_eq!(
            scheduler.tick().await,
            Err(SchedulerError::CutoffOutOfRange { delete_after_days: u32::MAX })
        );
        assert!(matches!(
            scheduler.purge_now().await,
            Err(SchedulerError::CutoffOutOfRange { .. })
        ));
        assert_eq!(store.count_by_status().await.unwrap().total, 3);
        assert_eq!(store.retention_config(clock.now()).await.unwrap().last_cleanup_at, None);
    }

    #[tokio::test]
    async fn started_scheduler_survives_a_failing_tick() {
        let (clock, store, scheduler) = setup(true, None).await;
        set_unrepresentable_retention(&store, clock.now()).await;
        let scheduler = Arc::new(scheduler.with_interval(Duration::from_millis(10)));

        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.join.is_finished());
        assert_eq!(store.count_by_status().await.unwrap().total, 3);

        store
            .update_retention_config(&RetentionUpdate::new(None, Some(30), None).unwrap(), clock.now())
            .await
            .unwrap();
        for _ in 0..100 {
            if store.count_by_status().await.unwrap().total == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.stop().await;

        assert_eq!(store.count_by_status().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn started_scheduler_checks_immediately_and_stops() {
        let (_, store, scheduler) = setup(true, None).await;
        let scheduler = Arc::new(scheduler.with_interval(Duration::from_secs(3600)));

        let handle = scheduler.start();
        for _ in 0..100 {
            if store.count_by_status().await.unwrap().total == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.stop().await;

        assert_eq!(store.count_by_status().await.unwrap().total, 2);
    }

    proptest! {
        #[test]
        fn a_purge_is_never_immediately_followed_by_another(
            cycle in prop::sample::select(vec!["daily", "weekly", "monthly"]),
            elapsed_secs in 0i64..(30 * 24 * 3600),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let now = Utc::now();
                let clock = Arc::new(ManualClock::new(now));
                let store = InMemoryRecordStore::arc();
                store
                    .update_retention_config(&RetentionUpdate::new(Some(true), Some(1), Some(cycle)).unwrap(), now)
                    .await
                    .unwrap();
                let scheduler = RetentionScheduler::new(store.clone(), clock.clone());

                assert!(matches!(scheduler.tick().await.unwrap(), TickOutcome::Purged { .. }));
                clock.advance(ChronoDuration::seconds(elapsed_secs));
                let period = cycle.parse::<courier_core::DeleteCycle>().unwrap().period();
                let expected_due = ChronoDuration::seconds(elapsed_secs) > period;
                let second = scheduler.tick().await.unwrap();
                assert_eq!(matches!(second, TickOutcome::Purged { .. }), expected_due);
            });
        }
    }
}
