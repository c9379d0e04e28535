//! Integration tests for the full dispatch pipeline.
//!
//! Tests: Gateway → Broker → Worker → Transport, with the record store mirrored
//! along the way and read back through the status ledger.
//!
//! Verifies:
//! - Accepted submissions end `sent` with one attempt
//! - Persistent transport failures end `failed` after the full retry budget
//! - Administrative retry re-drives the same record
//! - Listing totals and page counts follow the filter

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use courier_core::{Clock, JobStatus, ListQuery, ManualClock};

    use crate::broker::{Broker, InMemoryBroker};
    use crate::dispatch::{DispatchGateway, StatusLedger};
    use crate::store::{InMemoryRecordStore, RecordStore};
    use crate::transport::{RecordingTransport, TransportError};
    use crate::workers::{DeliveryOutcome, MailWorker};

    struct Pipeline {
        clock: Arc<ManualClock>,
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryRecordStore>,
        transport: RecordingTransport,
        gateway: DispatchGateway,
        ledger: StatusLedger,
        worker: MailWorker,
    }

    fn pipeline(transport: RecordingTransport) -> Pipeline {
        let clock = Arc::new(ManualClock::default());
        let broker = Arc::new(InMemoryBroker::with_clock(clock.clone()));
        let store = InMemoryRecordStore::arc();

        let gateway = DispatchGateway::new(broker.clone(), store.clone(), clock.clone());
        let ledger = StatusLedger::new(store.clone(), broker.clone(), clock.clone());
        let worker = MailWorker::new(
            broker.clone(),
            store.clone(),
            Arc::new(transport.clone()),
            clock.clone(),
        );

        Pipeline {
            clock,
            broker,
            store,
            transport,
            gateway,
            ledger,
            worker,
        }
    }

    impl Pipeline {
        /// Reserve and process the next ready message, if any.
        async fn drain_one(&self) -> Option<DeliveryOutcome> {
            let delivery = self.broker.reserve(Duration::ZERO).await.unwrap()?;
            Some(self.worker.process(&delivery).await)
        }
    }

    #[tokio::test]
    async fn submitted_email_is_delivered_once() {
        let p = pipeline(RecordingTransport::new());

        let submission = p
            .gateway
            .submit("a@b.com", "Hi", None, Some("hello".into()))
            .await
            .unwrap();
        let job_id = submission.job_id.unwrap();
        assert_eq!(p.ledger.get(job_id).await.unwrap().status, JobStatus::Queued);

        assert_eq!(p.drain_one().await, Some(DeliveryOutcome::Sent));
        assert_eq!(p.drain_one().await, None);

        let job = p.ledger.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.sent_at, Some(p.clock.now()));
        assert_eq!(job.broker_message_id, submission.broker_message_id);
        assert_eq!(p.transport.sent()[0].recipient, "a@b.com");
    }

    #[tokio::test]
    async fn always_failing_transport_exhausts_three_attempts() {
        let p = pipeline(RecordingTransport::failing(TransportError::Smtp(
            "connection refused".into(),
        )));

        let job_id = p
            .gateway
            .submit("a@b.com", "Hi", None, Some("hello".into()))
            .await
            .unwrap()
            .job_id
            .unwrap();

        let mut attempts_seen = Vec::new();
        for _ in 0..3 {
            let outcome = p.drain_one().await;
            assert!(matches!(outcome, Some(DeliveryOutcome::Failed(_))));
            attempts_seen.push(p.ledger.get(job_id).await.unwrap().attempts);

            // Nothing is redelivered before the 5s backoff elapses.
            assert_eq!(p.drain_one().await, None);
            p.clock.advance(ChronoDuration::seconds(5));
        }
        assert_eq!(p.drain_one().await, None);

        assert_eq!(attempts_seen, vec![1, 2, 3]);
        let job = p.ledger.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.error.unwrap().contains("connection refused"));
        assert_eq!(p.transport.calls(), 3);

        let parked = p.broker.failed_messages().await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].attempts, 3);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_redelivery() {
        let transport = RecordingTransport::new();
        transport.push_outcome(Err(TransportError::Smtp("421 try later".into())));
        let p = pipeline(transport);

        let job_id = p
            .gateway
            .submit("a@b.com", "Hi", Some("<p>hi</p>".into()), None)
            .await
            .unwrap()
            .job_id
            .unwrap();

        assert!(matches!(p.drain_one().await, Some(DeliveryOutcome::Failed(_))));
        let failed = p.ledger.get(job_id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.sent_at.is_none());

        p.clock.advance(ChronoDuration::seconds(5));
        assert_eq!(p.drain_one().await, Some(DeliveryOutcome::Sent));

        let job = p.ledger.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.attempts, 2);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn manual_retry_redrives_the_same_record() {
        let transport = RecordingTransport::failing(TransportError::Rejected("550".into()));
        let p = pipeline(transport.clone());

        let job_id = p
            .gateway
            .submit("a@b.com", "Hi", None, Some("hello".into()))
            .await
            .unwrap()
            .job_id
            .unwrap();
        for _ in 0..3 {
            p.drain_one().await;
            p.clock.advance(ChronoDuration::seconds(5));
        }
        assert_eq!(p.ledger.get(job_id).await.unwrap().status, JobStatus::Failed);

        // The next send succeeds.
        transport.push_outcome(Ok(()));
        let receipt = p.ledger.retry(job_id).await.unwrap();
        assert_eq!(p.ledger.get(job_id).await.unwrap().status, JobStatus::Queued);

        assert_eq!(p.drain_one().await, Some(DeliveryOutcome::Sent));
        let job = p.ledger.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.attempts, 4);
        assert_eq!(job.broker_message_id, receipt.broker_message_id);
        assert_eq!(p.store.count_by_status().await.unwrap().total, 1);

        // Sent records cannot be retried again.
        assert!(p.ledger.retry(job_id).await.is_err());
    }

    #[tokio::test]
    async fn listing_reports_filter_totals_and_page_count() {
        let p = pipeline(RecordingTransport::new());

        for i in 0..7 {
            let subject = if i % 2 == 0 { "Invoice" } else { "Welcome" };
            p.gateway
                .submit(&format!("user{i}@example.com"), subject, None, Some("x".into()))
                .await
                .unwrap();
        }
        // Deliver two of them.
        p.drain_one().await;
        p.drain_one().await;

        let query = ListQuery::parse(Some(1), Some(3), None, Some("Invoice"), None, None).unwrap();
        let page = p.ledger.list(&query).await.unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.pages, 2);
        assert_eq!(page.data.len(), 3);

        let sent = ListQuery::parse(None, None, Some("sent"), None, None, None).unwrap();
        let page = p.ledger.list(&sent).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.pages, 1);
        assert!(page.data.iter().all(|j| j.status == JobStatus::Sent));

        let second = ListQuery::parse(Some(3), Some(3), None, None, Some("id"), Some("asc")).unwrap();
        let page = p.ledger.list(&second).await.unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.pages, 3);
        assert_eq!(page.data.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_workers_deliver_each_message_once() {
        let p = Arc::new(pipeline(RecordingTransport::new()));
        for i in 0..10 {
            p.gateway
                .submit(&format!("u{i}@example.com"), "Hi", None, Some("x".into()))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let p = p.clone();
            tasks.push(tokio::spawn(async move {
                let mut n = 0;
                while p.drain_one().await.is_some() {
                    n += 1;
                }
                n
            }));
        }
        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }

        assert_eq!(total, 10);
        assert_eq!(p.transport.sent().len(), 10);
        assert_eq!(p.ledger.stats().await.unwrap().sent, 10);
    }
}
