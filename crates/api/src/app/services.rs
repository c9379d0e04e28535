//! Service wiring: picks the store, broker and transport adapters and builds
//! the gateway, ledger, worker and scheduler on top of them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use courier_core::{Clock, SystemClock};
use courier_infra::{
    broker::{Broker, InMemoryBroker, RedisBroker},
    config::Settings,
    dispatch::{DispatchGateway, StatusLedger},
    scheduler::RetentionScheduler,
    store::{InMemoryRecordStore, PostgresRecordStore, RecordStore},
    transport::{MailTransport, RecordingTransport, SmtpTransport},
    workers::MailWorker,
};

/// Everything the HTTP handlers and the background tasks share.
pub struct AppServices {
    pub gateway: DispatchGateway,
    pub ledger: StatusLedger,
    pub scheduler: Arc<RetentionScheduler>,
    pub worker: Arc<MailWorker>,
}

impl AppServices {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_timing(
            broker,
            store,
            transport,
            clock,
            MailWorker::DEFAULT_SEND_TIMEOUT,
            RetentionScheduler::DEFAULT_INTERVAL,
        )
    }

    fn with_timing(
        broker: Arc<dyn Broker>,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
        send_timeout: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            gateway: DispatchGateway::new(broker.clone(), store.clone(), clock.clone()),
            ledger: StatusLedger::new(store.clone(), broker.clone(), clock.clone()),
            scheduler: Arc::new(
                RetentionScheduler::new(store.clone(), clock.clone()).with_interval(cleanup_interval),
            ),
            worker: Arc::new(
                MailWorker::new(broker, store, transport, clock).with_send_timeout(send_timeout),
            ),
        }
    }

    /// In-memory store and broker with a recording transport.
    pub fn in_memory(transport: RecordingTransport) -> Self {
        Self::new(
            Arc::new(InMemoryBroker::new()),
            InMemoryRecordStore::arc(),
            Arc::new(transport),
            Arc::new(SystemClock),
        )
    }
}

/// Build services from process settings.
///
/// Postgres and Redis are used when their URLs are configured; otherwise the
/// in-memory adapters stand in, which loses all state on restart.
pub async fn build_services(settings: &Settings) -> anyhow::Result<AppServices> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn RecordStore> = match &settings.database_url {
        Some(url) => {
            let store = PostgresRecordStore::connect(url)
                .await
                .context("failed to connect to postgres")?;
            store
                .ensure_schema()
                .await
                .context("failed to prepare database schema")?;
            info!("using postgres record store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; job records are kept in memory");
            InMemoryRecordStore::arc()
        }
    };

    let broker: Arc<dyn Broker> = match &settings.redis_url {
        Some(url) => {
            let broker = RedisBroker::new(url, None)
                .context("invalid REDIS_URL")?
                .with_clock(clock.clone());
            broker.connect().await.context("failed to connect to redis")?;
            info!("using redis broker");
            Arc::new(broker)
        }
        None => {
            warn!("REDIS_URL not set; queued messages are kept in memory");
            Arc::new(InMemoryBroker::with_clock(clock.clone()))
        }
    };

    let transport: Arc<dyn MailTransport> = match &settings.smtp {
        Some(smtp) => {
            let transport = SmtpTransport::from_settings(smtp).context("invalid SMTP settings")?;
            match transport.verify().await {
                Ok(true) => info!(host = %smtp.host, port = smtp.port, "smtp server ready"),
                Ok(false) => warn!(host = %smtp.host, "smtp server did not accept the connection test"),
                Err(err) => warn!(host = %smtp.host, error = %err, "smtp connection test failed"),
            }
            Arc::new(transport)
        }
        None => {
            warn!("EMAIL_HOST not set; emails are recorded but not sent");
            Arc::new(RecordingTransport::new())
        }
    };

    Ok(AppServices::with_timing(
        broker,
        store,
        transport,
        clock,
        settings.send_timeout,
        settings.cleanup_interval,
    ))
}
