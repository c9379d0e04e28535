use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::MailWorker;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers; each handles one message at a time
    pub concurrency: usize,
    /// How long one reservation call may wait for a message
    pub reserve_wait: Duration,
    /// Pause after a broker error before reserving again
    pub error_backoff: Duration,
    /// Name prefix for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            reserve_wait: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            name: "mail-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Stop reserving new messages and wait for in-flight sends to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "mail worker task ended abnormally");
            }
        }
    }

    pub fn size(&self) -> usize {
        self.joins.len()
    }
}

/// Pool of workers sharing one broker.
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.concurrency` workers on the current tokio runtime.
    pub fn spawn(worker: Arc<MailWorker>, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..config.concurrency.max(1))
            .map(|index| {
                let name = format!("{}-{}", config.name, index + 1);
                tokio::spawn(worker_loop(
                    name,
                    worker.clone(),
                    config.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(workers = config.concurrency, "mail worker pool started");
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
        }
    }
}

async fn worker_loop(
    name: String,
    worker: Arc<MailWorker>,
    config: WorkerPoolConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let reserved = tokio::select! {
            _ = shutdown_rx.changed() => break,
            reserved = worker.broker().reserve(config.reserve_wait) => reserved,
        };

        match reserved {
            // Not raced against shutdown: an in-flight send always finishes.
            Ok(Some(delivery)) => {
                let outcome = worker.process(&delivery).await;
                tracing::debug!(worker = %name, message_id = %delivery.message_id, outcome = ?outcome, "delivery processed");
            }
            Ok(None) => continue,
            Err(err) => {
                warn!(worker = %name, error = %err, "failed to reserve message");
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(config.error_backoff) => {}
                }
            }
        }
    }

    info!(worker = %name, "mail worker stopped");
}
