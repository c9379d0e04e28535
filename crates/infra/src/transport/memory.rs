use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use courier_core::EmailPayload;

use super::{MailTransport, TransportError};

#[derive(Debug, Default)]
struct Script {
    /// Outcomes consumed one per send before falling back to `fallback`.
    queued: VecDeque<Result<(), TransportError>>,
    fallback: Option<TransportError>,
    latency: Duration,
    sent: Vec<EmailPayload>,
    calls: usize,
}

/// Transport that records messages instead of sending them.
///
/// Used when no SMTP server is configured and in tests, where outcomes can
/// be scripted per call.
#[derive(Debug, Default, Clone)]
pub struct RecordingTransport {
    script: Arc<Mutex<Script>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send fails with `error`.
    pub fn failing(error: TransportError) -> Self {
        let transport = Self::new();
        transport.lock().fallback = Some(error);
        transport
    }

    /// Queue the outcome of the next unscripted send.
    pub fn push_outcome(&self, outcome: Result<(), TransportError>) {
        self.lock().queued.push_back(outcome);
    }

    /// Delay every send by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<EmailPayload> {
        self.lock().sent.clone()
    }

    /// Number of send calls, successful or not.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, email: &EmailPayload) -> Result<(), TransportError> {
        let (latency, outcome) = {
            let mut script = self.lock();
            script.calls += 1;
            let outcome = match script.queued.pop_front() {
                Some(outcome) => outcome,
                None => script.fallback.clone().map_or(Ok(()), Err),
            };
            (script.latency, outcome)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if outcome.is_ok() {
            tracing::info!(recipient = %email.recipient, subject = %email.subject, "message recorded");
            self.lock().sent.push(email.clone());
        }
        outcome
    }
}
