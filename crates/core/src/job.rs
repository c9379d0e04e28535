//! Email job records and their lifecycle.
//!
//! ```text
//! queued ──pickup──▶ pending ──delivered──▶ sent
//!    ▲                  │  ▲
//!    │               failed │ pickup (broker redelivery)
//!    │                  ▼  │
//!    └────requeue───── failed
//! ```
//!
//! `sent` is terminal: every transition out of it is refused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DomainError;
use crate::id::{BrokerMessageId, JobId};

/// Job status as mirrored in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted and waiting in the broker
    Queued,
    /// Picked up by a worker, send in progress
    Pending,
    /// Delivered to the mail transport
    Sent,
    /// Last attempt failed
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Pending,
        JobStatus::Sent,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Pending => "pending",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
        }
    }

    /// No further automatic transition happens from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "pending" => Ok(JobStatus::Pending),
            "sent" => Ok(JobStatus::Sent),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!(
                "status must be one of: queued, pending, sent, failed (got '{other}')"
            ))),
        }
    }
}

/// What travels through the broker.
///
/// `job_id` links a re-enqueued message back to the record it retries; first
/// submissions carry no link because the record is written after enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub recipient: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl EmailPayload {
    /// Build a validated payload.
    ///
    /// Recipient and subject must be non-blank and at least one body must be
    /// present. Blank bodies are treated as absent.
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        html: Option<String>,
        text: Option<String>,
    ) -> Result<Self, DomainError> {
        let recipient = recipient.into().trim().to_string();
        let subject = subject.into();
        let html = html.filter(|b| !b.trim().is_empty());
        let text = text.filter(|b| !b.trim().is_empty());

        if recipient.is_empty() {
            return Err(DomainError::validation("recipient is required"));
        }
        if subject.trim().is_empty() {
            return Err(DomainError::validation("subject is required"));
        }
        if html.is_none() && text.is_none() {
            return Err(DomainError::validation("one of html or text is required"));
        }

        Ok(Self {
            recipient,
            subject,
            html,
            text,
            job_id: None,
        })
    }

    pub fn linked_to(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

/// Fields required to create a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub broker_message_id: BrokerMessageId,
    pub recipient: String,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
}

impl NewJob {
    pub fn from_payload(broker_message_id: BrokerMessageId, payload: &EmailPayload) -> Self {
        Self {
            broker_message_id,
            recipient: payload.recipient.clone(),
            subject: payload.subject.clone(),
            html_body: payload.html.clone(),
            text_body: payload.text.clone(),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJob {
    pub id: JobId,
    pub broker_message_id: BrokerMessageId,
    pub recipient: String,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// A status change requested against a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A worker started an attempt.
    Pickup,
    /// The transport accepted the message.
    Delivered,
    /// The transport failed.
    DeliveryFailed { error: String },
    /// An administrator re-enqueued the job as a new broker message.
    Requeued { broker_message_id: BrokerMessageId },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Pickup => "pickup",
            Transition::Delivered => "delivered",
            Transition::DeliveryFailed { .. } => "delivery_failed",
            Transition::Requeued { .. } => "requeued",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job {0} was already sent")]
    AlreadySent(JobId),
}

impl EmailJob {
    /// Create a freshly queued record.
    pub fn queued(id: JobId, new: NewJob, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            broker_message_id: new.broker_message_id,
            recipient: new.recipient,
            subject: new.subject,
            html_body: new.html_body,
            text_body: new.text_body,
            status: JobStatus::Queued,
            attempts: 0,
            error: None,
            created_at,
            sent_at: None,
        }
    }

    /// Rebuild the broker payload for a retry of this record.
    pub fn payload(&self) -> EmailPayload {
        EmailPayload {
            recipient: self.recipient.clone(),
            subject: self.subject.clone(),
            html: self.html_body.clone(),
            text: self.text_body.clone(),
            job_id: Some(self.id),
        }
    }

    /// Apply a transition in place.
    ///
    /// Keeps `sent_at` non-null iff sent and `error` non-null only if failed.
    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status == JobStatus::Sent {
            return Err(TransitionError::AlreadySent(self.id));
        }

        match transition {
            Transition::Pickup => {
                self.status = JobStatus::Pending;
                self.error = None;
            }
            Transition::Delivered => {
                self.status = JobStatus::Sent;
                self.sent_at = Some(now);
                self.error = None;
                self.attempts = self.attempts.saturating_add(1);
            }
            Transition::DeliveryFailed { error } => {
                self.status = JobStatus::Failed;
                self.error = Some(error.clone());
                self.attempts = self.attempts.saturating_add(1);
            }
            Transition::Requeued { broker_message_id } => {
                self.broker_message_id = broker_message_id.clone();
                // A worker may already have picked up the new message.
                if self.status == JobStatus::Failed {
                    self.status = JobStatus::Queued;
                    self.error = None;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> EmailJob {
        let payload = EmailPayload::new("a@b.com", "Hi", None, Some("hello".into())).unwrap();
        EmailJob::queued(
            JobId::new(1),
            NewJob::from_payload(BrokerMessageId::new("1"), &payload),
            Utc::now(),
        )
    }

    #[test]
    fn payload_requires_recipient_subject_and_a_body() {
        assert!(EmailPayload::new("", "Hi", None, Some("x".into())).is_err());
        assert!(EmailPayload::new("a@b.com", "  ", None, Some("x".into())).is_err());
        assert!(EmailPayload::new("a@b.com", "Hi", None, None).is_err());
        assert!(EmailPayload::new("a@b.com", "Hi", Some(" ".into()), Some("".into())).is_err());
        assert!(EmailPayload::new("a@b.com", "Hi", Some("<p>x</p>".into()), None).is_ok());
    }

    #[test]
    fn successful_attempt_sets_sent_at_and_counts_once() {
        let mut job = job();
        let now = Utc::now();

        job.apply(&Transition::Pickup, now).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);

        job.apply(&Transition::Delivered, now).unwrap();
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.sent_at, Some(now));
        assert_eq!(job.attempts, 1);
        assert!(job.error.is_none());
    }

    #[test]
    fn failure_then_redelivery_clears_error_while_pending() {
        let mut job = job();
        let now = Utc::now();

        job.apply(&Transition::Pickup, now).unwrap();
        job.apply(&Transition::DeliveryFailed { error: "boom".into() }, now).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.sent_at.is_none());

        job.apply(&Transition::Pickup, now).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn sent_is_terminal() {
        let mut job = job();
        let now = Utc::now();
        job.apply(&Transition::Delivered, now).unwrap();

        for t in [
            Transition::Pickup,
            Transition::Delivered,
            Transition::DeliveryFailed { error: "late".into() },
            Transition::Requeued { broker_message_id: BrokerMessageId::new("2") },
        ] {
            assert_eq!(job.apply(&t, now), Err(TransitionError::AlreadySent(job.id)));
        }
        assert_eq!(job.attempts, 1);
        assert_eq!(job.status, JobStatus::Sent);
    }

    #[test]
    fn requeue_rebinds_message_and_keeps_history() {
        let mut job = job();
        let now = Utc::now();
        job.apply(&Transition::DeliveryFailed { error: "boom".into() }, now).unwrap();

        job.apply(
            &Transition::Requeued { broker_message_id: BrokerMessageId::new("9") },
            now,
        )
        .unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.broker_message_id.as_str(), "9");
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("SENT".parse::<JobStatus>().unwrap(), JobStatus::Sent);
        assert!("bounced".parse::<JobStatus>().is_err());
    }
}
