use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{
    BrokerMessageId, DeleteCycle, EmailJob, JobId, JobStatus, RetentionConfig, StatusCounts,
};

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /api/send-email`.
///
/// Every field is optional at the JSON level so missing fields surface as a
/// validation error rather than a deserialization failure.
#[derive(Debug, Default, Deserialize)]
pub struct SendEmailRequest {
    pub to: Option<String>,
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListEmailsParams {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigRequest {
    pub auto_delete_enabled: Option<bool>,
    pub delete_after_days: Option<i64>,
    pub delete_cycle: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedResponse {
    pub message: &'static str,
    /// Broker message handle.
    pub job_id: BrokerMessageId,
    /// Ledger record id.
    pub email_id: Option<JobId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailJobResponse {
    pub id: JobId,
    pub broker_message_id: BrokerMessageId,
    pub to: String,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl From<EmailJob> for EmailJobResponse {
    fn from(job: EmailJob) -> Self {
        Self {
            id: job.id,
            broker_message_id: job.broker_message_id,
            to: job.recipient,
            subject: job.subject,
            html: job.html_body,
            text: job.text_body,
            status: job.status,
            attempts: job.attempts,
            error: job.error,
            created_at: job.created_at,
            sent_at: job.sent_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub message: &'static str,
    pub id: JobId,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total: u64,
    pub queued: u64,
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

impl From<StatusCounts> for StatsResponse {
    fn from(c: StatusCounts) -> Self {
        Self {
            total: c.total,
            queued: c.queued,
            pending: c.pending,
            sent: c.sent,
            failed: c.failed,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfigResponse {
    pub auto_delete_enabled: bool,
    pub delete_after_days: u32,
    pub delete_cycle: DeleteCycle,
    pub last_cleanup_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<RetentionConfig> for RetentionConfigResponse {
    fn from(c: RetentionConfig) -> Self {
        Self {
            auto_delete_enabled: c.auto_delete_enabled,
            delete_after_days: c.delete_after_days,
            delete_cycle: c.delete_cycle,
            last_cleanup_at: c.last_cleanup_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigUpdatedResponse {
    pub message: &'static str,
    pub config: RetentionConfigResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub message: &'static str,
    pub deleted_count: u64,
    pub delete_after_days: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{EmailPayload, NewJob};

    #[test]
    fn job_response_uses_camel_case_and_request_field_names() {
        let payload = EmailPayload::new("a@b.com", "Hi", None, Some("hello".into())).unwrap();
        let job = EmailJob::queued(
            JobId::new(7),
            NewJob::from_payload(BrokerMessageId::new("42"), &payload),
            Utc::now(),
        );

        let json = serde_json::to_value(EmailJobResponse::from(job)).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["brokerMessageId"], "42");
        assert_eq!(json["to"], "a@b.com");
        assert_eq!(json["status"], "queued");
        assert!(json["sentAt"].is_null());
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn config_update_accepts_camel_case_fields() {
        let body: UpdateConfigRequest =
            serde_json::from_str(r#"{"deleteAfterDays": 14, "deleteCycle": "weekly"}"#).unwrap();
        assert_eq!(body.delete_after_days, Some(14));
        assert_eq!(body.delete_cycle.as_deref(), Some("weekly"));
        assert_eq!(body.auto_delete_enabled, None);
    }
}
