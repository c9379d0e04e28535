//! Postgres-backed record store.
//!
//! ## Schema
//!
//! - `email_jobs`: one row per job record, `id` assigned by a `BIGSERIAL`.
//!   `broker_message_id` is unique; a check constraint requires one body.
//! - `retention_config`: a single row pinned to `id = 1`.
//!
//! Transitions lock the target row (`SELECT ... FOR UPDATE`) and run the
//! domain lifecycle rules before writing, so concurrent workers and
//! administrators never interleave on one record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;

use courier_core::{
    BrokerMessageId, EmailJob, JobId, JobStatus, ListQuery, NewJob, Page, RetentionConfig,
    RetentionUpdate, SortOrder, StatusCounts, Transition,
};

use super::{JobKey, RecordStore, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS email_jobs (
        id                 BIGSERIAL PRIMARY KEY,
        broker_message_id  TEXT NOT NULL UNIQUE,
        recipient          TEXT NOT NULL,
        subject            TEXT NOT NULL,
        html_body          TEXT NULL,
        text_body          TEXT NULL,
        status             TEXT NOT NULL DEFAULT 'queued'
                           CHECK (status IN ('queued', 'pending', 'sent', 'failed')),
        attempts           INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        error              TEXT NULL,
        created_at         TIMESTAMPTZ NOT NULL,
        sent_at            TIMESTAMPTZ NULL,
        CHECK (html_body IS NOT NULL OR text_body IS NOT NULL)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS email_jobs_status_idx ON email_jobs (status)",
    "CREATE INDEX IF NOT EXISTS email_jobs_created_at_idx ON email_jobs (created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS retention_config (
        id                   SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
        auto_delete_enabled  BOOLEAN NOT NULL DEFAULT FALSE,
        delete_after_days    INTEGER NOT NULL DEFAULT 30 CHECK (delete_after_days >= 1),
        delete_cycle         TEXT NOT NULL DEFAULT 'daily'
                             CHECK (delete_cycle IN ('daily', 'weekly', 'monthly')),
        last_cleanup_at      TIMESTAMPTZ NULL,
        updated_at           TIMESTAMPTZ NOT NULL
    )
    "#,
];

const JOB_COLUMNS: &str = "id, broker_message_id, recipient, subject, html_body, text_body, \
                           status, attempts, error, created_at, sent_at";

const RETENTION_COLUMNS: &str =
    "auto_delete_enabled, delete_after_days, delete_cycle, last_cleanup_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a small pool sized for one service instance.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn ensure_retention_row(
        executor: impl sqlx::PgExecutor<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO retention_config (id, updated_at)
            VALUES (1, $1)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(now)
        .execute(executor)
        .await
        .map_err(|e| map_sqlx_error("ensure_retention_row", e))?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self, job), fields(message_id = %job.broker_message_id), err)]
    async fn insert_job(&self, job: NewJob, created_at: DateTime<Utc>) -> Result<EmailJob, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO email_jobs (broker_message_id, recipient, subject, html_body, text_body, status, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, 'queued', 0, $6)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.broker_message_id.as_str())
        .bind(&job.recipient)
        .bind(&job.subject)
        .bind(&job.html_body)
        .bind(&job.text_body)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        JobRow::from_row(&row)
            .map_err(|e| map_sqlx_error("insert_job", e))?
            .try_into()
    }

    async fn job(&self, id: JobId) -> Result<Option<EmailJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM email_jobs WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("job", e))?;

        row.map(|r| decode_job(&r, "job")).transpose()
    }

    async fn job_by_broker_message(&self, id: &BrokerMessageId) -> Result<Option<EmailJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM email_jobs WHERE broker_message_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_by_broker_message", e))?;

        row.map(|r| decode_job(&r, "job_by_broker_message")).transpose()
    }

    #[instrument(skip(self, key, transition, now), fields(key = %key, transition = transition.name()), err)]
    async fn transition(
        &self,
        key: &JobKey,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<EmailJob, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("transition", e))?;

        let row = match key {
            JobKey::Id(id) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM email_jobs WHERE id = $1 FOR UPDATE"
                ))
                .bind(id.get())
                .fetch_optional(&mut *tx)
                .await
            }
            JobKey::BrokerMessage(message_id) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM email_jobs WHERE broker_message_id = $1 FOR UPDATE"
                ))
                .bind(message_id.as_str())
                .fetch_optional(&mut *tx)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("transition", e))?
        .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let mut job = decode_job(&row, "transition")?;
        // Dropping the transaction on refusal rolls back and releases the lock.
        job.apply(transition, now)?;

        sqlx::query(
            r#"
            UPDATE email_jobs
            SET broker_message_id = $2, status = $3, attempts = $4, error = $5, sent_at = $6
            WHERE id = $1
            "#,
        )
        .bind(job.id.get())
        .bind(job.broker_message_id.as_str())
        .bind(job.status.as_str())
        .bind(to_db_int("attempts", job.attempts)?)
        .bind(&job.error)
        .bind(job.sent_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("transition", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("transition", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(page = query.page, per_page = query.per_page), err)]
    async fn list_jobs(&self, query: &ListQuery) -> Result<Page<EmailJob>, StoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM email_jobs");
        push_filters(&mut count, query);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let direction = query.sort_order.as_sql();
        let nulls = match query.sort_order {
            SortOrder::Asc => "NULLS FIRST",
            SortOrder::Desc => "NULLS LAST",
        };

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM email_jobs"));
        push_filters(&mut select, query);
        select
            .push(format!(
                " ORDER BY {} {direction} {nulls}, id {direction} LIMIT ",
                query.sort_by.column()
            ))
            .push_bind(i64::from(query.per_page))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));

        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let data = rows
            .iter()
            .map(|r| decode_job(r, "list_jobs"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page::new(data, total.max(0) as u64, query))
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM email_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("count_by_status", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("count_by_status", e))?;
            counts.record(parse_status(&status)?, n.max(0) as u64);
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn delete_job(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM email_jobs WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn delete_jobs_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM email_jobs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_jobs_created_before", e))?;
        Ok(result.rows_affected())
    }

    async fn retention_config(&self, now: DateTime<Utc>) -> Result<RetentionConfig, StoreError> {
        Self::ensure_retention_row(&self.pool, now).await?;

        let row = sqlx::query(&format!(
            "SELECT {RETENTION_COLUMNS} FROM retention_config WHERE id = 1"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("retention_config", e))?;

        decode_retention(&row)
    }

    #[instrument(skip(self, now), err)]
    async fn update_retention_config(
        &self,
        update: &RetentionUpdate,
        now: DateTime<Utc>,
    ) -> Result<RetentionConfig, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("update_retention_config", e))?;

        Self::ensure_retention_row(&mut *tx, now).await?;
        let row = sqlx::query(&format!(
            "SELECT {RETENTION_COLUMNS} FROM retention_config WHERE id = 1 FOR UPDATE"
        ))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_retention_config", e))?;

        let mut config = decode_retention(&row)?;
        config.apply(update, now);

        sqlx::query(
            r#"
            UPDATE retention_config
            SET auto_delete_enabled = $1, delete_after_days = $2, delete_cycle = $3, updated_at = $4
            WHERE id = 1
            "#,
        )
        .bind(config.auto_delete_enabled)
        .bind(to_db_int("delete_after_days", config.delete_after_days)?)
        .bind(config.delete_cycle.as_str())
        .bind(config.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_retention_config", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("update_retention_config", e))?;
        Ok(config)
    }

    async fn record_cleanup(&self, at: DateTime<Utc>) -> Result<RetentionConfig, StoreError> {
        Self::ensure_retention_row(&self.pool, at).await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE retention_config
            SET last_cleanup_at = $1, updated_at = $1
            WHERE id = 1
            RETURNING {RETENTION_COLUMNS}
            "#
        ))
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_cleanup", e))?;

        decode_retention(&row)
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &ListQuery) {
    let mut separator = " WHERE ";
    if let Some(status) = query.status {
        builder.push(separator).push("status = ").push_bind(status.as_str());
        separator = " AND ";
    }
    if let Some(needle) = &query.search {
        let pattern = format!("%{}%", escape_like(needle));
        builder
            .push(separator)
            .push("(recipient LIKE ")
            .push_bind(pattern.clone())
            .push(" OR subject LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

/// Escape LIKE metacharacters so the search is a literal substring match.
fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::backend(format!("unknown job status in storage: {raw}")))
}

fn decode_job(row: &PgRow, operation: &str) -> Result<EmailJob, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error(operation, e))?
        .try_into()
}

fn decode_retention(row: &PgRow) -> Result<RetentionConfig, StoreError> {
    let get_err = |e| map_sqlx_error("retention_config", e);
    let days: i32 = row.try_get("delete_after_days").map_err(get_err)?;
    let cycle: String = row.try_get("delete_cycle").map_err(get_err)?;

    Ok(RetentionConfig {
        auto_delete_enabled: row.try_get("auto_delete_enabled").map_err(get_err)?,
        delete_after_days: u32::try_from(days)
            .map_err(|_| StoreError::backend(format!("invalid delete_after_days in storage: {days}")))?,
        delete_cycle: cycle
            .parse()
            .map_err(|_| StoreError::backend(format!("invalid delete_cycle in storage: {cycle}")))?,
        last_cleanup_at: row.try_get("last_cleanup_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

#[derive(Debug)]
struct JobRow {
    id: i64,
    broker_message_id: String,
    recipient: String,
    subject: String,
    html_body: Option<String>,
    text_body: Option<String>,
    status: String,
    attempts: i32,
    error: Option<String>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            broker_message_id: row.try_get("broker_message_id")?,
            recipient: row.try_get("recipient")?,
            subject: row.try_get("subject")?,
            html_body: row.try_get("html_body")?,
            text_body: row.try_get("text_body")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
        })
    }
}

impl TryFrom<JobRow> for EmailJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(EmailJob {
            id: JobId::new(row.id),
            broker_message_id: BrokerMessageId::new(row.broker_message_id),
            recipient: row.recipient,
            subject: row.subject,
            html_body: row.html_body,
            text_body: row.text_body,
            status: parse_status(&row.status)?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            error: row.error,
            created_at: row.created_at,
            sent_at: row.sent_at,
        })
    }
}

/// Narrow a counter to the `INTEGER` column type; out-of-range values are refused.
fn to_db_int(column: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::backend(format!("{column} out of range: {value}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            match code.as_str() {
                // unique_violation
                "23505" => StoreError::backend(format!(
                    "duplicate record in {operation}: {}",
                    db_err.message()
                )),
                // check_violation
                "23514" => StoreError::backend(format!(
                    "constraint rejected {operation}: {}",
                    db_err.message()
                )),
                _ => StoreError::backend(format!("database error in {operation}: {}", db_err.message())),
            }
        }
        sqlx::Error::PoolClosed => StoreError::backend(format!("connection pool closed in {operation}")),
        sqlx::Error::PoolTimedOut => StoreError::backend(format!("connection pool timed out in {operation}")),
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("row not found in {operation}")),
        other => StoreError::backend(format!("{operation} failed: {other}")),
    }
}
