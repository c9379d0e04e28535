//! Listing queries over job records.

use core::cmp::Ordering;

use serde::Serialize;

use crate::error::DomainError;
use crate::job::{EmailJob, JobStatus};

pub const DEFAULT_PER_PAGE: u32 = 10;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    Id,
    #[default]
    CreatedAt,
    SentAt,
    Status,
    Recipient,
    Subject,
    Attempts,
}

impl SortField {
    /// Column name in the relational schema.
    pub fn column(&self) -> &'static str {
        match self {
            SortField::Id => "id",
            SortField::CreatedAt => "created_at",
            SortField::SentAt => "sent_at",
            SortField::Status => "status",
            SortField::Recipient => "recipient",
            SortField::Subject => "subject",
            SortField::Attempts => "attempts",
        }
    }

    pub fn compare(&self, a: &EmailJob, b: &EmailJob) -> Ordering {
        match self {
            SortField::Id => a.id.cmp(&b.id),
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::SentAt => a.sent_at.cmp(&b.sent_at),
            SortField::Status => a.status.as_str().cmp(b.status.as_str()),
            SortField::Recipient => a.recipient.cmp(&b.recipient),
            SortField::Subject => a.subject.cmp(&b.subject),
            SortField::Attempts => a.attempts.cmp(&b.attempts),
        }
    }
}

impl core::str::FromStr for SortField {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(SortField::Id),
            "createdAt" | "created_at" => Ok(SortField::CreatedAt),
            "sentAt" | "sent_at" => Ok(SortField::SentAt),
            "status" => Ok(SortField::Status),
            "to" | "recipient" => Ok(SortField::Recipient),
            "subject" => Ok(SortField::Subject),
            "attempts" => Ok(SortField::Attempts),
            other => Err(DomainError::validation(format!("cannot sort by '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl core::str::FromStr for SortOrder {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(DomainError::validation("sort_order must be one of: asc, desc")),
        }
    }
}

/// Filter, sort and page selection for `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub page: u32,
    pub per_page: u32,
    pub status: Option<JobStatus>,
    pub search: Option<String>,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
            status: None,
            search: None,
            sort_by: SortField::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl ListQuery {
    /// Build a query from raw request parameters.
    ///
    /// Page and page size are clamped into range; unknown status, sort field
    /// or order are rejected.
    pub fn parse(
        page: Option<i64>,
        per_page: Option<i64>,
        status: Option<&str>,
        search: Option<&str>,
        sort_by: Option<&str>,
        sort_order: Option<&str>,
    ) -> Result<Self, DomainError> {
        let page = page.unwrap_or(1).clamp(1, i64::from(u32::MAX)) as u32;
        let per_page = per_page
            .unwrap_or(i64::from(DEFAULT_PER_PAGE))
            .clamp(1, i64::from(MAX_PER_PAGE)) as u32;
        let status = status
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .transpose()?;
        let search = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let sort_by = sort_by.map(str::parse).transpose()?.unwrap_or_default();
        let sort_order = sort_order.map(str::parse).transpose()?.unwrap_or_default();

        Ok(Self {
            page,
            per_page,
            status,
            search,
            sort_by,
            sort_order,
        })
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }

    /// Whether a record passes the status and search filters.
    pub fn matches(&self, job: &EmailJob) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        match &self.search {
            Some(needle) => job.recipient.contains(needle.as_str()) || job.subject.contains(needle.as_str()),
            None => true,
        }
    }

    pub fn compare(&self, a: &EmailJob, b: &EmailJob) -> Ordering {
        let ord = self.sort_by.compare(a, b).then_with(|| a.id.cmp(&b.id));
        match self.sort_order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }
}

/// One page of results plus the totals for the whole filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub pages: u64,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, total: u64, query: &ListQuery) -> Self {
        Self {
            data,
            total,
            page: query.page,
            per_page: query.per_page,
            pages: total.div_ceil(u64::from(query.per_page)),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            per_page: self.per_page,
            pages: self.pages,
        }
    }
}

/// Per-status record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub queued: u64,
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn record(&mut self, status: JobStatus, n: u64) {
        self.total += n;
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Pending => self.pending += n,
            JobStatus::Sent => self.sent += n,
            JobStatus::Failed => self.failed += n,
        }
    }
}
