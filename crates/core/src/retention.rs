//! Retention policy for delivery records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// How often the purge is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteCycle {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl DeleteCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteCycle::Daily => "daily",
            DeleteCycle::Weekly => "weekly",
            DeleteCycle::Monthly => "monthly",
        }
    }

    /// Minimum time between two purges. A month is 30 days.
    pub fn period(&self) -> Duration {
        match self {
            DeleteCycle::Daily => Duration::hours(24),
            DeleteCycle::Weekly => Duration::hours(7 * 24),
            DeleteCycle::Monthly => Duration::hours(30 * 24),
        }
    }
}

impl core::fmt::Display for DeleteCycle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for DeleteCycle {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(DeleteCycle::Daily),
            "weekly" => Ok(DeleteCycle::Weekly),
            "monthly" => Ok(DeleteCycle::Monthly),
            _ => Err(DomainError::validation(
                "deleteCycle must be one of: daily, weekly, monthly",
            )),
        }
    }
}

/// The singleton retention configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub auto_delete_enabled: bool,
    pub delete_after_days: u32,
    pub delete_cycle: DeleteCycle,
    pub last_cleanup_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RetentionConfig {
    pub const DEFAULT_DELETE_AFTER_DAYS: u32 = 30;
    /// Upper bound on `delete_after_days` (one hundred years).
    pub const MAX_DELETE_AFTER_DAYS: u32 = 36_500;

    /// Defaults used when the record is created lazily.
    pub fn defaults(now: DateTime<Utc>) -> Self {
        Self {
            auto_delete_enabled: false,
            delete_after_days: Self::DEFAULT_DELETE_AFTER_DAYS,
            delete_cycle: DeleteCycle::Daily,
            last_cleanup_at: None,
            updated_at: now,
        }
    }

    /// Whether a purge should run at `now`.
    ///
    /// Never-run configs are always due; otherwise the elapsed time must
    /// strictly exceed the cycle period.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_cleanup_at {
            None => true,
            Some(last) => now - last > self.delete_cycle.period(),
        }
    }

    /// Records created strictly before this instant are expired.
    ///
    /// `None` when the instant is not representable.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(Duration::days(i64::from(self.delete_after_days)))
    }

    pub fn apply(&mut self, update: &RetentionUpdate, now: DateTime<Utc>) {
        if let Some(enabled) = update.auto_delete_enabled {
            self.auto_delete_enabled = enabled;
        }
        if let Some(days) = update.delete_after_days {
            self.delete_after_days = days;
        }
        if let Some(cycle) = update.delete_cycle {
            self.delete_cycle = cycle;
        }
        self.updated_at = now;
    }
}

/// Partial update of the retention configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionUpdate {
    pub auto_delete_enabled: Option<bool>,
    pub delete_after_days: Option<u32>,
    pub delete_cycle: Option<DeleteCycle>,
}

impl RetentionUpdate {
    /// Validate raw administrator input.
    pub fn new(
        auto_delete_enabled: Option<bool>,
        delete_after_days: Option<i64>,
        delete_cycle: Option<&str>,
    ) -> Result<Self, DomainError> {
        let delete_after_days = match delete_after_days {
            None => None,
            Some(days) if days < 1 => {
                return Err(DomainError::validation(
                    "deleteAfterDays must be a positive number",
                ));
            }
            Some(days) if days > i64::from(RetentionConfig::MAX_DELETE_AFTER_DAYS) => {
                return Err(DomainError::validation(format!(
                    "deleteAfterDays must be at most {}",
                    RetentionConfig::MAX_DELETE_AFTER_DAYS
                )));
            }
            Some(days) => Some(days as u32),
        };
        let delete_cycle = delete_cycle.map(str::parse).transpose()?;

        Ok(Self {
            auto_delete_enabled,
            delete_after_days,
            delete_cycle,
        })
    }
}
