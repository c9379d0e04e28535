//! `courier-core` — domain building blocks for the mail dispatch pipeline.
//!
//! This crate contains **pure domain** types (no IO): job records and their
//! lifecycle, delivery policies, retention rules, and listing queries.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod policy;
pub mod query;
pub mod retention;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{BrokerMessageId, JobId};
pub use job::{EmailJob, EmailPayload, JobStatus, NewJob, Transition, TransitionError};
pub use policy::{DeliveryPolicy, RetryPolicy};
pub use query::{ListQuery, Page, SortField, SortOrder, StatusCounts};
pub use retention::{DeleteCycle, RetentionConfig, RetentionUpdate};
