//! Mail transport: performs the actual send.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use courier_core::EmailPayload;

pub mod memory;
pub mod smtp;

pub use memory::RecordingTransport;
pub use smtp::SmtpTransport;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid email address: {0}")]
    InvalidAddress(String),

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("message rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    /// Send one message. Returns once the remote side accepted it.
    async fn send(&self, email: &EmailPayload) -> Result<(), TransportError>;
}
