//! Request-facing services: the dispatch gateway and the status ledger.

use thiserror::Error;

use courier_core::{DomainError, TransitionError};

use crate::broker::BrokerError;
use crate::store::StoreError;

pub mod gateway;
pub mod ledger;

pub use gateway::{DispatchGateway, Submission};
pub use ledger::{RetryReceipt, StatusLedger};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<DomainError> for DispatchError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => Self::Validation(msg),
            DomainError::NotFound(msg) => Self::NotFound(msg),
            DomainError::InvalidState(msg) => Self::InvalidState(msg),
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Transition(TransitionError::AlreadySent(id)) => {
                Self::InvalidState(format!("email {id} was already sent"))
            }
            other => Self::Store(other),
        }
    }
}
