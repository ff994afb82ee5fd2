//! Store error type.

use coffer_protocol::{DestinationId, JobId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("destination {0} is still referenced by at least one policy")]
    DestinationInUse(DestinationId),

    #[error("invalid status transition for job {0}: cannot move to '{1}'")]
    InvalidTransition(JobId, String),

    #[error("credential cipher error: {0}")]
    Crypto(String),

    #[error("stored value is not decodable: {0}")]
    Corrupt(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn corrupt(what: &str, detail: impl std::fmt::Display) -> Self {
        StoreError::Corrupt(format!("{}: {}", what, detail))
    }
}
