//! Error types for workdb.

use thiserror::Error;

use crate::model::RecordId;

#[derive(Debug, Error)]
pub enum Error {
    /// Operation is not valid in the current transaction state.
    #[error("invalid transaction state: {0}")]
    State(String),

    #[error("record not found: {0}")]
    NotFound(RecordId),

    /// The record already carries an output.
    #[error("record {0} is already complete")]
    Conflict(RecordId),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
