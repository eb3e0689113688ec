//! Ingestion error types.

use thiserror::Error;

/// Errors that reject an ingestion batch before it touches state.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source {got:?} is not authorized for this agent")]
    Unauthorized { got: String },

    #[error("unknown batch action: {0:?}")]
    UnknownAction(String),
}

pub type IngestResult<T> = Result<T, IngestError>;
