//! Error taxonomy for the pipeline.
//!
//! Two classes of caller-facing failures exist besides store lookups:
//! configuration errors (inconsistent parameters, always detectable before
//! touching data) and validation errors (the data violates a precondition of
//! the selected algorithm). Both are fatal; no stage retries, and partial
//! output already flushed to a tag is not rolled back.

use thiserror::Error;

use crate::store::StoreError;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid or inconsistent parameters supplied by the caller.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Input data violates a precondition of the selected algorithm.
    #[error("validation error: {0}")]
    Validation(String),

    /// Store-level lookup or write failure, propagated unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
