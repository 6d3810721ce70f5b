//! Pipeline error taxonomy.
//!
//! Every failure in the ingestion and query pipelines is classified into
//! one of four kinds, which determines how it is handled:
//!
//! - [`PipelineError::Validation`] — bad input, rejected before side
//!   effects, never retried.
//! - [`PipelineError::Transient`] — timeout / rate limit / temporary
//!   unavailability; the worker nacks the task so the queue redelivers it,
//!   and the query path surfaces it to the caller instead of retrying.
//! - [`PipelineError::Permanent`] — missing blob, unsupported or corrupt
//!   content; retrying can never succeed, so the worker acks (poison) and
//!   logs.
//! - [`PipelineError::Generation`] — the generation call itself failed.
//!   A model that answers "I don't know from this context" is NOT an
//!   error; it is a normal [`Answer`](crate::models::Answer).

use thiserror::Error;

use crate::embedding::EmbedError;
use crate::generate::GenerateError;
use crate::queue::QueueError;
use crate::storage::StorageError;
use crate::vector_index::IndexError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed input, rejected before any side effect.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Temporary collaborator failure; safe to retry later.
    #[error("transient failure in {service}: {message}")]
    Transient {
        service: &'static str,
        message: String,
    },

    /// Collaborator failure that retrying cannot fix.
    #[error("permanent failure in {service}: {message}")]
    Permanent {
        service: &'static str,
        message: String,
    },

    /// The text-generation call failed (timeout, quota, malformed reply).
    #[error("generation failed: {0}")]
    Generation(String),
}

impl PipelineError {
    /// Whether redelivering the task could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient { .. })
    }

    pub fn transient(service: &'static str, message: impl Into<String>) -> Self {
        PipelineError::Transient {
            service,
            message: message.into(),
        }
    }

    pub fn permanent(service: &'static str, message: impl Into<String>) -> Self {
        PipelineError::Permanent {
            service,
            message: message.into(),
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(e: StorageError) -> Self {
        match e {
            // A deleted blob will never come back; reprocessing would spin
            // on the queue forever.
            StorageError::NotFound(key) => {
                PipelineError::permanent("storage", format!("object not found: {}", key))
            }
            StorageError::Timeout => PipelineError::transient("storage", "request timed out"),
            StorageError::Service(msg) => PipelineError::transient("storage", msg),
            StorageError::Auth(msg) => PipelineError::permanent("storage", msg),
        }
    }
}

impl From<EmbedError> for PipelineError {
    fn from(e: EmbedError) -> Self {
        if e.is_retryable() {
            PipelineError::transient("embedder", e.to_string())
        } else {
            PipelineError::permanent("embedder", e.to_string())
        }
    }
}

impl From<IndexError> for PipelineError {
    fn from(e: IndexError) -> Self {
        if e.is_retryable() {
            PipelineError::transient("vector-index", e.to_string())
        } else {
            PipelineError::permanent("vector-index", e.to_string())
        }
    }
}

impl From<QueueError> for PipelineError {
    fn from(e: QueueError) -> Self {
        PipelineError::transient("queue", e.to_string())
    }
}

impl From<GenerateError> for PipelineError {
    fn from(e: GenerateError) -> Self {
        PipelineError::Generation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_is_permanent() {
        let err: PipelineError = StorageError::NotFound("uploads/x".to_string()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn storage_timeout_is_retryable() {
        let err: PipelineError = StorageError::Timeout.into();
        assert!(err.is_retryable());
    }

    #[test]
    fn embed_rate_limit_is_retryable() {
        let err: PipelineError = EmbedError::RateLimited.into();
        assert!(err.is_retryable());
    }

    #[test]
    fn embed_invalid_input_is_not_retryable() {
        let err: PipelineError = EmbedError::InvalidInput("empty".to_string()).into();
        assert!(!err.is_retryable());
    }
}
