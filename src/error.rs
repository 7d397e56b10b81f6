//! Error taxonomy for the extraction and commit flows.

use thiserror::Error;

use crate::openrouter::TokenUsage;

/// Failure to fetch the source document from blob storage.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("access denied for document: {0}")]
    AccessDenied(String),

    #[error("storage request failed: {0}")]
    Transport(String),
}

/// Failure reported by (or while talking to) the generative model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// `usage` holds whatever the provider billed before failing.
    #[error("model provider error ({status}): {message}")]
    Provider {
        status: u16,
        message: String,
        usage: TokenUsage,
    },

    #[error("model request failed: {0}")]
    Transport(String),

    #[error("model call timed out after {0}s")]
    Timeout(u64),

    #[error("model returned no output")]
    EmptyOutput,
}

impl ModelError {
    /// Tokens consumed by the failed call, zero when the provider reported none.
    pub fn usage(&self) -> TokenUsage {
        match self {
            Self::Provider { usage, .. } => *usage,
            _ => TokenUsage::default(),
        }
    }
}

/// Fatal outcome of one extraction invocation.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("model invocation failed: {0}")]
    ModelInvocation(#[from] ModelError),

    #[error("model output failed schema validation: {0}")]
    SchemaValidation(String),
}

impl ExtractionError {
    /// Retrieval failures are never retried; model and schema failures may be.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Retrieval(_))
    }
}

/// Failure of the audit store or the commit database.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database request failed: {0}")]
    Transport(String),

    #[error("database rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("{0}")]
    Other(String),
}

/// Reviewer edit that does not apply to the current table.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("no line at index {index} (table has {len} lines)")]
    NoSuchLine { index: usize, len: usize },
}

/// Failure of the commit pipeline. Surfaced to the caller as a single message.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("invalid commit request: {0}")]
    Validation(String),

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write project and contract: {0}")]
    Write(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrieval_errors_are_not_retryable() {
        let err = ExtractionError::from(RetrievalError::NotFound("a.pdf".into()));
        assert!(!err.is_retryable());

        let err = ExtractionError::from(ModelError::Timeout(60));
        assert!(err.is_retryable());
        assert!(ExtractionError::SchemaValidation("bad".into()).is_retryable());
    }

    #[test]
    fn test_only_provider_errors_carry_usage() {
        let err = ModelError::Provider {
            status: 502,
            message: "upstream".into(),
            usage: TokenUsage {
                input_tokens: 40,
                output_tokens: 2,
                total_tokens: 42,
            },
        };
        assert_eq!(err.usage().total_tokens, 42);
        assert_eq!(err.to_string(), "model provider error (502): upstream");
        assert_eq!(ModelError::Timeout(60).usage(), TokenUsage::default());
    }

    #[test]
    fn test_retrieval_error_message_is_transparent() {
        let err = ExtractionError::from(RetrievalError::AccessDenied("q/1.pdf".into()));
        assert_eq!(err.to_string(), "access denied for document: q/1.pdf");
    }
}
