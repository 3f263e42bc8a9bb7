//! Error taxonomy for the generation pipeline.
//!
//! [`PipelineError`] covers task-level failures; [`ProviderError`] is the
//! per-call result of the AI provider and carries the transient/permanent
//! distinction as data so the retry loop never inspects error strings.

use thiserror::Error;

/// Task-level pipeline failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported format: {0} (supported: .pdf, .docx, .doc)")]
    UnsupportedFormat(String),

    #[error("corrupt document: {0}")]
    CorruptDocument(String),

    #[error("document text too short: {0} characters after trimming")]
    EmptyDocument(usize),

    #[error("document exceeds maximum size: {size} bytes (limit {max})")]
    TooLarge { size: usize, max: usize },

    #[error("document already processed (bank {bank_id})")]
    DuplicateDocument { bank_id: String },

    #[error("generation failed for every chunk: {0}")]
    AllChunksFailed(String),

    #[error("persistence failed: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("task cancelled")]
    Cancelled,

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// One AI-provider call outcome. Transient errors are retried with backoff;
/// permanent errors skip the chunk immediately.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_flag() {
        assert!(ProviderError::Transient("429".into()).is_transient());
        assert!(!ProviderError::Permanent("401".into()).is_transient());
    }

    #[test]
    fn messages_name_the_condition() {
        let err = PipelineError::TooLarge {
            size: 51 * 1024 * 1024,
            max: 50 * 1024 * 1024,
        };
        assert!(err.to_string().contains("maximum size"));

        let err = PipelineError::DuplicateDocument {
            bank_id: "abc".into(),
        };
        assert!(err.to_string().contains("abc"));
    }
}
