//! Core data models used throughout bankgen.
//!
//! These types represent the tasks, documents, chunks, and questions that flow
//! through the generation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle state of a processing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Parsing,
    Cleaning,
    Chunking,
    Generating,
    Persisting,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Parsing => "parsing",
            TaskStatus::Cleaning => "cleaning",
            TaskStatus::Chunking => "chunking",
            TaskStatus::Generating => "generating",
            TaskStatus::Persisting => "persisting",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// An uploaded document plus its content digest. The hash is immutable once
/// computed; the bytes are drained when extraction starts.
#[derive(Debug, Clone)]
pub struct DocumentSource {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub content_hash: String,
}

impl DocumentSource {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let content_hash = format!("{:x}", hasher.finalize());
        Self {
            file_name: file_name.into(),
            bytes,
            content_hash,
        }
    }
}

/// An overlapping slice of normalized document text, the unit of AI
/// generation. The first `overlap_prefix_len` characters of `text` duplicate
/// the tail of the previous chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    pub overlap_prefix_len: usize,
}

/// Question category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Choice,
    FillBlank,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::Choice => "choice",
            QuestionKind::FillBlank => "fill_blank",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "choice" => Some(QuestionKind::Choice),
            "fill_blank" | "fillBlank" | "fill-blank" => Some(QuestionKind::FillBlank),
            _ => None,
        }
    }
}

/// A generated practice question, validated before acceptance and immutable
/// thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub kind: QuestionKind,
    pub options: Vec<String>,
    pub correct_answer: String,
    pub explanation: String,
    pub difficulty: u8,
    pub source_chunk_index: usize,
    pub confidence: f32,
}

/// Persistence state of a bank row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankStatus {
    Processing,
    Completed,
    Error,
}

impl BankStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BankStatus::Processing => "processing",
            BankStatus::Completed => "completed",
            BankStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(BankStatus::Processing),
            "completed" => Some(BankStatus::Completed),
            "error" => Some(BankStatus::Error),
            _ => None,
        }
    }
}

/// The persisted question bank tied to one source document and owner.
#[derive(Debug, Clone)]
pub struct BankRecord {
    pub id: String,
    pub owner: i64,
    pub name: String,
    pub description: String,
    pub source_file: String,
    pub source_file_hash: String,
    pub question_count: i64,
    pub status: BankStatus,
    pub created_at: i64,
}

/// One append-only status update in a task's ordered progress log.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub status: TaskStatus,
    pub percent: u8,
    pub message: String,
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        task_id: impl Into<String>,
        status: TaskStatus,
        percent: u8,
        message: impl Into<String>,
        step: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            percent,
            message: message.into(),
            step: step.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        let a = DocumentSource::new("a.pdf", b"same bytes".to_vec());
        let b = DocumentSource::new("b.pdf", b"same bytes".to_vec());
        assert_eq!(a.content_hash, b.content_hash);

        let c = DocumentSource::new("c.pdf", b"other bytes".to_vec());
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Generating.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }

    #[test]
    fn question_kind_parse_accepts_aliases() {
        assert_eq!(QuestionKind::parse("choice"), Some(QuestionKind::Choice));
        assert_eq!(
            QuestionKind::parse("fillBlank"),
            Some(QuestionKind::FillBlank)
        );
        assert_eq!(QuestionKind::parse("essay"), None);
    }
}
