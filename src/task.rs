//! Task coordination: accepts document submissions, runs the pipeline stages
//! on worker tasks, and publishes progress.
//!
//! Stage order is fixed: parse, clean, chunk, generate, persist. Concurrency
//! is bounded by a semaphore sized from `tasks.max_concurrent`. Cancellation
//! is cooperative: a flag checked at stage boundaries and between chunks
//! during generation, so a chunk in flight always finishes or fails first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::Config;
use crate::error::PipelineError;
use crate::extract;
use crate::generate::{BackoffPolicy, QuestionEngine, QuestionProvider};
use crate::models::{
    BankRecord, BankStatus, DocumentSource, ProgressEvent, Question, TaskStatus,
};
use crate::normalize::{self, ChunkMethod, ChunkOptions};
use crate::progress::ProgressStore;
use crate::store::BankStore;

/// One document submission.
pub struct SubmitRequest {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub owner: i64,
    pub bank_name: String,
    pub description: String,
    /// Per-request overrides; config values apply when unset.
    pub chunk_size: Option<usize>,
    pub questions_per_chunk: Option<usize>,
    pub method: Option<ChunkMethod>,
}

/// Shared pipeline front door. Clone-cheap via `Arc`.
pub struct TaskCoordinator {
    config: Config,
    store: Arc<BankStore>,
    progress: Arc<ProgressStore>,
    provider: Arc<dyn QuestionProvider>,
    permits: Arc<Semaphore>,
    cancel_flags: RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl TaskCoordinator {
    pub fn new(
        config: Config,
        store: Arc<BankStore>,
        provider: Arc<dyn QuestionProvider>,
    ) -> Arc<Self> {
        let progress = Arc::new(ProgressStore::new(Duration::from_secs(
            config.tasks.progress_grace_secs,
        )));
        let permits = Arc::new(Semaphore::new(config.tasks.max_concurrent));
        Arc::new(Self {
            config,
            store,
            progress,
            provider,
            permits,
            cancel_flags: RwLock::new(HashMap::new()),
        })
    }

    pub fn progress(&self) -> &Arc<ProgressStore> {
        &self.progress
    }

    /// Validates a submission, registers the task, and spawns the pipeline.
    /// Returns the task id immediately; progress flows through the progress
    /// store.
    pub async fn submit(
        self: &Arc<Self>,
        mut request: SubmitRequest,
    ) -> Result<String, PipelineError> {
        self.progress.expire();

        if request.bytes.len() > self.config.limits.max_file_bytes {
            return Err(PipelineError::TooLarge {
                size: request.bytes.len(),
                max: self.config.limits.max_file_bytes,
            });
        }
        let format = extract::detect_format(&request.file_name)?;
        if request.bank_name.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("bank name is empty".into()));
        }
        // Per-request overrides get the same bounds as the config loader, so
        // a bad value fails the submission instead of the running task.
        if let Some(chunk_size) = request.chunk_size {
            if chunk_size == 0 {
                return Err(PipelineError::InvalidRequest(
                    "chunk_size must be > 0".into(),
                ));
            }
            if chunk_size <= self.config.chunking.overlap {
                return Err(PipelineError::InvalidRequest(format!(
                    "chunk_size {} must exceed the configured overlap {}",
                    chunk_size, self.config.chunking.overlap
                )));
            }
        }
        if let Some(count) = request.questions_per_chunk {
            if count == 0 || count > 10 {
                return Err(PipelineError::InvalidRequest(
                    "questions_per_chunk must be in 1..=10".into(),
                ));
            }
        }

        let bytes = std::mem::take(&mut request.bytes);
        let source = DocumentSource::new(request.file_name.clone(), bytes);

        // Advisory pre-check. The unique constraint at commit time is the
        // authority; this just rejects obvious duplicates before any work.
        if let Some(existing) = self
            .store
            .find_bank(request.owner, &source.content_hash)
            .await?
        {
            if existing.status != BankStatus::Error {
                return Err(PipelineError::DuplicateDocument {
                    bank_id: existing.id,
                });
            }
        }

        let task_id = Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .write()
            .unwrap()
            .insert(task_id.clone(), Arc::clone(&cancel));
        self.progress.create(&task_id);
        self.progress.append(ProgressEvent::new(
            &task_id,
            TaskStatus::Queued,
            0,
            format!("queued {}", source.file_name),
            "queued",
        ))?;

        tracing::info!(task = %task_id, file = %source.file_name, owner = request.owner, "task submitted");

        let coordinator = Arc::clone(self);
        let id = task_id.clone();
        tokio::spawn(async move {
            let permit = coordinator.permits.clone().acquire_owned().await;
            if permit.is_err() {
                return;
            }
            let outcome = coordinator
                .run_task(&id, source, format, request, cancel)
                .await;
            coordinator.finish_task(&id, outcome);
        });

        Ok(task_id)
    }

    /// Latest known state of a task.
    pub fn status(&self, task_id: &str) -> Result<Option<ProgressEvent>, PipelineError> {
        self.progress.latest(task_id)
    }

    /// Requests cooperative cancellation. The task stops at the next stage
    /// boundary or chunk boundary.
    pub fn cancel(&self, task_id: &str) -> Result<(), PipelineError> {
        let flags = self.cancel_flags.read().unwrap();
        match flags.get(task_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => {
                // Terminal tasks keep their progress log for the grace
                // period but no longer carry a flag.
                drop(flags);
                self.progress.latest(task_id)?;
                Ok(())
            }
        }
    }

    async fn run_task(
        &self,
        task_id: &str,
        mut source: DocumentSource,
        format: extract::DocumentFormat,
        request: SubmitRequest,
        cancel: Arc<AtomicBool>,
    ) -> Result<(), PipelineError> {
        let check_cancel = || {
            if cancel.load(Ordering::SeqCst) {
                Err(PipelineError::Cancelled)
            } else {
                Ok(())
            }
        };

        // Parsing.
        check_cancel()?;
        self.emit(task_id, TaskStatus::Parsing, 5, "extracting text", None)?;
        // Only the hash and file name are needed past this point; hand the
        // bytes to the blocking extractor instead of copying them.
        let bytes = std::mem::take(&mut source.bytes);
        let raw = tokio::task::spawn_blocking(move || extract::extract_text(&bytes, format))
            .await
            .map_err(|e| PipelineError::CorruptDocument(e.to_string()))??;
        self.emit(task_id, TaskStatus::Parsing, 15, "text extracted", None)?;

        // Cleaning.
        check_cancel()?;
        self.emit(task_id, TaskStatus::Cleaning, 20, "cleaning text", None)?;
        let cleaned = normalize::clean(&raw);
        let char_count = cleaned.chars().count();
        if char_count < self.config.limits.min_text_chars {
            return Err(PipelineError::EmptyDocument(char_count));
        }

        // Chunking.
        check_cancel()?;
        let options = ChunkOptions {
            chunk_size: request.chunk_size.unwrap_or(self.config.chunking.chunk_size),
            overlap: self.config.chunking.overlap,
            min_chunk_size: self.config.chunking.min_chunk_size,
        };
        let method = request.method.unwrap_or(self.config.chunking.method);
        let chunks = normalize::chunk(&cleaned, &options, method)?;
        if chunks.is_empty() {
            return Err(PipelineError::EmptyDocument(char_count));
        }
        self.emit(
            task_id,
            TaskStatus::Chunking,
            25,
            format!("split into {} chunks", chunks.len()),
            Some(serde_json::json!({ "total_chunks": chunks.len() })),
        )?;

        // Generating.
        let questions_per_chunk = request
            .questions_per_chunk
            .unwrap_or(self.config.generation.questions_per_chunk);
        let engine = QuestionEngine::new(
            self.provider.as_ref(),
            BackoffPolicy::from_config(&self.config.generation),
            questions_per_chunk,
            self.config.generation.max_prompt_chars,
        );

        let total = chunks.len();
        let mut questions: Vec<Question> = Vec::new();
        let mut skipped: Vec<serde_json::Value> = Vec::new();
        let mut invalid_discarded = 0usize;
        for (i, chunk) in chunks.iter().enumerate() {
            check_cancel()?;
            match engine.generate_chunk(chunk).await {
                Ok(outcome) => {
                    invalid_discarded += outcome.invalid_discarded;
                    questions.extend(outcome.questions);
                }
                Err(e) => {
                    tracing::warn!(task = %task_id, chunk = chunk.index, error = %e, "chunk skipped");
                    skipped.push(serde_json::json!({
                        "chunk": chunk.index,
                        "reason": e.to_string(),
                    }));
                }
            }
            let percent = 30 + (65 * (i + 1) / total) as u8;
            self.emit(
                task_id,
                TaskStatus::Generating,
                percent,
                format!("chunk {}/{} done, {} questions", i + 1, total, questions.len()),
                None,
            )?;
        }

        if skipped.len() == total {
            let reason = skipped
                .last()
                .and_then(|s| s.get("reason"))
                .and_then(|r| r.as_str())
                .unwrap_or("provider unavailable")
                .to_string();
            return Err(PipelineError::AllChunksFailed(reason));
        }

        // Persisting.
        check_cancel()?;
        self.emit(task_id, TaskStatus::Persisting, 97, "saving question bank", None)?;
        let bank = BankRecord {
            id: Uuid::new_v4().to_string(),
            owner: request.owner,
            name: request.bank_name.trim().to_string(),
            description: request.description,
            source_file: source.file_name.clone(),
            source_file_hash: source.content_hash.clone(),
            question_count: questions.len() as i64,
            status: BankStatus::Completed,
            created_at: Utc::now().timestamp(),
        };
        self.store.commit(&bank, &questions).await?;

        self.progress.append(
            ProgressEvent::new(
                task_id,
                TaskStatus::Completed,
                100,
                format!("generated {} questions", questions.len()),
                "completed",
            )
            .with_details(serde_json::json!({
                "bank_id": bank.id,
                "question_count": questions.len(),
                "skipped_chunks": skipped,
                "invalid_discarded": invalid_discarded,
            })),
        )?;
        tracing::info!(task = %task_id, bank = %bank.id, questions = questions.len(), "task completed");
        Ok(())
    }

    /// Records the terminal event and releases the cancel flag.
    fn finish_task(&self, task_id: &str, outcome: Result<(), PipelineError>) {
        self.cancel_flags.write().unwrap().remove(task_id);

        let event = match outcome {
            Ok(()) => None,
            Err(PipelineError::Cancelled) => Some(ProgressEvent::new(
                task_id,
                TaskStatus::Cancelled,
                0,
                "task cancelled",
                "cancelled",
            )),
            Err(PipelineError::DuplicateDocument { bank_id }) => Some(
                ProgressEvent::new(
                    task_id,
                    TaskStatus::Error,
                    0,
                    "document already processed",
                    "error",
                )
                .with_details(serde_json::json!({ "duplicate_bank_id": bank_id })),
            ),
            Err(e) => {
                tracing::warn!(task = %task_id, error = %e, "task failed");
                Some(ProgressEvent::new(
                    task_id,
                    TaskStatus::Error,
                    0,
                    e.to_string(),
                    "error",
                ))
            }
        };
        if let Some(event) = event {
            // The log can only be missing if it expired mid-run, which a
            // non-zero grace period prevents.
            let _ = self.progress.append(event);
        }
    }

    fn emit(
        &self,
        task_id: &str,
        status: TaskStatus,
        percent: u8,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Result<(), PipelineError> {
        let mut event = ProgressEvent::new(task_id, status, percent, message, status.as_str());
        if let Some(details) = details {
            event = event.with_details(details);
        }
        self.progress.append(event)
    }
}
