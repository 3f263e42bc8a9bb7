//! Question generation against an external AI provider.
//!
//! Defines the [`QuestionProvider`] capability, the OpenAI-compatible
//! [`ChatProvider`] implementation, structural validation of returned
//! questions, and the per-chunk retry loop with exponential backoff.
//!
//! # Retry strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → transient, retried
//! - HTTP 4xx (client error, not 429) → permanent, never retried
//! - Network errors and timeouts → transient
//! - Unparseable model output → transient (the model usually recovers)

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::ProviderError;
use crate::models::{Question, QuestionKind, TextChunk};

/// Capability that turns one chunk of text into candidate questions.
#[async_trait]
pub trait QuestionProvider: Send + Sync {
    /// Model identifier, for logging.
    fn model_name(&self) -> &str;

    /// Request up to `count` questions for `chunk_text`. Returned items are
    /// candidates; the engine validates them before acceptance.
    async fn generate(&self, chunk_text: &str, count: usize)
        -> Result<Vec<Question>, ProviderError>;
}

/// Backoff parameters as data: delay for attempt k (1-based) is
/// `base_delay_ms * multiplier^(k-1)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            multiplier: config.backoff_multiplier,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = (self.multiplier as u64).saturating_pow(attempt.saturating_sub(1).min(8));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            multiplier: 2,
        }
    }
}

// ============ Chat provider ============

const SYSTEM_PROMPT: &str = "You are a professional teaching assistant who writes high-quality \
practice questions strictly grounded in the provided text.";

/// OpenAI-compatible chat-completions provider (the upstream service is
/// DeepSeek by default, but any compatible endpoint works).
pub struct ChatProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl ChatProvider {
    /// Builds the provider from configuration. Fails when the API key
    /// environment variable is unset.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    fn prompt(chunk_text: &str, count: usize) -> String {
        format!(
            "Write up to {count} practice questions based only on the text below.\n\
             \n\
             Rules:\n\
             1. Every question must be answerable from the text alone.\n\
             2. Cover the core knowledge points; prefer quality over quantity.\n\
             3. Difficulty: 1 = recall, 2 = comprehension, 3 = analysis.\n\
             4. type is \"choice\" (with 3-5 options) or \"fill_blank\" (no options).\n\
             5. The answer must be accurate and the explanation must justify it.\n\
             \n\
             Reply with strict JSON only, no prose:\n\
             {{\"questions\": [{{\"question\": \"...\", \"type\": \"choice\", \
             \"options\": [\"...\"], \"answer\": \"...\", \"explanation\": \"...\", \
             \"difficulty\": 1}}]}}\n\
             \n\
             Text:\n{chunk_text}"
        )
    }
}

#[async_trait]
impl QuestionProvider for ChatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        chunk_text: &str,
        count: usize,
    ) -> Result<Vec<Question>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": Self::prompt(chunk_text, count)},
            ],
            "temperature": 0.7,
            "max_tokens": 2000,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(ProviderError::Transient(format!("{}: {}", status, text)));
            }
            return Err(ProviderError::Permanent(format!("{}: {}", status, text)));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| ProviderError::Transient("response missing message content".into()))?;

        parse_model_output(content)
    }
}

#[derive(Debug, Deserialize)]
struct RawQuestionList {
    questions: Vec<RawQuestion>,
}

#[derive(Debug, Deserialize)]
struct RawQuestion {
    question: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    explanation: String,
    #[serde(default = "default_difficulty")]
    difficulty: i64,
}

fn default_difficulty() -> i64 {
    2
}

/// Parses the model's reply into candidate questions. Tolerates Markdown
/// code fences around the JSON payload.
pub fn parse_model_output(content: &str) -> Result<Vec<Question>, ProviderError> {
    let payload = strip_code_fence(content);
    let list: RawQuestionList = serde_json::from_str(payload.trim())
        .map_err(|e| ProviderError::Transient(format!("unparseable model output: {}", e)))?;

    Ok(list
        .questions
        .into_iter()
        .map(|raw| {
            let kind = raw
                .kind
                .as_deref()
                .and_then(QuestionKind::parse)
                .unwrap_or(QuestionKind::FillBlank);
            Question {
                text: raw.question.trim().to_string(),
                kind,
                options: raw
                    .options
                    .into_iter()
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect(),
                correct_answer: raw.answer.trim().to_string(),
                explanation: raw.explanation.trim().to_string(),
                difficulty: raw.difficulty.clamp(1, 3) as u8,
                source_chunk_index: 0,
                confidence: 0.9,
            }
        })
        .collect())
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(end) = rest.find("```") {
            return &rest[..end];
        }
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(end) = rest.find("```") {
            return &rest[..end];
        }
    }
    trimmed
}

// ============ Validation ============

const MIN_QUESTION_CHARS: usize = 10;
const MAX_QUESTION_CHARS: usize = 500;

/// Structural validation applied to every candidate before acceptance.
pub fn validate_question(q: &Question) -> Result<(), String> {
    let len = q.text.chars().count();
    if len < MIN_QUESTION_CHARS || len > MAX_QUESTION_CHARS {
        return Err(format!("question length {} outside bounds", len));
    }
    if q.correct_answer.is_empty() {
        return Err("empty answer".to_string());
    }
    match q.kind {
        QuestionKind::Choice if q.options.is_empty() => {
            Err("choice question without options".to_string())
        }
        QuestionKind::FillBlank if !q.options.is_empty() => {
            Err("fill_blank question with options".to_string())
        }
        _ => Ok(()),
    }
}

// ============ Engine ============

/// Aggregated result of one chunk's generation pass.
#[derive(Debug)]
pub struct ChunkOutcome {
    pub questions: Vec<Question>,
    pub invalid_discarded: usize,
}

/// Runs the retry loop and validation for single chunks. The loop over all
/// chunks lives in the task coordinator, which owns progress reporting and
/// cancellation checks.
pub struct QuestionEngine<'a> {
    provider: &'a dyn QuestionProvider,
    backoff: BackoffPolicy,
    questions_per_chunk: usize,
    max_prompt_chars: usize,
}

impl<'a> QuestionEngine<'a> {
    pub fn new(
        provider: &'a dyn QuestionProvider,
        backoff: BackoffPolicy,
        questions_per_chunk: usize,
        max_prompt_chars: usize,
    ) -> Self {
        Self {
            provider,
            backoff,
            questions_per_chunk,
            max_prompt_chars,
        }
    }

    /// Generates and validates questions for one chunk. Transient provider
    /// failures are retried with backoff; the returned error means the chunk
    /// is skipped (retries exhausted or a permanent failure).
    pub async fn generate_chunk(&self, chunk: &TextChunk) -> Result<ChunkOutcome, ProviderError> {
        let prompt_text: String = chunk.text.chars().take(self.max_prompt_chars).collect();

        let mut last_err: Option<ProviderError> = None;
        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay(attempt)).await;
            }

            match self
                .provider
                .generate(&prompt_text, self.questions_per_chunk)
                .await
            {
                Ok(candidates) => {
                    let mut questions = Vec::with_capacity(candidates.len());
                    let mut invalid_discarded = 0;
                    for mut q in candidates {
                        q.source_chunk_index = chunk.index;
                        match validate_question(&q) {
                            Ok(()) => questions.push(q),
                            Err(reason) => {
                                tracing::warn!(
                                    chunk = chunk.index,
                                    %reason,
                                    "discarding invalid question"
                                );
                                invalid_discarded += 1;
                            }
                        }
                    }
                    return Ok(ChunkOutcome {
                        questions,
                        invalid_discarded,
                    });
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        chunk = chunk.index,
                        attempt,
                        error = %e,
                        "transient provider failure"
                    );
                    last_err = Some(e);
                }
                Err(e) => {
                    tracing::warn!(chunk = chunk.index, error = %e, "permanent provider failure");
                    return Err(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ProviderError::Transient("generation failed after retries".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn question(text: &str, kind: QuestionKind, options: Vec<String>, answer: &str) -> Question {
        Question {
            text: text.to_string(),
            kind,
            options,
            correct_answer: answer.to_string(),
            explanation: String::new(),
            difficulty: 2,
            source_chunk_index: 0,
            confidence: 0.9,
        }
    }

    #[test]
    fn backoff_delays_grow_exponentially() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay_ms: 100,
            multiplier: 2,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn validate_rejects_short_question() {
        let q = question("Too short", QuestionKind::FillBlank, vec![], "answer");
        assert!(validate_question(&q).is_err());
    }

    #[test]
    fn validate_rejects_empty_answer() {
        let q = question(
            "What is the powerhouse of the cell?",
            QuestionKind::FillBlank,
            vec![],
            "",
        );
        assert!(validate_question(&q).is_err());
    }

    #[test]
    fn validate_options_iff_choice() {
        let no_options = question(
            "Which of these is a prime number?",
            QuestionKind::Choice,
            vec![],
            "7",
        );
        assert!(validate_question(&no_options).is_err());

        let with_options = question(
            "Which of these is a prime number?",
            QuestionKind::Choice,
            vec!["4".into(), "7".into(), "9".into()],
            "7",
        );
        assert!(validate_question(&with_options).is_ok());

        let blank_with_options = question(
            "The capital of France is ____.",
            QuestionKind::FillBlank,
            vec!["Paris".into()],
            "Paris",
        );
        assert!(validate_question(&blank_with_options).is_err());
    }

    #[test]
    fn parse_plain_json() {
        let content = r#"{"questions": [{"question": "What does WAL stand for?",
            "type": "fill_blank", "answer": "write-ahead logging",
            "explanation": "Defined in the text.", "difficulty": 1}]}"#;
        let qs = parse_model_output(content).unwrap();
        assert_eq!(qs.len(), 1);
        assert_eq!(qs[0].kind, QuestionKind::FillBlank);
        assert_eq!(qs[0].correct_answer, "write-ahead logging");
        assert_eq!(qs[0].difficulty, 1);
    }

    #[test]
    fn parse_fenced_json() {
        let content = "```json\n{\"questions\": [{\"question\": \"Name one chunking method.\", \"answer\": \"fixed\"}]}\n```";
        let qs = parse_model_output(content).unwrap();
        assert_eq!(qs.len(), 1);
        // Missing type defaults to fill_blank; missing difficulty to 2.
        assert_eq!(qs[0].kind, QuestionKind::FillBlank);
        assert_eq!(qs[0].difficulty, 2);
    }

    #[test]
    fn parse_garbage_is_transient() {
        let err = parse_model_output("Sorry, I cannot help with that.").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn difficulty_is_clamped() {
        let content = r#"{"questions": [{"question": "A sufficiently long question?",
            "answer": "yes", "difficulty": 9}]}"#;
        let qs = parse_model_output(content).unwrap();
        assert_eq!(qs[0].difficulty, 3);
    }

    struct ScriptedProvider {
        calls: AtomicUsize,
        script: Vec<Result<Vec<Question>, &'static str>>,
    }

    #[async_trait]
    impl QuestionProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _chunk_text: &str,
            _count: usize,
        ) -> Result<Vec<Question>, ProviderError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.get(i) {
                Some(Ok(qs)) => Ok(qs.clone()),
                Some(Err(msg)) if msg.starts_with("transient") => {
                    Err(ProviderError::Transient(msg.to_string()))
                }
                Some(Err(msg)) => Err(ProviderError::Permanent(msg.to_string())),
                None => panic!("unexpected extra provider call"),
            }
        }
    }

    fn chunk(index: usize) -> TextChunk {
        TextChunk {
            index,
            text: "The quick brown fox jumps over the lazy dog.".to_string(),
            overlap_prefix_len: 0,
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            multiplier: 1,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let ok = vec![question(
            "What animal jumps over the dog?",
            QuestionKind::FillBlank,
            vec![],
            "the fox",
        )];
        let provider = ScriptedProvider {
            calls: AtomicUsize::new(0),
            script: vec![Err("transient 429"), Err("transient 503"), Ok(ok)],
        };
        let engine = QuestionEngine::new(&provider, fast_backoff(), 2, 2000);
        let outcome = engine.generate_chunk(&chunk(3)).await.unwrap();
        assert_eq!(outcome.questions.len(), 1);
        assert_eq!(outcome.questions[0].source_chunk_index, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let provider = ScriptedProvider {
            calls: AtomicUsize::new(0),
            script: vec![Err("permanent 401")],
        };
        let engine = QuestionEngine::new(&provider, fast_backoff(), 2, 2000);
        let err = engine.generate_chunk(&chunk(0)).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_exhausted_returns_last_error() {
        let provider = ScriptedProvider {
            calls: AtomicUsize::new(0),
            script: vec![
                Err("transient a"),
                Err("transient b"),
                Err("transient c"),
            ],
        };
        let engine = QuestionEngine::new(&provider, fast_backoff(), 2, 2000);
        let err = engine.generate_chunk(&chunk(0)).await.unwrap_err();
        assert!(err.to_string().contains("transient c"));
        // 1 initial attempt + 2 retries.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_candidates_are_discarded_and_counted() {
        let mixed = vec![
            question(
                "A valid question about the text?",
                QuestionKind::FillBlank,
                vec![],
                "yes",
            ),
            question("short", QuestionKind::FillBlank, vec![], "no"),
            question(
                "A choice question missing its options?",
                QuestionKind::Choice,
                vec![],
                "a",
            ),
        ];
        let provider = ScriptedProvider {
            calls: AtomicUsize::new(0),
            script: vec![Ok(mixed)],
        };
        let engine = QuestionEngine::new(&provider, fast_backoff(), 3, 2000);
        let outcome = engine.generate_chunk(&chunk(0)).await.unwrap();
        assert_eq!(outcome.questions.len(), 1);
        assert_eq!(outcome.invalid_discarded, 2);
    }
}
