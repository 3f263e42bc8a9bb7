//! Question-bank persistence.
//!
//! A bank and its questions are written in one transaction at the end of a
//! successful pipeline run, so readers never observe a half-written bank.
//! The `UNIQUE(owner_id, source_file_hash)` constraint is the authoritative
//! duplicate check; [`BankStore::find_bank`] is only an advisory pre-check.

use sqlx::{Row, SqlitePool};

use crate::error::PipelineError;
use crate::models::{BankRecord, BankStatus, Question};

pub struct BankStore {
    pool: SqlitePool,
}

impl BankStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Looks up an existing bank for this owner and document hash.
    pub async fn find_bank(
        &self,
        owner: i64,
        source_file_hash: &str,
    ) -> Result<Option<BankRecord>, PipelineError> {
        let row = sqlx::query(
            "SELECT id, owner_id, name, description, source_file, source_file_hash, \
             question_count, status, created_at \
             FROM banks WHERE owner_id = ? AND source_file_hash = ?",
        )
        .bind(owner)
        .bind(source_file_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_bank(&r)))
    }

    /// Inserts the bank row and all questions atomically.
    ///
    /// A unique-constraint violation on `(owner_id, source_file_hash)` means
    /// another task persisted the same document first; the error carries the
    /// winning bank's id.
    pub async fn commit(
        &self,
        bank: &BankRecord,
        questions: &[Question],
    ) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO banks (id, owner_id, name, description, source_file, \
             source_file_hash, question_count, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&bank.id)
        .bind(bank.owner)
        .bind(&bank.name)
        .bind(&bank.description)
        .bind(&bank.source_file)
        .bind(&bank.source_file_hash)
        .bind(questions.len() as i64)
        .bind(BankStatus::Completed.as_str())
        .bind(bank.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                drop(tx);
                let existing = self.find_bank(bank.owner, &bank.source_file_hash).await?;
                let bank_id = existing.map(|b| b.id).unwrap_or_default();
                return Err(PipelineError::DuplicateDocument { bank_id });
            }
            return Err(e.into());
        }

        for q in questions {
            let options_json =
                serde_json::to_string(&q.options).unwrap_or_else(|_| "[]".to_string());
            sqlx::query(
                "INSERT INTO questions (bank_id, question, kind, options, answer, \
                 explanation, difficulty, source_chunk_index, confidence) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&bank.id)
            .bind(&q.text)
            .bind(q.kind.as_str())
            .bind(options_json)
            .bind(&q.correct_answer)
            .bind(&q.explanation)
            .bind(q.difficulty as i64)
            .bind(q.source_chunk_index as i64)
            .bind(q.confidence as f64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// All banks for one owner, newest first.
    pub async fn list_banks(&self, owner: i64) -> Result<Vec<BankRecord>, PipelineError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, name, description, source_file, source_file_hash, \
             question_count, status, created_at \
             FROM banks WHERE owner_id = ? ORDER BY created_at DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_bank).collect())
    }

    /// Questions of one bank, in insertion order.
    pub async fn bank_questions(&self, bank_id: &str) -> Result<Vec<Question>, PipelineError> {
        let rows = sqlx::query(
            "SELECT question, kind, options, answer, explanation, difficulty, \
             source_chunk_index, confidence \
             FROM questions WHERE bank_id = ? ORDER BY id",
        )
        .bind(bank_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let kind_str: String = r.get("kind");
                let options_json: String = r.get("options");
                Question {
                    text: r.get("question"),
                    kind: crate::models::QuestionKind::parse(&kind_str)
                        .unwrap_or(crate::models::QuestionKind::FillBlank),
                    options: serde_json::from_str(&options_json).unwrap_or_default(),
                    correct_answer: r.get("answer"),
                    explanation: r.get("explanation"),
                    difficulty: r.get::<i64, _>("difficulty") as u8,
                    source_chunk_index: r.get::<i64, _>("source_chunk_index") as usize,
                    confidence: r.get::<f64, _>("confidence") as f32,
                }
            })
            .collect())
    }
}

fn row_to_bank(row: &sqlx::sqlite::SqliteRow) -> BankRecord {
    let status_str: String = row.get("status");
    BankRecord {
        id: row.get("id"),
        owner: row.get("owner_id"),
        name: row.get("name"),
        description: row.get("description"),
        source_file: row.get("source_file"),
        source_file_hash: row.get("source_file_hash"),
        question_count: row.get("question_count"),
        status: BankStatus::parse(&status_str).unwrap_or(BankStatus::Error),
        created_at: row.get("created_at"),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DbConfig};
    use crate::models::QuestionKind;
    use chrono::Utc;

    async fn test_store(dir: &tempfile::TempDir) -> BankStore {
        let config = Config {
            db: DbConfig {
                path: dir.path().join("test.sqlite"),
            },
            limits: Default::default(),
            chunking: Default::default(),
            generation: Default::default(),
            tasks: Default::default(),
        };
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        BankStore::new(pool)
    }

    fn bank(id: &str, owner: i64, hash: &str) -> BankRecord {
        BankRecord {
            id: id.to_string(),
            owner,
            name: "Chapter 1".to_string(),
            description: String::new(),
            source_file: "chapter1.pdf".to_string(),
            source_file_hash: hash.to_string(),
            question_count: 0,
            status: BankStatus::Completed,
            created_at: Utc::now().timestamp(),
        }
    }

    fn sample_question(index: usize) -> Question {
        Question {
            text: format!("What is discussed in section {}?", index),
            kind: QuestionKind::Choice,
            options: vec!["a".into(), "b".into(), "c".into()],
            correct_answer: "a".into(),
            explanation: "Stated directly.".into(),
            difficulty: 2,
            source_chunk_index: index,
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn commit_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;

        let questions = vec![sample_question(0), sample_question(1)];
        store.commit(&bank("b1", 7, "hash-a"), &questions).await.unwrap();

        let found = store.find_bank(7, "hash-a").await.unwrap().unwrap();
        assert_eq!(found.id, "b1");
        assert_eq!(found.question_count, 2);
        assert_eq!(found.status, BankStatus::Completed);

        let loaded = store.bank_questions("b1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].kind, QuestionKind::Choice);
        assert_eq!(loaded[0].options.len(), 3);
        assert_eq!(loaded[1].source_chunk_index, 1);
    }

    #[tokio::test]
    async fn duplicate_commit_names_winning_bank() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;

        store
            .commit(&bank("first", 7, "hash-a"), &[sample_question(0)])
            .await
            .unwrap();
        let err = store
            .commit(&bank("second", 7, "hash-a"), &[sample_question(0)])
            .await
            .unwrap_err();
        match err {
            PipelineError::DuplicateDocument { bank_id } => assert_eq!(bank_id, "first"),
            other => panic!("unexpected error: {other}"),
        }

        // The losing transaction left nothing behind.
        let banks = store.list_banks(7).await.unwrap();
        assert_eq!(banks.len(), 1);
        assert!(store.bank_questions("second").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_hash_different_owner_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;

        store.commit(&bank("b1", 1, "hash-a"), &[]).await.unwrap();
        store.commit(&bank("b2", 2, "hash-a"), &[]).await.unwrap();
        assert_eq!(store.list_banks(1).await.unwrap().len(), 1);
        assert_eq!(store.list_banks(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_banks_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;

        let mut old = bank("old", 1, "hash-old");
        old.created_at = 100;
        let mut new = bank("new", 1, "hash-new");
        new.created_at = 200;
        store.commit(&old, &[]).await.unwrap();
        store.commit(&new, &[]).await.unwrap();

        let banks = store.list_banks(1).await.unwrap();
        assert_eq!(banks[0].id, "new");
        assert_eq!(banks[1].id, "old");
    }
}
