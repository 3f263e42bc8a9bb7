//! Schema creation. Idempotent; run at startup.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS banks (
            id TEXT PRIMARY KEY,
            owner_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            source_file TEXT NOT NULL,
            source_file_hash TEXT NOT NULL,
            question_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'processing',
            created_at INTEGER NOT NULL,
            UNIQUE(owner_id, source_file_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS questions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
            question TEXT NOT NULL,
            kind TEXT NOT NULL,
            options TEXT NOT NULL DEFAULT '[]',
            answer TEXT NOT NULL,
            explanation TEXT NOT NULL DEFAULT '',
            difficulty INTEGER NOT NULL DEFAULT 2,
            source_chunk_index INTEGER NOT NULL DEFAULT 0,
            confidence REAL NOT NULL DEFAULT 0.9
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_banks_owner ON banks(owner_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_questions_bank ON questions(bank_id)")
        .execute(pool)
        .await?;

    Ok(())
}
