use anyhow::Result;
use sqlx::SqlitePool;

/// Create the index and state schema. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per published chunk record
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            key TEXT PRIMARY KEY,
            library_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            text TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            start_char INTEGER NOT NULL,
            end_char INTEGER NOT NULL,
            vector BLOB,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(library_id, item_id, ordinal)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ACL filter set, one row per (record, principal)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_principals (
            record_key TEXT NOT NULL,
            principal TEXT NOT NULL,
            PRIMARY KEY (record_key, principal),
            FOREIGN KEY (record_key) REFERENCES records(key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Persisted sync state, one JSON blob per library
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            library_id TEXT PRIMARY KEY,
            state_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='records_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE records_fts USING fts5(
                record_key UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_item ON records(library_id, item_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_record_principals_principal ON record_principals(principal)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
