//! SQLite-backed [`StateStore`]: one JSON row per library in `sync_state`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use corpus_sync_core::delta::SyncState;
use corpus_sync_core::error::SyncError;
use corpus_sync_core::state::{decode_state, encode_state, StateStore};

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Every library with stored state.
    pub async fn libraries(&self) -> Result<Vec<String>, SyncError> {
        sqlx::query_scalar("SELECT library_id FROM sync_state ORDER BY library_id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)
    }
}

fn store_err(e: sqlx::Error) -> SyncError {
    SyncError::StateStore(e.to_string())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, library_id: &str) -> Result<Option<SyncState>, SyncError> {
        let blob: Option<String> =
            sqlx::query_scalar("SELECT state_json FROM sync_state WHERE library_id = ?")
                .bind(library_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        blob.map(|b| decode_state(library_id, &b)).transpose()
    }

    async fn save(&self, state: &SyncState) -> Result<(), SyncError> {
        let blob = encode_state(state)?;
        sqlx::query(
            r#"
            INSERT INTO sync_state (library_id, state_json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(library_id) DO UPDATE SET
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.library_id)
        .bind(&blob)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}
