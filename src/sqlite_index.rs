//! SQLite-backed [`SearchIndex`].
//!
//! Records live in `records`, their filter sets in `record_principals`
//! and their text in the `records_fts` FTS5 table. Each batch runs in one
//! transaction, so a failed `apply` rolls back completely. Search ranks by
//! BM25 and only returns records sharing a principal with the caller.

use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use corpus_sync_core::embedding::{blob_to_vec, vec_to_blob};
use corpus_sync_core::error::SyncError;
use corpus_sync_core::index::{IndexOp, SearchHit, SearchIndex};
use corpus_sync_core::models::{DocumentMetadata, IndexRecord, ItemKey};

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn publish_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::IndexPublish(e.to_string())
}

async fn delete_item(tx: &mut Transaction<'_, Sqlite>, key: &ItemKey) -> Result<(), sqlx::Error> {
    sqlx::query(
        "DELETE FROM records_fts WHERE record_key IN (SELECT key FROM records WHERE library_id = ? AND item_id = ?)",
    )
    .bind(&key.library_id)
    .bind(&key.item_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        "DELETE FROM record_principals WHERE record_key IN (SELECT key FROM records WHERE library_id = ? AND item_id = ?)",
    )
    .bind(&key.library_id)
    .bind(&key.item_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM records WHERE library_id = ? AND item_id = ?")
        .bind(&key.library_id)
        .bind(&key.item_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_record(tx: &mut Transaction<'_, Sqlite>, record: &IndexRecord) -> Result<(), sqlx::Error> {
    let metadata_json = serde_json::to_string(&record.metadata).unwrap_or_else(|_| "{}".to_string());
    sqlx::query(
        r#"
        INSERT INTO records (key, library_id, item_id, ordinal, text, content_hash, start_char, end_char, vector, metadata_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.key)
    .bind(&record.library_id)
    .bind(&record.item_id)
    .bind(record.ordinal as i64)
    .bind(&record.text)
    .bind(&record.content_hash)
    .bind(record.start_char as i64)
    .bind(record.end_char as i64)
    .bind(record.vector.as_deref().map(vec_to_blob))
    .bind(&metadata_json)
    .execute(&mut **tx)
    .await?;

    for principal in &record.filter_principals {
        sqlx::query("INSERT OR IGNORE INTO record_principals (record_key, principal) VALUES (?, ?)")
            .bind(&record.key)
            .bind(principal)
            .execute(&mut **tx)
            .await?;
    }

    sqlx::query("INSERT INTO records_fts (record_key, text) VALUES (?, ?)")
        .bind(&record.key)
        .bind(&record.text)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// FTS5 query matching any of the words in `query`, each quoted so user
/// input cannot inject FTS syntax.
pub fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn apply(&self, batch: &[IndexOp]) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await.map_err(publish_err)?;
        for op in batch {
            delete_item(&mut tx, op.key()).await.map_err(publish_err)?;
            if let IndexOp::Replace { records, .. } = op {
                for record in records {
                    insert_record(&mut tx, record).await.map_err(publish_err)?;
                }
            }
        }
        tx.commit().await.map_err(publish_err)?;
        Ok(())
    }

    async fn records_for_item(&self, key: &ItemKey) -> Result<Vec<IndexRecord>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT key, ordinal, text, content_hash, start_char, end_char, vector, metadata_json
            FROM records
            WHERE library_id = ? AND item_id = ?
            ORDER BY ordinal
            "#,
        )
        .bind(&key.library_id)
        .bind(&key.item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(publish_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record_key: String = row.get("key");
            let principals: Vec<String> = sqlx::query_scalar(
                "SELECT principal FROM record_principals WHERE record_key = ? ORDER BY principal",
            )
            .bind(&record_key)
            .fetch_all(&self.pool)
            .await
            .map_err(publish_err)?;
            let vector: Option<Vec<u8>> = row.get("vector");
            let metadata_json: String = row.get("metadata_json");
            let metadata: DocumentMetadata = serde_json::from_str(&metadata_json).unwrap_or_default();

            records.push(IndexRecord {
                key: record_key,
                library_id: key.library_id.clone(),
                item_id: key.item_id.clone(),
                ordinal: row.get::<i64, _>("ordinal") as u32,
                text: row.get("text"),
                content_hash: row.get("content_hash"),
                start_char: row.get::<i64, _>("start_char") as usize,
                end_char: row.get::<i64, _>("end_char") as usize,
                vector: vector.map(|b| blob_to_vec(&b)),
                filter_principals: principals,
                metadata,
            });
        }
        Ok(records)
    }

    async fn indexed_items(&self, library_id: &str) -> Result<Vec<ItemKey>, SyncError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT item_id FROM records WHERE library_id = ? ORDER BY item_id",
        )
        .bind(library_id)
        .fetch_all(&self.pool)
        .await
        .map_err(publish_err)?;
        Ok(ids.into_iter().map(|id| ItemKey::new(library_id, id)).collect())
    }

    async fn record_count(&self, library_id: &str) -> Result<usize, SyncError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE library_id = ?")
            .bind(library_id)
            .fetch_one(&self.pool)
            .await
            .map_err(publish_err)?;
        Ok(count as usize)
    }

    async fn search(
        &self,
        query: &str,
        principals: &[String],
        limit: usize,
    ) -> Result<Vec<SearchHit>, SyncError> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        if principals.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; principals.len()].join(", ");
        let sql = format!(
            r#"
            SELECT r.key, r.library_id, r.item_id, r.ordinal, r.text, r.metadata_json,
                   records_fts.rank AS rank
            FROM records_fts
            JOIN records r ON r.key = records_fts.record_key
            WHERE records_fts MATCH ?
              AND EXISTS (
                  SELECT 1 FROM record_principals p
                  WHERE p.record_key = r.key AND p.principal IN ({})
              )
            ORDER BY rank, r.key
            LIMIT ?
            "#,
            placeholders
        );

        let mut q = sqlx::query(&sql).bind(fts);
        for p in principals {
            q = q.bind(p);
        }
        let rows = q
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(publish_err)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let metadata_json: String = row.get("metadata_json");
                let metadata: DocumentMetadata = serde_json::from_str(&metadata_json).unwrap_or_default();
                let text: String = row.get("text");
                let rank: f64 = row.get("rank");
                SearchHit {
                    key: row.get("key"),
                    library_id: row.get("library_id"),
                    item_id: row.get("item_id"),
                    ordinal: row.get::<i64, _>("ordinal") as u32,
                    title: metadata.title,
                    web_url: metadata.web_url,
                    snippet: corpus_sync_core::index::snippet(&text),
                    score: -rank,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(fts_query("leave policy").as_deref(), Some("\"leave\" OR \"policy\""));
        assert_eq!(fts_query("a\"b NEAR(").as_deref(), Some("\"ab\" OR \"NEAR(\""));
        assert_eq!(fts_query("   "), None);
    }
}
