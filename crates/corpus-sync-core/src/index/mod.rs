//! Search index abstraction.
//!
//! The [`SearchIndex`] trait is the only way the sync pipeline writes to
//! the index. Writes arrive as batches of per-item [`IndexOp`]s and each
//! batch must be applied all-or-nothing: after a failed `apply` the index
//! holds exactly what it held before.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::{IndexRecord, ItemKey};

/// One per-item write.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOp {
    /// Remove every prior record of `key`, then insert `records`.
    Replace {
        key: ItemKey,
        records: Vec<IndexRecord>,
    },
    /// Remove every record of `key`.
    Delete { key: ItemKey },
}

impl IndexOp {
    pub fn key(&self) -> &ItemKey {
        match self {
            IndexOp::Replace { key, .. } | IndexOp::Delete { key } => key,
        }
    }

    /// Weight of the op when sizing batches. A delete counts as one.
    pub fn weight(&self) -> usize {
        match self {
            IndexOp::Replace { records, .. } => records.len().max(1),
            IndexOp::Delete { .. } => 1,
        }
    }
}

/// A record matching a search, visible to the querying principals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub key: String,
    pub library_id: String,
    pub item_id: String,
    pub ordinal: u32,
    pub title: Option<String>,
    pub web_url: Option<String>,
    pub snippet: String,
    pub score: f64,
}

impl SearchHit {
    pub fn from_record(record: &IndexRecord, snippet: String, score: f64) -> Self {
        Self {
            key: record.key.clone(),
            library_id: record.library_id.clone(),
            item_id: record.item_id.clone(),
            ordinal: record.ordinal,
            title: record.metadata.title.clone(),
            web_url: record.metadata.web_url.clone(),
            snippet,
            score,
        }
    }
}

/// Abstract search index backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`apply`](SearchIndex::apply) | Atomically apply a batch of per-item ops |
/// | [`records_for_item`](SearchIndex::records_for_item) | All records of one item, by ordinal |
/// | [`indexed_items`](SearchIndex::indexed_items) | Items with at least one record in a library |
/// | [`record_count`](SearchIndex::record_count) | Number of records in a library |
/// | [`search`](SearchIndex::search) | Keyword search filtered by principals |
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Apply `batch` all-or-nothing.
    async fn apply(&self, batch: &[IndexOp]) -> Result<()>;

    async fn records_for_item(&self, key: &ItemKey) -> Result<Vec<IndexRecord>>;

    async fn indexed_items(&self, library_id: &str) -> Result<Vec<ItemKey>>;

    async fn record_count(&self, library_id: &str) -> Result<usize>;

    /// Records matching `query` whose filter set shares at least one
    /// principal with `principals`. Records with an empty filter set and
    /// queries without principals never match.
    async fn search(&self, query: &str, principals: &[String], limit: usize) -> Result<Vec<SearchHit>>;
}

/// Whether a record with `filter` is visible to `principals`.
pub fn is_visible(filter: &[String], principals: &[String]) -> bool {
    filter.iter().any(|p| principals.contains(p))
}

/// Leading excerpt of `text` for display.
pub fn snippet(text: &str) -> String {
    text.chars().take(240).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_requires_shared_principal() {
        let filter = vec!["group:hr".to_string(), "user:bob".to_string()];
        assert!(is_visible(&filter, &["user:bob".to_string()]));
        assert!(!is_visible(&filter, &["user:eve".to_string()]));
        assert!(!is_visible(&[], &["user:bob".to_string()]));
        assert!(!is_visible(&filter, &[]));
    }

    #[test]
    fn op_weight_counts_records() {
        let key = ItemKey::new("lib", "a");
        assert_eq!(IndexOp::Delete { key: key.clone() }.weight(), 1);
        assert_eq!(
            IndexOp::Replace {
                key,
                records: Vec::new()
            }
            .weight(),
            1
        );
    }
}
