//! In-memory [`SearchIndex`] for tests and embedding hosts.
//!
//! Records live in a `BTreeMap` keyed by record key behind a
//! `std::sync::RwLock`. A batch is applied under one write lock, so
//! readers never observe half of it. Keyword scoring counts how many query
//! terms a record contains.
//!
//! Failures can be injected with [`InMemoryIndex::fail_next`] to exercise
//! retry and atomicity paths.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::error::{Result, SyncError};
use crate::models::{IndexRecord, ItemKey};

use super::{is_visible, snippet, IndexOp, SearchHit, SearchIndex};

/// In-memory index with a write counter and failure injection.
#[derive(Default)]
pub struct InMemoryIndex {
    records: RwLock<BTreeMap<String, IndexRecord>>,
    writes: AtomicUsize,
    batches: AtomicUsize,
    injected: Mutex<VecDeque<SyncError>>,
}

fn poisoned() -> SyncError {
    SyncError::IndexPublish("index lock poisoned".to_string())
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `apply` call fail with `err` without touching data.
    pub fn fail_next(&self, err: SyncError) {
        if let Ok(mut q) = self.injected.lock() {
            q.push_back(err);
        }
    }

    /// Number of ops applied by successful batches.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of successful `apply` calls.
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Snapshot of every record, ordered by key.
    pub fn snapshot(&self) -> Vec<IndexRecord> {
        self.records
            .read()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn apply(&self, batch: &[IndexOp]) -> Result<()> {
        if let Some(err) = self.injected.lock().map_err(|_| poisoned())?.pop_front() {
            return Err(err);
        }

        let mut records = self.records.write().map_err(|_| poisoned())?;
        for op in batch {
            let key = op.key();
            records.retain(|_, r| !(r.library_id == key.library_id && r.item_id == key.item_id));
            if let IndexOp::Replace { records: new, .. } = op {
                for r in new {
                    records.insert(r.key.clone(), r.clone());
                }
            }
        }
        self.writes.fetch_add(batch.len(), Ordering::SeqCst);
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn records_for_item(&self, key: &ItemKey) -> Result<Vec<IndexRecord>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut out: Vec<IndexRecord> = records
            .values()
            .filter(|r| r.library_id == key.library_id && r.item_id == key.item_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.ordinal);
        Ok(out)
    }

    async fn indexed_items(&self, library_id: &str) -> Result<Vec<ItemKey>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let items: BTreeSet<ItemKey> = records
            .values()
            .filter(|r| r.library_id == library_id)
            .map(IndexRecord::item_key)
            .collect();
        Ok(items.into_iter().collect())
    }

    async fn record_count(&self, library_id: &str) -> Result<usize> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.values().filter(|r| r.library_id == library_id).count())
    }

    async fn search(&self, query: &str, principals: &[String], limit: usize) -> Result<Vec<SearchHit>> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() || principals.is_empty() {
            return Ok(Vec::new());
        }

        let records = self.records.read().map_err(|_| poisoned())?;
        let mut hits: Vec<SearchHit> = records
            .values()
            .filter(|r| is_visible(&r.filter_principals, principals))
            .filter_map(|r| {
                let text_lower = r.text.to_lowercase();
                let matches = terms.iter().filter(|t| text_lower.contains(*t)).count();
                (matches > 0).then(|| SearchHit::from_record(r, snippet(&r.text), matches as f64))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMetadata;

    fn record(item: &str, ordinal: u32, text: &str, principals: &[&str]) -> IndexRecord {
        let key = ItemKey::new("lib", item);
        IndexRecord {
            key: crate::key::record_key(&key, ordinal),
            library_id: "lib".into(),
            item_id: item.into(),
            ordinal,
            text: text.into(),
            content_hash: String::new(),
            start_char: 0,
            end_char: text.chars().count(),
            vector: None,
            filter_principals: principals.iter().map(|s| s.to_string()).collect(),
            metadata: DocumentMetadata::default(),
        }
    }

    fn replace(item: &str, records: Vec<IndexRecord>) -> IndexOp {
        IndexOp::Replace {
            key: ItemKey::new("lib", item),
            records,
        }
    }

    #[tokio::test]
    async fn replace_drops_prior_records() {
        let index = InMemoryIndex::new();
        let five: Vec<_> = (0..5).map(|i| record("a", i, "x", &["user:a"])).collect();
        index.apply(&[replace("a", five)]).await.unwrap();
        let two: Vec<_> = (0..2).map(|i| record("a", i, "y", &["user:a"])).collect();
        index.apply(&[replace("a", two)]).await.unwrap();

        let stored = index.records_for_item(&ItemKey::new("lib", "a")).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.text == "y"));
    }

    #[tokio::test]
    async fn injected_failure_leaves_index_untouched() {
        let index = InMemoryIndex::new();
        index.apply(&[replace("a", vec![record("a", 0, "old", &["user:a"])])]).await.unwrap();

        index.fail_next(SyncError::RateLimited { retry_after: None });
        let err = index
            .apply(&[
                replace("a", vec![record("a", 0, "new", &["user:a"])]),
                IndexOp::Delete {
                    key: ItemKey::new("lib", "a"),
                },
            ])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(index.snapshot()[0].text, "old");
        assert_eq!(index.write_count(), 1);
    }

    #[tokio::test]
    async fn search_respects_filters() {
        let index = InMemoryIndex::new();
        index
            .apply(&[
                replace("a", vec![record("a", 0, "vacation policy", &["group:hr"])]),
                replace("b", vec![record("b", 0, "vacation calendar", &[])]),
            ])
            .await
            .unwrap();

        let hits = index.search("vacation", &["group:hr".into()], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item_id, "a");
        assert!(index.search("vacation", &[], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn indexed_items_lists_distinct_items() {
        let index = InMemoryIndex::new();
        index
            .apply(&[replace("a", vec![record("a", 0, "x", &[]), record("a", 1, "y", &[])])])
            .await
            .unwrap();
        assert_eq!(index.indexed_items("lib").await.unwrap(), vec![ItemKey::new("lib", "a")]);
        assert_eq!(index.record_count("lib").await.unwrap(), 2);
        assert!(index.indexed_items("other").await.unwrap().is_empty());
    }
}
