//! Content source abstraction and an in-memory change feed.
//!
//! A [`ContentSource`] lists the items of one library (fully, or as the
//! changes since a cursor) and fetches the bytes of a single item.
//! Listings are at-least-once: replaying a cursor may repeat items, and
//! every downstream stage tolerates that.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, SyncError};
use crate::models::{ChangeSet, ContentMetadata, FetchedContent, ItemKey, SourceItem, SyncCursor};

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Library this source serves.
    fn library_id(&self) -> &str;

    /// Items changed since `cursor`, or every live item when `cursor` is
    /// `None`.
    async fn list_changes(&self, cursor: Option<&SyncCursor>) -> Result<ChangeSet>;

    /// Bytes and metadata of one item. [`SyncError::NotFound`] when the
    /// item is gone.
    async fn fetch(&self, key: &ItemKey) -> Result<FetchedContent>;
}

struct Entry {
    item: SourceItem,
    bytes: Vec<u8>,
    version: u64,
}

#[derive(Default)]
struct Feed {
    version: u64,
    entries: BTreeMap<String, Entry>,
    tombstones: BTreeMap<String, u64>,
}

/// Versioned in-memory library.
///
/// Every mutation bumps the feed version; the cursor handed out by
/// `list_changes` is that version. Deletions leave tombstones so delta
/// listings report them.
pub struct InMemorySource {
    library_id: String,
    feed: Mutex<Feed>,
    list_failures: Mutex<VecDeque<SyncError>>,
    fetch_failures: Mutex<HashMap<String, VecDeque<SyncError>>>,
    fetches: AtomicUsize,
}

fn poisoned() -> SyncError {
    SyncError::RemoteUnavailable("source lock poisoned".to_string())
}

impl InMemorySource {
    pub fn new(library_id: impl Into<String>) -> Self {
        Self {
            library_id: library_id.into(),
            feed: Mutex::new(Feed::default()),
            list_failures: Mutex::new(VecDeque::new()),
            fetch_failures: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Create or replace an item. Its key is rewritten to this library.
    pub fn upsert(&self, mut item: SourceItem, bytes: impl Into<Vec<u8>>) {
        item.key.library_id = self.library_id.clone();
        item.deleted = false;
        if let Ok(mut feed) = self.feed.lock() {
            feed.version += 1;
            let version = feed.version;
            feed.tombstones.remove(&item.key.item_id);
            feed.entries.insert(
                item.key.item_id.clone(),
                Entry {
                    item,
                    bytes: bytes.into(),
                    version,
                },
            );
        }
    }

    /// Delete an item, leaving a tombstone for delta listings.
    pub fn delete(&self, item_id: &str) {
        if let Ok(mut feed) = self.feed.lock() {
            if feed.entries.remove(item_id).is_some() {
                feed.version += 1;
                let version = feed.version;
                feed.tombstones.insert(item_id.to_string(), version);
            }
        }
    }

    /// Fail the next `list_changes` call with `err`.
    pub fn fail_next_list(&self, err: SyncError) {
        if let Ok(mut q) = self.list_failures.lock() {
            q.push_back(err);
        }
    }

    /// Fail the next `times` fetches of `item_id` with `err`.
    pub fn fail_fetch(&self, item_id: &str, err: SyncError, times: usize) {
        if let Ok(mut failures) = self.fetch_failures.lock() {
            let q = failures.entry(item_id.to_string()).or_default();
            q.extend(std::iter::repeat(err).take(times));
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Current feed version, i.e. the cursor a full listing would return.
    pub fn version(&self) -> u64 {
        self.feed.lock().map(|f| f.version).unwrap_or(0)
    }
}

#[async_trait]
impl ContentSource for InMemorySource {
    fn library_id(&self) -> &str {
        &self.library_id
    }

    async fn list_changes(&self, cursor: Option<&SyncCursor>) -> Result<ChangeSet> {
        if let Some(err) = self.list_failures.lock().map_err(|_| poisoned())?.pop_front() {
            return Err(err);
        }

        let feed = self.feed.lock().map_err(|_| poisoned())?;
        let next_cursor = SyncCursor::new(feed.version.to_string());

        let since = match cursor {
            None => {
                return Ok(ChangeSet {
                    items: feed.entries.values().map(|e| e.item.clone()).collect(),
                    next_cursor,
                    full_enumeration: true,
                })
            }
            Some(c) => c.as_str().parse::<u64>().map_err(|_| {
                SyncError::StateCorruption(format!("cursor '{}' is not a feed version", c))
            })?,
        };
        if since > feed.version {
            return Err(SyncError::StateCorruption(format!(
                "cursor {} is ahead of feed version {}",
                since, feed.version
            )));
        }

        let mut changed: Vec<(u64, SourceItem)> = feed
            .entries
            .values()
            .filter(|e| e.version > since)
            .map(|e| (e.version, e.item.clone()))
            .collect();
        changed.extend(
            feed.tombstones
                .iter()
                .filter(|(_, v)| **v > since)
                .map(|(id, v)| {
                    (
                        *v,
                        SourceItem::tombstone(ItemKey::new(self.library_id.clone(), id.clone())),
                    )
                }),
        );
        changed.sort_by_key(|(v, _)| *v);

        Ok(ChangeSet {
            items: changed.into_iter().map(|(_, item)| item).collect(),
            next_cursor,
            full_enumeration: false,
        })
    }

    async fn fetch(&self, key: &ItemKey) -> Result<FetchedContent> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .fetch_failures
            .lock()
            .map_err(|_| poisoned())?
            .get_mut(&key.item_id)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }

        let feed = self.feed.lock().map_err(|_| poisoned())?;
        let entry = feed
            .entries
            .get(&key.item_id)
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;
        Ok(FetchedContent {
            bytes: entry.bytes.clone(),
            metadata: ContentMetadata {
                title: Some(entry.item.name.clone()),
                modified_at: Some(entry.item.last_modified),
                path: entry.item.path.clone(),
                web_url: entry.item.web_url.clone(),
                ..Default::default()
            },
        })
    }
}
