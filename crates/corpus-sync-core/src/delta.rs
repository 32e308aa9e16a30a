//! Change detection against the last-known state of a library.
//!
//! [`SyncState`] is the persisted view of one library: the change-feed
//! cursor, a fingerprint per indexed item, and the items that failed in
//! the last committed run. [`ChangeDetector::detect`] compares a fresh
//! [`ChangeSet`] against it and classifies every item:
//!
//! | Kind | Condition |
//! |------|-----------|
//! | Created | identity never seen |
//! | Updated | seen, fingerprint differs (or pending retry) |
//! | Deleted | seen and flagged deleted, or absent from a full enumeration |
//! | Unchanged | seen, same fingerprint |
//!
//! Listings are at-least-once: an item may appear more than once, and the
//! last occurrence wins.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{ChangeSet, ItemKey, SourceItem, SyncCursor};

/// What the index is known to hold for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownItem {
    pub fingerprint: String,
    pub last_modified: DateTime<Utc>,
    /// Number of records published for the current version.
    #[serde(default)]
    pub record_count: u32,
}

/// Persisted sync state of one library.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub library_id: String,
    #[serde(default)]
    pub cursor: Option<SyncCursor>,
    /// Keyed by `item_id`.
    #[serde(default)]
    pub known: BTreeMap<String, KnownItem>,
    /// Items that failed in the last committed run, keyed by `item_id`.
    #[serde(default)]
    pub pending: BTreeMap<String, SourceItem>,
    #[serde(default)]
    pub last_run_id: Option<String>,
    #[serde(default)]
    pub last_committed_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Empty state: no cursor, nothing known. Forces a full enumeration.
    pub fn empty(library_id: impl Into<String>) -> Self {
        Self {
            library_id: library_id.into(),
            ..Default::default()
        }
    }

    /// Record a successfully published item.
    pub fn record(&mut self, item: &SourceItem, fingerprint: String, record_count: u32) {
        self.pending.remove(&item.key.item_id);
        self.known.insert(
            item.key.item_id.clone(),
            KnownItem {
                fingerprint,
                last_modified: item.last_modified,
                record_count,
            },
        );
    }

    /// Drop an item whose records were deleted.
    pub fn forget(&mut self, item_id: &str) {
        self.known.remove(item_id);
        self.pending.remove(item_id);
    }

    /// Queue a failed item for the next run.
    pub fn mark_pending(&mut self, item: SourceItem) {
        self.pending.insert(item.key.item_id.clone(), item);
    }

    pub fn is_known(&self, item_id: &str) -> bool {
        self.known.contains_key(item_id)
    }
}

/// Change signal for `item`: content hash (or mtime + size), MIME type and
/// a digest of the readable ACL.
pub fn fingerprint(item: &SourceItem) -> String {
    let mut hasher = Sha256::new();
    match &item.content_hash {
        Some(hash) if !hash.is_empty() => {
            hasher.update(b"hash:");
            hasher.update(hash.as_bytes());
        }
        _ => {
            hasher.update(b"mtime:");
            hasher.update(item.last_modified.to_rfc3339().as_bytes());
            hasher.update(b":size:");
            hasher.update(item.size.to_string().as_bytes());
        }
    }
    hasher.update(b"|mime:");
    hasher.update(item.mime_type.as_bytes());
    hasher.update(b"|acl:");
    hasher.update(acl_digest(item).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn acl_digest(item: &SourceItem) -> String {
    let entries: BTreeSet<String> = item
        .acl
        .iter()
        .map(|e| format!("{}={:?}", e.principal.to_string().to_lowercase(), e.permission))
        .collect();
    entries.into_iter().collect::<Vec<_>>().join(",")
}

/// Classification of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

/// One classified item.
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub item: SourceItem,
    /// Fingerprint of the listed version. `None` for deletions.
    pub fingerprint: Option<String>,
}

impl Change {
    pub fn key(&self) -> &ItemKey {
        &self.item.key
    }
}

/// Work list produced by [`ChangeDetector::detect`].
#[derive(Debug, Clone, Default)]
pub struct Delta {
    /// Created and updated items, in listing order (pending retries last).
    pub upserts: Vec<Change>,
    pub deletes: Vec<Change>,
    pub unchanged: Vec<ItemKey>,
}

impl Delta {
    pub fn count(&self, kind: ChangeKind) -> usize {
        match kind {
            ChangeKind::Unchanged => self.unchanged.len(),
            ChangeKind::Deleted => self.deletes.len(),
            _ => self.upserts.iter().filter(|c| c.kind == kind).count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Stateless classifier of listings against a [`SyncState`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn detect(&self, state: &SyncState, changes: &ChangeSet) -> Delta {
        // Last occurrence wins; remember first-seen order for stable output.
        let mut order: Vec<String> = Vec::new();
        let mut latest: BTreeMap<String, &SourceItem> = BTreeMap::new();
        for item in &changes.items {
            if latest.insert(item.key.item_id.clone(), item).is_none() {
                order.push(item.key.item_id.clone());
            }
        }

        let mut delta = Delta::default();
        for item_id in &order {
            let item = latest[item_id];
            let known = state.known.get(item_id);

            if item.deleted {
                if known.is_some() {
                    delta.deletes.push(Change {
                        kind: ChangeKind::Deleted,
                        item: item.clone(),
                        fingerprint: None,
                    });
                }
                continue;
            }

            let fp = fingerprint(item);
            let kind = match known {
                None => ChangeKind::Created,
                Some(k) if k.fingerprint != fp => ChangeKind::Updated,
                Some(_) if state.pending.contains_key(item_id) => ChangeKind::Updated,
                Some(_) => {
                    delta.unchanged.push(item.key.clone());
                    continue;
                }
            };
            delta.upserts.push(Change {
                kind,
                item: item.clone(),
                fingerprint: Some(fp),
            });
        }

        if changes.full_enumeration {
            for item_id in state.known.keys() {
                if !latest.contains_key(item_id) {
                    delta.deletes.push(Change {
                        kind: ChangeKind::Deleted,
                        item: SourceItem::tombstone(ItemKey::new(
                            state.library_id.clone(),
                            item_id.clone(),
                        )),
                        fingerprint: None,
                    });
                }
            }
        }

        // Failed items the feed did not mention again.
        for (item_id, item) in &state.pending {
            if latest.contains_key(item_id) {
                continue;
            }
            if changes.full_enumeration {
                // Absent from a full listing: the item is gone.
                continue;
            }
            if item.deleted {
                if state.is_known(item_id) {
                    delta.deletes.push(Change {
                        kind: ChangeKind::Deleted,
                        item: item.clone(),
                        fingerprint: None,
                    });
                }
                continue;
            }
            let kind = if state.is_known(item_id) {
                ChangeKind::Updated
            } else {
                ChangeKind::Created
            };
            delta.upserts.push(Change {
                kind,
                item: item.clone(),
                fingerprint: Some(fingerprint(item)),
            });
        }

        delta
    }
}
