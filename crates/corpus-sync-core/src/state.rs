//! Persistence of per-library [`SyncState`].
//!
//! A [`StateStore`] holds one serialized blob per library and replaces it
//! atomically on `save`. `load` distinguishes "never synced" (`Ok(None)`)
//! from an unreadable blob ([`SyncError::StateCorruption`]), which the
//! orchestrator answers with a full resync.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::delta::SyncState;
use crate::error::{Result, SyncError};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, library_id: &str) -> Result<Option<SyncState>>;

    /// Replace the stored state of `state.library_id` in one atomic write.
    async fn save(&self, state: &SyncState) -> Result<()>;
}

/// Decode a stored blob, mapping any failure to `StateCorruption`.
pub fn decode_state(library_id: &str, blob: &str) -> Result<SyncState> {
    let state: SyncState = serde_json::from_str(blob)
        .map_err(|e| SyncError::StateCorruption(format!("{}: {}", library_id, e)))?;
    if state.library_id != library_id {
        return Err(SyncError::StateCorruption(format!(
            "state for '{}' is stored under '{}'",
            state.library_id, library_id
        )));
    }
    Ok(state)
}

pub fn encode_state(state: &SyncState) -> Result<String> {
    serde_json::to_string(state).map_err(|e| SyncError::StateStore(e.to_string()))
}

/// In-memory state store keeping JSON blobs, like a durable backend would.
#[derive(Default)]
pub struct MemoryStateStore {
    blobs: RwLock<HashMap<String, String>>,
}

fn poisoned() -> SyncError {
    SyncError::StateStore("state lock poisoned".to_string())
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the raw blob of `library_id`.
    pub fn put_raw(&self, library_id: &str, blob: &str) {
        if let Ok(mut blobs) = self.blobs.write() {
            blobs.insert(library_id.to_string(), blob.to_string());
        }
    }

    pub fn raw(&self, library_id: &str) -> Option<String> {
        self.blobs.read().ok()?.get(library_id).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, library_id: &str) -> Result<Option<SyncState>> {
        let blobs = self.blobs.read().map_err(|_| poisoned())?;
        blobs
            .get(library_id)
            .map(|blob| decode_state(library_id, blob))
            .transpose()
    }

    async fn save(&self, state: &SyncState) -> Result<()> {
        let blob = encode_state(state)?;
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        blobs.insert(state.library_id.clone(), blob);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncCursor;

    #[tokio::test]
    async fn save_then_load() {
        let store = MemoryStateStore::new();
        assert!(store.load("lib").await.unwrap().is_none());

        let mut state = SyncState::empty("lib");
        state.cursor = Some(SyncCursor::new("42"));
        store.save(&state).await.unwrap();
        assert_eq!(store.load("lib").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn garbage_blob_is_corruption() {
        let store = MemoryStateStore::new();
        store.put_raw("lib", "{not json");
        let err = store.load("lib").await.unwrap_err();
        assert!(matches!(err, SyncError::StateCorruption(_)));
    }

    #[tokio::test]
    async fn mismatched_library_is_corruption() {
        let store = MemoryStateStore::new();
        store.put_raw("lib", r#"{"library_id":"other"}"#);
        assert!(matches!(
            store.load("lib").await,
            Err(SyncError::StateCorruption(_))
        ));
    }

    #[tokio::test]
    async fn save_replaces_previous_blob() {
        let store = MemoryStateStore::new();
        store.put_raw("lib", "{not json");
        store.save(&SyncState::empty("lib")).await.unwrap();
        assert_eq!(store.load("lib").await.unwrap(), Some(SyncState::empty("lib")));
    }
}
