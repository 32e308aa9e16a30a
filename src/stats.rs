//! `csync status`: per-library sync state and index coverage.
//!
//! Lists every configured library plus any library that only exists in the
//! stored state, with its cursor, last commit, known and pending items and
//! the number of records in the index.

use std::collections::BTreeSet;

use anyhow::Result;

use corpus_sync_core::delta::SyncState;
use corpus_sync_core::index::SearchIndex;
use corpus_sync_core::state::StateStore;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sqlite_index::SqliteIndex;
use crate::sqlite_state::SqliteStateStore;

/// One row of the status table.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryStatus {
    pub library_id: String,
    pub cursor: Option<String>,
    pub last_committed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub known: usize,
    pub pending: usize,
    pub records: usize,
    /// Stored state failed to decode; the next sync does a full resync.
    pub corrupt: bool,
}

impl LibraryStatus {
    fn from_state(state: Option<SyncState>, library_id: &str, records: usize) -> Self {
        let state = state.unwrap_or_else(|| SyncState::empty(library_id));
        Self {
            library_id: library_id.to_string(),
            cursor: state.cursor.map(|c| c.0),
            last_committed_at: state.last_committed_at,
            known: state.known.len(),
            pending: state.pending.len(),
            records,
            corrupt: false,
        }
    }
}

pub async fn collect_status(
    library_ids: &BTreeSet<String>,
    store: &dyn StateStore,
    index: &dyn SearchIndex,
) -> Result<Vec<LibraryStatus>> {
    let mut rows = Vec::with_capacity(library_ids.len());
    for id in library_ids {
        let records = index.record_count(id).await?;
        let row = match store.load(id).await {
            Ok(state) => LibraryStatus::from_state(state, id, records),
            Err(corpus_sync_core::SyncError::StateCorruption(_)) => LibraryStatus {
                corrupt: true,
                ..LibraryStatus::from_state(None, id, records)
            },
            Err(e) => return Err(e.into()),
        };
        rows.push(row);
    }
    Ok(rows)
}

pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let store = SqliteStateStore::new(pool.clone());
    let index = SqliteIndex::new(pool.clone());

    let mut ids: BTreeSet<String> = config
        .libraries
        .iter()
        .map(|(name, lib)| lib.resolved_id(name))
        .collect();
    ids.extend(store.libraries().await?);

    let rows = collect_status(&ids, &store, &index).await?;

    println!("corpus-sync status");
    println!("==================");
    println!("  Database: {}", config.db.path.display());
    println!();
    if rows.is_empty() {
        println!("  No libraries configured or synced.");
    } else {
        println!(
            "  {:<28} {:>6} {:>8} {:>8}   {:<20} {}",
            "LIBRARY", "KNOWN", "PENDING", "RECORDS", "LAST COMMIT", "CURSOR"
        );
        println!("  {}", "-".repeat(96));
        for row in &rows {
            let committed = match (row.corrupt, row.last_committed_at) {
                (true, _) => "corrupt state".to_string(),
                (false, Some(ts)) => ts.format("%Y-%m-%d %H:%M").to_string(),
                (false, None) => "never".to_string(),
            };
            println!(
                "  {:<28} {:>6} {:>8} {:>8}   {:<20} {}",
                row.library_id,
                row.known,
                row.pending,
                row.records,
                committed,
                row.cursor.as_deref().unwrap_or("-")
            );
        }
    }
    println!();

    pool.close().await;
    Ok(())
}
