//! Sync orchestrator.
//!
//! One [`SyncOrchestrator::run`] moves a library through
//! `Idle → Listing → Processing → Committing → Idle`, or ends in `Aborted`:
//!
//! 1. **Listing**: load the persisted [`SyncState`], ask the source for
//!    changes since its cursor and classify them with the
//!    [`ChangeDetector`]. A corrupt state or cursor falls back to a full
//!    resync, seeded with the items the index already holds so that
//!    orphans get deleted.
//! 2. **Processing**: fan the created/updated items out to
//!    [`ItemPipeline`] workers (bounded by `max_concurrency`), then fold
//!    their results into index ops and a new state. The ops are published
//!    in batches by [`IndexPublisher`].
//! 3. **Committing**: when `failed / attempted` stays within the
//!    tolerance, the new cursor and state are saved in one write. Otherwise
//!    (or on cancellation) the run aborts and the stored cursor is left
//!    alone, so the next run sees the same changes again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use corpus_sync_core::acl::AclResolver;
use corpus_sync_core::cancel::CancellationFlag;
use corpus_sync_core::chunk::ChunkingOptions;
use corpus_sync_core::delta::{ChangeDetector, ChangeKind, Delta, KnownItem, SyncState};
use corpus_sync_core::embedding::Embedder;
use corpus_sync_core::error::SyncError;
use corpus_sync_core::index::{IndexOp, SearchIndex};
use corpus_sync_core::models::{ChangeSet, ItemKey};
use corpus_sync_core::report::{FailureStage, RunOutcome, RunPhase, RunReport};
use corpus_sync_core::source::ContentSource;
use corpus_sync_core::state::StateStore;

use crate::config::{Config, SyncConfig};
use crate::pipeline::{ItemOutcome, ItemPipeline, ProcessedItem};
use crate::publish::IndexPublisher;

/// Tunables for one orchestrator.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub chunking: ChunkingOptions,
    pub sync: SyncConfig,
    pub embed_batch_size: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkingOptions::default(),
            sync: SyncConfig::default(),
            embed_batch_size: 16,
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunking: config.chunking.options(),
            sync: config.sync.clone(),
            embed_batch_size: config.embedding.batch_size,
        }
    }
}

/// What kind of run to perform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunRequest {
    /// Ignore the stored cursor and state and enumerate everything.
    pub full: bool,
    /// Compute and report the delta without fetching or writing anything.
    pub dry_run: bool,
}

pub struct SyncOrchestrator {
    source: Arc<dyn ContentSource>,
    index: Arc<dyn SearchIndex>,
    state_store: Arc<dyn StateStore>,
    embedder: Option<Arc<dyn Embedder>>,
    acl: AclResolver,
    options: SyncOptions,
    cancel: CancellationFlag,
    detector: ChangeDetector,
}

/// State and listing a run starts processing from.
struct Listed {
    state: SyncState,
    changes: ChangeSet,
    full_resync: bool,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn ContentSource>,
        index: Arc<dyn SearchIndex>,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            source,
            index,
            state_store,
            embedder: None,
            acl: AclResolver::passthrough(),
            options: SyncOptions::default(),
            cancel: CancellationFlag::new(),
            detector: ChangeDetector,
        }
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<dyn Embedder>>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_acl(mut self, acl: AclResolver) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn library_id(&self) -> &str {
        self.source.library_id()
    }

    /// Incremental sync.
    pub async fn sync(&self) -> RunReport {
        self.run(RunRequest::default()).await
    }

    pub async fn run(&self, request: RunRequest) -> RunReport {
        let library_id = self.library_id().to_string();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut report = RunReport::new(run_id.clone(), library_id.clone());

        report.phase = RunPhase::Listing;
        info!(library = %library_id, run = %run_id, full = request.full, "listing changes");

        let listed = match self.list(&library_id, request).await {
            Ok(listed) => listed,
            Err(err) => return abort(report, &err),
        };
        let Listed {
            state,
            changes,
            full_resync,
        } = listed;
        report.full_resync = full_resync;
        report.cursor_before = state.cursor.clone();

        let delta = self.detector.detect(&state, &changes);
        report.counts.unchanged = delta.unchanged.len();
        report.attempted = delta.upserts.len() + delta.deletes.len();
        info!(
            library = %library_id,
            created = delta.count(ChangeKind::Created),
            updated = delta.count(ChangeKind::Updated),
            deleted = delta.deletes.len(),
            unchanged = delta.unchanged.len(),
            "delta computed"
        );

        if request.dry_run {
            report.counts.created = delta.count(ChangeKind::Created);
            report.counts.updated = delta.count(ChangeKind::Updated);
            report.counts.deleted = delta.deletes.len();
            report.finish(RunPhase::Idle, RunOutcome::DryRun);
            return report;
        }

        report.phase = RunPhase::Processing;
        info!(library = %library_id, items = report.attempted, "processing");
        let processed = self.process(&delta).await;

        if self.cancel.is_cancelled() {
            return cancelled(report);
        }

        let mut next_state = state;
        let (ops, pending) = merge(&mut report, &mut next_state, &delta, processed);

        if exceeds_tolerance(&report, self.options.sync.failure_tolerance_fraction) {
            return over_tolerance(report, self.options.sync.failure_tolerance_fraction);
        }

        let publisher = IndexPublisher::new(
            self.index.clone(),
            self.options.sync.publish_batch_size,
            self.options.sync.retry_policy(),
            self.cancel.clone(),
        );
        let outcome = publisher.publish(ops).await;
        if self.cancel.is_cancelled() {
            return cancelled(report);
        }
        apply_published(&mut report, &mut next_state, pending, outcome);

        if exceeds_tolerance(&report, self.options.sync.failure_tolerance_fraction) {
            return over_tolerance(report, self.options.sync.failure_tolerance_fraction);
        }

        // Tombstones for items no longer known have nothing left to delete.
        let known = &next_state.known;
        next_state
            .pending
            .retain(|id, item| !item.deleted || known.contains_key(id));

        report.phase = RunPhase::Committing;
        info!(library = %library_id, "committing");
        next_state.cursor = Some(changes.next_cursor.clone());
        next_state.last_run_id = Some(run_id);
        next_state.last_committed_at = Some(Utc::now());

        if let Err(err) = self.state_store.save(&next_state).await {
            return abort(report, &err);
        }

        report.cursor_after = next_state.cursor.clone();
        report.finish(RunPhase::Idle, RunOutcome::Committed);
        info!(
            library = %library_id,
            created = report.counts.created,
            updated = report.counts.updated,
            deleted = report.counts.deleted,
            failed = report.counts.failed,
            records = report.counts.records_written,
            "sync committed"
        );
        report
    }

    /// Load state and list changes, falling back to a full resync when the
    /// state or cursor cannot be trusted. Stored state is only ever
    /// replaced by the commit.
    async fn list(&self, library_id: &str, request: RunRequest) -> Result<Listed, SyncError> {
        let policy = self.options.sync.retry_policy();

        let loaded = if request.full {
            None
        } else {
            match self.state_store.load(library_id).await {
                Ok(state) => state,
                Err(SyncError::StateCorruption(reason)) => {
                    warn!(library = %library_id, reason = %reason, "stored state corrupt; full resync");
                    None
                }
                Err(err) => return Err(err),
            }
        };

        if let Some(state) = loaded {
            let source = &self.source;
            let cursor = state.cursor.as_ref();
            match retry_list(&policy, &self.cancel, source, cursor).await {
                Ok(changes) => {
                    return Ok(Listed {
                        state,
                        changes,
                        full_resync: false,
                    })
                }
                Err(SyncError::StateCorruption(reason)) => {
                    warn!(library = %library_id, reason = %reason, "source rejected cursor; full resync");
                }
                Err(err) => return Err(err),
            }
        }

        let changes = retry_list(&policy, &self.cancel, &self.source, None).await?;
        let state = self.seed_from_index(library_id).await?;
        Ok(Listed {
            state,
            changes,
            full_resync: true,
        })
    }

    /// Empty state that knows every item the index holds, so a full
    /// enumeration re-publishes listed items and deletes the rest.
    async fn seed_from_index(&self, library_id: &str) -> Result<SyncState, SyncError> {
        let mut state = SyncState::empty(library_id);
        for key in self.index.indexed_items(library_id).await? {
            state.known.insert(
                key.item_id,
                KnownItem {
                    fingerprint: String::new(),
                    last_modified: DateTime::<Utc>::default(),
                    record_count: 0,
                },
            );
        }
        Ok(state)
    }

    async fn process(&self, delta: &Delta) -> Vec<ProcessedItem> {
        let pipeline = ItemPipeline::new(
            self.source.clone(),
            self.embedder.clone(),
            self.acl.clone(),
            self.options.chunking.clone(),
            self.options.embed_batch_size,
            self.options.sync.retry_policy(),
            self.cancel.clone(),
        );
        let pipeline = &pipeline;
        let cancel = &self.cancel;

        stream::iter(delta.upserts.iter().cloned())
            .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
            .map(|change| pipeline.process(change))
            .buffer_unordered(self.options.sync.max_concurrency.max(1))
            .collect()
            .await
    }
}

async fn retry_list(
    policy: &crate::retry::RetryPolicy,
    cancel: &CancellationFlag,
    source: &Arc<dyn ContentSource>,
    cursor: Option<&corpus_sync_core::models::SyncCursor>,
) -> Result<ChangeSet, SyncError> {
    crate::retry::retry_call(policy, "list_changes", cancel, move || source.list_changes(cursor)).await
}

/// State update to apply once an item's op is published.
enum PendingUpdate {
    Record {
        change: corpus_sync_core::delta::Change,
        record_count: u32,
        tally: Tally,
        /// Keep the item queued so its ACL is resolved again next run.
        reresolve: bool,
    },
    Forget {
        key: ItemKey,
    },
}

#[derive(Clone, Copy)]
enum Tally {
    Indexed { records: usize },
    Empty,
    Skipped,
}

/// Fold worker results and deletions into index ops plus the state
/// changes that depend on them.
fn merge(
    report: &mut RunReport,
    state: &mut SyncState,
    delta: &Delta,
    processed: Vec<ProcessedItem>,
) -> (Vec<IndexOp>, Vec<PendingUpdate>) {
    let mut ops = Vec::new();
    let mut pending = Vec::new();

    for ProcessedItem { change, outcome } in processed {
        let key = change.key().clone();
        match outcome {
            ItemOutcome::Indexed {
                records,
                embedding_degraded,
                acl_closed,
                acl_unresolved,
            } => {
                if embedding_degraded {
                    report.counts.embedding_degraded += 1;
                }
                if acl_closed {
                    report.counts.acl_closed += 1;
                }
                let tally = Tally::Indexed {
                    records: records.len(),
                };
                let record_count = records.len() as u32;
                ops.push(IndexOp::Replace { key, records });
                pending.push(PendingUpdate::Record {
                    change,
                    record_count,
                    tally,
                    reresolve: acl_unresolved,
                });
            }
            ItemOutcome::Empty | ItemOutcome::Unsupported(_) => {
                let tally = if matches!(outcome, ItemOutcome::Empty) {
                    Tally::Empty
                } else {
                    Tally::Skipped
                };
                ops.push(IndexOp::Replace {
                    key,
                    records: Vec::new(),
                });
                pending.push(PendingUpdate::Record {
                    change,
                    record_count: 0,
                    tally,
                    reresolve: false,
                });
            }
            ItemOutcome::Vanished => {
                ops.push(IndexOp::Delete { key: key.clone() });
                pending.push(PendingUpdate::Forget { key });
            }
            ItemOutcome::Failed { stage, error } => {
                report.record_failure(key, stage, error.to_string());
                state.mark_pending(change.item);
            }
        }
    }

    for change in &delta.deletes {
        let key = change.key().clone();
        ops.push(IndexOp::Delete { key: key.clone() });
        pending.push(PendingUpdate::Forget { key });
    }

    (ops, pending)
}

fn apply_published(
    report: &mut RunReport,
    state: &mut SyncState,
    updates: Vec<PendingUpdate>,
    outcome: crate::publish::PublishOutcome,
) {
    let failed: std::collections::HashMap<ItemKey, SyncError> = outcome.failed.into_iter().collect();

    for update in updates {
        match update {
            PendingUpdate::Record {
                change,
                record_count,
                tally,
                reresolve,
            } => {
                if let Some(err) = failed.get(change.key()) {
                    report.record_failure(change.key().clone(), FailureStage::Publish, err.to_string());
                    state.mark_pending(change.item);
                    continue;
                }
                match tally {
                    Tally::Indexed { records } => {
                        match change.kind {
                            ChangeKind::Created => report.counts.created += 1,
                            _ => report.counts.updated += 1,
                        }
                        report.counts.records_written += records;
                    }
                    Tally::Empty => report.counts.empty += 1,
                    Tally::Skipped => report.counts.skipped += 1,
                }
                let fingerprint = change
                    .fingerprint
                    .clone()
                    .unwrap_or_else(|| corpus_sync_core::delta::fingerprint(&change.item));
                state.record(&change.item, fingerprint, record_count);
                if reresolve {
                    state.mark_pending(change.item);
                }
            }
            PendingUpdate::Forget { key } => {
                if let Some(err) = failed.get(&key) {
                    report.record_failure(key.clone(), FailureStage::Publish, err.to_string());
                    state.mark_pending(corpus_sync_core::models::SourceItem::tombstone(key));
                    continue;
                }
                report.counts.deleted += 1;
                state.forget(&key.item_id);
            }
        }
    }
}

fn exceeds_tolerance(report: &RunReport, tolerance: f64) -> bool {
    report.failure_fraction() > tolerance
}

fn over_tolerance(mut report: RunReport, tolerance: f64) -> RunReport {
    let reason = format!(
        "{} of {} items failed, above tolerance {}",
        report.counts.failed, report.attempted, tolerance
    );
    warn!(library = %report.library_id, reason = %reason, "aborting run; cursor not advanced");
    report.reason = Some(reason);
    report.finish(RunPhase::Aborted, RunOutcome::Aborted);
    report
}

fn cancelled(mut report: RunReport) -> RunReport {
    warn!(library = %report.library_id, "run cancelled; cursor not advanced");
    report.reason = Some("cancelled".to_string());
    report.finish(RunPhase::Aborted, RunOutcome::Cancelled);
    report
}

fn abort(mut report: RunReport, err: &SyncError) -> RunReport {
    if *err == SyncError::Cancelled {
        return cancelled(report);
    }
    warn!(library = %report.library_id, error = %err, "run failed; cursor not advanced");
    report.reason = Some(err.to_string());
    report.finish(RunPhase::Aborted, RunOutcome::Failed);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::TimeZone;
    use corpus_sync_core::index::memory::InMemoryIndex;
    use corpus_sync_core::models::{AclEntry, Principal, SourceItem};
    use corpus_sync_core::source::InMemorySource;
    use corpus_sync_core::state::MemoryStateStore;

    fn item(id: &str, hash: &str) -> SourceItem {
        SourceItem {
            key: ItemKey::new("lib", id),
            name: format!("{}.txt", id),
            path: None,
            content_hash: Some(hash.into()),
            last_modified: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            size: 1,
            mime_type: "text/plain".into(),
            acl: vec![AclEntry::read(Principal::group("staff"))],
            deleted: false,
            web_url: None,
        }
    }

    fn fast_options() -> SyncOptions {
        let mut options = SyncOptions::default();
        options.sync.retry_max_attempts = 2;
        options.sync.retry_base_delay_ms = 1;
        options.sync.retry_max_delay_ms = 2;
        options
    }

    fn setup() -> (Arc<InMemorySource>, Arc<InMemoryIndex>, Arc<MemoryStateStore>, SyncOrchestrator) {
        let source = Arc::new(InMemorySource::new("lib"));
        let index = Arc::new(InMemoryIndex::new());
        let store = Arc::new(MemoryStateStore::new());
        let orchestrator = SyncOrchestrator::new(source.clone(), index.clone(), store.clone())
            .with_options(fast_options());
        (source, index, store, orchestrator)
    }

    #[tokio::test]
    async fn dry_run_reports_without_writing() {
        let (source, index, store, orchestrator) = setup();
        source.upsert(item("a", "h1"), "alpha");
        let report = orchestrator
            .run(RunRequest {
                full: false,
                dry_run: true,
            })
            .await;
        assert_eq!(report.outcome, RunOutcome::DryRun);
        assert_eq!(report.counts.created, 1);
        assert_eq!(index.write_count(), 0);
        assert_eq!(source.fetch_count(), 0);
        assert!(store.raw("lib").is_none());
    }

    #[tokio::test]
    async fn listing_failure_fails_run() {
        let (source, _index, store, orchestrator) = setup();
        for _ in 0..2 {
            source.fail_next_list(SyncError::RemoteUnavailable("offline".into()));
        }
        let report = orchestrator.sync().await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.phase, RunPhase::Aborted);
        assert!(store.raw("lib").is_none());
    }

    #[tokio::test]
    async fn transient_listing_failure_is_retried() {
        let (source, _index, _store, orchestrator) = setup();
        source.upsert(item("a", "h1"), "alpha");
        source.fail_next_list(SyncError::Timeout {
            operation: "list".into(),
            elapsed: Duration::from_millis(5),
        });
        let report = orchestrator.sync().await;
        assert!(report.committed());
        assert_eq!(report.counts.created, 1);
    }

    #[tokio::test]
    async fn failed_delete_stays_pending() {
        let (source, index, store, orchestrator) = setup();
        source.upsert(item("a", "h1"), "alpha");
        assert!(orchestrator.sync().await.committed());

        source.delete("a");
        index.fail_next(SyncError::IndexPublish("down".into()));
        index.fail_next(SyncError::IndexPublish("down".into()));
        let mut options = fast_options();
        options.sync.failure_tolerance_fraction = 1.0;
        let orchestrator = SyncOrchestrator::new(source.clone(), index.clone(), store.clone())
            .with_options(options);
        let report = orchestrator.sync().await;
        assert!(report.committed());
        assert_eq!(report.counts.failed, 1);
        assert_eq!(index.snapshot().len(), 1);

        let report = orchestrator.sync().await;
        assert!(report.committed());
        assert_eq!(report.counts.deleted, 1);
        assert!(index.snapshot().is_empty());
    }
}
