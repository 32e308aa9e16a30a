//! End-to-end sync behavior over the in-memory source, index and state
//! store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use corpus_sync::core::acl::{AclResolver, StaticDirectory};
use corpus_sync::core::cancel::CancellationFlag;
use corpus_sync::core::chunk::{chunk_text, ChunkingOptions};
use corpus_sync::core::delta::SyncState;
use corpus_sync::core::embedding::Embedder;
use corpus_sync::core::index::memory::InMemoryIndex;
use corpus_sync::core::index::SearchIndex;
use corpus_sync::core::models::{AclEntry, ItemKey, Principal, SourceItem, SyncCursor};
use corpus_sync::core::report::{FailureStage, RunOutcome, RunPhase};
use corpus_sync::core::source::InMemorySource;
use corpus_sync::core::state::{MemoryStateStore, StateStore};
use corpus_sync::core::SyncError;
use corpus_sync::sync::{RunRequest, SyncOptions, SyncOrchestrator};

const LIB: &str = "hr-policies";

fn item(id: &str, hash: &str) -> SourceItem {
    SourceItem {
        key: ItemKey::new(LIB, id),
        name: format!("{}.txt", id),
        path: Some("/policies".into()),
        content_hash: Some(hash.into()),
        last_modified: Utc.with_ymd_and_hms(2024, 6, 3, 9, 30, 0).unwrap(),
        size: 100,
        mime_type: "text/plain".into(),
        acl: vec![AclEntry::read(Principal::group("HR"))],
        deleted: false,
        web_url: Some(format!("https://intranet.example/{}", id)),
    }
}

fn options() -> SyncOptions {
    let mut options = SyncOptions::default();
    options.sync.retry_max_attempts = 2;
    options.sync.retry_base_delay_ms = 1;
    options.sync.retry_max_delay_ms = 2;
    options
}

struct Harness {
    source: Arc<InMemorySource>,
    index: Arc<InMemoryIndex>,
    store: Arc<MemoryStateStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            source: Arc::new(InMemorySource::new(LIB)),
            index: Arc::new(InMemoryIndex::new()),
            store: Arc::new(MemoryStateStore::new()),
        }
    }

    fn orchestrator(&self) -> SyncOrchestrator {
        self.orchestrator_with(options())
    }

    fn orchestrator_with(&self, options: SyncOptions) -> SyncOrchestrator {
        SyncOrchestrator::new(self.source.clone(), self.index.clone(), self.store.clone())
            .with_options(options)
    }

    async fn texts(&self, id: &str) -> Vec<String> {
        self.index
            .records_for_item(&ItemKey::new(LIB, id))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.text)
            .collect()
    }

    async fn state(&self) -> SyncState {
        self.store.load(LIB).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn created_updated_and_deleted_items_are_reconciled() {
    let h = Harness::new();
    h.source.upsert(item("b", "h1"), "Bravo policy, first edition.");
    h.source.upsert(item("c", "h1"), "Charlie policy.");
    let first = h.orchestrator().sync().await;
    assert!(first.committed());
    assert_eq!(first.counts.created, 2);

    h.source.upsert(item("a", "h1"), "Alpha policy.");
    h.source.upsert(item("b", "h2"), "Bravo policy, second edition.");
    h.source.delete("c");
    let report = h.orchestrator().sync().await;

    assert_eq!(report.outcome, RunOutcome::Committed);
    assert_eq!(report.phase, RunPhase::Idle);
    assert_eq!(report.counts.created, 1);
    assert_eq!(report.counts.updated, 1);
    assert_eq!(report.counts.deleted, 1);
    assert_eq!(report.counts.failed, 0);
    assert!(!report.full_resync);

    assert_eq!(h.texts("a").await, vec!["Alpha policy.".to_string()]);
    assert_eq!(h.texts("b").await, vec!["Bravo policy, second edition.".to_string()]);
    assert!(h.texts("c").await.is_empty());

    let expected_cursor = SyncCursor::new(h.source.version().to_string());
    assert_eq!(report.cursor_after.as_ref(), Some(&expected_cursor));
    assert_eq!(h.state().await.cursor, Some(expected_cursor));
    assert_eq!(report.cursor_before, first.cursor_after);
}

#[tokio::test]
async fn relisting_unchanged_item_writes_nothing() {
    let h = Harness::new();
    let a = item("a", "h1");
    h.source.upsert(a.clone(), "Unchanged text.\n\nStill unchanged.");
    assert!(h.orchestrator().sync().await.committed());
    let before = h.index.snapshot();
    let writes = h.index.write_count();

    // Same version listed again by the feed.
    h.source.upsert(a, "Unchanged text.\n\nStill unchanged.");
    let report = h.orchestrator().sync().await;

    assert!(report.committed());
    assert_eq!(report.counts.unchanged, 1);
    assert_eq!(report.counts.created + report.counts.updated, 0);
    assert_eq!(h.index.write_count(), writes);
    assert_eq!(h.index.snapshot(), before);
}

fn paragraphs(n: usize) -> String {
    (0..n)
        .map(|i| format!("{}{}", i, "p".repeat(79)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[tokio::test]
async fn shrinking_document_leaves_no_orphan_chunks() {
    let h = Harness::new();
    let mut opts = options();
    opts.chunking = ChunkingOptions {
        max_chunk_size: 100,
        overlap: 10,
        boundary_window: 100,
    };

    let long = paragraphs(5);
    let key = ItemKey::new(LIB, "a");
    assert_eq!(chunk_text(&key, &long, &opts.chunking).len(), 5);

    h.source.upsert(item("a", "h1"), long);
    assert!(h.orchestrator_with(opts.clone()).sync().await.committed());
    assert_eq!(h.texts("a").await.len(), 5);

    h.source.upsert(item("a", "h2"), paragraphs(2));
    let report = h.orchestrator_with(opts).sync().await;
    assert!(report.committed());
    assert_eq!(report.counts.updated, 1);

    let records = h.index.records_for_item(&key).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records.iter().map(|r| r.ordinal).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(h.state().await.known["a"].record_count, 2);
}

#[tokio::test]
async fn throttled_batch_is_applied_whole_after_retry() {
    let h = Harness::new();
    for id in ["a", "b", "c"] {
        h.source.upsert(item(id, "h1"), format!("Document {}.", id));
    }
    h.index.fail_next(SyncError::RateLimited {
        retry_after: Some(Duration::from_millis(1)),
    });

    let report = h.orchestrator().sync().await;
    assert!(report.committed());
    assert_eq!(report.counts.created, 3);
    assert_eq!(h.index.batch_count(), 1);
    assert_eq!(h.index.snapshot().len(), 3);
}

#[tokio::test]
async fn exhausted_batch_leaves_index_and_cursor_untouched() {
    let h = Harness::new();
    h.source.upsert(item("a", "h1"), "First.");
    assert!(h.orchestrator().sync().await.committed());
    let state_before = h.store.raw(LIB);
    let index_before = h.index.snapshot();

    h.source.upsert(item("a", "h2"), "Second.");
    h.source.upsert(item("b", "h1"), "Other.");
    for _ in 0..2 {
        h.index.fail_next(SyncError::RateLimited { retry_after: None });
    }
    let report = h.orchestrator().sync().await;

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.counts.failed, 2);
    assert!(report.failures.iter().all(|f| f.stage == FailureStage::Publish));
    assert_eq!(h.index.snapshot(), index_before);
    assert_eq!(h.store.raw(LIB), state_before);
}

#[tokio::test]
async fn failures_over_tolerance_keep_cursor() {
    let h = Harness::new();
    h.source.upsert(item("a", "h1"), "Alpha.");
    assert!(h.orchestrator().sync().await.committed());
    let committed = h.state().await;

    for id in ["b", "c", "d"] {
        h.source.upsert(item(id, "h1"), format!("Doc {}.", id));
    }
    for id in ["b", "c"] {
        h.source
            .fail_fetch(id, SyncError::RemoteUnavailable("503".into()), 2);
    }
    let report = h.orchestrator().sync().await;

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.phase, RunPhase::Aborted);
    assert_eq!(report.counts.failed, 2);
    assert!(report.cursor_after.is_none());
    assert!(report.reason.is_some());
    assert_eq!(h.state().await, committed);

    // The same changes are seen again once the source recovers.
    let retry = h.orchestrator().sync().await;
    assert!(retry.committed());
    assert_eq!(retry.counts.created, 3);
}

#[tokio::test]
async fn failures_within_tolerance_commit_and_retry_later() {
    let h = Harness::new();
    for id in ["a", "b"] {
        h.source.upsert(item(id, "h1"), format!("Doc {}.", id));
    }
    h.source
        .fail_fetch("b", SyncError::RemoteUnavailable("503".into()), 2);
    let mut opts = options();
    opts.sync.failure_tolerance_fraction = 0.5;

    let report = h.orchestrator_with(opts.clone()).sync().await;
    assert!(report.committed());
    assert_eq!(report.counts.created, 1);
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.failures[0].stage, FailureStage::Fetch);
    assert!(h.state().await.pending.contains_key("b"));

    // Nothing new in the feed; the pending item is retried anyway.
    let report = h.orchestrator_with(opts).sync().await;
    assert!(report.committed());
    assert_eq!(report.counts.created, 1);
    assert!(h.state().await.pending.is_empty());
    assert_eq!(h.texts("b").await, vec!["Doc b.".to_string()]);
}

#[tokio::test]
async fn unresolvable_principals_close_the_item() {
    let h = Harness::new();
    let mut secret = item("secret", "h1");
    secret.acl = vec![AclEntry::read(Principal::group("ghosts"))];
    h.source.upsert(secret, "Classified budget figures.");

    let directory = StaticDirectory::new().with(Principal::group("hr"), vec![Principal::user("dana")]);
    let report = h
        .orchestrator()
        .with_acl(AclResolver::new(Arc::new(directory)))
        .sync()
        .await;

    assert!(report.committed());
    assert_eq!(report.counts.acl_closed, 1);
    let records = h.index.records_for_item(&ItemKey::new(LIB, "secret")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].filter_principals.is_empty());

    let hits = h
        .index
        .search("budget", &["group:ghosts".to_string(), "user:dana".to_string()], 10)
        .await
        .unwrap();
    assert!(hits.is_empty());
    assert!(h.state().await.pending.contains_key("secret"));
}

#[tokio::test]
async fn closed_item_is_reresolved_once_directory_knows_group() {
    let h = Harness::new();
    let mut budget = item("budget", "h1");
    budget.acl = vec![AclEntry::read(Principal::group("finance"))];
    h.source.upsert(budget, "Quarterly budget forecast.");

    let first = h
        .orchestrator()
        .with_acl(AclResolver::new(Arc::new(StaticDirectory::new())))
        .sync()
        .await;
    assert!(first.committed());
    assert_eq!(first.counts.acl_closed, 1);
    assert!(h
        .index
        .search("budget", &["user:omar".to_string()], 10)
        .await
        .unwrap()
        .is_empty());

    // The item itself is unchanged; only the directory learned the group.
    let directory =
        StaticDirectory::new().with(Principal::group("finance"), vec![Principal::user("omar")]);
    let second = h
        .orchestrator()
        .with_acl(AclResolver::new(Arc::new(directory)))
        .sync()
        .await;
    assert!(second.committed());
    assert_eq!(second.counts.updated, 1);
    assert_eq!(second.counts.acl_closed, 0);

    let hits = h.index.search("budget", &["user:omar".to_string()], 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].item_id, "budget");
    assert!(h.state().await.pending.is_empty());
}

#[tokio::test]
async fn group_expansion_controls_visibility() {
    let h = Harness::new();
    h.source.upsert(item("a", "h1"), "Parental leave guidance.");
    let directory = StaticDirectory::new().with(Principal::group("hr"), vec![Principal::user("Dana")]);
    assert!(h
        .orchestrator()
        .with_acl(AclResolver::new(Arc::new(directory)))
        .sync()
        .await
        .committed());

    let visible = h.index.search("leave", &["user:dana".to_string()], 10).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].item_id, "a");
    let hidden = h.index.search("leave", &["user:erin".to_string()], 10).await.unwrap();
    assert!(hidden.is_empty());
}

#[tokio::test]
async fn chunking_is_deterministic_across_runs() {
    let text = paragraphs(7);
    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let h = Harness::new();
        h.source.upsert(item("a", "h1"), text.clone());
        let mut opts = options();
        opts.chunking = ChunkingOptions {
            max_chunk_size: 120,
            overlap: 20,
            boundary_window: 60,
        };
        assert!(h.orchestrator_with(opts).sync().await.committed());
        snapshots.push(h.index.snapshot());
    }
    assert_eq!(snapshots[0], snapshots[1]);
    assert!(snapshots[0].len() > 1);
}

#[tokio::test]
async fn item_gone_at_fetch_is_deleted() {
    let h = Harness::new();
    h.source.upsert(item("a", "h1"), "Original.");
    assert!(h.orchestrator().sync().await.committed());

    h.source.upsert(item("a", "h2"), "Edited.");
    h.source
        .fail_fetch("a", SyncError::NotFound(ItemKey::new(LIB, "a")), 1);
    let report = h.orchestrator().sync().await;

    assert!(report.committed());
    assert_eq!(report.counts.deleted, 1);
    assert_eq!(report.counts.failed, 0);
    assert!(h.texts("a").await.is_empty());
    assert!(!h.state().await.known.contains_key("a"));
}

#[tokio::test]
async fn corrupt_state_triggers_full_resync() {
    let h = Harness::new();
    h.source.upsert(item("a", "h1"), "Alpha.");
    h.source.upsert(item("b", "h1"), "Bravo.");
    assert!(h.orchestrator().sync().await.committed());

    h.store.put_raw(LIB, "{\"library_id\": 7");
    // Removed while the state was unreadable: only the index remembers it.
    let index_only = Arc::new(InMemorySource::new(LIB));
    index_only.upsert(item("a", "h1"), "Alpha.");
    let orchestrator = SyncOrchestrator::new(index_only, h.index.clone(), h.store.clone())
        .with_options(options());
    let report = orchestrator.sync().await;

    assert!(report.committed());
    assert!(report.full_resync);
    assert_eq!(report.counts.updated, 1);
    assert_eq!(report.counts.deleted, 1);
    assert!(h.texts("b").await.is_empty());
    assert_eq!(h.texts("a").await, vec!["Alpha.".to_string()]);
    assert_eq!(h.state().await.known.len(), 1);
}

#[tokio::test]
async fn rejected_cursor_triggers_full_resync() {
    let h = Harness::new();
    h.source.upsert(item("a", "h1"), "Alpha.");
    let mut state = SyncState::empty(LIB);
    state.cursor = Some(SyncCursor::new("9999"));
    h.store.save(&state).await.unwrap();

    let report = h.orchestrator().sync().await;
    assert!(report.committed());
    assert!(report.full_resync);
    assert_eq!(report.counts.created, 1);
}

#[tokio::test]
async fn forced_full_run_relists_everything() {
    let h = Harness::new();
    h.source.upsert(item("a", "h1"), "Alpha.");
    assert!(h.orchestrator().sync().await.committed());

    let report = h
        .orchestrator()
        .run(RunRequest {
            full: true,
            dry_run: false,
        })
        .await;
    assert!(report.committed());
    assert!(report.full_resync);
    assert_eq!(report.counts.updated, 1);
    assert_eq!(h.texts("a").await, vec!["Alpha.".to_string()]);
}

#[tokio::test]
async fn aborted_full_run_keeps_committed_cursor() {
    let h = Harness::new();
    h.source.upsert(item("a", "h1"), "Alpha.");
    let first = h.orchestrator().sync().await;
    assert!(first.committed());
    let state_before = h.store.raw(LIB);
    let cursor_before = h.state().await.cursor;
    assert!(cursor_before.is_some());

    h.source
        .fail_fetch("a", SyncError::RemoteUnavailable("503".into()), 2);
    let full = h
        .orchestrator()
        .run(RunRequest {
            full: true,
            dry_run: false,
        })
        .await;
    assert_eq!(full.outcome, RunOutcome::Aborted);
    assert!(full.full_resync);
    assert_eq!(h.store.raw(LIB), state_before);
    assert_eq!(h.state().await.cursor, cursor_before);
    assert_eq!(h.texts("a").await, vec!["Alpha.".to_string()]);

    let next = h.orchestrator().sync().await;
    assert!(next.committed());
    assert!(!next.full_resync);
    assert_eq!(next.cursor_before, cursor_before);
}

#[tokio::test]
async fn libraries_sharing_a_long_prefix_keep_separate_records() {
    let index = Arc::new(InMemoryIndex::new());
    let libraries = ["contoso-hr-policies-2024-archive", "contoso-hr-policies-2024-current"];
    for library in libraries {
        let source = Arc::new(InMemorySource::new(library));
        source.upsert(item("handbook", "h1"), format!("Handbook kept in {}.", library));
        let report = SyncOrchestrator::new(source, index.clone(), Arc::new(MemoryStateStore::new()))
            .with_options(options())
            .sync()
            .await;
        assert!(report.committed());
        assert_eq!(report.counts.created, 1);
    }

    for library in libraries {
        assert_eq!(index.record_count(library).await.unwrap(), 1);
        let records = index
            .records_for_item(&ItemKey::new(library, "handbook"))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, format!("Handbook kept in {}.", library));
    }
    assert_eq!(index.snapshot().len(), 2);
}

/// Sets the cancellation flag the first time it is asked for vectors.
struct CancellingEmbedder {
    cancel: CancellationFlag,
}

#[async_trait]
impl Embedder for CancellingEmbedder {
    fn model_name(&self) -> &str {
        "cancelling"
    }

    fn dims(&self) -> usize {
        2
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
        self.cancel.cancel();
        Ok(texts.iter().map(|_| vec![0.5, 0.5]).collect())
    }
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_keeps_cursor() {
    let h = Harness::new();
    for id in ["a", "b", "c"] {
        h.source.upsert(item(id, "h1"), format!("Doc {}.", id));
    }
    let cancel = CancellationFlag::new();
    let mut opts = options();
    opts.sync.max_concurrency = 1;

    let report = h
        .orchestrator_with(opts)
        .with_cancellation(cancel.clone())
        .with_embedder(Some(Arc::new(CancellingEmbedder { cancel: cancel.clone() })))
        .sync()
        .await;

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.phase, RunPhase::Aborted);
    assert!(h.source.fetch_count() < 3);
    assert!(h.store.raw(LIB).is_none());
    assert_eq!(h.index.write_count(), 0);
}

struct FixedEmbedder;

#[async_trait]
impl Embedder for FixedEmbedder {
    fn model_name(&self) -> &str {
        "fixed"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, 1.0, 0.0])
            .collect())
    }
}

struct ThrottledEmbedder;

#[async_trait]
impl Embedder for ThrottledEmbedder {
    fn model_name(&self) -> &str {
        "throttled"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, SyncError> {
        Err(SyncError::RateLimited {
            retry_after: Some(Duration::from_millis(1)),
        })
    }
}

#[tokio::test]
async fn embeddings_are_attached_to_records() {
    let h = Harness::new();
    h.source.upsert(item("a", "h1"), "Vectors please.");
    let report = h
        .orchestrator()
        .with_embedder(Some(Arc::new(FixedEmbedder)))
        .sync()
        .await;
    assert!(report.committed());
    assert_eq!(report.counts.embedding_degraded, 0);
    let records = h.index.snapshot();
    assert_eq!(records[0].vector, Some(vec![15.0, 1.0, 0.0]));
}

#[tokio::test]
async fn embedding_exhaustion_degrades_to_lexical() {
    let h = Harness::new();
    h.source.upsert(item("a", "h1"), "Still searchable by keyword.");
    let report = h
        .orchestrator()
        .with_embedder(Some(Arc::new(ThrottledEmbedder)))
        .sync()
        .await;

    assert!(report.committed());
    assert_eq!(report.counts.embedding_degraded, 1);
    assert_eq!(report.counts.failed, 0);
    let records = h.index.snapshot();
    assert_eq!(records.len(), 1);
    assert!(records[0].vector.is_none());
    let hits = h.index.search("keyword", &["group:hr".to_string()], 5).await.unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn unsupported_and_empty_items_are_counted() {
    let h = Harness::new();
    let mut binary = item("tool", "h1");
    binary.name = "tool.exe".into();
    binary.mime_type = "application/x-msdownload".into();
    h.source.upsert(binary, vec![0x4du8, 0x5a, 0x00]);
    h.source.upsert(item("blank", "h1"), "   \n\n ");
    h.source.upsert(item("a", "h1"), "Real content.");

    let report = h.orchestrator().sync().await;
    assert!(report.committed());
    assert_eq!(report.counts.skipped, 1);
    assert_eq!(report.counts.empty, 1);
    assert_eq!(report.counts.created, 1);
    assert_eq!(report.counts.failed, 0);
    assert_eq!(h.index.snapshot().len(), 1);

    let state = h.state().await;
    assert_eq!(state.known.len(), 3);
    assert_eq!(state.known["tool"].record_count, 0);
}
