//! Batched, retried writes to the search index.
//!
//! Per-item [`IndexOp`]s are grouped into batches of at most
//! `batch_size` records. One item's records always travel together: an
//! item larger than the bound gets a batch of its own. Each batch goes
//! through [`retry_call`]; when retries run out, every item in the batch
//! is reported as failed and the remaining batches still run.

use std::sync::Arc;

use tracing::{debug, warn};

use corpus_sync_core::cancel::CancellationFlag;
use corpus_sync_core::error::SyncError;
use corpus_sync_core::index::{IndexOp, SearchIndex};
use corpus_sync_core::models::ItemKey;

use crate::retry::{retry_call, RetryPolicy};

/// Result of publishing a set of ops.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    /// Items whose batch was applied.
    pub published: Vec<ItemKey>,
    /// Items whose batch failed, with the final error.
    pub failed: Vec<(ItemKey, SyncError)>,
    pub batches: usize,
}

/// Group `ops` into batches whose total weight stays within `batch_size`,
/// never splitting an op.
pub fn plan_batches(ops: Vec<IndexOp>, batch_size: usize) -> Vec<Vec<IndexOp>> {
    let limit = batch_size.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<IndexOp> = Vec::new();
    let mut weight = 0usize;

    for op in ops {
        let w = op.weight();
        if !current.is_empty() && weight + w > limit {
            batches.push(std::mem::take(&mut current));
            weight = 0;
        }
        weight += w;
        current.push(op);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

pub struct IndexPublisher {
    index: Arc<dyn SearchIndex>,
    batch_size: usize,
    policy: RetryPolicy,
    cancel: CancellationFlag,
}

impl IndexPublisher {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        batch_size: usize,
        policy: RetryPolicy,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            index,
            batch_size,
            policy,
            cancel,
        }
    }

    pub async fn publish(&self, ops: Vec<IndexOp>) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();

        for batch in plan_batches(ops, self.batch_size) {
            outcome.batches += 1;
            let keys: Vec<ItemKey> = batch.iter().map(|op| op.key().clone()).collect();
            let index = &self.index;
            let ops = &batch;

            match retry_call(&self.policy, "publish", &self.cancel, move || index.apply(ops)).await {
                Ok(()) => {
                    debug!(items = keys.len(), "published batch");
                    outcome.published.extend(keys);
                }
                Err(err) => {
                    warn!(items = keys.len(), error = %err, "batch publish failed");
                    outcome
                        .failed
                        .extend(keys.into_iter().map(|k| (k, err.clone())));
                }
            }
        }
        outcome
    }
}
