//! Per-item processing: fetch, extract, chunk, embed, resolve ACL.
//!
//! [`ItemPipeline::process`] turns one created or updated item into the
//! records that should replace its previous version in the index. It never
//! touches the index or the sync state; the orchestrator merges the
//! returned [`ProcessedItem`]s after every worker has finished.

use std::sync::Arc;

use tracing::{debug, warn};

use corpus_sync_core::acl::AclResolver;
use corpus_sync_core::cancel::CancellationFlag;
use corpus_sync_core::chunk::{chunk_text, ChunkingOptions};
use corpus_sync_core::delta::Change;
use corpus_sync_core::embedding::Embedder;
use corpus_sync_core::error::SyncError;
use corpus_sync_core::models::{Chunk, DocumentMetadata, FetchedContent, IndexRecord, SourceItem};
use corpus_sync_core::report::FailureStage;
use corpus_sync_core::source::ContentSource;

use crate::extract::{extract, DocumentFormat, ExtractError, Extraction};
use crate::retry::{retry_call, RetryPolicy};

/// What happened to one item.
#[derive(Debug)]
pub enum ItemOutcome {
    /// Records ready to replace the item's previous version.
    Indexed {
        records: Vec<IndexRecord>,
        /// Embedding failed; records carry no vectors.
        embedding_degraded: bool,
        /// No principal resolved; records are invisible to filtered search.
        acl_closed: bool,
        /// Some principal did not resolve; the item needs another pass.
        acl_unresolved: bool,
    },
    /// Supported format without any text.
    Empty,
    /// No extractor for the item's format.
    Unsupported(String),
    /// The item disappeared between listing and fetch.
    Vanished,
    Failed {
        stage: FailureStage,
        error: SyncError,
    },
}

#[derive(Debug)]
pub struct ProcessedItem {
    pub change: Change,
    pub outcome: ItemOutcome,
}

pub struct ItemPipeline {
    source: Arc<dyn ContentSource>,
    embedder: Option<Arc<dyn Embedder>>,
    acl: AclResolver,
    chunking: ChunkingOptions,
    embed_batch_size: usize,
    policy: RetryPolicy,
    cancel: CancellationFlag,
}

impl ItemPipeline {
    pub fn new(
        source: Arc<dyn ContentSource>,
        embedder: Option<Arc<dyn Embedder>>,
        acl: AclResolver,
        chunking: ChunkingOptions,
        embed_batch_size: usize,
        policy: RetryPolicy,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            source,
            embedder,
            acl,
            chunking,
            embed_batch_size: embed_batch_size.max(1),
            policy,
            cancel,
        }
    }

    pub async fn process(&self, change: Change) -> ProcessedItem {
        let outcome = self.run(&change.item).await;
        match &outcome {
            ItemOutcome::Indexed { records, .. } => {
                debug!(item = %change.item.key, records = records.len(), "processed")
            }
            ItemOutcome::Failed { stage, error } => {
                warn!(item = %change.item.key, stage = ?stage, error = %error, "item failed")
            }
            ItemOutcome::Unsupported(reason) => {
                warn!(item = %change.item.key, reason = %reason, "skipping unsupported item")
            }
            other => debug!(item = %change.item.key, outcome = ?other, "processed"),
        }
        ProcessedItem { change, outcome }
    }

    async fn run(&self, item: &SourceItem) -> ItemOutcome {
        let source = &self.source;
        let key = &item.key;
        let fetched = match retry_call(&self.policy, "fetch", &self.cancel, move || source.fetch(key)).await {
            Ok(fetched) => fetched,
            Err(SyncError::NotFound(_)) => return ItemOutcome::Vanished,
            Err(error) => {
                return ItemOutcome::Failed {
                    stage: FailureStage::Fetch,
                    error,
                }
            }
        };

        let FetchedContent { bytes, metadata } = fetched;
        let mime_type = metadata
            .mime_type
            .clone()
            .unwrap_or_else(|| item.mime_type.clone());
        let format = DocumentFormat::detect(&mime_type, &item.name);

        let extraction = match extract_blocking(bytes, format).await {
            Ok(extraction) => extraction,
            Err(ExtractError::Unsupported(reason)) => {
                return ItemOutcome::Unsupported(format!("{} ({})", mime_type, reason))
            }
            Err(e) => {
                return ItemOutcome::Failed {
                    stage: FailureStage::Extract,
                    error: e.into(),
                }
            }
        };

        let properties = &extraction.properties;
        let doc_metadata = DocumentMetadata {
            title: metadata
                .title
                .or_else(|| properties.title.clone())
                .or_else(|| Some(item.name.clone())),
            author: metadata.author.or_else(|| properties.creator.clone()),
            created_at: metadata.created_at.or(properties.created),
            modified_at: metadata
                .modified_at
                .or(properties.modified)
                .or(Some(item.last_modified)),
            path: metadata.path.or_else(|| item.path.clone()),
            mime_type,
            web_url: metadata.web_url.or_else(|| item.web_url.clone()),
        };

        let mut chunks = chunk_text(key, &extraction.text, &self.chunking);
        if chunks.is_empty() {
            return ItemOutcome::Empty;
        }

        let mut embedding_degraded = false;
        if let Some(embedder) = &self.embedder {
            match self.embed_chunks(embedder.as_ref(), &chunks).await {
                Ok(vectors) => {
                    for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                        chunk.vector = Some(vector);
                    }
                }
                Err(SyncError::Cancelled) => {
                    return ItemOutcome::Failed {
                        stage: FailureStage::Embed,
                        error: SyncError::Cancelled,
                    }
                }
                Err(error) => {
                    warn!(item = %key, error = %error, "embedding failed; indexing without vectors");
                    embedding_degraded = true;
                }
            }
        }

        let acl = self.acl.resolve(key, &item.acl).await;
        let records = chunks
            .into_iter()
            .map(|mut chunk| {
                chunk.filter_principals = acl.principals.clone();
                IndexRecord::from_chunk(chunk, &doc_metadata)
            })
            .collect();

        ItemOutcome::Indexed {
            records,
            embedding_degraded,
            acl_closed: acl.is_closed(),
            acl_unresolved: acl.has_unresolved(),
        }
    }

    async fn embed_chunks(&self, embedder: &dyn Embedder, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, SyncError> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.embed_batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let texts = &texts;
            let batch_vectors =
                retry_call(&self.policy, "embed", &self.cancel, move || embedder.embed(texts)).await?;
            vectors.extend(batch_vectors);
        }
        Ok(vectors)
    }
}

async fn extract_blocking(bytes: Vec<u8>, format: DocumentFormat) -> Result<Extraction, ExtractError> {
    if format == DocumentFormat::Unsupported {
        return extract(&bytes, format);
    }
    tokio::task::spawn_blocking(move || extract(&bytes, format))
        .await
        .unwrap_or_else(|e| Err(ExtractError::Crashed(e.to_string())))
}
