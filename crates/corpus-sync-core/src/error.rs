//! Error taxonomy for the sync pipeline.
//!
//! Every remote collaborator (content source, embedding service, search
//! index, state store) reports failures as a [`SyncError`]. The variant
//! decides how the orchestrator reacts:
//!
//! | Variant | Reaction |
//! |---------|----------|
//! | [`RemoteUnavailable`](SyncError::RemoteUnavailable) | retry with backoff |
//! | [`NotFound`](SyncError::NotFound) | treat the item as deleted |
//! | [`UnsupportedFormat`](SyncError::UnsupportedFormat) | skip the item, count it |
//! | [`Extraction`](SyncError::Extraction) | fail the item |
//! | [`EmbeddingService`](SyncError::EmbeddingService) | retry, then degrade to lexical-only |
//! | [`RateLimited`](SyncError::RateLimited) | retry after the suggested delay |
//! | [`IndexPublish`](SyncError::IndexPublish) | retry the batch, then fail its items |
//! | [`Timeout`](SyncError::Timeout) | retry |
//! | [`StateCorruption`](SyncError::StateCorruption) | fall back to a full resync |
//! | [`StateStore`](SyncError::StateStore) | fail the run, cursor untouched |
//! | [`Rejected`](SyncError::Rejected) | fail the item without retrying |
//! | [`Cancelled`](SyncError::Cancelled) | stop, cursor untouched |

use std::time::Duration;

use thiserror::Error;

use crate::models::ItemKey;

/// Errors produced by sync collaborators and pipeline stages.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Network or authentication failure talking to the content source.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// The item vanished between listing and fetch.
    #[error("item not found: {0}")]
    NotFound(ItemKey),

    /// No extractor handles the declared format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A supported format failed to parse.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The embedding service returned an error.
    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    /// A remote service throttled the request.
    #[error("rate limited{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// The search index rejected or failed a write.
    #[error("index publish failed: {0}")]
    IndexPublish(String),

    /// A single remote call exceeded its time budget.
    #[error("{operation} timed out after {}ms", .elapsed.as_millis())]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// The persisted cursor/state blob is unreadable or inconsistent.
    #[error("sync state corrupted: {0}")]
    StateCorruption(String),

    /// The state store itself failed (I/O, database).
    #[error("state store error: {0}")]
    StateStore(String),

    /// A client error that retrying cannot fix (e.g. HTTP 400).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The run was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether a retry of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnavailable(_)
                | SyncError::EmbeddingService(_)
                | SyncError::RateLimited { .. }
                | SyncError::IndexPublish(_)
                | SyncError::Timeout { .. }
        )
    }

    /// Server-suggested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}ms)", d.as_millis()))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, SyncError>;
