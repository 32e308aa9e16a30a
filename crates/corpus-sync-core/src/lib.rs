//! # corpus-sync core
//!
//! Runtime-agnostic logic for incremental document-library sync: data
//! models, error taxonomy, change detection, chunking, ACL resolution,
//! record keys, and the collaborator traits (content source, embedder,
//! search index, state store) with in-memory implementations.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! The `corpus-sync` app crate provides the extractor, the HTTP embedders,
//! the SQLite backends, and the orchestrator.

pub mod acl;
pub mod cancel;
pub mod chunk;
pub mod delta;
pub mod embedding;
pub mod error;
pub mod index;
pub mod key;
pub mod models;
pub mod report;
pub mod source;
pub mod state;

pub use error::{Result, SyncError};
