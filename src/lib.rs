//! # corpus-sync
//!
//! Incremental sync of document libraries into a permission-aware search
//! index.
//!
//! Each run lists what changed in a library since the last committed
//! cursor, extracts text from new and updated documents (PDF, Word, Excel,
//! PowerPoint, plain text), splits it into overlapping chunks, optionally
//! embeds them, attaches the readers' principals as a filter set and
//! publishes the records in atomic batches. The cursor only advances when a
//! run commits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────────────┐   ┌──────────────┐
//! │  Library    │──▶│ Fetch → Extract → Chunk →    │──▶│ SQLite index │
//! │  (source)   │   │ Embed → ACL  (per item)      │   │ FTS5 + ACL   │
//! └─────────────┘   └──────────────────────────────┘   └──────┬───────┘
//!        ▲                                                    │
//!        │            ┌──────────────┐                        ▼
//!        └────────────│ Orchestrator │──── cursor + state ──▶ sync_state
//!                     └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! csync init                         # create database
//! csync sync all                     # sync every configured library
//! csync sync policies --full         # ignore stored state, re-enumerate
//! csync search "parental leave" --principal group:hr
//! csync status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | tracing subscriber setup |
//! | [`retry`] | Backoff, jitter and per-call timeouts |
//! | [`connector_fs`] | Local directory as a document library |
//! | [`extract`] | Text extraction per document format |
//! | [`embedding`] | OpenAI and Ollama embedders |
//! | [`pipeline`] | Per-item fetch/extract/chunk/embed/ACL |
//! | [`publish`] | Batched index writes |
//! | [`sync`] | Run state machine |
//! | [`sqlite_index`] | SQLite search index |
//! | [`sqlite_state`] | SQLite sync-state store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//!
//! Models, change detection, chunking and the collaborator traits live in
//! the `corpus-sync-core` crate, re-exported as [`core`].

pub use corpus_sync_core as core;

pub mod config;
pub mod connector_fs;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod publish;
pub mod retry;
pub mod search;
pub mod sqlite_index;
pub mod sqlite_state;
pub mod stats;
pub mod sync;
