//! # corpus-sync CLI (`csync`)
//!
//! ## Usage
//!
//! ```bash
//! csync --config ./config/csync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csync init` | Create the SQLite database and run schema migrations |
//! | `csync sync <library>\|all` | Run one incremental sync |
//! | `csync status` | Show per-library cursor, state and record counts |
//! | `csync search "<query>" --principal <p>` | ACL-filtered keyword search |

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::warn;

use corpus_sync::core::cancel::CancellationFlag;
use corpus_sync::{config, db, ingest, logging, migrate, search, stats};

/// corpus-sync: incremental, permission-aware sync of document libraries
/// into a searchable index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/csync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "csync",
    about = "Incremental, permission-aware sync of document libraries into a search index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/csync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the index and state tables.
    /// Safe to run repeatedly.
    Init,

    /// Sync one library, or `all`.
    ///
    /// Lists changes since the last committed cursor, processes new and
    /// updated documents, deletes removed ones and commits the new cursor
    /// when the failure rate stays within tolerance. Ctrl-C cancels the run
    /// without advancing the cursor.
    Sync {
        /// Library name from `[libraries.<name>]`, or `all`.
        library: String,

        /// Ignore the stored cursor and state and re-enumerate everything.
        #[arg(long)]
        full: bool,

        /// Show the delta without fetching or writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show sync state and record counts per library.
    Status,

    /// Search indexed records visible to the given principals.
    Search {
        /// The search query string.
        query: String,

        /// Principal to search as (`user:<id>` or `group:<id>`). Repeatable.
        #[arg(long = "principal", required = true)]
        principals: Vec<String>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            library,
            full,
            dry_run,
        } => {
            let cancel = CancellationFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight items");
                    on_signal.cancel();
                }
            });
            ingest::run_sync(&cfg, &library, full, dry_run, cancel).await?;
        }
        Commands::Status => {
            stats::run_status(&cfg).await?;
        }
        Commands::Search {
            query,
            principals,
            limit,
        } => {
            search::run_search(&cfg, &query, &principals, limit).await?;
        }
    }

    Ok(())
}
