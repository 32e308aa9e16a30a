//! `csync sync`: wire configured libraries to the SQLite index and run them.
//!
//! Builds one [`SyncOrchestrator`] per selected library over a
//! [`LocalLibrarySource`], the SQLite index and state store, the configured
//! embedder and ACL directory, then prints each [`RunReport`].

use std::sync::Arc;

use anyhow::{bail, Result};

use corpus_sync_core::acl::AclResolver;
use corpus_sync_core::cancel::CancellationFlag;
use corpus_sync_core::report::{RunOutcome, RunReport};

use crate::config::{Config, LibraryConfig};
use crate::connector_fs::LocalLibrarySource;
use crate::db;
use crate::embedding::create_embedder;
use crate::migrate;
use crate::sqlite_index::SqliteIndex;
use crate::sqlite_state::SqliteStateStore;
use crate::sync::{RunRequest, SyncOptions, SyncOrchestrator};

/// Resolve a `sync` target: `all` or a configured library name.
pub fn select_libraries<'a>(config: &'a Config, target: &str) -> Result<Vec<(&'a String, &'a LibraryConfig)>> {
    if config.libraries.is_empty() {
        bail!("No libraries configured. Add a [libraries.<name>] section to the config file.");
    }
    if target == "all" {
        return Ok(config.libraries.iter().collect());
    }
    match config.libraries.get_key_value(target) {
        Some(entry) => Ok(vec![entry]),
        None => bail!(
            "Unknown library '{}'. Configured: {}",
            target,
            config.libraries.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Run `sync` for `target`. Returns an error when any run did not commit.
pub async fn run_sync(
    config: &Config,
    target: &str,
    full: bool,
    dry_run: bool,
    cancel: CancellationFlag,
) -> Result<()> {
    let libraries = select_libraries(config, target)?;

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let index = Arc::new(SqliteIndex::new(pool.clone()));
    let state_store = Arc::new(SqliteStateStore::new(pool));

    let embedder = create_embedder(&config.embedding)?;
    let acl = match config.acl.static_directory()? {
        Some(directory) => AclResolver::new(Arc::new(directory)),
        None => AclResolver::passthrough(),
    };
    let options = SyncOptions::from_config(config);

    let mut failed = Vec::new();
    for (name, library) in libraries {
        if cancel.is_cancelled() {
            break;
        }
        let source = LocalLibrarySource::new(library.resolved_id(name), library)?;
        let orchestrator = SyncOrchestrator::new(Arc::new(source), index.clone(), state_store.clone())
            .with_embedder(embedder.clone())
            .with_acl(acl.clone())
            .with_options(options.clone())
            .with_cancellation(cancel.clone());

        let report = orchestrator.run(RunRequest { full, dry_run }).await;
        print_report(name, &report);
        if !matches!(report.outcome, RunOutcome::Committed | RunOutcome::DryRun) {
            failed.push(name.clone());
        }
    }

    if !failed.is_empty() {
        bail!("sync did not commit for: {}", failed.join(", "));
    }
    Ok(())
}

pub fn print_report(name: &str, report: &RunReport) {
    let counts = &report.counts;
    if report.outcome == RunOutcome::DryRun {
        println!("sync {} (dry-run)", name);
        println!("  to create: {}", counts.created);
        println!("  to update: {}", counts.updated);
        println!("  to delete: {}", counts.deleted);
        println!("  unchanged: {}", counts.unchanged);
        return;
    }

    println!("sync {}{}", name, if report.full_resync { " (full resync)" } else { "" });
    println!("  run: {}", report.run_id);
    println!("  created: {}", counts.created);
    println!("  updated: {}", counts.updated);
    println!("  deleted: {}", counts.deleted);
    println!("  unchanged: {}", counts.unchanged);
    println!("  skipped (unsupported): {}", counts.skipped);
    println!("  empty: {}", counts.empty);
    println!("  failed: {}", counts.failed);
    if counts.embedding_degraded > 0 {
        println!("  embedding degraded: {}", counts.embedding_degraded);
    }
    if counts.acl_closed > 0 {
        println!("  hidden (no resolvable principals): {}", counts.acl_closed);
    }
    println!("  records written: {}", counts.records_written);
    for failure in &report.failures {
        println!("  ! {} [{:?}] {}", failure.key, failure.stage, failure.reason);
    }
    match &report.cursor_after {
        Some(cursor) => println!("  cursor: {}", cursor),
        None => println!("  cursor: unchanged"),
    }
    match report.outcome {
        RunOutcome::Committed => println!("ok"),
        other => println!(
            "{:?}: {}",
            other,
            report.reason.as_deref().unwrap_or("no reason recorded")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn selects_named_or_all_libraries() {
        let config = parse_config(
            r#"
            [db]
            path = "./data/test.sqlite"

            [libraries.hr]
            root = "./hr"

            [libraries.legal]
            root = "./legal"
            "#,
        )
        .unwrap();
        assert_eq!(select_libraries(&config, "all").unwrap().len(), 2);
        assert_eq!(select_libraries(&config, "hr").unwrap()[0].0, "hr");
        assert!(select_libraries(&config, "finance").is_err());
    }
}
