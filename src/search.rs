//! `csync search`: principal-filtered keyword search over the SQLite index.

use anyhow::{Context, Result};

use corpus_sync_core::acl::normalize_str;
use corpus_sync_core::index::{SearchHit, SearchIndex};

use crate::config::Config;
use crate::db;
use crate::sqlite_index::SqliteIndex;

pub const DEFAULT_LIMIT: usize = 10;

/// Normalize `--principal` values to the filter form stored on records.
pub fn normalize_principals(raw: &[String]) -> Result<Vec<String>> {
    raw.iter()
        .map(|p| normalize_str(p).map_err(|e| anyhow::anyhow!(e)))
        .collect::<Result<Vec<_>>>()
        .context("invalid --principal")
}

pub async fn run_search(config: &Config, query: &str, principals: &[String], limit: Option<usize>) -> Result<()> {
    let principals = normalize_principals(principals)?;
    let pool = db::connect(config).await?;
    let index = SqliteIndex::new(pool);

    let hits = index
        .search(query, &principals, limit.unwrap_or(DEFAULT_LIMIT))
        .await?;
    print_hits(&hits);
    Ok(())
}

fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}",
            i + 1,
            hit.score,
            hit.title.as_deref().unwrap_or(&hit.item_id)
        );
        println!("    library: {}  item: {}  chunk: {}", hit.library_id, hit.item_id, hit.ordinal);
        if let Some(url) = &hit.web_url {
            println!("    url: {}", url);
        }
        println!("    > {}", hit.snippet.replace('\n', " "));
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principals_are_normalized() {
        let raw = vec!["group:HR".to_string(), "user:Alice".to_string()];
        assert_eq!(
            normalize_principals(&raw).unwrap(),
            vec!["group:hr".to_string(), "user:alice".to_string()]
        );
        assert!(normalize_principals(&["alice".to_string()]).is_err());
    }
}
