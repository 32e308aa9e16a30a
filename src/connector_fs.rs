//! Local-directory document library.
//!
//! Walks a configured root with `walkdir`, filters paths through include
//! and exclude globs, and reports every matching file as a [`SourceItem`]
//! keyed by its `/`-separated relative path. There is no change feed: each
//! listing is a full enumeration and the cursor is the listing time.
//!
//! Permissions come from an optional `<file>.acl.json` sidecar holding a
//! JSON array of entries (`{"principal": "group:hr", "permission": "read"}`
//! or plain `"user:alice"` strings). Files without a sidecar get the
//! library's `default_acl`. A malformed sidecar yields an empty ACL, which
//! hides the file from filtered search.
//!
//! Entries that cannot be read during a walk (dangling links, permission
//! errors, files removed mid-scan) are logged and left out of the listing.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use corpus_sync_core::error::SyncError;
use corpus_sync_core::models::{
    AclEntry, ChangeSet, ContentMetadata, FetchedContent, ItemKey, Principal, SourceItem,
    SyncCursor,
};
use corpus_sync_core::source::ContentSource;

use crate::config::LibraryConfig;
use crate::extract::mime_for_path;

const ACL_SIDECAR_SUFFIX: &str = ".acl.json";

#[derive(Clone)]
pub struct LocalLibrarySource {
    library_id: String,
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
    default_acl: Vec<AclEntry>,
    max_file_bytes: u64,
}

impl LocalLibrarySource {
    pub fn new(library_id: impl Into<String>, config: &LibraryConfig) -> Result<Self> {
        if !config.root.exists() {
            bail!("Library root does not exist: {}", config.root.display());
        }

        let mut default_excludes = vec!["**/.git/**".to_string(), "**/.DS_Store".to_string()];
        default_excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            library_id: library_id.into(),
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&default_excludes)?,
            follow_symlinks: config.follow_symlinks,
            default_acl: config
                .default_principals()?
                .into_iter()
                .map(AclEntry::read)
                .collect(),
            max_file_bytes: config.max_file_bytes,
        })
    }

    fn scan(&self) -> Result<Vec<SourceItem>, SyncError> {
        let mut items = Vec::new();

        let walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(SyncError::RemoteUnavailable(e.to_string()));
                }
                Err(e) => {
                    warn!(library = %self.library_id, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative_id(relative);

            if rel_str.ends_with(ACL_SIDECAR_SUFFIX) {
                continue;
            }
            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %rel_str, error = %e, "skipping file without metadata");
                    continue;
                }
            };
            if metadata.len() > self.max_file_bytes {
                warn!(path = %rel_str, size = metadata.len(), "skipping file over size limit");
                continue;
            }

            match self.file_to_source_item(path, rel_str, &metadata) {
                Ok(item) => items.push(item),
                Err(e) => warn!(library = %self.library_id, error = %e, "skipping unreadable file"),
            }
        }

        // Sort for deterministic ordering
        items.sort_by(|a, b| a.key.item_id.cmp(&b.key.item_id));
        Ok(items)
    }

    fn file_to_source_item(
        &self,
        path: &Path,
        relative: String,
        metadata: &std::fs::Metadata,
    ) -> Result<SourceItem, SyncError> {
        let modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        let bytes = std::fs::read(path).map_err(|e| io_error(&relative, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let folder = Path::new(&relative)
            .parent()
            .map(relative_id)
            .filter(|p| !p.is_empty());

        Ok(SourceItem {
            key: ItemKey::new(self.library_id.clone(), relative.clone()),
            mime_type: mime_for_path(&name).to_string(),
            name,
            path: folder,
            content_hash: Some(sha256_hex(&bytes)),
            last_modified: modified,
            size: metadata.len(),
            acl: self.read_acl(path, &relative),
            deleted: false,
            web_url: Some(format!("file://{}", path.display())),
        })
    }

    fn read_acl(&self, path: &Path, relative: &str) -> Vec<AclEntry> {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(ACL_SIDECAR_SUFFIX);
        let sidecar = PathBuf::from(sidecar);

        let Ok(content) = std::fs::read_to_string(&sidecar) else {
            return self.default_acl.clone();
        };
        match parse_acl_sidecar(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %relative, error = %e, "malformed ACL sidecar; item will be hidden");
                Vec::new()
            }
        }
    }

    fn resolve(&self, key: &ItemKey) -> Result<PathBuf, SyncError> {
        if key.library_id != self.library_id {
            return Err(SyncError::NotFound(key.clone()));
        }
        let relative = Path::new(&key.item_id);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(SyncError::NotFound(key.clone()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ContentSource for LocalLibrarySource {
    fn library_id(&self) -> &str {
        &self.library_id
    }

    async fn list_changes(&self, cursor: Option<&SyncCursor>) -> Result<ChangeSet, SyncError> {
        debug!(library = %self.library_id, cursor = ?cursor, "scanning library root");
        let this = self.clone();
        let items = tokio::task::spawn_blocking(move || this.scan())
            .await
            .map_err(|e| SyncError::RemoteUnavailable(format!("library scan panicked: {}", e)))??;
        Ok(ChangeSet {
            items,
            next_cursor: SyncCursor::new(Utc::now().to_rfc3339()),
            full_enumeration: true,
        })
    }

    async fn fetch(&self, key: &ItemKey) -> Result<FetchedContent, SyncError> {
        let path = self.resolve(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::NotFound(key.clone()))
            }
            Err(e) => return Err(io_error(&key.item_id, e)),
        };
        let modified = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        Ok(FetchedContent {
            bytes,
            metadata: ContentMetadata {
                title: path.file_name().map(|n| n.to_string_lossy().to_string()),
                modified_at: modified,
                path: Path::new(&key.item_id)
                    .parent()
                    .map(relative_id)
                    .filter(|p| !p.is_empty()),
                web_url: Some(format!("file://{}", path.display())),
                ..Default::default()
            },
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SidecarEntry {
    Full(AclEntry),
    Bare(Principal),
}

fn parse_acl_sidecar(content: &str) -> Result<Vec<AclEntry>, serde_json::Error> {
    let entries: Vec<SidecarEntry> = serde_json::from_str(content)?;
    Ok(entries
        .into_iter()
        .map(|e| match e {
            SidecarEntry::Full(entry) => entry,
            SidecarEntry::Bare(principal) => AclEntry::read(principal),
        })
        .collect())
}

fn relative_id(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn io_error(what: &str, e: std::io::Error) -> SyncError {
    SyncError::RemoteUnavailable(format!("{}: {}", what, e))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
