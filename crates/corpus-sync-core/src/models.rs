//! Core data models shared by every stage of the sync pipeline.
//!
//! These types describe remote items as listed by a content source, the
//! documents and chunks derived from them during a run, and the records
//! published to the search index.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a remote item: `(library_id, item_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub library_id: String,
    pub item_id: String,
}

impl ItemKey {
    pub fn new(library_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            library_id: library_id.into(),
            item_id: item_id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.library_id, self.item_id)
    }
}

/// Whether a principal is an individual user or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Group,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Group => "group",
        }
    }
}

/// A user or group as exposed by the content source.
///
/// Written as `user:<id>` or `group:<id>` in configuration files and ACL
/// sidecars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Principal {
    pub kind: PrincipalKind,
    pub id: String,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::User,
            id: id.into(),
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::Group,
            id: id.into(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for Principal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("principal '{}' must look like user:<id> or group:<id>", s))?;
        let kind = match kind.trim().to_ascii_lowercase().as_str() {
            "user" => PrincipalKind::User,
            "group" => PrincipalKind::Group,
            other => return Err(format!("unknown principal kind '{}' in '{}'", other, s)),
        };
        Ok(Self {
            kind,
            id: id.to_string(),
        })
    }
}

impl TryFrom<String> for Principal {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Principal> for String {
    fn from(p: Principal) -> Self {
        p.to_string()
    }
}

/// Permission level granted by an ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Listed on the item but without read access (e.g. "limited access").
    None,
    Read,
    Write,
    Owner,
}

impl Permission {
    pub fn allows_read(&self) -> bool {
        !matches!(self, Permission::None)
    }
}

/// One raw access-control entry on a source item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AclEntry {
    pub principal: Principal,
    #[serde(default = "default_permission")]
    pub permission: Permission,
}

fn default_permission() -> Permission {
    Permission::Read
}

impl AclEntry {
    pub fn read(principal: Principal) -> Self {
        Self {
            principal,
            permission: Permission::Read,
        }
    }
}

/// An item as listed by a content source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub key: ItemKey,
    /// File name as shown in the library.
    pub name: String,
    /// Folder path inside the library, if the source exposes one.
    #[serde(default)]
    pub path: Option<String>,
    /// Content hash reported by the source (preferred change signal).
    #[serde(default)]
    pub content_hash: Option<String>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub size: u64,
    pub mime_type: String,
    #[serde(default)]
    pub acl: Vec<AclEntry>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub web_url: Option<String>,
}

impl SourceItem {
    /// A deletion marker for `key`, as emitted by change feeds.
    pub fn tombstone(key: ItemKey) -> Self {
        Self {
            name: key.item_id.clone(),
            key,
            path: None,
            content_hash: None,
            last_modified: DateTime::<Utc>::default(),
            size: 0,
            mime_type: String::new(),
            acl: Vec::new(),
            deleted: true,
            web_url: None,
        }
    }
}

/// Opaque change-feed position for one library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(pub String);

impl SyncCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of one `list_changes` call.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub items: Vec<SourceItem>,
    pub next_cursor: SyncCursor,
    /// `true` when `items` lists every live item, so absence means deletion.
    pub full_enumeration: bool,
}

/// Metadata returned alongside fetched bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub path: Option<String>,
    /// Overrides the listed MIME type when the source knows better.
    pub mime_type: Option<String>,
    pub web_url: Option<String>,
}

/// Raw bytes plus metadata for one item.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub bytes: Vec<u8>,
    pub metadata: ContentMetadata,
}

/// Structural metadata attached to an extracted document and its records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub path: Option<String>,
    pub mime_type: String,
    pub web_url: Option<String>,
}

/// Normalized text extracted from one item. Lives only within a run.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub key: ItemKey,
    pub text: String,
    pub metadata: DocumentMetadata,
}

/// A bounded span of a document's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub key: ItemKey,
    /// Zero-based, contiguous within one document version.
    pub ordinal: u32,
    pub text: String,
    /// Offset of the span in the normalized text, in characters.
    pub start_char: usize,
    /// Exclusive end offset, in characters.
    pub end_char: usize,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
    pub vector: Option<Vec<f32>>,
    pub filter_principals: Vec<String>,
}

/// The published form of a [`Chunk`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Deterministic upsert key, see [`crate::key::record_key`].
    pub key: String,
    pub library_id: String,
    pub item_id: String,
    pub ordinal: u32,
    pub text: String,
    pub content_hash: String,
    pub start_char: usize,
    pub end_char: usize,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    pub filter_principals: Vec<String>,
    pub metadata: DocumentMetadata,
}

impl IndexRecord {
    pub fn from_chunk(chunk: Chunk, metadata: &DocumentMetadata) -> Self {
        Self {
            key: crate::key::record_key(&chunk.key, chunk.ordinal),
            library_id: chunk.key.library_id,
            item_id: chunk.key.item_id,
            ordinal: chunk.ordinal,
            text: chunk.text,
            content_hash: chunk.hash,
            start_char: chunk.start_char,
            end_char: chunk.end_char,
            vector: chunk.vector,
            filter_principals: chunk.filter_principals,
            metadata: metadata.clone(),
        }
    }

    pub fn item_key(&self) -> ItemKey {
        ItemKey::new(self.library_id.clone(), self.item_id.clone())
    }
}
