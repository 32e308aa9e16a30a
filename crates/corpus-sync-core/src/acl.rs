//! ACL resolution into search filter sets.
//!
//! Raw ACL entries from the content source are reduced to the principals
//! that may read the item, expanded through a [`PrincipalDirectory`], and
//! normalized to sorted, de-duplicated, lowercased `user:<id>` /
//! `group:<id>` strings. Principals the directory cannot resolve are
//! dropped. An item left with no principals gets an empty filter set and
//! is invisible to every filtered query.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::models::{AclEntry, ItemKey, Principal, PrincipalKind};

/// Lookup of principals known to the identity system.
#[async_trait]
pub trait PrincipalDirectory: Send + Sync {
    /// Principals that `principal` stands for in search filters, or `None`
    /// when it cannot be resolved.
    async fn resolve(&self, principal: &Principal) -> Option<Vec<Principal>>;
}

/// Accepts every principal with a non-empty id as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughDirectory;

#[async_trait]
impl PrincipalDirectory for PassthroughDirectory {
    async fn resolve(&self, principal: &Principal) -> Option<Vec<Principal>> {
        if principal.id.trim().is_empty() {
            None
        } else {
            Some(vec![principal.clone()])
        }
    }
}

/// Fixed table of principal expansions.
///
/// Groups must appear in the table to resolve. Users not in the table
/// resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: HashMap<String, Vec<Principal>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, principal: &Principal, members: Vec<Principal>) {
        self.entries.insert(normalize(principal), members);
    }

    pub fn with(mut self, principal: Principal, members: Vec<Principal>) -> Self {
        self.insert(&principal, members);
        self
    }
}

#[async_trait]
impl PrincipalDirectory for StaticDirectory {
    async fn resolve(&self, principal: &Principal) -> Option<Vec<Principal>> {
        if principal.id.trim().is_empty() {
            return None;
        }
        match self.entries.get(&normalize(principal)) {
            Some(members) => Some(members.clone()),
            None if principal.kind == PrincipalKind::User => Some(vec![principal.clone()]),
            None => None,
        }
    }
}

/// Filter set for one item plus the principals that could not be resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclResolution {
    pub principals: Vec<String>,
    pub dropped: Vec<String>,
}

impl AclResolution {
    /// `true` when no query can match the item.
    pub fn is_closed(&self) -> bool {
        self.principals.is_empty()
    }

    /// `true` when some readable principal did not resolve and a later
    /// directory state could widen the filter set.
    pub fn has_unresolved(&self) -> bool {
        !self.dropped.is_empty()
    }
}

/// Resolves raw ACL entries against a [`PrincipalDirectory`].
#[derive(Clone)]
pub struct AclResolver {
    directory: Arc<dyn PrincipalDirectory>,
}

impl AclResolver {
    pub fn new(directory: Arc<dyn PrincipalDirectory>) -> Self {
        Self { directory }
    }

    pub fn passthrough() -> Self {
        Self::new(Arc::new(PassthroughDirectory))
    }

    pub async fn resolve(&self, key: &ItemKey, entries: &[AclEntry]) -> AclResolution {
        let mut principals = BTreeSet::new();
        let mut dropped = BTreeSet::new();

        for entry in entries.iter().filter(|e| e.permission.allows_read()) {
            match self.directory.resolve(&entry.principal).await {
                Some(resolved) if !resolved.is_empty() => {
                    principals.extend(resolved.iter().map(normalize));
                }
                _ => {
                    dropped.insert(normalize(&entry.principal));
                }
            }
        }

        if !dropped.is_empty() {
            warn!(item = %key, dropped = ?dropped, "dropped unresolvable principals");
        }
        if principals.is_empty() {
            warn!(item = %key, "no resolvable principals; item is hidden from filtered queries");
        }

        AclResolution {
            principals: principals.into_iter().collect(),
            dropped: dropped.into_iter().collect(),
        }
    }
}

/// Canonical filter form of a principal.
pub fn normalize(principal: &Principal) -> String {
    format!("{}:{}", principal.kind.as_str(), principal.id.trim().to_lowercase())
}

/// Parse and normalize a principal string from user input.
pub fn normalize_str(raw: &str) -> Result<String, String> {
    raw.parse::<Principal>().map(|p| normalize(&p))
}
