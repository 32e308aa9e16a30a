//! Deterministic, index-safe record keys.
//!
//! A record key is `<library>_<item>_<ordinal>` where each id part is
//! reduced to `[A-Za-z0-9-]`, must start with a letter, and is length
//! capped so the whole key stays far below the 1024 character limit search
//! services impose. `_` only ever separates parts. A part that had to be
//! altered carries a short digest of its raw id, so distinct items never
//! share a key. The same `(item, ordinal)` always yields the same key,
//! which makes publishing an upsert.

use sha2::{Digest, Sha256};

use crate::models::ItemKey;

const LIBRARY_PART_LEN: usize = 24;
const ITEM_PART_LEN: usize = 40;

/// Upsert key for the record at `ordinal` of `item`.
pub fn record_key(item: &ItemKey, ordinal: u32) -> String {
    format!("{}_{}", item_prefix(item), ordinal)
}

/// Shared prefix of every record key belonging to `item`.
pub fn item_prefix(item: &ItemKey) -> String {
    format!(
        "{}_{}",
        key_part(&item.library_id, LIBRARY_PART_LEN),
        key_part(&item.item_id, ITEM_PART_LEN)
    )
}

/// Sanitized `raw`, suffixed with a digest of `raw` when sanitizing
/// changed it.
fn key_part(raw: &str, max_len: usize) -> String {
    let safe = sanitize_part(raw, max_len);
    if safe == raw {
        safe
    } else {
        format!("{}-{}", safe, short_digest(raw))
    }
}

fn short_digest(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

/// Reduce an id part to an index-safe token.
pub fn sanitize_part(raw: &str, max_len: usize) -> String {
    let mut safe: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();

    if let Some(first) = safe.chars().next() {
        if !first.is_ascii_alphabetic() {
            safe.insert_str(0, "doc");
        }
    }

    safe.truncate(max_len);
    let trimmed = safe.trim_end_matches('-');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic() {
        let item = ItemKey::new("hr-site", "01ABCDEF");
        assert_eq!(record_key(&item, 3), record_key(&item, 3));
        assert_ne!(record_key(&item, 3), record_key(&item, 4));
        assert_eq!(record_key(&item, 0), "hr-site_doc01ABCDEF-".to_string() + &short_digest("01ABCDEF") + "_0");
    }

    #[test]
    fn clean_ids_pass_through() {
        let item = ItemKey::new("policies", "handbook");
        assert_eq!(record_key(&item, 7), "policies_handbook_7");
    }

    #[test]
    fn sanitize_strips_and_prefixes() {
        assert_eq!(sanitize_part("b!rd/site", 30), "brdsite");
        assert_eq!(sanitize_part("42-abc", 30), "doc42-abc");
        assert_eq!(sanitize_part("日本語", 30), "unknown");
        assert_eq!(sanitize_part("abc___", 30), "abc");
        assert_eq!(sanitize_part("a_b-c", 30), "ab-c");
        assert_eq!(sanitize_part("abcdefgh", 4), "abcd");
    }

    #[test]
    fn colliding_sanitized_ids_get_distinct_keys() {
        let a = ItemKey::new("lib", "report 2024.docx");
        let b = ItemKey::new("lib", "report-2024docx");
        let c = ItemKey::new("lib", "report2024.docx");
        assert_ne!(record_key(&a, 0), record_key(&c, 0));
        assert_ne!(record_key(&b, 0), record_key(&c, 0));
    }

    #[test]
    fn libraries_sharing_a_long_prefix_get_distinct_keys() {
        let archive = ItemKey::new("contoso-hr-policies-2024-archive", "handbook");
        let current = ItemKey::new("contoso-hr-policies-2024-current", "handbook");
        assert_ne!(record_key(&archive, 0), record_key(&current, 0));
        assert!(record_key(&archive, 0).starts_with("contoso-hr-policies-2024-"));
    }

    #[test]
    fn underscores_cannot_shift_part_boundaries() {
        let a = ItemKey::new("a_b", "c");
        let b = ItemKey::new("a", "b_c");
        assert_ne!(record_key(&a, 0), record_key(&b, 0));
    }

    #[test]
    fn keys_stay_within_limit() {
        let item = ItemKey::new("x".repeat(5000), "y".repeat(5000));
        assert!(record_key(&item, u32::MAX).len() <= 1024);
    }
}
