//! Boundary-aware text chunker with overlap.
//!
//! Splits normalized document text into [`Chunk`]s of at most
//! `max_chunk_size` characters, where consecutive chunks share roughly
//! `overlap` characters of context.
//!
//! # Algorithm
//!
//! 1. Skip leading whitespace and take up to `max_chunk_size` characters.
//! 2. If the text continues past that bound, search the trailing
//!    `boundary_window` characters for the latest natural break, trying in
//!    order: a paragraph break (blank line), a sentence end, a line break,
//!    a space. Without any, cut hard at the bound.
//! 3. Emit the span (trailing whitespace trimmed) with its character
//!    offsets and a SHA-256 of its text.
//! 4. Start the next span `overlap` characters before the previous break,
//!    nudged forward to the next word start, always past the previous start.
//!
//! All sizes are counted in Unicode scalar values, so multi-byte text is
//! never split inside a character. The output depends only on the text and
//! the options: identical input yields identical spans and ordinals.
//!
//! # Example
//!
//! ```rust
//! use corpus_sync_core::chunk::{chunk_text, ChunkingOptions};
//! use corpus_sync_core::models::ItemKey;
//!
//! let key = ItemKey::new("lib", "doc");
//! let chunks = chunk_text(&key, "Hello world.\n\nSecond paragraph.", &ChunkingOptions::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].ordinal, 0);
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Chunk, ItemKey};

/// Default maximum chunk length, in characters.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1000;
/// Default overlap between consecutive chunks, in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;
/// Default width of the trailing window searched for a natural break.
pub const DEFAULT_BOUNDARY_WINDOW: usize = 200;

const SENTENCE_TERMINATORS: [char; 3] = ['.', '!', '?'];
const CJK_TERMINATORS: [char; 3] = ['。', '！', '？'];

/// Chunk size options. All values are character counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingOptions {
    pub max_chunk_size: usize,
    pub overlap: usize,
    pub boundary_window: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
            boundary_window: DEFAULT_BOUNDARY_WINDOW,
        }
    }
}

impl ChunkingOptions {
    /// Check the invariants the chunker relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_chunk_size == 0 {
            return Err("max_chunk_size must be > 0".to_string());
        }
        if self.overlap >= self.max_chunk_size {
            return Err(format!(
                "chunk_overlap ({}) must be smaller than max_chunk_size ({})",
                self.overlap, self.max_chunk_size
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BreakKind {
    Paragraph,
    Sentence,
    Line,
    Space,
}

/// Split `text` into overlapping chunks for `key`.
///
/// Returns an empty vector for empty or whitespace-only text. Ordinals
/// are contiguous from 0.
pub fn chunk_text(key: &ItemKey, text: &str, options: &ChunkingOptions) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let byte_offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let n = chars.len();
    let max = options.max_chunk_size.max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        while start < n && chars[start].is_whitespace() {
            start += 1;
        }
        if start >= n {
            break;
        }

        let hard_end = (start + max).min(n);
        let end = if hard_end == n {
            n
        } else {
            find_break(&chars, start, hard_end, options.boundary_window)
        };

        let mut span_end = end;
        while span_end > start && chars[span_end - 1].is_whitespace() {
            span_end -= 1;
        }
        if span_end > start {
            let span = &text[byte_offsets[start]..byte_offsets[span_end]];
            chunks.push(make_chunk(key, chunks.len() as u32, span, start, span_end));
        }

        if end >= n {
            break;
        }
        start = next_start(&chars, start, end, options.overlap);
    }

    chunks
}

/// Latest natural break in `(start, hard_end]`, searching only the trailing window.
fn find_break(chars: &[char], start: usize, hard_end: usize, window: usize) -> usize {
    let lo = hard_end.saturating_sub(window).max(start + 1);
    for kind in [
        BreakKind::Paragraph,
        BreakKind::Sentence,
        BreakKind::Line,
        BreakKind::Space,
    ] {
        if let Some(pos) = (lo..=hard_end).rev().find(|&i| is_break(chars, i, kind)) {
            return pos;
        }
    }
    hard_end
}

/// Whether a chunk may end right before index `i`.
fn is_break(chars: &[char], i: usize, kind: BreakKind) -> bool {
    if i == 0 || i > chars.len() {
        return false;
    }
    let prev = chars[i - 1];
    let next = chars.get(i).copied();
    match kind {
        BreakKind::Paragraph => i >= 2 && prev == '\n' && chars[i - 2] == '\n',
        BreakKind::Sentence => {
            CJK_TERMINATORS.contains(&prev)
                || (SENTENCE_TERMINATORS.contains(&prev)
                    && next.map(char::is_whitespace).unwrap_or(true))
        }
        BreakKind::Line => prev == '\n',
        BreakKind::Space => prev.is_whitespace(),
    }
}

/// Start of the chunk following a break at `end`.
fn next_start(chars: &[char], start: usize, end: usize, overlap: usize) -> usize {
    let mut next = end.saturating_sub(overlap).max(start + 1);
    if next < end && !chars[next - 1].is_whitespace() {
        // Mid-word: move to the next word start inside the overlap, if any.
        if let Some(ws) = (next..end).find(|&i| chars[i].is_whitespace()) {
            next = ws + 1;
        }
    }
    next
}

/// Build a [`Chunk`] with its SHA-256 content hash.
fn make_chunk(key: &ItemKey, ordinal: u32, text: &str, start_char: usize, end_char: usize) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        key: key.clone(),
        ordinal,
        text: text.to_string(),
        start_char,
        end_char,
        hash,
        vector: None,
        filter_principals: Vec::new(),
    }
}
