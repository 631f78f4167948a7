//! Chunk accumulation and flush policy.

use regex::Regex;
use std::sync::LazyLock;

use super::StreamEvent;
use super::masking::SharedPiiMasker;
use crate::config::StreamConfig;

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{2,}").expect("valid regex"));

/// Flush when the buffer reaches `max_chars`, or reaches `min_chars` and
/// ends on a sentence or line boundary.
pub fn should_flush(buffer: &str, max_chars: usize, min_chars: usize) -> bool {
    let len = buffer.chars().count();
    if len >= max_chars {
        return true;
    }
    len >= min_chars && matches!(buffer.chars().last(), Some('.' | '!' | '?' | ':' | '\n'))
}

/// Split a complete text into blank-line-delimited paragraphs.
///
/// Each segment keeps its trailing separator and whitespace-only runs are
/// merged into a neighbour, so the segments concatenate back to `text`.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    let mut carry = String::new();
    let mut start = 0;

    let ends = PARAGRAPH_BREAK
        .find_iter(text)
        .map(|m| m.end())
        .chain(std::iter::once(text.len()));

    for end in ends {
        if end <= start {
            continue;
        }
        carry.push_str(&text[start..end]);
        start = end;
        if !carry.trim().is_empty() {
            segments.push(std::mem::take(&mut carry));
        }
    }

    if !carry.is_empty() {
        match segments.last_mut() {
            Some(last) => last.push_str(&carry),
            None => segments.push(carry),
        }
    }
    segments
}

/// Accumulates backend fragments into ordered, masked `chunk` events.
///
/// `full_text` keeps the unmasked concatenation of everything pushed.
pub struct StreamBuffer {
    pending: String,
    full: String,
    next_index: usize,
    max_chunk_chars: usize,
    min_flush_chars: usize,
    masker: Option<SharedPiiMasker>,
}

impl StreamBuffer {
    pub fn new(config: &StreamConfig, masker: Option<SharedPiiMasker>) -> Self {
        Self {
            pending: String::new(),
            full: String::new(),
            next_index: 0,
            max_chunk_chars: config.max_chunk_chars,
            min_flush_chars: config.min_flush_chars,
            masker,
        }
    }

    /// Append a fragment, returning a chunk when the flush policy fires
    pub fn push(&mut self, fragment: &str) -> Option<StreamEvent> {
        if fragment.is_empty() {
            return None;
        }
        self.pending.push_str(fragment);
        self.full.push_str(fragment);

        if should_flush(&self.pending, self.max_chunk_chars, self.min_flush_chars) {
            self.flush()
        } else {
            None
        }
    }

    /// Emit whatever is pending as one chunk
    pub fn flush(&mut self) -> Option<StreamEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        let text = match &self.masker {
            Some(masker) => masker.mask(&raw),
            None => raw,
        };
        let index = self.next_index;
        self.next_index += 1;
        Some(StreamEvent::Chunk { text, index })
    }

    /// Emit `segment` (plus anything pending) as one chunk, bypassing the flush policy
    pub fn emit_segment(&mut self, segment: &str) -> Option<StreamEvent> {
        self.pending.push_str(segment);
        self.full.push_str(segment);
        self.flush()
    }

    /// Unmasked concatenation of every fragment pushed
    pub fn full_text(&self) -> &str {
        &self.full
    }

    /// Number of chunks emitted so far
    pub fn chunks_emitted(&self) -> usize {
        self.next_index
    }
}
