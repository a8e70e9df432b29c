//! Cascading chunker: paragraph groups, then sentence groups, then fixed word slices

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::text::{count_words, split_paragraphs, split_sentences};

pub const DEFAULT_TARGET_WORDS: usize = 800;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
    pub word_count: usize,
}

impl TextChunk {
    fn new(text: String) -> Self {
        let word_count = count_words(&text);
        Self { text, word_count }
    }
}

/// Split `text` into ordered chunks of at most `target_words`.
///
/// Paragraphs are grouped first; a paragraph over the target is grouped by sentence,
/// and a sentence over the target is cut into fixed word slices.
pub fn smart_chunk(text: &str, target_words: usize) -> Vec<TextChunk> {
    let target = target_words.max(1);
    let total = count_words(text);

    if total <= target {
        return vec![TextChunk::new(text.to_string())];
    }

    let chunks = group_units(&split_paragraphs(text), target, "\n\n", sentence_chunks);
    debug!("Split {} words into {} chunks", total, chunks.len());
    chunks
}

fn sentence_chunks(text: &str, target: usize) -> Vec<TextChunk> {
    group_units(&split_sentences(text), target, " ", slice_words)
}

/// Accumulate units until the next one would push the group past the target.
/// A unit that alone exceeds the target closes the open group and goes to `split`.
fn group_units(
    units: &[&str],
    target: usize,
    joiner: &str,
    split: fn(&str, usize) -> Vec<TextChunk>,
) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_words = 0;

    for unit in units {
        let words = count_words(unit);
        if !current.is_empty() && current_words + words > target {
            chunks.push(TextChunk::new(current.join(joiner)));
            current.clear();
            current_words = 0;
        }
        if words > target {
            chunks.extend(split(unit, target));
            continue;
        }
        current.push(unit);
        current_words += words;
    }

    if !current.is_empty() {
        chunks.push(TextChunk::new(current.join(joiner)));
    }
    chunks
}

/// `ceil(total / target)` near-equal slices of whitespace-separated words
fn slice_words(text: &str, target: usize) -> Vec<TextChunk> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let count = words.len().div_ceil(target).max(1);
    let size = words.len().div_ceil(count).max(1);

    words
        .chunks(size)
        .map(|slice| TextChunk::new(slice.join(" ")))
        .collect()
}
