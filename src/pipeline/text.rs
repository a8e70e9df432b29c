//! Word counting, sentence splitting, and provider-agnostic truncation heuristics

use serde::Serialize;

/// Words that never end a finished sentence
const DANGLING_WORDS: &[&str] = &[
    // conjunctions
    "and", "or", "but", "nor", "so", "yet", "because", "although", "while", "whereas", "that",
    "which", "if", "than",
    // prepositions
    "of", "to", "in", "on", "at", "by", "for", "with", "from", "into", "onto", "about", "between",
    "through", "over", "under", "upon", "within", "without", "toward", "towards", "against",
    "among", "via",
    // articles
    "a", "an", "the",
];

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Why a piece of text looks cut off
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationSignal {
    Empty,
    TrailingEllipsis,
    TrailingDash,
    TrailingComma,
    DanglingWord(String),
    UnclosedBracket,
    UnclosedQuote,
    MissingTerminalPunctuation,
}

impl std::fmt::Display for TruncationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TruncationSignal::Empty => write!(f, "empty output"),
            TruncationSignal::TrailingEllipsis => write!(f, "ends with an ellipsis"),
            TruncationSignal::TrailingDash => write!(f, "ends with a dash"),
            TruncationSignal::TrailingComma => write!(f, "ends with a comma"),
            TruncationSignal::DanglingWord(w) => write!(f, "ends with the word '{}'", w),
            TruncationSignal::UnclosedBracket => write!(f, "ends inside an open bracket"),
            TruncationSignal::UnclosedQuote => write!(f, "ends inside an open quotation"),
            TruncationSignal::MissingTerminalPunctuation => {
                write!(f, "lacks terminal punctuation")
            }
        }
    }
}

/// Inspect the end of `text` for signs the generator stopped mid-thought
pub fn detect_truncation(text: &str) -> Option<TruncationSignal> {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return Some(TruncationSignal::Empty);
    }

    if trimmed.ends_with("...") || trimmed.ends_with('…') {
        return Some(TruncationSignal::TrailingEllipsis);
    }
    if trimmed.ends_with('-') || trimmed.ends_with('—') || trimmed.ends_with('–') {
        return Some(TruncationSignal::TrailingDash);
    }
    if trimmed.ends_with(',') {
        return Some(TruncationSignal::TrailingComma);
    }

    if let Some(last) = trimmed.chars().last() {
        if last.is_alphanumeric() {
            let word = trimmed
                .rsplit(|c: char| c.is_whitespace())
                .next()
                .unwrap_or("")
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if DANGLING_WORDS.contains(&word.as_str()) {
                return Some(TruncationSignal::DanglingWord(word));
            }
        }
    }

    let last_paragraph = trimmed.rsplit("\n\n").next().unwrap_or(trimmed);
    if unbalanced(last_paragraph, '(', ')') || unbalanced(last_paragraph, '[', ']') {
        return Some(TruncationSignal::UnclosedBracket);
    }
    let straight_quotes = last_paragraph.matches('"').count();
    let curly_open = last_paragraph.matches('“').count();
    let curly_close = last_paragraph.matches('”').count();
    if straight_quotes % 2 == 1 || curly_open > curly_close {
        return Some(TruncationSignal::UnclosedQuote);
    }

    if !has_terminal_punctuation(trimmed) && count_sentences(trimmed) < 2 {
        return Some(TruncationSignal::MissingTerminalPunctuation);
    }

    None
}

fn unbalanced(text: &str, open: char, close: char) -> bool {
    text.matches(open).count() > text.matches(close).count()
}

fn has_terminal_punctuation(text: &str) -> bool {
    let core = text.trim_end_matches(|c: char| {
        matches!(c, '"' | '\'' | ')' | ']' | '*' | '_' | '”' | '’')
    });
    core.ends_with(&['.', '!', '?'][..])
}

/// Number of complete sentences: terminal punctuation followed by whitespace or the end
pub fn count_sentences(text: &str) -> usize {
    split_sentences(text)
        .iter()
        .filter(|s| has_terminal_punctuation(s))
        .count()
}

/// Split on terminal punctuation (plus trailing closers) followed by whitespace.
///
/// Each sentence keeps its punctuation; whitespace between sentences is dropped.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if matches!(next, '.' | '!' | '?' | '"' | '\'' | ')' | ']' | '”' | '’') {
                end = j + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        match chars.peek() {
            Some(&(_, next)) if next.is_whitespace() => {
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end;
            }
            None => {
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end;
            }
            _ => {}
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

/// Blank-line separated paragraphs, trimmed, empty ones dropped
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut paragraphs = Vec::new();
    let mut start: Option<usize> = None;
    let mut last_end = 0;

    for (offset, line) in line_spans(text) {
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                paragraphs.push(text[s..last_end].trim());
            }
        } else {
            if start.is_none() {
                start = Some(offset);
            }
            last_end = offset + line.len();
        }
    }
    if let Some(s) = start {
        paragraphs.push(text[s..last_end].trim());
    }
    paragraphs.retain(|p| !p.is_empty());
    paragraphs
}

fn line_spans(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split('\n').map(move |line| {
        let start = offset;
        offset += line.len() + 1;
        (start, line)
    })
}

/// First `max_chars` characters on a char boundary, with a marker when cut
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str(" [...]");
    }
    out
}
