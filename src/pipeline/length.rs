//! Length planning: natural-language length directives to a target band and mode

use std::ops::Range;

use regex::{Captures, Regex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::chunker::DEFAULT_TARGET_WORDS;

/// Number with optional thousands separators, decimals, and `k` shorthand (two groups)
const NUM: &str = r"(\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)\s*(k\b)?";

/// Unit that must follow a number for it to count as a word target
const WORD_UNIT: &str = r"(?:\s+(?:total|more|fewer|additional))?\s*-?\s*words?\b";

const APPROX_TOLERANCE: f64 = 0.10;
const OPEN_ENDED_HEADROOM: f64 = 1.2;
const CAPPED_FLOOR: f64 = 0.8;
const KEYWORD_EXPANSION_RATIO: f64 = 1.5;
const KEYWORD_COMPRESSION_RATIO: f64 = 0.6;

/// Inclusive word-count band requested by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TargetLength {
    pub min: usize,
    pub max: usize,
}

impl TargetLength {
    pub fn approximately(words: usize) -> Self {
        Self {
            min: scale(words, 1.0 - APPROX_TOLERANCE),
            max: scale(words, 1.0 + APPROX_TOLERANCE),
        }
    }

    pub fn at_least(words: usize) -> Self {
        Self {
            min: words,
            max: scale(words, OPEN_ENDED_HEADROOM),
        }
    }

    pub fn at_most(words: usize) -> Self {
        Self {
            min: scale(words, CAPPED_FLOOR),
            max: words,
        }
    }

    pub fn range(a: usize, b: usize) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn mid(&self) -> usize {
        (self.min + self.max) / 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LengthMode {
    HeavyCompression,
    ModerateCompression,
    Maintain,
    ModerateExpansion,
    HeavyExpansion,
}

impl LengthMode {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < 0.5 {
            LengthMode::HeavyCompression
        } else if ratio < 0.8 {
            LengthMode::ModerateCompression
        } else if ratio < 1.2 {
            LengthMode::Maintain
        } else if ratio < 1.8 {
            LengthMode::ModerateExpansion
        } else {
            LengthMode::HeavyExpansion
        }
    }
}

impl std::fmt::Display for LengthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LengthMode::HeavyCompression => write!(f, "heavy_compression"),
            LengthMode::ModerateCompression => write!(f, "moderate_compression"),
            LengthMode::Maintain => write!(f, "maintain"),
            LengthMode::ModerateExpansion => write!(f, "moderate_expansion"),
            LengthMode::HeavyExpansion => write!(f, "heavy_expansion"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LengthConfig {
    pub target_min: usize,
    pub target_max: usize,
    pub target_mid: usize,
    /// Target midpoint over source words; always > 0
    pub ratio: f64,
    pub mode: LengthMode,
    /// True when the band came from an explicit number in the instructions
    pub explicit: bool,
    pub estimated_chunk_count: usize,
    pub chunk_target_words: usize,
}

impl LengthConfig {
    /// Per-chunk share of the target midpoint for the actual chunk count
    pub fn per_chunk_target(&self, chunk_count: usize) -> usize {
        (self.target_mid as f64 / chunk_count.max(1) as f64).round() as usize
    }
}

/// Which sides of a length directive bind the final output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    NoLessThan,
    NoMoreThan,
    Between,
    Approximately,
    Exactly,
}

/// An explicit word-count request: the band and the clause kind that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthDirective {
    pub band: TargetLength,
    pub kind: ConstraintKind,
}

impl LengthDirective {
    fn new(band: TargetLength, kind: ConstraintKind) -> Self {
        Self { band, kind }
    }
}

pub fn parse_target_length(instructions: &str) -> Option<TargetLength> {
    parse_length_directive(instructions).map(|d| d.band)
}

/// Parse an explicit length directive into a word band.
///
/// Every number must be followed by a word unit; "about 3 examples" is not a length.
/// Patterns are tried in priority order: range, exactly, shorten-to, expand-to,
/// floor and ceiling (combined when both appear), approximately, bare `N words`.
pub fn parse_length_directive(instructions: &str) -> Option<LengthDirective> {
    let text = instructions.trim();
    if text.is_empty() {
        return None;
    }

    let range = Regex::new(&format!(
        r"(?i)(between\s+|from\s+)?{NUM}\s*(?:-|–|—|to|and)\s*{NUM}{WORD_UNIT}"
    ))
    .ok()?;
    if let Some(caps) = range.captures(text) {
        let is_from = caps
            .get(1)
            .map(|m| m.as_str().trim().eq_ignore_ascii_case("from"))
            .unwrap_or(false);
        if !is_from {
            if let (Some(a), Some(b)) = (number_at(&caps, 2), number_at(&caps, 4)) {
                return Some(LengthDirective::new(
                    TargetLength::range(a, b),
                    ConstraintKind::Between,
                ));
            }
        }
    }

    if let Some(words) = first_number(text, &format!(r"(?i)\bexactly\s+{NUM}{WORD_UNIT}")) {
        return Some(LengthDirective::new(
            TargetLength::approximately(words),
            ConstraintKind::Exactly,
        ));
    }

    for verb in [
        r"\b(?:shorten|compress|condense|reduce|cut|trim|summari[sz]e)\w*",
        r"\b(?:expand|enrich|extend|lengthen|elaborate|grow|increase)\w*",
    ] {
        let pattern = format!(
            r"(?i){verb}(?:\s+[a-z']+){{0,4}}?\s+to\s+(?:about\s+|approximately\s+|around\s+|roughly\s+|~\s*)?{NUM}{WORD_UNIT}"
        );
        if let Some(words) = first_number(text, &pattern) {
            return Some(LengthDirective::new(
                TargetLength::approximately(words),
                ConstraintKind::Approximately,
            ));
        }
    }

    let floor = find_number(
        text,
        &format!(
            r"(?i)\b(?:at\s+least|no\s+less\s+than|no\s+fewer\s+than|(?:a\s+)?minimum\s+of)\s+{NUM}{WORD_UNIT}"
        ),
    )
    .or_else(|| find_number(text, &format!(r"(?i){NUM}\s*\+\s*words?\b")));
    // "no less than" contains "less than"; search for the ceiling outside the floor clause
    let rest = match &floor {
        Some((_, span)) => format!("{} {}", &text[..span.start], &text[span.end..]),
        None => text.to_string(),
    };
    let ceiling = first_number(
        &rest,
        &format!(
            r"(?i)\b(?:no\s+more\s+than|at\s+most|(?:a\s+)?maximum\s+of|up\s+to|under|not\s+exceed(?:ing)?|fewer\s+than|less\s+than)\s+{NUM}{WORD_UNIT}"
        ),
    );
    let bounded = match (floor.map(|(words, _)| words), ceiling) {
        (Some(low), Some(high)) => Some((TargetLength::range(low, high), ConstraintKind::Between)),
        (Some(low), None) => Some((TargetLength::at_least(low), ConstraintKind::NoLessThan)),
        (None, Some(high)) => Some((TargetLength::at_most(high), ConstraintKind::NoMoreThan)),
        (None, None) => None,
    };
    if let Some((band, kind)) = bounded {
        return Some(LengthDirective::new(band, kind));
    }

    let approx = first_number(
        text,
        &format!(r"(?i)(?:\b(?:approximately|about|around|roughly|circa)\s+|~\s*){NUM}{WORD_UNIT}"),
    )
    .or_else(|| first_number(text, &format!(r"(?i){NUM}{WORD_UNIT}")));

    approx.map(|words| {
        LengthDirective::new(
            TargetLength::approximately(words),
            ConstraintKind::Approximately,
        )
    })
}

/// Build the length plan for a document of `total_words`.
///
/// Without an explicit target the ratio is 1.0, unless the instructions carry a bare
/// expand or compress keyword.
pub fn calculate_length_config(
    total_words: usize,
    target: Option<TargetLength>,
    instructions: Option<&str>,
) -> LengthConfig {
    let estimated_chunk_count = total_words.div_ceil(DEFAULT_TARGET_WORDS).max(1);

    let (target_min, target_max, target_mid, explicit) = match target {
        Some(t) => (t.min, t.max, t.mid(), true),
        None => {
            let ratio = instructions.map(keyword_ratio).unwrap_or(1.0);
            let mid = scale(total_words, ratio);
            let band = TargetLength::approximately(mid);
            (band.min, band.max, mid, false)
        }
    };

    let ratio = if total_words == 0 || target_mid == 0 {
        1.0
    } else {
        target_mid as f64 / total_words as f64
    };

    let config = LengthConfig {
        target_min,
        target_max,
        target_mid,
        ratio,
        mode: LengthMode::from_ratio(ratio),
        explicit,
        estimated_chunk_count,
        chunk_target_words: 0,
    };
    LengthConfig {
        chunk_target_words: config.per_chunk_target(estimated_chunk_count),
        ..config
    }
}

fn keyword_ratio(instructions: &str) -> f64 {
    let expand = Regex::new(r"(?i)\b(?:expand|enrich|elaborate|lengthen)\w*").ok();
    let compress = Regex::new(r"(?i)\b(?:compress|shorten|condense|trim)\w*").ok();

    if expand.map(|re| re.is_match(instructions)).unwrap_or(false) {
        KEYWORD_EXPANSION_RATIO
    } else if compress.map(|re| re.is_match(instructions)).unwrap_or(false) {
        KEYWORD_COMPRESSION_RATIO
    } else {
        1.0
    }
}

fn first_number(text: &str, pattern: &str) -> Option<usize> {
    find_number(text, pattern).map(|(words, _)| words)
}

/// First number captured by `pattern`, with the byte span of the whole match
fn find_number(text: &str, pattern: &str) -> Option<(usize, Range<usize>)> {
    let re = Regex::new(pattern).ok()?;
    let caps = re.captures(text)?;
    let span = caps.get(0)?.range();
    Some((number_at(&caps, 1)?, span))
}

/// Read the number captured by the `NUM` pair starting at group `idx`
fn number_at(caps: &Captures<'_>, idx: usize) -> Option<usize> {
    let digits = caps.get(idx)?.as_str();
    let thousands = caps.get(idx + 1).is_some();
    parse_number(digits, thousands)
}

fn parse_number(digits: &str, thousands: bool) -> Option<usize> {
    let value: f64 = digits.replace(',', "").parse().ok()?;
    let value = if thousands { value * 1000.0 } else { value };
    if value <= 0.0 {
        return None;
    }
    Some(value.round() as usize)
}

fn scale(words: usize, factor: f64) -> usize {
    (words as f64 * factor).round() as usize
}
