//! Final compliance checks on the assembled document

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::instructions::RequestedAddition;
use super::length::ConstraintKind;
use super::skeleton::GlobalSkeleton;
use super::text::{count_words, detect_truncation};

/// Minimum words after a bibliography heading for it to count as populated
const MIN_BIBLIOGRAPHY_WORDS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct FinalValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub word_count: usize,
    pub target_met: bool,
    pub chapters_preserved: bool,
    pub additions_included: bool,
}

impl FinalValidation {
    pub fn summary(&self) -> String {
        if self.errors.is_empty() {
            "passed".to_string()
        } else {
            self.errors.join("; ")
        }
    }
}

pub fn validate_final_output(output: &str, skeleton: &GlobalSkeleton) -> FinalValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let word_count = count_words(output);

    // (a) word count against the explicit constraint
    let target_met = match &skeleton.instructions.length {
        Some(constraint) => {
            let met = constraint.accepts(word_count);
            if !met {
                let bound = match constraint.kind {
                    ConstraintKind::NoLessThan => format!("at least {}", constraint.min),
                    ConstraintKind::NoMoreThan => format!("at most {}", constraint.max),
                    ConstraintKind::Between
                    | ConstraintKind::Approximately
                    | ConstraintKind::Exactly => {
                        format!("between {} and {}", constraint.min, constraint.max)
                    }
                };
                errors.push(format!(
                    "Output has {} words; the instructions require {}",
                    word_count, bound
                ));
            }
            met
        }
        None => true,
    };

    // (b) requested additions
    let mut additions_included = true;
    for addition in &skeleton.instructions.additions {
        for missing in missing_markers(output, addition) {
            additions_included = false;
            errors.push(format!(
                "Requested {} is missing: no mention of {}",
                addition.heading().to_lowercase(),
                missing
            ));
        }
    }

    // (c) chapter structure
    let expected_chapters = skeleton.chapters.len();
    let headings = count_headings(output);
    let chapters_preserved = expected_chapters <= 1 || headings >= expected_chapters;
    if !chapters_preserved {
        warnings.push(format!(
            "Found {} headings for {} chapters; chapter structure may not be preserved",
            headings, expected_chapters
        ));
    }

    // (d) truncation
    if let Some(signal) = detect_truncation(output) {
        errors.push(format!("Output appears truncated: it {}", signal));
    }

    // (e) trailing bibliography heading with nothing under it
    if has_empty_bibliography(output) {
        warnings.push("Bibliography heading at the end has no entries".to_string());
    }

    FinalValidation {
        valid: errors.is_empty(),
        errors,
        warnings,
        word_count,
        target_met,
        chapters_preserved,
        additions_included,
    }
}

fn missing_markers(output: &str, addition: &RequestedAddition) -> Vec<&'static str> {
    let mut checks: Vec<(&'static str, &'static str)> = Vec::new();
    match addition {
        RequestedAddition::ConcludingChapter {
            future_research, ..
        } => {
            checks.push(("a conclusion", r"(?i)\bconclu(?:sion|sions|ding)\b"));
            if *future_research {
                checks.push((
                    "future research",
                    r"(?i)\b(?:future|further)\s+(?:research|work|stud(?:y|ies)|directions|investigation)",
                ));
            }
        }
        RequestedAddition::Introduction => {
            checks.push(("an introduction", r"(?i)\bintroduct(?:ion|ory)\b"));
        }
        RequestedAddition::Summary => {
            checks.push(("a summary", r"(?i)\b(?:summary|in\s+sum|to\s+summari[sz]e)\b"));
        }
    }

    checks
        .into_iter()
        .filter(|(_, pattern)| {
            !Regex::new(pattern)
                .map(|re| re.is_match(output))
                .unwrap_or(false)
        })
        .map(|(label, _)| label)
        .collect()
}

fn count_headings(output: &str) -> usize {
    Regex::new(r"(?im)^\s*(?:#{1,3}\s+\S|(?:chapter|part)\s+(?:\d+|[ivxlc]+)\b)")
        .map(|re| re.find_iter(output).count())
        .unwrap_or(0)
}

fn has_empty_bibliography(output: &str) -> bool {
    let Ok(re) = Regex::new(
        r"(?im)^\s*(?:#{1,6}\s*)?(?:references|bibliography|works\s+cited|sources|notes)\s*:?\s*$",
    ) else {
        return false;
    };
    match re.find_iter(output).last() {
        Some(m) => count_words(&output[m.end()..]) < MIN_BIBLIOGRAPHY_WORDS,
        None => false,
    }
}
