//! Rule-based parsing of free-form user instructions

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::length::{parse_length_directive, ConstraintKind, LengthDirective};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LengthConstraint {
    pub kind: ConstraintKind,
    pub min: usize,
    pub max: usize,
}

impl From<LengthDirective> for LengthConstraint {
    fn from(directive: LengthDirective) -> Self {
        Self {
            kind: directive.kind,
            min: directive.band.min,
            max: directive.band.max,
        }
    }
}

impl LengthConstraint {
    /// Whether `words` satisfies the constraint; one-sided kinds check one bound only
    pub fn accepts(&self, words: usize) -> bool {
        match self.kind {
            ConstraintKind::NoLessThan => words >= self.min,
            ConstraintKind::NoMoreThan => words <= self.max,
            ConstraintKind::Between | ConstraintKind::Approximately | ConstraintKind::Exactly => {
                words >= self.min && words <= self.max
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestedAddition {
    ConcludingChapter {
        summarize_each_chapter: bool,
        future_research: bool,
    },
    Introduction,
    Summary,
}

impl RequestedAddition {
    pub fn heading(&self) -> &'static str {
        match self {
            RequestedAddition::ConcludingChapter { .. } => "Conclusion",
            RequestedAddition::Introduction => "Introduction",
            RequestedAddition::Summary => "Summary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PreservationRequirement {
    ChapterStructure,
    Terminology,
    Citations,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UserInstructions {
    #[serde(default)]
    pub length: Option<LengthConstraint>,
    #[serde(default)]
    pub additions: Vec<RequestedAddition>,
    #[serde(default)]
    pub preservation: Vec<PreservationRequirement>,
}

impl UserInstructions {
    pub fn wants_conclusion(&self) -> bool {
        self.additions
            .iter()
            .any(|a| matches!(a, RequestedAddition::ConcludingChapter { .. }))
    }

    pub fn preserves(&self, requirement: PreservationRequirement) -> bool {
        self.preservation.contains(&requirement)
    }
}

const PRESERVE_VERB: &str = r"(?:preserve|keep|maintain|retain|respect|do\s+not\s+change|don't\s+change)";

pub fn parse_user_instructions(text: &str) -> UserInstructions {
    let text = text.trim();
    if text.is_empty() {
        return UserInstructions::default();
    }

    UserInstructions {
        length: parse_length_constraint(text),
        additions: parse_additions(text),
        preservation: parse_preservation(text),
    }
}

fn parse_length_constraint(text: &str) -> Option<LengthConstraint> {
    parse_length_directive(text).map(LengthConstraint::from)
}

fn parse_additions(text: &str) -> Vec<RequestedAddition> {
    let mut additions = Vec::new();

    if matches(text, r"(?i)\b(?:introduct(?:ion|ory)\s+(?:chapter|section)|(?:add|write|include|prepend|create|provide|open\s+with)\s+(?:a\s+|an\s+|new\s+|short\s+|brief\s+)*introduction)\b") {
        additions.push(RequestedAddition::Introduction);
    }

    if matches(text, r"(?i)\b(?:conclu\w*|closing|final)\s+(?:chapter|section)\b")
        || matches(text, r"(?i)\b(?:add|write|include|append|create|provide|end\s+with)\s+(?:a\s+|an\s+|new\s+|short\s+|brief\s+)*conclusion\b")
        || matches(text, r"(?i)\bchapter\s+of\s+conclusions\b")
    {
        additions.push(RequestedAddition::ConcludingChapter {
            summarize_each_chapter: matches(
                text,
                r"(?i)\b(?:summari[sz]\w*\s+(?:each|every|all(?:\s+the)?|the)\s+(?:of\s+the\s+)?chapters?|summary\s+of\s+(?:each|every|all(?:\s+the)?)\s+chapters?|chapter[-\s]by[-\s]chapter\s+summar\w*)",
            ),
            future_research: matches(
                text,
                r"(?i)\b(?:future|further)\s+(?:research|work|studies|study|directions|investigation)",
            ),
        });
    }

    if matches(text, r"(?i)\b(?:executive\s+summary|(?:add|write|include|append|create|provide|end\s+with)\s+(?:a\s+|an\s+|short\s+|brief\s+|final\s+)*summary\b)") {
        additions.push(RequestedAddition::Summary);
    }

    additions
}

fn parse_preservation(text: &str) -> Vec<PreservationRequirement> {
    let checks = [
        (
            PreservationRequirement::ChapterStructure,
            r"(?:the\s+)?(?:original\s+|existing\s+)?(?:chapter|section)(?:s|\s+structure|\s+divisions|\s+headings|\s+breaks)",
        ),
        (
            PreservationRequirement::Terminology,
            r"(?:the\s+|all\s+)?(?:original\s+|existing\s+|technical\s+|key\s+)*(?:terminology|terms|vocabulary|jargon)",
        ),
        (
            PreservationRequirement::Citations,
            r"(?:the\s+|all\s+)?(?:original\s+|existing\s+)?(?:citations|references|footnotes|sources)",
        ),
    ];

    checks
        .into_iter()
        .filter(|(_, object)| {
            matches(
                text,
                &format!(r"(?i)\b{PRESERVE_VERB}\s+(?:all\s+)?{object}\b"),
            )
        })
        .map(|(requirement, _)| requirement)
        .collect()
}

fn matches(text: &str, pattern: &str) -> bool {
    Regex::new(pattern)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}
