//! Verbatim stitching, the advisory consistency pass, and requested new sections

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::instructions::RequestedAddition;
use super::reconstruct::ChunkDelta;
use super::skeleton::{Chapter, ChapterStatus, GlobalSkeleton};
use super::text::{count_words, preview, split_sentences};
use crate::completion::{Completer, CompletionRequest};
use crate::error::CompletionError;
use crate::parser::parse_lenient;

const STITCH_PROMPT: &str = include_str!("../../prompts/stitch.md");
const ADDITION_PROMPT: &str = include_str!("../../prompts/addition.md");

pub const PREVIEW_CHARS: usize = 300;
const WORDS_PER_CHAPTER_SUMMARY: usize = 125;
const FUTURE_RESEARCH_WORDS: usize = 300;
const INTRODUCTION_WORDS: usize = 300;
const SUMMARY_WORDS: usize = 250;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StitchIssue {
    /// 1-based chunk numbers the issue spans
    #[serde(default)]
    pub chunks: Vec<usize>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RepairStep {
    #[serde(default)]
    pub chunk: Option<usize>,
    pub action: String,
}

/// Advisory findings; never applied to the text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct StitchResult {
    pub contradictions: Vec<StitchIssue>,
    pub terminology_drift: Vec<StitchIssue>,
    pub missing_premises: Vec<StitchIssue>,
    pub redundancies: Vec<StitchIssue>,
    pub repair_plan: Vec<RepairStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl StitchResult {
    fn unavailable(note: impl Into<String>) -> Self {
        Self {
            notes: vec![note.into()],
            ..Self::default()
        }
    }

    pub fn issue_count(&self) -> usize {
        self.contradictions.len()
            + self.terminology_drift.len()
            + self.missing_premises.len()
            + self.redundancies.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StitchChunk<'a> {
    pub index: usize,
    pub text: &'a str,
    pub delta: &'a ChunkDelta,
}

#[derive(Debug, Clone)]
pub struct StitchOutcome {
    pub final_output: String,
    pub stitch_result: StitchResult,
}

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Concatenate chunk outputs in index order and run the consistency review.
///
/// The review is advisory: a failed call or unparsable answer yields an empty result with a note.
pub async fn stitch_and_validate(
    completer: &Completer,
    skeleton: &GlobalSkeleton,
    chunks: &[StitchChunk<'_>],
    settings: &AnalysisSettings,
) -> StitchOutcome {
    let mut ordered: Vec<&StitchChunk<'_>> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    let final_output = ordered
        .iter()
        .map(|c| c.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n");

    let sections = ordered
        .iter()
        .map(|c| render_section(c))
        .collect::<Vec<_>>()
        .join("\n\n");
    let prompt = STITCH_PROMPT
        .replace("{{TOTAL_CHUNKS}}", &ordered.len().to_string())
        .replace("{{THESIS}}", &skeleton.thesis)
        .replace("{{KEY_TERMS}}", &skeleton.render_key_terms())
        .replace("{{COMMITMENTS}}", &skeleton.render_commitments())
        .replace("{{SECTIONS}}", &sections);

    let stitch_result = match completer
        .complete(CompletionRequest::new(
            prompt,
            settings.max_tokens,
            settings.temperature,
        ))
        .await
    {
        Ok(raw) => match parse_stitch(&raw) {
            Some(result) => {
                info!(
                    "Consistency review found {} issue(s), {} repair suggestion(s)",
                    result.issue_count(),
                    result.repair_plan.len()
                );
                result
            }
            None => {
                warn!("Could not parse the consistency review, skipping it");
                StitchResult::unavailable("consistency review response could not be parsed")
            }
        },
        Err(e) => {
            warn!("Consistency review failed: {}", e);
            StitchResult::unavailable(format!("consistency review unavailable: {}", e))
        }
    };

    StitchOutcome {
        final_output,
        stitch_result,
    }
}

fn render_section(chunk: &StitchChunk<'_>) -> String {
    let delta = chunk.delta;
    let mut lines = vec![
        format!("### Section {}", chunk.index + 1),
        format!("Opening: {}", preview(chunk.text.trim(), PREVIEW_CHARS)),
    ];
    if !delta.new_claims.is_empty() {
        lines.push(format!("New claims: {}", delta.new_claims.join("; ")));
    }
    if !delta.terms_used.is_empty() {
        lines.push(format!("Terms used: {}", delta.terms_used.join(", ")));
    }
    if !delta.conflicts.is_empty() {
        lines.push(format!("Self-reported conflicts: {}", delta.conflicts.join("; ")));
    }
    if !delta.ledger_additions.is_empty() {
        let additions = delta
            .ledger_additions
            .iter()
            .map(|c| format!("[{}] {}", c.kind, c.claim))
            .collect::<Vec<_>>()
            .join("; ");
        lines.push(format!("Ledger additions: {}", additions));
    }
    lines.join("\n")
}

#[derive(Debug, Deserialize)]
struct RawStitch {
    #[serde(default)]
    contradictions: Vec<Value>,
    #[serde(default, alias = "terminologyDrift")]
    terminology_drift: Vec<Value>,
    #[serde(default, alias = "missingPremises")]
    missing_premises: Vec<Value>,
    #[serde(default, alias = "redundancy")]
    redundancies: Vec<Value>,
    #[serde(default, alias = "repairPlan")]
    repair_plan: Vec<Value>,
}

fn parse_stitch(raw: &str) -> Option<StitchResult> {
    let parsed: RawStitch = parse_lenient(raw)?;
    let issues = |values: Vec<Value>| -> Vec<StitchIssue> {
        values.into_iter().filter_map(issue_from).collect()
    };
    Some(StitchResult {
        contradictions: issues(parsed.contradictions),
        terminology_drift: issues(parsed.terminology_drift),
        missing_premises: issues(parsed.missing_premises),
        redundancies: issues(parsed.redundancies),
        repair_plan: parsed.repair_plan.into_iter().filter_map(repair_from).collect(),
        notes: Vec::new(),
    })
}

fn issue_from(value: Value) -> Option<StitchIssue> {
    match value {
        Value::String(description) => Some(StitchIssue {
            description,
            ..StitchIssue::default()
        }),
        Value::Object(map) => {
            let description = ["description", "issue", "details", "explanation"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))?
                .to_string();
            Some(StitchIssue {
                chunks: chunk_numbers(map.get("chunks").or_else(|| map.get("sections"))),
                description,
                term: map.get("term").and_then(Value::as_str).map(str::to_string),
            })
        }
        _ => None,
    }
}

fn repair_from(value: Value) -> Option<RepairStep> {
    match value {
        Value::String(action) => Some(RepairStep {
            chunk: None,
            action,
        }),
        Value::Object(map) => {
            let action = ["action", "description", "fix", "suggestion"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))?
                .to_string();
            let chunk = map
                .get("chunk")
                .or_else(|| map.get("section"))
                .and_then(Value::as_u64)
                .map(|n| n as usize);
            Some(RepairStep { chunk, action })
        }
        _ => None,
    }
}

fn chunk_numbers(value: Option<&Value>) -> Vec<usize> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_u64)
            .map(|n| n as usize)
            .collect(),
        Some(Value::Number(n)) => n.as_u64().map(|n| vec![n as usize]).unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct Additions {
    pub output: String,
    /// Chapter entries for generated chapters, to append to the skeleton
    pub appended_chapters: Vec<Chapter>,
}

/// Draft every section the user asked for and attach it to the stitched output.
///
/// Introductions and summaries go in front; a concluding chapter goes at the end.
pub async fn generate_requested_additions(
    completer: &Completer,
    output: &str,
    skeleton: &GlobalSkeleton,
    settings: &AnalysisSettings,
) -> Result<Additions, CompletionError> {
    let mut front: Vec<String> = Vec::new();
    let mut body = output.trim().to_string();
    let mut appended_chapters = Vec::new();

    let source_chapters: Vec<&Chapter> = skeleton.chapters.iter().filter(|c| !c.generated).collect();
    let chapter_list = if source_chapters.is_empty() {
        "(the document has no explicit chapters)".to_string()
    } else {
        source_chapters
            .iter()
            .map(|c| format!("{}. {}: {}", c.index + 1, c.title, c.thesis))
            .collect::<Vec<_>>()
            .join("\n")
    };

    for addition in &skeleton.instructions.additions {
        let (target_words, directions) = addition_plan(addition, source_chapters.len().max(1));
        let prompt = ADDITION_PROMPT
            .replace("{{SECTION}}", addition.heading())
            .replace("{{TARGET_WORDS}}", &target_words.to_string())
            .replace("{{DIRECTIONS}}", &directions)
            .replace("{{THESIS}}", &skeleton.thesis)
            .replace("{{CHAPTERS}}", &chapter_list)
            .replace("{{TEXT}}", &body);

        let max_tokens = (target_words as u32)
            .saturating_mul(2)
            .saturating_add(500)
            .max(settings.max_tokens);
        let section = completer
            .complete(
                CompletionRequest::new(prompt, max_tokens, settings.temperature).with_prose_check(),
            )
            .await?;
        let section = section.trim();
        let heading = format!("## {}", addition.heading());

        info!(
            "Generated {} ({} words)",
            addition.heading(),
            count_words(section)
        );

        match addition {
            RequestedAddition::ConcludingChapter { .. } => {
                let start_word = count_words(&body);
                body = format!("{}\n\n{}\n\n{}", body, heading, section);
                appended_chapters.push(Chapter {
                    index: skeleton.chapters.len() + appended_chapters.len(),
                    title: addition.heading().to_string(),
                    thesis: split_sentences(section)
                        .first()
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                    start_word,
                    end_word: count_words(&body),
                    status: ChapterStatus::Complete,
                    generated: true,
                });
            }
            RequestedAddition::Introduction | RequestedAddition::Summary => {
                front.push(format!("{}\n\n{}", heading, section));
            }
        }
    }

    // Summary reads before the introduction
    front.sort_by_key(|s| !s.starts_with("## Summary"));
    let output = if front.is_empty() {
        body
    } else {
        format!("{}\n\n{}", front.join("\n\n"), body)
    };

    Ok(Additions {
        output,
        appended_chapters,
    })
}

fn addition_plan(addition: &RequestedAddition, chapter_count: usize) -> (usize, String) {
    match addition {
        RequestedAddition::ConcludingChapter {
            summarize_each_chapter,
            future_research,
        } => {
            let mut words = WORDS_PER_CHAPTER_SUMMARY * chapter_count;
            let mut directions = vec![
                "- Draw the chapters together into a final statement of the thesis.".to_string(),
            ];
            if *summarize_each_chapter {
                directions.push("- Summarize each chapter in turn, in order, by title.".to_string());
            }
            if *future_research {
                words += FUTURE_RESEARCH_WORDS;
                directions.push(
                    "- Close with concrete directions for future research.".to_string(),
                );
            }
            (words, directions.join("\n"))
        }
        RequestedAddition::Introduction => (
            INTRODUCTION_WORDS,
            "- Introduce the question, the thesis, and the route the chapters take.".to_string(),
        ),
        RequestedAddition::Summary => (
            SUMMARY_WORDS,
            "- Summarize the argument and its conclusions for a reader who will not read the rest."
                .to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::pipeline::instructions::parse_user_instructions;
    use crate::pipeline::skeleton::parse_chapters;
    use crate::provider::scripted::{Scripted, ScriptedProvider};
    use std::sync::Arc;

    fn settings() -> AnalysisSettings {
        AnalysisSettings {
            temperature: 0.2,
            max_tokens: 4096,
        }
    }

    fn skeleton(instructions: &str) -> GlobalSkeleton {
        let mut s = GlobalSkeleton::degraded(parse_user_instructions(instructions));
        s.thesis = "Rules outlast rulers.".to_string();
        s
    }

    #[tokio::test]
    async fn test_stitch_concatenates_in_index_order() {
        let provider = Arc::new(ScriptedProvider::new());
        let completer = Completer::new(provider.clone(), None, 3);
        let delta = ChunkDelta::default();
        let chunks = [
            StitchChunk { index: 1, text: "Second part.\n", delta: &delta },
            StitchChunk { index: 0, text: "  First part.", delta: &delta },
        ];

        let outcome = stitch_and_validate(&completer, &skeleton(""), &chunks, &settings()).await;
        assert_eq!(outcome.final_output, "First part.\n\nSecond part.");
        assert_eq!(outcome.stitch_result.redundancies.len(), 1);
        assert_eq!(outcome.stitch_result.redundancies[0].chunks, vec![1, 2]);
        assert!(outcome.stitch_result.notes.is_empty());

        let prompt = &provider.prompts()[0].0;
        assert!(prompt.contains("### Section 1\nOpening: First part."));
    }

    #[tokio::test]
    async fn test_stitch_failure_is_advisory() {
        let provider = Arc::new(
            ScriptedProvider::new().failing(|| ProviderError::Http {
                status: 500,
                body: "boom".into(),
            }),
        );
        let completer = Completer::new(provider, None, 3);
        let delta = ChunkDelta::default();
        let chunks = [StitchChunk { index: 0, text: "Only part.", delta: &delta }];

        let outcome = stitch_and_validate(&completer, &skeleton(""), &chunks, &settings()).await;
        assert_eq!(outcome.final_output, "Only part.");
        assert_eq!(outcome.stitch_result.issue_count(), 0);
        assert_eq!(outcome.stitch_result.notes.len(), 1);
    }

    #[test]
    fn test_parse_stitch_tolerates_shapes() {
        let raw = r#"{"contradictions": ["Sections 2 and 5 disagree."],
            "terminologyDrift": [{"term": "rent", "sections": [1, 3], "issue": "shifts meaning"}],
            "repairPlan": [{"section": 3, "fix": "define rent"}, "tighten the ending"]}"#;
        let result = parse_stitch(raw).unwrap();
        assert_eq!(result.contradictions[0].description, "Sections 2 and 5 disagree.");
        assert_eq!(result.terminology_drift[0].term.as_deref(), Some("rent"));
        assert_eq!(result.terminology_drift[0].chunks, vec![1, 3]);
        assert_eq!(result.repair_plan[0].chunk, Some(3));
        assert_eq!(result.repair_plan[1].chunk, None);
    }

    #[tokio::test]
    async fn test_conclusion_appended_with_chapter_entry() {
        let provider = Arc::new(ScriptedProvider::new());
        let completer = Completer::new(provider.clone(), None, 3);
        let mut skel = skeleton("Add a concluding chapter that summarizes each chapter and suggests future research.");
        skel.chapters = parse_chapters(
            r#"[{"title": "A", "start_word": 0}, {"title": "B", "start_word": 100}, {"title": "C", "start_word": 200}]"#,
            300,
        )
        .unwrap();

        let additions = generate_requested_additions(&completer, "Body text.", &skel, &settings())
            .await
            .unwrap();

        assert!(additions.output.starts_with("Body text.\n\n## Conclusion\n\nIn conclusion"));
        assert_eq!(additions.appended_chapters.len(), 1);
        let chapter = &additions.appended_chapters[0];
        assert_eq!(chapter.index, 3);
        assert!(chapter.generated);
        assert_eq!(chapter.status, ChapterStatus::Complete);
        assert_eq!(chapter.start_word, 2);

        let prompt = &provider.prompts()[0].0;
        assert!(prompt.contains("about 675 words"));
        assert!(prompt.contains("Summarize each chapter"));
        assert!(prompt.contains("future research"));
    }

    #[tokio::test]
    async fn test_introduction_and_summary_prepended() {
        let provider = Arc::new(ScriptedProvider::new());
        let completer = Completer::new(provider, None, 3);
        let skel = skeleton("Add an introduction and an executive summary.");

        let additions = generate_requested_additions(&completer, "Body text.", &skel, &settings())
            .await
            .unwrap();
        assert!(additions.output.starts_with("## Summary\n\n"));
        let intro = additions.output.find("## Introduction").unwrap();
        let body = additions.output.find("Body text.").unwrap();
        assert!(intro < body);
        assert!(additions.appended_chapters.is_empty());
    }

    #[tokio::test]
    async fn test_addition_failure_is_fatal() {
        let provider = Arc::new(ScriptedProvider::new().with_queue(vec![Scripted::Fail(
            ProviderError::Http {
                status: 400,
                body: "bad".into(),
            },
        )]));
        let completer = Completer::new(provider, None, 3);
        let skel = skeleton("Write a conclusion.");

        let err = generate_requested_additions(&completer, "Body.", &skel, &settings()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_no_additions_is_identity() {
        let provider = Arc::new(ScriptedProvider::new());
        let completer = Completer::new(provider.clone(), None, 3);
        let additions = generate_requested_additions(&completer, "Body.", &skeleton(""), &settings())
            .await
            .unwrap();
        assert_eq!(additions.output, "Body.");
        assert_eq!(provider.calls(), 0);
    }
}
