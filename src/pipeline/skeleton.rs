//! Global skeleton: the structural backbone every chunk is rewritten against

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::instructions::{parse_user_instructions, UserInstructions};
use crate::completion::{Completer, CompletionRequest};
use crate::error::CompletionError;
use crate::parser::parse_lenient;

const SKELETON_PROMPT: &str = include_str!("../../prompts/skeleton.md");
const CHAPTERS_PROMPT: &str = include_str!("../../prompts/chapters.md");

pub const MAX_OUTLINE_ITEMS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KeyTerm {
    pub term: String,
    pub meaning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentKind {
    Asserts,
    Rejects,
    Assumes,
}

impl CommitmentKind {
    /// Lenient mapping of model-written kinds; unknown kinds read as assertions
    pub(crate) fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_lowercase()).as_deref() {
            Some("rejects" | "reject" | "denies" | "deny" | "refutes") => CommitmentKind::Rejects,
            Some("assumes" | "assume" | "presupposes" | "premise") => CommitmentKind::Assumes,
            _ => CommitmentKind::Asserts,
        }
    }
}

impl std::fmt::Display for CommitmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitmentKind::Asserts => write!(f, "asserts"),
            CommitmentKind::Rejects => write!(f, "rejects"),
            CommitmentKind::Assumes => write!(f, "assumes"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Commitment {
    pub kind: CommitmentKind,
    pub claim: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Pending,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Chapter {
    pub index: usize,
    pub title: String,
    pub thesis: String,
    pub start_word: usize,
    pub end_word: usize,
    pub status: ChapterStatus,
    /// Appended by the pipeline rather than found in the source
    #[serde(default)]
    pub generated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GlobalSkeleton {
    pub outline: Vec<String>,
    pub thesis: String,
    pub key_terms: Vec<KeyTerm>,
    pub commitments: Vec<Commitment>,
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    #[serde(default)]
    pub instructions: UserInstructions,
    /// True when the analysis response could not be parsed
    #[serde(default)]
    pub degraded: bool,
}

impl GlobalSkeleton {
    pub fn degraded(instructions: UserInstructions) -> Self {
        Self {
            outline: vec!["[could not parse outline]".to_string()],
            thesis: "[could not parse thesis]".to_string(),
            key_terms: Vec::new(),
            commitments: Vec::new(),
            entities: Vec::new(),
            chapters: Vec::new(),
            instructions,
            degraded: true,
        }
    }

    /// Outline items proportional to the chunk's position in the document
    pub fn outline_slice(&self, index: usize, total: usize) -> &[String] {
        let len = self.outline.len();
        if len == 0 || total == 0 {
            return &[];
        }
        let index = index.min(total - 1);
        let start = (index * len) / total;
        let end = (((index + 1) * len).div_ceil(total)).clamp(start + 1, len);
        &self.outline[start..end]
    }

    /// Mark every pending chapter ending at or before `word_offset` complete.
    ///
    /// Returns the titles of chapters that changed.
    pub fn complete_chapters_through(&mut self, word_offset: usize) -> Vec<String> {
        self.chapters
            .iter_mut()
            .filter(|c| c.status == ChapterStatus::Pending && !c.generated)
            .filter(|c| c.end_word <= word_offset)
            .map(|c| {
                c.status = ChapterStatus::Complete;
                c.title.clone()
            })
            .collect()
    }

    pub fn render_key_terms(&self) -> String {
        render_list(self.key_terms.iter().map(|t| format!("- **{}**: {}", t.term, t.meaning)))
    }

    pub fn render_commitments(&self) -> String {
        render_list(
            self.commitments
                .iter()
                .map(|c| format!("- [{}] {}", c.kind, c.claim)),
        )
    }

    pub fn render_entities(&self) -> String {
        render_list(
            self.entities
                .iter()
                .map(|e| format!("- {} ({}): {}", e.name, e.entity_type, e.role)),
        )
    }
}

fn render_list(lines: impl Iterator<Item = String>) -> String {
    let lines: Vec<String> = lines.collect();
    if lines.is_empty() {
        "- (none)".to_string()
    } else {
        lines.join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct SkeletonSettings {
    pub chapter_detection_words: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Run the structural analysis and, for long or conclusion-bearing documents, chapter detection.
///
/// Parse failures degrade to marked defaults; completion failures propagate.
pub async fn extract_skeleton(
    completer: &Completer,
    text: &str,
    word_count: usize,
    instructions: Option<&str>,
    settings: &SkeletonSettings,
) -> Result<GlobalSkeleton, CompletionError> {
    let parsed_instructions = instructions
        .map(parse_user_instructions)
        .unwrap_or_default();

    let prompt = SKELETON_PROMPT
        .replace("{{WORD_COUNT}}", &word_count.to_string())
        .replace("{{TEXT}}", text);
    let response = completer
        .complete(CompletionRequest::new(
            prompt,
            settings.max_tokens,
            settings.temperature,
        ))
        .await?;

    let mut skeleton = match parse_skeleton(&response, parsed_instructions.clone()) {
        Some(skeleton) => skeleton,
        None => {
            warn!("Could not parse skeleton response, continuing with degraded defaults");
            GlobalSkeleton::degraded(parsed_instructions)
        }
    };

    if word_count > settings.chapter_detection_words || skeleton.instructions.wants_conclusion() {
        let prompt = CHAPTERS_PROMPT
            .replace("{{WORD_COUNT}}", &word_count.to_string())
            .replace("{{TEXT}}", text);
        let response = completer
            .complete(CompletionRequest::new(
                prompt,
                settings.max_tokens,
                settings.temperature,
            ))
            .await?;

        skeleton.chapters = match parse_chapters(&response, word_count) {
            Some(chapters) => chapters,
            None => {
                warn!("Could not parse chapter boundaries, using one chapter for the whole document");
                vec![synthetic_chapter(&skeleton.thesis, word_count)]
            }
        };
    }

    info!(
        "Skeleton: {} outline items, {} key terms, {} commitments, {} chapters",
        skeleton.outline.len(),
        skeleton.key_terms.len(),
        skeleton.commitments.len(),
        skeleton.chapters.len()
    );
    Ok(skeleton)
}

fn synthetic_chapter(thesis: &str, word_count: usize) -> Chapter {
    Chapter {
        index: 0,
        title: "Full document".to_string(),
        thesis: thesis.to_string(),
        start_word: 0,
        end_word: word_count,
        status: ChapterStatus::Pending,
        generated: false,
    }
}

// Wire shapes the analysis model is known to produce

#[derive(Debug, Deserialize)]
struct RawSkeleton {
    #[serde(default)]
    outline: Vec<RawOutlineItem>,
    #[serde(default, alias = "mainThesis", alias = "main_thesis")]
    thesis: Option<String>,
    #[serde(default, alias = "keyTerms")]
    key_terms: Option<RawKeyTerms>,
    #[serde(
        default,
        alias = "commitmentLedger",
        alias = "commitment_ledger",
        alias = "ledger"
    )]
    commitments: Option<RawCommitments>,
    #[serde(default)]
    entities: Vec<RawEntity>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOutlineItem {
    Text(String),
    Titled {
        #[serde(alias = "point", alias = "heading", alias = "section")]
        title: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawKeyTerms {
    Map(BTreeMap<String, String>),
    List(Vec<RawKeyTerm>),
}

#[derive(Debug, Deserialize)]
struct RawKeyTerm {
    #[serde(alias = "name")]
    term: String,
    #[serde(default, alias = "definition", alias = "description")]
    meaning: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommitments {
    List(Vec<RawCommitment>),
    Grouped {
        #[serde(default)]
        asserts: Vec<String>,
        #[serde(default)]
        rejects: Vec<String>,
        #[serde(default)]
        assumes: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawCommitment {
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default, alias = "statement", alias = "text")]
    claim: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntity {
    Name(String),
    Full {
        name: String,
        #[serde(default, rename = "type", alias = "kind", alias = "entityType")]
        entity_type: String,
        #[serde(default)]
        role: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawChapters {
    List(Vec<RawChapter>),
    Wrapped { chapters: Vec<RawChapter> },
}

#[derive(Debug, Deserialize)]
struct RawChapter {
    #[serde(default)]
    title: String,
    #[serde(default, alias = "summary")]
    thesis: String,
    #[serde(default, alias = "startWord", alias = "start")]
    start_word: Option<usize>,
    #[serde(default, alias = "endWord", alias = "end")]
    end_word: Option<usize>,
}

pub(crate) fn parse_skeleton(raw: &str, instructions: UserInstructions) -> Option<GlobalSkeleton> {
    let parsed: RawSkeleton = parse_lenient(raw)?;

    let mut outline: Vec<String> = parsed
        .outline
        .into_iter()
        .map(|item| match item {
            RawOutlineItem::Text(s) | RawOutlineItem::Titled { title: s } => s.trim().to_string(),
        })
        .filter(|s| !s.is_empty())
        .collect();
    if outline.len() > MAX_OUTLINE_ITEMS {
        debug!("Truncating outline from {} to {} items", outline.len(), MAX_OUTLINE_ITEMS);
        outline.truncate(MAX_OUTLINE_ITEMS);
    }

    let thesis = parsed
        .thesis
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    if outline.is_empty() && thesis.is_none() {
        return None;
    }

    let key_terms = match parsed.key_terms {
        Some(RawKeyTerms::Map(map)) => map
            .into_iter()
            .map(|(term, meaning)| KeyTerm { term, meaning })
            .collect(),
        Some(RawKeyTerms::List(list)) => list
            .into_iter()
            .map(|t| KeyTerm {
                term: t.term,
                meaning: t.meaning,
            })
            .collect(),
        None => Vec::new(),
    };

    let commitments = match parsed.commitments {
        Some(RawCommitments::List(list)) => list
            .into_iter()
            .filter(|c| !c.claim.trim().is_empty())
            .map(|c| Commitment {
                kind: CommitmentKind::parse(c.kind.as_deref()),
                claim: c.claim.trim().to_string(),
            })
            .collect(),
        Some(RawCommitments::Grouped {
            asserts,
            rejects,
            assumes,
        }) => [
            (CommitmentKind::Asserts, asserts),
            (CommitmentKind::Rejects, rejects),
            (CommitmentKind::Assumes, assumes),
        ]
        .into_iter()
        .flat_map(|(kind, claims)| {
            claims
                .into_iter()
                .map(move |claim| Commitment { kind, claim })
        })
        .collect(),
        None => Vec::new(),
    };

    let entities = parsed
        .entities
        .into_iter()
        .map(|e| match e {
            RawEntity::Name(name) => Entity {
                name,
                entity_type: "unspecified".to_string(),
                role: String::new(),
            },
            RawEntity::Full {
                name,
                entity_type,
                role,
            } => Entity {
                name,
                entity_type,
                role,
            },
        })
        .collect();

    Some(GlobalSkeleton {
        outline,
        thesis: thesis.unwrap_or_else(|| "[could not parse thesis]".to_string()),
        key_terms,
        commitments,
        entities,
        chapters: Vec::new(),
        instructions,
        degraded: false,
    })
}

/// Chapters ordered by start offset, re-indexed, with gaps in offsets filled evenly
pub(crate) fn parse_chapters(raw: &str, word_count: usize) -> Option<Vec<Chapter>> {
    let raw_chapters = match parse_lenient::<RawChapters>(raw)? {
        RawChapters::List(list) | RawChapters::Wrapped { chapters: list } => list,
    };
    if raw_chapters.is_empty() {
        return None;
    }

    let n = raw_chapters.len();
    let mut chapters: Vec<Chapter> = raw_chapters
        .into_iter()
        .enumerate()
        .map(|(i, c)| Chapter {
            index: i,
            title: if c.title.trim().is_empty() {
                format!("Chapter {}", i + 1)
            } else {
                c.title.trim().to_string()
            },
            thesis: c.thesis.trim().to_string(),
            start_word: c
                .start_word
                .unwrap_or(i * word_count / n)
                .min(word_count),
            end_word: 0,
            status: ChapterStatus::Pending,
            generated: false,
        })
        .collect();

    chapters.sort_by_key(|c| c.start_word);
    let starts: Vec<usize> = chapters.iter().map(|c| c.start_word).collect();
    for (i, chapter) in chapters.iter_mut().enumerate() {
        chapter.index = i;
        chapter.end_word = starts.get(i + 1).copied().unwrap_or(word_count);
    }
    if let Some(first) = chapters.first_mut() {
        first.start_word = 0;
    }

    Some(chapters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::scripted::{Scripted, ScriptedProvider};
    use crate::provider::StopReason;
    use std::sync::Arc;

    fn settings() -> SkeletonSettings {
        SkeletonSettings {
            chapter_detection_words: 8000,
            temperature: 0.2,
            max_tokens: 4096,
        }
    }

    #[test]
    fn test_parse_snake_case_with_map_terms() {
        let raw = r#"{
            "outline": ["A", "B"],
            "thesis": "T.",
            "key_terms": {"rent": "unearned income"},
            "commitments": [{"kind": "rejects", "claim": "Markets are self-correcting."}],
            "entities": [{"name": "Smith", "type": "person", "role": "foil"}]
        }"#;
        let skeleton = parse_skeleton(raw, UserInstructions::default()).unwrap();
        assert_eq!(skeleton.outline, vec!["A", "B"]);
        assert_eq!(skeleton.key_terms[0].term, "rent");
        assert_eq!(skeleton.commitments[0].kind, CommitmentKind::Rejects);
        assert_eq!(skeleton.entities[0].entity_type, "person");
        assert!(!skeleton.degraded);
    }

    #[test]
    fn test_parse_camel_case_with_list_terms_and_grouped_ledger() {
        let raw = r#"Sure, here it is:
```json
{
  "outline": [{"title": "Intro"}, "Body"],
  "mainThesis": "Rules matter.",
  "keyTerms": [{"name": "rule", "definition": "a constraint"}],
  "commitmentLedger": {"asserts": ["X holds."], "assumes": ["Y is stable."]},
  "entities": ["Ostrom"]
}
```"#;
        let skeleton = parse_skeleton(raw, UserInstructions::default()).unwrap();
        assert_eq!(skeleton.outline, vec!["Intro", "Body"]);
        assert_eq!(skeleton.thesis, "Rules matter.");
        assert_eq!(skeleton.key_terms[0].meaning, "a constraint");
        assert_eq!(skeleton.commitments.len(), 2);
        assert_eq!(skeleton.commitments[1].kind, CommitmentKind::Assumes);
        assert_eq!(skeleton.entities[0].name, "Ostrom");
    }

    #[test]
    fn test_outline_truncated_to_twenty() {
        let items: Vec<String> = (0..30).map(|i| format!("\"item {}\"", i)).collect();
        let raw = format!("{{\"outline\": [{}], \"thesis\": \"T\"}}", items.join(","));
        let skeleton = parse_skeleton(&raw, UserInstructions::default()).unwrap();
        assert_eq!(skeleton.outline.len(), MAX_OUTLINE_ITEMS);
        assert_eq!(skeleton.outline[19], "item 19");
    }

    #[test]
    fn test_unparsable_is_none() {
        assert!(parse_skeleton("I cannot help with that.", UserInstructions::default()).is_none());
        assert!(parse_skeleton("{\"unrelated\": true}", UserInstructions::default()).is_none());
    }

    #[test]
    fn test_parse_chapters_orders_and_fills_offsets() {
        let raw = r#"{"chapters": [
            {"title": "Two", "thesis": "b", "startWord": 500},
            {"title": "One", "summary": "a", "start_word": 10}
        ]}"#;
        let chapters = parse_chapters(raw, 1000).unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "One");
        assert_eq!(chapters[0].start_word, 0);
        assert_eq!(chapters[0].end_word, 500);
        assert_eq!(chapters[1].end_word, 1000);
        assert_eq!(chapters[1].index, 1);
    }

    #[test]
    fn test_outline_slice_is_proportional() {
        let mut skeleton = GlobalSkeleton::degraded(UserInstructions::default());
        skeleton.outline = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(skeleton.outline_slice(0, 5), &["0", "1"]);
        assert_eq!(skeleton.outline_slice(4, 5), &["8", "9"]);
        // More chunks than outline items still yields one item each
        assert_eq!(skeleton.outline_slice(19, 20).len(), 1);
    }

    #[test]
    fn test_complete_chapters_through() {
        let mut skeleton = GlobalSkeleton::degraded(UserInstructions::default());
        skeleton.chapters = parse_chapters(
            r#"[{"title": "A", "start_word": 0}, {"title": "B", "start_word": 400}]"#,
            1000,
        )
        .unwrap();
        assert!(skeleton.complete_chapters_through(300).is_empty());
        assert_eq!(skeleton.complete_chapters_through(450), vec!["A"]);
        assert_eq!(skeleton.complete_chapters_through(1000), vec!["B"]);
    }

    #[tokio::test]
    async fn test_extract_short_document_skips_chapter_call() {
        let provider = Arc::new(ScriptedProvider::new());
        let completer = Completer::new(provider.clone(), None, 3);

        let skeleton = extract_skeleton(&completer, "Some text.", 3000, None, &settings())
            .await
            .unwrap();
        assert_eq!(provider.calls(), 1);
        assert_eq!(skeleton.outline.len(), 8);
        assert_eq!(skeleton.key_terms.len(), 2);
        assert!(skeleton.chapters.is_empty());
    }

    #[tokio::test]
    async fn test_extract_with_conclusion_request_detects_chapters() {
        let provider = Arc::new(ScriptedProvider::new());
        let completer = Completer::new(provider.clone(), None, 3);

        let skeleton = extract_skeleton(
            &completer,
            "Some text.",
            3000,
            Some("Add a concluding chapter."),
            &settings(),
        )
        .await
        .unwrap();
        assert_eq!(provider.calls(), 2);
        assert_eq!(skeleton.chapters.len(), 3);
        assert_eq!(skeleton.chapters[2].end_word, 3000);
        assert!(skeleton.instructions.wants_conclusion());
    }

    #[tokio::test]
    async fn test_unparsable_responses_degrade() {
        let provider = Arc::new(ScriptedProvider::new().with_queue(vec![
            Scripted::Text("no json at all".into(), StopReason::Normal),
            Scripted::Text("still nothing".into(), StopReason::Normal),
        ]));
        let completer = Completer::new(provider, None, 3);

        let skeleton = extract_skeleton(&completer, "Some text.", 9000, None, &settings())
            .await
            .unwrap();
        assert!(skeleton.degraded);
        assert!(skeleton.thesis.contains("could not parse"));
        assert_eq!(skeleton.chapters.len(), 1);
        assert_eq!(skeleton.chapters[0].end_word, 9000);
    }
}
