//! Per-chunk reconstruction against the skeleton and a hard word band

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::length::{LengthConfig, LengthMode};
use super::skeleton::{Commitment, CommitmentKind, GlobalSkeleton};
use super::instructions::PreservationRequirement;
use super::text::{count_words, detect_truncation};
use crate::completion::{Completer, CompletionRequest};
use crate::error::ReconstructError;
use crate::parser::parse_lenient;
use crate::retry::{RetryOutcome, RetryPolicy, Step};

const RECONSTRUCT_PROMPT: &str = include_str!("../../prompts/reconstruct.md");

pub const DELTA_MARKER: &str = "===DELTA===";
const TEXT_MARKERS: &[&str] = &["===RECONSTRUCTED_TEXT===", "===TEXT===", "===OUTPUT==="];

const MIN_CHUNK_TARGET: usize = 50;
const MAX_CHUNK_TARGET: usize = 2000;
const BAND_FLOOR: f64 = 0.85;
const BAND_CEILING: f64 = 1.15;
/// Below this share of the original target the job cannot recover
const CATASTROPHIC_SHARE: f64 = 0.5;

/// Author-supplied steering carried on the job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Guidance {
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub rigor: Option<String>,
}

/// Word band a single attempt must land in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChunkBand {
    pub target: usize,
    pub min: usize,
    pub max: usize,
}

impl ChunkBand {
    pub fn for_input(input_words: usize, ratio: f64) -> Self {
        let target = ((input_words as f64 * ratio).round() as usize)
            .clamp(MIN_CHUNK_TARGET, MAX_CHUNK_TARGET);
        Self::around(target)
    }

    fn around(target: usize) -> Self {
        Self {
            target,
            min: (target as f64 * BAND_FLOOR).round() as usize,
            max: (target as f64 * BAND_CEILING).round() as usize,
        }
    }

    pub fn contains(&self, words: usize) -> bool {
        words >= self.min && words <= self.max
    }
}

/// What the chunk writer reports about its own output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChunkDelta {
    #[serde(default)]
    pub new_claims: Vec<String>,
    #[serde(default)]
    pub terms_used: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub ledger_additions: Vec<Commitment>,
}

impl ChunkDelta {
    pub fn is_empty(&self) -> bool {
        self.new_claims.is_empty()
            && self.terms_used.is_empty()
            && self.conflicts.is_empty()
            && self.ledger_additions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReconstruction {
    pub output_text: String,
    pub delta: ChunkDelta,
    pub word_count: usize,
    /// Band computed before any retry narrowing
    pub band: ChunkBand,
    pub attempts: u32,
    /// Accepted outside the original band
    pub flagged: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkInput<'a> {
    pub text: &'a str,
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct ReconstructSettings {
    pub max_attempts: u32,
    pub temperature: f32,
}

#[derive(Debug)]
struct Attempt {
    prose: String,
    delta: ChunkDelta,
    words: usize,
}

/// Retry policy whose escalation moves the target a third of the way back to `baseline`
pub fn narrowing_policy(baseline: usize, max_attempts: u32) -> RetryPolicy<ChunkBand> {
    RetryPolicy::new(max_attempts, move |band: &ChunkBand| {
        let current = band.target as f64;
        let next = current + (baseline as f64 - current) / 3.0;
        ChunkBand::around((next.round() as usize).clamp(MIN_CHUNK_TARGET, MAX_CHUNK_TARGET))
    })
}

pub async fn reconstruct_chunk(
    completer: &Completer,
    input: &ChunkInput<'_>,
    skeleton: &GlobalSkeleton,
    length: &LengthConfig,
    guidance: &Guidance,
    settings: &ReconstructSettings,
) -> Result<ChunkReconstruction, ReconstructError> {
    let input_words = count_words(input.text);
    let band = ChunkBand::for_input(input_words, length.ratio);
    let policy = narrowing_policy(input_words, settings.max_attempts);
    let last_rejection: Mutex<Option<String>> = Mutex::new(None);

    debug!(
        "Chunk {}/{}: {} input words, target {} [{}, {}]",
        input.index + 1,
        input.total,
        input_words,
        band.target,
        band.min,
        band.max
    );

    let outcome = policy
        .run(band, |attempt_band, attempt| {
            let rejection = last_rejection.lock().ok().and_then(|r| r.clone());
            let prompt = build_prompt(
                input,
                input_words,
                &attempt_band,
                skeleton,
                length.mode,
                guidance,
                rejection.as_deref().map(|reason| (attempt, reason)),
            );
            let last_rejection = &last_rejection;
            async move {
                let raw = completer
                    .complete(CompletionRequest::new(
                        prompt,
                        token_budget(attempt_band.max),
                        settings.temperature,
                    ))
                    .await
                    .map_err(|source| ReconstructError::Completion {
                        index: input.index,
                        source,
                    })?;

                let (prose, delta) = split_response(&raw);
                let words = count_words(&prose);
                let rejection = match detect_truncation(&prose) {
                    Some(signal) => Some(format!("the output {}", signal)),
                    None if words < attempt_band.min => Some(format!(
                        "the output had {} words, below the minimum of {}",
                        words, attempt_band.min
                    )),
                    None => None,
                };

                let result = Attempt {
                    prose,
                    delta,
                    words,
                };
                match rejection {
                    None => Ok(Step::Accept(result)),
                    Some(reason) => {
                        warn!(
                            "Chunk {} attempt {} rejected: {}",
                            input.index + 1,
                            attempt,
                            reason
                        );
                        if let Ok(mut slot) = last_rejection.lock() {
                            *slot = Some(reason);
                        }
                        Ok(Step::Retry(result))
                    }
                }
            }
        })
        .await?;

    let attempts = outcome.attempts();
    let accepted = match outcome {
        RetryOutcome::Accepted { value, .. } => value,
        RetryOutcome::Exhausted { last, .. } => {
            if (last.words as f64) < band.target as f64 * CATASTROPHIC_SHARE {
                return Err(ReconstructError::CatastrophicShortfall {
                    index: input.index,
                    actual: last.words,
                    target: band.target,
                    attempts,
                });
            }
            last
        }
    };

    let flagged = !band.contains(accepted.words);
    if flagged {
        warn!(
            "Chunk {} accepted at {} words, outside [{}, {}]",
            input.index + 1,
            accepted.words,
            band.min,
            band.max
        );
    } else {
        info!(
            "Chunk {}/{} done: {} words in {} attempt(s)",
            input.index + 1,
            input.total,
            accepted.words,
            attempts
        );
    }

    Ok(ChunkReconstruction {
        output_text: accepted.prose,
        delta: accepted.delta,
        word_count: accepted.words,
        band,
        attempts,
        flagged,
    })
}

/// Room for the prose at its ceiling plus the delta report
fn token_budget(max_words: usize) -> u32 {
    (max_words as u32).saturating_mul(2).saturating_add(500)
}

fn build_prompt(
    input: &ChunkInput<'_>,
    input_words: usize,
    band: &ChunkBand,
    skeleton: &GlobalSkeleton,
    mode: LengthMode,
    guidance: &Guidance,
    retry: Option<(u32, &str)>,
) -> String {
    let outline = skeleton
        .outline_slice(input.index, input.total)
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n");

    let retry_notice = match retry {
        Some((attempt, reason)) => format!(
            "\n**RETRY (attempt {}):** the previous attempt was rejected because {}. \
             Stay within {} to {} words this time and finish every sentence.\n",
            attempt, reason, band.min, band.max
        ),
        None => String::new(),
    };

    RECONSTRUCT_PROMPT
        .replace("{{CHUNK_NUMBER}}", &(input.index + 1).to_string())
        .replace("{{TOTAL_CHUNKS}}", &input.total.to_string())
        .replace("{{RETRY_NOTICE}}", &retry_notice)
        .replace("{{INPUT_WORDS}}", &input_words.to_string())
        .replace("{{MIN_WORDS}}", &band.min.to_string())
        .replace("{{MAX_WORDS}}", &band.max.to_string())
        .replace("{{TARGET_WORDS}}", &band.target.to_string())
        .replace("{{MODE}}", &mode.to_string())
        .replace("{{STRATEGY}}", strategy(mode))
        .replace("{{THESIS}}", &skeleton.thesis)
        .replace("{{OUTLINE_SLICE}}", &outline)
        .replace("{{KEY_TERMS}}", &skeleton.render_key_terms())
        .replace("{{COMMITMENTS}}", &skeleton.render_commitments())
        .replace("{{ENTITIES}}", &skeleton.render_entities())
        .replace("{{GUIDANCE}}", &render_guidance(guidance, skeleton))
        .replace("{{SOURCE}}", input.text)
}

fn strategy(mode: LengthMode) -> &'static str {
    match mode {
        LengthMode::HeavyCompression => {
            "- Keep every distinct claim but state each one once, in its tightest form.\n\
             - Drop all but the single strongest supporting example per claim.\n\
             - Remove asides, restatements, rhetorical questions, and transitional padding.\n\
             - Merge paragraphs that make the same move."
        }
        LengthMode::ModerateCompression => {
            "- Keep every claim and the best one or two examples for each.\n\
             - Cut repetition and hedging; shorten long quotations to their key phrase.\n\
             - Tighten sentences without changing what they assert."
        }
        LengthMode::Maintain => {
            "- Keep the length close to the source.\n\
             - Improve clarity, flow, and precision sentence by sentence.\n\
             - Do not add new material or remove existing claims."
        }
        LengthMode::ModerateExpansion => {
            "- Keep every claim and develop each one further.\n\
             - Add a concrete example or illustration where the source only asserts.\n\
             - Make implicit reasoning steps explicit.\n\
             - Add transitions that connect this section to the thesis."
        }
        LengthMode::HeavyExpansion => {
            "- Treat each claim as the seed of a full paragraph.\n\
             - Add worked examples, counterarguments with replies, and the evidence each step relies on.\n\
             - Explain every key term the first time this section uses it.\n\
             - Spell out consequences the source leaves to the reader.\n\
             - Never introduce claims that contradict the commitment ledger."
        }
    }
}

fn render_guidance(guidance: &Guidance, skeleton: &GlobalSkeleton) -> String {
    let mut lines = Vec::new();
    if let Some(custom) = guidance.custom_instructions.as_deref().filter(|s| !s.trim().is_empty()) {
        lines.push(format!("- Author instructions: {}", custom.trim()));
    }
    if let Some(audience) = guidance.audience.as_deref().filter(|s| !s.trim().is_empty()) {
        lines.push(format!("- Write for this audience: {}", audience.trim()));
    }
    if let Some(rigor) = guidance.rigor.as_deref().filter(|s| !s.trim().is_empty()) {
        lines.push(format!("- Level of rigor: {}", rigor.trim()));
    }

    let instructions = &skeleton.instructions;
    if instructions.preserves(PreservationRequirement::Terminology) {
        lines.push("- Keep the source's terminology; do not substitute synonyms for key terms.".to_string());
    }
    if instructions.preserves(PreservationRequirement::Citations) {
        lines.push("- Keep every citation and reference exactly as written.".to_string());
    }
    if instructions.preserves(PreservationRequirement::ChapterStructure) {
        lines.push("- Keep any chapter or section headings in this section unchanged.".to_string());
    }

    if lines.is_empty() {
        "- Preserve the voice and register of the source.".to_string()
    } else {
        lines.join("\n")
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawDelta {
    #[serde(default, alias = "newClaims")]
    new_claims: Vec<serde_json::Value>,
    #[serde(default, alias = "termsUsed")]
    terms_used: Vec<serde_json::Value>,
    #[serde(default, alias = "conflictsDetected", alias = "conflicts_detected")]
    conflicts: Vec<serde_json::Value>,
    #[serde(default, alias = "ledgerAdditions", alias = "newLedgerEntries")]
    ledger_additions: Vec<serde_json::Value>,
}

/// Split a raw chunk response into prose and its delta report
pub fn split_response(raw: &str) -> (String, ChunkDelta) {
    let (prose, delta_raw) = match raw.rfind(DELTA_MARKER) {
        Some(pos) => (&raw[..pos], Some(&raw[pos + DELTA_MARKER.len()..])),
        None => (raw, None),
    };

    let mut prose = prose.trim();
    for marker in TEXT_MARKERS {
        if let Some(rest) = prose.strip_prefix(marker) {
            prose = rest.trim_start();
        }
    }

    let delta = match delta_raw.and_then(parse_lenient::<RawDelta>) {
        Some(raw) => ChunkDelta {
            new_claims: stringify(raw.new_claims),
            terms_used: stringify(raw.terms_used),
            conflicts: stringify(raw.conflicts),
            ledger_additions: raw
                .ledger_additions
                .into_iter()
                .filter_map(ledger_entry)
                .collect(),
        },
        None => {
            if delta_raw.is_some() {
                debug!("Unparsable delta report, using an empty delta");
            }
            ChunkDelta::default()
        }
    };

    (prose.to_string(), delta)
}

fn stringify(values: Vec<serde_json::Value>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .filter(|s| !s.trim().is_empty())
        .collect()
}

fn ledger_entry(value: serde_json::Value) -> Option<Commitment> {
    match value {
        serde_json::Value::String(claim) => Some(Commitment {
            kind: CommitmentKind::Asserts,
            claim,
        }),
        serde_json::Value::Object(map) => {
            let claim = map
                .get("claim")
                .or_else(|| map.get("statement"))
                .and_then(|v| v.as_str())?
                .to_string();
            let kind = map
                .get("kind")
                .or_else(|| map.get("type"))
                .and_then(|v| v.as_str());
            Some(Commitment {
                kind: CommitmentKind::parse(kind),
                claim,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompletionError;
    use crate::pipeline::instructions::UserInstructions;
    use crate::pipeline::length::calculate_length_config;
    use crate::provider::scripted::{filler, Scripted, ScriptedProvider};
    use crate::provider::StopReason;
    use std::sync::Arc;

    fn skeleton() -> GlobalSkeleton {
        let mut s = GlobalSkeleton::degraded(UserInstructions::default());
        s.thesis = "Rules outlast rulers.".to_string();
        s.outline = (1..=8).map(|i| format!("Point {}", i)).collect();
        s
    }

    fn settings() -> ReconstructSettings {
        ReconstructSettings {
            max_attempts: 3,
            temperature: 0.7,
        }
    }

    fn length_for(ratio: f64) -> LengthConfig {
        let mut config = calculate_length_config(4000, None, None);
        config.ratio = ratio;
        config.mode = LengthMode::from_ratio(ratio);
        config
    }

    async fn run(
        provider: Arc<ScriptedProvider>,
        input: &str,
        ratio: f64,
    ) -> Result<ChunkReconstruction, ReconstructError> {
        let completer = Completer::new(provider, None, 3);
        let chunk = ChunkInput {
            text: input,
            index: 0,
            total: 5,
        };
        reconstruct_chunk(
            &completer,
            &chunk,
            &skeleton(),
            &length_for(ratio),
            &Guidance::default(),
            &settings(),
        )
        .await
    }

    #[test]
    fn test_band_clamps() {
        assert_eq!(ChunkBand::for_input(800, 1.0), ChunkBand { target: 800, min: 680, max: 920 });
        assert_eq!(ChunkBand::for_input(60, 0.3).target, 50);
        assert_eq!(ChunkBand::for_input(1500, 2.0).target, 2000);
    }

    #[test]
    fn test_narrowing_moves_toward_baseline() {
        let policy = narrowing_policy(800, 3);
        let targets: Vec<usize> = policy
            .schedule(ChunkBand::for_input(800, 0.4))
            .iter()
            .map(|b| b.target)
            .collect();
        assert_eq!(targets, vec![320, 480, 587]);

        let expanding: Vec<usize> = narrowing_policy(800, 2)
            .schedule(ChunkBand::for_input(800, 1.9))
            .iter()
            .map(|b| b.target)
            .collect();
        assert_eq!(expanding, vec![1520, 1280]);
    }

    #[test]
    fn test_split_response_with_delta() {
        let raw = "===RECONSTRUCTED_TEXT===\nThe prose.\n\n===DELTA===\n{\"newClaims\": [\"c\"], \"ledger_additions\": [{\"type\": \"rejects\", \"claim\": \"x\"}, \"y\"]}";
        let (prose, delta) = split_response(raw);
        assert_eq!(prose, "The prose.");
        assert_eq!(delta.new_claims, vec!["c"]);
        assert_eq!(delta.ledger_additions.len(), 2);
        assert_eq!(delta.ledger_additions[0].kind, CommitmentKind::Rejects);
    }

    #[test]
    fn test_split_response_without_delta() {
        let (prose, delta) = split_response("Just prose.");
        assert_eq!(prose, "Just prose.");
        assert!(delta.is_empty());

        let (_, delta) = split_response("Prose.\n===DELTA===\nnot json");
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn test_on_target_first_attempt() {
        let provider = Arc::new(ScriptedProvider::new());
        let result = run(provider.clone(), &filler(800), 1.0).await.unwrap();

        assert_eq!(result.word_count, 800);
        assert_eq!(result.attempts, 1);
        assert!(!result.flagged);
        assert_eq!(result.delta.new_claims, vec!["claim 1"]);
        assert_eq!(provider.calls(), 1);

        let (prompt, budget) = &provider.prompts()[0];
        assert!(prompt.contains("between 680 and 920 words"));
        assert!(prompt.contains("Point 1"));
        assert!(!prompt.contains("RETRY"));
        assert_eq!(*budget, 920 * 2 + 500);
    }

    #[tokio::test]
    async fn test_compression_uses_ratio() {
        let provider = Arc::new(ScriptedProvider::new());
        let result = run(provider.clone(), &filler(800), 0.4).await.unwrap();
        assert_eq!(result.band.target, 320);
        assert_eq!(result.word_count, 320);
        assert!(provider.prompts()[0].0.contains("heavy_compression"));
    }

    #[tokio::test]
    async fn test_truncated_output_is_retried_with_reason() {
        let provider = Arc::new(ScriptedProvider::new().with_queue(vec![Scripted::Text(
            "The argument rests on the\n\n===DELTA===\n{}".to_string(),
            StopReason::Normal,
        )]));
        let result = run(provider.clone(), &filler(800), 1.0).await.unwrap();

        assert_eq!(result.attempts, 2);
        assert_eq!(result.word_count, 800);
        let prompts = provider.prompts();
        assert!(prompts[1].0.contains("RETRY (attempt 2)"));
        assert!(prompts[1].0.contains("ends with the word 'the'"));
    }

    #[tokio::test]
    async fn test_short_output_accepted_flagged_after_retries() {
        let provider = Arc::new(ScriptedProvider::new().with_chunk_scale(0.7));
        let result = run(provider.clone(), &filler(800), 1.0).await.unwrap();

        assert_eq!(result.attempts, 3);
        assert_eq!(result.word_count, 560);
        assert!(result.flagged);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_catastrophic_shortfall_fails() {
        let provider = Arc::new(ScriptedProvider::new().with_chunk_scale(0.3));
        let err = run(provider, &filler(800), 1.0).await.unwrap_err();
        assert!(matches!(
            err,
            ReconstructError::CatastrophicShortfall {
                index: 0,
                actual: 240,
                target: 800,
                attempts: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_completion_error_carries_chunk_index() {
        let provider = Arc::new(ScriptedProvider::new().failing(|| {
            crate::error::ProviderError::Http {
                status: 400,
                body: "bad".into(),
            }
        }));
        let err = run(provider, &filler(800), 1.0).await.unwrap_err();
        assert!(matches!(
            err,
            ReconstructError::Completion {
                index: 0,
                source: CompletionError::Provider(_)
            }
        ));
    }
}
