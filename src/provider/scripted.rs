//! Deterministic provider for tests: routes on the prompt template header

use super::{CompletionProvider, ProviderOutput, StopReason};
use crate::error::ProviderError;
use async_trait::async_trait;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const FILLER: [&str; 10] = [
    "The", "reconstructed", "passage", "keeps", "each", "claim", "in", "its", "place", "today.",
];

pub enum Scripted {
    Text(String, StopReason),
    Fail(ProviderError),
}

type ChunkHook = Box<dyn Fn(usize) + Send + Sync>;
type SkeletonHook = Box<dyn Fn() + Send + Sync>;

pub struct ScriptedProvider {
    name: String,
    ceiling: u32,
    queue: Mutex<VecDeque<Scripted>>,
    chunk_scale: f64,
    chunk_hook: Option<ChunkHook>,
    skeleton_hook: Option<SkeletonHook>,
    fail_always: Option<fn() -> ProviderError>,
    calls: AtomicUsize,
    chunk_calls: AtomicUsize,
    prompts: Mutex<Vec<(String, u32)>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            name: "scripted".to_string(),
            ceiling: 8192,
            queue: Mutex::new(VecDeque::new()),
            chunk_scale: 1.0,
            chunk_hook: None,
            skeleton_hook: None,
            fail_always: None,
            calls: AtomicUsize::new(0),
            chunk_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_ceiling(mut self, ceiling: u32) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Responses served in order before header routing kicks in
    pub fn with_queue(self, responses: Vec<Scripted>) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(responses);
        }
        self
    }

    /// Chunk rewrites come back at `target * scale` words
    pub fn with_chunk_scale(mut self, scale: f64) -> Self {
        self.chunk_scale = scale;
        self
    }

    /// Called with the 1-based chunk call number before each chunk rewrite returns
    pub fn with_chunk_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.chunk_hook = Some(Box::new(hook));
        self
    }

    /// Called before the skeleton extraction response returns
    pub fn with_skeleton_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.skeleton_hook = Some(Box::new(hook));
        self
    }

    pub fn failing(mut self, error: fn() -> ProviderError) -> Self {
        self.fail_always = Some(error);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn chunk_calls(&self) -> usize {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    /// Prompts received with their token budgets
    pub fn prompts(&self) -> Vec<(String, u32)> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn route(&self, prompt: &str) -> String {
        let header = prompt.lines().next().unwrap_or("");
        match header.trim() {
            "# Document Skeleton Extraction" => {
                if let Some(hook) = &self.skeleton_hook {
                    hook();
                }
                skeleton_response()
            }
            "# Chapter Boundary Detection" => {
                let words = capture_number(prompt, r"is (\d+) words long").unwrap_or(3000);
                chapters_response(words)
            }
            "# Chunk Reconstruction" => {
                let call = self.chunk_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(hook) = &self.chunk_hook {
                    hook(call);
                }
                let target = capture_number(prompt, r"Aim for (\d+) words").unwrap_or(100);
                let words = ((target as f64) * self.chunk_scale).round() as usize;
                format!(
                    "{}\n\n===DELTA===\n{{\"new_claims\": [\"claim {}\"], \"terms_used\": [\"ledger\"], \"conflicts\": [], \"ledger_additions\": []}}",
                    filler(words),
                    call
                )
            }
            "# Cross-Chunk Consistency Review" => {
                r#"{"contradictions": [], "terminology_drift": [], "missing_premises": [], "redundancies": [{"chunks": [1, 2], "description": "Restates the opening example."}], "repair_plan": []}"#.to_string()
            }
            "# New Section Drafting" => {
                let target = capture_number(prompt, r"about (\d+) words").unwrap_or(200);
                let lead = if prompt.contains("**Conclusion**") {
                    "In conclusion, each chapter builds the case, and future research should test it further."
                } else if prompt.contains("**Introduction**") {
                    "This introduction sets out the question the document answers."
                } else {
                    "In summary, the document makes one argument in several steps."
                };
                format!("{} {}", lead, filler(target.saturating_sub(15)))
            }
            _ => "Unrecognized prompt.".to_string(),
        }
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_output_tokens(&self) -> u32 {
        self.ceiling
    }

    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        _temperature: f32,
    ) -> Result<ProviderOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push((prompt.to_string(), max_tokens));
        }

        if let Some(error) = self.fail_always {
            return Err(error());
        }

        let queued = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        let (text, stop_reason) = match queued {
            Some(Scripted::Text(text, stop)) => (text, stop),
            Some(Scripted::Fail(err)) => return Err(err),
            None => (self.route(prompt), StopReason::Normal),
        };

        Ok(ProviderOutput {
            text,
            stop_reason,
            duration: Duration::from_millis(1),
        })
    }
}

/// `words` words of complete sentences
pub fn filler(words: usize) -> String {
    if words == 0 {
        return String::new();
    }
    let mut out: Vec<String> = (0..words)
        .map(|i| FILLER[i % FILLER.len()].to_string())
        .collect();
    if let Some(last) = out.last_mut() {
        if !last.ends_with('.') {
            last.push('.');
        }
    }
    out.join(" ")
}

fn capture_number(prompt: &str, pattern: &str) -> Option<usize> {
    Regex::new(pattern)
        .ok()?
        .captures(prompt)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

fn skeleton_response() -> String {
    r#"Here is the skeleton:

```json
{
  "outline": ["Problem", "Background", "Method", "Evidence", "Objections", "Replies", "Implications", "Limits"],
  "thesis": "Institutions shape outcomes more than individual choices do.",
  "keyTerms": {"institution": "a durable rule set", "ledger": "the record of commitments"},
  "commitmentLedger": [
    {"kind": "asserts", "claim": "Rules outlast the people who make them."},
    {"kind": "rejects", "claim": "Outcomes are purely individual."}
  ],
  "entities": [{"name": "North", "type": "person", "role": "source of the framework"}]
}
```"#
        .to_string()
}

fn chapters_response(words: usize) -> String {
    let third = words / 3;
    format!(
        r#"[
  {{"title": "Foundations", "thesis": "Rules come first.", "start_word": 0, "end_word": {a}}},
  {{"title": "Evidence", "thesis": "The record supports it.", "start_word": {a}, "end_word": {b}}},
  {{"title": "Stakes", "thesis": "It matters for policy.", "start_word": {b}, "end_word": {c}}}
]"#,
        a = third,
        b = third * 2,
        c = words
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::text::{count_words, detect_truncation};

    #[test]
    fn test_filler_is_complete_prose() {
        for words in [1, 9, 10, 23, 800] {
            let text = filler(words);
            assert_eq!(count_words(&text), words);
            assert_eq!(detect_truncation(&text), None, "{} words", words);
        }
    }
}
