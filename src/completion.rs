//! Single chokepoint for model calls: token-budget escalation and provider fallback

use crate::error::{CompletionError, ProviderError};
use crate::pipeline::text::detect_truncation;
use crate::provider::{CompletionProvider, ProviderOutput, StopReason};
use crate::retry::{RetryOutcome, RetryPolicy, Step};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Run the prose truncation heuristics on normally-stopped output
    pub check_prose: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: u32, temperature: f32) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens,
            temperature,
            check_prose: false,
        }
    }

    pub fn with_prose_check(mut self) -> Self {
        self.check_prose = true;
        self
    }
}

pub struct Completer {
    primary: Arc<dyn CompletionProvider>,
    fallback: Option<Arc<dyn CompletionProvider>>,
    max_escalations: u32,
    calls: AtomicU64,
}

impl Completer {
    pub fn new(
        primary: Arc<dyn CompletionProvider>,
        fallback: Option<Arc<dyn CompletionProvider>>,
        max_escalations: u32,
    ) -> Self {
        Self {
            primary,
            fallback,
            max_escalations,
            calls: AtomicU64::new(0),
        }
    }

    /// Output ceiling of the primary provider; escalation stops here
    pub fn ceiling(&self) -> u32 {
        self.primary.max_output_tokens()
    }

    /// Provider calls issued so far, fallbacks included
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        let ceiling = self.ceiling();
        let initial = request.max_tokens.clamp(1, ceiling.max(1));
        let policy = RetryPolicy::new(self.max_escalations + 1, move |budget: &u32| {
            budget.saturating_mul(2).min(ceiling)
        });

        let prompt = request.prompt.as_str();
        let temperature = request.temperature;

        let outcome = policy
            .run(initial, |budget, attempt| async move {
                let output = self.call(prompt, budget, temperature).await?;
                match output.stop_reason {
                    StopReason::Normal => Ok(Step::Accept(output.text)),
                    StopReason::Length if budget >= ceiling => {
                        Err(CompletionError::TruncatedAtCeiling { ceiling })
                    }
                    StopReason::Length => {
                        warn!(
                            "Output hit the {} token budget on attempt {}, doubling",
                            budget, attempt
                        );
                        Ok(Step::Retry(output.text))
                    }
                }
            })
            .await?;

        let (text, budget, attempts) = match outcome {
            RetryOutcome::Accepted {
                value,
                state,
                attempts,
            } => (value, state, attempts),
            RetryOutcome::Exhausted { attempts, .. } => {
                return Err(CompletionError::Truncated { attempts });
            }
        };

        if !request.check_prose {
            return Ok(text);
        }
        let Some(signal) = detect_truncation(&text) else {
            return Ok(text);
        };

        if budget >= ceiling {
            debug!("Prose {} but budget is already at the ceiling", signal);
            return Ok(text);
        }

        let raised = budget.saturating_mul(2).min(ceiling);
        warn!("Output {}, retrying once with {} tokens", signal, raised);
        let output = self.call(prompt, raised, temperature).await?;
        match output.stop_reason {
            StopReason::Normal => Ok(output.text),
            StopReason::Length if raised >= ceiling => {
                Err(CompletionError::TruncatedAtCeiling { ceiling })
            }
            StopReason::Length => Err(CompletionError::Truncated {
                attempts: attempts + 1,
            }),
        }
    }

    /// One provider call with a one-time fallback on transient failures
    async fn call(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<ProviderOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Calling {} with {} tokens ({} prompt chars)",
            self.primary.name(),
            max_tokens,
            prompt.len()
        );

        match self.primary.complete(prompt, max_tokens, temperature).await {
            Ok(output) => Ok(output),
            Err(e) if e.is_transient() => match &self.fallback {
                Some(fallback) => {
                    warn!(
                        "{} failed ({}), falling back to {}",
                        self.primary.name(),
                        e,
                        fallback.name()
                    );
                    self.calls.fetch_add(1, Ordering::Relaxed);
                    let budget = max_tokens.min(fallback.max_output_tokens());
                    fallback.complete(prompt, budget, temperature).await
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }
}
