use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bounded retry with an escalation function applied to the per-attempt state.
///
/// The state is whatever the operation tunes between attempts: a token budget
/// that doubles, a word target that narrows back toward its baseline, and so on.
pub struct RetryPolicy<S> {
    max_attempts: u32,
    escalate: Arc<dyn Fn(&S) -> S + Send + Sync>,
}

impl<S> Clone for RetryPolicy<S> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            escalate: self.escalate.clone(),
        }
    }
}

/// Verdict of a single attempt
#[derive(Debug)]
pub enum Step<T> {
    Accept(T),
    /// Rejected, but the value is kept in case every attempt is rejected
    Retry(T),
}

#[derive(Debug)]
pub enum RetryOutcome<T, S> {
    Accepted { value: T, state: S, attempts: u32 },
    Exhausted { last: T, state: S, attempts: u32 },
}

impl<T, S> RetryOutcome<T, S> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Accepted { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

impl<S: Clone> RetryPolicy<S> {
    pub fn new(max_attempts: u32, escalate: impl Fn(&S) -> S + Send + Sync + 'static) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            escalate: Arc::new(escalate),
        }
    }

    pub fn escalate(&self, state: &S) -> S {
        (self.escalate)(state)
    }

    /// States each attempt would run with if every attempt were rejected
    pub fn schedule(&self, initial: S) -> Vec<S> {
        let mut states = Vec::with_capacity(self.max_attempts as usize);
        let mut current = initial;
        for attempt in 1..=self.max_attempts {
            if attempt < self.max_attempts {
                let next = self.escalate(&current);
                states.push(current);
                current = next;
            } else {
                states.push(current.clone());
            }
        }
        states
    }

    /// Run `operation` until it accepts or attempts run out.
    ///
    /// Errors from the operation are hard failures and end the loop immediately.
    pub async fn run<T, E, F, Fut>(
        &self,
        initial: S,
        mut operation: F,
    ) -> Result<RetryOutcome<T, S>, E>
    where
        F: FnMut(S, u32) -> Fut,
        Fut: Future<Output = Result<Step<T>, E>>,
    {
        let mut state = initial;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation(state.clone(), attempt).await? {
                Step::Accept(value) => {
                    debug!("Attempt {} accepted", attempt);
                    return Ok(RetryOutcome::Accepted {
                        value,
                        state,
                        attempts: attempt,
                    });
                }
                Step::Retry(last) if attempt >= self.max_attempts => {
                    warn!("All {} attempts rejected", attempt);
                    return Ok(RetryOutcome::Exhausted {
                        last,
                        state,
                        attempts: attempt,
                    });
                }
                Step::Retry(_) => {
                    debug!("Attempt {} rejected, escalating", attempt);
                    state = self.escalate(&state);
                }
            }
        }
    }
}
