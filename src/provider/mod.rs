mod anthropic;
mod openai;
#[cfg(test)]
pub mod scripted;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{ConfigError, ProviderError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Normal,
    /// Output hit the token budget
    Length,
}

#[derive(Debug)]
pub struct ProviderOutput {
    pub text: String,
    pub stop_reason: StopReason,
    pub duration: Duration,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Largest output budget the model accepts
    fn max_output_tokens(&self) -> u32;

    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<ProviderOutput, ProviderError>;
}

/// Build a provider from its config, reading the API key from the environment
pub fn create_provider(
    config: &ProviderConfig,
) -> Result<Arc<dyn CompletionProvider>, ConfigError> {
    let api_key = std::env::var(&config.api_key_env)
        .ok()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingApiKey(config.api_key_env.clone()))?;

    let provider: Arc<dyn CompletionProvider> = match config.kind {
        ProviderKind::Anthropic => Arc::new(
            AnthropicProvider::new(api_key, config)
                .map_err(|e| ConfigError::InvalidSetting {
                    field: "providers",
                    reason: e.to_string(),
                })?,
        ),
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(api_key, config).map_err(|e| {
            ConfigError::InvalidSetting {
                field: "providers",
                reason: e.to_string(),
            }
        })?),
    };
    Ok(provider)
}

/// Map an HTTP failure status onto the provider error taxonomy
pub(crate) fn classify_status(status: u16, body: String) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited(body),
        502 | 503 | 529 => ProviderError::Unavailable(body),
        404 => ProviderError::NotFound(body),
        _ => ProviderError::Http { status, body },
    }
}

pub(crate) fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_connect() || err.is_timeout() {
        ProviderError::Unavailable(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16(), err.to_string())
    } else {
        ProviderError::Http {
            status: 0,
            body: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(429, "slow down".into()),
            ProviderError::RateLimited(_)
        ));
        assert!(classify_status(529, String::new()).is_transient());
        assert!(classify_status(404, String::new()).is_transient());
        assert!(!classify_status(400, String::new()).is_transient());
        assert!(!classify_status(401, String::new()).is_transient());
    }

    #[test]
    fn test_missing_api_key() {
        let config = ProviderConfig {
            api_key_env: "REDRAFT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..ProviderConfig::default()
        };
        let err = create_provider(&config).err().unwrap();
        assert!(matches!(err, ConfigError::MissingApiKey(name) if name.contains("NEVER_SET")));
    }
}
