mod defaults;
mod types;

pub use types::*;

use crate::error::ConfigError;
use defaults::*;
use std::path::Path;
use tracing::info;

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            store_dir: default_store_dir(),
            providers: ProvidersConfig::default(),
            limits: LimitsConfig::default(),
            chunking: ChunkingConfig::default(),
            pipeline: PipelineConfig::default(),
            completion: CompletionConfig::default(),
            progress: ProgressConfig::default(),
            retention: RetentionConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load config, falling back to built-in defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Validate the config
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.min_input_words >= self.limits.max_input_words {
            return Err(ConfigError::InvalidLimits {
                min: self.limits.min_input_words,
                max: self.limits.max_input_words,
            });
        }

        if self.chunking.target_words == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "chunking.target_words",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.pipeline.max_chunk_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "pipeline.max_chunk_attempts",
                reason: "at least one attempt is required".to_string(),
            });
        }

        if self.progress.shortfall_check_interval == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "progress.shortfall_check_interval",
                reason: "must be greater than zero".to_string(),
            });
        }

        for (field, provider) in std::iter::once(("providers.primary", &self.providers.primary))
            .chain(
                self.providers
                    .fallback
                    .iter()
                    .map(|p| ("providers.fallback", p)),
            )
        {
            if provider.model.trim().is_empty() {
                return Err(ConfigError::InvalidSetting {
                    field,
                    reason: "model must not be empty".to_string(),
                });
            }
            if provider.max_output_tokens == 0 {
                return Err(ConfigError::InvalidSetting {
                    field,
                    reason: "max_output_tokens must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }
}
