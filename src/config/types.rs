use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::defaults::*;

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding persisted jobs and chunks
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub completion: CompletionConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub primary: ProviderConfig,

    /// Used once per call when the primary fails with a transient error
    #[serde(default)]
    pub fallback: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    #[serde(default = "default_primary_model")]
    pub model: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_anthropic_key_env")]
    pub api_key_env: String,

    #[serde(default)]
    pub base_url: Option<String>,

    /// Model output ceiling; token escalation never goes above it
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            model: default_primary_model(),
            api_key_env: default_anthropic_key_env(),
            base_url: None,
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    #[serde(alias = "openai")]
    OpenAi,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::OpenAi => write!(f, "open_ai"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct LimitsConfig {
    #[serde(default = "default_max_input_words")]
    pub max_input_words: usize,

    /// Below this the caller is pointed at a single-call rewrite
    #[serde(default = "default_min_input_words")]
    pub min_input_words: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_input_words: default_max_input_words(),
            min_input_words: default_min_input_words(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_target_words")]
    pub target_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_words: default_chunk_target_words(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct PipelineConfig {
    #[serde(default = "default_max_chunk_attempts")]
    pub max_chunk_attempts: u32,

    #[serde(default = "default_inter_chunk_delay_ms")]
    pub inter_chunk_delay_ms: u64,

    #[serde(default = "default_chunk_temperature")]
    pub chunk_temperature: f32,

    #[serde(default = "default_analysis_temperature")]
    pub analysis_temperature: f32,

    /// Documents above this size get a chapter-boundary pass
    #[serde(default = "default_chapter_detection_words")]
    pub chapter_detection_words: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_chunk_attempts: default_max_chunk_attempts(),
            inter_chunk_delay_ms: default_inter_chunk_delay_ms(),
            chunk_temperature: default_chunk_temperature(),
            analysis_temperature: default_analysis_temperature(),
            chapter_detection_words: default_chapter_detection_words(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct CompletionConfig {
    #[serde(default = "default_max_escalations")]
    pub max_escalations: u32,

    /// Starting budget for analysis calls (skeleton, chapters, stitching)
    #[serde(default = "default_initial_analysis_tokens")]
    pub initial_analysis_tokens: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            max_escalations: default_max_escalations(),
            initial_analysis_tokens: default_initial_analysis_tokens(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ProgressConfig {
    #[serde(default = "default_shortfall_min_chunk_index")]
    pub shortfall_min_chunk_index: usize,

    #[serde(default = "default_shortfall_check_interval")]
    pub shortfall_check_interval: usize,

    /// Fraction below the target midpoint that triggers the warning
    #[serde(default = "default_shortfall_threshold")]
    pub shortfall_threshold: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            shortfall_min_chunk_index: default_shortfall_min_chunk_index(),
            shortfall_check_interval: default_shortfall_check_interval(),
            shortfall_threshold: default_shortfall_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,

    #[serde(default = "default_sweep_interval_minutes")]
    pub sweep_interval_minutes: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            sweep_interval_minutes: default_sweep_interval_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}
