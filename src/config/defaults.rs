use std::path::PathBuf;

pub fn default_version() -> u32 {
    1
}

pub fn default_store_dir() -> PathBuf {
    PathBuf::from(".redraft")
}

pub fn default_provider_kind() -> super::ProviderKind {
    super::ProviderKind::Anthropic
}

pub fn default_primary_model() -> String {
    "claude-sonnet-4-5".to_string()
}

pub fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

pub fn default_max_output_tokens() -> u32 {
    8192
}

pub fn default_max_input_words() -> usize {
    20_000
}

pub fn default_min_input_words() -> usize {
    1_000
}

pub fn default_chunk_target_words() -> usize {
    800
}

pub fn default_max_chunk_attempts() -> u32 {
    3
}

pub fn default_inter_chunk_delay_ms() -> u64 {
    2000
}

pub fn default_chunk_temperature() -> f32 {
    0.7
}

pub fn default_analysis_temperature() -> f32 {
    0.2
}

pub fn default_chapter_detection_words() -> usize {
    8_000
}

pub fn default_max_escalations() -> u32 {
    3
}

pub fn default_initial_analysis_tokens() -> u32 {
    4096
}

pub fn default_shortfall_min_chunk_index() -> usize {
    19
}

pub fn default_shortfall_check_interval() -> usize {
    10
}

pub fn default_shortfall_threshold() -> f64 {
    0.15
}

pub fn default_retention_hours() -> i64 {
    24
}

pub fn default_sweep_interval_minutes() -> u64 {
    60
}

pub fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}
