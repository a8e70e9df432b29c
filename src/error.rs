use crate::jobs::JobStatus;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid limits: minimum input words ({min}) must be below maximum ({max})")]
    InvalidLimits { min: usize, max: usize },

    #[error("Invalid setting '{field}': {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("Environment variable '{0}' with the provider API key is not set")]
    MissingApiKey(String),
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider rate limited the request: {0}")]
    RateLimited(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Model or endpoint not found: {0}")]
    NotFound(String),

    #[error("Provider returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Failed to decode provider response: {0}")]
    Decode(String),

    #[error("Provider response contained no text")]
    EmptyResponse,

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

impl ProviderError {
    /// Failures that warrant a one-time switch to the fallback provider
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Unavailable(_)
                | ProviderError::NotFound(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Output still truncated at the model ceiling of {ceiling} tokens")]
    TruncatedAtCeiling { ceiling: u32 },

    #[error("Output still truncated after {attempts} budget escalations")]
    Truncated { attempts: u32 },
}

#[derive(Error, Debug)]
pub enum ReconstructError {
    #[error("Completion failed for chunk {index}: {source}")]
    Completion {
        index: usize,
        #[source]
        source: CompletionError,
    },

    #[error(
        "Catastrophic shortfall on chunk {index}: {actual} words against a target of {target} \
         after {attempts} attempts"
    )]
    CatastrophicShortfall {
        index: usize,
        actual: usize,
        target: usize,
        attempts: u32,
    },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error at '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Job '{0}' already exists")]
    AlreadyExists(String),

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Input is too short for chunked reconstruction ({words} words, minimum {min}); use a single-call rewrite instead")]
    TooShort { words: usize, min: usize },

    #[error("Input exceeds maximum of {max} words ({words} words)")]
    TooLong { words: usize, max: usize },

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Job '{job_id}' is not abortable in {status}")]
    NotAbortable { job_id: String, status: JobStatus },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("{0}")]
    Reconstruct(#[from] ReconstructError),

    #[error("Final validation failed: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid bind address '{addr}': {source}")]
    BindAddress {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
