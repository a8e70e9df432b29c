use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::pipeline::{
    ChunkBand, ChunkDelta, FinalValidation, GlobalSkeleton, Guidance, LengthConfig, StitchResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    SkeletonExtraction,
    ChunkProcessing,
    Stitching,
    Complete,
    Aborted,
    Failed,
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, SkeletonExtraction | Aborted | Failed)
                | (SkeletonExtraction, ChunkProcessing | Aborted | Failed)
                | (ChunkProcessing, Stitching | Aborted | Failed)
                | (Stitching, Complete | Failed)
                | (Aborted | Failed, SkeletonExtraction | ChunkProcessing)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Aborted | JobStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::SkeletonExtraction => "skeleton_extraction",
            JobStatus::ChunkProcessing => "chunk_processing",
            JobStatus::Stitching => "stitching",
            JobStatus::Complete => "complete",
            JobStatus::Aborted => "aborted",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentJob {
    pub id: String,
    pub original_text: String,
    pub word_count: usize,
    pub status: JobStatus,
    pub length: LengthConfig,
    pub chunk_count: usize,
    pub current_chunk_index: usize,
    #[serde(default)]
    pub guidance: Guidance,
    #[serde(default)]
    pub skeleton: Option<GlobalSkeleton>,
    #[serde(default)]
    pub final_output: Option<String>,
    #[serde(default)]
    pub final_word_count: Option<usize>,
    #[serde(default)]
    pub validation: Option<FinalValidation>,
    #[serde(default)]
    pub stitch_result: Option<StitchResult>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DocumentJob {
    pub fn new(
        text: String,
        word_count: usize,
        length: LengthConfig,
        chunk_count: usize,
        guidance: Guidance,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            original_text: text,
            word_count,
            status: JobStatus::Pending,
            length,
            chunk_count,
            current_chunk_index: 0,
            guidance,
            skeleton: None,
            final_output: None,
            final_word_count: None,
            validation: None,
            stitch_result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `next`, rejecting transitions outside the table. Same-state moves are no-ops.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), StoreError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next == JobStatus::Complete {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub job_id: String,
    pub index: usize,
    pub input_text: String,
    pub input_words: usize,
    pub target_words: usize,
    pub min_words: usize,
    pub max_words: usize,
    #[serde(default)]
    pub output_text: Option<String>,
    #[serde(default)]
    pub actual_words: Option<usize>,
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    pub status: ChunkStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChunkRecord {
    pub fn new(job_id: &str, index: usize, input_text: String, input_words: usize, band: ChunkBand) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}-{}", job_id, index),
            job_id: job_id.to_string(),
            index,
            input_text,
            input_words,
            target_words: band.target,
            min_words: band.min,
            max_words: band.max,
            output_text: None,
            actual_words: None,
            delta: None,
            status: ChunkStatus::Pending,
            attempts: 0,
            flagged: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ChunkStatus::Complete
    }
}

/// Read-only view of a job for status queries
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub words_so_far: usize,
    pub target_words: usize,
    /// Whether a task is currently driving the job
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_word_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
