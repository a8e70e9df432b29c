//! Progress events pushed to subscribers of a job

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::JobStatus;
use crate::pipeline::{FinalValidation, LengthMode, StitchResult};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOutcome {
    OnTarget,
    Flagged,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobEvent {
    JobStarted {
        total_chunks: usize,
        word_count: usize,
        target_words: usize,
        target_min: usize,
        target_max: usize,
        mode: LengthMode,
        resumed: bool,
    },
    ChunkComplete {
        chunk_index: usize,
        total_chunks: usize,
        chunk_text: String,
        actual_words: usize,
        target_words: usize,
        min_words: usize,
        max_words: usize,
        running_total: usize,
        projected_final: usize,
        status: ChunkOutcome,
    },
    Progress {
        phase: JobStatus,
        message: String,
        completed_chunks: usize,
        total_chunks: usize,
        words_processed: usize,
        target_words: usize,
        projected_final: usize,
        time_elapsed: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_remaining: Option<u64>,
    },
    Warning {
        message: String,
        projected_final: usize,
        target_words: usize,
        shortfall: f64,
    },
    JobComplete {
        final_output: String,
        final_word_count: usize,
        stitch_result: StitchResult,
        validation: FinalValidation,
    },
    JobAborted {
        completed_chunks: usize,
        total_chunks: usize,
        partial_output: String,
        word_count: usize,
    },
    JobFailed {
        error: String,
    },
}

impl JobEvent {
    /// Whether the job task emits nothing after this event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::JobComplete { .. } | JobEvent::JobAborted { .. } | JobEvent::JobFailed { .. }
        )
    }
}

/// Event addressed to one job, as sent over the wire
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_id: String,
    #[serde(flatten)]
    pub event: JobEvent,
}

/// Per-job broadcast channels
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<JobUpdate>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<JobUpdate> {
        let mut channels = match self.channels.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Join a job's channel only if its driving task still holds it open
    pub fn subscribe_existing(&self, job_id: &str) -> Option<broadcast::Receiver<JobUpdate>> {
        let channels = self.channels.lock().ok()?;
        channels.get(job_id).map(broadcast::Sender::subscribe)
    }

    pub fn publish(&self, job_id: &str, event: JobEvent) {
        let Ok(channels) = self.channels.lock() else {
            return;
        };
        if let Some(sender) = channels.get(job_id) {
            let update = JobUpdate {
                job_id: job_id.to_string(),
                event,
            };
            if sender.send(update).is_err() {
                debug!("No live subscribers for job {}", job_id);
            }
        }
    }

    /// Drop the channel; receivers see `Closed` once they drain buffered events
    pub fn close(&self, job_id: &str) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(job_id);
        }
    }
}
