use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{ChunkOutcome, EventHub, JobEvent, JobUpdate};
use super::registry::{JobHandle, JobRegistry};
use super::store::{FileStore, JobStore};
use super::types::{ChunkRecord, ChunkStatus, DocumentJob, JobSnapshot, JobStatus};
use crate::completion::Completer;
use crate::config::Config;
use crate::error::{ConfigError, JobError, StoreError};
use crate::pipeline::text::count_words;
use crate::pipeline::{
    calculate_length_config, extract_skeleton, generate_requested_additions, parse_target_length,
    reconstruct_chunk, smart_chunk, stitch_and_validate, validate_final_output, AnalysisSettings,
    ChunkBand, ChunkDelta, ChunkInput, GlobalSkeleton, Guidance, ReconstructSettings,
    SkeletonSettings, StitchChunk,
};
use crate::provider::create_provider;

/// A document submitted for reconstruction
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub text: String,
    pub instructions: Option<String>,
    pub audience: Option<String>,
    pub rigor: Option<String>,
}

#[derive(Debug)]
pub struct StartedJob {
    pub job_id: String,
    pub total_chunks: usize,
    pub events: broadcast::Receiver<JobUpdate>,
}

#[derive(Debug)]
pub enum ResumeOutcome {
    /// Already complete; served from the store without any completion call
    Cached(Box<DocumentJob>),
    Resumed(StartedJob),
}

/// Drives jobs through skeleton extraction, chunk reconstruction and stitching
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    completer: Arc<Completer>,
    store: Arc<dyn JobStore>,
    registry: JobRegistry,
    hub: EventHub,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, completer: Arc<Completer>, store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            completer,
            store,
            registry: JobRegistry::new(),
            hub: EventHub::new(),
        }
    }

    /// Wire providers and the file store from configuration
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        let primary = create_provider(&config.providers.primary)?;
        let fallback = config
            .providers
            .fallback
            .as_ref()
            .map(create_provider)
            .transpose()?;
        let completer = Completer::new(primary, fallback, config.completion.max_escalations);
        let store = FileStore::new(&config.store_dir);
        Ok(Self::new(Arc::new(config), Arc::new(completer), Arc::new(store)))
    }

    /// Event stream of a job that is still running; `None` once it has finished
    pub fn watch(&self, job_id: &str) -> Option<broadcast::Receiver<JobUpdate>> {
        self.hub.subscribe_existing(job_id)
    }

    /// Validate, plan, chunk and persist a new job, then start driving it.
    ///
    /// Inputs outside the configured word limits are rejected before anything is stored.
    pub async fn start_job(&self, request: JobRequest) -> Result<StartedJob, JobError> {
        let word_count = count_words(&request.text);
        let limits = &self.config.limits;
        if word_count > limits.max_input_words {
            return Err(JobError::TooLong {
                words: word_count,
                max: limits.max_input_words,
            });
        }
        if word_count < limits.min_input_words {
            return Err(JobError::TooShort {
                words: word_count,
                min: limits.min_input_words,
            });
        }

        let instructions = request.instructions.as_deref();
        let target = instructions.and_then(parse_target_length);
        let mut length = calculate_length_config(word_count, target, instructions);
        let pieces = smart_chunk(&request.text, self.config.chunking.target_words);
        length.chunk_target_words = length.per_chunk_target(pieces.len());

        let guidance = Guidance {
            custom_instructions: request.instructions,
            audience: request.audience,
            rigor: request.rigor,
        };
        let job = DocumentJob::new(request.text, word_count, length, pieces.len(), guidance);
        let chunks: Vec<ChunkRecord> = pieces
            .into_iter()
            .enumerate()
            .map(|(index, piece)| {
                let band = ChunkBand::for_input(piece.word_count, job.length.ratio);
                ChunkRecord::new(&job.id, index, piece.text, piece.word_count, band)
            })
            .collect();

        self.store.create_job(&job, &chunks).await?;
        info!(
            "Created job {}: {} words in {} chunks, target {} ({})",
            job.id, word_count, job.chunk_count, job.length.target_mid, job.length.mode
        );

        self.launch(&job, false)
    }

    /// Continue an aborted, failed or orphaned job from its first incomplete chunk
    pub async fn resume_job(&self, job_id: &str) -> Result<ResumeOutcome, JobError> {
        if self.registry.is_active(job_id) {
            return Err(JobError::AlreadyRunning(job_id.to_string()));
        }
        let job = load_job(self.store.as_ref(), job_id).await?;
        if job.status == JobStatus::Complete {
            info!("Job {} already complete, serving stored output", job_id);
            return Ok(ResumeOutcome::Cached(Box::new(job)));
        }

        info!("Resuming job {} from status {}", job_id, job.status);
        Ok(ResumeOutcome::Resumed(self.launch(&job, true)?))
    }

    /// Ask a running job to stop at its next checkpoint.
    ///
    /// Returns false when the job exists but nothing is driving it. Stitching has no
    /// checkpoint left, so a job in that phase is refused.
    pub async fn abort_job(&self, job_id: &str) -> Result<bool, JobError> {
        let job = load_job(self.store.as_ref(), job_id).await?;
        if job.status == JobStatus::Stitching && self.registry.is_active(job_id) {
            return Err(JobError::NotAbortable {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }
        if self.registry.abort(job_id) {
            info!("Abort requested for job {}", job_id);
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobSnapshot, JobError> {
        snapshot(self.store.as_ref(), job_id, self.registry.is_active(job_id)).await
    }

    /// Delete completed jobs older than the retention window
    pub async fn cleanup_old_jobs(&self) -> Result<usize, JobError> {
        let registry = self.registry.clone();
        sweep_completed(
            self.store.as_ref(),
            self.config.retention.retention_hours,
            move |id| registry.is_active(id),
        )
        .await
    }

    pub fn spawn_cleanup_loop(&self) -> JoinHandle<()> {
        let this = self.clone();
        let period = Duration::from_secs(this.config.retention.sweep_interval_minutes.max(1) * 60);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match this.cleanup_old_jobs().await {
                    Ok(0) => debug!("Retention sweep found nothing to delete"),
                    Ok(n) => info!("Retention sweep deleted {} completed job(s)", n),
                    Err(e) => warn!("Retention sweep failed: {}", e),
                }
            }
        })
    }

    fn launch(&self, job: &DocumentJob, resumed: bool) -> Result<StartedJob, JobError> {
        let handle = self
            .registry
            .register(&job.id)
            .ok_or_else(|| JobError::AlreadyRunning(job.id.clone()))?;

        let events = self.hub.subscribe(&job.id);
        self.hub.publish(
            &job.id,
            JobEvent::JobStarted {
                total_chunks: job.chunk_count,
                word_count: job.word_count,
                target_words: job.length.target_mid,
                target_min: job.length.target_min,
                target_max: job.length.target_max,
                mode: job.length.mode,
                resumed,
            },
        );

        let this = self.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move { this.run_job(job_id, handle).await });

        Ok(StartedJob {
            job_id: job.id.clone(),
            total_chunks: job.chunk_count,
            events,
        })
    }

    async fn run_job(self, job_id: String, handle: JobHandle) {
        let terminal = match self.drive(&job_id, &handle).await {
            Ok(event) => event,
            Err(e) => {
                warn!("Job {} failed: {}", job_id, e);
                self.mark_failed(&job_id, &e).await;
                JobEvent::JobFailed {
                    error: e.to_string(),
                }
            }
        };

        self.registry.remove(&job_id);
        self.hub.publish(&job_id, terminal);
        self.hub.close(&job_id);
    }

    async fn mark_failed(&self, job_id: &str, error: &JobError) {
        let mut job = match self.store.load_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!("Could not record failure of job {}: {}", job_id, e);
                return;
            }
        };
        job.error = Some(error.to_string());
        if let Err(e) = job.transition(JobStatus::Failed) {
            warn!("Job {}: {}", job_id, e);
            return;
        }
        if let Err(e) = self.store.save_job(&job).await {
            warn!("Could not record failure of job {}: {}", job_id, e);
        }
    }

    async fn drive(&self, job_id: &str, handle: &JobHandle) -> Result<JobEvent, JobError> {
        let mut job = self.store.load_job(job_id).await?;
        let mut chunks = self.store.load_chunks(job_id).await?;
        job.error = None;

        let mut skeleton = match job.skeleton.clone() {
            Some(skeleton) => skeleton,
            None => {
                self.advance(&mut job, JobStatus::SkeletonExtraction).await?;
                self.progress(&job, &chunks, handle, "Extracting document skeleton");
                let skeleton = extract_skeleton(
                    &self.completer,
                    &job.original_text,
                    job.word_count,
                    job.guidance.custom_instructions.as_deref(),
                    &self.skeleton_settings(),
                )
                .await?;
                info!(
                    "Job {}: skeleton has {} outline items, {} chapters{}",
                    job_id,
                    skeleton.outline.len(),
                    skeleton.chapters.len(),
                    if skeleton.degraded { " (degraded)" } else { "" }
                );
                job.skeleton = Some(skeleton.clone());
                self.store.save_job(&job).await?;
                skeleton
            }
        };

        if handle.is_aborted() {
            return self.finish_aborted(job, &chunks).await;
        }

        // A job orphaned mid-stitch has every chunk done already
        if job.status != JobStatus::Stitching {
            self.advance(&mut job, JobStatus::ChunkProcessing).await?;
            let aborted = self
                .process_chunks(&mut job, &mut chunks, &mut skeleton, handle)
                .await?;
            if aborted || handle.is_aborted() {
                return self.finish_aborted(job, &chunks).await;
            }
        }

        self.advance(&mut job, JobStatus::Stitching).await?;
        self.progress(&job, &chunks, handle, "Stitching and reviewing consistency");
        self.finish(job, &chunks, skeleton).await
    }

    /// Reconstruct every incomplete chunk in order. Returns true when stopped by an abort.
    async fn process_chunks(
        &self,
        job: &mut DocumentJob,
        chunks: &mut [ChunkRecord],
        skeleton: &mut GlobalSkeleton,
        handle: &JobHandle,
    ) -> Result<bool, JobError> {
        let total = chunks.len();
        let settings = ReconstructSettings {
            max_attempts: self.config.pipeline.max_chunk_attempts,
            temperature: self.config.pipeline.chunk_temperature,
        };
        let delay = Duration::from_millis(self.config.pipeline.inter_chunk_delay_ms);
        let mut running_total: usize = chunks
            .iter()
            .filter(|c| c.is_complete())
            .filter_map(|c| c.actual_words)
            .sum();
        let mut completed = chunks.iter().filter(|c| c.is_complete()).count();
        let mut processed = 0usize;
        let mut warned = false;

        for index in 0..total {
            if chunks[index].is_complete() {
                continue;
            }
            if processed > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if handle.is_aborted() {
                return Ok(true);
            }

            chunks[index].status = ChunkStatus::Processing;
            chunks[index].updated_at = Utc::now();
            self.store.save_chunk(&chunks[index]).await?;
            job.current_chunk_index = index;
            job.updated_at = Utc::now();
            self.store.save_job(job).await?;

            let result = {
                let input = ChunkInput {
                    text: &chunks[index].input_text,
                    index,
                    total,
                };
                reconstruct_chunk(
                    &self.completer,
                    &input,
                    skeleton,
                    &job.length,
                    &job.guidance,
                    &settings,
                )
                .await?
            };

            let chunk = &mut chunks[index];
            chunk.output_text = Some(result.output_text.clone());
            chunk.actual_words = Some(result.word_count);
            chunk.delta = Some(result.delta);
            chunk.status = ChunkStatus::Complete;
            chunk.attempts = result.attempts;
            chunk.flagged = result.flagged;
            chunk.updated_at = Utc::now();
            self.store.save_chunk(chunk).await?;

            running_total += result.word_count;
            completed += 1;
            processed += 1;

            let offset: usize = chunks[..=index].iter().map(|c| c.input_words).sum();
            let finished = skeleton.complete_chapters_through(offset);
            if !finished.is_empty() {
                info!("Job {}: chapters complete: {}", job.id, finished.join(", "));
            }
            job.skeleton = Some(skeleton.clone());
            job.current_chunk_index = index + 1;
            job.updated_at = Utc::now();
            self.store.save_job(job).await?;

            let projected = projected_final(running_total, completed, total);
            let chunk = &chunks[index];
            self.hub.publish(
                &job.id,
                JobEvent::ChunkComplete {
                    chunk_index: index,
                    total_chunks: total,
                    chunk_text: result.output_text,
                    actual_words: result.word_count,
                    target_words: chunk.target_words,
                    min_words: chunk.min_words,
                    max_words: chunk.max_words,
                    running_total,
                    projected_final: projected,
                    status: if result.flagged {
                        ChunkOutcome::Flagged
                    } else {
                        ChunkOutcome::OnTarget
                    },
                },
            );
            self.progress(
                job,
                chunks,
                handle,
                &format!("Reconstructed chunk {} of {}", index + 1, total),
            );

            if !warned && self.shortfall_checkpoint(index) {
                warned = self.check_shortfall(job, projected);
            }
        }

        Ok(false)
    }

    fn shortfall_checkpoint(&self, index: usize) -> bool {
        let progress = &self.config.progress;
        index >= progress.shortfall_min_chunk_index
            && (index + 1) % progress.shortfall_check_interval.max(1) == 0
    }

    /// Publish a warning when the projection falls short of the target. Returns true if one was sent.
    fn check_shortfall(&self, job: &DocumentJob, projected: usize) -> bool {
        let target = job.length.target_mid;
        if target == 0 {
            return false;
        }
        let shortfall = (target as f64 - projected as f64) / target as f64;
        if shortfall <= self.config.progress.shortfall_threshold {
            return false;
        }

        let message = format!(
            "Projected length {} words is {:.0}% below the target of {}",
            projected,
            shortfall * 100.0,
            target
        );
        warn!("Job {}: {}", job.id, message);
        self.hub.publish(
            &job.id,
            JobEvent::Warning {
                message,
                projected_final: projected,
                target_words: target,
                shortfall,
            },
        );
        true
    }

    async fn finish(
        &self,
        mut job: DocumentJob,
        chunks: &[ChunkRecord],
        mut skeleton: GlobalSkeleton,
    ) -> Result<JobEvent, JobError> {
        let empty = ChunkDelta::default();
        let stitch_chunks: Vec<StitchChunk<'_>> = chunks
            .iter()
            .filter_map(|c| {
                Some(StitchChunk {
                    index: c.index,
                    text: c.output_text.as_deref()?,
                    delta: c.delta.as_ref().unwrap_or(&empty),
                })
            })
            .collect();
        if stitch_chunks.len() != chunks.len() {
            return Err(JobError::Validation(format!(
                "only {} of {} chunks have output",
                stitch_chunks.len(),
                chunks.len()
            )));
        }

        let analysis = self.analysis_settings();
        let outcome = stitch_and_validate(&self.completer, &skeleton, &stitch_chunks, &analysis).await;
        if outcome.stitch_result.issue_count() > 0 {
            info!(
                "Job {}: consistency review reported {} issue(s)",
                job.id,
                outcome.stitch_result.issue_count()
            );
        }

        let additions =
            generate_requested_additions(&self.completer, &outcome.final_output, &skeleton, &analysis)
                .await?;
        skeleton.chapters.extend(additions.appended_chapters);

        let validation = validate_final_output(&additions.output, &skeleton);
        for warning in &validation.warnings {
            warn!("Job {}: {}", job.id, warning);
        }
        job.skeleton = Some(skeleton);
        job.stitch_result = Some(outcome.stitch_result.clone());
        job.validation = Some(validation.clone());

        if !validation.valid {
            job.updated_at = Utc::now();
            self.store.save_job(&job).await?;
            return Err(JobError::Validation(validation.summary()));
        }

        job.final_output = Some(additions.output.clone());
        job.final_word_count = Some(validation.word_count);
        job.transition(JobStatus::Complete)?;
        self.store.save_job(&job).await?;
        info!(
            "Job {} complete: {} words (target {})",
            job.id, validation.word_count, job.length.target_mid
        );

        Ok(JobEvent::JobComplete {
            final_output: additions.output,
            final_word_count: validation.word_count,
            stitch_result: outcome.stitch_result,
            validation,
        })
    }

    async fn finish_aborted(
        &self,
        mut job: DocumentJob,
        chunks: &[ChunkRecord],
    ) -> Result<JobEvent, JobError> {
        let partial_output = assemble_partial(chunks);
        let completed_chunks = chunks.iter().filter(|c| c.is_complete()).count();
        job.transition(JobStatus::Aborted)?;
        self.store.save_job(&job).await?;
        info!(
            "Job {} aborted after {} of {} chunks",
            job.id,
            completed_chunks,
            chunks.len()
        );

        Ok(JobEvent::JobAborted {
            completed_chunks,
            total_chunks: chunks.len(),
            word_count: count_words(&partial_output),
            partial_output,
        })
    }

    async fn advance(&self, job: &mut DocumentJob, status: JobStatus) -> Result<(), JobError> {
        if job.status == status {
            return Ok(());
        }
        debug!("Job {}: {} -> {}", job.id, job.status, status);
        job.transition(status)?;
        self.store.save_job(job).await?;
        Ok(())
    }

    fn progress(&self, job: &DocumentJob, chunks: &[ChunkRecord], handle: &JobHandle, message: &str) {
        let total = chunks.len();
        let completed = chunks.iter().filter(|c| c.is_complete()).count();
        let words: usize = chunks.iter().filter_map(|c| c.actual_words).sum();
        let elapsed = handle.elapsed().as_secs();
        let estimated_remaining = (completed > 0 && completed < total)
            .then(|| elapsed * (total - completed) as u64 / completed as u64);

        self.hub.publish(
            &job.id,
            JobEvent::Progress {
                phase: job.status,
                message: message.to_string(),
                completed_chunks: completed,
                total_chunks: total,
                words_processed: words,
                target_words: job.length.target_mid,
                projected_final: projected_final(words, completed, total),
                time_elapsed: elapsed,
                estimated_remaining,
            },
        );
    }

    fn skeleton_settings(&self) -> SkeletonSettings {
        SkeletonSettings {
            chapter_detection_words: self.config.pipeline.chapter_detection_words,
            temperature: self.config.pipeline.analysis_temperature,
            max_tokens: self.config.completion.initial_analysis_tokens,
        }
    }

    fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            temperature: self.config.pipeline.analysis_temperature,
            max_tokens: self.config.completion.initial_analysis_tokens,
        }
    }
}

/// Running total extrapolated linearly over the remaining chunks
fn projected_final(running_total: usize, completed: usize, total: usize) -> usize {
    if completed == 0 {
        return 0;
    }
    (running_total as f64 / completed as f64 * total as f64).round() as usize
}

/// Completed chunk outputs in index order
fn assemble_partial(chunks: &[ChunkRecord]) -> String {
    chunks
        .iter()
        .filter(|c| c.is_complete())
        .filter_map(|c| c.output_text.as_deref())
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn load_job(store: &dyn JobStore, job_id: &str) -> Result<DocumentJob, JobError> {
    match store.load_job(job_id).await {
        Ok(job) => Ok(job),
        Err(StoreError::NotFound(_)) => Err(JobError::NotFound(job_id.to_string())),
        Err(e) => Err(e.into()),
    }
}

pub async fn snapshot(
    store: &dyn JobStore,
    job_id: &str,
    active: bool,
) -> Result<JobSnapshot, JobError> {
    let job = load_job(store, job_id).await?;
    let chunks = store.load_chunks(job_id).await?;
    Ok(JobSnapshot {
        job_id: job.id,
        status: job.status,
        completed_chunks: chunks.iter().filter(|c| c.is_complete()).count(),
        total_chunks: chunks.len(),
        words_so_far: chunks.iter().filter_map(|c| c.actual_words).sum(),
        target_words: job.length.target_mid,
        active,
        final_word_count: job.final_word_count,
        error: job.error,
        created_at: job.created_at,
        updated_at: job.updated_at,
    })
}

/// Delete complete jobs whose completion is older than `retention_hours`
pub async fn sweep_completed(
    store: &dyn JobStore,
    retention_hours: i64,
    is_active: impl Fn(&str) -> bool,
) -> Result<usize, JobError> {
    let cutoff = Utc::now() - chrono::Duration::hours(retention_hours);
    let mut removed = 0;
    for job in store.list_jobs().await? {
        let expired = job.status == JobStatus::Complete
            && job.completed_at.is_some_and(|at| at < cutoff)
            && !is_active(&job.id);
        if expired {
            store.delete_job(&job.id).await?;
            debug!("Deleted expired job {}", job.id);
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::MemoryStore;
    use crate::pipeline::length::ConstraintKind;
    use crate::pipeline::skeleton::ChapterStatus;
    use crate::pipeline::LengthMode;
    use crate::provider::scripted::ScriptedProvider;
    use std::sync::OnceLock;
    use tokio::sync::broadcast::error::RecvError;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.pipeline.inter_chunk_delay_ms = 0;
        config
    }

    fn orchestrator(provider: Arc<ScriptedProvider>, config: Config) -> (Orchestrator, Arc<MemoryStore>) {
        let completer = Completer::new(provider, None, config.completion.max_escalations);
        let store = Arc::new(MemoryStore::default());
        let orch = Orchestrator::new(Arc::new(config), Arc::new(completer), store.clone());
        (orch, store)
    }

    /// `paragraphs` paragraphs of exactly 100 words each
    fn document(paragraphs: usize) -> String {
        (0..paragraphs)
            .map(|p| {
                (0..10)
                    .map(|s| format!("Paragraph {} sentence {} carries ten words of source text.", p, s))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn request(text: String, instructions: Option<&str>) -> JobRequest {
        JobRequest {
            text,
            instructions: instructions.map(str::to_string),
            ..Default::default()
        }
    }

    async fn drain(mut events: broadcast::Receiver<JobUpdate>) -> Vec<JobEvent> {
        let mut out = Vec::new();
        loop {
            match events.recv().await {
                Ok(update) => out.push(update.event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_rejects_short_input_before_storing() {
        let provider = Arc::new(ScriptedProvider::new());
        let (orch, store) = orchestrator(provider.clone(), test_config());

        let err = orch.start_job(request(document(3), None)).await.unwrap_err();
        assert!(matches!(err, JobError::TooShort { words: 300, min: 1000 }));
        assert!(err.to_string().contains("single-call"));
        assert_eq!(store.job_count(), 0);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_rejects_long_input() {
        let provider = Arc::new(ScriptedProvider::new());
        let (orch, store) = orchestrator(provider, test_config());

        let err = orch.start_job(request(document(210), None)).await.unwrap_err();
        assert!(matches!(err, JobError::TooLong { words: 21000, max: 20000 }));
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn test_full_run_hits_target_band() {
        let provider = Arc::new(ScriptedProvider::new());
        let (orch, store) = orchestrator(provider.clone(), test_config());

        let started = orch
            .start_job(request(document(50), Some("Shorten to 2000 words")))
            .await
            .unwrap();
        assert_eq!(started.total_chunks, 7);
        let job_id = started.job_id.clone();
        let events = drain(started.events).await;

        assert!(matches!(
            events.first(),
            Some(JobEvent::JobStarted { total_chunks: 7, target_words: 2000, resumed: false, .. })
        ));
        let chunk_events = events
            .iter()
            .filter(|e| matches!(e, JobEvent::ChunkComplete { .. }))
            .count();
        assert_eq!(chunk_events, 7);
        match events.last() {
            Some(JobEvent::JobComplete { final_word_count, validation, stitch_result, .. }) => {
                assert_eq!(*final_word_count, 2000);
                assert!(validation.valid);
                assert_eq!(stitch_result.redundancies.len(), 1);
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }

        // skeleton + 7 chunks + stitch
        assert_eq!(provider.calls(), 9);

        let job = store.load_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.completed_at.is_some());
        assert_eq!(job.final_word_count, Some(2000));

        let status = orch.get_status(&job_id).await.unwrap();
        assert_eq!(status.completed_chunks, 7);
        assert_eq!(status.words_so_far, 2000);
        assert!(!status.active);
    }

    #[tokio::test]
    async fn test_chunk_events_report_running_totals() {
        let provider = Arc::new(ScriptedProvider::new());
        let (orch, _) = orchestrator(provider, test_config());

        let started = orch.start_job(request(document(20), None)).await.unwrap();
        let events = drain(started.events).await;

        let totals: Vec<(usize, usize)> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::ChunkComplete { chunk_index, running_total, .. } => {
                    Some((*chunk_index, *running_total))
                }
                _ => None,
            })
            .collect();
        assert_eq!(totals, vec![(0, 800), (1, 1600), (2, 2000)]);
    }

    #[tokio::test]
    async fn test_abort_then_resume() {
        let slot: Arc<OnceLock<(JobRegistry, String)>> = Arc::new(OnceLock::new());
        let hook_slot = slot.clone();
        let provider = Arc::new(ScriptedProvider::new().with_chunk_hook(move |call| {
            if call == 3 {
                if let Some((registry, id)) = hook_slot.get() {
                    registry.abort(id);
                }
            }
        }));
        let (orch, store) = orchestrator(provider.clone(), test_config());

        let started = orch.start_job(request(document(50), None)).await.unwrap();
        slot.set((orch.registry.clone(), started.job_id.clone())).unwrap();
        let job_id = started.job_id.clone();
        let events = drain(started.events).await;

        let chunks = store.load_chunks(&job_id).await.unwrap();
        match events.last() {
            Some(JobEvent::JobAborted { completed_chunks, total_chunks, partial_output, word_count }) => {
                assert_eq!(*completed_chunks, 3);
                assert_eq!(*total_chunks, 7);
                assert_eq!(*word_count, 2400);
                assert_eq!(partial_output, &assemble_partial(&chunks));
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
        assert_eq!(store.load_job(&job_id).await.unwrap().status, JobStatus::Aborted);
        assert_eq!(provider.chunk_calls(), 3);

        let resumed = match orch.resume_job(&job_id).await.unwrap() {
            ResumeOutcome::Resumed(started) => started,
            ResumeOutcome::Cached(_) => panic!("aborted job should not be cached"),
        };
        let events = drain(resumed.events).await;
        assert!(matches!(events.first(), Some(JobEvent::JobStarted { resumed: true, .. })));
        assert!(matches!(events.last(), Some(JobEvent::JobComplete { final_word_count: 5000, .. })));

        // Skeleton is reused; only the four remaining chunks run
        assert_eq!(provider.chunk_calls(), 7);
        assert_eq!(provider.calls(), 1 + 7 + 1);
    }

    #[tokio::test]
    async fn test_abort_during_skeleton_extraction() {
        let slot: Arc<OnceLock<(JobRegistry, String)>> = Arc::new(OnceLock::new());
        let hook_slot = slot.clone();
        let provider = Arc::new(ScriptedProvider::new().with_skeleton_hook(move || {
            if let Some((registry, id)) = hook_slot.get() {
                registry.abort(id);
            }
        }));
        let (orch, store) = orchestrator(provider.clone(), test_config());

        let started = orch.start_job(request(document(50), None)).await.unwrap();
        slot.set((orch.registry.clone(), started.job_id.clone())).unwrap();
        let job_id = started.job_id.clone();
        let events = drain(started.events).await;

        match events.last() {
            Some(JobEvent::JobAborted { completed_chunks, total_chunks, partial_output, word_count }) => {
                assert_eq!(*completed_chunks, 0);
                assert_eq!(*total_chunks, 7);
                assert!(partial_output.is_empty());
                assert_eq!(*word_count, 0);
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
        let job = store.load_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Aborted);
        assert!(job.skeleton.is_some());
        assert_eq!(provider.chunk_calls(), 0);
    }

    #[tokio::test]
    async fn test_resume_while_running_is_rejected() {
        let provider = Arc::new(ScriptedProvider::new());
        let (orch, _) = orchestrator(provider, test_config());

        let started = orch.start_job(request(document(20), None)).await.unwrap();
        let job_id = started.job_id.clone();
        assert!(matches!(
            orch.resume_job(&job_id).await,
            Err(JobError::AlreadyRunning(id)) if id == job_id
        ));
        assert!(orch.watch(&job_id).is_some());

        let events = drain(started.events).await;
        assert!(matches!(events.last(), Some(JobEvent::JobComplete { .. })));
        // A finished job has no channel to join, and watching must not open one
        assert!(orch.watch(&job_id).is_none());
        assert!(orch.watch(&job_id).is_none());
    }

    #[tokio::test]
    async fn test_abort_refused_while_stitching() {
        let (orch, store) = orchestrator(Arc::new(ScriptedProvider::new()), test_config());
        let length = calculate_length_config(1000, None, None);
        let mut job = DocumentJob::new("x".into(), 1000, length, 0, Guidance::default());
        job.status = JobStatus::Stitching;
        store.create_job(&job, &[]).await.unwrap();
        let handle = orch.registry.register(&job.id).unwrap();

        let err = orch.abort_job(&job.id).await.unwrap_err();
        assert!(matches!(err, JobError::NotAbortable { status: JobStatus::Stitching, .. }));
        assert!(err.to_string().contains("not abortable in stitching"));
        assert!(!handle.is_aborted());

        orch.registry.remove(&job.id);
        assert!(!orch.abort_job(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_counts_of_other_things_keep_source_length() {
        let provider = Arc::new(ScriptedProvider::new());
        let (orch, store) = orchestrator(provider, test_config());

        let started = orch
            .start_job(request(document(50), Some("Use about 3 examples per section.")))
            .await
            .unwrap();
        let job_id = started.job_id.clone();
        let events = drain(started.events).await;

        assert!(matches!(
            events.first(),
            Some(JobEvent::JobStarted { target_words: 5000, mode: LengthMode::Maintain, .. })
        ));
        assert!(matches!(events.last(), Some(JobEvent::JobComplete { final_word_count: 5000, .. })));

        let job = store.load_job(&job_id).await.unwrap();
        assert!(!job.length.explicit);
        assert!(job.skeleton.unwrap().instructions.length.is_none());
    }

    #[tokio::test]
    async fn test_explicit_ceiling_is_enforced() {
        let provider = Arc::new(ScriptedProvider::new());
        let (orch, store) = orchestrator(provider, test_config());

        let started = orch
            .start_job(request(
                document(50),
                Some("No more than 2000 words, with at least 3 examples."),
            ))
            .await
            .unwrap();
        let job_id = started.job_id.clone();
        let events = drain(started.events).await;

        assert!(matches!(
            events.first(),
            Some(JobEvent::JobStarted { target_min: 1600, target_max: 2000, .. })
        ));
        match events.last() {
            Some(JobEvent::JobComplete { final_word_count, .. }) => assert!(*final_word_count <= 2000),
            other => panic!("unexpected terminal event: {:?}", other),
        }
        let job = store.load_job(&job_id).await.unwrap();
        let constraint = job.skeleton.unwrap().instructions.length.unwrap();
        assert_eq!(constraint.kind, ConstraintKind::NoMoreThan);
        assert_eq!(constraint.max, 2000);
    }

    #[tokio::test]
    async fn test_resume_complete_job_is_cached() {
        let provider = Arc::new(ScriptedProvider::new());
        let (orch, _) = orchestrator(provider.clone(), test_config());

        let started = orch.start_job(request(document(12), None)).await.unwrap();
        let job_id = started.job_id.clone();
        drain(started.events).await;
        let calls = provider.calls();

        match orch.resume_job(&job_id).await.unwrap() {
            ResumeOutcome::Cached(job) => {
                assert_eq!(job.final_word_count, Some(1200));
                assert!(job.final_output.is_some());
            }
            ResumeOutcome::Resumed(_) => panic!("complete job should be cached"),
        }
        assert_eq!(provider.calls(), calls);
    }

    #[tokio::test]
    async fn test_resume_unknown_job() {
        let (orch, _) = orchestrator(Arc::new(ScriptedProvider::new()), test_config());
        assert!(matches!(orch.resume_job("nope").await, Err(JobError::NotFound(_))));
        assert!(matches!(orch.abort_job("nope").await, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_catastrophic_shortfall_fails_job() {
        let provider = Arc::new(ScriptedProvider::new().with_chunk_scale(0.3));
        let (orch, store) = orchestrator(provider.clone(), test_config());

        let started = orch.start_job(request(document(20), None)).await.unwrap();
        let job_id = started.job_id.clone();
        let events = drain(started.events).await;

        match events.last() {
            Some(JobEvent::JobFailed { error }) => assert!(error.contains("Catastrophic shortfall")),
            other => panic!("unexpected terminal event: {:?}", other),
        }
        let job = store.load_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("chunk 0"));
        assert_eq!(provider.chunk_calls(), 3);
    }

    #[tokio::test]
    async fn test_validation_failure_fails_job() {
        let provider = Arc::new(ScriptedProvider::new().with_chunk_scale(0.8));
        let (orch, store) = orchestrator(provider, test_config());

        let started = orch
            .start_job(request(document(50), Some("Shorten to 2000 words")))
            .await
            .unwrap();
        let job_id = started.job_id.clone();
        let events = drain(started.events).await;

        match events.last() {
            Some(JobEvent::JobFailed { error }) => assert!(error.starts_with("Final validation failed")),
            other => panic!("unexpected terminal event: {:?}", other),
        }
        let job = store.load_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.final_output.is_none());
        let validation = job.validation.unwrap();
        assert!(!validation.valid);
        assert!(!validation.target_met);

        let flagged = store
            .load_chunks(&job_id)
            .await
            .unwrap()
            .iter()
            .filter(|c| c.flagged)
            .count();
        assert_eq!(flagged, 7);
    }

    #[tokio::test]
    async fn test_shortfall_warning_sent_once_per_run() {
        let mut config = test_config();
        config.progress.shortfall_min_chunk_index = 1;
        config.progress.shortfall_check_interval = 2;
        let provider = Arc::new(ScriptedProvider::new().with_chunk_scale(0.7));
        let (orch, _) = orchestrator(provider, config);

        let started = orch.start_job(request(document(50), None)).await.unwrap();
        let events = drain(started.events).await;

        let warnings: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Warning { shortfall, .. } => Some(*shortfall),
                _ => None,
            })
            .collect();
        // checkpoints after chunks 2, 4 and 6 all fall short; only the first warns
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0] > 0.15);
        assert!(matches!(events.last(), Some(JobEvent::JobComplete { final_word_count: 3500, .. })));
    }

    #[tokio::test]
    async fn test_conclusion_request_appends_chapter() {
        let provider = Arc::new(ScriptedProvider::new());
        let (orch, store) = orchestrator(provider, test_config());

        let started = orch
            .start_job(request(document(50), Some("Add a concluding chapter.")))
            .await
            .unwrap();
        let job_id = started.job_id.clone();
        let events = drain(started.events).await;
        assert!(matches!(events.last(), Some(JobEvent::JobComplete { .. })));

        let job = store.load_job(&job_id).await.unwrap();
        assert!(job.final_output.unwrap().contains("## Conclusion"));
        let chapters = job.skeleton.unwrap().chapters;
        assert_eq!(chapters.len(), 4);
        assert!(chapters.iter().all(|c| c.status == ChapterStatus::Complete));
        assert!(chapters[3].generated);
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired_complete_jobs() {
        let store = MemoryStore::default();
        let length = calculate_length_config(1000, None, None);
        let make = |status: JobStatus, age_hours: i64| {
            let mut job = DocumentJob::new("x".into(), 1000, length.clone(), 0, Guidance::default());
            job.status = status;
            job.completed_at = Some(Utc::now() - chrono::Duration::hours(age_hours));
            job
        };

        let old = make(JobStatus::Complete, 48);
        let fresh = make(JobStatus::Complete, 1);
        let failed = make(JobStatus::Failed, 48);
        for job in [&old, &fresh, &failed] {
            store.create_job(job, &[]).await.unwrap();
        }

        let removed = sweep_completed(&store, 24, |_| false).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load_job(&old.id).await.is_err());
        assert!(store.load_job(&fresh.id).await.is_ok());
        assert!(store.load_job(&failed.id).await.is_ok());
    }
}
