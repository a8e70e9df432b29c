use anyhow::{bail, Context};
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::{load_config, FollowArgs, RunArgs};
use crate::jobs::{ChunkOutcome, JobEvent, JobRequest, JobStatus, JobUpdate, Orchestrator, StartedJob};

pub async fn execute(args: RunArgs, config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    let orchestrator = Orchestrator::from_config(config)?;
    let started = orchestrator
        .start_job(JobRequest {
            text,
            instructions: args.instructions,
            audience: args.audience,
            rigor: args.rigor,
        })
        .await?;

    info!("Started job {}", started.job_id);
    follow(&orchestrator, started, &args.follow).await
}

/// Report a running job's events until it ends; Ctrl-C requests an abort
pub async fn follow(
    orchestrator: &Orchestrator,
    started: StartedJob,
    args: &FollowArgs,
) -> anyhow::Result<()> {
    let StartedJob {
        job_id, mut events, ..
    } = started;
    let mut abort_sent = false;

    loop {
        let update = tokio::select! {
            received = events.recv() => received,
            _ = tokio::signal::ctrl_c(), if !abort_sent => {
                abort_sent = true;
                warn!("Interrupted; aborting job {} at the next chunk boundary", job_id);
                if let Err(e) = orchestrator.abort_job(&job_id).await {
                    warn!("{}", e);
                }
                continue;
            }
        };

        let update = match update {
            Ok(update) => update,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Dropped {} progress events", skipped);
                continue;
            }
            Err(RecvError::Closed) => bail!("Event stream for job {} ended unexpectedly", job_id),
        };

        if args.json {
            println!("{}", serde_json::to_string(&update)?);
        } else if !args.quiet {
            print_progress(&update);
        }

        match update.event {
            JobEvent::JobComplete { final_output, .. } => {
                deliver(&final_output, args)?;
                return Ok(());
            }
            JobEvent::JobAborted {
                partial_output,
                completed_chunks,
                total_chunks,
                ..
            } => {
                if let Some(path) = &args.output {
                    std::fs::write(path, &partial_output)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                }
                bail!(
                    "Job {} aborted after {} of {} chunks; run `redraft resume {}` to continue",
                    job_id,
                    completed_chunks,
                    total_chunks,
                    job_id
                );
            }
            JobEvent::JobFailed { error } => bail!("Job {} failed: {}", job_id, error),
            _ => {}
        }
    }
}

/// Write the document to `--output`, or stdout unless events already carried it
pub fn deliver(output: &str, args: &FollowArgs) -> anyhow::Result<()> {
    match &args.output {
        Some(path) => {
            std::fs::write(path, output)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {}", path.display());
        }
        None if !args.json => println!("{}", output),
        None => {}
    }
    Ok(())
}

fn print_progress(update: &JobUpdate) {
    match &update.event {
        JobEvent::JobStarted {
            total_chunks,
            word_count,
            target_words,
            target_min,
            target_max,
            mode,
            resumed,
        } => eprintln!(
            "{} job {}: {} words in {} chunks, target {} [{}-{}] ({})",
            if *resumed { "Resumed" } else { "Started" },
            update.job_id,
            word_count,
            total_chunks,
            target_words,
            target_min,
            target_max,
            mode
        ),
        JobEvent::ChunkComplete {
            chunk_index,
            total_chunks,
            actual_words,
            target_words,
            running_total,
            projected_final,
            status,
            ..
        } => eprintln!(
            "[{}/{}] {} words (target {}){}  running {}, projected {}",
            chunk_index + 1,
            total_chunks,
            actual_words,
            target_words,
            if *status == ChunkOutcome::Flagged { " FLAGGED" } else { "" },
            running_total,
            projected_final
        ),
        JobEvent::Progress { phase, message, .. } if *phase != JobStatus::ChunkProcessing => {
            eprintln!("{}", message)
        }
        JobEvent::Warning { message, .. } => eprintln!("warning: {}", message),
        JobEvent::JobComplete {
            final_word_count,
            stitch_result,
            validation,
            ..
        } => {
            eprintln!(
                "Done: {} words, {} consistency issue(s)",
                final_word_count,
                stitch_result.issue_count()
            );
            for warning in &validation.warnings {
                eprintln!("warning: {}", warning);
            }
        }
        _ => {}
    }
}
