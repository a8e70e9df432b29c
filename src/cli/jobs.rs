use std::path::Path;
use tracing::info;

use crate::cli::run::{deliver, follow};
use crate::cli::{load_config, ResumeArgs, StatusArgs};
use crate::jobs::{snapshot, sweep_completed, FileStore, Orchestrator, ResumeOutcome};

pub async fn resume(args: ResumeArgs, config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let orchestrator = Orchestrator::from_config(config)?;

    match orchestrator.resume_job(&args.job_id).await? {
        ResumeOutcome::Cached(job) => {
            info!("Job {} already complete", job.id);
            deliver(job.final_output.as_deref().unwrap_or_default(), &args.follow)
        }
        ResumeOutcome::Resumed(started) => follow(&orchestrator, started, &args.follow).await,
    }
}

pub async fn status(args: StatusArgs, config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = FileStore::new(&config.store_dir);
    // A separate process cannot see this store's live tasks
    let snapshot = snapshot(&store, &args.job_id, false).await?;

    println!("Job:      {}", snapshot.job_id);
    println!("Status:   {}", snapshot.status);
    println!(
        "Chunks:   {}/{}",
        snapshot.completed_chunks, snapshot.total_chunks
    );
    println!(
        "Words:    {} so far, target {}",
        snapshot.words_so_far, snapshot.target_words
    );
    if let Some(words) = snapshot.final_word_count {
        println!("Final:    {} words", words);
    }
    if let Some(error) = &snapshot.error {
        println!("Error:    {}", error);
    }
    println!("Updated:  {}", snapshot.updated_at.to_rfc3339());
    Ok(())
}

pub async fn cleanup(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = FileStore::new(&config.store_dir);
    let removed = sweep_completed(&store, config.retention.retention_hours, |_| false).await?;
    println!(
        "Deleted {} completed job(s) older than {}h",
        removed, config.retention.retention_hours
    );
    Ok(())
}
