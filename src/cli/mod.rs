pub mod jobs;
pub mod run;
pub mod schema;
pub mod serve;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "redraft")]
#[command(
    author,
    version,
    about = "Chunked long-document reconstruction with skeleton-anchored consistency"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose/debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, default_value = "redraft.yaml", env = "REDRAFT_CONFIG")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reconstruct a document in-process
    Run(RunArgs),

    /// Continue an aborted, failed or interrupted job
    Resume(ResumeArgs),

    /// Show a stored job's progress
    Status(StatusArgs),

    /// Delete completed jobs older than the retention window
    Cleanup,

    /// Start the WebSocket server
    Serve(ServeArgs),

    /// Print JSON Schema for config validation
    Schema,
}

#[derive(Parser, Clone)]
pub struct RunArgs {
    /// Document to reconstruct
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Free-text instructions, e.g. "shorten to 2000 words"
    #[arg(short, long)]
    pub instructions: Option<String>,

    /// Intended audience
    #[arg(long)]
    pub audience: Option<String>,

    /// Rigor level
    #[arg(long)]
    pub rigor: Option<String>,

    #[command(flatten)]
    pub follow: FollowArgs,
}

#[derive(Parser, Clone)]
pub struct ResumeArgs {
    pub job_id: String,

    #[command(flatten)]
    pub follow: FollowArgs,
}

/// How a foreground job reports progress and delivers its output
#[derive(Parser, Clone, Default)]
pub struct FollowArgs {
    /// Write the final document here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print every event as a JSON line on stdout
    #[arg(long)]
    pub json: bool,

    /// Suppress progress lines
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Parser, Clone)]
pub struct StatusArgs {
    pub job_id: String,
}

#[derive(Parser, Clone)]
pub struct ServeArgs {
    /// Override the configured bind address
    #[arg(long)]
    pub bind: Option<String>,
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load_or_default(path)?;
    config.validate()?;
    Ok(config)
}
