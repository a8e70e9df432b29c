use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;
mod completion;
mod config;
mod error;
mod jobs;
mod parser;
mod pipeline;
mod provider;
mod retry;
mod server;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("redraft=debug")
    } else {
        EnvFilter::new("redraft=info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => cli::run::execute(args, &cli.config).await,
        Commands::Resume(args) => cli::jobs::resume(args, &cli.config).await,
        Commands::Status(args) => cli::jobs::status(args, &cli.config).await,
        Commands::Cleanup => cli::jobs::cleanup(&cli.config).await,
        Commands::Serve(args) => cli::serve::execute(args, &cli.config).await,
        Commands::Schema => cli::schema::execute(),
    }
}
