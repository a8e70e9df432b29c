use std::path::Path;

use crate::cli::{load_config, ServeArgs};
use crate::jobs::Orchestrator;
use crate::server;

pub async fn execute(args: ServeArgs, config_path: &Path) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let bind = config.server.bind.clone();
    let orchestrator = Orchestrator::from_config(config)?;
    server::serve(orchestrator, &bind).await?;
    Ok(())
}
