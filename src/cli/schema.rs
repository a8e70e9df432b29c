use crate::config::Config;
use schemars::schema_for;

/// Print the JSON Schema of `redraft.yaml`
pub fn execute() -> anyhow::Result<()> {
    let mut schema = schema_for!(Config);
    schema.schema.metadata().description =
        Some("redraft configuration: providers, limits, pipeline tuning and retention".to_string());
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
