//! Validate command: resolve a migration config without creating anything

use std::path::PathBuf;

use clap::Args;
use ferry_common::ObjectStore;
use ferry_transfer::Transfer;

use super::ClusterArgs;
use crate::config::MigrationConfig;
use crate::Result;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Migration config file
    #[arg(short = 'f', long = "config")]
    pub config: PathBuf,
}

pub async fn run(args: ValidateArgs, clusters: &ClusterArgs) -> Result<()> {
    let config = MigrationConfig::load(&args.config)?;
    let source = clusters.source().await?;
    let destination = clusters.destination().await?;

    let transfer = validate(&config, &source, &destination).await?;
    for line in summary(&transfer) {
        println!("{}", line);
    }
    println!();
    println!("All validations passed");
    Ok(())
}

/// Build the transfer `config` describes. Claims are read from both
/// clusters; nothing is written.
pub async fn validate<S: ObjectStore, D: ObjectStore>(
    config: &MigrationConfig,
    source: &S,
    destination: &D,
) -> Result<Transfer> {
    Ok(config.plan(source, destination).await?)
}

fn summary(transfer: &Transfer) -> Vec<String> {
    let mut lines = vec![format!(
        "{} transfer {} over {} via {} endpoint {}",
        transfer.transfer_type(),
        transfer.pvcs().transfer_id(),
        transfer.transport().transport_type(),
        transfer.endpoint().endpoint_type(),
        transfer.endpoint().namespaced_name(),
    )];
    lines.extend(transfer.pvcs().iter().map(|pair| format!("  {}", pair)));
    lines
}
