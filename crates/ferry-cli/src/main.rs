//! ferry CLI
//!
//! Quiesces source workloads and copies their volumes to another cluster.

use clap::Parser;
use ferry_common::telemetry::init_logging;

use ferry_cli::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;
    cli.run().await
}
