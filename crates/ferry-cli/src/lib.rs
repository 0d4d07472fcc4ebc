//! ferry CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use ferry_common::telemetry::LogFormat;

use commands::ClusterArgs;

/// ferry - move volume contents between Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub clusters: ClusterArgs,

    /// Log output: text or json
    #[arg(long, global = true, default_value = "text", env = "FERRY_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stop every workload that could write to volumes in a source namespace
    Quiesce(commands::quiesce::QuiesceArgs),
    /// Restore the workloads a previous quiesce stopped
    Unquiesce(commands::quiesce::UnquiesceArgs),
    /// Start copying the volumes a migration config names
    Transfer(commands::transfer::TransferArgs),
    /// Check a migration config against both clusters without changing them
    Validate(commands::validate::ValidateArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Quiesce(args) => commands::quiesce::run_quiesce(args, &self.clusters).await,
            Commands::Unquiesce(args) => {
                commands::quiesce::run_unquiesce(args, &self.clusters).await
            }
            Commands::Transfer(args) => commands::transfer::run(args, &self.clusters).await,
            Commands::Validate(args) => commands::validate::run(args, &self.clusters).await,
        }
    }
}
