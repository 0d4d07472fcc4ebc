//! Transfer command: server on the destination, client on the source

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use ferry_common::kube_utils::{poll_until_ready, DEFAULT_POLL_INTERVAL};
use ferry_common::ObjectStore;
use ferry_transfer::{Transfer, TransferType, Transport};
use tracing::info;

use super::{bounded, ClusterArgs};
use crate::config::MigrationConfig;
use crate::Result;

#[derive(Args, Debug)]
pub struct TransferArgs {
    /// Migration config file
    #[arg(short = 'f', long = "config")]
    pub config: PathBuf,

    /// Seconds between readiness checks
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    pub poll_interval_seconds: u64,

    /// Return once the client is created instead of waiting for a block
    /// transfer to finish
    #[arg(long)]
    pub no_wait: bool,

    /// Give up on any single wait after this many seconds
    #[arg(long)]
    pub timeout_seconds: Option<u64>,
}

pub async fn run(args: TransferArgs, clusters: &ClusterArgs) -> Result<()> {
    let config = MigrationConfig::load(&args.config)?;
    let source = clusters.source().await?;
    let destination = clusters.destination().await?;
    let waits = Waits {
        interval: Duration::from_secs(args.poll_interval_seconds.max(1)),
        timeout: args.timeout_seconds.map(Duration::from_secs),
    };

    let transfer = transfer(&config, &source, &destination, waits, !args.no_wait).await?;

    let target = ferry_transfer::connection_target(transfer.endpoint(), transfer.transport())?;
    println!(
        "Started {} transfer {} ({} volume(s)) via {}",
        transfer.transfer_type(),
        transfer.pvcs().transfer_id(),
        transfer.pvcs().len(),
        target
    );
    Ok(())
}

/// How often to poll, and how long any one wait may take
#[derive(Clone, Copy, Debug)]
pub struct Waits {
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

/// Create both sides of the transfer described by `config`.
///
/// The server side goes first. Once the endpoint has an address and the
/// server pods run, the tunnel material is read back from the destination
/// and the client is created on the source. Block transfers are then
/// followed to completion when `wait_for_client` is set.
pub async fn transfer<S: ObjectStore, D: ObjectStore>(
    config: &MigrationConfig,
    source: &S,
    destination: &D,
    waits: Waits,
    wait_for_client: bool,
) -> Result<Transfer> {
    let Waits { interval, timeout } = waits;
    let mut transfer = config.plan(source, destination).await?;
    let id = transfer.pvcs().transfer_id().to_string();
    let namespace = transfer.pvcs().destination_namespace();

    transfer.create_server(destination).await?;
    info!(id = %id, namespace = %namespace, "server side created");

    let mut endpoint = transfer.endpoint().clone();
    bounded(
        "endpoint address",
        timeout,
        endpoint.wait_until_healthy(destination, interval),
    )
    .await?;

    let server = &transfer;
    bounded(
        "server pods",
        timeout,
        poll_until_ready(interval, move || server.is_server_healthy(destination)),
    )
    .await?;
    info!(id = %id, namespace = %namespace, "server pods running");

    let transport = Transport::discover(
        destination,
        transfer.transport().transport_type(),
        &namespace,
        &id,
        &config.transport.stunnel_options(),
    )
    .await?;
    let mut transfer = transfer.with_connection(endpoint, transport)?;

    transfer.create_client(source).await?;
    info!(id = %id, namespace = %transfer.pvcs().source_namespace(), "client side created");

    if wait_for_client && transfer.transfer_type() == TransferType::Blockrsync {
        let client = &transfer;
        bounded(
            "block transfer",
            timeout,
            poll_until_ready(interval, move || client.is_client_complete(source)),
        )
        .await?;
        info!(id = %id, "block transfer complete");
    }
    Ok(transfer)
}
