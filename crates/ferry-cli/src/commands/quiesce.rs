//! Quiesce and unquiesce commands, against the source cluster

use std::time::Duration;

use clap::Args;
use ferry_common::kube_utils::DEFAULT_POLL_INTERVAL;
use ferry_quiesce::{quiesce, unquiesce, wait_for_termination, QuiesceOptions};

use super::{bounded, print_report, ClusterArgs};
use crate::Result;

#[derive(Args, Debug)]
pub struct QuiesceArgs {
    /// Namespace whose workloads are stopped
    #[arg(long, short = 'n')]
    pub namespace: String,

    /// Return as soon as the controllers are updated, without waiting for
    /// their pods to terminate
    #[arg(long)]
    pub no_wait: bool,

    /// Seconds between checks for running pods
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    pub poll_interval_seconds: u64,

    /// Give up waiting for pods to terminate after this many seconds
    #[arg(long)]
    pub timeout_seconds: Option<u64>,
}

impl QuiesceArgs {
    fn options(&self) -> QuiesceOptions {
        QuiesceOptions {
            poll_interval_seconds: self.poll_interval_seconds,
            wait: !self.no_wait,
        }
    }
}

#[derive(Args, Debug)]
pub struct UnquiesceArgs {
    /// Namespace whose workloads are restored
    #[arg(long, short = 'n')]
    pub namespace: String,
}

pub async fn run_quiesce(args: QuiesceArgs, clusters: &ClusterArgs) -> Result<()> {
    let store = clusters.source().await?;
    let options = args.options();
    let report = quiesce(&store, &args.namespace).await?;
    print_report("Quiesced", &report);
    if options.wait {
        let timeout = args.timeout_seconds.map(Duration::from_secs);
        let wait = wait_for_termination(&store, &args.namespace, options.poll_interval());
        bounded("writer pods to terminate", timeout, wait).await?;
        println!("All writer pods in {} terminated", args.namespace);
    }
    Ok(())
}

pub async fn run_unquiesce(args: UnquiesceArgs, clusters: &ClusterArgs) -> Result<()> {
    let store = clusters.source().await?;
    let report = unquiesce(&store, &args.namespace).await?;
    print_report("Unquiesced", &report);
    Ok(())
}
