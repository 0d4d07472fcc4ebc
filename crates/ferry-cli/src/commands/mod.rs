//! CLI commands

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use ferry_common::kube_utils::create_client;
use ferry_common::KubeStore;
use ferry_quiesce::QuiesceReport;

use crate::{Error, Result};

pub mod quiesce;
pub mod transfer;
pub mod validate;

/// Which kubeconfig reaches which cluster. Unset means the ambient config
/// (`KUBECONFIG`, `~/.kube/config` or the in-cluster service account).
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Kubeconfig for the cluster the volumes are copied from
    #[arg(long, global = true, env = "FERRY_SOURCE_KUBECONFIG")]
    pub source_kubeconfig: Option<PathBuf>,

    /// Kubeconfig for the cluster the volumes are copied to
    #[arg(long, global = true, env = "FERRY_DESTINATION_KUBECONFIG")]
    pub destination_kubeconfig: Option<PathBuf>,
}

impl ClusterArgs {
    pub async fn source(&self) -> Result<KubeStore> {
        connect(self.source_kubeconfig.as_deref()).await
    }

    pub async fn destination(&self) -> Result<KubeStore> {
        connect(self.destination_kubeconfig.as_deref()).await
    }
}

async fn connect(kubeconfig: Option<&Path>) -> Result<KubeStore> {
    Ok(KubeStore::new(create_client(kubeconfig).await?))
}

/// Await `wait`, giving up after `timeout` when one is set
pub async fn bounded<T, E, F>(what: &str, timeout: Option<Duration>, wait: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    Error: From<E>,
{
    let Some(limit) = timeout else {
        return Ok(wait.await?);
    };
    match tokio::time::timeout(limit, wait).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout {
            what: what.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}

/// Print what a quiesce or unquiesce call did
pub fn print_report(verb: &str, report: &QuiesceReport) {
    println!("{} namespace {}", verb, report.namespace);
    for workload in &report.acted {
        println!("  {} {}", verb.to_lowercase(), workload);
    }
    for workload in &report.skipped {
        println!("  skipped {}", workload);
    }
    if report.acted.is_empty() && report.skipped.is_empty() {
        println!("  nothing to do");
    }
}
