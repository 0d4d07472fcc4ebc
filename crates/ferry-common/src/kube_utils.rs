//! Shared Kubernetes utilities using kube-rs

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::trace;

use crate::Error;

/// Default polling interval for wait operations
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Pod phase: running
pub const POD_PHASE_RUNNING: &str = "Running";
/// Pod phase: pending
pub const POD_PHASE_PENDING: &str = "Pending";
/// Pod phase: succeeded
pub const POD_PHASE_SUCCEEDED: &str = "Succeeded";
/// Pod phase: failed
pub const POD_PHASE_FAILED: &str = "Failed";
/// Pod phase: unknown
pub const POD_PHASE_UNKNOWN: &str = "Unknown";

/// Phase of a pod, if the kubelet has reported one
pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Poll until `check_fn` returns `Ok(true)`.
///
/// There is no deadline: the loop sleeps `poll_interval` between attempts
/// forever. Callers that need a bound wrap the future in
/// `tokio::time::timeout`. Errors from `check_fn` end the loop and are
/// returned unchanged.
pub async fn poll_until_ready<F, Fut>(poll_interval: Duration, mut check_fn: F) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    loop {
        if check_fn().await? {
            return Ok(());
        }
        trace!("Polling condition not yet met, retrying...");
        tokio::time::sleep(poll_interval).await;
    }
}

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn poll_returns_once_condition_holds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        poll_until_ready(Duration::from_secs(1), || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 3) }
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_propagates_check_errors() {
        let result = poll_until_ready(Duration::from_secs(1), || async {
            Err::<bool, _>(Error::internal("list failed"))
        })
        .await;

        assert!(matches!(result, Err(Error::Internal { .. })));
    }

    #[test]
    fn pod_phase_reads_status() {
        let mut pod = Pod::default();
        assert_eq!(pod_phase(&pod), None);
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some(POD_PHASE_RUNNING.to_string()),
            ..Default::default()
        });
        assert_eq!(pod_phase(&pod), Some("Running"));
    }
}
