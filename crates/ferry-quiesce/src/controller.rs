//! Stopping and restoring the workload controllers of a namespace
//!
//! Quiesce walks every kind that can keep a writer alive, records the live
//! value in an annotation and replaces it with the quiesced sentinel.
//! Unquiesce reverses that, but only for objects still holding the
//! sentinel: a controller someone scaled back up by hand is left alone.

use std::fmt;
use std::time::Duration;

use ferry_common::kube_utils::{
    pod_phase, poll_until_ready, DEFAULT_POLL_INTERVAL, POD_PHASE_FAILED, POD_PHASE_SUCCEEDED,
    POD_PHASE_UNKNOWN,
};
use ferry_common::openshift::DeploymentConfig;
use ferry_common::{ObjectStore, Result, StoreObject};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::annotations::{
    self, decode_node_selector, decode_replicas, decode_suspend, encode_node_selector,
    encode_replicas, encode_suspend, PRE_QUIESCE_NODE_SELECTOR, PRE_QUIESCE_REPLICAS,
    PRE_QUIESCE_SUSPEND, QUIESCE_NODE_SELECTOR_KEY, QUIESCE_NODE_SELECTOR_VALUE,
};

/// Owner kinds whose pods count as live writers
const WRITER_OWNER_KINDS: [&str; 5] = [
    "ReplicationController",
    "StatefulSet",
    "ReplicaSet",
    "DaemonSet",
    "Job",
];

/// Workload controller kinds handled by quiesce
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// `batch/v1` CronJob, suspended
    CronJob,
    /// `apps/v1` Deployment, scaled to zero
    Deployment,
    /// `apps.openshift.io/v1` DeploymentConfig, scaled to zero
    DeploymentConfig,
    /// `apps/v1` StatefulSet, scaled to zero
    StatefulSet,
    /// `apps/v1` ReplicaSet without an owner, scaled to zero
    ReplicaSet,
    /// `apps/v1` DaemonSet. Its whole node selector is replaced by one that
    /// no node matches; the original selector is recorded and put back.
    DaemonSet,
    /// `batch/v1` Job, parallelism zero
    Job,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadKind::CronJob => "CronJob",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DeploymentConfig => "DeploymentConfig",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::Job => "Job",
        };
        f.write_str(s)
    }
}

/// A workload controller touched (or passed over) by a quiesce call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    /// Controller kind
    pub kind: WorkloadKind,
    /// Object name
    pub name: String,
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Outcome of [`quiesce`] or [`unquiesce`] over one namespace
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuiesceReport {
    /// Namespace that was processed
    pub namespace: String,
    /// Objects whose live value was changed
    pub acted: Vec<WorkloadRef>,
    /// Objects left as they were (already quiesced, or changed externally
    /// since quiesce)
    pub skipped: Vec<WorkloadRef>,
}

impl QuiesceReport {
    fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }
}

/// Knobs for [`quiesce_and_wait`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuiesceOptions {
    /// Seconds between termination-barrier polls
    pub poll_interval_seconds: u64,
    /// Wait for writer pods to terminate after quiescing
    pub wait: bool,
}

impl Default for QuiesceOptions {
    fn default() -> Self {
        Self {
            poll_interval_seconds: DEFAULT_POLL_INTERVAL.as_secs(),
            wait: true,
        }
    }
}

impl QuiesceOptions {
    /// Interval between termination-barrier polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }
}

/// Per-kind quiesce behaviour
trait Quiescable: StoreObject {
    const KIND: WorkloadKind;
    /// Annotation holding the pre-quiesce value
    const RECORD: &'static str;
    /// The kind's API may not be served by the cluster at all
    const API_OPTIONAL: bool = false;

    fn eligible(&self) -> bool {
        true
    }

    /// Whether the live value is the quiesced sentinel
    fn is_quiesced(&self) -> bool;

    /// Encoded live value, stored before quiescing
    fn pre_image(&self) -> String;

    fn quiesce(&mut self);

    fn restore(&mut self, record: &str) -> Result<()>;
}

macro_rules! impl_replica_quiescable {
    ($type:ty, $kind:expr) => {
        impl Quiescable for $type {
            const KIND: WorkloadKind = $kind;
            const RECORD: &'static str = PRE_QUIESCE_REPLICAS;

            fn is_quiesced(&self) -> bool {
                self.spec.as_ref().and_then(|s| s.replicas) == Some(0)
            }

            fn pre_image(&self) -> String {
                // an unset replica count means one
                encode_replicas(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
            }

            fn quiesce(&mut self) {
                self.spec.get_or_insert_with(Default::default).replicas = Some(0);
            }

            fn restore(&mut self, record: &str) -> Result<()> {
                let replicas = decode_replicas(record)?;
                self.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
                Ok(())
            }
        }
    };
}

impl_replica_quiescable!(Deployment, WorkloadKind::Deployment);
impl_replica_quiescable!(StatefulSet, WorkloadKind::StatefulSet);

impl Quiescable for ReplicaSet {
    const KIND: WorkloadKind = WorkloadKind::ReplicaSet;
    const RECORD: &'static str = PRE_QUIESCE_REPLICAS;

    /// ReplicaSets owned by a Deployment follow their owner
    fn eligible(&self) -> bool {
        self.metadata
            .owner_references
            .as_ref()
            .is_none_or(|owners| owners.is_empty())
    }

    fn is_quiesced(&self) -> bool {
        self.spec.as_ref().and_then(|s| s.replicas) == Some(0)
    }

    fn pre_image(&self) -> String {
        encode_replicas(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }

    fn quiesce(&mut self) {
        self.spec.get_or_insert_with(Default::default).replicas = Some(0);
    }

    fn restore(&mut self, record: &str) -> Result<()> {
        let replicas = decode_replicas(record)?;
        self.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        Ok(())
    }
}

impl Quiescable for DeploymentConfig {
    const KIND: WorkloadKind = WorkloadKind::DeploymentConfig;
    const RECORD: &'static str = PRE_QUIESCE_REPLICAS;
    const API_OPTIONAL: bool = true;

    fn is_quiesced(&self) -> bool {
        self.spec.replicas == Some(0)
    }

    fn pre_image(&self) -> String {
        encode_replicas(self.spec.replicas.unwrap_or(1))
    }

    fn quiesce(&mut self) {
        self.spec.replicas = Some(0);
    }

    fn restore(&mut self, record: &str) -> Result<()> {
        self.spec.replicas = Some(decode_replicas(record)?);
        Ok(())
    }
}

impl Quiescable for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;
    const RECORD: &'static str = PRE_QUIESCE_NODE_SELECTOR;

    fn is_quiesced(&self) -> bool {
        self.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.node_selector.as_ref())
            .and_then(|sel| sel.get(QUIESCE_NODE_SELECTOR_KEY))
            .is_some_and(|v| v == QUIESCE_NODE_SELECTOR_VALUE)
    }

    fn pre_image(&self) -> String {
        let selector = self
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.node_selector.clone())
            .unwrap_or_default();
        encode_node_selector(&selector)
    }

    /// Replaces the selector rather than adding to it
    fn quiesce(&mut self) {
        let pod = self
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default);
        pod.node_selector = Some(
            [(
                QUIESCE_NODE_SELECTOR_KEY.to_string(),
                QUIESCE_NODE_SELECTOR_VALUE.to_string(),
            )]
            .into(),
        );
    }

    fn restore(&mut self, record: &str) -> Result<()> {
        let selector = decode_node_selector(record)?;
        let pod = self
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default);
        pod.node_selector = if selector.is_empty() {
            None
        } else {
            Some(selector)
        };
        Ok(())
    }
}

impl Quiescable for CronJob {
    const KIND: WorkloadKind = WorkloadKind::CronJob;
    const RECORD: &'static str = PRE_QUIESCE_SUSPEND;

    fn is_quiesced(&self) -> bool {
        self.spec.as_ref().and_then(|s| s.suspend) == Some(true)
    }

    fn pre_image(&self) -> String {
        encode_suspend(self.spec.as_ref().and_then(|s| s.suspend).unwrap_or(false))
    }

    fn quiesce(&mut self) {
        self.spec.get_or_insert_with(Default::default).suspend = Some(true);
    }

    fn restore(&mut self, record: &str) -> Result<()> {
        self.spec.get_or_insert_with(Default::default).suspend = Some(decode_suspend(record)?);
        Ok(())
    }
}

/// Job parallelism shares the replica-count record
impl Quiescable for Job {
    const KIND: WorkloadKind = WorkloadKind::Job;
    const RECORD: &'static str = PRE_QUIESCE_REPLICAS;

    fn is_quiesced(&self) -> bool {
        self.spec.as_ref().and_then(|s| s.parallelism) == Some(0)
    }

    fn pre_image(&self) -> String {
        encode_replicas(self.spec.as_ref().and_then(|s| s.parallelism).unwrap_or(1))
    }

    fn quiesce(&mut self) {
        self.spec.get_or_insert_with(Default::default).parallelism = Some(0);
    }

    fn restore(&mut self, record: &str) -> Result<()> {
        self.spec.get_or_insert_with(Default::default).parallelism = Some(decode_replicas(record)?);
        Ok(())
    }
}

fn workload_ref<K: Quiescable>(obj: &K) -> WorkloadRef {
    WorkloadRef {
        kind: K::KIND,
        name: obj.name_any(),
    }
}

/// Eligible objects of kind `K`. A kind whose API the cluster doesn't serve
/// (DeploymentConfig outside OpenShift) yields nothing.
async fn list_eligible<K: Quiescable, S: ObjectStore>(
    store: &S,
    namespace: &str,
) -> Result<Vec<K>> {
    match store.list::<K>(namespace, None).await {
        Ok(items) => Ok(items.into_iter().filter(K::eligible).collect()),
        Err(e) if K::API_OPTIONAL && e.is_not_found() => {
            debug!(kind = %K::KIND, namespace = %namespace, "API not served, skipping");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

async fn quiesce_kind<K: Quiescable, S: ObjectStore>(
    store: &S,
    namespace: &str,
    report: &mut QuiesceReport,
) -> Result<()> {
    for mut obj in list_eligible::<K, S>(store, namespace).await? {
        let workload = workload_ref(&obj);
        if obj.is_quiesced() {
            debug!(workload = %workload, namespace = %namespace, "already quiesced");
            report.skipped.push(workload);
            continue;
        }
        let pre_image = obj.pre_image();
        annotations::set(obj.meta_mut(), K::RECORD, pre_image.clone());
        obj.quiesce();
        store.update(&obj).await?;
        info!(workload = %workload, namespace = %namespace, pre_image = %pre_image, "quiesced");
        report.acted.push(workload);
    }
    Ok(())
}

async fn unquiesce_kind<K: Quiescable, S: ObjectStore>(
    store: &S,
    namespace: &str,
    report: &mut QuiesceReport,
) -> Result<()> {
    for mut obj in list_eligible::<K, S>(store, namespace).await? {
        let Some(record) = annotations::get(obj.meta(), K::RECORD) else {
            continue;
        };
        let workload = workload_ref(&obj);
        if obj.is_quiesced() {
            obj.restore(&record)?;
            annotations::remove(obj.meta_mut(), K::RECORD);
            store.update(&obj).await?;
            info!(workload = %workload, namespace = %namespace, restored = %record, "unquiesced");
            report.acted.push(workload);
        } else {
            // changed by someone else since quiesce; keep their value
            annotations::remove(obj.meta_mut(), K::RECORD);
            store.update(&obj).await?;
            warn!(
                workload = %workload,
                namespace = %namespace,
                "no longer quiesced, leaving live value and dropping stale record"
            );
            report.skipped.push(workload);
        }
    }
    Ok(())
}

/// Stop every write-capable workload controller in `namespace`.
///
/// CronJobs go first so they cannot start new Jobs while the rest is scaled
/// down. Objects already at their quiesced value are skipped, which makes a
/// repeated call a no-op. Returns on the first store error; objects handled
/// before it stay quiesced.
#[instrument(skip(store))]
pub async fn quiesce<S: ObjectStore>(store: &S, namespace: &str) -> Result<QuiesceReport> {
    let mut report = QuiesceReport::new(namespace);
    quiesce_kind::<CronJob, S>(store, namespace, &mut report).await?;
    quiesce_kind::<Deployment, S>(store, namespace, &mut report).await?;
    quiesce_kind::<DeploymentConfig, S>(store, namespace, &mut report).await?;
    quiesce_kind::<StatefulSet, S>(store, namespace, &mut report).await?;
    quiesce_kind::<ReplicaSet, S>(store, namespace, &mut report).await?;
    quiesce_kind::<DaemonSet, S>(store, namespace, &mut report).await?;
    quiesce_kind::<Job, S>(store, namespace, &mut report).await?;
    info!(
        namespace = %namespace,
        acted = report.acted.len(),
        skipped = report.skipped.len(),
        "namespace quiesced"
    );
    Ok(report)
}

/// Restore everything [`quiesce`] stopped in `namespace`
#[instrument(skip(store))]
pub async fn unquiesce<S: ObjectStore>(store: &S, namespace: &str) -> Result<QuiesceReport> {
    let mut report = QuiesceReport::new(namespace);
    unquiesce_kind::<CronJob, S>(store, namespace, &mut report).await?;
    unquiesce_kind::<Deployment, S>(store, namespace, &mut report).await?;
    unquiesce_kind::<DeploymentConfig, S>(store, namespace, &mut report).await?;
    unquiesce_kind::<StatefulSet, S>(store, namespace, &mut report).await?;
    unquiesce_kind::<ReplicaSet, S>(store, namespace, &mut report).await?;
    unquiesce_kind::<DaemonSet, S>(store, namespace, &mut report).await?;
    unquiesce_kind::<Job, S>(store, namespace, &mut report).await?;
    info!(
        namespace = %namespace,
        acted = report.acted.len(),
        skipped = report.skipped.len(),
        "namespace unquiesced"
    );
    Ok(report)
}

fn is_active_writer(pod: &Pod) -> bool {
    let owned_by_writer = pod
        .owner_references()
        .iter()
        .any(|o| WRITER_OWNER_KINDS.contains(&o.kind.as_str()));
    let terminal = matches!(
        pod_phase(pod),
        Some(POD_PHASE_SUCCEEDED | POD_PHASE_FAILED | POD_PHASE_UNKNOWN)
    );
    owned_by_writer && !terminal
}

/// Names of pods in `namespace` that a workload controller owns and that
/// have not reached a terminal phase
pub async fn active_writer_pods<S: ObjectStore>(store: &S, namespace: &str) -> Result<Vec<String>> {
    let pods = store.list::<Pod>(namespace, None).await?;
    Ok(pods
        .iter()
        .filter(|p| is_active_writer(p))
        .map(|p| p.name_any())
        .collect())
}

/// Block until no writer pod in `namespace` is alive.
///
/// Polls every `interval` with no deadline; wrap in `tokio::time::timeout`
/// to bound it.
#[instrument(skip(store))]
pub async fn wait_for_termination<S: ObjectStore>(
    store: &S,
    namespace: &str,
    interval: Duration,
) -> Result<()> {
    poll_until_ready(interval, move || async move {
        let active = active_writer_pods(store, namespace).await?;
        if active.is_empty() {
            return Ok(true);
        }
        debug!(namespace = %namespace, pods = ?active, "waiting for writer pods to terminate");
        Ok(false)
    })
    .await?;
    info!(namespace = %namespace, "all writer pods terminated");
    Ok(())
}

/// [`quiesce`], then [`wait_for_termination`] unless `options.wait` is off
pub async fn quiesce_and_wait<S: ObjectStore>(
    store: &S,
    namespace: &str,
    options: &QuiesceOptions,
) -> Result<QuiesceReport> {
    let report = quiesce(store, namespace).await?;
    if options.wait {
        wait_for_termination(store, namespace, options.poll_interval()).await?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_common::openshift::DeploymentConfigSpec;
    use ferry_common::testing::{InMemoryStore, Operation};
    use k8s_openapi::api::apps::v1::{
        DaemonSetSpec, DeploymentSpec, ReplicaSetSpec, StatefulSetSpec,
    };
    use k8s_openapi::api::batch::v1::{CronJobSpec, JobSpec};
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::collections::BTreeMap;

    const NS: &str = "app";

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        }
    }

    fn deployment(name: &str, replicas: Option<i32>) -> Deployment {
        Deployment {
            metadata: meta(name),
            spec: Some(DeploymentSpec {
                replicas,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn owner(kind: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: "owner".to_string(),
            uid: "uid-1".to_string(),
            ..Default::default()
        }
    }

    fn pod(name: &str, owner_kind: Option<&str>, phase: &str) -> Pod {
        let mut metadata = meta(name);
        metadata.owner_references = owner_kind.map(|k| vec![owner(k)]);
        Pod {
            metadata,
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn replicas(store: &InMemoryStore, name: &str) -> Option<i32> {
        store
            .object::<Deployment>(NS, name)
            .and_then(|d| d.spec)
            .and_then(|s| s.replicas)
    }

    fn record(meta: &ObjectMeta, key: &str) -> Option<String> {
        annotations::get(meta, key)
    }

    /// Story: a second quiesce leaves both the sentinel and the recorded
    /// pre-image untouched
    #[tokio::test]
    async fn story_quiesce_is_idempotent() {
        let store = InMemoryStore::new();
        store.seed(deployment("web", Some(3)));

        let first = quiesce(&store, NS).await.unwrap();
        assert_eq!(
            first.acted,
            vec![WorkloadRef {
                kind: WorkloadKind::Deployment,
                name: "web".to_string()
            }]
        );

        let second = quiesce(&store, NS).await.unwrap();
        assert!(second.acted.is_empty());
        assert_eq!(second.skipped.len(), 1);

        let web: Deployment = store.object(NS, "web").unwrap();
        assert_eq!(web.spec.unwrap().replicas, Some(0));
        assert_eq!(record(&web.metadata, PRE_QUIESCE_REPLICAS).as_deref(), Some("3"));
        assert_eq!(store.operations(), vec!["update Deployment app/web"]);
    }

    #[tokio::test]
    async fn unquiesce_restores_exact_replica_count() {
        let store = InMemoryStore::new();
        store.seed(deployment("web", Some(3)));
        store.seed(deployment("unset", None));

        quiesce(&store, NS).await.unwrap();
        assert_eq!(replicas(&store, "unset"), Some(0));

        let report = unquiesce(&store, NS).await.unwrap();
        assert_eq!(report.acted.len(), 2);
        assert_eq!(replicas(&store, "web"), Some(3));
        assert_eq!(replicas(&store, "unset"), Some(1));
        let web: Deployment = store.object(NS, "web").unwrap();
        assert_eq!(record(&web.metadata, PRE_QUIESCE_REPLICAS), None);
    }

    /// Story: somebody scales the app back up by hand mid-migration, and
    /// unquiesce must not undo that
    #[tokio::test]
    async fn story_unquiesce_keeps_manual_scale() {
        let store = InMemoryStore::new();
        store.seed(deployment("web", Some(3)));
        quiesce(&store, NS).await.unwrap();

        store.modify::<Deployment>(NS, "web", |d| {
            d.spec.as_mut().unwrap().replicas = Some(5);
        });

        let report = unquiesce(&store, NS).await.unwrap();
        assert!(report.acted.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(replicas(&store, "web"), Some(5));
        let web: Deployment = store.object(NS, "web").unwrap();
        assert_eq!(record(&web.metadata, PRE_QUIESCE_REPLICAS), None);
    }

    #[tokio::test]
    async fn already_scaled_down_objects_are_not_recorded() {
        let store = InMemoryStore::new();
        store.seed(deployment("idle", Some(0)));

        let report = quiesce(&store, NS).await.unwrap();
        assert!(report.acted.is_empty());
        assert!(store.operations().is_empty());

        let report = unquiesce(&store, NS).await.unwrap();
        assert!(report.acted.is_empty() && report.skipped.is_empty());
        assert_eq!(replicas(&store, "idle"), Some(0));
    }

    #[tokio::test]
    async fn every_kind_is_quiesced_and_restored() {
        let store = InMemoryStore::new();
        store.seed(CronJob {
            metadata: meta("nightly"),
            spec: Some(CronJobSpec {
                schedule: "0 0 * * *".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        store.seed(deployment("web", Some(2)));
        store.seed(DeploymentConfig {
            metadata: meta("legacy"),
            spec: DeploymentConfigSpec {
                replicas: Some(4),
                ..Default::default()
            },
        });
        store.seed(StatefulSet {
            metadata: meta("db"),
            spec: Some(StatefulSetSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            ..Default::default()
        });
        store.seed(ReplicaSet {
            metadata: meta("bare"),
            spec: Some(ReplicaSetSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        });
        store.seed(DaemonSet {
            metadata: meta("agent"),
            spec: Some(DaemonSetSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        node_selector: Some(BTreeMap::from([(
                            "kubernetes.io/os".to_string(),
                            "linux".to_string(),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        });
        store.seed(Job {
            metadata: meta("import"),
            spec: Some(JobSpec {
                parallelism: Some(2),
                template: PodTemplateSpec::default(),
                ..Default::default()
            }),
            ..Default::default()
        });

        let report = quiesce(&store, NS).await.unwrap();
        let kinds: Vec<_> = report.acted.iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![
                WorkloadKind::CronJob,
                WorkloadKind::Deployment,
                WorkloadKind::DeploymentConfig,
                WorkloadKind::StatefulSet,
                WorkloadKind::ReplicaSet,
                WorkloadKind::DaemonSet,
                WorkloadKind::Job,
            ]
        );

        let cron: CronJob = store.object(NS, "nightly").unwrap();
        assert_eq!(cron.spec.as_ref().unwrap().suspend, Some(true));
        assert_eq!(record(&cron.metadata, PRE_QUIESCE_SUSPEND).as_deref(), Some("false"));

        let dc: DeploymentConfig = store.object(NS, "legacy").unwrap();
        assert_eq!(dc.spec.replicas, Some(0));

        let ds: DaemonSet = store.object(NS, "agent").unwrap();
        let selector = ds.spec.unwrap().template.spec.unwrap().node_selector.unwrap();
        assert_eq!(
            selector,
            BTreeMap::from([(QUIESCE_NODE_SELECTOR_KEY.to_string(), "true".to_string())])
        );
        assert_eq!(
            record(&ds.metadata, PRE_QUIESCE_NODE_SELECTOR).as_deref(),
            Some(r#"{"kubernetes.io/os":"linux"}"#)
        );

        let job: Job = store.object(NS, "import").unwrap();
        assert_eq!(job.spec.as_ref().unwrap().parallelism, Some(0));
        assert_eq!(record(&job.metadata, PRE_QUIESCE_REPLICAS).as_deref(), Some("2"));

        let report = unquiesce(&store, NS).await.unwrap();
        assert_eq!(report.acted.len(), 7);

        let cron: CronJob = store.object(NS, "nightly").unwrap();
        assert_eq!(cron.spec.unwrap().suspend, Some(false));
        let dc: DeploymentConfig = store.object(NS, "legacy").unwrap();
        assert_eq!(dc.spec.replicas, Some(4));
        let sts: StatefulSet = store.object(NS, "db").unwrap();
        assert_eq!(sts.spec.unwrap().replicas, Some(3));
        let rs: ReplicaSet = store.object(NS, "bare").unwrap();
        assert_eq!(rs.spec.unwrap().replicas, Some(2));
        let ds: DaemonSet = store.object(NS, "agent").unwrap();
        assert_eq!(
            ds.spec.unwrap().template.spec.unwrap().node_selector,
            Some(BTreeMap::from([("kubernetes.io/os".to_string(), "linux".to_string())]))
        );
        let job: Job = store.object(NS, "import").unwrap();
        assert_eq!(job.spec.unwrap().parallelism, Some(2));
    }

    #[tokio::test]
    async fn daemonset_without_selector_restores_to_none() {
        let store = InMemoryStore::new();
        store.seed(DaemonSet {
            metadata: meta("agent"),
            spec: Some(DaemonSetSpec::default()),
            ..Default::default()
        });

        quiesce(&store, NS).await.unwrap();
        let ds: DaemonSet = store.object(NS, "agent").unwrap();
        assert_eq!(record(&ds.metadata, PRE_QUIESCE_NODE_SELECTOR).as_deref(), Some("{}"));

        unquiesce(&store, NS).await.unwrap();
        let ds: DaemonSet = store.object(NS, "agent").unwrap();
        assert_eq!(ds.spec.unwrap().template.spec.unwrap().node_selector, None);
    }

    #[tokio::test]
    async fn owned_replicasets_follow_their_deployment() {
        let store = InMemoryStore::new();
        let mut owned = ReplicaSet {
            metadata: meta("web-5d8f"),
            spec: Some(ReplicaSetSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            ..Default::default()
        };
        owned.metadata.owner_references = Some(vec![owner("Deployment")]);
        store.seed(owned);

        let report = quiesce(&store, NS).await.unwrap();
        assert!(report.acted.is_empty() && report.skipped.is_empty());
        let rs: ReplicaSet = store.object(NS, "web-5d8f").unwrap();
        assert_eq!(rs.spec.unwrap().replicas, Some(3));
    }

    #[tokio::test]
    async fn corrupt_record_fails_unquiesce() {
        let store = InMemoryStore::new();
        let mut web = deployment("web", Some(0));
        annotations::set(&mut web.metadata, PRE_QUIESCE_REPLICAS, "many".to_string());
        store.seed(web);

        let err = unquiesce(&store, NS).await.unwrap_err();
        assert!(matches!(err, ferry_common::Error::Serialization { .. }));
        assert_eq!(replicas(&store, "web"), Some(0));
    }

    #[tokio::test]
    async fn store_failure_stops_quiesce() {
        let store = InMemoryStore::new();
        store.seed(deployment("web", Some(2)));
        store.seed(StatefulSet {
            metadata: meta("db"),
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        });
        store.fail_on(Operation::Update, "StatefulSet", None);

        assert!(quiesce(&store, NS).await.is_err());
        // handled before the failure stays quiesced
        assert_eq!(replicas(&store, "web"), Some(0));
    }

    #[tokio::test]
    async fn active_writers_exclude_terminal_and_unowned_pods() {
        let store = InMemoryStore::new();
        store.seed(pod("web-1", Some("ReplicaSet"), "Running"));
        store.seed(pod("db-0", Some("StatefulSet"), "Pending"));
        store.seed(pod("import-x", Some("Job"), "Succeeded"));
        store.seed(pod("agent-y", Some("DaemonSet"), "Failed"));
        store.seed(pod("lost", Some("ReplicationController"), "Unknown"));
        store.seed(pod("standalone", None, "Running"));

        let mut active = active_writer_pods(&store, NS).await.unwrap();
        active.sort();
        assert_eq!(active, vec!["db-0", "web-1"]);
    }

    /// Story: the barrier holds until the last writer pod finishes
    #[tokio::test(start_paused = true)]
    async fn story_wait_blocks_until_writers_terminate() {
        let store = InMemoryStore::new();
        store.seed(pod("web-1", Some("ReplicaSet"), "Running"));

        let wait = wait_for_termination(&store, NS, Duration::from_secs(5));
        let finish = async {
            tokio::time::sleep(Duration::from_secs(12)).await;
            store.modify::<Pod>(NS, "web-1", |p| {
                p.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
            });
        };
        let (result, ()) = tokio::join!(wait, finish);
        result.unwrap();
        assert!(active_writer_pods(&store, NS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quiesce_without_wait_returns_report() {
        let store = InMemoryStore::new();
        store.seed(deployment("web", Some(1)));
        store.seed(pod("web-1", Some("ReplicaSet"), "Running"));

        let options = QuiesceOptions {
            wait: false,
            ..Default::default()
        };
        let report = quiesce_and_wait(&store, NS, &options).await.unwrap();
        assert_eq!(report.acted.len(), 1);
        assert_eq!(report.namespace, NS);
    }

    #[test]
    fn options_default_to_five_second_poll() {
        let options: QuiesceOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.poll_interval(), Duration::from_secs(5));
        assert!(options.wait);
    }
}
