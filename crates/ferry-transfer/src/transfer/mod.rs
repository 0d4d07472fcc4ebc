//! Copy workloads on both sides of a transfer
//!
//! A [`Transfer`] owns one [`Endpoint`], one [`Transport`] and the
//! [`PvcPairList`] it copies. Creating the server side runs, in order: the
//! variant's config and credential objects, the transport server, the
//! server workload, the endpoint. Creating the client side runs: the
//! client's config and credential objects, the transport client, the client
//! workload. Later steps read what earlier steps populated (generated
//! password, endpoint hostname), so the order is fixed.
//!
//! Everything is checked when the transfer is constructed, before any
//! object exists:
//!
//! - the endpoint lives in the destination namespace of the pairs
//! - an endpoint that only passes TLS gets a tunnelling transport
//! - an endpoint that terminates TLS is only used by a direct rclone
//!   transfer, which can speak HTTPS to it
//! - block and VM-disk pairs go to blockrsync, filesystem pairs to rsync or
//!   rclone

pub mod blockrsync;
pub mod rclone;
pub mod rsync;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ferry_common::kube_utils::{pod_phase, POD_PHASE_RUNNING};
use ferry_common::labels::{merged, selector_string, LABEL_COMPONENT, LABEL_TRANSFER};
use ferry_common::{Error, ObjectStore, Result};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, Volume, VolumeMount};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::endpoint::Endpoint;
use crate::meta::PvcPairList;
use crate::resources::pvc_volume;
use crate::transport::{connection_target, ConnectionTarget, Transport};

pub use blockrsync::{BlockrsyncOptions, BlockrsyncTransfer};
pub use rclone::RcloneTransfer;
pub use rsync::{RsyncOptions, RsyncTransfer};

/// User name every transfer authenticates as
pub const TRANSFER_USERNAME: &str = "ferry";

/// Length of generated transfer passwords
pub const PASSWORD_LENGTH: usize = 24;

/// Root under which volumes are mounted in transfer pods
pub const MOUNT_ROOT: &str = "/mnt";

/// Default rsync image
pub const DEFAULT_RSYNC_IMAGE: &str = "ghcr.io/ferry-dev/rsync-transfer:latest";
/// Default rclone image
pub const DEFAULT_RCLONE_IMAGE: &str = "docker.io/rclone/rclone:1.66";
/// Default blockrsync image, which also carries the proxy binary
pub const DEFAULT_BLOCKRSYNC_IMAGE: &str = "ghcr.io/ferry-dev/blockrsync:latest";

/// Transfer variant names
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    /// File copy through an rsync daemon
    Rsync,
    /// File sync over WebDAV
    Rclone,
    /// Block-device sync
    Blockrsync,
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferType::Rsync => write!(f, "rsync"),
            TransferType::Rclone => write!(f, "rclone"),
            TransferType::Blockrsync => write!(f, "blockrsync"),
        }
    }
}

impl FromStr for TransferType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rsync" => Ok(Self::Rsync),
            "rclone" => Ok(Self::Rclone),
            "blockrsync" => Ok(Self::Blockrsync),
            other => Err(Error::configuration(format!(
                "unknown transfer type '{}', expected rsync, rclone or blockrsync",
                other
            ))),
        }
    }
}

/// User name and password shared by a transfer's server and client
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Fresh credentials with a random alphanumeric password from the
    /// thread-local CSPRNG
    pub fn generate() -> Self {
        let password = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LENGTH)
            .map(char::from)
            .collect();
        Self {
            username: TRANSFER_USERNAME.to_string(),
            password,
        }
    }

    /// User name
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Password
    pub fn password(&self) -> &str {
        &self.password
    }
}

/// Images for the transfer workloads
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferImages {
    /// rsync daemon and client
    pub rsync: String,
    /// rclone server and client
    pub rclone: String,
    /// blockrsync payload and proxy
    pub blockrsync: String,
}

impl Default for TransferImages {
    fn default() -> Self {
        Self {
            rsync: DEFAULT_RSYNC_IMAGE.to_string(),
            rclone: DEFAULT_RCLONE_IMAGE.to_string(),
            blockrsync: DEFAULT_BLOCKRSYNC_IMAGE.to_string(),
        }
    }
}

/// Pod-level knobs applied to transfer workloads
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkloadOptions {
    /// Images
    pub images: TransferImages,
    /// Node the server pod is pinned to
    pub node_name: Option<String>,
    /// Extra labels on every transfer pod. Endpoint labels take precedence
    /// on server pods.
    pub labels: BTreeMap<String, String>,
    /// Service account for transfer pods
    pub service_account_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Side {
    Server,
    Client,
}

/// Reject endpoint, transport and volume combinations that cannot work
fn check_compatible(
    transfer_type: TransferType,
    pvcs: &PvcPairList,
    endpoint: &Endpoint,
    transport: &Transport,
) -> Result<()> {
    let endpoint_ns = &endpoint.namespaced_name().namespace;
    if *endpoint_ns != pvcs.destination_namespace() {
        return Err(Error::configuration(format!(
            "endpoint {} is not in destination namespace {}",
            endpoint.namespaced_name(),
            pvcs.destination_namespace()
        )));
    }
    if transport.direct() && endpoint.requires_tls() {
        return Err(Error::configuration(format!(
            "{} endpoint {} only passes TLS traffic and needs a tunnelling transport",
            endpoint.endpoint_type(),
            endpoint.namespaced_name()
        )));
    }
    if endpoint.terminates_tls() && !(transport.direct() && transfer_type == TransferType::Rclone) {
        return Err(Error::configuration(format!(
            "endpoint {} terminates TLS; only rclone over a direct transport can use it",
            endpoint.namespaced_name()
        )));
    }
    match (transfer_type, pvcs.is_block_or_vm_disk()) {
        (TransferType::Blockrsync, false) => Err(Error::configuration(
            "blockrsync copies block or VM-disk volumes, not filesystem volumes",
        )),
        (TransferType::Rsync | TransferType::Rclone, true) => Err(Error::configuration(format!(
            "{} copies filesystem volumes; use blockrsync for block or VM-disk volumes",
            transfer_type
        ))),
        _ => Ok(()),
    }
}

/// State shared by every transfer variant
#[derive(Clone, Debug)]
pub(crate) struct TransferCore {
    pub(crate) transfer_type: TransferType,
    pub(crate) pvcs: PvcPairList,
    pub(crate) endpoint: Endpoint,
    pub(crate) transport: Transport,
    pub(crate) credentials: Credentials,
    pub(crate) workload: WorkloadOptions,
}

impl TransferCore {
    pub(crate) fn new(
        transfer_type: TransferType,
        pvcs: PvcPairList,
        endpoint: Endpoint,
        transport: Transport,
        workload: WorkloadOptions,
    ) -> Result<Self> {
        check_compatible(transfer_type, &pvcs, &endpoint, &transport)?;
        Ok(Self {
            transfer_type,
            pvcs,
            endpoint,
            transport,
            credentials: Credentials::generate(),
            workload,
        })
    }

    pub(crate) fn id(&self) -> &str {
        self.pvcs.transfer_id()
    }

    pub(crate) fn server_namespace(&self) -> String {
        self.endpoint.namespaced_name().namespace.clone()
    }

    pub(crate) fn client_namespace(&self) -> String {
        self.pvcs.source_namespace()
    }

    /// Port the server workload listens on: the endpoint's exposed port
    /// when nothing sits in between, else `backend_port` behind the tunnel
    pub(crate) fn listen_port(&self, backend_port: u16) -> u16 {
        if self.transport.direct() {
            self.endpoint.exposed_port()
        } else {
            backend_port
        }
    }

    pub(crate) fn connection_target(&self) -> Result<ConnectionTarget> {
        connection_target(&self.endpoint, &self.transport)
    }

    fn component(&self, side: Side) -> String {
        match side {
            Side::Server => format!("{}-server", self.transfer_type),
            Side::Client => format!("{}-client", self.transfer_type),
        }
    }

    /// Labels for server pods; they must carry the endpoint's labels so the
    /// endpoint's Service selects them
    pub(crate) fn server_labels(&self) -> BTreeMap<String, String> {
        let mut labels = merged(&self.workload.labels, self.endpoint.labels());
        labels.insert(LABEL_COMPONENT.to_string(), self.component(Side::Server));
        labels
    }

    pub(crate) fn client_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.workload.labels.clone();
        labels.insert(LABEL_TRANSFER.to_string(), self.id().to_string());
        labels.insert(LABEL_COMPONENT.to_string(), self.component(Side::Client));
        labels
    }

    /// Pod spec with the transport's side-cars and volumes spliced in
    pub(crate) fn pod_spec(
        &self,
        side: Side,
        mut containers: Vec<Container>,
        mut volumes: Vec<Volume>,
        restart_policy: Option<&str>,
    ) -> PodSpec {
        let (sidecars, sidecar_volumes) = match side {
            Side::Server => (
                self.transport.server_containers(),
                self.transport.server_volumes(),
            ),
            Side::Client => (
                self.transport.client_containers(),
                self.transport.client_volumes(),
            ),
        };
        containers.extend(sidecars.iter().cloned());
        volumes.extend(sidecar_volumes.iter().cloned());
        PodSpec {
            containers,
            volumes: Some(volumes),
            node_name: match side {
                Side::Server => self.workload.node_name.clone(),
                Side::Client => None,
            },
            service_account_name: self.workload.service_account_name.clone(),
            restart_policy: restart_policy.map(str::to_string),
            ..Default::default()
        }
    }

    /// One volume per pair, mounted at `/mnt/<claim name>`: destination
    /// claims on the server, source claims on the client
    pub(crate) fn filesystem_volumes(&self, side: Side) -> (Vec<Volume>, Vec<VolumeMount>) {
        self.pvcs
            .iter()
            .enumerate()
            .map(|(i, pair)| {
                let pvc = match side {
                    Side::Server => pair.destination(),
                    Side::Client => pair.source(),
                };
                let volume_name = format!("pvc-{}", i);
                let mount = VolumeMount {
                    name: volume_name.clone(),
                    mount_path: format!("{}/{}", MOUNT_ROOT, pvc.name()),
                    ..Default::default()
                };
                (pvc_volume(&volume_name, &pvc.name()), mount)
            })
            .unzip()
    }

    /// Whether the server is up: at least one pod matches and every
    /// matching pod is `Running`. Pending, failed or finished pods all count
    /// as not healthy.
    pub(crate) async fn is_server_healthy<S: ObjectStore>(&self, store: &S) -> Result<bool> {
        let namespace = self.server_namespace();
        let selector = selector_string(&self.server_labels_selector());
        let pods: Vec<Pod> = store.list(&namespace, Some(&selector)).await?;
        let healthy = !pods.is_empty()
            && pods
                .iter()
                .all(|pod| pod_phase(pod) == Some(POD_PHASE_RUNNING));
        debug!(
            namespace = %namespace,
            selector = %selector,
            pods = pods.len(),
            healthy,
            "checked server pods"
        );
        Ok(healthy)
    }

    fn server_labels_selector(&self) -> BTreeMap<String, String> {
        let mut labels = self.endpoint.labels().clone();
        labels.insert(LABEL_COMPONENT.to_string(), self.component(Side::Server));
        labels
    }
}

/// A copy between the volumes of a [`PvcPairList`]
#[derive(Clone, Debug)]
pub enum Transfer {
    /// rsync daemon and client
    Rsync(RsyncTransfer),
    /// rclone WebDAV server and sync client
    Rclone(RcloneTransfer),
    /// blockrsync over a multiplexing proxy
    Blockrsync(BlockrsyncTransfer),
}

impl From<RsyncTransfer> for Transfer {
    fn from(t: RsyncTransfer) -> Self {
        Transfer::Rsync(t)
    }
}

impl From<RcloneTransfer> for Transfer {
    fn from(t: RcloneTransfer) -> Self {
        Transfer::Rclone(t)
    }
}

impl From<BlockrsyncTransfer> for Transfer {
    fn from(t: BlockrsyncTransfer) -> Self {
        Transfer::Blockrsync(t)
    }
}

impl Transfer {
    fn core(&self) -> &TransferCore {
        match self {
            Transfer::Rsync(t) => &t.core,
            Transfer::Rclone(t) => &t.core,
            Transfer::Blockrsync(t) => &t.core,
        }
    }

    fn core_mut(&mut self) -> &mut TransferCore {
        match self {
            Transfer::Rsync(t) => &mut t.core,
            Transfer::Rclone(t) => &mut t.core,
            Transfer::Blockrsync(t) => &mut t.core,
        }
    }

    /// Variant of this transfer
    pub fn transfer_type(&self) -> TransferType {
        self.core().transfer_type
    }

    /// Pairs being copied
    pub fn pvcs(&self) -> &PvcPairList {
        &self.core().pvcs
    }

    /// Destination endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.core().endpoint
    }

    /// Transport between client and server
    pub fn transport(&self) -> &Transport {
        &self.core().transport
    }

    /// Generated credentials
    pub fn credentials(&self) -> &Credentials {
        &self.core().credentials
    }

    /// Swap in an endpoint and transport hydrated elsewhere (typically by
    /// `discover` on the destination), keeping pairs and credentials.
    pub fn with_connection(mut self, endpoint: Endpoint, transport: Transport) -> Result<Self> {
        let core = self.core_mut();
        check_compatible(core.transfer_type, &core.pvcs, &endpoint, &transport)?;
        core.endpoint = endpoint;
        core.transport = transport;
        Ok(self)
    }

    /// Create the server side in the destination namespace
    #[instrument(
        skip(self, store),
        fields(transfer = %self.transfer_type(), id = %self.core().id())
    )]
    pub async fn create_server<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        match self {
            Transfer::Rsync(t) => t.create_server(store).await,
            Transfer::Rclone(t) => t.create_server(store).await,
            Transfer::Blockrsync(t) => t.create_server(store).await,
        }
    }

    /// Create the client side in the source namespace. The endpoint must
    /// know its hostname, so wait for it to be healthy first.
    #[instrument(
        skip(self, store),
        fields(transfer = %self.transfer_type(), id = %self.core().id())
    )]
    pub async fn create_client<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        match self {
            Transfer::Rsync(t) => t.create_client(store).await,
            Transfer::Rclone(t) => t.create_client(store).await,
            Transfer::Blockrsync(t) => t.create_client(store).await,
        }
    }

    /// Whether the server pods exist and are all `Running`. One pending or
    /// failed pod is enough to report not healthy.
    pub async fn is_server_healthy<S: ObjectStore>(&self, store: &S) -> Result<bool> {
        self.core().is_server_healthy(store).await
    }

    /// Whether the client has finished copying. Only blockrsync can tell;
    /// the file transfers leave completion to the caller.
    pub async fn is_client_complete<S: ObjectStore>(&self, store: &S) -> Result<bool> {
        match self {
            Transfer::Blockrsync(t) => t.is_client_complete(store).await,
            other => Err(Error::configuration(format!(
                "{} transfers do not report client completion",
                other.transfer_type()
            ))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::endpoint::test_support::{labels, nn};
    use crate::endpoint::{IngressEndpoint, RouteEndpoint, RouteTermination, ServiceEndpoint};
    use crate::transport::{NullTransport, StunnelOptions, StunnelTransport};
    use ferry_common::testing::InMemoryStore;
    use k8s_openapi::api::core::v1::PodStatus;

    fn stunnel() -> Transport {
        StunnelTransport::new(StunnelOptions::default()).into()
    }

    fn null() -> Transport {
        NullTransport::new().into()
    }

    fn running_pod(name: &str, labels: BTreeMap<String, String>, phase: &str) -> Pod {
        let mut pod = crate::resources::pod("dest", name, &labels, PodSpec::default());
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn generated_passwords_are_long_and_distinct() {
        let a = Credentials::generate();
        let b = Credentials::generate();
        assert_eq!(a.username(), "ferry");
        assert_eq!(a.password().len(), PASSWORD_LENGTH);
        assert!(a.password().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a.password(), b.password());
        assert!(!format!("{:?}", a).contains(a.password()));
    }

    #[test]
    fn transfer_type_parses() {
        assert_eq!("rclone".parse::<TransferType>().unwrap(), TransferType::Rclone);
        assert_eq!(TransferType::Blockrsync.to_string(), "blockrsync");
        assert!("scp".parse::<TransferType>().is_err());
    }

    /// Story: an SNI-routed endpoint cannot carry plain traffic
    #[test]
    fn story_passthrough_endpoints_need_a_tunnel() {
        let pvcs = filesystem_pairs();
        let id = pvcs.transfer_id().to_string();
        let ingress: Endpoint =
            IngressEndpoint::new(nn("dest", "ferry-x"), &labels(&id), "apps.example.com", None)
                .into();

        let err = RsyncTransfer::new(
            pvcs.clone(),
            ingress.clone(),
            null(),
            RsyncOptions::default(),
            WorkloadOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));

        assert!(RsyncTransfer::new(
            pvcs,
            ingress,
            stunnel(),
            RsyncOptions::default(),
            WorkloadOptions::default()
        )
        .is_ok());
    }

    #[test]
    fn edge_routes_only_serve_direct_rclone() {
        let pvcs = filesystem_pairs();
        let edge: Endpoint = RouteEndpoint::new(
            nn("dest", "ferry-x"),
            &labels(pvcs.transfer_id()),
            RouteTermination::Edge,
            Some("apps.example.com"),
        )
        .into();

        let workload = WorkloadOptions::default;
        assert!(RcloneTransfer::new(pvcs.clone(), edge.clone(), null(), workload()).is_ok());
        assert!(RcloneTransfer::new(pvcs.clone(), edge.clone(), stunnel(), workload()).is_err());
        assert!(RsyncTransfer::new(
            pvcs,
            edge,
            null(),
            RsyncOptions::default(),
            WorkloadOptions::default()
        )
        .is_err());
    }

    /// Story: filesystem and block volumes go to different transfers
    #[test]
    fn story_volume_mode_selects_transfer() {
        let fs = filesystem_pairs();
        let block = block_pairs();

        let err = BlockrsyncTransfer::new(
            fs.clone(),
            cluster_ip_endpoint(&fs),
            null(),
            BlockrsyncOptions::default(),
            WorkloadOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not filesystem"));

        let err = RsyncTransfer::new(
            block.clone(),
            cluster_ip_endpoint(&block),
            null(),
            RsyncOptions::default(),
            WorkloadOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));

        assert!(RcloneTransfer::new(
            block.clone(),
            cluster_ip_endpoint(&block),
            null(),
            WorkloadOptions::default()
        )
        .is_err());
    }

    #[test]
    fn endpoint_must_live_in_destination_namespace() {
        let pvcs = filesystem_pairs();
        let elsewhere: Endpoint =
            ServiceEndpoint::cluster_ip(nn("other", "ferry-x"), &labels(pvcs.transfer_id())).into();
        let err =
            RcloneTransfer::new(pvcs, elsewhere, null(), WorkloadOptions::default()).unwrap_err();
        assert!(err.to_string().contains("destination namespace dest"));
    }

    #[tokio::test]
    async fn server_health_requires_every_pod_running() {
        let store = InMemoryStore::new();
        let pvcs = filesystem_pairs();
        let transfer: Transfer = RsyncTransfer::new(
            pvcs.clone(),
            cluster_ip_endpoint(&pvcs),
            null(),
            RsyncOptions::default(),
            WorkloadOptions::default(),
        )
        .unwrap()
        .into();
        assert!(!transfer.is_server_healthy(&store).await.unwrap());

        let labels = match &transfer {
            Transfer::Rsync(t) => t.core.server_labels(),
            _ => unreachable!(),
        };
        store.seed(running_pod("server-a", labels.clone(), "Running"));
        assert!(transfer.is_server_healthy(&store).await.unwrap());

        store.seed(running_pod("server-b", labels.clone(), "Pending"));
        assert!(!transfer.is_server_healthy(&store).await.unwrap());

        store.seed(running_pod("server-b", labels, "Failed"));
        assert!(!transfer.is_server_healthy(&store).await.unwrap());
    }

    #[tokio::test]
    async fn file_transfers_do_not_report_completion() {
        let store = InMemoryStore::new();
        let pvcs = filesystem_pairs();
        let transfer: Transfer = RcloneTransfer::new(
            pvcs.clone(),
            cluster_ip_endpoint(&pvcs),
            null(),
            WorkloadOptions::default(),
        )
        .unwrap()
        .into();
        assert!(matches!(
            transfer.is_client_complete(&store).await,
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn extra_labels_never_override_endpoint_labels() {
        let pvcs = filesystem_pairs();
        let id = pvcs.transfer_id().to_string();
        let workload = WorkloadOptions {
            labels: BTreeMap::from([
                (LABEL_TRANSFER.to_string(), "hijacked".to_string()),
                ("team".to_string(), "storage".to_string()),
            ]),
            ..Default::default()
        };
        let endpoint = cluster_ip_endpoint(&pvcs);
        let transfer = RcloneTransfer::new(pvcs.clone(), endpoint, null(), workload).unwrap();
        let labels = transfer.core.server_labels();
        assert_eq!(labels[LABEL_TRANSFER], id);
        assert_eq!(labels["team"], "storage");
        assert_eq!(labels[LABEL_COMPONENT], "rclone-server");
    }

    #[test]
    fn rebinding_keeps_credentials() {
        let pvcs = filesystem_pairs();
        let transfer: Transfer = RsyncTransfer::new(
            pvcs.clone(),
            cluster_ip_endpoint(&pvcs),
            null(),
            RsyncOptions::default(),
            WorkloadOptions::default(),
        )
        .unwrap()
        .into();
        let credentials = transfer.credentials().clone();
        let rebound = transfer
            .with_connection(cluster_ip_endpoint(&pvcs), stunnel())
            .unwrap();
        assert_eq!(rebound.credentials(), &credentials);
        assert!(!rebound.transport().direct());
    }
}
