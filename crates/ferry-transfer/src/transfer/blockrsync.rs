//! blockrsync over a multiplexing proxy
//!
//! Every pair gets its own blockrsync process on each side. A proxy on each
//! side carries all of them over the one connection the endpoint and
//! transport provide: the source proxy tags each stream with the pair's
//! identifier and the target proxy hands stream `n` to
//! `localhost:BLOCKRSYNC_BASE_PORT + n`. When the payload finishes it
//! touches the control file, and the proxy and tunnel side-cars exit.

use ferry_common::kube_utils::{pod_phase, POD_PHASE_FAILED, POD_PHASE_SUCCEEDED};
use ferry_common::{Error, ObjectStore, Result};
use k8s_openapi::api::core::v1::{Container, Pod, Volume, VolumeDevice, VolumeMount};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::rsync::shell_quote;
use super::{Side, TransferCore, TransferType, WorkloadOptions, MOUNT_ROOT};
use crate::endpoint::Endpoint;
use crate::meta::{Pvc, PvcPairList};
use crate::resources::{pod, pvc_volume};
use crate::transport::{control_volume, control_volume_mount, Transport, CONTROL_FILE};

/// First port the target-side blockrsync processes listen on; pair `n`
/// listens on `BLOCKRSYNC_BASE_PORT + n`
pub const BLOCKRSYNC_BASE_PORT: u16 = 3000;

/// Port the proxies listen on when a tunnel sits in front of them
pub const BLOCKRSYNC_PROXY_PORT: u16 = 3222;

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: u32 = 131072;

/// File holding the disk image on a VM-disk filesystem volume
pub const VM_DISK_IMAGE: &str = "disk.img";

const BLOCKRSYNC_BINARY: &str = "/blockrsync";
const PROXY_BINARY: &str = "/proxy";

fn server_name(id: &str) -> String {
    format!("ferry-blockrsync-server-{}", id)
}

fn client_name(id: &str) -> String {
    format!("ferry-blockrsync-client-{}", id)
}

/// blockrsync options
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BlockrsyncOptions {
    /// Block size in bytes
    pub block_size: u32,
}

impl Default for BlockrsyncOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl BlockrsyncOptions {
    fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::validation("blockrsync block size must be positive"));
        }
        Ok(())
    }
}

/// Where a pair's device shows up inside a transfer pod
struct Device {
    volume: Volume,
    mount: Option<VolumeMount>,
    device: Option<VolumeDevice>,
    path: String,
}

/// Block claims are attached raw at `/dev/block-<i>`; VM-disk filesystem
/// claims are mounted at `/mnt/<i>` and copied from their disk image
fn device(pvc: &Pvc, index: usize) -> Device {
    let volume_name = format!("pvc-{}", index);
    let volume = pvc_volume(&volume_name, &pvc.name());
    if pvc.is_block() {
        let path = format!("/dev/block-{}", index);
        Device {
            volume,
            mount: None,
            device: Some(VolumeDevice {
                name: volume_name,
                device_path: path.clone(),
            }),
            path,
        }
    } else {
        let dir = format!("{}/{}", MOUNT_ROOT, index);
        Device {
            volume,
            mount: Some(VolumeMount {
                name: volume_name,
                mount_path: dir.clone(),
                ..Default::default()
            }),
            device: None,
            path: format!("{}/{}", dir, VM_DISK_IMAGE),
        }
    }
}

/// blockrsync transfer of block and VM-disk volumes
#[derive(Clone, Debug)]
pub struct BlockrsyncTransfer {
    pub(crate) core: TransferCore,
    options: BlockrsyncOptions,
}

impl BlockrsyncTransfer {
    /// Check the options and the endpoint/transport pairing. Nothing is
    /// created.
    pub fn new(
        pvcs: PvcPairList,
        endpoint: Endpoint,
        transport: Transport,
        options: BlockrsyncOptions,
        workload: WorkloadOptions,
    ) -> Result<Self> {
        options.validate()?;
        let core =
            TransferCore::new(TransferType::Blockrsync, pvcs, endpoint, transport, workload)?;
        Ok(Self { core, options })
    }

    /// Options
    pub fn options(&self) -> &BlockrsyncOptions {
        &self.options
    }

    fn devices(&self, side: Side) -> Vec<Device> {
        self.core
            .pvcs
            .iter()
            .enumerate()
            .map(|(i, pair)| match side {
                Side::Server => device(pair.destination(), i),
                Side::Client => device(pair.source(), i),
            })
            .collect()
    }

    fn identifiers(&self) -> Vec<String> {
        self.core.pvcs.iter().map(|p| p.id().to_string()).collect()
    }

    /// Payload container running `script`, with every device attached and
    /// the control volume mounted
    fn payload(&self, devices: &[Device], script: String) -> Container {
        let mut mounts: Vec<VolumeMount> =
            devices.iter().filter_map(|d| d.mount.clone()).collect();
        mounts.push(control_volume_mount(CONTROL_FILE));
        let block_devices: Vec<VolumeDevice> =
            devices.iter().filter_map(|d| d.device.clone()).collect();
        Container {
            name: "blockrsync".to_string(),
            image: Some(self.core.workload.images.blockrsync.clone()),
            command: Some(vec!["/bin/bash".to_string(), "-c".to_string(), script]),
            volume_mounts: Some(mounts),
            volume_devices: (!block_devices.is_empty()).then_some(block_devices),
            ..Default::default()
        }
    }

    fn proxy(&self, args: Vec<String>) -> Container {
        let mut command = vec![PROXY_BINARY.to_string()];
        command.extend(args);
        command.push("--control-file".to_string());
        command.push(CONTROL_FILE.to_string());
        Container {
            name: "proxy".to_string(),
            image: Some(self.core.workload.images.blockrsync.clone()),
            command: Some(command),
            volume_mounts: Some(vec![control_volume_mount(CONTROL_FILE)]),
            ..Default::default()
        }
    }

    /// Start one target process per pair, wait for all of them
    fn server_script(&self, devices: &[Device]) -> String {
        let mut script = format!("trap 'touch {}' EXIT\npids=\"\"\n", CONTROL_FILE);
        for (i, (device, id)) in devices.iter().zip(self.identifiers()).enumerate() {
            script.push_str(&format!(
                "{} {} --target --identifier {} --port {} --block-size {} &\npids=\"$pids $!\"\n",
                BLOCKRSYNC_BINARY,
                shell_quote(&device.path),
                id,
                BLOCKRSYNC_BASE_PORT as usize + i,
                self.options.block_size
            ));
        }
        script.push_str("status=0\n");
        script.push_str("for pid in $pids; do wait $pid || status=1; done\n");
        script.push_str("exit $status\n");
        script
    }

    /// Copy pair after pair, stopping at the first failure
    fn client_script(&self, devices: &[Device]) -> String {
        let mut script = format!("trap 'touch {}' EXIT\nset -e\n", CONTROL_FILE);
        for (device, id) in devices.iter().zip(self.identifiers()) {
            script.push_str(&format!(
                "{} {} --source --target-address localhost --port {} --identifier {} --block-size {}\n",
                BLOCKRSYNC_BINARY,
                shell_quote(&device.path),
                BLOCKRSYNC_PROXY_PORT,
                id,
                self.options.block_size
            ));
        }
        script
    }

    pub(crate) async fn create_server<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        let id = self.core.id().to_string();
        let namespace = self.core.server_namespace();
        let labels = self.core.server_labels();

        self.core
            .transport
            .create_server(
                store,
                &id,
                &self.core.endpoint,
                BLOCKRSYNC_PROXY_PORT,
                Some(CONTROL_FILE),
            )
            .await?;

        let listen_port = self.core.listen_port(BLOCKRSYNC_PROXY_PORT);
        let devices = self.devices(Side::Server);
        let mut proxy_args = vec![
            "--target".to_string(),
            "--listen-port".to_string(),
            listen_port.to_string(),
            "--target-address".to_string(),
            "localhost".to_string(),
            "--target-port".to_string(),
            BLOCKRSYNC_BASE_PORT.to_string(),
        ];
        for identifier in self.identifiers() {
            proxy_args.push("--identifier".to_string());
            proxy_args.push(identifier);
        }
        let containers = vec![
            self.payload(&devices, self.server_script(&devices)),
            self.proxy(proxy_args),
        ];
        let mut volumes: Vec<Volume> = devices.into_iter().map(|d| d.volume).collect();
        volumes.push(control_volume());
        let spec = self
            .core
            .pod_spec(Side::Server, containers, volumes, Some("Never"));
        store
            .create(&pod(&namespace, &server_name(&id), &labels, spec))
            .await?;
        info!(
            namespace = %namespace,
            name = %server_name(&id),
            pairs = self.core.pvcs.len(),
            "created blockrsync server"
        );

        self.core.endpoint.create(store).await
    }

    pub(crate) async fn create_client<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        let id = self.core.id().to_string();
        let namespace = self.core.client_namespace();
        let labels = self.core.client_labels();
        let target = self.core.connection_target()?;

        self.core
            .transport
            .create_client(store, &namespace, &id, &self.core.endpoint, Some(CONTROL_FILE))
            .await?;

        let devices = self.devices(Side::Client);
        let proxy_args = vec![
            "--source".to_string(),
            "--listen-port".to_string(),
            BLOCKRSYNC_PROXY_PORT.to_string(),
            "--target-address".to_string(),
            target.hostname,
            "--target-port".to_string(),
            target.port.to_string(),
        ];
        let containers = vec![
            self.payload(&devices, self.client_script(&devices)),
            self.proxy(proxy_args),
        ];
        let mut volumes: Vec<Volume> = devices.into_iter().map(|d| d.volume).collect();
        volumes.push(control_volume());
        let spec = self
            .core
            .pod_spec(Side::Client, containers, volumes, Some("Never"));
        store
            .create(&pod(&namespace, &client_name(&id), &labels, spec))
            .await?;
        info!(namespace = %namespace, name = %client_name(&id), "created blockrsync client");
        Ok(())
    }

    /// Whether the client pod ran to completion. A failed client is an
    /// error rather than "not yet".
    pub(crate) async fn is_client_complete<S: ObjectStore>(&self, store: &S) -> Result<bool> {
        let namespace = self.core.client_namespace();
        let name = client_name(self.core.id());
        let Some(client) = store.get::<Pod>(&namespace, &name).await? else {
            debug!(namespace = %namespace, name = %name, "blockrsync client not found");
            return Ok(false);
        };
        match pod_phase(&client) {
            Some(POD_PHASE_SUCCEEDED) => Ok(true),
            Some(POD_PHASE_FAILED) => Err(Error::internal_with_context(
                "blockrsync",
                format!("client pod {}/{} failed", namespace, name),
            )),
            _ => Ok(false),
        }
    }
}
