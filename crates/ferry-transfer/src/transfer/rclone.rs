//! rclone WebDAV server on the destination, `rclone sync` on the source
//!
//! The client always sends `Host: <endpoint hostname>`, so a shared ingress
//! or router can pick the destination by header even when the client
//! connects to a local tunnel.

use ferry_common::{ObjectStore, Result};
use k8s_openapi::api::core::v1::{Container, ContainerPort, VolumeMount};
use minijinja::context;
use tracing::info;

use super::rsync::shell_quote;
use super::{Side, TransferCore, TransferType, WorkloadOptions, MOUNT_ROOT};
use crate::endpoint::Endpoint;
use crate::meta::PvcPairList;
use crate::resources::{deployment, pod, secret, secret_env, secret_volume, string_data};
use crate::template;
use crate::transport::{control_volume, control_volume_mount, Transport, CONTROL_FILE};

/// Port the WebDAV server listens on behind a tunnel
pub const RCLONE_PORT: u16 = 8080;

/// Name of the remote in the client's `rclone.conf`
pub const RCLONE_REMOTE: &str = "destination";

const RCLONE_BINARY: &str = "/usr/local/bin/rclone";
const CONFIG_DIR: &str = "/etc/rclone";
const CONFIG_KEY: &str = "rclone.conf";
const CONFIG_VOLUME: &str = "rclone-config";
const USER_ENV: &str = "RCLONE_USER";
const PASS_ENV: &str = "RCLONE_PASS";

fn secret_name(id: &str) -> String {
    format!("ferry-rclone-secret-{}", id)
}

fn server_name(id: &str) -> String {
    format!("ferry-rclone-server-{}", id)
}

fn client_config_name(id: &str) -> String {
    format!("ferry-rclone-client-config-{}", id)
}

fn client_name(id: &str) -> String {
    format!("ferry-rclone-client-{}", id)
}

/// rclone transfer of filesystem volumes
#[derive(Clone, Debug)]
pub struct RcloneTransfer {
    pub(crate) core: TransferCore,
}

impl RcloneTransfer {
    /// Check the endpoint/transport pairing and generate credentials.
    /// Nothing is created.
    pub fn new(
        pvcs: PvcPairList,
        endpoint: Endpoint,
        transport: Transport,
        workload: WorkloadOptions,
    ) -> Result<Self> {
        let core = TransferCore::new(TransferType::Rclone, pvcs, endpoint, transport, workload)?;
        Ok(Self { core })
    }

    pub(crate) async fn create_server<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        let id = self.core.id().to_string();
        let namespace = self.core.server_namespace();
        let labels = self.core.server_labels();

        store
            .create(&secret(
                &namespace,
                &secret_name(&id),
                &labels,
                string_data([
                    (USER_ENV, self.core.credentials.username().to_string()),
                    (PASS_ENV, self.core.credentials.password().to_string()),
                ]),
            ))
            .await?;

        self.core
            .transport
            .create_server(store, &id, &self.core.endpoint, RCLONE_PORT, None)
            .await?;

        let port = self.core.listen_port(RCLONE_PORT);
        let (volumes, mounts) = self.core.filesystem_volumes(Side::Server);
        let container = Container {
            name: "rclone".to_string(),
            image: Some(self.core.workload.images.rclone.clone()),
            command: Some(vec![
                RCLONE_BINARY.to_string(),
                "serve".to_string(),
                "webdav".to_string(),
                MOUNT_ROOT.to_string(),
                "--addr".to_string(),
                format!(":{}", port),
                "--user".to_string(),
                format!("$({})", USER_ENV),
                "--pass".to_string(),
                format!("$({})", PASS_ENV),
            ]),
            env: Some(vec![
                secret_env(USER_ENV, &secret_name(&id), USER_ENV),
                secret_env(PASS_ENV, &secret_name(&id), PASS_ENV),
            ]),
            ports: Some(vec![ContainerPort {
                name: Some("webdav".to_string()),
                container_port: i32::from(port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(mounts),
            ..Default::default()
        };
        let spec = self
            .core
            .pod_spec(Side::Server, vec![container], volumes, None);
        store
            .create(&deployment(&namespace, &server_name(&id), &labels, spec))
            .await?;
        info!(namespace = %namespace, name = %server_name(&id), port, "created rclone server");

        self.core.endpoint.create(store).await
    }

    /// `rclone.conf` with the remote pointing at the server. HTTPS only when
    /// the client talks straight to an endpoint that terminates TLS.
    fn rclone_conf(&self) -> Result<String> {
        let target = self.core.connection_target()?;
        let scheme = if self.core.transport.direct() && self.core.endpoint.terminates_tls() {
            "https"
        } else {
            "http"
        };
        let host_header = self
            .core
            .endpoint
            .hostname()
            .map(str::to_string)
            .unwrap_or_else(|| target.hostname.clone());
        template::render(
            template::RCLONE,
            context! {
                remote => RCLONE_REMOTE,
                scheme => scheme,
                username => self.core.credentials.username(),
                password => self.core.credentials.password(),
                hostname => target.hostname,
                port => target.port,
                host_header => host_header,
            },
        )
    }

    fn client_script(&self) -> String {
        let mut script = format!("trap 'touch {}' EXIT\nset -e\n", CONTROL_FILE);
        for pair in self.core.pvcs.iter() {
            script.push_str(&format!(
                "{} sync --config {}/{} {} {}\n",
                RCLONE_BINARY,
                CONFIG_DIR,
                CONFIG_KEY,
                shell_quote(&format!("{}/{}/", MOUNT_ROOT, pair.source().name())),
                shell_quote(&format!("{}:/{}/", RCLONE_REMOTE, pair.destination().name())),
            ));
        }
        script
    }

    pub(crate) async fn create_client<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        let id = self.core.id().to_string();
        let namespace = self.core.client_namespace();
        let labels = self.core.client_labels();

        let conf = self.rclone_conf()?;
        store
            .create(&secret(
                &namespace,
                &client_config_name(&id),
                &labels,
                string_data([(CONFIG_KEY, conf)]),
            ))
            .await?;

        self.core
            .transport
            .create_client(store, &namespace, &id, &self.core.endpoint, Some(CONTROL_FILE))
            .await?;

        let (mut volumes, mut mounts) = self.core.filesystem_volumes(Side::Client);
        mounts.push(VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        mounts.push(control_volume_mount(CONTROL_FILE));
        volumes.push(secret_volume(CONFIG_VOLUME, &client_config_name(&id), None, None));
        volumes.push(control_volume());
        let container = Container {
            name: "rclone".to_string(),
            image: Some(self.core.workload.images.rclone.clone()),
            command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                self.client_script(),
            ]),
            volume_mounts: Some(mounts),
            ..Default::default()
        };
        let spec = self
            .core
            .pod_spec(Side::Client, vec![container], volumes, Some("Never"));
        store
            .create(&pod(&namespace, &client_name(&id), &labels, spec))
            .await?;
        info!(namespace = %namespace, name = %client_name(&id), "created rclone client");
        Ok(())
    }
}
