//! rsync daemon on the destination, rsync client on the source
//!
//! The daemon exposes one module, `mnt`, rooted at `/mnt` where every
//! destination claim is mounted under its own name. The client pushes each
//! source claim to its destination directory in turn and stops at the first
//! failure.

mod options;

use std::collections::BTreeMap;

use ferry_common::{ObjectStore, Result};
use k8s_openapi::api::core::v1::{Container, ContainerPort, VolumeMount};
use minijinja::context;
use tracing::info;

use super::{Side, TransferCore, TransferType, WorkloadOptions, MOUNT_ROOT};
use crate::endpoint::Endpoint;
use crate::meta::PvcPairList;
use crate::resources::{
    config_map, config_map_volume, deployment, pod, secret, secret_env, secret_volume,
    string_data,
};
use crate::template;
use crate::transport::{control_volume, control_volume_mount, Transport, CONTROL_FILE};

pub use options::{RsyncOptions, DEFAULT_BW_LIMIT, DEFAULT_INFO};

/// Port the daemon listens on behind a tunnel
pub const RSYNC_PORT: u16 = 8873;

/// Module the daemon exposes
pub const RSYNC_MODULE: &str = "mnt";

/// Secrets file the daemon authenticates against
pub const RSYNC_SECRETS_FILE: &str = "/etc/rsync-secret/rsyncd.secrets";

/// Key of `user:password` in the server Secret
pub const CREDENTIALS_KEY: &str = "credentials";

const RSYNC_BINARY: &str = "/usr/bin/rsync";
const CONFIG_DIR: &str = "/etc/rsyncd";
const SECRET_DIR: &str = "/etc/rsync-secret";
const CONFIG_VOLUME: &str = "rsyncd-config";
const SECRET_VOLUME: &str = "rsync-secret";
const PASSWORD_ENV: &str = "RSYNC_PASSWORD";
const SECRETS_FILE_MODE: i32 = 0o600;
const MAX_CONNECTIONS: usize = 10;

fn config_map_name(id: &str) -> String {
    format!("ferry-rsync-config-{}", id)
}

fn secret_name(id: &str) -> String {
    format!("ferry-rsync-secret-{}", id)
}

fn server_name(id: &str) -> String {
    format!("ferry-rsync-server-{}", id)
}

fn client_secret_name(id: &str) -> String {
    format!("ferry-rsync-client-secret-{}", id)
}

fn client_name(id: &str) -> String {
    format!("ferry-rsync-client-{}", id)
}

/// Single-quote `arg` for `sh`
pub(crate) fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// rsync transfer of filesystem volumes
#[derive(Clone, Debug)]
pub struct RsyncTransfer {
    pub(crate) core: TransferCore,
    options: RsyncOptions,
}

impl RsyncTransfer {
    /// Check the options and the endpoint/transport pairing and generate
    /// credentials. Nothing is created.
    pub fn new(
        pvcs: PvcPairList,
        endpoint: Endpoint,
        transport: Transport,
        options: RsyncOptions,
        workload: WorkloadOptions,
    ) -> Result<Self> {
        options.validate()?;
        let core = TransferCore::new(TransferType::Rsync, pvcs, endpoint, transport, workload)?;
        Ok(Self { core, options })
    }

    /// Client flags
    pub fn options(&self) -> &RsyncOptions {
        &self.options
    }

    fn rsyncd_conf(&self) -> Result<String> {
        template::render(
            template::RSYNCD,
            context! {
                max_connections => MAX_CONNECTIONS.max(self.core.pvcs.len()),
                direct => self.core.transport.direct(),
                module => RSYNC_MODULE,
                path => MOUNT_ROOT,
                username => self.core.credentials.username(),
                secrets_file => RSYNC_SECRETS_FILE,
            },
        )
    }

    fn server_container(&self, port: u16, pvc_mounts: Vec<VolumeMount>) -> Container {
        let mut mounts = vec![
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: SECRET_VOLUME.to_string(),
                mount_path: SECRET_DIR.to_string(),
                ..Default::default()
            },
        ];
        mounts.extend(pvc_mounts);
        Container {
            name: "rsync".to_string(),
            image: Some(self.core.workload.images.rsync.clone()),
            command: Some(vec![
                RSYNC_BINARY.to_string(),
                "--daemon".to_string(),
                "--no-detach".to_string(),
                format!("--port={}", port),
                format!("--config={}/rsyncd.conf", CONFIG_DIR),
            ]),
            ports: Some(vec![ContainerPort {
                name: Some("rsyncd".to_string()),
                container_port: i32::from(port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(mounts),
            ..Default::default()
        }
    }

    pub(crate) async fn create_server<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        let id = self.core.id().to_string();
        let namespace = self.core.server_namespace();
        let labels = self.core.server_labels();

        let rsyncd = self.rsyncd_conf()?;
        store
            .create(&config_map(
                &namespace,
                &config_map_name(&id),
                &labels,
                BTreeMap::from([("rsyncd.conf".to_string(), rsyncd)]),
            ))
            .await?;
        let credentials = format!(
            "{}:{}",
            self.core.credentials.username(),
            self.core.credentials.password()
        );
        store
            .create(&secret(
                &namespace,
                &secret_name(&id),
                &labels,
                string_data([(CREDENTIALS_KEY, credentials)]),
            ))
            .await?;

        self.core
            .transport
            .create_server(store, &id, &self.core.endpoint, RSYNC_PORT, None)
            .await?;

        let port = self.core.listen_port(RSYNC_PORT);
        let (mut volumes, mounts) = self.core.filesystem_volumes(Side::Server);
        volumes.push(config_map_volume(CONFIG_VOLUME, &config_map_name(&id)));
        volumes.push(secret_volume(
            SECRET_VOLUME,
            &secret_name(&id),
            Some(SECRETS_FILE_MODE),
            Some(vec![(CREDENTIALS_KEY, "rsyncd.secrets")]),
        ));
        let spec = self.core.pod_spec(
            Side::Server,
            vec![self.server_container(port, mounts)],
            volumes,
            None,
        );
        store
            .create(&deployment(&namespace, &server_name(&id), &labels, spec))
            .await?;
        info!(namespace = %namespace, name = %server_name(&id), port, "created rsync server");

        self.core.endpoint.create(store).await
    }

    /// Shell script pushing every pair in order
    fn client_script(&self) -> Result<String> {
        let target = self.core.connection_target()?;
        let flags = self
            .options
            .to_flags()
            .iter()
            .map(|f| shell_quote(f))
            .collect::<Vec<_>>()
            .join(" ");
        let mut script = format!("trap 'touch {}' EXIT\nset -e\n", CONTROL_FILE);
        for pair in self.core.pvcs.iter() {
            let source = format!("{}/{}/", MOUNT_ROOT, pair.source().name());
            let destination = format!(
                "rsync://{}@{}/{}/{}/",
                self.core.credentials.username(),
                target,
                RSYNC_MODULE,
                pair.destination().name()
            );
            script.push_str(&format!(
                "{} {} {} {}\n",
                RSYNC_BINARY,
                flags,
                shell_quote(&source),
                shell_quote(&destination)
            ));
        }
        Ok(script)
    }

    pub(crate) async fn create_client<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        let id = self.core.id().to_string();
        let namespace = self.core.client_namespace();
        let labels = self.core.client_labels();
        let script = self.client_script()?;

        store
            .create(&secret(
                &namespace,
                &client_secret_name(&id),
                &labels,
                string_data([(PASSWORD_ENV, self.core.credentials.password().to_string())]),
            ))
            .await?;

        self.core
            .transport
            .create_client(store, &namespace, &id, &self.core.endpoint, Some(CONTROL_FILE))
            .await?;

        let (mut volumes, mut mounts) = self.core.filesystem_volumes(Side::Client);
        mounts.push(control_volume_mount(CONTROL_FILE));
        volumes.push(control_volume());
        let container = Container {
            name: "rsync".to_string(),
            image: Some(self.core.workload.images.rsync.clone()),
            command: Some(vec!["/bin/bash".to_string(), "-c".to_string(), script]),
            env: Some(vec![secret_env(
                PASSWORD_ENV,
                &client_secret_name(&id),
                PASSWORD_ENV,
            )]),
            volume_mounts: Some(mounts),
            ..Default::default()
        };
        let spec = self
            .core
            .pod_spec(Side::Client, vec![container], volumes, Some("Never"));
        store
            .create(&pod(&namespace, &client_name(&id), &labels, spec))
            .await?;
        info!(namespace = %namespace, name = %client_name(&id), "created rsync client");
        Ok(())
    }
}
