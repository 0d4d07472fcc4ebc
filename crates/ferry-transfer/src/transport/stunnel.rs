//! stunnel TLS tunnel
//!
//! The server side terminates the tunnel on the endpoint's exposed port and
//! forwards to the transfer server on localhost. The client side accepts on
//! [`STUNNEL_CLIENT_PORT`] inside the client pod and connects to the
//! endpoint, optionally through an HTTP CONNECT proxy.

use std::collections::BTreeMap;

use ferry_common::labels::{LABEL_COMPONENT, LABEL_TRANSFER};
use ferry_common::{Error, ObjectStore, Result};
use k8s_openapi::api::core::v1::{Container, ContainerPort, Secret, Volume, VolumeMount};
use minijinja::context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::control_volume_mount;
use super::pki::TlsMaterial;
use crate::endpoint::Endpoint;
use crate::resources::{config_map, config_map_volume, secret, secret_volume};
use crate::template;

/// Port the client side-car accepts on inside the client pod
pub const STUNNEL_CLIENT_PORT: u16 = 6443;

/// Default stunnel image
pub const DEFAULT_STUNNEL_IMAGE: &str = "ghcr.io/ferry-dev/stunnel:latest";

/// Path of the rendered configuration inside the side-car
pub const STUNNEL_CONFIG_PATH: &str = "/etc/stunnel/stunnel.conf";

/// Directory holding the certificate, key and CA bundle inside the side-car
pub const STUNNEL_CERTS_DIR: &str = "/etc/stunnel/certs";

const STUNNEL_BINARY: &str = "/bin/stunnel";
const CONFIG_VOLUME: &str = "stunnel-config";
const CERTS_VOLUME: &str = "stunnel-certs";
const CONFIG_KEY: &str = "stunnel.conf";
const CONTAINER_NAME: &str = "stunnel";

/// Name of the ConfigMap holding `stunnel.conf`
pub fn config_map_name(prefix: &str) -> String {
    format!("stunnel-config-{}", prefix)
}

/// Name of the Secret holding the TLS material
pub fn secret_name(prefix: &str) -> String {
    format!("stunnel-creds-{}", prefix)
}

/// Tunnel options
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StunnelOptions {
    /// Side-car image
    pub image: String,
    /// stunnel `verify` level used when CA verification is on
    pub ca_verify_level: String,
    /// Skip verifying the peer certificate against the CA bundle
    pub no_verify_ca: bool,
    /// HTTP CONNECT proxy (`[http://]host:port`) the client tunnels through
    pub proxy_url: Option<String>,
    /// Proxy basic-auth user
    pub proxy_username: Option<String>,
    /// Proxy basic-auth password
    pub proxy_password: Option<String>,
}

impl Default for StunnelOptions {
    fn default() -> Self {
        Self {
            image: DEFAULT_STUNNEL_IMAGE.to_string(),
            ca_verify_level: "2".to_string(),
            no_verify_ca: true,
            proxy_url: None,
            proxy_username: None,
            proxy_password: None,
        }
    }
}

impl StunnelOptions {
    /// Check every option, reporting all problems at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if !matches!(self.ca_verify_level.as_str(), "0" | "1" | "2" | "3" | "4") {
            errors.push(format!(
                "stunnel verify level '{}' must be 0 through 4",
                self.ca_verify_level
            ));
        }
        if let Some(url) = &self.proxy_url {
            if let Err(e) = proxy_host(url) {
                errors.push(e);
            }
        }
        if self.proxy_username.is_some() != self.proxy_password.is_some() {
            errors.push("proxy username and password must be set together".to_string());
        }
        if self.proxy_username.is_some() && self.proxy_url.is_none() {
            errors.push("proxy credentials given without a proxy url".to_string());
        }
        Error::check_validation(errors)
    }
}

/// `host:port` of a proxy url
fn proxy_host(url: &str) -> std::result::Result<String, String> {
    let stripped = url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    match stripped.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(stripped.to_string())
        }
        _ => Err(format!("proxy url '{}' must be host:port", url)),
    }
}

/// A TLS tunnel through stunnel side-cars
#[derive(Clone, Debug)]
pub struct StunnelTransport {
    options: StunnelOptions,
    material: Option<TlsMaterial>,
    server_containers: Vec<Container>,
    server_volumes: Vec<Volume>,
    client_containers: Vec<Container>,
    client_volumes: Vec<Volume>,
}

impl StunnelTransport {
    /// Create a tunnel; TLS material is generated when the server side is
    /// created
    pub fn new(options: StunnelOptions) -> Self {
        Self {
            options,
            material: None,
            server_containers: Vec::new(),
            server_volumes: Vec::new(),
            client_containers: Vec::new(),
            client_volumes: Vec::new(),
        }
    }

    /// Tunnel options
    pub fn options(&self) -> &StunnelOptions {
        &self.options
    }

    /// TLS material, once generated or discovered
    pub fn material(&self) -> Option<&TlsMaterial> {
        self.material.as_ref()
    }

    /// Local port clients connect to
    pub fn port(&self) -> u16 {
        STUNNEL_CLIENT_PORT
    }

    pub(crate) fn server_containers(&self) -> &[Container] {
        &self.server_containers
    }

    pub(crate) fn server_volumes(&self) -> &[Volume] {
        &self.server_volumes
    }

    pub(crate) fn client_containers(&self) -> &[Container] {
        &self.client_containers
    }

    pub(crate) fn client_volumes(&self) -> &[Volume] {
        &self.client_volumes
    }

    fn verify(&self) -> bool {
        !self.options.no_verify_ca
    }

    fn labels(prefix: &str, component: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_TRANSFER.to_string(), prefix.to_string()),
            (LABEL_COMPONENT.to_string(), component.to_string()),
        ])
    }

    pub(crate) fn render_server_config(
        &self,
        endpoint: &Endpoint,
        backend_port: u16,
    ) -> Result<String> {
        template::render(
            template::STUNNEL_SERVER,
            context! {
                accept_port => endpoint.exposed_port(),
                connect_host => "localhost",
                connect_port => backend_port,
                certs_dir => STUNNEL_CERTS_DIR,
                verify => self.verify(),
                verify_level => self.options.ca_verify_level,
            },
        )
    }

    pub(crate) fn render_client_config(&self, endpoint: &Endpoint) -> Result<String> {
        let hostname = endpoint.hostname().ok_or_else(|| {
            Error::configuration(format!(
                "endpoint {} has no hostname yet",
                endpoint.namespaced_name()
            ))
        })?;
        let port = endpoint.port().ok_or_else(|| {
            Error::configuration(format!(
                "endpoint {} has no port yet",
                endpoint.namespaced_name()
            ))
        })?;
        let proxy = self
            .options
            .proxy_url
            .as_deref()
            .map(proxy_host)
            .transpose()
            .map_err(Error::validation)?;

        template::render(
            template::STUNNEL_CLIENT,
            context! {
                accept_port => STUNNEL_CLIENT_PORT,
                hostname => hostname,
                port => port,
                proxy_host => proxy,
                proxy_username => self.options.proxy_username,
                proxy_password => self.options.proxy_password,
                certs_dir => STUNNEL_CERTS_DIR,
                verify => self.verify(),
                verify_level => self.options.ca_verify_level,
            },
        )
    }

    fn container(&self, port: u16, control_file: Option<&str>) -> Container {
        let mut mounts = vec![
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: STUNNEL_CONFIG_PATH.to_string(),
                sub_path: Some(CONFIG_KEY.to_string()),
                ..Default::default()
            },
            VolumeMount {
                name: CERTS_VOLUME.to_string(),
                mount_path: STUNNEL_CERTS_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ];

        let command = match control_file {
            Some(file) => {
                mounts.push(control_volume_mount(file));
                vec![
                    "/bin/bash".to_string(),
                    "-c".to_string(),
                    format!(
                        "{} {} &\nwhile [ ! -f {} ]; do sleep 1; done\nexit 0",
                        STUNNEL_BINARY, STUNNEL_CONFIG_PATH, file
                    ),
                ]
            }
            None => vec![STUNNEL_BINARY.to_string(), STUNNEL_CONFIG_PATH.to_string()],
        };

        Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.options.image.clone()),
            command: Some(command),
            ports: Some(vec![ContainerPort {
                name: Some("stunnel".to_string()),
                container_port: i32::from(port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(mounts),
            ..Default::default()
        }
    }

    fn volumes(prefix: &str) -> Vec<Volume> {
        vec![
            config_map_volume(CONFIG_VOLUME, &config_map_name(prefix)),
            secret_volume(CERTS_VOLUME, &secret_name(prefix), None, None),
        ]
    }

    /// Write the config and TLS material into `namespace`
    async fn upsert<S: ObjectStore>(
        &self,
        store: &S,
        namespace: &str,
        prefix: &str,
        component: &str,
        config: String,
        material: &TlsMaterial,
    ) -> Result<()> {
        let labels = Self::labels(prefix, component);
        let cm = config_map(
            namespace,
            &config_map_name(prefix),
            &labels,
            BTreeMap::from([(CONFIG_KEY.to_string(), config)]),
        );
        store.create_or_update(&cm).await?;
        debug!(namespace = %namespace, name = %config_map_name(prefix), "stunnel config written");

        let creds = secret(namespace, &secret_name(prefix), &labels, material.to_secret_data());
        store.create_or_update(&creds).await?;
        debug!(namespace = %namespace, name = %secret_name(prefix), "stunnel credentials written");
        Ok(())
    }

    pub(crate) async fn create_server<S: ObjectStore>(
        &mut self,
        store: &S,
        prefix: &str,
        endpoint: &Endpoint,
        backend_port: u16,
        control_file: Option<&str>,
    ) -> Result<()> {
        self.options.validate()?;
        let material = match &self.material {
            Some(material) => material.clone(),
            None => {
                let common_name = endpoint
                    .hostname()
                    .map(str::to_string)
                    .unwrap_or_else(|| endpoint.namespaced_name().name.clone());
                let material = TlsMaterial::generate(&common_name)?;
                info!(common_name = %common_name, "generated stunnel certificate");
                self.material = Some(material.clone());
                material
            }
        };

        let config = self.render_server_config(endpoint, backend_port)?;
        let namespace = endpoint.namespaced_name().namespace.clone();
        self.upsert(store, &namespace, prefix, "stunnel-server", config, &material)
            .await?;

        self.server_containers = vec![self.container(endpoint.exposed_port(), control_file)];
        self.server_volumes = Self::volumes(prefix);
        Ok(())
    }

    pub(crate) async fn create_client<S: ObjectStore>(
        &mut self,
        store: &S,
        namespace: &str,
        prefix: &str,
        endpoint: &Endpoint,
        control_file: Option<&str>,
    ) -> Result<()> {
        self.options.validate()?;
        let material = self.material.clone().ok_or_else(|| {
            Error::configuration(
                "stunnel client needs TLS material: create the server side or discover it first",
            )
        })?;

        let config = self.render_client_config(endpoint)?;
        self.upsert(store, namespace, prefix, "stunnel-client", config, &material)
            .await?;

        self.client_containers = vec![self.container(STUNNEL_CLIENT_PORT, control_file)];
        self.client_volumes = Self::volumes(prefix);
        Ok(())
    }

    /// Hydrate a tunnel from the server Secret in `namespace`, so the client
    /// side can be created elsewhere with the same material
    pub async fn discover<S: ObjectStore>(
        store: &S,
        namespace: &str,
        prefix: &str,
        options: StunnelOptions,
    ) -> Result<Self> {
        let name = secret_name(prefix);
        let creds: Secret = store
            .get(namespace, &name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "Secret".to_string(),
                namespace: namespace.to_string(),
                name: name.clone(),
            })?;
        let mut transport = Self::new(options);
        transport.material = Some(TlsMaterial::from_secret(&creds)?);
        Ok(transport)
    }
}
