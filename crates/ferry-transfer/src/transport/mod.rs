//! Optional tunnel between a transfer's client and server
//!
//! A [`Transport`] supplies side-car containers and volumes for each side of
//! a transfer. The transfer splices them into its own pod specs and
//! connects through [`connection_target`], which hides whether a tunnel is
//! interposed.
//!
//! Creating either side of a transport is an upsert: the backing ConfigMap
//! and Secret are updated in place when they already exist.

mod null;
pub mod pki;
mod stunnel;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ferry_common::{Error, ObjectStore, Result};
use k8s_openapi::api::core::v1::{Container, EmptyDirVolumeSource, Volume, VolumeMount};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::endpoint::Endpoint;

pub use null::NullTransport;
pub use stunnel::{StunnelOptions, StunnelTransport, STUNNEL_CLIENT_PORT};

/// Volume shared between a payload container and its side-cars to
/// coordinate shutdown
pub const CONTROL_VOLUME_NAME: &str = "ferry-control";

/// Sentinel written by the payload container when it is done
pub const CONTROL_FILE: &str = "/usr/share/ferry/done";

/// Directory holding `control_file`
pub(crate) fn control_dir(control_file: &str) -> String {
    Path::new(control_file)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

/// Ephemeral volume holding the control file. The enclosing pod owns it;
/// transports only mount it.
pub fn control_volume() -> Volume {
    Volume {
        name: CONTROL_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Mount of [`control_volume`] at the directory of `control_file`
pub fn control_volume_mount(control_file: &str) -> VolumeMount {
    VolumeMount {
        name: CONTROL_VOLUME_NAME.to_string(),
        mount_path: control_dir(control_file),
        ..Default::default()
    }
}

/// Transport variant names, for configuration and discovery
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// TLS tunnel
    Stunnel,
    /// No tunnel
    Null,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Stunnel => write!(f, "stunnel"),
            TransportType::Null => write!(f, "null"),
        }
    }
}

impl FromStr for TransportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stunnel" => Ok(Self::Stunnel),
            "null" | "none" => Ok(Self::Null),
            other => Err(Error::configuration(format!(
                "unknown transport type '{}', expected stunnel or null",
                other
            ))),
        }
    }
}

/// Host and port a transfer client connects to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionTarget {
    /// Hostname or address
    pub hostname: String,
    /// TCP port
    pub port: u16,
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Where a transfer client connects: straight to the endpoint for a direct
/// transport, otherwise to the local tunnel side-car.
pub fn connection_target(endpoint: &Endpoint, transport: &Transport) -> Result<ConnectionTarget> {
    if transport.direct() {
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
        return Ok(ConnectionTarget {
            hostname: hostname.to_string(),
            port,
        });
    }
    let port = transport.port().ok_or_else(|| {
        Error::configuration(format!("{} transport has no port", transport.transport_type()))
    })?;
    Ok(ConnectionTarget {
        hostname: "localhost".to_string(),
        port,
    })
}

/// A tunnel (or the absence of one) between transfer client and server
#[derive(Clone, Debug)]
pub enum Transport {
    /// TLS tunnel through stunnel side-cars
    Stunnel(StunnelTransport),
    /// Direct connection
    Null(NullTransport),
}

impl From<StunnelTransport> for Transport {
    fn from(t: StunnelTransport) -> Self {
        Transport::Stunnel(t)
    }
}

impl From<NullTransport> for Transport {
    fn from(t: NullTransport) -> Self {
        Transport::Null(t)
    }
}

impl Transport {
    /// Variant of this transport
    pub fn transport_type(&self) -> TransportType {
        match self {
            Transport::Stunnel(_) => TransportType::Stunnel,
            Transport::Null(_) => TransportType::Null,
        }
    }

    /// Whether the client talks straight to the endpoint
    pub fn direct(&self) -> bool {
        match self {
            Transport::Stunnel(_) => false,
            Transport::Null(_) => true,
        }
    }

    /// Port of the transport: the local tunnel port, or the endpoint port
    /// for a direct transport once a side has been created
    pub fn port(&self) -> Option<u16> {
        match self {
            Transport::Stunnel(t) => Some(t.port()),
            Transport::Null(t) => t.port(),
        }
    }

    /// Create or update the server side in the endpoint's namespace.
    ///
    /// Traffic arriving on the endpoint's exposed port is forwarded to
    /// `localhost:backend_port`. With a `control_file`, side-cars exit once
    /// the file appears.
    #[instrument(
        skip(self, store, endpoint),
        fields(transport = %self.transport_type(), endpoint = %endpoint.namespaced_name())
    )]
    pub async fn create_server<S: ObjectStore>(
        &mut self,
        store: &S,
        prefix: &str,
        endpoint: &Endpoint,
        backend_port: u16,
        control_file: Option<&str>,
    ) -> Result<()> {
        match self {
            Transport::Stunnel(t) => {
                t.create_server(store, prefix, endpoint, backend_port, control_file)
                    .await
            }
            Transport::Null(t) => {
                t.create_server(endpoint);
                Ok(())
            }
        }
    }

    /// Create or update the client side in `namespace`
    #[instrument(
        skip(self, store, endpoint),
        fields(transport = %self.transport_type(), endpoint = %endpoint.namespaced_name())
    )]
    pub async fn create_client<S: ObjectStore>(
        &mut self,
        store: &S,
        namespace: &str,
        prefix: &str,
        endpoint: &Endpoint,
        control_file: Option<&str>,
    ) -> Result<()> {
        match self {
            Transport::Stunnel(t) => {
                t.create_client(store, namespace, prefix, endpoint, control_file)
                    .await
            }
            Transport::Null(t) => {
                t.create_client(endpoint);
                Ok(())
            }
        }
    }

    /// Side-car containers for the server pod
    pub fn server_containers(&self) -> &[Container] {
        match self {
            Transport::Stunnel(t) => t.server_containers(),
            Transport::Null(_) => &[],
        }
    }

    /// Volumes the server side-cars need
    pub fn server_volumes(&self) -> &[Volume] {
        match self {
            Transport::Stunnel(t) => t.server_volumes(),
            Transport::Null(_) => &[],
        }
    }

    /// Side-car containers for the client pod
    pub fn client_containers(&self) -> &[Container] {
        match self {
            Transport::Stunnel(t) => t.client_containers(),
            Transport::Null(_) => &[],
        }
    }

    /// Volumes the client side-cars need
    pub fn client_volumes(&self) -> &[Volume] {
        match self {
            Transport::Stunnel(t) => t.client_volumes(),
            Transport::Null(_) => &[],
        }
    }

    /// Hydrate a transport whose server side already exists in `namespace`
    pub async fn discover<S: ObjectStore>(
        store: &S,
        transport_type: TransportType,
        namespace: &str,
        prefix: &str,
        stunnel_options: &StunnelOptions,
    ) -> Result<Self> {
        match transport_type {
            TransportType::Stunnel => Ok(Transport::Stunnel(
                StunnelTransport::discover(store, namespace, prefix, stunnel_options.clone())
                    .await?,
            )),
            TransportType::Null => Ok(Transport::Null(NullTransport::new())),
        }
    }
}
