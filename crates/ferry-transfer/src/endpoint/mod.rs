//! Destination-side network entry points
//!
//! An [`Endpoint`] owns a Service selecting the transfer server pods, plus a
//! Route or Ingress for the routed variants. Creation is create-or-fail and
//! never rolled back: if any backing object fails, the others are left in
//! place and every failure comes back in one
//! [`Error::PartialCreation`](ferry_common::Error::PartialCreation).
//!
//! Hostname and port are either known at construction (cluster DNS name,
//! ingress host) or filled in by [`Endpoint::is_healthy`] from the live
//! objects' status.

mod ingress;
mod route;
mod service;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ferry_common::labels::{selector_string, with_managed_by};
use ferry_common::{Error, NamespacedName, ObjectStore, Result, StoreObject};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

pub use ingress::IngressEndpoint;
pub use route::{RouteEndpoint, RouteTermination};
pub use service::{ServiceEndpoint, ServiceType};

/// Port the transfer server pod listens on for endpoint traffic
pub const EXPOSED_PORT: u16 = 6443;

/// Port clients use to reach routed endpoints
pub const ROUTED_PORT: u16 = 443;

/// Name of the single port on every endpoint Service
pub const SERVICE_PORT_NAME: &str = "ferry";

/// Endpoint variant names, for configuration and discovery
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    /// OpenShift Route
    Route,
    /// NGINX SSL-passthrough Ingress
    Ingress,
    /// Plain Service
    Service,
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointType::Route => write!(f, "route"),
            EndpointType::Ingress => write!(f, "ingress"),
            EndpointType::Service => write!(f, "service"),
        }
    }
}

impl FromStr for EndpointType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "route" => Ok(Self::Route),
            "ingress" => Ok(Self::Ingress),
            "service" => Ok(Self::Service),
            other => Err(Error::configuration(format!(
                "unknown endpoint type '{}', expected route, ingress or service",
                other
            ))),
        }
    }
}

/// Identity shared by every endpoint variant
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EndpointMeta {
    pub(crate) namespaced_name: NamespacedName,
    pub(crate) labels: BTreeMap<String, String>,
}

impl EndpointMeta {
    pub(crate) fn new(namespaced_name: NamespacedName, labels: &BTreeMap<String, String>) -> Self {
        Self {
            namespaced_name,
            labels: labels.clone(),
        }
    }

    pub(crate) fn object_meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.namespaced_name.name.clone()),
            namespace: Some(self.namespaced_name.namespace.clone()),
            labels: Some(with_managed_by(&self.labels)),
            ..Default::default()
        }
    }

    /// Service selecting the server pods by the endpoint labels
    pub(crate) fn service(&self, type_: &str, port: u16) -> Service {
        Service {
            metadata: self.object_meta(),
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                selector: Some(self.labels.clone()),
                ports: Some(vec![ServicePort {
                    name: Some(SERVICE_PORT_NAME.to_string()),
                    protocol: Some("TCP".to_string()),
                    port: i32::from(port),
                    target_port: Some(IntOrString::Int(i32::from(EXPOSED_PORT))),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) async fn get_required<K: StoreObject, S: ObjectStore>(
        &self,
        store: &S,
    ) -> Result<K> {
        let nn = &self.namespaced_name;
        store
            .get::<K>(&nn.namespace, &nn.name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: K::kind(&()).to_string(),
                namespace: nn.namespace.clone(),
                name: nn.name.clone(),
            })
    }

    /// Add `key=value` to the labels of one created object
    pub(crate) async fn label_object<K: StoreObject, S: ObjectStore>(
        &self,
        store: &S,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut obj: K = self.get_required(store).await?;
        obj.meta_mut()
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        store.update(&obj).await?;
        Ok(())
    }
}

/// Labels recovered from a live endpoint Service: its selector
pub(crate) fn labels_from_service(service: &Service) -> BTreeMap<String, String> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.clone())
        .unwrap_or_default()
}

/// A destination-side network entry point
#[derive(Clone, Debug)]
pub enum Endpoint {
    /// OpenShift Route in front of a ClusterIP Service
    Route(RouteEndpoint),
    /// NGINX SSL-passthrough Ingress in front of a ClusterIP Service
    Ingress(IngressEndpoint),
    /// Service reached directly
    Service(ServiceEndpoint),
}

impl From<RouteEndpoint> for Endpoint {
    fn from(e: RouteEndpoint) -> Self {
        Endpoint::Route(e)
    }
}

impl From<IngressEndpoint> for Endpoint {
    fn from(e: IngressEndpoint) -> Self {
        Endpoint::Ingress(e)
    }
}

impl From<ServiceEndpoint> for Endpoint {
    fn from(e: ServiceEndpoint) -> Self {
        Endpoint::Service(e)
    }
}

impl Endpoint {
    fn meta(&self) -> &EndpointMeta {
        match self {
            Endpoint::Route(e) => &e.meta,
            Endpoint::Ingress(e) => &e.meta,
            Endpoint::Service(e) => &e.meta,
        }
    }

    /// Variant of this endpoint
    pub fn endpoint_type(&self) -> EndpointType {
        match self {
            Endpoint::Route(_) => EndpointType::Route,
            Endpoint::Ingress(_) => EndpointType::Ingress,
            Endpoint::Service(_) => EndpointType::Service,
        }
    }

    /// Namespace and name shared by every object of the endpoint
    pub fn namespaced_name(&self) -> &NamespacedName {
        &self.meta().namespaced_name
    }

    /// Labels selecting the server pods behind the endpoint
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.meta().labels
    }

    /// Label selector matching the server pods
    pub fn selector(&self) -> String {
        selector_string(self.labels())
    }

    /// Hostname clients connect to, once known
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Endpoint::Route(e) => e.hostname(),
            Endpoint::Ingress(e) => e.hostname(),
            Endpoint::Service(e) => e.hostname(),
        }
    }

    /// Port clients connect to, once known
    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Route(e) => Some(e.port()),
            Endpoint::Ingress(e) => Some(e.port()),
            Endpoint::Service(e) => e.port(),
        }
    }

    /// Port the server pod listens on behind the endpoint
    pub fn exposed_port(&self) -> u16 {
        EXPOSED_PORT
    }

    /// Whether the endpoint itself terminates TLS, so clients speak HTTPS to
    /// it and the server behind it receives plain traffic
    pub fn terminates_tls(&self) -> bool {
        matches!(self, Endpoint::Route(e) if e.termination() == RouteTermination::Edge)
    }

    /// Whether traffic must already be TLS when it reaches the endpoint
    /// (SNI-routed passthrough)
    pub fn requires_tls(&self) -> bool {
        match self {
            Endpoint::Route(e) => e.termination() == RouteTermination::Passthrough,
            Endpoint::Ingress(_) => true,
            Endpoint::Service(_) => false,
        }
    }

    /// Create the backing objects. Fails if any already exist.
    #[instrument(
        skip(self, store),
        fields(endpoint = %self.namespaced_name(), kind = %self.endpoint_type())
    )]
    pub async fn create<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        let result = match self {
            Endpoint::Route(e) => e.create(store).await,
            Endpoint::Ingress(e) => e.create(store).await,
            Endpoint::Service(e) => e.create(store).await,
        };
        if result.is_ok() {
            info!("created endpoint");
        }
        result
    }

    /// Read the live objects, recording hostname and port when assigned.
    /// Returns whether the endpoint can accept connections.
    #[instrument(skip(self, store), fields(endpoint = %self.namespaced_name()))]
    pub async fn is_healthy<S: ObjectStore>(&mut self, store: &S) -> Result<bool> {
        match self {
            Endpoint::Route(e) => e.is_healthy(store).await,
            Endpoint::Ingress(e) => e.is_healthy(store).await,
            Endpoint::Service(e) => e.is_healthy(store).await,
        }
    }

    /// Poll [`Endpoint::is_healthy`] every `interval` until it holds.
    ///
    /// There is no deadline; wrap the call in `tokio::time::timeout` to
    /// bound it.
    pub async fn wait_until_healthy<S: ObjectStore>(
        &mut self,
        store: &S,
        interval: Duration,
    ) -> Result<()> {
        loop {
            if self.is_healthy(store).await? {
                info!(
                    endpoint = %self.namespaced_name(),
                    hostname = ?self.hostname(),
                    port = ?self.port(),
                    "endpoint is healthy"
                );
                return Ok(());
            }
            debug!(endpoint = %self.namespaced_name(), "endpoint not healthy yet");
            tokio::time::sleep(interval).await;
        }
    }

    /// Label every backing object with `key=value` so an external collector
    /// can find it
    #[instrument(skip(self, store), fields(endpoint = %self.namespaced_name()))]
    pub async fn mark_for_cleanup<S: ObjectStore>(
        &self,
        store: &S,
        key: &str,
        value: &str,
    ) -> Result<()> {
        match self {
            Endpoint::Route(e) => e.mark_for_cleanup(store, key, value).await,
            Endpoint::Ingress(e) => e.mark_for_cleanup(store, key, value).await,
            Endpoint::Service(e) => e.mark_for_cleanup(store, key, value).await,
        }
    }

    /// Teardown is left to the caller; this does nothing
    pub async fn destroy<S: ObjectStore>(&self, _store: &S) -> Result<()> {
        Ok(())
    }

    /// Hydrate an endpoint from objects that already exist, without
    /// creating anything
    #[instrument(skip(store))]
    pub async fn discover<S: ObjectStore>(
        store: &S,
        endpoint_type: EndpointType,
        namespaced_name: &NamespacedName,
    ) -> Result<Self> {
        let mut endpoint = match endpoint_type {
            EndpointType::Route => {
                Endpoint::Route(RouteEndpoint::discover(store, namespaced_name).await?)
            }
            EndpointType::Ingress => {
                Endpoint::Ingress(IngressEndpoint::discover(store, namespaced_name).await?)
            }
            EndpointType::Service => {
                Endpoint::Service(ServiceEndpoint::discover(store, namespaced_name).await?)
            }
        };
        endpoint.is_healthy(store).await?;
        Ok(endpoint)
    }
}

/// Collect the outcome of one sub-resource create
pub(crate) fn collect<T>(failures: &mut Vec<Error>, result: Result<T>) {
    if let Err(e) = result {
        failures.push(e);
    }
}
