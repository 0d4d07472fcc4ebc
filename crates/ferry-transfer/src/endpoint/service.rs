//! Service endpoint: ClusterIP, NodePort or LoadBalancer

use std::collections::BTreeMap;

use ferry_common::{Error, NamespacedName, ObjectStore, Result};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use super::{labels_from_service, EndpointMeta, EXPOSED_PORT};

/// Annotation recording the node address clients use for a NodePort endpoint
pub const NODE_ADDRESS_ANNOTATION: &str = "ferry.dev/node-address";

/// How the Service is exposed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceType {
    /// Reachable inside the cluster only
    ClusterIP,
    /// Reachable on a node address and an allocated node port
    NodePort,
    /// Reachable on a cloud load balancer address
    LoadBalancer,
}

impl ServiceType {
    fn as_str(self) -> &'static str {
        match self {
            ServiceType::ClusterIP => "ClusterIP",
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "ClusterIP" => Some(Self::ClusterIP),
            "NodePort" => Some(Self::NodePort),
            "LoadBalancer" => Some(Self::LoadBalancer),
            _ => None,
        }
    }
}

/// A bare Service in front of the server pods
#[derive(Clone, Debug)]
pub struct ServiceEndpoint {
    pub(crate) meta: EndpointMeta,
    service_type: ServiceType,
    hostname: Option<String>,
    port: Option<u16>,
}

fn cluster_dns_name(nn: &NamespacedName) -> String {
    format!("{}.{}.svc.cluster.local", nn.name, nn.namespace)
}

impl ServiceEndpoint {
    /// In-cluster endpoint, reachable at `<name>.<namespace>.svc.cluster.local:6443`
    pub fn cluster_ip(namespaced_name: NamespacedName, labels: &BTreeMap<String, String>) -> Self {
        let hostname = cluster_dns_name(&namespaced_name);
        Self {
            meta: EndpointMeta::new(namespaced_name, labels),
            service_type: ServiceType::ClusterIP,
            hostname: Some(hostname),
            port: Some(EXPOSED_PORT),
        }
    }

    /// Endpoint on `node_address` and the node port the cluster allocates
    pub fn node_port(
        namespaced_name: NamespacedName,
        labels: &BTreeMap<String, String>,
        node_address: &str,
    ) -> Self {
        Self {
            meta: EndpointMeta::new(namespaced_name, labels),
            service_type: ServiceType::NodePort,
            hostname: Some(node_address.to_string()),
            port: None,
        }
    }

    /// Endpoint on the address the load balancer publishes
    pub fn load_balancer(
        namespaced_name: NamespacedName,
        labels: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            meta: EndpointMeta::new(namespaced_name, labels),
            service_type: ServiceType::LoadBalancer,
            hostname: None,
            port: Some(EXPOSED_PORT),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_address(mut self, hostname: &str, port: u16) -> Self {
        self.hostname = Some(hostname.to_string());
        self.port = Some(port);
        self
    }

    /// How the Service is exposed
    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// Hostname or address clients connect to, once known
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Port clients connect to, once known
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    fn service(&self) -> Service {
        let mut service = self.meta.service(self.service_type.as_str(), EXPOSED_PORT);
        if let (ServiceType::NodePort, Some(address)) = (self.service_type, &self.hostname) {
            service.metadata.annotations = Some(BTreeMap::from([(
                NODE_ADDRESS_ANNOTATION.to_string(),
                address.clone(),
            )]));
        }
        service
    }

    pub(crate) async fn create<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        store.create(&self.service()).await.map_err(|e| Error::PartialCreation {
            resource: format!("service endpoint {}", self.meta.namespaced_name),
            failures: vec![e],
        })?;
        Ok(())
    }

    pub(crate) async fn is_healthy<S: ObjectStore>(&mut self, store: &S) -> Result<bool> {
        let service: Service = self.meta.get_required(store).await?;
        self.observe(&service)
    }

    fn observe(&mut self, service: &Service) -> Result<bool> {
        let spec = service.spec.as_ref();
        match self.service_type {
            ServiceType::ClusterIP => Ok(spec
                .and_then(|s| s.cluster_ip.as_deref())
                .is_some_and(|ip| !ip.is_empty() && ip != "None")),
            ServiceType::NodePort => {
                let node_port = spec
                    .and_then(|s| s.ports.as_ref())
                    .and_then(|ports| ports.first())
                    .and_then(|p| p.node_port);
                match node_port {
                    Some(port) => {
                        let port = u16::try_from(port).map_err(|_| {
                            Error::configuration(format!(
                                "service {} reports node port {} out of range",
                                self.meta.namespaced_name, port
                            ))
                        })?;
                        self.port = Some(port);
                        Ok(self.hostname.is_some())
                    }
                    None => Ok(false),
                }
            }
            ServiceType::LoadBalancer => {
                let address = service
                    .status
                    .as_ref()
                    .and_then(|s| s.load_balancer.as_ref())
                    .and_then(|lb| lb.ingress.as_ref())
                    .and_then(|ingress| ingress.first())
                    .and_then(|i| {
                        i.hostname
                            .clone()
                            .filter(|h| !h.is_empty())
                            .or_else(|| i.ip.clone().filter(|ip| !ip.is_empty()))
                    });
                match address {
                    Some(address) => {
                        self.hostname = Some(address);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    pub(crate) async fn mark_for_cleanup<S: ObjectStore>(
        &self,
        store: &S,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.meta
            .label_object::<Service, S>(store, key, value)
            .await
            .map_err(|e| Error::PartialCreation {
                resource: format!(
                    "cleanup labels for service endpoint {}",
                    self.meta.namespaced_name
                ),
                failures: vec![e],
            })
    }

    pub(crate) async fn discover<S: ObjectStore>(
        store: &S,
        namespaced_name: &NamespacedName,
    ) -> Result<Self> {
        let probe = EndpointMeta::new(namespaced_name.clone(), &BTreeMap::new());
        let service: Service = probe.get_required(store).await?;
        let labels = labels_from_service(&service);

        let type_name = service
            .spec
            .as_ref()
            .and_then(|s| s.type_.clone())
            .unwrap_or_else(|| ServiceType::ClusterIP.as_str().to_string());
        let service_type = ServiceType::parse(&type_name).ok_or_else(|| {
            Error::configuration(format!(
                "service {} has unsupported type {}",
                namespaced_name, type_name
            ))
        })?;

        Ok(match service_type {
            ServiceType::ClusterIP => Self::cluster_ip(namespaced_name.clone(), &labels),
            ServiceType::LoadBalancer => Self::load_balancer(namespaced_name.clone(), &labels),
            ServiceType::NodePort => {
                let address = service
                    .annotations()
                    .get(NODE_ADDRESS_ANNOTATION)
                    .cloned()
                    .ok_or_else(|| {
                        Error::configuration(format!(
                            "node port service {} has no {} annotation",
                            namespaced_name, NODE_ADDRESS_ANNOTATION
                        ))
                    })?;
                Self::node_port(namespaced_name.clone(), &labels, &address)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{Endpoint, EndpointType};
    use super::*;
    use ferry_common::testing::{InMemoryStore, Operation};

    #[tokio::test]
    async fn cluster_ip_hostname_known_up_front() {
        let store = InMemoryStore::new();
        let mut endpoint: Endpoint =
            ServiceEndpoint::cluster_ip(nn("dest", "ferry-abc"), &labels("abc")).into();

        assert_eq!(
            endpoint.hostname(),
            Some("ferry-abc.dest.svc.cluster.local")
        );
        assert_eq!(endpoint.port(), Some(6443));

        endpoint.create(&store).await.unwrap();
        assert!(!endpoint.is_healthy(&store).await.unwrap());

        store.modify::<Service>("dest", "ferry-abc", |svc| {
            svc.spec.as_mut().unwrap().cluster_ip = Some("None".to_string());
        });
        assert!(!endpoint.is_healthy(&store).await.unwrap());

        store.modify::<Service>("dest", "ferry-abc", |svc| {
            svc.spec.as_mut().unwrap().cluster_ip = Some("172.30.0.10".to_string());
        });
        assert!(endpoint.is_healthy(&store).await.unwrap());
    }

    #[tokio::test]
    async fn node_port_discovers_allocated_port() {
        let store = InMemoryStore::new();
        let mut endpoint: Endpoint =
            ServiceEndpoint::node_port(nn("dest", "ferry-abc"), &labels("abc"), "192.168.1.20")
                .into();
        endpoint.create(&store).await.unwrap();

        assert_eq!(endpoint.port(), None);
        assert!(!endpoint.is_healthy(&store).await.unwrap());

        store.modify::<Service>("dest", "ferry-abc", |svc| {
            svc.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].node_port = Some(31234);
        });
        assert!(endpoint.is_healthy(&store).await.unwrap());
        assert_eq!(endpoint.port(), Some(31234));
        assert_eq!(endpoint.hostname(), Some("192.168.1.20"));

        let found = Endpoint::discover(&store, EndpointType::Service, &nn("dest", "ferry-abc"))
            .await
            .unwrap();
        assert_eq!(found.hostname(), Some("192.168.1.20"));
        assert_eq!(found.port(), Some(31234));
    }

    #[tokio::test]
    async fn load_balancer_prefers_hostname_over_ip() {
        let store = InMemoryStore::new();
        let mut endpoint: Endpoint =
            ServiceEndpoint::load_balancer(nn("dest", "ferry-abc"), &labels("abc")).into();
        endpoint.create(&store).await.unwrap();
        assert!(!endpoint.is_healthy(&store).await.unwrap());

        store.modify::<Service>("dest", "ferry-abc", |svc| {
            svc.status = Some(lb_status(None, Some("203.0.113.9")));
        });
        assert!(endpoint.is_healthy(&store).await.unwrap());
        assert_eq!(endpoint.hostname(), Some("203.0.113.9"));

        store.modify::<Service>("dest", "ferry-abc", |svc| {
            svc.status = Some(lb_status(Some("lb.example.com"), Some("203.0.113.9")));
        });
        assert!(endpoint.is_healthy(&store).await.unwrap());
        assert_eq!(endpoint.hostname(), Some("lb.example.com"));
    }

    #[tokio::test]
    async fn service_selector_matches_labels() {
        let store = InMemoryStore::new();
        let mut endpoint: Endpoint =
            ServiceEndpoint::load_balancer(nn("dest", "ferry-abc"), &labels("abc")).into();
        endpoint.create(&store).await.unwrap();

        let svc: Service = store.object("dest", "ferry-abc").unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(spec.selector.unwrap(), labels("abc"));
        assert_eq!(endpoint.selector(), "ferry.dev/transfer=abc");
    }

    #[tokio::test]
    async fn create_failure_is_partial_creation() {
        let store = InMemoryStore::new();
        store.fail_on(Operation::Create, "Service", Some("ferry-abc"));
        let mut endpoint: Endpoint =
            ServiceEndpoint::cluster_ip(nn("dest", "ferry-abc"), &labels("abc")).into();

        assert!(matches!(
            endpoint.create(&store).await,
            Err(Error::PartialCreation { .. })
        ));
    }
}
