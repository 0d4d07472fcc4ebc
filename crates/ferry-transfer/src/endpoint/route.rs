//! OpenShift Route endpoint

use std::collections::BTreeMap;

use ferry_common::openshift::{
    ClusterIngressConfig, Route, RouteIngress, RoutePort, RouteSpec, RouteTargetReference,
    RouteTlsConfig, CLUSTER_INGRESS_CONFIG_NAME,
};
use ferry_common::{Error, NamespacedName, ObjectStore, Result};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use super::{collect, labels_from_service, EndpointMeta, EXPOSED_PORT, ROUTED_PORT};

/// Longest `<name>-<namespace>` prefix the router can turn into a legal host
/// label on its own
pub const MAX_ROUTE_HOST_PREFIX: usize = 62;

/// Where a Route terminates TLS
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteTermination {
    /// The router terminates TLS and forwards plain traffic
    Edge,
    /// The router forwards TLS untouched, routed by SNI
    Passthrough,
}

impl RouteTermination {
    fn as_str(self) -> &'static str {
        match self {
            RouteTermination::Edge => "edge",
            RouteTermination::Passthrough => "passthrough",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "edge" => Some(Self::Edge),
            "passthrough" => Some(Self::Passthrough),
            _ => None,
        }
    }
}

/// A ClusterIP Service exposed through an OpenShift Route on port 443
#[derive(Clone, Debug)]
pub struct RouteEndpoint {
    pub(crate) meta: EndpointMeta,
    termination: RouteTermination,
    subdomain: Option<String>,
    hostname: Option<String>,
}

impl RouteEndpoint {
    /// Describe a route endpoint. `subdomain` overrides the cluster apps
    /// domain when the host must be computed explicitly.
    pub fn new(
        namespaced_name: NamespacedName,
        labels: &BTreeMap<String, String>,
        termination: RouteTermination,
        subdomain: Option<&str>,
    ) -> Self {
        Self {
            meta: EndpointMeta::new(namespaced_name, labels),
            termination,
            subdomain: subdomain.map(str::to_string),
            hostname: None,
        }
    }

    /// TLS termination mode
    pub fn termination(&self) -> RouteTermination {
        self.termination
    }

    /// Host assigned by the router, once admitted
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Clients always connect on 443
    pub fn port(&self) -> u16 {
        ROUTED_PORT
    }

    /// `<name>-<namespace>` when it is too long for the router to derive a
    /// host from, truncated to a legal label
    fn explicit_host_prefix(&self) -> Option<String> {
        let nn = &self.meta.namespaced_name;
        let prefix = format!("{}-{}", nn.name, nn.namespace);
        if prefix.len() <= MAX_ROUTE_HOST_PREFIX {
            return None;
        }
        let truncated: String = prefix.chars().take(MAX_ROUTE_HOST_PREFIX).collect();
        Some(truncated.trim_end_matches(['-', '.']).to_string())
    }

    async fn apps_domain<S: ObjectStore>(&self, store: &S) -> Result<String> {
        if let Some(subdomain) = &self.subdomain {
            return Ok(subdomain.clone());
        }
        let config = store
            .get_cluster::<ClusterIngressConfig>(CLUSTER_INGRESS_CONFIG_NAME)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "Ingress.config.openshift.io".to_string(),
                namespace: String::new(),
                name: CLUSTER_INGRESS_CONFIG_NAME.to_string(),
            })?;
        if config.spec.domain.is_empty() {
            return Err(Error::configuration(
                "cluster ingress config has no apps domain",
            ));
        }
        Ok(config.spec.domain)
    }

    pub(crate) async fn route<S: ObjectStore>(&self, store: &S) -> Result<Route> {
        let host = match self.explicit_host_prefix() {
            Some(prefix) => {
                let domain = self.apps_domain(store).await?;
                Some(format!("{}.{}", prefix, domain))
            }
            None => None,
        };

        let mut route = Route::new(
            &self.meta.namespaced_name.name,
            RouteSpec {
                host,
                to: RouteTargetReference {
                    kind: "Service".to_string(),
                    name: self.meta.namespaced_name.name.clone(),
                    weight: None,
                },
                port: Some(RoutePort {
                    target_port: IntOrString::Int(i32::from(EXPOSED_PORT)),
                }),
                tls: Some(RouteTlsConfig {
                    termination: self.termination.as_str().to_string(),
                    insecure_edge_termination_policy: None,
                }),
            },
        );
        route.metadata = self.meta.object_meta();
        Ok(route)
    }

    pub(crate) async fn create<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        let mut failures = Vec::new();

        let service = self.meta.service("ClusterIP", EXPOSED_PORT);
        collect(&mut failures, store.create(&service).await);

        match self.route(store).await {
            Ok(route) => {
                if let Some(host) = &route.spec.host {
                    debug!(host = %host, "route host set explicitly");
                }
                collect(&mut failures, store.create(&route).await);
            }
            Err(e) => failures.push(e),
        }

        Error::check_partial(
            format!("route endpoint {}", self.meta.namespaced_name),
            failures,
        )
    }

    pub(crate) async fn is_healthy<S: ObjectStore>(&mut self, store: &S) -> Result<bool> {
        let route: Route = self.meta.get_required(store).await?;
        let host = route
            .status
            .as_ref()
            .and_then(|s| s.ingress.first())
            .and_then(|i: &RouteIngress| i.host.clone())
            .filter(|h| !h.is_empty());
        match host {
            Some(host) => {
                self.hostname = Some(host);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) async fn mark_for_cleanup<S: ObjectStore>(
        &self,
        store: &S,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut failures = Vec::new();
        collect(
            &mut failures,
            self.meta.label_object::<Service, S>(store, key, value).await,
        );
        collect(
            &mut failures,
            self.meta.label_object::<Route, S>(store, key, value).await,
        );
        Error::check_partial(
            format!("cleanup labels for route endpoint {}", self.meta.namespaced_name),
            failures,
        )
    }

    pub(crate) async fn discover<S: ObjectStore>(
        store: &S,
        namespaced_name: &NamespacedName,
    ) -> Result<Self> {
        let probe = EndpointMeta::new(namespaced_name.clone(), &BTreeMap::new());
        let service: Service = probe.get_required(store).await?;
        let route: Route = probe.get_required(store).await?;

        let termination = route
            .spec
            .tls
            .as_ref()
            .and_then(|tls| RouteTermination::parse(&tls.termination))
            .ok_or_else(|| {
                Error::configuration(format!(
                    "route {} has no edge or passthrough TLS termination",
                    namespaced_name
                ))
            })?;

        Ok(Self::new(
            namespaced_name.clone(),
            &labels_from_service(&service),
            termination,
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::Endpoint;
    use super::*;
    use ferry_common::openshift::{ClusterIngressConfigSpec, RouteStatus};
    use ferry_common::testing::{InMemoryStore, Operation};

    fn admit(store: &InMemoryStore, namespace: &str, name: &str, host: &str) {
        store.modify::<Route>(namespace, name, |route| {
            route.status = Some(RouteStatus {
                ingress: vec![RouteIngress {
                    host: Some(host.to_string()),
                    router_name: Some("default".to_string()),
                }],
            });
        });
    }

    #[tokio::test]
    async fn creates_service_and_route() {
        let store = InMemoryStore::new();
        let mut endpoint: Endpoint = RouteEndpoint::new(
            nn("dest", "ferry-abc"),
            &labels("abc"),
            RouteTermination::Passthrough,
            None,
        )
        .into();

        endpoint.create(&store).await.unwrap();

        let service: Service = store.object("dest", "ferry-abc").unwrap();
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.selector.unwrap(), labels("abc"));
        assert_eq!(spec.ports.unwrap()[0].port, 6443);

        let route: Route = store.object("dest", "ferry-abc").unwrap();
        assert_eq!(route.spec.to.name, "ferry-abc");
        assert_eq!(route.spec.tls.unwrap().termination, "passthrough");
        assert!(route.spec.host.is_none());

        assert_eq!(endpoint.hostname(), None);
        assert_eq!(endpoint.port(), Some(443));
        assert_eq!(endpoint.exposed_port(), 6443);
    }

    #[tokio::test]
    async fn healthy_once_router_assigns_host() {
        let store = InMemoryStore::new();
        let mut endpoint: Endpoint = RouteEndpoint::new(
            nn("dest", "ferry-abc"),
            &labels("abc"),
            RouteTermination::Edge,
            None,
        )
        .into();
        endpoint.create(&store).await.unwrap();

        assert!(!endpoint.is_healthy(&store).await.unwrap());

        admit(&store, "dest", "ferry-abc", "ferry-abc-dest.apps.example.com");
        assert!(endpoint.is_healthy(&store).await.unwrap());
        assert_eq!(endpoint.hostname(), Some("ferry-abc-dest.apps.example.com"));
    }

    /// Story: long names get an explicit host under the cluster apps domain
    #[tokio::test]
    async fn story_long_names_get_truncated_explicit_host() {
        let store = InMemoryStore::new();
        let config = ClusterIngressConfig::new(
            CLUSTER_INGRESS_CONFIG_NAME,
            ClusterIngressConfigSpec {
                domain: "apps.example.com".to_string(),
                ..Default::default()
            },
        );
        store.seed_cluster(config);

        let name = format!("ferry-{}", "a".repeat(32));
        let namespace = "a-rather-long-destination-namespace";
        let mut endpoint = RouteEndpoint::new(
            nn(namespace, &name),
            &labels("abc"),
            RouteTermination::Passthrough,
            None,
        );
        endpoint.create(&store).await.unwrap();

        let route: Route = store.object(namespace, &name).unwrap();
        let host = route.spec.host.unwrap();
        let (prefix, domain) = host.split_once('.').unwrap();
        assert_eq!(domain, "apps.example.com");
        assert!(prefix.len() <= MAX_ROUTE_HOST_PREFIX);
        assert!(format!("{}-{}", name, namespace).starts_with(prefix));
    }

    #[tokio::test]
    async fn supplied_subdomain_wins_over_cluster_domain() {
        let store = InMemoryStore::new();
        let name = "n".repeat(40);
        let mut endpoint = RouteEndpoint::new(
            nn(&"s".repeat(30), &name),
            &labels("abc"),
            RouteTermination::Passthrough,
            Some("custom.example.org"),
        );
        let route = endpoint.route(&store).await.unwrap();
        assert!(route.spec.host.unwrap().ends_with(".custom.example.org"));
        endpoint.create(&store).await.unwrap();
    }

    /// Story: a failed sub-resource does not stop the others
    #[tokio::test]
    async fn story_partial_creation_reports_and_keeps_going() {
        let store = InMemoryStore::new();
        store.fail_on(Operation::Create, "Service", None);

        let mut endpoint = RouteEndpoint::new(
            nn("dest", "ferry-abc"),
            &labels("abc"),
            RouteTermination::Passthrough,
            None,
        );
        let err = endpoint.create(&store).await.unwrap_err();

        match err {
            Error::PartialCreation { resource, failures } => {
                assert_eq!(resource, "route endpoint dest/ferry-abc");
                assert_eq!(failures.len(), 1);
            }
            other => panic!("expected PartialCreation, got {other}"),
        }
        assert!(store.object::<Route>("dest", "ferry-abc").is_some());
    }

    #[tokio::test]
    async fn second_create_conflicts() {
        let store = InMemoryStore::new();
        let mut endpoint = RouteEndpoint::new(
            nn("dest", "ferry-abc"),
            &labels("abc"),
            RouteTermination::Passthrough,
            None,
        );
        endpoint.create(&store).await.unwrap();

        match endpoint.create(&store).await.unwrap_err() {
            Error::PartialCreation { failures, .. } => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().all(Error::is_conflict));
            }
            other => panic!("expected PartialCreation, got {other}"),
        }
    }

    #[tokio::test]
    async fn discover_hydrates_from_live_objects() {
        let store = InMemoryStore::new();
        let mut created: Endpoint = RouteEndpoint::new(
            nn("dest", "ferry-abc"),
            &labels("abc"),
            RouteTermination::Passthrough,
            None,
        )
        .into();
        created.create(&store).await.unwrap();
        admit(&store, "dest", "ferry-abc", "ferry-abc-dest.apps.example.com");

        let found = Endpoint::discover(
            &store,
            super::super::EndpointType::Route,
            &nn("dest", "ferry-abc"),
        )
        .await
        .unwrap();

        assert_eq!(found.labels(), &labels("abc"));
        assert_eq!(found.hostname(), Some("ferry-abc-dest.apps.example.com"));
        assert!(found.requires_tls());
        assert_eq!(store.operations().len(), 2, "discover must not mutate");
    }

    #[tokio::test]
    async fn mark_for_cleanup_labels_every_object() {
        let store = InMemoryStore::new();
        let mut endpoint: Endpoint = RouteEndpoint::new(
            nn("dest", "ferry-abc"),
            &labels("abc"),
            RouteTermination::Passthrough,
            None,
        )
        .into();
        endpoint.create(&store).await.unwrap();

        endpoint
            .mark_for_cleanup(&store, "ferry.dev/cleanup", "true")
            .await
            .unwrap();

        let service: Service = store.object("dest", "ferry-abc").unwrap();
        let route: Route = store.object("dest", "ferry-abc").unwrap();
        assert_eq!(service.metadata.labels.unwrap()["ferry.dev/cleanup"], "true");
        assert_eq!(route.metadata.labels.unwrap()["ferry.dev/cleanup"], "true");
    }
}
