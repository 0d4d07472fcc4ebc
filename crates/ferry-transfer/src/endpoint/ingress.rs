//! NGINX SSL-passthrough Ingress endpoint

use std::collections::BTreeMap;

use ferry_common::{Error, NamespacedName, ObjectStore, Result};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};

use super::{collect, labels_from_service, EndpointMeta, EXPOSED_PORT, ROUTED_PORT};

/// Annotation asking ingress-nginx to pass TLS through untouched
pub const SSL_PASSTHROUGH_ANNOTATION: &str = "nginx.ingress.kubernetes.io/ssl-passthrough";

/// Annotation telling ingress-nginx the backend speaks TLS
pub const BACKEND_PROTOCOL_ANNOTATION: &str = "nginx.ingress.kubernetes.io/backend-protocol";

/// A ClusterIP Service exposed through an SSL-passthrough Ingress on 443.
///
/// The host is `<name>-<namespace>.<subdomain>` and is known up front.
#[derive(Clone, Debug)]
pub struct IngressEndpoint {
    pub(crate) meta: EndpointMeta,
    ingress_class: Option<String>,
    hostname: String,
}

impl IngressEndpoint {
    /// Describe an ingress endpoint under `subdomain`
    pub fn new(
        namespaced_name: NamespacedName,
        labels: &BTreeMap<String, String>,
        subdomain: &str,
        ingress_class: Option<&str>,
    ) -> Self {
        let hostname = format!(
            "{}-{}.{}",
            namespaced_name.name, namespaced_name.namespace, subdomain
        );
        Self {
            meta: EndpointMeta::new(namespaced_name, labels),
            ingress_class: ingress_class.map(str::to_string),
            hostname,
        }
    }

    /// Fixed host of the ingress rule
    pub fn hostname(&self) -> Option<&str> {
        Some(&self.hostname)
    }

    /// Clients always connect on 443
    pub fn port(&self) -> u16 {
        ROUTED_PORT
    }

    fn ingress(&self) -> Ingress {
        let mut metadata = self.meta.object_meta();
        metadata.annotations = Some(BTreeMap::from([
            (SSL_PASSTHROUGH_ANNOTATION.to_string(), "true".to_string()),
            (BACKEND_PROTOCOL_ANNOTATION.to_string(), "HTTPS".to_string()),
        ]));

        Ingress {
            metadata,
            spec: Some(IngressSpec {
                ingress_class_name: self.ingress_class.clone(),
                rules: Some(vec![IngressRule {
                    host: Some(self.hostname.clone()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: self.meta.namespaced_name.name.clone(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(i32::from(EXPOSED_PORT)),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) async fn create<S: ObjectStore>(&mut self, store: &S) -> Result<()> {
        let mut failures = Vec::new();
        let service = self.meta.service("ClusterIP", EXPOSED_PORT);
        collect(&mut failures, store.create(&service).await);
        collect(&mut failures, store.create(&self.ingress()).await);
        Error::check_partial(
            format!("ingress endpoint {}", self.meta.namespaced_name),
            failures,
        )
    }

    /// Healthy once the ingress controller publishes an address
    pub(crate) async fn is_healthy<S: ObjectStore>(&mut self, store: &S) -> Result<bool> {
        let ingress: Ingress = self.meta.get_required(store).await?;
        let published = ingress
            .status
            .and_then(|s| s.load_balancer)
            .and_then(|lb| lb.ingress)
            .unwrap_or_default()
            .iter()
            .any(|i| {
                i.hostname.as_deref().is_some_and(|h| !h.is_empty())
                    || i.ip.as_deref().is_some_and(|ip| !ip.is_empty())
            });
        Ok(published)
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
            self.meta.label_object::<Ingress, S>(store, key, value).await,
        );
        Error::check_partial(
            format!("cleanup labels for ingress endpoint {}", self.meta.namespaced_name),
            failures,
        )
    }

    pub(crate) async fn discover<S: ObjectStore>(
        store: &S,
        namespaced_name: &NamespacedName,
    ) -> Result<Self> {
        let probe = EndpointMeta::new(namespaced_name.clone(), &BTreeMap::new());
        let service: Service = probe.get_required(store).await?;
        let ingress: Ingress = probe.get_required(store).await?;

        let spec = ingress.spec.unwrap_or_default();
        let host = spec
            .rules
            .as_ref()
            .and_then(|rules| rules.first())
            .and_then(|rule| rule.host.clone())
            .ok_or_else(|| {
                Error::configuration(format!("ingress {} has no host rule", namespaced_name))
            })?;

        Ok(Self {
            meta: EndpointMeta::new(namespaced_name.clone(), &labels_from_service(&service)),
            ingress_class: spec.ingress_class_name,
            hostname: host,
        })
    }
}
