//! Migration config file
//!
//! ```yaml
//! pvcs:
//!   - source: { namespace: shop, name: orders-db }
//!     destination: { name: orders-db-copy }
//! endpoint:
//!   type: route
//!   termination: passthrough
//! transport:
//!   type: stunnel
//! transfer:
//!   type: rsync
//!   flags: ["--recursive", "--links", "--bwlimit=2000"]
//! ```
//!
//! Everything but `pvcs` and `endpoint` has a default.

use std::collections::BTreeMap;
use std::path::Path;

use ferry_common::labels::{with_managed_by, LABEL_TRANSFER};
use ferry_common::{NamespacedName, ObjectStore};
use ferry_quiesce::QuiesceOptions;
use ferry_transfer::endpoint::{IngressEndpoint, RouteEndpoint, RouteTermination, ServiceEndpoint};
use ferry_transfer::transfer::{
    BlockrsyncOptions, BlockrsyncTransfer, RcloneTransfer, RsyncOptions, RsyncTransfer,
    WorkloadOptions,
};
use ferry_transfer::transport::{NullTransport, StunnelOptions, StunnelTransport};
use ferry_transfer::{
    Endpoint, EndpointType, Pvc, PvcPair, PvcPairList, Transfer, Transport, TransportType,
};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde::Deserialize;

use crate::{Error, Result};

/// A claim named in the config. Empty fields on a destination are taken
/// from the source.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ClaimRef {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PvcPairConfig {
    pub source: ClaimRef,
    #[serde(default)]
    pub destination: Option<ClaimRef>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TerminationConfig {
    Edge,
    #[default]
    Passthrough,
}

impl From<TerminationConfig> for RouteTermination {
    fn from(t: TerminationConfig) -> Self {
        match t {
            TerminationConfig::Edge => RouteTermination::Edge,
            TerminationConfig::Passthrough => RouteTermination::Passthrough,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTypeConfig {
    #[default]
    ClusterIp,
    NodePort,
    LoadBalancer,
}

/// How the destination is exposed
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum EndpointConfig {
    Route {
        #[serde(default)]
        termination: TerminationConfig,
        /// Apps domain override for long route hosts
        #[serde(default)]
        subdomain: Option<String>,
    },
    Ingress {
        subdomain: String,
        #[serde(default)]
        ingress_class: Option<String>,
    },
    Service {
        #[serde(default)]
        service_type: ServiceTypeConfig,
        /// Address of a node, required for `nodeport`
        #[serde(default)]
        node_address: Option<String>,
    },
}

impl EndpointConfig {
    pub fn endpoint_type(&self) -> EndpointType {
        match self {
            EndpointConfig::Route { .. } => EndpointType::Route,
            EndpointConfig::Ingress { .. } => EndpointType::Ingress,
            EndpointConfig::Service { .. } => EndpointType::Service,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Stunnel(StunnelOptions),
    /// Plain connection. Spelled `none` because a bare `null` is YAML's null.
    #[serde(rename = "none", alias = "null")]
    Null,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Stunnel(StunnelOptions::default())
    }
}

impl TransportConfig {
    pub fn transport_type(&self) -> TransportType {
        match self {
            TransportConfig::Stunnel(_) => TransportType::Stunnel,
            TransportConfig::Null => TransportType::Null,
        }
    }

    /// Options used for tunnels, the defaults when there is none
    pub fn stunnel_options(&self) -> StunnelOptions {
        match self {
            TransportConfig::Stunnel(options) => options.clone(),
            TransportConfig::Null => StunnelOptions::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransferConfig {
    Rsync {
        /// rsync client flags; archive-like defaults when absent
        #[serde(default)]
        flags: Option<Vec<String>>,
    },
    Rclone,
    Blockrsync(BlockrsyncOptions),
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig::Rsync { flags: None }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfig {
    pub pvcs: Vec<PvcPairConfig>,
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub workload: WorkloadOptions,
    #[serde(default)]
    pub quiesce: QuiesceOptions,
}

/// Name of the endpoint (and its Service) for a transfer
pub fn endpoint_name(transfer_id: &str) -> String {
    format!("ferry-{}", transfer_id)
}

impl MigrationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw).map_err(|e| Error::config(path, e.to_string()))
    }

    pub fn from_yaml(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Read every claim the config names. Source claims must exist;
    /// destination claims that don't exist yet are modelled on their source.
    pub async fn pvc_pairs<S: ObjectStore, D: ObjectStore>(
        &self,
        source: &S,
        destination: &D,
    ) -> ferry_common::Result<PvcPairList> {
        let mut errors = Vec::new();
        for (i, entry) in self.pvcs.iter().enumerate() {
            if entry.source.namespace.is_empty() || entry.source.name.is_empty() {
                errors.push(format!("pvcs[{}]: source needs a namespace and a name", i));
            }
        }
        ferry_common::Error::check_validation(errors)?;

        let mut pairs = Vec::with_capacity(self.pvcs.len());
        for entry in &self.pvcs {
            let src = &entry.source;
            let claim: PersistentVolumeClaim = source
                .get(&src.namespace, &src.name)
                .await?
                .ok_or_else(|| ferry_common::Error::NotFound {
                    kind: "PersistentVolumeClaim".to_string(),
                    namespace: src.namespace.clone(),
                    name: src.name.clone(),
                })?;
            let source_pvc = Pvc::new(claim);

            let dest = entry.destination.clone().unwrap_or_default();
            let namespace = non_empty_or(&dest.namespace, &src.namespace);
            let name = non_empty_or(&dest.name, &src.name);
            let dest_pvc = match destination
                .get::<PersistentVolumeClaim>(&namespace, &name)
                .await?
            {
                Some(claim) => Pvc::new(claim),
                None => source_pvc.renamed(&namespace, &name),
            };
            pairs.push(PvcPair::new(source_pvc, Some(dest_pvc)));
        }
        PvcPairList::new(pairs)
    }

    pub fn build_endpoint(&self, pvcs: &PvcPairList) -> ferry_common::Result<Endpoint> {
        let id = pvcs.transfer_id();
        let namespaced_name =
            NamespacedName::new(pvcs.destination_namespace(), endpoint_name(id));
        let labels = with_managed_by(&BTreeMap::from([(
            LABEL_TRANSFER.to_string(),
            id.to_string(),
        )]));
        let endpoint = match &self.endpoint {
            EndpointConfig::Route {
                termination,
                subdomain,
            } => RouteEndpoint::new(
                namespaced_name,
                &labels,
                (*termination).into(),
                subdomain.as_deref(),
            )
            .into(),
            EndpointConfig::Ingress {
                subdomain,
                ingress_class,
            } => IngressEndpoint::new(namespaced_name, &labels, subdomain, ingress_class.as_deref())
                .into(),
            EndpointConfig::Service {
                service_type,
                node_address,
            } => match service_type {
                ServiceTypeConfig::ClusterIp => {
                    ServiceEndpoint::cluster_ip(namespaced_name, &labels).into()
                }
                ServiceTypeConfig::NodePort => {
                    let address = node_address.as_deref().ok_or_else(|| {
                        ferry_common::Error::configuration(
                            "nodeport service endpoint needs nodeAddress",
                        )
                    })?;
                    ServiceEndpoint::node_port(namespaced_name, &labels, address).into()
                }
                ServiceTypeConfig::LoadBalancer => {
                    ServiceEndpoint::load_balancer(namespaced_name, &labels).into()
                }
            },
        };
        Ok(endpoint)
    }

    pub fn build_transport(&self) -> ferry_common::Result<Transport> {
        match &self.transport {
            TransportConfig::Stunnel(options) => {
                options.validate()?;
                Ok(StunnelTransport::new(options.clone()).into())
            }
            TransportConfig::Null => Ok(NullTransport::new().into()),
        }
    }

    pub fn build_transfer(
        &self,
        pvcs: PvcPairList,
        endpoint: Endpoint,
        transport: Transport,
    ) -> ferry_common::Result<Transfer> {
        let workload = self.workload.clone();
        let transfer = match &self.transfer {
            TransferConfig::Rsync { flags } => {
                let options = match flags {
                    Some(flags) => RsyncOptions::from_flags(flags)?,
                    None => RsyncOptions::default(),
                };
                RsyncTransfer::new(pvcs, endpoint, transport, options, workload)?.into()
            }
            TransferConfig::Rclone => {
                RcloneTransfer::new(pvcs, endpoint, transport, workload)?.into()
            }
            TransferConfig::Blockrsync(options) => {
                BlockrsyncTransfer::new(pvcs, endpoint, transport, options.clone(), workload)?
                    .into()
            }
        };
        Ok(transfer)
    }

    /// Resolve claims and build the whole transfer. Reads from both
    /// clusters, writes nothing.
    pub async fn plan<S: ObjectStore, D: ObjectStore>(
        &self,
        source: &S,
        destination: &D,
    ) -> ferry_common::Result<Transfer> {
        let pvcs = self.pvc_pairs(source, destination).await?;
        let endpoint = self.build_endpoint(&pvcs)?;
        let transport = self.build_transport()?;
        self.build_transfer(pvcs, endpoint, transport)
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_common::testing::InMemoryStore;
    use ferry_transfer::TransferType;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn claim(namespace: &str, name: &str, mode: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_mode: Some(mode.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    const MINIMAL: &str = r#"
pvcs:
  - source: { namespace: shop, name: orders }
endpoint:
  type: service
"#;

    #[test]
    fn minimal_config_takes_defaults() {
        let config = MigrationConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.pvcs.len(), 1);
        assert_eq!(config.pvcs[0].destination, None);
        assert_eq!(
            config.endpoint,
            EndpointConfig::Service {
                service_type: ServiceTypeConfig::ClusterIp,
                node_address: None
            }
        );
        assert_eq!(config.transport, TransportConfig::default());
        assert_eq!(config.transfer, TransferConfig::Rsync { flags: None });
        assert_eq!(config.workload, WorkloadOptions::default());
        assert_eq!(config.quiesce, QuiesceOptions::default());
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
pvcs:
  - source: { namespace: shop, name: orders }
    destination: { namespace: shop-new, name: orders-copy }
endpoint:
  type: route
  termination: edge
  subdomain: apps.example.com
transport:
  type: stunnel
  caVerifyLevel: "3"
  proxyUrl: http://proxy.corp:3128
transfer:
  type: rsync
  flags: ["--recursive", "--bwlimit=500"]
workload:
  nodeName: worker-1
  images:
    rsync: registry.local/rsync:1
quiesce:
  pollIntervalSeconds: 2
  wait: false
"#;
        let config = MigrationConfig::from_yaml(raw).unwrap();
        assert_eq!(
            config.endpoint,
            EndpointConfig::Route {
                termination: TerminationConfig::Edge,
                subdomain: Some("apps.example.com".to_string())
            }
        );
        let stunnel = config.transport.stunnel_options();
        assert_eq!(stunnel.ca_verify_level, "3");
        assert_eq!(stunnel.proxy_url.as_deref(), Some("http://proxy.corp:3128"));
        assert!(stunnel.no_verify_ca);
        assert_eq!(config.workload.node_name.as_deref(), Some("worker-1"));
        assert_eq!(config.workload.images.rsync, "registry.local/rsync:1");
        assert_eq!(config.quiesce.poll_interval_seconds, 2);
        assert!(!config.quiesce.wait);
    }

    #[test]
    fn unknown_endpoint_type_is_rejected() {
        let raw = "pvcs: []\nendpoint:\n  type: gateway\n";
        assert!(MigrationConfig::from_yaml(raw).is_err());
    }

    /// Story: a config naming filesystem claims plans an rsync transfer into
    /// the destination namespace
    #[tokio::test]
    async fn story_plan_resolves_claims_from_both_clusters() {
        let source = InMemoryStore::new();
        let destination = InMemoryStore::new();
        source.seed(claim("shop", "orders", "Filesystem"));
        let raw = r#"
pvcs:
  - source: { namespace: shop, name: orders }
    destination: { namespace: shop-new }
endpoint:
  type: service
transport:
  type: none
"#;
        let config = MigrationConfig::from_yaml(raw).unwrap();

        let transfer = config.plan(&source, &destination).await.unwrap();

        assert_eq!(transfer.transfer_type(), TransferType::Rsync);
        let pair = transfer.pvcs().iter().next().unwrap();
        assert_eq!(pair.destination().namespace(), "shop-new");
        assert_eq!(pair.destination().name(), "orders");
        let endpoint = transfer.endpoint();
        assert_eq!(endpoint.namespaced_name().namespace, "shop-new");
        assert_eq!(
            endpoint.namespaced_name().name,
            endpoint_name(transfer.pvcs().transfer_id())
        );
        assert_eq!(endpoint.labels()[LABEL_TRANSFER], transfer.pvcs().transfer_id());
        assert!(source.operations().is_empty());
        assert!(destination.operations().is_empty());
    }

    #[tokio::test]
    async fn block_claims_cannot_use_rsync() {
        let source = InMemoryStore::new();
        source.seed(claim("shop", "disk", "Block"));
        let config = MigrationConfig::from_yaml(
            "pvcs:\n  - source: { namespace: shop, name: disk }\nendpoint:\n  type: service\ntransport:\n  type: none\n",
        )
        .unwrap();

        let err = config.plan(&source, &InMemoryStore::new()).await.unwrap_err();
        assert!(matches!(err, ferry_common::Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn block_claims_plan_blockrsync() {
        let source = InMemoryStore::new();
        source.seed(claim("shop", "disk", "Block"));
        let config = MigrationConfig::from_yaml(
            "pvcs:\n  - source: { namespace: shop, name: disk }\nendpoint:\n  type: service\ntransfer:\n  type: blockrsync\n  blockSize: 65536\n",
        )
        .unwrap();

        let transfer = config.plan(&source, &InMemoryStore::new()).await.unwrap();
        assert_eq!(transfer.transfer_type(), TransferType::Blockrsync);
        assert_eq!(transfer.transport().transport_type(), TransportType::Stunnel);
    }

    #[tokio::test]
    async fn missing_source_claim_is_not_found() {
        let config = MigrationConfig::from_yaml(MINIMAL).unwrap();
        let err = config
            .plan(&InMemoryStore::new(), &InMemoryStore::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn empty_source_refs_are_reported_together() {
        let config = MigrationConfig::from_yaml(
            "pvcs:\n  - source: { name: a }\n  - source: { namespace: shop }\nendpoint:\n  type: service\n",
        )
        .unwrap();
        let err = config
            .plan(&InMemoryStore::new(), &InMemoryStore::new())
            .await
            .unwrap_err();
        match err {
            ferry_common::Error::Validation { errors } => assert_eq!(errors.len(), 2),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nodeport_needs_an_address() {
        let source = InMemoryStore::new();
        source.seed(claim("shop", "orders", "Filesystem"));
        let config = MigrationConfig::from_yaml(
            "pvcs:\n  - source: { namespace: shop, name: orders }\nendpoint:\n  type: service\n  serviceType: nodeport\n",
        )
        .unwrap();
        let err = config.plan(&source, &InMemoryStore::new()).await.unwrap_err();
        assert!(matches!(err, ferry_common::Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn bad_rsync_flags_fail_planning() {
        let source = InMemoryStore::new();
        source.seed(claim("shop", "orders", "Filesystem"));
        let config = MigrationConfig::from_yaml(
            "pvcs:\n  - source: { namespace: shop, name: orders }\nendpoint:\n  type: service\ntransfer:\n  type: rsync\n  flags: [\"--bwlimit=fast\"]\n",
        )
        .unwrap();
        assert!(config.plan(&source, &InMemoryStore::new()).await.is_err());
    }

    #[tokio::test]
    async fn rsync_flags_without_bandwidth_limit_fail_planning() {
        let source = InMemoryStore::new();
        source.seed(claim("shop", "orders", "Filesystem"));
        let destination = InMemoryStore::new();
        let config = MigrationConfig::from_yaml(
            "pvcs:\n  - source: { namespace: shop, name: orders }\nendpoint:\n  type: service\ntransfer:\n  type: rsync\n  flags: [\"--recursive\"]\n",
        )
        .unwrap();
        let err = config.plan(&source, &destination).await.unwrap_err();
        assert!(matches!(err, ferry_common::Error::Validation { .. }));
        assert!(destination.operations().is_empty());
    }

    #[tokio::test]
    async fn invalid_tunnel_options_fail_planning() {
        let source = InMemoryStore::new();
        source.seed(claim("shop", "orders", "Filesystem"));
        let config = MigrationConfig::from_yaml(
            "pvcs:\n  - source: { namespace: shop, name: orders }\nendpoint:\n  type: service\ntransport:\n  type: stunnel\n  caVerifyLevel: \"9\"\n",
        )
        .unwrap();
        let err = config.plan(&source, &InMemoryStore::new()).await.unwrap_err();
        assert!(matches!(err, ferry_common::Error::Validation { .. }));
    }
}
