//! Cluster object-store contract
//!
//! Everything in ferry talks to a cluster through [`ObjectStore`]: create,
//! get, update and list over typed Kubernetes objects. [`KubeStore`] is the
//! kube-rs implementation; tests use the in-memory store from
//! [`crate::testing`].

use std::fmt;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::{Error, Result};

/// A namespaced object kind the store can handle
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// A cluster-scoped object kind the store can read
pub trait ClusterObject:
    Resource<DynamicType = (), Scope = ClusterResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Namespace and name of an object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl NamespacedName {
    /// Create a new namespaced name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Create / get / update / list over typed cluster objects.
///
/// Implementations never retry; every failure is returned to the caller.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create an object. Fails if it already exists.
    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Get an object, `None` if it doesn't exist
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Replace an existing object
    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// List objects in a namespace, optionally filtered by a label selector
    /// (`key=value,key2=value2`)
    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>>;

    /// Get a cluster-scoped object, `None` if it doesn't exist
    async fn get_cluster<K: ClusterObject>(&self, name: &str) -> Result<Option<K>>;

    /// Update the object if it exists, create it otherwise
    async fn create_or_update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let namespace = object_namespace(obj)?;
        match self.get::<K>(&namespace, &obj.name_any()).await? {
            Some(existing) => {
                let mut desired = obj.clone();
                desired.meta_mut().resource_version = existing.resource_version();
                self.update(&desired).await
            }
            None => self.create(obj).await,
        }
    }
}

/// Namespace of an object, required for every store operation
pub fn object_namespace<K: StoreObject>(obj: &K) -> Result<String> {
    obj.namespace().ok_or_else(|| {
        Error::configuration(format!(
            "{} {} has no namespace",
            K::kind(&()),
            obj.name_any()
        ))
    })
}

/// [`ObjectStore`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying kube client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let namespace = object_namespace(obj)?;
        trace!(
            kind = %K::kind(&()),
            namespace = %namespace,
            name = %obj.name_any(),
            "creating object"
        );
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let namespace = object_namespace(obj)?;
        let name = obj.name_any();
        trace!(kind = %K::kind(&()), namespace = %namespace, name = %name, "updating object");
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn get_cluster<K: ClusterObject>(&self, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    #[test]
    fn namespaced_name_display() {
        let nn = NamespacedName::new("dest", "ferry-abc");
        assert_eq!(nn.to_string(), "dest/ferry-abc");
    }

    #[test]
    fn object_namespace_is_required() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("cfg".to_string());
        assert!(matches!(
            object_namespace(&cm),
            Err(Error::Configuration { .. })
        ));

        cm.metadata.namespace = Some("ns".to_string());
        assert_eq!(object_namespace(&cm).unwrap(), "ns");
    }
}
