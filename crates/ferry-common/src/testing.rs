//! In-memory [`ObjectStore`] for tests
//!
//! Objects are stored as JSON keyed by kind, namespace and name. Tests can
//! seed objects, edit them in place to play the part of a cluster controller
//! (assigning a route host, a load-balancer address, a pod phase), inject
//! failures for specific operations, and inspect the order of mutations.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde_json::Value;

use crate::store::{object_namespace, ClusterObject, ObjectStore, StoreObject};
use crate::{Error, Result};

/// Store operation, used for failure injection and the operation log
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// `create`
    Create,
    /// `get` / `get_cluster`
    Get,
    /// `update`
    Update,
    /// `list`
    List,
}

type Key = (String, String, String);

#[derive(Debug)]
struct Failure {
    operation: Operation,
    kind: String,
    name: Option<String>,
}

/// Thread-safe in-memory object store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: Mutex<BTreeMap<Key, Value>>,
    failures: Mutex<Vec<Failure>>,
    log: Mutex<Vec<String>>,
    next_version: Mutex<u64>,
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_string()
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `operation` on `kind` fail (optionally only for `name`)
    pub fn fail_on(&self, operation: Operation, kind: &str, name: Option<&str>) {
        lock(&self.failures).push(Failure {
            operation,
            kind: kind.to_string(),
            name: name.map(str::to_string),
        });
    }

    /// Mutations performed so far, as `"create Service ns/name"` lines
    pub fn operations(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    /// Insert or overwrite an object without logging or failure checks
    pub fn seed<K: StoreObject>(&self, obj: K) {
        let namespace = obj.namespace().unwrap_or_default();
        let key = (kind_of::<K>(), namespace, obj.name_any());
        let value = serde_json::to_value(&obj).expect("test object serializes");
        lock(&self.objects).insert(key, value);
    }

    /// Insert or overwrite a cluster-scoped object
    pub fn seed_cluster<K: ClusterObject>(&self, obj: K) {
        let key = (kind_of::<K>(), String::new(), obj.name_any());
        let value = serde_json::to_value(&obj).expect("test object serializes");
        lock(&self.objects).insert(key, value);
    }

    /// Read an object directly
    pub fn object<K: StoreObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        lock(&self.objects)
            .get(&key)
            .map(|v| serde_json::from_value(v.clone()).expect("stored object deserializes"))
    }

    /// All objects of a kind in a namespace
    pub fn objects<K: StoreObject>(&self, namespace: &str) -> Vec<K> {
        let kind = kind_of::<K>();
        lock(&self.objects)
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, v)| serde_json::from_value(v.clone()).expect("stored object deserializes"))
            .collect()
    }

    /// Edit a stored object in place, the way a cluster controller would.
    ///
    /// Panics if the object doesn't exist.
    pub fn modify<K: StoreObject>(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) {
        let mut obj: K = self
            .object(namespace, name)
            .unwrap_or_else(|| panic!("{} {}/{} not in store", kind_of::<K>(), namespace, name));
        f(&mut obj);
        self.seed(obj);
    }

    fn check_failure(&self, operation: Operation, kind: &str, name: &str) -> Result<()> {
        let failures = lock(&self.failures);
        let hit = failures.iter().any(|f| {
            f.operation == operation
                && f.kind == kind
                && f.name.as_deref().is_none_or(|n| n == name)
        });
        if hit {
            return Err(Error::internal_with_context(
                "in-memory store",
                format!("injected {:?} failure for {} {}", operation, kind, name),
            ));
        }
        Ok(())
    }

    fn record(&self, operation: &str, kind: &str, namespace: &str, name: &str) {
        lock(&self.log).push(format!("{} {} {}/{}", operation, kind, namespace, name));
    }

    fn bump_version(&self, value: &mut Value) {
        let mut next = lock(&self.next_version);
        *next += 1;
        if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert(
                "resourceVersion".to_string(),
                Value::String(next.to_string()),
            );
        }
    }
}

/// Match an equality-based label selector (`a=1,b=2`, or bare `a` for
/// existence) against an object's labels
fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let kind = kind_of::<K>();
        let namespace = object_namespace(obj)?;
        let name = obj.name_any();
        self.check_failure(Operation::Create, &kind, &name)?;

        let key = (kind.clone(), namespace.clone(), name.clone());
        let mut value = serde_json::to_value(obj)?;
        self.bump_version(&mut value);
        {
            let mut objects = lock(&self.objects);
            if objects.contains_key(&key) {
                return Err(Error::Conflict {
                    kind,
                    namespace,
                    name,
                });
            }
            objects.insert(key, value.clone());
        }
        self.record("create", &kind, &namespace, &name);
        Ok(serde_json::from_value(value)?)
    }

    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let kind = kind_of::<K>();
        self.check_failure(Operation::Get, &kind, name)?;
        let key = (kind, namespace.to_string(), name.to_string());
        let value = lock(&self.objects).get(&key).cloned();
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let kind = kind_of::<K>();
        let namespace = object_namespace(obj)?;
        let name = obj.name_any();
        self.check_failure(Operation::Update, &kind, &name)?;

        let key = (kind.clone(), namespace.clone(), name.clone());
        let mut value = serde_json::to_value(obj)?;
        self.bump_version(&mut value);
        {
            let mut objects = lock(&self.objects);
            if !objects.contains_key(&key) {
                return Err(Error::NotFound {
                    kind,
                    namespace,
                    name,
                });
            }
            objects.insert(key, value.clone());
        }
        self.record("update", &kind, &namespace, &name);
        Ok(serde_json::from_value(value)?)
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let kind = kind_of::<K>();
        self.check_failure(Operation::List, &kind, "")?;
        let items: Vec<K> = self.objects(namespace);
        Ok(items
            .into_iter()
            .filter(|obj| match label_selector {
                Some(selector) => selector_matches(selector, obj.labels()),
                None => true,
            })
            .collect())
    }

    async fn get_cluster<K: ClusterObject>(&self, name: &str) -> Result<Option<K>> {
        let kind = kind_of::<K>();
        self.check_failure(Operation::Get, &kind, name)?;
        let key = (kind, String::new(), name.to_string());
        let value = lock(&self.objects).get(&key).cloned();
        Ok(value.map(serde_json::from_value).transpose()?)
    }
}
