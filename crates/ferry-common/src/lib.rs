//! Common types for ferry: errors, the cluster object-store contract, labels
//! and Kubernetes helpers

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod labels;
pub mod openshift;
pub mod store;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::Error;
pub use store::{ClusterObject, KubeStore, NamespacedName, ObjectStore, StoreObject};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
