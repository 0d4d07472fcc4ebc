//! Error types for ferry
//!
//! Errors are grouped by how a caller should react to them:
//!
//! - cluster API failures (`Kube`, `Conflict`, `NotFound`) are returned as-is
//!   and never retried by the library
//! - `Validation` aggregates every problem found in the input before any
//!   object is created
//! - `Configuration` is fatal and fails fast
//! - `PartialCreation` reports every sub-resource that failed during a
//!   multi-object create; objects that did get created are left in place

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for ferry operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Object already exists in the store
    #[error("{kind} {namespace}/{name} already exists")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Namespace of the object (empty for cluster-scoped objects)
        namespace: String,
        /// Name of the object
        name: String,
    },

    /// Object does not exist in the store
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Namespace of the object (empty for cluster-scoped objects)
        namespace: String,
        /// Name of the object
        name: String,
    },

    /// One or more validation failures, collected before any mutation
    #[error("validation failed: {}", .errors.join("; "))]
    Validation {
        /// Every problem found, in the order it was detected
        errors: Vec<String>,
    },

    /// Unsupported or inconsistent configuration
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's wrong
        message: String,
    },

    /// Some sub-resources of a multi-object create failed
    #[error("failed to create {resource}: {}", format_failures(.failures))]
    PartialCreation {
        /// The aggregate being created (e.g. "route endpoint ns/name")
        resource: String,
        /// Every sub-resource failure
        failures: Vec<Error>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Certificate or key generation failure
    #[error("certificate error: {message}")]
    Certificate {
        /// Description of what failed
        message: String,
    },

    /// Configuration template failed to render
    #[error("template error: {message}")]
    Template {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

fn format_failures(failures: &[Error]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a validation error with a single message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            errors: vec![msg.into()],
        }
    }

    /// Return `Ok(())` when no problems were collected, otherwise a single
    /// aggregate validation error
    pub fn check_validation(errors: Vec<String>) -> Result<(), Self> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::Validation { errors })
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Return `Ok(())` when every sub-resource succeeded, otherwise a
    /// partial-creation error carrying all failures
    pub fn check_partial(resource: impl Into<String>, failures: Vec<Error>) -> Result<(), Self> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Self::PartialCreation {
                resource: resource.into(),
                failures,
            })
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a certificate error
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate {
            message: msg.into(),
        }
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error came from the cluster object store
    pub fn is_cluster_api(&self) -> bool {
        matches!(
            self,
            Error::Kube { .. } | Error::Conflict { .. } | Error::NotFound { .. }
        )
    }

    /// Whether the store reported that the object (or its API) does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube { source } => {
                matches!(source, kube::Error::Api(ae) if ae.code == 404)
            }
            _ => false,
        }
    }

    /// Whether the store reported that the object already exists
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube { source } => {
                matches!(source, kube::Error::Api(ae) if ae.code == 409)
            }
            _ => false,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
