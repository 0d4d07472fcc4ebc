//! Builders for the plain Kubernetes objects transports and transfers create

use std::collections::BTreeMap;

use ferry_common::labels::with_managed_by;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, EnvVar, EnvVarSource, KeyToPath,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec, Secret, SecretKeySelector,
    SecretVolumeSource, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;

/// Metadata for an object ferry owns
pub(crate) fn object_meta(
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(with_managed_by(labels)),
        ..Default::default()
    }
}

pub(crate) fn config_map(
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
    data: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(namespace, name, labels),
        data: Some(data),
        ..Default::default()
    }
}

pub(crate) fn secret(
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
    data: BTreeMap<String, ByteString>,
) -> Secret {
    Secret {
        metadata: object_meta(namespace, name, labels),
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Secret data from string values
pub(crate) fn string_data<const N: usize>(
    entries: [(&str, String); N],
) -> BTreeMap<String, ByteString> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.into_bytes())))
        .collect()
}

pub(crate) fn config_map_volume(volume_name: &str, config_map_name: &str) -> Volume {
    Volume {
        name: volume_name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Secret volume; `items` projects single keys to chosen file names
pub(crate) fn secret_volume(
    volume_name: &str,
    secret_name: &str,
    default_mode: Option<i32>,
    items: Option<Vec<(&str, &str)>>,
) -> Volume {
    Volume {
        name: volume_name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            default_mode,
            items: items.map(|items| {
                items
                    .into_iter()
                    .map(|(key, path)| KeyToPath {
                        key: key.to_string(),
                        path: path.to_string(),
                        ..Default::default()
                    })
                    .collect()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn pvc_volume(volume_name: &str, claim_name: &str) -> Volume {
    Volume {
        name: volume_name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim_name.to_string(),
            read_only: Some(false),
        }),
        ..Default::default()
    }
}

/// Single-replica Deployment whose pods carry `labels`
pub(crate) fn deployment(
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
    spec: PodSpec,
) -> Deployment {
    Deployment {
        metadata: object_meta(namespace, name, labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn pod(
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
    spec: PodSpec,
) -> Pod {
    Pod {
        metadata: object_meta(namespace, name, labels),
        spec: Some(spec),
        ..Default::default()
    }
}

/// Environment variable read from a Secret key
pub(crate) fn secret_env(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
