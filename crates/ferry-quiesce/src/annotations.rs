//! Pre-quiesce records kept as annotations on the quiesced object
//!
//! Each record is the value a workload controller had before it was
//! quiesced. Encoding is total; decoding rejects anything the encoder could
//! not have produced.

use std::collections::BTreeMap;

use ferry_common::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Replica count (or Job parallelism) before quiesce
pub const PRE_QUIESCE_REPLICAS: &str = "ferry.dev/pre-quiesce-replicas";

/// DaemonSet pod node selector before quiesce, as a JSON object
pub const PRE_QUIESCE_NODE_SELECTOR: &str = "ferry.dev/pre-quiesce-node-selector";

/// CronJob suspend flag before quiesce
pub const PRE_QUIESCE_SUSPEND: &str = "ferry.dev/pre-quiesce-suspend";

/// Node selector key no node carries, keeping DaemonSet pods unscheduled
pub const QUIESCE_NODE_SELECTOR_KEY: &str = "ferry.dev/quiesce-daemonset";

/// Value paired with [`QUIESCE_NODE_SELECTOR_KEY`]
pub const QUIESCE_NODE_SELECTOR_VALUE: &str = "true";

/// Encode a replica count
pub fn encode_replicas(replicas: i32) -> String {
    replicas.to_string()
}

/// Decode a replica count; negative counts are rejected
pub fn decode_replicas(value: &str) -> Result<i32> {
    match value.trim().parse::<i32>() {
        Ok(n) if n >= 0 => Ok(n),
        _ => Err(Error::serialization(format!(
            "{} '{}' is not a replica count",
            PRE_QUIESCE_REPLICAS, value
        ))),
    }
}

/// Encode a suspend flag
pub fn encode_suspend(suspend: bool) -> String {
    suspend.to_string()
}

/// Decode a suspend flag
pub fn decode_suspend(value: &str) -> Result<bool> {
    value.trim().parse::<bool>().map_err(|_| {
        Error::serialization(format!(
            "{} '{}' is not true or false",
            PRE_QUIESCE_SUSPEND, value
        ))
    })
}

/// Encode a node selector as a JSON object
pub fn encode_node_selector(selector: &BTreeMap<String, String>) -> String {
    // a map of strings always serializes
    serde_json::to_string(selector).unwrap_or_else(|_| "{}".to_string())
}

/// Decode a node selector
pub fn decode_node_selector(value: &str) -> Result<BTreeMap<String, String>> {
    serde_json::from_str(value).map_err(|e| {
        Error::serialization_for_kind(
            "DaemonSet",
            format!("{} is not a string map: {}", PRE_QUIESCE_NODE_SELECTOR, e),
        )
    })
}

/// Annotation value on `meta`, if present
pub fn get(meta: &ObjectMeta, key: &str) -> Option<String> {
    meta.annotations.as_ref().and_then(|a| a.get(key).cloned())
}

/// Set an annotation on `meta`
pub fn set(meta: &mut ObjectMeta, key: &str, value: String) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value);
}

/// Remove an annotation from `meta`, returning its value
pub fn remove(meta: &mut ObjectMeta, key: &str) -> Option<String> {
    meta.annotations.as_mut().and_then(|a| a.remove(key))
}
