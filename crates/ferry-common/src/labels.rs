//! Label keys and label-value validation
//!
//! Label maps are plain values: every constructor copies the map it is
//! given, and nothing in ferry mutates a map it did not build itself.

use std::collections::BTreeMap;

/// Standard label for the tool managing a resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on every object ferry creates
pub const MANAGED_BY_FERRY: &str = "ferry";

/// Standard label for the component role of a resource
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Label carrying the label-safe identifier of the transfer an object belongs to
pub const LABEL_TRANSFER: &str = "ferry.dev/transfer";

/// Maximum length of a label value
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// Check that `value` is a legal Kubernetes label value.
///
/// Label values are empty, or at most 63 characters of `[A-Za-z0-9._-]`
/// beginning and ending with an alphanumeric character.
pub fn validate_label_value(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_LABEL_VALUE_LEN {
        return Err(format!(
            "label value '{}' is {} characters, must be at most {}",
            value,
            value.len(),
            MAX_LABEL_VALUE_LEN
        ));
    }
    let bytes = value.as_bytes();
    let alnum = |b: &u8| b.is_ascii_alphanumeric();
    if !alnum(&bytes[0]) || !alnum(&bytes[bytes.len() - 1]) {
        return Err(format!(
            "label value '{}' must begin and end with an alphanumeric character",
            value
        ));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!(
            "label value '{}' contains invalid character '{}'",
            value, c
        ));
    }
    Ok(())
}

/// Format a label map as an equality selector (`a=1,b=2`)
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Return a new map holding `base` overlaid with `extra`
pub fn merged(
    base: &BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out = base.clone();
    out.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

/// Copy of `labels` with the ferry managed-by label added
pub fn with_managed_by(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = labels.clone();
    out.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_FERRY.to_string());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_legal_label_values() {
        for value in ["", "a", "data", "my-pvc.v1", "A_b-c.9", &"x".repeat(63)] {
            assert!(validate_label_value(value).is_ok(), "{value} should be legal");
        }
    }

    #[test]
    fn rejects_illegal_label_values() {
        assert!(validate_label_value(&"x".repeat(64)).is_err());
        assert!(validate_label_value("-leading").is_err());
        assert!(validate_label_value("trailing.").is_err());
        assert!(validate_label_value("has space").is_err());
        assert!(validate_label_value("slash/inside").is_err());
    }

    #[test]
    fn selector_is_sorted_and_comma_joined() {
        let labels = BTreeMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        assert_eq!(selector_string(&labels), "a=1,b=2");
    }

    #[test]
    fn merging_does_not_touch_inputs() {
        let base = BTreeMap::from([("a".to_string(), "1".to_string())]);
        let extra = BTreeMap::from([("a".to_string(), "override".to_string())]);

        let out = merged(&base, &extra);
        assert_eq!(out["a"], "override");
        assert_eq!(base["a"], "1");

        let managed = with_managed_by(&base);
        assert_eq!(managed[LABEL_MANAGED_BY], MANAGED_BY_FERRY);
        assert!(!base.contains_key(LABEL_MANAGED_BY));
    }
}
