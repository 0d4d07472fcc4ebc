//! Volume claims, pairs of claims, and validated lists of pairs
//!
//! A [`PvcPairList`] can only be built through [`PvcPairList::new`], which
//! checks every pairing rule up front. Everything downstream (endpoints,
//! transports, transfers) takes the validated list, so invalid input never
//! reaches the cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ferry_common::labels::validate_label_value;
use ferry_common::{Error, NamespacedName, Result};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use md5::{Digest, Md5};

/// Annotation CDI sets on volumes that hold virtual-machine disk content
pub const CONTENT_TYPE_ANNOTATION: &str = "cdi.kubevirt.io/storage.contentType";

/// Value of [`CONTENT_TYPE_ANNOTATION`] for VM disks
pub const CONTENT_TYPE_KUBEVIRT: &str = "kubevirt";

/// `spec.volumeMode` of raw block volumes
pub const VOLUME_MODE_BLOCK: &str = "Block";

/// A persistent volume claim plus its label-safe name
#[derive(Clone, Debug)]
pub struct Pvc {
    claim: PersistentVolumeClaim,
    label_safe_name: String,
}

/// Lower-case hex MD5 of `name`: always 32 characters of `[0-9a-f]`
pub fn label_safe_name(name: &str) -> String {
    format!("{:x}", Md5::digest(name.as_bytes()))
}

impl Pvc {
    /// Wrap a claim read from the cluster (or built by hand)
    pub fn new(claim: PersistentVolumeClaim) -> Self {
        let label_safe_name = label_safe_name(&claim.name_any());
        Self {
            claim,
            label_safe_name,
        }
    }

    /// A bare filesystem claim reference with no spec
    pub fn from_name(namespace: &str, name: &str) -> Self {
        Self::new(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    /// Claim name
    pub fn name(&self) -> String {
        self.claim.name_any()
    }

    /// Claim namespace, empty when unset
    pub fn namespace(&self) -> String {
        self.claim.namespace().unwrap_or_default()
    }

    /// Namespace and name of the claim
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace(), self.name())
    }

    /// The wrapped claim
    pub fn claim(&self) -> &PersistentVolumeClaim {
        &self.claim
    }

    /// Hash of the claim name that is always a legal label value
    pub fn label_safe_name(&self) -> &str {
        &self.label_safe_name
    }

    /// Whether the claim is a raw block volume
    pub fn is_block(&self) -> bool {
        self.claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_mode.as_deref())
            == Some(VOLUME_MODE_BLOCK)
    }

    /// Whether the claim is annotated as holding VM disk content
    pub fn is_vm_disk(&self) -> bool {
        self.claim
            .annotations()
            .get(CONTENT_TYPE_ANNOTATION)
            .map(String::as_str)
            == Some(CONTENT_TYPE_KUBEVIRT)
    }

    /// Block volumes and VM disks are copied as devices, never as file trees
    pub fn is_block_or_vm_disk(&self) -> bool {
        self.is_block() || self.is_vm_disk()
    }

    /// Copy of this claim under a different identity. Empty arguments keep
    /// the current value.
    pub fn renamed(&self, namespace: &str, name: &str) -> Self {
        let mut claim = self.claim.clone();
        if !namespace.is_empty() {
            claim.metadata.namespace = Some(namespace.to_string());
        }
        if !name.is_empty() {
            claim.metadata.name = Some(name.to_string());
        }
        // Server-populated fields belong to the original object
        claim.metadata.uid = None;
        claim.metadata.resource_version = None;
        claim.metadata.creation_timestamp = None;
        claim.status = None;
        Self::new(claim)
    }

    /// Set the volume mode, building an empty spec if needed
    pub fn with_volume_mode(mut self, mode: &str) -> Self {
        self.claim
            .spec
            .get_or_insert_with(PersistentVolumeClaimSpec::default)
            .volume_mode = Some(mode.to_string());
        self
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.claim
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }
}

impl fmt::Display for Pvc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespaced_name())
    }
}

/// A source claim and the destination claim its contents go to
#[derive(Clone, Debug)]
pub struct PvcPair {
    source: Pvc,
    destination: Pvc,
}

impl PvcPair {
    /// Pair `source` with `destination`.
    ///
    /// A missing destination is the source itself; a destination with an
    /// empty name or namespace takes that value from the source.
    pub fn new(source: Pvc, destination: Option<Pvc>) -> Self {
        let destination = match destination {
            None => source.clone(),
            Some(dest) if dest.name().is_empty() || dest.namespace().is_empty() => {
                let namespace = if dest.namespace().is_empty() {
                    source.namespace()
                } else {
                    dest.namespace()
                };
                let name = if dest.name().is_empty() {
                    source.name()
                } else {
                    dest.name()
                };
                dest.renamed(&namespace, &name)
            }
            Some(dest) => dest,
        };
        Self {
            source,
            destination,
        }
    }

    /// Source claim
    pub fn source(&self) -> &Pvc {
        &self.source
    }

    /// Destination claim
    pub fn destination(&self) -> &Pvc {
        &self.destination
    }

    /// Identifier of the pair: the source's label-safe name
    pub fn id(&self) -> &str {
        self.source.label_safe_name()
    }

    /// Whether the pair is copied as devices. Only meaningful once the pair
    /// is known to be consistent (see [`PvcPair::is_consistent`]).
    pub fn is_block_or_vm_disk(&self) -> bool {
        self.source.is_block_or_vm_disk()
    }

    /// Both sides agree on block-or-VM-disk versus filesystem
    pub fn is_consistent(&self) -> bool {
        self.source.is_block_or_vm_disk() == self.destination.is_block_or_vm_disk()
    }
}

impl fmt::Display for PvcPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// A validated, ordered, non-empty list of pairs sharing one source and one
/// destination namespace
#[derive(Clone, Debug)]
pub struct PvcPairList {
    pairs: Vec<PvcPair>,
}

impl PvcPairList {
    /// Validate `pairs`, reporting every problem in one error
    pub fn new(pairs: Vec<PvcPair>) -> Result<Self> {
        let mut errors = Vec::new();

        if pairs.is_empty() {
            return Err(Error::validation("pvc list is empty"));
        }

        let sources: BTreeSet<String> = pairs.iter().map(|p| p.source.namespace()).collect();
        if sources.len() > 1 {
            errors.push(format!(
                "pvc list spans source namespaces {}",
                sources.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
        let destinations: BTreeSet<String> =
            pairs.iter().map(|p| p.destination.namespace()).collect();
        if destinations.len() > 1 {
            errors.push(format!(
                "pvc list spans destination namespaces {}",
                destinations.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }

        let mut seen_sources = BTreeSet::new();
        let mut seen_destinations = BTreeSet::new();
        for pair in &pairs {
            for pvc in [&pair.source, &pair.destination] {
                if pvc.name().is_empty() {
                    errors.push(format!("pair {}: claim name is empty", pair));
                }
                if pvc.namespace().is_empty() {
                    errors.push(format!("pair {}: claim namespace is empty", pair));
                }
                if let Err(e) = validate_label_value(pvc.label_safe_name()) {
                    errors.push(format!("pair {}: {}", pair, e));
                }
            }
            if !pair.is_consistent() {
                errors.push(format!(
                    "pair {}: cannot pair a block or VM-disk volume with a filesystem volume",
                    pair
                ));
            }
            if !seen_sources.insert(pair.source.namespaced_name()) {
                errors.push(format!("source {} appears more than once", pair.source));
            }
            if !seen_destinations.insert(pair.destination.namespaced_name()) {
                errors.push(format!(
                    "destination {} appears more than once",
                    pair.destination
                ));
            }
        }

        let block = pairs
            .iter()
            .filter(|p| p.is_consistent() && p.is_block_or_vm_disk())
            .count();
        let filesystem = pairs
            .iter()
            .filter(|p| p.is_consistent() && !p.is_block_or_vm_disk())
            .count();
        if block > 0 && filesystem > 0 {
            errors.push(format!(
                "pvc list mixes {} block or VM-disk pairs with {} filesystem pairs",
                block, filesystem
            ));
        }

        Error::check_validation(errors)?;
        Ok(Self { pairs })
    }

    /// The one source namespace
    pub fn source_namespace(&self) -> String {
        self.pairs[0].source.namespace()
    }

    /// The one destination namespace
    pub fn destination_namespace(&self) -> String {
        self.pairs[0].destination.namespace()
    }

    /// Identifier used to name everything a transfer of this list creates
    pub fn transfer_id(&self) -> &str {
        self.pairs[0].id()
    }

    /// Pairs in order
    pub fn iter(&self) -> impl Iterator<Item = &PvcPair> {
        self.pairs.iter()
    }

    /// Number of pairs (never zero)
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Always false; present for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Whether every pair is copied as devices
    pub fn is_block_or_vm_disk(&self) -> bool {
        self.pairs.iter().all(PvcPair::is_block_or_vm_disk)
    }

    /// Pair whose source claim is called `name`
    pub fn in_source_namespace(&self, name: &str) -> Option<&PvcPair> {
        self.pairs.iter().find(|p| p.source.name() == name)
    }

    /// Pair whose destination claim is called `name`
    pub fn in_destination_namespace(&self, name: &str) -> Option<&PvcPair> {
        self.pairs.iter().find(|p| p.destination.name() == name)
    }
}

impl<'a> IntoIterator for &'a PvcPairList {
    type Item = &'a PvcPair;
    type IntoIter = std::slice::Iter<'a, PvcPair>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs(namespace: &str, name: &str) -> Pvc {
        Pvc::from_name(namespace, name).with_volume_mode("Filesystem")
    }

    fn block(namespace: &str, name: &str) -> Pvc {
        Pvc::from_name(namespace, name).with_volume_mode(VOLUME_MODE_BLOCK)
    }

    fn validation_errors(result: Result<PvcPairList>) -> Vec<String> {
        match result {
            Err(Error::Validation { errors }) => errors,
            other => panic!("expected validation error, got {:?}", other.map(|l| l.len())),
        }
    }

    #[test]
    fn label_safe_name_is_md5_hex() {
        assert_eq!(label_safe_name("data"), "8d777f385d3dfec8815d20f7496026dc");
        let long = "x".repeat(300);
        let pvc = Pvc::from_name("ns", &long);
        assert_eq!(pvc.label_safe_name().len(), 32);
        assert!(validate_label_value(pvc.label_safe_name()).is_ok());
    }

    #[test]
    fn classification() {
        assert!(block("a", "disk").is_block_or_vm_disk());
        assert!(!fs("a", "data").is_block_or_vm_disk());

        let vm = fs("a", "vm").with_annotation(CONTENT_TYPE_ANNOTATION, CONTENT_TYPE_KUBEVIRT);
        assert!(vm.is_vm_disk());
        assert!(vm.is_block_or_vm_disk());

        let archive = fs("a", "img").with_annotation(CONTENT_TYPE_ANNOTATION, "archive");
        assert!(!archive.is_block_or_vm_disk());
    }

    /// Story: an unset destination is the source itself
    #[test]
    fn story_missing_destination_defaults_to_source() {
        let pair = PvcPair::new(Pvc::from_name("a", "data"), None);
        assert_eq!(pair.destination().namespace(), "a");
        assert_eq!(pair.destination().name(), "data");
    }

    #[test]
    fn partially_specified_destination_fills_from_source() {
        let pair = PvcPair::new(fs("a", "data"), Some(Pvc::from_name("", "copy")));
        assert_eq!(pair.destination().namespace(), "a");
        assert_eq!(pair.destination().name(), "copy");

        let pair = PvcPair::new(fs("a", "data"), Some(Pvc::from_name("b", "")));
        assert_eq!(pair.destination().namespace(), "b");
        assert_eq!(pair.destination().name(), "data");
        assert_eq!(pair.id(), label_safe_name("data"));
    }

    /// Story: cross-namespace batches never reach the cluster
    #[test]
    fn story_multiple_namespaces_rejected() {
        let errors = validation_errors(PvcPairList::new(vec![
            PvcPair::new(fs("a", "one"), Some(fs("x", "one"))),
            PvcPair::new(fs("b", "two"), Some(fs("x", "two"))),
        ]));
        assert!(errors.iter().any(|e| e.contains("source namespaces a, b")));

        let errors = validation_errors(PvcPairList::new(vec![
            PvcPair::new(fs("a", "one"), Some(fs("x", "one"))),
            PvcPair::new(fs("a", "two"), Some(fs("y", "two"))),
        ]));
        assert!(errors.iter().any(|e| e.contains("destination namespaces x, y")));
    }

    /// Story: a filesystem volume is never paired with a block volume
    #[test]
    fn story_mixed_pair_rejected() {
        let errors = validation_errors(PvcPairList::new(vec![PvcPair::new(
            fs("a", "data"),
            Some(block("b", "data")),
        )]));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("cannot pair a block or VM-disk volume"));

        let vm = fs("b", "data").with_annotation(CONTENT_TYPE_ANNOTATION, CONTENT_TYPE_KUBEVIRT);
        assert!(PvcPairList::new(vec![PvcPair::new(block("a", "data"), Some(vm))]).is_ok());
    }

    #[test]
    fn every_problem_is_reported() {
        let errors = validation_errors(PvcPairList::new(vec![
            PvcPair::new(fs("a", "one"), Some(block("x", "one"))),
            PvcPair::new(fs("b", "two"), Some(fs("y", "two"))),
            PvcPair::new(fs("a", "one"), Some(fs("x", "three"))),
        ]));
        assert!(errors.iter().any(|e| e.contains("source namespaces")));
        assert!(errors.iter().any(|e| e.contains("destination namespaces")));
        assert!(errors.iter().any(|e| e.contains("cannot pair")));
        assert!(errors.iter().any(|e| e.contains("a/one appears more than once")));
    }

    #[test]
    fn uniform_classification_required() {
        let errors = validation_errors(PvcPairList::new(vec![
            PvcPair::new(block("a", "disk"), None),
            PvcPair::new(fs("a", "data"), None),
        ]));
        assert!(errors[0].contains("mixes 1 block or VM-disk pairs with 1 filesystem pairs"));
    }

    #[test]
    fn empty_list_rejected() {
        let errors = validation_errors(PvcPairList::new(Vec::new()));
        assert_eq!(errors, vec!["pvc list is empty".to_string()]);
    }

    #[test]
    fn accessors() {
        let list = PvcPairList::new(vec![
            PvcPair::new(fs("a", "one"), Some(fs("b", "uno"))),
            PvcPair::new(fs("a", "two"), Some(fs("b", "dos"))),
        ])
        .unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(list.source_namespace(), "a");
        assert_eq!(list.destination_namespace(), "b");
        assert_eq!(list.transfer_id(), label_safe_name("one"));
        assert!(!list.is_block_or_vm_disk());
        assert_eq!(
            list.in_source_namespace("two").unwrap().destination().name(),
            "dos"
        );
        assert_eq!(
            list.in_destination_namespace("uno").unwrap().source().name(),
            "one"
        );
        assert!(list.in_source_namespace("missing").is_none());
    }
}
