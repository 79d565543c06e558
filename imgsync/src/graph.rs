//! Digest → referencing-manifest index.

use std::collections::HashMap;
use std::fmt;

use ociclient::{BlobReference, Manifest, OciDigest};

use crate::error::SyncError;

/// Index of a [`ManifestFile`] in the run's manifest list
pub type ManifestId = usize;

/// How a manifest is addressed inside its repository
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ManifestName {
    Tag(String),
    Digest(OciDigest),
}

impl fmt::Display for ManifestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestName::Tag(tag) => f.write_str(tag),
            ManifestName::Digest(digest) => write!(f, "{}", digest),
        }
    }
}

/// One manifest entry of an archive, or one manifest resolved from a registry.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    pub repository: String,
    pub name: ManifestName,
    pub manifest: Manifest,
}

impl ManifestFile {
    pub fn new(repository: impl Into<String>, name: ManifestName, manifest: Manifest) -> Self {
        Self {
            repository: repository.into(),
            name,
            manifest,
        }
    }
}

impl fmt::Display for ManifestFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            ManifestName::Tag(tag) => write!(f, "{}:{}", self.repository, tag),
            ManifestName::Digest(digest) => write!(f, "{}@{}", self.repository, digest),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlobNode {
    pub digest: OciDigest,
    /// Size observed from the archive or a download
    pub size: Option<u64>,
    /// Size declared by the first descriptor that named this blob
    pub declared_size: Option<u64>,
    pub referrers: Vec<ManifestId>,
    /// Set once two observations of the size disagreed
    pub conflict: Option<(u64, u64)>,
    pub transferred: bool,
}

impl BlobNode {
    fn new(digest: OciDigest) -> Self {
        Self {
            digest,
            size: None,
            declared_size: None,
            referrers: Vec::new(),
            conflict: None,
            transferred: false,
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.referrers.is_empty()
    }

    pub fn is_conflicted(&self) -> bool {
        self.conflict.is_some()
    }

    /// Best known size: observed, else declared
    pub fn known_size(&self) -> Option<u64> {
        self.size.or(self.declared_size)
    }

    fn check(&mut self, first: Option<u64>, second: u64) -> Result<(), SyncError> {
        match first {
            Some(first) if first != second => {
                self.conflict = Some((first, second));
                Err(SyncError::SizeConflict {
                    digest: self.digest.clone(),
                    first,
                    second,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Blobs of one run, in the order they were first seen.
///
/// A blob's size never changes once observed; a disagreeing observation
/// marks the node as conflicted and is reported as [`SyncError::SizeConflict`].
#[derive(Debug, Default)]
pub struct BlobGraph {
    nodes: HashMap<OciDigest, BlobNode>,
    order: Vec<OciDigest>,
}

impl BlobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node_mut(&mut self, digest: &OciDigest) -> &mut BlobNode {
        if !self.nodes.contains_key(digest) {
            self.order.push(digest.clone());
        }
        self.nodes
            .entry(digest.clone())
            .or_insert_with(|| BlobNode::new(digest.clone()))
    }

    /// Record that manifest `id` references `blob`.
    pub fn add_reference(&mut self, id: ManifestId, blob: &BlobReference) -> Result<(), SyncError> {
        let node = self.node_mut(&blob.digest);
        if !node.referrers.contains(&id) {
            node.referrers.push(id);
        }

        let Some(declared) = blob.size else {
            return Ok(());
        };
        let (observed, previous) = (node.size, node.declared_size);
        if previous.is_none() {
            node.declared_size = Some(declared);
        }
        node.check(previous, declared)?;
        node.check(observed, declared)
    }

    /// Record a blob seen in an archive or fetched from a registry.
    pub fn observe_size(&mut self, digest: &OciDigest, size: u64) -> Result<(), SyncError> {
        let node = self.node_mut(digest);
        let (observed, declared) = (node.size, node.declared_size);
        if observed.is_none() {
            node.size = Some(size);
        }
        node.check(observed, size)?;
        node.check(declared, size)
    }

    pub fn mark_transferred(&mut self, digest: &OciDigest) {
        if let Some(node) = self.nodes.get_mut(digest) {
            node.transferred = true;
        }
    }

    pub fn get(&self, digest: &OciDigest) -> Option<&BlobNode> {
        self.nodes.get(digest)
    }

    /// Nodes in first-seen order
    pub fn nodes(&self) -> impl Iterator<Item = &BlobNode> {
        self.order.iter().filter_map(|digest| self.nodes.get(digest))
    }

    /// Distinct repositories referencing `digest`, in manifest order.
    pub fn repositories_for<'a>(
        &self,
        digest: &OciDigest,
        manifests: &'a [ManifestFile],
    ) -> Vec<&'a str> {
        let mut repositories: Vec<&str> = Vec::new();
        if let Some(node) = self.nodes.get(digest) {
            for id in &node.referrers {
                if let Some(file) = manifests.get(*id) {
                    if !repositories.contains(&file.repository.as_str()) {
                        repositories.push(&file.repository);
                    }
                }
            }
        }
        repositories
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn digest(data: &[u8]) -> OciDigest {
        OciDigest::sha256(data)
    }

    fn reference(data: &[u8], size: Option<u64>) -> BlobReference {
        BlobReference {
            digest: digest(data),
            size,
            media_type: None,
        }
    }

    fn manifest_file(repository: &str) -> ManifestFile {
        let raw = Bytes::from_static(
            br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[]}"#,
        );
        let manifest = Manifest::decode(None, raw).unwrap();
        ManifestFile::new(repository, ManifestName::Tag("v1".to_string()), manifest)
    }

    #[test]
    fn blob_seen_before_its_manifest_is_not_orphaned_later() {
        let mut graph = BlobGraph::new();
        graph.observe_size(&digest(b"layer"), 5).unwrap();
        assert!(graph.get(&digest(b"layer")).unwrap().is_orphan());

        graph.add_reference(0, &reference(b"layer", Some(5))).unwrap();
        let node = graph.get(&digest(b"layer")).unwrap();
        assert!(!node.is_orphan());
        assert_eq!(node.size, Some(5));
        assert!(!node.is_conflicted());
    }

    #[test]
    fn disagreeing_sizes_conflict() {
        let mut graph = BlobGraph::new();
        graph.add_reference(0, &reference(b"layer", Some(5))).unwrap();
        let err = graph.observe_size(&digest(b"layer"), 6).unwrap_err();
        assert!(matches!(err, SyncError::SizeConflict { first: 5, second: 6, .. }));
        assert!(graph.get(&digest(b"layer")).unwrap().is_conflicted());

        graph.observe_size(&digest(b"config"), 2).unwrap();
        assert!(graph.add_reference(1, &reference(b"config", Some(3))).is_err());
    }

    #[test]
    fn schema1_references_carry_no_size() {
        let mut graph = BlobGraph::new();
        graph.add_reference(0, &reference(b"layer", None)).unwrap();
        graph.observe_size(&digest(b"layer"), 5).unwrap();
        assert_eq!(graph.get(&digest(b"layer")).unwrap().known_size(), Some(5));
    }

    #[test]
    fn repositories_are_distinct_and_ordered() {
        let manifests = vec![manifest_file("b"), manifest_file("a"), manifest_file("b")];
        let mut graph = BlobGraph::new();
        for id in [0, 1, 2, 1] {
            graph.add_reference(id, &reference(b"shared", Some(6))).unwrap();
        }
        assert_eq!(graph.repositories_for(&digest(b"shared"), &manifests), vec!["b", "a"]);
        assert_eq!(graph.get(&digest(b"shared")).unwrap().referrers, vec![0, 1, 2]);
        assert_eq!(graph.nodes().count(), 1);
    }

    #[test]
    fn transferred_flag_is_per_digest() {
        let mut graph = BlobGraph::new();
        graph.add_reference(0, &reference(b"config", Some(6))).unwrap();
        graph.add_reference(0, &reference(b"layer", Some(5))).unwrap();
        graph.mark_transferred(&digest(b"layer"));
        graph.mark_transferred(&digest(b"unknown"));

        assert!(graph.get(&digest(b"layer")).unwrap().transferred);
        assert!(!graph.get(&digest(b"config")).unwrap().transferred);
        assert!(graph.get(&digest(b"unknown")).is_none());
    }
}
