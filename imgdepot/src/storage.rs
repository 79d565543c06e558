use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde_json::Value;

use crate::digest::{content_digest_like, is_digest, sha256_digest};
use crate::error::{AppError, Result};

const KNOWN_MANIFEST_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v1+prettyjws",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

#[derive(Debug, Clone, PartialEq)]
pub struct StoredManifest {
    pub media_type: String,
    pub content: Bytes,
    pub digest: String,
}

#[derive(Debug)]
struct Upload {
    repository: String,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<String, Bytes>,
    // (repository, digest) pairs a repository can see
    links: HashSet<(String, String)>,
    manifests: HashMap<(String, String), StoredManifest>,
    uploads: HashMap<String, Upload>,
}

/// Registry content held in memory.
///
/// Blob bytes are stored once per registry and linked into repositories,
/// the way a real registry shares layers between repositories.
#[derive(Debug, Default)]
pub struct Storage {
    inner: Mutex<Inner>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Blob operations

    pub fn blob_exists(&self, repository: &str, digest: &str) -> bool {
        self.lock()
            .links
            .contains(&(repository.to_string(), digest.to_string()))
    }

    pub fn get_blob(&self, repository: &str, digest: &str) -> Option<Bytes> {
        let inner = self.lock();
        if !inner.links.contains(&(repository.to_string(), digest.to_string())) {
            return None;
        }
        inner.blobs.get(digest).cloned()
    }

    /// Store `content` under its sha256 digest and link it into `repository`.
    pub fn put_blob(&self, repository: &str, content: Bytes) -> String {
        let digest = sha256_digest(&content);
        let mut inner = self.lock();
        inner.blobs.insert(digest.clone(), content);
        inner.links.insert((repository.to_string(), digest.clone()));
        digest
    }

    /// Store raw bytes under an arbitrary digest. Lets tests plant corrupt content.
    pub fn put_blob_unchecked(&self, repository: &str, digest: &str, content: Bytes) {
        let mut inner = self.lock();
        inner.blobs.insert(digest.to_string(), content);
        inner.links.insert((repository.to_string(), digest.to_string()));
    }

    /// Link a blob from `from` into `repository`. Returns false when `from`
    /// cannot see the blob.
    pub fn mount_blob(&self, repository: &str, digest: &str, from: &str) -> bool {
        let mut inner = self.lock();
        if !inner.links.contains(&(from.to_string(), digest.to_string())) {
            return false;
        }
        inner.links.insert((repository.to_string(), digest.to_string()));
        true
    }

    pub fn blob_count(&self) -> usize {
        self.lock().blobs.len()
    }

    // Upload sessions

    pub fn start_upload(&self, repository: &str) -> String {
        let uuid = uuid::Uuid::new_v4().to_string();
        self.lock().uploads.insert(
            uuid.clone(),
            Upload {
                repository: repository.to_string(),
                data: Vec::new(),
            },
        );
        uuid
    }

    /// Append a chunk. `start` is the first offset from `Content-Range`, if sent.
    pub fn append_upload(
        &self,
        repository: &str,
        uuid: &str,
        start: Option<u64>,
        chunk: &[u8],
    ) -> Result<u64> {
        let mut inner = self.lock();
        let upload = inner
            .uploads
            .get_mut(uuid)
            .filter(|upload| upload.repository == repository)
            .ok_or_else(|| AppError::UploadUnknown(uuid.to_string()))?;

        let offset = upload.data.len() as u64;
        if let Some(start) = start {
            if start != offset {
                return Err(AppError::RangeInvalid(format!(
                    "expected offset {}, got {}",
                    offset, start
                )));
            }
        }
        upload.data.extend_from_slice(chunk);
        Ok(upload.data.len() as u64)
    }

    /// Close an upload session, verifying the accumulated bytes against `digest`.
    pub fn complete_upload(
        &self,
        repository: &str,
        uuid: &str,
        digest: &str,
        tail: &[u8],
    ) -> Result<()> {
        let mut inner = self.lock();
        let mut upload = inner
            .uploads
            .remove(uuid)
            .filter(|upload| upload.repository == repository)
            .ok_or_else(|| AppError::UploadUnknown(uuid.to_string()))?;
        upload.data.extend_from_slice(tail);

        let actual = content_digest_like(digest, &upload.data)
            .ok_or_else(|| AppError::DigestInvalid(format!("unsupported digest {}", digest)))?;
        if actual != digest {
            return Err(AppError::DigestInvalid(format!(
                "expected {}, content hashes to {}",
                digest, actual
            )));
        }

        inner.blobs.insert(digest.to_string(), Bytes::from(upload.data));
        inner.links.insert((repository.to_string(), digest.to_string()));
        Ok(())
    }

    pub fn cancel_upload(&self, uuid: &str) -> bool {
        self.lock().uploads.remove(uuid).is_some()
    }

    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    // Manifest operations

    /// Store a manifest under `reference` and under its own digest.
    ///
    /// Every blob and child manifest it references must already be visible
    /// in `repository`.
    pub fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        content: Bytes,
    ) -> Result<String> {
        let media_type = media_type.split(';').next().unwrap_or("").trim().to_string();
        if !KNOWN_MANIFEST_TYPES.contains(&media_type.as_str()) {
            return Err(AppError::ManifestInvalid(format!(
                "unsupported media type {:?}",
                media_type
            )));
        }

        let digest = sha256_digest(&content);
        if is_digest(reference)
            && content_digest_like(reference, &content).as_deref() != Some(reference)
        {
            return Err(AppError::DigestInvalid(format!("manifest does not hash to {}", reference)));
        }

        let document: Value =
            serde_json::from_slice(&content).map_err(|e| AppError::ManifestInvalid(e.to_string()))?;

        let mut inner = self.lock();
        for blob in referenced_blobs(&document) {
            if !inner.links.contains(&(repository.to_string(), blob.clone())) {
                return Err(AppError::ManifestBlobUnknown(blob));
            }
        }
        for child in referenced_manifests(&document) {
            if !inner.manifests.contains_key(&(repository.to_string(), child.clone())) {
                return Err(AppError::ManifestBlobUnknown(child));
            }
        }

        let stored = StoredManifest {
            media_type,
            content,
            digest: digest.clone(),
        };
        inner
            .manifests
            .insert((repository.to_string(), digest.clone()), stored.clone());
        inner
            .manifests
            .insert((repository.to_string(), reference.to_string()), stored);
        Ok(digest)
    }

    /// Store a manifest under `reference` with no validation at all. Lets
    /// tests serve a payload that does not hash to the digest it is fetched by.
    pub fn put_manifest_unchecked(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        content: Bytes,
    ) {
        let stored = StoredManifest {
            media_type: media_type.to_string(),
            digest: sha256_digest(&content),
            content,
        };
        self.lock()
            .manifests
            .insert((repository.to_string(), reference.to_string()), stored);
    }

    pub fn get_manifest(&self, repository: &str, reference: &str) -> Option<StoredManifest> {
        self.lock()
            .manifests
            .get(&(repository.to_string(), reference.to_string()))
            .cloned()
    }

    /// Remove a manifest by digest, together with every tag pointing at it.
    pub fn delete_manifest(&self, repository: &str, digest: &str) -> bool {
        let mut inner = self.lock();
        let before = inner.manifests.len();
        inner
            .manifests
            .retain(|(repo, _), stored| !(repo == repository && stored.digest == digest));
        inner.manifests.len() != before
    }

    pub fn list_tags(&self, repository: &str) -> Vec<String> {
        let mut tags: Vec<String> = self
            .lock()
            .manifests
            .keys()
            .filter(|(repo, reference)| repo == repository && !is_digest(reference))
            .map(|(_, reference)| reference.clone())
            .collect();
        tags.sort();
        tags
    }
}

fn referenced_blobs(document: &Value) -> Vec<String> {
    let mut blobs = Vec::new();
    if let Some(digest) = document.pointer("/config/digest").and_then(Value::as_str) {
        blobs.push(digest.to_string());
    }
    for (list, field) in [("layers", "digest"), ("fsLayers", "blobSum")] {
        if let Some(entries) = document.get(list).and_then(Value::as_array) {
            blobs.extend(
                entries
                    .iter()
                    .filter_map(|entry| entry.get(field).and_then(Value::as_str))
                    .map(str::to_string),
            );
        }
    }
    blobs
}

fn referenced_manifests(document: &Value) -> Vec<String> {
    document
        .get("manifests")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("digest").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
