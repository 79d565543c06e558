//! Archive → registry.
//!
//! A run is three phases, each consuming the previous phase's result:
//!
//! 1. [`scan_archive`] decodes every manifest entry and measures every blob
//!    entry, building the [`BlobGraph`].
//! 2. [`ImportEngine::upload_blobs`] re-reads the archive and streams each
//!    referenced blob to the registry.
//! 3. [`ImportEngine::put_manifests`] pushes manifests whose blobs made it.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use bytes::Bytes;
use ociclient::{Client, Manifest, OciDigest, RegistryError, UploadOutcome};
use tar::EntryType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::{self, ArchivePath};
use crate::error::{Result, SyncError};
use crate::graph::{BlobGraph, ManifestFile, ManifestName};
use crate::ledger::TransferLedger;

/// Manifests larger than this are not read from an archive.
const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

/// Output of the scan phase
#[derive(Debug, Default)]
pub struct ScanResult {
    pub manifests: Vec<ManifestFile>,
    pub graph: BlobGraph,
    /// Manifest entries that could not be decoded
    pub unsupported: usize,
}

/// Upload state of one blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobStatus {
    Uploaded,
    Present,
    Failed,
}

/// Output of the upload phase
#[derive(Debug, Default)]
pub struct UploadResult {
    /// (repository, digest) pairs that are not available at the registry
    pub failed: HashSet<(String, OciDigest)>,
    pub uploaded: usize,
    pub present: usize,
    pub mounted: usize,
    pub failed_blobs: usize,
    pub orphans: usize,
    pub cancelled: bool,
}

/// Output of the manifest phase
#[derive(Debug, Default)]
pub struct PutResult {
    pub put: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

/// Summary of an import run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub blobs_uploaded: usize,
    pub blobs_present: usize,
    pub blobs_mounted: usize,
    pub blobs_failed: usize,
    pub orphan_blobs: usize,
    pub manifests_put: usize,
    pub manifests_failed: usize,
    pub manifests_skipped: usize,
    pub cancelled: bool,
}

impl ImportReport {
    fn new(scan: &ScanResult, uploads: &UploadResult, puts: &PutResult) -> Self {
        Self {
            blobs_uploaded: uploads.uploaded,
            blobs_present: uploads.present,
            blobs_mounted: uploads.mounted,
            blobs_failed: uploads.failed_blobs,
            orphan_blobs: uploads.orphans,
            manifests_put: puts.put,
            manifests_failed: puts.failed,
            manifests_skipped: puts.skipped + scan.unsupported,
            cancelled: uploads.cancelled || puts.cancelled,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.blobs_failed == 0
            && self.manifests_failed == 0
            && self.manifests_skipped == 0
            && !self.cancelled
    }
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blobs: {} uploaded, {} present, {} mounted, {} failed, {} orphaned; \
             manifests: {} put, {} failed, {} skipped",
            self.blobs_uploaded,
            self.blobs_present,
            self.blobs_mounted,
            self.blobs_failed,
            self.orphan_blobs,
            self.manifests_put,
            self.manifests_failed,
            self.manifests_skipped
        )
    }
}

/// First pass: decode manifests and measure blobs.
///
/// Blob bytes are not retained. Unsupported or undecodable manifests are
/// logged and counted; a corrupt tar stream is fatal.
pub fn scan_archive(path: &Path) -> Result<ScanResult> {
    let mut scan = ScanResult::default();

    archive::read_entries(path, |parsed, entry| {
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "skipping malformed archive entry");
                return Ok(());
            }
        };

        match parsed {
            ArchivePath::Blob(digest) => {
                let size = entry.header().size().map_err(|e| SyncError::Archive(e.to_string()))?;
                if let Err(e) = scan.graph.observe_size(&digest, size) {
                    warn!(error = %e, "blob size disagrees with its manifests");
                }
            }
            ArchivePath::TagManifest { repository, tag } => {
                let Some(raw) = archive::read_small_entry(entry, MAX_MANIFEST_SIZE)? else {
                    warn!(
                        repository = %repository,
                        reference = %tag,
                        limit = MAX_MANIFEST_SIZE,
                        "manifest too large, skipping"
                    );
                    scan.unsupported += 1;
                    return Ok(());
                };
                add_manifest(&mut scan, repository, ManifestName::Tag(tag), raw);
            }
            ArchivePath::DigestManifest { repository, digest } => {
                let Some(raw) = archive::read_small_entry(entry, MAX_MANIFEST_SIZE)? else {
                    warn!(
                        repository = %repository,
                        reference = %digest,
                        limit = MAX_MANIFEST_SIZE,
                        "manifest too large, skipping"
                    );
                    scan.unsupported += 1;
                    return Ok(());
                };
                if !digest.matches(&raw) {
                    warn!(
                        repository = %repository,
                        digest = %digest,
                        "manifest content does not match its name, skipping"
                    );
                    scan.unsupported += 1;
                    return Ok(());
                }
                add_manifest(&mut scan, repository, ManifestName::Digest(digest), raw);
            }
        }
        Ok(())
    })?;

    info!(
        manifests = scan.manifests.len(),
        blobs = scan.graph.len(),
        unsupported = scan.unsupported,
        "scanned archive"
    );
    Ok(scan)
}

fn add_manifest(scan: &mut ScanResult, repository: String, name: ManifestName, raw: Vec<u8>) {
    let manifest = match Manifest::decode(None, Bytes::from(raw)) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(repository = %repository, reference = %name, error = %e, "skipping manifest");
            scan.unsupported += 1;
            return;
        }
    };

    let id = scan.manifests.len();
    for blob in manifest.blob_references() {
        if let Err(e) = scan.graph.add_reference(id, &blob) {
            warn!(repository = %repository, reference = %name, error = %e, "conflicting blob size");
        }
    }
    debug!(
        repository = %repository,
        reference = %name,
        media_type = manifest.media_type(),
        "found manifest"
    );
    scan.manifests.push(ManifestFile::new(repository, name, manifest));
}

/// Pushes an archive into one registry
pub struct ImportEngine {
    client: Client,
    cancel: CancellationToken,
}

impl ImportEngine {
    pub fn new(client: Client, cancel: CancellationToken) -> Self {
        Self { client, cancel }
    }

    /// Run all three phases against the archive at `path`.
    pub async fn run(&self, path: &Path) -> Result<ImportReport> {
        let scan = scan_archive(path)?;
        let uploads = self.upload_blobs(path, &scan).await?;
        let puts = if uploads.cancelled {
            PutResult {
                cancelled: true,
                ..Default::default()
            }
        } else {
            self.put_manifests(&scan, &uploads).await
        };

        let report = ImportReport::new(&scan, &uploads, &puts);
        info!(%report, "import finished");
        Ok(report)
    }

    /// Second pass: stream blob entries to the registry.
    ///
    /// Bytes go once, to the first repository referencing the blob; other
    /// referencing repositories receive a cross-repository mount.
    pub async fn upload_blobs(&self, path: &Path, scan: &ScanResult) -> Result<UploadResult> {
        let mut result = UploadResult::default();
        let ledger = TransferLedger::<BlobStatus>::new();

        let file = std::fs::File::open(path)?;
        let mut archive = tar::Archive::new(file);
        let entries = archive.entries().map_err(|e| SyncError::Archive(e.to_string()))?;

        for entry in entries {
            if self.cancel.is_cancelled() {
                warn!("import cancelled during blob upload");
                result.cancelled = true;
                break;
            }

            let mut entry = entry.map_err(|e| SyncError::Archive(e.to_string()))?;
            if !matches!(entry.header().entry_type(), EntryType::Regular | EntryType::Continuous) {
                continue;
            }
            let name = entry
                .path()
                .map_err(|e| SyncError::Archive(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            let Ok(Some(ArchivePath::Blob(digest))) = ArchivePath::parse(&name) else {
                continue;
            };

            let Some(node) = scan.graph.get(&digest).filter(|node| !node.is_orphan()) else {
                warn!(digest = %digest, "no manifest references blob, skipping");
                result.orphans += 1;
                continue;
            };

            let repositories = scan.graph.repositories_for(&digest, &scan.manifests);
            let Some((first, others)) = repositories.split_first() else {
                continue;
            };

            if node.is_conflicted() {
                error!(digest = %digest, "blob has conflicting sizes, not uploading");
                result.failed_blobs += 1;
                for repository in &repositories {
                    result.failed.insert((repository.to_string(), digest.clone()));
                }
                continue;
            }

            let size = node.size;
            let client = &self.client;
            let cancel = &self.cancel;
            let target = &digest;
            let reader = &mut entry;
            let (status, performed) = ledger
                .run(&digest, || async move {
                    match client.upload_blob(first, target, reader, size, cancel).await {
                        Ok(UploadOutcome::Uploaded) => {
                            info!(repository = %first, digest = %target, "blob uploaded");
                            BlobStatus::Uploaded
                        }
                        Ok(UploadOutcome::AlreadyPresent) => {
                            info!(repository = %first, digest = %target, "blob already present");
                            BlobStatus::Present
                        }
                        Err(e) => {
                            error!(
                                repository = %first,
                                digest = %target,
                                error = %e,
                                "blob upload failed"
                            );
                            BlobStatus::Failed
                        }
                    }
                })
                .await;

            if !performed {
                debug!(digest = %digest, "duplicate blob entry");
                continue;
            }

            match status {
                BlobStatus::Uploaded => result.uploaded += 1,
                BlobStatus::Present => result.present += 1,
                BlobStatus::Failed => {
                    result.failed_blobs += 1;
                    for repository in &repositories {
                        result.failed.insert((repository.to_string(), digest.clone()));
                    }
                    if self.cancel.is_cancelled() {
                        result.cancelled = true;
                        break;
                    }
                    continue;
                }
            }

            for repository in others {
                self.share_blob(repository, first, &digest, &mut result).await;
            }
        }

        Ok(result)
    }

    async fn share_blob(
        &self,
        repository: &str,
        from: &str,
        digest: &OciDigest,
        result: &mut UploadResult,
    ) {
        let outcome = match self.client.has_blob(repository, digest).await {
            Ok(true) => Ok(true),
            Ok(false) => self.client.mount_blob(repository, digest, from).await.map(|mounted| {
                if mounted {
                    result.mounted += 1;
                }
                mounted
            }),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(true) => debug!(repository, digest = %digest, "blob available"),
            Ok(false) => {
                warn!(
                    repository,
                    from,
                    digest = %digest,
                    "registry declined cross-repository mount"
                );
                result.failed.insert((repository.to_string(), digest.clone()));
            }
            Err(e) => {
                error!(repository, digest = %digest, error = %e, "failed to share blob");
                result.failed.insert((repository.to_string(), digest.clone()));
            }
        }
    }

    /// Third pass: PUT every manifest whose blobs are available.
    ///
    /// Image manifests go first, then lists, so a list never arrives before
    /// the manifests it names.
    pub async fn put_manifests(&self, scan: &ScanResult, uploads: &UploadResult) -> PutResult {
        let mut result = PutResult::default();
        let mut unavailable: HashSet<(String, OciDigest)> = HashSet::new();

        let (lists, images): (Vec<&ManifestFile>, Vec<&ManifestFile>) =
            scan.manifests.iter().partition(|file| file.manifest.is_list());

        for file in images.into_iter().chain(lists) {
            if self.cancel.is_cancelled() {
                warn!("import cancelled before all manifests were put");
                result.cancelled = true;
                break;
            }

            let missing = file
                .manifest
                .blob_references()
                .into_iter()
                .map(|blob| blob.digest)
                .chain(file.manifest.child_manifests().iter().map(|child| child.digest.clone()))
                .find(|digest| {
                    let key = (file.repository.clone(), digest.clone());
                    uploads.failed.contains(&key) || unavailable.contains(&key)
                });
            if let Some(digest) = missing {
                warn!(
                    manifest = %file,
                    missing = %digest,
                    "skipping manifest, a dependency is unavailable"
                );
                result.skipped += 1;
                mark_unavailable(&mut unavailable, file);
                continue;
            }

            let reference = file.name.to_string();
            match self.client.put_manifest(&file.repository, &reference, &file.manifest).await {
                Ok(()) => {
                    info!(
                        manifest = %file,
                        media_type = file.manifest.media_type(),
                        "manifest put"
                    );
                    result.put += 1;
                }
                Err(RegistryError::Cancelled) => {
                    result.cancelled = true;
                    break;
                }
                Err(e) => {
                    error!(manifest = %file, error = %e, "manifest put failed");
                    result.failed += 1;
                    mark_unavailable(&mut unavailable, file);
                }
            }
        }

        result
    }
}

/// Record every digest a parent list may use to name `file`.
fn mark_unavailable(unavailable: &mut HashSet<(String, OciDigest)>, file: &ManifestFile) {
    if let ManifestName::Digest(digest) = &file.name {
        unavailable.insert((file.repository.clone(), digest.clone()));
    }
    unavailable.insert((file.repository.clone(), file.manifest.digest()));
}
