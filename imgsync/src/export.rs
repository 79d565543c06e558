//! Registry → archive.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;

use futures_util::StreamExt;
use futures_util::stream;
use ociclient::{
    BlobReference, Client, ImageReference, Manifest, OciDigest, Reference, RegistryError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchivePath, ArchiveWriter};
use crate::cache::{BlobCache, CacheLookup};
use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::graph::{BlobGraph, ManifestId};
use crate::ledger::TransferLedger;
use crate::pool::ClientPool;

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Concurrent blob downloads per image
    pub concurrency: usize,
    /// Persistent blob cache; blobs are staged in a scratch directory without one
    pub cache_dir: Option<PathBuf>,
    /// SOCKS5 proxy for every registry
    pub proxy: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            cache_dir: None,
            proxy: None,
        }
    }
}

/// Summary of an export run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub images_exported: usize,
    pub images_failed: usize,
    pub blobs_written: usize,
    pub blobs_failed: usize,
    pub blobs_from_cache: usize,
    pub cancelled: bool,
}

impl ExportReport {
    pub fn is_clean(&self) -> bool {
        self.images_failed == 0 && self.blobs_failed == 0 && !self.cancelled
    }
}

impl fmt::Display for ExportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "images: {} exported, {} failed; blobs: {} written ({} from cache), {} failed",
            self.images_exported,
            self.images_failed,
            self.blobs_written,
            self.blobs_from_cache,
            self.blobs_failed
        )
    }
}

/// Result of one blob transfer, shared by every image that needs the blob
#[derive(Debug, Clone)]
enum BlobOutcome {
    Ready { path: PathBuf, size: u64, cached: bool },
    Failed(String),
}

/// A requested image with its manifest tree fetched.
struct ResolvedImage {
    client: Client,
    top: Manifest,
    /// List members by the digest their parent declared, in discovery order
    nested: Vec<(OciDigest, Manifest)>,
}

impl ResolvedImage {
    /// Non-list manifests of the tree
    fn leaves(&self) -> impl Iterator<Item = &Manifest> {
        std::iter::once(&self.top)
            .chain(self.nested.iter().map(|(_, manifest)| manifest))
            .filter(|manifest| !manifest.is_list())
    }
}

/// Builds an archive from registry images
pub struct ExportEngine {
    pool: ClientPool,
    cache: BlobCache,
    ledger: TransferLedger<BlobOutcome>,
    options: ExportOptions,
    cancel: CancellationToken,
}

impl ExportEngine {
    pub fn new(
        config: AppConfig,
        options: ExportOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let cache = match &options.cache_dir {
            Some(dir) => BlobCache::open(dir)?,
            None => BlobCache::scratch()?,
        };
        Ok(Self {
            pool: ClientPool::new(config, options.proxy.clone()),
            cache,
            ledger: TransferLedger::new(),
            options,
            cancel,
        })
    }

    /// Client for a registry host, shared across the run
    pub fn client_for(&self, host: &str) -> Result<Client> {
        self.pool.client_for(host)
    }

    /// Export `images` into `writer`.
    ///
    /// Failures of one image are logged and counted; archive write errors
    /// abort the run.
    pub async fn run<W: Write>(
        &self,
        images: &[ImageReference],
        writer: &mut ArchiveWriter<W>,
    ) -> Result<ExportReport> {
        let mut report = ExportReport::default();
        let mut leaf_count: ManifestId = 0;
        let mut graph = BlobGraph::new();

        for image in images {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let resolved = match self.resolve(image).await {
                Ok(resolved) => resolved,
                Err(e) if e.is_cancelled() => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    error!(image = %image, error = %e, "failed to resolve image");
                    report.images_failed += 1;
                    continue;
                }
            };

            self.write_manifests(image, &resolved, writer)?;

            let mut pending: Vec<BlobReference> = Vec::new();
            let mut seen: HashSet<OciDigest> = HashSet::new();
            for manifest in resolved.leaves() {
                let id = leaf_count;
                leaf_count += 1;
                for blob in manifest.blob_references() {
                    if let Err(e) = graph.add_reference(id, &blob) {
                        warn!(image = %image, error = %e, "conflicting blob size");
                    }
                    let archived = graph.get(&blob.digest).is_some_and(|node| node.transferred);
                    if !archived && seen.insert(blob.digest.clone()) {
                        pending.push(blob);
                    }
                }
            }

            let failed = self
                .transfer_blobs(
                    &resolved.client,
                    &image.name,
                    pending,
                    &mut graph,
                    writer,
                    &mut report,
                )
                .await?;

            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if failed == 0 {
                info!(image = %image, "image exported");
                report.images_exported += 1;
            } else {
                error!(image = %image, failed_blobs = failed, "image incomplete");
                report.images_failed += 1;
            }
        }

        info!(%report, leaves = leaf_count, blobs = graph.len(), "export finished");
        Ok(report)
    }

    /// Fetch the requested manifest and, for lists, every manifest beneath it.
    async fn resolve(&self, image: &ImageReference) -> Result<ResolvedImage> {
        let client = self.pool.client_for(&image.hostname)?;
        let top = client.fetch_manifest(&image.name, &image.reference.to_string()).await?;
        if let Reference::Digest(expected) = &image.reference {
            verify_payload(expected, &top)?;
        }
        debug!(image = %image, media_type = top.media_type(), "fetched manifest");

        let mut visited: HashSet<OciDigest> = HashSet::from([top.digest()]);
        let mut queue: VecDeque<OciDigest> =
            top.child_manifests().iter().map(|d| d.digest.clone()).collect();
        let mut nested = Vec::new();

        while let Some(digest) = queue.pop_front() {
            if !visited.insert(digest.clone()) {
                continue;
            }
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let manifest = client.fetch_manifest(&image.name, &digest.to_string()).await?;
            verify_payload(&digest, &manifest)?;
            debug!(
                image = %image,
                digest = %digest,
                media_type = manifest.media_type(),
                "fetched nested manifest"
            );

            queue.extend(manifest.child_manifests().iter().map(|d| d.digest.clone()));
            nested.push((digest, manifest));
        }

        Ok(ResolvedImage { client, top, nested })
    }

    fn write_manifests<W: Write>(
        &self,
        image: &ImageReference,
        resolved: &ResolvedImage,
        writer: &mut ArchiveWriter<W>,
    ) -> Result<()> {
        let repository = writer.repository_dir(&image.hostname, &image.name);
        let (_, payload) = resolved.top.payload();

        if let Some(tag) = image.reference.as_tag() {
            writer.write_manifest(
                &ArchivePath::TagManifest {
                    repository: repository.clone(),
                    tag: tag.to_string(),
                },
                payload,
            )?;
        }
        writer.write_manifest(
            &ArchivePath::DigestManifest {
                repository: repository.clone(),
                digest: resolved.top.digest(),
            },
            payload,
        )?;

        for (digest, manifest) in &resolved.nested {
            let (_, payload) = manifest.payload();
            writer.write_manifest(
                &ArchivePath::DigestManifest {
                    repository: repository.clone(),
                    digest: digest.clone(),
                },
                payload,
            )?;
        }
        Ok(())
    }

    /// Download `blobs` and append each to the archive once. Returns how many
    /// of them are unavailable.
    async fn transfer_blobs<W: Write>(
        &self,
        client: &Client,
        repository: &str,
        blobs: Vec<BlobReference>,
        graph: &mut BlobGraph,
        writer: &mut ArchiveWriter<W>,
        report: &mut ExportReport,
    ) -> Result<usize> {
        let mut failed = 0;
        let mut transfers = stream::iter(blobs.into_iter().map(move |blob| async move {
            let (outcome, performed) = self
                .ledger
                .run(&blob.digest, || self.fetch_blob(client, repository, &blob))
                .await;
            (blob, outcome, performed)
        }))
        .buffer_unordered(self.options.concurrency.max(1));

        while let Some((blob, outcome, performed)) = transfers.next().await {
            match outcome {
                BlobOutcome::Ready { path, size, cached } => {
                    if !performed {
                        continue;
                    }
                    if let Err(e) = graph.observe_size(&blob.digest, size) {
                        warn!(error = %e, "blob size differs from its descriptor");
                    }
                    if writer.write_blob_file(&blob.digest, &path, size)? {
                        report.blobs_written += 1;
                        if cached {
                            report.blobs_from_cache += 1;
                        }
                    }
                    graph.mark_transferred(&blob.digest);
                    self.cache.release(&path).await;
                }
                BlobOutcome::Failed(reason) => {
                    failed += 1;
                    if performed {
                        report.blobs_failed += 1;
                    } else {
                        debug!(
                            digest = %blob.digest,
                            reason = %reason,
                            "blob failed earlier in this run"
                        );
                    }
                }
            }
        }
        Ok(failed)
    }

    async fn fetch_blob(
        &self,
        client: &Client,
        repository: &str,
        blob: &BlobReference,
    ) -> BlobOutcome {
        match self.cache.lookup(&blob.digest).await {
            Ok(CacheLookup::Hit { path, size }) => {
                info!(digest = %blob.digest, "cache hit");
                return BlobOutcome::Ready { path, size, cached: true };
            }
            Ok(CacheLookup::Invalid) => {
                debug!(digest = %blob.digest, "re-downloading invalid cache entry")
            }
            Ok(CacheLookup::Miss) => {}
            Err(e) => warn!(digest = %blob.digest, error = %e, "cache lookup failed"),
        }

        match self.download(client, repository, blob).await {
            Ok((path, size)) => {
                info!(repository, digest = %blob.digest, size, "blob downloaded");
                BlobOutcome::Ready { path, size, cached: false }
            }
            Err(e) => {
                error!(repository, digest = %blob.digest, error = %e, "blob download failed");
                BlobOutcome::Failed(e.to_string())
            }
        }
    }

    async fn download(
        &self,
        client: &Client,
        repository: &str,
        blob: &BlobReference,
    ) -> Result<(PathBuf, u64)> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let mut stream = client.download_blob(repository, &blob.digest).await?;
        self.cache.fill(&blob.digest, &mut stream, blob.size, &self.cancel).await
    }
}

fn verify_payload(expected: &OciDigest, manifest: &Manifest) -> Result<()> {
    let (_, payload) = manifest.payload();
    if expected.matches(payload) {
        return Ok(());
    }
    let mut verifier = expected.verifier();
    verifier.update(payload);
    let actual = verifier.finish();
    Err(RegistryError::DigestMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
    .into())
}
