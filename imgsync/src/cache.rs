//! On-disk blob staging, optionally persistent across runs.

use std::io;
use std::path::{Path, PathBuf};

use ociclient::{BlobStream, OciDigest, RegistryError};
use tempfile::TempDir;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// What a cache lookup found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit { path: PathBuf, size: u64 },
    Miss,
    /// A file exists but does not hash to its digest
    Invalid,
}

/// Blob files named by digest under `<root>/blob/`.
///
/// A persistent cache keeps files between runs and is consulted before any
/// download. Without a cache directory, blobs are staged in a scratch
/// directory and released once copied into the archive.
#[derive(Debug)]
pub struct BlobCache {
    root: PathBuf,
    persistent: bool,
    _scratch: Option<TempDir>,
}

impl BlobCache {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let root = dir.into();
        std::fs::create_dir_all(root.join("blob"))?;
        Ok(Self {
            root,
            persistent: true,
            _scratch: None,
        })
    }

    pub fn scratch() -> io::Result<Self> {
        let scratch = tempfile::Builder::new().prefix("imgsync-").tempdir()?;
        std::fs::create_dir_all(scratch.path().join("blob"))?;
        Ok(Self {
            root: scratch.path().to_path_buf(),
            persistent: false,
            _scratch: Some(scratch),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn blob_path(&self, digest: &OciDigest) -> PathBuf {
        self.root.join("blob").join(digest.to_string())
    }

    fn partial_path(&self, digest: &OciDigest) -> PathBuf {
        self.root.join("blob").join(format!("{}.partial", digest))
    }

    /// Look for a cached copy and re-verify its hash.
    pub async fn lookup(&self, digest: &OciDigest) -> io::Result<CacheLookup> {
        if !self.persistent {
            return Ok(CacheLookup::Miss);
        }

        let path = self.blob_path(digest);
        if !fs::try_exists(&path).await? {
            return Ok(CacheLookup::Miss);
        }

        match verify_file(path.clone(), digest.clone()).await? {
            Some(size) => Ok(CacheLookup::Hit { path, size }),
            None => {
                warn!(digest = %digest, path = %path.display(), "cached blob invalid");
                Ok(CacheLookup::Invalid)
            }
        }
    }

    /// Stream a download into the cache.
    ///
    /// Bytes land in a `.partial` file that is renamed over the final path
    /// only after the content hashes to `digest` and matches
    /// `expected_size`, if one is known.
    pub async fn fill(
        &self,
        digest: &OciDigest,
        stream: &mut BlobStream,
        expected_size: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, u64)> {
        let partial = self.partial_path(digest);
        let result = self.write_partial(&partial, digest, stream, expected_size, cancel).await;

        let size = match result {
            Ok(size) => size,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial).await {
                    debug!(error = %cleanup, "failed to remove partial download");
                }
                return Err(e);
            }
        };

        let path = self.blob_path(digest);
        fs::rename(&partial, &path).await?;
        Ok((path, size))
    }

    async fn write_partial(
        &self,
        partial: &Path,
        digest: &OciDigest,
        stream: &mut BlobStream,
        expected_size: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut file = fs::File::create(partial).await?;
        let mut verifier = digest.verifier();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                chunk = stream.next_chunk() => chunk?,
            };
            let Some(chunk) = chunk else { break };
            verifier.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let size = verifier.bytes_written();
        if let Some(expected) = expected_size {
            if expected != size {
                return Err(SyncError::SizeConflict {
                    digest: digest.clone(),
                    first: expected,
                    second: size,
                });
            }
        }

        let actual = verifier.finish();
        if &actual != digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        Ok(size)
    }

    /// Drop a staged file once it has been copied, unless the cache is persistent.
    pub async fn release(&self, path: &Path) {
        if self.persistent {
            return;
        }
        if let Err(e) = fs::remove_file(path).await {
            debug!(error = %e, path = %path.display(), "failed to remove staged blob");
        }
    }
}

/// Hash a file; `Some(size)` when it matches `digest`.
pub async fn verify_file(path: PathBuf, digest: OciDigest) -> io::Result<Option<u64>> {
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut verifier = digest.verifier();
        let size = io::copy(&mut file, &mut verifier)?;
        Ok(verifier.verify().then_some(size))
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_verifies_content() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlobCache::open(dir.path()).unwrap();
        let good = OciDigest::sha256(b"good");
        let bad = OciDigest::sha256(b"bad");

        assert_eq!(cache.lookup(&good).await.unwrap(), CacheLookup::Miss);

        std::fs::write(cache.blob_path(&good), b"good").unwrap();
        std::fs::write(cache.blob_path(&bad), b"tampered").unwrap();

        assert_eq!(
            cache.lookup(&good).await.unwrap(),
            CacheLookup::Hit {
                path: dir.path().join("blob").join(good.to_string()),
                size: 4
            }
        );
        assert_eq!(cache.lookup(&bad).await.unwrap(), CacheLookup::Invalid);
    }

    #[tokio::test]
    async fn scratch_cache_never_hits_and_cleans_up() {
        let cache = BlobCache::scratch().unwrap();
        assert!(!cache.is_persistent());
        let digest = OciDigest::sha256(b"x");
        let path = cache.blob_path(&digest);
        std::fs::write(&path, b"x").unwrap();

        assert_eq!(cache.lookup(&digest).await.unwrap(), CacheLookup::Miss);
        cache.release(&path).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn verify_file_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, vec![9u8; 300]).unwrap();
        let digest = OciDigest::sha256(&[9u8; 300]);
        assert_eq!(verify_file(path.clone(), digest).await.unwrap(), Some(300));
        assert_eq!(verify_file(path, OciDigest::sha256(b"")).await.unwrap(), None);
    }
}
