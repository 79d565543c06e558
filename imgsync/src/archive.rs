//! Tar interchange format.
//!
//! Three kinds of entries are recognised:
//!
//! | path                              | content                 |
//! |-----------------------------------|-------------------------|
//! | `<repository>/manifests/<tag>`    | manifest, keyed by tag  |
//! | `<repository>/manifests/<digest>` | manifest, keyed by hash |
//! | `blob/<digest>`                   | blob bytes              |
//!
//! Anything else in an archive is ignored.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use ociclient::digest::DigestError;
use ociclient::OciDigest;
use tar::{Archive, EntryType, Header};
use thiserror::Error;

use crate::error::{Result, SyncError};

const BLOB_DIR: &str = "blob/";
const MANIFEST_DIR: &str = "/manifests/";

#[derive(Debug, Error)]
pub enum ArchivePathError {
    #[error("malformed archive path {path:?}: {reason}")]
    Malformed { path: String, reason: &'static str },

    #[error("invalid digest in archive path {path:?}: {source}")]
    Digest {
        path: String,
        #[source]
        source: DigestError,
    },
}

/// A classified archive entry path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchivePath {
    TagManifest { repository: String, tag: String },
    DigestManifest { repository: String, digest: OciDigest },
    Blob(OciDigest),
}

impl ArchivePath {
    /// Classify a tar entry path.
    ///
    /// Returns `Ok(None)` for paths outside the grammar and an error for
    /// paths that look like one of the three forms but are malformed.
    pub fn parse(path: &str) -> std::result::Result<Option<Self>, ArchivePathError> {
        let path = path.strip_prefix("./").unwrap_or(path);
        let malformed = |reason| ArchivePathError::Malformed {
            path: path.to_string(),
            reason,
        };
        let digest = |value: &str| {
            OciDigest::from_str(value).map_err(|source| ArchivePathError::Digest {
                path: path.to_string(),
                source,
            })
        };

        if path.is_empty() || path.ends_with('/') {
            return Ok(None);
        }

        if let Some(name) = path.strip_prefix(BLOB_DIR) {
            if !name.contains('/') {
                return Ok(Some(ArchivePath::Blob(digest(name)?)));
            }
        }

        let Some(split) = path.rfind(MANIFEST_DIR) else {
            return Ok(None);
        };
        let repository = &path[..split];
        let name = &path[split + MANIFEST_DIR.len()..];

        if repository.is_empty() || repository.starts_with('/') {
            return Err(malformed("empty repository"));
        }
        if name.contains('/') {
            return Err(malformed("nested manifest name"));
        }

        if name.contains(':') {
            Ok(Some(ArchivePath::DigestManifest {
                repository: repository.to_string(),
                digest: digest(name)?,
            }))
        } else {
            Ok(Some(ArchivePath::TagManifest {
                repository: repository.to_string(),
                tag: name.to_string(),
            }))
        }
    }
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchivePath::TagManifest { repository, tag } => {
                write!(f, "{}{}{}", repository, MANIFEST_DIR, tag)
            }
            ArchivePath::DigestManifest { repository, digest } => {
                write!(f, "{}{}{}", repository, MANIFEST_DIR, digest)
            }
            ArchivePath::Blob(digest) => write!(f, "{}{}", BLOB_DIR, digest),
        }
    }
}

/// Walk every regular-file entry of the archive at `path`.
///
/// Entries outside the path grammar are skipped; malformed paths are
/// reported to `visit` so the caller decides how loud to be about them.
pub fn read_entries<F>(path: &Path, mut visit: F) -> Result<()>
where
    F: FnMut(
        std::result::Result<ArchivePath, ArchivePathError>,
        &mut tar::Entry<'_, File>,
    ) -> Result<()>,
{
    let file = File::open(path)?;
    let mut archive = Archive::new(file);

    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        if !matches!(entry.header().entry_type(), EntryType::Regular | EntryType::Continuous) {
            continue;
        }

        let name = entry.path().map_err(archive_error)?.to_string_lossy().into_owned();
        match ArchivePath::parse(&name) {
            Ok(Some(parsed)) => visit(Ok(parsed), &mut entry)?,
            Ok(None) => tracing::debug!(path = %name, "ignoring archive entry"),
            Err(e) => visit(Err(e), &mut entry)?,
        }
    }
    Ok(())
}

fn archive_error(err: io::Error) -> SyncError {
    SyncError::Archive(err.to_string())
}

/// Read a whole entry. `None` when it is larger than `limit`; the rest of
/// the entry is left unread.
pub fn read_small_entry<R: Read>(entry: &mut R, limit: u64) -> Result<Option<Vec<u8>>> {
    let mut content = Vec::new();
    Read::take(entry, limit + 1).read_to_end(&mut content).map_err(archive_error)?;
    if content.len() as u64 > limit {
        return Ok(None);
    }
    Ok(Some(content))
}

/// Appends manifests and blobs to a tar stream, writing each path once.
pub struct ArchiveWriter<W: Write> {
    builder: tar::Builder<W>,
    written: HashSet<String>,
    include_registry: bool,
    mtime: u64,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(writer: W) -> Self {
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            builder: tar::Builder::new(writer),
            written: HashSet::new(),
            include_registry: false,
            mtime,
        }
    }

    /// Prefix manifest paths with the registry host, e.g. `docker.io/library/nginx/manifests/...`.
    pub fn include_registry(mut self, include: bool) -> Self {
        self.include_registry = include;
        self
    }

    /// Repository directory as it appears in the archive
    pub fn repository_dir(&self, host: &str, repository: &str) -> String {
        if self.include_registry {
            format!("{}/{}", host, repository)
        } else {
            repository.to_string()
        }
    }

    pub fn contains(&self, path: &ArchivePath) -> bool {
        self.written.contains(&path.to_string())
    }

    /// Write a manifest payload. Returns `false` if the path was already written.
    pub fn write_manifest(&mut self, path: &ArchivePath, payload: &[u8]) -> Result<bool> {
        self.append(path, payload.len() as u64, payload)
    }

    /// Copy a staged blob file into the archive under `blob/<digest>`.
    pub fn write_blob_file(&mut self, digest: &OciDigest, file: &Path, size: u64) -> Result<bool> {
        let path = ArchivePath::Blob(digest.clone());
        if self.contains(&path) {
            return Ok(false);
        }
        let file = File::open(file)?;
        self.append(&path, size, file)
    }

    fn append<R: Read>(&mut self, path: &ArchivePath, size: u64, data: R) -> Result<bool> {
        let name = path.to_string();
        if self.written.contains(&name) {
            return Ok(false);
        }

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(self.mtime);
        self.builder
            .append_data(&mut header, &name, data)
            .map_err(archive_error)?;

        self.written.insert(name);
        Ok(true)
    }

    /// Number of entries written so far
    pub fn len(&self) -> usize {
        self.written.len()
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }

    /// Write the tar trailer and hand back the underlying writer.
    pub fn finish(self) -> Result<W> {
        self.builder.into_inner().map_err(archive_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn classifies_the_three_forms() {
        assert_eq!(
            ArchivePath::parse("library/nginx/manifests/1.25").unwrap(),
            Some(ArchivePath::TagManifest {
                repository: "library/nginx".to_string(),
                tag: "1.25".to_string()
            })
        );
        assert_eq!(
            ArchivePath::parse(&format!("./app/manifests/{}", DIGEST)).unwrap(),
            Some(ArchivePath::DigestManifest {
                repository: "app".to_string(),
                digest: DIGEST.parse().unwrap()
            })
        );
        assert_eq!(
            ArchivePath::parse(&format!("blob/{}", DIGEST)).unwrap(),
            Some(ArchivePath::Blob(DIGEST.parse().unwrap()))
        );
    }

    #[test]
    fn repository_named_blob_is_still_a_manifest() {
        assert_eq!(
            ArchivePath::parse("blob/manifests/v1").unwrap(),
            Some(ArchivePath::TagManifest {
                repository: "blob".to_string(),
                tag: "v1".to_string()
            })
        );
    }

    #[test]
    fn ignores_unrelated_entries() {
        assert_eq!(ArchivePath::parse("README").unwrap(), None);
        assert_eq!(ArchivePath::parse("app/manifests/").unwrap(), None);
        assert_eq!(ArchivePath::parse("app/tags/v1").unwrap(), None);
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(matches!(
            ArchivePath::parse("blob/sha256:xyz"),
            Err(ArchivePathError::Digest { .. })
        ));
        assert!(matches!(
            ArchivePath::parse("app/manifests/md5:abc"),
            Err(ArchivePathError::Digest { .. })
        ));
        assert!(matches!(
            ArchivePath::parse("/manifests/v1"),
            Err(ArchivePathError::Malformed { .. })
        ));
    }

    #[test]
    fn display_round_trips() {
        for raw in ["team/app/manifests/v2", &format!("blob/{}", DIGEST)] {
            assert_eq!(ArchivePath::parse(raw).unwrap().unwrap().to_string(), raw);
        }
    }

    #[test]
    fn writer_skips_paths_already_written() {
        let mut writer = ArchiveWriter::new(Vec::new());
        let path = ArchivePath::TagManifest {
            repository: "app".to_string(),
            tag: "v1".to_string(),
        };
        assert!(writer.write_manifest(&path, b"{}").unwrap());
        assert!(!writer.write_manifest(&path, b"{}").unwrap());
        let bytes = writer.finish().unwrap();

        let mut archive = Archive::new(bytes.as_slice());
        let entries: Vec<_> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.path().unwrap().to_string_lossy().into_owned(), e.header().mode().unwrap())
            })
            .collect();
        assert_eq!(entries, vec![("app/manifests/v1".to_string(), 0o644)]);
    }

    #[test]
    fn small_entry_limit() {
        let content = vec![b'x'; 16];
        assert_eq!(read_small_entry(&mut content.as_slice(), 16).unwrap(), Some(content.clone()));
        assert_eq!(read_small_entry(&mut content.as_slice(), 15).unwrap(), None);
    }
}
