//! Moves container images between tar archives and Docker/OCI registries.
//!
//! [`ImportEngine`] pushes an archive into a registry; [`ExportEngine`]
//! builds an archive from registry images.

pub mod archive;
pub mod cache;
pub mod config;
pub mod error;
pub mod export;
pub mod graph;
pub mod import;
pub mod ledger;
pub mod pool;

pub use archive::{ArchivePath, ArchivePathError, ArchiveWriter};
pub use cache::{BlobCache, CacheLookup};
pub use config::{AppConfig, RegistryEndpoint, RepositoryConfig};
pub use error::{Result, SyncError};
pub use export::{ExportEngine, ExportOptions, ExportReport, DEFAULT_CONCURRENCY};
pub use graph::{BlobGraph, BlobNode, ManifestFile, ManifestName};
pub use import::{scan_archive, ImportEngine, ImportReport, ScanResult};
pub use ledger::TransferLedger;
pub use pool::ClientPool;
