use ociclient::{OciDigest, RegistryError};
use thiserror::Error;

use crate::archive::ArchivePathError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    ArchivePath(#[from] ArchivePathError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("size conflict for {digest}: {first} bytes vs {second} bytes")]
    SizeConflict {
        digest: OciDigest,
        first: u64,
        second: u64,
    },
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled | SyncError::Registry(RegistryError::Cancelled)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
