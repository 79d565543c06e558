use reqwest::StatusCode;
use thiserror::Error;

use crate::digest::DigestError;
use crate::manifest::ManifestError;

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),

    #[error("failed to decode manifest: {0}")]
    Decode(String),

    #[error("manifest rejected ({status}): {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("blob upload rejected ({status}): {message}")]
    UploadRejected { status: StatusCode, message: String },

    #[error("unexpected response ({status}): {message}")]
    UnexpectedStatus { status: StatusCode, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("size mismatch: expected {expected} bytes, read {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Digest(#[from] DigestError),
}

impl From<ManifestError> for RegistryError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::UnsupportedMediaType(media_type) => {
                RegistryError::UnsupportedMediaType(media_type)
            }
            ManifestError::Decode(e) => RegistryError::Decode(e.to_string()),
        }
    }
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
