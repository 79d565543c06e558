//! Client side of the Docker/OCI Distribution protocol.
//!
//! Covers content digests, image references, the four manifest formats and a
//! registry [`Client`] able to move manifests and blobs in both directions.

pub mod client;
pub mod digest;
pub mod error;
pub mod image_reference;
pub mod manifest;
pub mod models;

// Re-export main client types for convenience
pub use client::{BlobStream, Client, ClientConfig, Credentials, UploadOutcome, DEFAULT_CHUNK_SIZE};
pub use digest::{DigestVerifier, OciDigest};
pub use error::{RegistryError, Result};
pub use image_reference::{ImageReference, Reference};
pub use manifest::{BlobReference, Manifest, ManifestError, ManifestVariant};
pub use models::{Descriptor, ImageManifest, ManifestList, Platform};
