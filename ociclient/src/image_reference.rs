use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::digest::{DigestError, OciDigest};

/// Error type for image reference parsing
#[derive(Debug, Error)]
pub enum ImageReferenceError {
    #[error("Invalid image reference format: {0}")]
    InvalidFormat(String),
    #[error("Invalid digest in image reference: {0}")]
    InvalidDigest(#[from] DigestError),
}

/// The tag or digest part of an image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag(String),
    Digest(OciDigest),
}

impl Reference {
    pub fn as_tag(&self) -> Option<&str> {
        match self {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => write!(f, "{}", digest),
        }
    }
}

/// Represents an image reference of the form `registry/repository:tag`
/// or `registry/repository@algorithm:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, always the first path segment
    pub hostname: String,
    /// Repository name, may contain further `/` segments
    pub name: String,
    /// Tag or digest
    pub reference: Reference,
}

impl ImageReference {
    /// Create a new ImageReference
    pub fn new(hostname: String, name: String, reference: Reference) -> Self {
        Self {
            hostname,
            name,
            reference,
        }
    }
}

impl FromStr for ImageReference {
    type Err = ImageReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ImageReferenceError::InvalidFormat(s.to_string());

        let (hostname, rest) = s.split_once('/').ok_or_else(invalid)?;
        if hostname.is_empty() || rest.is_empty() {
            return Err(invalid());
        }

        let (name, reference) = if let Some((name, digest)) = rest.split_once('@') {
            (name, Reference::Digest(OciDigest::from_str(digest)?))
        } else {
            // A ':' after the last '/' separates the tag
            let last_segment = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
            match rest[last_segment..].rfind(':') {
                Some(i) => {
                    let split = last_segment + i;
                    (&rest[..split], Reference::Tag(rest[split + 1..].to_string()))
                }
                None => (rest, Reference::Tag("latest".to_string())),
            }
        };

        let tag_is_empty = matches!(&reference, Reference::Tag(tag) if tag.is_empty());
        if name.is_empty() || name.starts_with('/') || name.ends_with('/') || tag_is_empty {
            return Err(invalid());
        }

        Ok(ImageReference {
            hostname: hostname.to_string(),
            name: name.to_string(),
            reference,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}/{}:{}", self.hostname, self.name, tag),
            Reference::Digest(digest) => write!(f, "{}/{}@{}", self.hostname, self.name, digest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_reference() {
        let r = ImageReference::from_str("docker.io/library/nginx:1.25").unwrap();
        assert_eq!(r.hostname, "docker.io");
        assert_eq!(r.name, "library/nginx");
        assert_eq!(r.reference, Reference::Tag("1.25".to_string()));
        assert_eq!(r.to_string(), "docker.io/library/nginx:1.25");
    }

    #[test]
    fn host_with_port_is_not_a_tag() {
        let r = ImageReference::from_str("localhost:5000/app").unwrap();
        assert_eq!(r.hostname, "localhost:5000");
        assert_eq!(r.name, "app");
        assert_eq!(r.reference, Reference::Tag("latest".to_string()));
    }

    #[test]
    fn parses_digest_reference() {
        let digest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let r = ImageReference::from_str(&format!("ghcr.io/owner/repo@{}", digest)).unwrap();
        assert_eq!(r.name, "owner/repo");
        assert!(matches!(r.reference, Reference::Digest(ref d) if d.to_string() == digest));
    }

    #[test]
    fn rejects_incomplete_references() {
        assert!(ImageReference::from_str("nginx").is_err());
        assert!(ImageReference::from_str("/nginx:1").is_err());
        assert!(ImageReference::from_str("docker.io/").is_err());
        assert!(ImageReference::from_str("docker.io/nginx:").is_err());
        assert!(ImageReference::from_str("docker.io/nginx@sha256:zz").is_err());
    }
}
