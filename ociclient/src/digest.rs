use std::fmt;
use std::io;
use std::str::FromStr;

use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Error type for OCI digest operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("Invalid digest format: {0}")]
    InvalidFormat(String),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Hash algorithms a digest may be expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl FromStr for Algorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Represents an OCI content digest
///
/// Two digests are equal exactly when their canonical `algorithm:hex`
/// forms are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OciDigest {
    algorithm: Algorithm,
    hex: String,
}

impl OciDigest {
    /// Create a new OciDigest from an algorithm name and hex value
    pub fn new(algorithm: &str, hex: &str) -> Result<Self, DigestError> {
        let algorithm = Algorithm::from_str(algorithm)?;
        let valid = hex.len() == algorithm.hex_len()
            && hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !valid {
            return Err(DigestError::InvalidFormat(format!("{}:{}", algorithm.as_str(), hex)));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }

    /// Compute the sha256 digest of `data`
    pub fn sha256(data: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    /// Get the algorithm part of the digest
    pub fn algorithm(&self) -> &str {
        self.algorithm.as_str()
    }

    /// Get the hex part of the digest
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Start an incremental hash in this digest's algorithm.
    pub fn verifier(&self) -> DigestVerifier {
        DigestVerifier::new(self.clone())
    }

    /// Check whether `data` hashes to this digest.
    pub fn matches(&self, data: &[u8]) -> bool {
        let mut verifier = self.verifier();
        verifier.update(data);
        verifier.verify()
    }
}

impl fmt::Display for OciDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for OciDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestError::InvalidFormat(s.to_string()))?;
        if hex.contains(':') {
            return Err(DigestError::InvalidFormat(s.to_string()));
        }

        OciDigest::new(algorithm, hex)
    }
}

impl serde::Serialize for OciDigest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for OciDigest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        OciDigest::from_str(&s).map_err(serde::de::Error::custom)
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental hasher that checks streamed content against an expected digest.
///
/// Implements [`io::Write`] so it can sit at the end of `io::copy`.
pub struct DigestVerifier {
    expected: OciDigest,
    hasher: Hasher,
    written: u64,
}

impl DigestVerifier {
    fn new(expected: OciDigest) -> Self {
        let hasher = match expected.algorithm {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Self {
            expected,
            hasher,
            written: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
        self.written += data.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Finish hashing and return the digest of everything seen.
    pub fn finish(self) -> OciDigest {
        let hex = match self.hasher {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        };
        OciDigest {
            algorithm: self.expected.algorithm,
            hex,
        }
    }

    pub fn verify(self) -> bool {
        let expected = self.expected.clone();
        self.finish() == expected
    }
}

impl io::Write for DigestVerifier {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn parses_and_displays_canonical_form() {
        let digest = OciDigest::from_str(EMPTY_SHA256).unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.to_string(), EMPTY_SHA256);
    }

    #[test]
    fn rejects_malformed_digests() {
        assert!(matches!(
            OciDigest::from_str("md5:abcd"),
            Err(DigestError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            OciDigest::from_str("sha256:abcd"),
            Err(DigestError::InvalidFormat(_))
        ));
        assert!(OciDigest::from_str("sha256").is_err());
        let upper = EMPTY_SHA256.to_uppercase().replace("SHA256", "sha256");
        assert!(OciDigest::from_str(&upper).is_err());
    }

    #[test]
    fn computes_sha256_of_content() {
        assert_eq!(OciDigest::sha256(b"").to_string(), EMPTY_SHA256);
        assert!(OciDigest::sha256(b"hello").matches(b"hello"));
        assert!(!OciDigest::sha256(b"hello").matches(b"hellO"));
    }

    #[test]
    fn verifier_hashes_incrementally() {
        let digest = OciDigest::sha256(b"hello world");
        let mut verifier = digest.verifier();
        verifier.update(b"hello ");
        verifier.update(b"world");
        assert_eq!(verifier.bytes_written(), 11);
        assert!(verifier.verify());
    }

    #[test]
    fn sha512_digests_verify() {
        let hex = hex::encode(Sha512::digest(b"abc"));
        let digest = OciDigest::new("sha512", &hex).unwrap();
        assert!(digest.matches(b"abc"));
    }

    #[test]
    fn serde_uses_string_form() {
        let digest = OciDigest::from_str(EMPTY_SHA256).unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", EMPTY_SHA256));
        let back: OciDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
