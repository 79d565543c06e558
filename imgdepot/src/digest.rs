use sha2::{Digest, Sha256, Sha512};

/// Compute `algorithm:hex` for `data` using the algorithm named in `expected`.
///
/// Returns `None` for algorithms the registry does not support.
pub fn content_digest_like(expected: &str, data: &[u8]) -> Option<String> {
    let (algorithm, _) = expected.split_once(':')?;
    let hex = match algorithm {
        "sha256" => hex::encode(Sha256::digest(data)),
        "sha512" => hex::encode(Sha512::digest(data)),
        _ => return None,
    };
    Some(format!("{}:{}", algorithm, hex))
}

/// sha256 digest of `data` in `sha256:hex` form
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

pub fn is_digest(reference: &str) -> bool {
    reference.starts_with("sha256:") || reference.starts_with("sha512:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_expected_algorithm() {
        let sha512 = content_digest_like("sha512:00", b"abc").unwrap();
        assert!(sha512.starts_with("sha512:"));
        assert_eq!(sha512.len(), "sha512:".len() + 128);
        assert_eq!(content_digest_like("sha256:00", b"abc").unwrap(), sha256_digest(b"abc"));
        assert_eq!(content_digest_like("md5:00", b"abc"), None);
    }
}
