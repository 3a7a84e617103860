//! Checksum utilities for payload verification

use crate::error::{Result, VigilError};
use sha2::{Digest, Sha256};

/// Length of the digest prefix used in attachment object keys
pub const SHORT_DIGEST_LEN: usize = 12;

/// Hex-encoded sha256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// First [`SHORT_DIGEST_LEN`] hex characters of the sha256 of `data`
pub fn short_digest(data: &[u8]) -> String {
    let mut digest = sha256_hex(data);
    digest.truncate(SHORT_DIGEST_LEN);
    digest
}

/// Verify that `data` hashes to `expected` (hex, case-insensitive)
pub fn verify_sha256(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(VigilError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(short_digest(b"hello world"), "b94d27b9934d");
    }

    #[test]
    fn test_verify_sha256() {
        let digest = sha256_hex(b"payload");
        assert!(verify_sha256(b"payload", &digest).is_ok());
        assert!(verify_sha256(b"payload", &digest.to_uppercase()).is_ok());

        match verify_sha256(b"payloa", &digest) {
            Err(VigilError::ChecksumMismatch { expected, .. }) => assert_eq!(expected, digest),
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }
}
