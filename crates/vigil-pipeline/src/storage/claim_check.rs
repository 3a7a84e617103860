//! Claim-check payload offload
//!
//! Large payloads are stored once under a deterministic key and passed
//! between stages as an `s3://<bucket>/<key>` reference. Uploads are retried
//! and return only after the store acknowledged the write; downloads verify
//! length and sha256 and never hand back partial data.

use super::{ObjectStore, PutOptions, StorageError, StoredObject};
use crate::retry::{self, RetryError, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use vigil_common::checksum;
use vigil_common::types::Channel;

/// Object metadata entry holding the hex sha256 of the stored bytes
pub const SHA256_METADATA_KEY: &str = "sha256";

const URI_SCHEME: &str = "s3://";

/// Proof of a durable upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReceipt {
    pub uri: String,
    pub key: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Clone)]
pub struct ClaimCheckStore {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl ClaimCheckStore {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn bucket(&self) -> &str {
        self.store.bucket()
    }

    pub fn uri_for(&self, key: &str) -> String {
        format!("{URI_SCHEME}{}/{key}", self.store.bucket())
    }

    /// Store `bytes` under `key`; re-uploading the same key overwrites idempotently
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn upload(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<ClaimReceipt, RetryError<StorageError>> {
        let sha256 = checksum::sha256_hex(bytes);
        let options = PutOptions::content_type(content_type).with_metadata(SHA256_METADATA_KEY, &sha256);
        let store = self.store.as_ref();

        retry::execute(&self.retry, "object store upload", move || {
            store.put(key, bytes, options.clone())
        })
        .await?;

        let receipt = ClaimReceipt {
            uri: self.uri_for(key),
            key: key.to_string(),
            size_bytes: bytes.len() as u64,
            sha256,
        };
        info!(uri = %receipt.uri, size = receipt.size_bytes, "payload stored");
        Ok(receipt)
    }

    /// Fetch the object behind `uri`, checked against its stored length and digest
    pub async fn download(&self, uri: &str) -> Result<Vec<u8>, RetryError<StorageError>> {
        self.download_verified(uri, None, None).await
    }

    /// Like [`ClaimCheckStore::download`], additionally checking the caller's expectations
    #[instrument(skip(self))]
    pub async fn download_verified(
        &self,
        uri: &str,
        expected_size: Option<u64>,
        expected_sha256: Option<&str>,
    ) -> Result<Vec<u8>, RetryError<StorageError>> {
        let key = self.key_for(uri).map_err(permanent)?;
        let key = key.as_str();
        let store = self.store.as_ref();

        let object = retry::execute(&self.retry, "object store download", move || store.get(key)).await?;

        verify(key, &object, expected_size, expected_sha256).map_err(permanent)?;
        Ok(object.bytes)
    }

    pub async fn exists(&self, uri: &str) -> Result<bool, RetryError<StorageError>> {
        let key = self.key_for(uri).map_err(permanent)?;
        let key = key.as_str();
        let store = self.store.as_ref();
        retry::execute(&self.retry, "object store head", move || store.exists(key)).await
    }

    fn key_for(&self, uri: &str) -> Result<String, StorageError> {
        let (bucket, key) = parse_uri(uri)?;
        if bucket != self.store.bucket() {
            return Err(StorageError::InvalidUri(format!(
                "{uri} is not in bucket {}",
                self.store.bucket()
            )));
        }
        Ok(key.to_string())
    }
}

fn permanent(source: StorageError) -> RetryError<StorageError> {
    RetryError::Permanent {
        attempts: 1,
        source,
    }
}

fn verify(
    key: &str,
    object: &StoredObject,
    expected_size: Option<u64>,
    expected_sha256: Option<&str>,
) -> Result<(), StorageError> {
    let actual = object.bytes.len() as u64;
    let integrity = |reason: String| StorageError::Integrity {
        key: key.to_string(),
        reason,
    };

    if let Some(length) = object.content_length {
        if length != actual {
            return Err(integrity(format!("received {actual} of {length} bytes")));
        }
    }
    if let Some(expected) = expected_size {
        if expected != actual {
            return Err(integrity(format!("expected {expected} bytes, found {actual}")));
        }
    }

    let stored = object.metadata.get(SHA256_METADATA_KEY).map(String::as_str);
    for digest in [stored, expected_sha256].into_iter().flatten() {
        checksum::verify_sha256(&object.bytes, digest).map_err(|e| integrity(e.to_string()))?;
    }
    Ok(())
}

/// Split `s3://bucket/key` into its parts
pub fn parse_uri(uri: &str) -> Result<(&str, &str), StorageError> {
    let rest = uri
        .strip_prefix(URI_SCHEME)
        .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => Err(StorageError::InvalidUri(uri.to_string())),
    }
}

/// Identifier made safe for use as one object key segment
///
/// One surrounding `<...>` pair is a Message-ID delimiter and is dropped, so
/// `<a@x>` and `a@x` share a key. Identifiers already limited to
/// `[A-Za-z0-9._@+=-]` are used as-is. Anything else is sanitized and suffixed
/// with a short digest of the full identifier, so two ids that sanitize to the
/// same text still get distinct keys.
pub fn safe_id(id: &str) -> String {
    let trimmed = id.trim();
    let inner = trimmed
        .strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
        .unwrap_or(trimmed);

    if !inner.is_empty() && !inner.starts_with('.') && inner.chars().all(is_key_char) {
        return inner.to_string();
    }

    let cleaned: String = inner
        .chars()
        .map(|c| if is_key_char(c) { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let stem = if cleaned.is_empty() { "unknown" } else { cleaned };
    format!("{}-{}", stem, checksum::short_digest(trimmed.as_bytes()))
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '+' | '=' | '-')
}

/// Attachment file name reduced to `[A-Za-z0-9._-]`, without any directory part
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `raw/<channel>/<id>.<ext>`
pub fn raw_key(channel: Channel, raw_message_id: &str, extension: &str) -> String {
    format!("raw/{}/{}.{}", channel, safe_id(raw_message_id), extension)
}

/// `attachments/<channel>/<id>/<sha256[..12]>_<name>`
pub fn attachment_key(channel: Channel, raw_message_id: &str, content: &[u8], name: &str) -> String {
    format!(
        "attachments/{}/{}/{}_{}",
        channel,
        safe_id(raw_message_id),
        checksum::short_digest(content),
        sanitize_filename(name)
    )
}

/// `normalized/<yyyy-mm-dd>/<id>.json`
pub fn normalized_key(timestamp: DateTime<Utc>, message_id: &str) -> String {
    format!(
        "normalized/{}/{}.json",
        timestamp.format("%Y-%m-%d"),
        safe_id(message_id)
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;

    fn claim_check(store: &MemoryStore) -> ClaimCheckStore {
        ClaimCheckStore::new(Arc::new(store.clone()), RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let store = MemoryStore::new("vigil");
        let claims = claim_check(&store);

        let receipt = claims
            .upload("raw/email/a.eml", b"From: a@example.com\r\n\r\nhi", "message/rfc822")
            .await
            .unwrap();
        assert_eq!(receipt.uri, "s3://vigil/raw/email/a.eml");
        assert_eq!(receipt.size_bytes, 25);

        let bytes = claims
            .download_verified(&receipt.uri, Some(receipt.size_bytes), Some(&receipt.sha256))
            .await
            .unwrap();
        assert_eq!(bytes, b"From: a@example.com\r\n\r\nhi");
    }

    #[tokio::test]
    async fn test_upload_retries_transient_failures() {
        let store = MemoryStore::new("vigil");
        store.fail_next_puts(2).await;

        claim_check(&store).upload("k", b"v", "text/plain").await.unwrap();
        assert_eq!(store.put_calls().await, 3);

        store.fail_all_puts().await;
        let err = claim_check(&store).upload("k2", b"v", "text/plain").await.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 3);
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_objects_fail_loudly() {
        let store = MemoryStore::new("vigil");
        let claims = claim_check(&store);

        let missing = claims.download("s3://vigil/raw/email/nope.eml").await.unwrap_err();
        assert!(matches!(missing.source_error(), StorageError::NotFound(_)));
        assert!(!missing.is_exhausted());

        let receipt = claims.upload("raw/email/b.eml", b"0123456789", "message/rfc822").await.unwrap();
        store.corrupt("raw/email/b.eml", b"01234".to_vec()).await;
        let truncated = claims.download(&receipt.uri).await.unwrap_err();
        assert!(matches!(truncated.source_error(), StorageError::Integrity { .. }));

        store.corrupt("raw/email/b.eml", b"9876543210".to_vec()).await;
        let tampered = claims.download(&receipt.uri).await.unwrap_err();
        assert!(matches!(tampered.source_error(), StorageError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_foreign_bucket_is_rejected() {
        let store = MemoryStore::new("vigil");
        let err = claim_check(&store).download("s3://other/raw/x").await.unwrap_err();
        assert!(matches!(err.source_error(), StorageError::InvalidUri(_)));
    }

    #[test]
    fn test_parse_uri() {
        assert_eq!(parse_uri("s3://b/a/b/c").unwrap(), ("b", "a/b/c"));
        assert!(parse_uri("http://b/k").is_err());
        assert!(parse_uri("s3://b").is_err());
        assert!(parse_uri("s3:///k").is_err());
    }

    #[test]
    fn test_key_builders() {
        assert_eq!(
            raw_key(Channel::Email, "<CAF12/x@mail.example.com>", "eml"),
            "raw/email/CAF12_x@mail.example.com-99b987349e8f.eml"
        );
        assert_eq!(raw_key(Channel::Email, "<m@x>", "eml"), "raw/email/m@x.eml");
        assert_eq!(sanitize_filename("../../etc/pass wd"), "pass_wd");
        assert_eq!(sanitize_filename("résumé.pdf"), "r_sum_.pdf");
        assert_eq!(sanitize_filename(""), "attachment");
        assert_eq!(safe_id("<>"), "unknown-24295a9c545a");

        let key = attachment_key(Channel::Email, "<m@x>", b"hello world", "Q3 report.pdf");
        assert_eq!(key, "attachments/email/m@x/b94d27b9934d_Q3_report.pdf");

        let ts = Utc.with_ymd_and_hms(2025, 3, 7, 23, 59, 0).unwrap();
        assert_eq!(normalized_key(ts, "<m@x>"), "normalized/2025-03-07/m@x.json");
    }

    #[test]
    fn test_ids_differing_only_in_unsafe_chars_get_distinct_keys() {
        let dollar = raw_key(Channel::Email, "<a$1@corp.example.com>", "eml");
        let percent = raw_key(Channel::Email, "<a%1@corp.example.com>", "eml");
        assert_ne!(dollar, percent);
        assert_eq!(dollar, "raw/email/a_1@corp.example.com-db13e8035a79.eml");
        assert_eq!(percent, "raw/email/a_1@corp.example.com-fea291151222.eml");

        // the plain spelling of the sanitized text keeps its own key
        assert_eq!(safe_id("a_1@corp.example.com"), "a_1@corp.example.com");
        assert!(safe_id("../etc").starts_with("_etc-"));
    }
}
