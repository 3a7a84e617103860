//! Object storage
//!
//! [`ObjectStore`] is the whole-object put/get seam; [`s3::S3Store`] talks to
//! S3-compatible services and [`memory::MemoryStore`] backs tests and local
//! runs. [`claim_check::ClaimCheckStore`] layers deterministic keys, retries
//! and integrity checks on top.

use crate::retry::Retryable;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod claim_check;
pub mod config;
pub mod memory;
pub mod s3;

pub use claim_check::{ClaimCheckStore, ClaimReceipt};
pub use memory::MemoryStore;
pub use s3::S3Store;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("integrity check failed for {key}: {reason}")]
    Integrity { key: String, reason: String },

    #[error("invalid object uri: {0}")]
    InvalidUri(String),

    #[error("object store request failed: {0}")]
    Backend(String),
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl PutOptions {
    pub fn content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    /// Length the store reported for the object, when it reports one
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Store `bytes` under `key`, replacing any existing object; returns once acknowledged
    async fn put(&self, key: &str, bytes: &[u8], options: PutOptions) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<StoredObject, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}
