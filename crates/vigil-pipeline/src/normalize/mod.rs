//! Channel normalization
//!
//! A [`Normalizer`] maps one channel's [`ParsedRecord`]s to the canonical
//! record. The [`NormalizerRegistry`] is built once at startup and shared
//! read-only; adding a channel means registering another normalizer.

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use vigil_common::types::{CanonicalRecord, Channel, ParsedRecord};

pub mod ingestion;

pub use ingestion::IngestionService;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("malformed {channel} record {raw_message_id}: {reason}")]
    Malformed {
        channel: Channel,
        raw_message_id: String,
        reason: String,
    },

    #[error("normalizer for {expected} received a {actual} record")]
    ChannelMismatch { expected: Channel, actual: Channel },
}

impl NormalizeError {
    pub fn malformed(record: &ParsedRecord, reason: impl Into<String>) -> Self {
        NormalizeError::Malformed {
            channel: record.channel,
            raw_message_id: record.raw_message_id.clone(),
            reason: reason.into(),
        }
    }
}

pub trait Normalizer: Send + Sync {
    fn channel(&self) -> Channel;

    /// Pure mapping; the same record always yields the same canonical record
    fn normalize(&self, record: &ParsedRecord) -> Result<CanonicalRecord, NormalizeError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no normalizer registered for enabled channel {0}")]
    MissingNormalizer(Channel),

    #[error("more than one normalizer registered for channel {0}")]
    DuplicateNormalizer(Channel),
}

#[derive(Clone, Default)]
pub struct NormalizerRegistry {
    normalizers: Arc<BTreeMap<Channel, Arc<dyn Normalizer>>>,
}

impl NormalizerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn Normalizer>> {
        self.normalizers.get(&channel).cloned()
    }

    pub fn supported_channels(&self) -> Vec<Channel> {
        self.normalizers.keys().copied().collect()
    }

    /// Fail if any of `channels` has no normalizer
    pub fn require(&self, channels: &[Channel]) -> Result<(), RegistryError> {
        match channels.iter().find(|c| !self.normalizers.contains_key(c)) {
            Some(missing) => Err(RegistryError::MissingNormalizer(*missing)),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    normalizers: Vec<Arc<dyn Normalizer>>,
}

impl RegistryBuilder {
    pub fn register(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizers.push(normalizer);
        self
    }

    pub fn build(self) -> Result<NormalizerRegistry, RegistryError> {
        let mut map = BTreeMap::new();
        for normalizer in self.normalizers {
            let channel = normalizer.channel();
            if map.insert(channel, normalizer).is_some() {
                return Err(RegistryError::DuplicateNormalizer(channel));
            }
        }
        Ok(NormalizerRegistry {
            normalizers: Arc::new(map),
        })
    }
}
