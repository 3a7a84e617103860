use super::{CanonicalRecord, ParsedRecord, RawEnvelope};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bytes kept from an undecodable broker message
const PREVIEW_LIMIT: usize = 512;

/// Bytes of the error text kept on a reduced record
const REDUCED_ERROR_LIMIT: usize = 2048;

/// Why a unit of work was quarantined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient failures outlasted the retry policy
    RetryExhausted,
    /// Input could not be decoded or parsed; never retried
    Malformed,
    /// The referenced payload does not exist in the object store
    MissingPayload,
    /// The referenced payload exists but fails its size or checksum check
    Integrity,
    /// No normalizer is registered for the record's channel
    NoNormalizer,
}

/// The unit of work that failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "snake_case")]
pub enum FailedUnit {
    RawEnvelope(RawEnvelope),
    ParsedRecord(ParsedRecord),
    CanonicalRecord(CanonicalRecord),
    /// A broker message that could not be decoded at all
    Undecodable {
        topic: String,
        partition: i32,
        offset: i64,
        preview: String,
    },
    /// Stand-in for a unit too large to dead-letter whole
    Reference {
        unit_type: String,
        key: String,
        #[serde(default)]
        payload_ref: Option<String>,
        #[serde(default)]
        payload_sha256: Option<String>,
        encoded_bytes: usize,
    },
}

impl FailedUnit {
    pub fn undecodable(topic: &str, partition: i32, offset: i64, payload: &[u8]) -> Self {
        let cut = payload.len().min(PREVIEW_LIMIT);
        FailedUnit::Undecodable {
            topic: topic.to_string(),
            partition,
            offset,
            preview: String::from_utf8_lossy(&payload[..cut]).into_owned(),
        }
    }

    /// Broker key for the dead-letter message
    pub fn key(&self) -> String {
        match self {
            FailedUnit::RawEnvelope(envelope) => envelope.raw_message_id.clone(),
            FailedUnit::ParsedRecord(record) => record.raw_message_id.clone(),
            FailedUnit::CanonicalRecord(record) => record.message_id.clone(),
            FailedUnit::Undecodable {
                topic,
                partition,
                offset,
                ..
            } => format!("{topic}:{partition}:{offset}"),
            FailedUnit::Reference { key, .. } => key.clone(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            FailedUnit::RawEnvelope(_) => "raw_envelope",
            FailedUnit::ParsedRecord(_) => "parsed_record",
            FailedUnit::CanonicalRecord(_) => "canonical_record",
            FailedUnit::Undecodable { .. } => "undecodable",
            FailedUnit::Reference { .. } => "reference",
        }
    }

    /// Identity and payload pointer of this unit without its content
    pub fn reference(&self, encoded_bytes: usize) -> Self {
        let (payload_ref, payload_sha256) = match self {
            FailedUnit::RawEnvelope(envelope) => {
                (envelope.payload_ref.clone(), Some(envelope.payload_sha256.clone()))
            },
            FailedUnit::ParsedRecord(record) => (record.source_ref.clone(), None),
            FailedUnit::Reference {
                payload_ref,
                payload_sha256,
                ..
            } => (payload_ref.clone(), payload_sha256.clone()),
            FailedUnit::CanonicalRecord(_) | FailedUnit::Undecodable { .. } => (None, None),
        };
        FailedUnit::Reference {
            unit_type: self.type_name().to_string(),
            key: cut(&self.key(), PREVIEW_LIMIT).to_string(),
            payload_ref,
            payload_sha256,
            encoded_bytes,
        }
    }
}

fn cut(value: &str, limit: usize) -> &str {
    if value.len() <= limit {
        return value;
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Dead-letter entry; created once and never mutated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failure_id: Uuid,

    /// Stage that gave up, e.g. "capture", "parse", "normalize"
    pub stage: String,

    /// Topic the unit was consumed from, if any
    #[serde(default)]
    pub source_topic: Option<String>,

    pub unit: FailedUnit,
    pub kind: FailureKind,
    pub error: String,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        stage: impl Into<String>,
        unit: FailedUnit,
        kind: FailureKind,
        error: impl Into<String>,
        attempt_count: u32,
    ) -> Self {
        Self {
            failure_id: Uuid::new_v4(),
            stage: stage.into(),
            source_topic: None,
            unit,
            kind,
            error: error.into(),
            attempt_count,
            failed_at: Utc::now(),
        }
    }

    pub fn with_source_topic(mut self, topic: impl Into<String>) -> Self {
        self.source_topic = Some(topic.into());
        self
    }

    pub fn key(&self) -> String {
        self.unit.key()
    }

    /// Same failure with the unit replaced by a [`FailedUnit::Reference`]
    ///
    /// Used when the full record exceeds the broker's message limit. The
    /// failure id is kept so both forms identify the same event.
    pub fn reduced(&self, encoded_bytes: usize) -> Self {
        Self {
            failure_id: self.failure_id,
            stage: self.stage.clone(),
            source_topic: self.source_topic.clone(),
            unit: self.unit.reference(encoded_bytes),
            kind: self.kind,
            error: cut(&self.error, REDUCED_ERROR_LIMIT).to_string(),
            attempt_count: self.attempt_count,
            failed_at: self.failed_at,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
