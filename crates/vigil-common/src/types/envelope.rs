use super::Channel;
use crate::checksum;
use crate::error::{Result, VigilError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CONTENT_TYPE_RFC822: &str = "message/rfc822";

/// How the raw payload travels with its envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatTag {
    /// Payload bytes are embedded, base64-encoded, in `inline_payload`
    Inline,
    /// Payload lives in the object store at `payload_ref`
    Reference,
}

/// Output of the capture stage
///
/// Carries cheap summary fields plus a reference to the durably stored raw
/// payload. Published to `raw-<channel>` only after the payload upload has
/// been acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    /// Stable identifier from the source system, e.g. the RFC 5322 Message-ID
    pub raw_message_id: String,

    pub channel: Channel,

    /// Summary fields extracted without a full parse (subject, participants, date)
    #[serde(default)]
    pub envelope: Map<String, Value>,

    /// `s3://<bucket>/<key>` of the raw payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_ref: Option<String>,

    /// Base64 payload, present only for `FormatTag::Inline`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_payload: Option<String>,

    pub size_bytes: u64,
    pub format_tag: FormatTag,
    pub content_type: String,

    /// Hex sha256 of the raw payload
    pub payload_sha256: String,

    /// Provenance: polling cursor, mailbox, host
    #[serde(default)]
    pub source_metadata: Map<String, Value>,

    pub captured_at: DateTime<Utc>,
}

impl RawEnvelope {
    /// Envelope whose payload was uploaded to `payload_ref`
    pub fn by_reference(
        raw_message_id: impl Into<String>,
        channel: Channel,
        payload_ref: impl Into<String>,
        payload: &[u8],
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            raw_message_id: raw_message_id.into(),
            channel,
            envelope: Map::new(),
            payload_ref: Some(payload_ref.into()),
            inline_payload: None,
            size_bytes: payload.len() as u64,
            format_tag: FormatTag::Reference,
            content_type: content_type.into(),
            payload_sha256: checksum::sha256_hex(payload),
            source_metadata: Map::new(),
            captured_at: Utc::now(),
        }
    }

    /// Envelope that embeds `payload`
    pub fn inline(
        raw_message_id: impl Into<String>,
        channel: Channel,
        payload: &[u8],
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            raw_message_id: raw_message_id.into(),
            channel,
            envelope: Map::new(),
            payload_ref: None,
            inline_payload: Some(STANDARD.encode(payload)),
            size_bytes: payload.len() as u64,
            format_tag: FormatTag::Inline,
            content_type: content_type.into(),
            payload_sha256: checksum::sha256_hex(payload),
            source_metadata: Map::new(),
            captured_at: Utc::now(),
        }
    }

    pub fn with_envelope(mut self, envelope: Map<String, Value>) -> Self {
        self.envelope = envelope;
        self
    }

    pub fn with_source_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.source_metadata = metadata;
        self
    }

    /// Check that the format tag agrees with the payload fields
    pub fn validate(&self) -> Result<()> {
        if self.raw_message_id.trim().is_empty() {
            return Err(VigilError::Validation("raw_message_id is empty".into()));
        }
        match (self.format_tag, &self.payload_ref, &self.inline_payload) {
            (FormatTag::Reference, Some(uri), None) if !uri.is_empty() => Ok(()),
            (FormatTag::Inline, None, Some(_)) => Ok(()),
            (tag, payload_ref, inline) => Err(VigilError::Validation(format!(
                "{} envelope {} has payload_ref={} inline_payload={}",
                match tag {
                    FormatTag::Inline => "inline",
                    FormatTag::Reference => "reference",
                },
                self.raw_message_id,
                payload_ref.is_some(),
                inline.is_some()
            ))),
        }
    }

    /// Decoded inline payload, `None` for reference envelopes
    pub fn decode_inline(&self) -> Result<Option<Vec<u8>>> {
        self.inline_payload
            .as_deref()
            .map(|encoded| STANDARD.decode(encoded).map_err(VigilError::from))
            .transpose()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate an envelope read from the broker
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}
