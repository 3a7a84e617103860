//! Capture stage: durable payload first, envelope second
//!
//! The full raw payload is uploaded under `raw/<channel>/<id>.<ext>` before a
//! [`RawEnvelope`] referencing it is built. Payloads at or below a non-zero
//! inline threshold skip the upload and travel base64-encoded instead.

use crate::connector::ConnectorError;
use crate::storage::claim_check::{self, ClaimCheckStore};
use serde_json::{Map, Value};
use tracing::debug;
use vigil_common::types::{Channel, RawEnvelope};

/// One item pulled from a source, ready to capture
#[derive(Debug, Clone)]
pub struct CapturedItem {
    pub raw_message_id: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    /// Object key extension, e.g. `eml`
    pub extension: String,
    /// Cheap summary fields
    pub envelope: Map<String, Value>,
    pub source_metadata: Map<String, Value>,
}

#[derive(Clone)]
pub struct CaptureStage {
    channel: Channel,
    claim_check: ClaimCheckStore,
    inline_threshold: usize,
}

impl CaptureStage {
    pub fn new(channel: Channel, claim_check: ClaimCheckStore, inline_threshold: usize) -> Self {
        Self {
            channel,
            claim_check,
            inline_threshold,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    fn travels_inline(&self, size: usize) -> bool {
        self.inline_threshold > 0 && size <= self.inline_threshold
    }

    /// Store the payload (unless tiny) and build the envelope that references it
    pub async fn capture(&self, item: CapturedItem) -> Result<RawEnvelope, ConnectorError> {
        let envelope = if self.travels_inline(item.payload.len()) {
            RawEnvelope::inline(&item.raw_message_id, self.channel, &item.payload, &item.content_type)
        } else {
            let key = claim_check::raw_key(self.channel, &item.raw_message_id, &item.extension);
            let receipt = self
                .claim_check
                .upload(&key, &item.payload, &item.content_type)
                .await
                .map_err(|e| ConnectorError::Capture {
                    id: item.raw_message_id.clone(),
                    reason: e.to_string(),
                })?;
            RawEnvelope::by_reference(
                &item.raw_message_id,
                self.channel,
                receipt.uri,
                &item.payload,
                &item.content_type,
            )
        };

        debug!(
            raw_message_id = %item.raw_message_id,
            size = item.payload.len(),
            format = ?envelope.format_tag,
            "captured"
        );

        Ok(envelope
            .with_envelope(item.envelope)
            .with_source_metadata(item.source_metadata))
    }
}
