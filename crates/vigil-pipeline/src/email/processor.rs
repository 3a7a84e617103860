//! Parse stage for `raw-email`
//!
//! Retrieves the raw payload behind each envelope, verifies it, runs the
//! full MIME parse, offloads attachments and publishes a [`ParsedRecord`] to
//! `parsed-email`. Text and HTML bodies above the inline limit are offloaded
//! the same way and referenced as assets, and the header list is cut to the
//! same limit, so the record stays within a broker message. Units that cannot
//! be processed are dead-lettered with the kind of failure; the raw object is
//! left untouched either way.

use super::parser::{self, ParsedEmail};
use super::EmailFields;
use crate::broker::{Broker, BrokerError, Delivery};
use crate::dead_letter::DeadLetterSink;
use crate::processor::{Outcome, StageError, StageHandler};
use crate::retry::{self, RetryError, RetryPolicy};
use crate::storage::claim_check::{self, ClaimCheckStore};
use crate::storage::StorageError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use vigil_common::checksum;
use vigil_common::types::{
    AssetRef, AssetRole, Channel, FailedUnit, FailureKind, FailureRecord, FormatTag, ParsedRecord, RawEnvelope,
};

pub const PARSE_STAGE: &str = "parse";

/// Bodies larger than this travel as assets instead of inline
pub const DEFAULT_BODY_INLINE_LIMIT_BYTES: usize = 256 * 1024;

/// Why an envelope could not become a parsed record
struct Rejection {
    kind: FailureKind,
    error: String,
    attempts: u32,
}

impl Rejection {
    fn malformed(error: impl ToString) -> Self {
        Self {
            kind: FailureKind::Malformed,
            error: error.to_string(),
            attempts: 1,
        }
    }

    fn storage(e: RetryError<StorageError>) -> Self {
        let kind = match e.source_error() {
            StorageError::NotFound(_) => FailureKind::MissingPayload,
            StorageError::Integrity { .. } => FailureKind::Integrity,
            StorageError::InvalidUri(_) => FailureKind::Malformed,
            StorageError::Backend(_) => FailureKind::RetryExhausted,
        };
        Self {
            kind,
            attempts: e.attempts(),
            error: e.to_string(),
        }
    }

    fn publish(e: RetryError<BrokerError>) -> Self {
        let kind = if e.is_exhausted() {
            FailureKind::RetryExhausted
        } else {
            FailureKind::Malformed
        };
        Self {
            kind,
            attempts: e.attempts(),
            error: e.to_string(),
        }
    }
}

pub struct EmailProcessor {
    broker: Arc<dyn Broker>,
    claim_check: ClaimCheckStore,
    dead_letter: DeadLetterSink,
    retry: RetryPolicy,
    group: String,
    body_inline_limit: usize,
}

impl EmailProcessor {
    pub fn new(
        broker: Arc<dyn Broker>,
        claim_check: ClaimCheckStore,
        dead_letter: DeadLetterSink,
        retry: RetryPolicy,
        group: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            claim_check,
            dead_letter,
            retry,
            group: group.into(),
            body_inline_limit: DEFAULT_BODY_INLINE_LIMIT_BYTES,
        }
    }

    /// Offload bodies, and cut the header list, above `limit` bytes
    pub fn with_body_inline_limit(mut self, limit: usize) -> Self {
        self.body_inline_limit = limit;
        self
    }

    async fn fetch_payload(&self, envelope: &RawEnvelope) -> Result<Vec<u8>, Rejection> {
        match (envelope.format_tag, &envelope.payload_ref) {
            (FormatTag::Reference, Some(uri)) => self
                .claim_check
                .download_verified(uri, Some(envelope.size_bytes), Some(&envelope.payload_sha256))
                .await
                .map_err(Rejection::storage),
            _ => {
                let bytes = envelope
                    .decode_inline()
                    .map_err(Rejection::malformed)?
                    .ok_or_else(|| Rejection::malformed("envelope carries no payload"))?;
                checksum::verify_sha256(&bytes, &envelope.payload_sha256).map_err(|e| Rejection {
                    kind: FailureKind::Integrity,
                    error: e.to_string(),
                    attempts: 1,
                })?;
                Ok(bytes)
            },
        }
    }

    async fn upload_asset(
        &self,
        envelope: &RawEnvelope,
        name: &str,
        content_type: &str,
        bytes: &[u8],
        role: AssetRole,
    ) -> Result<AssetRef, Rejection> {
        let key = claim_check::attachment_key(envelope.channel, &envelope.raw_message_id, bytes, name);
        let receipt = self
            .claim_check
            .upload(&key, bytes, content_type)
            .await
            .map_err(Rejection::storage)?;
        Ok(AssetRef {
            name: name.to_string(),
            content_type: content_type.to_string(),
            uri: receipt.uri,
            size_bytes: receipt.size_bytes,
            sha256: receipt.sha256,
            role,
        })
    }

    /// Upload every attachment; all of them are stored before the record is built
    async fn store_attachments(
        &self,
        envelope: &RawEnvelope,
        parsed: &ParsedEmail,
    ) -> Result<Vec<AssetRef>, Rejection> {
        let mut assets = Vec::with_capacity(parsed.attachments.len());
        for attachment in &parsed.attachments {
            assets.push(
                self.upload_asset(
                    envelope,
                    &attachment.name,
                    &attachment.content_type,
                    &attachment.bytes,
                    AssetRole::Attachment,
                )
                .await?,
            );
        }
        Ok(assets)
    }

    /// Move `body` to the object store when it exceeds the inline limit
    async fn offload_body(
        &self,
        envelope: &RawEnvelope,
        body: &mut Option<String>,
        name: &str,
        content_type: &str,
        role: AssetRole,
    ) -> Result<Option<AssetRef>, Rejection> {
        if body.as_ref().is_none_or(|text| text.len() <= self.body_inline_limit) {
            return Ok(None);
        }
        let Some(text) = body.take() else {
            return Ok(None);
        };
        debug!(raw_message_id = %envelope.raw_message_id, size = text.len(), ?role, "offloading body");
        self.upload_asset(envelope, name, content_type, text.as_bytes(), role)
            .await
            .map(Some)
    }

    async fn process(&self, envelope: &RawEnvelope) -> Result<ParsedRecord, Rejection> {
        let raw = self.fetch_payload(envelope).await?;
        let mut parsed = parser::parse_message(&raw).map_err(Rejection::malformed)?;
        let mut assets = self.store_attachments(envelope, &parsed).await?;

        let text = self
            .offload_body(
                envelope,
                &mut parsed.body_text,
                "body.txt",
                "text/plain; charset=utf-8",
                AssetRole::BodyText,
            )
            .await?;
        let html = self
            .offload_body(
                envelope,
                &mut parsed.fields.body_html,
                "body.html",
                "text/html; charset=utf-8",
                AssetRole::BodyHtml,
            )
            .await?;
        assets.extend(text.into_iter().chain(html));
        cap_headers(&mut parsed.fields, self.body_inline_limit);

        let record = ParsedRecord {
            raw_message_id: envelope.raw_message_id.clone(),
            channel: envelope.channel,
            source_ref: envelope.payload_ref.clone(),
            body_text: parsed.body_text,
            assets,
            fields: serde_json::to_value(&parsed.fields).map_err(Rejection::malformed)?,
        };

        let payload = record.to_json().map_err(Rejection::malformed)?;
        let topic = envelope.channel.parsed_topic();
        let broker = self.broker.as_ref();
        let (topic_ref, key, payload) = (topic.as_str(), record.raw_message_id.as_str(), payload.as_slice());
        retry::execute(&self.retry, "parsed record publish", move || {
            broker.publish(topic_ref, key, payload)
        })
        .await
        .map_err(Rejection::publish)?;

        Ok(record)
    }

    async fn reject(
        &self,
        unit: FailedUnit,
        rejection: Rejection,
        source_topic: &str,
    ) -> Result<Outcome, StageError> {
        let record = FailureRecord::new(PARSE_STAGE, unit, rejection.kind, rejection.error, rejection.attempts)
            .with_source_topic(source_topic);
        self.dead_letter.send(&record).await?;
        Ok(Outcome::DeadLettered)
    }
}

/// Keep leading headers up to `budget` bytes of names and values
fn cap_headers(fields: &mut EmailFields, budget: usize) {
    let mut used = 0;
    let kept = fields
        .headers
        .iter()
        .take_while(|header| {
            used += header.name.len() + header.value.len();
            used <= budget
        })
        .count();
    if kept < fields.headers.len() {
        fields.headers.truncate(kept);
        fields.headers_truncated = true;
    }
}

#[async_trait]
impl StageHandler for EmailProcessor {
    fn stage(&self) -> &str {
        PARSE_STAGE
    }

    fn topics(&self) -> Vec<String> {
        vec![Channel::Email.raw_topic()]
    }

    fn group(&self) -> &str {
        &self.group
    }

    #[instrument(skip(self, delivery), fields(topic = %delivery.topic, offset = delivery.offset))]
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, StageError> {
        let envelope = match RawEnvelope::from_json(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                let unit = FailedUnit::undecodable(&delivery.topic, delivery.partition, delivery.offset, &delivery.payload);
                return self.reject(unit, Rejection::malformed(e), &delivery.topic).await;
            },
        };

        if envelope.channel != Channel::Email {
            debug!(raw_message_id = %envelope.raw_message_id, channel = %envelope.channel, "not an email envelope, skipping");
            return Ok(Outcome::Skipped);
        }

        match self.process(&envelope).await {
            Ok(record) => {
                info!(
                    raw_message_id = %record.raw_message_id,
                    assets = record.assets.len(),
                    "parsed record published"
                );
                Ok(Outcome::Published)
            },
            Err(rejection) => {
                self.reject(FailedUnit::RawEnvelope(envelope), rejection, &delivery.topic)
                    .await
            },
        }
    }
}
