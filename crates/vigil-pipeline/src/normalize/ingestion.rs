//! Normalize stage: parsed records in, canonical records out
//!
//! Each canonical record is written twice, concurrently and each with its
//! own retries: to the `normalized` topic and to the object store under
//! `normalized/<date>/<id>.json`. If either write gives up the record goes to
//! `normalized-dlq` naming the failed sink; the other write stays as is.

use super::NormalizerRegistry;
use crate::broker::{Broker, Delivery};
use crate::dead_letter::DeadLetterSink;
use crate::processor::{Outcome, StageError, StageHandler};
use crate::retry::{self, RetryPolicy};
use crate::storage::claim_check::{self, ClaimCheckStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use vigil_common::types::{CanonicalRecord, Channel, FailedUnit, FailureKind, FailureRecord, ParsedRecord};

pub const NORMALIZE_STAGE: &str = "normalize";

const CONTENT_TYPE_JSON: &str = "application/json";

/// One side of the dual write that gave up
struct SinkFailure {
    sink: &'static str,
    exhausted: bool,
    attempts: u32,
    error: String,
}

pub struct IngestionService {
    registry: NormalizerRegistry,
    broker: Arc<dyn Broker>,
    claim_check: ClaimCheckStore,
    dead_letter: DeadLetterSink,
    retry: RetryPolicy,
    normalized_topic: String,
    channels: Vec<Channel>,
    group: String,
}

impl IngestionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: NormalizerRegistry,
        broker: Arc<dyn Broker>,
        claim_check: ClaimCheckStore,
        dead_letter: DeadLetterSink,
        retry: RetryPolicy,
        normalized_topic: impl Into<String>,
        channels: Vec<Channel>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            broker,
            claim_check,
            dead_letter,
            retry,
            normalized_topic: normalized_topic.into(),
            channels,
            group: group.into(),
        }
    }

    pub fn supported_channels(&self) -> Vec<Channel> {
        self.registry.supported_channels()
    }

    async fn quarantine(
        &self,
        unit: FailedUnit,
        kind: FailureKind,
        error: String,
        attempts: u32,
        source_topic: &str,
    ) -> Result<Outcome, StageError> {
        let record = FailureRecord::new(NORMALIZE_STAGE, unit, kind, error, attempts)
            .with_source_topic(source_topic);
        self.dead_letter.send(&record).await?;
        Ok(Outcome::DeadLettered)
    }

    /// Broker and object store writes; returns the failed sinks
    async fn dual_write(&self, canonical: &CanonicalRecord, payload: &[u8]) -> Vec<SinkFailure> {
        let key = claim_check::normalized_key(canonical.timestamp, &canonical.message_id);
        let broker = self.broker.as_ref();
        let (topic, message_id) = (self.normalized_topic.as_str(), canonical.message_id.as_str());

        let (published, stored) = tokio::join!(
            retry::execute(&self.retry, "normalized publish", move || {
                broker.publish(topic, message_id, payload)
            }),
            self.claim_check.upload(&key, payload, CONTENT_TYPE_JSON),
        );

        let mut failed = Vec::new();
        if let Err(e) = published {
            failed.push(SinkFailure {
                sink: "broker",
                exhausted: e.is_exhausted(),
                attempts: e.attempts(),
                error: e.to_string(),
            });
        }
        if let Err(e) = stored {
            failed.push(SinkFailure {
                sink: "object store",
                exhausted: e.is_exhausted(),
                attempts: e.attempts(),
                error: e.to_string(),
            });
        }
        failed
    }
}

#[async_trait]
impl StageHandler for IngestionService {
    fn stage(&self) -> &str {
        NORMALIZE_STAGE
    }

    fn topics(&self) -> Vec<String> {
        self.channels.iter().map(Channel::parsed_topic).collect()
    }

    fn group(&self) -> &str {
        &self.group
    }

    #[instrument(skip(self, delivery), fields(topic = %delivery.topic, offset = delivery.offset))]
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, StageError> {
        let record = match ParsedRecord::from_json(&delivery.payload) {
            Ok(record) => record,
            Err(e) => {
                let unit = FailedUnit::undecodable(&delivery.topic, delivery.partition, delivery.offset, &delivery.payload);
                return self
                    .quarantine(unit, FailureKind::Malformed, e.to_string(), 1, &delivery.topic)
                    .await;
            },
        };

        let Some(normalizer) = self.registry.get(record.channel) else {
            let error = format!("no normalizer registered for channel {}", record.channel);
            return self
                .quarantine(FailedUnit::ParsedRecord(record), FailureKind::NoNormalizer, error, 1, &delivery.topic)
                .await;
        };

        let canonical = match normalizer.normalize(&record) {
            Ok(canonical) => canonical,
            Err(e) => {
                return self
                    .quarantine(FailedUnit::ParsedRecord(record), FailureKind::Malformed, e.to_string(), 1, &delivery.topic)
                    .await;
            },
        };

        let payload = match canonical.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                return self
                    .quarantine(FailedUnit::CanonicalRecord(canonical), FailureKind::Malformed, e.to_string(), 1, &delivery.topic)
                    .await;
            },
        };

        let failed = self.dual_write(&canonical, &payload).await;
        if failed.is_empty() {
            info!(
                message_id = %canonical.message_id,
                raw_message_id = %record.raw_message_id,
                direction = ?canonical.direction,
                "canonical record written"
            );
            return Ok(Outcome::Published);
        }

        let kind = if failed.iter().any(|f| f.exhausted) {
            FailureKind::RetryExhausted
        } else {
            FailureKind::Malformed
        };
        let attempts = failed.iter().map(|f| f.attempts).max().unwrap_or(1);
        let error = failed
            .iter()
            .map(|f| format!("{}: {}", f.sink, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        warn!(message_id = %canonical.message_id, error = %error, "normalized write failed");

        self.quarantine(FailedUnit::CanonicalRecord(canonical), kind, error, attempts, &delivery.topic)
            .await
    }
}
