//! Quarantine for units of work that cannot progress
//!
//! A [`FailureRecord`] is published, with retries, to the stage's dead-letter
//! topic. If even that fails the caller gets an error and must not
//! acknowledge its input: the unit is then redelivered after restart.
//!
//! A record the broker refuses as too large is sent again in reduced form
//! (see [`FailureRecord::reduced`]), so an oversized unit cannot wedge a stage.

use crate::broker::{Broker, BrokerError};
use crate::retry::{self, RetryError, RetryPolicy};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};
use vigil_common::types::FailureRecord;

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("failed to encode failure record: {0}")]
    Encode(#[from] vigil_common::VigilError),

    #[error("dead-letter publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: RetryError<BrokerError>,
    },
}

#[derive(Clone)]
pub struct DeadLetterSink {
    broker: Arc<dyn Broker>,
    topic: String,
    retry: RetryPolicy,
}

impl DeadLetterSink {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            broker,
            topic: topic.into(),
            retry,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish `record`; `Ok` means the failure is durably recorded
    pub async fn send(&self, record: &FailureRecord) -> Result<(), DeadLetterError> {
        let payload = record.to_json()?;
        let key = record.key();

        error!(
            failure_id = %record.failure_id,
            stage = %record.stage,
            key = %key,
            kind = ?record.kind,
            attempts = record.attempt_count,
            error = %record.error,
            "dead-lettering unit of work"
        );

        let encoded_bytes = payload.len();
        match self.publish(&key, payload).await {
            Err(DeadLetterError::Publish { source, .. })
                if matches!(source.source_error(), BrokerError::MessageTooLarge { .. }) =>
            {
                warn!(
                    failure_id = %record.failure_id,
                    size = encoded_bytes,
                    error = %source,
                    "failure record too large, sending reduced form"
                );
                let reduced = record.reduced(encoded_bytes);
                self.publish(&reduced.key(), reduced.to_json()?).await
            },
            other => other,
        }
    }

    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), DeadLetterError> {
        let broker = self.broker.as_ref();
        let (topic, payload) = (self.topic.as_str(), payload.as_slice());
        retry::execute(&self.retry, "dead-letter publish", move || {
            broker.publish(topic, key, payload)
        })
        .await
        .map_err(|source| DeadLetterError::Publish {
            topic: self.topic.clone(),
            source,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use vigil_common::types::{FailedUnit, FailureKind};

    fn record() -> FailureRecord {
        FailureRecord::new(
            "parse",
            FailedUnit::undecodable("raw-email", 0, 7, b"{not json"),
            FailureKind::Malformed,
            "expected value at line 1",
            1,
        )
    }

    #[tokio::test]
    async fn test_send_publishes_keyed_record() {
        let broker = MemoryBroker::new();
        let sink = DeadLetterSink::new(Arc::new(broker.clone()), "dead-letter", RetryPolicy::immediate(3));

        sink.send(&record()).await.unwrap();

        let messages = broker.messages("dead-letter").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key.as_deref(), Some("raw-email:0:7"));
        let decoded = FailureRecord::from_json(&messages[0].payload).unwrap();
        assert_eq!(decoded.kind, FailureKind::Malformed);
    }

    #[tokio::test]
    async fn test_send_surfaces_exhaustion() {
        let broker = MemoryBroker::new();
        broker.fail_all_publishes("dead-letter").await;
        let sink = DeadLetterSink::new(Arc::new(broker.clone()), "dead-letter", RetryPolicy::immediate(2));

        let err = sink.send(&record()).await.unwrap_err();
        match err {
            DeadLetterError::Publish { source, .. } => assert_eq!(source.attempts(), 2),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(broker.publish_attempts("dead-letter").await, 2);
    }

    #[tokio::test]
    async fn test_oversized_record_is_sent_as_reference() {
        let broker = MemoryBroker::with_max_message_bytes(4096);
        let sink = DeadLetterSink::new(Arc::new(broker.clone()), "dead-letter", RetryPolicy::immediate(3));
        let record = FailureRecord::new(
            "parse",
            FailedUnit::undecodable("raw-email", 0, 9, &[b'z'; 400]),
            FailureKind::Malformed,
            "x".repeat(8000),
            1,
        );

        sink.send(&record).await.unwrap();

        let messages = broker.messages("dead-letter").await;
        assert_eq!(messages.len(), 1);
        let decoded = FailureRecord::from_json(&messages[0].payload).unwrap();
        assert_eq!(decoded.failure_id, record.failure_id);
        assert_eq!(messages[0].key.as_deref(), Some("raw-email:0:9"));
        match decoded.unit {
            FailedUnit::Reference { unit_type, encoded_bytes, .. } => {
                assert_eq!(unit_type, "undecodable");
                assert!(encoded_bytes > 4096);
            },
            other => panic!("unexpected unit {other:?}"),
        }
        // the size refusal is permanent and not retried
        assert_eq!(broker.publish_attempts("dead-letter").await, 1);
    }
}
