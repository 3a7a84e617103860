//! Best-effort secondary delivery
//!
//! After an envelope has been published to the broker it is offered to the
//! secondary sink through a bounded queue. A separate task drains the queue
//! and POSTs each envelope once. A slow or failing sink only increments a
//! counter; it never blocks or fails primary delivery.

use crate::config::SecondarySinkConfig;
use crate::health::HealthState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_common::types::RawEnvelope;

const INGEST_PATH: &str = "/v1/ingest";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("secondary sink request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("secondary sink rejected envelope with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait SecondarySink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, envelope: &RawEnvelope) -> Result<(), SinkError>;
}

/// POSTs envelopes as JSON to `<endpoint>/v1/ingest`
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    /// `None` when no endpoint is configured
    pub fn new(config: &SecondarySinkConfig) -> anyhow::Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.as_deref().map(str::trim).filter(|e| !e.is_empty())
        else {
            return Ok(None);
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Some(Self {
            client,
            url: format!("{}{INGEST_PATH}", endpoint.trim_end_matches('/')),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SecondarySink for HttpSink {
    fn name(&self) -> &str {
        &self.url
    }

    async fn deliver(&self, envelope: &RawEnvelope) -> Result<(), SinkError> {
        let response = self.client.post(&self.url).json(envelope).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Rejected(status.as_u16()))
        }
    }
}

/// Producer side of the forwarding queue
#[derive(Clone)]
pub struct ForwarderHandle {
    tx: mpsc::Sender<RawEnvelope>,
    health: HealthState,
}

impl ForwarderHandle {
    /// Queue `envelope` without waiting; a full queue drops it
    pub fn offer(&self, envelope: RawEnvelope) {
        if let Err(e) = self.tx.try_send(envelope) {
            let id = match &e {
                mpsc::error::TrySendError::Full(env) | mpsc::error::TrySendError::Closed(env) => {
                    env.raw_message_id.clone()
                },
            };
            warn!(raw_message_id = %id, "secondary sink queue unavailable, dropping envelope");
            self.health.record_secondary_failure();
        }
    }
}

/// Start the forwarding task; it ends once every [`ForwarderHandle`] is dropped
pub fn spawn_forwarder(
    sink: Arc<dyn SecondarySink>,
    capacity: usize,
    health: HealthState,
) -> (ForwarderHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<RawEnvelope>(capacity.max(1));
    let task_health = health.clone();

    let task = tokio::spawn(async move {
        info!(sink = sink.name(), "secondary sink forwarder started");
        while let Some(envelope) = rx.recv().await {
            match sink.deliver(&envelope).await {
                Ok(()) => debug!(raw_message_id = %envelope.raw_message_id, "forwarded to secondary sink"),
                Err(e) => {
                    warn!(
                        raw_message_id = %envelope.raw_message_id,
                        sink = sink.name(),
                        error = %e,
                        "secondary sink delivery failed"
                    );
                    task_health.record_secondary_failure();
                },
            }
        }
        info!(sink = sink.name(), "secondary sink forwarder stopped");
    });

    (ForwarderHandle { tx, health }, task)
}
