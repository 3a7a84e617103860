//! Source connectors
//!
//! A [`Connector`] owns the conversation with one source system: it
//! connects, polls for new communications and emits [`RawEnvelope`]s onto
//! the runtime's delivery queue. The [`runtime::ConnectorRuntime`] does
//! everything else: retries, broker publish, dead-lettering, secondary-sink
//! forwarding and the health endpoint.

use crate::health::HealthState;
use crate::retry::Retryable;
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vigil_common::types::{BackfillRequest, Channel, RawEnvelope};

pub mod runtime;

pub use runtime::{ConnectorRuntime, DeliverySummary, RuntimeConfig};

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("cannot reach source: {0}")]
    Connection(String),

    #[error("source disconnected: {0}")]
    Disconnected(String),

    #[error("capture of {id} failed: {reason}")]
    Capture { id: String, reason: String },

    #[error("backfill is not supported for channel {0}")]
    BackfillUnsupported(Channel),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("delivery queue closed")]
    Delivery,
}

impl Retryable for ConnectorError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::Connection(_) | ConnectorError::Disconnected(_)
        )
    }
}

/// What a connector sees of the runtime while ingesting
pub struct IngestContext {
    tx: mpsc::Sender<RawEnvelope>,
    cancel: CancellationToken,
    health: HealthState,
}

impl IngestContext {
    pub fn new(tx: mpsc::Sender<RawEnvelope>, cancel: CancellationToken, health: HealthState) -> Self {
        Self { tx, cancel, health }
    }

    /// Hand a captured envelope to delivery; waits while the queue is full
    pub async fn emit(&self, envelope: RawEnvelope) -> Result<(), ConnectorError> {
        self.tx.send(envelope).await.map_err(|_| ConnectorError::Delivery)
    }

    /// Stop capturing new items once this is true
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    fn channel(&self) -> Channel;

    async fn connect(&self) -> Result<(), ConnectorError>;

    /// One poll cycle: capture and emit everything new since the cursor
    async fn ingest(&self, ctx: &IngestContext) -> Result<usize, ConnectorError>;

    /// Capture and emit everything in the request's window
    async fn backfill(
        &self,
        request: &BackfillRequest,
        _ctx: &IngestContext,
    ) -> Result<usize, ConnectorError> {
        Err(ConnectorError::BackfillUnsupported(request.channel))
    }

    /// Called once `envelope` was published or dead-lettered; persist progress here
    async fn commit(&self, _envelope: &RawEnvelope) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Connector-specific fields for the health report
    fn details(&self) -> Map<String, Value> {
        Map::new()
    }
}
