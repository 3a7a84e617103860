//! Connector lifecycle: connect, poll, deliver, drain
//!
//! [`ConnectorRuntime::run`] drives one [`Connector`] through
//! `Idle -> Connecting -> Polling <-> Delivering -> Draining -> Stopped`.
//! A producer half polls the connector into a bounded queue; a delivery
//! half publishes each envelope to `raw-<channel>` and dead-letters what
//! cannot be published. Both share one cancellation token.

use super::{Connector, ConnectorError, IngestContext};
use crate::broker::Broker;
use crate::dead_letter::{DeadLetterError, DeadLetterSink};
use crate::health::{self, HealthState, RuntimeState};
use crate::retry::{self, RetryPolicy, Retryable};
use crate::sink::{self, ForwarderHandle, SecondarySink};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_common::types::{BackfillRequest, FailedUnit, FailureKind, FailureRecord, RawEnvelope};

/// Stage name recorded on dead-letters written by the runtime
pub const CAPTURE_STAGE: &str = "capture";

/// How long the secondary forwarder may keep flushing after delivery stopped
const SECONDARY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("health endpoint failed: {0}")]
    Health(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub poll_interval: Duration,
    /// Envelopes captured but not yet delivered
    pub queue_capacity: usize,
    pub secondary_queue: usize,
    /// Backoff between connection attempts; `max_attempts` is ignored
    pub connect_backoff: RetryPolicy,
    /// Serve `/health` and `/ready` here while running
    pub health_addr: Option<SocketAddr>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(crate::config::DEFAULT_POLL_INTERVAL_SECS),
            queue_capacity: crate::config::DEFAULT_INGEST_QUEUE_CAPACITY,
            secondary_queue: crate::config::DEFAULT_SECONDARY_SINK_QUEUE,
            connect_backoff: RetryPolicy::default(),
            health_addr: None,
        }
    }
}

/// Envelopes handled by one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub delivered: u64,
    pub dead_lettered: u64,
}

enum Delivered {
    Published,
    DeadLettered,
}

pub struct ConnectorRuntime {
    connector: Arc<dyn Connector>,
    broker: Arc<dyn Broker>,
    dead_letter: DeadLetterSink,
    secondary: Option<Arc<dyn SecondarySink>>,
    health: HealthState,
    publish_retry: RetryPolicy,
    config: RuntimeConfig,
}

impl ConnectorRuntime {
    pub fn new(
        connector: Arc<dyn Connector>,
        broker: Arc<dyn Broker>,
        dead_letter: DeadLetterSink,
        publish_retry: RetryPolicy,
        config: RuntimeConfig,
    ) -> Self {
        let health = HealthState::new(connector.name());
        Self {
            connector,
            broker,
            dead_letter,
            secondary: None,
            health,
            publish_retry,
            config,
        }
    }

    pub fn with_secondary(mut self, sink: Arc<dyn SecondarySink>) -> Self {
        self.secondary = Some(sink);
        self
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    /// Poll and deliver until `cancel` fires, then drain and stop
    pub async fn run(&self, cancel: CancellationToken) -> Result<DeliverySummary, RuntimeError> {
        let token = cancel.child_token();
        let health_task = self.spawn_health(&token).await?;
        let (forwarder, forward_task) = self.spawn_secondary();

        info!(
            connector = self.connector.name(),
            channel = %self.connector.channel(),
            "connector runtime starting"
        );

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let ctx = IngestContext::new(tx, token.clone(), self.health.clone());

        let (produced, delivered) = tokio::join!(
            self.produce(ctx, &token),
            self.deliver(rx, forwarder, &token)
        );

        self.finish(forward_task).await;
        self.health.set_state(RuntimeState::Stopped);
        token.cancel();
        if let Some(task) = health_task {
            if let Err(e) = task.await {
                warn!(error = %e, "health endpoint task panicked");
            }
        }

        let summary = delivered?;
        produced?;
        info!(
            connector = self.connector.name(),
            delivered = summary.delivered,
            dead_lettered = summary.dead_lettered,
            "connector runtime stopped"
        );
        Ok(summary)
    }

    /// Re-capture a historical window through the same delivery path
    pub async fn run_backfill(
        &self,
        request: &BackfillRequest,
        cancel: CancellationToken,
    ) -> Result<DeliverySummary, RuntimeError> {
        request
            .validate()
            .map_err(|e| ConnectorError::InvalidRequest(e.to_string()))?;
        if request.channel != self.connector.channel() {
            return Err(ConnectorError::InvalidRequest(format!(
                "connector {} serves {}, not {}",
                self.connector.name(),
                self.connector.channel(),
                request.channel
            ))
            .into());
        }

        let token = cancel.child_token();
        if !self.connect(&token).await {
            self.health.set_state(RuntimeState::Stopped);
            return Ok(DeliverySummary::default());
        }

        info!(
            connector = self.connector.name(),
            start = %request.start,
            end = %request.end,
            "backfill starting"
        );

        let (forwarder, forward_task) = self.spawn_secondary();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let ctx = IngestContext::new(tx, token.clone(), self.health.clone());

        let producer = async {
            let result = self.connector.backfill(request, &ctx).await;
            drop(ctx);
            self.health.set_state(RuntimeState::Draining);
            result
        };
        let (produced, delivered) = tokio::join!(producer, self.deliver(rx, forwarder, &token));

        self.finish(forward_task).await;
        if let Err(e) = self.connector.close().await {
            warn!(error = %e, "failed to close connector");
        }
        self.health.set_state(RuntimeState::Stopped);

        let summary = delivered?;
        let captured = produced?;
        info!(
            captured,
            delivered = summary.delivered,
            dead_lettered = summary.dead_lettered,
            "backfill finished"
        );
        Ok(summary)
    }

    async fn spawn_health(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<JoinHandle<()>>, RuntimeError> {
        let Some(addr) = self.config.health_addr else {
            return Ok(None);
        };
        let listener = TcpListener::bind(addr).await?;
        let state = self.health.clone();
        let token = token.clone();
        Ok(Some(tokio::spawn(async move {
            if let Err(e) = health::serve(listener, state, token).await {
                error!(error = %e, "health endpoint stopped");
            }
        })))
    }

    fn spawn_secondary(&self) -> (Option<ForwarderHandle>, Option<JoinHandle<()>>) {
        match &self.secondary {
            Some(sink) => {
                let (handle, task) =
                    sink::spawn_forwarder(Arc::clone(sink), self.config.secondary_queue, self.health.clone());
                (Some(handle), Some(task))
            },
            None => (None, None),
        }
    }

    async fn finish(&self, forward_task: Option<JoinHandle<()>>) {
        if let Some(mut task) = forward_task {
            if tokio::time::timeout(SECONDARY_DRAIN_TIMEOUT, &mut task).await.is_err() {
                warn!("secondary sink forwarder did not drain in time, abandoning queued envelopes");
                task.abort();
            }
        }
    }

    /// Connect with backoff until it works; `false` if cancelled first
    async fn connect(&self, cancel: &CancellationToken) -> bool {
        self.health.set_state(RuntimeState::Connecting);
        self.health.set_connected(false);
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return false;
            }
            attempt = attempt.saturating_add(1);

            match self.connector.connect().await {
                Ok(()) => {
                    self.health.set_connected(true);
                    self.publish_details();
                    self.health.set_state(RuntimeState::Polling);
                    info!(connector = self.connector.name(), attempt, "connected");
                    return true;
                },
                Err(e) => {
                    let delay = self.config.connect_backoff.delay_for(attempt);
                    warn!(
                        connector = self.connector.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connect failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
            }
        }
    }

    fn publish_details(&self) {
        for (key, value) in self.connector.details() {
            self.health.set_detail(key, value);
        }
    }

    async fn produce(
        &self,
        ctx: IngestContext,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectorError> {
        'session: loop {
            if !self.connect(cancel).await {
                break;
            }

            loop {
                if cancel.is_cancelled() {
                    break 'session;
                }

                self.health.record_poll();
                match self.connector.ingest(&ctx).await {
                    Ok(count) => {
                        if count > 0 {
                            debug!(connector = self.connector.name(), count, "poll cycle captured items");
                        }
                        self.publish_details();
                    },
                    Err(ConnectorError::Delivery) => break 'session,
                    Err(e) if e.is_retryable() => {
                        warn!(connector = self.connector.name(), error = %e, "source connection lost");
                        continue 'session;
                    },
                    // the cursor did not move past the failed item; it is re-polled next cycle
                    Err(e) => error!(connector = self.connector.name(), error = %e, "poll cycle failed"),
                }

                tokio::select! {
                    _ = cancel.cancelled() => break 'session,
                    _ = tokio::time::sleep(self.config.poll_interval) => {},
                }
            }
        }

        self.health.set_state(RuntimeState::Draining);
        drop(ctx);
        self.health.set_connected(false);
        self.connector.close().await
    }

    async fn deliver(
        &self,
        mut rx: mpsc::Receiver<RawEnvelope>,
        forwarder: Option<ForwarderHandle>,
        cancel: &CancellationToken,
    ) -> Result<DeliverySummary, RuntimeError> {
        let mut summary = DeliverySummary::default();

        while let Some(envelope) = rx.recv().await {
            let moved = self.health.transition(RuntimeState::Polling, RuntimeState::Delivering);
            let outcome = self.deliver_one(&envelope).await;
            if moved {
                self.health.transition(RuntimeState::Delivering, RuntimeState::Polling);
            }

            match outcome {
                Ok(Delivered::Published) => {
                    summary.delivered += 1;
                    if let Some(forwarder) = &forwarder {
                        forwarder.offer(envelope.clone());
                    }
                },
                Ok(Delivered::DeadLettered) => summary.dead_lettered += 1,
                Err(e) => {
                    error!(
                        raw_message_id = %envelope.raw_message_id,
                        error = %e,
                        "envelope could be neither published nor dead-lettered, stopping"
                    );
                    cancel.cancel();
                    return Err(e.into());
                },
            }

            if let Err(e) = self.connector.commit(&envelope).await {
                warn!(raw_message_id = %envelope.raw_message_id, error = %e, "failed to persist source cursor");
            }
        }

        Ok(summary)
    }

    async fn deliver_one(&self, envelope: &RawEnvelope) -> Result<Delivered, DeadLetterError> {
        let topic = envelope.channel.raw_topic();
        let id = envelope.raw_message_id.as_str();

        let failure = match envelope.to_json() {
            Ok(payload) => {
                let broker = self.broker.as_ref();
                let (topic, payload) = (topic.as_str(), payload.as_slice());
                match retry::execute(&self.publish_retry, "raw envelope publish", move || {
                    broker.publish(topic, id, payload)
                })
                .await
                {
                    Ok(()) => {
                        self.health.record_processed(id);
                        info!(raw_message_id = %id, topic, size = envelope.size_bytes, "raw envelope published");
                        return Ok(Delivered::Published);
                    },
                    Err(e) => {
                        let kind = if e.is_exhausted() {
                            FailureKind::RetryExhausted
                        } else {
                            FailureKind::Malformed
                        };
                        FailureRecord::new(
                            CAPTURE_STAGE,
                            FailedUnit::RawEnvelope(envelope.clone()),
                            kind,
                            e.to_string(),
                            e.attempts(),
                        )
                    },
                }
            },
            Err(e) => FailureRecord::new(
                CAPTURE_STAGE,
                FailedUnit::RawEnvelope(envelope.clone()),
                FailureKind::Malformed,
                e.to_string(),
                1,
            ),
        };

        self.dead_letter.send(&failure.with_source_topic(topic)).await?;
        self.health.record_dead_letter();
        Ok(Delivered::DeadLettered)
    }
}
