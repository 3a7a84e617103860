//! Consume loop shared by the parse and normalize stages
//!
//! [`StageRunner::run`] subscribes a [`StageHandler`] to its topics and hands
//! it one delivery at a time, in receive order. The offset is committed only
//! after the handler published or dead-lettered the unit. A handler error
//! means neither happened: the runner stops without committing so the unit
//! is redelivered after restart.

use crate::broker::{Broker, BrokerError, Delivery, Subscription};
use crate::dead_letter::DeadLetterError;
use crate::health::{self, HealthState, RuntimeState};
use crate::retry::{self, RetryError, RetryPolicy, Retryable};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a handler did with one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Published,
    /// Not meant for this stage; acknowledged without output
    Skipped,
    DeadLettered,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("offset commit failed: {0}")]
    Commit(#[from] RetryError<BrokerError>),

    #[error("health endpoint failed: {0}")]
    Health(#[from] std::io::Error),
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage name for logs and dead-letter records
    fn stage(&self) -> &str;

    fn topics(&self) -> Vec<String>;

    fn group(&self) -> &str;

    /// Publish or dead-letter the unit; `Err` only if neither succeeded
    async fn handle(&self, delivery: &Delivery) -> Result<Outcome, StageError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub published: u64,
    pub skipped: u64,
    pub dead_lettered: u64,
}

pub struct StageRunner {
    broker: Arc<dyn Broker>,
    health: HealthState,
    retry: RetryPolicy,
    health_addr: Option<SocketAddr>,
}

impl StageRunner {
    pub fn new(broker: Arc<dyn Broker>, health: HealthState, retry: RetryPolicy) -> Self {
        Self {
            broker,
            health,
            retry,
            health_addr: None,
        }
    }

    pub fn with_health_addr(mut self, addr: SocketAddr) -> Self {
        self.health_addr = Some(addr);
        self
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    /// Consume until `cancel` fires or the subscription ends
    pub async fn run(
        &self,
        handler: &dyn StageHandler,
        cancel: CancellationToken,
    ) -> Result<StageSummary, StageError> {
        let token = cancel.child_token();
        let health_task = match self.health_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let (state, token) = (self.health.clone(), token.clone());
                Some(tokio::spawn(async move {
                    if let Err(e) = health::serve(listener, state, token).await {
                        error!(error = %e, "health endpoint stopped");
                    }
                }))
            },
            None => None,
        };

        let result = self.consume(handler, &token).await;

        self.health.set_connected(false);
        self.health.set_state(RuntimeState::Stopped);
        token.cancel();
        if let Some(task) = health_task {
            if let Err(e) = task.await {
                warn!(error = %e, "health endpoint task panicked");
            }
        }

        match &result {
            Ok(summary) => info!(
                stage = handler.stage(),
                published = summary.published,
                skipped = summary.skipped,
                dead_lettered = summary.dead_lettered,
                "stage stopped"
            ),
            Err(e) => error!(stage = handler.stage(), error = %e, "stage failed"),
        }
        result
    }

    async fn consume(
        &self,
        handler: &dyn StageHandler,
        cancel: &CancellationToken,
    ) -> Result<StageSummary, StageError> {
        let topics = handler.topics();
        self.health.set_state(RuntimeState::Connecting);

        let broker = self.broker.as_ref();
        let (topics_ref, group) = (topics.as_slice(), handler.group());
        let mut subscription = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StageSummary::default()),
            subscribed = retry::execute(&self.retry, "subscribe", move || broker.subscribe(topics_ref, group)) => {
                subscribed.map_err(RetryError::into_inner)?
            },
        };

        self.health.set_connected(true);
        self.health.set_state(RuntimeState::Polling);
        info!(stage = handler.stage(), group, topics = ?topics, "consuming");

        let mut summary = StageSummary::default();
        let mut consume_failures = 0u32;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = subscription.next() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => {
                    consume_failures = 0;
                    delivery
                },
                Ok(None) => break,
                Err(e) if e.is_retryable() => {
                    consume_failures = consume_failures.saturating_add(1);
                    let delay = self.retry.delay_for(consume_failures);
                    warn!(stage = handler.stage(), error = %e, delay_ms = delay.as_millis() as u64, "consume failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                },
                Err(e) => return Err(e.into()),
            };

            self.health.record_poll();
            let moved = self.health.transition(RuntimeState::Polling, RuntimeState::Delivering);
            // the in-flight unit always finishes, cancellation or not
            let outcome = handler.handle(&delivery).await;
            if moved {
                self.health.transition(RuntimeState::Delivering, RuntimeState::Polling);
            }

            match outcome? {
                Outcome::Published => {
                    summary.published += 1;
                    self.health.record_processed(&delivery_id(&delivery));
                },
                Outcome::Skipped => {
                    summary.skipped += 1;
                    self.health.record_skipped();
                },
                Outcome::DeadLettered => {
                    summary.dead_lettered += 1;
                    self.health.record_dead_letter();
                },
            }

            self.commit(subscription.as_ref(), &delivery).await?;
            debug!(topic = %delivery.topic, offset = delivery.offset, "committed");
        }

        self.health.set_state(RuntimeState::Draining);
        Ok(summary)
    }

    async fn commit(&self, subscription: &dyn Subscription, delivery: &Delivery) -> Result<(), StageError> {
        retry::execute(&self.retry, "commit offset", || subscription.commit(delivery)).await?;
        Ok(())
    }
}

fn delivery_id(delivery: &Delivery) -> String {
    delivery
        .key
        .clone()
        .unwrap_or_else(|| format!("{}:{}:{}", delivery.topic, delivery.partition, delivery.offset))
}
