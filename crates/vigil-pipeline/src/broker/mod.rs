//! Message broker seam
//!
//! Stages publish keyed JSON messages and consume them through
//! consumer-group subscriptions with explicit, per-message commits. The Kafka
//! adapter is the production implementation; [`memory::MemoryBroker`] gives
//! the same semantics in-process.

use crate::retry::Retryable;
use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use memory::MemoryBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("message of {size} bytes exceeds the broker limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("offset commit failed: {0}")]
    Commit(String),

    #[error("broker configuration error: {0}")]
    Config(String),
}

impl Retryable for BrokerError {
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BrokerError::MessageTooLarge { .. } | BrokerError::Config(_)
        )
    }
}

/// One consumed message and its position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish one message; returns once the broker acknowledged it
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Join consumer group `group` on `topics`, resuming from the group's committed offsets
    async fn subscribe(
        &self,
        topics: &[String],
        group: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError>;
}

#[async_trait]
pub trait Subscription: Send + Sync {
    /// Next message in receive order; `None` once the subscription is closed
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError>;

    /// Mark `delivery` and everything before it on its partition as processed
    async fn commit(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}
