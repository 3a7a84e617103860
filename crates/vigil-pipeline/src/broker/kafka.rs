use super::{Broker, BrokerError, Delivery, Subscription};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info};

/// Kafka adapter: `acks=all` producer and manual-commit consumers
pub struct KafkaBroker {
    producer: FutureProducer,
    config: BrokerConfig,
}

impl KafkaBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("acks", &config.acks)
            .set("compression.type", &config.compression)
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("message.max.bytes", config.max_message_bytes.to_string())
            .create()
            .map_err(|e| BrokerError::Config(format!("failed to create producer: {e}")))?;

        info!(bootstrap_servers = %config.bootstrap_servers, "Kafka producer created");

        Ok(Self {
            producer,
            config: config.clone(),
        })
    }
}

fn publish_error(topic: &str, error: KafkaError, size: usize, limit: usize) -> BrokerError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => BrokerError::MessageTooLarge { size, limit },
        Some(RDKafkaErrorCode::UnknownTopicOrPartition) | Some(RDKafkaErrorCode::TopicAuthorizationFailed) => {
            BrokerError::Config(format!("cannot publish to {topic}: {error}"))
        },
        _ => BrokerError::Publish {
            topic: topic.to_string(),
            reason: error.to_string(),
        },
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if payload.len() > self.config.max_message_bytes {
            return Err(BrokerError::MessageTooLarge {
                size: payload.len(),
                limit: self.config.max_message_bytes,
            });
        }

        let record = FutureRecord::to(topic).key(key).payload(payload);
        let timeout = Duration::from_millis(self.config.message_timeout_ms);

        let (partition, offset) = self
            .producer
            .send(record, timeout)
            .await
            .map_err(|(error, _)| {
                publish_error(topic, error, payload.len(), self.config.max_message_bytes)
            })?;

        debug!(topic, key, partition, offset, "published");
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
        group: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .set("fetch.message.max.bytes", self.config.max_message_bytes.to_string())
            .create()
            .map_err(|e| BrokerError::Config(format!("failed to create consumer: {e}")))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BrokerError::Unavailable(format!("subscribe to {topics:?} failed: {e}")))?;

        info!(group, topics = ?topics, "Kafka consumer subscribed");
        Ok(Box::new(KafkaSubscription { consumer }))
    }
}

struct KafkaSubscription {
    consumer: StreamConsumer,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        Ok(Some(Delivery {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().unwrap_or_default().to_vec(),
        }))
    }

    async fn commit(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let positions = commit_positions(delivery)?;
        // queued without waiting on the coordinator; a lost commit only means redelivery
        self.consumer
            .commit(&positions, CommitMode::Async)
            .map_err(|e| BrokerError::Commit(e.to_string()))
    }
}

/// Offsets to commit once `delivery` is processed: the next one on its partition
fn commit_positions(delivery: &Delivery) -> Result<TopicPartitionList, BrokerError> {
    let mut positions = TopicPartitionList::new();
    positions
        .add_partition_offset(&delivery.topic, delivery.partition, Offset::Offset(delivery.offset + 1))
        .map_err(|e| BrokerError::Commit(e.to_string()))?;
    Ok(positions)
}
