use super::{Broker, BrokerError, Delivery, Subscription};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone)]
struct Stored {
    key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct FaultPlan {
    fail_all: bool,
    fail_next: u32,
    fail_keys: HashSet<String>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Stored>>,
    /// (group, topic) -> next offset to deliver
    committed: HashMap<(String, String), i64>,
    faults: HashMap<String, FaultPlan>,
    publish_attempts: HashMap<String, u64>,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    published: Notify,
    max_message_bytes: Option<usize>,
}

/// Single-partition, in-process [`Broker`] with per-topic failure injection
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Reject messages larger than `limit` bytes, like a real broker
    pub fn with_max_message_bytes(limit: usize) -> Self {
        Self::build(Some(limit))
    }

    fn build(max_message_bytes: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                published: Notify::new(),
                max_message_bytes,
            }),
        }
    }

    /// Every publish to `topic` fails until [`MemoryBroker::heal`]
    pub async fn fail_all_publishes(&self, topic: &str) {
        self.fault_plan(topic, |plan| plan.fail_all = true).await;
    }

    /// The next `count` publishes to `topic` fail
    pub async fn fail_next_publishes(&self, topic: &str, count: u32) {
        self.fault_plan(topic, |plan| plan.fail_next = count).await;
    }

    /// Publishes to `topic` with one of `keys` always fail
    pub async fn fail_publishes_for_keys(&self, topic: &str, keys: impl IntoIterator<Item = String>) {
        let keys: Vec<String> = keys.into_iter().collect();
        self.fault_plan(topic, move |plan| plan.fail_keys.extend(keys)).await;
    }

    pub async fn heal(&self, topic: &str) {
        self.inner.state.lock().await.faults.remove(topic);
    }

    async fn fault_plan(&self, topic: &str, update: impl FnOnce(&mut FaultPlan)) {
        let mut state = self.inner.state.lock().await;
        update(state.faults.entry(topic.to_string()).or_default());
    }

    /// Close the broker: subscriptions return `None` once they reach the end of their topics
    pub async fn close(&self) {
        self.inner.state.lock().await.closed = true;
        self.inner.published.notify_waiters();
    }

    /// Everything published to `topic`, in order
    pub async fn messages(&self, topic: &str) -> Vec<Delivery> {
        let state = self.inner.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(offset, stored)| delivery(topic, offset as i64, stored))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn message_count(&self, topic: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Publish calls against `topic`, failed ones included
    pub async fn publish_attempts(&self, topic: &str) -> u64 {
        self.inner
            .state
            .lock()
            .await
            .publish_attempts
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Next offset `group` will read from `topic`
    pub async fn committed_offset(&self, group: &str, topic: &str) -> Option<i64> {
        self.inner
            .state
            .lock()
            .await
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }
}

fn delivery(topic: &str, offset: i64, stored: &Stored) -> Delivery {
    Delivery {
        topic: topic.to_string(),
        partition: 0,
        offset,
        key: Some(stored.key.clone()),
        payload: stored.payload.clone(),
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if let Some(limit) = self.inner.max_message_bytes {
            if payload.len() > limit {
                return Err(BrokerError::MessageTooLarge {
                    size: payload.len(),
                    limit,
                });
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            *state.publish_attempts.entry(topic.to_string()).or_default() += 1;

            if let Some(plan) = state.faults.get_mut(topic) {
                let injected = if plan.fail_all || plan.fail_keys.contains(key) {
                    true
                } else if plan.fail_next > 0 {
                    plan.fail_next -= 1;
                    true
                } else {
                    false
                };
                if injected {
                    return Err(BrokerError::Publish {
                        topic: topic.to_string(),
                        reason: "injected failure".to_string(),
                    });
                }
            }

            state.topics.entry(topic.to_string()).or_default().push(Stored {
                key: key.to_string(),
                payload: payload.to_vec(),
            });
        }

        self.inner.published.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
        group: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        if topics.is_empty() {
            return Err(BrokerError::Config("subscription needs at least one topic".into()));
        }

        let state = self.inner.state.lock().await;
        let positions = topics
            .iter()
            .map(|topic| {
                let start = state
                    .committed
                    .get(&(group.to_string(), topic.clone()))
                    .copied()
                    .unwrap_or(0);
                (topic.clone(), start)
            })
            .collect();

        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            group: group.to_string(),
            topics: topics.to_vec(),
            positions,
        }))
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    group: String,
    topics: Vec<String>,
    positions: HashMap<String, i64>,
}

impl MemorySubscription {
    fn poll(&mut self, state: &State) -> Option<Delivery> {
        for topic in &self.topics {
            let position = self.positions.get(topic).copied().unwrap_or(0);
            let next = state
                .topics
                .get(topic)
                .and_then(|log| log.get(position as usize));
            if let Some(stored) = next {
                let delivery = delivery(topic, position, stored);
                self.positions.insert(topic.clone(), position + 1);
                return Some(delivery);
            }
        }
        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            let inner = Arc::clone(&self.inner);
            let notified = inner.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = inner.state.lock().await;
                if let Some(delivery) = self.poll(&state) {
                    return Ok(Some(delivery));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    async fn commit(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        let entry = state
            .committed
            .entry((self.group.clone(), delivery.topic.clone()))
            .or_insert(0);
        *entry = (*entry).max(delivery.offset + 1);
        Ok(())
    }
}
