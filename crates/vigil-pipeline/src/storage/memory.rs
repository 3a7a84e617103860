use super::{ObjectStore, PutOptions, StorageError, StoredObject};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    content_length: u64,
    content_type: Option<String>,
    metadata: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Entry>,
    put_failures_remaining: u32,
    puts_fail_always: bool,
    put_calls: u64,
}

/// In-process [`ObjectStore`] with failure injection, for tests and local runs
#[derive(Clone)]
pub struct MemoryStore {
    bucket: String,
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Fail the next `count` puts with a retryable backend error
    pub async fn fail_next_puts(&self, count: u32) {
        self.state.lock().await.put_failures_remaining = count;
    }

    /// Fail every put until [`MemoryStore::heal`] is called
    pub async fn fail_all_puts(&self) {
        self.state.lock().await.puts_fail_always = true;
    }

    pub async fn heal(&self) {
        let mut state = self.state.lock().await;
        state.puts_fail_always = false;
        state.put_failures_remaining = 0;
    }

    /// Replace the stored bytes of `key` without touching its recorded length or metadata
    pub async fn corrupt(&self, key: &str, bytes: Vec<u8>) -> bool {
        match self.state.lock().await.objects.get_mut(key) {
            Some(entry) => {
                entry.bytes = bytes;
                true
            },
            None => false,
        }
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.state.lock().await.objects.remove(key).is_some()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().await.objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .objects
            .get(key)
            .map(|entry| entry.bytes.clone())
    }

    /// Number of put calls, failed ones included
    pub async fn put_calls(&self) -> u64 {
        self.state.lock().await.put_calls
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, bytes: &[u8], options: PutOptions) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.put_calls += 1;

        if state.puts_fail_always {
            return Err(StorageError::Backend(format!("injected failure storing {key}")));
        }
        if state.put_failures_remaining > 0 {
            state.put_failures_remaining -= 1;
            return Err(StorageError::Backend(format!("injected failure storing {key}")));
        }

        state.objects.insert(
            key.to_string(),
            Entry {
                bytes: bytes.to_vec(),
                content_length: bytes.len() as u64,
                content_type: options.content_type,
                metadata: options.metadata,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredObject, StorageError> {
        let state = self.state.lock().await;
        let entry = state
            .objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        Ok(StoredObject {
            bytes: entry.bytes.clone(),
            content_length: Some(entry.content_length),
            content_type: entry.content_type.clone(),
            metadata: entry.metadata.clone(),
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.state.lock().await.objects.contains_key(key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_and_injected_failures() {
        let store = MemoryStore::new("vigil");
        store.fail_next_puts(1).await;

        let err = store
            .put("a", b"one", PutOptions::content_type("text/plain"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));

        store
            .put("a", b"one", PutOptions::content_type("text/plain"))
            .await
            .unwrap();
        let object = store.get("a").await.unwrap();
        assert_eq!(object.bytes, b"one");
        assert_eq!(object.content_length, Some(3));
        assert_eq!(store.put_calls().await, 2);

        assert!(matches!(store.get("b").await, Err(StorageError::NotFound(_))));
        assert!(!store.exists("b").await.unwrap());
    }
}
