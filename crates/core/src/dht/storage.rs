/// In-memory value storage backing [`super::MemoryDht`]
///
/// Keeps a bounded list of values per key, each with its own TTL.
use super::DhtKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Maximum number of values per key
const MAX_VALUES_PER_KEY: usize = 20;

/// Default value TTL (1 hour)
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Stored value with metadata
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub data: Vec<u8>,

    /// Node that published the value, if known
    pub publisher: Option<SocketAddr>,

    pub stored_at: Instant,

    pub ttl: Duration,
}

impl StoredValue {
    pub fn new(data: Vec<u8>, publisher: Option<SocketAddr>) -> Self {
        Self {
            data,
            publisher,
            stored_at: Instant::now(),
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }
}

/// Key/value storage
#[derive(Debug)]
pub struct DhtStorage {
    storage: HashMap<DhtKey, Vec<StoredValue>>,

    /// Maximum number of keys to store
    max_keys: usize,
}

impl DhtStorage {
    pub fn new(max_keys: usize) -> Self {
        Self {
            storage: HashMap::new(),
            max_keys,
        }
    }

    /// Store a value
    ///
    /// Storing identical bytes again refreshes the existing entry. A publisher
    /// may hold several distinct values under one key (one per introduction
    /// point); the oldest value is evicted once the key is full.
    pub fn store(&mut self, key: DhtKey, value: StoredValue) -> Result<(), StorageError> {
        if !self.storage.contains_key(&key) && self.storage.len() >= self.max_keys {
            return Err(StorageError::StorageFull);
        }

        let values = self.storage.entry(key).or_default();

        if let Some(existing) = values.iter_mut().find(|v| v.data == value.data) {
            *existing = value;
            return Ok(());
        }

        if values.len() >= MAX_VALUES_PER_KEY {
            if let Some((idx, _)) = values
                .iter()
                .enumerate()
                .min_by_key(|(_, v)| v.stored_at)
            {
                values.remove(idx);
            }
        }
        values.push(value);

        Ok(())
    }

    /// Live values for a key
    pub fn get(&self, key: &DhtKey, now: Instant) -> Vec<Vec<u8>> {
        self.storage
            .get(key)
            .map(|values| {
                values
                    .iter()
                    .filter(|v| !v.is_expired(now))
                    .map(|v| v.data.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove expired values, returning how many were dropped
    pub fn cleanup_expired(&mut self, now: Instant) -> usize {
        let mut removed_count = 0;

        for values in self.storage.values_mut() {
            let before = values.len();
            values.retain(|v| !v.is_expired(now));
            removed_count += before - values.len();
        }

        self.storage.retain(|_, v| !v.is_empty());

        removed_count
    }

    pub fn key_count(&self) -> usize {
        self.storage.len()
    }

    pub fn value_count(&self) -> usize {
        self.storage.values().map(|v| v.len()).sum()
    }
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage is full")]
    StorageFull,
}
