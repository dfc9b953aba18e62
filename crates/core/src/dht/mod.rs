/// DHT boundary of the tunnel node
///
/// The node only needs two operations from a DHT: publish a value under a key
/// and look a key up. Lookups are asynchronous; whoever drives the provider
/// hands results back through `TunnelNode::on_dht_values`, possibly in several
/// batches, possibly never.
mod storage;

pub use storage::{DhtStorage, StorageError, StoredValue};

use hiddentunnel_common::ServiceId;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::debug;

/// Key under which values are published
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DhtKey([u8; 32]);

impl DhtKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Key holding the introduction points of a service
    pub fn for_service(service_id: &ServiceId) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key("HIDDENTUNNEL-DHT-SERVICE-V1");
        hasher.update(service_id.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for DhtKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhtKey({})", hex::encode(&self.0[..8]))
    }
}

/// Correlates a `find` with the values that answer it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub u64);

/// Store/find oracle used for introduction point publication
pub trait DhtProvider: Send {
    fn store(&mut self, key: DhtKey, value: Vec<u8>);

    /// Start a lookup; results are delivered later under `query`
    fn find(&mut self, query: QueryId, key: DhtKey);
}

/// Lookup waiting to be answered by [`MemoryDht::resolve_pending`]
#[derive(Debug, Clone)]
pub struct PendingFind {
    pub requester: SocketAddr,
    pub query: QueryId,
    pub key: DhtKey,
}

#[derive(Debug)]
struct MemoryDhtInner {
    storage: DhtStorage,
    pending: VecDeque<PendingFind>,
}

/// Process-local DHT shared by any number of nodes
///
/// Every node gets its own handle (see [`MemoryDht::handle`]) so lookups
/// remember who asked. Lookups are queued rather than answered inline, which
/// keeps delivery under the control of whoever drives the nodes.
#[derive(Debug, Clone)]
pub struct MemoryDht {
    inner: Arc<Mutex<MemoryDhtInner>>,
    owner: Option<SocketAddr>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryDhtInner {
                storage: DhtStorage::new(1024),
                pending: VecDeque::new(),
            })),
            owner: None,
        }
    }

    /// Handle for one node sharing this DHT
    pub fn handle(&self, owner: SocketAddr) -> Self {
        Self {
            inner: self.inner.clone(),
            owner: Some(owner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryDhtInner> {
        // a panicking test thread must not wedge the other nodes
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Answer every queued lookup with the values stored right now
    pub fn resolve_pending(&self) -> Vec<(PendingFind, Vec<Vec<u8>>)> {
        let mut inner = self.lock();
        let now = Instant::now();
        let pending: Vec<PendingFind> = inner.pending.drain(..).collect();
        pending
            .into_iter()
            .map(|find| {
                let values = inner.storage.get(&find.key, now);
                (find, values)
            })
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    pub fn values(&self, key: &DhtKey) -> Vec<Vec<u8>> {
        self.lock().storage.get(key, Instant::now())
    }
}

impl Default for MemoryDht {
    fn default() -> Self {
        Self::new()
    }
}

impl DhtProvider for MemoryDht {
    fn store(&mut self, key: DhtKey, value: Vec<u8>) {
        let owner = self.owner;
        if let Err(e) = self.lock().storage.store(key, StoredValue::new(value, owner)) {
            debug!(?key, "DHT store rejected: {}", e);
        }
    }

    fn find(&mut self, query: QueryId, key: DhtKey) {
        let Some(requester) = self.owner else {
            debug!(?key, "Lookup on a MemoryDht without owner dropped");
            return;
        };
        self.lock().pending.push_back(PendingFind {
            requester,
            query,
            key,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_keys_are_distinct() {
        let a = DhtKey::for_service(&ServiceId::from([b'a'; 20]));
        let b = DhtKey::for_service(&ServiceId::from([b'b'; 20]));
        assert_ne!(a, b);
        assert_eq!(a, DhtKey::for_service(&ServiceId::from([b'a'; 20])));
    }

    #[test]
    fn test_handles_share_storage() {
        let dht = MemoryDht::new();
        let mut seeder = dht.handle("127.0.0.1:1".parse().unwrap());
        let mut downloader = dht.handle("127.0.0.1:2".parse().unwrap());
        let key = DhtKey::for_service(&ServiceId::from([0u8; 20]));

        downloader.find(QueryId(1), key);
        seeder.store(key, b"record".to_vec());
        assert!(dht.has_pending());

        let resolved = dht.resolve_pending();
        assert_eq!(resolved.len(), 1);
        let (find, values) = &resolved[0];
        assert_eq!(find.requester, "127.0.0.1:2".parse().unwrap());
        assert_eq!(find.query, QueryId(1));
        assert_eq!(values, &vec![b"record".to_vec()]);
        assert!(!dht.has_pending());
    }

    #[test]
    fn test_empty_lookup_still_resolves() {
        let dht = MemoryDht::new();
        let mut node = dht.handle("127.0.0.1:3".parse().unwrap());
        node.find(QueryId(7), DhtKey::from_bytes([9; 32]));

        let resolved = dht.resolve_pending();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].1.is_empty());
    }
}
