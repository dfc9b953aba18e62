use super::{Peer, PeerInfo};
use hiddentunnel_common::{PeerFlags, ServiceId};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

/// What we know about one verified peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub info: PeerInfo,

    /// When the peer was verified (or re-verified)
    pub verified_at: Instant,

    /// Last time we received a packet from this peer
    pub last_activity: Instant,

    pub bytes_sent: u64,

    pub bytes_received: u64,
}

impl PeerRecord {
    pub fn new(info: PeerInfo) -> Self {
        let now = Instant::now();
        Self {
            info,
            verified_at: now,
            last_activity: now,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Record bytes sent
    pub fn add_sent(&mut self, bytes: u64) {
        self.bytes_sent += bytes;
    }

    /// Record bytes received
    pub fn add_received(&mut self, bytes: u64) {
        self.bytes_received += bytes;
        self.last_activity = Instant::now();
    }
}

/// Verified peers known to this node
///
/// Fed by the discovery substrate through `add_verified_peer`. Peers are keyed
/// by address because that is how packets identify them.
#[derive(Debug)]
pub struct PeerDirectory {
    /// Our own address, never stored as a peer
    local: SocketAddr,

    peers: HashMap<SocketAddr, PeerRecord>,

    /// Peers announced as participating in a service
    service_peers: HashMap<ServiceId, HashSet<SocketAddr>>,
}

impl PeerDirectory {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            service_peers: HashMap::new(),
        }
    }

    /// Add or refresh a verified peer; returns false for ourselves
    pub fn add_verified_peer(&mut self, info: PeerInfo) -> bool {
        if info.address() == self.local {
            return false;
        }

        match self.peers.get_mut(&info.address()) {
            Some(record) => {
                record.info = info;
                record.verified_at = Instant::now();
            }
            None => {
                self.peers.insert(info.address(), PeerRecord::new(info));
            }
        }
        true
    }

    /// Remove a peer, forgetting its service participation too
    pub fn remove(&mut self, address: &SocketAddr) -> Option<PeerRecord> {
        for peers in self.service_peers.values_mut() {
            peers.remove(address);
        }
        self.service_peers.retain(|_, peers| !peers.is_empty());
        self.peers.remove(address)
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&PeerInfo> {
        self.peers.get(address).map(|record| &record.info)
    }

    pub fn get_mut(&mut self, address: &SocketAddr) -> Option<&mut PeerRecord> {
        self.peers.get_mut(address)
    }

    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.peers.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn verified_peers(&self) -> Vec<PeerInfo> {
        self.peers.values().map(|record| record.info).collect()
    }

    /// Verified peers advertising `flags`, minus the excluded addresses
    pub fn candidates(&self, flags: PeerFlags, exclude: &HashSet<SocketAddr>) -> Vec<PeerInfo> {
        self.peers
            .values()
            .map(|record| record.info)
            .filter(|info| info.flags.contains(flags) && !exclude.contains(&info.address()))
            .collect()
    }

    /// Remember that `peer` takes part in `service_id`
    pub fn add_service_peer(&mut self, service_id: ServiceId, peer: Peer) -> bool {
        if peer.address == self.local {
            return false;
        }
        self.service_peers
            .entry(service_id)
            .or_default()
            .insert(peer.address)
    }

    pub fn is_service_peer(&self, service_id: &ServiceId, address: &SocketAddr) -> bool {
        self.service_peers
            .get(service_id)
            .map(|peers| peers.contains(address))
            .unwrap_or(false)
    }

    pub fn service_peers(&self, service_id: &ServiceId) -> Vec<SocketAddr> {
        self.service_peers
            .get(service_id)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Get statistics about known peers
    pub fn stats(&self) -> PeerDirectoryStats {
        PeerDirectoryStats {
            total_peers: self.peers.len(),
            relays: self.peers.values().filter(|r| r.info.can_relay()).count(),
            exits: self.peers.values().filter(|r| r.info.can_exit()).count(),
            total_bytes_sent: self.peers.values().map(|r| r.bytes_sent).sum(),
            total_bytes_received: self.peers.values().map(|r| r.bytes_received).sum(),
        }
    }
}

/// Statistics about the peer directory
#[derive(Debug, Clone)]
pub struct PeerDirectoryStats {
    pub total_peers: usize,
    pub relays: usize,
    pub exits: usize,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn create_test_peer(port: u16, flags: PeerFlags) -> PeerInfo {
        PeerInfo::new(KeyPair::generate().public_key(), addr(port), flags)
    }

    #[test]
    fn test_add_verified_peer() {
        let mut directory = PeerDirectory::new(addr(1));

        assert!(directory.add_verified_peer(create_test_peer(2, PeerFlags::RELAY)));
        assert!(!directory.add_verified_peer(create_test_peer(1, PeerFlags::RELAY)));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_reverification_updates_flags() {
        let mut directory = PeerDirectory::new(addr(1));
        let mut peer = create_test_peer(2, PeerFlags::RELAY);
        directory.add_verified_peer(peer);

        peer.flags = PeerFlags::RELAY | PeerFlags::EXIT;
        directory.add_verified_peer(peer);

        assert_eq!(directory.len(), 1);
        assert!(directory.get(&addr(2)).unwrap().can_exit());
    }

    #[test]
    fn test_candidates_filter_flags_and_exclusions() {
        let mut directory = PeerDirectory::new(addr(1));
        directory.add_verified_peer(create_test_peer(2, PeerFlags::RELAY));
        directory.add_verified_peer(create_test_peer(3, PeerFlags::RELAY | PeerFlags::EXIT));
        directory.add_verified_peer(create_test_peer(4, PeerFlags::NONE));

        let none = HashSet::new();
        assert_eq!(directory.candidates(PeerFlags::RELAY, &none).len(), 2);
        assert_eq!(directory.candidates(PeerFlags::EXIT, &none).len(), 1);

        let exclude: HashSet<_> = [addr(3)].into_iter().collect();
        let relays = directory.candidates(PeerFlags::RELAY, &exclude);
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].address(), addr(2));
    }

    #[test]
    fn test_remove_forgets_service_participation() {
        let mut directory = PeerDirectory::new(addr(1));
        let peer = create_test_peer(2, PeerFlags::RELAY);
        let service = ServiceId::from([0u8; 20]);
        directory.add_verified_peer(peer);
        assert!(directory.add_service_peer(service, peer.peer));
        assert!(!directory.add_service_peer(service, peer.peer));
        assert!(directory.is_service_peer(&service, &addr(2)));

        assert!(directory.remove(&addr(2)).is_some());
        assert!(!directory.is_service_peer(&service, &addr(2)));
        assert!(directory.service_peers(&service).is_empty());
    }

    #[test]
    fn test_directory_stats() {
        let mut directory = PeerDirectory::new(addr(1));
        for port in 2..7 {
            directory.add_verified_peer(create_test_peer(port, PeerFlags::RELAY));
        }
        directory.add_verified_peer(create_test_peer(7, PeerFlags::EXIT));
        directory.get_mut(&addr(2)).unwrap().add_sent(10);

        let stats = directory.stats();
        assert_eq!(stats.total_peers, 6);
        assert_eq!(stats.relays, 5);
        assert_eq!(stats.exits, 1);
        assert_eq!(stats.total_bytes_sent, 10);
    }
}
