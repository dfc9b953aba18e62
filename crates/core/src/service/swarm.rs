use crate::circuit::crypto::EphemeralKeyPair;
use crate::identity::{KeyPair, PublicKey};
use crate::peer::{Peer, PeerInfo};
use crate::protocol::Cookie;
use hiddentunnel_common::{Result, ServiceId, TunnelError};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::debug;

/// A relay listening for rendezvous requests on behalf of a seeder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntroductionPoint {
    pub relay: Peer,
    pub seeder_key: PublicKey,
}

impl IntroductionPoint {
    pub fn new(relay: Peer, seeder_key: PublicKey) -> Self {
        Self { relay, seeder_key }
    }
}

impl std::fmt::Display for IntroductionPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} via {}", self.seeder_key, self.relay)
    }
}

/// Fired once with the first introduction point of a swarm
pub type SwarmCallback = Box<dyn FnOnce(IntroductionPoint) + Send>;

/// What this node does in a swarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwarmRole {
    pub seeding: bool,
    pub downloading: bool,
}

impl SwarmRole {
    fn merge(&mut self, other: SwarmRole) {
        self.seeding |= other.seeding;
        self.downloading |= other.downloading;
    }
}

/// Downloader-side progress of one rendezvous
#[derive(Debug)]
pub struct RendezvousAttempt {
    pub cookie: Cookie,

    /// Relay where both circuits meet
    pub rendezvous: PeerInfo,

    /// Introduction point the request goes through
    pub intro: IntroductionPoint,

    /// Our half of the end-to-end exchange, consumed once linked
    pub(crate) e2e_key: Option<EphemeralKeyPair>,

    pub e2e_public: [u8; 32],

    /// The rendezvous relay registered our cookie
    pub established: bool,

    /// The request went out through the introduction point
    pub requested: bool,

    /// The seeder's circuit is linked to ours
    pub linked: bool,

    pub started_at: Instant,
}

impl RendezvousAttempt {
    /// Still unlinked after `timeout`
    pub fn is_expired(&self, now: Instant, timeout: std::time::Duration) -> bool {
        !self.linked && now.saturating_duration_since(self.started_at) >= timeout
    }
}

/// Per-service state
pub struct Swarm {
    pub service_id: ServiceId,

    /// Hop count of the circuits built for this swarm
    pub hops: usize,

    pub role: SwarmRole,

    seeder_keypair: Option<KeyPair>,

    intro_points: HashSet<IntroductionPoint>,

    callbacks: Vec<SwarmCallback>,

    pub rendezvous: Option<RendezvousAttempt>,
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("service_id", &self.service_id)
            .field("hops", &self.hops)
            .field("role", &self.role)
            .field("intro_points", &self.intro_points.len())
            .field("pending_callbacks", &self.callbacks.len())
            .field("rendezvous", &self.rendezvous)
            .finish()
    }
}

impl Swarm {
    fn new(service_id: ServiceId, hops: usize) -> Self {
        Self {
            service_id,
            hops,
            role: SwarmRole::default(),
            seeder_keypair: None,
            intro_points: HashSet::new(),
            callbacks: Vec::new(),
            rendezvous: None,
        }
    }

    pub fn is_seeding(&self) -> bool {
        self.role.seeding
    }

    pub fn is_downloading(&self) -> bool {
        self.role.downloading
    }

    pub fn seeder_keypair(&self) -> Option<&KeyPair> {
        self.seeder_keypair.as_ref()
    }

    pub fn seeder_key(&self) -> Option<PublicKey> {
        self.seeder_keypair.as_ref().map(KeyPair::public_key)
    }

    pub fn intro_points(&self) -> impl Iterator<Item = &IntroductionPoint> {
        self.intro_points.iter()
    }

    pub fn intro_point_count(&self) -> usize {
        self.intro_points.len()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Register a discovered introduction point
    ///
    /// Returns `Ok(true)` if it was new. Our own seeder key and introduction
    /// points hosted by ourselves are refused: a node must never discover
    /// itself as a counterparty.
    pub fn add_intro_point(&mut self, ip: IntroductionPoint, local: SocketAddr) -> Result<bool> {
        if self.seeder_key() == Some(ip.seeder_key) || ip.relay.address == local {
            return Err(TunnelError::SelfIntroductionRejected);
        }
        if !self.intro_points.insert(ip) {
            return Ok(false);
        }

        debug!(
            "Swarm {} learned introduction point {}",
            self.service_id, ip
        );
        for callback in self.callbacks.drain(..) {
            callback(ip);
        }
        Ok(true)
    }

    /// Register a callback; fires now if an introduction point is known
    pub fn add_callback(&mut self, callback: SwarmCallback) {
        match self.intro_points.iter().next() {
            Some(ip) => callback(*ip),
            None => self.callbacks.push(callback),
        }
    }

    pub fn remove_intro_points_at(&mut self, relay: SocketAddr) -> usize {
        let before = self.intro_points.len();
        self.intro_points.retain(|ip| ip.relay.address != relay);
        before - self.intro_points.len()
    }
}

/// All swarms of one node
#[derive(Debug, Default)]
pub struct SwarmRegistry {
    swarms: HashMap<ServiceId, Swarm>,
}

impl SwarmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update the swarm of `service_id`
    ///
    /// Joining again merges roles instead of duplicating the swarm. A seeder
    /// key is generated the first time the node seeds.
    pub fn join(
        &mut self,
        service_id: ServiceId,
        hops: usize,
        seeding: bool,
        callback: Option<SwarmCallback>,
    ) -> &mut Swarm {
        let role = SwarmRole {
            seeding,
            downloading: !seeding || callback.is_some(),
        };

        let swarm = self
            .swarms
            .entry(service_id)
            .or_insert_with(|| Swarm::new(service_id, hops));
        swarm.role.merge(role);
        if swarm.role.seeding && swarm.seeder_keypair.is_none() {
            swarm.seeder_keypair = Some(KeyPair::generate());
        }
        if let Some(callback) = callback {
            swarm.add_callback(callback);
        }
        swarm
    }

    pub fn leave(&mut self, service_id: &ServiceId) -> Option<Swarm> {
        self.swarms.remove(service_id)
    }

    pub fn get(&self, service_id: &ServiceId) -> Option<&Swarm> {
        self.swarms.get(service_id)
    }

    pub fn get_mut(&mut self, service_id: &ServiceId) -> Option<&mut Swarm> {
        self.swarms.get_mut(service_id)
    }

    pub fn contains(&self, service_id: &ServiceId) -> bool {
        self.swarms.contains_key(service_id)
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.swarms.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Swarm> {
        self.swarms.values()
    }

    pub fn len(&self) -> usize {
        self.swarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swarms.is_empty()
    }

    pub fn clear(&mut self) {
        self.swarms.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const LOCAL: &str = "127.0.0.1:1000";

    fn service() -> ServiceId {
        ServiceId::from([b'0'; 20])
    }

    fn intro_point(port: u16) -> IntroductionPoint {
        IntroductionPoint::new(
            Peer::new(
                KeyPair::generate().public_key(),
                SocketAddr::from(([127, 0, 0, 1], port)),
            ),
            KeyPair::generate().public_key(),
        )
    }

    fn counting_callback(counter: &Arc<AtomicUsize>) -> SwarmCallback {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_join_merges_roles() {
        let mut registry = SwarmRegistry::new();
        registry.join(service(), 1, true, None);
        let key = registry.get(&service()).unwrap().seeder_key().unwrap();
        assert!(!registry.get(&service()).unwrap().is_downloading());

        let counter = Arc::new(AtomicUsize::new(0));
        let swarm = registry.join(service(), 1, true, Some(counting_callback(&counter)));
        assert!(swarm.is_seeding());
        assert!(swarm.is_downloading());
        // seeder key survives re-joining
        assert_eq!(swarm.seeder_key(), Some(key));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_downloader_has_no_seeder_key() {
        let mut registry = SwarmRegistry::new();
        let swarm = registry.join(service(), 1, false, None);
        assert!(swarm.is_downloading());
        assert!(swarm.seeder_key().is_none());
    }

    #[test]
    fn test_callback_fires_once() {
        let mut registry = SwarmRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let swarm = registry.join(service(), 1, false, Some(counting_callback(&counter)));
        let local = LOCAL.parse().unwrap();

        for port in 2000..2005 {
            assert!(swarm.add_intro_point(intro_point(port), local).unwrap());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(swarm.pending_callbacks(), 0);
    }

    #[test]
    fn test_callbacks_registered_twice_both_fire() {
        let mut registry = SwarmRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.join(service(), 1, false, Some(counting_callback(&counter)));
        let swarm = registry.join(service(), 1, false, Some(counting_callback(&counter)));

        swarm
            .add_intro_point(intro_point(2000), LOCAL.parse().unwrap())
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_late_callback_fires_immediately() {
        let mut registry = SwarmRegistry::new();
        let swarm = registry.join(service(), 1, false, None);
        swarm
            .add_intro_point(intro_point(2000), LOCAL.parse().unwrap())
            .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        registry.join(service(), 1, false, Some(counting_callback(&counter)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_intro_points_collapse() {
        let mut registry = SwarmRegistry::new();
        let swarm = registry.join(service(), 1, false, None);
        let ip = intro_point(2000);
        let local = LOCAL.parse().unwrap();

        assert!(swarm.add_intro_point(ip, local).unwrap());
        assert!(!swarm.add_intro_point(ip, local).unwrap());
        assert_eq!(swarm.intro_point_count(), 1);
    }

    #[test]
    fn test_self_introduction_rejected() {
        let mut registry = SwarmRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let swarm = registry.join(service(), 1, true, Some(counting_callback(&counter)));
        let own_key = swarm.seeder_key().unwrap();
        let local: SocketAddr = LOCAL.parse().unwrap();

        let mut own = intro_point(2000);
        own.seeder_key = own_key;
        assert!(matches!(
            swarm.add_intro_point(own, local),
            Err(TunnelError::SelfIntroductionRejected)
        ));

        let mut hosted_here = intro_point(2001);
        hosted_here.relay.address = local;
        assert!(matches!(
            swarm.add_intro_point(hosted_here, local),
            Err(TunnelError::SelfIntroductionRejected)
        ));

        assert_eq!(swarm.intro_point_count(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
