use super::builder::CircuitRequest;
use super::crypto::{E2eSession, EphemeralKeyPair, LayerCipher, SessionKeys};
use crate::peer::PeerInfo;
use crate::protocol::Cookie;
use hiddentunnel_common::ServiceId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

/// Circuit identifier, meaningful only together with the peer it is used with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitId(pub u32);

impl CircuitId {
    pub fn generate() -> Self {
        use rand::Rng;
        // zero is never handed out so it can't be mistaken for "unset"
        Self(rand::thread_rng().gen_range(1..=u32::MAX))
    }
}

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circuit({})", self.0)
    }
}

/// What a circuit is used for once ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitType {
    /// General purpose circuit ending at an exit
    Data,

    /// Seeder's circuit to its introduction point
    IpSeeder,

    /// Downloader's circuit to someone else's introduction point
    IpDownloader,

    /// Seeder's half of an end-to-end link
    RpSeeder,

    /// Downloader's half of an end-to-end link
    RpDownloader,
}

impl CircuitType {
    pub fn is_rendezvous(&self) -> bool {
        matches!(self, Self::RpSeeder | Self::RpDownloader)
    }
}

impl std::fmt::Display for CircuitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Data => "DATA",
            Self::IpSeeder => "IP_SEEDER",
            Self::IpDownloader => "IP_DOWNLOADER",
            Self::RpSeeder => "RP_SEEDER",
            Self::RpDownloader => "RP_DOWNLOADER",
        };
        f.write_str(name)
    }
}

/// State of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Handshakes are still in flight
    Extending,

    /// Every hop is in place
    Ready,

    /// Failed or torn down, about to be removed
    Broken,
}

/// One hop of a locally originated circuit
#[derive(Debug, Clone)]
pub struct Hop {
    pub peer: PeerInfo,

    pub keys: SessionKeys,

    /// Peers this hop offered as the next extension
    pub candidates: Vec<PeerInfo>,
}

/// Handshake in flight for the next hop
#[derive(Debug)]
pub(crate) struct PendingHop {
    pub peer: PeerInfo,
    pub keypair: EphemeralKeyPair,
    pub identifier: u32,
    pub deadline: Instant,
}

/// Why a hop could not be appended
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HopError {
    #[error("circuit already has its goal of {0} hops")]
    GoalReached(usize),

    #[error("peer is already part of the circuit")]
    DuplicatePeer,
}

/// A locally originated onion path
#[derive(Debug)]
pub struct Circuit {
    pub id: CircuitId,

    pub ctype: CircuitType,

    pub state: CircuitState,

    /// Ready once `hops.len() == goal_hops`
    pub goal_hops: usize,

    hops: Vec<Hop>,

    /// Peer fixed as the final hop
    pub required_exit: Option<PeerInfo>,

    /// Service this circuit works for, if any
    pub service_id: Option<ServiceId>,

    /// Rendezvous cookie of RP circuits
    pub cookie: Option<Cookie>,

    /// End-to-end layer once a rendezvous link is up
    pub(crate) e2e: Option<E2eSession>,

    /// Set when the rendezvous point confirmed the link
    pub linked: bool,

    pub(crate) pending: Option<PendingHop>,

    pub(crate) request: CircuitRequest,

    pub integrity_failures: u32,

    pub bytes_sent: u64,

    pub bytes_received: u64,

    pub created_at: Instant,
}

impl Circuit {
    pub(crate) fn new(id: CircuitId, request: CircuitRequest) -> Self {
        Self {
            id,
            ctype: request.ctype,
            state: CircuitState::Extending,
            goal_hops: request.goal_hops,
            hops: Vec::with_capacity(request.goal_hops),
            required_exit: request.required_exit,
            service_id: request.service_id,
            cookie: request.cookie,
            e2e: None,
            linked: false,
            pending: None,
            request,
            integrity_failures: 0,
            bytes_sent: 0,
            bytes_received: 0,
            created_at: Instant::now(),
        }
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.state == CircuitState::Ready
    }

    pub fn first_hop(&self) -> Option<&Hop> {
        self.hops.first()
    }

    pub fn last_hop(&self) -> Option<&Hop> {
        self.hops.last()
    }

    /// Address the circuit is reached through, i.e. hop 0
    pub fn first_hop_address(&self) -> Option<SocketAddr> {
        self.first_hop().map(|hop| hop.peer.address())
    }

    pub fn contains_peer(&self, address: SocketAddr) -> bool {
        self.hops.iter().any(|hop| hop.peer.address() == address)
    }

    /// Next hop still to be added is the final one
    pub fn next_is_last(&self) -> bool {
        self.hops.len() + 1 == self.goal_hops
    }

    /// Append a hop; returns true when this completed the circuit
    pub(crate) fn add_hop(&mut self, hop: Hop) -> Result<bool, HopError> {
        if self.hops.len() >= self.goal_hops {
            return Err(HopError::GoalReached(self.goal_hops));
        }
        if self.contains_peer(hop.peer.address()) {
            return Err(HopError::DuplicatePeer);
        }

        self.hops.push(hop);
        if self.hops.len() == self.goal_hops {
            self.state = CircuitState::Ready;
            self.pending = None;
            return Ok(true);
        }
        Ok(false)
    }

    /// Forward layers of hops `0..=target`, innermost (the target) first
    pub fn layers_to(&self, target: usize) -> Vec<&LayerCipher> {
        self.hops
            .iter()
            .take(target + 1)
            .rev()
            .map(|hop| &hop.keys.forward)
            .collect()
    }

    /// Forward layers through the whole path with the end-to-end layer innermost
    pub fn e2e_layers(&self) -> Option<Vec<&LayerCipher>> {
        let e2e = self.e2e.as_ref()?;
        let mut layers = vec![e2e.send_layer()];
        layers.extend(self.hops.iter().rev().map(|hop| &hop.keys.forward));
        Some(layers)
    }

    pub fn e2e(&self) -> Option<&E2eSession> {
        self.e2e.as_ref()
    }

    pub fn has_e2e(&self) -> bool {
        self.e2e.is_some()
    }

    pub fn mark_broken(&mut self) {
        self.state = CircuitState::Broken;
        self.pending = None;
    }

    pub fn add_sent(&mut self, bytes: u64) {
        self.bytes_sent += bytes;
    }

    pub fn add_received(&mut self, bytes: u64) {
        self.bytes_received += bytes;
    }
}
