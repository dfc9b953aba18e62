mod directory;

pub use directory::{PeerDirectory, PeerDirectoryStats, PeerRecord};

use crate::identity::{NodeId, PublicKey};
use hiddentunnel_common::PeerFlags;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A peer as it is addressed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: PublicKey,
    pub address: SocketAddr,
}

impl Peer {
    pub fn new(public_key: PublicKey, address: SocketAddr) -> Self {
        Self {
            public_key,
            address,
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.node_id().short_hex(), self.address)
    }
}

/// A peer together with the capabilities it advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer: Peer,
    pub flags: PeerFlags,
}

impl PeerInfo {
    pub fn new(public_key: PublicKey, address: SocketAddr, flags: PeerFlags) -> Self {
        Self {
            peer: Peer::new(public_key, address),
            flags,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.peer.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.peer.public_key
    }

    pub fn can_relay(&self) -> bool {
        self.flags.contains(PeerFlags::RELAY)
    }

    pub fn can_exit(&self) -> bool {
        self.flags.contains(PeerFlags::EXIT)
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.peer, self.flags)
    }
}
