pub mod circuit;
pub mod dht;
pub mod identity;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod runtime;
pub mod service;
pub mod transport;

pub use identity::{KeyPair, KeyPairError, NodeId, PublicKey};
pub use node::{RawData, RawDataHandler, TunnelNode};

// Re-export circuit types
pub use circuit::{
    Circuit, CircuitId, CircuitRequest, CircuitState, CircuitTable, CircuitType, Leg, RelayRoute,
    RelayStats,
};

pub use dht::{DhtKey, DhtProvider, MemoryDht, QueryId};
pub use peer::{Peer, PeerDirectory, PeerInfo};
pub use protocol::{CellMessage, Cookie, IntroRecord, Packet};
pub use runtime::{spawn_udp_node, NodeHandle};
pub use service::{IntroductionPoint, SwarmCallback};
pub use transport::{ChannelTransport, Datagram, Transport, UdpTransport};
