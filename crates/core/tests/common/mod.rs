// In-process overlay used by the integration tests: every node sends into one
// shared queue and lookups go to MemoryDht instances that are resolved only
// once the queue is empty.

#![allow(dead_code)]

use hiddentunnel_common::{PeerFlags, ServiceId, TunnelSettings};
use hiddentunnel_core::{
    ChannelTransport, Datagram, KeyPair, MemoryDht, Packet, RawData, SwarmCallback, TunnelNode,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use tokio::sync::mpsc;

const MAX_ROUNDS: usize = 10_000;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub struct SimNetwork {
    pub nodes: Vec<TunnelNode>,
    pub received: Vec<Arc<Mutex<Vec<RawData>>>>,
    dhts: Vec<MemoryDht>,
    tx: mpsc::UnboundedSender<Datagram>,
    rx: mpsc::UnboundedReceiver<Datagram>,
    next_port: u16,
}

impl SimNetwork {
    pub fn new() -> Self {
        init_tracing();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            nodes: Vec::new(),
            received: Vec::new(),
            dhts: vec![MemoryDht::new()],
            tx,
            rx,
            next_port: 20000,
        }
    }

    /// Network of `flags.len()` nodes that all know each other
    pub fn with_nodes(flags: &[PeerFlags]) -> Self {
        let mut net = Self::new();
        for flags in flags {
            net.add_node(*flags);
        }
        net.introduce_nodes();
        net
    }

    pub fn dht(&self) -> &MemoryDht {
        &self.dhts[0]
    }

    pub fn add_node(&mut self, flags: PeerFlags) -> usize {
        let dht = self.dhts[0].clone();
        self.add_node_with_dht(flags, dht)
    }

    /// Node using its own DHT, so it can only learn through PEX
    pub fn add_isolated_node(&mut self, flags: PeerFlags) -> usize {
        let dht = MemoryDht::new();
        self.dhts.push(dht.clone());
        self.add_node_with_dht(flags, dht)
    }

    fn add_node_with_dht(&mut self, flags: PeerFlags, dht: MemoryDht) -> usize {
        let address = SocketAddr::from(([127, 0, 0, 1], self.next_port));
        self.next_port += 1;

        let settings = TunnelSettings::default().with_peer_flags(flags);
        let mut node = TunnelNode::new(
            KeyPair::generate(),
            address,
            settings,
            Box::new(ChannelTransport::new(address, self.tx.clone())),
            Box::new(dht.handle(address)),
        );

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        node.set_raw_data_handler(move |data| sink.lock().unwrap().push(data));

        self.nodes.push(node);
        self.received.push(received);
        self.nodes.len() - 1
    }

    /// Make every node a verified peer of every other node
    pub fn introduce_nodes(&mut self) {
        let infos: Vec<_> = self.nodes.iter().map(|node| node.peer_info()).collect();
        for node in &mut self.nodes {
            for info in &infos {
                if info.address() != node.address() {
                    node.add_verified_peer(info.peer, info.flags);
                }
            }
        }
    }

    pub fn address(&self, index: usize) -> SocketAddr {
        self.nodes[index].address()
    }

    pub fn index_of(&self, address: SocketAddr) -> Option<usize> {
        self.nodes.iter().position(|node| node.address() == address)
    }

    /// Deliver packets and DHT answers until the network is quiet
    pub fn deliver_messages(&mut self) {
        self.deliver_messages_dropping(|_| false);
    }

    /// Like `deliver_messages`, but packets matching `lost` vanish on the
    /// way. Returns how many were lost.
    pub fn deliver_messages_dropping(&mut self, mut lost: impl FnMut(&Datagram) -> bool) -> usize {
        let mut dropped = 0;
        for _ in 0..MAX_ROUNDS {
            if let Ok(datagram) = self.rx.try_recv() {
                if lost(&datagram) {
                    dropped += 1;
                    continue;
                }
                if let Some(index) = self.index_of(datagram.destination) {
                    self.nodes[index].on_packet(datagram.source, &datagram.payload);
                }
                continue;
            }

            let mut resolved = Vec::new();
            for dht in &self.dhts {
                resolved.extend(dht.resolve_pending());
            }
            if resolved.is_empty() {
                return dropped;
            }
            for (find, values) in resolved {
                if let Some(index) = self.index_of(find.requester) {
                    self.nodes[index].on_dht_values(find.query, values);
                }
            }
        }
        panic!("network did not settle after {} rounds", MAX_ROUNDS);
    }

    /// Seed `service_id` from `index` and let its introduction point settle
    pub fn create_intro(&mut self, index: usize, service_id: ServiceId, hops: usize) {
        self.nodes[index]
            .join_swarm(service_id, hops, None, true)
            .unwrap();
        self.deliver_messages();
    }

    /// Add an exit-capable node known only to node `index`
    pub fn assign_exit_node(&mut self, index: usize) -> usize {
        let exit = self.add_node(PeerFlags::RELAY | PeerFlags::EXIT);
        let info = self.nodes[exit].peer_info();
        self.nodes[index].add_verified_peer(info.peer, info.flags);
        self.nodes[index].build_tunnels(1);
        self.deliver_messages();
        exit
    }

    /// Nodes a cell sent on circuit `id` of node `index` passes through,
    /// following relay routes until a node that owns the circuit
    pub fn e2e_path(&self, index: usize, id: hiddentunnel_core::CircuitId) -> Vec<usize> {
        let mut path = vec![index];
        let Some(first) = self.nodes[index]
            .circuit(id)
            .and_then(|circuit| circuit.first_hop_address())
        else {
            return path;
        };

        let mut from = self.address(index);
        let mut at = first;
        let mut circuit_id = id;
        while let Some(node) = self.index_of(at) {
            path.push(node);
            if path.len() > self.nodes.len() {
                break;
            }
            match self.nodes[node].relay_route(from, circuit_id) {
                Some(route) => {
                    from = at;
                    at = route.to.address;
                    circuit_id = route.to.circuit_id;
                }
                None => break,
            }
        }
        path
    }

    pub fn received(&self, index: usize) -> Vec<RawData> {
        self.received[index].lock().unwrap().clone()
    }
}

/// Callback that counts how often it fired
pub fn counting_callback() -> (SwarmCallback, Arc<Mutex<usize>>) {
    let fired = Arc::new(Mutex::new(0));
    let counter = fired.clone();
    let callback: SwarmCallback = Box::new(move |_ip| *counter.lock().unwrap() += 1);
    (callback, fired)
}

pub fn is_cell(datagram: &Datagram) -> bool {
    matches!(
        hiddentunnel_core::protocol::decode::<Packet>(&datagram.payload),
        Ok(Packet::Cell { .. })
    )
}

pub fn service(byte: u8) -> ServiceId {
    ServiceId::from([byte; 20])
}
