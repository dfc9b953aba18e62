/// Tunnel node
///
/// `TunnelNode` owns every piece of per-node state: the circuits it
/// originates, the legs it relays, its swarms and the introduction and
/// rendezvous roles it plays for others. It is driven from outside: feed it
/// packets with [`TunnelNode::on_packet`], DHT answers with
/// [`TunnelNode::on_dht_values`] and time with [`TunnelNode::on_tick`]. None of
/// its handlers block and none run concurrently, so nothing in here locks.
///
/// The protocol handlers live next to their state: circuit construction in
/// `circuit::builder`, introduction points in `service::introduction`,
/// discovery in `service::discovery` and rendezvous in `service::rendezvous`.

use crate::circuit::crypto::{LayerMarker, Peeled};
use crate::circuit::{
    Circuit, CircuitId, CircuitTable, CircuitType, E2eSession, Leg, RelayAction,
    RelayError, RelayRoute, RelayTable,
};
use crate::dht::{DhtProvider, QueryId};
use crate::identity::{KeyPair, NodeId, PublicKey};
use crate::peer::{Peer, PeerDirectory, PeerInfo};
use crate::protocol::{self, CellMessage, Cookie, IntroRecord, Packet, Signature64};
use crate::service::{IntroductionPoint, Swarm, SwarmRegistry};
use crate::transport::Transport;
use hiddentunnel_common::{PeerFlags, Result, ServiceId, TunnelError, TunnelSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Payload handed to the application when a data cell reaches its end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawData {
    /// Neighbour the cell arrived from
    pub source_address: SocketAddr,

    pub circuit_id: CircuitId,

    /// Application-level addresses announced by the sender
    pub source: SocketAddr,
    pub destination: SocketAddr,

    pub payload: Vec<u8>,
}

pub type RawDataHandler = Box<dyn FnMut(RawData) + Send>;

/// Introduction point this node hosts for a seeder
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeldIntroduction {
    pub service_id: ServiceId,

    /// Leg of the seeder's circuit
    pub leg: Leg,

    pub record: IntroRecord,
}

/// Seeder side of a rendezvous that is waiting for its circuit
#[derive(Debug)]
pub(crate) struct PendingLink {
    pub service_id: ServiceId,
    pub e2e: E2eSession,
    pub ephemeral_key: [u8; 32],
    pub signature: Signature64,
    pub created_at: Instant,
}

/// Work queued until a circuit to an introduction relay is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntroCircuitUse {
    Pex(ServiceId),
    Rendezvous(ServiceId),
}

/// One node of the overlay
pub struct TunnelNode {
    pub(crate) keypair: KeyPair,

    pub(crate) node_id: NodeId,

    pub(crate) address: SocketAddr,

    pub(crate) settings: TunnelSettings,

    pub(crate) transport: Box<dyn Transport>,

    pub(crate) dht: Box<dyn DhtProvider>,

    pub(crate) peers: PeerDirectory,

    /// Circuits we originate
    pub(crate) circuits: CircuitTable,

    /// Circuits we relay for others
    pub(crate) relays: RelayTable,

    pub(crate) swarms: SwarmRegistry,

    /// Introduction points hosted here, by seeder key
    pub(crate) intro_points_held: HashMap<PublicKey, HeldIntroduction>,

    /// Verified records learned through the DHT or PEX
    pub(crate) known_records: HashMap<ServiceId, HashMap<IntroductionPoint, IntroRecord>>,

    /// Rendezvous points hosted here, waiting for the seeder's circuit
    pub(crate) rendezvous_points: HashMap<Cookie, Leg>,

    pub(crate) pending_links: HashMap<Cookie, PendingLink>,

    /// Keyed by the introduction relay the circuit is being built to
    pub(crate) intro_waiters: HashMap<SocketAddr, Vec<IntroCircuitUse>>,

    /// Outstanding DHT lookups and their deadline
    pub(crate) dht_queries: HashMap<QueryId, (ServiceId, Instant)>,

    next_query: u64,

    raw_data_handler: Option<RawDataHandler>,

    running: bool,
}

impl std::fmt::Debug for TunnelNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelNode")
            .field("node_id", &self.node_id)
            .field("address", &self.address)
            .field("circuits", &self.circuits.len())
            .field("relays", &self.relays.stats())
            .field("swarms", &self.swarms.len())
            .field("running", &self.running)
            .finish()
    }
}

impl TunnelNode {
    pub fn new(
        keypair: KeyPair,
        address: SocketAddr,
        settings: TunnelSettings,
        transport: Box<dyn Transport>,
        dht: Box<dyn DhtProvider>,
    ) -> Self {
        let node_id = NodeId::from_public_key(&keypair.public_key());
        info!(
            "Tunnel node {} on {} ({})",
            node_id.short_hex(),
            address,
            settings.peer_flags
        );

        Self {
            keypair,
            node_id,
            address,
            relays: RelayTable::new(settings.max_integrity_failures),
            settings,
            transport,
            dht,
            peers: PeerDirectory::new(address),
            circuits: CircuitTable::new(),
            swarms: SwarmRegistry::new(),
            intro_points_held: HashMap::new(),
            known_records: HashMap::new(),
            rendezvous_points: HashMap::new(),
            pending_links: HashMap::new(),
            intro_waiters: HashMap::new(),
            dht_queries: HashMap::new(),
            next_query: 0,
            raw_data_handler: None,
            running: true,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// How other nodes address us
    pub fn peer(&self) -> Peer {
        Peer::new(self.keypair.public_key(), self.address)
    }

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            peer: self.peer(),
            flags: self.settings.peer_flags,
        }
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// Add a peer that the discovery layer has verified
    pub fn add_verified_peer(&mut self, peer: Peer, flags: PeerFlags) -> bool {
        self.peers.add_verified_peer(PeerInfo { peer, flags })
    }

    pub fn set_raw_data_handler(&mut self, handler: impl FnMut(RawData) + Send + 'static) {
        self.raw_data_handler = Some(Box::new(handler));
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn circuits(&self) -> &CircuitTable {
        &self.circuits
    }

    pub fn circuit(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuits.get(&id)
    }

    pub fn relays(&self) -> &RelayTable {
        &self.relays
    }

    /// Where cells arriving from `address` on `circuit_id` are sent
    pub fn relay_route(&self, address: SocketAddr, circuit_id: CircuitId) -> Option<RelayRoute> {
        self.relays
            .route_from(&Leg::new(address, circuit_id))
            .copied()
    }

    pub fn swarm(&self, service_id: &ServiceId) -> Option<&Swarm> {
        self.swarms.get(service_id)
    }

    /// Whether this node hosts an introduction point for `seeder_key`
    pub fn is_introduction_point_for(&self, seeder_key: &PublicKey) -> bool {
        self.intro_points_held.contains_key(seeder_key)
    }

    /// Introduction points known to the swarm of `service_id`
    pub fn introduction_points(&self, service_id: &ServiceId) -> Vec<IntroductionPoint> {
        self.swarms
            .get(service_id)
            .map(|swarm| swarm.intro_points().copied().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handle a datagram received from `source`
    pub fn on_packet(&mut self, source: SocketAddr, bytes: &[u8]) {
        if !self.running {
            return;
        }

        let packet = match protocol::decode::<Packet>(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Undecodable packet from {}: {}", source, e);
                return;
            }
        };
        if let Some(record) = self.peers.get_mut(&source) {
            record.add_received(bytes.len() as u64);
        }

        let kind = packet.message_type().to_string();
        let result = match packet {
            Packet::HopCreate {
                circuit_id,
                identifier,
                ephemeral_key,
            } => self.handle_hop_create(source, circuit_id, identifier, ephemeral_key),
            Packet::HopCreated {
                circuit_id,
                identifier,
                outcome,
            } => self.handle_hop_created(source, circuit_id, identifier, outcome),
            Packet::Cell { circuit_id, onion } => self.handle_cell(source, circuit_id, &onion),
            Packet::DestroyCircuit { circuit_id, reason } => {
                self.handle_destroy(source, circuit_id, &reason);
                Ok(())
            }
            Packet::PexGetIntroductionPoints { service_id } => {
                self.handle_direct_pex_request(source, service_id)
            }
            Packet::PexIntroductionPoints {
                service_id,
                records,
            } => self.handle_direct_pex_records(source, service_id, records),
        };

        if let Err(e) = result {
            debug!("Dropped {} from {}: {}", kind, source, e);
        }
    }

    fn handle_cell(&mut self, source: SocketAddr, circuit_id: CircuitId, onion: &[u8]) -> Result<()> {
        if self.circuits.owns(&circuit_id, source) {
            return self.handle_circuit_cell(circuit_id, onion);
        }

        let leg = Leg::new(source, circuit_id);
        match self.relays.relay_cell(leg, onion, Instant::now()) {
            Ok(RelayAction::Forward { to, onion }) => {
                self.send_packet(
                    to.address,
                    &Packet::Cell {
                        circuit_id: to.circuit_id,
                        onion,
                    },
                );
                Ok(())
            }
            Ok(RelayAction::Deliver { leg, body }) => {
                let message = protocol::decode::<CellMessage>(&body)?;
                self.handle_relay_message(leg, message)
            }
            Err(RelayError::IntegrityExceeded(leg)) => {
                warn!("Too many integrity failures on {}, tearing it down", leg);
                self.teardown_leg(leg, "integrity");
                Err(TunnelError::integrity(leg.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cell travelling backwards on one of our own circuits
    ///
    /// Hop layers come off outermost first. The hop whose layer says
    /// `Deliver` is the sender; if every hop merely relayed, the cell came
    /// from the far end of a rendezvous link and the end-to-end layer is left.
    fn handle_circuit_cell(&mut self, id: CircuitId, onion: &[u8]) -> Result<()> {
        let max_failures = self.settings.max_integrity_failures;
        let Some(circuit) = self.circuits.get_mut(&id) else {
            return Err(TunnelError::circuit_not_found(id));
        };

        let mut data = onion.to_vec();
        let mut sender = None;
        let mut failed = false;
        for (index, hop) in circuit.hops().iter().enumerate() {
            match hop.keys.backward.open(&data) {
                Ok(Peeled {
                    marker: LayerMarker::Deliver,
                    body,
                }) => {
                    sender = Some((Some(index), body));
                    break;
                }
                Ok(Peeled { body, .. }) => data = body,
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }

        if sender.is_none() && !failed {
            match circuit.e2e().map(|e2e| e2e.recv_layer().open(&data)) {
                Some(Ok(Peeled {
                    marker: LayerMarker::Deliver,
                    body,
                })) => sender = Some((None, body)),
                Some(_) => failed = true,
                None => {
                    return Err(TunnelError::RouteNotFound(format!(
                        "{} carries no end-to-end layer",
                        id
                    )))
                }
            }
        }

        let Some((hop, body)) = sender else {
            circuit.integrity_failures += 1;
            if circuit.integrity_failures >= max_failures {
                warn!("Too many integrity failures on {}, destroying it", id);
                self.destroy_circuit(id, "integrity");
            }
            return Err(TunnelError::integrity(id.to_string()));
        };

        circuit.add_received(onion.len() as u64);
        let message = protocol::decode::<CellMessage>(&body)?;
        match hop {
            Some(index) => self.handle_hop_message(id, index, message),
            None => self.handle_e2e_message(id, message),
        }
    }

    /// Message one of our hops addressed to us
    fn handle_hop_message(&mut self, id: CircuitId, hop: usize, message: CellMessage) -> Result<()> {
        let ctype = self
            .circuits
            .get(&id)
            .map(|circuit| circuit.ctype)
            .ok_or_else(|| TunnelError::circuit_not_found(id))?;

        match message {
            CellMessage::HopExtended {
                identifier,
                outcome,
            } => {
                self.handle_hop_extended(id, hop, identifier, outcome);
                Ok(())
            }
            CellMessage::IntroductionResponse { service_id } => {
                self.handle_introduction_response(id, service_id)
            }
            CellMessage::RendezvousEstablished { cookie } => {
                self.handle_rendezvous_established(id, cookie)
            }
            CellMessage::RendezvousRequest {
                service_id,
                seeder_key,
                cookie,
                rendezvous,
                ephemeral_key,
            } if ctype == CircuitType::IpSeeder => self.handle_rendezvous_request(
                service_id,
                seeder_key,
                cookie,
                rendezvous,
                ephemeral_key,
            ),
            CellMessage::RendezvousLinked {
                cookie,
                ephemeral_key,
                signature,
            } => self.handle_rendezvous_linked(id, cookie, ephemeral_key, signature),
            CellMessage::PexIntroductionPoints {
                service_id,
                records,
            } => {
                self.merge_pex_records(service_id, records);
                Ok(())
            }
            CellMessage::Data {
                source,
                destination,
                payload,
            } => {
                self.deliver_raw_data(id, source, destination, payload);
                Ok(())
            }
            other => {
                debug!(
                    "Unexpected {} from hop {} of {}",
                    other.message_type(),
                    hop,
                    id
                );
                Ok(())
            }
        }
    }

    /// Message that came through the end-to-end layer of a linked circuit
    fn handle_e2e_message(&mut self, id: CircuitId, message: CellMessage) -> Result<()> {
        match message {
            CellMessage::Data {
                source,
                destination,
                payload,
            } => {
                self.deliver_raw_data(id, source, destination, payload);
                Ok(())
            }
            other => {
                debug!("Unexpected end-to-end {} on {}", other.message_type(), id);
                Ok(())
            }
        }
    }

    /// Message an originator addressed to us as a hop of its circuit
    fn handle_relay_message(&mut self, leg: Leg, message: CellMessage) -> Result<()> {
        match message {
            CellMessage::HopExtend {
                identifier,
                peer,
                ephemeral_key,
            } => self.handle_hop_extend(leg, identifier, peer, ephemeral_key),
            CellMessage::IntroductionPublish {
                service_id,
                seeder_key,
                signature,
            } => self.handle_introduction_publish(leg, service_id, seeder_key, signature),
            CellMessage::PexGetIntroductionPoints { service_id } => {
                let records = self.pex_records(&service_id);
                self.send_reply(
                    leg,
                    &CellMessage::PexIntroductionPoints {
                        service_id,
                        records,
                    },
                )
            }
            CellMessage::EstablishRendezvous { cookie } => {
                self.handle_establish_rendezvous(leg, cookie)
            }
            CellMessage::RendezvousRequest {
                service_id,
                seeder_key,
                cookie,
                rendezvous,
                ephemeral_key,
            } => self.forward_rendezvous_request(
                service_id,
                seeder_key,
                CellMessage::RendezvousRequest {
                    service_id,
                    seeder_key,
                    cookie,
                    rendezvous,
                    ephemeral_key,
                },
            ),
            CellMessage::LinkRendezvous {
                cookie,
                ephemeral_key,
                signature,
            } => self.handle_link_rendezvous(leg, cookie, ephemeral_key, signature),
            CellMessage::Data {
                source,
                destination,
                payload,
            } => {
                self.emit_raw_data(RawData {
                    source_address: leg.address,
                    circuit_id: leg.circuit_id,
                    source,
                    destination,
                    payload,
                });
                Ok(())
            }
            other => {
                debug!("Unexpected {} on relayed leg {}", other.message_type(), leg);
                Ok(())
            }
        }
    }

    fn deliver_raw_data(
        &mut self,
        id: CircuitId,
        source: SocketAddr,
        destination: SocketAddr,
        payload: Vec<u8>,
    ) {
        let Some(source_address) = self.circuits.get(&id).and_then(Circuit::first_hop_address)
        else {
            return;
        };
        self.emit_raw_data(RawData {
            source_address,
            circuit_id: id,
            source,
            destination,
            payload,
        });
    }

    fn emit_raw_data(&mut self, data: RawData) {
        debug!(
            "Delivering {} bytes from {} on {}",
            data.payload.len(),
            data.source_address,
            data.circuit_id
        );
        match self.raw_data_handler.as_mut() {
            Some(handler) => handler(data),
            None => debug!("No raw data handler, dropping payload"),
        }
    }

    fn handle_destroy(&mut self, source: SocketAddr, circuit_id: CircuitId, reason: &str) {
        if self.circuits.owns(&circuit_id, source) {
            info!("{} destroyed by {}: {}", circuit_id, source, reason);
            let building = self
                .circuits
                .get(&circuit_id)
                .is_some_and(|circuit| !circuit.is_ready());
            if building {
                self.fail_build(circuit_id, None, reason);
            } else if let Some(circuit) = self.circuits.remove(&circuit_id) {
                self.release_circuit_state(&circuit);
            }
            return;
        }

        let leg = Leg::new(source, circuit_id);
        if self.relays.is_leg_in_use(&leg) {
            debug!("Relayed leg {} destroyed: {}", leg, reason);
            self.teardown_leg(leg, reason);
        }
    }

    /// Drop a relayed leg and tell every other neighbour involved
    pub(crate) fn teardown_leg(&mut self, leg: Leg, reason: &str) {
        let legs = self.relays.teardown(&leg);
        self.forget_relayed_legs(&legs);
        for other in legs.into_iter().filter(|other| *other != leg) {
            self.send_destroy(other, reason);
        }
    }

    fn forget_relayed_legs(&mut self, legs: &[Leg]) {
        self.intro_points_held.retain(|_, held| {
            let keep = !legs.contains(&held.leg);
            if !keep {
                debug!(
                    "No longer introduction point of {} for {}",
                    held.record.seeder_key, held.service_id
                );
            }
            keep
        });
        self.rendezvous_points.retain(|_, leg| !legs.contains(leg));
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    pub(crate) fn send_packet(&mut self, to: SocketAddr, packet: &Packet) {
        let bytes = match protocol::encode(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {}: {}", packet.message_type(), e);
                return;
            }
        };
        if let Some(record) = self.peers.get_mut(&to) {
            record.add_sent(bytes.len() as u64);
        }
        self.transport.send(to, bytes);
    }

    pub(crate) fn send_destroy(&mut self, leg: Leg, reason: &str) {
        self.send_packet(
            leg.address,
            &Packet::DestroyCircuit {
                circuit_id: leg.circuit_id,
                reason: reason.to_string(),
            },
        );
    }

    /// Answer the originator of `leg`
    pub(crate) fn send_reply(&mut self, leg: Leg, message: &CellMessage) -> Result<()> {
        let body = protocol::encode(message)?;
        let onion = self.relays.seal_reply(&leg, &body)?;
        self.send_packet(
            leg.address,
            &Packet::Cell {
                circuit_id: leg.circuit_id,
                onion,
            },
        );
        Ok(())
    }

    /// Send `message` to the last hop of one of our circuits
    pub(crate) fn send_to_last_hop(&mut self, id: CircuitId, message: &CellMessage) -> Result<()> {
        let body = protocol::encode(message)?;
        let circuit = self
            .circuits
            .get_mut(&id)
            .ok_or_else(|| TunnelError::circuit_not_found(id))?;
        let (Some(first), Some(last)) = (circuit.first_hop_address(), circuit.len().checked_sub(1))
        else {
            return Err(TunnelError::CircuitNotReady(id.to_string()));
        };

        let onion = crate::circuit::OnionCrypto::layer_encrypt(&circuit.layers_to(last), &body)?;
        circuit.add_sent(onion.len() as u64);
        self.send_packet(
            first,
            &Packet::Cell {
                circuit_id: id,
                onion,
            },
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance and lifecycle
    // ------------------------------------------------------------------

    /// Periodic maintenance: timeouts, idle relay legs, circuit pool
    pub fn on_tick(&mut self, now: Instant) {
        if !self.running {
            return;
        }

        for (id, peer) in self.circuits.expired_handshakes(now) {
            let err = TunnelError::HandshakeTimeout {
                peer: peer.to_string(),
            };
            self.fail_build(id, Some(peer), &err.to_string());
        }

        for (prev, next, identifier) in self.relays.expired_extends(now) {
            debug!("Extension {} -> {} timed out", prev, next);
            self.reject_extend(prev, identifier, "timeout");
        }

        let idle = self.relays.sweep_idle(now, self.settings.relay_idle_timeout());
        if !idle.is_empty() {
            debug!("Reclaimed {} idle relay legs", idle.len());
            self.forget_relayed_legs(&idle);
            for leg in idle {
                self.send_destroy(leg, "idle");
            }
        }

        self.dht_queries.retain(|query, (service_id, deadline)| {
            let live = *deadline > now;
            if !live {
                debug!("DHT lookup {:?} for {} expired", query, service_id);
            }
            live
        });

        self.expire_rendezvous(now);
        self.build_tunnels(self.settings.min_circuits);
    }

    pub(crate) fn next_query_id(&mut self) -> QueryId {
        self.next_query += 1;
        QueryId(self.next_query)
    }

    /// Tear down one of our circuits
    pub fn destroy_circuit(&mut self, id: CircuitId, reason: &str) -> bool {
        let pending = self
            .circuits
            .get(&id)
            .and_then(|circuit| circuit.pending.as_ref().map(|p| p.peer.address()));
        let Some(circuit) = self.circuits.remove(&id) else {
            return false;
        };

        info!("Destroying {} circuit {}: {}", circuit.ctype, id, reason);
        if let Some(first) = circuit.first_hop_address().or(pending) {
            self.send_destroy(Leg::new(first, id), reason);
        }
        self.release_circuit_state(&circuit);
        true
    }

    /// Forget everything that waited on a circuit that is gone for good
    pub(crate) fn release_circuit_state(&mut self, circuit: &Circuit) {
        match circuit.ctype {
            CircuitType::RpDownloader => {
                if let (Some(service_id), Some(cookie)) = (circuit.service_id, circuit.cookie) {
                    if let Some(swarm) = self.swarms.get_mut(&service_id) {
                        if swarm.rendezvous.as_ref().map(|r| r.cookie) == Some(cookie) {
                            swarm.rendezvous = None;
                        }
                    }
                }
            }
            CircuitType::RpSeeder => {
                if let Some(cookie) = circuit.cookie {
                    self.pending_links.remove(&cookie);
                }
            }
            CircuitType::IpDownloader | CircuitType::Data if !circuit.is_ready() => {
                let dropped = circuit
                    .required_exit
                    .and_then(|exit| self.intro_waiters.remove(&exit.address()))
                    .unwrap_or_default();
                for work in dropped {
                    if let IntroCircuitUse::Rendezvous(service_id) = work {
                        self.abandon_rendezvous(service_id, "no circuit to introduction point");
                    }
                }
            }
            _ => {}
        }
    }

    /// A peer left the network
    pub fn on_peer_departed(&mut self, address: SocketAddr) {
        self.peers.remove(&address);

        for id in self.circuits.through_peer(address) {
            let building = self
                .circuits
                .get(&id)
                .is_some_and(|circuit| !circuit.is_ready());
            if building {
                self.fail_build(id, Some(address), "peer departed");
            } else {
                self.destroy_circuit(id, "peer departed");
            }
        }

        for leg in self.relays.legs_with(address) {
            if self.relays.is_leg_in_use(&leg) {
                self.teardown_leg(leg, "peer departed");
            }
        }

        for swarm_id in self.swarms.service_ids() {
            if let Some(swarm) = self.swarms.get_mut(&swarm_id) {
                swarm.remove_intro_points_at(address);
            }
        }
    }

    /// Leave a swarm, tearing down every circuit built for it
    pub fn leave_swarm(&mut self, service_id: &ServiceId) -> bool {
        let Some(swarm) = self.swarms.leave(service_id) else {
            return false;
        };

        let owned: Vec<CircuitId> = self
            .circuits
            .iter()
            .filter(|circuit| circuit.service_id.as_ref() == Some(service_id))
            .map(|circuit| circuit.id)
            .collect();
        for id in owned {
            self.destroy_circuit(id, "swarm left");
        }

        self.pending_links
            .retain(|_, link| link.service_id != *service_id);
        self.dht_queries.retain(|_, (service, _)| *service != *service_id);
        for uses in self.intro_waiters.values_mut() {
            uses.retain(|u| {
                !matches!(u, IntroCircuitUse::Pex(s) | IntroCircuitUse::Rendezvous(s) if s == service_id)
            });
        }
        info!(
            "Left swarm {} ({} introduction points known)",
            service_id,
            swarm.intro_point_count()
        );
        true
    }

    /// Stop the node: every circuit and relayed leg is torn down and no
    /// further work is accepted
    pub fn unload(&mut self) {
        if !self.running {
            return;
        }
        info!("Unloading tunnel node {}", self.node_id.short_hex());

        for id in self.circuits.ids() {
            self.destroy_circuit(id, "unload");
        }
        for leg in self.relays.legs() {
            if self.relays.is_leg_in_use(&leg) {
                self.teardown_leg(leg, "unload");
            }
        }

        self.swarms.clear();
        self.intro_points_held.clear();
        self.rendezvous_points.clear();
        self.pending_links.clear();
        self.intro_waiters.clear();
        self.dht_queries.clear();
        self.running = false;
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    /// Send application data over a ready circuit
    ///
    /// `peers` names the neighbours to hand the cell to; only the circuit's
    /// first hop can carry it, and an empty list means exactly that hop.
    /// Linked rendezvous circuits add the end-to-end layer so only the far
    /// end can read the payload.
    pub fn send_data(
        &mut self,
        peers: &[SocketAddr],
        id: CircuitId,
        source: SocketAddr,
        destination: SocketAddr,
        payload: &[u8],
    ) -> Result<()> {
        if !self.running {
            return Err(TunnelError::NotRunning);
        }

        let body = protocol::encode(&CellMessage::Data {
            source,
            destination,
            payload: payload.to_vec(),
        })?;

        let circuit = self
            .circuits
            .get_mut(&id)
            .ok_or_else(|| TunnelError::circuit_not_found(id))?;
        if !circuit.is_ready() || (circuit.ctype.is_rendezvous() && !circuit.linked) {
            return Err(TunnelError::CircuitNotReady(id.to_string()));
        }
        let first = circuit
            .first_hop_address()
            .ok_or_else(|| TunnelError::CircuitNotReady(id.to_string()))?;

        let targets = if peers.is_empty() {
            vec![first]
        } else {
            if let Some(other) = peers.iter().find(|peer| **peer != first) {
                return Err(TunnelError::RouteNotFound(format!("{} via {}", id, other)));
            }
            vec![first]
        };

        let layers = match circuit.e2e_layers() {
            Some(layers) => layers,
            None => circuit.layers_to(circuit.len() - 1),
        };
        let onion = crate::circuit::OnionCrypto::layer_encrypt(&layers, &body)?;
        circuit.add_sent(onion.len() as u64);

        for target in targets {
            self.send_packet(
                target,
                &Packet::Cell {
                    circuit_id: id,
                    onion: onion.clone(),
                },
            );
        }
        Ok(())
    }
}
