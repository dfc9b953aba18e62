/// Circuit building protocol with X25519 handshakes
///
/// Circuits are built one hop at a time:
/// 1. Create the first hop with a direct HOP_CREATE
/// 2. Extend through the current last hop with HOP_EXTEND cells, choosing the
///    next peer from the candidates that hop offered
/// 3. Verify every HOP_CREATED / HOP_EXTENDED answer against the identity of
///    the peer we meant to reach, then derive that hop's layer keys
///
/// A failed step throws the whole circuit away and, within the retry budget,
/// starts over while avoiding the peer that failed.

use super::crypto::{EphemeralKeyPair, LayerMarker, OnionCrypto};
use super::path_selection::{PathSelectionCriteria, PathSelector};
use super::relay::Leg;
use super::types::{CircuitId, CircuitType, Hop, PendingHop};
use crate::node::TunnelNode;
use crate::peer::PeerInfo;
use crate::protocol::{
    self, CellMessage, Cookie, HandshakeOutcome, Packet, Signature64, HANDSHAKE_DOMAIN,
};
use hiddentunnel_common::{protocol::MAX_CANDIDATES, PeerFlags, Result, ServiceId, TunnelError};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything needed to (re)build a circuit
#[derive(Debug, Clone)]
pub struct CircuitRequest {
    pub goal_hops: usize,

    pub ctype: CircuitType,

    /// Peer that must be the final hop
    pub required_exit: Option<PeerInfo>,

    pub service_id: Option<ServiceId>,

    pub cookie: Option<Cookie>,

    /// Builds already attempted for this request
    pub(crate) retries: u32,

    /// Peers that failed an earlier attempt
    pub(crate) excluded: HashSet<SocketAddr>,
}

impl CircuitRequest {
    pub fn new(goal_hops: usize, ctype: CircuitType) -> Self {
        Self {
            goal_hops,
            ctype,
            required_exit: None,
            service_id: None,
            cookie: None,
            retries: 0,
            excluded: HashSet::new(),
        }
    }

    pub fn with_required_exit(mut self, exit: PeerInfo) -> Self {
        self.required_exit = Some(exit);
        self
    }

    /// Introduction circuits end at the introduction point
    pub fn with_required_intro_point(self, relay: PeerInfo) -> Self {
        self.with_required_exit(relay)
    }

    pub fn with_service(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.cookie = Some(cookie);
        self
    }

    pub fn excluding(mut self, address: SocketAddr) -> Self {
        self.excluded.insert(address);
        self
    }
}

/// Result of processing a hop's handshake answer
enum HopProgress {
    Ready,
    Extend,
}

/// Why a build step failed
struct BuildFailure {
    peer: Option<SocketAddr>,
    reason: String,
}

impl BuildFailure {
    fn new(peer: SocketAddr, reason: impl Into<String>) -> Self {
        Self {
            peer: Some(peer),
            reason: reason.into(),
        }
    }
}

fn handshake_transcript(identifier: u32, originator: &[u8; 32], relay: &[u8; 32]) -> [Vec<u8>; 3] {
    [
        identifier.to_be_bytes().to_vec(),
        originator.to_vec(),
        relay.to_vec(),
    ]
}

impl TunnelNode {
    // ------------------------------------------------------------------
    // Originator side
    // ------------------------------------------------------------------

    /// Start building a circuit
    ///
    /// Returns as soon as the first handshake is on its way; the circuit
    /// becomes ready (or disappears) as answers come in.
    pub fn create_circuit(&mut self, request: CircuitRequest) -> Result<CircuitId> {
        if !self.is_running() {
            return Err(TunnelError::NotRunning);
        }
        if !self.settings.accepts_hops(request.goal_hops) {
            return Err(TunnelError::InvalidHopCount {
                hops: request.goal_hops,
                max: self.settings.max_hops,
            });
        }
        if request.ctype == CircuitType::Data
            && self.circuits.count_live(CircuitType::Data) >= self.settings.max_circuits
        {
            return Err(TunnelError::MaxCircuitsReached(self.settings.max_circuits));
        }

        let fixed_first = request.required_exit.filter(|_| request.goal_hops == 1);
        let first = match fixed_first {
            Some(exit) => exit,
            None => {
                let flags = if request.goal_hops == 1 && request.ctype == CircuitType::Data {
                    PeerFlags::EXIT
                } else {
                    PeerFlags::RELAY
                };
                let mut criteria = PathSelectionCriteria::new()
                    .with_required_flags(flags)
                    .exclude_all(&request.excluded)
                    .exclude(self.address);
                if let Some(exit) = request.required_exit {
                    criteria = criteria.exclude(exit.address());
                }
                PathSelector::select_hop(&self.peers.verified_peers(), &criteria)?
            }
        };

        let id = self.allocate_circuit_id();
        let ctype = request.ctype;
        let goal_hops = request.goal_hops;
        self.circuits
            .insert(super::types::Circuit::new(id, request))?;

        info!(
            "Creating {} circuit {} with {} hops through {}",
            ctype,
            id,
            goal_hops,
            first.address()
        );
        self.send_hop_create(id, first);
        Ok(id)
    }

    /// Keep `count` DATA circuits alive, capped by `max_circuits`
    ///
    /// Returns how many builds were started.
    pub fn build_tunnels(&mut self, count: usize) -> usize {
        if !self.is_running() {
            return 0;
        }

        let target = count.min(self.settings.max_circuits);
        let live = self.circuits.count_live(CircuitType::Data);
        let mut started = 0;
        for _ in live..target {
            let request = CircuitRequest::new(self.settings.data_circuit_hops, CircuitType::Data);
            match self.create_circuit(request) {
                Ok(_) => started += 1,
                Err(e) => {
                    debug!("Could not start DATA circuit: {}", e);
                    break;
                }
            }
        }
        started
    }

    /// Circuit id unused by both our circuits and our relayed legs
    pub(crate) fn allocate_circuit_id(&self) -> CircuitId {
        loop {
            let id = CircuitId::generate();
            if !self.circuits.contains(&id) && !self.relays.uses_circuit_id(id) {
                return id;
            }
        }
    }

    fn send_hop_create(&mut self, id: CircuitId, peer: PeerInfo) {
        let keypair = EphemeralKeyPair::generate();
        let ephemeral_key = keypair.public_key_bytes();
        let identifier: u32 = rand::thread_rng().gen();
        let deadline = Instant::now() + self.settings.handshake_timeout();

        let Some(circuit) = self.circuits.get_mut(&id) else {
            return;
        };
        circuit.pending = Some(PendingHop {
            peer,
            keypair,
            identifier,
            deadline,
        });

        self.send_packet(
            peer.address(),
            &Packet::HopCreate {
                circuit_id: id,
                identifier,
                ephemeral_key,
            },
        );
    }

    /// Ask the current last hop to extend the circuit by one peer
    fn extend_circuit(&mut self, id: CircuitId) -> std::result::Result<(), BuildFailure> {
        let local = self.address;
        let deadline = Instant::now() + self.settings.handshake_timeout();
        let circuit = self.circuits.get_mut(&id).ok_or(BuildFailure {
            peer: None,
            reason: "circuit vanished".to_string(),
        })?;
        let (Some(first), Some(last)) = (circuit.first_hop(), circuit.last_hop()) else {
            return Err(BuildFailure {
                peer: None,
                reason: "no hop to extend from".to_string(),
            });
        };
        let first = first.peer.address();
        let last_address = last.peer.address();

        let fixed_last = circuit.required_exit.filter(|_| circuit.next_is_last());
        let next = match fixed_last {
            Some(exit) => exit,
            None => {
                let flags = if circuit.next_is_last() && circuit.ctype == CircuitType::Data {
                    PeerFlags::EXIT
                } else {
                    PeerFlags::RELAY
                };
                let mut criteria = PathSelectionCriteria::new()
                    .with_required_flags(flags)
                    .exclude_all(&circuit.request.excluded)
                    .exclude_all(circuit.hops().iter().map(|hop| &hop.peer.peer.address))
                    .exclude(local);
                if let Some(exit) = circuit.required_exit {
                    criteria = criteria.exclude(exit.address());
                }
                PathSelector::select_hop(&last.candidates, &criteria)
                    .map_err(|e| BuildFailure::new(last_address, e.to_string()))?
            }
        };
        if circuit.contains_peer(next.address()) {
            return Err(BuildFailure::new(next.address(), "peer already on the circuit"));
        }

        let keypair = EphemeralKeyPair::generate();
        let identifier: u32 = rand::thread_rng().gen();
        let message = CellMessage::HopExtend {
            identifier,
            peer: next,
            ephemeral_key: keypair.public_key_bytes(),
        };
        let body = protocol::encode(&message)
            .map_err(|e| BuildFailure::new(next.address(), e.to_string()))?;
        let onion = OnionCrypto::layer_encrypt(&circuit.layers_to(circuit.len() - 1), &body)
            .map_err(|e| BuildFailure::new(next.address(), e.to_string()))?;

        circuit.pending = Some(PendingHop {
            peer: next,
            keypair,
            identifier,
            deadline,
        });
        circuit.add_sent(onion.len() as u64);

        info!(
            "Extending circuit {} to node {} (hop {}/{})",
            id,
            next.address(),
            circuit.len() + 1,
            circuit.goal_hops
        );
        self.send_packet(
            first,
            &Packet::Cell {
                circuit_id: id,
                onion,
            },
        );
        Ok(())
    }

    /// HOP_EXTENDED addressed to us by hop `hop` of circuit `id`
    pub(crate) fn handle_hop_extended(
        &mut self,
        id: CircuitId,
        hop: usize,
        identifier: u32,
        outcome: HandshakeOutcome,
    ) {
        let from_last = self
            .circuits
            .get(&id)
            .is_some_and(|circuit| circuit.len().checked_sub(1) == Some(hop));
        if !from_last {
            debug!("Ignoring HOP_EXTENDED from hop {} of {}", hop, id);
            return;
        }
        self.on_handshake_outcome(id, identifier, outcome);
    }

    fn on_handshake_outcome(&mut self, id: CircuitId, identifier: u32, outcome: HandshakeOutcome) {
        match self.accept_hop(id, identifier, outcome) {
            Ok(None) => {}
            Ok(Some(HopProgress::Ready)) => self.on_circuit_ready(id),
            Ok(Some(HopProgress::Extend)) => {
                if let Err(failure) = self.extend_circuit(id) {
                    self.fail_build(id, failure.peer, &failure.reason);
                }
            }
            Err(failure) => self.fail_build(id, failure.peer, &failure.reason),
        }
    }

    /// Check a handshake answer and append the hop it completes
    fn accept_hop(
        &mut self,
        id: CircuitId,
        identifier: u32,
        outcome: HandshakeOutcome,
    ) -> std::result::Result<Option<HopProgress>, BuildFailure> {
        let Some(circuit) = self.circuits.get_mut(&id) else {
            return Ok(None);
        };
        let Some(pending) = circuit.pending.take() else {
            debug!("Unsolicited handshake answer on {}", id);
            return Ok(None);
        };
        if pending.identifier != identifier {
            debug!("Stale handshake answer on {}", id);
            circuit.pending = Some(pending);
            return Ok(None);
        }

        let peer = pending.peer;
        let (ephemeral_key, signature, candidates) = match outcome {
            HandshakeOutcome::Accepted {
                ephemeral_key,
                signature,
                candidates,
            } => (ephemeral_key, signature, candidates),
            HandshakeOutcome::Rejected { reason } => {
                return Err(BuildFailure::new(
                    peer.address(),
                    format!("rejected: {}", reason),
                ));
            }
        };

        let our_key = pending.keypair.public_key_bytes();
        let transcript = handshake_transcript(identifier, &our_key, &ephemeral_key);
        let parts: Vec<&[u8]> = transcript.iter().map(Vec::as_slice).collect();
        if !peer
            .public_key()
            .verify_transcript(HANDSHAKE_DOMAIN, &parts, &signature.0)
        {
            return Err(BuildFailure::new(peer.address(), "bad handshake signature"));
        }

        let shared = pending.keypair.diffie_hellman(&ephemeral_key);
        let keys = OnionCrypto::derive_hop_keys(&shared);
        let candidates = keys
            .backward
            .open(&candidates)
            .map_err(|e| BuildFailure::new(peer.address(), e.to_string()))
            .and_then(|peeled| {
                protocol::decode::<Vec<PeerInfo>>(&peeled.body)
                    .map_err(|e| BuildFailure::new(peer.address(), e.to_string()))
            })?;

        let ready = circuit
            .add_hop(Hop {
                peer,
                keys,
                candidates,
            })
            .map_err(|e| BuildFailure::new(peer.address(), e.to_string()))?;

        debug!(
            "Hop {} of {} is {} ({} candidates)",
            circuit.len(),
            id,
            peer.address(),
            circuit.last_hop().map_or(0, |hop| hop.candidates.len())
        );
        Ok(Some(if ready {
            HopProgress::Ready
        } else {
            HopProgress::Extend
        }))
    }

    fn on_circuit_ready(&mut self, id: CircuitId) {
        let Some(circuit) = self.circuits.get(&id) else {
            return;
        };
        info!(
            "Circuit {} ({}) ready with {} hops",
            id,
            circuit.ctype,
            circuit.len()
        );

        let result = match circuit.ctype {
            CircuitType::IpSeeder => self.publish_introduction(id),
            CircuitType::Data | CircuitType::IpDownloader => {
                self.flush_intro_waiters(id);
                Ok(())
            }
            CircuitType::RpDownloader => self.establish_rendezvous(id),
            CircuitType::RpSeeder => self.link_rendezvous(id),
        };
        if let Err(e) = result {
            warn!("Circuit {} is ready but could not be used: {}", id, e);
            self.destroy_circuit(id, "unusable");
        }
    }

    /// Give up on a circuit under construction and maybe start over
    pub(crate) fn fail_build(&mut self, id: CircuitId, failed_peer: Option<SocketAddr>, reason: &str) {
        let pending = self
            .circuits
            .get(&id)
            .and_then(|circuit| circuit.pending.as_ref().map(|p| p.peer.address()));
        let Some(circuit) = self.circuits.remove(&id) else {
            return;
        };

        warn!(
            "Building {} circuit {} failed after {} hops: {}",
            circuit.ctype,
            id,
            circuit.len(),
            reason
        );
        // a handshake that failed at the first hop may still have left a session there
        let first = circuit
            .first_hop_address()
            .or(pending)
            .or(failed_peer.filter(|_| circuit.is_empty()));
        if let Some(first) = first {
            self.send_destroy(Leg::new(first, id), reason);
        }

        let mut request = circuit.request.clone();
        request.retries += 1;
        if let Some(peer) = failed_peer {
            request.excluded.insert(peer);
        }

        if request.retries > self.settings.max_build_retries || !self.is_running() {
            warn!(
                "Giving up on {} circuit after {} attempts",
                circuit.ctype, request.retries
            );
            self.release_circuit_state(&circuit);
            return;
        }

        match self.create_circuit(request) {
            Ok(new_id) => debug!("Retrying {} as {}", id, new_id),
            Err(e) => {
                warn!("Could not retry {} circuit: {}", circuit.ctype, e);
                self.release_circuit_state(&circuit);
            }
        }
    }

    // ------------------------------------------------------------------
    // Relay side
    // ------------------------------------------------------------------

    /// HOP_CREATE: someone wants us as a hop
    pub(crate) fn handle_hop_create(
        &mut self,
        source: SocketAddr,
        circuit_id: CircuitId,
        identifier: u32,
        ephemeral_key: [u8; 32],
    ) -> Result<()> {
        let leg = Leg::new(source, circuit_id);
        let flags = self.settings.peer_flags;
        let refusal = if !flags.contains(PeerFlags::RELAY) && !flags.contains(PeerFlags::EXIT) {
            Some("not relaying")
        } else if self.circuits.owns(&circuit_id, source) || self.relays.is_leg_in_use(&leg) {
            Some("circuit id in use")
        } else {
            None
        };
        if let Some(reason) = refusal {
            debug!("Refusing hop on {}: {}", leg, reason);
            self.send_packet(
                source,
                &Packet::HopCreated {
                    circuit_id,
                    identifier,
                    outcome: HandshakeOutcome::Rejected {
                        reason: reason.to_string(),
                    },
                },
            );
            return Ok(());
        }

        let relay_key = EphemeralKeyPair::generate();
        let relay_public = relay_key.public_key_bytes();
        let transcript = handshake_transcript(identifier, &ephemeral_key, &relay_public);
        let parts: Vec<&[u8]> = transcript.iter().map(Vec::as_slice).collect();
        let signature = Signature64(self.keypair.sign_transcript(HANDSHAKE_DOMAIN, &parts));

        let keys = OnionCrypto::derive_hop_keys(&relay_key.diffie_hellman(&ephemeral_key));

        let mut candidates: Vec<PeerInfo> = self
            .peers
            .verified_peers()
            .into_iter()
            .filter(|peer| peer.address() != source)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(MAX_CANDIDATES);
        let candidates = keys
            .backward
            .seal(LayerMarker::Deliver, &protocol::encode(&candidates)?)?;

        self.relays.open_session(leg, keys, Instant::now())?;
        debug!("Opened hop session on {}", leg);

        self.send_packet(
            source,
            &Packet::HopCreated {
                circuit_id,
                identifier,
                outcome: HandshakeOutcome::Accepted {
                    ephemeral_key: relay_public,
                    signature,
                    candidates,
                },
            },
        );
        Ok(())
    }

    /// HOP_CREATED: answer to a create we sent, for ourselves or on behalf of
    /// an originator whose circuit we are extending
    pub(crate) fn handle_hop_created(
        &mut self,
        source: SocketAddr,
        circuit_id: CircuitId,
        identifier: u32,
        outcome: HandshakeOutcome,
    ) -> Result<()> {
        let next = Leg::new(source, circuit_id);
        if let Some(prev) = self.relays.complete_extend(&next, identifier) {
            if matches!(outcome, HandshakeOutcome::Accepted { .. }) {
                self.relays.install_extension(prev, next);
                debug!("Extended {} to {}", prev, next);
            }
            return self.send_reply(
                prev,
                &CellMessage::HopExtended {
                    identifier,
                    outcome,
                },
            );
        }

        if self.circuits.owns(&circuit_id, source) {
            self.on_handshake_outcome(circuit_id, identifier, outcome);
            return Ok(());
        }

        Err(TunnelError::RouteNotFound(next.to_string()))
    }

    /// HOP_EXTEND: the originator of `prev` wants its circuit extended to `peer`
    pub(crate) fn handle_hop_extend(
        &mut self,
        prev: Leg,
        identifier: u32,
        peer: PeerInfo,
        ephemeral_key: [u8; 32],
    ) -> Result<()> {
        if peer.address() == self.address || peer.address() == prev.address {
            return self.reject_extend(prev, identifier, "cannot extend to self");
        }

        let next = Leg::new(peer.address(), self.allocate_circuit_id());
        let deadline = Instant::now() + self.settings.handshake_timeout();
        if let Err(e) = self.relays.begin_extend(prev, next, identifier, deadline) {
            debug!("Refusing to extend {}: {}", prev, e);
            return self.reject_extend(prev, identifier, "cannot extend");
        }

        debug!("Extending {} towards {}", prev, next);
        self.send_packet(
            next.address,
            &Packet::HopCreate {
                circuit_id: next.circuit_id,
                identifier,
                ephemeral_key,
            },
        );
        Ok(())
    }

    pub(crate) fn reject_extend(&mut self, prev: Leg, identifier: u32, reason: &str) -> Result<()> {
        self.send_reply(
            prev,
            &CellMessage::HopExtended {
                identifier,
                outcome: HandshakeOutcome::Rejected {
                    reason: reason.to_string(),
                },
            },
        )
    }
}
