/// Introduction point discovery for downloaders
///
/// Two strategies run side by side: a DHT lookup under the service key and
/// PEX with relays that take part in the service. Whatever answers first wins
/// the swarm callback; later answers only grow the set.

use crate::circuit::{CircuitId, CircuitRequest, CircuitType};
use crate::dht::{DhtKey, QueryId};
use crate::node::{IntroCircuitUse, TunnelNode};
use crate::peer::{Peer, PeerInfo};
use crate::protocol::{self, CellMessage, IntroRecord, Packet};
use crate::service::SwarmCallback;
use hiddentunnel_common::{PeerFlags, Result, ServiceId, TunnelError};
use std::time::Instant;
use tracing::{debug, info};

impl TunnelNode {
    /// Join the swarm of `service_id`
    ///
    /// Seeding makes sure an introduction point exists. Downloading (any
    /// join that is not purely seeding) starts discovery right away.
    /// `callback` fires once, with the first introduction point found.
    pub fn join_swarm(
        &mut self,
        service_id: ServiceId,
        hops: usize,
        callback: Option<SwarmCallback>,
        seeding: bool,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(TunnelError::NotRunning);
        }
        if !self.settings.accepts_hops(hops) {
            return Err(TunnelError::InvalidHopCount {
                hops,
                max: self.settings.max_hops,
            });
        }

        let swarm = self.swarms.join(service_id, hops, seeding, callback);
        let role = swarm.role;
        info!(
            "Joined swarm {} (seeding: {}, downloading: {})",
            service_id, role.seeding, role.downloading
        );

        if role.seeding && !self.has_introduction_circuit(&service_id) {
            if let Err(e) = self.create_introduction_point(service_id, None) {
                debug!("No introduction point for {} yet: {}", service_id, e);
            }
        }
        if role.downloading {
            self.lookup_service(service_id);
            self.start_rendezvous_if_needed(service_id);
        }
        Ok(())
    }

    /// One discovery round over every swarm
    pub fn do_peer_discovery(&mut self) {
        if !self.is_running() {
            return;
        }

        for service_id in self.swarms.service_ids() {
            let Some(swarm) = self.swarms.get(&service_id) else {
                continue;
            };
            let role = swarm.role;
            let intro_relays: Vec<Peer> = swarm.intro_points().map(|ip| ip.relay).collect();

            if role.seeding && !self.has_introduction_circuit(&service_id) {
                if let Err(e) = self.create_introduction_point(service_id, None) {
                    debug!("No introduction point for {}: {}", service_id, e);
                }
            }

            if role.downloading {
                self.lookup_service(service_id);

                let mut relays = intro_relays;
                for address in self.peers.service_peers(&service_id) {
                    if let Some(info) = self.peers.get(&address) {
                        if !relays.iter().any(|relay| relay.address == address) {
                            relays.push(info.peer);
                        }
                    }
                }
                for relay in relays {
                    if let Err(e) = self.use_intro_circuit(relay, IntroCircuitUse::Pex(service_id)) {
                        debug!("PEX with {} for {} failed: {}", relay.address, service_id, e);
                    }
                }

                self.start_rendezvous_if_needed(service_id);
            }

            if self.holds_introduction_for(&service_id) {
                for address in self.peers.service_peers(&service_id) {
                    self.send_packet(address, &Packet::PexGetIntroductionPoints { service_id });
                }
            }
        }
    }

    /// Start a DHT lookup for the introduction points of `service_id`
    pub(crate) fn lookup_service(&mut self, service_id: ServiceId) -> QueryId {
        let query = self.next_query_id();
        let deadline = Instant::now() + self.settings.dht_lookup_timeout();
        self.dht_queries.insert(query, (service_id, deadline));
        self.dht.find(query, DhtKey::for_service(&service_id));
        debug!("DHT lookup {:?} for {}", query, service_id);
        query
    }

    /// Values answering a DHT lookup; may be called several times per query
    pub fn on_dht_values(&mut self, query: QueryId, values: Vec<Vec<u8>>) {
        let Some((service_id, deadline)) = self.dht_queries.get(&query).copied() else {
            debug!("DHT values for unknown lookup {:?}", query);
            return;
        };
        if deadline <= Instant::now() {
            self.dht_queries.remove(&query);
            return;
        }

        for value in values {
            let record = match protocol::decode::<IntroRecord>(&value) {
                Ok(record) => record,
                Err(e) => {
                    debug!("Bad DHT value for {}: {}", service_id, e);
                    continue;
                }
            };
            if !record.verify(&service_id) {
                debug!("Unverifiable DHT record for {}", service_id);
                continue;
            }
            self.add_discovered(service_id, record);
        }
    }

    /// Remember a verified record and hand it to the swarm, if we download
    pub(crate) fn add_discovered(&mut self, service_id: ServiceId, record: IntroRecord) {
        let ip = record.introduction_point();
        self.known_records
            .entry(service_id)
            .or_default()
            .insert(ip, record);

        let local = self.address;
        let Some(swarm) = self.swarms.get_mut(&service_id) else {
            return;
        };
        if !swarm.is_downloading() {
            return;
        }
        match swarm.add_intro_point(ip, local) {
            Ok(true) => {
                info!("Discovered introduction point {} for {}", ip, service_id);
                self.start_rendezvous_if_needed(service_id);
            }
            Ok(false) => {}
            Err(e) => debug!("Discarding introduction point for {}: {}", service_id, e),
        }
    }

    /// Run `work` over a circuit ending at `relay`, building one if needed
    pub(crate) fn use_intro_circuit(&mut self, relay: Peer, work: IntroCircuitUse) -> Result<()> {
        let types = [CircuitType::Data, CircuitType::IpDownloader];
        if let Some(id) = self.circuits.ready_ending_at(relay.address, &types) {
            return self.run_intro_use(id, work);
        }

        let building = self.intro_waiters.contains_key(&relay.address);
        let waiters = self.intro_waiters.entry(relay.address).or_default();
        if !waiters.contains(&work) {
            waiters.push(work);
        }
        if building {
            return Ok(());
        }

        let service_id = match work {
            IntroCircuitUse::Pex(service_id) | IntroCircuitUse::Rendezvous(service_id) => service_id,
        };
        let hops = self
            .swarms
            .get(&service_id)
            .map_or(self.settings.data_circuit_hops, |swarm| swarm.hops);
        let exit = self
            .peers
            .get(&relay.address)
            .copied()
            .unwrap_or(PeerInfo {
                peer: relay,
                flags: PeerFlags::RELAY,
            });

        let request = CircuitRequest::new(hops, CircuitType::IpDownloader)
            .with_required_intro_point(exit)
            .with_service(service_id);
        if let Err(e) = self.create_circuit(request) {
            self.intro_waiters.remove(&relay.address);
            return Err(e);
        }
        Ok(())
    }

    /// A circuit that may end at an introduction relay became ready
    pub(crate) fn flush_intro_waiters(&mut self, id: CircuitId) {
        let Some(last) = self
            .circuits
            .get(&id)
            .and_then(|circuit| circuit.last_hop())
            .map(|hop| hop.peer.address())
        else {
            return;
        };
        let Some(waiters) = self.intro_waiters.remove(&last) else {
            return;
        };

        for work in waiters {
            if let Err(e) = self.run_intro_use(id, work) {
                debug!("Queued work for {} failed: {}", last, e);
            }
        }
    }

    fn run_intro_use(&mut self, id: CircuitId, work: IntroCircuitUse) -> Result<()> {
        match work {
            IntroCircuitUse::Pex(service_id) => {
                debug!("Requesting introduction points of {} over {}", service_id, id);
                self.send_to_last_hop(id, &CellMessage::PexGetIntroductionPoints { service_id })
            }
            IntroCircuitUse::Rendezvous(service_id) => self.send_rendezvous_request(id, service_id),
        }
    }
}
