/// Introduction points
///
/// A seeder builds an IP_SEEDER circuit and asks its last hop to listen for
/// rendezvous requests on its behalf. The relay checks the seeder's signature
/// over `(service, relay)` before accepting, so a record can only ever name a
/// relay that agreed to it. Accepted records are published to the DHT by the
/// seeder and handed out over PEX by anyone who knows them.

use crate::circuit::{CircuitId, CircuitRequest, CircuitType, Leg};
use crate::dht::DhtKey;
use crate::identity::{KeyPair, PublicKey};
use crate::node::{HeldIntroduction, IntroCircuitUse, TunnelNode};
use crate::peer::{Peer, PeerInfo};
use crate::protocol::{self, CellMessage, IntroRecord, Packet, Signature64, INTRO_DOMAIN};
use hiddentunnel_common::{Result, ServiceId, TunnelError};
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::{debug, info};

/// Seeder-signed record naming `relay` as introduction point of `service_id`
pub(crate) fn sign_intro_record(seeder: &KeyPair, service_id: &ServiceId, relay: Peer) -> IntroRecord {
    let parts = IntroRecord::transcript_parts(service_id, &relay);
    let parts: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
    IntroRecord {
        seeder_key: seeder.public_key(),
        relay,
        signature: Signature64(seeder.sign_transcript(INTRO_DOMAIN, &parts)),
    }
}

impl TunnelNode {
    /// Build a new introduction point for a service we seed
    ///
    /// With `required_ip` the circuit ends at that relay; otherwise at any
    /// relay not already introducing this service for us.
    pub fn create_introduction_point(
        &mut self,
        service_id: ServiceId,
        required_ip: Option<PeerInfo>,
    ) -> Result<CircuitId> {
        let hops = self
            .swarms
            .get(&service_id)
            .filter(|swarm| swarm.is_seeding())
            .map(|swarm| swarm.hops)
            .ok_or_else(|| TunnelError::UnknownSwarm(service_id.to_hex()))?;

        let mut request = CircuitRequest::new(hops, CircuitType::IpSeeder).with_service(service_id);
        for circuit in self.circuits.of_type(CircuitType::IpSeeder) {
            if circuit.service_id != Some(service_id) {
                continue;
            }
            let relay = circuit
                .required_exit
                .map(|exit| exit.address())
                .or_else(|| circuit.last_hop().map(|hop| hop.peer.address()));
            if let Some(relay) = relay {
                request.excluded.insert(relay);
            }
        }
        if let Some(relay) = required_ip {
            request = request.with_required_intro_point(relay);
        }

        info!("Creating introduction point for {}", service_id);
        self.create_circuit(request)
    }

    /// Whether one of our live IP_SEEDER circuits works for `service_id`
    pub(crate) fn has_introduction_circuit(&self, service_id: &ServiceId) -> bool {
        self.circuits
            .of_type(CircuitType::IpSeeder)
            .iter()
            .any(|circuit| circuit.service_id.as_ref() == Some(service_id))
    }

    /// Record for the introduction point at the end of an IP_SEEDER circuit
    fn own_intro_record(&self, id: CircuitId) -> Result<(ServiceId, IntroRecord)> {
        let circuit = self
            .circuits
            .get(&id)
            .ok_or_else(|| TunnelError::circuit_not_found(id))?;
        let (Some(service_id), Some(last)) = (circuit.service_id, circuit.last_hop()) else {
            return Err(TunnelError::CircuitNotReady(id.to_string()));
        };
        let seeder = self
            .swarms
            .get(&service_id)
            .and_then(|swarm| swarm.seeder_keypair())
            .ok_or_else(|| TunnelError::UnknownSwarm(service_id.to_hex()))?;

        Ok((service_id, sign_intro_record(seeder, &service_id, last.peer.peer)))
    }

    /// IP_SEEDER circuit is ready: ask its last hop to introduce us
    pub(crate) fn publish_introduction(&mut self, id: CircuitId) -> Result<()> {
        let (service_id, record) = self.own_intro_record(id)?;
        debug!(
            "Asking {} to introduce {} for {}",
            record.relay, record.seeder_key, service_id
        );
        self.send_to_last_hop(
            id,
            &CellMessage::IntroductionPublish {
                service_id,
                seeder_key: record.seeder_key,
                signature: record.signature,
            },
        )
    }

    /// The relay accepted: make the record findable
    pub(crate) fn handle_introduction_response(
        &mut self,
        id: CircuitId,
        service_id: ServiceId,
    ) -> Result<()> {
        let (own_service, record) = self.own_intro_record(id)?;
        if own_service != service_id {
            return Err(TunnelError::UnknownSwarm(service_id.to_hex()));
        }

        info!(
            "Introduction point for {} established at {}",
            service_id, record.relay
        );
        self.dht
            .store(DhtKey::for_service(&service_id), protocol::encode(&record)?);
        Ok(())
    }

    /// A seeder asks us, the last hop of its circuit, to introduce it
    pub(crate) fn handle_introduction_publish(
        &mut self,
        leg: Leg,
        service_id: ServiceId,
        seeder_key: PublicKey,
        signature: Signature64,
    ) -> Result<()> {
        let record = IntroRecord {
            seeder_key,
            relay: self.peer(),
            signature,
        };
        if !record.verify(&service_id) {
            return Err(TunnelError::integrity(format!(
                "introduction record for {} from {}",
                service_id, leg
            )));
        }

        info!(
            "Becoming introduction point of {} for {}",
            seeder_key, service_id
        );
        self.intro_points_held.insert(
            seeder_key,
            HeldIntroduction {
                service_id,
                leg,
                record,
            },
        );
        self.send_reply(leg, &CellMessage::IntroductionResponse { service_id })
    }

    /// Whether we host an introduction point for `service_id`
    pub fn holds_introduction_for(&self, service_id: &ServiceId) -> bool {
        self.intro_points_held
            .values()
            .any(|held| held.service_id == *service_id)
    }

    /// Records we can share about `service_id`
    pub(crate) fn pex_records(&self, service_id: &ServiceId) -> Vec<IntroRecord> {
        let held = self
            .intro_points_held
            .values()
            .filter(|held| held.service_id == *service_id)
            .map(|held| held.record);

        let known = self
            .known_records
            .get(service_id)
            .into_iter()
            .flat_map(|records| records.values().copied());

        let own = self
            .circuits
            .of_type(CircuitType::IpSeeder)
            .into_iter()
            .filter(|circuit| circuit.is_ready() && circuit.service_id.as_ref() == Some(service_id))
            .filter_map(|circuit| self.own_intro_record(circuit.id).ok())
            .map(|(_, record)| record)
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        held.chain(own)
            .chain(known)
            .filter(|record| seen.insert(*record))
            .take(self.settings.max_pex_introduction_points)
            .collect()
    }

    /// Verify and merge introduction points someone shared with us
    pub(crate) fn merge_pex_records(&mut self, service_id: ServiceId, records: Vec<IntroRecord>) {
        let limit = self.settings.max_pex_introduction_points;
        for record in records.into_iter().take(limit) {
            if !record.verify(&service_id) {
                debug!("Dropping unverifiable PEX record for {}", service_id);
                continue;
            }
            self.add_discovered(service_id, record);
        }
    }

    /// PEX request sent to us directly by another relay
    pub(crate) fn handle_direct_pex_request(
        &mut self,
        source: SocketAddr,
        service_id: ServiceId,
    ) -> Result<()> {
        let Some(info) = self.peers.get(&source).copied() else {
            debug!("PEX request for {} from unknown {}", service_id, source);
            return Ok(());
        };
        self.peers.add_service_peer(service_id, info.peer);

        let records = self.pex_records(&service_id);
        if records.is_empty() {
            return Ok(());
        }
        debug!(
            "Sharing {} introduction points of {} with {}",
            records.len(),
            service_id,
            source
        );
        self.send_packet(
            source,
            &Packet::PexIntroductionPoints {
                service_id,
                records,
            },
        );
        Ok(())
    }

    /// PEX answer sent to us directly; only accepted from peers of the service
    pub(crate) fn handle_direct_pex_records(
        &mut self,
        source: SocketAddr,
        service_id: ServiceId,
        records: Vec<IntroRecord>,
    ) -> Result<()> {
        if !self.peers.is_service_peer(&service_id, &source) {
            debug!("Unsolicited PEX records for {} from {}", service_id, source);
            return Ok(());
        }
        self.merge_pex_records(service_id, records);
        Ok(())
    }

    /// Learn that `peer` takes part in `service_id` and exchange
    /// introduction points with it
    pub fn discover_services(&mut self, peer: PeerInfo, service_id: ServiceId) {
        self.peers.add_verified_peer(peer);
        self.peers.add_service_peer(service_id, peer.peer);

        let downloading = self
            .swarms
            .get(&service_id)
            .is_some_and(|swarm| swarm.is_downloading());
        if downloading {
            if let Err(e) = self.use_intro_circuit(peer.peer, IntroCircuitUse::Pex(service_id)) {
                debug!("PEX with {} for {} failed: {}", peer.address(), service_id, e);
            }
        }

        if self.holds_introduction_for(&service_id) {
            self.send_packet(
                peer.address(),
                &Packet::PexGetIntroductionPoints { service_id },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_record_verifies() {
        let seeder = KeyPair::generate();
        let relay = Peer::new(
            KeyPair::generate().public_key(),
            "127.0.0.1:5000".parse().unwrap(),
        );
        let service_id = ServiceId::from([b'0'; 20]);

        let record = sign_intro_record(&seeder, &service_id, relay);
        assert_eq!(record.seeder_key, seeder.public_key());
        assert!(record.verify(&service_id));

        let mut forged = record;
        forged.seeder_key = KeyPair::generate().public_key();
        assert!(!forged.verify(&service_id));
    }
}
