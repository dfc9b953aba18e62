/// Rendezvous system for hidden services
///
/// The downloader builds an RP_DOWNLOADER circuit to a relay of its choice,
/// registers a cookie there, and sends a rendezvous request through one of
/// the seeder's introduction points. The seeder builds an RP_SEEDER circuit to
/// the same relay and asks it to link the two. From then on the relay treats
/// the pair like any other mid-path hop.
///
/// Both ends also run an X25519 exchange along the way: the downloader's half
/// travels in the request, the seeder's half comes back signed with the
/// seeder key in the link confirmation. The resulting end-to-end layer is the
/// innermost layer of every data cell.

use crate::circuit::{
    CircuitId, CircuitRequest, CircuitType, E2eSession, EphemeralKeyPair, Leg, OnionCrypto,
    PathSelector,
};
use crate::identity::PublicKey;
use crate::node::{IntroCircuitUse, PendingLink, TunnelNode};
use crate::peer::PeerInfo;
use crate::protocol::{CellMessage, Cookie, Signature64, LINK_DOMAIN};
use crate::service::{IntroductionPoint, RendezvousAttempt};
use hiddentunnel_common::{Result, ServiceId, TunnelError};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info};

impl TunnelNode {
    /// Linked RP_DOWNLOADER circuit of `service_id`, once the rendezvous is up
    pub fn rendezvous_circuit(&self, service_id: &ServiceId) -> Option<CircuitId> {
        let attempt = self.swarms.get(service_id)?.rendezvous.as_ref()?;
        if !attempt.linked {
            return None;
        }
        self.circuits
            .by_cookie(&attempt.cookie, CircuitType::RpDownloader)
    }

    pub(crate) fn start_rendezvous_if_needed(&mut self, service_id: ServiceId) {
        if self.rendezvous_expired(&service_id, Instant::now()) {
            self.abandon_rendezvous(service_id, "rendezvous timeout");
        }
        if let Err(e) = self.start_rendezvous(service_id) {
            debug!("No rendezvous for {} yet: {}", service_id, e);
        }
    }

    fn rendezvous_expired(&self, service_id: &ServiceId, now: Instant) -> bool {
        let timeout = self.settings.rendezvous_timeout();
        self.swarms
            .get(service_id)
            .and_then(|swarm| swarm.rendezvous.as_ref())
            .is_some_and(|attempt| attempt.is_expired(now, timeout))
    }

    /// Drop the downloader's rendezvous attempt for `service_id` along with
    /// its RP_DOWNLOADER circuit
    pub(crate) fn abandon_rendezvous(&mut self, service_id: ServiceId, reason: &str) {
        let Some(attempt) = self
            .swarms
            .get_mut(&service_id)
            .and_then(|swarm| swarm.rendezvous.take())
        else {
            return;
        };

        info!("Giving up rendezvous {} for {}: {}", attempt.cookie, service_id, reason);
        if let Some(id) = self
            .circuits
            .by_cookie(&attempt.cookie, CircuitType::RpDownloader)
        {
            self.destroy_circuit(id, reason);
        }
    }

    /// Start over every rendezvous that did not link in time, and drop
    /// seeder-side links that were never confirmed
    pub(crate) fn expire_rendezvous(&mut self, now: Instant) {
        for service_id in self.swarms.service_ids() {
            if self.rendezvous_expired(&service_id, now) {
                self.abandon_rendezvous(service_id, "rendezvous timeout");
                self.start_rendezvous_if_needed(service_id);
            }
        }

        let timeout = self.settings.rendezvous_timeout();
        let stale: Vec<Cookie> = self
            .pending_links
            .iter()
            .filter(|(_, link)| now.saturating_duration_since(link.created_at) >= timeout)
            .map(|(cookie, _)| *cookie)
            .collect();
        for cookie in stale {
            debug!("Rendezvous {} was never linked", cookie);
            self.pending_links.remove(&cookie);
            if let Some(id) = self.circuits.by_cookie(&cookie, CircuitType::RpSeeder) {
                self.destroy_circuit(id, "rendezvous timeout");
            }
        }
    }

    fn start_rendezvous(&mut self, service_id: ServiceId) -> Result<()> {
        let Some(swarm) = self.swarms.get(&service_id) else {
            return Ok(());
        };
        if !swarm.is_downloading() || swarm.rendezvous.is_some() {
            return Ok(());
        }
        let intro_points: Vec<IntroductionPoint> = swarm.intro_points().copied().collect();
        let Some(intro) = intro_points.choose(&mut rand::thread_rng()).copied() else {
            return Ok(());
        };
        let hops = swarm.hops;

        let excluded = HashSet::from([self.address]);
        let rendezvous = PathSelector::select_exit_node(&self.peers.verified_peers(), &excluded)?;

        let cookie = Cookie::generate();
        let e2e_key = EphemeralKeyPair::generate();
        let e2e_public = e2e_key.public_key_bytes();
        if let Some(swarm) = self.swarms.get_mut(&service_id) {
            swarm.rendezvous = Some(RendezvousAttempt {
                cookie,
                rendezvous,
                intro,
                e2e_key: Some(e2e_key),
                e2e_public,
                established: false,
                requested: false,
                linked: false,
                started_at: Instant::now(),
            });
        }

        info!(
            "Starting rendezvous {} for {} at {} via {}",
            cookie,
            service_id,
            rendezvous.address(),
            intro.relay
        );
        let request = CircuitRequest::new(hops, CircuitType::RpDownloader)
            .with_required_exit(rendezvous)
            .with_service(service_id)
            .with_cookie(cookie);
        if let Err(e) = self.create_circuit(request) {
            if let Some(swarm) = self.swarms.get_mut(&service_id) {
                swarm.rendezvous = None;
            }
            return Err(e);
        }
        Ok(())
    }

    /// RP_DOWNLOADER circuit is ready: register our cookie at its last hop
    pub(crate) fn establish_rendezvous(&mut self, id: CircuitId) -> Result<()> {
        let cookie = self
            .circuits
            .get(&id)
            .and_then(|circuit| circuit.cookie)
            .ok_or_else(|| TunnelError::circuit_not_found(id))?;
        self.send_to_last_hop(id, &CellMessage::EstablishRendezvous { cookie })
    }

    /// We are asked to be a rendezvous point
    pub(crate) fn handle_establish_rendezvous(&mut self, leg: Leg, cookie: Cookie) -> Result<()> {
        if self.rendezvous_points.contains_key(&cookie) {
            debug!("Rendezvous cookie {} already registered", cookie);
            return Ok(());
        }

        info!("Hosting rendezvous point {} for {}", cookie, leg);
        self.rendezvous_points.insert(cookie, leg);
        self.send_reply(leg, &CellMessage::RendezvousEstablished { cookie })
    }

    pub(crate) fn handle_rendezvous_established(&mut self, id: CircuitId, cookie: Cookie) -> Result<()> {
        let service_id = self
            .circuits
            .get(&id)
            .filter(|circuit| {
                circuit.ctype == CircuitType::RpDownloader && circuit.cookie == Some(cookie)
            })
            .and_then(|circuit| circuit.service_id)
            .ok_or_else(|| TunnelError::RouteNotFound(format!("rendezvous {}", cookie)))?;

        let Some(attempt) = self
            .swarms
            .get_mut(&service_id)
            .and_then(|swarm| swarm.rendezvous.as_mut())
            .filter(|attempt| attempt.cookie == cookie)
        else {
            return Ok(());
        };
        attempt.established = true;
        let relay = attempt.intro.relay;

        debug!("Rendezvous {} registered, contacting {}", cookie, relay);
        self.use_intro_circuit(relay, IntroCircuitUse::Rendezvous(service_id))
    }

    /// Send the rendezvous request of `service_id` over circuit `id`, which
    /// ends at the chosen introduction point
    pub(crate) fn send_rendezvous_request(&mut self, id: CircuitId, service_id: ServiceId) -> Result<()> {
        let last = self
            .circuits
            .get(&id)
            .and_then(|circuit| circuit.last_hop())
            .map(|hop| hop.peer.address());

        let Some(attempt) = self
            .swarms
            .get_mut(&service_id)
            .and_then(|swarm| swarm.rendezvous.as_mut())
        else {
            return Ok(());
        };
        if !attempt.established || attempt.requested || last != Some(attempt.intro.relay.address) {
            return Ok(());
        }
        attempt.requested = true;

        let message = CellMessage::RendezvousRequest {
            service_id,
            seeder_key: attempt.intro.seeder_key,
            cookie: attempt.cookie,
            rendezvous: attempt.rendezvous,
            ephemeral_key: attempt.e2e_public,
        };
        debug!("Sending rendezvous request {} over {}", attempt.cookie, id);
        self.send_to_last_hop(id, &message)
    }

    /// Introduction point: pass a downloader's request on to the seeder
    pub(crate) fn forward_rendezvous_request(
        &mut self,
        service_id: ServiceId,
        seeder_key: PublicKey,
        request: CellMessage,
    ) -> Result<()> {
        let Some(held) = self
            .intro_points_held
            .get(&seeder_key)
            .filter(|held| held.service_id == service_id)
            .copied()
        else {
            debug!("Rendezvous request for {} we do not introduce", seeder_key);
            return Ok(());
        };

        debug!("Forwarding rendezvous request for {} to {}", service_id, held.leg);
        self.send_reply(held.leg, &request)
    }

    /// Seeder: a downloader wants to meet us at `rendezvous`
    pub(crate) fn handle_rendezvous_request(
        &mut self,
        service_id: ServiceId,
        seeder_key: PublicKey,
        cookie: Cookie,
        rendezvous: PeerInfo,
        ephemeral_key: [u8; 32],
    ) -> Result<()> {
        let Some(swarm) = self.swarms.get(&service_id).filter(|swarm| swarm.is_seeding()) else {
            debug!("Rendezvous request for {} we do not seed", service_id);
            return Ok(());
        };
        let Some(seeder) = swarm
            .seeder_keypair()
            .filter(|seeder| seeder.public_key() == seeder_key)
        else {
            return Ok(());
        };
        if self.pending_links.contains_key(&cookie)
            || self
                .circuits
                .by_cookie(&cookie, CircuitType::RpSeeder)
                .is_some()
        {
            debug!("Duplicate rendezvous request {}", cookie);
            return Ok(());
        }
        if rendezvous.address() == self.address {
            return Err(TunnelError::SelfIntroductionRejected);
        }

        let key = EphemeralKeyPair::generate();
        let our_key = key.public_key_bytes();
        let signature = Signature64(seeder.sign_transcript(
            LINK_DOMAIN,
            &[
                cookie.as_bytes().as_slice(),
                our_key.as_slice(),
                ephemeral_key.as_slice(),
            ],
        ));
        let hops = (swarm.hops + 1).min(self.settings.max_hops);
        let e2e = E2eSession::responder(OnionCrypto::derive_e2e_keys(
            &key.diffie_hellman(&ephemeral_key),
        ));

        self.pending_links.insert(
            cookie,
            PendingLink {
                service_id,
                e2e,
                ephemeral_key: our_key,
                signature,
                created_at: Instant::now(),
            },
        );

        info!(
            "Answering rendezvous {} for {} at {}",
            cookie,
            service_id,
            rendezvous.address()
        );
        let request = CircuitRequest::new(hops, CircuitType::RpSeeder)
            .with_required_exit(rendezvous)
            .with_service(service_id)
            .with_cookie(cookie);
        if let Err(e) = self.create_circuit(request) {
            self.pending_links.remove(&cookie);
            return Err(e);
        }
        Ok(())
    }

    /// RP_SEEDER circuit is ready: ask the rendezvous point to link us
    pub(crate) fn link_rendezvous(&mut self, id: CircuitId) -> Result<()> {
        let cookie = self
            .circuits
            .get(&id)
            .and_then(|circuit| circuit.cookie)
            .ok_or_else(|| TunnelError::circuit_not_found(id))?;
        let link = self
            .pending_links
            .get(&cookie)
            .ok_or_else(|| TunnelError::RouteNotFound(format!("rendezvous {}", cookie)))?;
        let message = CellMessage::LinkRendezvous {
            cookie,
            ephemeral_key: link.ephemeral_key,
            signature: link.signature,
        };
        let e2e = link.e2e.clone();

        if let Some(circuit) = self.circuits.get_mut(&id) {
            circuit.e2e = Some(e2e);
        }
        self.send_to_last_hop(id, &message)
    }

    /// Rendezvous point: join the seeder's leg to the downloader's
    pub(crate) fn handle_link_rendezvous(
        &mut self,
        leg: Leg,
        cookie: Cookie,
        ephemeral_key: [u8; 32],
        signature: Signature64,
    ) -> Result<()> {
        let Some(downloader) = self.rendezvous_points.remove(&cookie) else {
            debug!("Link request for unknown rendezvous {}", cookie);
            return Ok(());
        };
        self.relays.link(downloader, leg)?;
        info!("Linked rendezvous {}: {} <-> {}", cookie, downloader, leg);

        let linked = CellMessage::RendezvousLinked {
            cookie,
            ephemeral_key,
            signature,
        };
        self.send_reply(downloader, &linked)?;
        self.send_reply(leg, &linked)
    }

    /// Both ends learn that the rendezvous point linked their circuits
    pub(crate) fn handle_rendezvous_linked(
        &mut self,
        id: CircuitId,
        cookie: Cookie,
        ephemeral_key: [u8; 32],
        signature: Signature64,
    ) -> Result<()> {
        let (ctype, service_id) = self
            .circuits
            .get(&id)
            .filter(|circuit| circuit.cookie == Some(cookie))
            .map(|circuit| (circuit.ctype, circuit.service_id))
            .ok_or_else(|| TunnelError::RouteNotFound(format!("rendezvous {}", cookie)))?;

        match ctype {
            CircuitType::RpSeeder => {
                self.pending_links.remove(&cookie);
                if let Some(circuit) = self.circuits.get_mut(&id) {
                    circuit.linked = true;
                }
                info!("Rendezvous {} linked, serving over {}", cookie, id);
                Ok(())
            }
            CircuitType::RpDownloader => {
                let Some(service_id) = service_id else {
                    return Ok(());
                };
                let e2e = self.finish_rendezvous(service_id, cookie, ephemeral_key, signature);
                let Some(e2e) = e2e else {
                    self.destroy_circuit(id, "bad rendezvous link");
                    return Err(TunnelError::integrity(format!("rendezvous {}", cookie)));
                };

                if let Some(circuit) = self.circuits.get_mut(&id) {
                    circuit.e2e = Some(e2e);
                    circuit.linked = true;
                }
                info!("Rendezvous {} for {} linked over {}", cookie, service_id, id);
                Ok(())
            }
            _ => {
                debug!("Rendezvous link on {} circuit {}", ctype, id);
                Ok(())
            }
        }
    }

    /// Check the seeder's half of the exchange and derive our session
    fn finish_rendezvous(
        &mut self,
        service_id: ServiceId,
        cookie: Cookie,
        ephemeral_key: [u8; 32],
        signature: Signature64,
    ) -> Option<E2eSession> {
        let attempt = self
            .swarms
            .get_mut(&service_id)?
            .rendezvous
            .as_mut()
            .filter(|attempt| attempt.cookie == cookie)?;

        let signed = attempt.intro.seeder_key.verify_transcript(
            LINK_DOMAIN,
            &[
                cookie.as_bytes().as_slice(),
                ephemeral_key.as_slice(),
                attempt.e2e_public.as_slice(),
            ],
            &signature.0,
        );
        if !signed {
            debug!("Rendezvous {} link not signed by the seeder", cookie);
            return None;
        }

        let key = attempt.e2e_key.take()?;
        attempt.linked = true;
        Some(E2eSession::initiator(OnionCrypto::derive_e2e_keys(
            &key.diffie_hellman(&ephemeral_key),
        )))
    }
}
