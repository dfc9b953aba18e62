use super::crypto::{CryptoError, LayerMarker, SessionKeys};
use super::types::CircuitId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One side of a circuit as seen by a relay: the neighbour and the circuit id
/// used with that neighbour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Leg {
    pub address: SocketAddr,
    pub circuit_id: CircuitId,
}

impl Leg {
    pub fn new(address: SocketAddr, circuit_id: CircuitId) -> Self {
        Self {
            address,
            circuit_id,
        }
    }
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.circuit_id.0)
    }
}

/// Keys this node shares with the originator that opened a leg
#[derive(Debug)]
pub struct HopSession {
    pub keys: SessionKeys,
    pub last_seen: Instant,
    pub integrity_failures: u32,
}

/// Forwarding entry for cells arriving on one leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRoute {
    /// Where the cell goes
    pub to: Leg,

    /// Strip our layer first, using the session of the arrival leg
    pub peel: bool,

    /// Add a backward layer for the originator of this session
    pub wrap: Option<Leg>,
}

/// Extension in flight: `prev` asked us to extend towards the keyed leg
#[derive(Debug, Clone, Copy)]
struct PendingExtend {
    prev: Leg,
    identifier: u32,
    deadline: Instant,
}

/// What to do with a relayed cell
#[derive(Debug, PartialEq, Eq)]
pub enum RelayAction {
    /// Send `onion` on the given leg
    Forward { to: Leg, onion: Vec<u8> },

    /// The originator of `leg` addressed `body` to us
    Deliver { leg: Leg, body: Vec<u8> },
}

/// Relay-side state: hop sessions and the routes between legs
///
/// Routes are only ever inserted and removed in pairs, so a cell can always
/// travel back the way it came.
#[derive(Debug)]
pub struct RelayTable {
    sessions: HashMap<Leg, HopSession>,

    routes: HashMap<Leg, RelayRoute>,

    /// Keyed by the outgoing leg the create was sent on
    pending_extends: HashMap<Leg, PendingExtend>,

    max_integrity_failures: u32,
}

impl RelayTable {
    pub fn new(max_integrity_failures: u32) -> Self {
        Self {
            sessions: HashMap::new(),
            routes: HashMap::new(),
            pending_extends: HashMap::new(),
            max_integrity_failures,
        }
    }

    /// Whether any state refers to this leg
    pub fn is_leg_in_use(&self, leg: &Leg) -> bool {
        self.sessions.contains_key(leg)
            || self.routes.contains_key(leg)
            || self.pending_extends.contains_key(leg)
    }

    /// Whether `id` is used on any leg, whatever the neighbour
    pub fn uses_circuit_id(&self, id: CircuitId) -> bool {
        self.sessions
            .keys()
            .chain(self.routes.keys())
            .chain(self.pending_extends.keys())
            .any(|leg| leg.circuit_id == id)
    }

    pub fn has_session(&self, leg: &Leg) -> bool {
        self.sessions.contains_key(leg)
    }

    pub fn route_from(&self, leg: &Leg) -> Option<&RelayRoute> {
        self.routes.get(leg)
    }

    /// Register the session created by a hop handshake on `leg`
    pub fn open_session(
        &mut self,
        leg: Leg,
        keys: SessionKeys,
        now: Instant,
    ) -> Result<(), RelayError> {
        if self.is_leg_in_use(&leg) {
            return Err(RelayError::LegInUse(leg));
        }
        self.sessions.insert(
            leg,
            HopSession {
                keys,
                last_seen: now,
                integrity_failures: 0,
            },
        );
        Ok(())
    }

    /// Record that the originator of `prev` asked us to extend to `next`
    pub fn begin_extend(
        &mut self,
        prev: Leg,
        next: Leg,
        identifier: u32,
        deadline: Instant,
    ) -> Result<(), RelayError> {
        if !self.sessions.contains_key(&prev) {
            return Err(RelayError::RouteNotFound(prev));
        }
        if self.routes.contains_key(&prev)
            || self.pending_extends.values().any(|p| p.prev == prev)
        {
            return Err(RelayError::AlreadyExtended(prev));
        }
        if self.is_leg_in_use(&next) {
            return Err(RelayError::LegInUse(next));
        }

        self.pending_extends.insert(
            next,
            PendingExtend {
                prev,
                identifier,
                deadline,
            },
        );
        Ok(())
    }

    /// Resolve the extension waiting on `next`; returns the leg to answer on
    pub fn complete_extend(&mut self, next: &Leg, identifier: u32) -> Option<Leg> {
        match self.pending_extends.get(next) {
            Some(pending) if pending.identifier == identifier => {
                let prev = pending.prev;
                self.pending_extends.remove(next);
                Some(prev)
            }
            _ => None,
        }
    }

    /// Extend `prev` to `next` as a middle hop
    ///
    /// Forward cells lose our layer, backward cells gain one.
    pub fn install_extension(&mut self, prev: Leg, next: Leg) {
        self.routes.insert(
            prev,
            RelayRoute {
                to: next,
                peel: true,
                wrap: None,
            },
        );
        self.routes.insert(
            next,
            RelayRoute {
                to: prev,
                peel: false,
                wrap: Some(prev),
            },
        );
    }

    /// Join two circuits that both end here into one path
    pub fn link(&mut self, a: Leg, b: Leg) -> Result<(), RelayError> {
        for leg in [a, b] {
            if !self.sessions.contains_key(&leg) {
                return Err(RelayError::RouteNotFound(leg));
            }
            if self.routes.contains_key(&leg) {
                return Err(RelayError::AlreadyExtended(leg));
            }
        }
        if a == b {
            return Err(RelayError::LegInUse(a));
        }

        self.routes.insert(
            a,
            RelayRoute {
                to: b,
                peel: true,
                wrap: Some(b),
            },
        );
        self.routes.insert(
            b,
            RelayRoute {
                to: a,
                peel: true,
                wrap: Some(a),
            },
        );
        Ok(())
    }

    /// Process a cell that arrived on `from`
    pub fn relay_cell(
        &mut self,
        from: Leg,
        onion: &[u8],
        now: Instant,
    ) -> Result<RelayAction, RelayError> {
        let route = self.routes.get(&from).copied();

        let Some(route) = route else {
            // no route: only cells addressed to us are acceptable
            if !self.sessions.contains_key(&from) {
                return Err(RelayError::RouteNotFound(from));
            }
            let peeled = self.peel(from, onion, now)?;
            return match peeled.marker {
                LayerMarker::Deliver => Ok(RelayAction::Deliver {
                    leg: from,
                    body: peeled.body,
                }),
                LayerMarker::Relay => Err(RelayError::RouteNotFound(from)),
            };
        };

        let body = if route.peel {
            let peeled = self.peel(from, onion, now)?;
            if peeled.marker == LayerMarker::Deliver {
                return Ok(RelayAction::Deliver {
                    leg: from,
                    body: peeled.body,
                });
            }
            peeled.body
        } else {
            onion.to_vec()
        };

        let onion = match route.wrap {
            Some(wrap_leg) => {
                let session = self
                    .sessions
                    .get_mut(&wrap_leg)
                    .ok_or(RelayError::RouteNotFound(wrap_leg))?;
                session.last_seen = now;
                session.keys.backward.seal(LayerMarker::Relay, &body)?
            }
            None => body,
        };

        Ok(RelayAction::Forward {
            to: route.to,
            onion,
        })
    }

    fn peel(
        &mut self,
        leg: Leg,
        onion: &[u8],
        now: Instant,
    ) -> Result<super::crypto::Peeled, RelayError> {
        let max = self.max_integrity_failures;
        let session = self
            .sessions
            .get_mut(&leg)
            .ok_or(RelayError::RouteNotFound(leg))?;

        match session.keys.forward.open(onion) {
            Ok(peeled) => {
                session.last_seen = now;
                Ok(peeled)
            }
            Err(e) if e.is_integrity() => {
                session.integrity_failures += 1;
                if session.integrity_failures >= max {
                    Err(RelayError::IntegrityExceeded(leg))
                } else {
                    Err(RelayError::Crypto(e))
                }
            }
            Err(e) => Err(RelayError::Crypto(e)),
        }
    }

    /// Seal a message from us to the originator of `leg`
    pub fn seal_reply(&self, leg: &Leg, body: &[u8]) -> Result<Vec<u8>, RelayError> {
        let session = self
            .sessions
            .get(leg)
            .ok_or(RelayError::RouteNotFound(*leg))?;
        Ok(session.keys.backward.seal(LayerMarker::Deliver, body)?)
    }

    /// Forget everything reachable from `leg`
    ///
    /// Returns every leg that was involved (including `leg` itself) so the
    /// caller can notify the neighbours.
    pub fn teardown(&mut self, leg: &Leg) -> Vec<Leg> {
        let mut legs = vec![*leg];
        if let Some(route) = self.routes.remove(leg) {
            self.routes.remove(&route.to);
            legs.push(route.to);
        }

        let mut pending_legs = Vec::new();
        self.pending_extends.retain(|next, pending| {
            let involved = legs.contains(next) || legs.contains(&pending.prev);
            if involved {
                pending_legs.push(*next);
                pending_legs.push(pending.prev);
            }
            !involved
        });
        for pending in pending_legs {
            if !legs.contains(&pending) {
                legs.push(pending);
            }
        }

        for leg in &legs {
            self.sessions.remove(leg);
        }
        legs
    }

    /// Extensions that ran past their deadline, as `(prev, next, identifier)`
    pub fn expired_extends(&mut self, now: Instant) -> Vec<(Leg, Leg, u32)> {
        let expired: Vec<(Leg, Leg, u32)> = self
            .pending_extends
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(next, pending)| (pending.prev, *next, pending.identifier))
            .collect();

        for (_, next, _) in &expired {
            self.pending_extends.remove(next);
        }
        expired
    }

    /// Tear down sessions that saw no traffic for `idle`
    ///
    /// Teardown notices can get lost, so this is what eventually reclaims
    /// routes whose circuits died elsewhere.
    pub fn sweep_idle(&mut self, now: Instant, idle: Duration) -> Vec<Leg> {
        let stale: Vec<Leg> = self
            .sessions
            .iter()
            .filter(|(_, session)| now.saturating_duration_since(session.last_seen) >= idle)
            .map(|(leg, _)| *leg)
            .collect();

        let mut removed = Vec::new();
        for leg in stale {
            if removed.contains(&leg) {
                continue;
            }
            removed.extend(self.teardown(&leg));
        }
        removed
    }

    /// Legs whose neighbour is `address`
    pub fn legs_with(&self, address: SocketAddr) -> Vec<Leg> {
        let mut legs: Vec<Leg> = self
            .sessions
            .keys()
            .chain(self.routes.keys())
            .chain(self.pending_extends.keys())
            .filter(|leg| leg.address == address)
            .copied()
            .collect();
        legs.sort();
        legs.dedup();
        legs
    }

    /// Every leg with relay state
    pub fn legs(&self) -> Vec<Leg> {
        let mut legs: Vec<Leg> = self
            .sessions
            .keys()
            .chain(self.routes.keys())
            .chain(self.pending_extends.keys())
            .copied()
            .collect();
        legs.sort();
        legs.dedup();
        legs
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            sessions: self.sessions.len(),
            // routes come in pairs
            linked_pairs: self.routes.len() / 2,
            pending_extends: self.pending_extends.len(),
        }
    }
}

/// Statistics about the relay table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub sessions: usize,
    pub linked_pairs: usize,
    pub pending_extends: usize,
}

/// Errors in relay processing
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("No route for {0}")]
    RouteNotFound(Leg),

    #[error("Leg {0} is already in use")]
    LegInUse(Leg),

    #[error("Leg {0} is already extended")]
    AlreadyExtended(Leg),

    #[error("Too many integrity failures on {0}")]
    IntegrityExceeded(Leg),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<RelayError> for hiddentunnel_common::TunnelError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::RouteNotFound(leg) => Self::RouteNotFound(leg.to_string()),
            RelayError::IntegrityExceeded(leg) => {
                Self::integrity(format!("too many integrity failures on {}", leg))
            }
            RelayError::Crypto(e) => e.into(),
            other => Self::Other(anyhow::anyhow!(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::crypto::{EphemeralKeyPair, OnionCrypto};

    fn leg(port: u16, id: u32) -> Leg {
        Leg::new(SocketAddr::from(([127, 0, 0, 1], port)), CircuitId(id))
    }

    /// (originator keys, relay keys)
    fn session_pair() -> (SessionKeys, SessionKeys) {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let (a_pub, b_pub) = (a.public_key_bytes(), b.public_key_bytes());
        (
            OnionCrypto::derive_hop_keys(&a.diffie_hellman(&b_pub)),
            OnionCrypto::derive_hop_keys(&b.diffie_hellman(&a_pub)),
        )
    }

    #[test]
    fn test_open_session_rejects_reused_leg() {
        let mut table = RelayTable::new(3);
        let now = Instant::now();
        table.open_session(leg(1, 5), session_pair().1, now).unwrap();
        assert!(matches!(
            table.open_session(leg(1, 5), session_pair().1, now),
            Err(RelayError::LegInUse(_))
        ));
        // same id from a different neighbour is a different leg
        table.open_session(leg(2, 5), session_pair().1, now).unwrap();
    }

    #[test]
    fn test_deliver_without_route() {
        let mut table = RelayTable::new(3);
        let (originator, relay) = session_pair();
        table.open_session(leg(1, 5), relay, Instant::now()).unwrap();

        let onion = OnionCrypto::layer_encrypt(&[&originator.forward], b"hello").unwrap();
        let action = table.relay_cell(leg(1, 5), &onion, Instant::now()).unwrap();
        assert_eq!(
            action,
            RelayAction::Deliver {
                leg: leg(1, 5),
                body: b"hello".to_vec()
            }
        );

        let reply = table.seal_reply(&leg(1, 5), b"hi").unwrap();
        let peeled = originator.backward.open(&reply).unwrap();
        assert_eq!(peeled.marker, LayerMarker::Deliver);
        assert_eq!(peeled.body, b"hi");
    }

    #[test]
    fn test_unknown_leg_is_route_not_found() {
        let mut table = RelayTable::new(3);
        assert!(matches!(
            table.relay_cell(leg(9, 9), b"whatever", Instant::now()),
            Err(RelayError::RouteNotFound(_))
        ));
    }

    #[test]
    fn test_extension_forwards_both_ways() {
        let mut table = RelayTable::new(3);
        let now = Instant::now();
        let (originator, relay) = session_pair();
        let (prev, next) = (leg(1, 5), leg(2, 6));
        table.open_session(prev, relay, now).unwrap();

        table.begin_extend(prev, next, 77, now).unwrap();
        assert!(table.complete_extend(&next, 78).is_none());
        assert_eq!(table.complete_extend(&next, 77), Some(prev));
        table.install_extension(prev, next);

        // forward: our layer is Relay, the inner bytes go to next untouched
        let onion = originator.forward.seal(LayerMarker::Relay, b"inner").unwrap();
        match table.relay_cell(prev, &onion, now).unwrap() {
            RelayAction::Forward { to, onion } => {
                assert_eq!(to, next);
                assert_eq!(onion, b"inner");
            }
            other => panic!("expected forward, got {:?}", other),
        }

        // backward: we add a layer the originator can remove
        match table.relay_cell(next, b"from further", now).unwrap() {
            RelayAction::Forward { to, onion } => {
                assert_eq!(to, prev);
                let peeled = originator.backward.open(&onion).unwrap();
                assert_eq!(peeled.marker, LayerMarker::Relay);
                assert_eq!(peeled.body, b"from further");
            }
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[test]
    fn test_link_pairs_two_sessions() {
        let mut table = RelayTable::new(3);
        let now = Instant::now();
        let (down, down_relay) = session_pair();
        let (seed, seed_relay) = session_pair();
        let (a, b) = (leg(1, 5), leg(2, 6));
        table.open_session(a, down_relay, now).unwrap();
        table.open_session(b, seed_relay, now).unwrap();
        table.link(a, b).unwrap();
        assert!(matches!(table.link(a, b), Err(RelayError::AlreadyExtended(_))));

        let onion = down.forward.seal(LayerMarker::Relay, b"e2e").unwrap();
        match table.relay_cell(a, &onion, now).unwrap() {
            RelayAction::Forward { to, onion } => {
                assert_eq!(to, b);
                assert_eq!(seed.backward.open(&onion).unwrap().body, b"e2e");
            }
            other => panic!("expected forward, got {:?}", other),
        }
        assert_eq!(table.stats().linked_pairs, 1);
    }

    #[test]
    fn test_teardown_removes_both_directions() {
        let mut table = RelayTable::new(3);
        let now = Instant::now();
        let (prev, next) = (leg(1, 5), leg(2, 6));
        table.open_session(prev, session_pair().1, now).unwrap();
        table.install_extension(prev, next);

        let mut legs = table.teardown(&next);
        legs.sort();
        assert_eq!(legs, vec![prev, next]);
        assert!(table.route_from(&prev).is_none());
        assert!(table.route_from(&next).is_none());
        assert!(!table.has_session(&prev));
        assert_eq!(
            table.stats(),
            RelayStats {
                sessions: 0,
                linked_pairs: 0,
                pending_extends: 0
            }
        );
    }

    #[test]
    fn test_teardown_drops_pending_extend() {
        let mut table = RelayTable::new(3);
        let now = Instant::now();
        let (prev, next) = (leg(1, 5), leg(2, 6));
        table.open_session(prev, session_pair().1, now).unwrap();
        table.begin_extend(prev, next, 1, now).unwrap();
        assert!(matches!(
            table.begin_extend(prev, leg(3, 7), 2, now),
            Err(RelayError::AlreadyExtended(_))
        ));

        let legs = table.teardown(&prev);
        assert!(legs.contains(&next));
        assert!(!table.is_leg_in_use(&next));
    }

    #[test]
    fn test_integrity_failures_escalate() {
        let mut table = RelayTable::new(2);
        let now = Instant::now();
        table.open_session(leg(1, 5), session_pair().1, now).unwrap();
        let garbage = vec![0u8; 64];

        assert!(matches!(
            table.relay_cell(leg(1, 5), &garbage, now),
            Err(RelayError::Crypto(_))
        ));
        assert!(matches!(
            table.relay_cell(leg(1, 5), &garbage, now),
            Err(RelayError::IntegrityExceeded(_))
        ));
    }

    #[test]
    fn test_sweep_idle_and_expired_extends() {
        let mut table = RelayTable::new(3);
        let start = Instant::now();
        let (prev, next) = (leg(1, 5), leg(2, 6));
        table.open_session(prev, session_pair().1, start).unwrap();
        table.begin_extend(prev, next, 1, start + Duration::from_secs(10)).unwrap();

        assert!(table.expired_extends(start).is_empty());
        assert_eq!(
            table.expired_extends(start + Duration::from_secs(10)),
            vec![(prev, next, 1)]
        );

        let later = start + Duration::from_secs(301);
        assert!(table.sweep_idle(start, Duration::from_secs(300)).is_empty());
        assert_eq!(table.sweep_idle(later, Duration::from_secs(300)), vec![prev]);
        assert!(!table.has_session(&prev));
    }

    #[test]
    fn test_legs_with_neighbour() {
        let mut table = RelayTable::new(3);
        let now = Instant::now();
        table.open_session(leg(1, 5), session_pair().1, now).unwrap();
        table.install_extension(leg(1, 5), leg(2, 6));

        assert_eq!(table.legs_with(leg(1, 0).address), vec![leg(1, 5)]);
        assert_eq!(table.legs_with(leg(2, 0).address), vec![leg(2, 6)]);
        assert!(table.uses_circuit_id(CircuitId(6)));
        assert!(!table.uses_circuit_id(CircuitId(7)));
    }
}
