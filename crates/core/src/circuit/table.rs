use super::types::{Circuit, CircuitId, CircuitState, CircuitType};
use crate::protocol::Cookie;
use hiddentunnel_common::{routing, Result, TunnelError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Locally originated circuits, keyed by the id we assigned
#[derive(Debug)]
pub struct CircuitTable {
    circuits: HashMap<CircuitId, Circuit>,

    /// Hard cap over all circuit types
    max_circuits: usize,

    circuits_by_type: HashMap<CircuitType, Vec<CircuitId>>,
}

impl CircuitTable {
    pub fn new() -> Self {
        Self::with_capacity(routing::MAX_CIRCUITS)
    }

    pub fn with_capacity(max_circuits: usize) -> Self {
        Self {
            circuits: HashMap::new(),
            max_circuits,
            circuits_by_type: HashMap::new(),
        }
    }

    pub fn insert(&mut self, circuit: Circuit) -> Result<()> {
        if self.circuits.len() >= self.max_circuits {
            return Err(TunnelError::MaxCircuitsReached(self.max_circuits));
        }

        self.circuits_by_type
            .entry(circuit.ctype)
            .or_default()
            .push(circuit.id);
        self.circuits.insert(circuit.id, circuit);
        Ok(())
    }

    pub fn get(&self, id: &CircuitId) -> Option<&Circuit> {
        self.circuits.get(id)
    }

    pub fn get_mut(&mut self, id: &CircuitId) -> Option<&mut Circuit> {
        self.circuits.get_mut(id)
    }

    pub fn contains(&self, id: &CircuitId) -> bool {
        self.circuits.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Circuit> {
        self.circuits.values()
    }

    pub fn ids(&self) -> Vec<CircuitId> {
        self.circuits.keys().copied().collect()
    }

    /// Remove a circuit
    pub fn remove(&mut self, id: &CircuitId) -> Option<Circuit> {
        let mut circuit = self.circuits.remove(id)?;
        circuit.mark_broken();

        if let Some(ids) = self.circuits_by_type.get_mut(&circuit.ctype) {
            ids.retain(|cid| cid != id);
        }
        Some(circuit)
    }

    /// Whether a packet with circuit id `id` from `from` belongs to one of
    /// our circuits (rather than to a leg we relay)
    pub fn owns(&self, id: &CircuitId, from: SocketAddr) -> bool {
        self.circuits.get(id).is_some_and(|circuit| {
            circuit.first_hop_address() == Some(from)
                || (circuit.is_empty()
                    && circuit.pending.as_ref().map(|p| p.peer.address()) == Some(from))
        })
    }

    pub fn of_type(&self, ctype: CircuitType) -> Vec<&Circuit> {
        self.circuits_by_type
            .get(&ctype)
            .map(|ids| ids.iter().filter_map(|id| self.circuits.get(id)).collect())
            .unwrap_or_default()
    }

    /// Circuits of a type that are ready or still being built; failed
    /// circuits leave the table as soon as the failure is seen
    pub fn count_live(&self, ctype: CircuitType) -> usize {
        self.circuits_by_type.get(&ctype).map_or(0, |ids| ids.len())
    }

    /// A ready circuit of one of `types` whose last hop is `address`
    pub fn ready_ending_at(&self, address: SocketAddr, types: &[CircuitType]) -> Option<CircuitId> {
        types.iter().find_map(|ctype| {
            self.of_type(*ctype)
                .into_iter()
                .find(|c| c.is_ready() && c.last_hop().map(|h| h.peer.address()) == Some(address))
                .map(|c| c.id)
        })
    }

    /// Rendezvous circuit carrying `cookie`
    pub fn by_cookie(&self, cookie: &Cookie, ctype: CircuitType) -> Option<CircuitId> {
        self.of_type(ctype)
            .into_iter()
            .find(|c| c.cookie.as_ref() == Some(cookie))
            .map(|c| c.id)
    }

    /// Circuits whose pending handshake ran past its deadline
    pub fn expired_handshakes(&self, now: Instant) -> Vec<(CircuitId, SocketAddr)> {
        self.circuits
            .values()
            .filter_map(|c| {
                c.pending
                    .as_ref()
                    .filter(|pending| pending.deadline <= now)
                    .map(|pending| (c.id, pending.peer.address()))
            })
            .collect()
    }

    /// Circuits that use `address` as a hop or are waiting on it
    pub fn through_peer(&self, address: SocketAddr) -> Vec<CircuitId> {
        self.circuits
            .values()
            .filter(|c| {
                c.contains_peer(address)
                    || c.pending.as_ref().map(|p| p.peer.address()) == Some(address)
            })
            .map(|c| c.id)
            .collect()
    }

    /// Get statistics about circuits
    pub fn stats(&self) -> CircuitTableStats {
        let extending = self
            .circuits
            .values()
            .filter(|c| c.state == CircuitState::Extending)
            .count();
        let ready = self.circuits.values().filter(|c| c.is_ready()).count();

        CircuitTableStats {
            total_circuits: self.circuits.len(),
            extending,
            ready,
            max_circuits: self.max_circuits,
            total_bytes_sent: self.circuits.values().map(|c| c.bytes_sent).sum(),
            total_bytes_received: self.circuits.values().map(|c| c.bytes_received).sum(),
        }
    }
}

impl Default for CircuitTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the circuit table
#[derive(Debug, Clone)]
pub struct CircuitTableStats {
    pub total_circuits: usize,
    pub extending: usize,
    pub ready: usize,
    pub max_circuits: usize,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
}
