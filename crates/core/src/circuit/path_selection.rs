use crate::peer::PeerInfo;
use hiddentunnel_common::{PeerFlags, TunnelError};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::SocketAddr;

/// Criteria for selecting the next hop of a circuit
#[derive(Debug, Clone)]
pub struct PathSelectionCriteria {
    /// Flags the chosen peer must advertise
    pub required_flags: PeerFlags,

    /// Peers to exclude from selection
    pub excluded: HashSet<SocketAddr>,
}

impl Default for PathSelectionCriteria {
    fn default() -> Self {
        Self {
            required_flags: PeerFlags::RELAY,
            excluded: HashSet::new(),
        }
    }
}

impl PathSelectionCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_required_flags(mut self, flags: PeerFlags) -> Self {
        self.required_flags = flags;
        self
    }

    pub fn exclude(mut self, address: SocketAddr) -> Self {
        self.excluded.insert(address);
        self
    }

    pub fn exclude_all<'a>(mut self, addresses: impl IntoIterator<Item = &'a SocketAddr>) -> Self {
        self.excluded.extend(addresses);
        self
    }

    pub fn accepts(&self, peer: &PeerInfo) -> bool {
        peer.flags.contains(self.required_flags) && !self.excluded.contains(&peer.address())
    }
}

/// Picks peers for circuits
pub struct PathSelector;

impl PathSelector {
    /// Pick a random hop among `candidates`
    pub fn select_hop(
        candidates: &[PeerInfo],
        criteria: &PathSelectionCriteria,
    ) -> Result<PeerInfo, PathSelectionError> {
        let eligible: Vec<&PeerInfo> = candidates.iter().filter(|p| criteria.accepts(p)).collect();

        eligible
            .choose(&mut rand::thread_rng())
            .map(|peer| **peer)
            .ok_or(PathSelectionError::NoCandidates {
                offered: candidates.len(),
                required: criteria.required_flags,
            })
    }

    /// Pick an exit-capable peer, e.g. as a rendezvous point
    pub fn select_exit_node(
        candidates: &[PeerInfo],
        excluded: &HashSet<SocketAddr>,
    ) -> Result<PeerInfo, PathSelectionError> {
        let criteria = PathSelectionCriteria::new()
            .with_required_flags(PeerFlags::EXIT)
            .exclude_all(excluded);

        Self::select_hop(candidates, &criteria).map_err(|_| PathSelectionError::NoSuitableExit)
    }
}

/// Errors that can occur during path selection
#[derive(Debug, thiserror::Error)]
pub enum PathSelectionError {
    #[error("None of {offered} candidates advertises {required}")]
    NoCandidates { offered: usize, required: PeerFlags },

    #[error("No suitable exit node found")]
    NoSuitableExit,
}

impl From<PathSelectionError> for TunnelError {
    fn from(err: PathSelectionError) -> Self {
        TunnelError::no_candidate(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    fn create_test_peers() -> Vec<PeerInfo> {
        (0..20u16)
            .map(|i| {
                let flags = if i % 5 == 0 {
                    PeerFlags::RELAY | PeerFlags::EXIT
                } else {
                    PeerFlags::RELAY
                };
                PeerInfo::new(
                    KeyPair::generate().public_key(),
                    SocketAddr::from(([127, 0, 0, 1], 9000 + i)),
                    flags,
                )
            })
            .collect()
    }

    #[test]
    fn test_hop_selection() {
        let peers = create_test_peers();
        let hop = PathSelector::select_hop(&peers, &PathSelectionCriteria::default()).unwrap();
        assert!(peers.contains(&hop));
    }

    #[test]
    fn test_hop_selection_exclusions() {
        let peers = create_test_peers();
        let criteria = PathSelectionCriteria::default()
            .exclude_all(peers[1..].iter().map(|p| &p.peer.address));

        for _ in 0..10 {
            let hop = PathSelector::select_hop(&peers, &criteria).unwrap();
            assert_eq!(hop, peers[0]);
        }
    }

    #[test]
    fn test_exit_selection_requires_flag() {
        let peers = create_test_peers();
        for _ in 0..10 {
            assert!(PathSelector::select_exit_node(&peers, &HashSet::new())
                .unwrap()
                .can_exit());
        }

        let relays_only: Vec<_> = peers.into_iter().filter(|p| !p.can_exit()).collect();
        assert!(matches!(
            PathSelector::select_exit_node(&relays_only, &HashSet::new()),
            Err(PathSelectionError::NoSuitableExit)
        ));
    }

    #[test]
    fn test_no_candidates() {
        let result = PathSelector::select_hop(&[], &PathSelectionCriteria::default());
        assert!(matches!(
            result,
            Err(PathSelectionError::NoCandidates { offered: 0, .. })
        ));
    }
}
