use crate::config::swarm::SERVICE_ID_LEN;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capabilities a peer advertises to circuit builders
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerFlags(u8);

impl PeerFlags {
    pub const NONE: PeerFlags = PeerFlags(0);

    /// Willing to act as an intermediate hop
    pub const RELAY: PeerFlags = PeerFlags(1 << 0);

    /// Willing to terminate DATA circuits and host rendezvous points
    pub const EXIT: PeerFlags = PeerFlags(1 << 1);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True if every flag in `other` is set
    pub fn contains(&self, other: PeerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PeerFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PeerFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for PeerFlags {
    type Output = PeerFlags;

    fn bitor(self, other: PeerFlags) -> PeerFlags {
        PeerFlags(self.0 | other.0)
    }
}

impl std::ops::BitOrAssign for PeerFlags {
    fn bitor_assign(&mut self, other: PeerFlags) {
        self.insert(other);
    }
}

impl fmt::Display for PeerFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(PeerFlags::RELAY) {
            names.push("relay");
        }
        if self.contains(PeerFlags::EXIT) {
            names.push("exit");
        }
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Opaque identifier of a hidden service
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId([u8; SERVICE_ID_LEN]);

impl ServiceId {
    pub fn from_bytes(bytes: [u8; SERVICE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; SERVICE_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SERVICE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; SERVICE_ID_LEN]> for ServiceId {
    fn from(value: [u8; SERVICE_ID_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_flags_combine() {
        let mut flags = PeerFlags::RELAY;
        assert!(!flags.contains(PeerFlags::EXIT));

        flags |= PeerFlags::EXIT;
        assert!(flags.contains(PeerFlags::RELAY | PeerFlags::EXIT));

        flags.remove(PeerFlags::RELAY);
        assert!(!flags.contains(PeerFlags::RELAY));
        assert_eq!(flags.to_string(), "exit");
    }

    #[test]
    fn empty_flags_contain_nothing_but_none() {
        let flags = PeerFlags::default();
        assert!(flags.is_empty());
        assert!(flags.contains(PeerFlags::NONE));
        assert!(!flags.contains(PeerFlags::RELAY));
    }

    #[test]
    fn service_id_rejects_wrong_length() {
        assert!(ServiceId::from_slice(&[0u8; 19]).is_none());
        assert!(ServiceId::from_slice(&[0u8; 20]).is_some());
    }

    #[test]
    fn service_id_serializes_as_bytes() {
        let service = ServiceId::from([b'0'; SERVICE_ID_LEN]);
        let encoded = bincode::serialize(&service).unwrap();
        assert_eq!(encoded.len(), SERVICE_ID_LEN);
        let decoded: ServiceId = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, service);
        assert_eq!(service.to_string(), "30".repeat(SERVICE_ID_LEN));
    }
}
