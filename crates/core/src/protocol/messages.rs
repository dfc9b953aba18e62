use crate::circuit::CircuitId;
use crate::identity::{PublicKey, SIGNATURE_LEN};
use crate::peer::{Peer, PeerInfo};
use crate::service::IntroductionPoint;
use hiddentunnel_common::ServiceId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Transcript domain of introduction point records
pub const INTRO_DOMAIN: &str = "HIDDENTUNNEL-INTRODUCTION-V1";

/// Transcript domain of relay handshakes
pub const HANDSHAKE_DOMAIN: &str = "HIDDENTUNNEL-HANDSHAKE-V1";

/// Transcript domain of the seeder's rendezvous link
pub const LINK_DOMAIN: &str = "HIDDENTUNNEL-LINK-V1";

/// Wrapper type for 64-byte signatures
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature64(pub [u8; SIGNATURE_LEN]);

impl std::fmt::Debug for Signature64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature64({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature64 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature64 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Signature64Visitor;

        impl<'de> serde::de::Visitor<'de> for Signature64Visitor {
            type Value = Signature64;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a 64-byte signature")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                <[u8; SIGNATURE_LEN]>::try_from(v)
                    .map(Signature64)
                    .map_err(|_| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut arr = [0u8; SIGNATURE_LEN];
                for (i, byte) in arr.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(Signature64(arr))
            }
        }

        deserializer.deserialize_bytes(Signature64Visitor)
    }
}

/// Rendezvous correlation token chosen by the downloader
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cookie([u8; 20]);

impl Cookie {
    pub fn generate() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cookie({})", hex::encode(&self.0[..6]))
    }
}

impl std::fmt::Display for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.0[..6]))
    }
}

/// Signed statement that `relay` is an introduction point of a seeder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntroRecord {
    pub seeder_key: PublicKey,
    pub relay: Peer,
    pub signature: Signature64,
}

impl IntroRecord {
    pub fn transcript_parts(service_id: &ServiceId, relay: &Peer) -> [Vec<u8>; 3] {
        [
            service_id.as_bytes().to_vec(),
            relay.public_key.as_bytes().to_vec(),
            relay.address.to_string().into_bytes(),
        ]
    }

    /// Check the seeder signature for `service_id`
    pub fn verify(&self, service_id: &ServiceId) -> bool {
        let parts = Self::transcript_parts(service_id, &self.relay);
        let parts: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        self.seeder_key
            .verify_transcript(INTRO_DOMAIN, &parts, &self.signature.0)
    }

    pub fn introduction_point(&self) -> IntroductionPoint {
        IntroductionPoint::new(self.relay, self.seeder_key)
    }
}

/// Result of a hop handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandshakeOutcome {
    Accepted {
        ephemeral_key: [u8; 32],

        /// Relay identity signature over the handshake transcript
        signature: Signature64,

        /// Relay's candidate peers, sealed under the new backward key
        #[serde(with = "serde_bytes")]
        candidates: Vec<u8>,
    },
    Rejected {
        reason: String,
    },
}

// ============================================================================
// Link-level packets
// ============================================================================

/// Everything that travels directly between two neighbours
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    /// Open a hop session on `circuit_id` with the receiver
    HopCreate {
        circuit_id: CircuitId,
        identifier: u32,
        ephemeral_key: [u8; 32],
    },

    HopCreated {
        circuit_id: CircuitId,
        identifier: u32,
        outcome: HandshakeOutcome,
    },

    /// Onion-encrypted cell travelling along a circuit
    Cell {
        circuit_id: CircuitId,
        #[serde(with = "serde_bytes")]
        onion: Vec<u8>,
    },

    DestroyCircuit {
        circuit_id: CircuitId,
        reason: String,
    },

    /// Relay-to-relay introduction point exchange
    PexGetIntroductionPoints { service_id: ServiceId },

    PexIntroductionPoints {
        service_id: ServiceId,
        records: Vec<IntroRecord>,
    },
}

impl Packet {
    pub fn message_type(&self) -> &str {
        match self {
            Self::HopCreate { .. } => "hop_create",
            Self::HopCreated { .. } => "hop_created",
            Self::Cell { .. } => "cell",
            Self::DestroyCircuit { .. } => "destroy_circuit",
            Self::PexGetIntroductionPoints { .. } => "pex_get_introduction_points",
            Self::PexIntroductionPoints { .. } => "pex_introduction_points",
        }
    }
}

// ============================================================================
// Cell payloads
// ============================================================================

/// Plaintext of a cell once the layer addressed to us has been removed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CellMessage {
    // Circuit construction
    HopExtend {
        identifier: u32,
        peer: PeerInfo,
        ephemeral_key: [u8; 32],
    },
    HopExtended {
        identifier: u32,
        outcome: HandshakeOutcome,
    },

    // Introduction points
    IntroductionPublish {
        service_id: ServiceId,
        seeder_key: PublicKey,

        /// Seeder signature of the resulting [`IntroRecord`]
        signature: Signature64,
    },
    IntroductionResponse {
        service_id: ServiceId,
    },

    // Rendezvous
    EstablishRendezvous {
        cookie: Cookie,
    },
    RendezvousEstablished {
        cookie: Cookie,
    },
    RendezvousRequest {
        service_id: ServiceId,
        seeder_key: PublicKey,
        cookie: Cookie,
        rendezvous: PeerInfo,

        /// Downloader half of the end-to-end exchange
        ephemeral_key: [u8; 32],
    },
    LinkRendezvous {
        cookie: Cookie,

        /// Seeder half of the end-to-end exchange
        ephemeral_key: [u8; 32],
        signature: Signature64,
    },
    RendezvousLinked {
        cookie: Cookie,
        ephemeral_key: [u8; 32],
        signature: Signature64,
    },

    // Peer exchange
    PexGetIntroductionPoints {
        service_id: ServiceId,
    },
    PexIntroductionPoints {
        service_id: ServiceId,
        records: Vec<IntroRecord>,
    },

    // Application data
    Data {
        source: SocketAddr,
        destination: SocketAddr,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
}

impl CellMessage {
    pub fn message_type(&self) -> &str {
        match self {
            Self::HopExtend { .. } => "hop_extend",
            Self::HopExtended { .. } => "hop_extended",
            Self::IntroductionPublish { .. } => "introduction_publish",
            Self::IntroductionResponse { .. } => "introduction_response",
            Self::EstablishRendezvous { .. } => "establish_rendezvous",
            Self::RendezvousEstablished { .. } => "rendezvous_established",
            Self::RendezvousRequest { .. } => "rendezvous_request",
            Self::LinkRendezvous { .. } => "link_rendezvous",
            Self::RendezvousLinked { .. } => "rendezvous_linked",
            Self::PexGetIntroductionPoints { .. } => "pex_get_introduction_points",
            Self::PexIntroductionPoints { .. } => "pex_introduction_points",
            Self::Data { .. } => "data",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    #[test]
    fn test_cookie_generation() {
        let cookie1 = Cookie::generate();
        let cookie2 = Cookie::generate();
        assert_ne!(cookie1, cookie2);
    }

    #[test]
    fn test_signature_serialization() {
        let signature = Signature64([7u8; SIGNATURE_LEN]);
        let serialized = bincode::serialize(&signature).unwrap();
        let deserialized: Signature64 = bincode::deserialize(&serialized).unwrap();
        assert_eq!(signature, deserialized);

        let short = bincode::serialize(&serde_bytes::Bytes::new(&[1u8; 10])).unwrap();
        assert!(bincode::deserialize::<Signature64>(&short).is_err());
    }

    #[test]
    fn test_intro_record_signature() {
        let seeder = KeyPair::generate();
        let relay = Peer::new(
            KeyPair::generate().public_key(),
            "127.0.0.1:4000".parse().unwrap(),
        );
        let service_id = ServiceId::from([b'0'; 20]);

        let parts = IntroRecord::transcript_parts(&service_id, &relay);
        let parts: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        let record = IntroRecord {
            seeder_key: seeder.public_key(),
            relay,
            signature: Signature64(seeder.sign_transcript(INTRO_DOMAIN, &parts)),
        };

        assert!(record.verify(&service_id));
        assert!(!record.verify(&ServiceId::from([b'1'; 20])));

        let mut moved = record;
        moved.relay.address = "127.0.0.1:4001".parse().unwrap();
        assert!(!moved.verify(&service_id));
    }
}
