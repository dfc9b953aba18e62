/// Wire protocol: closed message enums and their bincode framing
mod messages;

pub use messages::{
    CellMessage, Cookie, HandshakeOutcome, IntroRecord, Packet, Signature64, HANDSHAKE_DOMAIN,
    INTRO_DOMAIN, LINK_DOMAIN,
};

use hiddentunnel_common::{protocol::MAX_PACKET_SIZE, TunnelError};
use serde::{de::DeserializeOwned, Serialize};

/// Encode a message for the wire
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let bytes = bincode::serialize(message).map_err(|e| CodecError::Encode(e.to_string()))?;
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(CodecError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Decode a message received from the wire
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(CodecError::TooLarge(bytes.len()));
    }
    bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Message of {0} bytes exceeds the packet limit")]
    TooLarge(usize),
}

impl From<CodecError> for TunnelError {
    fn from(err: CodecError) -> Self {
        TunnelError::codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitId;

    #[test]
    fn test_packet_framing() {
        let packet = Packet::Cell {
            circuit_id: CircuitId(42),
            onion: vec![0xAB; 100],
        };
        let bytes = encode(&packet).unwrap();
        // bincode keeps the onion as one length-prefixed blob
        assert!(bytes.len() < 100 + 32);

        match decode::<Packet>(&bytes).unwrap() {
            Packet::Cell { circuit_id, onion } => {
                assert_eq!(circuit_id, CircuitId(42));
                assert_eq!(onion.len(), 100);
            }
            other => panic!("unexpected {}", other.message_type()),
        }
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(matches!(
            decode::<Packet>(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let cell = CellMessage::Data {
            source: "127.0.0.1:1".parse().unwrap(),
            destination: "127.0.0.1:2".parse().unwrap(),
            payload: vec![0; MAX_PACKET_SIZE],
        };
        assert!(matches!(encode(&cell), Err(CodecError::TooLarge(_))));
        assert!(matches!(
            decode::<CellMessage>(&vec![0; MAX_PACKET_SIZE + 1]),
            Err(CodecError::TooLarge(_))
        ));
    }
}
