use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, SharedSecret};

/// Size of the random nonce carried in front of every layer
pub const NONCE_LEN: usize = 12;

/// Bytes one onion layer adds: nonce, marker byte and Poly1305 tag
pub const LAYER_OVERHEAD: usize = NONCE_LEN + 1 + 16;

const HOP_FORWARD_CONTEXT: &[u8] = b"HIDDENTUNNEL-HOP-FORWARD-V1";
const HOP_BACKWARD_CONTEXT: &[u8] = b"HIDDENTUNNEL-HOP-BACKWARD-V1";
const E2E_FORWARD_CONTEXT: &[u8] = b"HIDDENTUNNEL-E2E-FORWARD-V1";
const E2E_BACKWARD_CONTEXT: &[u8] = b"HIDDENTUNNEL-E2E-BACKWARD-V1";

/// What the holder of a layer key should do with the peeled body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerMarker {
    /// Pass the body on along the route
    Relay,
    /// The body is addressed to the holder of this layer
    Deliver,
}

impl LayerMarker {
    fn to_byte(self) -> u8 {
        match self {
            Self::Relay => 0,
            Self::Deliver => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Relay),
            1 => Some(Self::Deliver),
            _ => None,
        }
    }
}

/// Result of peeling exactly one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peeled {
    pub marker: LayerMarker,
    pub body: Vec<u8>,
}

/// Ephemeral key pair for X25519 Diffie-Hellman
///
/// Not Clone: the secret is consumed by the exchange.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: X25519PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Perform the exchange, consuming the secret
    pub fn diffie_hellman(self, their_public: &[u8; 32]) -> SharedSecret {
        self.secret
            .diffie_hellman(&X25519PublicKey::from(*their_public))
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

/// One direction of one onion layer
#[derive(Clone)]
pub struct LayerCipher {
    cipher: ChaCha20Poly1305,
}

// ChaCha20Poly1305 doesn't implement Debug
impl std::fmt::Debug for LayerCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerCipher")
            .field("cipher", &"<ChaCha20Poly1305>")
            .finish()
    }
}

impl LayerCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(&key.into()),
        }
    }

    /// Encrypt `body` behind `marker` under a fresh random nonce
    ///
    /// Every layer carries its own nonce, so relays and endpoints never need
    /// to keep counters in step with each other.
    pub fn seal(&self, marker: LayerMarker, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let mut plaintext = Vec::with_capacity(body.len() + 1);
        plaintext.push(marker.to_byte());
        plaintext.extend_from_slice(body);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Remove one layer
    pub fn open(&self, sealed: &[u8]) -> Result<Peeled, CryptoError> {
        if sealed.len() < LAYER_OVERHEAD {
            return Err(CryptoError::Truncated(sealed.len()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let mut plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Integrity)?;

        let marker = LayerMarker::from_byte(plaintext[0]).ok_or(CryptoError::UnknownMarker)?;
        plaintext.remove(0);
        Ok(Peeled {
            marker,
            body: plaintext,
        })
    }
}

/// Keys shared by a circuit originator and one of its hops
#[derive(Debug, Clone)]
pub struct SessionKeys {
    /// Originator to hop
    pub forward: LayerCipher,
    /// Hop to originator
    pub backward: LayerCipher,
}

/// End-to-end layer held by each side of a linked rendezvous circuit
#[derive(Debug, Clone)]
pub struct E2eSession {
    send: LayerCipher,
    recv: LayerCipher,
}

impl E2eSession {
    /// Session of the side that proposed the exchange (the downloader)
    pub fn initiator(keys: SessionKeys) -> Self {
        Self {
            send: keys.forward,
            recv: keys.backward,
        }
    }

    /// Session of the side that answered the exchange (the seeder)
    pub fn responder(keys: SessionKeys) -> Self {
        Self {
            send: keys.backward,
            recv: keys.forward,
        }
    }

    pub fn send_layer(&self) -> &LayerCipher {
        &self.send
    }

    pub fn recv_layer(&self) -> &LayerCipher {
        &self.recv
    }
}

/// Onion encryption helpers
pub struct OnionCrypto;

impl OnionCrypto {
    /// Derive the per-hop session keys from a handshake secret
    pub fn derive_hop_keys(shared_secret: &SharedSecret) -> SessionKeys {
        Self::derive(shared_secret, HOP_FORWARD_CONTEXT, HOP_BACKWARD_CONTEXT)
    }

    /// Derive the end-to-end keys of a rendezvous link
    pub fn derive_e2e_keys(shared_secret: &SharedSecret) -> SessionKeys {
        Self::derive(shared_secret, E2E_FORWARD_CONTEXT, E2E_BACKWARD_CONTEXT)
    }

    fn derive(shared_secret: &SharedSecret, forward: &[u8], backward: &[u8]) -> SessionKeys {
        let derive_key = |context: &[u8]| {
            let mut hasher = blake3::Hasher::new_keyed(shared_secret.as_bytes());
            hasher.update(context);
            *hasher.finalize().as_bytes()
        };

        SessionKeys {
            forward: LayerCipher::new(derive_key(forward)),
            backward: LayerCipher::new(derive_key(backward)),
        }
    }

    /// Wrap `plaintext` in one layer per key, innermost key first
    ///
    /// The innermost layer is marked [`LayerMarker::Deliver`] and every outer
    /// layer [`LayerMarker::Relay`], so the holder of the outermost key strips
    /// one layer and passes the rest on until the innermost holder consumes it.
    pub fn layer_encrypt(
        layers_innermost_first: &[&LayerCipher],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let (innermost, outer) = layers_innermost_first
            .split_first()
            .ok_or(CryptoError::NoLayers)?;

        let mut data = innermost.seal(LayerMarker::Deliver, plaintext)?;
        for layer in outer {
            data = layer.seal(LayerMarker::Relay, &data)?;
        }
        Ok(data)
    }

    /// Peel exactly one layer
    pub fn layer_decrypt(layer: &LayerCipher, ciphertext: &[u8]) -> Result<Peeled, CryptoError> {
        layer.open(ciphertext)
    }
}

/// Cryptographic errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Authentication tag mismatch")]
    Integrity,

    #[error("Layer too short ({0} bytes)")]
    Truncated(usize),

    #[error("Unknown layer marker")]
    UnknownMarker,

    #[error("No layers to encrypt with")]
    NoLayers,
}

impl CryptoError {
    /// Whether this failure means the data was tampered with or keyed wrongly
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::Integrity | Self::Truncated(_) | Self::UnknownMarker
        )
    }
}

impl From<CryptoError> for hiddentunnel_common::TunnelError {
    fn from(err: CryptoError) -> Self {
        if err.is_integrity() {
            Self::integrity(err.to_string())
        } else {
            Self::crypto(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (SessionKeys, SessionKeys) {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();
        let alice_public = alice.public_key_bytes();
        let bob_public = bob.public_key_bytes();

        let alice_shared = alice.diffie_hellman(&bob_public);
        let bob_shared = bob.diffie_hellman(&alice_public);
        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());

        (
            OnionCrypto::derive_hop_keys(&alice_shared),
            OnionCrypto::derive_hop_keys(&bob_shared),
        )
    }

    #[test]
    fn test_layer_roundtrip_both_directions() {
        let (originator, hop) = session_pair();

        let sealed = originator.forward.seal(LayerMarker::Deliver, b"extend").unwrap();
        let peeled = hop.forward.open(&sealed).unwrap();
        assert_eq!(peeled.marker, LayerMarker::Deliver);
        assert_eq!(peeled.body, b"extend");

        let sealed = hop.backward.seal(LayerMarker::Relay, b"extended").unwrap();
        let peeled = originator.backward.open(&sealed).unwrap();
        assert_eq!(peeled.marker, LayerMarker::Relay);
        assert_eq!(peeled.body, b"extended");
    }

    #[test]
    fn test_directions_use_different_keys() {
        let (originator, hop) = session_pair();
        let sealed = originator.forward.seal(LayerMarker::Deliver, b"data").unwrap();
        assert!(matches!(hop.backward.open(&sealed), Err(CryptoError::Integrity)));
    }

    #[test]
    fn test_same_plaintext_gives_different_ciphertexts() {
        let (originator, _) = session_pair();
        let ct1 = originator.forward.seal(LayerMarker::Relay, b"Test").unwrap();
        let ct2 = originator.forward.seal(LayerMarker::Relay, b"Test").unwrap();
        assert_ne!(ct1, ct2);
        assert_eq!(ct1.len(), 4 + LAYER_OVERHEAD);
    }

    #[test]
    fn test_multi_layer_onion_peels_in_order() {
        let sessions: Vec<(SessionKeys, SessionKeys)> = (0..3).map(|_| session_pair()).collect();

        // innermost layer belongs to the last hop
        let layers: Vec<&LayerCipher> = sessions
            .iter()
            .rev()
            .map(|(originator, _)| &originator.forward)
            .collect();
        let mut data = OnionCrypto::layer_encrypt(&layers, b"Secret message").unwrap();

        for (index, (_, hop)) in sessions.iter().enumerate() {
            let peeled = OnionCrypto::layer_decrypt(&hop.forward, &data).unwrap();
            let expected = if index == 2 {
                LayerMarker::Deliver
            } else {
                LayerMarker::Relay
            };
            assert_eq!(peeled.marker, expected);
            data = peeled.body;
        }
        assert_eq!(data, b"Secret message");
    }

    #[test]
    fn test_tampered_layer_is_integrity_error() {
        let (originator, hop) = session_pair();
        let mut sealed = originator.forward.seal(LayerMarker::Deliver, b"cell").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let err = OnionCrypto::layer_decrypt(&hop.forward, &sealed).unwrap_err();
        assert!(err.is_integrity());
        assert!(matches!(
            OnionCrypto::layer_decrypt(&hop.forward, &sealed[..8]),
            Err(CryptoError::Truncated(8))
        ));
    }

    #[test]
    fn test_e2e_roles_mirror_each_other() {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();
        let bob_public = bob.public_key_bytes();
        let alice_public = alice.public_key_bytes();

        let downloader = E2eSession::initiator(OnionCrypto::derive_e2e_keys(
            &alice.diffie_hellman(&bob_public),
        ));
        let seeder = E2eSession::responder(OnionCrypto::derive_e2e_keys(
            &bob.diffie_hellman(&alice_public),
        ));

        let sealed = downloader.send_layer().seal(LayerMarker::Deliver, b"PACKET").unwrap();
        assert_eq!(seeder.recv_layer().open(&sealed).unwrap().body, b"PACKET");

        let sealed = seeder.send_layer().seal(LayerMarker::Deliver, b"REPLY").unwrap();
        assert_eq!(downloader.recv_layer().open(&sealed).unwrap().body, b"REPLY");
    }

    #[test]
    fn test_layer_encrypt_needs_a_key() {
        assert!(matches!(
            OnionCrypto::layer_encrypt(&[], b"x"),
            Err(CryptoError::NoLayers)
        ));
    }
}
