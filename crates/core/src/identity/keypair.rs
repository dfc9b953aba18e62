use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of an Ed25519 signature
pub const SIGNATURE_LEN: usize = 64;

/// An Ed25519 keypair, used both as a node identity and as a per-service
/// seeder key
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut secret_bytes);
        Self::from_secret_bytes(&secret_bytes)
    }

    /// Create a keypair from a secret key
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: self.verifying_key,
        }
    }

    /// Sign a raw message
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Sign a domain separated transcript of several fields
    ///
    /// The fields are hashed with their lengths, so `["ab", "c"]` and
    /// `["a", "bc"]` produce different signatures.
    pub fn sign_transcript(&self, domain: &str, parts: &[&[u8]]) -> [u8; SIGNATURE_LEN] {
        self.sign(&transcript_digest(domain, parts))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.verifying_key.to_bytes()))
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

fn transcript_digest(domain: &str, parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// A public key for verifying signatures
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(with = "public_key_serde")]
    key: VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyPairError> {
        let key = VerifyingKey::from_bytes(bytes).map_err(|_| KeyPairError::InvalidPublicKey)?;
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// Verify a signature given as a slice; wrong lengths never verify
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
            return false;
        };
        self.key
            .verify(message, &Signature::from_bytes(&bytes))
            .is_ok()
    }

    /// Verify a signature produced by [`KeyPair::sign_transcript`]
    pub fn verify_transcript(&self, domain: &str, parts: &[&[u8]], signature: &[u8]) -> bool {
        self.verify(&transcript_digest(domain, parts), signature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.as_bytes()[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

/// Errors related to keypair operations
#[derive(Debug, thiserror::Error)]
pub enum KeyPairError {
    #[error("Invalid public key")]
    InvalidPublicKey,
}

// VerifyingKey goes over the wire as its 32 compressed bytes
mod public_key_serde {
    use ed25519_dalek::VerifyingKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &VerifyingKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        key.to_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<VerifyingKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: [u8; 32] = Deserialize::deserialize(deserializer)?;
        VerifyingKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_from_bytes() {
        let keypair1 = KeyPair::generate();
        let keypair2 = KeyPair::from_secret_bytes(&keypair1.secret_bytes());
        assert_eq!(keypair1.public_key(), keypair2.public_key());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let public_key = keypair.public_key();

        let signature = keypair.sign(b"hop transcript");
        assert!(public_key.verify(b"hop transcript", &signature));
        assert!(!public_key.verify(b"other transcript", &signature));
        assert!(!public_key.verify(b"hop transcript", &signature[..63]));
    }

    #[test]
    fn test_transcript_field_boundaries() {
        let keypair = KeyPair::generate();
        let public_key = keypair.public_key();

        let signature = keypair.sign_transcript("test domain", &[b"ab", b"c"]);
        assert!(public_key.verify_transcript("test domain", &[b"ab", b"c"], &signature));
        assert!(!public_key.verify_transcript("test domain", &[b"a", b"bc"], &signature));
        assert!(!public_key.verify_transcript("other domain", &[b"ab", b"c"], &signature));
    }

    #[test]
    fn test_public_key_serialization() {
        let public_key = KeyPair::generate().public_key();

        let serialized = bincode::serialize(&public_key).unwrap();
        assert_eq!(serialized.len(), 32);
        let deserialized: PublicKey = bincode::deserialize(&serialized).unwrap();

        assert_eq!(public_key, deserialized);
    }
}
