//! Message hashing, signing and verification.

use std::fmt;

use crate::protocols::pbft::Envelope;
use crate::utils::KvError;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use rand::rngs::OsRng;

use serde::{Deserialize, Serialize};

use sha2::{Digest as _, Sha256};

/// 32-byte SHA-256 digest, used for request hashes, configuration hashes and
/// application state hashes.
#[derive(
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// SHA-256 of the given bytes.
    pub fn sha256(bytes: &[u8]) -> Self {
        Digest(Sha256::digest(bytes).into())
    }

    /// Full lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // short form is enough to tell digests apart in logs
        write!(f, "{}", &self.to_hex()[..12])
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

/// Cryptographic collaborator consumed by the consensus engine.
pub trait Crypto: Send + Sync {
    /// Hash of an envelope's signed content (sender, timestamp, payload).
    fn hash(&self, env: &Envelope) -> Digest;

    /// Stamps my identity onto the envelope and signs it.
    fn sign(&self, env: &mut Envelope) -> Result<(), KvError>;

    /// Checks the envelope's signature against its claimed sender.
    fn verify(&self, env: &Envelope) -> bool;
}

/// Ed25519-based crypto. A node's uuid is the hex encoding of its public
/// verifying key, so any envelope can be verified from its sender field
/// alone.
pub struct Ed25519Crypto {
    key: SigningKey,
    uuid: String,
}

impl Ed25519Crypto {
    /// Creates a crypto instance with a freshly generated key pair.
    pub fn generate() -> Self {
        Self::from_key(SigningKey::generate(&mut OsRng))
    }

    /// Creates a crypto instance from a hex-encoded 32-byte secret seed.
    pub fn from_seed_hex(seed: &str) -> Result<Self, KvError> {
        let bytes: [u8; 32] = hex::decode(seed.trim())?
            .try_into()
            .map_err(|_| KvError::msg("secret seed must be 32 bytes"))?;
        Ok(Self::from_key(SigningKey::from_bytes(&bytes)))
    }

    fn from_key(key: SigningKey) -> Self {
        let uuid = hex::encode(key.verifying_key().to_bytes());
        Ed25519Crypto { key, uuid }
    }

    /// My uuid, derived from my public key.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Hex encoding of my secret seed, for persisting the identity.
    pub fn seed_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    fn sender_key(sender: &str) -> Result<VerifyingKey, KvError> {
        let bytes: [u8; 32] = hex::decode(sender)?
            .try_into()
            .map_err(|_| KvError::msg("sender is not a 32-byte public key"))?;
        Ok(VerifyingKey::from_bytes(&bytes)?)
    }
}

impl Crypto for Ed25519Crypto {
    fn hash(&self, env: &Envelope) -> Digest {
        env.content_hash()
    }

    fn sign(&self, env: &mut Envelope) -> Result<(), KvError> {
        env.sender = self.uuid.clone();
        let signature = self.key.sign(&env.signing_bytes()?);
        env.signature = signature.to_bytes().to_vec();
        Ok(())
    }

    fn verify(&self, env: &Envelope) -> bool {
        let check = || -> Result<(), KvError> {
            let key = Self::sender_key(&env.sender)?;
            let signature = Signature::from_slice(&env.signature)?;
            key.verify_strict(&env.signing_bytes()?, &signature)?;
            Ok(())
        };
        check().is_ok()
    }
}

#[cfg(test)]
mod crypto_tests {
    use super::*;
    use crate::protocols::pbft::{DatabaseMsg, Payload};

    fn create_env(key: &str) -> Envelope {
        Envelope::new(Payload::Database(DatabaseMsg::Create {
            key: key.into(),
            value: "v".into(),
        }))
    }

    #[test]
    fn sign_then_verify() -> Result<(), KvError> {
        let crypto = Ed25519Crypto::generate();
        let mut env = create_env("k");
        crypto.sign(&mut env)?;
        assert_eq!(env.sender, crypto.uuid());
        assert!(crypto.verify(&env));
        // any other node can verify it too
        assert!(Ed25519Crypto::generate().verify(&env));
        Ok(())
    }

    #[test]
    fn tampered_rejected() -> Result<(), KvError> {
        let crypto = Ed25519Crypto::generate();
        let mut env = create_env("k");
        crypto.sign(&mut env)?;
        let mut forged = env.clone();
        forged.payload = create_env("other").payload;
        assert!(!crypto.verify(&forged));
        let mut resent = env.clone();
        resent.sender = Ed25519Crypto::generate().uuid().into();
        assert!(!crypto.verify(&resent));
        let mut unsigned = env;
        unsigned.signature.clear();
        assert!(!crypto.verify(&unsigned));
        Ok(())
    }

    #[test]
    fn hash_ignores_signature() -> Result<(), KvError> {
        let crypto = Ed25519Crypto::generate();
        let mut env = create_env("k");
        env.sender = crypto.uuid().into();
        let before = crypto.hash(&env);
        crypto.sign(&mut env)?;
        assert_eq!(crypto.hash(&env), before);
        Ok(())
    }

    #[test]
    fn seed_roundtrip_keeps_identity() -> Result<(), KvError> {
        let crypto = Ed25519Crypto::generate();
        let again = Ed25519Crypto::from_seed_hex(&crypto.seed_hex())?;
        assert_eq!(again.uuid(), crypto.uuid());
        assert!(Ed25519Crypto::from_seed_hex("abcd").is_err());
        Ok(())
    }
}
