//! Node identities derived from persisted seeds

use crate::error::{NetworkError, NetworkResult};
use bidmesh_storage::KeyValueStore;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Store key holding the node's 32-byte identity seed
pub const SEED_KEY: &str = "node-seed";

/// Opaque, stable name of a node.
///
/// Lowercase hex of the compressed secp256k1 public key, so an identity can
/// verify signatures made by its owner.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap an identity string
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Full identity string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs and prompts
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        self.0.get(..end).unwrap_or(&self.0)
    }

    fn verifying_key(&self) -> NetworkResult<VerifyingKey> {
        let bytes = hex::decode(&self.0)
            .map_err(|e| NetworkError::Crypto(format!("identity is not hex: {}", e)))?;
        VerifyingKey::from_sec1_bytes(&bytes)
            .map_err(|e| NetworkError::Crypto(format!("identity is not a public key: {}", e)))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Signing key of the local node together with its identity
pub struct NodeKey {
    signing_key: SigningKey,
    identity: Identity,
}

impl NodeKey {
    /// Derive the key from seed bytes
    pub fn from_seed(seed: &[u8]) -> NetworkResult<Self> {
        let signing_key =
            SigningKey::from_slice(seed).map_err(|e| NetworkError::Crypto(e.to_string()))?;
        let encoded = signing_key.verifying_key().to_encoded_point(true);
        let identity = Identity(hex::encode(encoded.as_bytes()));
        Ok(Self {
            signing_key,
            identity,
        })
    }

    /// Load the seed from `store`, generating and persisting one if absent
    pub fn load_or_generate(store: &dyn KeyValueStore) -> NetworkResult<Self> {
        if let Some(seed) = store.get(SEED_KEY)? {
            return Self::from_seed(&seed);
        }

        loop {
            let mut seed = [0u8; 32];
            rand::Rng::fill(&mut rand::thread_rng(), &mut seed);
            // A seed outside the curve order is astronomically unlikely; draw again.
            if let Ok(key) = Self::from_seed(&seed) {
                store.set(SEED_KEY, &seed)?;
                info!(identity = %key.identity.short(), "generated new identity seed");
                return Ok(key);
            }
        }
    }

    /// This node's identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Sign `message`, returning the hex-encoded signature
    pub fn sign(&self, message: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(message);
        hex::encode(signature.to_bytes())
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKey")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Verify that `signature` over `message` was made by `identity`
pub fn verify(identity: &Identity, message: &[u8], signature: &str) -> NetworkResult<()> {
    let key = identity.verifying_key()?;
    let bytes = hex::decode(signature)
        .map_err(|e| NetworkError::Crypto(format!("signature is not hex: {}", e)))?;
    let signature =
        Signature::from_slice(&bytes).map_err(|e| NetworkError::Crypto(e.to_string()))?;
    key.verify(message, &signature)
        .map_err(|_| NetworkError::Crypto("signature verification failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidmesh_storage::MemoryStore;

    #[test]
    fn test_identity_is_compressed_pubkey_hex() {
        let key = NodeKey::from_seed(&[1u8; 32]).unwrap();
        let id = key.identity();
        assert_eq!(id.as_str().len(), 66);
        assert!(id.as_str().starts_with("02") || id.as_str().starts_with("03"));
    }

    #[test]
    fn test_same_seed_same_identity() {
        let a = NodeKey::from_seed(&[9u8; 32]).unwrap();
        let b = NodeKey::from_seed(&[9u8; 32]).unwrap();
        let c = NodeKey::from_seed(&[8u8; 32]).unwrap();
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn test_invalid_seed_rejected() {
        assert!(NodeKey::from_seed(&[0u8; 32]).is_err());
        assert!(NodeKey::from_seed(&[1u8; 5]).is_err());
    }

    #[test]
    fn test_load_or_generate_persists_seed() {
        let store = MemoryStore::new();
        let first = NodeKey::load_or_generate(&store).unwrap();
        assert!(store.get(SEED_KEY).unwrap().is_some());

        let second = NodeKey::load_or_generate(&store).unwrap();
        assert_eq!(first.identity(), second.identity());
    }

    #[test]
    fn test_sign_verify() {
        let key = NodeKey::from_seed(&[3u8; 32]).unwrap();
        let sig = key.sign(b"hello mesh");
        verify(key.identity(), b"hello mesh", &sig).unwrap();

        assert!(verify(key.identity(), b"tampered", &sig).is_err());

        let other = NodeKey::from_seed(&[4u8; 32]).unwrap();
        assert!(verify(other.identity(), b"hello mesh", &sig).is_err());
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let key = NodeKey::from_seed(&[3u8; 32]).unwrap();
        assert!(verify(key.identity(), b"m", "zz").is_err());
        assert!(verify(&Identity::new("not-a-key"), b"m", &key.sign(b"m")).is_err());
    }

    #[test]
    fn test_identity_display_and_short() {
        let id = Identity::new("0123456789abcdef0123");
        assert_eq!(id.to_string(), "0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(format!("{:?}", id), "Identity(0123456789ab)");
        assert_eq!(Identity::new("abc").short(), "abc");
    }

    #[test]
    fn test_identity_serde_transparent() {
        let id = Identity::new("02abcd");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"02abcd\"");
        let back: Identity = serde_json::from_str("\"02abcd\"").unwrap();
        assert_eq!(back, id);
    }
}
