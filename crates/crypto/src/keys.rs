//! Node identities and the Key/Identity Store boundary.
//!
//! Each node holds two long-term keys: an X25519 relay key (onion layers and
//! probe challenges are encrypted to it) and an Ed25519 attestation key
//! (proof-of-relay receipts and key-exchange offers are signed with it).
//! The store is assumed hardware-backed; nothing in SwarmLink persists raw
//! key material.

use crate::session::SessionKeyPair;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use swarmlink_core::{ChannelKind, NodeId};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Key store errors.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// No public keys are known for the peer
    #[error("Unknown peer: {node_id}")]
    UnknownPeer { node_id: NodeId },

    /// The requested key scope is not provisioned
    #[error("Key scope not provisioned: {0:?}")]
    ScopeUnavailable(KeyScope),

    /// Session key generation failed
    #[error("Session key generation failed: {0}")]
    SessionKey(String),
}

/// Which long-term private key is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    /// X25519 key that onion layers are addressed to
    Relay,
    /// Ed25519 key that signs receipts and offers
    Attestation,
}

/// A private key handed out by the store for one operation.
///
/// Both variants zeroize their secret on drop.
pub enum PrivateKey {
    /// X25519 relay secret
    Relay(StaticSecret),
    /// Ed25519 signing key
    Attestation(SigningKey),
}

/// Public half of a node's identity, as distributed to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    /// Node identifier
    pub node_id: NodeId,
    /// X25519 relay public key
    pub relay_key: [u8; 32],
    /// Ed25519 attestation public key
    pub attestation_key: [u8; 32],
}

impl PublicIdentity {
    /// Relay key as an X25519 public key.
    pub fn relay_public(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.relay_key)
    }

    /// Attestation key as an Ed25519 verifying key.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.attestation_key).ok()
    }

    /// Verify an Ed25519 signature by this node.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.verifying_key() else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(&bytes)).is_ok()
    }

    /// Short stable identifier of the key material (hex, 16 bytes of BLAKE3).
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.relay_key);
        hasher.update(&self.attestation_key);
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

/// Full identity of the local node (both private keys).
pub struct NodeIdentity {
    node_id: NodeId,
    relay_secret: StaticSecret,
    signing_key: SigningKey,
}

impl NodeIdentity {
    /// Generate a fresh identity from the OS RNG.
    pub fn generate(node_id: impl Into<NodeId>) -> Self {
        let mut rng = rand::thread_rng();
        let mut relay_bytes = [0u8; 32];
        let mut signing_bytes = [0u8; 32];
        rng.fill_bytes(&mut relay_bytes);
        rng.fill_bytes(&mut signing_bytes);

        let identity = Self::from_secret_bytes(node_id, relay_bytes, signing_bytes);
        relay_bytes.zeroize();
        signing_bytes.zeroize();
        identity
    }

    /// Build an identity from provisioned secret bytes.
    pub fn from_secret_bytes(
        node_id: impl Into<NodeId>,
        relay_secret: [u8; 32],
        signing_secret: [u8; 32],
    ) -> Self {
        Self {
            node_id: node_id.into(),
            relay_secret: StaticSecret::from(relay_secret),
            signing_key: SigningKey::from_bytes(&signing_secret),
        }
    }

    /// Node identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Public identity to distribute to peers.
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            node_id: self.node_id.clone(),
            relay_key: X25519PublicKey::from(&self.relay_secret).to_bytes(),
            attestation_key: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// X25519 relay secret.
    pub fn relay_secret(&self) -> &StaticSecret {
        &self.relay_secret
    }

    /// Sign with the attestation key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl Clone for NodeIdentity {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            relay_secret: self.relay_secret.clone(),
            signing_key: self.signing_key.clone(),
        }
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Key/Identity Store collaborator.
///
/// Implementations are expected to be hardware-backed; the core only borrows
/// keys for the duration of one cryptographic operation.
pub trait KeyStore: Send + Sync {
    /// Local node identifier.
    fn local_node_id(&self) -> NodeId;

    /// Private key for `scope`.
    fn private_key(&self, scope: KeyScope) -> Result<PrivateKey, KeyStoreError>;

    /// Public identity of a peer.
    fn peer_public_key(&self, node_id: &str) -> Result<PublicIdentity, KeyStoreError>;

    /// Fresh ephemeral key pair for a channel handshake.
    fn rotate_session_key(&self, channel: ChannelKind) -> Result<SessionKeyPair, KeyStoreError>;
}

/// In-memory key store for simulations and tests.
pub struct MemoryKeyStore {
    identity: NodeIdentity,
    peers: RwLock<HashMap<NodeId, PublicIdentity>>,
}

impl MemoryKeyStore {
    /// Create a store holding the local identity.
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a peer's public identity.
    pub fn add_peer(&self, peer: PublicIdentity) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.node_id.clone(), peer);
    }

    /// Local identity.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }
}

impl KeyStore for MemoryKeyStore {
    fn local_node_id(&self) -> NodeId {
        self.identity.node_id.clone()
    }

    fn private_key(&self, scope: KeyScope) -> Result<PrivateKey, KeyStoreError> {
        Ok(match scope {
            KeyScope::Relay => PrivateKey::Relay(self.identity.relay_secret.clone()),
            KeyScope::Attestation => PrivateKey::Attestation(self.identity.signing_key.clone()),
        })
    }

    fn peer_public_key(&self, node_id: &str) -> Result<PublicIdentity, KeyStoreError> {
        if node_id == self.identity.node_id {
            return Ok(self.identity.public());
        }
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
            .ok_or_else(|| KeyStoreError::UnknownPeer {
                node_id: node_id.to_string(),
            })
    }

    fn rotate_session_key(&self, channel: ChannelKind) -> Result<SessionKeyPair, KeyStoreError> {
        tracing::debug!(channel = %channel, "Generating session key pair");
        SessionKeyPair::generate().map_err(|e| KeyStoreError::SessionKey(e.to_string()))
    }
}

/// Assemble the local identity from the store for one operation.
///
/// Both secrets are zeroized when the returned value is dropped; callers
/// must not keep it beyond the operation.
pub fn borrow_identity(store: &dyn KeyStore) -> Result<NodeIdentity, KeyStoreError> {
    let relay_secret = match store.private_key(KeyScope::Relay)? {
        PrivateKey::Relay(secret) => secret,
        PrivateKey::Attestation(_) => return Err(KeyStoreError::ScopeUnavailable(KeyScope::Relay)),
    };
    let signing_key = match store.private_key(KeyScope::Attestation)? {
        PrivateKey::Attestation(key) => key,
        PrivateKey::Relay(_) => {
            return Err(KeyStoreError::ScopeUnavailable(KeyScope::Attestation))
        }
    };
    Ok(NodeIdentity {
        node_id: store.local_node_id(),
        relay_secret,
        signing_key,
    })
}
