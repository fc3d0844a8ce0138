//! Per-channel session ciphers with X25519 key exchange and ChaCha20-Poly1305 AEAD.
//!
//! Every channel a mode activates needs an authenticated session before the
//! controller commits traffic to it. A session is created from an X25519
//! exchange carried by the channel's handshake, lives in [`ChannelSessions`],
//! and is purged (zeroized and removed) when the mode that used it is left.
//!
//! # Security Model
//!
//! - Sessions are ephemeral and rotated after a message or time budget
//! - Offers are signed with the sender's Ed25519 attestation key and verified
//!   before the exchange completes
//! - A purged session is gone: sealing or opening on that channel fails with
//!   [`SessionError::AuthenticationFailed`] until a new handshake succeeds
//! - Shared secrets and ciphers are zeroized on drop

use crate::keys::{NodeIdentity, PublicIdentity};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce as ChaCha20Nonce,
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use swarmlink_core::ChannelKind;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, SharedSecret};

/// Maximum number of messages before forced key rotation.
const MAX_MESSAGES_PER_EPOCH: u64 = 10_000;

/// Maximum time duration before forced key rotation (1 hour).
const MAX_EPOCH_DURATION_SECS: u64 = 3600;

/// Nonce size for ChaCha20-Poly1305 (96 bits / 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Session cipher error types.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Authentication failed on {channel}: {reason}")]
    AuthenticationFailed { channel: ChannelKind, reason: String },

    #[error("Key exchange failed: {0}")]
    KeyExchange(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Key rotation required")]
    RotationRequired,

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for session cipher operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Ephemeral session key pair for X25519 key exchange.
///
/// The secret key is automatically zeroized when dropped.
pub struct SessionKeyPair {
    pub public: X25519PublicKey,
    secret: Option<EphemeralSecret>,
}

impl SessionKeyPair {
    /// Generate a new ephemeral keypair using hardware entropy if available.
    pub fn generate() -> SessionResult<Self> {
        let mut rng = HardwareRng::new()?;
        let secret = EphemeralSecret::random_from_rng(&mut rng);
        let public = X25519PublicKey::from(&secret);

        Ok(Self {
            public,
            secret: Some(secret),
        })
    }

    /// Compute shared secret with peer's public key.
    pub fn compute_shared_secret(
        &mut self,
        peer_public: &X25519PublicKey,
    ) -> SessionResult<SharedSecret> {
        let secret = self
            .secret
            .take()
            .ok_or_else(|| SessionError::InvalidState("Secret key already consumed".to_string()))?;
        Ok(secret.diffie_hellman(peer_public))
    }
}

/// Key exchange handshake message.
///
/// Carries the ephemeral public key for one channel and is signed with the
/// sender's long-term Ed25519 attestation key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchangeMessage {
    /// Ephemeral X25519 public key
    pub public_key: [u8; 32],

    /// Sender's node ID
    pub sender_id: String,

    /// Channel the session is for
    pub channel: ChannelKind,

    /// Timestamp of key generation (Unix epoch microseconds)
    pub timestamp: u64,

    /// Epoch number for this key rotation
    pub epoch: u64,

    /// Ed25519 signature over [`KeyExchangeMessage::message_to_sign`]
    pub signature: Vec<u8>,
}

impl KeyExchangeMessage {
    /// Create a new key exchange message (signature must be added separately).
    pub fn new(public_key: X25519PublicKey, sender_id: String, channel: ChannelKind, epoch: u64) -> Self {
        Self {
            public_key: public_key.to_bytes(),
            sender_id,
            channel,
            timestamp: current_timestamp_us(),
            epoch,
            signature: Vec::new(),
        }
    }

    /// Get the message bytes to sign.
    pub fn message_to_sign(&self) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&self.public_key);
        msg.extend_from_slice(self.sender_id.as_bytes());
        msg.extend_from_slice(self.channel.as_str().as_bytes());
        msg.extend_from_slice(&self.timestamp.to_le_bytes());
        msg.extend_from_slice(&self.epoch.to_le_bytes());
        msg
    }

    /// Sign with the local attestation key.
    pub fn sign(mut self, identity: &NodeIdentity) -> Self {
        self.signature = identity.sign(&self.message_to_sign()).to_vec();
        self
    }

    /// Verify the signature against the sender's published identity.
    pub fn verify(&self, sender: &PublicIdentity) -> bool {
        sender.node_id == self.sender_id && sender.verify(&self.message_to_sign(), &self.signature)
    }

    /// Extract the X25519 public key.
    pub fn to_public_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.public_key)
    }
}

/// Sealed frame produced by a session cipher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedFrame {
    /// Epoch of the key that sealed the frame
    pub epoch: u64,
    /// AEAD nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with authentication tag
    pub ciphertext: Vec<u8>,
}

impl SealedFrame {
    /// Wire encoding: epoch (8, LE) || nonce (12) || ciphertext.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.epoch.to_le_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the wire encoding.
    pub fn from_bytes(bytes: &[u8]) -> SessionResult<Self> {
        if bytes.len() < 8 + NONCE_SIZE {
            return Err(SessionError::Decryption("frame too short".to_string()));
        }
        let mut epoch = [0u8; 8];
        epoch.copy_from_slice(&bytes[..8]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[8..8 + NONCE_SIZE]);
        Ok(Self {
            epoch: u64::from_le_bytes(epoch),
            nonce,
            ciphertext: bytes[8 + NONCE_SIZE..].to_vec(),
        })
    }
}

/// Session cipher state managing encryption/decryption with automatic rotation.
pub struct SessionCipher {
    /// Current ChaCha20-Poly1305 cipher instance
    cipher: ChaCha20Poly1305,

    /// Shared secret (zeroized on rotation via Drop)
    shared_secret: Option<SharedSecret>,

    /// Current epoch number
    epoch: u64,

    /// Message counter within this epoch
    message_count: u64,

    /// Epoch start time
    epoch_start: SystemTime,

    /// Maximum messages per epoch before rotation
    max_messages_per_epoch: u64,

    /// Maximum epoch duration before rotation
    max_epoch_duration: Duration,
}

impl SessionCipher {
    /// Create a new session cipher from a shared secret.
    pub fn new(shared_secret: SharedSecret, epoch: u64) -> Self {
        let cipher = derive_cipher(&shared_secret);

        Self {
            cipher,
            shared_secret: Some(shared_secret),
            epoch,
            message_count: 0,
            epoch_start: SystemTime::now(),
            max_messages_per_epoch: MAX_MESSAGES_PER_EPOCH,
            max_epoch_duration: Duration::from_secs(MAX_EPOCH_DURATION_SECS),
        }
    }

    /// Check if key rotation is required.
    pub fn rotation_required(&self) -> bool {
        self.message_count >= self.max_messages_per_epoch
            || self.epoch_start.elapsed().unwrap_or(Duration::ZERO) >= self.max_epoch_duration
    }

    /// Encrypt plaintext with authenticated encryption.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> SessionResult<SealedFrame> {
        if self.rotation_required() {
            return Err(SessionError::RotationRequired);
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        let mut rng = HardwareRng::new()?;
        rng.fill_bytes(&mut nonce_bytes);

        let nonce = ChaCha20Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SessionError::Encryption(e.to_string()))?;

        self.message_count += 1;

        Ok(SealedFrame {
            epoch: self.epoch,
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    /// Decrypt ciphertext with authenticated decryption.
    pub fn decrypt(&mut self, frame: &SealedFrame) -> SessionResult<Vec<u8>> {
        if frame.epoch != self.epoch {
            return Err(SessionError::Decryption(format!(
                "frame epoch {} does not match session epoch {}",
                frame.epoch, self.epoch
            )));
        }

        let nonce = ChaCha20Nonce::from_slice(&frame.nonce);

        let plaintext = self
            .cipher
            .decrypt(nonce, frame.ciphertext.as_slice())
            .map_err(|e| SessionError::Decryption(e.to_string()))?;

        self.message_count += 1;

        Ok(plaintext)
    }

    /// Rotate to a new session key.
    ///
    /// The old shared secret is zeroized automatically via Drop.
    pub fn rotate(&mut self, new_shared_secret: SharedSecret) {
        self.cipher = derive_cipher(&new_shared_secret);
        self.shared_secret = Some(new_shared_secret);
        self.epoch += 1;
        self.message_count = 0;
        self.epoch_start = SystemTime::now();
    }

    /// Get current epoch number.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Get message count in current epoch.
    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Configure maximum messages per epoch (for testing).
    #[cfg(test)]
    pub fn set_max_messages(&mut self, max: u64) {
        self.max_messages_per_epoch = max;
    }
}

impl Drop for SessionCipher {
    fn drop(&mut self) {
        // SharedSecret is zeroized by its own Drop impl
        self.shared_secret = None;
    }
}

fn derive_cipher(shared_secret: &SharedSecret) -> ChaCha20Poly1305 {
    let key_bytes = blake3::derive_key("swarmlink channel session v1", shared_secret.as_bytes());
    ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key_bytes))
}

struct PendingExchange {
    keypair: SessionKeyPair,
    epoch: u64,
}

/// Channel sessions owned by one node.
///
/// Thread-safe: the mode controller establishes and purges sessions while the
/// facade seals outbound frames concurrently.
#[derive(Default)]
pub struct ChannelSessions {
    pending: Mutex<HashMap<ChannelKind, PendingExchange>>,
    active: Mutex<HashMap<ChannelKind, SessionCipher>>,
}

impl ChannelSessions {
    /// Create an empty session table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a handshake on `channel` and return the signed offer.
    pub fn begin(
        &self,
        channel: ChannelKind,
        keypair: SessionKeyPair,
        identity: &NodeIdentity,
    ) -> KeyExchangeMessage {
        let epoch = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .map(|c| c.epoch() + 1)
            .unwrap_or(0);

        let offer = KeyExchangeMessage::new(
            keypair.public,
            identity.node_id().to_string(),
            channel,
            epoch,
        )
        .sign(identity);

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel, PendingExchange { keypair, epoch });
        offer
    }

    /// Complete the handshake with the peer's answer.
    ///
    /// When `peer` is supplied the answer's signature must verify against it.
    pub fn complete(
        &self,
        channel: ChannelKind,
        answer: &KeyExchangeMessage,
        peer: Option<&PublicIdentity>,
    ) -> SessionResult<()> {
        let auth_failed = |reason: &str| SessionError::AuthenticationFailed {
            channel,
            reason: reason.to_string(),
        };

        if answer.channel != channel {
            return Err(auth_failed("answer is for a different channel"));
        }
        if let Some(peer) = peer {
            if !answer.verify(peer) {
                return Err(auth_failed("answer signature did not verify"));
            }
        }

        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel)
            .ok_or_else(|| auth_failed("no handshake in progress"))?;

        let shared = pending.keypair.compute_shared_secret(&answer.to_public_key())?;
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel, SessionCipher::new(shared, pending.epoch));

        tracing::debug!(channel = %channel, epoch = pending.epoch, "Channel session established");
        Ok(())
    }

    /// Abandon an in-progress handshake.
    pub fn abort(&self, channel: ChannelKind) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel);
    }

    /// Whether a usable session exists for `channel`.
    pub fn is_established(&self, channel: ChannelKind) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&channel)
    }

    /// Seal a frame on `channel`.
    pub fn seal(&self, channel: ChannelKind, plaintext: &[u8]) -> SessionResult<SealedFrame> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let cipher = active
            .get_mut(&channel)
            .ok_or_else(|| SessionError::AuthenticationFailed {
                channel,
                reason: "no session established".to_string(),
            })?;
        cipher.encrypt(plaintext)
    }

    /// Open a frame received on `channel`.
    pub fn open(&self, channel: ChannelKind, frame: &SealedFrame) -> SessionResult<Vec<u8>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let cipher = active
            .get_mut(&channel)
            .ok_or_else(|| SessionError::AuthenticationFailed {
                channel,
                reason: "no session established".to_string(),
            })?;
        cipher.decrypt(frame)
    }

    /// Zeroize and remove the session (and any pending handshake) for `channel`.
    pub fn purge(&self, channel: ChannelKind) -> bool {
        self.abort(channel);
        let removed = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel)
            .is_some();
        if removed {
            tracing::info!(channel = %channel, "Channel session purged");
        }
        removed
    }

    /// Channels with an established session.
    pub fn established_channels(&self) -> Vec<ChannelKind> {
        let mut channels: Vec<_> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        channels.sort();
        channels
    }
}

/// Answer a peer's offer: generate our half, derive the shared secret, sign.
///
/// Used by the responding side of a channel handshake (gateways, simulators).
pub fn answer_offer(
    offer: &KeyExchangeMessage,
    identity: &NodeIdentity,
) -> SessionResult<(KeyExchangeMessage, SessionCipher)> {
    let mut keypair = SessionKeyPair::generate()?;
    let shared = keypair.compute_shared_secret(&offer.to_public_key())?;
    let answer = KeyExchangeMessage::new(
        keypair.public,
        identity.node_id().to_string(),
        offer.channel,
        offer.epoch,
    )
    .sign(identity);
    Ok((answer, SessionCipher::new(shared, offer.epoch)))
}

/// Hardware entropy source with software fallback.
///
/// Attempts to use hardware RNG (TPM/RNG) if available, falls back to OS RNG.
struct HardwareRng {
    rng: rand::rngs::ThreadRng,
}

impl HardwareRng {
    fn new() -> SessionResult<Self> {
        Ok(Self {
            rng: rand::thread_rng(),
        })
    }
}

impl RngCore for HardwareRng {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

impl CryptoRng for HardwareRng {}

/// Get current timestamp in microseconds.
fn current_timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros()
        .min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(
        sessions: &ChannelSessions,
        local: &NodeIdentity,
        gateway: &NodeIdentity,
        channel: ChannelKind,
    ) -> SessionCipher {
        let offer = sessions.begin(channel, SessionKeyPair::generate().unwrap(), local);
        assert!(offer.verify(&local.public()));
        let (answer, gateway_cipher) = answer_offer(&offer, gateway).unwrap();
        sessions
            .complete(channel, &answer, Some(&gateway.public()))
            .unwrap();
        gateway_cipher
    }

    #[test]
    fn test_shared_secret_computation() {
        let mut alice = SessionKeyPair::generate().unwrap();
        let mut bob = SessionKeyPair::generate().unwrap();
        let (alice_pub, bob_pub) = (alice.public, bob.public);

        let a = alice.compute_shared_secret(&bob_pub).unwrap();
        let b = bob.compute_shared_secret(&alice_pub).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert!(alice.compute_shared_secret(&bob_pub).is_err());
    }

    #[test]
    fn test_channel_session_roundtrip_with_gateway() {
        let local = NodeIdentity::generate("drone-1");
        let gateway = NodeIdentity::generate("gw-1");
        let sessions = ChannelSessions::new();

        let mut gateway_cipher = handshake(&sessions, &local, &gateway, ChannelKind::Cellular);
        assert!(sessions.is_established(ChannelKind::Cellular));

        let frame = sessions.seal(ChannelKind::Cellular, b"telemetry").unwrap();
        let wire = frame.to_bytes();
        let parsed = SealedFrame::from_bytes(&wire).unwrap();
        assert_eq!(gateway_cipher.decrypt(&parsed).unwrap(), b"telemetry");
    }

    #[test]
    fn test_purged_session_fails_authentication() {
        let local = NodeIdentity::generate("drone-1");
        let gateway = NodeIdentity::generate("gw-1");
        let sessions = ChannelSessions::new();
        handshake(&sessions, &local, &gateway, ChannelKind::Satellite);

        assert!(sessions.purge(ChannelKind::Satellite));
        let result = sessions.seal(ChannelKind::Satellite, b"after purge");
        assert!(matches!(
            result,
            Err(SessionError::AuthenticationFailed { channel: ChannelKind::Satellite, .. })
        ));
        assert!(!sessions.purge(ChannelKind::Satellite));
    }

    #[test]
    fn test_forged_answer_rejected() {
        let local = NodeIdentity::generate("drone-1");
        let gateway = NodeIdentity::generate("gw-1");
        let impostor = NodeIdentity::generate("gw-1");
        let sessions = ChannelSessions::new();

        let offer = sessions.begin(ChannelKind::Cellular, SessionKeyPair::generate().unwrap(), &local);
        let (answer, _) = answer_offer(&offer, &impostor).unwrap();
        let result = sessions.complete(ChannelKind::Cellular, &answer, Some(&gateway.public()));
        assert!(matches!(result, Err(SessionError::AuthenticationFailed { .. })));
        assert!(!sessions.is_established(ChannelKind::Cellular));
    }

    #[test]
    fn test_complete_without_begin_fails() {
        let gateway = NodeIdentity::generate("gw-1");
        let local = NodeIdentity::generate("drone-1");
        let offer = KeyExchangeMessage::new(
            SessionKeyPair::generate().unwrap().public,
            "drone-1".to_string(),
            ChannelKind::Mesh,
            0,
        )
        .sign(&local);
        let (answer, _) = answer_offer(&offer, &gateway).unwrap();

        let sessions = ChannelSessions::new();
        assert!(sessions.complete(ChannelKind::Mesh, &answer, None).is_err());
    }

    #[test]
    fn test_rehandshake_advances_epoch() {
        let local = NodeIdentity::generate("drone-1");
        let gateway = NodeIdentity::generate("gw-1");
        let sessions = ChannelSessions::new();
        handshake(&sessions, &local, &gateway, ChannelKind::Cellular);
        let mut second = handshake(&sessions, &local, &gateway, ChannelKind::Cellular);

        let frame = sessions.seal(ChannelKind::Cellular, b"epoch one").unwrap();
        assert_eq!(frame.epoch, 1);
        assert_eq!(second.decrypt(&frame).unwrap(), b"epoch one");
    }

    #[test]
    fn test_session_cipher_auth_tag() {
        let mut alice = SessionKeyPair::generate().unwrap();
        let bob = SessionKeyPair::generate().unwrap();
        let shared = alice.compute_shared_secret(&bob.public).unwrap();
        let mut cipher = SessionCipher::new(shared, 0);

        let mut frame = cipher.encrypt(b"Secret message").unwrap();
        if let Some(byte) = frame.ciphertext.first_mut() {
            *byte ^= 0xFF;
        }
        assert!(cipher.decrypt(&frame).is_err());
    }

    #[test]
    fn test_rotation_required_message_count() {
        let mut alice = SessionKeyPair::generate().unwrap();
        let bob = SessionKeyPair::generate().unwrap();
        let shared = alice.compute_shared_secret(&bob.public).unwrap();
        let mut cipher = SessionCipher::new(shared, 0);
        cipher.set_max_messages(3);

        for _ in 0..3 {
            cipher.encrypt(b"test").unwrap();
        }
        assert!(cipher.rotation_required());
        assert!(matches!(
            cipher.encrypt(b"test"),
            Err(SessionError::RotationRequired)
        ));

        let mut next = SessionKeyPair::generate().unwrap();
        let peer = SessionKeyPair::generate().unwrap();
        cipher.rotate(next.compute_shared_secret(&peer.public).unwrap());
        assert_eq!(cipher.epoch(), 1);
        assert_eq!(cipher.message_count(), 0);
        assert!(cipher.encrypt(b"fresh").is_ok());
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(SealedFrame::from_bytes(&[0u8; 5]).is_err());
    }
}
