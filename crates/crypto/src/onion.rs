//! Onion Codec: layered encryption over a relay path.
//!
//! A packet is built once at the source. The payload is sealed for the
//! destination first, then each relay layer is added in reverse traversal
//! order. Every layer is encrypted to the hop's X25519 relay key with a fresh
//! ephemeral key, so a layer reveals only the address of the next hop.
//!
//! Layer plaintext:
//!
//! ```text
//! kind (1) | flags (1) | [next_len (2, BE) | next_id] | [challenge (32)] | inner
//! ```
//!
//! `kind` is `0x01` (forward to `next_id`) or `0x02` (deliver), flag bit 0
//! marks a proof-of-relay challenge. The header on the wire carries only the
//! ephemeral public key and nonce; there is no cleartext recipient id, so
//! every peel attempt performs the same DH and AEAD work whether or not the
//! packet was addressed to the peeling node. A rejected layer still runs the
//! keystream over its body and copies it, as an accepted one does.

use crate::keys::PublicIdentity;
use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use swarmlink_core::NodeId;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

const LAYER_KDF_CONTEXT: &str = "swarmlink onion layer v1";
const KIND_FORWARD: u8 = 0x01;
const KIND_DELIVER: u8 = 0x02;
const FLAG_CHALLENGE: u8 = 0x01;

/// Size of a proof-of-relay challenge carried in a layer.
pub const CHALLENGE_SIZE: usize = 32;

const HEADER_SIZE: usize = 32 + 12;
const TAG_SIZE: usize = 16;

/// A proof-of-relay challenge.
pub type Challenge = [u8; CHALLENGE_SIZE];

/// Onion codec errors.
#[derive(Debug, Error)]
pub enum OnionError {
    /// The packet was not addressed to this node's key (or was tampered with).
    #[error("Decryption failed")]
    DecryptionFailed,

    /// The packet or a decrypted layer is structurally invalid
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// Layer encryption failed
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Challenge list does not cover every hop
    #[error("Expected {expected} challenges, got {got}")]
    ChallengeCount { expected: usize, got: usize },
}

/// Result type for onion operations.
pub type OnionResult<T> = Result<T, OnionError>;

/// Per-layer routing header: the ephemeral key and AEAD nonce for one hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHeader {
    /// Ephemeral X25519 public key for this layer
    pub ephemeral_key: [u8; 32],
    /// AEAD nonce for this layer
    pub nonce: [u8; 12],
}

/// One onion layer as it travels between two hops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnionPacket {
    /// Header for the hop that receives this packet
    pub header: RoutingHeader,
    /// Encrypted layer
    pub ciphertext: Vec<u8>,
}

impl OnionPacket {
    /// Wire encoding: ephemeral key (32) || nonce (12) || ciphertext.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.header.ephemeral_key);
        out.extend_from_slice(&self.header.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the wire encoding.
    pub fn from_bytes(bytes: &[u8]) -> OnionResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(OnionError::Malformed(format!(
                "packet of {} bytes is shorter than the header",
                bytes.len()
            )));
        }
        let mut ephemeral_key = [0u8; 32];
        ephemeral_key.copy_from_slice(&bytes[..32]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&bytes[32..HEADER_SIZE]);
        Ok(Self {
            header: RoutingHeader {
                ephemeral_key,
                nonce,
            },
            ciphertext: bytes[HEADER_SIZE..].to_vec(),
        })
    }

    /// BLAKE3 digest of the wire encoding.
    pub fn digest(&self) -> [u8; 32] {
        *blake3::hash(&self.to_bytes()).as_bytes()
    }
}

/// Where a peeled layer goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHop {
    /// Forward the inner packet to this node
    Relay(NodeId),
    /// This node is the destination; the inner bytes are the payload
    Destination,
}

/// Result of peeling one layer.
///
/// The inner bytes are zeroized when this value is dropped.
#[derive(Debug)]
pub struct Peeled {
    /// Next hop or destination marker
    pub next: NextHop,
    /// Inner packet bytes (relay) or payload (destination)
    pub inner: Zeroizing<Vec<u8>>,
    /// Proof-of-relay challenge for this hop, if the layer carried one
    pub challenge: Option<Challenge>,
}

impl Peeled {
    /// Parse the inner bytes as the packet to forward.
    pub fn forward_packet(&self) -> OnionResult<OnionPacket> {
        match self.next {
            NextHop::Relay(_) => OnionPacket::from_bytes(&self.inner),
            NextHop::Destination => Err(OnionError::Malformed(
                "destination layer has no inner packet".to_string(),
            )),
        }
    }
}

/// Packets for every hop of one wrap, outermost first.
///
/// `layers[0]` is sent to the first relay; the last entry is what the
/// destination receives. Used by proof-of-relay to predict what each honest
/// hop receives and forwards.
#[derive(Debug, Clone)]
pub struct LayeredPacket {
    /// Packet arriving at each hop, in traversal order
    pub layers: Vec<OnionPacket>,
}

impl LayeredPacket {
    /// Packet handed to the first hop.
    pub fn outer(&self) -> Option<&OnionPacket> {
        self.layers.first()
    }

    /// Digest of the packet each hop should receive.
    pub fn hop_digests(&self) -> Vec<[u8; 32]> {
        self.layers.iter().map(OnionPacket::digest).collect()
    }
}

/// Stateless onion codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnionCodec;

impl OnionCodec {
    /// Wrap `payload` for delivery to `destination` via `relays` in order.
    ///
    /// With no relays the packet is addressed directly to the destination.
    pub fn wrap(
        payload: &[u8],
        relays: &[PublicIdentity],
        destination: &PublicIdentity,
    ) -> OnionResult<OnionPacket> {
        let mut layered = Self::wrap_layers(payload, relays, destination, None)?;
        if layered.layers.is_empty() {
            return Err(OnionError::Malformed("no layers built".to_string()));
        }
        Ok(layered.layers.swap_remove(0))
    }

    /// Wrap with one proof-of-relay challenge per hop (relays then destination).
    pub fn wrap_with_challenges(
        payload: &[u8],
        relays: &[PublicIdentity],
        destination: &PublicIdentity,
        challenges: &[Challenge],
    ) -> OnionResult<LayeredPacket> {
        let expected = relays.len() + 1;
        if challenges.len() != expected {
            return Err(OnionError::ChallengeCount {
                expected,
                got: challenges.len(),
            });
        }
        Self::wrap_layers(payload, relays, destination, Some(challenges))
    }

    fn wrap_layers(
        payload: &[u8],
        relays: &[PublicIdentity],
        destination: &PublicIdentity,
        challenges: Option<&[Challenge]>,
    ) -> OnionResult<LayeredPacket> {
        let challenge_at = |idx: usize| challenges.and_then(|c| c.get(idx));

        // Innermost layer first: the destination.
        let mut plaintext = encode_layer(None, challenge_at(relays.len()), payload)?;
        let mut packet = seal_layer(&destination.relay_public(), &plaintext)?;
        let mut layers = vec![packet.clone()];

        for (idx, relay) in relays.iter().enumerate().rev() {
            let next_id = relays
                .get(idx + 1)
                .map(|r| r.node_id.as_str())
                .unwrap_or(destination.node_id.as_str());
            let inner = Zeroizing::new(packet.to_bytes());
            plaintext = encode_layer(Some(next_id), challenge_at(idx), &inner)?;
            packet = seal_layer(&relay.relay_public(), &plaintext)?;
            layers.push(packet.clone());
        }

        layers.reverse();
        Ok(LayeredPacket { layers })
    }

    /// Decrypt exactly one layer with this node's relay key.
    ///
    /// Returns [`OnionError::DecryptionFailed`] when the layer was not
    /// addressed to `my_key`; callers treat this as a normal outcome.
    pub fn peel(packet: &OnionPacket, my_key: &StaticSecret) -> OnionResult<Peeled> {
        let opened = open_layer(packet, my_key);
        if !opened.authentic {
            let _ = std::hint::black_box(Zeroizing::new(opened.buffer.to_vec()));
            return Err(OnionError::DecryptionFailed);
        }
        decode_layer(&opened.buffer)
    }
}

/// Layer body after one open attempt.
///
/// `buffer` is the plaintext when `authentic`, otherwise the body with the
/// keystream applied a second time.
struct OpenedLayer {
    buffer: Zeroizing<Vec<u8>>,
    authentic: bool,
}

fn open_layer(packet: &OnionPacket, my_key: &StaticSecret) -> OpenedLayer {
    let ephemeral = X25519PublicKey::from(packet.header.ephemeral_key);
    let shared = my_key.diffie_hellman(&ephemeral);
    let key = layer_key(shared.as_bytes(), &ephemeral, &X25519PublicKey::from(my_key));
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let nonce = Nonce::from_slice(&packet.header.nonce);
    let aad = packet.header.ephemeral_key.as_slice();

    let (body, tag) = packet
        .ciphertext
        .split_at(packet.ciphertext.len().saturating_sub(TAG_SIZE));
    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes[TAG_SIZE - tag.len()..].copy_from_slice(tag);

    let mut buffer = Zeroizing::new(body.to_vec());
    let authentic = cipher
        .decrypt_in_place_detached(nonce, aad, buffer.as_mut_slice(), Tag::from_slice(&tag_bytes))
        .is_ok();
    if !authentic {
        // The tag check rejects before decrypting; run the keystream anyway.
        let _ = cipher.encrypt_in_place_detached(nonce, aad, buffer.as_mut_slice());
    }
    OpenedLayer { buffer, authentic }
}

fn layer_key(
    shared: &[u8; 32],
    ephemeral: &X25519PublicKey,
    recipient: &X25519PublicKey,
) -> Zeroizing<[u8; 32]> {
    let mut material = Zeroizing::new([0u8; 96]);
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral.as_bytes());
    material[64..].copy_from_slice(recipient.as_bytes());
    Zeroizing::new(blake3::derive_key(LAYER_KDF_CONTEXT, material.as_slice()))
}

fn seal_layer(recipient: &X25519PublicKey, plaintext: &[u8]) -> OnionResult<OnionPacket> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral = X25519PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(recipient);
    let key = layer_key(shared.as_bytes(), &ephemeral, recipient);

    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: ephemeral.as_bytes(),
            },
        )
        .map_err(|e| OnionError::Encryption(e.to_string()))?;

    Ok(OnionPacket {
        header: RoutingHeader {
            ephemeral_key: ephemeral.to_bytes(),
            nonce,
        },
        ciphertext,
    })
}

fn encode_layer(
    next: Option<&str>,
    challenge: Option<&Challenge>,
    inner: &[u8],
) -> OnionResult<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(Vec::with_capacity(
        2 + next.map_or(0, |n| 2 + n.len()) + CHALLENGE_SIZE + inner.len(),
    ));
    out.push(if next.is_some() { KIND_FORWARD } else { KIND_DELIVER });
    out.push(if challenge.is_some() { FLAG_CHALLENGE } else { 0 });
    if let Some(next) = next {
        let len = u16::try_from(next.len()).map_err(|_| {
            OnionError::Malformed(format!("next-hop id of {} bytes is too long", next.len()))
        })?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(next.as_bytes());
    }
    if let Some(challenge) = challenge {
        out.extend_from_slice(challenge);
    }
    out.extend_from_slice(inner);
    Ok(out)
}

fn decode_layer(plaintext: &[u8]) -> OnionResult<Peeled> {
    let malformed = |what: &str| OnionError::Malformed(what.to_string());

    let (&kind, rest) = plaintext.split_first().ok_or_else(|| malformed("empty layer"))?;
    let (&flags, mut rest) = rest.split_first().ok_or_else(|| malformed("missing flags"))?;

    let next = match kind {
        KIND_FORWARD => {
            if rest.len() < 2 {
                return Err(malformed("truncated next-hop length"));
            }
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            rest = &rest[2..];
            if rest.len() < len {
                return Err(malformed("truncated next-hop id"));
            }
            let id = std::str::from_utf8(&rest[..len])
                .map_err(|_| malformed("next-hop id is not UTF-8"))?
                .to_string();
            rest = &rest[len..];
            NextHop::Relay(id)
        }
        KIND_DELIVER => NextHop::Destination,
        other => return Err(OnionError::Malformed(format!("unknown layer kind {other:#04x}"))),
    };

    let challenge = if flags & FLAG_CHALLENGE != 0 {
        if rest.len() < CHALLENGE_SIZE {
            return Err(malformed("truncated challenge"));
        }
        let mut challenge = [0u8; CHALLENGE_SIZE];
        challenge.copy_from_slice(&rest[..CHALLENGE_SIZE]);
        rest = &rest[CHALLENGE_SIZE..];
        Some(challenge)
    } else {
        None
    };

    Ok(Peeled {
        next,
        inner: Zeroizing::new(rest.to_vec()),
        challenge,
    })
}
