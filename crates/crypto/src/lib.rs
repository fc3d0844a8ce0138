//! Cryptographic primitives for the SwarmLink adaptive link controller.
//!
//! This crate owns every operation that touches key material:
//!
//! - **Onion Codec** ([`onion`]): layered X25519 + ChaCha20-Poly1305 encryption
//!   over relay paths. Each layer reveals only the next hop.
//! - **Channel sessions** ([`session`]): per-channel session ciphers established
//!   by a signed X25519 exchange, rotated on a message/time budget and purged
//!   when a mode is left.
//! - **Proof-of-relay** ([`proof`]): per-hop challenges and Ed25519-signed
//!   receipts that let a source verify what each relay received and forwarded.
//! - **Identities** ([`keys`]): node identities and the Key/Identity Store
//!   boundary.
//!
//! # Security Principles
//!
//! - Never roll custom cryptographic primitives
//! - BLAKE3 for every digest and key derivation
//! - Decrypted inner content and shared secrets are zeroized on drop
//! - Secrets must never be logged

pub mod keys;
pub mod onion;
pub mod proof;
pub mod session;

pub use keys::{
    borrow_identity, KeyScope, KeyStore, KeyStoreError, MemoryKeyStore, NodeIdentity, PrivateKey, PublicIdentity,
};
pub use onion::{
    Challenge, LayeredPacket, NextHop, OnionCodec, OnionError, OnionPacket, OnionResult, Peeled,
    RoutingHeader, CHALLENGE_SIZE,
};
pub use proof::{
    HopReceipt, ProbeAction, ProbeExpectation, ProbeFrame, ProbeId, ProofError, ProofFinding,
    ProofResult, RelayResponder, RelayStatus,
};
pub use session::{
    answer_offer, ChannelSessions, KeyExchangeMessage, SealedFrame, SessionCipher, SessionError,
    SessionKeyPair, SessionResult,
};
