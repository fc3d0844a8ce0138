//! Error types for SwarmLink mesh operations.
//!
//! Covers the relay registry, path computation, proof-of-relay and the local
//! trust/cooldown store. None of these are fatal to the controller: a missing
//! path or a compromised relay is a routing signal, not a crash.

use swarmlink_core::NodeId;
use swarmlink_crypto::{OnionError, ProofError};
use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// No node-disjoint or edge-disjoint path exists to any egress
    #[error("No path available to {target}")]
    NoPathAvailable {
        /// Egress or destination that could not be reached
        target: NodeId,
    },

    /// A relay failed proof-of-relay and was excluded
    #[error("Relay compromised: {node_id}")]
    RelayCompromised {
        /// The excluded relay
        node_id: NodeId,
    },

    /// Node not present in the registry
    #[error("Unknown node: {node_id}")]
    UnknownNode {
        /// The missing node
        node_id: NodeId,
    },

    /// Proof-of-relay round trip did not complete in time
    #[error("Probe timed out after {elapsed_ms} ms")]
    ProbeTimeout {
        /// Time waited before giving up
        elapsed_ms: u64,
    },

    /// Probe transport failed to hand the probe to the first hop
    #[error("Probe transport error: {0}")]
    Transport(String),

    /// Proof-of-relay construction errors
    #[error("Proof error: {0}")]
    Proof(#[from] ProofError),

    /// Onion codec errors
    #[error("Onion error: {0}")]
    Onion(#[from] OnionError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
