//! Error types for the link controller.
//!
//! Only [`LinkError::Startup`] is fatal. Everything else is either a routing
//! signal for the caller (retry, pick another destination) or a condition the
//! mode controller recovers from on its own.

use swarmlink_core::{ChannelKind, Mode, NodeId};
use swarmlink_crypto::{KeyStoreError, OnionError, SessionError};
use swarmlink_mesh::MeshError;
use swarmlink_threat::ThreatError;
use thiserror::Error;

/// Errors surfaced by the link controller.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No usable route for the message in the current mode
    #[error("No path available to {target}")]
    NoPathAvailable {
        /// Destination or egress that could not be reached
        target: NodeId,
    },

    /// A forced transition is under way; the caller may retry
    #[error("Mode transition in progress ({from} -> {to})")]
    ModeTransitioning {
        /// Mode being left
        from: Mode,
        /// Mode being entered
        to: Mode,
    },

    /// Channel authentication or session lookup failed
    #[error("Authentication failed on {channel}: {reason}")]
    AuthenticationFailed {
        /// Channel
        channel: ChannelKind,
        /// Why
        reason: String,
    },

    /// The new mode did not stabilize during overlap
    #[error("Stabilization of {target} failed: {reason}")]
    StabilizationFailed {
        /// Mode that failed to stabilize
        target: Mode,
        /// Why
        reason: String,
    },

    /// A relay on the chosen path was found compromised
    #[error("Relay compromised: {node_id}")]
    RelayCompromised {
        /// The relay
        node_id: NodeId,
    },

    /// An inbound layer was not addressed to this node
    #[error("Decryption failed")]
    DecryptionFailed,

    /// An EMERGENCY-priority message could not be delivered before its deadline
    #[error("Delivery of message {message_id} failed: {reason}")]
    DeliveryFailed {
        /// Message identifier
        message_id: u64,
        /// Why
        reason: String,
    },

    /// A channel driver reported an error
    #[error("Driver error on {channel}: {reason}")]
    Driver {
        /// Channel
        channel: ChannelKind,
        /// Driver message
        reason: String,
    },

    /// No public identity is known for the destination
    #[error("Unknown destination: {0}")]
    UnknownDestination(NodeId),

    /// Mesh layer error
    #[error("Mesh error: {0}")]
    Mesh(MeshError),

    /// Session cipher error
    #[error("Session error: {0}")]
    Session(SessionError),

    /// Onion codec error
    #[error("Onion error: {0}")]
    Onion(OnionError),

    /// Key store error
    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// Telemetry rejected by the threat detector
    #[error("Threat detector error: {0}")]
    Threat(#[from] ThreatError),

    /// Frame encoding error
    #[error("Frame encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The initial mode could not be constructed
    #[error("Startup failed: {0}")]
    Startup(String),
}

impl From<SessionError> for LinkError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AuthenticationFailed { channel, reason } => {
                LinkError::AuthenticationFailed { channel, reason }
            }
            other => LinkError::Session(other),
        }
    }
}

impl From<OnionError> for LinkError {
    fn from(err: OnionError) -> Self {
        match err {
            OnionError::DecryptionFailed => LinkError::DecryptionFailed,
            other => LinkError::Onion(other),
        }
    }
}

impl From<MeshError> for LinkError {
    fn from(err: MeshError) -> Self {
        match err {
            MeshError::NoPathAvailable { target } => LinkError::NoPathAvailable { target },
            MeshError::RelayCompromised { node_id } => LinkError::RelayCompromised { node_id },
            other => LinkError::Mesh(other),
        }
    }
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;
