//! On-air frames exchanged by link controllers.

use crate::error::LinkResult;
use serde::{Deserialize, Serialize};
use swarmlink_core::{NodeId, Priority, Timestamp};
use swarmlink_crypto::HopReceipt;

/// Application message as seen by the destination.
///
/// This is what the onion codec or the channel session encrypts; relays
/// never see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender-assigned identifier, unique per source
    pub message_id: u64,
    /// Originating node
    pub source: NodeId,
    /// Final destination
    pub destination: NodeId,
    /// Priority
    pub priority: Priority,
    /// Send time
    pub sent_at: Timestamp,
    /// Application payload
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encode for encryption.
    pub fn to_bytes(&self) -> LinkResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode after decryption.
    pub fn from_bytes(bytes: &[u8]) -> LinkResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Unencrypted EMERGENCY beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconFrame {
    /// Broadcasting node
    pub node_id: NodeId,
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lon: f64,
    /// Remaining battery
    pub battery_pct: f64,
    /// Increasing per broadcast
    pub sequence: u64,
    /// Broadcast time
    pub timestamp: Timestamp,
    /// EMERGENCY-priority messages ride on the beacon in clear
    #[serde(default)]
    pub messages: Vec<Envelope>,
}

/// Everything that travels over a channel driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LinkFrame {
    /// Session-encrypted envelope for the channel's gateway
    Sealed {
        /// Sending node
        sender: NodeId,
        /// `SealedFrame` wire bytes
        frame: Vec<u8>,
    },
    /// Onion layer for the receiving relay
    Onion {
        /// `OnionPacket` wire bytes
        packet: Vec<u8>,
    },
    /// Proof-of-relay probe layer
    Probe {
        /// `ProbeFrame` wire bytes
        frame: Vec<u8>,
    },
    /// Hop receipt, flooded back toward probe sources
    Receipt {
        /// The receipt
        receipt: HopReceipt,
    },
    /// EMERGENCY beacon
    Beacon {
        /// The beacon
        beacon: BeaconFrame,
    },
}

impl LinkFrame {
    /// Encode for a driver.
    pub fn to_bytes(&self) -> LinkResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from a driver.
    pub fn from_bytes(bytes: &[u8]) -> LinkResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
