//! Channel driver capability interface.
//!
//! One driver per physical medium. The mode controller only ever sees
//! [`ChannelKind`]s; the facade and runtime talk to drivers through this
//! trait.

use crate::error::LinkResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use swarmlink_core::{ChannelKind, ChannelObservation, NodeId};
use swarmlink_crypto::KeyExchangeMessage;
use swarmlink_mesh::FrequencyId;

/// A physical communication medium.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    /// Medium served by this driver.
    fn kind(&self) -> ChannelKind;

    /// Current link-quality sample, if the radio can take one.
    async fn observe(&self) -> Option<ChannelObservation>;

    /// Transmit a frame (broadcast or to the channel's gateway).
    async fn send(&self, frame: &[u8]) -> LinkResult<()>;

    /// Transmit a frame to one neighbour. Media without addressing broadcast.
    async fn send_to(&self, _peer: &str, frame: &[u8]) -> LinkResult<()> {
        self.send(frame).await
    }

    /// Next received frame, if any. Never blocks waiting for one.
    async fn receive(&self) -> Option<Vec<u8>>;

    /// Power up the medium.
    async fn activate(&self) -> LinkResult<()>;

    /// Power down the medium.
    async fn deactivate(&self) -> LinkResult<()>;

    /// Exchange session offers with the channel's authenticating peer.
    async fn handshake(&self, offer: KeyExchangeMessage) -> LinkResult<KeyExchangeMessage>;

    /// Retune to a frequency. Only the emergency radio hops.
    async fn tune(&self, _frequency: FrequencyId) -> LinkResult<()> {
        Ok(())
    }

    /// Neighbours directly reachable on this medium (mesh only).
    async fn neighbors(&self) -> Vec<NodeId> {
        Vec::new()
    }
}

/// Registered drivers keyed by medium.
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: BTreeMap<ChannelKind, Arc<dyn ChannelDriver>>,
}

impl DriverSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver, replacing any previous one for the same medium.
    pub fn with(mut self, driver: Arc<dyn ChannelDriver>) -> Self {
        self.drivers.insert(driver.kind(), driver);
        self
    }

    /// Driver for `channel`.
    pub fn get(&self, channel: ChannelKind) -> Option<&Arc<dyn ChannelDriver>> {
        self.drivers.get(&channel)
    }

    /// Whether a driver exists for `channel`.
    pub fn contains(&self, channel: ChannelKind) -> bool {
        self.drivers.contains_key(&channel)
    }

    /// All drivers.
    pub fn iter(&self) -> impl Iterator<Item = (&ChannelKind, &Arc<dyn ChannelDriver>)> {
        self.drivers.iter()
    }
}
