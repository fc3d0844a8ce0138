//! In-process channel drivers for simulations and tests.
//!
//! A [`LoopbackMedium`] is one shared medium (a mesh radio band, a cellular
//! network, the emergency band). Nodes attach to it and get a
//! [`LoopbackDriver`]. Reachability defaults to everyone-hears-everyone and
//! narrows to explicit links once [`LoopbackMedium::connect`] is used.
//! Infrastructure media terminate at a [`LoopbackGateway`], which answers
//! handshakes and keeps the far end of each session.

use crate::channel::ChannelDriver;
use crate::error::{LinkError, LinkResult};
use crate::frame::{Envelope, LinkFrame};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use swarmlink_core::{ChannelKind, ChannelObservation, Clock, NodeId, SystemClock};
use swarmlink_crypto::{
    answer_offer, KeyExchangeMessage, NodeIdentity, PublicIdentity, SealedFrame, SessionCipher,
};
use swarmlink_mesh::FrequencyId;

#[derive(Default)]
struct Port {
    active: AtomicBool,
    inbox: Mutex<VecDeque<Vec<u8>>>,
}

impl Port {
    fn push(&self, frame: &[u8]) {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(frame.to_vec());
    }
}

/// A shared simulated medium.
pub struct LoopbackMedium {
    kind: ChannelKind,
    clock: Arc<dyn Clock>,
    ports: RwLock<BTreeMap<NodeId, Arc<Port>>>,
    links: RwLock<BTreeSet<(NodeId, NodeId)>>,
}

impl LoopbackMedium {
    /// Medium on the system clock.
    pub fn new(kind: ChannelKind) -> Arc<Self> {
        Self::with_clock(kind, Arc::new(SystemClock))
    }

    /// Medium whose observations are stamped by `clock`.
    pub fn with_clock(kind: ChannelKind, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            clock,
            ports: RwLock::new(BTreeMap::new()),
            links: RwLock::new(BTreeSet::new()),
        })
    }

    /// Attach a node.
    pub fn attach(self: &Arc<Self>, node_id: impl Into<NodeId>) -> LoopbackDriver {
        let node_id = node_id.into();
        let port = Arc::new(Port::default());
        self.ports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.clone(), Arc::clone(&port));
        LoopbackDriver {
            node_id,
            medium: Arc::clone(self),
            port,
            gateway: None,
            quality: Mutex::new(None),
            failing: AtomicBool::new(false),
            hold: Mutex::new(Duration::ZERO),
            tuned: Mutex::new(Vec::new()),
            sent: AtomicU64::new(0),
        }
    }

    /// Put `a` and `b` in range of each other.
    pub fn connect(&self, a: &str, b: &str) {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::link(a, b));
    }

    /// Take `a` and `b` out of range of each other.
    pub fn disconnect(&self, a: &str, b: &str) {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::link(a, b));
    }

    /// Push a frame straight into a node's inbox (downlink from outside the medium).
    pub fn deliver(&self, node_id: &str, frame: &[u8]) {
        if let Some(port) = self.port(node_id) {
            if port.active.load(Ordering::SeqCst) {
                port.push(frame);
            }
        }
    }

    fn link(a: &str, b: &str) -> (NodeId, NodeId) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    fn in_range(&self, a: &str, b: &str) -> bool {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        links.is_empty() || links.contains(&Self::link(a, b))
    }

    fn port(&self, node_id: &str) -> Option<Arc<Port>> {
        self.ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    fn reachable_from(&self, node_id: &str) -> Vec<(NodeId, Arc<Port>)> {
        self.ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(id, port)| {
                id.as_str() != node_id && port.active.load(Ordering::SeqCst) && self.in_range(node_id, id)
            })
            .map(|(id, port)| (id.clone(), Arc::clone(port)))
            .collect()
    }
}

/// One node's attachment to a [`LoopbackMedium`].
pub struct LoopbackDriver {
    node_id: NodeId,
    medium: Arc<LoopbackMedium>,
    port: Arc<Port>,
    gateway: Option<Arc<LoopbackGateway>>,
    quality: Mutex<Option<(f64, f64)>>,
    failing: AtomicBool,
    hold: Mutex<Duration>,
    tuned: Mutex<Vec<FrequencyId>>,
    sent: AtomicU64,
}

impl LoopbackDriver {
    /// Terminate handshakes and uplink at `gateway`.
    pub fn with_gateway(mut self, gateway: Arc<LoopbackGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Link quality reported by `observe`; `None` means no signal at all.
    pub fn set_link_quality(&self, quality: Option<(f64, f64)>) {
        *self.quality.lock().unwrap_or_else(PoisonError::into_inner) = quality;
    }

    /// Make every send fail (link down, jammed, out of coverage).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Hold every outgoing frame for `hold` before it leaves the radio.
    pub fn set_send_delay(&self, hold: Duration) {
        *self.hold.lock().unwrap_or_else(PoisonError::into_inner) = hold;
    }

    /// Whether the radio is powered.
    pub fn is_active(&self) -> bool {
        self.port.active.load(Ordering::SeqCst)
    }

    /// Frequencies the radio was tuned to, oldest first.
    pub fn tuned(&self) -> Vec<FrequencyId> {
        self.tuned.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Frames successfully transmitted.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Frames waiting in the inbox.
    pub fn pending(&self) -> usize {
        self.port.inbox.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn hold_frame(&self) {
        let hold = *self.hold.lock().unwrap_or_else(PoisonError::into_inner);
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }
    }

    fn check_up(&self) -> LinkResult<()> {
        let reason = if !self.is_active() {
            "radio inactive"
        } else if self.failing.load(Ordering::SeqCst) {
            "link down"
        } else {
            return Ok(());
        };
        Err(LinkError::Driver {
            channel: self.medium.kind,
            reason: reason.to_string(),
        })
    }
}

#[async_trait]
impl ChannelDriver for LoopbackDriver {
    fn kind(&self) -> ChannelKind {
        self.medium.kind
    }

    async fn observe(&self) -> Option<ChannelObservation> {
        let (signal, error_rate) = (*self.quality.lock().unwrap_or_else(PoisonError::into_inner))?;
        let peers = self.medium.reachable_from(&self.node_id).len() as u32;
        Some(ChannelObservation::new(
            self.medium.kind,
            signal,
            20,
            peers,
            error_rate,
            self.medium.clock.now_ms(),
        ))
    }

    async fn send(&self, frame: &[u8]) -> LinkResult<()> {
        self.check_up()?;
        self.hold_frame().await;
        for (_, port) in self.medium.reachable_from(&self.node_id) {
            port.push(frame);
        }
        if let Some(gateway) = &self.gateway {
            gateway.uplink(&self.node_id, frame);
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_to(&self, peer: &str, frame: &[u8]) -> LinkResult<()> {
        self.check_up()?;
        self.hold_frame().await;
        let port = self
            .medium
            .reachable_from(&self.node_id)
            .into_iter()
            .find(|(id, _)| id == peer)
            .map(|(_, port)| port)
            .ok_or_else(|| LinkError::Driver {
                channel: self.medium.kind,
                reason: format!("{peer} out of range"),
            })?;
        port.push(frame);
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(&self) -> Option<Vec<u8>> {
        if !self.is_active() {
            return None;
        }
        self.port
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    async fn activate(&self) -> LinkResult<()> {
        self.port.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn deactivate(&self) -> LinkResult<()> {
        self.port.active.store(false, Ordering::SeqCst);
        self.port
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    async fn handshake(&self, offer: KeyExchangeMessage) -> LinkResult<KeyExchangeMessage> {
        match &self.gateway {
            Some(gateway) => gateway.answer(offer).await,
            None => Err(LinkError::Driver {
                channel: self.medium.kind,
                reason: "no authenticating peer".to_string(),
            }),
        }
    }

    async fn tune(&self, frequency: FrequencyId) -> LinkResult<()> {
        self.tuned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frequency);
        Ok(())
    }

    async fn neighbors(&self) -> Vec<NodeId> {
        self.medium
            .reachable_from(&self.node_id)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }
}

/// Far end of an infrastructure channel: a base station, ground station or
/// the swarm's admission authority.
pub struct LoopbackGateway {
    identity: NodeIdentity,
    nodes: RwLock<HashMap<NodeId, PublicIdentity>>,
    sessions: Mutex<HashMap<NodeId, SessionCipher>>,
    uplinked: Mutex<Vec<(NodeId, Vec<u8>)>>,
    refusing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl LoopbackGateway {
    /// Gateway with its own identity.
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            nodes: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            uplinked: Mutex::new(Vec::new()),
            refusing: AtomicBool::new(false),
            delay: Mutex::new(None),
        }
    }

    /// Gateway identity, for registering with node key stores.
    pub fn public(&self) -> PublicIdentity {
        self.identity.public()
    }

    /// Admit a node.
    pub fn add_node(&self, node: PublicIdentity) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.node_id.clone(), node);
    }

    /// Refuse every handshake.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Hold every handshake answer.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Answer a node's offer and keep our end of the session.
    pub async fn answer(&self, offer: KeyExchangeMessage) -> LinkResult<KeyExchangeMessage> {
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let refuse = |reason: &str| LinkError::AuthenticationFailed {
            channel: offer.channel,
            reason: reason.to_string(),
        };
        if self.refusing.load(Ordering::SeqCst) {
            return Err(refuse("handshake refused"));
        }
        let node = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&offer.sender_id)
            .cloned()
            .ok_or_else(|| refuse("node not admitted"))?;
        if !offer.verify(&node) {
            return Err(refuse("offer signature did not verify"));
        }

        let (answer, cipher) = answer_offer(&offer, &self.identity)?;
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(offer.sender_id.clone(), cipher);
        Ok(answer)
    }

    /// Decrypt a frame sealed by `node_id`.
    pub fn open(&self, node_id: &str, frame: &SealedFrame) -> LinkResult<Vec<u8>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let cipher = sessions
            .get_mut(node_id)
            .ok_or_else(|| LinkError::UnknownDestination(node_id.to_string()))?;
        Ok(cipher.decrypt(frame)?)
    }

    /// Seal `envelope` for `node_id` as a downlink frame.
    pub fn seal_for(&self, node_id: &str, envelope: &Envelope) -> LinkResult<Vec<u8>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let cipher = sessions
            .get_mut(node_id)
            .ok_or_else(|| LinkError::UnknownDestination(node_id.to_string()))?;
        let sealed = cipher.encrypt(&envelope.to_bytes()?)?;
        LinkFrame::Sealed {
            sender: self.identity.node_id().to_string(),
            frame: sealed.to_bytes(),
        }
        .to_bytes()
    }

    /// Envelopes received so far, decrypted. Frames that do not open are skipped.
    pub fn received(&self) -> Vec<Envelope> {
        let uplinked = self.uplinked.lock().unwrap_or_else(PoisonError::into_inner).clone();
        uplinked
            .iter()
            .filter_map(|(node_id, bytes)| match LinkFrame::from_bytes(bytes).ok()? {
                LinkFrame::Sealed { frame, .. } => {
                    let sealed = SealedFrame::from_bytes(&frame).ok()?;
                    Envelope::from_bytes(&self.open(node_id, &sealed).ok()?).ok()
                }
                _ => None,
            })
            .collect()
    }

    /// Raw uplinked frames with their sender.
    pub fn uplinked(&self) -> Vec<(NodeId, Vec<u8>)> {
        self.uplinked.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn uplink(&self, node_id: &str, frame: &[u8]) {
        self.uplinked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((node_id.to_string(), frame.to_vec()));
    }
}
