//! Multi-node swarm harness over loopback media.
//!
//! Every node gets a mesh, cellular, satellite and emergency radio driver on
//! media shared by the whole swarm. Mesh handshakes terminate at a swarm
//! admission authority, infrastructure handshakes at a cell tower and a
//! satellite ground station. Topology is installed directly into every
//! node's path manager, standing in for topology dissemination.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use swarmlink_core::{ChannelKind, Clock, ConfigHandle, LinkConfig, ManualClock, Mode};
use swarmlink_crypto::{KeyStore, MemoryKeyStore, NodeIdentity, PublicIdentity};
use swarmlink_link::{
    DriverSet, FlightSnapshot, InboundMessage, LinkController, LoopbackDriver, LoopbackGateway,
    LoopbackMedium, SharedFlightContext,
};
use swarmlink_mesh::{CapabilityFlags, LinkMetrics};

/// Per-link latency installed by [`Swarm::connect`].
pub const LINK_LATENCY_MS: u64 = 100;

/// One swarm member.
pub struct SwarmNode {
    /// Controller under test
    pub controller: Arc<LinkController>,
    /// Node identity
    pub identity: NodeIdentity,
    /// Flight state fed to the controller
    pub flight: Arc<SharedFlightContext>,
    /// Mesh radio
    pub mesh: Arc<LoopbackDriver>,
    /// Cellular modem
    pub cellular: Arc<LoopbackDriver>,
    /// Satellite terminal
    pub satellite: Arc<LoopbackDriver>,
    /// Emergency radio
    pub radio: Arc<LoopbackDriver>,
}

/// Node description for [`Swarm::build`].
pub struct NodeSpec {
    /// Node id
    pub id: String,
    /// Advertised capabilities
    pub flags: CapabilityFlags,
    /// Mode entered at startup
    pub initial_mode: Mode,
}

impl NodeSpec {
    /// Plain relay starting in `mode`.
    pub fn relay(id: &str, mode: Mode) -> Self {
        Self {
            id: id.to_string(),
            flags: CapabilityFlags::RELAY,
            initial_mode: mode,
        }
    }

    /// Relay with a cellular uplink starting in `mode`.
    pub fn egress(id: &str, mode: Mode) -> Self {
        Self {
            id: id.to_string(),
            flags: CapabilityFlags::RELAY.with(CapabilityFlags::EGRESS_CELLULAR),
            initial_mode: mode,
        }
    }
}

/// A swarm of nodes sharing loopback media and a manual clock.
pub struct Swarm {
    /// Shared clock
    pub clock: Arc<ManualClock>,
    /// Mesh band
    pub mesh: Arc<LoopbackMedium>,
    /// Emergency band
    pub radio: Arc<LoopbackMedium>,
    /// Swarm admission authority (mesh handshakes)
    pub authority: Arc<LoopbackGateway>,
    /// Cell tower
    pub tower: Arc<LoopbackGateway>,
    /// Satellite ground station
    pub ground_station: Arc<LoopbackGateway>,
    nodes: BTreeMap<String, SwarmNode>,
}

impl Swarm {
    /// Build and start every node.
    pub async fn build(specs: Vec<NodeSpec>) -> Self {
        Self::build_with(specs, |_| {}).await
    }

    /// Build with a configuration override applied to every node.
    pub async fn build_with(specs: Vec<NodeSpec>, tweak: impl Fn(&mut LinkConfig)) -> Self {
        swarmlink_core::logging::try_init_for_tests();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let medium = |kind| LoopbackMedium::with_clock(kind, clock.clone());
        let (mesh, cellular, satellite, radio) = (
            medium(ChannelKind::Mesh),
            medium(ChannelKind::Cellular),
            medium(ChannelKind::Satellite),
            medium(ChannelKind::EmergencyRadio),
        );
        let authority = Arc::new(LoopbackGateway::new(NodeIdentity::generate("swarm-authority")));
        let tower = Arc::new(LoopbackGateway::new(NodeIdentity::generate("cell-tower")));
        let ground_station = Arc::new(LoopbackGateway::new(NodeIdentity::generate("ground-station")));
        let gateways = [&authority, &tower, &ground_station];

        let identities: Vec<(NodeIdentity, CapabilityFlags)> = specs
            .iter()
            .map(|spec| (NodeIdentity::generate(spec.id.clone()), spec.flags))
            .collect();
        let publics: Vec<(PublicIdentity, CapabilityFlags)> =
            identities.iter().map(|(id, flags)| (id.public(), *flags)).collect();

        let mut nodes = BTreeMap::new();
        for (spec, (identity, _)) in specs.iter().zip(identities) {
            let keystore = Arc::new(MemoryKeyStore::new(identity.clone()));
            for gateway in gateways {
                keystore.add_peer(gateway.public());
                gateway.add_node(identity.public());
            }
            for (peer, _) in &publics {
                keystore.add_peer(peer.clone());
            }

            let node_mesh = Arc::new(mesh.attach(spec.id.clone()).with_gateway(Arc::clone(&authority)));
            let node_cellular = Arc::new(cellular.attach(spec.id.clone()).with_gateway(Arc::clone(&tower)));
            let node_satellite =
                Arc::new(satellite.attach(spec.id.clone()).with_gateway(Arc::clone(&ground_station)));
            let node_radio = Arc::new(radio.attach(spec.id.clone()));
            for driver in [&node_mesh, &node_cellular, &node_satellite, &node_radio] {
                driver.set_link_quality(Some((0.9, 0.01)));
            }

            let mut config = LinkConfig {
                node_id: spec.id.clone(),
                initial_mode: spec.initial_mode,
                ..LinkConfig::default()
            };
            tweak(&mut config);
            let flight = Arc::new(SharedFlightContext::new(FlightSnapshot::default()));
            let drivers = DriverSet::new()
                .with(node_mesh.clone())
                .with(node_cellular.clone())
                .with(node_satellite.clone())
                .with(node_radio.clone());
            let controller = LinkController::builder(
                ConfigHandle::new(config).expect("valid test config"),
                keystore as Arc<dyn KeyStore>,
                drivers,
            )
            .with_clock(clock.clone())
            .with_flight(flight.clone())
            .build()
            .expect("controller builds");

            let now = clock.now_ms();
            for (peer, flags) in &publics {
                if peer.node_id != spec.id {
                    controller.registry().upsert(peer.clone(), *flags, now);
                }
            }
            nodes.insert(
                spec.id.clone(),
                SwarmNode {
                    controller,
                    identity,
                    flight,
                    mesh: node_mesh,
                    cellular: node_cellular,
                    satellite: node_satellite,
                    radio: node_radio,
                },
            );
        }

        let swarm = Self {
            clock,
            mesh,
            radio,
            authority,
            tower,
            ground_station,
            nodes,
        };
        for node in swarm.nodes.values() {
            node.controller.start().await.expect("controller starts");
        }
        swarm.settle().await;
        swarm
    }

    /// Node by id.
    pub fn node(&self, id: &str) -> &SwarmNode {
        self.nodes.get(id).unwrap_or_else(|| panic!("no node {id}"))
    }

    /// Controller by id.
    pub fn controller(&self, id: &str) -> &Arc<LinkController> {
        &self.node(id).controller
    }

    /// Put `a` and `b` in mesh range and tell every node about the link.
    pub fn connect(&self, a: &str, b: &str) {
        self.mesh.connect(a, b);
        let metrics = LinkMetrics::new(0.95, LINK_LATENCY_MS, 1_000, self.clock.now_ms());
        for node in self.nodes.values() {
            node.controller.paths().observe_link(a, b, metrics.clone());
        }
    }

    /// Recompute every node's path table.
    pub fn recompute(&self) {
        let now = self.clock.now_ms();
        for node in self.nodes.values() {
            node.controller.paths().recompute(now);
        }
    }

    /// Let spawned controller work (authentication, command execution) run.
    pub async fn settle(&self) {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    /// Advance the shared clock.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Sample every driver of every node.
    pub async fn collect_metrics(&self) {
        for node in self.nodes.values() {
            node.controller.collect_metrics().await;
        }
    }

    /// One control step on every node.
    pub async fn tick(&self) {
        for node in self.nodes.values() {
            node.controller.tick().await;
        }
        self.settle().await;
    }

    /// Advance time in `step`s up to `total`, sampling and ticking each step.
    pub async fn run_for(&self, total: Duration, step: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.advance(step);
            self.collect_metrics().await;
            self.tick().await;
            elapsed += step;
        }
    }

    /// Drain every node's inbound frames until the swarm is quiet.
    pub async fn pump(&self) -> BTreeMap<String, Vec<InboundMessage>> {
        let mut delivered: BTreeMap<String, Vec<InboundMessage>> = BTreeMap::new();
        for _ in 0..16 {
            let mut busy = false;
            for (id, node) in &self.nodes {
                let inbound = node.controller.receive().await;
                busy |= !inbound.is_empty();
                delivered.entry(id.clone()).or_default().extend(inbound);
            }
            self.settle().await;
            if !busy && self.idle() {
                break;
            }
        }
        delivered
    }

    /// Keep pumping for `duration` of tokio time, in small sleeps. Use under
    /// a paused runtime alongside an operation that waits for replies.
    pub async fn pump_for(&self, duration: Duration) -> BTreeMap<String, Vec<InboundMessage>> {
        let mut delivered: BTreeMap<String, Vec<InboundMessage>> = BTreeMap::new();
        let deadline = tokio::time::Instant::now() + duration;
        while tokio::time::Instant::now() < deadline {
            for (id, node) in &self.nodes {
                delivered
                    .entry(id.clone())
                    .or_default()
                    .extend(node.controller.receive().await);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        delivered
    }

    fn idle(&self) -> bool {
        self.nodes.values().all(|n| n.mesh.pending() == 0 && n.radio.pending() == 0)
    }
}
