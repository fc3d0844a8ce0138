//! Link controller facade.
//!
//! [`LinkController`] is the single entry point for the flight stack: it owns
//! the metrics, threat, path, session and mode components and turns their
//! decisions into driver calls. Mode decisions are made synchronously under
//! the mode controller's lock; the resulting [`ModeCommand`]s are queued and
//! executed by one drainer at a time, so driver I/O never runs under a lock.

use crate::auth::Authenticator;
use crate::beacon::Beacon;
use crate::channel::{ChannelDriver, DriverSet};
use crate::context::{CoverageModel, FlightContext, FlightSnapshot, SharedFlightContext};
use crate::error::{LinkError, LinkResult};
use crate::forecast::Forecaster;
use crate::frame::{BeaconFrame, Envelope, LinkFrame};
use crate::mode::{ModeCommand, ModeController, ModeState};
use crate::probe::{MeshProbeTransport, RECEIPT_BUFFER};
use crate::queue::{AckHandle, Delivery, EmergencyQueue};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use swarmlink_core::{
    event_types, ChannelKind, ChannelObservation, Clock, ConfigHandle, EventBuilder, EventBus, EventCategory,
    EventSeverity, Mode, NodeId, Priority, Severity, SystemClock, Timestamp,
};
use swarmlink_crypto::{
    borrow_identity, ChannelSessions, HopReceipt, KeyStore, NextHop, OnionCodec, OnionError, OnionPacket, ProbeAction,
    ProbeFrame, ProbeId, PublicIdentity, RelayResponder, SealedFrame,
};
use swarmlink_mesh::{
    LinkMetrics, LinkStore, MetricsCollector, PathManager, ProbeReport, ProbeTransport,
    ProofOfRelay, RecomputeSummary, RelayPath, RelayRegistry,
};
use swarmlink_threat::{by_precedence, Affected, Telemetry, ThreatDetector, ThreatDispatcher, ThreatEvent};
use tokio::sync::{broadcast, watch};

const SOURCE: &str = "link-controller";

/// Frames drained per channel on one [`LinkController::receive`] call.
const RECEIVE_BATCH: usize = 64;

/// Receipt identities remembered for flood suppression.
const SEEN_RECEIPTS: usize = 1024;

/// Nominal mesh link bandwidth; drivers do not report it.
const MESH_BANDWIDTH_KBPS: u64 = 1_000;

type DrainFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Message handed to [`LinkController::send`].
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Final destination
    pub destination: NodeId,
    /// Application payload
    pub payload: Vec<u8>,
    /// Priority
    pub priority: Priority,
    /// EMERGENCY-priority messages are retried until this time
    pub deadline: Option<Timestamp>,
}

impl OutboundMessage {
    /// NORMAL-priority message without deadline.
    pub fn new(destination: impl Into<NodeId>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
            priority: Priority::Normal,
            deadline: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry deadline.
    pub fn with_deadline(mut self, deadline: Timestamp) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Message delivered to this node.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// The message
    pub envelope: Envelope,
    /// Channel it arrived on
    pub channel: ChannelKind,
    /// False only for messages carried in clear on an EMERGENCY beacon
    pub protected: bool,
}

/// How one copy of a message leaves the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Session-encrypted to the channel's gateway
    Sealed(ChannelKind),
    /// Onion-routed over mesh relays
    Relay,
}

impl Route {
    fn channel(self) -> ChannelKind {
        match self {
            Route::Sealed(channel) => channel,
            Route::Relay => ChannelKind::Mesh,
        }
    }
}

/// Routes a mode offers for a priority.
fn mode_routes(mode: Mode, priority: Priority) -> Vec<Route> {
    match mode {
        Mode::Tactical => vec![Route::Relay],
        Mode::Hybrid if priority.is_duplicated() => {
            vec![Route::Sealed(ChannelKind::Cellular), Route::Relay]
        }
        Mode::Hybrid | Mode::Infrastructure => vec![Route::Sealed(ChannelKind::Cellular)],
        Mode::Satcom => vec![Route::Sealed(ChannelKind::Satellite)],
        Mode::Emergency => Vec::new(),
    }
}

/// Routes for a message given the full mode state.
///
/// During overlap, duplicated priorities go out on both modes; everything
/// else stays on the old mode unless it has nothing left to offer.
fn plan_routes(state: &ModeState, priority: Priority) -> Vec<Route> {
    let usable = |mode: Mode| -> Vec<Route> {
        mode_routes(mode, priority)
            .into_iter()
            .filter(|route| !state.is_suspended(route.channel()))
            .collect()
    };
    let current = usable(state.mode);
    let Some(target) = state.overlap_target() else {
        return current;
    };
    let next = usable(target);
    if priority.is_duplicated() {
        let mut routes = current;
        for route in next {
            if !routes.contains(&route) {
                routes.push(route);
            }
        }
        routes
    } else if current.is_empty() {
        next
    } else {
        current
    }
}

/// Builder for [`LinkController`].
pub struct LinkControllerBuilder {
    config: ConfigHandle,
    keystore: Arc<dyn KeyStore>,
    drivers: DriverSet,
    clock: Option<Arc<dyn Clock>>,
    flight: Option<Arc<dyn FlightContext>>,
    coverage: Option<Arc<dyn CoverageModel>>,
    store: Option<Arc<LinkStore>>,
    events: Option<EventBus>,
}

impl LinkControllerBuilder {
    /// Time source; defaults to the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Flight state provider; defaults to a fixed, fully charged snapshot.
    pub fn with_flight(mut self, flight: Arc<dyn FlightContext>) -> Self {
        self.flight = Some(flight);
        self
    }

    /// Coverage map used by the forecast.
    pub fn with_coverage(mut self, coverage: Arc<dyn CoverageModel>) -> Self {
        self.coverage = Some(coverage);
        self
    }

    /// Persist trust changes and cooldowns.
    pub fn with_store(mut self, store: Arc<LinkStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish on an existing bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Assemble the controller.
    ///
    /// Fails with [`LinkError::Startup`] when the initial mode has no driver
    /// for one of its channels or the local identity cannot be borrowed.
    pub fn build(self) -> LinkResult<Arc<LinkController>> {
        let initial = self.config.snapshot().initial_mode;
        if let Some(missing) = initial
            .channels()
            .iter()
            .find(|channel| !self.drivers.contains(**channel))
        {
            return Err(LinkError::Startup(format!(
                "initial mode {initial} needs a {missing} driver"
            )));
        }
        let node_id = borrow_identity(self.keystore.as_ref())
            .map_err(|e| LinkError::Startup(format!("local identity unavailable: {e}")))?
            .node_id()
            .to_string();

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_default();
        let flight = self
            .flight
            .unwrap_or_else(|| Arc::new(SharedFlightContext::new(FlightSnapshot::default())));
        let now = clock.now_ms();

        let metrics = Arc::new(MetricsCollector::new(self.config.clone()));
        let mut forecaster = Forecaster::new(Arc::clone(&metrics), self.config.clone());
        if let Some(coverage) = self.coverage {
            forecaster = forecaster.with_coverage(coverage);
        }

        let registry = Arc::new(RelayRegistry::new());
        let paths = Arc::new(PathManager::new(
            node_id.clone(),
            Arc::clone(&registry),
            self.config.clone(),
            events.clone(),
        ));
        let (receipts, _) = broadcast::channel(RECEIPT_BUFFER);
        let proof = self.drivers.get(ChannelKind::Mesh).map(|mesh| {
            let transport: Arc<dyn ProbeTransport> =
                Arc::new(MeshProbeTransport::new(Arc::clone(mesh), receipts.clone()));
            let proof = ProofOfRelay::new(
                Arc::clone(&paths),
                transport,
                self.config.clone(),
                Arc::clone(&clock),
                events.clone(),
            );
            Arc::new(match &self.store {
                Some(store) => proof.with_store(Arc::clone(store)),
                None => proof,
            })
        });

        let mut mode = ModeController::new(initial, self.config.clone(), events.clone());
        if let Some(store) = &self.store {
            match store.active_cooldowns(now) {
                Ok(records) => mode.restore_cooldowns(records, now),
                Err(e) => tracing::warn!(error = %e, "Persisted cooldowns not restored"),
            }
        }
        let state = mode.subscribe();

        let sessions = Arc::new(ChannelSessions::new());
        let authenticator = Authenticator::new(
            Arc::clone(&self.keystore),
            Arc::clone(&sessions),
            self.config.clone(),
        );

        tracing::info!(node_id = %node_id, mode = %initial, channels = self.drivers.iter().count(), "Link controller assembled");
        Ok(Arc::new_cyclic(|this| LinkController {
            beacon: Mutex::new(Beacon::new(node_id.clone(), self.config.clone())),
            detector: ThreatDetector::new(self.config.clone(), events.clone()),
            dispatcher: Mutex::new(ThreatDispatcher::new(self.config.clone())),
            queue: Mutex::new(EmergencyQueue::new(events.clone())),
            node_id,
            config: self.config,
            clock,
            events,
            drivers: self.drivers,
            keystore: self.keystore,
            sessions,
            authenticator,
            metrics,
            forecaster,
            registry,
            paths,
            proof,
            receipts,
            seen_receipts: Mutex::new((HashSet::new(), VecDeque::new())),
            mode: Mutex::new(mode),
            state,
            flight,
            store: self.store,
            next_message_id: AtomicU64::new(1),
            decrypt_failures: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            executing: tokio::sync::Mutex::new(()),
            this: this.clone(),
        }))
    }
}

type SeenReceipts = (HashSet<(ProbeId, NodeId)>, VecDeque<(ProbeId, NodeId)>);

/// Adaptive link controller for one swarm node.
pub struct LinkController {
    node_id: NodeId,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    events: EventBus,
    drivers: DriverSet,
    keystore: Arc<dyn KeyStore>,
    sessions: Arc<ChannelSessions>,
    authenticator: Authenticator,
    metrics: Arc<MetricsCollector>,
    forecaster: Forecaster,
    detector: ThreatDetector,
    dispatcher: Mutex<ThreatDispatcher>,
    registry: Arc<RelayRegistry>,
    paths: Arc<PathManager>,
    proof: Option<Arc<ProofOfRelay>>,
    receipts: broadcast::Sender<HopReceipt>,
    seen_receipts: Mutex<SeenReceipts>,
    mode: Mutex<ModeController>,
    state: watch::Receiver<ModeState>,
    queue: Mutex<EmergencyQueue>,
    beacon: Mutex<Beacon>,
    flight: Arc<dyn FlightContext>,
    store: Option<Arc<LinkStore>>,
    next_message_id: AtomicU64,
    decrypt_failures: AtomicU64,
    pending: Mutex<VecDeque<ModeCommand>>,
    executing: tokio::sync::Mutex<()>,
    this: Weak<LinkController>,
}

impl LinkController {
    /// Start building a controller over `drivers`.
    pub fn builder(config: ConfigHandle, keystore: Arc<dyn KeyStore>, drivers: DriverSet) -> LinkControllerBuilder {
        LinkControllerBuilder {
            config,
            keystore,
            drivers,
            clock: None,
            flight: None,
            coverage: None,
            store: None,
            events: None,
        }
    }

    /// Restore persisted trust, bring up the initial mode and compute paths.
    pub async fn start(&self) -> LinkResult<()> {
        let now = self.clock.now_ms();
        if let Some(store) = &self.store {
            let floor = self.config.snapshot().trust_floor;
            for (node_id, score) in store.latest_trust()? {
                self.registry.restore_trust(&node_id, score, floor, now);
            }
        }

        let commands = self.lock_mode().start(now);
        self.lock_pending().extend(commands);
        self.drain().await;
        self.paths.recompute(now);

        let mode = self.current_mode().mode;
        tracing::info!(node_id = %self.node_id, mode = %mode, "Link controller started");
        self.events.publish(
            EventBuilder::new(event_types::CONTROLLER_STARTED, SOURCE)
                .category(EventCategory::Operational)
                .subject(self.node_id.clone())
                .at(now)
                .message(format!("Started in {mode}"))
                .build(),
        );
        Ok(())
    }

    /// Fail queued messages, purge every session and power down all radios.
    pub async fn stop(&self) {
        let now = self.clock.now_ms();
        self.lock_queue().fail_all(now, "link controller stopped");
        self.lock_beacon().stop();
        for channel in self.sessions.established_channels() {
            self.sessions.purge(channel);
        }
        for (channel, driver) in self.drivers.iter() {
            if let Err(e) = driver.deactivate().await {
                tracing::warn!(channel = %channel, error = %e, "Driver did not power down");
            }
        }
        tracing::info!(node_id = %self.node_id, "Link controller stopped");
        self.events.publish(
            EventBuilder::new(event_types::CONTROLLER_STOPPED, SOURCE)
                .category(EventCategory::Operational)
                .subject(self.node_id.clone())
                .at(now)
                .message("Stopped")
                .build(),
        );
    }

    /// Route a message according to the current mode.
    ///
    /// Returns once the message has left on at least one channel, or with
    /// the error that prevented it. EMERGENCY-priority messages are never
    /// refused: if nothing can carry them now they are queued and the handle
    /// resolves when a retry or the beacon delivers them, or when their
    /// deadline passes.
    pub async fn send(&self, message: OutboundMessage) -> LinkResult<AckHandle> {
        let now = self.clock.now_ms();
        let envelope = Envelope {
            message_id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            source: self.node_id.clone(),
            destination: message.destination,
            priority: message.priority,
            sent_at: now,
            payload: message.payload,
        };
        let emergency = envelope.priority == Priority::Emergency;
        let state = self.current_mode();

        if state.mode == Mode::Emergency {
            if emergency {
                return Ok(self.park(envelope, message.deadline, 0, now, "carried on beacon"));
            }
            return Err(LinkError::NoPathAvailable {
                target: envelope.destination,
            });
        }
        if let Some((from, to)) = state.blocked_transition() {
            if emergency {
                let retry_at = now + self.config.snapshot().emergency_retry_interval_ms;
                return Ok(self.park(envelope, message.deadline, 0, retry_at, "forced transition in progress"));
            }
            return Err(LinkError::ModeTransitioning { from, to });
        }

        let routes = plan_routes(&state, envelope.priority);
        match self.transmit_all(&routes, &envelope).await {
            Ok(channels) => Ok(AckHandle::settled(
                envelope.message_id,
                Ok(Delivery {
                    message_id: envelope.message_id,
                    channels,
                    attempts: 1,
                    delivered_at: now,
                }),
            )),
            Err(e) if emergency => {
                let retry_at = now + self.config.snapshot().emergency_retry_interval_ms;
                let reason = e.to_string();
                Ok(self.park(envelope, message.deadline, 1, retry_at, &reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Drain every active driver and handle what arrived.
    ///
    /// Relay layers, probes and receipts are forwarded as a side effect;
    /// only messages addressed to this node are returned.
    pub async fn receive(&self) -> Vec<InboundMessage> {
        let mut inbound = Vec::new();
        for (channel, driver) in self.drivers.iter() {
            for _ in 0..RECEIVE_BATCH {
                let Some(bytes) = driver.receive().await else {
                    break;
                };
                match LinkFrame::from_bytes(&bytes) {
                    Ok(frame) => inbound.extend(self.handle_frame(*channel, frame).await),
                    Err(e) => tracing::debug!(channel = %channel, error = %e, "Undecodable frame dropped"),
                }
            }
        }
        inbound
    }

    /// Current mode state. Never blocks on a transition.
    pub fn current_mode(&self) -> ModeState {
        self.state.borrow().clone()
    }

    /// Watch mode state changes.
    pub fn subscribe_mode(&self) -> watch::Receiver<ModeState> {
        self.state.clone()
    }

    /// React to a threat verdict.
    ///
    /// Relay threats adjust trust at once; channel threats go to the mode
    /// controller. Resulting driver work runs in the background when called
    /// inside a runtime, otherwise on the next [`LinkController::tick`].
    pub fn on_threat(&self, event: &ThreatEvent) {
        let now = self.clock.now_ms();
        match &event.affected {
            Affected::Relay { node_id } => self.penalize_relay(node_id, event.severity, now),
            Affected::Path { hops } => {
                if let Some(target) = hops.last() {
                    self.spawn_probe(target.clone());
                }
            }
            Affected::Channel { .. } | Affected::Station { .. } => {}
        }
        let commands = self.lock_mode().on_threat(event, now);
        self.enqueue(commands);
    }

    /// Run telemetry through the threat rules and dispatch what they raise.
    ///
    /// Critical and zero-latency events are acted on before this returns;
    /// the rest are released by [`LinkController::tick`] at their response
    /// deadline.
    pub fn ingest_telemetry(&self, telemetry: &Telemetry) -> LinkResult<Vec<ThreatEvent>> {
        let raised = self.detector.evaluate(telemetry)?;
        let now = self.clock.now_ms();
        let due: Vec<ThreatEvent> = {
            let mut dispatcher = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
            raised
                .iter()
                .cloned()
                .flat_map(|event| dispatcher.submit(event, now))
                .collect()
        };
        for event in by_precedence(due) {
            self.on_threat(&event);
        }
        Ok(raised)
    }

    /// One control step: release due threats, re-forecast, advance the mode
    /// controller and execute everything it asks for.
    pub async fn tick(&self) {
        let now = self.clock.now_ms();
        let released = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .poll(now);
        for event in by_precedence(released) {
            self.on_threat(&event);
        }

        let flight = self.flight.snapshot();
        let outlook = self
            .forecaster
            .outlook(now, &flight, self.paths.current().has_any_path());
        let commands = self.lock_mode().evaluate(now, &outlook, &flight);
        self.lock_pending().extend(commands);
        self.drain().await;
    }

    /// Sample every driver into the metrics collector.
    pub async fn collect_metrics(&self) {
        let flight = self.flight.snapshot();
        for (channel, driver) in self.drivers.iter() {
            let observation = match driver.observe().await {
                Some(observation) => observation,
                None => ChannelObservation::no_signal(*channel, self.clock.now_ms()),
            };
            self.metrics.record(observation.clone());

            match channel {
                ChannelKind::EmergencyRadio => self.lock_beacon().report_error_rate(observation.error_rate),
                ChannelKind::Cellular if observation.signal_quality > 0.0 => {
                    let telemetry = Telemetry::density(&observation, flight.lat, flight.lon);
                    if let Err(e) = self.ingest_telemetry(&telemetry) {
                        tracing::debug!(error = %e, "Density telemetry rejected");
                    }
                }
                _ => {}
            }
        }
    }

    /// Refresh direct mesh links, expire quarantined relays and recompute paths.
    pub async fn refresh_paths(&self) -> RecomputeSummary {
        let now = self.clock.now_ms();
        let config = self.config.snapshot();

        if let (Some(mesh), Some(observation)) =
            (self.drivers.get(ChannelKind::Mesh), self.metrics.latest(ChannelKind::Mesh))
        {
            let link = LinkMetrics::new(
                1.0 - observation.error_rate,
                observation.measured_latency_ms,
                MESH_BANDWIDTH_KBPS,
                now,
            );
            for neighbor in mesh.neighbors().await {
                self.paths.observe_link(&self.node_id, &neighbor, link.clone());
            }
        }
        let stale = self
            .paths
            .prune_stale_links(now, config.probe_interval_s.saturating_mul(2_000));
        if stale > 0 {
            tracing::debug!(stale, "Stale mesh links dropped");
        }

        for node_id in self.registry.purge_expired(now, config.quarantine_expiry_s) {
            self.events.publish(
                EventBuilder::new(event_types::RELAY_EXPIRED, SOURCE)
                    .category(EventCategory::Trust)
                    .subject(node_id.clone())
                    .at(now)
                    .message(format!("Quarantined relay {node_id} removed"))
                    .build(),
            );
        }
        self.paths.recompute(now)
    }

    /// Probe every selected relay path and check the measured round trip,
    /// late receipts included, against the estimate the path was chosen with.
    pub async fn probe_relays(&self) -> Vec<ProbeReport> {
        let Some(proof) = &self.proof else {
            return Vec::new();
        };
        let table = self.paths.current();
        let reports = proof.sweep().await;
        let now = self.clock.now_ms();
        for report in &reports {
            let Some(path) = table.all_paths().find(|p| p.hops == report.path) else {
                continue;
            };
            let telemetry = Telemetry::PathLatency {
                hops: report.path.clone(),
                expected_ms: path.latency_estimate_ms,
                measured_ms: report.round_trip_ms,
                timestamp: now,
            };
            if let Err(e) = self.ingest_telemetry(&telemetry) {
                tracing::debug!(error = %e, "Path latency telemetry rejected");
            }
        }
        reports
    }

    /// Retry queued EMERGENCY messages that are due.
    ///
    /// Outside EMERGENCY mode they go out on the mode's routes; in EMERGENCY
    /// mode the beacon carries them instead. Expired messages fail here.
    pub async fn retry_emergency(&self) {
        let now = self.clock.now_ms();
        let state = self.current_mode();
        let due = {
            let mut queue = self.lock_queue();
            queue.expire(now);
            if state.mode == Mode::Emergency || state.blocked_transition().is_some() {
                return;
            }
            queue.take_due(now)
        };
        if due.is_empty() {
            return;
        }

        let retry_at = now + self.config.snapshot().emergency_retry_interval_ms;
        for mut message in due {
            message.attempts += 1;
            let routes = plan_routes(&state, message.envelope.priority);
            match self.transmit_all(&routes, &message.envelope).await {
                Ok(channels) => message.complete(channels, now),
                Err(e) => {
                    tracing::debug!(message_id = message.envelope.message_id, attempts = message.attempts, error = %e, "EMERGENCY retry failed");
                    self.lock_queue().requeue(message, retry_at);
                }
            }
        }
    }

    /// Broadcast one beacon frame if the beacon is on, hopping first when due.
    pub async fn beacon_tick(&self) {
        let now = self.clock.now_ms();
        let Some(driver) = self.drivers.get(ChannelKind::EmergencyRadio).cloned() else {
            return;
        };
        let retune = {
            let mut beacon = self.lock_beacon();
            if !beacon.is_active() {
                return;
            }
            beacon.retune(now)
        };
        if let Some((frequency, reason)) = retune {
            tracing::debug!(frequency, reason = ?reason, "Beacon retuned");
            if let Err(e) = driver.tune(frequency).await {
                tracing::warn!(frequency, error = %e, "Emergency radio did not retune");
            }
        }

        let carried = {
            let mut queue = self.lock_queue();
            queue.expire(now);
            queue.take_due(now)
        };
        let flight = self.flight.snapshot();
        let envelopes = carried.iter().map(|m| m.envelope.clone()).collect();
        let frame = self.lock_beacon().next_frame(now, &flight, envelopes);
        let Some(frame) = frame else {
            let mut queue = self.lock_queue();
            for message in carried {
                queue.requeue(message, now);
            }
            return;
        };

        let sequence = frame.sequence;
        let sent = match (LinkFrame::Beacon { beacon: frame }).to_bytes() {
            Ok(bytes) => driver.send(&bytes).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                tracing::debug!(sequence, messages = carried.len(), "Beacon sent");
                for mut message in carried {
                    message.attempts += 1;
                    message.complete(vec![ChannelKind::EmergencyRadio], now);
                }
            }
            Err(e) => {
                tracing::warn!(sequence, error = %e, "Beacon not sent");
                let mut queue = self.lock_queue();
                for mut message in carried {
                    message.attempts += 1;
                    queue.requeue(message, now);
                }
            }
        }
    }

    /// Compute and keep relay paths toward `destination`.
    pub fn track_destination(&self, destination: impl Into<NodeId>) {
        self.paths.track_target(destination);
    }

    /// Local node identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Shared relay registry.
    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    /// Path manager.
    pub fn paths(&self) -> &Arc<PathManager> {
        &self.paths
    }

    /// Metrics collector.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Threat detector, for learning baselines.
    pub fn detector(&self) -> &ThreatDetector {
        &self.detector
    }

    /// Channel sessions.
    pub fn sessions(&self) -> &Arc<ChannelSessions> {
        &self.sessions
    }

    /// Event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Configuration handle.
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Inbound frames that failed to decrypt.
    pub fn decrypt_failures(&self) -> u64 {
        self.decrypt_failures.load(Ordering::Relaxed)
    }

    /// EMERGENCY messages waiting for retry.
    pub fn queued_emergency(&self) -> usize {
        self.lock_queue().len()
    }

    fn park(
        &self,
        envelope: Envelope,
        deadline: Option<Timestamp>,
        attempts: u32,
        next_attempt: Timestamp,
        reason: &str,
    ) -> AckHandle {
        let (handle, ack) = AckHandle::pending(envelope.message_id);
        self.lock_queue()
            .push(envelope, deadline, ack, attempts, next_attempt, reason);
        handle
    }

    async fn transmit_all(&self, routes: &[Route], envelope: &Envelope) -> LinkResult<Vec<ChannelKind>> {
        let mut delivered = Vec::new();
        let mut first_error = None;
        for route in routes {
            match self.transmit(*route, envelope).await {
                Ok(()) => {
                    if !delivered.contains(&route.channel()) {
                        delivered.push(route.channel());
                    }
                }
                Err(e) => {
                    tracing::debug!(message_id = envelope.message_id, route = ?route, error = %e, "Route failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if !delivered.is_empty() {
            return Ok(delivered);
        }
        Err(first_error.unwrap_or_else(|| LinkError::NoPathAvailable {
            target: envelope.destination.clone(),
        }))
    }

    async fn transmit(&self, route: Route, envelope: &Envelope) -> LinkResult<()> {
        let channel = route.channel();
        let driver = self.driver(channel)?;
        let (peer, bytes) = match route {
            Route::Sealed(_) => {
                let sealed = self.sessions.seal(channel, &envelope.to_bytes()?)?;
                let frame = LinkFrame::Sealed {
                    sender: self.node_id.clone(),
                    frame: sealed.to_bytes(),
                };
                (None, frame.to_bytes()?)
            }
            Route::Relay => {
                let path = self.relay_path(&envelope.destination)?;
                let packet = self.wrap(&path, envelope)?;
                let first_hop = path
                    .hops
                    .first()
                    .cloned()
                    .ok_or_else(|| LinkError::NoPathAvailable {
                        target: envelope.destination.clone(),
                    })?;
                let frame = LinkFrame::Onion {
                    packet: packet.to_bytes(),
                };
                (Some(first_hop), frame.to_bytes()?)
            }
        };

        let result = match &peer {
            Some(first_hop) => driver.send_to(first_hop, &bytes).await,
            None => driver.send(&bytes).await,
        };
        let now = self.clock.now_ms();
        let commands = self.lock_mode().on_delivery(channel, result.is_ok(), now);
        self.enqueue(commands);
        result
    }

    /// Best path to `destination`, or to the best egress when the
    /// destination is not a swarm member. Paths through relays that lost
    /// eligibility since the last recompute are skipped.
    fn relay_path(&self, destination: &str) -> LinkResult<RelayPath> {
        let floor = self.config.snapshot().trust_floor;
        let table = self.paths.current();
        let usable = |path: &&RelayPath| path.hops.iter().all(|hop| self.registry.is_eligible(hop, floor));
        let no_path = || LinkError::NoPathAvailable {
            target: destination.to_string(),
        };

        if let Some(path) = table.selection(destination).and_then(|s| s.paths.iter().find(usable)) {
            return Ok(path.clone());
        }
        if self.registry.get(destination).is_some() {
            return Err(no_path());
        }
        table
            .reachable_targets()
            .iter()
            .filter(|target| {
                self.registry
                    .get(target)
                    .is_some_and(|node| node.capability_flags.is_egress())
            })
            .filter_map(|target| table.best_path(target))
            .filter(usable)
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .cloned()
            .ok_or_else(no_path)
    }

    fn wrap(&self, path: &RelayPath, envelope: &Envelope) -> LinkResult<OnionPacket> {
        let relays = path
            .intermediates()
            .iter()
            .map(|id| self.public_identity(id))
            .collect::<LinkResult<Vec<_>>>()?;
        let target = path.target().ok_or_else(|| LinkError::NoPathAvailable {
            target: envelope.destination.clone(),
        })?;
        let destination = self.public_identity(target)?;
        Ok(OnionCodec::wrap(&envelope.to_bytes()?, &relays, &destination)?)
    }

    fn public_identity(&self, node_id: &str) -> LinkResult<PublicIdentity> {
        if let Some(node) = self.registry.get(node_id) {
            return Ok(node.identity);
        }
        self.keystore
            .peer_public_key(node_id)
            .map_err(|_| LinkError::UnknownDestination(node_id.to_string()))
    }

    fn driver(&self, channel: ChannelKind) -> LinkResult<Arc<dyn ChannelDriver>> {
        self.drivers.get(channel).cloned().ok_or_else(|| LinkError::Driver {
            channel,
            reason: "no driver installed".to_string(),
        })
    }

    async fn handle_frame(&self, channel: ChannelKind, frame: LinkFrame) -> Vec<InboundMessage> {
        match frame {
            LinkFrame::Sealed { sender, frame } => self.open_sealed(channel, &sender, &frame).into_iter().collect(),
            LinkFrame::Onion { packet } => self.handle_onion(&packet).await.into_iter().collect(),
            LinkFrame::Probe { frame } => {
                self.handle_probe(&frame).await;
                Vec::new()
            }
            LinkFrame::Receipt { receipt } => {
                self.flood_receipt(receipt).await;
                Vec::new()
            }
            LinkFrame::Beacon { beacon } => self.handle_beacon(channel, beacon),
        }
    }

    fn open_sealed(&self, channel: ChannelKind, sender: &str, bytes: &[u8]) -> Option<InboundMessage> {
        let opened = SealedFrame::from_bytes(bytes)
            .map_err(LinkError::from)
            .and_then(|sealed| Ok(self.sessions.open(channel, &sealed)?))
            .and_then(|plain| Envelope::from_bytes(&plain));
        match opened {
            Ok(envelope) if envelope.destination == self.node_id => Some(InboundMessage {
                envelope,
                channel,
                protected: true,
            }),
            Ok(envelope) => {
                tracing::debug!(channel = %channel, destination = %envelope.destination, "Sealed frame for another node");
                None
            }
            Err(e) => {
                self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(channel = %channel, sender, error = %e, "Sealed frame did not open");
                None
            }
        }
    }

    async fn handle_onion(&self, bytes: &[u8]) -> Option<InboundMessage> {
        enum Step {
            Forward(NodeId, OnionPacket),
            Deliver(Envelope),
        }

        let step = {
            let peeled = OnionPacket::from_bytes(bytes).and_then(|packet| {
                let identity = borrow_identity(self.keystore.as_ref())
                    .map_err(|e| OnionError::Malformed(e.to_string()))?;
                OnionCodec::peel(&packet, identity.relay_secret())
            });
            let peeled = match peeled {
                Ok(peeled) => peeled,
                Err(e) => {
                    self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(error = %e, "Onion layer did not peel");
                    return None;
                }
            };
            match &peeled.next {
                NextHop::Relay(next) => match peeled.forward_packet() {
                    Ok(inner) => Step::Forward(next.clone(), inner),
                    Err(e) => {
                        tracing::debug!(error = %e, "Inner onion layer malformed");
                        return None;
                    }
                },
                NextHop::Destination => match Envelope::from_bytes(&peeled.inner) {
                    Ok(envelope) => Step::Deliver(envelope),
                    Err(e) => {
                        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(error = %e, "Onion payload undecodable");
                        return None;
                    }
                },
            }
        };

        match step {
            Step::Forward(next, packet) => {
                let sent = match (LinkFrame::Onion { packet: packet.to_bytes() }).to_bytes() {
                    Ok(frame) => match self.driver(ChannelKind::Mesh) {
                        Ok(mesh) => mesh.send_to(&next, &frame).await,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    tracing::warn!(next = %next, error = %e, "Relay forward failed");
                }
                None
            }
            Step::Deliver(envelope) if envelope.destination == self.node_id => Some(InboundMessage {
                envelope,
                channel: ChannelKind::Mesh,
                protected: true,
            }),
            Step::Deliver(envelope) => {
                self.egress(envelope).await;
                None
            }
        }
    }

    /// Carry a relayed message the last mile over an infrastructure session.
    async fn egress(&self, envelope: Envelope) {
        for channel in [ChannelKind::Cellular, ChannelKind::Satellite] {
            if !self.sessions.is_established(channel) {
                continue;
            }
            match self.transmit(Route::Sealed(channel), &envelope).await {
                Ok(()) => {
                    tracing::debug!(message_id = envelope.message_id, source = %envelope.source, channel = %channel, "Relayed message egressed");
                    return;
                }
                Err(e) => tracing::warn!(channel = %channel, error = %e, "Egress failed"),
            }
        }
        tracing::warn!(message_id = envelope.message_id, destination = %envelope.destination, "No infrastructure session for egress");
    }

    async fn handle_probe(&self, bytes: &[u8]) {
        let frame = match ProbeFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "Probe frame malformed");
                return;
            }
        };
        let identity = match borrow_identity(self.keystore.as_ref()) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "Probe not answered");
                return;
            }
        };
        let (receipt, action) = RelayResponder::new(identity).respond(&frame);
        self.flood_receipt(receipt).await;

        if let ProbeAction::Forward { next, frame } = action {
            let sent = match (LinkFrame::Probe { frame: frame.to_bytes() }).to_bytes() {
                Ok(bytes) => match self.driver(ChannelKind::Mesh) {
                    Ok(mesh) => mesh.send_to(&next, &bytes).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                tracing::debug!(next = %next, error = %e, "Probe not forwarded");
            }
        }
    }

    /// Publish a receipt locally and re-flood it once.
    async fn flood_receipt(&self, receipt: HopReceipt) {
        let key = (receipt.probe_id, receipt.node_id.clone());
        {
            let mut seen = self.seen_receipts.lock().unwrap_or_else(PoisonError::into_inner);
            let (set, order) = &mut *seen;
            if !set.insert(key.clone()) {
                return;
            }
            order.push_back(key);
            while order.len() > SEEN_RECEIPTS {
                if let Some(old) = order.pop_front() {
                    set.remove(&old);
                }
            }
        }

        let _ = self.receipts.send(receipt.clone());
        let sent = match (LinkFrame::Receipt { receipt }).to_bytes() {
            Ok(bytes) => match self.driver(ChannelKind::Mesh) {
                Ok(mesh) => mesh.send(&bytes).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::debug!(error = %e, "Receipt not flooded");
        }
    }

    fn handle_beacon(&self, channel: ChannelKind, beacon: BeaconFrame) -> Vec<InboundMessage> {
        tracing::debug!(node_id = %beacon.node_id, sequence = beacon.sequence, battery = beacon.battery_pct, "Beacon heard");
        beacon
            .messages
            .into_iter()
            .filter(|envelope| envelope.destination == self.node_id)
            .map(|envelope| InboundMessage {
                envelope,
                channel,
                protected: false,
            })
            .collect()
    }

    fn penalize_relay(&self, node_id: &str, severity: Severity, now: Timestamp) {
        let floor = self.config.snapshot().trust_floor;
        let Some(change) = self.registry.apply_threat(node_id, severity, floor, now) else {
            tracing::debug!(node_id, "Threat against unregistered relay");
            return;
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.record_trust(&change) {
                tracing::warn!(node_id, error = %e, "Trust change not persisted");
            }
        }
        if change.quarantined {
            self.events.publish(
                EventBuilder::new(event_types::RELAY_COMPROMISED, SOURCE)
                    .severity(EventSeverity::Critical)
                    .category(EventCategory::Trust)
                    .subject(node_id.to_string())
                    .at(now)
                    .message(format!("Relay {node_id} quarantined after {severity} threat"))
                    .metadata("trust", change.current)
                    .build(),
            );
            self.paths.recompute(now);
        }
    }

    fn spawn_probe(&self, target: NodeId) {
        let (Some(proof), Ok(runtime)) = (&self.proof, tokio::runtime::Handle::try_current()) else {
            return;
        };
        let proof = Arc::clone(proof);
        runtime.spawn(async move {
            let reports = proof.probe_target(&target).await;
            tracing::debug!(target = %target, paths = reports.len(), "Suspect path probed");
        });
    }

    fn enqueue(&self, commands: Vec<ModeCommand>) {
        if commands.is_empty() {
            return;
        }
        self.lock_pending().extend(commands);
        self.spawn_drain();
    }

    fn spawn_drain(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Some(this) = self.this.upgrade() {
            runtime.spawn(this.drain_owned());
        }
    }

    fn drain_owned(self: Arc<Self>) -> DrainFuture {
        Box::pin(async move { self.drain().await })
    }

    /// Execute queued commands in order. One drainer runs at a time.
    async fn drain(&self) {
        let _running = self.executing.lock().await;
        loop {
            let next = self.lock_pending().pop_front();
            let Some(command) = next else {
                break;
            };
            self.execute(command).await;
        }
    }

    async fn execute(&self, command: ModeCommand) {
        let now = self.clock.now_ms();
        match command {
            ModeCommand::Activate(channels) => {
                for channel in channels {
                    match self.driver(channel) {
                        Ok(driver) => {
                            if let Err(e) = driver.activate().await {
                                tracing::warn!(channel = %channel, error = %e, "Activation failed");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Activation skipped"),
                    }
                }
            }
            ModeCommand::Deactivate(channels) => {
                for channel in channels {
                    if let Some(driver) = self.drivers.get(channel) {
                        if let Err(e) = driver.deactivate().await {
                            tracing::warn!(channel = %channel, error = %e, "Deactivation failed");
                        }
                    }
                }
            }
            ModeCommand::Purge(channels) => {
                for channel in channels {
                    if self.sessions.purge(channel) {
                        tracing::info!(channel = %channel, "Session keys purged");
                    }
                }
            }
            ModeCommand::Authenticate {
                attempt,
                channels,
                deadline,
            } => {
                for channel in channels {
                    self.spawn_authentication(attempt, channel, deadline);
                }
            }
            ModeCommand::StartBeacon => {
                let frequency = self.lock_beacon().start(now);
                if let (Some(frequency), Some(driver)) = (frequency, self.drivers.get(ChannelKind::EmergencyRadio)) {
                    if let Err(e) = driver.tune(frequency).await {
                        tracing::warn!(frequency, error = %e, "Emergency radio did not tune");
                    }
                }
            }
            ModeCommand::StopBeacon => self.lock_beacon().stop(),
            ModeCommand::PersistCooldown { key, until } => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.set_cooldown(&key, until, now) {
                        tracing::warn!(key = %key, error = %e, "Cooldown not persisted");
                    }
                }
            }
        }
    }

    fn spawn_authentication(&self, attempt: u64, channel: ChannelKind, deadline: Timestamp) {
        let driver = match self.driver(channel) {
            Ok(driver) => driver,
            Err(e) => {
                self.finish_authentication(attempt, channel, Err(e));
                return;
            }
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let result = this.authenticator.authenticate(driver.as_ref()).await;
            if result.is_ok() && this.clock.now_ms() > deadline {
                tracing::debug!(channel = %channel, attempt, "Authentication finished after its deadline");
            }
            this.finish_authentication(attempt, channel, result);
        });
    }

    fn finish_authentication(&self, attempt: u64, channel: ChannelKind, result: LinkResult<()>) {
        let now = self.clock.now_ms();
        let commands = {
            let mut mode = self.lock_mode();
            match result {
                Ok(()) => mode.on_authenticated(attempt, channel, now),
                Err(LinkError::AuthenticationFailed { reason, .. }) => {
                    mode.on_auth_failed(attempt, channel, &reason, now)
                }
                Err(e) => mode.on_auth_failed(attempt, channel, &e.to_string(), now),
            }
        };
        self.enqueue(commands);
    }

    fn lock_mode(&self) -> std::sync::MutexGuard<'_, ModeController> {
        self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<ModeCommand>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, EmergencyQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_beacon(&self) -> std::sync::MutexGuard<'_, Beacon> {
        self.beacon.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackDriver, LoopbackGateway, LoopbackMedium};
    use crate::mode::TransitionPhase;
    use std::time::Duration;
    use swarmlink_core::{LinkConfig, ManualClock};
    use swarmlink_crypto::{MemoryKeyStore, NodeIdentity};
    use swarmlink_mesh::CapabilityFlags;
    use swarmlink_threat::ThreatKind;

    struct Fixture {
        clock: Arc<ManualClock>,
        keystore: Arc<MemoryKeyStore>,
        cell_gateway: Arc<LoopbackGateway>,
        sat_gateway: Arc<LoopbackGateway>,
        cellular: Arc<LoopbackDriver>,
        satellite: Arc<LoopbackDriver>,
        radio: Arc<LoopbackDriver>,
        radio_medium: Arc<LoopbackMedium>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let keystore = Arc::new(MemoryKeyStore::new(NodeIdentity::generate("uav-1")));
        let gateway = |name: &str| {
            let gateway = Arc::new(LoopbackGateway::new(NodeIdentity::generate(name)));
            keystore.add_peer(gateway.public());
            gateway.add_node(keystore.identity().public());
            gateway
        };
        let cell_gateway = gateway("cell-gw");
        let sat_gateway = gateway("sat-gw");

        let medium = |kind| LoopbackMedium::with_clock(kind, clock.clone());
        let cellular = Arc::new(medium(ChannelKind::Cellular).attach("uav-1").with_gateway(Arc::clone(&cell_gateway)));
        let satellite = Arc::new(medium(ChannelKind::Satellite).attach("uav-1").with_gateway(Arc::clone(&sat_gateway)));
        let radio_medium = medium(ChannelKind::EmergencyRadio);
        let radio = Arc::new(radio_medium.attach("uav-1"));
        cellular.set_link_quality(Some((0.9, 0.01)));

        Fixture {
            clock,
            keystore,
            cell_gateway,
            sat_gateway,
            cellular,
            satellite,
            radio,
            radio_medium,
        }
    }

    impl Fixture {
        fn controller(&self, initial: Mode) -> Arc<LinkController> {
            let config = ConfigHandle::new(LinkConfig {
                node_id: "uav-1".to_string(),
                initial_mode: initial,
                ..LinkConfig::default()
            })
            .unwrap();
            let drivers = DriverSet::new()
                .with(self.cellular.clone())
                .with(self.satellite.clone())
                .with(self.radio.clone());
            LinkController::builder(config, self.keystore.clone(), drivers)
                .with_clock(self.clock.clone())
                .build()
                .unwrap()
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn station_threat(channel: ChannelKind, kind: ThreatKind) -> ThreatEvent {
        ThreatEvent {
            sequence: 1,
            kind,
            severity: kind.severity(),
            rule: "test".to_string(),
            affected: Affected::Station {
                channel,
                station_id: "cell-4711".to_string(),
            },
            evidence: serde_json::json!({}),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_build_requires_driver_for_initial_mode() {
        let f = fixture();
        let config = ConfigHandle::new(LinkConfig {
            initial_mode: Mode::Tactical,
            ..LinkConfig::default()
        })
        .unwrap();
        let result = LinkController::builder(config, f.keystore.clone(), DriverSet::new().with(f.cellular.clone())).build();
        assert!(matches!(result, Err(LinkError::Startup(_))));
    }

    #[tokio::test]
    async fn test_sealed_send_reaches_gateway() {
        let f = fixture();
        let controller = f.controller(Mode::Infrastructure);
        controller.start().await.unwrap();
        settle().await;
        assert!(f.cellular.is_active());

        let delivery = controller
            .send(OutboundMessage::new("ground", b"position".to_vec()))
            .await
            .unwrap()
            .delivered()
            .await
            .unwrap();
        assert_eq!(delivery.channels, vec![ChannelKind::Cellular]);

        let received = f.cell_gateway.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, b"position");
        assert_eq!(received[0].source, "uav-1");
    }

    #[tokio::test]
    async fn test_send_without_session_fails_authentication() {
        let f = fixture();
        f.cell_gateway.set_refusing(true);
        let controller = f.controller(Mode::Infrastructure);
        controller.start().await.unwrap();
        settle().await;

        let err = controller
            .send(OutboundMessage::new("ground", b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::AuthenticationFailed { channel: ChannelKind::Cellular, .. }));
        assert!(f.cell_gateway.uplinked().is_empty());
    }

    #[tokio::test]
    async fn test_emergency_message_retried_until_delivered() {
        let f = fixture();
        let controller = f.controller(Mode::Infrastructure);
        controller.start().await.unwrap();
        settle().await;

        f.cellular.set_failing(true);
        let mut handle = controller
            .send(OutboundMessage::new("ground", b"mayday".to_vec()).with_priority(Priority::Emergency))
            .await
            .unwrap();
        assert!(handle.try_outcome().is_none());
        assert_eq!(controller.queued_emergency(), 1);

        controller.retry_emergency().await;
        assert_eq!(controller.queued_emergency(), 1, "not due yet");

        f.cellular.set_failing(false);
        f.clock.advance(Duration::from_secs(2));
        controller.retry_emergency().await;

        let delivery = handle.try_outcome().unwrap().unwrap();
        assert_eq!(delivery.attempts, 2);
        assert_eq!(controller.queued_emergency(), 0);
        assert_eq!(f.cell_gateway.received()[0].payload, b"mayday");
    }

    #[tokio::test]
    async fn test_emergency_message_fails_at_deadline() {
        let f = fixture();
        let controller = f.controller(Mode::Infrastructure);
        let mut failures = controller.events().subscribe();
        controller.start().await.unwrap();
        settle().await;

        f.cellular.set_failing(true);
        let deadline = f.clock.now_ms() + 5_000;
        let handle = controller
            .send(
                OutboundMessage::new("ground", b"mayday".to_vec())
                    .with_priority(Priority::Emergency)
                    .with_deadline(deadline),
            )
            .await
            .unwrap();

        for _ in 0..3 {
            f.clock.advance(Duration::from_secs(2));
            controller.retry_emergency().await;
        }
        let err = handle.delivered().await.unwrap_err();
        assert!(matches!(err, LinkError::DeliveryFailed { .. }));

        let failed = std::iter::from_fn(|| failures.try_recv().ok())
            .any(|e| e.event_type == event_types::DELIVERY_FAILED);
        assert!(failed);
    }

    #[tokio::test]
    async fn test_emergency_mode_carries_messages_on_beacon() {
        let f = fixture();
        let controller = f.controller(Mode::Emergency);
        controller.start().await.unwrap();
        assert!(f.radio.is_active());
        assert_eq!(f.radio.tuned().len(), 1);

        let err = controller
            .send(OutboundMessage::new("ground", b"status".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NoPathAvailable { .. }));

        let handle = controller
            .send(OutboundMessage::new("ground", b"mayday".to_vec()).with_priority(Priority::Emergency))
            .await
            .unwrap();

        let listener = f.radio_medium.attach("ground");
        listener.activate().await.unwrap();
        controller.beacon_tick().await;

        let delivery = handle.delivered().await.unwrap();
        assert_eq!(delivery.channels, vec![ChannelKind::EmergencyRadio]);

        let LinkFrame::Beacon { beacon } = LinkFrame::from_bytes(&listener.receive().await.unwrap()).unwrap() else {
            panic!("expected a beacon");
        };
        assert_eq!(beacon.node_id, "uav-1");
        assert_eq!(beacon.messages.len(), 1);
        assert_eq!(beacon.messages[0].payload, b"mayday");
    }

    #[tokio::test]
    async fn test_forced_switch_blocks_sends_until_overlap() {
        let f = fixture();
        f.satellite.set_link_quality(Some((0.8, 0.02)));
        let controller = f.controller(Mode::Infrastructure);
        controller.start().await.unwrap();
        settle().await;
        controller.collect_metrics().await;
        controller.tick().await;
        assert_eq!(controller.current_mode().phase, TransitionPhase::Steady);

        controller.on_threat(&station_threat(ChannelKind::Cellular, ThreatKind::SpoofingSuspected));
        let state = controller.current_mode();
        assert_eq!(state.blocked_transition(), Some((Mode::Infrastructure, Mode::Satcom)));
        assert!(state.is_suspended(ChannelKind::Cellular));

        let err = controller
            .send(OutboundMessage::new("ground", b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::ModeTransitioning { from: Mode::Infrastructure, to: Mode::Satcom }));

        settle().await;
        assert_eq!(controller.current_mode().overlap_target(), Some(Mode::Satcom));
        assert!(f.satellite.is_active());

        let delivery = controller
            .send(OutboundMessage::new("ground", b"x".to_vec()))
            .await
            .unwrap()
            .delivered()
            .await
            .unwrap();
        assert_eq!(delivery.channels, vec![ChannelKind::Satellite]);
        assert_eq!(f.sat_gateway.received().len(), 1);
        assert!(f.cell_gateway.received().is_empty());
    }

    #[tokio::test]
    async fn test_downgrade_telemetry_acts_immediately() {
        let f = fixture();
        let controller = f.controller(Mode::Infrastructure);
        controller.start().await.unwrap();
        settle().await;
        controller.detector().learn_session(ChannelKind::Cellular, 256);

        let raised = controller
            .ingest_telemetry(&Telemetry::SessionNegotiated {
                channel: ChannelKind::Cellular,
                strength_bits: 64,
                timestamp: f.clock.now_ms(),
            })
            .unwrap();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].severity, Severity::Critical);

        // No forecast yet, so nothing safe to switch to.
        assert_eq!(controller.current_mode().mode, Mode::Emergency);
    }

    #[tokio::test]
    async fn test_relay_threat_quarantines_relay() {
        let f = fixture();
        let controller = f.controller(Mode::Infrastructure);
        let mut events = controller.events().subscribe();
        controller
            .registry()
            .upsert(NodeIdentity::generate("R1").public(), CapabilityFlags::RELAY, 0);

        controller.on_threat(&ThreatEvent {
            sequence: 1,
            kind: ThreatKind::SpoofingSuspected,
            severity: Severity::Critical,
            rule: "test".to_string(),
            affected: Affected::Relay {
                node_id: "R1".to_string(),
            },
            evidence: serde_json::json!({}),
            timestamp: 0,
        });

        assert!(controller.registry().get("R1").unwrap().quarantined_at.is_some());
        assert_eq!(controller.current_mode().mode, Mode::Infrastructure);
        let compromised = std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| e.event_type == event_types::RELAY_COMPROMISED && e.subject.as_deref() == Some("R1"));
        assert!(compromised);
    }

    #[tokio::test]
    async fn test_stop_fails_queue_and_purges_sessions() {
        let f = fixture();
        let controller = f.controller(Mode::Infrastructure);
        controller.start().await.unwrap();
        settle().await;
        assert!(controller.sessions().is_established(ChannelKind::Cellular));

        f.cellular.set_failing(true);
        let handle = controller
            .send(OutboundMessage::new("ground", b"mayday".to_vec()).with_priority(Priority::Emergency))
            .await
            .unwrap();
        controller.stop().await;

        assert!(handle.delivered().await.is_err());
        assert!(!controller.sessions().is_established(ChannelKind::Cellular));
        assert!(!f.cellular.is_active());
    }

    #[test]
    fn test_overlap_duplicates_only_critical_traffic() {
        let state = ModeState {
            mode: Mode::Infrastructure,
            phase: TransitionPhase::Overlap,
            pending_target: Some(Mode::Satcom),
            transition_started_at: Some(0),
            overlap_deadline: Some(10_000),
            forced: false,
            suspended_channels: Vec::new(),
        };
        assert_eq!(plan_routes(&state, Priority::Normal), vec![Route::Sealed(ChannelKind::Cellular)]);
        assert_eq!(
            plan_routes(&state, Priority::Critical),
            vec![Route::Sealed(ChannelKind::Cellular), Route::Sealed(ChannelKind::Satellite)]
        );
        assert_eq!(
            plan_routes(&ModeState { suspended_channels: vec![ChannelKind::Cellular], ..state }, Priority::Low),
            vec![Route::Sealed(ChannelKind::Satellite)]
        );
    }
}
