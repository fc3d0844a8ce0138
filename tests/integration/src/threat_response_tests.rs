//! Threat detection driving forced mode switches on a live controller.

use crate::test_utils::{NodeSpec, Swarm};
use std::time::Duration;
use swarmlink_core::{event_types, ChannelKind, Clock, Mode, Severity};
use swarmlink_crypto::SessionError;
use swarmlink_link::{LinkError, OutboundMessage, TransitionPhase};
use swarmlink_threat::{FingerprintSample, Telemetry, ThreatKind};

/// A lone UAV on infrastructure with satellite as the fallback.
async fn lone_uav() -> Swarm {
    let swarm = Swarm::build(vec![NodeSpec::relay("uav-1", Mode::Infrastructure)]).await;
    swarm.collect_metrics().await;
    swarm.tick().await;
    let state = swarm.controller("uav-1").current_mode();
    assert_eq!(state.mode, Mode::Infrastructure);
    assert_eq!(state.phase, TransitionPhase::Steady);
    swarm
}

#[tokio::test]
async fn test_fingerprint_mismatch_forces_switch_before_next_tick() {
    let swarm = lone_uav().await;
    let uav = swarm.controller("uav-1");
    let mut events = uav.events().subscribe();

    let raised = uav
        .ingest_telemetry(&Telemetry::Fingerprint {
            channel: ChannelKind::Cellular,
            subject: "cell-4711".to_string(),
            sample: FingerprintSample::Similarity(0.5),
            timestamp: swarm.clock.now_ms(),
        })
        .unwrap();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].kind, ThreatKind::SpoofingSuspected);
    assert_eq!(raised[0].severity, Severity::High);

    // Authentication of the satellite leg runs in the background.
    swarm.settle().await;
    let state = uav.current_mode();
    assert!(state.forced);
    assert_eq!(state.overlap_target(), Some(Mode::Satcom));
    assert!(state.is_suspended(ChannelKind::Cellular));
    assert!(swarm.node("uav-1").satellite.is_active());

    let types: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| e.event_type)
        .collect();
    assert!(types.iter().any(|t| t == event_types::THREAT_DETECTED));
    assert!(types.iter().any(|t| t == event_types::TRANSITION_FORCED));

    // Traffic leaves on satellite only while cellular is locked out.
    uav.send(OutboundMessage::new("ops", b"position".to_vec()))
        .await
        .unwrap();
    assert_eq!(swarm.ground_station.received().len(), 1);
    assert!(swarm.tower.received().is_empty());

    swarm.run_for(Duration::from_secs(11), Duration::from_secs(1)).await;
    let state = uav.current_mode();
    assert_eq!(state.mode, Mode::Satcom);
    assert_eq!(state.phase, TransitionPhase::Steady);
    assert!(!uav.sessions().is_established(ChannelKind::Cellular));
    assert!(!swarm.node("uav-1").cellular.is_active());
    assert!(matches!(
        uav.sessions().seal(ChannelKind::Cellular, b"late"),
        Err(SessionError::AuthenticationFailed { channel: ChannelKind::Cellular, .. })
    ));
}

#[tokio::test]
async fn test_critical_downgrade_without_alternative_enters_emergency() {
    let swarm = lone_uav().await;
    let node = swarm.node("uav-1");
    node.satellite.set_link_quality(None);
    swarm.advance(Duration::from_secs(1));
    swarm.collect_metrics().await;
    swarm.tick().await;

    let uav = &node.controller;
    uav.detector().learn_session(ChannelKind::Cellular, 256);
    let raised = uav
        .ingest_telemetry(&Telemetry::SessionNegotiated {
            channel: ChannelKind::Cellular,
            strength_bits: 40,
            timestamp: swarm.clock.now_ms(),
        })
        .unwrap();
    assert_eq!(raised[0].kind, ThreatKind::ProtocolDowngrade);
    assert_eq!(raised[0].severity, Severity::Critical);

    // Acted on before the call returned.
    assert_eq!(uav.current_mode().mode, Mode::Emergency);
    swarm.settle().await;
    assert!(!node.cellular.is_active());
    assert!(!uav.sessions().is_established(ChannelKind::Cellular));
    assert!(node.radio.is_active());
    assert!(!node.radio.tuned().is_empty());

    let err = uav
        .send(OutboundMessage::new("ops", b"status".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::NoPathAvailable { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_medium_path_threat_probes_instead_of_switching() {
    let swarm = Swarm::build(vec![
        NodeSpec::relay("A", Mode::Tactical),
        NodeSpec::relay("B", Mode::Tactical),
        NodeSpec::relay("C", Mode::Tactical),
    ])
    .await;
    swarm.connect("A", "B");
    swarm.connect("B", "C");
    swarm.controller("A").track_destination("C");
    swarm.recompute();

    let uav = swarm.controller("A");
    let before = uav.registry().trust("B").unwrap();
    let raised = uav
        .ingest_telemetry(&Telemetry::PathLatency {
            hops: vec!["B".to_string(), "C".to_string()],
            expected_ms: 200,
            measured_ms: 900,
            timestamp: swarm.clock.now_ms(),
        })
        .unwrap();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].kind, ThreatKind::TrafficAnalysisOrTampering);
    assert_eq!(raised[0].severity, Severity::Medium);
    assert_eq!(uav.detector().log().len(), 1);

    // Held until its response deadline, then released as a path probe.
    swarm.pump_for(Duration::from_millis(100)).await;
    assert_eq!(uav.registry().trust("B"), Some(before));
    swarm.run_for(Duration::from_secs(1), Duration::from_secs(1)).await;
    swarm.pump_for(Duration::from_secs(1)).await;

    assert_eq!(uav.current_mode().mode, Mode::Tactical);
    assert!(uav.registry().trust("B").unwrap() > before);
    assert!(uav.registry().get("B").unwrap().quarantined_at.is_none());
}

#[tokio::test]
async fn test_imsi_catcher_density_locks_out_cellular() {
    let swarm = lone_uav().await;
    let uav = swarm.controller("uav-1");

    let raised = uav
        .ingest_telemetry(&Telemetry::Density {
            channel: ChannelKind::Cellular,
            lat: 48.1,
            lon: 11.6,
            observed: 40,
            timestamp: swarm.clock.now_ms(),
        })
        .unwrap();
    assert_eq!(raised[0].kind, ThreatKind::ImsiCatcherSuspected);
    swarm.settle().await;

    let state = uav.current_mode();
    assert!(state.is_suspended(ChannelKind::Cellular));
    assert_eq!(state.pending_target, Some(Mode::Satcom));

    // The lockout holds even if the forecast would favour cellular again.
    swarm.run_for(Duration::from_secs(30), Duration::from_secs(1)).await;
    let state = uav.current_mode();
    assert_eq!(state.mode, Mode::Satcom);
    assert!(state.is_suspended(ChannelKind::Cellular));
}
