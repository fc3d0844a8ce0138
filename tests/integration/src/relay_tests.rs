//! Onion relaying, diverse path selection and proof-of-relay across a swarm.

use crate::test_utils::{NodeSpec, Swarm};
use std::collections::HashSet;
use std::time::Duration;
use swarmlink_core::{event_types, ChannelKind, Clock, Mode, Priority, Severity};
use swarmlink_crypto::{NextHop, OnionCodec, OnionPacket};
use swarmlink_link::{ChannelDriver, LinkError, LinkFrame, OutboundMessage};
use swarmlink_mesh::{DiversityLevel, ProbeVerdict};
use swarmlink_threat::{Affected, ThreatEvent, ThreatKind};

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn tactical(ids: &[&str]) -> Vec<NodeSpec> {
    ids.iter().map(|id| NodeSpec::relay(id, Mode::Tactical)).collect()
}

#[tokio::test]
async fn test_relay_forwards_without_reading_payload() {
    let swarm = Swarm::build(tactical(&["A", "B", "C"])).await;
    swarm.connect("A", "B");
    swarm.connect("B", "C");
    swarm.controller("A").track_destination("C");
    swarm.recompute();

    let payload = b"target grid 4471-0932".to_vec();
    let delivery = swarm
        .controller("A")
        .send(OutboundMessage::new("C", payload.clone()))
        .await
        .unwrap()
        .delivered()
        .await
        .unwrap();
    assert_eq!(delivery.channels, vec![ChannelKind::Mesh]);

    // Look at exactly what B was handed.
    let at_b = swarm.node("B").mesh.receive().await.expect("B received a layer");
    assert!(!contains(&at_b, &payload));
    let LinkFrame::Onion { packet } = LinkFrame::from_bytes(&at_b).unwrap() else {
        panic!("expected an onion frame");
    };
    let packet = OnionPacket::from_bytes(&packet).unwrap();
    let peeled = OnionCodec::peel(&packet, swarm.node("B").identity.relay_secret()).unwrap();
    assert_eq!(peeled.next, NextHop::Relay("C".to_string()));
    assert!(!contains(&peeled.inner, &payload));

    // Hand it back and let the swarm forward it.
    swarm.mesh.deliver("B", &at_b);
    let delivered = swarm.pump().await;
    assert!(delivered["B"].is_empty());
    assert_eq!(delivered["C"].len(), 1);
    let inbound = &delivered["C"][0];
    assert_eq!(inbound.envelope.payload, payload);
    assert_eq!(inbound.envelope.source, "A");
    assert!(inbound.protected);
    assert_eq!(swarm.controller("C").decrypt_failures(), 0);
}

#[tokio::test]
async fn test_layer_for_another_relay_does_not_open() {
    let swarm = Swarm::build(tactical(&["A", "B", "C", "D"])).await;
    swarm.connect("A", "B");
    swarm.connect("B", "C");
    swarm.connect("A", "D");
    swarm.controller("A").track_destination("C");
    swarm.recompute();

    swarm
        .controller("A")
        .send(OutboundMessage::new("C", b"not for D".to_vec()))
        .await
        .unwrap();
    let at_b = swarm.node("B").mesh.receive().await.unwrap();

    swarm.mesh.deliver("D", &at_b);
    assert!(swarm.controller("D").receive().await.is_empty());
    assert_eq!(swarm.controller("D").decrypt_failures(), 1);
}

#[tokio::test]
async fn test_relayed_message_egresses_over_cellular() {
    let swarm = Swarm::build(vec![
        NodeSpec::relay("A", Mode::Tactical),
        NodeSpec::relay("B", Mode::Tactical),
        NodeSpec::egress("E", Mode::Hybrid),
    ])
    .await;
    swarm.connect("A", "B");
    swarm.connect("B", "E");
    swarm.recompute();
    assert!(swarm.controller("E").sessions().is_established(ChannelKind::Cellular));

    swarm
        .controller("A")
        .send(OutboundMessage::new("ground-control", b"telemetry frame".to_vec()))
        .await
        .unwrap();
    swarm.pump().await;

    let received = swarm.tower.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].source, "A");
    assert_eq!(received[0].destination, "ground-control");
    assert_eq!(received[0].payload, b"telemetry frame");
}

#[tokio::test]
async fn test_paths_are_node_disjoint_and_drop_quarantined_relays() {
    let mut specs = tactical(&["S", "R1", "R2", "R3", "H"]);
    specs.push(NodeSpec::egress("E", Mode::Tactical));
    let swarm = Swarm::build(specs).await;
    for relay in ["R1", "R2", "R3"] {
        swarm.connect("S", relay);
        swarm.connect(relay, "E");
    }
    swarm.connect("R1", "H");
    swarm.connect("H", "E");
    swarm.recompute();

    let source = swarm.controller("S");
    let selection = source.paths().current().selection("E").cloned().unwrap();
    assert_eq!(selection.paths.len(), 3);
    assert_eq!(selection.diversity, DiversityLevel::NodeDisjoint);
    assert_eq!(selection.shortfall, 0);
    let mut seen = HashSet::new();
    for path in &selection.paths {
        for relay in path.intermediates() {
            assert!(seen.insert(relay.clone()), "{relay} shared between paths");
        }
    }

    let mut events = source.events().subscribe();
    source.on_threat(&ThreatEvent {
        sequence: 1,
        kind: ThreatKind::SpoofingSuspected,
        severity: Severity::Critical,
        rule: "fingerprint".to_string(),
        affected: Affected::Relay {
            node_id: "R2".to_string(),
        },
        evidence: serde_json::json!({ "similarity": 0.1 }),
        timestamp: swarm.clock.now_ms(),
    });

    let selection = source.paths().current().selection("E").cloned().unwrap();
    assert!(selection.paths.iter().all(|p| !p.contains("R2")));
    assert_eq!(selection.paths.len(), 2);
    assert!(selection.is_degraded());
    let quarantined = std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| e.event_type == event_types::RELAY_COMPROMISED && e.subject.as_deref() == Some("R2"));
    assert!(quarantined);
}

#[tokio::test(start_paused = true)]
async fn test_probe_blames_relay_that_drops_traffic() {
    let swarm = Swarm::build(tactical(&["A", "B", "C", "D"])).await;
    swarm.connect("A", "B");
    swarm.connect("B", "C");
    swarm.connect("A", "D");
    swarm.connect("D", "C");
    swarm.controller("A").track_destination("C");
    swarm.recompute();
    assert_eq!(
        swarm.controller("A").paths().current().selection("C").unwrap().paths.len(),
        2
    );

    // B still listens but nothing it sends leaves the radio.
    swarm.node("B").mesh.set_failing(true);

    let (reports, _) = tokio::join!(
        swarm.controller("A").probe_relays(),
        swarm.pump_for(Duration::from_secs(2))
    );
    assert_eq!(reports.len(), 2);
    let verdict = |first: &str| {
        reports
            .iter()
            .find(|r| r.path.first().map(String::as_str) == Some(first))
            .map(|r| r.verdict.clone())
            .unwrap()
    };
    assert_eq!(verdict("D"), ProbeVerdict::Verified);
    assert!(matches!(verdict("B"), ProbeVerdict::Compromised { node_id, .. } if node_id == "B"));

    let registry = swarm.controller("A").registry();
    assert!(registry.get("B").unwrap().quarantined_at.is_some());
    let table = swarm.controller("A").paths().current();
    let remaining = table.selection("C").unwrap();
    assert_eq!(remaining.paths.len(), 1);
    assert_eq!(remaining.paths[0].hops, vec!["D".to_string(), "C".to_string()]);

    // Critical traffic still gets through on the surviving path.
    swarm
        .controller("A")
        .send(OutboundMessage::new("C", b"resupply".to_vec()).with_priority(Priority::Critical))
        .await
        .unwrap();
    let delivered = swarm.pump().await;
    assert_eq!(delivered["C"].len(), 1);
    assert_eq!(delivered["C"][0].envelope.payload, b"resupply");
}

#[tokio::test]
async fn test_unreachable_member_is_not_sent_to_egress() {
    let swarm = Swarm::build(vec![
        NodeSpec::relay("A", Mode::Tactical),
        NodeSpec::relay("B", Mode::Tactical),
        NodeSpec::relay("C", Mode::Tactical),
        NodeSpec::egress("E", Mode::Hybrid),
    ])
    .await;
    swarm.connect("A", "B");
    swarm.connect("B", "E");
    swarm.controller("A").track_destination("C");
    swarm.recompute();

    let err = swarm
        .controller("A")
        .send(OutboundMessage::new("C", b"for C only".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::NoPathAvailable { ref target } if target == "C"));
    swarm.pump().await;
    assert!(swarm.tower.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_relay_raises_timing_anomaly() {
    let swarm = Swarm::build(tactical(&["A", "B", "C"])).await;
    swarm.connect("A", "B");
    swarm.connect("B", "C");
    swarm.controller("A").track_destination("C");
    swarm.recompute();
    let expected_ms = swarm.controller("A").paths().current().selection("C").unwrap().paths[0].latency_estimate_ms;

    // B attests and forwards, but everything it transmits is held back.
    swarm.node("B").mesh.set_send_delay(Duration::from_millis(250));

    let uav = swarm.controller("A");
    let (reports, _) = tokio::join!(uav.probe_relays(), swarm.pump_for(Duration::from_secs(2)));
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(matches!(&report.verdict, ProbeVerdict::Compromised { node_id, .. } if node_id == "B"));
    assert!(report.round_trip_ms > report.deadline_ms);

    let anomalies = uav.detector().log().by_kind(ThreatKind::TrafficAnalysisOrTampering);
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].severity, Severity::Medium);
    assert_eq!(anomalies[0].affected, Affected::Path { hops: report.path.clone() });
    assert_eq!(anomalies[0].evidence["expected_ms"], expected_ms);
    assert!(anomalies[0].evidence["measured_ms"].as_u64().unwrap() as f64 > expected_ms as f64 * 1.5);
    assert!(uav.registry().get("B").unwrap().quarantined_at.is_some());
}
