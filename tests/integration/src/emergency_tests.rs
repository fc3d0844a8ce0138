//! EMERGENCY entry, beacon delivery and recovery.

use crate::test_utils::{NodeSpec, Swarm};
use std::time::Duration;
use swarmlink_core::{event_types, ChannelKind, Mode, Priority};
use swarmlink_link::{LinkError, OutboundMessage};

const STEP: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_blackout_enters_emergency_and_beacon_reaches_listener() {
    let swarm = Swarm::build(vec![
        NodeSpec::relay("uav-1", Mode::Infrastructure),
        NodeSpec::relay("rescue", Mode::Emergency),
    ])
    .await;
    swarm
        .node("rescue")
        .flight
        .update(|f| f.emergency_demanded = true);

    let node = swarm.node("uav-1");
    let mut events = node.controller.events().subscribe();
    for driver in [&node.mesh, &node.cellular, &node.satellite] {
        driver.set_link_quality(None);
    }

    // The blackout clock starts at the first tick without a viable mode.
    swarm.run_for(Duration::from_secs(290), STEP).await;
    assert_eq!(node.controller.current_mode().mode, Mode::Infrastructure);
    assert!(!node.radio.is_active());

    swarm.run_for(Duration::from_secs(20), STEP).await;
    assert_eq!(node.controller.current_mode().mode, Mode::Emergency);
    assert!(node.radio.is_active());
    assert!(!node.radio.tuned().is_empty());
    assert!(!node.controller.sessions().is_established(ChannelKind::Cellular));
    let entered = std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| e.event_type == event_types::EMERGENCY_ENTERED);
    assert!(entered);

    let err = node
        .controller
        .send(OutboundMessage::new("rescue", b"routine".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::NoPathAvailable { .. }));

    let handle = node
        .controller
        .send(OutboundMessage::new("rescue", b"mayday 48.1N 11.6E".to_vec()).with_priority(Priority::Emergency))
        .await
        .unwrap();
    assert_eq!(node.controller.queued_emergency(), 1);
    node.controller.beacon_tick().await;

    let delivery = handle.delivered().await.unwrap();
    assert_eq!(delivery.channels, vec![ChannelKind::EmergencyRadio]);
    assert_eq!(node.controller.queued_emergency(), 0);

    let heard = swarm.controller("rescue").receive().await;
    assert_eq!(heard.len(), 1);
    assert_eq!(heard[0].channel, ChannelKind::EmergencyRadio);
    assert_eq!(heard[0].envelope.source, "uav-1");
    assert_eq!(heard[0].envelope.payload, b"mayday 48.1N 11.6E");
    assert!(!heard[0].protected, "beacon traffic is unauthenticated");
}

#[tokio::test]
async fn test_low_battery_enters_emergency_and_recovery_stops_beacon() {
    let swarm = Swarm::build(vec![NodeSpec::relay("uav-1", Mode::Infrastructure)]).await;
    let node = swarm.node("uav-1");
    swarm.collect_metrics().await;
    swarm.tick().await;
    assert_eq!(node.controller.current_mode().mode, Mode::Infrastructure);

    node.flight.update(|f| f.battery_pct = 8.0);
    swarm.advance(Duration::from_secs(1));
    swarm.tick().await;
    assert_eq!(node.controller.current_mode().mode, Mode::Emergency);
    assert!(node.radio.is_active());

    // Links are fine, but policy keeps the node in EMERGENCY.
    swarm.run_for(Duration::from_secs(10), Duration::from_secs(1)).await;
    assert_eq!(node.controller.current_mode().mode, Mode::Emergency);

    node.flight.update(|f| f.battery_pct = 60.0);
    swarm.run_for(Duration::from_secs(30), Duration::from_secs(1)).await;
    let state = node.controller.current_mode();
    assert_eq!(state.mode, Mode::Infrastructure);
    assert!(!state.is_transitioning());
    assert!(node.controller.sessions().is_established(ChannelKind::Cellular));
    assert!(!node.radio.is_active());

    let sent = node.radio.sent_count();
    node.controller.beacon_tick().await;
    assert_eq!(node.radio.sent_count(), sent, "beacon stopped on exit");
}
