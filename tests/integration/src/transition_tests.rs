//! Predictive mode transitions: staging, authentication gating, rollback
//! and flapping resistance.

use crate::test_utils::{NodeSpec, Swarm};
use std::time::Duration;
use swarmlink_core::{event_types, ChannelKind, LinkEvent, Mode, Priority};
use swarmlink_link::{OutboundMessage, TransitionPhase};
use tokio::sync::broadcast;

const STEP: Duration = Duration::from_secs(1);

async fn lone_uav() -> Swarm {
    let swarm = Swarm::build(vec![NodeSpec::relay("uav-1", Mode::Infrastructure)]).await;
    swarm.collect_metrics().await;
    swarm.tick().await;
    swarm
}

fn drain(events: &mut broadcast::Receiver<LinkEvent>) -> Vec<String> {
    std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn test_fading_cellular_moves_to_satcom_through_every_stage() {
    let swarm = lone_uav().await;
    let node = swarm.node("uav-1");
    let mut events = node.controller.events().subscribe();
    node.cellular.set_link_quality(None);

    let mut phases = Vec::new();
    for _ in 0..20 {
        swarm.run_for(STEP, STEP).await;
        phases.push(node.controller.current_mode().phase);
    }

    let first = |phase| phases.iter().position(|p| *p == phase);
    let ready = first(TransitionPhase::Ready).expect("target authenticated before overlap");
    let overlap = first(TransitionPhase::Overlap).expect("overlap reached");
    assert!(ready < overlap);
    let overlapping = phases.iter().filter(|p| **p == TransitionPhase::Overlap).count();
    assert!(overlapping >= 9, "overlap held for the stabilization window, got {overlapping}");

    let state = node.controller.current_mode();
    assert_eq!(state.mode, Mode::Satcom);
    assert_eq!(state.phase, TransitionPhase::Steady);
    assert!(node.controller.sessions().is_established(ChannelKind::Satellite));
    assert!(!node.controller.sessions().is_established(ChannelKind::Cellular));
    assert!(!node.cellular.is_active());

    let types = drain(&mut events);
    let at = |t: &str| types.iter().position(|e| e == t).unwrap();
    assert!(at(event_types::TRANSITION_PENDING) < at(event_types::OVERLAP_STARTED));
    assert!(at(event_types::OVERLAP_STARTED) < at(event_types::TRANSITION_COMMITTED));
}

#[tokio::test]
async fn test_refused_authentication_never_commits() {
    let swarm = lone_uav().await;
    swarm.ground_station.set_refusing(true);
    let node = swarm.node("uav-1");
    let mut events = node.controller.events().subscribe();
    node.cellular.set_link_quality(None);

    swarm.run_for(Duration::from_secs(20), STEP).await;

    let types = drain(&mut events);
    assert!(types.iter().any(|t| t == event_types::TRANSITION_CANCELLED));
    assert!(!types.iter().any(|t| t == event_types::OVERLAP_STARTED));
    assert!(!types.iter().any(|t| t == event_types::TRANSITION_COMMITTED));
    assert_eq!(node.controller.current_mode().mode, Mode::Infrastructure);
    assert!(!node.satellite.is_active());
    assert!(!node.controller.sessions().is_established(ChannelKind::Satellite));
}

#[tokio::test]
async fn test_failed_overlap_rolls_back_and_cools_down_target() {
    let swarm = lone_uav().await;
    let node = swarm.node("uav-1");
    node.cellular.set_link_quality(None);

    for _ in 0..10 {
        swarm.run_for(STEP, STEP).await;
        if node.controller.current_mode().overlap_target().is_some() {
            break;
        }
    }
    assert_eq!(node.controller.current_mode().overlap_target(), Some(Mode::Satcom));

    let mut events = node.controller.events().subscribe();
    node.satellite.set_failing(true);
    let delivery = node
        .controller
        .send(OutboundMessage::new("ops", b"heartbeat".to_vec()).with_priority(Priority::Critical))
        .await
        .unwrap()
        .delivered()
        .await
        .unwrap();
    assert_eq!(delivery.channels, vec![ChannelKind::Cellular]);
    swarm.settle().await;

    let state = node.controller.current_mode();
    assert_eq!(state.mode, Mode::Infrastructure);
    assert_eq!(state.phase, TransitionPhase::Steady);
    assert!(!node.satellite.is_active());
    assert!(drain(&mut events).iter().any(|t| t == event_types::TRANSITION_ROLLED_BACK));

    // Satcom stays the only viable mode, yet it is not retried while cooling down.
    node.satellite.set_failing(false);
    swarm.run_for(Duration::from_secs(30), STEP).await;
    assert!(!drain(&mut events).iter().any(|t| t == event_types::TRANSITION_PENDING));
    assert_eq!(node.controller.current_mode().mode, Mode::Infrastructure);
}

#[tokio::test]
async fn test_dip_shorter_than_sustain_window_is_ignored() {
    let swarm = lone_uav().await;
    let node = swarm.node("uav-1");
    let mut events = node.controller.events().subscribe();

    node.cellular.set_link_quality(None);
    swarm.run_for(STEP, STEP).await;
    node.cellular.set_link_quality(Some((0.9, 0.01)));
    swarm.run_for(Duration::from_secs(20), STEP).await;

    assert!(!drain(&mut events).iter().any(|t| t == event_types::TRANSITION_PENDING));
    let state = node.controller.current_mode();
    assert_eq!(state.mode, Mode::Infrastructure);
    assert_eq!(state.phase, TransitionPhase::Steady);
}

#[tokio::test]
async fn test_quality_alternating_every_tick_never_starts_a_transition() {
    let swarm = lone_uav().await;
    let node = swarm.node("uav-1");
    let mut events = node.controller.events().subscribe();

    // Just under the usable floor on odd seconds, strong on even ones.
    for second in 1..=20 {
        let signal = if second % 2 == 1 { 0.29 } else { 0.9 };
        node.cellular.set_link_quality(Some((signal, 0.01)));
        swarm.run_for(STEP, STEP).await;
    }

    let types = drain(&mut events);
    assert!(!types.iter().any(|t| t == event_types::TRANSITION_PENDING));
    assert!(!types.iter().any(|t| t == event_types::TRANSITION_COMMITTED));
    let state = node.controller.current_mode();
    assert_eq!(state.mode, Mode::Infrastructure);
    assert_eq!(state.phase, TransitionPhase::Steady);
    assert!(!node.satellite.is_active());
}
