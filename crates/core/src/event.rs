//! Observable event schema for the link controller.
//!
//! Every compromise, threat, mode transition and delivery failure is published
//! as a [`LinkEvent`] on the [`EventBus`], where dashboards and audit
//! collaborators subscribe. Nothing detected by the controller is swallowed.

use crate::types::{current_timestamp_ms, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Severity level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Informational event
    Info,
    /// Warning condition
    Warning,
    /// Error condition
    Error,
    /// Critical security event
    Critical,
}

/// Category of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCategory {
    /// Threat detections
    Threat,
    /// Trust changes and relay verdicts
    Trust,
    /// Path computation and routing
    Routing,
    /// Mode state machine
    Mode,
    /// Message delivery
    Delivery,
    /// Configuration and lifecycle
    Operational,
}

/// Core event structure for all link-controller events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkEvent {
    /// Unique event identifier
    pub event_id: String,
    /// Timestamp (Unix epoch milliseconds)
    pub timestamp: Timestamp,
    /// Event severity
    pub severity: EventSeverity,
    /// Event category
    pub category: EventCategory,
    /// Event type (see [`event_types`])
    pub event_type: String,
    /// Node or channel the event is about, if any
    pub subject: Option<String>,
    /// Source component
    pub source: String,
    /// Human-readable message
    pub message: String,
    /// Structured metadata
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Builder for creating events.
pub struct EventBuilder {
    event: LinkEvent,
}

impl EventBuilder {
    /// Create a new event builder.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event: LinkEvent {
                event_id: next_event_id(),
                timestamp: current_timestamp_ms(),
                severity: EventSeverity::Info,
                category: EventCategory::Operational,
                event_type: event_type.into(),
                subject: None,
                source: source.into(),
                message: String::new(),
                metadata: serde_json::Map::new(),
            },
        }
    }

    /// Set the severity.
    pub fn severity(mut self, severity: EventSeverity) -> Self {
        self.event.severity = severity;
        self
    }

    /// Set the category.
    pub fn category(mut self, category: EventCategory) -> Self {
        self.event.category = category;
        self
    }

    /// Set the subject node or channel.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.event.subject = Some(subject.into());
        self
    }

    /// Override the timestamp (controller clock rather than wall clock).
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.event.timestamp = timestamp;
        self
    }

    /// Set the message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.event.message = message.into();
        self
    }

    /// Add metadata.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.event.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the event.
    pub fn build(self) -> LinkEvent {
        self.event
    }
}

/// Standard event types.
pub mod event_types {
    // Threat events
    pub const THREAT_DETECTED: &str = "threat.detected";

    // Trust events
    pub const RELAY_VERIFIED: &str = "trust.relay_verified";
    pub const RELAY_COMPROMISED: &str = "trust.relay_compromised";
    pub const RELAY_EXPIRED: &str = "trust.relay_expired";

    // Routing events
    pub const PATHS_RECOMPUTED: &str = "routing.paths_recomputed";
    pub const DIVERSITY_DEGRADED: &str = "routing.diversity_degraded";
    pub const NO_PATH_AVAILABLE: &str = "routing.no_path_available";

    // Mode events
    pub const TRANSITION_PENDING: &str = "mode.transition_pending";
    pub const TRANSITION_CANCELLED: &str = "mode.transition_cancelled";
    pub const TRANSITION_FORCED: &str = "mode.transition_forced";
    pub const OVERLAP_STARTED: &str = "mode.overlap_started";
    pub const TRANSITION_COMMITTED: &str = "mode.transition_committed";
    pub const TRANSITION_ROLLED_BACK: &str = "mode.transition_rolled_back";
    pub const EMERGENCY_ENTERED: &str = "mode.emergency_entered";

    // Delivery events
    pub const DELIVERY_FAILED: &str = "delivery.failed";
    pub const EMERGENCY_QUEUED: &str = "delivery.emergency_queued";

    // Operational events
    pub const CONTROLLER_STARTED: &str = "operational.controller_started";
    pub const CONTROLLER_STOPPED: &str = "operational.controller_stopped";
}

/// Fan-out channel for [`LinkEvent`]s.
///
/// Publishing never blocks; slow subscribers lag and lose the oldest events
/// rather than stalling the controller.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LinkEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event and mirror it to the log.
    pub fn publish(&self, event: LinkEvent) {
        match event.severity {
            EventSeverity::Critical | EventSeverity::Error => tracing::warn!(
                event_type = %event.event_type,
                subject = ?event.subject,
                "{}",
                event.message
            ),
            _ => tracing::debug!(
                event_type = %event.event_type,
                subject = ?event.subject,
                "{}",
                event.message
            ),
        }
        // No receivers is fine; events are also in the log.
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_event_id() -> String {
    let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:04x}", current_timestamp_ms(), seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = EventBuilder::new(event_types::RELAY_COMPROMISED, "path-manager")
            .severity(EventSeverity::Critical)
            .category(EventCategory::Trust)
            .subject("relay-7")
            .at(42)
            .message("Relay failed proof-of-relay")
            .metadata("trust", 0.0)
            .build();

        assert_eq!(event.event_type, event_types::RELAY_COMPROMISED);
        assert_eq!(event.source, "path-manager");
        assert_eq!(event.severity, EventSeverity::Critical);
        assert_eq!(event.subject.as_deref(), Some("relay-7"));
        assert_eq!(event.timestamp, 42);
        assert!(event.metadata.get("trust").is_some());
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = EventBuilder::new("a", "test").build();
        let b = EventBuilder::new("b", "test").build();
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_event_serialization() {
        let event = EventBuilder::new(event_types::TRANSITION_COMMITTED, "mode-controller")
            .category(EventCategory::Mode)
            .message("Committed TACTICAL")
            .build();

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: LinkEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type, event_types::TRANSITION_COMMITTED);
        assert_eq!(deserialized.category, EventCategory::Mode);
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(EventBuilder::new(event_types::CONTROLLER_STARTED, "test").build());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, event_types::CONTROLLER_STARTED);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(EventBuilder::new(event_types::CONTROLLER_STOPPED, "test").build());
    }
}
