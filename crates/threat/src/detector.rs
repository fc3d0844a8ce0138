//! Threat detector: runs every rule over incoming telemetry.

use crate::baseline::Baselines;
use crate::error::ThreatResult;
use crate::event::{FingerprintSample, Telemetry, ThreatEvent, ThreatKind};
use crate::log::ThreatLog;
use crate::rules::{default_rules, RuleContext, ThreatRule};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use swarmlink_core::{
    event_types, ChannelKind, ConfigHandle, EventBuilder, EventBus, EventCategory, EventSeverity,
    Severity,
};

/// Evaluates telemetry against the rule set.
///
/// Accepted events get a sequence number, are appended to the [`ThreatLog`]
/// and published on the event bus before being returned to the caller.
pub struct ThreatDetector {
    rules: Vec<Box<dyn ThreatRule>>,
    baselines: RwLock<Baselines>,
    log: Arc<ThreatLog>,
    config: ConfigHandle,
    events: EventBus,
    sequence: AtomicU64,
}

impl ThreatDetector {
    /// Detector with the four standard rules.
    pub fn new(config: ConfigHandle, events: EventBus) -> Self {
        Self::with_rules(default_rules(), config, events)
    }

    /// Detector with a custom rule set.
    pub fn with_rules(rules: Vec<Box<dyn ThreatRule>>, config: ConfigHandle, events: EventBus) -> Self {
        Self {
            rules,
            baselines: RwLock::new(Baselines::default()),
            log: Arc::new(ThreatLog::new()),
            config,
            events,
            sequence: AtomicU64::new(0),
        }
    }

    /// Shared threat log.
    pub fn log(&self) -> &Arc<ThreatLog> {
        &self.log
    }

    /// Seed a known-good fingerprint (e.g. from mission provisioning).
    pub fn learn_fingerprint(&self, channel: ChannelKind, subject: &str, features: Vec<f64>) {
        self.baselines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record_fingerprint(channel, subject, features);
    }

    /// Seed the last good session strength for a channel.
    pub fn learn_session(&self, channel: ChannelKind, strength_bits: u32) {
        self.baselines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record_session(channel, strength_bits);
    }

    /// Run all rules over one telemetry item.
    pub fn evaluate(&self, telemetry: &Telemetry) -> ThreatResult<Vec<ThreatEvent>> {
        telemetry.validate()?;
        let config = self.config.snapshot();

        let raised: Vec<ThreatEvent> = {
            let baselines = self.baselines.read().unwrap_or_else(PoisonError::into_inner);
            let ctx = RuleContext {
                telemetry,
                baselines: &baselines,
                config: &config,
            };
            self.rules.iter().filter_map(|rule| rule.evaluate(&ctx)).collect()
        };

        self.update_baselines(telemetry, &raised);

        Ok(raised
            .into_iter()
            .map(|mut event| {
                event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                self.publish(&event);
                self.log.append(event.clone());
                event
            })
            .collect())
    }

    // Only telemetry that raised nothing becomes the new reference.
    fn update_baselines(&self, telemetry: &Telemetry, raised: &[ThreatEvent]) {
        let clean = |kind: ThreatKind| !raised.iter().any(|e| e.kind == kind);
        let mut baselines = self.baselines.write().unwrap_or_else(PoisonError::into_inner);
        match telemetry {
            Telemetry::SessionNegotiated {
                channel,
                strength_bits,
                ..
            } if clean(ThreatKind::ProtocolDowngrade) => {
                baselines.record_session(*channel, *strength_bits);
            }
            Telemetry::Fingerprint {
                channel,
                subject,
                sample: FingerprintSample::Features(features),
                ..
            } if clean(ThreatKind::SpoofingSuspected) => {
                baselines.record_fingerprint(*channel, subject, features.clone());
            }
            _ => {}
        }
    }

    fn publish(&self, event: &ThreatEvent) {
        tracing::warn!(
            kind = %event.kind,
            severity = %event.severity,
            affected = %event.affected,
            rule = %event.rule,
            "Threat detected"
        );
        let severity = match event.severity {
            Severity::Low | Severity::Medium => EventSeverity::Warning,
            Severity::High => EventSeverity::Error,
            Severity::Critical => EventSeverity::Critical,
        };
        self.events.publish(
            EventBuilder::new(event_types::THREAT_DETECTED, "threat-detector")
                .severity(severity)
                .category(EventCategory::Threat)
                .subject(event.affected.to_string())
                .at(event.timestamp)
                .message(format!("{} on {}", event.kind, event.affected))
                .metadata("kind", event.kind.as_str())
                .metadata("sequence", event.sequence)
                .metadata("evidence", event.evidence.clone())
                .build(),
        );
    }
}
