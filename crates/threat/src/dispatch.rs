//! Severity-aware delivery of threats to the mode controller.
//!
//! Severities with a zero response latency pass straight through. Others are
//! held in a batch that is released once the tightest deadline of any held
//! event is reached. Released events are ordered by severity first, then by
//! generation order, so the most severe always comes first.

use crate::event::ThreatEvent;
use std::cmp::Reverse;
use swarmlink_core::{ConfigHandle, Timestamp};

/// Batches low-severity threats.
#[derive(Debug)]
pub struct ThreatDispatcher {
    config: ConfigHandle,
    pending: Vec<ThreatEvent>,
    flush_at: Option<Timestamp>,
}

impl ThreatDispatcher {
    /// Create a dispatcher.
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            pending: Vec::new(),
            flush_at: None,
        }
    }

    /// Accept an event. Returns whatever must be delivered now.
    pub fn submit(&mut self, event: ThreatEvent, now: Timestamp) -> Vec<ThreatEvent> {
        let latency = self.config.snapshot().response_latency(event.severity);
        if latency.is_zero() {
            return vec![event];
        }
        let deadline = now.saturating_add(latency.as_millis() as u64);
        self.flush_at = Some(self.flush_at.map_or(deadline, |at| at.min(deadline)));
        self.pending.push(event);
        Vec::new()
    }

    /// Release the batch if its deadline has been reached.
    pub fn poll(&mut self, now: Timestamp) -> Vec<ThreatEvent> {
        match self.flush_at {
            Some(at) if now >= at => self.flush(),
            _ => Vec::new(),
        }
    }

    /// Release the batch regardless of its deadline.
    pub fn flush(&mut self) -> Vec<ThreatEvent> {
        self.flush_at = None;
        let mut batch = std::mem::take(&mut self.pending);
        batch.sort_by_key(|e| (Reverse(e.severity), e.sequence));
        batch
    }

    /// When the held batch is due, if anything is held.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.flush_at
    }

    /// Number of held events.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Order a set of simultaneously available threats by precedence.
pub fn by_precedence(mut events: Vec<ThreatEvent>) -> Vec<ThreatEvent> {
    events.sort_by_key(|e| (Reverse(e.severity), e.sequence));
    events
}
