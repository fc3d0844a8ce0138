//! Append-only threat log.

use crate::error::ThreatResult;
use crate::event::{ThreatEvent, ThreatKind};
use std::sync::{Arc, PoisonError, RwLock};

/// Every threat the detector accepted, in generation order.
///
/// Entries are shared immutably; nothing can be edited or removed.
#[derive(Debug, Default)]
pub struct ThreatLog {
    entries: RwLock<Vec<Arc<ThreatEvent>>>,
}

impl ThreatLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn append(&self, event: ThreatEvent) -> Arc<ThreatEvent> {
        let event = Arc::new(event);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&event));
        event
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries with a sequence number greater than `sequence`.
    pub fn since(&self, sequence: u64) -> Vec<Arc<ThreatEvent>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.sequence > sequence)
            .cloned()
            .collect()
    }

    /// Entries of one kind.
    pub fn by_kind(&self, kind: ThreatKind) -> Vec<Arc<ThreatEvent>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Export the whole log as JSON lines for audit.
    pub fn export_jsonl(&self) -> ThreatResult<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for entry in entries.iter() {
            out.push_str(&serde_json::to_string(entry.as_ref())?);
            out.push('\n');
        }
        Ok(out)
    }
}
