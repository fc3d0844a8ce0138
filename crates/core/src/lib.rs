//! Core functionality for the SwarmLink adaptive link controller.
//!
//! This crate provides the fundamental types, configuration, logging and
//! event schema shared by every SwarmLink crate.

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod types;

pub use config::{ConfigHandle, LinkConfig};
pub use error::{CoreError, Result};
pub use event::{event_types, EventBuilder, EventBus, EventCategory, EventSeverity, LinkEvent};
pub use types::{
    clamp_unit, current_timestamp_ms, ChannelKind, ChannelObservation, Clock, ManualClock, Mode,
    NodeId, Priority, Severity, SystemClock, Timestamp,
};
