//! SwarmLink Mesh - relay routing and link telemetry for the drone swarm
//!
//! Everything the link controller knows about the swarm as a network lives here.
//!
//! # Core Components
//!
//! - **Metrics Collector**: Per-channel observation windows with short-horizon forecasts
//! - **Relay Registry**: Trust-scored relay nodes with soft quarantine
//! - **Path Manager**: Top-N node-disjoint relay paths toward every egress
//! - **Proof-of-Relay**: Signed hop receipts that expose dropping or tampering relays
//! - **Link Store**: SQLite persistence for trust history and cooldowns
//! - **Spectral Agility**: Seeded frequency hopping for the emergency beacon
//!
//! # Design Principles
//!
//! 1. **Trust is earned per hop**: a relay is only as good as its last proof
//! 2. **Fail-Visible**: degraded diversity and missing paths are published, never hidden
//! 3. **Survivability**: losing a relay costs a recomputation, not a message
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use swarmlink_core::{ConfigHandle, EventBus};
//! use swarmlink_mesh::{LinkMetrics, PathManager, RelayRegistry};
//!
//! let registry = Arc::new(RelayRegistry::new());
//! let paths = PathManager::new("drone-1", registry, ConfigHandle::default(), EventBus::default());
//! paths.observe_link("drone-1", "drone-2", LinkMetrics::new(0.95, 30, 800, 0));
//!
//! let summary = paths.recompute(0);
//! println!("unreachable targets: {:?}", summary.unreachable);
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod metrics;
pub mod paths;
pub mod proof;
pub mod registry;
pub mod spectral;
pub mod store;
pub mod topology;

// Re-export main types
pub use error::{MeshError, MeshResult};
pub use metrics::{ChannelForecast, LinearPredictor, MetricsCollector, Predictor};
pub use paths::{
    DiversityLevel, PathManager, PathSelection, PathTable, RecomputeSummary, RelayPath,
};
pub use proof::{
    assign_blame, probe_deadline, LoopbackRelayNetwork, ProbeReport, ProbeTransport,
    ProbeVerdict, ProofOfRelay, RelayBehavior,
};
pub use registry::{
    severity_penalty, CapabilityFlags, ProofOutcome, RelayNode, RelayRegistry, TrustChange,
    INITIAL_TRUST,
};
pub use spectral::{
    generate_hopping_pattern, FrequencyHopper, FrequencyId, HopReason, HopResult, HoppingPattern,
};
pub use store::{LinkStore, TrustRecord};
pub use topology::{EdgeKey, LinkMetrics, Topology};
