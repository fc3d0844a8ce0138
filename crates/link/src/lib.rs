//! SwarmLink adaptive link controller.
//!
//! Selects and switches among the swarm's communication modes based on
//! forecast link quality, detected threats and flight context, while keeping
//! relayed traffic confidential through onion routing over trusted relays.
//!
//! The entry point is [`LinkController`]; [`LinkRuntime`] drives it from
//! background tasks.

#![warn(missing_docs)]

pub mod auth;
pub mod beacon;
pub mod channel;
pub mod context;
pub mod error;
pub mod facade;
pub mod forecast;
pub mod frame;
pub mod loopback;
pub mod mode;
pub mod probe;
pub mod queue;
pub mod runtime;

pub use auth::Authenticator;
pub use beacon::Beacon;
pub use channel::{ChannelDriver, DriverSet};
pub use context::{CoverageModel, FlightContext, FlightSnapshot, SharedFlightContext};
pub use error::{LinkError, LinkResult};
pub use facade::{InboundMessage, LinkController, LinkControllerBuilder, OutboundMessage};
pub use forecast::{Forecaster, LinkOutlook, ModeOutlook, Recommendation};
pub use frame::{BeaconFrame, Envelope, LinkFrame};
pub use loopback::{LoopbackDriver, LoopbackGateway, LoopbackMedium};
pub use mode::{ModeCommand, ModeController, ModeState, TransitionPhase};
pub use probe::MeshProbeTransport;
pub use queue::{AckHandle, Delivery, EmergencyQueue, QueuedMessage};
pub use runtime::LinkRuntime;
