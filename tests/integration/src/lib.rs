//! Integration tests for the adaptive link controller
//!
//! This suite runs several controllers over shared loopback media and
//! validates:
//! - Onion-routed relay traffic stays opaque to relays
//! - Node-disjoint path selection and proof-of-relay blame
//! - Threat-forced mode switches and session purging
//! - Blackout and low-battery EMERGENCY entry, beacon delivery
//! - Predictive transitions that never commit unauthenticated modes

pub mod test_utils;

#[cfg(test)]
mod relay_tests;

#[cfg(test)]
mod threat_response_tests;

#[cfg(test)]
mod emergency_tests;

#[cfg(test)]
mod transition_tests;
