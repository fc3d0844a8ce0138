//! Structured logging infrastructure for SwarmLink.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use swarmlink_core::logging;
///
/// logging::init();
/// tracing::info!("Link controller started");
/// ```
pub fn init() {
    let filter = default_filter();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize the logging system with JSON output for flight recorders.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
///
/// # Example
/// ```no_run
/// use swarmlink_core::logging;
///
/// logging::init_json();
/// tracing::info!(mode = "TACTICAL", "Mode committed");
/// ```
pub fn init_json() {
    let filter = default_filter();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

/// Install a subscriber for tests; safe to call repeatedly.
pub fn try_init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt::layer().with_test_writer())
        .try_init();
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_test_init_doesnt_panic() {
        try_init_for_tests();
        try_init_for_tests();
        tracing::debug!("logging initialised twice");
    }
}
