//! Channel Metrics Collector.
//!
//! Keeps a bounded sliding window of [`ChannelObservation`]s per channel and
//! answers read-only snapshots and advisory forecasts. History is never
//! rewritten: a sample older than the newest retained sample for its channel
//! is dropped and counted.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use swarmlink_core::{clamp_unit, ChannelKind, ChannelObservation, ConfigHandle};

/// Advisory forecast for one channel at a horizon.
///
/// Callers must treat this as a hint; predictors are allowed to be wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelForecast {
    /// Forecast channel
    pub channel: ChannelKind,
    /// Look-ahead in seconds from the newest sample
    pub horizon_s: u64,
    /// Predicted signal quality
    pub signal_quality: f64,
    /// Predicted error rate
    pub error_rate: f64,
    /// Predicted latency
    pub latency_ms: u64,
    /// Number of samples the forecast was built from
    pub sample_count: usize,
}

impl ChannelForecast {
    /// Whether the predicted link meets the usability floor/ceiling.
    pub fn is_usable(&self, signal_floor: f64, error_ceiling: f64) -> bool {
        self.signal_quality >= signal_floor && self.error_rate <= error_ceiling
    }
}

/// Pluggable connectivity predictor.
///
/// A learned or terrain-aware model can be installed in place of
/// [`LinearPredictor`]; the controller only needs this interface.
pub trait Predictor: Send + Sync {
    /// Forecast the channel `horizon_s` seconds past the newest sample in `window`.
    ///
    /// `window` is ordered oldest first. Returns `None` for an empty window.
    fn predict(&self, window: &[ChannelObservation], horizon_s: u64) -> Option<ChannelForecast>;
}

/// Least-squares linear extrapolation of signal quality and error rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearPredictor;

impl Predictor for LinearPredictor {
    fn predict(&self, window: &[ChannelObservation], horizon_s: u64) -> Option<ChannelForecast> {
        let last = window.last()?;
        let xs: Vec<f64> = window
            .iter()
            .map(|o| (o.timestamp as f64 - last.timestamp as f64) / 1_000.0)
            .collect();
        let horizon = horizon_s as f64;

        let signal: Vec<f64> = window.iter().map(|o| o.signal_quality).collect();
        let errors: Vec<f64> = window.iter().map(|o| o.error_rate).collect();

        Some(ChannelForecast {
            channel: last.channel,
            horizon_s,
            signal_quality: clamp_unit(extrapolate(&xs, &signal, horizon)),
            error_rate: clamp_unit(extrapolate(&xs, &errors, horizon)),
            latency_ms: last.measured_latency_ms,
            sample_count: window.len(),
        })
    }
}

/// Fit y = a + b·x and evaluate at `at`. Falls back to the last value
/// when the fit is degenerate.
fn extrapolate(xs: &[f64], ys: &[f64], at: f64) -> f64 {
    let n = xs.len() as f64;
    let last = ys.last().copied().unwrap_or(0.0);
    if xs.len() < 2 {
        return last;
    }
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let (mut cov, mut var) = (0.0, 0.0);
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mean_x) * (y - mean_y);
        var += (x - mean_x) * (x - mean_x);
    }
    if var <= f64::EPSILON {
        return last;
    }
    let slope = cov / var;
    let intercept = mean_y - slope * mean_x;
    intercept + slope * at
}

/// Per-channel observation windows.
pub struct MetricsCollector {
    windows: Mutex<HashMap<ChannelKind, VecDeque<ChannelObservation>>>,
    config: ConfigHandle,
    predictor: Arc<dyn Predictor>,
    rejected: AtomicU64,
}

impl MetricsCollector {
    /// Create a collector using [`LinearPredictor`].
    pub fn new(config: ConfigHandle) -> Self {
        Self::with_predictor(config, Arc::new(LinearPredictor))
    }

    /// Create a collector with a custom predictor.
    pub fn with_predictor(config: ConfigHandle, predictor: Arc<dyn Predictor>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            config,
            predictor,
            rejected: AtomicU64::new(0),
        }
    }

    /// Record one observation. Returns `false` (and logs) for out-of-order samples.
    pub fn record(&self, observation: ChannelObservation) -> bool {
        let window_ms = self.config.snapshot().observation_window_ms();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry(observation.channel).or_default();

        if let Some(newest) = window.back() {
            if observation.timestamp < newest.timestamp {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    channel = %observation.channel,
                    sample_ts = observation.timestamp,
                    newest_ts = newest.timestamp,
                    "Rejected out-of-order observation"
                );
                return false;
            }
        }

        let cutoff = observation.timestamp.saturating_sub(window_ms);
        window.push_back(observation);
        while window.front().is_some_and(|o| o.timestamp < cutoff) {
            window.pop_front();
        }
        true
    }

    /// Copy of the retained window for `channel`, oldest first.
    pub fn snapshot(&self, channel: ChannelKind) -> Vec<ChannelObservation> {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Newest retained observation for `channel`.
    pub fn latest(&self, channel: ChannelKind) -> Option<ChannelObservation> {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .and_then(|w| w.back().cloned())
    }

    /// Advisory forecast for `channel` at `horizon_s`.
    pub fn predict(&self, channel: ChannelKind, horizon_s: u64) -> Option<ChannelForecast> {
        let window = self.snapshot(channel);
        self.predictor.predict(&window, horizon_s)
    }

    /// Number of samples rejected as out of order.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
