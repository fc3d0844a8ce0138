//! Background tasks driving a [`LinkController`].
//!
//! Each concern runs on its own interval so a slow probe sweep never delays
//! the control tick. Periods are read from the configuration when the
//! runtime is spawned.

use crate::facade::{InboundMessage, LinkController};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Inbound poll period.
const RECEIVE_INTERVAL: Duration = Duration::from_millis(50);

/// Paths are refreshed once every this many control ticks.
const PATH_REFRESH_TICKS: u64 = 5;

/// Handle to the running background tasks.
pub struct LinkRuntime {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl LinkRuntime {
    /// Spawn every background task. Messages for this node are delivered on
    /// the returned receiver.
    pub fn spawn(controller: Arc<LinkController>, inbox_capacity: usize) -> (Self, mpsc::Receiver<InboundMessage>) {
        let config = controller.config().snapshot();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (inbox, inbox_rx) = mpsc::channel(inbox_capacity.max(1));
        let tick = Duration::from_millis(config.tick_interval_ms.max(1));

        let mut handles = vec![
            periodic("metrics", tick, &controller, &shutdown_rx, |c| async move {
                c.collect_metrics().await;
            }),
            periodic("control", tick, &controller, &shutdown_rx, |c| async move {
                c.tick().await;
            }),
            periodic(
                "paths",
                tick * PATH_REFRESH_TICKS as u32,
                &controller,
                &shutdown_rx,
                |c| async move {
                    c.refresh_paths().await;
                },
            ),
            periodic(
                "probes",
                Duration::from_secs(config.probe_interval_s.max(1)),
                &controller,
                &shutdown_rx,
                |c| async move {
                    c.probe_relays().await;
                },
            ),
            periodic(
                "emergency-retry",
                Duration::from_millis(config.emergency_retry_interval_ms.max(1)),
                &controller,
                &shutdown_rx,
                |c| async move {
                    c.retry_emergency().await;
                },
            ),
            periodic(
                "beacon",
                Duration::from_millis(config.beacon_dwell_ms.max(1)),
                &controller,
                &shutdown_rx,
                |c| async move {
                    c.beacon_tick().await;
                },
            ),
        ];
        handles.push(periodic(
            "inbound",
            RECEIVE_INTERVAL,
            &controller,
            &shutdown_rx,
            move |c| {
                let inbox = inbox.clone();
                async move {
                    for message in c.receive().await {
                        if inbox.send(message).await.is_err() {
                            tracing::debug!("Inbox closed; inbound message dropped");
                        }
                    }
                }
            },
        ));

        tracing::info!(node_id = %controller.node_id(), tasks = handles.len(), "Link runtime spawned");
        (Self { shutdown, handles }, inbox_rx)
    }

    /// Stop every task and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Link runtime task ended abnormally");
            }
        }
        tracing::info!("Link runtime stopped");
    }
}

fn periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    controller: &Arc<LinkController>,
    shutdown: &watch::Receiver<bool>,
    step: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<LinkController>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let controller = Arc::clone(controller);
    let mut shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "Link task started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => step(Arc::clone(&controller)).await,
            }
        }
        tracing::debug!(task = name, "Link task stopped");
    })
}
