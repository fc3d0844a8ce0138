//! Proof-of-relay over the mesh driver.
//!
//! Probe layers travel as [`LinkFrame::Probe`] frames addressed to the first
//! hop. Receipts come back as [`LinkFrame::Receipt`] frames flooded over the
//! mesh; the inbound path hands every receipt to a broadcast channel and each
//! launched probe picks out its own.

use crate::channel::ChannelDriver;
use crate::frame::LinkFrame;
use async_trait::async_trait;
use std::sync::Arc;
use swarmlink_crypto::{HopReceipt, ProbeFrame};
use swarmlink_mesh::{MeshError, MeshResult, ProbeTransport};
use tokio::sync::{broadcast, mpsc};

/// Receipts buffered per subscriber before the slowest one lags.
pub const RECEIPT_BUFFER: usize = 256;

/// [`ProbeTransport`] on top of a mesh [`ChannelDriver`].
pub struct MeshProbeTransport {
    driver: Arc<dyn ChannelDriver>,
    receipts: broadcast::Sender<HopReceipt>,
}

impl MeshProbeTransport {
    /// Transport sending on `driver` and listening on `receipts`.
    pub fn new(driver: Arc<dyn ChannelDriver>, receipts: broadcast::Sender<HopReceipt>) -> Self {
        Self { driver, receipts }
    }
}

#[async_trait]
impl ProbeTransport for MeshProbeTransport {
    async fn launch(
        &self,
        first_hop: &str,
        frame: ProbeFrame,
        receipts: mpsc::Sender<HopReceipt>,
    ) -> MeshResult<()> {
        let probe_id = frame.probe_id;
        // Subscribe before sending so an instant receipt is not missed.
        let mut incoming = self.receipts.subscribe();

        let bytes = LinkFrame::Probe {
            frame: frame.to_bytes(),
        }
        .to_bytes()
        .map_err(|e| MeshError::Transport(e.to_string()))?;
        self.driver
            .send_to(first_hop, &bytes)
            .await
            .map_err(|e| MeshError::Transport(format!("probe not sent to {first_hop}: {e}")))?;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = receipts.closed() => return,
                    received = incoming.recv() => match received {
                        Ok(receipt) if receipt.probe_id == probe_id => {
                            if receipts.send(receipt).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Probe listener lagged; receipts lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
        Ok(())
    }
}
