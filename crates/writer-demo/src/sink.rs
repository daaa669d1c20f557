//! Simulated network sink

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use instance_writer::{InstanceSink, SinkError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Datapoint;

/// Encodes each batch as JSON, waits a fixed latency, and fails every
/// `fail_every`-th batch.
///
/// The cancellation token is ignored so that the writer's final flush during
/// shutdown still goes through.
pub struct SimulatedSink {
    latency: Duration,
    fail_every: u64,
    batches: AtomicU64,
    bytes: AtomicU64,
}

impl SimulatedSink {
    pub fn new(latency: Duration, fail_every: u64) -> Self {
        Self {
            latency,
            fail_every,
            batches: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Batches seen so far
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Encoded bytes seen so far
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl InstanceSink<Datapoint> for SimulatedSink {
    async fn send(&self, _cancel: CancellationToken, batch: &[Datapoint]) -> Result<(), SinkError> {
        let seq = self.batches.fetch_add(1, Ordering::Relaxed) + 1;

        let payload = serde_json::to_vec(batch).map_err(|e| SinkError::Rejected(e.to_string()))?;
        self.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        debug!("Sending batch {} ({} datapoints, {} bytes)", seq, batch.len(), payload.len());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.fail_every > 0 && seq % self.fail_every == 0 {
            return Err(SinkError::Transport(format!("simulated failure on batch {seq}")));
        }
        Ok(())
    }
}
