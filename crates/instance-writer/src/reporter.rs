//! Periodic metrics reporter
//!
//! Publishes a writer's metrics to the `metrics` facade at a fixed interval
//! and logs the per-interval deltas.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{MetricsSnapshot, WriterMetrics};

/// Reports writer metrics until cancelled
pub struct MetricsReporter {
    metrics: Arc<WriterMetrics>,
    prefix: String,
    interval: Duration,
    previous: Option<MetricsSnapshot>,
}

impl MetricsReporter {
    /// Create a reporter publishing under `prefix` every `interval`
    pub fn new(metrics: Arc<WriterMetrics>, prefix: impl Into<String>, interval: Duration) -> Self {
        Self {
            metrics,
            prefix: prefix.into(),
            interval,
            previous: None,
        }
    }

    /// Run until cancellation. Spawn this as a tokio task.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            prefix = %self.prefix,
            "Metrics reporter started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.report();
                }
            }
        }

        // Final values so nothing recorded during shutdown is lost
        self.report();
        info!("Metrics reporter stopped");
    }

    /// Publish once and return the delta since the previous report
    pub fn report(&mut self) -> MetricsSnapshot {
        self.metrics.publish(&self.prefix);

        let current = self.metrics.snapshot();
        let delta = match &self.previous {
            Some(previous) => current.diff(previous),
            None => current,
        };

        debug!(
            received = delta.received,
            sent = delta.sent,
            failed = delta.failed_to_send,
            filtered = delta.filtered_out,
            overwritten = delta.overwritten,
            buffered = delta.buffered,
            in_flight = delta.in_flight,
            waiting = delta.waiting,
            "Writer metrics"
        );

        self.previous = Some(current);
        delta
    }
}
