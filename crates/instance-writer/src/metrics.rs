//! Writer metrics
//!
//! Atomic counters shared between the coordinator, the send tasks and any
//! external reporter. All operations use relaxed ordering; readers see
//! eventually consistent values.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters and gauges for one writer.
///
/// Cumulative counters are bumped from the coordinator and from send tasks.
/// Gauges are owned by the coordinator, which mirrors its local bookkeeping
/// into them so external reads never race with the loop.
#[derive(Debug, Default)]
pub struct WriterMetrics {
    /// Records received on the input channel
    received: AtomicU64,
    /// Records dropped by the preprocessor
    filtered_out: AtomicU64,
    /// Records the sink accepted
    sent: AtomicU64,
    /// Records in batches the sink failed
    failed_to_send: AtomicU64,
    /// Unprocessed records lost to ring buffer overwrite
    overwritten: AtomicU64,

    /// Records handed to send tasks that have not completed
    in_flight: AtomicU64,
    /// Records held back because every request slot was busy
    waiting: AtomicU64,
    /// Send tasks currently running
    requests_active: AtomicU64,
    /// Unprocessed records in the ring buffer
    buffered: AtomicU64,
    /// Ring buffer capacity
    max_buffered: AtomicU64,
}

impl WriterMetrics {
    /// Create new metrics with all counters at zero
    pub const fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            filtered_out: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            failed_to_send: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            waiting: AtomicU64::new(0),
            requests_active: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            max_buffered: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn record_received(&self, count: u64) {
        self.received.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_filtered(&self) {
        self.filtered_out.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_overwritten(&self) {
        self.overwritten.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_dispatched(&self, count: u64) {
        self.in_flight.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_sent(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_failed(&self, count: u64) {
        self.failed_to_send.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_completed(&self, count: u64) {
        self.in_flight.fetch_sub(count, Ordering::Relaxed);
    }

    /// Mirror the coordinator's local bookkeeping
    #[inline]
    pub(crate) fn set_gauges(&self, buffered: usize, waiting: usize, requests_active: usize) {
        self.buffered.store(buffered as u64, Ordering::Relaxed);
        self.waiting.store(waiting as u64, Ordering::Relaxed);
        self.requests_active
            .store(requests_active as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_max_buffered(&self, capacity: usize) {
        self.max_buffered.store(capacity as u64, Ordering::Relaxed);
    }

    /// Get a point-in-time copy of every counter and gauge
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            filtered_out: self.filtered_out.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed_to_send: self.failed_to_send.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            requests_active: self.requests_active.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            max_buffered: self.max_buffered.load(Ordering::Relaxed),
        }
    }

    /// Named counter/gauge pairs for an external reporting path
    pub fn internal_metrics(&self, prefix: &str) -> Vec<InternalMetric> {
        self.snapshot().internal_metrics(prefix)
    }

    /// Push the current values to the global `metrics` recorder
    pub fn publish(&self, prefix: &str) {
        for metric in self.internal_metrics(prefix) {
            match metric.kind {
                MetricKind::Cumulative => {
                    ::metrics::counter!(metric.name).absolute(metric.value);
                }
                MetricKind::Gauge => {
                    ::metrics::gauge!(metric.name).set(metric.value as f64);
                }
            }
        }
    }

    // Direct accessors for individual metrics

    /// Get records received count
    #[inline]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Get records sent count
    #[inline]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Get records failed count
    #[inline]
    pub fn failed_to_send(&self) -> u64 {
        self.failed_to_send.load(Ordering::Relaxed)
    }

    /// Get records in flight
    #[inline]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Whether a value only ever grows or is a point-in-time reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Cumulative,
    Gauge,
}

/// One named value produced by [`WriterMetrics::internal_metrics`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalMetric {
    pub name: String,
    pub kind: MetricKind,
    pub value: u64,
}

/// Point-in-time snapshot of writer metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Records received
    pub received: u64,
    /// Records filtered out
    pub filtered_out: u64,
    /// Records sent
    pub sent: u64,
    /// Records failed to send
    pub failed_to_send: u64,
    /// Records overwritten before sending
    pub overwritten: u64,
    /// Records in flight
    pub in_flight: u64,
    /// Records waiting on a free request slot
    pub waiting: u64,
    /// Active send tasks
    pub requests_active: u64,
    /// Unprocessed records buffered
    pub buffered: u64,
    /// Buffer capacity
    pub max_buffered: u64,
}

impl MetricsSnapshot {
    /// Difference in cumulative counters since `previous`.
    ///
    /// Gauges keep the current value.
    pub fn diff(&self, previous: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.saturating_sub(previous.received),
            filtered_out: self.filtered_out.saturating_sub(previous.filtered_out),
            sent: self.sent.saturating_sub(previous.sent),
            failed_to_send: self.failed_to_send.saturating_sub(previous.failed_to_send),
            overwritten: self.overwritten.saturating_sub(previous.overwritten),
            ..*self
        }
    }

    /// Named counter/gauge pairs
    pub fn internal_metrics(&self, prefix: &str) -> Vec<InternalMetric> {
        let metric = |name: &str, kind, value| InternalMetric {
            name: format!("{prefix}{name}"),
            kind,
            value,
        };

        vec![
            metric("instances_sent", MetricKind::Cumulative, self.sent),
            metric("instances_failed", MetricKind::Cumulative, self.failed_to_send),
            metric("instances_filtered", MetricKind::Cumulative, self.filtered_out),
            metric("instances_received", MetricKind::Cumulative, self.received),
            metric("instances_overwritten", MetricKind::Cumulative, self.overwritten),
            metric("instances_buffered", MetricKind::Gauge, self.buffered),
            metric("instances_max_buffered", MetricKind::Gauge, self.max_buffered),
            metric("instances_in_flight", MetricKind::Gauge, self.in_flight),
            metric("instances_waiting", MetricKind::Gauge, self.waiting),
            metric("instance_requests_active", MetricKind::Gauge, self.requests_active),
        ]
    }
}
