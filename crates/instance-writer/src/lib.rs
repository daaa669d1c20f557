//! Instance Writer
//!
//! Decouples a bursty producer of telemetry records from a slower, fallible
//! sink. Records are buffered in a fixed-size ring buffer that overwrites the
//! oldest entries under overload, then drained in size-limited batches with a
//! bounded number of concurrent sends.
//!
//! - Bounded memory: buffer capacity and pooled batch vectors are fixed at start
//! - Recency over completeness: overflow drops the oldest records
//! - Failure isolation: failed batches are counted, never retried
//! - Cooperative shutdown: cancellation flushes everything already buffered

mod config;
mod error;
mod metrics;
mod pool;
mod reporter;
mod sink;
mod writer;

pub use self::config::{
    WriterConfig, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_BUFFERED, DEFAULT_MAX_REQUESTS, ENV_PREFIX,
};
pub use error::{SinkError, WriterError};
pub use self::metrics::{InternalMetric, MetricKind, MetricsSnapshot, WriterMetrics};
pub use reporter::MetricsReporter;
pub use sink::{InstancePreprocessor, InstanceSink, OverwriteCallback};
pub use writer::InstanceWriter;

pub use tokio_util::sync::CancellationToken;
