//! Writer Error Types

use ring_buffer::RingBufferError;
use thiserror::Error;

/// Errors surfaced to the owner of an [`InstanceWriter`](crate::InstanceWriter)
#[derive(Debug, Error)]
pub enum WriterError {
    /// Ring buffer could not be created
    #[error("Ring buffer error: {0}")]
    Buffer(#[from] RingBufferError),

    /// Configuration sources could not be read or deserialized
    #[error("Configuration load failed: {0}")]
    Config(#[from] ::config::ConfigError),

    /// `start` was called on a writer that is already running or stopped
    #[error("Writer already started")]
    AlreadyStarted,

    /// `wait_for_shutdown` was called before `start`
    #[error("Writer is not running; call start before waiting for shutdown")]
    NotStarted,

    /// The coordinating task panicked or was aborted
    #[error("Writer coordinator failed: {0}")]
    Coordinator(String),
}

/// Errors reported by a sink for a single batch.
///
/// The writer only counts these; they never reach the producer.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// Network or transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote end refused the batch
    #[error("Batch rejected: {0}")]
    Rejected(String),

    /// The sink gave up because cancellation fired
    #[error("Send cancelled")]
    Cancelled,
}
