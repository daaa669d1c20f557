//! Overwriting Ring Buffer
//!
//! Fixed-capacity circular storage for telemetry records. When the buffer is
//! full the oldest unprocessed record is overwritten, so newer data always
//! wins over stale data.

mod buffer;

pub use buffer::{RingBuffer, DEFAULT_CAPACITY};

use thiserror::Error;

/// Ring buffer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingBufferError {
    /// Capacity must be at least one slot
    #[error("Invalid ring buffer capacity: {0}")]
    InvalidCapacity(usize),
}
