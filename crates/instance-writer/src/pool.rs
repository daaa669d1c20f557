//! Reusable batch vectors
//!
//! Holds one vector per allowed concurrent request. Batches are moved out of
//! the ring buffer into a pooled vector so a send task never reads buffer
//! slots that wraparound could overwrite, and so the steady state allocates
//! nothing per batch.

use tokio::sync::mpsc;
use tracing::warn;

/// Bounded pool of batch vectors, owned by the coordinator
pub(crate) struct ChunkPool<T> {
    /// Idle vectors
    idle: mpsc::Receiver<Vec<T>>,
    /// Return path, cloned into each send task
    returns: mpsc::Sender<Vec<T>>,
    /// Capacity given to each vector
    chunk_capacity: usize,
}

impl<T> ChunkPool<T> {
    /// Create a pool primed with `slots` vectors of `chunk_capacity` each
    pub(crate) fn new(slots: usize, chunk_capacity: usize) -> Self {
        let (returns, idle) = mpsc::channel(slots.max(1));
        for _ in 0..slots {
            // Cannot fail: the channel has exactly `slots` free permits
            let _ = returns.try_send(Vec::with_capacity(chunk_capacity));
        }

        Self {
            idle,
            returns,
            chunk_capacity,
        }
    }

    /// Take an empty vector from the pool.
    ///
    /// With fewer than `slots` requests active a pooled vector is always
    /// available; a fresh one is allocated only if that invariant is broken.
    pub(crate) fn acquire(&mut self) -> Vec<T> {
        match self.idle.try_recv() {
            Ok(chunk) => chunk,
            Err(_) => {
                warn!("Chunk pool exhausted, allocating a new batch vector");
                Vec::with_capacity(self.chunk_capacity)
            }
        }
    }

    /// Handle a send task uses to give its vector back
    pub(crate) fn returner(&self) -> ChunkReturn<T> {
        ChunkReturn {
            returns: self.returns.clone(),
        }
    }
}

/// Return handle for one pooled vector
pub(crate) struct ChunkReturn<T> {
    returns: mpsc::Sender<Vec<T>>,
}

impl<T> ChunkReturn<T> {
    /// Drop the batch contents and put the vector back.
    ///
    /// Never blocks: the pool has room for every vector it handed out.
    pub(crate) fn release(&self, mut chunk: Vec<T>) {
        chunk.clear();
        let _ = self.returns.try_send(chunk);
    }
}
