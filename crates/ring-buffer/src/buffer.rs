//! Ring Buffer Implementation

use crate::RingBufferError;

/// Default buffer capacity
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Fixed-capacity circular buffer with overwrite-oldest semantics.
///
/// Items are appended with [`RingBuffer::add`] and pulled out in insertion
/// order with [`RingBuffer::next_batch`]. The buffer never grows and never
/// blocks: inserting into a full buffer drops the oldest unprocessed item.
///
/// Not synchronized. The owner is expected to be a single task.
pub struct RingBuffer<T> {
    /// Pre-allocated storage
    storage: Box<[Option<T>]>,
    /// Index of the slot the next `add` writes to
    next_idx: usize,
    /// Items added but not yet returned by `next_batch`
    unprocessed: usize,
    /// Total items added (for statistics)
    total_added: u64,
    /// Total unprocessed items lost to overwrite (for statistics)
    total_overwritten: u64,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with given capacity
    pub fn new(capacity: usize) -> Result<Self, RingBufferError> {
        if capacity == 0 {
            return Err(RingBufferError::InvalidCapacity(capacity));
        }

        Ok(Self::allocate(capacity))
    }

    /// Create a buffer with default capacity (10000 items)
    pub fn with_default_capacity() -> Self {
        Self::allocate(DEFAULT_CAPACITY)
    }

    fn allocate(capacity: usize) -> Self {
        let storage: Vec<Option<T>> = (0..capacity).map(|_| None).collect();
        Self {
            storage: storage.into_boxed_slice(),
            next_idx: 0,
            unprocessed: 0,
            total_added: 0,
            total_overwritten: 0,
        }
    }

    /// Insert an item, returning `true` if an unprocessed item was overwritten
    pub fn add(&mut self, item: T) -> bool {
        let capacity = self.storage.len();
        // When full, the write position is also the oldest unprocessed slot.
        let overwrote = self.unprocessed == capacity;

        self.storage[self.next_idx] = Some(item);
        self.next_idx = (self.next_idx + 1) % capacity;
        self.total_added += 1;

        if overwrote {
            self.total_overwritten += 1;
        } else {
            self.unprocessed += 1;
        }
        overwrote
    }

    /// Take up to `max` of the oldest unprocessed items and mark them processed.
    ///
    /// The returned slice is a view into the buffer's own storage, in insertion
    /// order. Move the items out (e.g. with [`Option::take`]) before the next
    /// `add`, which may reuse those slots. If the unprocessed region wraps
    /// around the end of storage, the view stops at the end and the next call
    /// picks up the remainder from the start.
    pub fn next_batch(&mut self, max: usize) -> &mut [Option<T>] {
        if self.unprocessed == 0 || max == 0 {
            return &mut self.storage[..0];
        }

        let capacity = self.storage.len();
        let start = (self.next_idx + capacity - self.unprocessed) % capacity;
        let len = max.min(self.unprocessed).min(capacity - start);

        self.unprocessed -= len;
        &mut self.storage[start..start + len]
    }

    /// Number of items inserted but not yet returned by `next_batch`
    pub fn unprocessed_count(&self) -> usize {
        self.unprocessed
    }

    /// Fixed capacity of the buffer
    pub fn size(&self) -> usize {
        self.storage.len()
    }

    /// Check if there is nothing left to process
    pub fn is_empty(&self) -> bool {
        self.unprocessed == 0
    }

    /// Check if the next `add` will overwrite
    pub fn is_full(&self) -> bool {
        self.unprocessed == self.storage.len()
    }

    /// Get total items added (for statistics)
    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    /// Get total items overwritten before being processed
    pub fn total_overwritten(&self) -> u64 {
        self.total_overwritten
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.storage.len())
            .field("unprocessed", &self.unprocessed)
            .field("next_idx", &self.next_idx)
            .finish()
    }
}
