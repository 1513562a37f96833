//! [`PriorityChannel`] – bounded, priority-ordered stage hand-off.
//!
//! Items leave the channel ordered by `(priority ascending, timestamp
//! ascending)`; equal keys keep their enqueue order. The channel supports any
//! number of producers and is meant for a single consumer.
//!
//! Backpressure is fail-fast: [`PriorityChannel::try_enqueue`] never waits for
//! space. On a full channel it returns [`GatewayError::ChannelFull`], counts a
//! drop, and leaves the decision (log, emit a drop event, discard) to the
//! caller. A real-time producer must never stall on its consumer.
//!
//! # Example
//!
//! ```
//! use aegis_middleware::channel::PriorityChannel;
//! use aegis_types::Sample;
//!
//! let ch = PriorityChannel::new(2);
//! ch.try_enqueue(Sample::new(10, 2, 100)).unwrap();
//! ch.try_enqueue(Sample::new(20, 0, 200)).unwrap();
//! assert!(ch.try_enqueue(Sample::new(30, 0, 300)).is_err());
//!
//! assert_eq!(ch.try_dequeue().map(|s| s.priority), Some(0));
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use aegis_types::{GatewayError, Sample};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Anything that can be ordered by the channel.
pub trait Prioritized {
    /// Lower values are dequeued first.
    fn priority(&self) -> u8;
    /// Tie-breaker within one priority: earlier timestamps first.
    fn timestamp_us(&self) -> u64;
}

impl Prioritized for Sample {
    fn priority(&self) -> u8 {
        self.priority
    }

    fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Heap entry
// ────────────────────────────────────────────────────────────────────────────

struct Entry<T> {
    key: (u8, u64, u64),
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // BinaryHeap is a max-heap; invert so the smallest key pops first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key.cmp(&self.key)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PriorityChannel
// ────────────────────────────────────────────────────────────────────────────

/// Bounded priority queue with a non-blocking enqueue and a time-bounded
/// dequeue.
pub struct PriorityChannel<T> {
    capacity: usize,
    heap: Mutex<BinaryHeap<Entry<T>>>,
    available: Notify,
    seq: AtomicU64,
    drops: AtomicU64,
}

impl<T: Prioritized> PriorityChannel<T> {
    /// Create a channel that holds at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: Mutex::new(BinaryHeap::with_capacity(capacity)),
            available: Notify::new(),
            seq: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    /// Insert `item` without waiting.
    ///
    /// # Errors
    ///
    /// [`GatewayError::ChannelFull`] when the channel already holds
    /// `capacity` items. The item is discarded and counted in
    /// [`drops`][Self::drops].
    pub fn try_enqueue(&self, item: T) -> Result<(), GatewayError> {
        {
            let mut heap = self.lock();
            if heap.len() >= self.capacity {
                drop(heap);
                self.drops.fetch_add(1, Ordering::Relaxed);
                return Err(GatewayError::ChannelFull {
                    capacity: self.capacity,
                });
            }
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            heap.push(Entry {
                key: (item.priority(), item.timestamp_us(), seq),
                item,
            });
        }
        self.available.notify_one();
        Ok(())
    }

    /// Pop the highest-priority item if one is queued.
    pub fn try_dequeue(&self) -> Option<T> {
        self.lock().pop().map(|e| e.item)
    }

    /// Wait up to `timeout` for an item.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Empty`] when nothing arrived in time, so the consumer
    /// can re-check its shutdown signal instead of blocking forever.
    pub async fn dequeue(&self, timeout: Duration) -> Result<T, GatewayError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_dequeue() {
                return Ok(item);
            }
            // `notify_one` stores a permit when nobody is waiting, so an
            // enqueue racing with this point is not lost.
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return self.try_dequeue().ok_or(GatewayError::Empty);
            }
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of rejected enqueues since construction.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Entry<T>>> {
        self.heap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> std::fmt::Debug for PriorityChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityChannel")
            .field("capacity", &self.capacity)
            .field("drops", &self.drops.load(Ordering::Relaxed))
            .finish()
    }
}
