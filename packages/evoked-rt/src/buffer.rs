// Bounded blocking buffer for incoming sample blocks
//
// Producers block when the buffer is full and the consumer blocks when it is
// empty. Nothing is ever dropped: overflow turns into backpressure on the
// acquisition side. `release_waiters` wakes every blocked caller so shutdown
// can proceed.

use crate::types::SampleBlock;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Metrics for buffer performance monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BufferMetrics {
    pub total_pushed: u64,
    pub total_popped: u64,
    /// Pushes that had to wait for a free slot
    pub backpressure_waits: u64,
    pub current_size: usize,
    pub peak_size: usize,
    pub capacity: usize,
}

struct Slots {
    queue: VecDeque<SampleBlock>,
    released: bool,
}

/// FIFO of sample blocks shared between producers and the consumer thread
pub struct SampleStreamBuffer {
    slots: Mutex<Slots>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,

    // Atomic counters for lock-free metrics
    total_pushed: AtomicU64,
    total_popped: AtomicU64,
    backpressure_waits: AtomicU64,
    peak_size: AtomicUsize,
}

impl SampleStreamBuffer {
    /// Create a buffer holding at most `capacity` blocks (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(Slots {
                queue: VecDeque::with_capacity(capacity),
                released: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            total_pushed: AtomicU64::new(0),
            total_popped: AtomicU64::new(0),
            backpressure_waits: AtomicU64::new(0),
            peak_size: AtomicUsize::new(0),
        }
    }

    /// Push a block, blocking while the buffer is full
    ///
    /// Returns Err(block) if the buffer was released before the block could
    /// be stored.
    pub fn push(&self, block: SampleBlock) -> Result<(), SampleBlock> {
        let mut slots = self.slots.lock();

        if !slots.released && slots.queue.len() >= self.capacity {
            self.backpressure_waits.fetch_add(1, Ordering::Relaxed);
            log::debug!("Sample buffer full ({} blocks), producer waiting", self.capacity);
            while !slots.released && slots.queue.len() >= self.capacity {
                self.not_full.wait(&mut slots);
            }
        }

        if slots.released {
            return Err(block);
        }

        self.store(&mut slots, block);
        Ok(())
    }

    /// Push without waiting; hands the block back when full or released
    pub fn try_push(&self, block: SampleBlock) -> Result<(), SampleBlock> {
        let mut slots = self.slots.lock();
        if slots.released || slots.queue.len() >= self.capacity {
            return Err(block);
        }
        self.store(&mut slots, block);
        Ok(())
    }

    fn store(&self, slots: &mut Slots, block: SampleBlock) {
        slots.queue.push_back(block);
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        self.peak_size
            .fetch_max(slots.queue.len(), Ordering::Relaxed);
        self.not_empty.notify_one();
    }

    /// Pop the oldest block, blocking while the buffer is empty
    ///
    /// Returns None once the buffer has been released.
    pub fn pop(&self) -> Option<SampleBlock> {
        let mut slots = self.slots.lock();
        loop {
            if slots.released {
                return None;
            }
            if let Some(block) = self.take(&mut slots) {
                return Some(block);
            }
            self.not_empty.wait(&mut slots);
        }
    }

    /// Pop the oldest block, waiting at most `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<SampleBlock> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.slots.lock();
        loop {
            if slots.released {
                return None;
            }
            if let Some(block) = self.take(&mut slots) {
                return Some(block);
            }
            if self.not_empty.wait_until(&mut slots, deadline).timed_out() {
                return if slots.released {
                    None
                } else {
                    self.take(&mut slots)
                };
            }
        }
    }

    fn take(&self, slots: &mut Slots) -> Option<SampleBlock> {
        let block = slots.queue.pop_front()?;
        self.total_popped.fetch_add(1, Ordering::Relaxed);
        self.not_full.notify_one();
        Some(block)
    }

    /// Wake every blocked producer and consumer; further pushes are refused
    /// until `rearm` is called
    pub fn release_waiters(&self) {
        let mut slots = self.slots.lock();
        slots.released = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Re-enable blocking operations after a release
    pub fn rearm(&self) {
        self.slots.lock().released = false;
    }

    pub fn is_released(&self) -> bool {
        self.slots.lock().released
    }

    /// Clear all items from buffer
    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        slots.queue.clear();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get current metrics
    pub fn metrics(&self) -> BufferMetrics {
        BufferMetrics {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_popped: self.total_popped.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            current_size: self.len(),
            peak_size: self.peak_size.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }
}
