//! Bounded in-memory buffer between connection handlers and the processor
//! pool.
//!
//! The buffer is a fixed-capacity ring with a back-pressure policy layered
//! on top:
//!
//! - below 90% utilisation it behaves as a plain bounded FIFO
//! - at 90% the `back_pressure` flag is raised (visible to clients through
//!   `CMD:BUFFER_STATS`), and it stays raised until utilisation drops back
//!   under 70%
//! - at full capacity an incoming record evicts the first `DEBUG`/`TRACE`
//!   record found from the read cursor forward, falling back to the oldest
//!   record when no low-priority victim exists
//!
//! Eviction removes a record from the middle of the ring; the remaining
//! records are compacted forward so FIFO order among survivors is
//! preserved. `total_added` and `total_dropped` are monotone counters
//! readable without taking the ring lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::warn;

use crate::record::LogRecord;

const BACK_PRESSURE_HIGH: f64 = 0.9;
const BACK_PRESSURE_LOW: f64 = 0.7;

pub struct CircularBuffer {
    ring: Mutex<Ring>,
    not_empty: Notify,
    capacity: usize,
    size: AtomicUsize,
    total_added: AtomicU64,
    total_dropped: AtomicU64,
    back_pressure: AtomicBool,
    closed: AtomicBool,
}

struct Ring {
    slots: Vec<Option<LogRecord>>,
    read: usize,
    write: usize,
    len: usize,
}

/// Point-in-time view of the buffer counters.
#[derive(Debug, Clone, Copy)]
pub struct BufferStats {
    pub size: usize,
    pub capacity: usize,
    pub total_added: u64,
    pub total_dropped: u64,
    pub back_pressure: bool,
}

impl BufferStats {
    #[must_use]
    pub fn utilisation_pct(&self) -> f64 {
        self.size as f64 / self.capacity as f64 * 100.0
    }
}

impl fmt::Display for BufferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffer Stats - Size: {}/{} ({:.1}%), Added: {}, Dropped: {}, BackPressure: {}",
            self.size,
            self.capacity,
            self.utilisation_pct(),
            self.total_added,
            self.total_dropped,
            self.back_pressure,
        )
    }
}

impl CircularBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        CircularBuffer {
            ring: Mutex::new(Ring {
                slots,
                read: 0,
                write: 0,
                len: 0,
            }),
            not_empty: Notify::new(),
            capacity,
            size: AtomicUsize::new(0),
            total_added: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            back_pressure: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Offers a record to the buffer. Never blocks.
    ///
    /// Returns `true` when the record was accepted (possibly after evicting
    /// an older record) and `false` when it had to be rejected outright.
    pub fn enqueue(&self, record: LogRecord) -> bool {
        let mut ring = self.lock_ring();
        self.total_added.fetch_add(1, Ordering::Relaxed);

        let utilisation = ring.len as f64 / self.capacity as f64;
        if utilisation >= BACK_PRESSURE_HIGH {
            self.back_pressure.store(true, Ordering::Relaxed);

            if ring.len >= self.capacity {
                if let Some(victim) = ring.evict_one() {
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        level = %victim.level,
                        application = %victim.application,
                        "back-pressure: evicted buffered record"
                    );
                } else {
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("back-pressure: buffer full, record rejected");
                    return false;
                }
            }
        } else if utilisation < BACK_PRESSURE_LOW {
            self.back_pressure.store(false, Ordering::Relaxed);
        }

        ring.push(record);
        self.size.store(ring.len, Ordering::Relaxed);
        drop(ring);
        self.not_empty.notify_one();
        true
    }

    /// Removes the oldest record without waiting.
    pub fn try_dequeue(&self) -> Option<LogRecord> {
        let mut ring = self.lock_ring();
        let record = ring.pop();
        self.size.store(ring.len, Ordering::Relaxed);
        record
    }

    /// Removes the oldest record, waiting until one is available. Returns
    /// `None` once the buffer has been closed and drained.
    pub async fn dequeue(&self) -> Option<LogRecord> {
        loop {
            let notified = self.not_empty.notified();
            if let Some(record) = self.try_dequeue() {
                return Some(record);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Marks the buffer closed and wakes blocked consumers. Records still
    /// buffered remain dequeueable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_waiters();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn back_pressure_active(&self) -> bool {
        self.back_pressure.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_added(&self) -> u64 {
        self.total_added.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            size: self.len(),
            capacity: self.capacity,
            total_added: self.total_added(),
            total_dropped: self.total_dropped(),
            back_pressure: self.back_pressure_active(),
        }
    }

    fn lock_ring(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Ring {
    fn push(&mut self, record: LogRecord) {
        let capacity = self.slots.len();
        self.slots[self.write] = Some(record);
        self.write = (self.write + 1) % capacity;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<LogRecord> {
        if self.len == 0 {
            return None;
        }
        let record = self.slots[self.read].take();
        self.read = (self.read + 1) % self.slots.len();
        self.len -= 1;
        record
    }

    /// Picks and removes an eviction victim: the first low-priority record
    /// from the read cursor forward, else the oldest record.
    fn evict_one(&mut self) -> Option<LogRecord> {
        if self.len == 0 {
            return None;
        }
        let capacity = self.slots.len();
        for offset in 0..self.len {
            let idx = (self.read + offset) % capacity;
            let low_priority = self.slots[idx]
                .as_ref()
                .is_some_and(|r| r.level.is_low_priority());
            if low_priority {
                let victim = self.slots[idx].take();
                self.compact_from(idx);
                self.len -= 1;
                return victim;
            }
        }
        self.pop()
    }

    /// Closes the hole left at `removed` by shifting every later record one
    /// slot toward the read cursor, then steps the write cursor back.
    fn compact_from(&mut self, removed: usize) {
        let capacity = self.slots.len();
        let mut current = removed;
        loop {
            let next = (current + 1) % capacity;
            if next == self.write {
                break;
            }
            self.slots[current] = self.slots[next].take();
            current = next;
        }
        self.write = current;
    }
}
