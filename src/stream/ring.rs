//! Fixed-capacity media ring
//!
//! One ring per track, single producer, many independent consumers. The
//! writer never waits: it overwrites the oldest slot and wakes every reader
//! after each write. A reader that falls more than the capacity behind is
//! evicted with [`RingReadError::Overflow`] instead of slowing the writer
//! down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use super::Unit;

/// Error observed by a ring cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingReadError {
    /// The reader fell behind by more than the ring capacity; `missed` units
    /// were overwritten before it could observe them.
    Overflow { missed: u64 },
    /// The ring was closed and all remaining units have been drained.
    Closed,
}

pub(crate) struct Ring {
    slots: Box<[Mutex<Option<Unit>>]>,
    /// Number of units ever written; the next unit gets this sequence.
    head: AtomicU64,
    closed: AtomicBool,
    wakers: Mutex<Vec<Weak<Notify>>>,
    capacity: u64,
}

impl Ring {
    /// `capacity` must be a power of two (validated at configuration load).
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            head: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            wakers: Mutex::new(Vec::new()),
            capacity: capacity as u64,
        }
    }

    /// Publishes a unit, assigning it the next sequence number.
    pub(crate) fn write(&self, mut unit: Unit) -> u64 {
        let seq = self.head.load(Ordering::Relaxed);
        unit.seq = seq;

        let idx = (seq % self.capacity) as usize;
        *self.slots[idx].lock().unwrap_or_else(|e| e.into_inner()) = Some(unit);

        self.head.store(seq + 1, Ordering::Release);
        self.wake_all();
        seq
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    fn wake_all(&self) {
        let mut wakers = self.wakers.lock().unwrap_or_else(|e| e.into_inner());
        wakers.retain(|w| match w.upgrade() {
            Some(n) => {
                n.notify_one();
                true
            }
            None => false,
        });
    }

    fn add_waker(&self, waker: Weak<Notify>) {
        self.wakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(waker);
    }
}

/// A single reader's position in one ring.
///
/// The cursor starts at the live edge: units written before attachment are
/// not replayed.
pub(crate) struct Cursor {
    ring: Arc<Ring>,
    tail: u64,
}

impl Cursor {
    pub(crate) fn new(ring: Arc<Ring>, waker: &Arc<Notify>) -> Self {
        ring.add_waker(Arc::downgrade(waker));
        let tail = ring.head();
        Self { ring, tail }
    }

    /// Non-blocking read of the next unit.
    ///
    /// `Ok(None)` means the cursor is at the live edge of an open ring.
    pub(crate) fn try_next(&mut self) -> Result<Option<Unit>, RingReadError> {
        let head = self.ring.head();

        if self.tail == head {
            if self.ring.is_closed() {
                return Err(RingReadError::Closed);
            }
            return Ok(None);
        }

        if head - self.tail > self.ring.capacity {
            return Err(RingReadError::Overflow {
                missed: head - self.ring.capacity - self.tail,
            });
        }

        let idx = (self.tail % self.ring.capacity) as usize;
        let unit = self.ring.slots[idx]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        match unit {
            // the sequence check catches a writer lapping us between the
            // head load and the slot read
            Some(u) if u.seq == self.tail => {
                self.tail += 1;
                Ok(Some(u))
            }
            _ => {
                let head = self.ring.head();
                Err(RingReadError::Overflow {
                    missed: head
                        .saturating_sub(self.ring.capacity)
                        .saturating_sub(self.tail),
                })
            }
        }
    }
}
