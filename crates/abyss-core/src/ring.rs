//! Bounded single-producer/single-consumer queue with an
//! overwrite-on-overflow policy.
//!
//! The capture thread pushes decoded headers, the aggregator pops them. When
//! the queue is full the producer advances the read index itself, dropping
//! the oldest item and counting the loss; the producer never stalls and the
//! queue never grows. This deliberately breaks strict multi-producer or
//! multi-consumer semantics: exactly one thread may push and exactly one may
//! pop for the lifetime of the buffer.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Fixed-capacity SPSC ring. `CAP` must be a power of two.
pub struct RingBuffer<T, const CAP: usize> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    drops: AtomicU64,
}

// The slot cells are only touched by the single producer and the single
// consumer; the head/tail protocol orders those accesses.
unsafe impl<T: Send, const CAP: usize> Send for RingBuffer<T, CAP> {}
unsafe impl<T: Send, const CAP: usize> Sync for RingBuffer<T, CAP> {}

impl<T, const CAP: usize> RingBuffer<T, CAP> {
    const MASK: usize = CAP - 1;
    const POWER_OF_TWO: () = assert!(CAP.is_power_of_two(), "capacity must be a power of 2");

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::POWER_OF_TWO;
        let mut slots = Vec::with_capacity(CAP);
        slots.resize_with(CAP, || UnsafeCell::new(None));
        Self {
            slots: slots.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            drops: AtomicU64::new(0),
        }
    }

    /// Enqueue an item, overwriting the oldest one when full.
    ///
    /// Producer-side only.
    pub fn push(&self, item: T) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & Self::MASK;

        let tail = self.tail.load(Ordering::Acquire);
        if next == tail {
            self.tail.store((tail + 1) & Self::MASK, Ordering::Release);
            self.drops.fetch_add(1, Ordering::Relaxed);
        }

        unsafe { *self.slots[head].get() = Some(item) };
        self.head.store(next, Ordering::Release);
    }

    /// Dequeue the oldest item, or `None` when empty.
    ///
    /// Consumer-side only.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        let item = unsafe { (*self.slots[tail].get()).take() };
        self.tail.store((tail + 1) & Self::MASK, Ordering::Release);
        item
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Items currently queued. Any-thread safe, momentarily stale.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & Self::MASK
    }

    /// Occupancy in `[0, 1]`. Any-thread safe, momentarily stale.
    pub fn fill_ratio(&self) -> f32 {
        self.len() as f32 / CAP as f32
    }

    /// Cumulative count of items lost to overwrites.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub const fn capacity() -> usize {
        CAP
    }
}

impl<T, const CAP: usize> Default for RingBuffer<T, CAP> {
    fn default() -> Self {
        Self::new()
    }
}
