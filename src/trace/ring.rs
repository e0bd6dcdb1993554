//! Bounded single-producer/single-consumer event ring.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// SPSC ring of capacity `N` (one slot is kept open to distinguish full
/// from empty). Pushing into a full ring drops the value; nothing ever
/// blocks and no allocation happens after construction.
///
/// The owning thread is the only producer; consumers must serialize among
/// themselves (the aggregator does so behind its registry lock).
pub struct EventRing<T, const N: usize> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send, const N: usize> Send for EventRing<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for EventRing<T, N> {}

impl<T, const N: usize> EventRing<T, N> {
    pub fn new() -> Self {
        assert!(N >= 2);
        let buffer = (0..N)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            buffer,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Publish one value. Returns `false` (dropping the value) when the
    /// ring is full.
    pub fn try_push(&self, value: T) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % N;
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }
        unsafe { (*self.buffer[head].get()).write(value) };
        self.head.store(next, Ordering::Release);
        true
    }

    pub fn try_pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let value = unsafe { (*self.buffer[tail].get()).assume_init_read() };
        self.tail.store((tail + 1) % N, Ordering::Release);
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Relaxed) == self.head.load(Ordering::Acquire)
    }
}

impl<T, const N: usize> Default for EventRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for EventRing<T, N> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}
