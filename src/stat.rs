//! Exact allocation counters, independent of event sampling.
//!
//! The event pipeline may thin or drop events; these counters never do.
//! Sizes are bucketed by power of two so a long-running arena can show its
//! request-size distribution without per-allocation storage.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Power-of-two buckets from 1 B up to 2 MiB; larger requests land in the
/// overflow counter.
const SIZE_BUCKETS: usize = 22;

pub(crate) struct Counters {
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    failed_allocations: AtomicUsize,
    sizes: [AtomicUsize; SIZE_BUCKETS],
    other_size: AtomicUsize,
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
            failed_allocations: AtomicUsize::new(0),
            sizes: [const { AtomicUsize::new(0) }; SIZE_BUCKETS],
            other_size: AtomicUsize::new(0),
        }
    }

    pub fn track_allocation(&self, requested: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let bucket = requested.max(1).next_power_of_two().trailing_zeros() as usize;
        if bucket < SIZE_BUCKETS {
            self.sizes[bucket].fetch_add(1, Ordering::Relaxed);
        } else {
            self.other_size.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn track_deallocation(&self) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_failure(&self) {
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AllocationCounters {
        let allocations = self.allocations.load(Ordering::Relaxed);
        let deallocations = self.deallocations.load(Ordering::Relaxed);
        let mut size_histogram: Vec<SizeBucket> = self
            .sizes
            .iter()
            .enumerate()
            .filter_map(|(bucket, counter)| {
                let count = counter.load(Ordering::Relaxed);
                (count > 0).then_some(SizeBucket {
                    max_bytes: 1 << bucket,
                    count,
                })
            })
            .collect();
        let other = self.other_size.load(Ordering::Relaxed);
        if other > 0 {
            size_histogram.push(SizeBucket {
                max_bytes: usize::MAX,
                count: other,
            });
        }
        AllocationCounters {
            allocations,
            deallocations,
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            live_blocks: allocations.saturating_sub(deallocations),
            size_histogram,
        }
    }
}

/// Point-in-time copy of the arena's exact counters.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationCounters {
    pub allocations: usize,
    pub deallocations: usize,
    pub failed_allocations: usize,
    pub live_blocks: usize,
    pub size_histogram: Vec<SizeBucket>,
}

/// Requests whose rounded size is at most `max_bytes`.
#[derive(Debug, Clone, Serialize)]
pub struct SizeBucket {
    pub max_bytes: usize,
    pub count: usize,
}
