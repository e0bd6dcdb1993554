//! Per-thread event production with sampling.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::alloc::ShardStats;

use super::event::{AllocationEvent, BlockMetadata, EventKind};
use super::ring::EventRing;

/// Events buffered per thread before the aggregator drains them.
pub const RING_CAPACITY: usize = 4096;

/// Thread-local event producer bound to one shard.
///
/// With sampling factor `s`, one event in `s` is materialized; the event
/// counter itself always advances, so `event_id`s stay monotonic per
/// tracker. Shard counters are supplied lazily by the caller, captured
/// under the shard lock of the operation being recorded, and are never
/// computed for sampled-out events.
pub struct LocalTracker {
    ring: EventRing<AllocationEvent, RING_CAPACITY>,
    sampling: u64,
    counter: AtomicU64,
}

impl LocalTracker {
    pub fn new(sampling: usize) -> Self {
        Self {
            ring: EventRing::new(),
            sampling: sampling.max(1) as u64,
            counter: AtomicU64::new(0),
        }
    }

    pub fn record_alloc(&self, block: BlockMetadata, stats: impl FnOnce() -> ShardStats) {
        self.record(EventKind::Alloc, block, stats);
    }

    pub fn record_dealloc(&self, block: BlockMetadata, stats: impl FnOnce() -> ShardStats) {
        self.record(EventKind::Dealloc, block, stats);
    }

    fn record(&self, kind: EventKind, block: BlockMetadata, stats: impl FnOnce() -> ShardStats) {
        let event_id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if event_id % self.sampling != 0 {
            return;
        }
        let stats = stats();
        let event = AllocationEvent {
            kind,
            block,
            event_id,
            total_allocated: stats.bytes_allocated,
            total_free: stats.bytes_free,
            fragmentation_pct: stats.fragmentation_pct,
            free_block_count: stats.free_block_count,
        };
        // A full ring drops the event; production never blocks.
        let _ = self.ring.try_push(event);
    }

    pub(crate) fn drain_into(&self, out: &mut Vec<AllocationEvent>) {
        while let Some(event) = self.ring.try_pop() {
            out.push(event);
        }
    }
}
