//! Facade binding the region, shards, trackers, and aggregator together.

use std::alloc::{GlobalAlloc, Layout};
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::CachePadded;
use serde::Serialize;
use spin::relax::Yield;

use crate::alloc::{
    AllocationHeader, FreeListAllocator, HEADER_MAGIC, MIN_BLOCK_SIZE, QUANTUM,
};
use crate::error::{ArenaError, Result};
use crate::region::Region;
use crate::report::{CacheAnalyzer, CacheReport, PaddingReport};
use crate::stat::{AllocationCounters, Counters};
use crate::trace::{
    Aggregator, BlockMetadata, CommandHandler, EventSink, LocalTracker, Tag,
};
use crate::util::Address;

type ShardMutex<T> = spin::mutex::Mutex<T, Yield>;

/// Construction parameters; `..Default::default()` fills the typical setup
/// (1 MiB arena, 256 shards, detect the cache line, sample everything, no
/// sink).
#[derive(Clone)]
pub struct ArenaConfig {
    /// Total arena capacity in bytes (rounded up to the page size).
    pub arena_size: usize,
    /// Cache-line width for reports; 0 means detect from the OS.
    pub cache_line_size: usize,
    /// Forward drained event batches to `sink`.
    pub enable_sink: bool,
    pub sink: Option<Arc<dyn EventSink>>,
    /// Surface one event in `sampling`; allocator counters stay exact.
    pub sampling: usize,
    pub shard_count: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            arena_size: 1 << 20,
            cache_line_size: 0,
            enable_sink: false,
            sink: None,
            sampling: 1,
            shard_count: 256,
        }
    }
}

impl fmt::Debug for ArenaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaConfig")
            .field("arena_size", &self.arena_size)
            .field("cache_line_size", &self.cache_line_size)
            .field("enable_sink", &self.enable_sink)
            .field("has_sink", &self.sink.is_some())
            .field("sampling", &self.sampling)
            .field("shard_count", &self.shard_count)
            .finish()
    }
}

struct Shard {
    alloc: ShardMutex<FreeListAllocator>,
}

struct ArenaInner {
    region: Region,
    shards: Box<[CachePadded<Shard>]>,
    /// Size of every shard but possibly the last, which absorbs the
    /// remainder; offset-to-shard lookup divides by this.
    shard_span: usize,
    line_size: usize,
    sampling: usize,
    generation: u64,
    next_shard: AtomicUsize,
    epoch: Instant,
    aggregator: Aggregator,
    sink: Option<Arc<dyn EventSink>>,
    counters: Counters,
}

/// Instrumented arena: a general-purpose allocator carved out of one
/// contiguous mapping, streaming allocation events and answering
/// structural queries.
///
/// Threads are bound to a shard on their first allocation; every
/// allocate/deallocate takes exactly that one shard's lock. Dropping the
/// arena (and every [`TrackedAlloc`] handle cloned from it) stops the
/// aggregator and unmaps the region.
pub struct Arena {
    inner: Arc<ArenaInner>,
}

static GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct ThreadBinding {
    generation: u64,
    shard_idx: usize,
    tracker: Arc<LocalTracker>,
}

thread_local! {
    static SHARD_BINDING: RefCell<Option<ThreadBinding>> = const { RefCell::new(None) };
}

impl Arena {
    pub fn create(config: ArenaConfig) -> Result<Arena> {
        if config.sampling == 0 {
            return Err(ArenaError::InvalidArgument("sampling must be at least 1"));
        }
        if config.shard_count == 0 {
            return Err(ArenaError::InvalidArgument("shard_count must be at least 1"));
        }
        let region = Region::acquire(config.arena_size)?;
        let shard_span = (region.capacity() / config.shard_count) & !(QUANTUM - 1);
        if shard_span < MIN_BLOCK_SIZE {
            return Err(ArenaError::InvalidArgument(
                "arena too small for the configured shard count",
            ));
        }

        let mut shards = Vec::with_capacity(config.shard_count);
        for i in 0..config.shard_count {
            let base = region.base() + i * shard_span;
            let size = if i + 1 == config.shard_count {
                region.capacity() - i * shard_span
            } else {
                shard_span
            };
            shards.push(CachePadded::new(Shard {
                alloc: ShardMutex::new(FreeListAllocator::new(base, size)),
            }));
        }

        let line_size = if config.cache_line_size == 0 {
            CacheAnalyzer::detect_line_size()
        } else if config.cache_line_size.is_power_of_two() {
            config.cache_line_size
        } else {
            64
        };

        let sink = if config.enable_sink {
            config.sink.clone()
        } else {
            None
        };
        let aggregator = Aggregator::new(sink.clone());

        let inner = Arc::new(ArenaInner {
            region,
            shards: shards.into_boxed_slice(),
            shard_span,
            line_size,
            sampling: config.sampling,
            generation: GENERATION.fetch_add(1, Ordering::Relaxed),
            next_shard: AtomicUsize::new(0),
            epoch: Instant::now(),
            aggregator,
            sink: sink.clone(),
            counters: Counters::new(),
        });

        if let Some(sink) = sink {
            let weak = Arc::downgrade(&inner);
            sink.set_snapshot_provider(Box::new(move || {
                weak.upgrade()
                    .map(|inner| inner.snapshot_json())
                    .unwrap_or_else(|| String::from("{}"))
            }));
        }

        tracing::debug!(
            capacity = inner.region.capacity(),
            shards = inner.shards.len(),
            "arena created"
        );
        Ok(Arena { inner })
    }

    /// Allocate `size` bytes at `alignment`, recording `tag` (truncated to
    /// 31 bytes) with the event. Returns null when the bound shard is
    /// exhausted or the alignment is invalid.
    pub fn alloc_raw(&self, size: usize, alignment: usize, tag: &str) -> *mut u8 {
        match self.inner.try_alloc(size, alignment, tag) {
            Ok(ptr) => ptr.as_ptr(),
            Err(err) => {
                tracing::debug!(%err, size, alignment, "allocation failed");
                std::ptr::null_mut()
            }
        }
    }

    /// Release a pointer returned by [`Arena::alloc_raw`]. Null pointers
    /// and pointers that did not originate from this arena are ignored.
    pub fn dealloc_raw(&self, ptr: *mut u8, size: usize) {
        self.inner.dealloc(ptr, size);
    }

    /// Resize a block from [`Arena::alloc_raw`]. Shrinking (or growing
    /// within the bytes already reserved) keeps the pointer; a real grow
    /// moves the payload. Null `ptr` behaves like `alloc_raw`; returns null
    /// when the new request cannot be satisfied, leaving the old block
    /// intact.
    pub fn realloc_raw(&self, ptr: *mut u8, new_size: usize, tag: &str) -> *mut u8 {
        self.inner.realloc(ptr, new_size, tag)
    }

    /// Exact counters since creation, unaffected by event sampling.
    pub fn allocation_counters(&self) -> AllocationCounters {
        self.inner.counters.snapshot()
    }

    /// Construct a `T` inside the arena.
    pub fn alloc<T>(&self, tag: &str, value: T) -> Option<NonNull<T>> {
        let ptr = self.alloc_raw(mem::size_of::<T>(), mem::align_of::<T>(), tag);
        let ptr = NonNull::new(ptr)?.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Some(ptr)
    }

    /// Drop and release a value built with [`Arena::alloc`].
    ///
    /// # Safety
    /// `ptr` must come from `alloc::<T>` on this arena and must not be used
    /// afterwards.
    pub unsafe fn dealloc<T>(&self, ptr: NonNull<T>) {
        std::ptr::drop_in_place(ptr.as_ptr());
        self.dealloc_raw(ptr.as_ptr().cast(), mem::size_of::<T>());
    }

    /// Shareable allocator handle implementing [`GlobalAlloc`]. Holding one
    /// keeps the arena alive.
    pub fn resource(&self) -> TrackedAlloc {
        TrackedAlloc {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Consistent point-in-time view of every shard, serialized.
    pub fn snapshot_json(&self) -> String {
        self.inner.snapshot_json()
    }

    /// Recently drained events, serialized as a JSON array.
    pub fn event_log_json(&self) -> String {
        self.inner.aggregator.event_log_json()
    }

    pub fn padding_report(&self) -> PaddingReport {
        let (blocks, _) = self.inner.collect();
        PaddingReport::from_blocks(&blocks)
    }

    pub fn cache_report(&self) -> CacheReport {
        let (blocks, _) = self.inner.collect();
        CacheAnalyzer::new(self.inner.line_size).analyze(&blocks, self.capacity())
    }

    /// Forward inbound sink messages to `handler`.
    pub fn set_command_handler(&self, handler: CommandHandler) {
        if let Some(sink) = &self.inner.sink {
            sink.set_command_handler(handler);
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.region.capacity()
    }

    pub fn cache_line_size(&self) -> usize {
        self.inner.line_size
    }

    pub fn bytes_allocated(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.alloc.lock().bytes_allocated())
            .sum()
    }

    pub fn bytes_free(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.alloc.lock().bytes_free())
            .sum()
    }

    /// Live allocations across all shards.
    pub fn active_block_count(&self) -> usize {
        self.inner.collect().0.len()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity())
            .field("shards", &self.inner.shards.len())
            .finish()
    }
}

#[derive(Serialize)]
struct SnapshotJson<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    capacity: usize,
    total_allocated: usize,
    total_free: usize,
    fragmentation_pct: usize,
    free_block_count: usize,
    blocks: &'a [BlockMetadata],
}

#[derive(Default)]
struct SnapshotTotals {
    total_allocated: usize,
    total_free: usize,
    free_block_count: usize,
    largest_free: usize,
}

impl ArenaInner {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn shard_index(&self, offset: usize) -> usize {
        (offset / self.shard_span).min(self.shards.len() - 1)
    }

    /// The calling thread's shard binding, created on first use and
    /// invalidated whenever it was made against a different facade.
    fn binding(self: &Arc<Self>) -> ThreadBinding {
        SHARD_BINDING.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_ref() {
                Some(binding) if binding.generation == self.generation => binding.clone(),
                _ => {
                    let shard_idx =
                        self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
                    let tracker = Arc::new(LocalTracker::new(self.sampling));
                    self.aggregator.register(&tracker);
                    let binding = ThreadBinding {
                        generation: self.generation,
                        shard_idx,
                        tracker,
                    };
                    *slot = Some(binding.clone());
                    binding
                }
            }
        })
    }

    fn try_alloc(self: &Arc<Self>, size: usize, alignment: usize, tag: &str) -> Result<NonNull<u8>> {
        self.try_alloc_impl(size, alignment, tag).inspect_err(|_| {
            self.counters.track_failure();
        })
    }

    fn try_alloc_impl(
        self: &Arc<Self>,
        size: usize,
        alignment: usize,
        tag: &str,
    ) -> Result<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment);
        }
        if size > self.region.capacity() {
            return Err(ArenaError::OutOfMemory);
        }
        let binding = self.binding();
        let shard = &self.shards[binding.shard_idx];
        let user_offset = AllocationHeader::user_offset(alignment);
        let total = size.max(1) + user_offset;
        let timestamp_us = self.now_us();
        let tag = Tag::new(tag);

        let mut alloc = shard.alloc.lock();
        let reserved = alloc.allocate(total, alignment)?;
        let block = Address::from(reserved.ptr);
        unsafe {
            AllocationHeader::write(
                block,
                AllocationHeader {
                    magic: HEADER_MAGIC,
                    size: reserved.actual_size,
                    requested: size,
                    alignment,
                    timestamp_us,
                    tag: tag.as_bytes(),
                },
                user_offset,
            );
        }
        let meta = BlockMetadata {
            offset: block - self.region.base(),
            size,
            alignment,
            actual_size: reserved.actual_size,
            tag,
            timestamp_us,
        };
        binding.tracker.record_alloc(meta, || alloc.stats());
        drop(alloc);
        self.counters.track_allocation(size);

        let user = block + user_offset;
        Ok(unsafe { NonNull::new_unchecked(user.as_mut_ptr()) })
    }

    fn dealloc(self: &Arc<Self>, ptr: *mut u8, _size: usize) {
        if ptr.is_null() {
            return;
        }
        let user = Address::from(ptr);
        let base = self.region.base();
        if user < base || user >= base + self.region.capacity() {
            return;
        }
        let (block, meta) = unsafe {
            match AllocationHeader::from_user_ptr(user, base) {
                Some((block, header)) => (
                    block,
                    BlockMetadata {
                        offset: block - base,
                        size: header.requested,
                        alignment: header.alignment,
                        actual_size: header.size,
                        tag: Tag::from_bytes(header.tag),
                        timestamp_us: self.now_us(),
                    },
                ),
                None => return,
            }
        };
        if meta.offset + meta.actual_size > self.region.capacity() {
            return;
        }
        let binding = self.binding();
        let shard = &self.shards[self.shard_index(meta.offset)];
        let mut alloc = shard.alloc.lock();
        if alloc
            .deallocate(block.as_mut_ptr(), meta.actual_size)
            .is_ok()
        {
            binding.tracker.record_dealloc(meta, || alloc.stats());
            drop(alloc);
            self.counters.track_deallocation();
        }
    }

    /// Resize a block, reusing it in place when the reserved bytes already
    /// cover the new request, otherwise moving the payload.
    fn realloc(self: &Arc<Self>, ptr: *mut u8, new_size: usize, tag: &str) -> *mut u8 {
        if ptr.is_null() {
            return match self.try_alloc(new_size, QUANTUM, tag) {
                Ok(p) => p.as_ptr(),
                Err(_) => std::ptr::null_mut(),
            };
        }
        let user = Address::from(ptr);
        let base = self.region.base();
        if user < base || user >= base + self.region.capacity() {
            return std::ptr::null_mut();
        }
        let (block, alignment, old_requested, user_capacity) = unsafe {
            match AllocationHeader::from_user_ptr(user, base) {
                Some((block, header)) => (
                    block,
                    header.alignment,
                    header.requested,
                    header.size - (user - block),
                ),
                None => return std::ptr::null_mut(),
            }
        };
        if user_capacity >= new_size.max(1) {
            // Take the owning shard's lock so snapshot walks never observe a
            // half-updated header.
            let _guard = self.shards[self.shard_index(block - base)].alloc.lock();
            unsafe { block.as_mut::<AllocationHeader>().requested = new_size.max(1) };
            return ptr;
        }
        let new_ptr = match self.try_alloc(new_size, alignment, tag) {
            Ok(p) => p.as_ptr(),
            Err(_) => return std::ptr::null_mut(),
        };
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, old_requested.min(new_size));
        }
        self.dealloc(ptr, old_requested);
        new_ptr
    }

    /// Lock every shard in index order and rebuild the live-block table by
    /// walking each shard's tiling: live blocks lead with the header magic,
    /// free blocks with their size word.
    fn collect(&self) -> (Vec<BlockMetadata>, SnapshotTotals) {
        let mut blocks = Vec::new();
        let mut totals = SnapshotTotals::default();
        let guards: Vec<_> = self.shards.iter().map(|s| s.alloc.lock()).collect();
        for alloc in &guards {
            let stats = alloc.stats();
            totals.total_allocated += stats.bytes_allocated;
            totals.total_free += stats.bytes_free;
            totals.free_block_count += stats.free_block_count;
            totals.largest_free = totals.largest_free.max(stats.largest_free_block);

            let shard_base = alloc.base();
            let shard_offset = shard_base - self.region.base();
            let cap = alloc.capacity();
            let mut off = 0;
            while off + mem::size_of::<usize>() <= cap {
                let word = unsafe { (shard_base + off).load::<usize>() };
                if word as u64 == HEADER_MAGIC {
                    let header = unsafe { (shard_base + off).as_ref::<AllocationHeader>() };
                    if header.size == 0 || off + header.size > cap {
                        break;
                    }
                    blocks.push(BlockMetadata {
                        offset: shard_offset + off,
                        size: header.requested,
                        alignment: header.alignment,
                        actual_size: header.size,
                        tag: Tag::from_bytes(header.tag),
                        timestamp_us: header.timestamp_us,
                    });
                    off += header.size;
                } else {
                    if word == 0 || off + word > cap {
                        break;
                    }
                    off += word;
                }
            }
        }
        (blocks, totals)
    }

    fn snapshot_json(&self) -> String {
        let (blocks, totals) = self.collect();
        let fragmentation_pct = if totals.total_free == 0 {
            0
        } else {
            (totals.total_free - totals.largest_free) * 100 / totals.total_free
        };
        serde_json::to_string(&SnapshotJson {
            kind: "snapshot",
            capacity: self.region.capacity(),
            total_allocated: totals.total_allocated,
            total_free: totals.total_free,
            fragmentation_pct,
            free_block_count: totals.free_block_count,
            blocks: &blocks,
        })
        .unwrap_or_else(|_| String::from("{}"))
    }
}

/// Clonable allocator handle backed by an [`Arena`].
///
/// Implements [`GlobalAlloc`] so arena-backed containers and FFI-style
/// consumers can allocate through the standard allocator surface; every
/// allocation is tracked like a tagged [`Arena::alloc_raw`] call.
pub struct TrackedAlloc {
    inner: Arc<ArenaInner>,
}

impl Clone for TrackedAlloc {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

unsafe impl GlobalAlloc for TrackedAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.inner.try_alloc(layout.size(), layout.align(), "") {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.dealloc(ptr, layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        self.inner.realloc(ptr, new_size, "")
    }
}
