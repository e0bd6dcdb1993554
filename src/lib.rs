//! Instrumented memory arena.
//!
//! One contiguous anonymous mapping is split into independent shards, each
//! served by an address-ordered first-fit allocator with segregated
//! small-class fast paths. Every allocation and deallocation feeds a
//! per-thread lock-free event ring; a background aggregator drains the
//! rings and hands serialized batches to a pluggable sink. Structural
//! reports (padding waste, cache-line utilization, struct layout) are
//! computed on demand from a consistent snapshot of live blocks.
//!
//! ```no_run
//! use arenascope::{Arena, ArenaConfig};
//!
//! let arena = Arena::create(ArenaConfig {
//!     arena_size: 1 << 20,
//!     ..Default::default()
//! })?;
//! let p = arena.alloc_raw(256, 16, "request-buffer");
//! assert!(!p.is_null());
//! arena.dealloc_raw(p, 256);
//! println!("{}", arena.snapshot_json());
//! # Ok::<(), arenascope::ArenaError>(())
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("arenascope supports 64-bit targets only");

pub mod alloc;
pub mod error;
pub mod region;
pub mod report;
pub mod stat;
pub mod trace;
pub mod util;

mod arena;

pub use arena::{Arena, ArenaConfig, TrackedAlloc};
pub use error::ArenaError;
pub use report::{CacheReport, LayoutInfo, PaddingReport};
pub use stat::AllocationCounters;
pub use trace::{AllocationEvent, BlockMetadata, CollectingSink, EventKind, EventSink, Tag};
