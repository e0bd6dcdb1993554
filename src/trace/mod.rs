mod aggregator;
mod event;
mod ring;
mod sink;
mod tracker;

pub use aggregator::{Aggregator, TICK};
pub use event::{AllocationEvent, BlockMetadata, EventKind, Tag, TAG_BYTES};
pub use ring::EventRing;
pub use sink::{CollectingSink, CommandHandler, EventSink, SnapshotProvider};
pub use tracker::{LocalTracker, RING_CAPACITY};
