mod cache;
mod layout;
mod padding;

pub use cache::{CacheAnalyzer, CacheLine, CacheReport};
pub use layout::{FieldInfo, LayoutInfo};
pub use padding::{BlockPadding, PaddingReport};

#[doc(hidden)]
pub use layout::{probe_align, probe_size};
