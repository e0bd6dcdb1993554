//! Event and metadata records flowing through the tracking pipeline.

use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Fixed tag storage; 31 usable bytes plus a terminating zero.
pub const TAG_BYTES: usize = 32;

/// Short diagnostic label attached to an allocation.
///
/// Stored as a fixed byte array so events stay `Copy` and never allocate on
/// the hot path. Longer inputs are truncated; rendering replaces anything
/// outside printable ASCII with `?` so the serialized form is always valid
/// UTF-8.
#[derive(Clone, Copy)]
pub struct Tag {
    bytes: [u8; TAG_BYTES],
}

impl Tag {
    pub const MAX_LEN: usize = TAG_BYTES - 1;

    pub fn new(label: &str) -> Self {
        let mut bytes = [0u8; TAG_BYTES];
        let len = label.len().min(Self::MAX_LEN);
        bytes[..len].copy_from_slice(&label.as_bytes()[..len]);
        Self { bytes }
    }

    pub const fn empty() -> Self {
        Self {
            bytes: [0; TAG_BYTES],
        }
    }

    pub(crate) fn from_bytes(bytes: [u8; TAG_BYTES]) -> Self {
        Self { bytes }
    }

    pub(crate) fn as_bytes(&self) -> [u8; TAG_BYTES] {
        self.bytes
    }

    /// Printable-ASCII rendering of the tag.
    pub fn sanitized(&self) -> String {
        let len = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(Self::MAX_LEN);
        self.bytes[..len]
            .iter()
            .map(|&b| if (0x20..=0x7E).contains(&b) { b as char } else { '?' })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes[0] == 0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.sanitized())
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.sanitized())
    }
}

/// Reportable view of one live allocation. `offset` is relative to the
/// region base; `size` is the caller's request, `actual_size` what the
/// shard reserved.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct BlockMetadata {
    pub offset: usize,
    pub size: usize,
    pub alignment: usize,
    pub actual_size: usize,
    pub tag: Tag,
    pub timestamp_us: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Alloc,
    Dealloc,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Alloc => "allocate",
            EventKind::Dealloc => "deallocate",
        }
    }
}

/// One allocation or deallocation, bundled with the shard counters observed
/// at the moment of the call. `event_id` is monotonic per tracker only.
#[derive(Clone, Copy, Debug)]
pub struct AllocationEvent {
    pub kind: EventKind,
    pub block: BlockMetadata,
    pub event_id: u64,
    pub total_allocated: usize,
    pub total_free: usize,
    pub fragmentation_pct: usize,
    pub free_block_count: usize,
}

impl Serialize for AllocationEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("AllocationEvent", 12)?;
        st.serialize_field("type", self.kind.as_str())?;
        st.serialize_field("event_id", &self.event_id)?;
        st.serialize_field("offset", &self.block.offset)?;
        st.serialize_field("size", &self.block.size)?;
        st.serialize_field("alignment", &self.block.alignment)?;
        st.serialize_field("actual_size", &self.block.actual_size)?;
        st.serialize_field("tag", &self.block.tag)?;
        st.serialize_field("timestamp_us", &self.block.timestamp_us)?;
        st.serialize_field("total_allocated", &self.total_allocated)?;
        st.serialize_field("total_free", &self.total_free)?;
        st.serialize_field("fragmentation_pct", &self.fragmentation_pct)?;
        st.serialize_field("free_block_count", &self.free_block_count)?;
        st.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_truncates_and_round_trips() {
        let tag = Tag::new("request-buffer");
        assert_eq!(tag.sanitized(), "request-buffer");
        let long = "x".repeat(64);
        assert_eq!(Tag::new(&long).sanitized().len(), Tag::MAX_LEN);
        assert!(Tag::empty().is_empty());
    }

    #[test]
    fn tag_sanitizes_unprintable_bytes() {
        let tag = Tag::from_bytes({
            let mut b = [0u8; TAG_BYTES];
            b[..4].copy_from_slice(b"a\x01b\xff");
            b
        });
        assert_eq!(tag.sanitized(), "a?b?");
    }

    #[test]
    fn event_json_is_flat_with_expected_fields() {
        let event = AllocationEvent {
            kind: EventKind::Alloc,
            block: BlockMetadata {
                offset: 64,
                size: 100,
                alignment: 16,
                actual_size: 112,
                tag: Tag::new("hdr"),
                timestamp_us: 7,
            },
            event_id: 3,
            total_allocated: 112,
            total_free: 3984,
            fragmentation_pct: 0,
            free_block_count: 1,
        };
        let v: serde_json::Value = serde_json::to_value(event).unwrap();
        assert_eq!(v["type"], "allocate");
        assert_eq!(v["event_id"], 3);
        assert_eq!(v["offset"], 64);
        assert_eq!(v["size"], 100);
        assert_eq!(v["actual_size"], 112);
        assert_eq!(v["tag"], "hdr");
        assert_eq!(v["total_free"], 3984);
        assert_eq!(v["free_block_count"], 1);
    }

    #[test]
    fn dealloc_kind_serializes_as_deallocate() {
        let event = AllocationEvent {
            kind: EventKind::Dealloc,
            block: BlockMetadata {
                offset: 0,
                size: 0,
                alignment: 16,
                actual_size: 128,
                tag: Tag::empty(),
                timestamp_us: 0,
            },
            event_id: 1,
            total_allocated: 0,
            total_free: 4096,
            fragmentation_pct: 0,
            free_block_count: 1,
        };
        let v: serde_json::Value = serde_json::to_value(event).unwrap();
        assert_eq!(v["type"], "deallocate");
    }
}
