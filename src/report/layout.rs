//! Struct-field layout inspection.
//!
//! [`layout_of!`](crate::layout_of) enumerates the named fields of a type,
//! resolves each field's offset, size, and alignment at compile time, and
//! folds them into a [`LayoutInfo`] with per-field gaps, tail padding, and
//! overall efficiency.
//!
//! ```
//! use arenascope::layout_of;
//!
//! #[repr(C)]
//! struct Sample {
//!     flag: u8,
//!     count: u64,
//! }
//!
//! let info = layout_of!(Sample { flag, count });
//! assert_eq!(info.fields[1].padding_before, 7);
//! ```

use serde::Serialize;

/// One field of an inspected struct.
#[derive(Debug, Clone, Serialize)]
pub struct FieldInfo {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
    pub alignment: usize,
    /// Gap between the end of the previous field and this one.
    pub padding_before: usize,
}

/// Layout summary for a struct type.
#[derive(Debug, Clone, Serialize)]
pub struct LayoutInfo {
    pub type_name: &'static str,
    pub total_size: usize,
    pub total_alignment: usize,
    pub useful_bytes: usize,
    pub padding_bytes: usize,
    pub tail_padding: usize,
    pub efficiency: f64,
    pub fields: Vec<FieldInfo>,
}

impl LayoutInfo {
    /// Fold raw field records into the summary. Fields are sorted by
    /// offset first, since declaration order need not match memory order.
    pub fn build(
        type_name: &'static str,
        total_size: usize,
        total_alignment: usize,
        mut fields: Vec<FieldInfo>,
    ) -> Self {
        fields.sort_by_key(|f| f.offset);
        let mut useful_bytes = 0;
        let mut prev_end = 0;
        for field in &mut fields {
            field.padding_before = field.offset.saturating_sub(prev_end);
            useful_bytes += field.size;
            prev_end = field.offset + field.size;
        }
        let tail_padding = total_size.saturating_sub(prev_end);
        let padding_bytes = total_size.saturating_sub(useful_bytes);
        let efficiency = if total_size > 0 {
            useful_bytes as f64 / total_size as f64
        } else {
            0.0
        };
        LayoutInfo {
            type_name,
            total_size,
            total_alignment,
            useful_bytes,
            padding_bytes,
            tail_padding,
            efficiency,
            fields,
        }
    }
}

#[doc(hidden)]
pub const fn probe_size<T>(_: *const T) -> usize {
    std::mem::size_of::<T>()
}

#[doc(hidden)]
pub const fn probe_align<T>(_: *const T) -> usize {
    std::mem::align_of::<T>()
}

/// Inspect the memory layout of a struct type:
/// `layout_of!(Type { field_a, field_b, ... })`.
#[macro_export]
macro_rules! layout_of {
    ($ty:ty { $($field:ident),+ $(,)? }) => {{
        let fields = vec![$(
            {
                let probe = ::core::mem::MaybeUninit::<$ty>::uninit();
                let base = probe.as_ptr();
                let field_ptr = unsafe { ::core::ptr::addr_of!((*base).$field) };
                $crate::report::FieldInfo {
                    name: stringify!($field),
                    offset: ::core::mem::offset_of!($ty, $field),
                    size: $crate::report::probe_size(field_ptr),
                    alignment: $crate::report::probe_align(field_ptr),
                    padding_before: 0,
                }
            }
        ),+];
        $crate::report::LayoutInfo::build(
            stringify!($ty),
            ::core::mem::size_of::<$ty>(),
            ::core::mem::align_of::<$ty>(),
            fields,
        )
    }};
}
