//! Anonymous virtual-memory region backing one arena.

use once_cell::sync::Lazy;

use crate::error::{ArenaError, Result};
use crate::util::Address;

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

/// System page size in bytes.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// One contiguous, page-aligned, read/write anonymous mapping.
///
/// The region is unmapped on drop. The OS contract guarantees the mapping is
/// zero-initialized.
pub struct Region {
    base: Address,
    capacity: usize,
}

impl Region {
    /// Map at least `capacity` bytes, rounded up to the page size.
    pub fn acquire(capacity: usize) -> Result<Region> {
        if capacity == 0 {
            return Err(ArenaError::InvalidArgument("region capacity must be non-zero"));
        }
        let capacity = capacity.div_ceil(page_size()) * page_size();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ArenaError::SystemError(std::io::Error::last_os_error()));
        }
        Ok(Region {
            base: Address::from(ptr),
            capacity,
        })
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_mut_ptr(), self.capacity);
        }
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}
