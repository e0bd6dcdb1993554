//! Address-ordered first-fit allocator with segregated small-class lists.
//!
//! Free blocks above the small-class ceiling live in an intrusive red-black
//! tree keyed by address and augmented with the maximum block size of each
//! subtree, so the lowest-address block that fits a request is found in
//! O(log n). Freed blocks at or below the ceiling are retired to per-class
//! LIFO lists and served back in O(1); they do not participate in
//! coalescing.
//!
//! Every structure lives inside the memory it manages: a [`FreeBlock`]
//! header occupies the first bytes of each tree-managed free region, and a
//! [`SmallNode`] link occupies the first bytes of each class-listed region.
//! The one exception is the sentinel standing in for "no child", which is a
//! heap object owned by the allocator and never placed in the region.

use std::mem;

use crate::error::{ArenaError, Result};
use crate::util::Address;

/// Internal size and alignment granule. Every block boundary and block size
/// is a multiple of this.
pub const QUANTUM: usize = 16;

/// Number of segregated small classes.
pub const SMALL_CLASSES: usize = 8;

/// Largest size served by the small-class lists.
pub const SMALL_MAX: usize = QUANTUM * SMALL_CLASSES;

/// Smallest region that can carry a tree node.
pub const MIN_BLOCK_SIZE: usize = mem::size_of::<FreeBlock>();

const _: () = assert!(MIN_BLOCK_SIZE == 48);
const _: () = assert!(mem::size_of::<SmallNode>() <= QUANTUM);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum Color {
    Red,
    Black,
}

/// Intrusive tree node written into the first bytes of a free region.
#[repr(C)]
struct FreeBlock {
    size: usize,
    parent: Address,
    left: Address,
    right: Address,
    subtree_max: usize,
    color: Color,
}

impl FreeBlock {
    fn at(addr: Address) -> &'static mut FreeBlock {
        unsafe { addr.as_mut() }
    }
}

/// Intrusive link written into the first bytes of a class-listed region.
/// Leads with the size word so heap walks can step over it.
#[repr(C)]
#[derive(Clone, Copy)]
struct SmallNode {
    size: usize,
    next: Address,
}

/// Successful allocation: an aligned pointer, its offset from the shard
/// base, and the total bytes reserved from the free pool.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub ptr: *mut u8,
    pub offset: usize,
    pub actual_size: usize,
}

/// Point-in-time counters for one shard.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardStats {
    pub bytes_allocated: usize,
    pub bytes_free: usize,
    pub free_block_count: usize,
    pub largest_free_block: usize,
    pub fragmentation_pct: usize,
}

pub struct FreeListAllocator {
    base: Address,
    capacity: usize,
    root: Address,
    /// Sentinel node address; `nil.color` is black, `nil.size` is 0, and its
    /// parent field doubles as scratch space during deletion.
    nil: Address,
    small: [Address; SMALL_CLASSES],
    allocated: usize,
    free_blocks: usize,
}

impl FreeListAllocator {
    /// Take ownership of `[base, base + size)` with one spanning free block.
    ///
    /// `base` must be aligned to [`QUANTUM`] and `size` must be a
    /// [`QUANTUM`] multiple of at least [`MIN_BLOCK_SIZE`] bytes.
    pub fn new(base: Address, size: usize) -> Self {
        assert!(base.is_aligned_to(QUANTUM));
        assert!(size % QUANTUM == 0 && size >= MIN_BLOCK_SIZE);
        let nil = Address::from(Box::into_raw(Box::new(FreeBlock {
            size: 0,
            parent: Address::ZERO,
            left: Address::ZERO,
            right: Address::ZERO,
            subtree_max: 0,
            color: Color::Black,
        })));
        {
            let sentinel = FreeBlock::at(nil);
            sentinel.parent = nil;
            sentinel.left = nil;
            sentinel.right = nil;
        }
        let mut alloc = Self {
            base,
            capacity: size,
            root: nil,
            nil,
            small: [Address::ZERO; SMALL_CLASSES],
            allocated: 0,
            free_blocks: 0,
        };
        alloc.insert_block(base, size);
        alloc
    }

    /// Reserve at least `req_size` bytes at the requested alignment.
    ///
    /// A zero request is promoted to one byte. The internal size is rounded
    /// up to the quantum and the alignment floored at the quantum.
    pub fn allocate(&mut self, req_size: usize, alignment: usize) -> Result<Allocation> {
        if !alignment.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment);
        }
        if req_size > self.capacity {
            return Err(ArenaError::OutOfMemory);
        }
        let size = Self::internal_size(req_size);
        let alignment = alignment.max(QUANTUM);

        if size <= SMALL_MAX && alignment <= QUANTUM {
            if let Some(addr) = self.pop_small(size) {
                self.allocated += size;
                return Ok(Allocation {
                    ptr: addr.as_mut_ptr(),
                    offset: addr - self.base,
                    actual_size: size,
                });
            }
        }

        let mut cur = self.find_first_fit(size);
        while !self.is_nil(cur) {
            let aligned = cur.align_up(alignment);
            let pre = aligned - cur;
            if FreeBlock::at(cur).size >= pre + size {
                return Ok(self.carve(cur, pre, size));
            }
            // Alignment padding did not fit; move on to the next block in
            // address order that is at least large enough for the data.
            cur = self.successor(cur);
            while !self.is_nil(cur) && FreeBlock::at(cur).size < size {
                cur = self.successor(cur);
            }
        }
        Err(ArenaError::OutOfMemory)
    }

    /// Return a block to the free pool.
    ///
    /// `size` must be the `actual_size` reported by the matching
    /// [`FreeListAllocator::allocate`] call. A null pointer is accepted and
    /// ignored.
    pub fn deallocate(&mut self, ptr: *mut u8, size: usize) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let addr = Address::from(ptr);
        if addr < self.base || addr >= self.base + self.capacity {
            return Err(ArenaError::BadPointer);
        }
        if !addr.is_aligned_to(QUANTUM) || size > self.capacity {
            return Err(ArenaError::BadPointer);
        }
        let size = Self::internal_size(size);
        if (addr - self.base) + size > self.capacity {
            return Err(ArenaError::BadPointer);
        }
        debug_assert!(self.allocated >= size);
        self.allocated -= size;

        if size <= SMALL_MAX {
            self.push_small(addr, size);
            return Ok(());
        }

        self.insert_block(addr, size);

        // Merge with the in-order successor first, then the predecessor.
        // The successor merge grows the freed node in place, so its upward
        // augmentation fix must run before the node can be folded into the
        // predecessor.
        let succ = self.successor(addr);
        if !self.is_nil(succ) && addr + FreeBlock::at(addr).size == succ {
            let grown = FreeBlock::at(succ).size;
            self.delete_node(succ);
            FreeBlock::at(addr).size += grown;
            self.fix_max_upward(addr);
            self.free_blocks -= 1;
        }
        let pred = self.predecessor(addr);
        if !self.is_nil(pred) && pred + FreeBlock::at(pred).size == addr {
            let grown = FreeBlock::at(addr).size;
            self.delete_node(addr);
            FreeBlock::at(pred).size += grown;
            self.fix_max_upward(pred);
            self.free_blocks -= 1;
        }
        Ok(())
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bytes_allocated(&self) -> usize {
        self.allocated
    }

    pub fn bytes_free(&self) -> usize {
        self.capacity - self.allocated
    }

    /// Free blocks across the tree and all small-class lists.
    pub fn free_block_count(&self) -> usize {
        self.free_blocks
    }

    /// Largest tree-managed free block, in O(1) via the root augmentation.
    pub fn largest_free_block(&self) -> usize {
        if self.is_nil(self.root) {
            0
        } else {
            FreeBlock::at(self.root).subtree_max
        }
    }

    /// `⌊100 · (1 − largest_free / bytes_free)⌋`, or 0 when nothing is free.
    pub fn fragmentation_pct(&self) -> usize {
        let total = self.bytes_free();
        if total == 0 {
            return 0;
        }
        (total - self.largest_free_block()) * 100 / total
    }

    pub fn stats(&self) -> ShardStats {
        ShardStats {
            bytes_allocated: self.bytes_allocated(),
            bytes_free: self.bytes_free(),
            free_block_count: self.free_block_count(),
            largest_free_block: self.largest_free_block(),
            fragmentation_pct: self.fragmentation_pct(),
        }
    }

    const fn internal_size(req: usize) -> usize {
        let req = if req == 0 { 1 } else { req };
        (req + QUANTUM - 1) & !(QUANTUM - 1)
    }

    const fn class_index(size: usize) -> usize {
        debug_assert!(size >= QUANTUM && size <= SMALL_MAX && size % QUANTUM == 0);
        size / QUANTUM - 1
    }

    fn is_nil(&self, addr: Address) -> bool {
        addr == self.nil
    }

    /// Reserve `size` bytes at `block + pre`, filing or absorbing the
    /// leftovers on both sides.
    fn carve(&mut self, block: Address, pre: usize, size: usize) -> Allocation {
        let total = FreeBlock::at(block).size;
        self.delete_node(block);
        self.free_blocks -= 1;

        let start = block + pre;
        let mut actual = size;
        if pre > 0 {
            debug_assert!(pre >= QUANTUM);
            self.file_free(block, pre);
        }
        let tail = total - pre - size;
        if tail >= QUANTUM {
            self.file_free(start + size, tail);
        } else {
            debug_assert!(tail == 0);
            actual += tail;
        }
        self.allocated += actual;
        Allocation {
            ptr: start.as_mut_ptr(),
            offset: start - self.base,
            actual_size: actual,
        }
    }

    fn file_free(&mut self, addr: Address, size: usize) {
        debug_assert!(size >= QUANTUM && size % QUANTUM == 0);
        if size <= SMALL_MAX {
            self.push_small(addr, size);
        } else {
            self.insert_block(addr, size);
        }
    }

    fn push_small(&mut self, addr: Address, size: usize) {
        let idx = Self::class_index(size);
        unsafe {
            addr.store(SmallNode {
                size,
                next: self.small[idx],
            });
        }
        self.small[idx] = addr;
        self.free_blocks += 1;
    }

    fn pop_small(&mut self, size: usize) -> Option<Address> {
        let idx = Self::class_index(size);
        let head = self.small[idx];
        if head.is_zero() {
            return None;
        }
        let node = unsafe { head.load::<SmallNode>() };
        debug_assert_eq!(node.size, size);
        self.small[idx] = node.next;
        self.free_blocks -= 1;
        Some(head)
    }

    /// Lowest-address tree block with `size >= request`, or nil.
    fn find_first_fit(&self, size: usize) -> Address {
        let nil = self.nil;
        let mut x = self.root;
        while x != nil {
            let b = FreeBlock::at(x);
            if b.left != nil && FreeBlock::at(b.left).subtree_max >= size {
                x = b.left;
            } else if b.size >= size {
                return x;
            } else if b.right != nil && FreeBlock::at(b.right).subtree_max >= size {
                x = b.right;
            } else {
                return nil;
            }
        }
        nil
    }

    fn insert_block(&mut self, addr: Address, size: usize) {
        debug_assert!(size >= MIN_BLOCK_SIZE);
        let nil = self.nil;
        unsafe {
            addr.store(FreeBlock {
                size,
                parent: nil,
                left: nil,
                right: nil,
                subtree_max: size,
                color: Color::Red,
            });
        }
        self.insert_node(addr);
        self.free_blocks += 1;
    }

    fn insert_node(&mut self, z: Address) {
        let nil = self.nil;
        let zsize = FreeBlock::at(z).size;
        let mut y = nil;
        let mut x = self.root;
        while x != nil {
            y = x;
            let b = FreeBlock::at(x);
            if b.subtree_max < zsize {
                b.subtree_max = zsize;
            }
            x = if z < x { b.left } else { b.right };
        }
        FreeBlock::at(z).parent = y;
        if y == nil {
            self.root = z;
        } else if z < y {
            FreeBlock::at(y).left = z;
        } else {
            FreeBlock::at(y).right = z;
        }
        self.insert_fixup(z);
    }

    fn insert_fixup(&mut self, mut z: Address) {
        while FreeBlock::at(FreeBlock::at(z).parent).color == Color::Red {
            let parent = FreeBlock::at(z).parent;
            let grand = FreeBlock::at(parent).parent;
            if parent == FreeBlock::at(grand).left {
                let uncle = FreeBlock::at(grand).right;
                if FreeBlock::at(uncle).color == Color::Red {
                    FreeBlock::at(parent).color = Color::Black;
                    FreeBlock::at(uncle).color = Color::Black;
                    FreeBlock::at(grand).color = Color::Red;
                    z = grand;
                } else {
                    if z == FreeBlock::at(parent).right {
                        z = parent;
                        self.rotate_left(z);
                    }
                    let parent = FreeBlock::at(z).parent;
                    let grand = FreeBlock::at(parent).parent;
                    FreeBlock::at(parent).color = Color::Black;
                    FreeBlock::at(grand).color = Color::Red;
                    self.rotate_right(grand);
                }
            } else {
                let uncle = FreeBlock::at(grand).left;
                if FreeBlock::at(uncle).color == Color::Red {
                    FreeBlock::at(parent).color = Color::Black;
                    FreeBlock::at(uncle).color = Color::Black;
                    FreeBlock::at(grand).color = Color::Red;
                    z = grand;
                } else {
                    if z == FreeBlock::at(parent).left {
                        z = parent;
                        self.rotate_right(z);
                    }
                    let parent = FreeBlock::at(z).parent;
                    let grand = FreeBlock::at(parent).parent;
                    FreeBlock::at(parent).color = Color::Black;
                    FreeBlock::at(grand).color = Color::Red;
                    self.rotate_left(grand);
                }
            }
        }
        FreeBlock::at(self.root).color = Color::Black;
    }

    fn rotate_left(&mut self, x: Address) {
        let nil = self.nil;
        let y = FreeBlock::at(x).right;
        debug_assert!(y != nil);
        FreeBlock::at(x).right = FreeBlock::at(y).left;
        if FreeBlock::at(y).left != nil {
            FreeBlock::at(FreeBlock::at(y).left).parent = x;
        }
        let xp = FreeBlock::at(x).parent;
        FreeBlock::at(y).parent = xp;
        if xp == nil {
            self.root = y;
        } else if x == FreeBlock::at(xp).left {
            FreeBlock::at(xp).left = y;
        } else {
            FreeBlock::at(xp).right = y;
        }
        FreeBlock::at(y).left = x;
        FreeBlock::at(x).parent = y;
        // x is now the child: refresh it before y folds it in.
        self.update_max(x);
        self.update_max(y);
    }

    fn rotate_right(&mut self, x: Address) {
        let nil = self.nil;
        let y = FreeBlock::at(x).left;
        debug_assert!(y != nil);
        FreeBlock::at(x).left = FreeBlock::at(y).right;
        if FreeBlock::at(y).right != nil {
            FreeBlock::at(FreeBlock::at(y).right).parent = x;
        }
        let xp = FreeBlock::at(x).parent;
        FreeBlock::at(y).parent = xp;
        if xp == nil {
            self.root = y;
        } else if x == FreeBlock::at(xp).right {
            FreeBlock::at(xp).right = y;
        } else {
            FreeBlock::at(xp).left = y;
        }
        FreeBlock::at(y).right = x;
        FreeBlock::at(x).parent = y;
        self.update_max(x);
        self.update_max(y);
    }

    fn transplant(&mut self, u: Address, v: Address) {
        let up = FreeBlock::at(u).parent;
        if up == self.nil {
            self.root = v;
        } else if u == FreeBlock::at(up).left {
            FreeBlock::at(up).left = v;
        } else {
            FreeBlock::at(up).right = v;
        }
        // Unconditional: the sentinel's parent is scratch for delete_fixup.
        FreeBlock::at(v).parent = up;
    }

    fn delete_node(&mut self, z: Address) {
        let nil = self.nil;
        let mut y = z;
        let mut y_color = FreeBlock::at(y).color;
        let x;
        let fix_from;
        if FreeBlock::at(z).left == nil {
            x = FreeBlock::at(z).right;
            fix_from = FreeBlock::at(z).parent;
            self.transplant(z, x);
        } else if FreeBlock::at(z).right == nil {
            x = FreeBlock::at(z).left;
            fix_from = FreeBlock::at(z).parent;
            self.transplant(z, x);
        } else {
            y = self.minimum(FreeBlock::at(z).right);
            y_color = FreeBlock::at(y).color;
            x = FreeBlock::at(y).right;
            if FreeBlock::at(y).parent == z {
                FreeBlock::at(x).parent = y;
                fix_from = y;
            } else {
                fix_from = FreeBlock::at(y).parent;
                self.transplant(y, FreeBlock::at(y).right);
                FreeBlock::at(y).right = FreeBlock::at(z).right;
                FreeBlock::at(FreeBlock::at(y).right).parent = y;
            }
            self.transplant(z, y);
            FreeBlock::at(y).left = FreeBlock::at(z).left;
            FreeBlock::at(FreeBlock::at(y).left).parent = y;
            FreeBlock::at(y).color = FreeBlock::at(z).color;
            self.update_max(y);
        }
        self.fix_max_upward(fix_from);
        if y_color == Color::Black {
            self.delete_fixup(x);
        }
    }

    fn delete_fixup(&mut self, mut x: Address) {
        while x != self.root && FreeBlock::at(x).color == Color::Black {
            let parent = FreeBlock::at(x).parent;
            if x == FreeBlock::at(parent).left {
                let mut w = FreeBlock::at(parent).right;
                if FreeBlock::at(w).color == Color::Red {
                    FreeBlock::at(w).color = Color::Black;
                    FreeBlock::at(parent).color = Color::Red;
                    self.rotate_left(parent);
                    w = FreeBlock::at(parent).right;
                }
                if FreeBlock::at(FreeBlock::at(w).left).color == Color::Black
                    && FreeBlock::at(FreeBlock::at(w).right).color == Color::Black
                {
                    FreeBlock::at(w).color = Color::Red;
                    x = parent;
                } else {
                    if FreeBlock::at(FreeBlock::at(w).right).color == Color::Black {
                        FreeBlock::at(FreeBlock::at(w).left).color = Color::Black;
                        FreeBlock::at(w).color = Color::Red;
                        self.rotate_right(w);
                        w = FreeBlock::at(parent).right;
                    }
                    FreeBlock::at(w).color = FreeBlock::at(parent).color;
                    FreeBlock::at(parent).color = Color::Black;
                    FreeBlock::at(FreeBlock::at(w).right).color = Color::Black;
                    self.rotate_left(parent);
                    x = self.root;
                }
            } else {
                let mut w = FreeBlock::at(parent).left;
                if FreeBlock::at(w).color == Color::Red {
                    FreeBlock::at(w).color = Color::Black;
                    FreeBlock::at(parent).color = Color::Red;
                    self.rotate_right(parent);
                    w = FreeBlock::at(parent).left;
                }
                if FreeBlock::at(FreeBlock::at(w).right).color == Color::Black
                    && FreeBlock::at(FreeBlock::at(w).left).color == Color::Black
                {
                    FreeBlock::at(w).color = Color::Red;
                    x = parent;
                } else {
                    if FreeBlock::at(FreeBlock::at(w).left).color == Color::Black {
                        FreeBlock::at(FreeBlock::at(w).right).color = Color::Black;
                        FreeBlock::at(w).color = Color::Red;
                        self.rotate_left(w);
                        w = FreeBlock::at(parent).left;
                    }
                    FreeBlock::at(w).color = FreeBlock::at(parent).color;
                    FreeBlock::at(parent).color = Color::Black;
                    FreeBlock::at(FreeBlock::at(w).left).color = Color::Black;
                    self.rotate_right(parent);
                    x = self.root;
                }
            }
        }
        FreeBlock::at(x).color = Color::Black;
    }

    fn minimum(&self, mut x: Address) -> Address {
        while FreeBlock::at(x).left != self.nil {
            x = FreeBlock::at(x).left;
        }
        x
    }

    fn maximum(&self, mut x: Address) -> Address {
        while FreeBlock::at(x).right != self.nil {
            x = FreeBlock::at(x).right;
        }
        x
    }

    fn successor(&self, x: Address) -> Address {
        if FreeBlock::at(x).right != self.nil {
            return self.minimum(FreeBlock::at(x).right);
        }
        let mut x = x;
        let mut y = FreeBlock::at(x).parent;
        while y != self.nil && x == FreeBlock::at(y).right {
            x = y;
            y = FreeBlock::at(y).parent;
        }
        y
    }

    fn predecessor(&self, x: Address) -> Address {
        if FreeBlock::at(x).left != self.nil {
            return self.maximum(FreeBlock::at(x).left);
        }
        let mut x = x;
        let mut y = FreeBlock::at(x).parent;
        while y != self.nil && x == FreeBlock::at(y).left {
            x = y;
            y = FreeBlock::at(y).parent;
        }
        y
    }

    fn update_max(&mut self, x: Address) {
        if x == self.nil {
            return;
        }
        let b = FreeBlock::at(x);
        // nil.subtree_max stays 0, so both children fold in unconditionally.
        b.subtree_max = b
            .size
            .max(FreeBlock::at(b.left).subtree_max)
            .max(FreeBlock::at(b.right).subtree_max);
    }

    fn fix_max_upward(&mut self, mut x: Address) {
        while x != self.nil {
            self.update_max(x);
            x = FreeBlock::at(x).parent;
        }
    }
}

impl Drop for FreeListAllocator {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(self.nil.as_mut_ptr::<FreeBlock>()));
        }
    }
}

impl std::fmt::Debug for FreeListAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeListAllocator")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated)
            .field("free_blocks", &self.free_blocks)
            .finish()
    }
}
