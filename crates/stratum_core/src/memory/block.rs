//! # Block Pool
//!
//! Fixed-size, aligned memory blocks backing chunks, and a free-list pool
//! that recycles them. A block is allocated once and reused by every chunk
//! that later needs the same `(size, alignment)`, so steady-state structural
//! churn performs no heap allocation.

// SAFETY: This module owns raw aligned allocations.
// Every pointer handed out stays valid for the lifetime of its `Block`.
#![allow(unsafe_code)]

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;

/// Minimum alignment of every block (one cache line).
pub const BLOCK_ALIGN: usize = 64;

/// One zero-initialized, aligned heap block.
pub struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: Block exclusively owns its allocation; access is coordinated by
// the chunk that holds it.
unsafe impl Send for Block {}
// SAFETY: See above. Shared references only expose raw pointers.
unsafe impl Sync for Block {}

impl Block {
    /// Allocates a zeroed block.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or `align` is not a power of two. Aborts via
    /// [`handle_alloc_error`] when the allocator fails.
    #[must_use]
    pub fn new(size: usize, align: usize) -> Self {
        assert!(size > 0, "block size must be greater than zero");
        let layout = match Layout::from_size_align(size, align.max(BLOCK_ALIGN)) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid block layout: size {size}, align {align}"),
        };
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };
        Self { ptr, layout }
    }

    /// Block size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Block alignment in bytes.
    #[inline]
    #[must_use]
    pub fn align(&self) -> usize {
        self.layout.align()
    }

    /// Base pointer of the block.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Zeroes the whole block.
    pub fn zero(&mut self) {
        // SAFETY: the block is valid for `size` bytes and we hold `&mut self`.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.layout.size()) };
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Free list of released blocks, keyed by `(size, align)`.
///
/// # Thread Safety
///
/// Not thread-safe. The pool lives inside the store and is only touched
/// during structural changes.
#[derive(Debug, Default)]
pub struct BlockPool {
    free: HashMap<(usize, usize), Vec<Block>>,
    allocated: usize,
    recycled: usize,
}

impl BlockPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a zeroed block, reusing a released one when available.
    pub fn acquire(&mut self, size: usize, align: usize) -> Block {
        let key = (size, align.max(BLOCK_ALIGN));
        if let Some(mut block) = self.free.get_mut(&key).and_then(Vec::pop) {
            block.zero();
            self.recycled += 1;
            return block;
        }
        self.allocated += 1;
        Block::new(key.0, key.1)
    }

    /// Returns a block to the free list.
    pub fn release(&mut self, block: Block) {
        self.free
            .entry((block.size(), block.align()))
            .or_default()
            .push(block);
    }

    /// Number of blocks waiting for reuse.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// Number of fresh heap allocations performed.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Number of acquisitions served from the free list.
    #[must_use]
    pub fn recycled(&self) -> usize {
        self.recycled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_is_zeroed_and_aligned() {
        let block = Block::new(256, 16);
        assert_eq!(block.as_ptr() as usize % BLOCK_ALIGN, 0);
        // SAFETY: block is valid for 256 bytes.
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pool_recycles_blocks() {
        let mut pool = BlockPool::new();
        let block = pool.acquire(1024, 8);
        // SAFETY: block is valid for 1024 bytes.
        unsafe { block.as_ptr().write(0xAB) };
        let ptr = block.as_ptr();
        pool.release(block);
        assert_eq!(pool.pooled(), 1);

        let again = pool.acquire(1024, 8);
        assert_eq!(again.as_ptr(), ptr);
        // SAFETY: block is valid for 1024 bytes.
        assert_eq!(unsafe { again.as_ptr().read() }, 0);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.recycled(), 1);
    }

    #[test]
    fn test_pool_keys_by_size() {
        let mut pool = BlockPool::new();
        let small = pool.acquire(512, 8);
        pool.release(small);
        let large = pool.acquire(1024, 8);
        assert_eq!(large.size(), 1024);
        assert_eq!(pool.pooled(), 1);
        assert_eq!(pool.allocated(), 2);
    }
}
