//! Size-class dispatch over the arena table

use super::arena::{ArenaStats, SlotArena};
use super::block::{BlockSource, SystemSource};
use super::size_class::{
    class_index, slot_size, CLASS_COUNT, DEFAULT_BLOCK_SIZE, FALLBACK_ALIGN, MAX_POOLED_SIZE,
};
use crate::error::{Error, Result};
use lazy_static::lazy_static;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::info;

/// Segregated-storage pool: one [`SlotArena`] per size class, plus a
/// fallback path through the general-purpose allocator for anything larger
/// than [`MAX_POOLED_SIZE`].
///
/// A pool is an explicitly owned value; share it by reference (or `Arc`)
/// between threads, or use the process-wide instance behind [`shared`].
pub struct SlabPool {
    /// Exactly [`CLASS_COUNT`] arenas, index = class.
    arenas: Vec<SlotArena>,
    block_size: usize,
}

impl SlabPool {
    /// Create a pool with the default block size.
    pub fn new() -> Self {
        // The default geometry is statically valid for every class.
        Self::build(DEFAULT_BLOCK_SIZE, Arc::new(SystemSource))
    }

    /// Create a pool whose arenas grow in blocks of `block_size` bytes.
    ///
    /// Fails with [`Error::Config`] when a block could not hold even one
    /// slot of the largest class.
    pub fn with_block_size(block_size: usize) -> Result<Self> {
        Self::validate(block_size)?;
        Ok(Self::build(block_size, Arc::new(SystemSource)))
    }

    /// Create a pool drawing all block memory from a custom source.
    pub fn with_source(block_size: usize, source: Arc<dyn BlockSource>) -> Result<Self> {
        Self::validate(block_size)?;
        Ok(Self::build(block_size, source))
    }

    fn validate(block_size: usize) -> Result<()> {
        // The largest class is the binding constraint; FALLBACK_ALIGN is
        // the worst-case padding of its first slot.
        if block_size < MAX_POOLED_SIZE + FALLBACK_ALIGN {
            return Err(Error::Config(format!(
                "Block size {} cannot hold a {} byte slot",
                block_size, MAX_POOLED_SIZE
            )));
        }
        Ok(())
    }

    fn build(block_size: usize, source: Arc<dyn BlockSource>) -> Self {
        let arenas = (0..CLASS_COUNT)
            .map(|class| SlotArena::for_class(slot_size(class), block_size, Arc::clone(&source)))
            .collect();
        info!(
            classes = CLASS_COUNT,
            block_size, "initialized segregated pool"
        );
        Self { arenas, block_size }
    }

    /// Obtain `size` bytes of storage.
    ///
    /// Returns `Ok(None)` for a zero-size request without touching any
    /// arena. Requests up to [`MAX_POOLED_SIZE`] come from the owning
    /// arena; larger ones from the general-purpose allocator.
    pub fn acquire(&self, size: usize) -> Result<Option<NonNull<u8>>> {
        if size == 0 {
            return Ok(None);
        }
        match class_index(size) {
            Some(class) => self.arenas[class].allocate().map(Some),
            None => fallback_acquire(oversize_layout(size)?).map(Some),
        }
    }

    /// Return storage obtained from [`acquire`](Self::acquire).
    ///
    /// `None` is a defined no-op, as is a zero `size`.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `acquire` on this pool with this exact
    /// `size`, and must not be used or released again afterwards. A
    /// mismatched size routes the slot to the wrong arena; that is
    /// undefined behavior, not a detected error.
    pub unsafe fn release(&self, ptr: Option<NonNull<u8>>, size: usize) {
        let Some(ptr) = ptr else { return };
        if size == 0 {
            return;
        }
        match class_index(size) {
            Some(class) => unsafe { self.arenas[class].deallocate(ptr) },
            None => {
                // Mirrors the acquire-side layout; from_size_align succeeded there.
                if let Ok(layout) = Layout::from_size_align(size, FALLBACK_ALIGN) {
                    unsafe { fallback_release(ptr, layout) }
                }
            }
        }
    }

    /// Block size used by every arena in this pool.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn class_arena(&self, class: usize) -> &SlotArena {
        &self.arenas[class]
    }

    /// Per-class counters for correctness verification.
    pub fn stats(&self) -> PoolStats {
        let classes: Vec<ArenaStats> = self.arenas.iter().map(SlotArena::stats).collect();
        PoolStats {
            block_size: self.block_size,
            classes,
        }
    }
}

impl Default for SlabPool {
    fn default() -> Self {
        Self::new()
    }
}

fn oversize_layout(size: usize) -> Result<Layout> {
    Layout::from_size_align(size, FALLBACK_ALIGN)
        .map_err(|e| Error::Config(format!("Bad oversize layout ({size} bytes): {e}")))
}

/// General-purpose allocation for requests the pool does not serve.
pub(crate) fn fallback_acquire(layout: Layout) -> Result<NonNull<u8>> {
    // Non-zero size: zero-size requests never reach the fallback.
    let ptr = unsafe { alloc::alloc(layout) };
    NonNull::new(ptr)
        .ok_or_else(|| Error::OutOfMemory(format!("general allocator refused {} bytes", layout.size())))
}

/// # Safety
///
/// `ptr` must have come from [`fallback_acquire`] with the same layout.
pub(crate) unsafe fn fallback_release(ptr: NonNull<u8>, layout: Layout) {
    unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
}

/// Aggregated counters for a whole pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub classes: Vec<ArenaStats>,
}

impl PoolStats {
    /// Blocks held across all arenas.
    pub fn total_blocks(&self) -> u64 {
        self.classes.iter().map(|c| c.blocks).sum()
    }

    /// Slots currently held by callers across all arenas.
    pub fn total_live(&self) -> u64 {
        self.classes.iter().map(|c| c.live()).sum()
    }
}

lazy_static! {
    static ref SHARED: SlabPool = SlabPool::new();
}

/// Process-wide pool behind a single lazy-initialization guard.
///
/// Prefer an explicitly owned [`SlabPool`] passed to the code that needs
/// it; this instance exists for callers that genuinely want one pool for
/// the whole process.
pub fn shared() -> &'static SlabPool {
    &SHARED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_routes_to_owning_class() {
        let pool = SlabPool::new();

        let ptr = pool.acquire(100).unwrap();
        assert!(ptr.is_some());

        // 100 bytes -> class 12 (slot size 104)
        let stats = pool.stats();
        assert_eq!(stats.classes[12].served, 1);
        assert_eq!(stats.classes[12].slot_size, 104);
        assert!(stats.classes.iter().enumerate().all(|(i, c)| i == 12 || c.served == 0));

        unsafe { pool.release(ptr, 100) };
        assert_eq!(pool.stats().classes[12].reclaimed, 1);
    }

    #[test]
    fn test_zero_size_acquire_is_null_and_mutates_nothing() {
        let pool = SlabPool::new();
        let before = pool.stats();

        assert!(pool.acquire(0).unwrap().is_none());

        assert_eq!(pool.stats(), before);
    }

    #[test]
    fn test_release_of_none_is_noop() {
        let pool = SlabPool::new();
        unsafe { pool.release(None, 64) };
        assert_eq!(pool.stats().total_live(), 0);
    }

    #[test]
    fn test_lifo_reuse_through_the_pool() {
        let pool = SlabPool::new();

        let a = pool.acquire(48).unwrap().unwrap();
        unsafe { pool.release(Some(a), 48) };
        let b = pool.acquire(48).unwrap().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_oversize_bypasses_every_arena() {
        let pool = SlabPool::new();

        let ptr = pool.acquire(513).unwrap().unwrap();
        assert_eq!(ptr.as_ptr() as usize % FALLBACK_ALIGN, 0);

        // Storage is writable across its full extent
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 513) };
        assert_eq!(unsafe { *ptr.as_ptr().add(512) }, 0xAB);

        assert_eq!(pool.stats().total_blocks(), 0);
        unsafe { pool.release(Some(ptr), 513) };
    }

    #[test]
    fn test_custom_block_size_is_validated() {
        assert!(SlabPool::with_block_size(256).is_err());
        assert!(SlabPool::with_block_size(1024).is_ok());
    }

    #[test]
    fn test_shared_pool_is_one_instance() {
        let a = shared() as *const SlabPool;
        let b = shared() as *const SlabPool;
        assert_eq!(a, b);
    }

    #[test]
    fn test_boundary_sizes_round_trip() {
        let pool = SlabPool::new();
        for size in [1usize, 8, 9, 64, 511, 512, 513, 4096] {
            let ptr = pool.acquire(size).unwrap().unwrap();
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x5A, size) };
            unsafe { pool.release(Some(ptr), size) };
        }
        assert_eq!(pool.stats().total_live(), 0);
    }
}
