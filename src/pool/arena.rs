//! Per-size-class slot arena
//!
//! Each arena owns a chain of fixed-size blocks and serves same-size slots
//! out of them: reclaimed slots come back off the free list first, then the
//! bump cursor carves never-used slots from the newest block, and only when
//! both are exhausted does the arena request one more block.

use super::block::{Block, BlockSource, SystemSource};
use super::free_list::FreeList;
use super::size_class::{natural_align, SLOT_UNIT};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Fixed-size slot allocator over a chain of bump-allocated blocks.
///
/// Thread-safe: any number of threads may call [`allocate`](Self::allocate)
/// and [`deallocate`](Self::deallocate) concurrently. The free list and the
/// block chain are separate shared structures, and each is guarded by its
/// own mutex; neither critical section does more than pointer-sized work
/// plus, at most, one block request.
pub struct SlotArena {
    slot_size: usize,
    slot_align: usize,
    block_size: usize,
    source: Arc<dyn BlockSource>,
    /// Block chain, bump cursor and sentinel. One lock serializes growth
    /// with cursor advancement so no two threads carve overlapping slots.
    core: Mutex<ArenaCore>,
    /// Reclaimed slots. Its own lock: push/pop mutate a shared head and
    /// must not ride on the growth lock.
    free: Mutex<FreeList>,
    served: AtomicU64,
    recycled: AtomicU64,
    reclaimed: AtomicU64,
}

struct ArenaCore {
    /// Newest block; older blocks hang off its `prev` chain.
    head: Option<Box<Block>>,
    /// Byte offset of the next never-used slot in `head`.
    cursor: usize,
    /// First offset at which a slot no longer fits (one past the last
    /// usable slot).
    end: usize,
    blocks: u64,
}

impl ArenaCore {
    /// Carve the slot at the cursor, or `None` when the block is exhausted
    /// (or no block exists yet).
    fn bump(&mut self, slot_size: usize) -> Option<NonNull<u8>> {
        let block = self.head.as_ref()?;
        if self.cursor + slot_size > self.end {
            return None;
        }
        let slot = block.slot_at(self.cursor);
        self.cursor += slot_size;
        Some(slot)
    }
}

impl Drop for ArenaCore {
    fn drop(&mut self) {
        // Unlink iteratively so a long chain cannot recurse through Box drop.
        let mut next = self.head.take();
        while let Some(mut block) = next {
            next = block.prev.take();
        }
    }
}

impl SlotArena {
    /// Create an arena backed by the global allocator.
    ///
    /// # Arguments
    /// * `slot_size` - Size of every slot in bytes; must be a multiple of
    ///   the 8-byte slot unit so a free slot can hold its list link.
    /// * `block_size` - Size of each block requested on growth.
    pub fn new(slot_size: usize, block_size: usize) -> Result<Self> {
        Self::with_source(slot_size, block_size, Arc::new(SystemSource))
    }

    /// Create an arena drawing its blocks from a custom [`BlockSource`].
    pub fn with_source(
        slot_size: usize,
        block_size: usize,
        source: Arc<dyn BlockSource>,
    ) -> Result<Self> {
        if slot_size < SLOT_UNIT || slot_size % SLOT_UNIT != 0 {
            return Err(Error::Config(format!(
                "Slot size {} is not a positive multiple of {}",
                slot_size, SLOT_UNIT
            )));
        }
        let slot_align = natural_align(slot_size);
        // One aligned slot must fit even in the worst padding case.
        if block_size < slot_size + slot_align {
            return Err(Error::Config(format!(
                "Block size {} cannot hold a single {} byte slot",
                block_size, slot_size
            )));
        }
        Ok(Self::build(slot_size, slot_align, block_size, source))
    }

    /// Trusted constructor for the pool's class table; the pool validates
    /// the shared block size once for its largest class.
    pub(crate) fn for_class(
        slot_size: usize,
        block_size: usize,
        source: Arc<dyn BlockSource>,
    ) -> Self {
        debug_assert!(slot_size >= SLOT_UNIT && slot_size % SLOT_UNIT == 0);
        debug_assert!(block_size >= slot_size + natural_align(slot_size));
        Self::build(slot_size, natural_align(slot_size), block_size, source)
    }

    fn build(
        slot_size: usize,
        slot_align: usize,
        block_size: usize,
        source: Arc<dyn BlockSource>,
    ) -> Self {
        Self {
            slot_size,
            slot_align,
            block_size,
            source,
            core: Mutex::new(ArenaCore {
                head: None,
                cursor: 0,
                end: 0,
                blocks: 0,
            }),
            free: Mutex::new(FreeList::new()),
            served: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Return a slot-sized, slot-aligned memory region.
    ///
    /// Reclaimed slots are reused (LIFO) before the bump cursor advances,
    /// and the cursor is exhausted before a new block is requested. A block
    /// request failure surfaces as [`Error::OutOfMemory`] and is not
    /// retried.
    pub fn allocate(&self) -> Result<NonNull<u8>> {
        if let Some(slot) = self.free.lock().pop() {
            self.recycled.fetch_add(1, Ordering::Relaxed);
            self.served.fetch_add(1, Ordering::Relaxed);
            return Ok(slot);
        }

        let mut core = self.core.lock();
        let slot = match core.bump(self.slot_size) {
            Some(slot) => slot,
            None => {
                self.grow(&mut core)?;
                // A fresh block always fits at least one slot (checked at
                // construction), so a second miss is a real failure.
                core.bump(self.slot_size).ok_or_else(|| {
                    Error::OutOfMemory(format!(
                        "Fresh {} byte block cannot hold a {} byte slot",
                        self.block_size, self.slot_size
                    ))
                })?
            }
        };
        drop(core);

        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(slot)
    }

    /// Push a slot back onto the free list for reuse.
    ///
    /// # Safety
    ///
    /// `slot` must have been returned by [`allocate`](Self::allocate) on
    /// this arena, must not be referenced anywhere after this call, and must
    /// not be deallocated twice. None of this is validated; violating it is
    /// undefined behavior, not a reported error.
    pub unsafe fn deallocate(&self, slot: NonNull<u8>) {
        unsafe { self.free.lock().push(slot) };
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    /// Append one block to the chain and reset cursor and sentinel.
    fn grow(&self, core: &mut ArenaCore) -> Result<()> {
        let mut block = Block::request(self.block_size, self.slot_align, &self.source)?;
        block.prev = core.head.take();

        let first = block.first_slot_offset(self.slot_align);
        let usable = block.size() - first;
        core.cursor = first;
        core.end = first + (usable / self.slot_size) * self.slot_size;
        core.head = Some(block);
        core.blocks += 1;

        debug!(
            slot_size = self.slot_size,
            blocks = core.blocks,
            "requested a new block"
        );
        Ok(())
    }

    /// Slot size served by this arena.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Block size requested on growth.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Slots an aligned block can hold.
    pub fn slots_per_block(&self) -> usize {
        self.block_size / self.slot_size
    }

    /// Counters for correctness verification.
    pub fn stats(&self) -> ArenaStats {
        let blocks = self.core.lock().blocks;
        ArenaStats {
            slot_size: self.slot_size,
            blocks,
            served: self.served.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Allocation counters for one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub slot_size: usize,
    /// Blocks in the chain.
    pub blocks: u64,
    /// Slots handed out, from either path.
    pub served: u64,
    /// Slots handed out from the free list.
    pub recycled: u64,
    /// Slots pushed back to the free list.
    pub reclaimed: u64,
}

impl ArenaStats {
    /// Slots currently held by callers.
    pub fn live(&self) -> u64 {
        self.served - self.reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_lifo_reuse_precedes_growth() {
        let arena = SlotArena::new(64, 4096).unwrap();

        let a = arena.allocate().unwrap();
        unsafe { arena.deallocate(a) };
        let b = arena.allocate().unwrap();

        // The just-released slot is the next one served
        assert_eq!(a, b);

        let stats = arena.stats();
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.blocks, 1);
    }

    #[test]
    fn test_block_count_matches_growth_formula() {
        let arena = SlotArena::new(64, 4096).unwrap();
        let per_block = arena.slots_per_block();
        assert_eq!(per_block, 64);

        let mut held = Vec::new();
        for n in 1..=(3 * per_block) {
            held.push(arena.allocate().unwrap());
            let expected = (n + per_block - 1) / per_block;
            assert_eq!(arena.stats().blocks, expected as u64, "after {} slots", n);
        }
    }

    #[test]
    fn test_growth_only_on_double_exhaustion() {
        // Small block: 4 slots of 64 bytes
        let arena = SlotArena::new(64, 256).unwrap();
        let mut held: Vec<_> = (0..4).map(|_| arena.allocate().unwrap()).collect();
        assert_eq!(arena.stats().blocks, 1);

        // A reclaimed slot keeps the next allocation off the growth path
        let slot = held.pop().unwrap();
        unsafe { arena.deallocate(slot) };
        held.push(arena.allocate().unwrap());
        assert_eq!(arena.stats().blocks, 1);

        // Free list and block both exhausted: now it grows
        held.push(arena.allocate().unwrap());
        assert_eq!(arena.stats().blocks, 2);
    }

    #[test]
    fn test_slots_are_distinct_and_aligned() {
        let arena = SlotArena::new(24, 4096).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let slot = arena.allocate().unwrap();
            assert_eq!(slot.as_ptr() as usize % natural_align(24), 0);
            assert!(seen.insert(slot.as_ptr() as usize), "slot served twice");
        }
    }

    #[test]
    fn test_slot_addresses_stride_by_slot_size() {
        let arena = SlotArena::new(32, 4096).unwrap();
        let first = arena.allocate().unwrap().as_ptr() as usize;
        let second = arena.allocate().unwrap().as_ptr() as usize;
        assert_eq!(second - first, 32);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(SlotArena::new(0, 4096).is_err());
        assert!(SlotArena::new(12, 4096).is_err());
        assert!(SlotArena::new(512, 256).is_err());
    }

    #[test]
    fn test_free_then_bulk_reuse_order() {
        let arena = SlotArena::new(16, 4096).unwrap();
        let slots: Vec<_> = (0..8).map(|_| arena.allocate().unwrap()).collect();
        for slot in &slots {
            unsafe { arena.deallocate(*slot) };
        }
        // Strict LIFO: reuse runs in reverse release order
        for expected in slots.iter().rev() {
            assert_eq!(arena.allocate().unwrap(), *expected);
        }
    }
}
