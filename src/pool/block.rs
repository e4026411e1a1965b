//! Fixed-size memory blocks and the source they are requested from

use crate::error::{Error, Result};
use crate::pool::size_class::align_up;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// Raw block memory provider.
///
/// The pool depends on the operating system only through this seam: one
/// operation to request a block and one to release it. Tests substitute a
/// counting implementation to audit that every requested block is released
/// exactly once.
pub trait BlockSource: Send + Sync {
    /// Request a block of memory for the given layout.
    fn request(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Release a block previously obtained from `request`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `request` on this source with the
    /// same `layout`, and must be released at most once.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Default source backed by the global allocator.
#[derive(Default)]
pub struct SystemSource;

impl BlockSource for SystemSource {
    fn request(&self, layout: Layout) -> Result<NonNull<u8>> {
        // Layout size is non-zero: arenas refuse degenerate block sizes at
        // construction.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            Error::OutOfMemory(format!("block request for {} bytes failed", layout.size()))
        })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// One contiguous buffer carved into same-size slots.
///
/// Blocks form a singly linked chain through `prev`, newest first, anchored
/// at the owning arena. The chain link is a struct field rather than a word
/// inside the buffer, so the entire buffer is slot storage.
pub(crate) struct Block {
    data: NonNull<u8>,
    layout: Layout,
    source: Arc<dyn BlockSource>,
    pub(crate) prev: Option<Box<Block>>,
}

impl Block {
    /// Request a fresh, unlinked block from `source`.
    pub(crate) fn request(
        size: usize,
        align: usize,
        source: &Arc<dyn BlockSource>,
    ) -> Result<Box<Block>> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| Error::Config(format!("Bad block layout ({size}x{align}): {e}")))?;
        let data = source.request(layout)?;
        Ok(Box::new(Block {
            data,
            layout,
            source: Arc::clone(source),
            prev: None,
        }))
    }

    /// Offset of the first slot whose address satisfies `align`.
    ///
    /// Computed once per block. The buffer itself is requested at the class
    /// alignment, so the padding is zero in practice, but it is derived from
    /// the actual address rather than assumed.
    pub(crate) fn first_slot_offset(&self, align: usize) -> usize {
        let base = self.data.as_ptr() as usize;
        align_up(base, align) - base
    }

    /// Address of the slot starting `offset` bytes into the buffer.
    pub(crate) fn slot_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.layout.size());
        // In-bounds by the cursor/sentinel discipline of the arena.
        unsafe { NonNull::new_unchecked(self.data.as_ptr().add(offset)) }
    }

    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // The buffer came from `source.request` with `self.layout` and this
        // is its single owner.
        unsafe { self.source.release(self.data, self.layout) };
    }
}

// A block exclusively owns its buffer; slot handout and aliasing discipline
// are enforced by the arena on top.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_and_carve() {
        let source: Arc<dyn BlockSource> = Arc::new(SystemSource);
        let block = Block::request(4096, 8, &source).unwrap();

        assert_eq!(block.size(), 4096);
        let first = block.first_slot_offset(8);
        assert_eq!(first % 8, 0);
        assert_eq!(block.slot_at(first).as_ptr() as usize % 8, 0);
    }

    #[test]
    fn test_first_slot_is_aligned_for_every_class_alignment() {
        let source: Arc<dyn BlockSource> = Arc::new(SystemSource);
        for align in [8usize, 16] {
            let block = Block::request(4096, align, &source).unwrap();
            let first = block.first_slot_offset(align);
            assert_eq!((block.slot_at(first).as_ptr() as usize) % align, 0);
        }
    }

    #[test]
    fn test_chain_links_newest_first() {
        let source: Arc<dyn BlockSource> = Arc::new(SystemSource);
        let oldest = Block::request(256, 8, &source).unwrap();
        let mut newest = Block::request(256, 8, &source).unwrap();
        newest.prev = Some(oldest);

        assert!(newest.prev.is_some());
        assert!(newest.prev.as_ref().unwrap().prev.is_none());
    }
}
