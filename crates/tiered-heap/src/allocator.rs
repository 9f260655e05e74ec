//! A common allocate/free interface over the three heap kinds.
//!
//! Code that only needs "give me `size` bytes" and "take this block back" can
//! be written against [`HeapAllocator`] and handed any heap through one of the
//! adapters below. The adapters borrow the heap, so the heap cannot be
//! destroyed while an adapter is alive.

use core::ptr::NonNull;

use crate::{
    ExpHeap, FrameHeap, UnitHeap,
    common::{DEFAULT_ALIGNMENT, alignment_magnitude},
};

/// Allocates and frees blocks without caring which heap serves them.
pub trait HeapAllocator {
    /// Allocates a block of at least `size` bytes.
    ///
    /// Returns `None` if the underlying heap cannot satisfy the request.
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Releases a block returned by [`alloc`](Self::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `alloc` on this allocator and not been
    /// freed since.
    unsafe fn free(&mut self, ptr: NonNull<u8>);
}

/// Serves requests from an [`ExpHeap`] with a fixed alignment.
#[derive(Debug)]
pub struct ExpHeapAllocator<'a> {
    heap: &'a mut ExpHeap,
    alignment: i32,
}

impl<'a> ExpHeapAllocator<'a> {
    /// Binds `heap` with `alignment`, whose sign selects the allocation
    /// direction as in [`ExpHeap::allocate`].
    ///
    /// # Panics
    ///
    /// Panics if `|alignment|` is not one of 4, 8, 16 or 32.
    #[must_use]
    pub fn new(heap: &'a mut ExpHeap, alignment: i32) -> Self {
        alignment_magnitude(alignment);
        Self { heap, alignment }
    }

    /// Binds `heap` with [`DEFAULT_ALIGNMENT`].
    #[must_use]
    pub fn with_default_alignment(heap: &'a mut ExpHeap) -> Self {
        Self::new(heap, DEFAULT_ALIGNMENT)
    }
}

impl HeapAllocator for ExpHeapAllocator<'_> {
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.heap.allocate(size, self.alignment)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { self.heap.free(ptr) }
    }
}

/// Serves requests from a [`FrameHeap`] with a fixed alignment.
///
/// Frame heap blocks cannot be released one by one, so [`free`] does nothing.
/// Release memory through [`FrameHeap::free`] or [`FrameHeap::restore_state`]
/// once the adapter is gone.
///
/// [`free`]: HeapAllocator::free
#[derive(Debug)]
pub struct FrameHeapAllocator<'a> {
    heap: &'a mut FrameHeap,
    alignment: i32,
}

impl<'a> FrameHeapAllocator<'a> {
    /// Binds `heap` with `alignment`, whose sign selects the head or the tail
    /// as in [`FrameHeap::allocate`].
    ///
    /// # Panics
    ///
    /// Panics if `|alignment|` is not one of 4, 8, 16 or 32.
    #[must_use]
    pub fn new(heap: &'a mut FrameHeap, alignment: i32) -> Self {
        alignment_magnitude(alignment);
        Self { heap, alignment }
    }
}

impl HeapAllocator for FrameHeapAllocator<'_> {
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.heap.allocate(size, self.alignment)
    }

    unsafe fn free(&mut self, _ptr: NonNull<u8>) {}
}

/// Serves requests from a [`UnitHeap`].
///
/// Requests larger than the block size fail.
#[derive(Debug)]
pub struct UnitHeapAllocator<'a> {
    heap: &'a mut UnitHeap,
}

impl<'a> UnitHeapAllocator<'a> {
    #[must_use]
    pub fn new(heap: &'a mut UnitHeap) -> Self {
        Self { heap }
    }
}

impl HeapAllocator for UnitHeapAllocator<'_> {
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size > self.heap.block_size() {
            return None;
        }
        self.heap.allocate()
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { self.heap.free(ptr) }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::{CheckFlags, FrameFreeMode, HeapOptions, HeapRegistry, testing::with_test_span};

    /// Allocates up to `count` blocks of `size` bytes and checks that they
    /// do not overlap.
    fn allocate_blocks(
        allocator: &mut dyn HeapAllocator,
        size: usize,
        count: usize,
    ) -> Vec<NonNull<u8>> {
        let mut blocks = Vec::new();
        while blocks.len() < count {
            let Some(block) = allocator.alloc(size) else {
                break;
            };
            unsafe {
                block.as_ptr().write_bytes(0x5A, size);
            }
            blocks.push(block);
        }
        let mut addrs = blocks.iter().map(|block| block.addr().get()).collect::<Vec<_>>();
        addrs.sort_unstable();
        for pair in addrs.windows(2) {
            assert!(pair[0] + size <= pair[1]);
        }
        blocks
    }

    #[test]
    fn test_exp_heap_allocator() {
        with_test_span(2048, |start, size| unsafe {
            let mut registry = HeapRegistry::new();
            let mut heap = ExpHeap::create(&mut registry, start, size, HeapOptions::empty()).unwrap();
            let free_before = heap.total_free_size();
            {
                let mut allocator = ExpHeapAllocator::new(&mut heap, -16);
                let a = allocator.alloc(40).unwrap();
                let b = allocator.alloc(40).unwrap();
                assert!(a.addr().get().is_multiple_of(16));
                assert!(b.addr().get() < a.addr().get());
                allocator.free(a);
                allocator.free(b);
            }
            assert_eq!(heap.total_free_size(), free_before);

            let mut allocator = ExpHeapAllocator::with_default_alignment(&mut heap);
            assert!(allocator.alloc(size).is_none());
            let block = allocator.alloc(8).unwrap();
            allocator.free(block);
            assert!(heap.check(CheckFlags::PRINT_ERRORS));
            heap.destroy(&mut registry);
        });
    }

    #[test]
    fn test_frame_heap_allocator() {
        with_test_span(1024, |start, size| unsafe {
            let mut registry = HeapRegistry::new();
            let mut heap = FrameHeap::create(&mut registry, start, size, HeapOptions::empty()).unwrap();
            let head = heap.head_cursor();
            {
                let mut allocator = FrameHeapAllocator::new(&mut heap, 8);
                assert_eq!(allocate_blocks(&mut allocator, 64, 4).len(), 4);
                let block = allocator.alloc(8).unwrap();
                allocator.free(block);
            }
            assert_eq!(heap.head_cursor(), head + 4 * 64 + 8);
            heap.free(FrameFreeMode::HEAD);
            assert_eq!(heap.head_cursor(), head);
            heap.destroy(&mut registry);
        });
    }

    #[test]
    fn test_unit_heap_allocator() {
        let size = UnitHeap::calc_heap_size(32, 4, 8);
        with_test_span(size, |start, size| unsafe {
            let mut registry = HeapRegistry::new();
            let mut heap =
                UnitHeap::create(&mut registry, start, size, 32, 8, HeapOptions::empty()).unwrap();
            let mut allocator = UnitHeapAllocator::new(&mut heap);
            assert!(allocator.alloc(33).is_none());
            let blocks = allocate_blocks(&mut allocator, 32, 8);
            assert_eq!(blocks.len(), 4);
            assert!(allocator.alloc(1).is_none());
            allocator.free(blocks[2]);
            assert_eq!(allocator.alloc(32), Some(blocks[2]));
            for block in blocks {
                allocator.free(block);
            }
            assert_eq!(heap.count_free(), 4);
            heap.destroy(&mut registry);
        });
    }
}
