//! Unit heap: a pool of equally sized blocks.
//!
//! The managed range is cut into `block_size` slices at creation. Free blocks
//! are threaded through a singly linked list whose links live in the first
//! four bytes of each free block, so allocation and release are O(1) and
//! freed blocks are reused in LIFO order.

use core::{fmt, marker::PhantomData, ops::Range, ptr::NonNull};

use snafu::ensure;

use crate::{
    common::{
        CheckFlags, HeapHead, HeapKind, HeapOptions, NIL, Percent, addr_of, carve_span,
        checked_round_up, is_valid_alignment, offset_of, round_up,
    },
    error::{CreateHeapError, InvalidBlockSizeSnafu},
    fill,
    registry::HeapRegistry,
};

#[repr(C)]
pub(crate) struct UnitHeapHead {
    common: HeapHead,
    /// Offset of the first free block, or [`NIL`].
    free_head: u32,
    block_size: u32,
}

impl UnitHeapHead {
    fn start(&self) -> usize {
        self.common.heap_start.addr()
    }

    fn block_size(&self) -> usize {
        self.block_size as usize
    }

    fn capacity(&self) -> usize {
        self.common.size() / self.block_size()
    }

    #[expect(clippy::cast_ptr_alignment)]
    fn link(&self, offset: u32) -> *mut u32 {
        self.common
            .ptr_at(addr_of(self.start(), offset))
            .cast::<u32>()
    }

    fn free_blocks(&self) -> FreeIter<'_> {
        FreeIter {
            heap: self,
            next: self.free_head,
            remaining: self.capacity(),
        }
    }
}

/// Walks the free list, stopping after as many blocks as the heap holds so
/// that a corrupted, cyclic list still terminates.
struct FreeIter<'a> {
    heap: &'a UnitHeapHead,
    next: u32,
    remaining: usize,
}

impl Iterator for FreeIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next;
        if current == NIL || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.next = unsafe { self.heap.link(current).read() };
        Some(current)
    }
}

/// Handle to a unit heap.
pub struct UnitHeap {
    head: NonNull<UnitHeapHead>,
}

unsafe impl Send for UnitHeap {}

impl fmt::Debug for UnitHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitHeap")
            .field("block_size", &self.block_size())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl UnitHeap {
    /// Creates a unit heap of `block_size` blocks on the span
    /// `start..start + size`.
    ///
    /// # Arguments
    ///
    /// * `block_size` - Size of every block. Rounded up to `alignment`.
    /// * `alignment` - Alignment of every block: 4, 8, 16 or 32.
    ///
    /// # Errors
    ///
    /// Fails if `block_size` is zero or does not fit in 32 bits, or if the
    /// span wraps around the address space, cannot hold the header plus one
    /// block, or manages more than `u32::MAX` bytes.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The span is valid for reads and writes
    /// - The span is used by nothing else until the heap is destroyed
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not one of 4, 8, 16 or 32.
    pub unsafe fn create(
        registry: &mut HeapRegistry,
        start: *mut u8,
        size: usize,
        block_size: usize,
        alignment: usize,
        options: HeapOptions,
    ) -> Result<Self, CreateHeapError> {
        assert!(
            is_valid_alignment(alignment),
            "alignment must be one of 4, 8, 16 or 32, got {alignment}"
        );
        ensure!(
            block_size != 0 && block_size <= u32::MAX as usize - alignment,
            InvalidBlockSizeSnafu { block_size }
        );
        let block_size = round_up(block_size, alignment);
        let carved = carve_span::<UnitHeapHead>(start, size, alignment, block_size)?;
        let count = (carved.heap_end.addr() - carved.heap_start.addr()) / block_size;
        let heap_end = carved.heap_start.wrapping_add(count * block_size);

        #[expect(clippy::cast_ptr_alignment)]
        let head = carved.head.cast::<UnitHeapHead>();
        unsafe {
            head.write(UnitHeapHead {
                common: HeapHead::new(HeapKind::Unit, carved.heap_start, heap_end, options),
                free_head: NIL,
                block_size: u32::try_from(block_size).unwrap_or(u32::MAX),
            });
            let heap = &mut *head;
            heap.common.fill_no_use();
            for index in (0..count).rev() {
                let offset = offset_of(heap.start(), heap.start() + index * block_size);
                heap.link(offset).write(heap.free_head);
                heap.free_head = offset;
            }
            registry.register(head.cast());
        }
        log::trace!(
            "created unit heap [{:#x} - {:#x}), {count} blocks of {block_size:#x} bytes",
            carved.heap_start.addr(),
            heap_end.addr()
        );
        Ok(Self {
            head: unsafe { NonNull::new_unchecked(head) },
        })
    }

    /// Returns the span size that guarantees `block_count` blocks of
    /// `block_size` bytes for any span start aligned to 4 bytes.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not one of 4, 8, 16 or 32, or if the size
    /// does not fit in `usize`.
    #[must_use]
    pub fn calc_heap_size(block_size: usize, block_count: usize, alignment: usize) -> usize {
        assert!(
            is_valid_alignment(alignment),
            "alignment must be one of 4, 8, 16 or 32, got {alignment}"
        );
        let header_slack = alignment.max(align_of::<UnitHeapHead>()) - 4;
        checked_round_up(block_size.max(1), alignment)
            .and_then(|block_size| block_size.checked_mul(block_count))
            .and_then(|blocks| blocks.checked_add(size_of::<UnitHeapHead>() + header_slack))
            .unwrap_or_else(|| {
                panic!("unit heap of {block_count} blocks of {block_size} bytes overflows usize")
            })
    }

    /// Unregisters the heap and invalidates its header.
    ///
    /// # Panics
    ///
    /// Panics if the heap is a root heap that `registry` does not know about.
    pub fn destroy(self, registry: &mut HeapRegistry) {
        let head = self.head.as_ptr();
        unsafe {
            registry.unregister(head.cast());
            (*head).common.invalidate();
        }
        log::trace!("destroyed unit heap {:#x}", head.addr());
    }

    fn head(&self) -> &UnitHeapHead {
        let head = unsafe { self.head.as_ref() };
        debug_assert!(head.common.is_kind(HeapKind::Unit));
        head
    }

    fn head_mut(&mut self) -> &mut UnitHeapHead {
        let head = unsafe { self.head.as_mut() };
        debug_assert!(head.common.is_kind(HeapKind::Unit));
        head
    }

    /// Takes a block from the pool, or returns `None` if every block is in
    /// use.
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        let heap = self.head_mut();
        let offset = heap.free_head;
        if offset == NIL {
            return None;
        }
        let ptr = heap.common.ptr_at(addr_of(heap.start(), offset));
        unsafe {
            heap.free_head = heap.link(offset).read();
            fill::fill_alloc(heap.common.options(), ptr, heap.block_size());
        }
        NonNull::new(ptr)
    }

    /// Returns a block to the pool. It is the next block handed out.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// heap and not been freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let heap = self.head_mut();
        let addr = ptr.addr().get();
        debug_assert!(heap.common.range().contains(&addr));
        debug_assert!((addr - heap.start()).is_multiple_of(heap.block_size()));
        let offset = offset_of(heap.start(), addr);
        unsafe {
            fill::fill_free(heap.common.options(), ptr.as_ptr(), heap.block_size());
            heap.link(offset).write(heap.free_head);
        }
        heap.free_head = offset;
    }

    /// Counts the free blocks by walking the free list.
    #[must_use]
    pub fn count_free(&self) -> usize {
        self.head().free_blocks().count()
    }

    /// Size of every block, after rounding to the alignment.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.head().block_size()
    }

    /// Total number of blocks in the heap.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.head().capacity()
    }

    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.head().common.range()
    }

    #[must_use]
    pub fn options(&self) -> HeapOptions {
        self.head().common.options()
    }

    cfg_if::cfg_if! {
        if #[cfg(feature = "debug")] {
            /// Checks that every free list entry is a block boundary inside
            /// the heap and that the list is no longer than the heap.
            ///
            /// With [`CheckFlags::PRINT_ERRORS`] the first problem found is
            /// logged.
            #[must_use]
            pub fn check(&self, flags: CheckFlags) -> bool {
                crate::common::report_check(HeapKind::Unit, flags, self.head().validate())
            }
        } else {
            /// Checks the free list.
            ///
            /// Always `true` without the `debug` feature.
            #[must_use]
            pub fn check(&self, _flags: CheckFlags) -> bool {
                true
            }
        }
    }

    /// Returns a [`Display`](fmt::Display) value describing the heap.
    #[must_use]
    pub fn dump(&self) -> UnitHeapDump<'_> {
        unsafe { UnitHeapDump::new(self.head) }
    }

    /// Logs [`dump`](Self::dump) at info level.
    pub fn log_dump(&self) {
        log::info!("{}", self.dump());
    }
}

#[cfg(feature = "debug")]
impl UnitHeapHead {
    fn validate(&self) -> Result<(), crate::error::CheckError> {
        use crate::error::{BadUnitBlockSnafu, FreeListTooLongSnafu};

        let size = self.common.size();
        let capacity = self.capacity();
        let mut count = 0;
        let mut current = self.free_head;
        while current != NIL {
            let offset = current as usize;
            ensure!(
                offset < size && offset.is_multiple_of(self.block_size()),
                BadUnitBlockSnafu {
                    address: self.start().wrapping_add(offset),
                }
            );
            count += 1;
            ensure!(count <= capacity, FreeListTooLongSnafu { capacity });
            current = unsafe { self.link(current).read() };
        }
        Ok(())
    }
}

/// Description of a unit heap, see [`UnitHeap::dump`].
pub struct UnitHeapDump<'a> {
    head: NonNull<UnitHeapHead>,
    _marker: PhantomData<&'a UnitHeap>,
}

impl fmt::Debug for UnitHeapDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitHeapDump")
            .field("head", &self.head)
            .finish()
    }
}

impl UnitHeapDump<'_> {
    /// # Safety
    ///
    /// `head` must point to a live unit heap header for the lifetime of the
    /// dump.
    pub(crate) unsafe fn new(head: NonNull<UnitHeapHead>) -> Self {
        Self {
            head,
            _marker: PhantomData,
        }
    }
}

impl fmt::Display for UnitHeapDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = unsafe { self.head.as_ref() };
        let range = heap.common.range();
        let capacity = heap.capacity();
        let free = heap.free_blocks().count();
        writeln!(
            f,
            "[Unit Heap] {:#x}: heap area [{:#x} - {:#x})",
            self.head.addr(),
            range.start,
            range.end
        )?;
        writeln!(f, "    block size {:#x}, {capacity} blocks", heap.block_size())?;
        writeln!(
            f,
            "    {free} / {capacity} blocks free ({})",
            Percent {
                part: free,
                whole: capacity
            }
        )
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{format, vec::Vec};

    use super::*;
    use crate::testing::{assert_filled, with_test_span};

    fn with_test_heap<F>(
        block_size: usize,
        count: usize,
        alignment: usize,
        options: HeapOptions,
        test_fn: F,
    ) where
        F: FnOnce(&mut UnitHeap),
    {
        let size = UnitHeap::calc_heap_size(block_size, count, alignment);
        with_test_span(size, |start, size| unsafe {
            let mut registry = HeapRegistry::new();
            let mut heap =
                UnitHeap::create(&mut registry, start, size, block_size, alignment, options).unwrap();
            assert!(heap.capacity() >= count);
            test_fn(&mut heap);
            assert!(heap.check(CheckFlags::PRINT_ERRORS));
            heap.destroy(&mut registry);
        });
    }

    #[test]
    fn test_pool_determinism() {
        with_test_heap(16, 16, 4, HeapOptions::empty(), |heap| unsafe {
            assert_eq!(heap.count_free(), 16);
            assert_eq!(heap.range().len(), 256);

            let blocks = (0..16).map(|_| heap.allocate().unwrap()).collect::<Vec<_>>();
            assert!(heap.allocate().is_none());
            assert_eq!(heap.count_free(), 0);

            let start = heap.range().start;
            for (index, block) in blocks.iter().enumerate() {
                assert_eq!(block.addr().get(), start + index * 16);
            }

            heap.free(blocks[5]);
            assert_eq!(heap.count_free(), 1);
            assert_eq!(heap.allocate(), Some(blocks[5]));
            assert!(heap.allocate().is_none());

            for block in blocks {
                heap.free(block);
            }
            assert_eq!(heap.count_free(), 16);
        });
    }

    #[test]
    fn test_lifo_reuse() {
        with_test_heap(24, 4, 8, HeapOptions::empty(), |heap| unsafe {
            let a = heap.allocate().unwrap();
            let b = heap.allocate().unwrap();
            heap.free(a);
            heap.free(b);
            assert_eq!(heap.allocate(), Some(b));
            assert_eq!(heap.allocate(), Some(a));
        });
    }

    #[test]
    fn test_block_size_rounding() {
        for (block_size, alignment, expected) in [(1, 4, 4), (10, 8, 16), (33, 32, 64), (16, 16, 16)] {
            with_test_heap(block_size, 3, alignment, HeapOptions::empty(), |heap| {
                assert_eq!(heap.block_size(), expected);
                for _ in 0..heap.capacity() {
                    let block = heap.allocate().unwrap();
                    assert!(block.addr().get().is_multiple_of(alignment));
                }
                assert!(heap.allocate().is_none());
            });
        }
    }

    #[test]
    fn test_create_errors() {
        with_test_span(256, |start, size| unsafe {
            let mut registry = HeapRegistry::new();
            assert!(matches!(
                UnitHeap::create(&mut registry, start, size, 0, 4, HeapOptions::empty()),
                Err(CreateHeapError::InvalidBlockSize { block_size: 0, .. })
            ));
            assert!(matches!(
                UnitHeap::create(&mut registry, start, size, 512, 4, HeapOptions::empty()),
                Err(CreateHeapError::SpanTooSmall { .. })
            ));
            assert!(registry.is_empty());
        });
    }

    #[test]
    #[should_panic = "alignment must be one of 4, 8, 16 or 32"]
    fn test_invalid_alignment() {
        let _ = UnitHeap::calc_heap_size(16, 1, 12);
    }

    #[test]
    #[should_panic = "overflows usize"]
    fn test_calc_heap_size_overflow() {
        let _ = UnitHeap::calc_heap_size(16, usize::MAX / 8, 4);
    }

    #[test]
    #[should_panic = "overflows usize"]
    fn test_calc_heap_size_block_size_overflow() {
        let _ = UnitHeap::calc_heap_size(usize::MAX - 1, 1, 4);
    }

    #[test]
    fn test_zero_clear() {
        with_test_heap(32, 2, 4, HeapOptions::ZERO_CLEAR, |heap| unsafe {
            let block = heap.allocate().unwrap();
            block.as_ptr().write_bytes(0xAA, 32);
            heap.free(block);
            let block = heap.allocate().unwrap();
            assert_filled(block.as_ptr(), 32, 0);
        });
    }

    #[cfg(feature = "debug")]
    #[test]
    fn test_check_detects_bad_link() {
        with_test_heap(16, 4, 4, HeapOptions::empty(), |heap| unsafe {
            let block = heap.allocate().unwrap();
            heap.free(block);
            #[expect(clippy::cast_ptr_alignment)]
            let link = block.as_ptr().cast::<u32>();
            let saved = link.read();

            link.write(6);
            assert!(!heap.check(CheckFlags::PRINT_ERRORS));
            // A cycle makes the list longer than the heap.
            link.write(0);
            assert!(!heap.check(CheckFlags::empty()));

            link.write(saved);
        });
    }

    #[test]
    fn test_dump() {
        with_test_heap(16, 4, 4, HeapOptions::empty(), |heap| {
            let _block = heap.allocate().unwrap();
            let dump = format!("{}", heap.dump());
            assert!(dump.starts_with("[Unit Heap]"), "{dump}");
            assert!(dump.contains("block size 0x10, 4 blocks"), "{dump}");
            assert!(dump.contains("3 / 4 blocks free ( 75.00%)"), "{dump}");
        });
    }
}
