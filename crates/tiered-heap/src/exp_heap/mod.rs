//! Expanding heap: a general-purpose allocator for variable-size blocks.
//!
//! The heap keeps two lists of [block headers](block): a free list sorted by
//! address and a used list in allocation order. Allocation searches the free
//! list for a block that can hold the request, splits off whatever is left on
//! either side, and moves the carved block to the used list. Freeing returns
//! the whole region of a block (alignment padding and header included) to the
//! free list, merging it with free neighbours so that no two free blocks are
//! ever adjacent.
//!
//! # Placement
//!
//! The sign of the `alignment` argument of [`ExpHeap::allocate`] picks the
//! search direction:
//!
//! - **positive**: the free list is scanned from the lowest address and the
//!   block is placed at the front of the chosen free block
//! - **negative**: the free list is scanned from the highest address and the
//!   block is placed at the back of the chosen free block
//!
//! Allocating long-lived data from one end and short-lived data from the other
//! keeps fragmentation down.
//!
//! # Search mode
//!
//! | Mode                        | Chosen free block                            |
//! |-----------------------------|----------------------------------------------|
//! | [`ExpAllocMode::FirstFit`]  | the first one that fits                      |
//! | [`ExpAllocMode::BestFit`]   | the smallest one that fits, first found wins |
//!
//! # Example
//!
//! ```rust
//! use tiered_heap::{ExpHeap, HeapOptions, HeapRegistry};
//!
//! let mut span = vec![0_u64; 512];
//! let mut registry = HeapRegistry::new();
//! let mut heap = unsafe {
//!     ExpHeap::create(&mut registry, span.as_mut_ptr().cast(), 4096, HeapOptions::empty())
//! }
//! .unwrap();
//!
//! let front = heap.allocate(100, 8).unwrap();
//! let back = heap.allocate(100, -8).unwrap();
//! assert!(front < back);
//!
//! unsafe {
//!     heap.free(back);
//!     heap.free(front);
//! }
//! heap.destroy(&mut registry);
//! ```

use core::{cmp::Ordering, fmt, marker::PhantomData, ops::Range, ptr::NonNull};

use self::block::{
    BlockList, FREE_SIGNATURE, HEAD_SIZE, MAX_ALIGN_PAD, MIN_FREE_REGION_SIZE, Region, Span,
    USED_SIGNATURE,
};
pub use self::block::{BlockAttr, ExpAllocDirection};
use crate::{
    common::{
        HeapHead, HeapKind, HeapOptions, MIN_ALIGNMENT, NIL, Percent, alignment_magnitude,
        carve_span, normalize_size, round_down, round_up,
    },
    error::CreateHeapError,
    fill,
    registry::HeapRegistry,
};

mod block;
mod check;

/// How [`ExpHeap::allocate`] chooses among the free blocks that fit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpAllocMode {
    /// Take the first free block that fits.
    #[default]
    FirstFit,
    /// Take the smallest free block that fits.
    BestFit,
}

#[repr(C)]
pub(crate) struct ExpHeapHead {
    common: HeapHead,
    free_list: BlockList,
    used_list: BlockList,
    group_id: u8,
    alloc_mode: ExpAllocMode,
}

impl ExpHeapHead {
    fn span(&self) -> Span {
        Span::new(self.common.heap_start)
    }

    /// Scans `blocks` for a free block that can hold `size` bytes.
    ///
    /// `place` computes the payload address inside a free block, given the
    /// address right after its header and its size, or `None` if the request
    /// does not fit.
    fn search<I, P>(&self, blocks: I, size: usize, place: P) -> Option<(u32, usize)>
    where
        I: Iterator<Item = u32>,
        P: Fn(usize, usize) -> Option<usize>,
    {
        let span = self.span();
        let mut found = None;
        let mut found_size = usize::MAX;
        for offset in blocks {
            let block_size = unsafe { (*span.block(offset)).size() };
            let Some(payload) = place(span.payload_addr(offset), block_size) else {
                continue;
            };
            if block_size < found_size {
                found = Some((offset, payload));
                found_size = block_size;
                if self.alloc_mode == ExpAllocMode::FirstFit || block_size == size {
                    break;
                }
            }
        }
        found
    }

    fn allocate(&mut self, size: usize, alignment: i32) -> Option<NonNull<u8>> {
        let align = alignment_magnitude(alignment);
        let size = normalize_size(size)?;
        let span = self.span();
        if alignment >= 0 {
            let (offset, payload) = self.search(self.free_list.iter(span), size, |start, len| {
                let payload = round_up(start, align);
                (payload + size <= start + len).then_some(payload)
            })?;
            Some(unsafe { self.alloc_from_free(offset, payload, size, ExpAllocDirection::Front) })
        } else {
            let (offset, payload) =
                self.search(self.free_list.iter_rev(span), size, |start, len| {
                    let payload = round_down((start + len).checked_sub(size)?, align);
                    (payload >= start).then_some(payload)
                })?;
            Some(unsafe { self.alloc_from_free(offset, payload, size, ExpAllocDirection::Back) })
        }
    }

    /// Carves a used block with its payload at `payload` out of the free
    /// block at `free`.
    ///
    /// The parts of the free block in front of the new header and behind the
    /// payload stay on the free list when they can hold a free block of their
    /// own. Otherwise the front part becomes alignment padding and the back
    /// part is added to the payload.
    ///
    /// # Safety
    ///
    /// `free` must be on the free list and `payload..payload + size` must lie
    /// inside its payload, at least [`HEAD_SIZE`] bytes past its header.
    unsafe fn alloc_from_free(
        &mut self,
        free: u32,
        payload: usize,
        size: usize,
        direction: ExpAllocDirection,
    ) -> NonNull<u8> {
        let span = self.span();
        unsafe {
            let free_region = span.region(free);
            let head_addr = payload - HEAD_SIZE;
            let front = Region {
                start: free_region.start,
                end: head_addr,
            };
            let back = Region {
                start: payload + size,
                end: free_region.end,
            };
            let mut prev = self.free_list.remove(span, free);

            let align_pad = if front.can_hold_free_block() {
                let offset = span.init_block(front, FREE_SIGNATURE);
                self.free_list.insert_after(span, prev, offset);
                prev = offset;
                0
            } else {
                front.len()
            };
            let block_size = if back.can_hold_free_block() {
                let offset = span.init_block(back, FREE_SIGNATURE);
                self.free_list.insert_after(span, prev, offset);
                size
            } else {
                size + back.len()
            };

            let used = span.init_block(
                Region {
                    start: head_addr,
                    end: payload + block_size,
                },
                USED_SIGNATURE,
            );
            (*span.block(used)).set_attr(self.group_id, align_pad, direction);
            self.used_list.push_back(span, used);

            let ptr = span.ptr(payload);
            fill::fill_alloc(self.common.options(), ptr, block_size);
            NonNull::new_unchecked(ptr)
        }
    }

    /// Returns `region` to the free list, merging it with the free blocks
    /// right before and after it.
    ///
    /// Fails, leaving the heap untouched, if `region` borders no free block
    /// and is too small to stand alone as one.
    ///
    /// # Safety
    ///
    /// `region` must lie inside the heap and be owned by no block.
    unsafe fn recycle_region(&mut self, region: Region) -> bool {
        let span = self.span();
        unsafe {
            let mut prev = NIL;
            let mut next = NIL;
            for offset in self.free_list.iter(span) {
                if span.addr(offset) < region.start {
                    prev = offset;
                } else {
                    next = offset;
                    break;
                }
            }
            let merge_next = next != NIL && span.addr(next) == region.end;
            let merge_prev = prev != NIL && span.region(prev).end == region.start;
            if !merge_next && !merge_prev && !region.can_hold_free_block() {
                return false;
            }

            let mut free = region;
            if merge_next {
                free.end = span.region(next).end;
                self.free_list.remove(span, next);
            }
            if merge_prev {
                free.start = span.addr(prev);
                prev = self.free_list.remove(span, prev);
            }
            fill::fill_free(self.common.options(), span.ptr(free.start), free.len());
            let offset = span.init_block(free, FREE_SIGNATURE);
            self.free_list.insert_after(span, prev, offset);
            true
        }
    }

    /// Hands `region` over to the used block that starts right after it, as
    /// extra alignment padding.
    unsafe fn absorb_into_following_used(&mut self, region: Region) -> bool {
        let span = self.span();
        for offset in self.used_list.iter(span) {
            let block = unsafe { &mut *span.block(offset) };
            let attr = block.attr();
            if span.addr(offset) - attr.alignment_padding() != region.end {
                continue;
            }
            let align_pad = attr.alignment_padding() + region.len();
            if align_pad > MAX_ALIGN_PAD {
                return false;
            }
            block.set_attr(attr.group_id(), align_pad, attr.direction());
            return true;
        }
        false
    }

    /// Returns the offset of the used block whose payload starts at `ptr`.
    fn used_offset(&self, ptr: NonNull<u8>) -> u32 {
        let addr = ptr.addr().get();
        let heap = self.common.range();
        debug_assert!(
            addr >= heap.start + HEAD_SIZE && addr <= heap.end,
            "{addr:#x} is not a block of the heap [{:#x} - {:#x})",
            heap.start,
            heap.end
        );
        let span = self.span();
        let offset = span.offset(addr - HEAD_SIZE);
        debug_assert_eq!(
            unsafe { (*span.block(offset)).signature },
            USED_SIGNATURE,
            "{addr:#x} is not a used block"
        );
        offset
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let span = self.span();
        let offset = self.used_offset(ptr);
        unsafe {
            let region = span.region(offset);
            self.used_list.remove(span, offset);
            let recycled = self.recycle_region(region);
            debug_assert!(recycled, "a used block always forms a free block");
        }
    }

    unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> usize {
        let offset = self.used_offset(ptr);
        let Some(new_size) = normalize_size(new_size) else {
            return 0;
        };
        let payload = ptr.addr().get();
        let old_size = unsafe { (*self.span().block(offset)).size() };
        match new_size.cmp(&old_size) {
            Ordering::Equal => old_size,
            Ordering::Greater => unsafe { self.grow(offset, payload, old_size, new_size) },
            Ordering::Less => unsafe { self.shrink(offset, payload, old_size, new_size) },
        }
    }

    /// Grows a used block into the free block that directly follows it.
    unsafe fn grow(&mut self, offset: u32, payload: usize, old_size: usize, new_size: usize) -> usize {
        let span = self.span();
        let old_end = payload + old_size;
        let Some(next) = self.free_list.iter(span).find(|&next| span.addr(next) == old_end) else {
            return 0;
        };
        unsafe {
            let next_region = span.region(next);
            if payload + new_size > next_region.end {
                return 0;
            }
            let prev = self.free_list.remove(span, next);
            let rest = Region {
                start: payload + new_size,
                end: next_region.end,
            };
            let block_size = if rest.can_hold_free_block() {
                let rest_offset = span.init_block(rest, FREE_SIGNATURE);
                self.free_list.insert_after(span, prev, rest_offset);
                new_size
            } else {
                next_region.end - payload
            };
            (*span.block(offset)).set_size(block_size);
            fill::fill_alloc(self.common.options(), span.ptr(old_end), block_size - old_size);
            block_size
        }
    }

    /// Shrinks a used block, giving the cut-off tail back to the heap.
    unsafe fn shrink(&mut self, offset: u32, payload: usize, old_size: usize, new_size: usize) -> usize {
        let span = self.span();
        let rest = Region {
            start: payload + new_size,
            end: payload + old_size,
        };
        unsafe {
            let block = span.block(offset);
            (*block).set_size(new_size);
            if !self.recycle_region(rest) && !self.absorb_into_following_used(rest) {
                (*block).set_size(old_size);
            }
            (*block).size()
        }
    }

    fn total_free_size(&self) -> usize {
        let span = self.span();
        self.free_list
            .iter(span)
            .map(|offset| unsafe { (*span.block(offset)).size() })
            .sum()
    }

    fn allocatable_size(&self, alignment: i32) -> usize {
        let align = alignment_magnitude(alignment);
        let span = self.span();
        self.free_list
            .iter(span)
            .filter_map(|offset| {
                let start = span.payload_addr(offset);
                let end = start + unsafe { (*span.block(offset)).size() };
                let payload = round_up(start, align);
                (payload < end).then(|| end - payload)
            })
            .max()
            .unwrap_or(0)
    }
}

/// Handle to an expanding heap.
///
/// Created by [`ExpHeap::create`] on a caller-provided span and consumed by
/// [`ExpHeap::destroy`]. The handle may be sent to another thread, but the
/// heap does no locking: wrap it in a lock (see
/// [`LockedExpHeap`](crate::LockedExpHeap)) to share it.
pub struct ExpHeap {
    head: NonNull<ExpHeapHead>,
}

unsafe impl Send for ExpHeap {}

impl fmt::Debug for ExpHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let range = self.range();
        f.debug_struct("ExpHeap")
            .field("start", &format_args!("{:#x}", range.start))
            .field("end", &format_args!("{:#x}", range.end))
            .field("free", &self.total_free_size())
            .finish()
    }
}

impl ExpHeap {
    /// Creates an expanding heap on the span `start..start + size`.
    ///
    /// The heap header is stored at the beginning of the span and the rest
    /// becomes a single free block.
    ///
    /// # Errors
    ///
    /// Fails if the span wraps around the address space, is too small to hold
    /// the header and one minimal free block, or manages more than
    /// `u32::MAX` bytes.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The span is valid for reads and writes
    /// - The span is used by nothing else until the heap is destroyed
    pub unsafe fn create(
        registry: &mut HeapRegistry,
        start: *mut u8,
        size: usize,
        options: HeapOptions,
    ) -> Result<Self, CreateHeapError> {
        let carved =
            carve_span::<ExpHeapHead>(start, size, MIN_ALIGNMENT, MIN_FREE_REGION_SIZE)?;
        #[expect(clippy::cast_ptr_alignment)]
        let head = carved.head.cast::<ExpHeapHead>();
        unsafe {
            head.write(ExpHeapHead {
                common: HeapHead::new(
                    HeapKind::Expanding,
                    carved.heap_start,
                    carved.heap_end,
                    options,
                ),
                free_list: BlockList::new(),
                used_list: BlockList::new(),
                group_id: 0,
                alloc_mode: ExpAllocMode::FirstFit,
            });
            (*head).common.fill_no_use();
            let span = (*head).span();
            let offset = span.init_block(
                Region {
                    start: carved.heap_start.addr(),
                    end: carved.heap_end.addr(),
                },
                FREE_SIGNATURE,
            );
            (*head).free_list.push_back(span, offset);
            registry.register(head.cast());
        }
        log::trace!(
            "created expanding heap [{:#x} - {:#x})",
            carved.heap_start.addr(),
            carved.heap_end.addr()
        );
        Ok(Self {
            head: unsafe { NonNull::new_unchecked(head) },
        })
    }

    /// Unregisters the heap and invalidates its header.
    ///
    /// Heaps nested in this heap are handed over to its parent. Blocks that
    /// are still allocated become unusable.
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
        log::trace!("destroyed expanding heap {:#x}", head.addr());
    }

    fn head(&self) -> &ExpHeapHead {
        let head = unsafe { self.head.as_ref() };
        debug_assert!(head.common.is_kind(HeapKind::Expanding));
        head
    }

    fn head_mut(&mut self) -> &mut ExpHeapHead {
        let head = unsafe { self.head.as_mut() };
        debug_assert!(head.common.is_kind(HeapKind::Expanding));
        head
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// # Arguments
    ///
    /// * `size` - Requested size; `0` is treated as `1` and the size is
    ///   rounded up to a multiple of 4
    /// * `alignment` - Alignment of the returned address; a positive value
    ///   allocates from the front of the heap, a negative one from the back
    ///
    /// # Returns
    ///
    /// The payload address, or `None` if no free block can hold the request.
    /// The block is tagged with the current [group id](Self::set_group_id).
    ///
    /// # Panics
    ///
    /// Panics if `|alignment|` is not one of 4, 8, 16 or 32.
    pub fn allocate(&mut self, size: usize, alignment: i32) -> Option<NonNull<u8>> {
        self.head_mut().allocate(size, alignment)
    }

    /// Changes the size of a block in place.
    ///
    /// Growing succeeds only if the block is directly followed by a free
    /// block large enough for the difference. Shrinking returns the tail to
    /// the heap; if the tail is too small to form a free block and cannot be
    /// handed to a neighbour, the block keeps its size.
    ///
    /// # Returns
    ///
    /// The resulting block size, which may exceed `new_size`, or `0` if the
    /// block could not grow.
    ///
    /// # Safety
    ///
    /// `ptr` must be a block allocated from this heap and not freed yet.
    pub unsafe fn resize(&mut self, ptr: NonNull<u8>, new_size: usize) -> usize {
        unsafe { self.head_mut().resize(ptr, new_size) }
    }

    /// Returns a block to the heap.
    ///
    /// # Safety
    ///
    /// `ptr` must be a block allocated from this heap and not freed yet.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe { self.head_mut().free(ptr) }
    }

    /// Returns the sum of the payload sizes of all free blocks.
    #[must_use]
    pub fn total_free_size(&self) -> usize {
        self.head().total_free_size()
    }

    /// Returns the largest size [`allocate`](Self::allocate) can currently
    /// satisfy with the given alignment. Only the magnitude of `alignment`
    /// matters.
    ///
    /// # Panics
    ///
    /// Panics if `|alignment|` is not one of 4, 8, 16 or 32.
    #[must_use]
    pub fn allocatable_size(&self, alignment: i32) -> usize {
        self.head().allocatable_size(alignment)
    }

    /// Calls `visitor` for every allocated block, in allocation order.
    ///
    /// The visitor receives the heap itself and may free the block it is
    /// called with, but no other block.
    pub fn visit_allocated<F>(&mut self, mut visitor: F)
    where
        F: FnMut(&mut Self, NonNull<u8>),
    {
        let mut current = self.head().used_list.head;
        while current != NIL {
            let span = self.head().span();
            let next = unsafe { (*span.block(current)).next };
            let payload = span.ptr(span.payload_addr(current));
            visitor(self, unsafe { NonNull::new_unchecked(payload) });
            current = next;
        }
    }

    /// Sets the group id recorded on blocks allocated from now on and
    /// returns the previous one.
    pub fn set_group_id(&mut self, group_id: u8) -> u8 {
        core::mem::replace(&mut self.head_mut().group_id, group_id)
    }

    #[must_use]
    pub fn group_id(&self) -> u8 {
        self.head().group_id
    }

    /// Sets the search mode used from now on and returns the previous one.
    pub fn set_alloc_mode(&mut self, mode: ExpAllocMode) -> ExpAllocMode {
        core::mem::replace(&mut self.head_mut().alloc_mode, mode)
    }

    #[must_use]
    pub fn alloc_mode(&self) -> ExpAllocMode {
        self.head().alloc_mode
    }

    /// Returns the payload size of a block, which may exceed the requested
    /// size.
    ///
    /// # Safety
    ///
    /// `ptr` must be a block allocated from this heap and not freed yet.
    #[must_use]
    pub unsafe fn block_size(&self, ptr: NonNull<u8>) -> usize {
        let head = self.head();
        let offset = head.used_offset(ptr);
        unsafe { (*head.span().block(offset)).size() }
    }

    /// Returns the attributes recorded on a block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a block allocated from this heap and not freed yet.
    #[must_use]
    pub unsafe fn block_attr(&self, ptr: NonNull<u8>) -> BlockAttr {
        let head = self.head();
        let offset = head.used_offset(ptr);
        unsafe { (*head.span().block(offset)).attr() }
    }

    /// Returns the managed range `heap_start..heap_end`.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.head().common.range()
    }

    #[must_use]
    pub fn options(&self) -> HeapOptions {
        self.head().common.options()
    }

    /// Returns a [`Display`](fmt::Display) value listing every block.
    #[must_use]
    pub fn dump(&self) -> ExpHeapDump<'_> {
        unsafe { ExpHeapDump::new(self.head) }
    }

    /// Logs [`dump`](Self::dump) at info level.
    pub fn log_dump(&self) {
        log::info!("{}", self.dump());
    }
}

/// Listing of the blocks of an expanding heap.
pub struct ExpHeapDump<'a> {
    head: NonNull<ExpHeapHead>,
    _marker: PhantomData<&'a ExpHeap>,
}

impl fmt::Debug for ExpHeapDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpHeapDump")
            .field("head", &self.head)
            .finish()
    }
}

impl ExpHeapDump<'_> {
    /// # Safety
    ///
    /// `head` must point to a live expanding heap header for the lifetime of
    /// the dump.
    pub(crate) unsafe fn new(head: NonNull<ExpHeapHead>) -> Self {
        Self {
            head,
            _marker: PhantomData,
        }
    }
}

impl fmt::Display for ExpHeapDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = unsafe { self.head.as_ref() };
        let span = head.span();
        let range = head.common.range();
        let mode = match head.alloc_mode {
            ExpAllocMode::FirstFit => "first-fit",
            ExpAllocMode::BestFit => "best-fit",
        };
        writeln!(
            f,
            "[Exp Heap] {:#x}: heap area [{:#x} - {:#x}), {mode}, group {}",
            self.head.addr(),
            range.start,
            range.end,
            head.group_id
        )?;
        writeln!(f, " attr   address:      size  gid  pad  dir")?;

        writeln!(f, " (Used Blocks)")?;
        if head.used_list.head == NIL {
            writeln!(f, "  NONE")?;
        }
        for offset in head.used_list.iter(span) {
            let block = unsafe { &*span.block(offset) };
            let attr = block.attr();
            let dir = match attr.direction() {
                ExpAllocDirection::Front => "F",
                ExpAllocDirection::Back => "B",
            };
            let signature = char::from(block.signature);
            writeln!(
                f,
                "   {signature}   {:#010x}: {:#08x}  {:3}  {:3}  {dir}",
                span.payload_addr(offset),
                block.size(),
                attr.group_id(),
                attr.alignment_padding(),
            )?;
        }

        writeln!(f, " (Free Blocks)")?;
        if head.free_list.head == NIL {
            writeln!(f, "  NONE")?;
        }
        for offset in head.free_list.iter(span) {
            let block = unsafe { &*span.block(offset) };
            let signature = char::from(block.signature);
            writeln!(
                f,
                "   {signature}   {:#010x}: {:#08x}",
                span.payload_addr(offset),
                block.size()
            )?;
        }

        let heap_size = head.common.size();
        let free_size = head.total_free_size();
        writeln!(
            f,
            "    {free_size:#x} / {heap_size:#x} bytes ({}) free",
            Percent {
                part: free_size,
                whole: heap_size
            }
        )
    }
}
