//! Frame heap: a stack-discipline allocator with two bump cursors.
//!
//! Blocks are carved from the front of the heap by advancing the head cursor,
//! or from the back by moving the tail cursor down. Blocks carry no header and
//! cannot be freed one by one; instead whole ends of the heap are released at
//! once with [`FrameHeap::free`], or rolled back to a checkpoint recorded with
//! [`FrameHeap::record_state`].
//!
//! ```text
//!   heap_start         head cursor         tail cursor          heap_end
//!   │                  │                   │                    │
//!   ▼                  ▼                   ▼                    ▼
//!   ┌──────────────────┬───────────────────┬────────────────────┐
//!   │ head allocations │       free        │  tail allocations  │
//!   └──────────────────┴───────────────────┴────────────────────┘
//! ```
//!
//! Checkpoints ("states") are small records allocated from the head. They
//! form a stack: restoring a state pops it together with every state recorded
//! after it.

use core::{fmt, marker::PhantomData, ops::Range, ptr::NonNull};

use bitflags::bitflags;

use crate::{
    common::{
        CheckFlags, HeapHead, HeapKind, HeapOptions, MIN_ALIGNMENT, NIL, Percent,
        alignment_magnitude, carve_span, normalize_size, round_down, round_up,
    },
    error::CreateHeapError,
    fill,
    registry::HeapRegistry,
};

bitflags! {
    /// Which ends of a frame heap [`FrameHeap::free`] releases.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFreeMode: u32 {
        /// Release every head allocation and discard all states.
        const HEAD = 1 << 0;
        /// Release every tail allocation.
        const TAIL = 1 << 1;
        const ALL = Self::HEAD.bits() | Self::TAIL.bits();
    }
}

/// Checkpoint of both cursors, stored in the heap itself.
///
/// Cursor positions and links are offsets from the heap start.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct FrameState {
    tag: u32,
    head: u32,
    tail: u32,
    prev: u32,
}
const _: () = assert!(size_of::<FrameState>() == 16);
const _: () = assert!(align_of::<FrameState>() <= MIN_ALIGNMENT);

#[repr(C)]
pub(crate) struct FrameHeapHead {
    common: HeapHead,
    head_cursor: usize,
    tail_cursor: usize,
    /// Offset of the most recent state, or [`NIL`].
    state: u32,
    /// Offset of the block the head cursor was last bumped for, or [`NIL`]
    /// once a state or a reset sits above it.
    last_block: u32,
}

impl FrameHeapHead {
    fn start(&self) -> usize {
        self.common.heap_start.addr()
    }

    fn end(&self) -> usize {
        self.common.heap_end.addr()
    }

    fn offset(&self, addr: usize) -> u32 {
        crate::common::offset_of(self.start(), addr)
    }

    fn addr(&self, offset: u32) -> usize {
        crate::common::addr_of(self.start(), offset)
    }

    #[expect(clippy::cast_ptr_alignment)]
    fn state_ptr(&self, offset: u32) -> *mut FrameState {
        self.common.ptr_at(self.addr(offset)).cast::<FrameState>()
    }

    fn states(&self) -> StateIter<'_> {
        StateIter {
            heap: self,
            next: self.state,
        }
    }

    fn allocate(&mut self, size: usize, alignment: i32) -> Option<NonNull<u8>> {
        let align = alignment_magnitude(alignment);
        let size = normalize_size(size)?;
        if alignment >= 0 {
            self.alloc_from_head(size, align)
        } else {
            self.alloc_from_tail(size, align)
        }
    }

    fn alloc_from_head(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let start = round_up(self.head_cursor, align);
        let end = start.checked_add(size)?;
        if end > self.tail_cursor {
            return None;
        }
        let ptr = self.common.ptr_at(start);
        unsafe {
            fill::fill_alloc(self.common.options(), ptr, size);
        }
        self.head_cursor = end;
        self.last_block = self.offset(start);
        NonNull::new(ptr)
    }

    fn alloc_from_tail(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let start = round_down(self.tail_cursor.checked_sub(size)?, align);
        if start < self.head_cursor {
            return None;
        }
        let ptr = self.common.ptr_at(start);
        unsafe {
            fill::fill_alloc(self.common.options(), ptr, self.tail_cursor - start);
        }
        self.tail_cursor = start;
        NonNull::new(ptr)
    }

    /// Fills `start..end` with the free pattern.
    fn fill_free(&self, start: usize, end: usize) {
        if start < end {
            let ptr = self.common.ptr_at(start);
            unsafe {
                fill::fill_free(self.common.options(), ptr, end - start);
            }
        }
    }

    fn free_head(&mut self) {
        self.fill_free(self.start(), self.head_cursor);
        self.head_cursor = self.start();
        self.state = NIL;
        self.last_block = NIL;
    }

    fn free_tail(&mut self) {
        self.fill_free(self.tail_cursor, self.end());
        let end = self.offset(self.end());
        let mut current = self.state;
        while current != NIL {
            let state = self.state_ptr(current);
            unsafe {
                (*state).tail = end;
                current = (*state).prev;
            }
        }
        self.tail_cursor = self.end();
    }

    fn record_state(&mut self, tag: u32) -> bool {
        let head = self.offset(self.head_cursor);
        let tail = self.offset(self.tail_cursor);
        let Some(ptr) = self.alloc_from_head(size_of::<FrameState>(), MIN_ALIGNMENT) else {
            return false;
        };
        let offset = self.offset(ptr.addr().get());
        unsafe {
            self.state_ptr(offset).write(FrameState {
                tag,
                head,
                tail,
                prev: self.state,
            });
        }
        self.state = offset;
        self.last_block = NIL;
        true
    }

    fn restore_state(&mut self, tag: u32) -> bool {
        let Some((_, state)) = self
            .states()
            .find(|(_, state)| tag == 0 || state.tag == tag)
        else {
            return false;
        };
        let head = self.addr(state.head);
        let tail = self.addr(state.tail);
        self.fill_free(head, self.head_cursor);
        self.fill_free(self.tail_cursor, tail);
        self.head_cursor = head;
        self.tail_cursor = tail;
        self.state = state.prev;
        self.last_block = NIL;
        true
    }

    fn adjust_to_fit(&mut self, head_addr: usize) -> usize {
        if self.tail_cursor != self.end() {
            return 0;
        }
        let new_end = self.head_cursor;
        let new_end_offset = self.offset(new_end);
        let mut current = self.state;
        while current != NIL {
            let state = self.state_ptr(current);
            unsafe {
                (*state).tail = (*state).tail.min(new_end_offset);
                current = (*state).prev;
            }
        }
        self.common.heap_end = self.common.ptr_at(new_end);
        self.tail_cursor = new_end;
        self.last_block = NIL;
        new_end - head_addr
    }

    fn resize_last_block(&mut self, ptr: NonNull<u8>, new_size: usize) -> usize {
        let block = ptr.addr().get();
        let is_last = self.last_block != NIL && block == self.addr(self.last_block);
        debug_assert!(is_last, "{block:#x} is not the last head block");
        if !is_last {
            return 0;
        }
        let Some(new_size) = normalize_size(new_size) else {
            return 0;
        };
        let Some(new_end) = block.checked_add(new_size) else {
            return 0;
        };
        if new_end > self.tail_cursor {
            return 0;
        }
        if new_end > self.head_cursor {
            let grown = self.common.ptr_at(self.head_cursor);
            unsafe {
                fill::fill_alloc(self.common.options(), grown, new_end - self.head_cursor);
            }
        } else {
            self.fill_free(new_end, self.head_cursor);
        }
        self.head_cursor = new_end;
        new_size
    }

    fn allocatable_size(&self, alignment: i32) -> usize {
        let align = alignment_magnitude(alignment);
        let start = round_up(self.head_cursor, align);
        self.tail_cursor.saturating_sub(start)
    }
}

/// Iterates over the saved states, newest first, yielding their offsets.
struct StateIter<'a> {
    heap: &'a FrameHeapHead,
    next: u32,
}

impl Iterator for StateIter<'_> {
    type Item = (u32, FrameState);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next;
        if current == NIL {
            return None;
        }
        let state = unsafe { self.heap.state_ptr(current).read() };
        self.next = state.prev;
        Some((current, state))
    }
}

/// Handle to a frame heap.
///
/// Created by [`FrameHeap::create`] on a caller-provided span and consumed by
/// [`FrameHeap::destroy`].
pub struct FrameHeap {
    head: NonNull<FrameHeapHead>,
}

unsafe impl Send for FrameHeap {}

impl fmt::Debug for FrameHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHeap")
            .field("head_cursor", &format_args!("{:#x}", self.head_cursor()))
            .field("tail_cursor", &format_args!("{:#x}", self.tail_cursor()))
            .finish_non_exhaustive()
    }
}

impl FrameHeap {
    /// Creates a frame heap on the span `start..start + size`.
    ///
    /// # Errors
    ///
    /// Fails if the span wraps around the address space, cannot hold the
    /// heap header plus 4 bytes, or manages more than `u32::MAX` bytes.
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
        let carved = carve_span::<FrameHeapHead>(start, size, MIN_ALIGNMENT, MIN_ALIGNMENT)?;
        #[expect(clippy::cast_ptr_alignment)]
        let head = carved.head.cast::<FrameHeapHead>();
        unsafe {
            head.write(FrameHeapHead {
                common: HeapHead::new(HeapKind::Frame, carved.heap_start, carved.heap_end, options),
                head_cursor: carved.heap_start.addr(),
                tail_cursor: carved.heap_end.addr(),
                state: NIL,
                last_block: NIL,
            });
            (*head).common.fill_no_use();
            registry.register(head.cast());
        }
        log::trace!(
            "created frame heap [{:#x} - {:#x})",
            carved.heap_start.addr(),
            carved.heap_end.addr()
        );
        Ok(Self {
            head: unsafe { NonNull::new_unchecked(head) },
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
        log::trace!("destroyed frame heap {:#x}", head.addr());
    }

    fn head(&self) -> &FrameHeapHead {
        let head = unsafe { self.head.as_ref() };
        debug_assert!(head.common.is_kind(HeapKind::Frame));
        head
    }

    fn head_mut(&mut self) -> &mut FrameHeapHead {
        let head = unsafe { self.head.as_mut() };
        debug_assert!(head.common.is_kind(HeapKind::Frame));
        head
    }

    /// Allocates `size` bytes, rounded up to a multiple of 4 (`0` counts as
    /// `1`).
    ///
    /// A non-negative `alignment` allocates from the head cursor, a negative
    /// one from the tail cursor. Returns `None` if the cursors would cross.
    ///
    /// # Panics
    ///
    /// Panics if `|alignment|` is not one of 4, 8, 16 or 32.
    pub fn allocate(&mut self, size: usize, alignment: i32) -> Option<NonNull<u8>> {
        self.head_mut().allocate(size, alignment)
    }

    /// Releases all head allocations, all tail allocations, or both.
    ///
    /// Releasing the head also discards every saved state. Releasing the
    /// tail moves the saved tail cursor of every state to the heap end.
    pub fn free(&mut self, mode: FrameFreeMode) {
        let head = self.head_mut();
        if mode.contains(FrameFreeMode::HEAD) {
            head.free_head();
        }
        if mode.contains(FrameFreeMode::TAIL) {
            head.free_tail();
        }
    }

    /// Saves both cursors under `tag`.
    ///
    /// The state record itself takes 16 bytes from the head. Returns `false`
    /// if there is no room for it.
    pub fn record_state(&mut self, tag: u32) -> bool {
        self.head_mut().record_state(tag)
    }

    /// Rolls both cursors back to a saved state.
    ///
    /// With `tag == 0` the most recent state is restored, otherwise the most
    /// recent state recorded under `tag`. The restored state and every state
    /// recorded after it are discarded. Returns `false` if no state matches.
    pub fn restore_state(&mut self, tag: u32) -> bool {
        self.head_mut().restore_state(tag)
    }

    /// Shrinks the heap to its head allocations, giving the free area back
    /// to whoever owns the span.
    ///
    /// # Returns
    ///
    /// The new size of the span, header included, or `0` if any tail
    /// allocation exists.
    pub fn adjust_to_fit(&mut self) -> usize {
        let head_addr = self.head.addr().get();
        self.head_mut().adjust_to_fit(head_addr)
    }

    /// Changes the size of the most recent head allocation in place.
    ///
    /// # Returns
    ///
    /// The new size rounded up to a multiple of 4, or `0` if growing would
    /// cross the tail cursor.
    ///
    /// # Panics
    ///
    /// `ptr` must be the block returned by the latest head allocation, with
    /// no state recorded or restored and no head reset since. Debug builds
    /// panic otherwise; release builds return `0`.
    pub fn resize_last_block(&mut self, ptr: NonNull<u8>, new_size: usize) -> usize {
        self.head_mut().resize_last_block(ptr, new_size)
    }

    /// Returns the largest size a head allocation with the given alignment
    /// can currently get. Only the magnitude of `alignment` matters.
    ///
    /// # Panics
    ///
    /// Panics if `|alignment|` is not one of 4, 8, 16 or 32.
    #[must_use]
    pub fn allocatable_size(&self, alignment: i32) -> usize {
        self.head().allocatable_size(alignment)
    }

    #[must_use]
    pub fn head_cursor(&self) -> usize {
        self.head().head_cursor
    }

    #[must_use]
    pub fn tail_cursor(&self) -> usize {
        self.head().tail_cursor
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

    cfg_if::cfg_if! {
        if #[cfg(feature = "debug")] {
            /// Checks the cursors and the saved states.
            ///
            /// The cursors must be ordered inside the heap, and every state
            /// must lie in the head area with saved cursors inside the heap.
            /// With [`CheckFlags::PRINT_ERRORS`] the first problem found is
            /// logged.
            #[must_use]
            pub fn check(&self, flags: CheckFlags) -> bool {
                crate::common::report_check(HeapKind::Frame, flags, self.head().validate())
            }
        } else {
            /// Checks the cursors and the saved states.
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
    pub fn dump(&self) -> FrameHeapDump<'_> {
        unsafe { FrameHeapDump::new(self.head) }
    }

    /// Logs [`dump`](Self::dump) at info level.
    pub fn log_dump(&self) {
        log::info!("{}", self.dump());
    }
}

#[cfg(feature = "debug")]
impl FrameHeapHead {
    fn validate(&self) -> Result<(), crate::error::CheckError> {
        use snafu::ensure;

        use crate::error::{CursorsOutOfOrderSnafu, StateCursorsOutOfRangeSnafu, StateOutOfRangeSnafu};

        let (start, end) = (self.start(), self.end());
        let (head, tail) = (self.head_cursor, self.tail_cursor);
        ensure!(
            start <= head && head <= tail && tail <= end,
            CursorsOutOfOrderSnafu {
                heap_start: start,
                head,
                tail,
                heap_end: end,
            }
        );

        let heap_size = end - start;
        let mut upper = head;
        let mut current = self.state;
        while current != NIL {
            let address = start.wrapping_add(current as usize);
            ensure!(
                address >= start
                    && address.is_multiple_of(MIN_ALIGNMENT)
                    && address + size_of::<FrameState>() <= upper,
                StateOutOfRangeSnafu {
                    address,
                    head: upper,
                }
            );
            let state = unsafe { self.state_ptr(current).read() };
            let (saved_head, saved_tail) = (state.head as usize, state.tail as usize);
            ensure!(
                start + saved_head <= address && saved_head <= saved_tail && saved_tail <= heap_size,
                StateCursorsOutOfRangeSnafu {
                    address,
                    head: start.wrapping_add(saved_head),
                    tail: start.wrapping_add(saved_tail),
                }
            );
            upper = address;
            current = state.prev;
        }
        Ok(())
    }
}

/// Description of a frame heap, see [`FrameHeap::dump`].
pub struct FrameHeapDump<'a> {
    head: NonNull<FrameHeapHead>,
    _marker: PhantomData<&'a FrameHeap>,
}

impl fmt::Debug for FrameHeapDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHeapDump")
            .field("head", &self.head)
            .finish()
    }
}

impl FrameHeapDump<'_> {
    /// # Safety
    ///
    /// `head` must point to a live frame heap header for the lifetime of the
    /// dump.
    pub(crate) unsafe fn new(head: NonNull<FrameHeapHead>) -> Self {
        Self {
            head,
            _marker: PhantomData,
        }
    }
}

impl fmt::Display for FrameHeapDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = unsafe { self.head.as_ref() };
        let (start, end) = (heap.start(), heap.end());
        let (head, tail) = (heap.head_cursor, heap.tail_cursor);
        let size = end - start;
        writeln!(
            f,
            "[Frame Heap] {:#x}: heap area [{start:#x} - {end:#x})",
            self.head.addr()
        )?;
        writeln!(f, "    head [{start:#x} - {head:#x}) {:#x} bytes", head - start)?;
        writeln!(
            f,
            "    free [{head:#x} - {tail:#x}) {:#x} bytes ({})",
            tail - head,
            Percent {
                part: tail - head,
                whole: size
            }
        )?;
        writeln!(f, "    tail [{tail:#x} - {end:#x}) {:#x} bytes", end - tail)?;
        for (offset, state) in heap.states() {
            writeln!(
                f,
                "    state {:#x}: tag {:#x}, head {:#x}, tail {:#x}",
                heap.addr(offset),
                state.tag,
                heap.addr(state.head),
                heap.addr(state.tail)
            )?;
        }
        Ok(())
    }
}
