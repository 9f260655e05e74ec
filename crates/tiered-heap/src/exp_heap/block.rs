//! Memory block headers of the expanding heap and the lists threading them.
//!
//! Every block, used or free, starts with a 16-byte [`BlockHead`] directly in
//! front of its payload. A used block may additionally own up to 127 bytes of
//! alignment padding in front of the header:
//!
//! ```text
//!   region start                         region end
//!   │                                            │
//!   ▼                                            ▼
//!   ┌─────────┬──────────────────┬───────────────┐
//!   │ padding │ BlockHead (16 B) │ payload       │
//!   └─────────┴──────────────────┴───────────────┘
//!             ▲                  ▲
//!             block offset       payload address
//! ```
//!
//! Links are stored as 32-bit offsets from the heap start, so the headers
//! need only 4-byte alignment.

use crate::common::{NIL, addr_of, offset_of};

/// Size of a block header in bytes.
pub(crate) const HEAD_SIZE: usize = size_of::<BlockHead>();

/// Smallest payload a free block may have.
pub(crate) const MIN_FREE_BLOCK_SIZE: usize = 4;

/// Smallest region that can stand alone as a free block.
pub(crate) const MIN_FREE_REGION_SIZE: usize = HEAD_SIZE + MIN_FREE_BLOCK_SIZE;

/// Largest alignment padding a used block can record.
pub(crate) const MAX_ALIGN_PAD: usize = 127;

pub(crate) const USED_SIGNATURE: u8 = b'U';
pub(crate) const FREE_SIGNATURE: u8 = b'F';

/// Where an allocation was searched from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpAllocDirection {
    /// Lowest-address fit, requested with a positive alignment.
    #[default]
    Front,
    /// Highest-address fit, requested with a negative alignment.
    Back,
}

/// Attributes recorded on a used block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockAttr {
    group_id: u8,
    align_pad: u8,
    direction: ExpAllocDirection,
}

impl BlockAttr {
    /// Group id of the heap at the time the block was allocated.
    #[must_use]
    pub fn group_id(&self) -> u8 {
        self.group_id
    }

    /// Number of padding bytes in front of the block header, at most 127.
    #[must_use]
    pub fn alignment_padding(&self) -> usize {
        usize::from(self.align_pad)
    }

    #[must_use]
    pub fn direction(&self) -> ExpAllocDirection {
        self.direction
    }
}

#[repr(C)]
pub(crate) struct BlockHead {
    pub(crate) signature: u8,
    pub(crate) group_id: u8,
    pub(crate) align_pad: u8,
    pub(crate) direction: u8,
    pub(crate) block_size: u32,
    pub(crate) prev: u32,
    pub(crate) next: u32,
}
const _: () = assert!(size_of::<BlockHead>() == 16);
const _: () = assert!(align_of::<BlockHead>() <= 4);

impl BlockHead {
    pub(crate) fn size(&self) -> usize {
        self.block_size as usize
    }

    pub(crate) fn attr(&self) -> BlockAttr {
        BlockAttr {
            group_id: self.group_id,
            align_pad: self.align_pad,
            direction: if self.direction == 0 {
                ExpAllocDirection::Front
            } else {
                ExpAllocDirection::Back
            },
        }
    }

    pub(crate) fn set_attr(&mut self, group_id: u8, align_pad: usize, direction: ExpAllocDirection) {
        debug_assert!(align_pad <= MAX_ALIGN_PAD);
        #[expect(clippy::cast_possible_truncation)]
        let align_pad = align_pad as u8;
        self.group_id = group_id;
        self.align_pad = align_pad;
        self.direction = match direction {
            ExpAllocDirection::Front => 0,
            ExpAllocDirection::Back => 1,
        };
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.block_size = u32::try_from(size).unwrap_or(u32::MAX);
        debug_assert_eq!(self.size(), size);
    }
}

/// Half-open address range owned by a block, padding and header included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Region {
    pub(crate) start: usize,
    pub(crate) end: usize,
}

impl Region {
    pub(crate) fn len(self) -> usize {
        self.end - self.start
    }

    pub(crate) fn can_hold_free_block(self) -> bool {
        self.end >= self.start + MIN_FREE_REGION_SIZE
    }
}

/// Translates block offsets into pointers inside the heap.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Span {
    base: *mut u8,
}

impl Span {
    pub(crate) fn new(base: *mut u8) -> Self {
        Self { base }
    }

    #[cfg_attr(not(feature = "debug"), expect(dead_code))]
    pub(crate) fn base(self) -> usize {
        self.base.addr()
    }

    pub(crate) fn addr(self, offset: u32) -> usize {
        addr_of(self.base.addr(), offset)
    }

    pub(crate) fn offset(self, addr: usize) -> u32 {
        offset_of(self.base.addr(), addr)
    }

    pub(crate) fn ptr(self, addr: usize) -> *mut u8 {
        self.base.with_addr(addr)
    }

    #[expect(clippy::cast_ptr_alignment)]
    pub(crate) fn block(self, offset: u32) -> *mut BlockHead {
        self.ptr(self.addr(offset)).cast::<BlockHead>()
    }

    pub(crate) fn payload_addr(self, offset: u32) -> usize {
        self.addr(offset) + HEAD_SIZE
    }

    /// Returns the region owned by the block at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must refer to a valid block header.
    pub(crate) unsafe fn region(self, offset: u32) -> Region {
        let head = unsafe { &*self.block(offset) };
        let addr = self.addr(offset);
        Region {
            start: addr - usize::from(head.align_pad),
            end: addr + HEAD_SIZE + head.size(),
        }
    }

    /// Writes a fresh block header at the start of `region`, covering the
    /// whole region, and returns its offset.
    ///
    /// # Safety
    ///
    /// `region` must lie inside the heap and be at least [`HEAD_SIZE`] bytes.
    pub(crate) unsafe fn init_block(self, region: Region, signature: u8) -> u32 {
        debug_assert!(region.len() >= HEAD_SIZE);
        let offset = self.offset(region.start);
        unsafe {
            self.block(offset).write(BlockHead {
                signature,
                group_id: 0,
                align_pad: 0,
                direction: 0,
                block_size: 0,
                prev: NIL,
                next: NIL,
            });
            (*self.block(offset)).set_size(region.len() - HEAD_SIZE);
        }
        offset
    }
}

/// Doubly linked list of block headers.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct BlockList {
    pub(crate) head: u32,
    pub(crate) tail: u32,
}

impl BlockList {
    pub(crate) const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
        }
    }

    /// Links `offset` right after `prev`, or at the front when `prev` is
    /// [`NIL`].
    ///
    /// # Safety
    ///
    /// `offset` must be an unlinked block header and `prev` either `NIL` or a
    /// member of this list.
    pub(crate) unsafe fn insert_after(&mut self, span: Span, prev: u32, offset: u32) {
        unsafe {
            let next = if prev == NIL {
                self.head
            } else {
                (*span.block(prev)).next
            };
            let block = span.block(offset);
            (*block).prev = prev;
            (*block).next = next;
            if prev == NIL {
                self.head = offset;
            } else {
                (*span.block(prev)).next = offset;
            }
            if next == NIL {
                self.tail = offset;
            } else {
                (*span.block(next)).prev = offset;
            }
        }
    }

    /// Links `offset` at the end of the list.
    ///
    /// # Safety
    ///
    /// `offset` must be an unlinked block header.
    pub(crate) unsafe fn push_back(&mut self, span: Span, offset: u32) {
        unsafe { self.insert_after(span, self.tail, offset) }
    }

    /// Unlinks `offset` and returns the block that preceded it.
    ///
    /// # Safety
    ///
    /// `offset` must be a member of this list.
    pub(crate) unsafe fn remove(&mut self, span: Span, offset: u32) -> u32 {
        unsafe {
            let block = span.block(offset);
            let prev = (*block).prev;
            let next = (*block).next;
            if prev == NIL {
                self.head = next;
            } else {
                (*span.block(prev)).next = next;
            }
            if next == NIL {
                self.tail = prev;
            } else {
                (*span.block(next)).prev = prev;
            }
            prev
        }
    }

    /// Iterates over the block offsets from head to tail.
    ///
    /// The link to the following block is read before a block is yielded, so
    /// the yielded block may be unlinked while iterating.
    pub(crate) fn iter(&self, span: Span) -> BlockIter {
        BlockIter {
            span,
            next: self.head,
            forward: true,
        }
    }

    /// Iterates over the block offsets from tail to head.
    pub(crate) fn iter_rev(&self, span: Span) -> BlockIter {
        BlockIter {
            span,
            next: self.tail,
            forward: false,
        }
    }
}

pub(crate) struct BlockIter {
    span: Span,
    next: u32,
    forward: bool,
}

impl Iterator for BlockIter {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next;
        if current == NIL {
            return None;
        }
        let block = unsafe { &*self.span.block(current) };
        self.next = if self.forward { block.next } else { block.prev };
        Some(current)
    }
}
