//! Definitions shared by every heap kind: the common heap header, option
//! flags, and address arithmetic helpers.

use core::{fmt, ops::Range, ptr};

use bitflags::bitflags;
use snafu::{OptionExt as _, ensure};

#[cfg(feature = "debug")]
use crate::error::CheckError;
use crate::{
    error::{
        CreateHeapError, NullSpanSnafu, SpanOverflowSnafu, SpanTooLargeSnafu, SpanTooSmallSnafu,
    },
    fill,
    registry::HeapList,
};

/// Smallest alignment (and size granule) handed out by any heap.
pub(crate) const MIN_ALIGNMENT: usize = 4;

/// Largest alignment accepted by the allocation functions.
pub(crate) const MAX_ALIGNMENT: usize = 32;

/// Alignment used when the caller has no particular requirement.
pub const DEFAULT_ALIGNMENT: i32 = 4;

/// Sentinel offset for "no block" in the in-span linked lists.
pub(crate) const NIL: u32 = u32::MAX;

/// The allocator that owns a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Variable-size allocator, see [`ExpHeap`](crate::ExpHeap).
    Expanding,
    /// Stack-discipline allocator, see [`FrameHeap`](crate::FrameHeap).
    Frame,
    /// Fixed-size pool allocator, see [`UnitHeap`](crate::UnitHeap).
    Unit,
}

impl HeapKind {
    const EXP_SIGNATURE: u32 = u32::from_be_bytes(*b"EXPH");
    const FRM_SIGNATURE: u32 = u32::from_be_bytes(*b"FRMH");
    const UNT_SIGNATURE: u32 = u32::from_be_bytes(*b"UNTH");

    pub(crate) const fn signature(self) -> u32 {
        match self {
            Self::Expanding => Self::EXP_SIGNATURE,
            Self::Frame => Self::FRM_SIGNATURE,
            Self::Unit => Self::UNT_SIGNATURE,
        }
    }

    pub(crate) const fn from_signature(signature: u32) -> Option<Self> {
        match signature {
            Self::EXP_SIGNATURE => Some(Self::Expanding),
            Self::FRM_SIGNATURE => Some(Self::Frame),
            Self::UNT_SIGNATURE => Some(Self::Unit),
            _ => None,
        }
    }
}

impl fmt::Display for HeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expanding => f.write_str("Exp"),
            Self::Frame => f.write_str("Frame"),
            Self::Unit => f.write_str("Unit"),
        }
    }
}

bitflags! {
    /// Behavior flags fixed when a heap is created.
    ///
    /// Only the low 8 bits are meaningful; the rest are reserved.
    #[repr(transparent)]
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeapOptions: u16 {
        /// Zero every block handed out by the heap.
        const ZERO_CLEAR = 1 << 0;
        /// Fill never-used, allocated and freed memory with the debug
        /// patterns (see [`fill`](crate::fill)).
        ///
        /// Ignored unless the `debug` feature is enabled.
        const DEBUG_FILL = 1 << 1;
    }
}

bitflags! {
    /// Flags controlling the heap validators.
    #[repr(transparent)]
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CheckFlags: u32 {
        /// Log the first problem found through [`log::warn!`].
        const PRINT_ERRORS = 1 << 0;
    }
}

/// Header common to all heaps.
///
/// Lives at the beginning of the span handed to a `create` function, in front
/// of the managed range `[heap_start, heap_end)`. Every heap-specific header
/// embeds it as its first field so that a pointer to the specific header is
/// also a pointer to this one.
#[repr(C)]
pub(crate) struct HeapHead {
    signature: u32,
    options: HeapOptions,
    pub(crate) heap_start: *mut u8,
    pub(crate) heap_end: *mut u8,
    /// Heap whose child list holds this heap, or null for a root heap.
    pub(crate) parent: *mut Self,
    pub(crate) prev: *mut Self,
    pub(crate) next: *mut Self,
    pub(crate) children: HeapList,
}

impl HeapHead {
    /// Builds the common header of a heap managing `heap_start..heap_end`.
    ///
    /// The header is not linked in any registry list yet.
    pub(crate) fn new(
        kind: HeapKind,
        heap_start: *mut u8,
        heap_end: *mut u8,
        options: HeapOptions,
    ) -> Self {
        assert!(heap_start <= heap_end, "heap range must not be reversed");
        Self {
            signature: kind.signature(),
            options: HeapOptions::from_bits_truncate(options.bits() & 0xff),
            heap_start,
            heap_end,
            parent: ptr::null_mut(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            children: HeapList::new(),
        }
    }

    /// Paints the whole managed range with the "never used" pattern.
    ///
    /// # Safety
    ///
    /// The managed range must be valid for writes and not in use.
    pub(crate) unsafe fn fill_no_use(&self) {
        unsafe { fill::fill_no_use(self.options, self.heap_start, self.size()) }
    }

    pub(crate) fn kind(&self) -> Option<HeapKind> {
        HeapKind::from_signature(self.signature)
    }

    pub(crate) fn is_kind(&self, kind: HeapKind) -> bool {
        self.signature == kind.signature()
    }

    /// Clears the signature so that stale pointers to this header are
    /// recognized as invalid.
    pub(crate) fn invalidate(&mut self) {
        self.signature = 0;
    }

    pub(crate) fn options(&self) -> HeapOptions {
        self.options
    }

    pub(crate) fn range(&self) -> Range<usize> {
        self.heap_start.addr()..self.heap_end.addr()
    }

    pub(crate) fn size(&self) -> usize {
        self.heap_end.addr() - self.heap_start.addr()
    }

    /// Returns a pointer with the provenance of the heap span at `addr`.
    pub(crate) fn ptr_at(&self, addr: usize) -> *mut u8 {
        self.heap_start.with_addr(addr)
    }
}

/// Placement of a heap inside the span it is created on.
pub(crate) struct CarvedSpan {
    /// Where the heap header goes, aligned for the header type. Never null.
    pub(crate) head: *mut u8,
    pub(crate) heap_start: *mut u8,
    pub(crate) heap_end: *mut u8,
}

/// Splits the span `start..start + size` into a header of type `H` followed by
/// a managed range of at least `min_heap_size` bytes.
///
/// The header is placed at the first address aligned for `H`; both ends of the
/// managed range are aligned to [`MIN_ALIGNMENT`], and `heap_start` is further
/// aligned to `heap_align`.
pub(crate) fn carve_span<H>(
    start: *mut u8,
    size: usize,
    heap_align: usize,
    min_heap_size: usize,
) -> Result<CarvedSpan, CreateHeapError> {
    let overflow = SpanOverflowSnafu {
        start: start.addr(),
        size,
    };
    ensure!(!start.is_null(), NullSpanSnafu);
    let span_end = start.addr().checked_add(size).context(overflow)?;
    let head = checked_round_up(start.addr(), align_of::<H>()).context(overflow)?;
    let heap_start = head
        .checked_add(size_of::<H>())
        .and_then(|addr| checked_round_up(addr, heap_align.max(MIN_ALIGNMENT)))
        .context(overflow)?;
    let heap_end = round_down(span_end, MIN_ALIGNMENT);

    let required = (heap_start - start.addr()).saturating_add(min_heap_size);
    ensure!(
        heap_end >= heap_start && heap_end - heap_start >= min_heap_size,
        SpanTooSmallSnafu {
            available: size,
            required,
        }
    );
    let limit = u32::MAX as usize;
    ensure!(
        heap_end - heap_start <= limit,
        SpanTooLargeSnafu {
            size: heap_end - heap_start,
            limit,
        }
    );

    Ok(CarvedSpan {
        head: start.with_addr(head),
        heap_start: start.with_addr(heap_start),
        heap_end: start.with_addr(heap_end),
    })
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
pub(crate) const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Like [`round_up`], but returns `None` on overflow.
pub(crate) const fn checked_round_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Rounds `value` down to a multiple of `align`, which must be a power of two.
pub(crate) const fn round_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

pub(crate) fn is_valid_alignment(align: usize) -> bool {
    align.is_power_of_two() && (MIN_ALIGNMENT..=MAX_ALIGNMENT).contains(&align)
}

/// Converts a signed alignment argument, whose sign selects the allocation
/// direction, into the alignment in bytes.
///
/// # Panics
///
/// Panics if the magnitude is not one of 4, 8, 16 or 32.
pub(crate) fn alignment_magnitude(alignment: i32) -> usize {
    let align = alignment.unsigned_abs() as usize;
    assert!(
        is_valid_alignment(align),
        "alignment must be one of 4, 8, 16 or 32 (either sign), got {alignment}"
    );
    align
}

/// Normalizes a requested allocation size: zero becomes one, then the size
/// is rounded up to the allocation granule.
///
/// Returns `None` if the size cannot be represented in a block header.
pub(crate) fn normalize_size(size: usize) -> Option<usize> {
    let size = checked_round_up(size.max(1), MIN_ALIGNMENT)?;
    (size <= u32::MAX as usize).then_some(size)
}

/// Converts an address inside a heap into an offset from the heap start.
#[expect(clippy::cast_possible_truncation)]
pub(crate) fn offset_of(heap_start: usize, addr: usize) -> u32 {
    debug_assert!(addr >= heap_start && addr - heap_start < NIL as usize);
    (addr - heap_start) as u32
}

pub(crate) fn addr_of(heap_start: usize, offset: u32) -> usize {
    debug_assert_ne!(offset, NIL);
    heap_start + offset as usize
}

/// Turns the outcome of a validator into the boolean the public `check`
/// functions report, logging the failure when requested.
#[cfg(feature = "debug")]
pub(crate) fn report_check(
    kind: HeapKind,
    flags: CheckFlags,
    result: Result<(), CheckError>,
) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            if flags.contains(CheckFlags::PRINT_ERRORS) {
                log::warn!("[{kind} Heap] {err}");
            }
            false
        }
    }
}

/// Formats `part / whole` as a percentage with two decimals.
pub(crate) struct Percent {
    pub(crate) part: usize,
    pub(crate) whole: usize,
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let basis_points = if self.whole == 0 {
            0
        } else {
            self.part.saturating_mul(10_000) / self.whole
        };
        write!(f, "{:3}.{:02}%", basis_points / 100, basis_points % 100)
    }
}
