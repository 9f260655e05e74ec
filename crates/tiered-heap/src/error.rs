//! Error types reported by heap creation and by the heap validators.
//!
//! Allocation failures are not errors: allocators report exhaustion through
//! `None`, `0` or `false` return values. The types here cover the two places
//! where the caller benefits from knowing *why* something went wrong: handing
//! an unusable span to a `create` function, and corruption found by the
//! `check` diagnostics.

use core::fmt;

use snafu::{Location, Snafu};

/// Errors that can occur while creating a heap on a caller-provided span.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CreateHeapError {
    #[snafu(display("heap span starts at the null address"))]
    NullSpan {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap span {start:#x}+{size:#x} wraps around the address space"))]
    SpanOverflow {
        start: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "heap span too small: {available} bytes available, at least {required} bytes required"
    ))]
    SpanTooSmall {
        available: usize,
        required: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap span too large: {size} bytes exceeds the limit of {limit} bytes"))]
    SpanTooLarge {
        size: usize,
        limit: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid unit heap block size: {block_size}"))]
    InvalidBlockSize {
        block_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Whether a memory block is on the used list or on the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Used,
    Free,
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Used => f.write_str("used"),
            Self::Free => f.write_str("free"),
        }
    }
}

/// Corruption detected by the heap validators.
///
/// Link and block addresses are payload addresses; `0` stands for "no block".
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CheckError {
    #[snafu(display(
        "bad {state} memory block address {address:#x}, heap area [{heap_start:#x} - {heap_end:#x})"
    ))]
    BadBlockAddress {
        state: BlockState,
        address: usize,
        heap_start: usize,
        heap_end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("bad {state} memory block signature at {address:#x}: {signature:#04x}"))]
    BadBlockSignature {
        state: BlockState,
        address: usize,
        signature: u8,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{state} memory block at {address:#x} overruns the heap: block size {size:#x}"))]
    BlockOutOfBounds {
        state: BlockState,
        address: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "wrong link at memory block {address:#x}: {which} address {actual:#x} != {expected:#x}"
    ))]
    WrongLink {
        address: usize,
        which: &'static str,
        actual: usize,
        expected: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "wrong {state} memory block list {which} pointer: {actual:#x} != {expected:#x}"
    ))]
    WrongListEnd {
        state: BlockState,
        which: &'static str,
        actual: usize,
        expected: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "incorrect total memory block size: heap size {heap_size:#x}, sum size {total:#x}"
    ))]
    TotalSizeMismatch {
        heap_size: usize,
        total: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free memory blocks at {first:#x} and {second:#x} are not coalesced"))]
    AdjacentFreeBlocks {
        first: usize,
        second: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "frame heap cursors out of order: start {heap_start:#x}, head {head:#x}, tail {tail:#x}, end {heap_end:#x}"
    ))]
    CursorsOutOfOrder {
        heap_start: usize,
        head: usize,
        tail: usize,
        heap_end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "frame state at {address:#x} is outside the allocated head region ending at {head:#x}"
    ))]
    StateOutOfRange {
        address: usize,
        head: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "frame state at {address:#x} records cursors head {head:#x}, tail {tail:#x} outside the heap"
    ))]
    StateCursorsOutOfRange {
        address: usize,
        head: usize,
        tail: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("unit heap free block {address:#x} is not a block boundary of the heap"))]
    BadUnitBlock {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("unit heap free list is longer than the {capacity} blocks of the heap"))]
    FreeListTooLong {
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
}
