//! Tiered heap allocators working on caller-provided memory spans.
//!
//! Each heap is created on a contiguous span the caller owns (a static array,
//! a page range, or a block allocated from another heap) and keeps all of its
//! bookkeeping inside that span. The crate is `no_std` and never allocates on
//! its own.
//!
//! # Available Heaps
//!
//! ## [`ExpHeap`]
//!
//! A general-purpose heap of variable-sized blocks. Best suited for:
//!
//! - Allocations whose sizes and lifetimes are unpredictable
//! - Long-lived data placed at one end of the heap while short-lived data
//!   uses the other end
//! - Blocks that need to grow or shrink in place
//!
//! Blocks can be searched first-fit or best-fit, from the front (positive
//! alignment) or from the back (negative alignment), and carry a group id that
//! can be used to release related blocks together.
//!
//! ## [`FrameHeap`]
//!
//! A stack-discipline heap with two bump cursors. Best suited for:
//!
//! - Per-frame or per-phase scratch memory released all at once
//! - Loading data whose total size is only known afterwards
//!   ([`FrameHeap::adjust_to_fit`])
//!
//! Tagged checkpoints ([`FrameHeap::record_state`]) roll both cursors back.
//!
//! ## [`UnitHeap`]
//!
//! A pool of fixed-size blocks with O(1) allocation and release.
//!
//! ## Performance Characteristics
//!
//! | Heap | Allocation | Release | Overhead per block |
//! |------|------------|---------|--------------------|
//! | `ExpHeap` | O(free blocks) | O(free blocks) | 16 bytes + alignment padding |
//! | `FrameHeap` | O(1) | O(1) for a whole end | None |
//! | `UnitHeap` | O(1) | O(1) | Rounding to the alignment |
//!
//! # Nesting and the Registry
//!
//! Heaps are recorded in a [`HeapRegistry`]. A heap created on a span that
//! lies inside another heap becomes that heap's child, so
//! [`HeapRegistry::find_containing`] reports the innermost heap owning an
//! address and [`HeapRegistry::dump`] renders the whole tree.
//!
//! # Usage Example
//!
//! ```rust
//! use tiered_heap::{
//!     CheckFlags, ExpHeap, FrameFreeMode, FrameHeap, HeapKind, HeapOptions, HeapRegistry,
//! };
//!
//! let mut arena = vec![0_u32; 4096];
//! let mut registry = HeapRegistry::new();
//! let mut exp = unsafe {
//!     ExpHeap::create(
//!         &mut registry,
//!         arena.as_mut_ptr().cast(),
//!         arena.len() * 4,
//!         HeapOptions::empty(),
//!     )
//!     .unwrap()
//! };
//!
//! // Long-lived data from the back, a scratch frame heap from the front.
//! let table = exp.allocate(256, -8).unwrap();
//! let scratch = exp.allocate(4096, 16).unwrap();
//! let mut frame =
//!     unsafe { FrameHeap::create(&mut registry, scratch.as_ptr(), 4096, HeapOptions::empty()) }
//!         .unwrap();
//!
//! assert!(frame.record_state(1));
//! let _temp = frame.allocate(100, 4).unwrap();
//! assert!(frame.restore_state(1));
//! frame.free(FrameFreeMode::ALL);
//!
//! let owner = registry.find_containing(frame.head_cursor()).unwrap();
//! assert_eq!(owner.kind(), Some(HeapKind::Frame));
//!
//! frame.destroy(&mut registry);
//! unsafe {
//!     exp.free(scratch);
//!     exp.free(table);
//! }
//! assert!(exp.check(CheckFlags::PRINT_ERRORS));
//! exp.destroy(&mut registry);
//! ```
//!
//! # Debug Support
//!
//! With the `debug` feature (enabled by default) heaps created with
//! [`HeapOptions::DEBUG_FILL`] paint never-used, allocated and freed memory
//! with the patterns configured in [`fill`], and the `check` functions of
//! every heap validate its internal structures. Without the feature the fills
//! are skipped and the checks always succeed.
//!
//! # Thread Safety
//!
//! Heap handles are `Send` but not `Sync`. Sharing a heap between threads
//! needs external synchronization; [`LockedExpHeap`] wraps an expanding heap
//! in a spin lock and implements [`GlobalAlloc`](core::alloc::GlobalAlloc).

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use self::{
    allocator::{ExpHeapAllocator, FrameHeapAllocator, HeapAllocator, UnitHeapAllocator},
    common::{CheckFlags, DEFAULT_ALIGNMENT, HeapKind, HeapOptions},
    exp_heap::{BlockAttr, ExpAllocDirection, ExpAllocMode, ExpHeap, ExpHeapDump},
    frame_heap::{FrameFreeMode, FrameHeap, FrameHeapDump},
    locked::LockedExpHeap,
    registry::{HeapDump, HeapInfo, HeapIter, HeapRegistry, RegistryDump},
    unit_heap::{UnitHeap, UnitHeapDump},
};

mod allocator;
mod common;
pub mod error;
mod exp_heap;
pub mod fill;
mod frame_heap;
mod locked;
mod registry;
#[cfg(test)]
mod testing;
mod unit_heap;
