//! Consistency checks of the expanding heap.

use core::ptr::NonNull;

use super::ExpHeap;
use crate::common::CheckFlags;

cfg_if::cfg_if! {
    if #[cfg(feature = "debug")] {
        use snafu::ensure;

        use super::{
            ExpHeapHead,
            block::{BlockList, FREE_SIGNATURE, HEAD_SIZE, Span, USED_SIGNATURE},
        };
        use crate::{
            common::{HeapKind, NIL, report_check},
            error::{
                AdjacentFreeBlocksSnafu, BadBlockAddressSnafu, BadBlockSignatureSnafu,
                BlockOutOfBoundsSnafu, BlockState, CheckError, TotalSizeMismatchSnafu,
                WrongLinkSnafu, WrongListEndSnafu,
            },
        };
    }
}

#[cfg(feature = "debug")]
impl ExpHeapHead {
    /// Payload address of a linked block, `0` for [`NIL`].
    fn link_addr(span: Span, offset: u32) -> usize {
        if offset == NIL {
            0
        } else {
            span.payload_addr(offset)
        }
    }

    /// Checks that the header at `offset` lies inside the heap, carries the
    /// signature of `state`, and owns a region inside the heap.
    fn validate_block(&self, offset: u32, state: BlockState) -> Result<(), CheckError> {
        let span = self.span();
        let heap = self.common.range();
        let address = (span.base() + offset as usize).wrapping_add(HEAD_SIZE);
        ensure!(
            offset != NIL && address <= heap.end && address.is_multiple_of(4),
            BadBlockAddressSnafu {
                state,
                address,
                heap_start: heap.start,
                heap_end: heap.end,
            }
        );

        let block = unsafe { &*span.block(offset) };
        let signature = match state {
            BlockState::Used => USED_SIGNATURE,
            BlockState::Free => FREE_SIGNATURE,
        };
        ensure!(
            block.signature == signature,
            BadBlockSignatureSnafu {
                state,
                address,
                signature: block.signature,
            }
        );

        let pad = usize::from(block.align_pad);
        let in_bounds = address - HEAD_SIZE - heap.start >= pad
            && heap.end - address >= block.size()
            && (state == BlockState::Used || pad == 0);
        ensure!(
            in_bounds,
            BlockOutOfBoundsSnafu {
                state,
                address,
                size: block.size(),
            }
        );
        Ok(())
    }

    /// Walks `list`, checking every block and the links between them, and
    /// adds the bytes owned by the blocks to `total`.
    fn validate_list(
        &self,
        list: &BlockList,
        state: BlockState,
        total: &mut usize,
    ) -> Result<(), CheckError> {
        let span = self.span();
        let heap_size = self.common.size();
        let mut prev = NIL;
        let mut prev_end = None;
        let mut current = list.head;
        while current != NIL {
            self.validate_block(current, state)?;
            let block = unsafe { &*span.block(current) };
            let address = span.payload_addr(current);
            ensure!(
                block.prev == prev,
                WrongLinkSnafu {
                    address,
                    which: "prev",
                    actual: Self::link_addr(span, block.prev),
                    expected: Self::link_addr(span, prev),
                }
            );

            let region = unsafe { span.region(current) };
            if state == BlockState::Free {
                if let Some(prev_end) = prev_end {
                    ensure!(
                        region.start != prev_end,
                        AdjacentFreeBlocksSnafu {
                            first: Self::link_addr(span, prev),
                            second: address,
                        }
                    );
                }
                prev_end = Some(region.end);
            }

            *total += region.len();
            ensure!(
                *total <= heap_size,
                TotalSizeMismatchSnafu {
                    heap_size,
                    total: *total,
                }
            );
            prev = current;
            current = block.next;
        }

        ensure!(
            list.tail == prev,
            WrongListEndSnafu {
                state,
                which: "tail",
                actual: Self::link_addr(span, list.tail),
                expected: Self::link_addr(span, prev),
            }
        );
        Ok(())
    }

    pub(super) fn validate(&self) -> Result<(), CheckError> {
        let mut total = 0;
        self.validate_list(&self.used_list, BlockState::Used, &mut total)?;
        self.validate_list(&self.free_list, BlockState::Free, &mut total)?;
        let heap_size = self.common.size();
        ensure!(
            total == heap_size,
            TotalSizeMismatchSnafu { heap_size, total }
        );
        Ok(())
    }

    /// Checks a single used block and the links of its neighbours.
    pub(super) fn validate_used_block(&self, ptr: NonNull<u8>) -> Result<(), CheckError> {
        let span = self.span();
        let heap = self.common.range();
        let address = ptr.addr().get();
        ensure!(
            address >= heap.start + HEAD_SIZE && address <= heap.end,
            BadBlockAddressSnafu {
                state: BlockState::Used,
                address,
                heap_start: heap.start,
                heap_end: heap.end,
            }
        );
        let offset = span.offset(address - HEAD_SIZE);
        self.validate_block(offset, BlockState::Used)?;

        let block = unsafe { &*span.block(offset) };
        if block.prev == NIL {
            ensure!(
                self.used_list.head == offset,
                WrongListEndSnafu {
                    state: BlockState::Used,
                    which: "head",
                    actual: Self::link_addr(span, self.used_list.head),
                    expected: address,
                }
            );
        } else {
            self.validate_block(block.prev, BlockState::Used)?;
            let prev = unsafe { &*span.block(block.prev) };
            ensure!(
                prev.next == offset,
                WrongLinkSnafu {
                    address: Self::link_addr(span, block.prev),
                    which: "next",
                    actual: Self::link_addr(span, prev.next),
                    expected: address,
                }
            );
        }
        if block.next == NIL {
            ensure!(
                self.used_list.tail == offset,
                WrongListEndSnafu {
                    state: BlockState::Used,
                    which: "tail",
                    actual: Self::link_addr(span, self.used_list.tail),
                    expected: address,
                }
            );
        } else {
            self.validate_block(block.next, BlockState::Used)?;
            let next = unsafe { &*span.block(block.next) };
            ensure!(
                next.prev == offset,
                WrongLinkSnafu {
                    address: Self::link_addr(span, block.next),
                    which: "prev",
                    actual: Self::link_addr(span, next.prev),
                    expected: address,
                }
            );
        }
        Ok(())
    }
}

impl ExpHeap {
    cfg_if::cfg_if! {
        if #[cfg(feature = "debug")] {
            /// Checks the consistency of the whole heap.
            ///
            /// Both block lists are walked, checking block signatures, bounds,
            /// links and list ends. The bytes owned by all blocks must add up
            /// to the heap size and no two free blocks may be adjacent.
            ///
            /// # Returns
            ///
            /// `true` if the heap is consistent. With
            /// [`CheckFlags::PRINT_ERRORS`] the first problem found is logged.
            #[must_use]
            pub fn check(&self, flags: CheckFlags) -> bool {
                report_check(HeapKind::Expanding, flags, self.head().validate())
            }

            /// Checks a single allocated block and its neighbours on the used
            /// list.
            ///
            /// Reports like [`check`](Self::check).
            ///
            /// # Safety
            ///
            /// `ptr` must point into the managed range of this heap.
            #[must_use]
            pub unsafe fn check_block(&self, ptr: NonNull<u8>, flags: CheckFlags) -> bool {
                report_check(HeapKind::Expanding, flags, self.head().validate_used_block(ptr))
            }
        } else {
            /// Checks the consistency of the whole heap.
            ///
            /// Always `true` without the `debug` feature.
            #[must_use]
            pub fn check(&self, _flags: CheckFlags) -> bool {
                true
            }

            /// Checks a single allocated block.
            ///
            /// Always `true` without the `debug` feature.
            ///
            /// # Safety
            ///
            /// `ptr` must point into the managed range of this heap.
            #[must_use]
            pub unsafe fn check_block(&self, _ptr: NonNull<u8>, _flags: CheckFlags) -> bool {
                true
            }
        }
    }
}
