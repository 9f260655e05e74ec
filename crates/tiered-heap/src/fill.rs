//! Debug fill patterns.
//!
//! When a heap is created with [`HeapOptions::DEBUG_FILL`] and the `debug`
//! feature is enabled, the allocators paint memory with a 32-bit pattern on
//! three occasions:
//!
//! | Kind                  | Default       | Written when                        |
//! |-----------------------|---------------|-------------------------------------|
//! | [`FillKind::NoUse`]   | `0xC3C3_C3C3` | a heap is created                   |
//! | [`FillKind::Alloc`]   | `0xF3F3_F3F3` | a block is handed out               |
//! | [`FillKind::Free`]    | `0xD3D3_D3D3` | a block is returned                 |
//!
//! The pattern is laid out in little-endian order relative to 4-byte aligned
//! addresses, so a word-aligned `u32` read of filled memory yields the
//! pattern itself.
//!
//! The patterns are process-wide. Without the `debug` feature the setters and
//! getters are no-ops that return `0`.

use crate::common::HeapOptions;

/// Selects one of the three debug fill patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillKind {
    /// Memory that has never been handed out.
    NoUse,
    /// Memory just handed out by an allocator.
    Alloc,
    /// Memory just returned to an allocator.
    Free,
}

cfg_if::cfg_if! {
    if #[cfg(feature = "debug")] {
        use core::sync::atomic::{AtomicU32, Ordering};

        static FILL_VALUES: [AtomicU32; 3] = [
            AtomicU32::new(0xC3C3_C3C3),
            AtomicU32::new(0xF3F3_F3F3),
            AtomicU32::new(0xD3D3_D3D3),
        ];

        /// Sets the pattern used for `kind` and returns the previous one.
        pub fn set_fill_value(kind: FillKind, value: u32) -> u32 {
            FILL_VALUES[kind as usize].swap(value, Ordering::Relaxed)
        }

        /// Returns the pattern currently used for `kind`.
        #[must_use]
        pub fn fill_value(kind: FillKind) -> u32 {
            FILL_VALUES[kind as usize].load(Ordering::Relaxed)
        }

        /// Paints `len` bytes at `start` with `value`, aligned to 4-byte
        /// addresses.
        ///
        /// # Safety
        ///
        /// `start..start + len` must be valid for writes.
        unsafe fn fill_pattern(start: *mut u8, len: usize, value: u32) {
            let bytes = value.to_le_bytes();
            for i in 0..len {
                unsafe {
                    let p = start.add(i);
                    p.write(bytes[p.addr() % 4]);
                }
            }
        }

        unsafe fn debug_fill(options: HeapOptions, kind: FillKind, start: *mut u8, len: usize) {
            if options.contains(HeapOptions::DEBUG_FILL) {
                unsafe { fill_pattern(start, len, fill_value(kind)) }
            }
        }
    } else {
        /// Sets the pattern used for `kind` and returns the previous one.
        ///
        /// Always returns `0` without the `debug` feature.
        pub fn set_fill_value(_kind: FillKind, _value: u32) -> u32 {
            0
        }

        /// Returns the pattern currently used for `kind`.
        ///
        /// Always returns `0` without the `debug` feature.
        #[must_use]
        pub fn fill_value(_kind: FillKind) -> u32 {
            0
        }

        unsafe fn debug_fill(_options: HeapOptions, _kind: FillKind, _start: *mut u8, _len: usize) {}
    }
}

/// Fills memory that a new heap takes over.
pub(crate) unsafe fn fill_no_use(options: HeapOptions, start: *mut u8, len: usize) {
    unsafe { debug_fill(options, FillKind::NoUse, start, len) }
}

/// Prepares a block that is about to be handed out.
///
/// Zero-clearing takes precedence over the debug pattern.
pub(crate) unsafe fn fill_alloc(options: HeapOptions, start: *mut u8, len: usize) {
    if options.contains(HeapOptions::ZERO_CLEAR) {
        unsafe { start.write_bytes(0, len) }
    } else {
        unsafe { debug_fill(options, FillKind::Alloc, start, len) }
    }
}

/// Fills a block that was just returned.
pub(crate) unsafe fn fill_free(options: HeapOptions, start: *mut u8, len: usize) {
    unsafe { debug_fill(options, FillKind::Free, start, len) }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::with_test_span;

    #[test]
    fn test_zero_clear_without_debug_fill() {
        with_test_span(64, |start, size| unsafe {
            start.write_bytes(0xAA, size);
            fill_alloc(HeapOptions::ZERO_CLEAR, start, size);
            assert!((0..size).all(|i| *start.add(i) == 0));
            fill_free(HeapOptions::empty(), start, size);
            assert!((0..size).all(|i| *start.add(i) == 0));
        });
    }

    // All fill value manipulation lives in one test because the values are
    // shared by every test in the process.
    #[cfg(feature = "debug")]
    #[test]
    fn test_fill_values() {
        assert_eq!(fill_value(FillKind::NoUse), 0xC3C3_C3C3);
        assert_eq!(fill_value(FillKind::Alloc), 0xF3F3_F3F3);
        assert_eq!(fill_value(FillKind::Free), 0xD3D3_D3D3);

        let old = set_fill_value(FillKind::Free, 0x0102_0304);
        assert_eq!(old, 0xD3D3_D3D3);
        with_test_span(16, |start, size| unsafe {
            fill_free(HeapOptions::DEBUG_FILL, start, size);
            assert_eq!(start.cast::<u32>().read(), 0x0102_0304);
            assert_eq!(start.add(12).cast::<u32>().read(), 0x0102_0304);
            // Unaligned fills keep the pattern phase of the address.
            start.write_bytes(0, size);
            fill_free(HeapOptions::DEBUG_FILL, start.add(1), 3);
            assert_eq!(start.cast::<u32>().read(), 0x0102_0300);
        });
        assert_eq!(set_fill_value(FillKind::Free, old), 0x0102_0304);
        assert_eq!(fill_value(FillKind::Free), 0xD3D3_D3D3);

        with_test_span(16, |start, size| unsafe {
            fill_alloc(HeapOptions::DEBUG_FILL, start, size);
            assert_eq!(start.cast::<u32>().read(), 0xF3F3_F3F3);
            fill_alloc(HeapOptions::DEBUG_FILL | HeapOptions::ZERO_CLEAR, start, size);
            assert_eq!(start.cast::<u32>().read(), 0);
        });
    }
}
