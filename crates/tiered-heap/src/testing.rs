//! Helpers shared by the unit tests.

use std::alloc::{self, Layout};

/// Runs `test_fn` with a fresh span of `size` bytes aligned to 16 bytes.
///
/// The span is filled with `0x11` before the test runs and released
/// afterwards.
pub(crate) fn with_test_span<F>(size: usize, test_fn: F)
where
    F: FnOnce(*mut u8, usize),
{
    unsafe {
        let layout = Layout::from_size_align(size, 16).unwrap();
        let start = alloc::alloc(layout);
        assert!(!start.is_null());
        start.write_bytes(0x11, size);
        test_fn(start, size);
        alloc::dealloc(start, layout);
    }
}

/// Asserts that `len` bytes at `ptr` all equal `value`.
pub(crate) unsafe fn assert_filled(ptr: *const u8, len: usize, value: u8) {
    for i in 0..len {
        assert_eq!(unsafe { ptr.add(i).read() }, value, "byte {i} of {ptr:p}");
    }
}
