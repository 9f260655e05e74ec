//! An expanding heap behind a spin lock, usable as a global allocator.
//!
//! ```rust,no_run
//! use tiered_heap::{ExpHeap, HeapOptions, HeapRegistry, LockedExpHeap};
//!
//! #[global_allocator]
//! static ALLOCATOR: LockedExpHeap = LockedExpHeap::empty();
//!
//! static mut ARENA: [u8; 65536] = [0; 65536];
//!
//! fn init(registry: &mut HeapRegistry) {
//!     let arena = &raw mut ARENA;
//!     let heap = unsafe {
//!         ExpHeap::create(registry, arena.cast(), 65536, HeapOptions::empty()).unwrap()
//!     };
//!     ALLOCATOR.replace(heap);
//! }
//! # fn main() {}
//! ```

use core::{
    alloc::{GlobalAlloc, Layout},
    cmp, ptr,
    ptr::NonNull,
};

use spin::{Mutex, MutexGuard};

use crate::{
    ExpHeap,
    common::{MAX_ALIGNMENT, MIN_ALIGNMENT},
};

/// An [`ExpHeap`] shared through a [`spin::Mutex`].
///
/// Until a heap is installed with [`replace`](Self::replace), every
/// allocation fails.
#[derive(Debug)]
pub struct LockedExpHeap {
    heap: Mutex<Option<ExpHeap>>,
}

impl Default for LockedExpHeap {
    fn default() -> Self {
        Self::empty()
    }
}

impl LockedExpHeap {
    /// Creates an allocator without a heap.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            heap: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn new(heap: ExpHeap) -> Self {
        Self {
            heap: Mutex::new(Some(heap)),
        }
    }

    /// Installs `heap` and returns the heap previously installed.
    ///
    /// Blocks handed out by the previous heap must not be released through
    /// this allocator afterwards.
    pub fn replace(&self, heap: ExpHeap) -> Option<ExpHeap> {
        self.heap.lock().replace(heap)
    }

    /// Removes the installed heap, for example to destroy it.
    pub fn take(&self) -> Option<ExpHeap> {
        self.heap.lock().take()
    }

    /// Locks the allocator and gives access to the installed heap.
    pub fn lock(&self) -> MutexGuard<'_, Option<ExpHeap>> {
        self.heap.lock()
    }

    /// Converts a layout alignment into the alignment argument of
    /// [`ExpHeap::allocate`], or `None` if the heap cannot honor it.
    fn heap_alignment(layout: Layout) -> Option<i32> {
        let align = cmp::max(layout.align(), MIN_ALIGNMENT);
        if align > MAX_ALIGNMENT {
            return None;
        }
        i32::try_from(align).ok()
    }
}

unsafe impl GlobalAlloc for LockedExpHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(alignment) = Self::heap_alignment(layout) else {
            return ptr::null_mut();
        };
        self.heap
            .lock()
            .as_mut()
            .and_then(|heap| heap.allocate(layout.size(), alignment))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if let Some(heap) = self.heap.lock().as_mut() {
            unsafe {
                heap.free(ptr);
            }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(block) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        {
            let mut guard = self.heap.lock();
            let Some(heap) = guard.as_mut() else {
                return ptr::null_mut();
            };
            if unsafe { heap.resize(block, new_size) } >= new_size {
                return ptr;
            }
        }

        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        unsafe {
            let new_ptr = self.alloc(new_layout);
            if !new_ptr.is_null() {
                ptr::copy_nonoverlapping(ptr, new_ptr, cmp::min(layout.size(), new_size));
                self.dealloc(ptr, layout);
            }
            new_ptr
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CheckFlags, HeapOptions, HeapRegistry, testing::with_test_span};

    fn with_locked_heap<F>(size: usize, test_fn: F)
    where
        F: FnOnce(&LockedExpHeap),
    {
        with_test_span(size, |start, size| unsafe {
            let mut registry = HeapRegistry::new();
            let heap = ExpHeap::create(&mut registry, start, size, HeapOptions::empty()).unwrap();
            let locked = LockedExpHeap::new(heap);
            test_fn(&locked);
            let heap = locked.take().unwrap();
            assert!(heap.check(CheckFlags::PRINT_ERRORS));
            heap.destroy(&mut registry);
        });
    }

    #[test]
    fn test_empty_allocator_fails() {
        let locked = LockedExpHeap::empty();
        let layout = Layout::from_size_align(16, 8).unwrap();
        unsafe {
            assert!(locked.alloc(layout).is_null());
        }
        assert!(locked.take().is_none());
    }

    #[test]
    fn test_alloc_and_dealloc() {
        with_locked_heap(4096, |locked| unsafe {
            let free_before = locked.lock().as_ref().unwrap().total_free_size();
            let small = Layout::from_size_align(3, 1).unwrap();
            let aligned = Layout::from_size_align(100, 32).unwrap();
            let a = locked.alloc(small);
            let b = locked.alloc(aligned);
            assert!(!a.is_null() && !b.is_null());
            assert!(a.addr().is_multiple_of(MIN_ALIGNMENT));
            assert!(b.addr().is_multiple_of(32));
            locked.dealloc(a, small);
            locked.dealloc(b, aligned);
            assert_eq!(locked.lock().as_ref().unwrap().total_free_size(), free_before);
        });
    }

    #[test]
    fn test_over_aligned_request_fails() {
        with_locked_heap(4096, |locked| unsafe {
            let layout = Layout::from_size_align(64, 64).unwrap();
            assert!(locked.alloc(layout).is_null());
        });
    }

    #[test]
    fn test_realloc() {
        with_locked_heap(4096, |locked| unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let a = locked.alloc(layout);
            a.write_bytes(0x42, 64);

            // The block is followed by free space, so it grows in place.
            let grown = locked.realloc(a, layout, 128);
            assert_eq!(grown, a);

            let layout = Layout::from_size_align(128, 8).unwrap();
            let blocker = locked.alloc(layout);
            let moved = locked.realloc(grown, layout, 512);
            assert!(!moved.is_null());
            assert_ne!(moved, grown);
            for i in 0..64 {
                assert_eq!(moved.add(i).read(), 0x42);
            }

            let layout = Layout::from_size_align(512, 8).unwrap();
            locked.dealloc(moved, layout);
            locked.dealloc(blocker, Layout::from_size_align(128, 8).unwrap());
        });
    }

    #[test]
    fn test_replace() {
        with_test_span(2048, |start, size| unsafe {
            let mut registry = HeapRegistry::new();
            let locked = LockedExpHeap::default();
            let heap = ExpHeap::create(&mut registry, start, size, HeapOptions::empty()).unwrap();
            assert!(locked.replace(heap).is_none());
            let layout = Layout::from_size_align(16, 4).unwrap();
            let ptr = locked.alloc(layout);
            assert!(!ptr.is_null());
            locked.dealloc(ptr, layout);
            locked.take().unwrap().destroy(&mut registry);
            assert!(registry.is_empty());
        });
    }
}
