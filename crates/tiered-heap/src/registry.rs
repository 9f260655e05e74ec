//! Bookkeeping of live heaps.
//!
//! Every heap created through this crate is recorded in a [`HeapRegistry`].
//! The registry keeps the heaps in a forest: a heap whose span (header
//! included) lies entirely inside the managed range of another heap becomes a
//! child of the innermost such heap, any other heap is a root.
//!
//! ```text
//! roots ─┬─ Exp heap [0x1000 - 0x9000)
//!        │    ├─ Frame heap [0x2040 - 0x3000)
//!        │    └─ Unit heap  [0x4030 - 0x4400)
//!        └─ Frame heap [0xa040 - 0xb000)
//! ```
//!
//! The registry is only touched when heaps are created and destroyed, and by
//! the introspection queries ([`HeapRegistry::find_containing`],
//! [`HeapRegistry::dump`]).

use core::{fmt, marker::PhantomData, ops::Range, ptr, ptr::NonNull};

use crate::{
    common::{HeapHead, HeapKind, HeapOptions},
    exp_heap::ExpHeapDump,
    frame_heap::FrameHeapDump,
    unit_heap::UnitHeapDump,
};

/// Intrusive doubly linked list of heap headers.
#[repr(C)]
pub(crate) struct HeapList {
    head: *mut HeapHead,
    tail: *mut HeapHead,
}

impl HeapList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    fn first(&self) -> *mut HeapHead {
        self.head
    }

    /// Appends `node` at the end of the list.
    ///
    /// # Safety
    ///
    /// `node` must point to a valid header that is not linked in any list.
    unsafe fn push_back(&mut self, node: *mut HeapHead) {
        unsafe {
            (*node).prev = self.tail;
            (*node).next = ptr::null_mut();
            if self.tail.is_null() {
                self.head = node;
            } else {
                (*self.tail).next = node;
            }
            self.tail = node;
        }
    }

    /// Unlinks `node` from the list.
    ///
    /// # Safety
    ///
    /// `node` must point to a valid header linked in this list.
    unsafe fn remove(&mut self, node: *mut HeapHead) {
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
            (*node).prev = ptr::null_mut();
            (*node).next = ptr::null_mut();
        }
    }

    /// Unlinks and returns the first node, if any.
    unsafe fn pop_front(&mut self) -> Option<*mut HeapHead> {
        let node = self.head;
        if node.is_null() {
            return None;
        }
        unsafe {
            self.remove(node);
        }
        Some(node)
    }

    fn contains(&self, node: *mut HeapHead) -> bool {
        let mut current = self.head;
        while !current.is_null() {
            if ptr::eq(current, node) {
                return true;
            }
            current = unsafe { (*current).next };
        }
        false
    }
}

/// Forest of every live heap.
///
/// Pass the same registry to the `create` and `destroy` functions of a heap.
/// A registry must outlive the heaps registered in it, and heaps must be
/// destroyed before their spans are reused.
pub struct HeapRegistry {
    roots: HeapList,
}

unsafe impl Send for HeapRegistry {}

impl Default for HeapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeapRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.roots()).finish()
    }
}

impl HeapRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            roots: HeapList::new(),
        }
    }

    /// Records a freshly initialized heap.
    ///
    /// The heap becomes a child of the innermost registered heap whose managed
    /// range contains the whole span of the new heap, from its header up to
    /// its `heap_end`. If there is none, it becomes a root.
    ///
    /// # Safety
    ///
    /// `head` must point to an initialized header that is not registered yet.
    pub(crate) unsafe fn register(&mut self, head: *mut HeapHead) {
        unsafe {
            let span = head.addr()..(*head).heap_end.addr();
            let parent = self.find_innermost(|range| {
                range.start <= span.start && span.end <= range.end
            });
            (*head).parent = parent;
            if parent.is_null() {
                self.roots.push_back(head);
                log::trace!("registered heap {:#x} as a root", head.addr());
            } else {
                (*parent).children.push_back(head);
                log::trace!(
                    "registered heap {:#x} as a child of heap {:#x}",
                    head.addr(),
                    parent.addr()
                );
            }
        }
    }

    /// Removes a heap from the registry.
    ///
    /// The children of the removed heap are handed over to its parent, or
    /// become roots when the removed heap was a root itself.
    ///
    /// # Safety
    ///
    /// `head` must point to a heap registered in this registry.
    pub(crate) unsafe fn unregister(&mut self, head: *mut HeapHead) {
        unsafe {
            let parent = (*head).parent;
            let list: *mut HeapList = if parent.is_null() {
                &raw mut self.roots
            } else {
                &raw mut (*parent).children
            };
            assert!(
                (*list).contains(head),
                "heap {:#x} is not registered here",
                head.addr()
            );
            (*list).remove(head);
            while let Some(child) = (*head).children.pop_front() {
                log::trace!(
                    "moving heap {:#x} out of destroyed heap {:#x}",
                    child.addr(),
                    head.addr()
                );
                (*child).parent = parent;
                (*list).push_back(child);
            }
            (*head).parent = ptr::null_mut();
            log::trace!("unregistered heap {:#x}", head.addr());
        }
    }

    /// Walks down the forest, each step entering the first heap of the current
    /// level whose range satisfies `pred`.
    fn find_innermost<F>(&self, mut pred: F) -> *mut HeapHead
    where
        F: FnMut(Range<usize>) -> bool,
    {
        let mut found = ptr::null_mut();
        let mut current = self.roots.first();
        while !current.is_null() {
            unsafe {
                if pred((*current).range()) {
                    found = current;
                    current = (*current).children.first();
                } else {
                    current = (*current).next;
                }
            }
        }
        found
    }

    /// Returns the innermost heap whose managed range contains `addr`.
    #[must_use]
    pub fn find_containing(&self, addr: usize) -> Option<HeapInfo<'_>> {
        let head = self.find_innermost(|range| range.contains(&addr));
        NonNull::new(head).map(HeapInfo::new)
    }

    /// Returns `true` if no heap is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.first().is_null()
    }

    /// Iterates over the heaps that are not nested in any other heap.
    pub fn roots(&self) -> HeapIter<'_> {
        HeapIter::new(self.roots.first())
    }

    /// Returns a [`Display`](fmt::Display) value rendering the whole forest
    /// followed by the dump of every heap.
    #[must_use]
    pub fn dump(&self) -> RegistryDump<'_> {
        RegistryDump { registry: self }
    }

    /// Logs [`dump`](Self::dump) at info level.
    pub fn log_dump(&self) {
        log::info!("{}", self.dump());
    }
}

/// Borrowed view of a registered heap.
#[derive(Clone, Copy)]
pub struct HeapInfo<'a> {
    head: NonNull<HeapHead>,
    _marker: PhantomData<&'a HeapRegistry>,
}

impl fmt::Debug for HeapInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let range = self.range();
        f.debug_struct("HeapInfo")
            .field("kind", &self.kind())
            .field("start", &format_args!("{:#x}", range.start))
            .field("end", &format_args!("{:#x}", range.end))
            .finish_non_exhaustive()
    }
}

impl<'a> HeapInfo<'a> {
    fn new(head: NonNull<HeapHead>) -> Self {
        Self {
            head,
            _marker: PhantomData,
        }
    }

    fn head(&self) -> &HeapHead {
        unsafe { self.head.as_ref() }
    }

    /// Returns the kind of the heap, or `None` if its header signature has
    /// been overwritten.
    #[must_use]
    pub fn kind(&self) -> Option<HeapKind> {
        self.head().kind()
    }

    /// Returns the address of the heap header, which is also the start of the
    /// span the heap was created on.
    #[must_use]
    pub fn header_addr(&self) -> usize {
        self.head.addr().get()
    }

    /// Returns the managed range `heap_start..heap_end`.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.head().range()
    }

    #[must_use]
    pub fn options(&self) -> HeapOptions {
        self.head().options()
    }

    /// Returns the heap this heap is nested in.
    #[must_use]
    pub fn parent(&self) -> Option<HeapInfo<'a>> {
        NonNull::new(self.head().parent).map(HeapInfo::new)
    }

    /// Iterates over the heaps nested directly in this heap.
    #[must_use]
    pub fn children(&self) -> HeapIter<'a> {
        HeapIter::new(self.head().children.first())
    }

    /// Returns a [`Display`](fmt::Display) value describing the heap and its
    /// blocks, chosen by the heap kind.
    #[must_use]
    pub fn dump(&self) -> HeapDump<'a> {
        unsafe {
            match self.kind() {
                Some(HeapKind::Expanding) => HeapDump::Expanding(ExpHeapDump::new(self.head.cast())),
                Some(HeapKind::Frame) => HeapDump::Frame(FrameHeapDump::new(self.head.cast())),
                Some(HeapKind::Unit) => HeapDump::Unit(UnitHeapDump::new(self.head.cast())),
                None => HeapDump::Invalid(self.header_addr()),
            }
        }
    }
}

/// Iterator over sibling heaps.
#[derive(Debug, Clone)]
pub struct HeapIter<'a> {
    next: *mut HeapHead,
    _marker: PhantomData<&'a HeapRegistry>,
}

impl HeapIter<'_> {
    fn new(first: *mut HeapHead) -> Self {
        Self {
            next: first,
            _marker: PhantomData,
        }
    }
}

impl<'a> Iterator for HeapIter<'a> {
    type Item = HeapInfo<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let head = NonNull::new(self.next)?;
        self.next = unsafe { head.as_ref().next };
        Some(HeapInfo::new(head))
    }
}

/// Dump of a single heap, see [`HeapInfo::dump`].
#[derive(Debug)]
pub enum HeapDump<'a> {
    Expanding(ExpHeapDump<'a>),
    Frame(FrameHeapDump<'a>),
    Unit(UnitHeapDump<'a>),
    /// The header at this address carries an unknown signature.
    Invalid(usize),
}

impl fmt::Display for HeapDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expanding(dump) => fmt::Display::fmt(dump, f),
            Self::Frame(dump) => fmt::Display::fmt(dump, f),
            Self::Unit(dump) => fmt::Display::fmt(dump, f),
            Self::Invalid(addr) => writeln!(f, "[Heap] bad heap signature at {addr:#x}"),
        }
    }
}

/// Dump of a whole registry, see [`HeapRegistry::dump`].
#[derive(Debug)]
pub struct RegistryDump<'a> {
    registry: &'a HeapRegistry,
}

impl fmt::Display for RegistryDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_tree(f: &mut fmt::Formatter<'_>, heaps: HeapIter<'_>, depth: usize) -> fmt::Result {
            for heap in heaps {
                let range = heap.range();
                let kind = heap.kind();
                let kind: &dyn fmt::Display = match &kind {
                    Some(kind) => kind,
                    None => &"Unknown",
                };
                writeln!(
                    f,
                    "{:indent$}{kind} heap [{:#x} - {:#x})",
                    "",
                    range.start,
                    range.end,
                    indent = depth * 2
                )?;
                fmt_tree(f, heap.children(), depth + 1)?;
            }
            Ok(())
        }

        fn fmt_dumps(f: &mut fmt::Formatter<'_>, heaps: HeapIter<'_>) -> fmt::Result {
            for heap in heaps {
                write!(f, "{}", heap.dump())?;
                fmt_dumps(f, heap.children())?;
            }
            Ok(())
        }

        if self.registry.is_empty() {
            return writeln!(f, "no heaps registered");
        }
        fmt_tree(f, self.registry.roots(), 0)?;
        fmt_dumps(f, self.registry.roots())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::{ExpHeap, FrameHeap, UnitHeap, testing::with_test_span};

    fn kinds(heaps: HeapIter<'_>) -> Vec<Option<HeapKind>> {
        heaps.map(|heap| heap.kind()).collect()
    }

    #[test]
    fn test_empty_registry() {
        let registry = HeapRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.find_containing(0x1000).is_none());
        assert_eq!(registry.roots().count(), 0);
        assert_eq!(std::format!("{}", registry.dump()), "no heaps registered\n");
    }

    #[test]
    fn test_roots_and_nesting() {
        with_test_span(4096, |start, size| unsafe {
            let mut registry = HeapRegistry::new();
            let mut outer =
                ExpHeap::create(&mut registry, start, size, HeapOptions::empty()).unwrap();
            let inner_span = outer.allocate(1024, 4).unwrap();
            let inner = FrameHeap::create(
                &mut registry,
                inner_span.as_ptr(),
                1024,
                HeapOptions::empty(),
            )
            .unwrap();

            assert_eq!(kinds(registry.roots()), [Some(HeapKind::Expanding)]);
            let root = registry.roots().next().unwrap();
            assert_eq!(kinds(root.children()), [Some(HeapKind::Frame)]);

            let found = registry.find_containing(inner.range().start).unwrap();
            assert_eq!(found.kind(), Some(HeapKind::Frame));
            assert_eq!(found.range(), inner.range());
            assert_eq!(found.parent().unwrap().range(), outer.range());

            // The header of the inner heap is managed by the outer heap only.
            let found = registry.find_containing(inner_span.addr().get()).unwrap();
            assert_eq!(found.kind(), Some(HeapKind::Expanding));

            let dump = std::format!("{}", registry.dump());
            assert!(dump.contains("Exp heap ["), "{dump}");
            assert!(dump.contains("\n  Frame heap ["), "{dump}");

            inner.destroy(&mut registry);
            let root = registry.roots().next().unwrap();
            assert!(root.children().next().is_none());
            outer.destroy(&mut registry);
            assert!(registry.is_empty());
        });
    }

    #[test]
    fn test_destroy_reparents_children() {
        with_test_span(8192, |start, size| unsafe {
            let mut registry = HeapRegistry::new();
            let mut outer =
                ExpHeap::create(&mut registry, start, size, HeapOptions::empty()).unwrap();
            let middle_span = outer.allocate(4096, 4).unwrap();
            let mut middle = ExpHeap::create(
                &mut registry,
                middle_span.as_ptr(),
                4096,
                HeapOptions::empty(),
            )
            .unwrap();
            let unit_span = middle.allocate(512, 4).unwrap();
            let unit = UnitHeap::create(
                &mut registry,
                unit_span.as_ptr(),
                512,
                16,
                4,
                HeapOptions::empty(),
            )
            .unwrap();

            let unit_addr = unit.range().start;
            assert_eq!(
                registry.find_containing(unit_addr).unwrap().kind(),
                Some(HeapKind::Unit)
            );
            assert_eq!(
                registry
                    .find_containing(unit_addr)
                    .unwrap()
                    .parent()
                    .unwrap()
                    .range(),
                middle.range()
            );

            middle.destroy(&mut registry);
            let found = registry.find_containing(unit_addr).unwrap();
            assert_eq!(found.kind(), Some(HeapKind::Unit));
            assert_eq!(found.parent().unwrap().range(), outer.range());

            outer.destroy(&mut registry);
            assert_eq!(kinds(registry.roots()), [Some(HeapKind::Unit)]);
            assert!(registry.find_containing(unit_addr).unwrap().parent().is_none());
            unit.destroy(&mut registry);
            assert!(registry.is_empty());
        });
    }

    #[test]
    fn test_sibling_roots() {
        with_test_span(2048, |start, _size| unsafe {
            let mut registry = HeapRegistry::new();
            let first = FrameHeap::create(&mut registry, start, 1024, HeapOptions::empty()).unwrap();
            let second =
                FrameHeap::create(&mut registry, start.add(1024), 1024, HeapOptions::empty())
                    .unwrap();
            assert_eq!(registry.roots().count(), 2);
            assert!(registry.find_containing(first.range().start).is_some());
            assert!(registry.find_containing(start.addr()).is_none());

            first.destroy(&mut registry);
            let remaining = registry.roots().map(|heap| heap.range()).collect::<Vec<_>>();
            assert_eq!(remaining, [second.range()]);
            second.destroy(&mut registry);
        });
    }
}
