#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::alloc::{self, Layout};

use tiered_heap::{
    CheckFlags, ExpAllocMode, ExpHeap, FrameFreeMode, FrameHeap, HeapKind, HeapOptions,
    HeapRegistry, UnitHeap,
};

const ARENA_SIZE: usize = 64 * 1024;

fn with_arena<F>(test_fn: F)
where
    F: FnOnce(*mut u8, usize),
{
    let layout = Layout::from_size_align(ARENA_SIZE, 32).unwrap();
    unsafe {
        let arena = alloc::alloc(layout);
        assert!(!arena.is_null());
        test_fn(arena, ARENA_SIZE);
        alloc::dealloc(arena, layout);
    }
}

#[test]
fn nested_heaps_of_every_kind() {
    with_arena(|arena, size| unsafe {
        let mut registry = HeapRegistry::new();
        let mut root = ExpHeap::create(&mut registry, arena, size, HeapOptions::empty()).unwrap();
        root.set_alloc_mode(ExpAllocMode::BestFit);

        let frame_span = root.allocate(8 * 1024, 16).unwrap();
        let mut frame =
            FrameHeap::create(&mut registry, frame_span.as_ptr(), 8 * 1024, HeapOptions::empty())
                .unwrap();

        let unit_size = UnitHeap::calc_heap_size(48, 32, 16);
        let unit_span = frame.allocate(unit_size, -16).unwrap();
        let mut unit = UnitHeap::create(
            &mut registry,
            unit_span.as_ptr(),
            unit_size,
            48,
            16,
            HeapOptions::ZERO_CLEAR,
        )
        .unwrap();
        assert_eq!(unit.count_free(), 32);

        let inner_span = root.allocate(4 * 1024, -8).unwrap();
        let mut inner =
            ExpHeap::create(&mut registry, inner_span.as_ptr(), 4 * 1024, HeapOptions::empty())
                .unwrap();

        // Containment: every child lies inside its parent.
        let roots = registry.roots().collect::<Vec<_>>();
        assert_eq!(roots.len(), 1);
        let root_info = roots[0];
        assert_eq!(root_info.kind(), Some(HeapKind::Expanding));
        let children = root_info.children().collect::<Vec<_>>();
        assert_eq!(children.len(), 2);
        for child in &children {
            assert!(child.header_addr() >= root_info.range().start);
            assert!(child.range().end <= root_info.range().end);
            assert_eq!(child.parent().unwrap().header_addr(), root_info.header_addr());
        }
        let frame_info = children
            .iter()
            .find(|child| child.kind() == Some(HeapKind::Frame))
            .unwrap();
        let grandchildren = frame_info.children().collect::<Vec<_>>();
        assert_eq!(grandchildren.len(), 1);
        assert_eq!(grandchildren[0].kind(), Some(HeapKind::Unit));

        // Lookups resolve to the innermost heap.
        let block = unit.allocate().unwrap();
        assert_eq!(
            registry.find_containing(block.addr().get()).unwrap().kind(),
            Some(HeapKind::Unit)
        );
        let scratch = frame.allocate(64, 4).unwrap();
        assert_eq!(
            registry.find_containing(scratch.addr().get()).unwrap().kind(),
            Some(HeapKind::Frame)
        );
        let small = inner.allocate(64, 4).unwrap();
        assert_eq!(
            registry
                .find_containing(small.addr().get())
                .unwrap()
                .header_addr(),
            inner_span.addr().get()
        );

        let dump = format!("{}", registry.dump());
        assert!(dump.contains("Exp heap"), "{dump}");
        assert!(dump.contains("  Frame heap"), "{dump}");
        assert!(dump.contains("    Unit heap"), "{dump}");
        assert!(dump.contains("[Unit Heap]"), "{dump}");

        assert!(root.check(CheckFlags::PRINT_ERRORS));
        assert!(frame.check(CheckFlags::PRINT_ERRORS));
        assert!(unit.check(CheckFlags::PRINT_ERRORS));
        assert!(inner.check(CheckFlags::PRINT_ERRORS));

        // Tear down from the inside out.
        unit.free(block);
        unit.destroy(&mut registry);
        frame.free(FrameFreeMode::ALL);
        frame.destroy(&mut registry);
        inner.free(small);
        inner.destroy(&mut registry);
        root.free(frame_span);
        root.free(inner_span);
        assert!(root.check(CheckFlags::PRINT_ERRORS));
        assert_eq!(registry.roots().count(), 1);
        root.destroy(&mut registry);
        assert!(registry.is_empty());
    });
}

#[test]
fn destroying_a_parent_first_keeps_children_reachable() {
    with_arena(|arena, size| unsafe {
        let mut registry = HeapRegistry::new();
        let mut root = ExpHeap::create(&mut registry, arena, size, HeapOptions::empty()).unwrap();
        let span = root.allocate(16 * 1024, 4).unwrap();
        let mut middle =
            ExpHeap::create(&mut registry, span.as_ptr(), 16 * 1024, HeapOptions::empty()).unwrap();
        let leaf_span = middle.allocate(1024, 4).unwrap();
        let leaf =
            FrameHeap::create(&mut registry, leaf_span.as_ptr(), 1024, HeapOptions::empty()).unwrap();

        middle.destroy(&mut registry);
        let root_info = registry.roots().next().unwrap();
        let children = root_info.children().collect::<Vec<_>>();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].kind(), Some(HeapKind::Frame));
        assert_eq!(
            registry
                .find_containing(leaf.range().start)
                .unwrap()
                .kind(),
            Some(HeapKind::Frame)
        );

        leaf.destroy(&mut registry);
        root.free(span);
        root.destroy(&mut registry);
        assert!(registry.is_empty());
    });
}
