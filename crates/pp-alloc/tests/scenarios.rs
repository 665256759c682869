//! End-to-end allocator scenarios: coalescing, fragmentation metrics,
//! compaction-as-recovery, and relocation ordering.

use pp_alloc::PageAllocator;
use pp_error::PoolError;
use pp_types::{PageNumber, PageRange, PoolGeometry};

fn pool(total_pages: u64) -> PageAllocator {
    PageAllocator::new(PoolGeometry::new(total_pages).expect("geometry"))
}

fn extents(alloc: &PageAllocator) -> Vec<(u64, u64)> {
    alloc
        .free_extents()
        .map(|range| (range.start.0, range.length))
        .collect()
}

#[test]
fn alternating_frees_leave_isolated_extents_then_merge_to_one() {
    // Five 10-page entries covering the whole 50-page space.
    let mut alloc = pool(50);
    for i in 0..5 {
        let placed = alloc.allocate(&format!("entry{i}"), 10).expect("allocate");
        assert_eq!(placed.range.start, PageNumber(i * 10));
    }

    // Gaps at [10, 20) and [30, 40): nothing adjacent, nothing merges.
    alloc.deallocate("entry1").expect("free entry1");
    alloc.deallocate("entry3").expect("free entry3");
    assert_eq!(extents(&alloc), vec![(10, 10), (30, 10)]);
    assert_eq!(alloc.counters().coalesces, 0);

    // Freeing the rest stitches everything back into a single extent:
    // entry0 merges right, entry2 bridges both sides, entry4 merges left.
    alloc.deallocate("entry0").expect("free entry0");
    alloc.deallocate("entry2").expect("free entry2");
    alloc.deallocate("entry4").expect("free entry4");
    assert_eq!(extents(&alloc), vec![(0, 50)]);
    assert_eq!(alloc.counters().coalesces, 4);
    alloc.check_consistency();
}

#[test]
fn alternating_frees_with_trailing_extent() {
    // Same shape in a 100-page space: the untouched tail [50, 100)
    // participates in coalescing once entry4 goes.
    let mut alloc = pool(100);
    for i in 0..5 {
        alloc.allocate(&format!("entry{i}"), 10).expect("allocate");
    }

    alloc.deallocate("entry1").expect("free entry1");
    alloc.deallocate("entry3").expect("free entry3");
    assert_eq!(extents(&alloc), vec![(10, 10), (30, 10), (50, 50)]);
    assert_eq!(alloc.counters().coalesces, 0);

    alloc.deallocate("entry0").expect("free entry0");
    alloc.deallocate("entry2").expect("free entry2");
    alloc.deallocate("entry4").expect("free entry4");
    assert_eq!(extents(&alloc), vec![(0, 100)]);
    // entry0: one merge; entry2: bridges two; entry4: bridges [0, 40) and
    // the tail — five merges in total.
    assert_eq!(alloc.counters().coalesces, 5);
}

#[test]
fn every_other_entry_freed_yields_even_fragmentation() {
    let mut alloc = pool(50);
    for i in 0..10 {
        alloc.allocate(&format!("small{i}"), 5).expect("allocate");
    }
    for i in [1, 3, 5, 7, 9] {
        alloc.deallocate(&format!("small{i}")).expect("deallocate");
    }

    let stats = alloc.stats();
    assert_eq!(
        extents(&alloc),
        vec![(5, 5), (15, 5), (25, 5), (35, 5), (45, 5)]
    );
    assert_eq!(stats.total_free, 25);
    assert_eq!(stats.largest_block, 5);
    assert_eq!(stats.num_blocks, 5);
    assert!((stats.fragmentation_ratio - 0.8).abs() < 1e-9);
}

#[test]
fn compaction_is_not_attempted_when_capacity_is_short() {
    let mut alloc = pool(50);
    for i in 0..10 {
        alloc.allocate(&format!("small{i}"), 5).expect("allocate");
    }
    for i in [1, 3, 5, 7, 9] {
        alloc.deallocate(&format!("small{i}")).expect("deallocate");
    }

    // 25 pages free in blocks of 5: a 30-page request is short on raw
    // capacity, so it fails outright — compaction would not help.
    let err = alloc.allocate("big", 30).expect_err("insufficient");
    assert_eq!(
        err,
        PoolError::InsufficientSpace {
            requested: 30,
            total_free: 25,
            largest_block: 5,
        }
    );
    assert_eq!(alloc.counters().defragmentations, 0);
    assert_eq!(alloc.stats().num_blocks, 5);
}

#[test]
fn compaction_recovers_a_fragmented_but_sufficient_pool() {
    let mut alloc = pool(50);
    for i in 0..10 {
        alloc.allocate(&format!("small{i}"), 5).expect("allocate");
    }
    // Six entries freed: 30 pages total, still in blocks of at most 10.
    for i in [1, 3, 5, 7, 8, 9] {
        alloc.deallocate(&format!("small{i}")).expect("deallocate");
    }
    let before = alloc.stats();
    assert_eq!(before.total_free, 30);
    assert!(before.largest_block < 30);

    let placed = alloc.allocate("big", 30).expect("compaction recovery");
    assert_eq!(alloc.counters().defragmentations, 1);
    assert_eq!(placed.range.length, 30);
    // Survivors packed to [0, 20), "big" took the reclaimed tail exactly.
    assert_eq!(placed.range.start, PageNumber(20));
    assert_eq!(alloc.free_pages(), 0);
    for (i, expected) in [(0_u64, 0_u64), (2, 5), (4, 10), (6, 15)] {
        assert_eq!(
            alloc.lookup(&format!("small{i}")),
            Some(PageRange::new(PageNumber(expected), 5))
        );
    }
    alloc.check_consistency();
}

#[test]
fn compaction_preserves_current_address_order() {
    let mut alloc = pool(100);
    alloc.allocate("pad0", 10).expect("pad0");
    alloc.allocate("low", 5).expect("low");
    alloc.allocate("pad1", 55).expect("pad1");
    alloc.allocate("high", 5).expect("high");
    alloc.deallocate("pad0").expect("free pad0");
    alloc.deallocate("pad1").expect("free pad1");

    // Live allocations sit at 10 ("low") and 70 ("high").
    assert_eq!(alloc.lookup("low"), Some(PageRange::new(PageNumber(10), 5)));
    assert_eq!(alloc.lookup("high"), Some(PageRange::new(PageNumber(70), 5)));

    alloc.defragment();

    // Ascending-start order: "low" lands first, "high" directly after,
    // one trailing extent covers the remainder.
    assert_eq!(alloc.lookup("low"), Some(PageRange::new(PageNumber(0), 5)));
    assert_eq!(alloc.lookup("high"), Some(PageRange::new(PageNumber(5), 5)));
    assert_eq!(extents(&alloc), vec![(10, 90)]);
}

#[test]
fn rejected_requests_mutate_nothing() {
    let mut alloc = pool(40);
    alloc.allocate("keep", 8).expect("keep");
    let snapshot = extents(&alloc);
    let counters = alloc.counters();

    assert_eq!(alloc.allocate("zero", 0), Err(PoolError::InvalidLength));
    assert_eq!(
        alloc.deallocate("never-allocated"),
        Err(PoolError::NotFound("never-allocated".to_owned()))
    );

    assert_eq!(extents(&alloc), snapshot);
    assert_eq!(alloc.counters(), counters);
    assert_eq!(alloc.lookup("keep"), Some(PageRange::new(PageNumber(0), 8)));
}

#[test]
fn conservation_holds_across_a_mixed_sequence() {
    let mut alloc = pool(128);
    let total = alloc.total_pages();

    let script: &[(&str, u64)] = &[
        ("a", 17),
        ("b", 3),
        ("c", 40),
        ("d", 9),
        ("e", 25),
        ("f", 1),
    ];
    for (key, len) in script {
        alloc.allocate(key, *len).expect("allocate");
        let live: u64 = alloc.iter().map(|(_, range)| range.length).sum();
        assert_eq!(live + alloc.free_pages(), total);
    }
    for key in ["b", "d", "a"] {
        alloc.deallocate(key).expect("deallocate");
        let live: u64 = alloc.iter().map(|(_, range)| range.length).sum();
        assert_eq!(live + alloc.free_pages(), total);
    }
    alloc.defragment();
    let live: u64 = alloc.iter().map(|(_, range)| range.length).sum();
    assert_eq!(live + alloc.free_pages(), total);
    alloc.check_consistency();
}
