#![forbid(unsafe_code)]
//! Contiguous page allocation with coalescing free extents and compaction.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **`FreeExtentIndex`** — every currently-unused page range, keyed by
//!    start page in a `BTreeMap`. Non-overlapping, sorted, and never
//!    adjacent: merging happens eagerly on every release.
//! 2. **`AllocationTable`** — unique key → [`PageRange`] mapping with a
//!    sorted-by-start drain used for compaction ordering.
//! 3. **`PageAllocator`** — orchestration: best-fit placement, release with
//!    coalescing, and full compaction as allocation-failure recovery. The
//!    single source of truth for "is page P free or allocated, and to whom".
//! 4. **[`analyze`]** — pure read-only fragmentation metrics over the free
//!    extent index; informs external reporting, never placement.
//!
//! Every operation runs to completion synchronously; embedding in a
//! concurrent host goes through [`SharedAllocator`], which serializes
//! mutations behind one lock.

use parking_lot::RwLock;
use pp_error::{PoolError, Result};
use pp_types::{PageNumber, PageRange, PoolGeometry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info};

// ── Free extent index ───────────────────────────────────────────────────────

/// All currently-unused page ranges, keyed by start page.
///
/// The `BTreeMap` gives the ascending scan order that best-fit and the
/// neighbor lookups that coalescing need, without the back-link maintenance
/// a hand-rolled doubly-linked structure would require.
///
/// Invariants (hold between public calls):
/// - extents are pairwise non-overlapping;
/// - no two extents are adjacent — `release` merges eagerly;
/// - `total_free` equals the sum of all extent lengths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeExtentIndex {
    extents: BTreeMap<u64, u64>,
    total_free: u64,
}

impl FreeExtentIndex {
    /// Empty index (no free pages).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index holding a single extent covering `range`.
    #[must_use]
    pub fn covering(range: PageRange) -> Self {
        let mut extents = BTreeMap::new();
        extents.insert(range.start.0, range.length);
        Self {
            extents,
            total_free: range.length,
        }
    }

    /// Sum of all free extent lengths.
    #[must_use]
    pub fn total_free(&self) -> u64 {
        self.total_free
    }

    /// Number of free extents.
    #[must_use]
    pub fn num_extents(&self) -> usize {
        self.extents.len()
    }

    /// Length of the largest free extent, 0 if none.
    #[must_use]
    pub fn largest(&self) -> u64 {
        self.extents.values().copied().max().unwrap_or(0)
    }

    /// Free extents in ascending start order.
    pub fn iter(&self) -> impl Iterator<Item = PageRange> + '_ {
        self.extents
            .iter()
            .map(|(&start, &length)| PageRange::new(PageNumber(start), length))
    }

    /// Best-fit lookup: the smallest extent with capacity for `length`,
    /// lowest start on ties. An exact fit short-circuits the scan.
    #[must_use]
    pub fn best_fit(&self, length: u64) -> Option<PageRange> {
        let mut best: Option<(u64, u64)> = None;
        for (&start, &capacity) in &self.extents {
            if capacity < length {
                continue;
            }
            if capacity == length {
                return Some(PageRange::new(PageNumber(start), capacity));
            }
            match best {
                Some((_, best_capacity)) if capacity >= best_capacity => {}
                _ => best = Some((start, capacity)),
            }
        }
        best.map(|(start, capacity)| PageRange::new(PageNumber(start), capacity))
    }

    /// Carve `length` pages off the front of the extent starting at `start`.
    ///
    /// An exact fit unlinks the extent; a larger extent is shrunk in place.
    /// The extent must exist and have sufficient capacity — callers pass a
    /// result of [`best_fit`](Self::best_fit), anything else is a bug.
    pub fn consume(&mut self, start: PageNumber, length: u64) {
        let capacity = self
            .extents
            .remove(&start.0)
            .unwrap_or_else(|| panic!("consume of unindexed extent at page {start}"));
        assert!(
            capacity >= length,
            "consume of {length} pages from extent of {capacity} at page {start}"
        );
        if capacity > length {
            self.extents.insert(start.0 + length, capacity - length);
        }
        self.total_free -= length;
    }

    /// Return `range` to the index, merging with adjacent neighbors.
    ///
    /// Returns the number of merges performed (0, 1, or 2 — a release that
    /// closes a three-way gap merges transitively in one call).
    ///
    /// Releasing pages that overlap an indexed extent is a double-free in
    /// the caller and aborts.
    pub fn release(&mut self, range: PageRange) -> u64 {
        let start = range.start.0;
        let mut length = range.length;
        assert!(length > 0, "release of empty range");

        if let Some((&prev_start, &prev_len)) = self.extents.range(..start).next_back() {
            assert!(
                prev_start + prev_len <= start,
                "release of {range} overlaps free extent at page {prev_start}"
            );
        }
        if let Some((&next_start, _)) = self.extents.range(start..).next() {
            assert!(
                start + length <= next_start,
                "release of {range} overlaps free extent at page {next_start}"
            );
        }

        self.extents.insert(start, length);
        self.total_free += length;

        let mut merges = 0;

        // Absorb the following extent.
        if let Some((&next_start, &next_len)) = self
            .extents
            .range((Bound::Excluded(start), Bound::Unbounded))
            .next()
            && start + length == next_start
        {
            self.extents.remove(&next_start);
            length += next_len;
            self.extents.insert(start, length);
            merges += 1;
        }

        // Fold into the preceding extent. Evaluated against the post-merge
        // state, so a release bridging prev and next collapses all three.
        if let Some((&prev_start, &prev_len)) = self.extents.range(..start).next_back()
            && prev_start + prev_len == start
        {
            self.extents.remove(&start);
            self.extents.insert(prev_start, prev_len + length);
            merges += 1;
        }

        merges
    }

    /// Replace the entire index with at most one trailing extent.
    ///
    /// Compaction support: discards all current extents and, when `tail` is
    /// present, installs it as the sole free extent.
    pub fn rebuild(&mut self, tail: Option<PageRange>) {
        self.extents.clear();
        self.total_free = 0;
        if let Some(range) = tail {
            self.extents.insert(range.start.0, range.length);
            self.total_free = range.length;
        }
    }
}

// ── Fragmentation analyzer ──────────────────────────────────────────────────

/// Health metrics over the free extent index.
///
/// `fragmentation_ratio` is `1 - largest_block / total_free` (0 when no
/// pages are free): 0 means all free space is one block, values toward 1
/// mean the free space is shattered across many small extents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FragStats {
    pub total_free: u64,
    pub largest_block: u64,
    pub num_blocks: u64,
    pub fragmentation_ratio: f64,
}

/// Compute [`FragStats`] for an index. Read-only; influences no placement
/// decision — the allocator's compaction trigger compares raw capacity.
#[must_use]
pub fn analyze(index: &FreeExtentIndex) -> FragStats {
    let total_free = index.total_free();
    let largest_block = index.largest();
    let fragmentation_ratio = if total_free > 0 {
        #[expect(clippy::cast_precision_loss)]
        let ratio = 1.0 - (largest_block as f64) / (total_free as f64);
        ratio
    } else {
        0.0
    };
    FragStats {
        total_free,
        largest_block,
        num_blocks: index.num_extents() as u64,
        fragmentation_ratio,
    }
}

// ── Allocation table ────────────────────────────────────────────────────────

/// Unique key → current page range.
///
/// Point lookups and removals go through the hash map; compaction drains a
/// sorted-by-start snapshot instead of keeping a second ordered structure
/// in sync on every mutation.
#[derive(Debug, Clone, Default)]
pub struct AllocationTable {
    entries: HashMap<String, PageRange>,
}

impl AllocationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<PageRange> {
        self.entries.get(key).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, PageRange)> + '_ {
        self.entries.iter().map(|(key, &range)| (key.as_str(), range))
    }

    /// Record an allocation. The key must be fresh — the allocator rejects
    /// duplicates before placement, so a collision here is a bug.
    pub fn insert(&mut self, key: String, range: PageRange) {
        let previous = self.entries.insert(key, range);
        assert!(previous.is_none(), "allocation table key collision");
    }

    pub fn remove(&mut self, key: &str) -> Option<PageRange> {
        self.entries.remove(key)
    }

    /// Drain every entry, sorted ascending by current start page.
    ///
    /// Key order breaks ties; equal starts cannot occur while ranges are
    /// disjoint, but the sort stays deterministic regardless.
    #[must_use]
    pub fn drain_sorted_by_start(&mut self) -> Vec<(String, PageRange)> {
        let mut entries: Vec<(String, PageRange)> = self.entries.drain().collect();
        entries.sort_by(|(a_key, a), (b_key, b)| {
            a.start.cmp(&b.start).then_with(|| a_key.cmp(b_key))
        });
        entries
    }
}

// ── Allocation results ──────────────────────────────────────────────────────

/// One allocation moved by compaction: `length` pages went from `from` to
/// `to`. Emitted in ascending `from` order with `to <= from`, so applying
/// moves in order never clobbers bytes that are still waiting to move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relocation {
    pub key: String,
    pub from: PageNumber,
    pub to: PageNumber,
    pub length: u64,
}

/// Result of a successful allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageAlloc {
    /// The range now owned by the key.
    pub range: PageRange,
    /// Relocations performed by the compaction pass that made room, empty
    /// when the request was placed directly. Data-carrying layers must
    /// apply these before writing into `range`.
    pub relocations: Vec<Relocation>,
}

/// Per-instance operation counters. Reset only at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounters {
    pub allocations: u64,
    pub deallocations: u64,
    pub coalesces: u64,
    pub defragmentations: u64,
}

// ── Page allocator ──────────────────────────────────────────────────────────

/// Fixed-capacity allocator over `[0, total_pages)`.
///
/// Hands out contiguous page ranges to named keys with best-fit placement,
/// reclaims them with eager coalescing, and compacts the whole space when
/// fragmentation alone blocks a request.
#[derive(Debug, Clone)]
pub struct PageAllocator {
    geometry: PoolGeometry,
    free: FreeExtentIndex,
    table: AllocationTable,
    counters: PoolCounters,
}

impl PageAllocator {
    /// A fully-free allocator: one extent covering the whole page space.
    #[must_use]
    pub fn new(geometry: PoolGeometry) -> Self {
        Self {
            geometry,
            free: FreeExtentIndex::covering(geometry.full_range()),
            table: AllocationTable::new(),
            counters: PoolCounters::default(),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> PoolGeometry {
        self.geometry
    }

    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.geometry.total_pages()
    }

    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.free.total_free()
    }

    /// Number of live allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    #[must_use]
    pub fn counters(&self) -> PoolCounters {
        self.counters
    }

    /// Current range for `key`, if allocated. Stale after any
    /// [`defragment`](Self::defragment) — re-query, don't cache.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<PageRange> {
        self.table.get(key)
    }

    /// Live allocations in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, PageRange)> + '_ {
        self.table.iter()
    }

    /// Fragmentation metrics for the current free space.
    #[must_use]
    pub fn stats(&self) -> FragStats {
        analyze(&self.free)
    }

    /// Allocate `length` contiguous pages for `key`.
    ///
    /// Placement is best-fit. When no single extent fits but the total free
    /// capacity would, one compaction runs and the lookup retries exactly
    /// once — never in a loop. Failures mutate nothing: the compaction path
    /// only runs when it guarantees the retry succeeds.
    pub fn allocate(&mut self, key: &str, length: u64) -> Result<PageAlloc> {
        if length == 0 {
            return Err(PoolError::InvalidLength);
        }
        if self.table.contains(key) {
            return Err(PoolError::DuplicateKey(key.to_owned()));
        }

        let mut relocations = Vec::new();
        let mut candidate = self.free.best_fit(length);

        if candidate.is_none() && self.free.total_free() >= length {
            debug!(
                requested = length,
                total_free = self.free.total_free(),
                largest_block = self.free.largest(),
                "fragmented_allocation_recovery"
            );
            relocations = self.defragment();
            candidate = self.free.best_fit(length);
        }

        let Some(extent) = candidate else {
            return Err(PoolError::InsufficientSpace {
                requested: length,
                total_free: self.free.total_free(),
                largest_block: self.free.largest(),
            });
        };

        let start = extent.start;
        self.free.consume(start, length);
        let range = PageRange::new(start, length);
        self.table.insert(key.to_owned(), range);
        self.counters.allocations += 1;
        debug!(key, start = start.0, length, "page_allocate");

        #[cfg(debug_assertions)]
        self.check_consistency();

        Ok(PageAlloc { range, relocations })
    }

    /// Release the range held by `key`, coalescing with free neighbors.
    ///
    /// Returns the freed range. Unknown keys fail with
    /// [`PoolError::NotFound`] and mutate nothing.
    pub fn deallocate(&mut self, key: &str) -> Result<PageRange> {
        let Some(range) = self.table.remove(key) else {
            return Err(PoolError::NotFound(key.to_owned()));
        };

        let merges = self.free.release(range);
        self.counters.coalesces += merges;
        self.counters.deallocations += 1;
        debug!(key, start = range.start.0, length = range.length, merges, "page_release");

        #[cfg(debug_assertions)]
        self.check_consistency();

        Ok(range)
    }

    /// Unconditional full compaction.
    ///
    /// Walks live allocations in ascending start order and packs them
    /// contiguously from page 0; the free extent index collapses to one
    /// trailing extent (or none when the space is full). Every previously
    /// fetched [`PageRange`] is stale afterwards.
    ///
    /// Returns the relocations performed, ascending by old start and only
    /// moving toward lower addresses — safe to apply to a backing store in
    /// order.
    pub fn defragment(&mut self) -> Vec<Relocation> {
        self.counters.defragmentations += 1;

        let entries = self.table.drain_sorted_by_start();
        let mut relocations = Vec::new();
        let mut cursor = 0_u64;

        for (key, range) in entries {
            if range.start.0 != cursor {
                relocations.push(Relocation {
                    key: key.clone(),
                    from: range.start,
                    to: PageNumber(cursor),
                    length: range.length,
                });
            }
            self.table
                .insert(key, PageRange::new(PageNumber(cursor), range.length));
            cursor += range.length;
        }

        let total = self.geometry.total_pages();
        let tail = (cursor < total).then(|| PageRange::new(PageNumber(cursor), total - cursor));
        self.free.rebuild(tail);

        info!(
            moved = relocations.len(),
            live = self.table.len(),
            free = self.free.total_free(),
            "compaction_complete"
        );

        #[cfg(debug_assertions)]
        self.check_consistency();

        relocations
    }

    /// Free extents in ascending start order (read-only view for reporting).
    pub fn free_extents(&self) -> impl Iterator<Item = PageRange> + '_ {
        self.free.iter()
    }

    /// Abort if any structural invariant is violated.
    ///
    /// Covers: free/allocated conservation, extent ordering, eager
    /// coalescing (no adjacent free extents), and disjointness of every
    /// range in the space. A failure here is an implementation bug, never
    /// caller error.
    pub fn check_consistency(&self) {
        let allocated: u64 = self.table.iter().map(|(_, range)| range.length).sum();
        assert_eq!(
            self.free.total_free() + allocated,
            self.geometry.total_pages(),
            "page accounting mismatch"
        );

        let mut previous: Option<PageRange> = None;
        for extent in self.free.iter() {
            assert!(extent.length > 0, "empty free extent at {}", extent.start);
            assert!(
                self.geometry.fits(extent),
                "free extent {extent} outside the page space"
            );
            if let Some(prev) = previous {
                assert!(
                    prev.end() < extent.start,
                    "free extents {prev} and {extent} overlap or are unmerged"
                );
            }
            previous = Some(extent);
        }

        let mut ranges: Vec<(PageRange, bool)> = self
            .table
            .iter()
            .map(|(_, range)| (range, true))
            .chain(self.free.iter().map(|range| (range, false)))
            .collect();
        ranges.sort_by_key(|(range, _)| range.start);
        for pair in ranges.windows(2) {
            let (a, _) = pair[0];
            let (b, _) = pair[1];
            assert!(!a.overlaps(b), "ranges {a} and {b} overlap");
        }
        for (range, _) in &ranges {
            assert!(
                self.geometry.fits(*range),
                "range {range} outside the page space"
            );
        }
    }
}

// ── Shared handle ───────────────────────────────────────────────────────────

/// Clonable handle serializing a [`PageAllocator`] for concurrent hosts.
///
/// # Concurrency
///
/// The allocator is behind a `parking_lot::RwLock`:
/// - **Statistics and lookups** acquire a shared (`read`) lock — many
///   concurrent readers.
/// - **`allocate` / `deallocate` / `defragment`** acquire an exclusive
///   (`write`) lock: each can restructure both the free extent index and
///   the allocation table, and compaction invalidates every outstanding
///   range, so no mutation may interleave with anything else.
#[derive(Debug, Clone)]
pub struct SharedAllocator {
    inner: Arc<RwLock<PageAllocator>>,
}

impl SharedAllocator {
    #[must_use]
    pub fn new(geometry: PoolGeometry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(PageAllocator::new(geometry))),
        }
    }

    pub fn allocate(&self, key: &str, length: u64) -> Result<PageAlloc> {
        self.inner.write().allocate(key, length)
    }

    pub fn deallocate(&self, key: &str) -> Result<PageRange> {
        self.inner.write().deallocate(key)
    }

    pub fn defragment(&self) -> Vec<Relocation> {
        self.inner.write().defragment()
    }

    #[must_use]
    pub fn stats(&self) -> FragStats {
        self.inner.read().stats()
    }

    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<PageRange> {
        self.inner.read().lookup(key)
    }

    #[must_use]
    pub fn counters(&self) -> PoolCounters {
        self.inner.read().counters()
    }

    /// Run `f` under the shared lock, e.g. to snapshot allocations and
    /// statistics atomically with respect to mutations.
    pub fn with_read<T>(&self, f: impl FnOnce(&PageAllocator) -> T) -> T {
        f(&self.inner.read())
    }
}
