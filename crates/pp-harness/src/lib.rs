#![forbid(unsafe_code)]
//! Demo scenarios, workload simulation, and occupancy reporting.
//!
//! Everything here is a thin consumer of the allocator's public surface —
//! `stats()`, `counters()`, allocation enumeration — with no access to
//! internal extent structures. Reports are plain serde types so the CLI
//! can print them as text or JSON.

use pp_alloc::{FragStats, PageAllocator, PoolCounters};
use pp_cache::{CacheConfig, CacheCounters, EvictionPolicy, PageCache};
use pp_types::PoolGeometry;
use serde::{Deserialize, Serialize};
use tracing::info;

// ── Occupancy visualization ─────────────────────────────────────────────────

/// Render the page space as one line of `#` (allocated) and `.` (free),
/// downscaled to at most `width` cells.
///
/// Built from allocation enumeration only: a cell shows `#` when any live
/// allocation covers a page inside the cell's window.
#[must_use]
pub fn visualize(alloc: &PageAllocator, width: usize) -> String {
    let total = alloc.total_pages();
    #[expect(clippy::cast_possible_truncation)]
    let cells = width.min(total as usize).max(1);
    let mut row = vec![b'.'; cells];

    for (_, range) in alloc.iter() {
        let first = (range.start.0 * cells as u64) / total;
        let last = ((range.end().0 - 1) * cells as u64) / total;
        #[expect(clippy::cast_possible_truncation)]
        for cell in &mut row[first as usize..=last as usize] {
            *cell = b'#';
        }
    }

    String::from_utf8(row).unwrap_or_default()
}

// ── Pool snapshot ───────────────────────────────────────────────────────────

/// Point-in-time view of a pool, fit for console or JSON reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub total_pages: u64,
    pub live_entries: usize,
    pub allocated_pages: u64,
    pub stats: FragStats,
    pub counters: PoolCounters,
    pub occupancy: String,
}

impl PoolSnapshot {
    #[must_use]
    pub fn capture(alloc: &PageAllocator) -> Self {
        let stats = alloc.stats();
        Self {
            total_pages: alloc.total_pages(),
            live_entries: alloc.len(),
            allocated_pages: alloc.total_pages() - stats.total_free,
            stats,
            counters: alloc.counters(),
            occupancy: visualize(alloc, 80),
        }
    }

    #[must_use]
    pub fn output_lines(&self) -> Vec<String> {
        vec![
            format!(
                "pages: {} total, {} allocated in {} entries",
                self.total_pages, self.allocated_pages, self.live_entries
            ),
            format!(
                "free: {} pages in {} block(s), largest {}",
                self.stats.total_free, self.stats.num_blocks, self.stats.largest_block
            ),
            format!(
                "fragmentation: {:.1}%",
                self.stats.fragmentation_ratio * 100.0
            ),
            format!("occupancy: {}", self.occupancy),
        ]
    }
}

// ── Coalescing demo ─────────────────────────────────────────────────────────

/// Five equal entries, alternating frees, then free the rest: shows gaps
/// staying isolated until releases stitch them back into one extent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceDemoReport {
    pub after_fill: PoolSnapshot,
    pub after_gaps: PoolSnapshot,
    pub after_all_freed: PoolSnapshot,
    pub coalesces_after_gaps: u64,
    pub coalesces_total: u64,
    pub restored_single_extent: bool,
}

pub fn run_coalesce_demo() -> pp_error::Result<CoalesceDemoReport> {
    let geometry = PoolGeometry::new(50).unwrap_or_else(|_| unreachable!("positive page count"));
    let mut alloc = PageAllocator::new(geometry);

    for i in 0..5 {
        alloc.allocate(&format!("entry{i}"), 10)?;
    }
    let after_fill = PoolSnapshot::capture(&alloc);

    alloc.deallocate("entry1")?;
    alloc.deallocate("entry3")?;
    let after_gaps = PoolSnapshot::capture(&alloc);
    let coalesces_after_gaps = alloc.counters().coalesces;

    alloc.deallocate("entry0")?;
    alloc.deallocate("entry2")?;
    alloc.deallocate("entry4")?;
    let after_all_freed = PoolSnapshot::capture(&alloc);
    let coalesces_total = alloc.counters().coalesces;
    let restored_single_extent =
        after_all_freed.stats.num_blocks == 1 && after_all_freed.stats.total_free == 50;

    info!(coalesces_total, "coalesce_demo_complete");
    Ok(CoalesceDemoReport {
        after_fill,
        after_gaps,
        after_all_freed,
        coalesces_after_gaps,
        coalesces_total,
        restored_single_extent,
    })
}

// ── Defragmentation demo ────────────────────────────────────────────────────

/// Fragment the pool so plenty of space exists but no extent fits, then
/// watch a large request recover through automatic compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefragDemoReport {
    pub before: PoolSnapshot,
    pub after: PoolSnapshot,
    pub requested_pages: u64,
    pub compactions: u64,
    pub relocated_entries: usize,
    pub placed: bool,
}

pub fn run_defrag_demo() -> pp_error::Result<DefragDemoReport> {
    let geometry = PoolGeometry::new(50).unwrap_or_else(|_| unreachable!("positive page count"));
    let mut alloc = PageAllocator::new(geometry);

    for i in 0..10 {
        alloc.allocate(&format!("small{i}"), 5)?;
    }
    for i in [1, 3, 5, 7, 8, 9] {
        alloc.deallocate(&format!("small{i}"))?;
    }
    let before = PoolSnapshot::capture(&alloc);

    // 30 pages free, largest block smaller: this placement compacts first.
    let requested_pages = 30;
    let placed = alloc.allocate("big", requested_pages)?;
    let after = PoolSnapshot::capture(&alloc);

    info!(
        relocated = placed.relocations.len(),
        "defrag_demo_complete"
    );
    Ok(DefragDemoReport {
        before,
        after,
        requested_pages,
        compactions: alloc.counters().defragmentations,
        relocated_entries: placed.relocations.len(),
        placed: true,
    })
}

// ── Workload simulation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub total_pages: u64,
    pub operations: usize,
    pub seed: u64,
    pub min_request: u64,
    pub max_request: u64,
    pub max_live_entries: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            total_pages: 200,
            operations: 50,
            seed: 42,
            min_request: 3,
            max_request: 15,
            max_live_entries: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadEvent {
    pub index: usize,
    pub action: String,
    pub key: String,
    pub pages: Option<u64>,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub config: WorkloadConfig,
    pub events: Vec<WorkloadEvent>,
    pub failed_allocations: usize,
    pub final_state: PoolSnapshot,
}

/// Multiplicative LCG; deterministic and seed-stable across runs.
fn lcg_next(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1);
    *state
}

/// Run a seeded allocate/deallocate stream against a fresh pool.
pub fn run_workload(
    config: &WorkloadConfig,
) -> std::result::Result<WorkloadReport, pp_types::GeometryError> {
    let geometry = PoolGeometry::new(config.total_pages)?;
    let mut alloc = PageAllocator::new(geometry);
    let mut rng = config.seed;
    let mut active: Vec<String> = Vec::new();
    let mut events = Vec::new();
    let mut failed_allocations = 0;

    let span = config.max_request.saturating_sub(config.min_request) + 1;
    for index in 0..config.operations {
        let allocate_turn =
            active.is_empty() || (active.len() < config.max_live_entries && lcg_next(&mut rng) % 100 < 60);

        if allocate_turn {
            let key = format!("key{index}");
            let pages = config.min_request + lcg_next(&mut rng) % span;
            let ok = alloc.allocate(&key, pages).is_ok();
            if ok {
                active.push(key.clone());
            } else {
                failed_allocations += 1;
            }
            events.push(WorkloadEvent {
                index,
                action: "alloc".to_owned(),
                key,
                pages: Some(pages),
                ok,
            });
        } else {
            #[expect(clippy::cast_possible_truncation)]
            let victim = (lcg_next(&mut rng) % active.len() as u64) as usize;
            let key = active.swap_remove(victim);
            let ok = alloc.deallocate(&key).is_ok();
            events.push(WorkloadEvent {
                index,
                action: "free".to_owned(),
                key,
                pages: None,
                ok,
            });
        }
    }

    alloc.check_consistency();
    Ok(WorkloadReport {
        config: *config,
        events,
        failed_allocations,
        final_state: PoolSnapshot::capture(&alloc),
    })
}

// ── Cache demo ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDemoReport {
    pub policy: EvictionPolicy,
    pub inserted: usize,
    pub survivors: Vec<String>,
    pub counters: CacheCounters,
}

/// Overfill a small cache and report which entries the policy kept.
pub fn run_cache_demo(policy: EvictionPolicy) -> pp_error::Result<CacheDemoReport> {
    let config = CacheConfig::new(8, 32, policy)
        .unwrap_or_else(|_| unreachable!("static cache shape is valid"));
    let mut cache = PageCache::new(config);

    let mut inserted = 0;
    for i in 0..4 {
        cache.insert(&format!("warm{i}"), &[b'w'; 64])?;
        inserted += 1;
    }
    // Re-read the first two so recency-aware policies protect them.
    cache.get("warm0");
    cache.get("warm1");

    for i in 0..2 {
        cache.insert(&format!("cold{i}"), &[b'c'; 64])?;
        inserted += 1;
    }

    let mut survivors: Vec<String> = (0..4)
        .map(|i| format!("warm{i}"))
        .filter(|key| cache.contains(key))
        .collect();
    survivors.sort();

    info!(policy = %policy, evictions = cache.counters().evictions, "cache_demo_complete");
    Ok(CacheDemoReport {
        policy,
        inserted,
        survivors,
        counters: cache.counters(),
    })
}
