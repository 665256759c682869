#![forbid(unsafe_code)]
//! Page-backed byte cache over the allocator.
//!
//! ## Design
//!
//! The cache composes three parts:
//!
//! 1. **`PageAllocator`** (`pp-alloc`) — owns the page space: placement,
//!    release, compaction.
//! 2. **[`PageStore`]** — the flat byte backing; values are written into
//!    the ranges the allocator hands out and physically moved when
//!    compaction relocates them.
//! 3. **[`PolicyState`]** (one of LRU/FIFO/SIEVE/CLOCK) — picks victims
//!    when even a compacted pool cannot hold a new value.
//!
//! Value sizes round up to whole pages; a zero-length value still occupies
//! one page so every stored key owns a real range.

pub mod eviction;
mod store;

pub use eviction::{EvictionPolicy, PolicyState, UnknownPolicy, policy_state};
pub use store::PageStore;

use pp_alloc::{FragStats, PageAllocator, PoolCounters, Relocation};
use pp_error::{PoolError, Result};
use pp_types::{GeometryError, PoolGeometry, pages_for_bytes};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

// ── Configuration ───────────────────────────────────────────────────────────

/// Validated cache shape: page count, page size in bytes, eviction policy.
///
/// Only constructible through [`CacheConfig::new`], which also pins the
/// byte capacity — hence no `Deserialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheConfig {
    geometry: PoolGeometry,
    page_size: u32,
    policy: EvictionPolicy,
    #[serde(skip)]
    capacity_bytes: usize,
}

impl CacheConfig {
    /// Requires positive `total_pages` and `page_size`, and a total byte
    /// capacity that fits in addressable memory.
    pub fn new(
        total_pages: u64,
        page_size: u32,
        policy: EvictionPolicy,
    ) -> std::result::Result<Self, GeometryError> {
        let geometry = PoolGeometry::new(total_pages)?;
        if page_size == 0 {
            return Err(GeometryError::InvalidField {
                field: "page_size",
                reason: "must be positive",
            });
        }
        let capacity_bytes = total_pages
            .checked_mul(u64::from(page_size))
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or(GeometryError::InvalidField {
                field: "capacity",
                reason: "total_pages * page_size exceeds addressable memory",
            })?;
        Ok(Self {
            geometry,
            page_size,
            policy,
            capacity_bytes,
        })
    }

    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.geometry.total_pages()
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }
}

// ── Counters ────────────────────────────────────────────────────────────────

/// Per-instance cache statistics. Reset only at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub adds: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl CacheCounters {
    /// Fraction of reads that hit, 0.0 before the first read.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        #[expect(clippy::cast_precision_loss)]
        let ratio = self.hits as f64 / self.total_requests as f64;
        ratio
    }
}

// ── Cache ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct EntryMeta {
    data_size: usize,
}

/// Byte cache with page-granular storage, automatic compaction, and
/// policy-driven eviction.
#[derive(Debug)]
pub struct PageCache {
    config: CacheConfig,
    allocator: PageAllocator,
    store: PageStore,
    entries: HashMap<String, EntryMeta>,
    policy: Box<dyn PolicyState>,
    counters: CacheCounters,
}

impl PageCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            allocator: PageAllocator::new(config.geometry),
            store: PageStore::new(config.capacity_bytes, config.page_size),
            entries: HashMap::new(),
            policy: policy_state(config.policy),
            counters: CacheCounters::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn counters(&self) -> CacheCounters {
        self.counters
    }

    /// Allocator operation counters (allocations, coalesces, compactions).
    #[must_use]
    pub fn pool_counters(&self) -> PoolCounters {
        self.allocator.counters()
    }

    /// Fragmentation metrics of the underlying pool.
    #[must_use]
    pub fn frag_stats(&self) -> FragStats {
        self.allocator.stats()
    }

    /// Store a new value. Rejects keys that are already present.
    ///
    /// When the pool cannot place the value, one compaction runs inside the
    /// allocator; if capacity itself is short, victims chosen by the
    /// eviction policy go one at a time until the value fits or the cache
    /// is empty.
    pub fn insert(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if self.entries.contains_key(key) {
            return Err(PoolError::DuplicateKey(key.to_owned()));
        }
        self.place(key, value)?;
        self.counters.adds += 1;
        Ok(())
    }

    /// Read a value, updating hit/miss accounting and recency state.
    pub fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        self.counters.total_requests += 1;
        let Some(meta) = self.entries.get(key) else {
            self.counters.misses += 1;
            return None;
        };
        let data_size = meta.data_size;
        let range = self
            .allocator
            .lookup(key)
            .unwrap_or_else(|| panic!("cache entry {key} missing from allocator"));
        self.counters.hits += 1;
        self.policy.on_access(key);
        Some(self.store.read(range.start, data_size))
    }

    /// Replace the value for an existing key.
    ///
    /// Same page count: bytes are overwritten in place. Different page
    /// count: the old range is released and the value goes through the
    /// full insert path (compaction/eviction included), so a failure
    /// leaves the key absent — the old value's pages are already gone.
    pub fn update(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let Some(meta) = self.entries.get_mut(key) else {
            return Err(PoolError::NotFound(key.to_owned()));
        };
        let range = self
            .allocator
            .lookup(key)
            .unwrap_or_else(|| panic!("cache entry {key} missing from allocator"));

        let required = pages_for_bytes(value.len() as u64, self.config.page_size);
        if required == range.length {
            meta.data_size = value.len();
            self.store.write(range, value);
        } else {
            self.entries.remove(key);
            self.policy.on_remove(key);
            self.allocator
                .deallocate(key)
                .unwrap_or_else(|_| panic!("cache entry {key} missing from allocator"));
            self.place(key, value)?;
        }
        self.policy.on_access(key);
        self.counters.updates += 1;
        Ok(())
    }

    /// Remove a value and release its pages.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_none() {
            return Err(PoolError::NotFound(key.to_owned()));
        }
        self.policy.on_remove(key);
        self.allocator
            .deallocate(key)
            .unwrap_or_else(|_| panic!("cache entry {key} missing from allocator"));
        self.counters.deletes += 1;
        Ok(())
    }

    /// Compact the pool and move the stored bytes along with it.
    pub fn defragment(&mut self) {
        let relocations = self.allocator.defragment();
        self.apply_relocations(&relocations);
    }

    /// Allocate, honoring relocations from any internal compaction, then
    /// write the value and register the entry.
    fn place(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let required = pages_for_bytes(value.len() as u64, self.config.page_size);
        let placed = loop {
            match self.allocator.allocate(key, required) {
                Ok(placed) => break placed,
                Err(err @ PoolError::InsufficientSpace { .. }) => {
                    if !self.evict_one() {
                        return Err(err);
                    }
                }
                Err(other) => return Err(other),
            }
        };

        self.apply_relocations(&placed.relocations);
        self.store.write(placed.range, value);
        self.entries.insert(
            key.to_owned(),
            EntryMeta {
                data_size: value.len(),
            },
        );
        self.policy.on_insert(key);
        debug!(key, pages = required, bytes = value.len(), "cache_store");
        Ok(())
    }

    /// Sacrifice one policy-chosen entry. Returns false when nothing is
    /// left to evict.
    fn evict_one(&mut self) -> bool {
        let Some(victim) = self.policy.select_victim() else {
            return false;
        };
        self.policy.on_remove(&victim);
        let meta = self.entries.remove(&victim);
        assert!(meta.is_some(), "eviction victim {victim} missing from cache");
        let freed = self.allocator.deallocate(&victim);
        assert!(
            freed.is_ok(),
            "eviction victim {victim} missing from allocator"
        );
        self.counters.evictions += 1;
        info!(victim = %victim, "cache_evict");
        true
    }

    fn apply_relocations(&mut self, relocations: &[Relocation]) {
        for reloc in relocations {
            self.store.relocate(reloc.from, reloc.to, reloc.length);
        }
        if !relocations.is_empty() {
            debug!(moved = relocations.len(), "cache_relocate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pp_types::{PageNumber, PageRange};

    fn cache(total_pages: u64, page_size: u32, policy: EvictionPolicy) -> PageCache {
        PageCache::new(CacheConfig::new(total_pages, page_size, policy).expect("config"))
    }

    #[test]
    fn config_rejects_degenerate_shapes() {
        assert!(CacheConfig::new(0, 4, EvictionPolicy::Lru).is_err());
        assert!(CacheConfig::new(8, 0, EvictionPolicy::Lru).is_err());
        assert!(CacheConfig::new(8, 4, EvictionPolicy::Lru).is_ok());
    }

    #[test]
    fn insert_get_round_trip() {
        let mut cache = cache(16, 4, EvictionPolicy::Lru);
        cache.insert("greeting", b"hello world").expect("insert");
        assert_eq!(cache.get("greeting").as_deref(), Some(&b"hello world"[..]));
        assert_eq!(cache.get("absent"), None);

        let counters = cache.counters();
        assert_eq!(counters.adds, 1);
        assert_eq!(counters.hits, 1);
        assert_eq!(counters.misses, 1);
        assert!((counters.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut cache = cache(16, 4, EvictionPolicy::Lru);
        cache.insert("k", b"one").expect("insert");
        assert_eq!(
            cache.insert("k", b"two"),
            Err(PoolError::DuplicateKey("k".to_owned()))
        );
        assert_eq!(cache.get("k").as_deref(), Some(&b"one"[..]));
    }

    #[test]
    fn values_round_up_to_whole_pages() {
        let mut cache = cache(16, 4, EvictionPolicy::Lru);
        cache.insert("tiny", b"").expect("empty value");
        cache.insert("five", b"12345").expect("insert");
        // "" takes one page, "12345" takes two of the 4-byte pages.
        assert_eq!(cache.frag_stats().total_free, 13);
    }

    #[test]
    fn update_in_place_keeps_the_range() {
        let mut cache = cache(16, 4, EvictionPolicy::Lru);
        cache.insert("k", b"abcdefg").expect("insert");
        cache.update("k", b"ABCDEFGH").expect("update same pages");
        assert_eq!(cache.get("k").as_deref(), Some(&b"ABCDEFGH"[..]));
        assert_eq!(cache.counters().updates, 1);
        // Still two pages: no reallocation happened.
        assert_eq!(cache.pool_counters().allocations, 1);
    }

    #[test]
    fn update_resizing_reallocates() {
        let mut cache = cache(16, 4, EvictionPolicy::Lru);
        cache.insert("k", b"ab").expect("insert");
        cache.update("k", b"a much longer value").expect("grow");
        assert_eq!(cache.get("k").as_deref(), Some(&b"a much longer value"[..]));
        assert_eq!(cache.pool_counters().allocations, 2);
        assert_eq!(cache.pool_counters().deallocations, 1);
    }

    #[test]
    fn update_missing_key_is_not_found() {
        let mut cache = cache(16, 4, EvictionPolicy::Lru);
        assert_eq!(
            cache.update("ghost", b"x"),
            Err(PoolError::NotFound("ghost".to_owned()))
        );
    }

    #[test]
    fn remove_releases_pages() {
        let mut cache = cache(8, 4, EvictionPolicy::Lru);
        cache.insert("k", b"0123456789abcdef").expect("insert");
        assert_eq!(cache.frag_stats().total_free, 4);
        cache.remove("k").expect("remove");
        assert_eq!(cache.frag_stats().total_free, 8);
        assert_eq!(cache.frag_stats().num_blocks, 1);
        assert_eq!(
            cache.remove("k"),
            Err(PoolError::NotFound("k".to_owned()))
        );
    }

    #[test]
    fn defragment_moves_stored_bytes() {
        let mut cache = cache(8, 4, EvictionPolicy::Lru);
        cache.insert("a", b"AAAAAAA").expect("a"); // 2 pages at 0
        cache.insert("b", b"BBB").expect("b"); // 1 page at 2
        cache.insert("c", b"CCCCCC").expect("c"); // 2 pages at 3
        cache.remove("b").expect("free b");

        cache.defragment();
        assert_eq!(cache.get("a").as_deref(), Some(&b"AAAAAAA"[..]));
        assert_eq!(cache.get("c").as_deref(), Some(&b"CCCCCC"[..]));
        assert_eq!(cache.frag_stats().num_blocks, 1);
    }

    #[test]
    fn insert_through_internal_compaction_preserves_data() {
        let mut cache = cache(8, 4, EvictionPolicy::Lru);
        cache.insert("a", b"AAAAAAA").expect("a"); // 2 pages at 0
        cache.insert("b", b"BBB").expect("b"); // 1 page at 2
        cache.insert("c", b"CCCCCC").expect("c"); // 2 pages at 3
        cache.remove("b").expect("free b");

        // Free: [2, 3) and [5, 8) — a 4-page value needs the compaction
        // that the allocator runs on its own.
        cache.insert("d", b"DDDDDDDDDDDDD").expect("d");
        assert_eq!(cache.pool_counters().defragmentations, 1);
        assert_eq!(cache.counters().evictions, 0);

        assert_eq!(cache.get("a").as_deref(), Some(&b"AAAAAAA"[..]));
        assert_eq!(cache.get("c").as_deref(), Some(&b"CCCCCC"[..]));
        assert_eq!(cache.get("d").as_deref(), Some(&b"DDDDDDDDDDDDD"[..]));
    }

    #[test]
    fn pressure_evicts_until_the_value_fits() {
        let mut cache = cache(4, 4, EvictionPolicy::Lru);
        for key in ["a", "b", "c", "d"] {
            cache.insert(key, b"xxxx").expect("fill");
        }
        // Touch "a" so LRU sacrifices "b" first.
        cache.get("a");

        cache.insert("e", b"yyyyyyyy").expect("insert under pressure");
        assert_eq!(cache.counters().evictions, 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(!cache.contains("c"));
        assert_eq!(cache.get("e").as_deref(), Some(&b"yyyyyyyy"[..]));
    }

    #[test]
    fn fifo_pressure_ignores_recency() {
        let mut cache = cache(4, 4, EvictionPolicy::Fifo);
        for key in ["a", "b", "c", "d"] {
            cache.insert(key, b"xxxx").expect("fill");
        }
        cache.get("a");

        cache.insert("e", b"zzzz").expect("insert under pressure");
        assert_eq!(cache.counters().evictions, 1);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[test]
    fn oversized_value_fails_after_emptying_the_cache() {
        let mut cache = cache(4, 4, EvictionPolicy::Lru);
        cache.insert("a", b"xxxx").expect("fill");
        let err = cache
            .insert("huge", &[0_u8; 64])
            .expect_err("cannot ever fit");
        assert!(matches!(err, PoolError::InsufficientSpace { requested: 16, .. }));
        // Everything was sacrificed in the attempt.
        assert!(cache.is_empty());
        assert_eq!(cache.counters().evictions, 1);
    }

    #[test]
    fn allocator_state_matches_entries() {
        let mut cache = cache(32, 4, EvictionPolicy::Sieve);
        cache.insert("a", b"0123456789").expect("a");
        cache.insert("b", b"01").expect("b");
        cache.insert("c", &[7_u8; 40]).expect("c");
        cache.remove("b").expect("remove b");
        cache.defragment();

        // Ranges stay contiguous from page 0 after compaction.
        let mut ranges: Vec<PageRange> = ["a", "c"]
            .iter()
            .filter_map(|key| cache.allocator.lookup(key))
            .collect();
        ranges.sort_by_key(|range| range.start);
        assert_eq!(ranges[0].start, PageNumber(0));
        assert_eq!(ranges[0].end(), ranges[1].start);
        cache.allocator.check_consistency();
    }
}
