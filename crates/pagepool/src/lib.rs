#![forbid(unsafe_code)]
//! PagePool public API facade.
//!
//! Re-exports the allocator core, the page-backed cache, and the shared
//! error/type vocabulary through one crate. This is what downstream
//! consumers (harness, embedding hosts) depend on.

pub use pp_alloc::{
    AllocationTable, FragStats, FreeExtentIndex, PageAlloc, PageAllocator, PoolCounters,
    Relocation, SharedAllocator, analyze,
};
pub use pp_cache::{
    CacheConfig, CacheCounters, EvictionPolicy, PageCache, PageStore, PolicyState, UnknownPolicy,
    policy_state,
};
pub use pp_error::{PoolError, Result};
pub use pp_types::{GeometryError, PageNumber, PageRange, PoolGeometry, pages_for_bytes};
