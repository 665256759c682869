#![forbid(unsafe_code)]
//! Error types for PagePool.
//!
//! # Error Taxonomy
//!
//! `PoolError` is the single user-facing error type for the allocator and
//! the cache layer built on top of it. Every operation either fully succeeds
//! or returns one of these kinds with all structures left exactly as they
//! were (the one sanctioned internal mutation on a failure path is the
//! single compaction attempt inside `allocate`, which preserves every
//! invariant).
//!
//! | Variant | Meaning | Recoverable? |
//! |---------|---------|--------------|
//! | `InsufficientSpace` | Request cannot be placed even after one compaction | Yes — retry after deallocations |
//! | `NotFound` | Unknown key on deallocate/lookup | Yes — no-op |
//! | `DuplicateKey` | Allocate for a key that already holds a range | Yes — deallocate first |
//! | `InvalidLength` | Zero-length request | Yes — caller bug, nothing mutated |
//!
//! Internal invariant violations (overlapping extents, accounting
//! mismatches) are *not* represented here: they signal a bug in the
//! implementation itself and abort loudly via `assert!` rather than being
//! reported as recoverable errors.
//!
//! ## Design Constraints
//!
//! - `pp-error` depends on no other workspace crate (no cyclic deps).
//! - Key payloads are owned `String`s so errors can outlive the borrow that
//!   produced them.

use thiserror::Error;

/// Unified error type for all PagePool operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The request cannot be placed, even after one compaction attempt.
    ///
    /// `total_free` and `largest_block` capture the pool state at failure
    /// time so callers can distinguish "truly full" from "fragmented but a
    /// compaction already ran".
    #[error(
        "insufficient space: requested {requested} pages, \
         {total_free} free in blocks of at most {largest_block}"
    )]
    InsufficientSpace {
        requested: u64,
        total_free: u64,
        largest_block: u64,
    },

    /// The named key holds no allocation.
    #[error("not found: {0}")]
    NotFound(String),

    /// The named key already holds an allocation. Overwriting silently
    /// would leak the previous range's pages, so the caller must
    /// deallocate first.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Zero-length allocation request.
    #[error("invalid length: requests must cover at least one page")]
    InvalidLength,
}

/// Result alias using `PoolError`.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = PoolError::InsufficientSpace {
            requested: 30,
            total_free: 25,
            largest_block: 5,
        };
        assert_eq!(
            err.to_string(),
            "insufficient space: requested 30 pages, 25 free in blocks of at most 5"
        );

        assert_eq!(
            PoolError::NotFound("entry7".into()).to_string(),
            "not found: entry7"
        );
        assert_eq!(
            PoolError::DuplicateKey("entry7".into()).to_string(),
            "duplicate key: entry7"
        );
        assert_eq!(
            PoolError::InvalidLength.to_string(),
            "invalid length: requests must cover at least one page"
        );
    }

    #[test]
    fn errors_are_comparable() {
        // Callers match on kinds; equality keeps the retry-on-space path simple.
        let a = PoolError::NotFound("k".into());
        let b = PoolError::NotFound("k".into());
        assert_eq!(a, b);
        assert_ne!(a, PoolError::DuplicateKey("k".into()));
    }
}
