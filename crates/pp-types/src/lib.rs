#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Index of a page within the pool's address space `[0, total_pages)`.
///
/// This is a unit-carrying wrapper to prevent mixing page indices with page
/// counts or byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageNumber(pub u64);

impl PageNumber {
    pub const ZERO: Self = Self(0);

    /// Add a page count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, pages: u64) -> Option<Self> {
        self.0.checked_add(pages).map(Self)
    }

    /// Subtract a page count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, pages: u64) -> Option<Self> {
        self.0.checked_sub(pages).map(Self)
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous run of pages: `[start, start + length)`, `length > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub start: PageNumber,
    pub length: u64,
}

impl PageRange {
    #[must_use]
    pub fn new(start: PageNumber, length: u64) -> Self {
        Self { start, length }
    }

    /// First page past the end of this range.
    #[must_use]
    pub fn end(self) -> PageNumber {
        PageNumber(self.start.0 + self.length)
    }

    /// Whether the two ranges share at least one page.
    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.start.0 < other.end().0 && other.start.0 < self.end().0
    }

    /// Whether `other` begins exactly where this range ends.
    #[must_use]
    pub fn abuts(self, other: Self) -> bool {
        self.end() == other.start
    }

    /// Whether `page` falls inside this range.
    #[must_use]
    pub fn contains(self, page: PageNumber) -> bool {
        self.start <= page && page < self.end()
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.0, self.end().0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid geometry: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Validated pool geometry, fixed for the lifetime of an allocator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolGeometry {
    total_pages: u64,
}

impl PoolGeometry {
    /// Create a `PoolGeometry` if `total_pages` is positive.
    pub fn new(total_pages: u64) -> Result<Self, GeometryError> {
        if total_pages == 0 {
            return Err(GeometryError::InvalidField {
                field: "total_pages",
                reason: "must be positive",
            });
        }
        Ok(Self { total_pages })
    }

    #[must_use]
    pub fn total_pages(self) -> u64 {
        self.total_pages
    }

    /// The single extent covering the entire page space.
    #[must_use]
    pub fn full_range(self) -> PageRange {
        PageRange::new(PageNumber::ZERO, self.total_pages)
    }

    /// Whether `range` lies entirely inside the page space.
    #[must_use]
    pub fn fits(self, range: PageRange) -> bool {
        range.end().0 <= self.total_pages
    }
}

impl fmt::Display for PoolGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pages", self.total_pages)
    }
}

/// Number of pages needed to hold `data_len` bytes at `page_size` bytes per
/// page. Zero-length payloads still occupy one page so that every stored key
/// owns a real range.
#[must_use]
pub fn pages_for_bytes(data_len: u64, page_size: u32) -> u64 {
    debug_assert!(page_size > 0);
    data_len.div_ceil(u64::from(page_size)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_number_checked_ops() {
        assert_eq!(PageNumber(10).checked_add(5), Some(PageNumber(15)));
        assert_eq!(PageNumber(u64::MAX).checked_add(1), None);
        assert_eq!(PageNumber(10).checked_sub(3), Some(PageNumber(7)));
        assert_eq!(PageNumber(0).checked_sub(1), None);
    }

    #[test]
    fn range_end_and_contains() {
        let r = PageRange::new(PageNumber(10), 5);
        assert_eq!(r.end(), PageNumber(15));
        assert!(r.contains(PageNumber(10)));
        assert!(r.contains(PageNumber(14)));
        assert!(!r.contains(PageNumber(15)));
        assert!(!r.contains(PageNumber(9)));
    }

    #[test]
    fn range_overlap() {
        let a = PageRange::new(PageNumber(0), 10);
        let b = PageRange::new(PageNumber(5), 10);
        let c = PageRange::new(PageNumber(10), 10);
        assert!(a.overlaps(b));
        assert!(b.overlaps(a));
        assert!(!a.overlaps(c));
        assert!(!c.overlaps(a));
    }

    #[test]
    fn range_adjacency() {
        let a = PageRange::new(PageNumber(0), 10);
        let b = PageRange::new(PageNumber(10), 5);
        assert!(a.abuts(b));
        assert!(!b.abuts(a));
        assert!(!a.abuts(PageRange::new(PageNumber(11), 5)));
    }

    #[test]
    fn geometry_validation() {
        assert!(PoolGeometry::new(1).is_ok());
        assert!(PoolGeometry::new(2560).is_ok());
        assert_eq!(
            PoolGeometry::new(0),
            Err(GeometryError::InvalidField {
                field: "total_pages",
                reason: "must be positive",
            })
        );
    }

    #[test]
    fn geometry_full_range_and_fits() {
        let geo = PoolGeometry::new(100).expect("geometry");
        assert_eq!(geo.full_range(), PageRange::new(PageNumber(0), 100));
        assert!(geo.fits(PageRange::new(PageNumber(90), 10)));
        assert!(!geo.fits(PageRange::new(PageNumber(90), 11)));
    }

    #[test]
    fn pages_for_bytes_rounds_up() {
        assert_eq!(pages_for_bytes(0, 4096), 1);
        assert_eq!(pages_for_bytes(1, 4096), 1);
        assert_eq!(pages_for_bytes(4096, 4096), 1);
        assert_eq!(pages_for_bytes(4097, 4096), 2);
        assert_eq!(pages_for_bytes(40 * 1024 * 3, 40 * 1024), 3);
    }

    #[test]
    fn display_formats() {
        assert_eq!(PageNumber(42).to_string(), "42");
        assert_eq!(PageRange::new(PageNumber(10), 5).to_string(), "[10, 15)");
        assert_eq!(PoolGeometry::new(64).expect("geometry").to_string(), "64 pages");
    }
}
