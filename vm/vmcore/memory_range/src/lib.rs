// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The [`MemoryRange`] type, a 4KB-page-aligned byte range, plus the gap search
//! used to place RAM blocks in the RAM address space.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::ops::Range;

const PAGE_SIZE: u64 = 4096;

/// A page-aligned, half-open byte range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryRange {
    start: u64,
    end: u64,
}

impl std::fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start, self.end)
    }
}

impl TryFrom<Range<u64>> for MemoryRange {
    type Error = InvalidMemoryRange;

    fn try_from(range: Range<u64>) -> Result<Self, Self::Error> {
        Self::try_new(range)
    }
}

impl From<MemoryRange> for Range<u64> {
    fn from(range: MemoryRange) -> Self {
        range.start..range.end
    }
}

/// Error returned by [`MemoryRange::try_new`].
#[derive(Debug, thiserror::Error)]
#[error("unaligned or invalid memory range: {start:#x}-{end:#x}")]
pub struct InvalidMemoryRange {
    start: u64,
    end: u64,
}

impl MemoryRange {
    /// The highest page-aligned address.
    pub const MAX_ADDRESS: u64 = u64::MAX & !(PAGE_SIZE - 1);

    /// The empty range at address zero.
    pub const EMPTY: Self = Self::new(0..0);

    /// Returns a new range.
    ///
    /// Panics if either bound is not 4KB aligned or if the start is after the
    /// end.
    #[track_caller]
    pub const fn new(range: Range<u64>) -> Self {
        assert!(range.start & (PAGE_SIZE - 1) == 0);
        assert!(range.end & (PAGE_SIZE - 1) == 0);
        assert!(range.start <= range.end);
        Self {
            start: range.start,
            end: range.end,
        }
    }

    /// Returns a new range, or an error if either bound is unaligned or the
    /// start is after the end.
    pub const fn try_new(range: Range<u64>) -> Result<Self, InvalidMemoryRange> {
        if range.start & (PAGE_SIZE - 1) != 0
            || range.end & (PAGE_SIZE - 1) != 0
            || range.start > range.end
        {
            return Err(InvalidMemoryRange {
                start: range.start,
                end: range.end,
            });
        }
        Ok(Self {
            start: range.start,
            end: range.end,
        })
    }

    /// Returns the smallest page-aligned range containing `range`.
    ///
    /// Panics if the start is after the end or the end lies in the last page
    /// of the 64-bit space.
    #[track_caller]
    pub fn bounding(range: Range<u64>) -> Self {
        assert!(range.start <= range.end);
        assert!(range.end <= Self::MAX_ADDRESS);
        let start = range.start & !(PAGE_SIZE - 1);
        let end = (range.end + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1);
        Self::new(start..end)
    }

    /// The start address.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The end address (exclusive).
    pub fn end(&self) -> u64 {
        self.end
    }

    /// The length in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true for an empty range.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The first 4KB page number.
    pub fn start_4k_gpn(&self) -> u64 {
        self.start / PAGE_SIZE
    }

    /// The 4KB page number just past the end.
    pub fn end_4k_gpn(&self) -> u64 {
        self.end / PAGE_SIZE
    }

    /// The number of 4KB pages.
    pub fn page_count_4k(&self) -> u64 {
        self.len() / PAGE_SIZE
    }

    /// Returns whether `self` and `other` share any byte.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.end > other.start && self.start < other.end
    }

    /// Returns whether `other` lies entirely within `self`.
    pub fn contains(&self, other: &Self) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    /// Returns whether `addr` lies within `self`.
    pub fn contains_addr(&self, addr: u64) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// Returns the offset of `addr` from the start of the range, if contained.
    pub fn offset_of(&self, addr: u64) -> Option<u64> {
        self.contains_addr(addr).then(|| addr - self.start)
    }
}

/// Finds the smallest free gap of at least `len` bytes that directly follows
/// one of `ranges`, and returns its start.
///
/// A gap runs from the end of a range to the nearest start of another range at
/// or above it, or to [`MemoryRange::MAX_ADDRESS`] if there is none. With no
/// ranges at all the answer is address zero. Among equally small gaps, the one
/// following the earliest range in iteration order wins.
///
/// `ranges` must not overlap. Returns `None` if no gap is large enough.
pub fn best_fit_gap(ranges: &[MemoryRange], len: u64) -> Option<u64> {
    if ranges.is_empty() {
        return Some(0);
    }
    let mut best: Option<(u64, u64)> = None;
    for range in ranges {
        let end = range.end();
        let next = ranges
            .iter()
            .map(|r| r.start())
            .filter(|&start| start >= end)
            .min()
            .unwrap_or(MemoryRange::MAX_ADDRESS);
        let gap = next.saturating_sub(end);
        if gap >= len && best.is_none_or(|(_, best_gap)| gap < best_gap) {
            best = Some((end, gap));
        }
    }
    best.map(|(start, _)| start)
}
