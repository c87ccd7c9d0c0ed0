//! # Address Ranges
//!
//! A half-open span `[start, start + size)` of either physical or virtual
//! addresses. All queries are overflow-aware: a range whose end would wrap the
//! 64-bit address space reports [`None`] from [`AddressRange::end`] and never
//! compares as overlapping by accident.

use crate::{Address, PhysicalAddress, VirtualAddress};
use core::fmt;

/// Half-open span of addresses of kind `A`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressRange<A: Address> {
    start: A,
    size: u64,
}

/// A span of machine-physical addresses.
pub type PhysicalRange = AddressRange<PhysicalAddress>;

/// A span of cell-visible addresses.
pub type VirtualRange = AddressRange<VirtualAddress>;

impl<A: Address> AddressRange<A> {
    #[inline]
    #[must_use]
    pub const fn new(start: A, size: u64) -> Self {
        Self { start, size }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> A {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Exclusive end, or `None` if `start + size` overflows.
    ///
    /// A range that ends exactly at `2^64` is representable but has no
    /// exclusive end; use [`last`](Self::last) for it.
    #[inline]
    #[must_use]
    pub fn end(&self) -> Option<A> {
        self.start.to_u64().checked_add(self.size).map(A::from_u64)
    }

    /// Inclusive last address, or `None` for an empty or wrapping range.
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<A> {
        if self.size == 0 {
            return None;
        }
        self.start
            .to_u64()
            .checked_add(self.size - 1)
            .map(A::from_u64)
    }

    /// Whether `start + size` wraps past the top of the address space.
    #[inline]
    #[must_use]
    pub fn wraps(&self) -> bool {
        self.size != 0 && self.last().is_none()
    }

    /// Whether both ranges share at least one address.
    ///
    /// Empty ranges overlap nothing.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let (Some(a_last), Some(b_last)) = (self.last(), other.last()) else {
            return false;
        };
        self.start <= b_last && other.start <= a_last
    }

    /// Whether `other` lies completely inside `self`.
    #[must_use]
    pub fn contains_range(&self, other: &Self) -> bool {
        let (Some(a_last), Some(b_last)) = (self.last(), other.last()) else {
            return false;
        };
        self.start <= other.start && b_last <= a_last
    }

    /// Whether `addr` lies inside the range.
    #[must_use]
    pub fn contains(&self, addr: A) -> bool {
        self.last()
            .is_some_and(|last| self.start <= addr && addr <= last)
    }

    /// Whether both start and size are multiples of `granule`.
    #[must_use]
    pub fn is_aligned_to(&self, granule: u64) -> bool {
        granule != 0
            && self.start.to_u64().is_multiple_of(granule)
            && self.size.is_multiple_of(granule)
    }

    /// The range `[start + offset, start + offset + size)`, or `None` on overflow.
    #[must_use]
    pub fn offset_by(&self, offset: u64, size: u64) -> Option<Self> {
        let start = self.start.to_u64().checked_add(offset)?;
        Some(Self::new(A::from_u64(start), size))
    }
}

impl<A: Address> fmt::Debug for AddressRange<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?} +0x{:X})", self.start, self.size)
    }
}

impl<A: Address> fmt::Display for AddressRange<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last() {
            Some(last) => write!(f, "{}..={}", self.start, last),
            None if self.size == 0 => write!(f, "{} (empty)", self.start),
            None => write!(f, "{} +0x{:X} (wraps)", self.start, self.size),
        }
    }
}
