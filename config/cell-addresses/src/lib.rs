//! # Physical and Virtual Address Types for Cell Layouts
//!
//! Strongly typed wrappers for the raw addresses that appear in a partition
//! configuration: where a region lives in the machine's physical address
//! space, and where a cell sees it in its own (guest-physical) view.
//!
//! ## Overview
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 64-bit address, either physical or virtual. |
//! | [`PhysicalAddress`] | – | A machine-physical address (RAM or MMIO). |
//! | [`VirtualAddress`] | – | An address as seen from inside a cell. |
//! | [`AddressRange<A>`] | [`A: Address`](Address) | A half-open `[start, start + size)` span. |
//!
//! ## Page Sizes
//!
//! The ARM64 translation granules relevant to cell layouts are available as
//! marker types implementing [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB pages (default region granularity)
//! - [`Size64K`]: 64 KiB pages (default shared-memory chunk)
//!
//! Layouts whose granularity is only known at runtime (e.g. a page size taken
//! from a board file) use [`MemoryAddress::is_aligned_to`] instead.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use cell_addresses::*;
//! let ram = PhysicalRange::new(PhysicalAddress::new(0x0b00_0000), 0x04ff_0000);
//! let loader = PhysicalRange::new(PhysicalAddress::new(0x0fff_0000), 0x1_0000);
//!
//! assert!(ram.start().is_aligned::<Size64K>());
//! assert!(!ram.overlaps(&loader));
//! assert_eq!(ram.end(), Some(loader.start()));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod address_range;
mod memory_address;
mod page_size;
mod physical_address;
mod virtual_address;

pub use crate::address_range::{AddressRange, PhysicalRange, VirtualRange};
pub use crate::memory_address::MemoryAddress;
pub use crate::page_size::{PageSize, Size4K, Size64K, is_valid_page_size};
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;

/// Common interface of the typed address wrappers.
///
/// Lets [`AddressRange`] stay generic over the address kind while keeping
/// physical and virtual spans from being mixed up.
pub trait Address: Copy + Eq + Ord + core::fmt::Debug + core::fmt::Display {
    /// Wrap a raw value.
    fn from_u64(value: u64) -> Self;

    /// The raw value.
    fn to_u64(self) -> u64;
}

impl Address for PhysicalAddress {
    #[inline]
    fn from_u64(value: u64) -> Self {
        Self::new(value)
    }

    #[inline]
    fn to_u64(self) -> u64 {
        self.as_u64()
    }
}

impl Address for VirtualAddress {
    #[inline]
    fn from_u64(value: u64) -> Self {
        Self::new(value)
    }

    #[inline]
    fn to_u64(self) -> u64 {
        self.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        let a = MemoryAddress::new(0x12345);
        assert!(!a.is_aligned::<Size4K>());
        assert!(MemoryAddress::new(0x12000).is_aligned::<Size4K>());
        assert!(!MemoryAddress::new(0x12000).is_aligned::<Size64K>());
        assert!(MemoryAddress::new(0x1fc0_0000).is_aligned::<Size64K>());
    }

    #[test]
    fn runtime_alignment() {
        let a = MemoryAddress::new(0x0aa1_0000);
        assert!(a.is_aligned_to(0x1_0000));
        assert!(!a.is_aligned_to(0x10_0000));
        assert!(!a.is_aligned_to(0));
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let va = VirtualAddress::new(0x8000_0000);
        let pa = PhysicalAddress::new(0x8000_0000);
        assert_eq!(va.as_u64(), pa.as_u64());
        assert_eq!(format!("{va}"), "0x0000000080000000");
        assert_eq!(format!("{pa:?}"), "PA(0x0000000080000000)");
        assert_eq!(format!("{va:?}"), "VA(0x0000000080000000)");
    }
}
