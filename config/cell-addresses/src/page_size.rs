use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed
    + Clone
    + Copy
    + Eq
    + PartialEq
    + Ord
    + PartialOrd
    + Hash
    + fmt::Display
    + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 4 KiB page (4096 bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "4K"
    }
}

/// 64 KiB page (`65_536` bytes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size64K;
impl sealed::Sealed for Size64K {}
impl PageSize for Size64K {
    const SIZE: u64 = 64 * 1024;
    const SHIFT: u32 = 16;

    fn as_str() -> &'static str {
        "64K"
    }
}

macro_rules! impl_fmt {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    f.write_str(Self::as_str())
                }
            }

            impl fmt::Debug for $ty {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    fmt::Display::fmt(&self, f)
                }
            }
        )*
    };
}

impl_fmt!(Size4K, Size64K);

/// Whether `size` can serve as a page size: a power of two of at least 4 KiB.
#[inline]
#[must_use]
pub const fn is_valid_page_size(size: u64) -> bool {
    size.is_power_of_two() && size >= Size4K::SIZE
}

const _: () = {
    assert!(Size4K::SIZE == 1 << Size4K::SHIFT);
    assert!(Size64K::SIZE == 1 << Size64K::SHIFT);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_validity() {
        assert!(is_valid_page_size(0x1000));
        assert!(is_valid_page_size(0x1_0000));
        assert!(!is_valid_page_size(0));
        assert!(!is_valid_page_size(0x800));
        assert!(!is_valid_page_size(0x3000));
    }
}
