//! # Virtual PCI Identity
//!
//! Bus/device/function addressing, BAR mask presets and the system-wide
//! registry that keeps every `(domain, bdf)` pair unique.

use crate::spec::de::{Int, parse_u64};
use cell_abi::{IVSHMEM_BAR_MASK_INTX, IVSHMEM_BAR_MASK_MSIX, PCI_BAR_COUNT};
use core::fmt;
use core::str::FromStr;
use serde::Deserialize;
use serde::de::{self, Deserializer, Unexpected, Visitor};
use std::collections::BTreeMap;

/// PCI bus/device/function, encoded as `bus << 8 | device << 3 | function`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bdf(u16);

impl Bdf {
    /// Build from its parts, or `None` if `device > 31` or `function > 7`.
    #[must_use]
    pub fn new(bus: u8, device: u8, function: u8) -> Option<Self> {
        if device > 31 || function > 7 {
            return None;
        }
        Some(Self(
            (u16::from(bus) << 8) | (u16::from(device) << 3) | u16::from(function),
        ))
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn bus(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn device(self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn function(self) -> u8 {
        (self.0 & 0x7) as u8
    }
}

impl fmt::Debug for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bdf({self})")
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{}",
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

/// Error parsing a `"bb:dd.f"` string.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("invalid PCI address `{0}`, expected `bb:dd.f` or an integer")]
pub struct ParseBdfError(String);

impl FromStr for Bdf {
    type Err = ParseBdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseBdfError(s.to_owned());
        let Some((bus, rest)) = s.trim().split_once(':') else {
            return parse_u64(s)
                .and_then(|raw| u16::try_from(raw).ok())
                .map(Self)
                .ok_or_else(err);
        };
        let (device, function) = rest.split_once('.').ok_or_else(err)?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| err())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| err())?;
        let function = function.parse::<u8>().map_err(|_| err())?;
        Self::new(bus, device, function).ok_or_else(err)
    }
}

struct BdfVisitor;

impl Visitor<'_> for BdfVisitor {
    type Value = Bdf;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a `bb:dd.f` string or a 16-bit integer")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Bdf, E> {
        u16::try_from(v)
            .map(Bdf)
            .map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Bdf, E> {
        u16::try_from(v)
            .map(Bdf)
            .map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Bdf, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Bdf {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        d.deserialize_any(BdfVisitor)
    }
}

/// BAR mask of an IVSHMEM function.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Deserialize)]
#[serde(from = "RawBarMask")]
pub enum BarMask {
    /// Legacy INTx interrupts; register BAR only.
    #[default]
    Intx,
    /// MSI-X interrupts; register BAR plus MSI-X table.
    Msix,
    Raw([u32; PCI_BAR_COUNT]),
}

impl BarMask {
    #[must_use]
    pub const fn words(self) -> [u32; PCI_BAR_COUNT] {
        match self {
            Self::Intx => IVSHMEM_BAR_MASK_INTX,
            Self::Msix => IVSHMEM_BAR_MASK_MSIX,
            Self::Raw(words) => words,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum BarPreset {
    Intx,
    Msix,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBarMask {
    Preset(BarPreset),
    Words([Int<u32>; PCI_BAR_COUNT]),
}

impl From<RawBarMask> for BarMask {
    fn from(raw: RawBarMask) -> Self {
        match raw {
            RawBarMask::Preset(BarPreset::Intx) => Self::Intx,
            RawBarMask::Preset(BarPreset::Msix) => Self::Msix,
            RawBarMask::Words(words) => Self::Raw(words.map(|Int(w)| w)),
        }
    }
}

/// Where a `(domain, bdf)` pair was first declared.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciSite {
    pub cell: usize,
    pub index: usize,
}

/// System-wide set of used `(domain, bdf)` pairs.
#[derive(Debug, Default)]
pub struct PciRegistry {
    used: BTreeMap<(u16, Bdf), PciSite>,
}

impl PciRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `(domain, bdf)` for `site`.
    ///
    /// # Errors
    /// Returns the site that already uses the pair; nothing is recorded.
    pub fn register(&mut self, domain: u16, bdf: Bdf, site: PciSite) -> Result<(), PciSite> {
        match self.used.entry((domain, bdf)) {
            std::collections::btree_map::Entry::Occupied(e) => Err(*e.get()),
            std::collections::btree_map::Entry::Vacant(e) => {
                log::trace!("pci {domain:04x}:{bdf} -> cell {} device #{}", site.cell, site.index);
                e.insert(site);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.used.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdf_encoding() {
        let bdf = Bdf::new(0, 1, 0).unwrap();
        assert_eq!(bdf.raw(), 1 << 3);
        assert_eq!(bdf.to_string(), "00:01.0");
        let bdf = Bdf::new(0x12, 0x1f, 7).unwrap();
        assert_eq!((bdf.bus(), bdf.device(), bdf.function()), (0x12, 0x1f, 7));
        assert_eq!(Bdf::new(0, 32, 0), None);
        assert_eq!(Bdf::new(0, 0, 8), None);
    }

    #[test]
    fn bdf_parsing() {
        assert_eq!("00:02.0".parse::<Bdf>().unwrap(), Bdf::from_raw(2 << 3));
        assert_eq!("0x10".parse::<Bdf>().unwrap(), Bdf::from_raw(16));
        assert!("00:20.0".parse::<Bdf>().is_err());
        assert!("00-02".parse::<Bdf>().is_err());

        let v: Vec<Bdf> = serde_json::from_str(r#"["01:00.1", 8]"#).unwrap();
        assert_eq!(v, [Bdf::new(1, 0, 1).unwrap(), Bdf::from_raw(8)]);
    }

    #[test]
    fn bar_masks() {
        let v: Vec<BarMask> =
            serde_json::from_str(r#"["intx", "msix", ["0xfffff000", 0, 0, 0, 0, 0]]"#).unwrap();
        assert_eq!(v[0].words(), IVSHMEM_BAR_MASK_INTX);
        assert_eq!(v[1].words(), IVSHMEM_BAR_MASK_MSIX);
        assert_eq!(v[2].words(), IVSHMEM_BAR_MASK_INTX);
        assert_eq!(BarMask::default(), BarMask::Intx);
    }

    #[test]
    fn identities_are_unique_per_domain() {
        let mut reg = PciRegistry::new();
        let bdf = Bdf::from_raw(1 << 3);
        let first = PciSite { cell: 0, index: 0 };
        assert_eq!(reg.register(0, bdf, first), Ok(()));
        assert_eq!(reg.register(0, bdf, PciSite { cell: 1, index: 0 }), Err(first));
        assert_eq!(reg.register(1, bdf, PciSite { cell: 1, index: 0 }), Ok(()));
        assert_eq!(reg.len(), 2);
    }
}
