//! Lenient deserializers for board files.
//!
//! Board authors copy addresses straight out of datasheets and device trees,
//! so integers are accepted as JSON numbers or as strings in decimal, `0x`
//! hexadecimal or `0b` binary notation with optional `_` separators. Flag
//! words are written as lists of names, or as a raw integer whose bits must
//! all be known.

use core::fmt;
use core::marker::PhantomData;
use serde::Deserialize;
use serde::de::{self, Deserializer, SeqAccess, Unexpected, Visitor};

/// Parse an unsigned integer literal in decimal, `0x` or `0b` notation.
#[must_use]
pub fn parse_u64(text: &str) -> Option<u64> {
    let cleaned: String = text.trim().chars().filter(|&c| c != '_').collect();
    let (digits, radix) = if let Some(hex) = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        (hex, 16)
    } else if let Some(bin) = cleaned
        .strip_prefix("0b")
        .or_else(|| cleaned.strip_prefix("0B"))
    {
        (bin, 2)
    } else {
        (cleaned.as_str(), 10)
    };
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

struct U64Visitor;

impl Visitor<'_> for U64Visitor {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an unsigned integer or a decimal, 0x or 0b string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
        u64::try_from(v).map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
        parse_u64(v).ok_or_else(|| E::invalid_value(Unexpected::Str(v), &self))
    }
}

/// An integer accepted in any of the supported notations.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Int<T>(pub T);

impl<'de, T> Deserialize<'de> for Int<T>
where
    T: TryFrom<u64>,
{
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = d.deserialize_any(U64Visitor)?;
        T::try_from(raw).map(Int).map_err(|_| {
            de::Error::invalid_value(
                Unexpected::Unsigned(raw),
                &"an integer within the field's range",
            )
        })
    }
}

/// `deserialize_with` helper for `u64` fields.
///
/// # Errors
/// Fails on negative numbers and malformed strings.
pub fn u64_any<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    Int::<u64>::deserialize(d).map(|Int(v)| v)
}

/// `deserialize_with` helper for `u32` fields.
///
/// # Errors
/// Fails on malformed or out-of-range values.
pub fn u32_any<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    Int::<u32>::deserialize(d).map(|Int(v)| v)
}

/// `deserialize_with` helper for `u16` fields.
///
/// # Errors
/// Fails on malformed or out-of-range values.
pub fn u16_any<'de, D: Deserializer<'de>>(d: D) -> Result<u16, D::Error> {
    Int::<u16>::deserialize(d).map(|Int(v)| v)
}

/// `deserialize_with` helper for `u8` fields.
///
/// # Errors
/// Fails on malformed or out-of-range values.
pub fn u8_any<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
    Int::<u8>::deserialize(d).map(|Int(v)| v)
}

/// `deserialize_with` helper for optional `u64` fields.
///
/// # Errors
/// Fails on malformed values; `null` yields `None`.
pub fn opt_u64_any<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    Option::<Int<u64>>::deserialize(d).map(|v| v.map(|Int(v)| v))
}

/// `deserialize_with` helper for optional `u32` fields.
///
/// # Errors
/// Fails on malformed values; `null` yields `None`.
pub fn opt_u32_any<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    Option::<Int<u32>>::deserialize(d).map(|v| v.map(|Int(v)| v))
}

/// `deserialize_with` helper for lists of `u32`.
///
/// # Errors
/// Fails on any malformed element.
pub fn vec_u32_any<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u32>, D::Error> {
    Vec::<Int<u32>>::deserialize(d).map(|v| v.into_iter().map(|Int(v)| v).collect())
}

/// Names and bits of one flag word.
pub(crate) type FlagTable = &'static [(&'static str, u32)];

pub(crate) const MEMORY_FLAGS: FlagTable = &[
    ("read", 0x0001),
    ("write", 0x0002),
    ("execute", 0x0004),
    ("dma", 0x0008),
    ("io", 0x0010),
    ("comm-region", 0x0020),
    ("loadable", 0x0040),
    ("root-shared", 0x0080),
    ("no-hugepages", 0x0100),
    ("colored", 0x0200),
];

pub(crate) const CELL_FLAGS: FlagTable = &[
    ("passive-commreg", 1 << 0),
    ("test-device", 1 << 1),
    ("virtual-console-permitted", 1 << 30),
    ("virtual-console-active", 1 << 31),
];

pub(crate) const SYSTEM_FLAGS: FlagTable = &[("virtual-debug-console", 1 << 0)];

pub(crate) const CONSOLE_FLAGS: FlagTable = &[
    ("mmio", 1 << 0),
    ("regdist4", 1 << 1),
    ("inverted-clock", 1 << 2),
];

struct FlagVisitor<F> {
    table: FlagTable,
    _marker: PhantomData<F>,
}

impl<F> FlagVisitor<F> {
    fn known_mask(&self) -> u32 {
        self.table.iter().fold(0, |acc, (_, bit)| acc | bit)
    }

    fn lookup<E: de::Error>(&self, name: &str) -> Result<u32, E> {
        self.table
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, bit)| *bit)
            .ok_or_else(|| {
                let names: Vec<&str> = self.table.iter().map(|(n, _)| *n).collect();
                E::custom(format_args!(
                    "unknown flag `{name}`, expected one of: {}",
                    names.join(", ")
                ))
            })
    }

    fn check_raw<E: de::Error>(&self, raw: u64) -> Result<u32, E> {
        u32::try_from(raw)
            .ok()
            .filter(|bits| bits & !self.known_mask() == 0)
            .ok_or_else(|| {
                E::invalid_value(Unexpected::Unsigned(raw), &"a word of known flag bits")
            })
    }
}

impl<'de, F: From<u32>> Visitor<'de> for FlagVisitor<F> {
    type Value = F;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of flag names or an integer flag word")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<F, E> {
        self.check_raw(v).map(F::from)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<F, E> {
        let raw = parse_u64(v).ok_or_else(|| E::invalid_value(Unexpected::Str(v), &self))?;
        self.check_raw(raw).map(F::from)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<F, A::Error> {
        let mut bits = 0u32;
        while let Some(name) = seq.next_element::<String>()? {
            bits |= self.lookup::<A::Error>(&name)?;
        }
        Ok(F::from(bits))
    }
}

pub(crate) fn flags<'de, D, F>(d: D, table: FlagTable) -> Result<F, D::Error>
where
    D: Deserializer<'de>,
    F: From<u32>,
{
    d.deserialize_any(FlagVisitor {
        table,
        _marker: PhantomData,
    })
}

/// `deserialize_with` helper for [`MemoryFlags`](cell_abi::MemoryFlags).
///
/// # Errors
/// Fails on unknown flag names or bits.
pub fn memory_flags<'de, D: Deserializer<'de>>(d: D) -> Result<cell_abi::MemoryFlags, D::Error> {
    flags(d, MEMORY_FLAGS)
}

/// `deserialize_with` helper for [`CellFlags`](cell_abi::CellFlags).
///
/// # Errors
/// Fails on unknown flag names or bits.
pub fn cell_flags<'de, D: Deserializer<'de>>(d: D) -> Result<cell_abi::CellFlags, D::Error> {
    flags(d, CELL_FLAGS)
}

/// `deserialize_with` helper for [`SystemFlags`](cell_abi::SystemFlags).
///
/// # Errors
/// Fails on unknown flag names or bits.
pub fn system_flags<'de, D: Deserializer<'de>>(d: D) -> Result<cell_abi::SystemFlags, D::Error> {
    flags(d, SYSTEM_FLAGS)
}

/// `deserialize_with` helper for [`ConsoleFlags`](cell_abi::ConsoleFlags).
///
/// # Errors
/// Fails on unknown flag names or bits.
pub fn console_flags<'de, D: Deserializer<'de>>(d: D) -> Result<cell_abi::ConsoleFlags, D::Error> {
    flags(d, CONSOLE_FLAGS)
}

/// Names of the bits set in `bits`, in table order; unknown bits are ignored.
pub(crate) fn flag_names(table: FlagTable, bits: u32) -> impl Iterator<Item = &'static str> {
    table
        .iter()
        .filter(move |(_, bit)| bits & bit != 0)
        .map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_abi::MemoryFlags;

    #[test]
    fn integer_notations() {
        assert_eq!(parse_u64("4096"), Some(4096));
        assert_eq!(parse_u64("0x1f40_0000"), Some(0x1f40_0000));
        assert_eq!(parse_u64("0X10"), Some(16));
        assert_eq!(parse_u64("0b1100"), Some(12));
        assert_eq!(parse_u64(" 7 "), Some(7));
        assert_eq!(parse_u64("0x"), None);
        assert_eq!(parse_u64("-1"), None);
        assert_eq!(parse_u64("twelve"), None);
    }

    #[derive(Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "u64_any")]
        wide: u64,
        #[serde(deserialize_with = "u8_any")]
        narrow: u8,
        #[serde(default, deserialize_with = "opt_u32_any")]
        maybe: Option<u32>,
        #[serde(deserialize_with = "memory_flags")]
        flags: MemoryFlags,
    }

    #[test]
    fn mixed_integer_fields() {
        let p: Probe = serde_json::from_str(
            r#"{ "wide": "0xff0a0000", "narrow": 2, "maybe": "149", "flags": ["read", "io"] }"#,
        )
        .unwrap();
        assert_eq!(p.wide, 0xff0a_0000);
        assert_eq!(p.narrow, 2);
        assert_eq!(p.maybe, Some(149));
        assert_eq!(p.flags.into_bits(), 0x11);
    }

    #[test]
    fn narrowing_overflow_is_an_error() {
        let r: Result<Probe, _> =
            serde_json::from_str(r#"{ "wide": 0, "narrow": 256, "flags": [] }"#);
        assert!(r.is_err());
    }

    #[test]
    fn raw_flag_words_must_use_known_bits() {
        let p: Probe =
            serde_json::from_str(r#"{ "wide": 0, "narrow": 0, "flags": "0x83" }"#).unwrap();
        assert!(p.flags.root_shared() && p.flags.read() && p.flags.write());
        let r: Result<Probe, _> =
            serde_json::from_str(r#"{ "wide": 0, "narrow": 0, "flags": "0x400" }"#);
        assert!(r.is_err());
    }

    #[test]
    fn unknown_flag_name_is_an_error() {
        let r: Result<Probe, _> =
            serde_json::from_str(r#"{ "wide": 0, "narrow": 0, "flags": ["raed"] }"#);
        let msg = r.err().unwrap().to_string();
        assert!(msg.contains("unknown flag `raed`"), "{msg}");
    }

    #[test]
    fn names_of_set_bits() {
        let names: Vec<_> = flag_names(MEMORY_FLAGS, 0x83).collect();
        assert_eq!(names, ["read", "write", "root-shared"]);
    }
}
