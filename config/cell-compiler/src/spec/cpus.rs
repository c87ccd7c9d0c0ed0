//! CPU sets.

use super::de::{Int, parse_u64};
use core::fmt;
use serde::de::{self, Deserializer, SeqAccess, Unexpected, Visitor};
use serde::Deserialize;

/// Highest CPU id (exclusive) a board may name.
pub const MAX_CPUS: u32 = 4096;

/// Set of CPU ids, stored as the little-endian `u64` words the descriptor
/// carries. Trailing zero words are never stored.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct CpuSet {
    words: Vec<u64>,
}

impl CpuSet {
    /// The set whose bit `n` stands for CPU `n`.
    #[must_use]
    pub fn from_mask(mask: u64) -> Self {
        let mut set = Self { words: vec![mask] };
        set.trim();
        set
    }

    /// The set of the given CPU ids. Ids at or above [`MAX_CPUS`] are dropped.
    #[must_use]
    pub fn from_ids(ids: impl IntoIterator<Item = u32>) -> Self {
        let mut set = Self::default();
        for id in ids {
            set.insert(id);
        }
        set
    }

    /// Add CPU `id`; returns `false` if it is out of range.
    pub fn insert(&mut self, id: u32) -> bool {
        if id >= MAX_CPUS {
            return false;
        }
        let word = (id / 64) as usize;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (id % 64);
        true
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.words
            .get((id / 64) as usize)
            .is_some_and(|w| w & (1 << (id % 64)) != 0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of CPUs in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// The bitmap words, without trailing zero words.
    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// CPU ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64u32)
                .filter(move |bit| w & (1 << bit) != 0)
                .map(move |bit| u32::try_from(i).map_or(u32::MAX, |i| i * 64 + bit))
        })
    }

    /// Lowest CPU id present in both sets.
    #[must_use]
    pub fn first_common(&self, other: &Self) -> Option<u32> {
        self.words
            .iter()
            .zip(&other.words)
            .enumerate()
            .find_map(|(i, (a, b))| {
                let common = a & b;
                (common != 0).then(|| {
                    u32::try_from(i).map_or(u32::MAX, |i| i * 64 + common.trailing_zeros())
                })
            })
    }

    /// Whether every CPU of `self` is also in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.words.iter().enumerate().all(|(i, &w)| {
            let theirs = other.words.get(i).copied().unwrap_or(0);
            w & !theirs == 0
        })
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, id) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{id}")?;
        }
        f.write_str("}")
    }
}

struct CpuSetVisitor;

impl<'de> Visitor<'de> for CpuSetVisitor {
    type Value = CpuSet;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a CPU bitmask or a list of CPU ids")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<CpuSet, E> {
        Ok(CpuSet::from_mask(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<CpuSet, E> {
        u64::try_from(v)
            .map(CpuSet::from_mask)
            .map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<CpuSet, E> {
        parse_u64(v)
            .map(CpuSet::from_mask)
            .ok_or_else(|| E::invalid_value(Unexpected::Str(v), &self))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<CpuSet, A::Error> {
        let mut set = CpuSet::default();
        while let Some(Int(id)) = seq.next_element::<Int<u32>>()? {
            if !set.insert(id) {
                return Err(de::Error::invalid_value(
                    Unexpected::Unsigned(u64::from(id)),
                    &"a CPU id below 4096",
                ));
            }
        }
        Ok(set)
    }
}

impl<'de> Deserialize<'de> for CpuSet {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        d.deserialize_any(CpuSetVisitor)
    }
}
