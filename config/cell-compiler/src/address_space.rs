//! # Address Space Model
//!
//! The system-wide set of claimed physical ranges. Every region of every cell
//! (and the hypervisor's own memory) is claimed exactly once; a claim that
//! intersects an earlier one is rejected unless the [`SharingPolicy`]
//! authorizes the alias.
//!
//! Claims live in an [`IntervalIndex`]: a `BTreeMap` keyed by start address.
//! A query only visits entries whose start lies in
//! `[start - max_size, last]`, where `max_size` is the largest size ever
//! inserted, so lookups stay `O(log n + k)`.
//!
//! | Alias | Authorized when |
//! |-------|-----------------|
//! | region / region | both root-shared, identical `[start, size)`, policy agrees |
//! | channel / channel | same channel base and identical `[start, size)` |
//! | root region / guest | `root_donation` and the guest range lies inside |
//! | hypervisor / any | never |

use crate::context::CellId;
use crate::options::{FlagMatch, SharingPolicy};
use cell_abi::MemoryFlags;
use cell_addresses::{Address, AddressRange, PhysicalAddress, PhysicalRange};
use std::collections::BTreeMap;

/// Ordered index of non-empty ranges, tolerant of duplicate starts.
#[derive(Debug, Clone)]
pub struct IntervalIndex<A: Address, T> {
    entries: BTreeMap<(A, u64), (AddressRange<A>, T)>,
    max_size: u64,
    next_seq: u64,
}

impl<A: Address, T> Default for IntervalIndex<A, T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            max_size: 0,
            next_seq: 0,
        }
    }
}

impl<A: Address, T> IntervalIndex<A, T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `range`. Empty and wrapping ranges are ignored.
    pub fn insert(&mut self, range: AddressRange<A>, value: T) {
        if range.last().is_none() {
            return;
        }
        self.max_size = self.max_size.max(range.size());
        self.entries
            .insert((range.start(), self.next_seq), (range, value));
        self.next_seq += 1;
    }

    /// Entries intersecting `range`, in ascending start order.
    pub fn overlapping(
        &self,
        range: AddressRange<A>,
    ) -> impl Iterator<Item = (&AddressRange<A>, &T)> {
        let window = range.last().map(|last| {
            let lo = range
                .start()
                .to_u64()
                .saturating_sub(self.max_size.saturating_sub(1));
            (A::from_u64(lo), 0)..=(last, u64::MAX)
        });
        window
            .into_iter()
            .flat_map(|w| self.entries.range(w))
            .filter_map(move |(_, (r, v))| r.overlaps(&range).then_some((r, v)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Who holds a physical range.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Owner {
    Hypervisor,
    Cell(CellId),
}

/// What produced a claim.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ClaimKind {
    /// A region written by the board author.
    Region,
    /// A region generated for the shared-memory channel at `base`.
    Channel { base: u64 },
}

/// One claimed physical range.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Claim {
    pub owner: Owner,
    /// Index in the owner's region table.
    pub index: usize,
    pub kind: ClaimKind,
    pub phys: PhysicalRange,
    pub virt_start: u64,
    pub flags: MemoryFlags,
}

impl Claim {
    /// A claim for an author-written region of `cell`.
    #[must_use]
    pub const fn region(
        cell: CellId,
        index: usize,
        phys: PhysicalRange,
        flags: MemoryFlags,
    ) -> Self {
        Self {
            owner: Owner::Cell(cell),
            index,
            kind: ClaimKind::Region,
            phys,
            virt_start: phys.start().as_u64(),
            flags,
        }
    }

    #[must_use]
    pub const fn with_virt_start(mut self, virt_start: u64) -> Self {
        self.virt_start = virt_start;
        self
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: ClaimKind) -> Self {
        self.kind = kind;
        self
    }

    const fn cell(&self) -> Option<CellId> {
        match self.owner {
            Owner::Cell(id) => Some(id),
            Owner::Hypervisor => None,
        }
    }
}

/// A rejected claim and the earlier claim it collides with.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("{} overlaps {}", incoming.phys, existing.phys)]
pub struct OverlapError {
    pub existing: Claim,
    pub incoming: Claim,
}

/// System-wide physical claims under one sharing policy.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    index: IntervalIndex<PhysicalAddress, Claim>,
    policy: SharingPolicy,
}

impl AddressSpace {
    #[must_use]
    pub fn new(policy: SharingPolicy) -> Self {
        Self {
            index: IntervalIndex::new(),
            policy,
        }
    }

    /// Add `claim` to the claimed set.
    ///
    /// Empty ranges are accepted and never recorded.
    ///
    /// # Errors
    /// Returns the first earlier claim that intersects `claim` without being
    /// authorized by the policy; nothing is recorded in that case.
    pub fn claim(&mut self, claim: Claim) -> Result<(), OverlapError> {
        if let Some((_, existing)) = self
            .index
            .overlapping(claim.phys)
            .find(|(_, existing)| !self.authorizes(existing, &claim))
        {
            return Err(OverlapError {
                existing: *existing,
                incoming: claim,
            });
        }
        log::trace!("claim {} for {:?} #{}", claim.phys, claim.owner, claim.index);
        self.index.insert(claim.phys, claim);
        Ok(())
    }

    /// Whether two intersecting claims may coexist.
    #[must_use]
    pub fn authorizes(&self, a: &Claim, b: &Claim) -> bool {
        let (Some(cell_a), Some(cell_b)) = (a.cell(), b.cell()) else {
            return false;
        };

        match (a.kind, b.kind) {
            // Channel slots alias only the same slot of the same channel.
            (ClaimKind::Channel { base: x }, ClaimKind::Channel { base: y }) => {
                return x == y && a.phys == b.phys;
            }
            (ClaimKind::Region, ClaimKind::Region)
                if a.phys == b.phys
                    && a.flags.root_shared()
                    && b.flags.root_shared()
                    && self.aliases_agree(a, b) =>
            {
                return true;
            }
            _ => {}
        }

        if self.policy.root_donation && cell_a.is_root() != cell_b.is_root() {
            let (root, guest) = if cell_a.is_root() { (a, b) } else { (b, a) };
            return root.kind == ClaimKind::Region && root.phys.contains_range(&guest.phys);
        }

        false
    }

    fn aliases_agree(&self, a: &Claim, b: &Claim) -> bool {
        if self.policy.virt_must_match && a.virt_start != b.virt_start {
            return false;
        }
        match self.policy.flags {
            FlagMatch::Any => true,
            FlagMatch::Compatible => {
                a.flags.io() == b.flags.io() && a.flags.execute() == b.flags.execute()
            }
            FlagMatch::Exact => a.flags == b.flags,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_addresses::VirtualAddress;

    fn phys(start: u64, size: u64) -> PhysicalRange {
        PhysicalRange::new(PhysicalAddress::new(start), size)
    }

    fn rw() -> MemoryFlags {
        MemoryFlags::new().with_read(true).with_write(true)
    }

    #[test]
    fn index_finds_long_ranges_starting_far_before() {
        let mut idx = IntervalIndex::<PhysicalAddress, &str>::new();
        idx.insert(phys(0, 0x1000_0000), "ram");
        idx.insert(phys(0x2000_0000, 0x1000), "uart");
        let hits: Vec<_> = idx
            .overlapping(phys(0x0fff_f000, 0x2000))
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(hits, ["ram"]);
        assert_eq!(idx.overlapping(phys(0x1000_0000, 0x1000)).count(), 0);
    }

    #[test]
    fn index_keeps_duplicate_starts() {
        let mut idx = IntervalIndex::<VirtualAddress, usize>::new();
        let r = AddressRange::new(VirtualAddress::new(0x1000), 0x1000);
        idx.insert(r, 0);
        idx.insert(r, 1);
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.overlapping(r).count(), 2);
    }

    #[test]
    fn index_ignores_empty_ranges() {
        let mut idx = IntervalIndex::<PhysicalAddress, ()>::new();
        idx.insert(phys(0x1000, 0), ());
        assert!(idx.is_empty());
        assert_eq!(idx.overlapping(phys(0x1000, 0)).count(), 0);
    }

    #[test]
    fn cross_cell_overlap_is_rejected() {
        let mut space = AddressSpace::new(SharingPolicy::default());
        let a = Claim::region(CellId::ROOT, 0, phys(0x1000, 0x2000), rw());
        let b = Claim::region(CellId::new(1), 0, phys(0x2000, 0x1000), rw());
        space.claim(a).unwrap();
        let err = space.claim(b).unwrap_err();
        assert_eq!(err.existing, a);
        assert_eq!(err.incoming, b);
        assert_eq!(space.len(), 1);
    }

    #[test]
    fn identical_root_shared_ranges_alias() {
        let mut space = AddressSpace::new(SharingPolicy::default());
        let shared = rw().with_root_shared(true);
        space
            .claim(Claim::region(CellId::ROOT, 0, phys(0x1000, 0x1000), shared))
            .unwrap();
        space
            .claim(Claim::region(CellId::new(1), 0, phys(0x1000, 0x1000), shared))
            .unwrap();
        let err = space
            .claim(Claim::region(CellId::new(2), 0, phys(0x1000, 0x2000), shared))
            .unwrap_err();
        assert_eq!(err.existing.phys, phys(0x1000, 0x1000));
    }

    #[test]
    fn alias_policy_checks_virt_and_flags() {
        let policy = SharingPolicy::default()
            .with_virt_must_match(true)
            .with_flags(FlagMatch::Compatible);
        let mut space = AddressSpace::new(policy);
        let shared = rw().with_root_shared(true);
        space
            .claim(Claim::region(CellId::ROOT, 0, phys(0x1000, 0x1000), shared))
            .unwrap();
        let moved = Claim::region(CellId::new(1), 0, phys(0x1000, 0x1000), shared)
            .with_virt_start(0x8000_0000);
        assert!(space.claim(moved).is_err());
        let io = Claim::region(CellId::new(1), 0, phys(0x1000, 0x1000), shared.with_io(true));
        assert!(space.claim(io).is_err());
        let ro = Claim::region(CellId::new(1), 0, phys(0x1000, 0x1000), shared.with_write(false));
        assert!(space.claim(ro).is_ok());
    }

    #[test]
    fn root_donation_allows_carved_out_guests_only() {
        let policy = SharingPolicy::default().with_root_donation(true);
        let mut space = AddressSpace::new(policy);
        space
            .claim(Claim::region(CellId::ROOT, 0, phys(0, 0x2000_0000), rw()))
            .unwrap();
        space
            .claim(Claim::region(CellId::new(1), 0, phys(0x1000_0000, 0x100_0000), rw()))
            .unwrap();
        // Guests still exclude each other.
        assert!(
            space
                .claim(Claim::region(CellId::new(2), 0, phys(0x1000_0000, 0x1000), rw()))
                .is_err()
        );
        // Straddling the end of the root range is not a carve-out.
        assert!(
            space
                .claim(Claim::region(CellId::new(2), 0, phys(0x1fff_f000, 0x2000), rw()))
                .is_err()
        );
    }

    #[test]
    fn hypervisor_memory_is_never_shared() {
        let policy = SharingPolicy::default().with_root_donation(true);
        let mut space = AddressSpace::new(policy);
        let hv = Claim {
            owner: Owner::Hypervisor,
            index: 0,
            kind: ClaimKind::Region,
            phys: phys(0x1f40_0000, 0x80_0000),
            virt_start: 0,
            flags: MemoryFlags::new(),
        };
        space.claim(hv).unwrap();
        let shared = rw().with_root_shared(true);
        let root = Claim::region(CellId::ROOT, 0, phys(0, 0x2000_0000), shared);
        assert_eq!(space.claim(root).unwrap_err().existing, hv);
    }

    #[test]
    fn channel_regions_alias_regardless_of_flags() {
        let policy = SharingPolicy::default().with_flags(FlagMatch::Exact);
        let mut space = AddressSpace::new(policy);
        let ro = MemoryFlags::new().with_read(true).with_root_shared(true);
        let channel = ClaimKind::Channel { base: 0x1fc0_0000 };
        let a = Claim::region(CellId::ROOT, 2, phys(0x1fc2_0000, 0x1_0000), ro.with_write(true))
            .with_kind(channel);
        let b = Claim::region(CellId::new(1), 2, phys(0x1fc2_0000, 0x1_0000), ro)
            .with_kind(channel);
        space.claim(a).unwrap();
        space.claim(b).unwrap();
        assert_eq!(space.len(), 2);
    }

    #[test]
    fn different_channels_never_alias() {
        let policy = SharingPolicy::default().with_root_donation(true);
        let mut space = AddressSpace::new(policy);
        let shared = rw().with_root_shared(true);
        let a = Claim::region(CellId::ROOT, 2, phys(0x1fc1_0000, 0x1_0000), shared)
            .with_kind(ClaimKind::Channel { base: 0x1fc0_0000 });
        let b = Claim::region(CellId::new(1), 1, phys(0x1fc1_0000, 0x1_0000), shared)
            .with_kind(ClaimKind::Channel { base: 0x1fc1_0000 });
        space.claim(a).unwrap();
        assert_eq!(space.claim(b).unwrap_err().existing, a);

        // A root-shared region does not alias a channel slot either.
        let plain = Claim::region(CellId::new(2), 0, phys(0x1fc1_0000, 0x1_0000), shared);
        assert!(space.claim(plain).is_err());
    }
}
