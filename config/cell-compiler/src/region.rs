//! # Region Layout Engine
//!
//! Validates a cell's memory regions in author order, expands channel entries
//! in place, and registers every physical range with the system's
//! [`AddressSpace`](crate::address_space::AddressSpace). Virtual ranges are
//! checked against the cell's own other regions only.
//!
//! Invalid entries still occupy their slot in the table so that the indices
//! in later diagnostics match the board file.

use crate::address_space::{ClaimKind, Claim, IntervalIndex, OverlapError, Owner};
use crate::channel::{self, PlacedChannel};
use crate::context::{CellId, SystemBuildContext};
use crate::error::{ChannelError, CompileError, Location, RegionError, Space, Span};
use crate::spec::{CellSpec, ChannelSpec, RegionEntry, RegionSpec};
use cell_abi::MemoryRegion;
use cell_addresses::{AddressRange, PhysicalAddress, PhysicalRange, VirtualAddress, VirtualRange};
use log::debug;
use std::collections::BTreeSet;

/// The region table of one cell plus where its channels landed.
#[derive(Debug, Default)]
pub struct CellRegions {
    pub regions: Vec<MemoryRegion>,
    pub channels: Vec<PlacedChannel>,
    /// Channels that failed to lay out; their errors are already reported.
    pub broken_channels: BTreeSet<String>,
}

impl CellRegions {
    /// The placed channel called `name`.
    #[must_use]
    pub fn channel(&self, name: &str) -> Option<&PlacedChannel> {
        self.channels.iter().find(|c| c.spec.name == name)
    }
}

/// Lay out and claim the regions of `cell`.
pub fn lay_out(
    cell: CellId,
    spec: &CellSpec,
    ctx: &mut SystemBuildContext,
    errors: &mut Vec<CompileError>,
) -> CellRegions {
    let page_size = ctx.options.page_size;
    let mut out = CellRegions::default();
    let mut virt = IntervalIndex::<VirtualAddress, usize>::new();

    for entry in &spec.memory_regions {
        match entry {
            RegionEntry::Region(region) => {
                let index = out.regions.len();
                match check_region(&spec.name, index, region, page_size, errors) {
                    Some(r) => {
                        if !r.flags.comm_region() {
                            let kind = ClaimKind::Region;
                            claim_physical(cell, &spec.name, index, &r, kind, ctx, errors);
                        }
                        claim_virtual(&spec.name, index, &r, &mut virt, errors);
                        debug!(
                            "cell `{}` region #{index}: {:#x} -> {:#x} +{:#x} flags {:#x}",
                            spec.name,
                            r.phys_start,
                            r.virt_start,
                            r.size,
                            r.flags.into_bits()
                        );
                        out.regions.push(r);
                    }
                    None => out.regions.push(raw_region(region)),
                }
            }
            RegionEntry::Channel { channel } => {
                place_channel(cell, spec, channel, &mut out, &mut virt, ctx, errors);
            }
        }
    }

    let found = spec
        .memory_regions
        .iter()
        .filter(|e| matches!(e, RegionEntry::Region(r) if r.flags.comm_region()))
        .count();
    let expected = usize::from(!cell.is_root());
    if found != expected {
        errors.push(CompileError::InvalidRegion {
            at: Location::cell(&spec.name),
            reason: RegionError::CommRegionCount { expected, found },
        });
    }

    out
}

/// Best-effort table entry for a region that failed validation.
fn raw_region(region: &RegionSpec) -> MemoryRegion {
    MemoryRegion {
        phys_start: region.phys_start.unwrap_or(0),
        virt_start: region.effective_virt_start().unwrap_or(0),
        size: region.size,
        flags: region.flags,
    }
}

fn check_aligned(
    at: &Location,
    what: &'static str,
    value: u64,
    granule: u64,
    errors: &mut Vec<CompileError>,
) -> bool {
    if value.is_multiple_of(granule) {
        return true;
    }
    errors.push(CompileError::Alignment {
        at: at.clone(),
        what,
        value,
        granule,
    });
    false
}

/// Validate one author-written region; `None` if it is unusable.
pub fn check_region(
    cell: &str,
    index: usize,
    region: &RegionSpec,
    page_size: u64,
    errors: &mut Vec<CompileError>,
) -> Option<MemoryRegion> {
    let at = Location::region(cell, index);
    let invalid = |reason| CompileError::InvalidRegion {
        at: at.clone(),
        reason,
    };

    if region.size == 0 {
        errors.push(invalid(RegionError::ZeroSize));
        return None;
    }

    let flags = region.flags;
    let mut ok = true;

    if flags.comm_region() {
        if region.phys_start.is_some() {
            errors.push(invalid(RegionError::BackedCommRegion));
            ok = false;
        }
        if region.virt_start.is_none() {
            errors.push(invalid(RegionError::MissingVirtStart));
            return None;
        }
    } else if region.phys_start.is_none() {
        errors.push(invalid(RegionError::MissingPhysStart));
        return None;
    }

    let phys_start = region.phys_start.unwrap_or(0);
    let virt_start = region.effective_virt_start().unwrap_or(0);

    if region.phys_start.is_some()
        && PhysicalRange::new(PhysicalAddress::new(phys_start), region.size).wraps()
    {
        errors.push(invalid(RegionError::Wraps {
            space: Space::Physical,
            start: phys_start,
            size: region.size,
        }));
        ok = false;
    }
    if VirtualRange::new(VirtualAddress::new(virt_start), region.size).wraps() {
        errors.push(invalid(RegionError::Wraps {
            space: Space::Virtual,
            start: virt_start,
            size: region.size,
        }));
        ok = false;
    }

    ok &= check_aligned(&at, "physical start", phys_start, page_size, errors);
    ok &= check_aligned(&at, "virtual start", virt_start, page_size, errors);
    ok &= check_aligned(&at, "size", region.size, page_size, errors);

    if flags.dma() && !(flags.read() && flags.write()) {
        errors.push(invalid(RegionError::DmaNotReadWrite));
        ok = false;
    }
    if flags.loadable() && !(flags.execute() || flags.write()) {
        errors.push(invalid(RegionError::LoadableNotExecOrWrite));
        ok = false;
    }

    ok.then_some(MemoryRegion {
        phys_start,
        virt_start,
        size: region.size,
        flags,
    })
}

fn span_of<A: cell_addresses::Address>(range: &AddressRange<A>) -> Span {
    Span {
        start: range.start().to_u64(),
        size: range.size(),
    }
}

/// Map a rejected physical claim to a located error.
pub(crate) fn overlap_error(
    ctx: &SystemBuildContext,
    err: &OverlapError,
    at: Location,
) -> CompileError {
    let other = match err.existing.owner {
        Owner::Hypervisor => Location::HypervisorMemory,
        Owner::Cell(id) => Location::region(ctx.cell_name(id), err.existing.index),
    };
    CompileError::Overlap {
        space: Space::Physical,
        at,
        span: span_of(&err.incoming.phys),
        other,
        other_span: span_of(&err.existing.phys),
    }
}

fn claim_physical(
    cell: CellId,
    cell_name: &str,
    index: usize,
    region: &MemoryRegion,
    kind: ClaimKind,
    ctx: &mut SystemBuildContext,
    errors: &mut Vec<CompileError>,
) {
    let phys = PhysicalRange::new(PhysicalAddress::new(region.phys_start), region.size);
    let claim = Claim::region(cell, index, phys, region.flags)
        .with_virt_start(region.virt_start)
        .with_kind(kind);
    if let Err(err) = ctx.memory.claim(claim) {
        errors.push(overlap_error(ctx, &err, Location::region(cell_name, index)));
    }
}

fn claim_virtual(
    cell_name: &str,
    index: usize,
    region: &MemoryRegion,
    virt: &mut IntervalIndex<VirtualAddress, usize>,
    errors: &mut Vec<CompileError>,
) {
    let range = VirtualRange::new(VirtualAddress::new(region.virt_start), region.size);
    if let Some((other_range, &other)) = virt.overlapping(range).next() {
        errors.push(CompileError::Overlap {
            space: Space::Virtual,
            at: Location::region(cell_name, index),
            span: span_of(&range),
            other: Location::region(cell_name, other),
            other_span: span_of(other_range),
        });
        return;
    }
    virt.insert(range, index);
}

fn place_channel(
    cell: CellId,
    spec: &CellSpec,
    channel: &ChannelSpec,
    out: &mut CellRegions,
    virt: &mut IntervalIndex<VirtualAddress, usize>,
    ctx: &mut SystemBuildContext,
    errors: &mut Vec<CompileError>,
) {
    let at = || Location::channel(&spec.name, &channel.name);
    let layout_error = |reason| CompileError::ChannelLayout { at: at(), reason };

    if out.channel(&channel.name).is_some() || out.broken_channels.contains(&channel.name) {
        errors.push(layout_error(ChannelError::DuplicateName));
        return;
    }

    let laid_out = channel::span(channel)
        .and_then(|span| channel::expand(channel, ctx.options.page_size).map(|r| (span, r)));
    let (span, regions) = match laid_out {
        Ok(laid_out) => laid_out,
        Err(reason) => {
            errors.push(layout_error(reason));
            out.broken_channels.insert(channel.name.clone());
            return;
        }
    };

    if let Some(window) = ctx.comm_window()
        && let Err(reason) = channel::check_window(span, window)
    {
        errors.push(layout_error(reason));
    }
    if let Err(reason) = ctx.channels.register(cell, &spec.name, channel) {
        errors.push(layout_error(reason));
    }

    let first_index = out.regions.len();
    for (offset, region) in regions.iter().enumerate() {
        if region.is_empty() {
            continue;
        }
        let index = first_index + offset;
        let kind = ClaimKind::Channel { base: channel.base };
        claim_physical(cell, &spec.name, index, region, kind, ctx, errors);
        claim_virtual(&spec.name, index, region, virt, errors);
    }

    debug!(
        "cell `{}` channel `{}` at regions #{first_index}..#{}",
        spec.name,
        channel.name,
        first_index + regions.len().saturating_sub(1)
    );
    out.channels.push(PlacedChannel {
        spec: channel.clone(),
        first_index,
        region_count: regions.len(),
        span,
    });
    out.regions.extend(regions);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_abi::MemoryFlags;

    fn rw() -> MemoryFlags {
        MemoryFlags::new().with_read(true).with_write(true)
    }

    fn check(region: &RegionSpec) -> (Option<MemoryRegion>, Vec<CompileError>) {
        let mut errors = Vec::new();
        let r = check_region("cell", 0, region, 0x1000, &mut errors);
        (r, errors)
    }

    #[test]
    fn valid_identity_region() {
        let (r, errors) = check(&RegionSpec::identity(0xff0a_0000, 0x1000, rw().with_io(true)));
        assert!(errors.is_empty());
        let r = r.unwrap();
        assert_eq!(r.virt_start, 0xff0a_0000);
        assert!(r.flags.io());
    }

    #[test]
    fn zero_size_is_rejected() {
        let (r, errors) = check(&RegionSpec::identity(0x1000, 0, rw()));
        assert_eq!(r, None);
        assert!(matches!(
            errors.as_slice(),
            [CompileError::InvalidRegion {
                reason: RegionError::ZeroSize,
                ..
            }]
        ));
    }

    #[test]
    fn wrapping_region_is_rejected() {
        let (r, errors) = check(&RegionSpec::identity(0xffff_ffff_ffff_f000, 0x2000, rw()));
        assert_eq!(r, None);
        let wraps = errors
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    CompileError::InvalidRegion {
                        reason: RegionError::Wraps { .. },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(wraps, 2);
    }

    #[test]
    fn misalignment_names_the_field() {
        let (_, errors) = check(&RegionSpec::identity(0x1800, 0x1000, rw()));
        assert!(errors.iter().any(|e| matches!(
            e,
            CompileError::Alignment { what: "physical start", value: 0x1800, granule: 0x1000, .. }
        )));
    }

    #[test]
    fn flag_rules() {
        let read = MemoryFlags::new().with_read(true);
        let dma = RegionSpec::identity(0, 0x1000, read.with_dma(true));
        assert!(check(&dma).1.iter().any(|e| matches!(
            e,
            CompileError::InvalidRegion { reason: RegionError::DmaNotReadWrite, .. }
        )));
        let load = RegionSpec::identity(0, 0x1000, read.with_loadable(true));
        assert!(check(&load).1.iter().any(|e| matches!(
            e,
            CompileError::InvalidRegion { reason: RegionError::LoadableNotExecOrWrite, .. }
        )));
        let backed = RegionSpec::comm_region(0x8000_0000, 0x1000).with_phys_start(0x1000);
        assert!(check(&backed).1.iter().any(|e| matches!(
            e,
            CompileError::InvalidRegion { reason: RegionError::BackedCommRegion, .. }
        )));
    }

    #[test]
    fn comm_region_has_no_physical_start() {
        let (r, errors) = check(&RegionSpec::comm_region(0x8000_0000, 0x1000));
        assert!(errors.is_empty());
        assert_eq!(r.unwrap().phys_start, 0);
    }
}
