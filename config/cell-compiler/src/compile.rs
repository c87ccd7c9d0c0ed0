//! # System Compilation
//!
//! Runs the passes over one [`SystemSpec`] in a fixed order and collects every
//! violation. Descriptors are assembled only once the whole system is clean.
//!
//! | Pass | Checks |
//! |------|--------|
//! | options, platform | page size, vPCI width, PMU interrupt count |
//! | cells | names, CPU sets |
//! | hypervisor memory, window | alignment, wrap, claim |
//! | regions | [`region::lay_out`] for every cell |
//! | interrupts | [`irq::map_irqchips`] for every cell |
//! | devices | PCI identity, channel binding, vPCI block |
//! | assembly | header counts (fatal) |

use crate::address_space::{Claim, ClaimKind, Owner};
use crate::assemble::{CellDescriptor, CompiledSystem, SystemDescriptor};
use crate::channel;
use crate::context::{CellId, SystemBuildContext};
use crate::error::{
    ChannelError, CompileError, CompileErrors, ConfigError, Location, RegionError, Space,
};
use crate::irq;
use crate::pci::PciSite;
use crate::region::{self, CellRegions};
use crate::spec::{CellSpec, RangeSpec, SystemSpec};
use cell_abi::{
    Architecture, ArmInfo, CONFIG_REVISION, CellHeader, ColorInfo, HypervisorMemory, IrqChip,
    MAX_PMU_IRQS, MemguardInfo, MemoryFlags, PciDevice, PlatformInfo, SystemHeader,
};
use log::{debug, warn};
use std::collections::BTreeSet;

/// Validate `spec` and build the descriptors of all its cells.
///
/// # Errors
/// Every violation found in the system, in pass order.
pub fn compile_system(spec: &SystemSpec) -> Result<CompiledSystem, CompileErrors> {
    let mut errors = Vec::new();

    check_options(spec, &mut errors);
    if !errors.is_empty() {
        // Alignment and interrupt checks are meaningless with broken options.
        return Err(CompileErrors::new(errors));
    }

    let mut ctx = SystemBuildContext::new(spec);
    let cells: Vec<(CellId, &CellSpec)> = spec
        .all_cells()
        .enumerate()
        .map(|(i, cell)| (CellId::new(i), cell))
        .collect();
    debug!(
        "compiling system with {} cell(s), page size {:#x}",
        cells.len(),
        ctx.options.page_size
    );

    let platform_info = platform_info(spec, &mut errors);
    check_cells(spec, &cells, &mut errors);
    claim_hypervisor_memory(&spec.hypervisor_memory, &mut ctx, &mut errors);
    if let Some(window) = &spec.comm_window {
        check_comm_window(window, &mut errors);
    }

    let layouts: Vec<CellRegions> = cells
        .iter()
        .map(|&(id, cell)| region::lay_out(id, cell, &mut ctx, &mut errors))
        .collect();
    let chips: Vec<Vec<IrqChip>> = cells
        .iter()
        .map(|&(id, cell)| irq::map_irqchips(id, cell, &mut ctx, &mut errors))
        .collect();

    let mut finished = Vec::with_capacity(cells.len());
    for ((&(id, cell), layout), mut chips) in cells.iter().zip(layouts).zip(chips) {
        let devices = bind_devices(id, cell, &layout, &mut ctx, &mut errors);
        let vpci_irq_base = irq::allocate_vpci(id, cell, &mut chips, &mut ctx, &mut errors);
        finished.push((cell, layout.regions, chips, devices, vpci_irq_base));
    }

    if !errors.is_empty() {
        return Err(CompileErrors::new(errors));
    }

    let architecture = Architecture::from(spec.architecture);
    let mut descriptors = Vec::with_capacity(finished.len());
    for (cell, regions, chips, devices, vpci_irq_base) in finished {
        let descriptor =
            CellDescriptor::assemble(architecture, cell, vpci_irq_base, regions, chips, devices)?;
        descriptor.check_consistency()?;
        descriptors.push(descriptor);
    }

    // `all_cells` yields the root cell first, so the table is never empty.
    let guests = descriptors.split_off(1);
    let root = descriptors.remove(0);
    let header = SystemHeader {
        architecture,
        revision: CONFIG_REVISION,
        flags: spec.flags,
        hypervisor_memory: HypervisorMemory {
            phys_start: spec.hypervisor_memory.phys_start,
            size: spec.hypervisor_memory.size,
        },
        debug_console: spec.debug_console.to_abi(),
        platform_info,
    };

    Ok(CompiledSystem {
        system: SystemDescriptor { header, root },
        cells: guests,
    })
}

fn check_options(spec: &SystemSpec, errors: &mut Vec<CompileError>) {
    let options = &spec.options;
    if !options.has_valid_page_size() {
        errors.push(CompileError::InvalidConfig {
            at: Location::Options,
            reason: ConfigError::InvalidPageSize(options.page_size),
        });
    }
    if !options.has_valid_vpci_width() {
        errors.push(CompileError::InvalidConfig {
            at: Location::Options,
            reason: ConfigError::InvalidVpciWidth(options.vpci_irq_width),
        });
    }
}

fn platform_info(spec: &SystemSpec, errors: &mut Vec<CompileError>) -> PlatformInfo {
    let p = &spec.platform;
    let m = &p.memguard;

    let mut pmu_cpu_irq = [0u32; MAX_PMU_IRQS];
    if m.pmu_cpu_irq.len() > MAX_PMU_IRQS {
        errors.push(CompileError::InvalidConfig {
            at: Location::Platform,
            reason: ConfigError::TooManyPmuIrqs(m.pmu_cpu_irq.len()),
        });
    }
    for (slot, &irq) in pmu_cpu_irq.iter_mut().zip(&m.pmu_cpu_irq) {
        *slot = irq;
    }

    PlatformInfo {
        pci_mmconfig_base: p.pci_mmconfig_base,
        pci_mmconfig_end_bus: p.pci_mmconfig_end_bus,
        pci_is_virtual: p.pci_is_virtual,
        pci_domain: p.pci_domain,
        color: ColorInfo {
            way_size: p.color.way_size,
            root_map_offset: p.color.root_map_offset,
        },
        arm: ArmInfo {
            maintenance_irq: p.arm.maintenance_irq,
            gic_version: p.arm.gic_version,
            gicd_base: p.arm.gicd_base,
            gicc_base: p.arm.gicc_base,
            gich_base: p.arm.gich_base,
            gicv_base: p.arm.gicv_base,
            gicr_base: p.arm.gicr_base,
        },
        memguard: MemguardInfo {
            num_irqs: m.num_irqs,
            hv_timer: m.hv_timer,
            irq_prio_min: m.irq_prio_min,
            irq_prio_max: m.irq_prio_max,
            irq_prio_step: m.irq_prio_step,
            irq_prio_threshold: m.irq_prio_threshold,
            num_pmu_irq: u32::try_from(m.pmu_cpu_irq.len().min(MAX_PMU_IRQS)).unwrap_or_default(),
            pmu_cpu_irq,
        },
    }
}

fn check_cells(spec: &SystemSpec, cells: &[(CellId, &CellSpec)], errors: &mut Vec<CompileError>) {
    let donation = spec.options.policy.root_donation;
    let mut seen = BTreeSet::new();

    for &(_, cell) in cells {
        let at = || Location::cell(&cell.name);
        if !is_valid_name(&cell.name) {
            errors.push(CompileError::InvalidConfig {
                at: at(),
                reason: ConfigError::InvalidName(cell.name.clone()),
            });
        }
        if !seen.insert(cell.name.as_str()) {
            errors.push(CompileError::InvalidConfig {
                at: at(),
                reason: ConfigError::DuplicateName,
            });
        }
        if cell.cpus.is_empty() {
            errors.push(CompileError::InvalidConfig {
                at: at(),
                reason: ConfigError::EmptyCpuSet,
            });
        }
    }

    for (i, &(a_id, a)) in cells.iter().enumerate() {
        for &(_, b) in &cells[i + 1..] {
            if donation && a_id.is_root() {
                continue;
            }
            if let Some(cpu) = a.cpus.first_common(&b.cpus) {
                errors.push(CompileError::CpuConflict {
                    at: Location::cell(&b.name),
                    cpu,
                    other: a.name.clone(),
                });
            }
        }
    }
}

/// Cell names become output file names, so they must stay a single path
/// component.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && CellHeader::encode_name(name).is_some()
}

/// Alignment and wrap checks shared by the hypervisor memory and the window.
fn check_span(at: &Location, range: &RangeSpec, errors: &mut Vec<CompileError>) -> bool {
    if range.size == 0 {
        errors.push(CompileError::InvalidRegion {
            at: at.clone(),
            reason: RegionError::ZeroSize,
        });
        return false;
    }
    if range.range().wraps() {
        errors.push(CompileError::InvalidRegion {
            at: at.clone(),
            reason: RegionError::Wraps {
                space: Space::Physical,
                start: range.phys_start,
                size: range.size,
            },
        });
        return false;
    }
    true
}

fn claim_hypervisor_memory(
    range: &RangeSpec,
    ctx: &mut SystemBuildContext,
    errors: &mut Vec<CompileError>,
) {
    let at = Location::HypervisorMemory;
    if !check_span(&at, range, errors) {
        return;
    }

    let page_size = ctx.options.page_size;
    for (what, value) in [("physical start", range.phys_start), ("size", range.size)] {
        if !value.is_multiple_of(page_size) {
            errors.push(CompileError::Alignment {
                at: at.clone(),
                what,
                value,
                granule: page_size,
            });
        }
    }

    let claim = Claim {
        owner: Owner::Hypervisor,
        index: 0,
        kind: ClaimKind::Region,
        phys: range.range(),
        virt_start: range.phys_start,
        flags: MemoryFlags::new(),
    };
    if let Err(err) = ctx.memory.claim(claim) {
        errors.push(region::overlap_error(ctx, &err, at));
    }
}

fn check_comm_window(window: &RangeSpec, errors: &mut Vec<CompileError>) {
    check_span(&Location::CommWindow, window, errors);
}

/// Emit the IVSHMEM functions of `cell`, each bound to one of its channels.
fn bind_devices(
    cell: CellId,
    spec: &CellSpec,
    layout: &CellRegions,
    ctx: &mut SystemBuildContext,
    errors: &mut Vec<CompileError>,
) -> Vec<PciDevice> {
    let mut bound = BTreeSet::new();
    let mut devices = Vec::with_capacity(spec.pci_devices.len());

    for (index, device) in spec.pci_devices.iter().enumerate() {
        let at = || Location::pci_device(&spec.name, index);
        let site = PciSite {
            cell: cell.index(),
            index,
        };
        if let Err(other) = ctx.pci.register(device.domain, device.bdf, site) {
            errors.push(CompileError::PciIdentityConflict {
                at: at(),
                domain: device.domain,
                bdf: device.bdf,
                other: Location::pci_device(ctx.cell_name(CellId::new(other.cell)), other.index),
            });
        }

        let Some(placed) = layout.channel(&device.channel) else {
            if !layout.broken_channels.contains(&device.channel) {
                errors.push(CompileError::InvalidConfig {
                    at: at(),
                    reason: ConfigError::UnknownChannel(device.channel.clone()),
                });
            }
            continue;
        };
        if !bound.insert(device.channel.as_str()) {
            errors.push(CompileError::ChannelLayout {
                at: Location::channel(&spec.name, &device.channel),
                reason: ChannelError::BoundTwice,
            });
            continue;
        }
        let Ok(first_index) = u32::try_from(placed.first_index) else {
            errors.push(CompileError::InvalidConfig {
                at: at(),
                reason: ConfigError::TableTooLarge(placed.first_index),
            });
            continue;
        };

        debug!(
            "cell `{}` PCI {:04x}:{} -> channel `{}` at region #{first_index}",
            spec.name, device.domain, device.bdf, device.channel
        );
        devices.push(channel::companion_device(&placed.spec, first_index, device));
    }

    for placed in &layout.channels {
        if !bound.contains(placed.spec.name.as_str()) {
            warn!(
                "cell `{}`: channel `{}` is not bound to any PCI device",
                spec.name, placed.spec.name
            );
        }
    }

    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CompileOptions;
    use crate::spec::{CpuSet, IrqChipSpec, IrqRange, RegionSpec};

    fn rw() -> MemoryFlags {
        MemoryFlags::new().with_read(true).with_write(true)
    }

    fn system() -> SystemSpec {
        let root = CellSpec::new("root", CpuSet::from_ids([0, 1]))
            .with_entry(RegionSpec::identity(0x0, 0x1000_0000, rw()))
            .with_irqchip(IrqChipSpec::new(0xff58_1000, 32).with_range(IrqRange::span(32, 63)));
        SystemSpec::new(RangeSpec::new(0x1f40_0000, 0x80_0000), root)
    }

    #[test]
    fn minimal_system_compiles() {
        let compiled = compile_system(&system()).unwrap();
        assert_eq!(compiled.system.root.name(), "root");
        assert!(compiled.cells.is_empty());
        assert_eq!(compiled.system.header.hypervisor_memory.size, 0x80_0000);
    }

    #[test]
    fn bad_options_stop_early() {
        let spec = system().with_options(CompileOptions::default().with_page_size(0x1800));
        let errors = compile_system(&spec).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors.as_slice(),
            [CompileError::InvalidConfig {
                reason: ConfigError::InvalidPageSize(0x1800),
                ..
            }]
        ));
    }

    #[test]
    fn cpu_conflict_names_both_cells() {
        let guest = CellSpec::new("guest", CpuSet::from_ids([1, 2]))
            .with_entry(RegionSpec::comm_region(0x8000_0000, 0x1000));
        let spec = system().with_cells(vec![guest]);
        let errors = compile_system(&spec).unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            CompileError::CpuConflict { cpu: 1, other, .. } if other == "root"
        )));
    }

    #[test]
    fn hypervisor_memory_is_never_shared() {
        let guest = CellSpec::new("guest", CpuSet::from_ids([2]))
            .with_entry(RegionSpec::identity(0x1f40_0000, 0x1000, rw()))
            .with_entry(RegionSpec::comm_region(0x8000_0000, 0x1000));
        let spec = system().with_cells(vec![guest]);
        let errors = compile_system(&spec).unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            CompileError::Overlap { other: Location::HypervisorMemory, .. }
        )));
    }

    #[test]
    fn duplicate_cell_names_are_rejected() {
        let guest = CellSpec::new("root", CpuSet::from_ids([2]))
            .with_entry(RegionSpec::comm_region(0x8000_0000, 0x1000));
        let spec = system().with_cells(vec![guest]);
        let errors = compile_system(&spec).unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            CompileError::InvalidConfig { reason: ConfigError::DuplicateName, .. }
        )));
    }

    #[test]
    fn names_must_be_single_path_components() {
        for name in ["../../escape", "boards/linux", "a\\b", ".hidden", ""] {
            let guest = CellSpec::new(name, CpuSet::from_ids([2]))
                .with_entry(RegionSpec::comm_region(0x8000_0000, 0x1000));
            let errors = compile_system(&system().with_cells(vec![guest])).unwrap_err();
            assert!(
                errors.iter().any(|e| matches!(
                    e,
                    CompileError::InvalidConfig {
                        reason: ConfigError::InvalidName(n),
                        ..
                    } if n == name
                )),
                "{name:?} was accepted"
            );
        }
        assert!(is_valid_name("rk3308-linux.v2"));
    }

    #[test]
    fn too_many_pmu_interrupts() {
        let mut spec = system();
        spec.platform.memguard.pmu_cpu_irq = (0..9).collect();
        let errors = compile_system(&spec).unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            CompileError::InvalidConfig { reason: ConfigError::TooManyPmuIrqs(9), .. }
        )));
    }
}
