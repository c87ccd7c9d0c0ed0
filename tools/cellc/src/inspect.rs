//! Human-readable dump of a descriptor blob.

use cell_abi::ParseError;
use cell_abi::parse::{Descriptor, DescriptorKind};
use cell_compiler::pci::Bdf;
use std::fmt::Write;

/// Render every header field and table entry of `desc`.
///
/// # Errors
/// A table record that does not decode.
pub fn render(desc: &Descriptor<'_>) -> Result<String, ParseError> {
    let mut out = String::new();
    let cell = desc.cell();
    let name = cell.name_str().unwrap_or("<invalid>");

    let kind = match desc.kind() {
        DescriptorKind::System => "system",
        DescriptorKind::Cell => "cell",
    };
    let _ = writeln!(
        out,
        "{kind} descriptor `{name}` ({}, revision {})",
        cell.architecture, cell.revision
    );

    if let Some(sys) = desc.system() {
        let hv = sys.hypervisor_memory;
        let _ = writeln!(out, "  flags            {:#010x}", sys.flags.into_bits());
        let _ = writeln!(out, "  hypervisor       {:#x} +{:#x}", hv.phys_start, hv.size);
        let c = sys.debug_console;
        let _ = writeln!(
            out,
            "  debug console    {:?} at {:#x} +{:#x} flags {:#x}",
            c.console_type,
            c.address,
            c.size,
            c.flags.into_bits()
        );
        let arm = sys.platform_info.arm;
        let _ = writeln!(
            out,
            "  gic v{}          gicd {:#x} gicr {:#x} maintenance irq {}",
            arm.gic_version, arm.gicd_base, arm.gicr_base, arm.maintenance_irq
        );
    }

    let _ = writeln!(out, "  cell flags       {:#010x}", cell.flags.into_bits());
    let cpus: Vec<String> = desc.cpus().map(|w| format!("{w:#x}")).collect();
    let _ = writeln!(out, "  cpus             [{}]", cpus.join(", "));
    let _ = writeln!(out, "  vpci irq base    {}", cell.vpci_irq_base);

    let _ = writeln!(out, "  memory regions   {}", cell.num_memory_regions);
    for (i, region) in desc.memory_regions().enumerate() {
        let r = region?;
        let _ = writeln!(
            out,
            "    #{i:<3} phys {:#014x} virt {:#014x} size {:#010x} flags {:#06x}",
            r.phys_start,
            r.virt_start,
            r.size,
            r.flags.into_bits()
        );
    }

    let _ = writeln!(out, "  irqchips         {}", cell.num_irqchips);
    for (i, chip) in desc.irqchips().enumerate() {
        let c = chip?;
        let words: Vec<String> = c.pin_bitmap.iter().map(|w| format!("{w:#010x}")).collect();
        let _ = writeln!(
            out,
            "    #{i:<3} {:#x} pin base {} bitmap [{}]",
            c.address,
            c.pin_base,
            words.join(", ")
        );
    }

    let _ = writeln!(out, "  pci devices      {}", cell.num_pci_devices);
    for (i, device) in desc.pci_devices().enumerate() {
        let d = device?;
        let _ = writeln!(
            out,
            "    #{i:<3} {:04x}:{} {:?} regions from #{} peer {}/{} {:?}",
            d.domain,
            Bdf::from_raw(d.bdf),
            d.device_type,
            d.shmem_regions_start,
            d.shmem_dev_id,
            d.shmem_peers,
            d.shmem_protocol
        );
    }

    Ok(out)
}
