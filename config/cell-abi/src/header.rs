//! # Descriptor Headers
//!
//! | Record | Size | Notes |
//! |--------|------|-------|
//! | [`SystemHeader`] | 192 | Hypervisor memory, debug console, platform info. |
//! | [`CellHeader`] | 96 | Name, table counts, vPCI interrupt base, console. |
//! | [`Console`] | 24 | Embedded in both headers. |
//! | [`PlatformInfo`] | 128 | Embedded in the system header. |

use crate::wire::{Decoder, Encoder, Record};
use crate::{
    Architecture, CELL_NAME_MAXLEN, CELL_SIGNATURE, CONFIG_REVISION, CellFlags, ConsoleFlags,
    MAX_PMU_IRQS, ParseError, SYSTEM_SIGNATURE, SystemFlags,
};

pub(crate) const CELL_NAME_LEN: usize = 32;

/// UART or framebuffer model behind a console.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum ConsoleType {
    #[default]
    None = 0,
    EfiFramebuffer = 1,
    Uart8250 = 2,
    Pl011 = 3,
    XuartPs = 4,
    Mvebu = 5,
    Hscif = 6,
    Scifa = 7,
    Imx = 8,
    ImxLpuart = 9,
}

impl ConsoleType {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::EfiFramebuffer,
            2 => Self::Uart8250,
            3 => Self::Pl011,
            4 => Self::XuartPs,
            5 => Self::Mvebu,
            6 => Self::Hscif,
            7 => Self::Scifa,
            8 => Self::Imx,
            9 => Self::ImxLpuart,
            _ => return None,
        })
    }
}

/// Console description, used for the hypervisor's debug console and for the
/// per-cell console.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Console {
    pub address: u64,
    pub size: u64,
    pub console_type: ConsoleType,
    pub flags: ConsoleFlags,
}

impl Record for Console {
    const SIZE: usize = 24;

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_u64(self.address);
        enc.put_u64(self.size);
        enc.put_u32(self.console_type as u32);
        enc.put_u32(self.flags.into_bits());
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, ParseError> {
        let address = dec.get_u64()?;
        let size = dec.get_u64()?;
        let raw_type = dec.get_u32()?;
        let console_type = ConsoleType::from_raw(raw_type).ok_or(ParseError::InvalidField {
            field: "console.type",
            value: u64::from(raw_type),
        })?;
        let flags = ConsoleFlags::from_bits(dec.get_u32()?);
        Ok(Self {
            address,
            size,
            console_type,
            flags,
        })
    }
}

/// Physical memory reserved for the hypervisor itself.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HypervisorMemory {
    pub phys_start: u64,
    pub size: u64,
}

/// Cache-coloring parameters.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ColorInfo {
    /// LLC way size; zero lets the hypervisor autodetect it.
    pub way_size: u64,
    /// Offset of the colored root-cell mapping.
    pub root_map_offset: u64,
}

/// ARM interrupt controller parameters.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ArmInfo {
    pub maintenance_irq: u32,
    pub gic_version: u32,
    pub gicd_base: u64,
    pub gicc_base: u64,
    pub gich_base: u64,
    pub gicv_base: u64,
    pub gicr_base: u64,
}

/// Memory-bandwidth regulation parameters.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct MemguardInfo {
    pub num_irqs: u32,
    pub hv_timer: u32,
    pub irq_prio_min: u8,
    pub irq_prio_max: u8,
    pub irq_prio_step: u8,
    pub irq_prio_threshold: u8,
    pub num_pmu_irq: u32,
    pub pmu_cpu_irq: [u32; MAX_PMU_IRQS],
}

/// Platform parameters of the system descriptor.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PlatformInfo {
    pub pci_mmconfig_base: u64,
    pub pci_mmconfig_end_bus: u8,
    pub pci_is_virtual: bool,
    /// PCI domain of the virtual host bridge; `0xffff` selects one automatically.
    pub pci_domain: u16,
    pub color: ColorInfo,
    pub arm: ArmInfo,
    pub memguard: MemguardInfo,
}

impl Record for PlatformInfo {
    const SIZE: usize = 128;

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_u64(self.pci_mmconfig_base);
        enc.put_u8(self.pci_mmconfig_end_bus);
        enc.put_u8(u8::from(self.pci_is_virtual));
        enc.put_u16(self.pci_domain);
        enc.put_u32(0);

        enc.put_u64(self.color.way_size);
        enc.put_u64(self.color.root_map_offset);

        let arm = &self.arm;
        enc.put_u32(arm.maintenance_irq);
        enc.put_u32(arm.gic_version);
        enc.put_u64(arm.gicd_base);
        enc.put_u64(arm.gicc_base);
        enc.put_u64(arm.gich_base);
        enc.put_u64(arm.gicv_base);
        enc.put_u64(arm.gicr_base);

        let mg = &self.memguard;
        enc.put_u32(mg.num_irqs);
        enc.put_u32(mg.hv_timer);
        enc.put_u8(mg.irq_prio_min);
        enc.put_u8(mg.irq_prio_max);
        enc.put_u8(mg.irq_prio_step);
        enc.put_u8(mg.irq_prio_threshold);
        enc.put_u32(mg.num_pmu_irq);
        for irq in mg.pmu_cpu_irq {
            enc.put_u32(irq);
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, ParseError> {
        let pci_mmconfig_base = dec.get_u64()?;
        let pci_mmconfig_end_bus = dec.get_u8()?;
        let pci_is_virtual = dec.get_u8()? != 0;
        let pci_domain = dec.get_u16()?;
        let _reserved = dec.get_u32()?;

        let color = ColorInfo {
            way_size: dec.get_u64()?,
            root_map_offset: dec.get_u64()?,
        };

        let arm = ArmInfo {
            maintenance_irq: dec.get_u32()?,
            gic_version: dec.get_u32()?,
            gicd_base: dec.get_u64()?,
            gicc_base: dec.get_u64()?,
            gich_base: dec.get_u64()?,
            gicv_base: dec.get_u64()?,
            gicr_base: dec.get_u64()?,
        };

        let mut memguard = MemguardInfo {
            num_irqs: dec.get_u32()?,
            hv_timer: dec.get_u32()?,
            irq_prio_min: dec.get_u8()?,
            irq_prio_max: dec.get_u8()?,
            irq_prio_step: dec.get_u8()?,
            irq_prio_threshold: dec.get_u8()?,
            num_pmu_irq: dec.get_u32()?,
            pmu_cpu_irq: [0; MAX_PMU_IRQS],
        };
        for slot in &mut memguard.pmu_cpu_irq {
            *slot = dec.get_u32()?;
        }

        Ok(Self {
            pci_mmconfig_base,
            pci_mmconfig_end_bus,
            pci_is_virtual,
            pci_domain,
            color,
            arm,
            memguard,
        })
    }
}

fn decode_architecture(dec: &mut Decoder<'_>) -> Result<Architecture, ParseError> {
    let raw = dec.get_u32()?;
    Architecture::from_raw(raw).ok_or(ParseError::UnknownArchitecture(raw))
}

fn decode_revision(dec: &mut Decoder<'_>) -> Result<u32, ParseError> {
    let revision = dec.get_u32()?;
    if revision != CONFIG_REVISION {
        return Err(ParseError::UnsupportedRevision(revision));
    }
    Ok(revision)
}

/// Header of a system descriptor.
///
/// Always followed by the root cell's [`CellHeader`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SystemHeader {
    pub architecture: Architecture,
    pub revision: u32,
    pub flags: SystemFlags,
    pub hypervisor_memory: HypervisorMemory,
    pub debug_console: Console,
    pub platform_info: PlatformInfo,
}

impl Record for SystemHeader {
    const SIZE: usize = 192;

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_bytes(&SYSTEM_SIGNATURE);
        enc.put_u32(self.architecture as u32);
        enc.put_u32(self.revision);
        enc.put_u32(self.flags.into_bits());
        enc.put_u32(0);
        enc.put_u64(self.hypervisor_memory.phys_start);
        enc.put_u64(self.hypervisor_memory.size);
        enc.put_record(&self.debug_console);
        enc.put_record(&self.platform_info);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, ParseError> {
        if dec.get_bytes::<8>()? != SYSTEM_SIGNATURE {
            return Err(ParseError::BadSignature);
        }
        let architecture = decode_architecture(dec)?;
        let revision = decode_revision(dec)?;
        let flags = SystemFlags::from_bits(dec.get_u32()?);
        let _reserved = dec.get_u32()?;
        let hypervisor_memory = HypervisorMemory {
            phys_start: dec.get_u64()?,
            size: dec.get_u64()?,
        };
        let debug_console = dec.get_record()?;
        let platform_info = dec.get_record()?;
        Ok(Self {
            architecture,
            revision,
            flags,
            hypervisor_memory,
            debug_console,
            platform_info,
        })
    }
}

/// Header of a cell descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CellHeader {
    pub architecture: Architecture,
    pub revision: u32,
    pub flags: CellFlags,
    /// NUL-padded cell name.
    pub name: [u8; CELL_NAME_LEN],
    /// Size of the CPU bitmap in bytes (a multiple of 8).
    pub cpu_set_size: u32,
    pub num_memory_regions: u32,
    pub num_irqchips: u32,
    pub num_pci_devices: u32,
    pub vpci_irq_base: u32,
    pub console: Console,
}

impl CellHeader {
    /// Encode `name` as a NUL-padded field, or `None` if it is longer than
    /// [`CELL_NAME_MAXLEN`] bytes or contains a NUL byte.
    #[must_use]
    pub fn encode_name(name: &str) -> Option<[u8; CELL_NAME_LEN]> {
        let bytes = name.as_bytes();
        if bytes.len() > CELL_NAME_MAXLEN || bytes.contains(&0) {
            return None;
        }
        let mut out = [0u8; CELL_NAME_LEN];
        out[..bytes.len()].copy_from_slice(bytes);
        Some(out)
    }

    /// The name up to its first NUL, if it is valid UTF-8.
    #[must_use]
    pub fn name_str(&self) -> Option<&str> {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(CELL_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).ok()
    }
}

impl Record for CellHeader {
    const SIZE: usize = 96;

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_bytes(&CELL_SIGNATURE);
        enc.put_u32(self.architecture as u32);
        enc.put_u32(self.revision);
        enc.put_u32(self.flags.into_bits());
        enc.put_bytes(&self.name);
        enc.put_u32(self.cpu_set_size);
        enc.put_u32(self.num_memory_regions);
        enc.put_u32(self.num_irqchips);
        enc.put_u32(self.num_pci_devices);
        enc.put_u32(self.vpci_irq_base);
        enc.put_record(&self.console);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, ParseError> {
        if dec.get_bytes::<8>()? != CELL_SIGNATURE {
            return Err(ParseError::BadSignature);
        }
        let architecture = decode_architecture(dec)?;
        let revision = decode_revision(dec)?;
        let flags = CellFlags::from_bits(dec.get_u32()?);
        let name = dec.get_bytes::<CELL_NAME_LEN>()?;
        let cpu_set_size = dec.get_u32()?;
        if !cpu_set_size.is_multiple_of(8) {
            return Err(ParseError::InvalidField {
                field: "cpu_set_size",
                value: u64::from(cpu_set_size),
            });
        }
        Ok(Self {
            architecture,
            revision,
            flags,
            name,
            cpu_set_size,
            num_memory_regions: dec.get_u32()?,
            num_irqchips: dec.get_u32()?,
            num_pci_devices: dec.get_u32()?,
            vpci_irq_base: dec.get_u32()?,
            console: dec.get_record()?,
        })
    }
}
