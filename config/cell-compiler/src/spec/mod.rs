//! # Board Model
//!
//! The parsed, not yet validated description of one partitioned system. It
//! mirrors the board JSON one to one; every structural rule is checked later
//! by the compiler so that all violations can be reported together.
//!
//! | Type | Board key | Notes |
//! |------|-----------|-------|
//! | [`SystemSpec`] | top level | Hypervisor memory, consoles, platform, options, cells. |
//! | [`CellSpec`] | `root_cell`, `cells[]` | One partition. |
//! | [`RegionEntry`] | `memory_regions[]` | A region, or a channel expanded in place. |
//! | [`IrqChipSpec`] | `irqchips[]` | Controller window plus interrupt ranges. |
//! | [`ChannelSpec`] | `{ "channel": ... }` | Shared-memory channel endpoint. |
//! | [`PciDeviceSpec`] | `pci_devices[]` | IVSHMEM function bound to a channel by name. |

pub mod de;
mod cpus;

pub use cpus::{CpuSet, MAX_CPUS};

use crate::options::{CompileOptions, DEFAULT_CHUNK_SIZE, LARGE_CHUNK_SIZE};
use crate::pci::{BarMask, Bdf};
use cell_abi::{
    Architecture, CellFlags, Console, ConsoleFlags, ConsoleType, MemoryFlags, ShmemProtocol,
    SystemFlags,
};
use cell_addresses::{PhysicalAddress, PhysicalRange};
use de::Int;
use serde::Deserialize;
use utils_accessors_derive::Setters;

/// A whole system: hypervisor, root cell and guest cells.
#[derive(Debug, Clone, Deserialize, Setters)]
#[serde(deny_unknown_fields)]
pub struct SystemSpec {
    #[serde(default)]
    pub architecture: TargetArch,
    #[serde(default, deserialize_with = "de::system_flags")]
    pub flags: SystemFlags,
    pub hypervisor_memory: RangeSpec,
    #[serde(default)]
    pub debug_console: ConsoleSpec,
    #[serde(default)]
    pub platform: PlatformSpec,
    /// Physical window all shared-memory channels must lie in.
    #[serde(default)]
    #[setters(strip_option)]
    pub comm_window: Option<RangeSpec>,
    /// Interrupts any number of cells may claim, e.g. the GIC maintenance
    /// interrupt.
    #[serde(default, deserialize_with = "de::vec_u32_any")]
    pub shareable_irqs: Vec<u32>,
    #[serde(default)]
    pub options: CompileOptions,
    pub root_cell: CellSpec,
    #[serde(default)]
    pub cells: Vec<CellSpec>,
}

impl SystemSpec {
    #[must_use]
    pub fn new(hypervisor_memory: RangeSpec, root_cell: CellSpec) -> Self {
        Self {
            architecture: TargetArch::default(),
            flags: SystemFlags::new(),
            hypervisor_memory,
            debug_console: ConsoleSpec::default(),
            platform: PlatformSpec::default(),
            comm_window: None,
            shareable_irqs: Vec::new(),
            options: CompileOptions::default(),
            root_cell,
            cells: Vec::new(),
        }
    }

    /// Root cell first, then the guests in board order.
    pub fn all_cells(&self) -> impl Iterator<Item = &CellSpec> {
        core::iter::once(&self.root_cell).chain(&self.cells)
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetArch {
    X86,
    Arm,
    #[default]
    Arm64,
}

impl From<TargetArch> for Architecture {
    fn from(arch: TargetArch) -> Self {
        match arch {
            TargetArch::X86 => Self::X86,
            TargetArch::Arm => Self::Arm,
            TargetArch::Arm64 => Self::Arm64,
        }
    }
}

/// A physical span, used for hypervisor memory and the channel window.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeSpec {
    #[serde(alias = "start", deserialize_with = "de::u64_any")]
    pub phys_start: u64,
    #[serde(deserialize_with = "de::u64_any")]
    pub size: u64,
}

impl RangeSpec {
    #[must_use]
    pub const fn new(phys_start: u64, size: u64) -> Self {
        Self { phys_start, size }
    }

    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        PhysicalRange::new(PhysicalAddress::new(self.phys_start), self.size)
    }
}

/// Console model names as written in board files.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize)]
pub enum ConsoleKind {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "efifb")]
    EfiFramebuffer,
    #[serde(rename = "8250")]
    Uart8250,
    #[serde(rename = "pl011")]
    Pl011,
    #[serde(rename = "xuartps")]
    XuartPs,
    #[serde(rename = "mvebu")]
    Mvebu,
    #[serde(rename = "hscif")]
    Hscif,
    #[serde(rename = "scifa")]
    Scifa,
    #[serde(rename = "imx")]
    Imx,
    #[serde(rename = "imx-lpuart")]
    ImxLpuart,
}

impl From<ConsoleKind> for ConsoleType {
    fn from(kind: ConsoleKind) -> Self {
        match kind {
            ConsoleKind::None => Self::None,
            ConsoleKind::EfiFramebuffer => Self::EfiFramebuffer,
            ConsoleKind::Uart8250 => Self::Uart8250,
            ConsoleKind::Pl011 => Self::Pl011,
            ConsoleKind::XuartPs => Self::XuartPs,
            ConsoleKind::Mvebu => Self::Mvebu,
            ConsoleKind::Hscif => Self::Hscif,
            ConsoleKind::Scifa => Self::Scifa,
            ConsoleKind::Imx => Self::Imx,
            ConsoleKind::ImxLpuart => Self::ImxLpuart,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize, Setters)]
#[serde(deny_unknown_fields)]
pub struct ConsoleSpec {
    #[serde(default, deserialize_with = "de::u64_any")]
    pub address: u64,
    #[serde(default, deserialize_with = "de::u64_any")]
    pub size: u64,
    #[serde(default, rename = "type")]
    pub kind: ConsoleKind,
    #[serde(default, deserialize_with = "de::console_flags")]
    pub flags: ConsoleFlags,
}

impl ConsoleSpec {
    #[must_use]
    pub fn to_abi(&self) -> Console {
        Console {
            address: self.address,
            size: self.size,
            console_type: self.kind.into(),
            flags: self.flags,
        }
    }
}

/// Platform block of the system descriptor.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize, Setters)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformSpec {
    #[serde(deserialize_with = "de::u64_any")]
    pub pci_mmconfig_base: u64,
    #[serde(deserialize_with = "de::u8_any")]
    pub pci_mmconfig_end_bus: u8,
    pub pci_is_virtual: bool,
    #[serde(deserialize_with = "de::u16_any")]
    pub pci_domain: u16,
    pub color: ColorSpec,
    pub arm: ArmSpec,
    pub memguard: MemguardSpec,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColorSpec {
    #[serde(deserialize_with = "de::u64_any")]
    pub way_size: u64,
    #[serde(deserialize_with = "de::u64_any")]
    pub root_map_offset: u64,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArmSpec {
    #[serde(deserialize_with = "de::u32_any")]
    pub maintenance_irq: u32,
    #[serde(deserialize_with = "de::u32_any")]
    pub gic_version: u32,
    #[serde(deserialize_with = "de::u64_any")]
    pub gicd_base: u64,
    #[serde(deserialize_with = "de::u64_any")]
    pub gicc_base: u64,
    #[serde(deserialize_with = "de::u64_any")]
    pub gich_base: u64,
    #[serde(deserialize_with = "de::u64_any")]
    pub gicv_base: u64,
    #[serde(deserialize_with = "de::u64_any")]
    pub gicr_base: u64,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemguardSpec {
    #[serde(deserialize_with = "de::u32_any")]
    pub num_irqs: u32,
    #[serde(deserialize_with = "de::u32_any")]
    pub hv_timer: u32,
    #[serde(deserialize_with = "de::u8_any")]
    pub irq_prio_min: u8,
    #[serde(deserialize_with = "de::u8_any")]
    pub irq_prio_max: u8,
    #[serde(deserialize_with = "de::u8_any")]
    pub irq_prio_step: u8,
    #[serde(deserialize_with = "de::u8_any")]
    pub irq_prio_threshold: u8,
    /// Per-CPU PMU overflow interrupts, at most eight.
    #[serde(deserialize_with = "de::vec_u32_any")]
    pub pmu_cpu_irq: Vec<u32>,
}

/// One cell of the system.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Setters)]
#[serde(deny_unknown_fields)]
pub struct CellSpec {
    #[setters(into)]
    pub name: String,
    #[serde(default, deserialize_with = "de::cell_flags")]
    pub flags: CellFlags,
    pub cpus: CpuSet,
    #[serde(default)]
    #[setters(strip_option)]
    pub console: Option<ConsoleSpec>,
    /// Absolute first interrupt of the vPCI block; searched when absent.
    #[serde(default, deserialize_with = "de::opt_u32_any")]
    #[setters(strip_option)]
    pub vpci_irq_base: Option<u32>,
    #[serde(default)]
    pub memory_regions: Vec<RegionEntry>,
    #[serde(default)]
    pub irqchips: Vec<IrqChipSpec>,
    #[serde(default)]
    pub pci_devices: Vec<PciDeviceSpec>,
}

impl CellSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, cpus: CpuSet) -> Self {
        Self {
            name: name.into(),
            flags: CellFlags::new(),
            cpus,
            console: None,
            vpci_irq_base: None,
            memory_regions: Vec::new(),
            irqchips: Vec::new(),
            pci_devices: Vec::new(),
        }
    }

    /// Append a region or channel entry.
    #[must_use]
    pub fn with_entry(mut self, entry: impl Into<RegionEntry>) -> Self {
        self.memory_regions.push(entry.into());
        self
    }

    #[must_use]
    pub fn with_irqchip(mut self, chip: IrqChipSpec) -> Self {
        self.irqchips.push(chip);
        self
    }

    #[must_use]
    pub fn with_pci_device(mut self, device: PciDeviceSpec) -> Self {
        self.pci_devices.push(device);
        self
    }
}

/// One entry of a cell's `memory_regions` list.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(untagged, expecting = "a memory region or a { \"channel\": { ... } } entry")]
pub enum RegionEntry {
    Channel { channel: ChannelSpec },
    Region(RegionSpec),
}

impl From<RegionSpec> for RegionEntry {
    fn from(region: RegionSpec) -> Self {
        Self::Region(region)
    }
}

impl From<ChannelSpec> for RegionEntry {
    fn from(channel: ChannelSpec) -> Self {
        Self::Channel { channel }
    }
}

/// A memory region as written by the board author.
///
/// `virt_start` defaults to `phys_start` (identity mapping). Communication
/// regions carry no `phys_start`.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize, Setters)]
#[serde(deny_unknown_fields)]
pub struct RegionSpec {
    #[serde(default, deserialize_with = "de::opt_u64_any")]
    #[setters(strip_option)]
    pub phys_start: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64_any")]
    #[setters(strip_option)]
    pub virt_start: Option<u64>,
    #[serde(deserialize_with = "de::u64_any")]
    pub size: u64,
    #[serde(default, deserialize_with = "de::memory_flags")]
    pub flags: MemoryFlags,
    /// Free-form label carried into diagnostics.
    #[serde(default)]
    #[setters(into, strip_option)]
    pub comment: Option<String>,
}

impl RegionSpec {
    /// An identity-mapped region.
    #[must_use]
    pub fn identity(phys_start: u64, size: u64, flags: MemoryFlags) -> Self {
        Self {
            phys_start: Some(phys_start),
            virt_start: None,
            size,
            flags,
            comment: None,
        }
    }

    /// The communication region mapped at `virt_start`.
    #[must_use]
    pub fn comm_region(virt_start: u64, size: u64) -> Self {
        Self {
            phys_start: None,
            virt_start: Some(virt_start),
            size,
            flags: MemoryFlags::new()
                .with_read(true)
                .with_write(true)
                .with_comm_region(true),
            comment: None,
        }
    }

    /// Effective virtual start: explicit, or identity with the physical one.
    #[must_use]
    pub fn effective_virt_start(&self) -> Option<u64> {
        self.virt_start.or(self.phys_start)
    }
}

/// Interrupt lines of one controller window.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Setters)]
#[serde(deny_unknown_fields)]
pub struct IrqChipSpec {
    #[serde(deserialize_with = "de::u64_any")]
    pub address: u64,
    #[serde(deserialize_with = "de::u32_any")]
    pub pin_base: u32,
    #[serde(default)]
    pub ranges: Vec<IrqRange>,
}

impl IrqChipSpec {
    #[must_use]
    pub const fn new(address: u64, pin_base: u32) -> Self {
        Self {
            address,
            pin_base,
            ranges: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_range(mut self, range: IrqRange) -> Self {
        self.ranges.push(range);
        self
    }
}

/// Inclusive span of absolute interrupt numbers.
///
/// Written as a bare number for a single line, or as
/// `{ "first": .., "last": .., "shareable": .. }`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(from = "RawIrqRange")]
pub struct IrqRange {
    pub first: u32,
    pub last: u32,
    pub shareable: bool,
}

impl IrqRange {
    #[must_use]
    pub const fn single(irq: u32) -> Self {
        Self::span(irq, irq)
    }

    #[must_use]
    pub const fn span(first: u32, last: u32) -> Self {
        Self {
            first,
            last,
            shareable: false,
        }
    }

    #[must_use]
    pub const fn shareable(mut self) -> Self {
        self.shareable = true;
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIrqRange {
    Line(Int<u32>),
    Span {
        first: Int<u32>,
        #[serde(default)]
        last: Option<Int<u32>>,
        #[serde(default)]
        shareable: bool,
    },
}

impl From<RawIrqRange> for IrqRange {
    fn from(raw: RawIrqRange) -> Self {
        match raw {
            RawIrqRange::Line(Int(irq)) => Self::single(irq),
            RawIrqRange::Span {
                first: Int(first),
                last,
                shareable,
            } => Self {
                first,
                last: last.map_or(first, |Int(last)| last),
                shareable,
            },
        }
    }
}

/// How a channel's regions are placed.
///
/// Written as `"network"` or `{ "uniform": { "chunk_size": .. } }`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelLayout {
    /// `peers + 2` contiguous regions of `chunk_size` bytes each.
    Uniform {
        #[serde(default = "default_chunk_size", deserialize_with = "de::u64_any")]
        chunk_size: u64,
    },
    /// Two-peer network layout in a 1 MiB window.
    Network,
}

const fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

impl ChannelLayout {
    /// Uniform layout with 1 MiB chunks.
    pub const LARGE: Self = Self::Uniform {
        chunk_size: LARGE_CHUNK_SIZE,
    };

    #[must_use]
    pub const fn uniform(chunk_size: u64) -> Self {
        Self::Uniform { chunk_size }
    }
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self::uniform(DEFAULT_CHUNK_SIZE)
    }
}

impl core::fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Uniform { chunk_size } => write!(f, "uniform/{chunk_size:#x}"),
            Self::Network => f.write_str("network"),
        }
    }
}

#[derive(Deserialize)]
#[serde(remote = "ShmemProtocol", rename_all = "kebab-case")]
enum ShmemProtocolDef {
    Undefined,
    Veth,
    VirtioFront(u16),
    VirtioBack(u16),
}

/// This cell's end of a shared-memory channel.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Setters)]
#[serde(deny_unknown_fields)]
pub struct ChannelSpec {
    /// Name the cell's PCI device refers to.
    #[setters(into)]
    pub name: String,
    #[serde(deserialize_with = "de::u64_any")]
    pub base: u64,
    #[serde(deserialize_with = "de::u8_any")]
    pub peers: u8,
    #[serde(deserialize_with = "de::u8_any")]
    pub peer_id: u8,
    #[serde(default, with = "ShmemProtocolDef")]
    pub protocol: ShmemProtocol,
    #[serde(default)]
    pub layout: ChannelLayout,
}

impl ChannelSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, base: u64, peers: u8, peer_id: u8) -> Self {
        Self {
            name: name.into(),
            base,
            peers,
            peer_id,
            protocol: ShmemProtocol::Undefined,
            layout: ChannelLayout::default(),
        }
    }
}

/// An IVSHMEM function exposing one of the cell's channels.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Setters)]
#[serde(deny_unknown_fields)]
pub struct PciDeviceSpec {
    #[serde(default, deserialize_with = "de::u16_any")]
    pub domain: u16,
    pub bdf: Bdf,
    #[serde(default)]
    pub bar_mask: BarMask,
    /// Name of the channel in this cell's `memory_regions`.
    #[setters(into)]
    pub channel: String,
}

impl PciDeviceSpec {
    #[must_use]
    pub fn new(domain: u16, bdf: Bdf, channel: impl Into<String>) -> Self {
        Self {
            domain,
            bdf,
            bar_mask: BarMask::default(),
            channel: channel.into(),
        }
    }
}
