//! # Cell Descriptor ABI
//!
//! The fixed binary layout shared between the configuration compiler and the
//! hypervisor loader. Everything here is plain data: signatures, revision,
//! flag words and fixed-size records, each with an explicit little-endian
//! encoding that does not depend on host layout or endianness.
//!
//! ## Layout
//!
//! A **system** descriptor configures the hypervisor and its root cell:
//!
//! ```text
//! SystemHeader | CellHeader | cpus[] | mem_regions[] | irqchips[] | pci_devices[]
//! ```
//!
//! A **cell** descriptor configures one guest cell:
//!
//! ```text
//! CellHeader | cpus[] | mem_regions[] | irqchips[] | pci_devices[]
//! ```
//!
//! The loader trusts the header counts and performs no bounds inference, so
//! every array is written contiguously and its length must match the count in
//! the [`CellHeader`] exactly.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod flags;
mod header;
mod table;
mod wire;

#[cfg(feature = "parse")]
pub mod parse;

pub use crate::flags::{CellFlags, ConsoleFlags, MemoryFlags, SystemFlags};
pub use crate::header::{
    ArmInfo, CellHeader, ColorInfo, Console, ConsoleType, HypervisorMemory, MemguardInfo,
    PlatformInfo, SystemHeader,
};
pub use crate::table::{IrqChip, MemoryRegion, PciDevice, PciDeviceType, ShmemProtocol};
pub use crate::wire::{Decoder, Encoder, Record};

/// Signature of a system descriptor (`"JHSYS"`, NUL padded).
pub const SYSTEM_SIGNATURE: [u8; 8] = *b"JHSYS\0\0\0";

/// Signature of a cell descriptor (`"JHCELL"`, NUL padded).
pub const CELL_SIGNATURE: [u8; 8] = *b"JHCELL\0\0";

/// Layout revision understood by the loader.
pub const CONFIG_REVISION: u32 = 13;

/// Maximum cell name length in bytes, excluding the terminating NUL.
pub const CELL_NAME_MAXLEN: usize = 31;

/// Number of 32-bit words in an irqchip pin bitmap.
pub const IRQCHIP_BITMAP_WORDS: usize = 4;

/// Interrupt lines covered by one irqchip entry.
pub const IRQCHIP_PINS: u32 = (IRQCHIP_BITMAP_WORDS * 32) as u32;

/// Number of BAR mask words in a PCI device record.
pub const PCI_BAR_COUNT: usize = 6;

/// Number of per-CPU PMU interrupt slots in [`MemguardInfo`].
pub const MAX_PMU_IRQS: usize = 8;

/// BAR mask of an IVSHMEM device using legacy INTx interrupts.
pub const IVSHMEM_BAR_MASK_INTX: [u32; PCI_BAR_COUNT] = [0xffff_f000, 0, 0, 0, 0, 0];

/// BAR mask of an IVSHMEM device using MSI-X interrupts.
pub const IVSHMEM_BAR_MASK_MSIX: [u32; PCI_BAR_COUNT] =
    [0xffff_f000, 0xffff_fe00, 0, 0, 0, 0];

/// Target architecture stamped into every header.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Architecture {
    X86 = 0,
    Arm = 1,
    Arm64 = 2,
}

impl Architecture {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::X86),
            1 => Some(Self::Arm),
            2 => Some(Self::Arm64),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
        }
    }
}

impl core::fmt::Display for Architecture {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while decoding a descriptor blob.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("descriptor truncated: need {needed} bytes at offset {offset}, have {available}")]
    TooShort {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("bad descriptor signature")]
    BadSignature,
    #[error("unsupported configuration revision {0}")]
    UnsupportedRevision(u32),
    #[error("unknown architecture {0}")]
    UnknownArchitecture(u32),
    #[error("invalid value {value:#x} in field `{field}`")]
    InvalidField { field: &'static str, value: u64 },
    #[error("{0} trailing bytes after the last table")]
    TrailingBytes(usize),
}

const _: () = {
    assert!(IRQCHIP_PINS == 128);
    assert!(CELL_NAME_MAXLEN + 1 == header::CELL_NAME_LEN);
};
