//! # Descriptor Flag Words
//!
//! Bit-exact models of the flag words stored in descriptors. Reserved bits are
//! kept private and default to zero so that an encoded word never carries bits
//! the loader does not know about.

use bitfield_struct::bitfield;

/// Access and usage flags of a memory region.
#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
pub struct MemoryFlags {
    /// Bit 0: the cell may read the region.
    pub read: bool,

    /// Bit 1: the cell may write the region.
    pub write: bool,

    /// Bit 2: the cell may execute from the region.
    pub execute: bool,

    /// Bit 3: devices assigned to the cell may DMA into the region.
    ///
    /// Only meaningful together with read and write access.
    pub dma: bool,

    /// Bit 4: the region is device MMIO rather than RAM.
    pub io: bool,

    /// Bit 5: the cell/hypervisor communication page.
    ///
    /// Has no physical backing; only the virtual start is used.
    pub comm_region: bool,

    /// Bit 6: the root cell may load an image into the region.
    pub loadable: bool,

    /// Bit 7: the root cell keeps access to the region.
    pub root_shared: bool,

    /// Bit 8: map with 4 KiB pages only.
    pub no_hugepages: bool,

    /// Bit 9: the region is backed by cache-colored memory.
    pub colored: bool,

    /// Bits 10–31: Reserved (must be 0).
    #[bits(22, default = 0)]
    _reserved_10_31: u32,
}

/// Flags of a cell descriptor.
#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
pub struct CellFlags {
    /// Bit 0: the cell does not participate in the shutdown handshake.
    pub passive_commreg: bool,

    /// Bit 1: expose the hypervisor test device to the cell.
    pub test_device: bool,

    /// Bits 2–29: Reserved (must be 0).
    #[bits(28, default = 0)]
    _reserved_2_29: u32,

    /// Bit 30: the cell may use the hypervisor's virtual console.
    pub virtual_console_permitted: bool,

    /// Bit 31: the cell writes to the virtual console from the start.
    pub virtual_console_active: bool,
}

/// Flags of a system descriptor.
#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
pub struct SystemFlags {
    /// Bit 0: mirror hypervisor output to a virtual debug console.
    pub virtual_debug_console: bool,

    /// Bits 1–31: Reserved (must be 0).
    #[bits(31, default = 0)]
    _reserved_1_31: u32,
}

/// Flags of a console description.
#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
pub struct ConsoleFlags {
    /// Bit 0: MMIO access (clear: port I/O).
    pub access_mmio: bool,

    /// Bit 1: registers are 4 bytes apart (clear: 1 byte).
    pub regdist_4: bool,

    /// Bit 2: the UART clock is inverted.
    pub inverted_clock: bool,

    /// Bits 3–31: Reserved (must be 0).
    #[bits(29, default = 0)]
    _reserved_3_31: u32,
}
