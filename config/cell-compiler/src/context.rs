//! # Build Context
//!
//! Cross-cell state of one system compilation. Each board gets its own
//! context; nothing is shared between systems.

use crate::address_space::AddressSpace;
use crate::channel::ChannelRegistry;
use crate::irq::IrqOwnership;
use crate::options::CompileOptions;
use crate::pci::PciRegistry;
use crate::spec::SystemSpec;
use cell_addresses::PhysicalRange;
use core::fmt;
use std::collections::BTreeSet;

/// Position of a cell in the system; the root cell is always `0`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CellId(usize);

impl CellId {
    pub const ROOT: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Validation state threaded through one system compilation.
#[derive(Debug)]
pub struct SystemBuildContext {
    pub options: CompileOptions,
    names: Vec<String>,
    shareable_irqs: BTreeSet<u32>,
    comm_window: Option<PhysicalRange>,
    pub memory: AddressSpace,
    pub irqs: IrqOwnership,
    pub pci: PciRegistry,
    pub channels: ChannelRegistry,
}

impl SystemBuildContext {
    #[must_use]
    pub fn new(spec: &SystemSpec) -> Self {
        let options = spec.options;
        Self {
            options,
            names: spec.all_cells().map(|c| c.name.clone()).collect(),
            shareable_irqs: spec.shareable_irqs.iter().copied().collect(),
            comm_window: spec.comm_window.map(|w| w.range()),
            memory: AddressSpace::new(options.policy),
            irqs: IrqOwnership::new(options.policy.root_donation),
            pci: PciRegistry::new(),
            channels: ChannelRegistry::new(),
        }
    }

    /// Name of cell `id`.
    #[must_use]
    pub fn cell_name(&self, id: CellId) -> &str {
        self.names.get(id.index()).map_or("<unknown>", String::as_str)
    }

    /// Whether `irq` is on the system-wide shareable list.
    #[must_use]
    pub fn is_shareable(&self, irq: u32) -> bool {
        self.shareable_irqs.contains(&irq)
    }

    #[must_use]
    pub const fn comm_window(&self) -> Option<PhysicalRange> {
        self.comm_window
    }

    /// Number of cells, root included.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.names.len()
    }
}
