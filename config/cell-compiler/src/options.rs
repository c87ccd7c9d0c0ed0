//! # Compile Options
//!
//! Knobs that shape validation and layout without being part of any one cell.
//! Boards carry them in an `options` block; the command line may override
//! individual fields afterwards.
//!
//! | Option | Default | Meaning |
//! |--------|---------|---------|
//! | `page_size` | `0x1000` | Alignment granule for region starts and sizes. |
//! | `vpci_irq_width` | `4` | Interrupt lines reserved per cell for virtual PCI. |
//! | `irq_pin_offset` | `32` | Subtracted from the absolute vPCI base (GIC SPI offset). |
//! | `policy` | see [`SharingPolicy`] | Which overlaps between cells are legal. |

use crate::spec::de;
use cell_addresses::{PageSize, Size4K, Size64K, is_valid_page_size};
use serde::Deserialize;
use utils_accessors_derive::Setters;

/// Default alignment granule for memory regions.
pub const DEFAULT_PAGE_SIZE: u64 = Size4K::SIZE;

/// Default chunk size of a uniform shared-memory channel.
pub const DEFAULT_CHUNK_SIZE: u64 = Size64K::SIZE;

/// Chunk size of the large uniform channel profile.
pub const LARGE_CHUNK_SIZE: u64 = 0x10_0000;

/// Default number of interrupt lines reserved for a cell's virtual PCI devices.
pub const DEFAULT_VPCI_IRQ_WIDTH: u32 = 4;

/// Default offset between absolute interrupt numbers and the emitted vPCI base.
pub const DEFAULT_IRQ_PIN_OFFSET: u32 = 32;

/// Upper bound on the vPCI block width; it must fit one 32-bit bitmap word.
pub const MAX_VPCI_IRQ_WIDTH: u32 = 32;

/// Options applied to one system compilation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Setters)]
#[serde(default, deny_unknown_fields)]
pub struct CompileOptions {
    #[serde(deserialize_with = "de::u64_any")]
    pub page_size: u64,
    #[serde(deserialize_with = "de::u32_any")]
    pub vpci_irq_width: u32,
    #[serde(deserialize_with = "de::u32_any")]
    pub irq_pin_offset: u32,
    pub policy: SharingPolicy,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            vpci_irq_width: DEFAULT_VPCI_IRQ_WIDTH,
            irq_pin_offset: DEFAULT_IRQ_PIN_OFFSET,
            policy: SharingPolicy::default(),
        }
    }
}

impl CompileOptions {
    /// Whether the page size is a power of two of at least 4 KiB.
    #[must_use]
    pub const fn has_valid_page_size(&self) -> bool {
        is_valid_page_size(self.page_size)
    }

    /// Whether the vPCI block width is usable.
    #[must_use]
    pub const fn has_valid_vpci_width(&self) -> bool {
        self.vpci_irq_width > 0 && self.vpci_irq_width <= MAX_VPCI_IRQ_WIDTH
    }
}

/// How strictly aliased regions must agree on their flags.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlagMatch {
    /// Any flags.
    #[default]
    Any,
    /// Both sides agree on I/O and execute.
    Compatible,
    /// Identical flag words.
    Exact,
}

/// Which physical overlaps between regions are authorized.
///
/// Two regions that are both root-shared and describe the identical
/// `[start, size)` pair may always alias each other, subject to
/// [`virt_must_match`](Self::virt_must_match) and [`flags`](Self::flags).
/// Slots of a shared-memory channel alias only the same slot of the same
/// channel. With [`root_donation`](Self::root_donation) enabled, resources of
/// a non-root cell may additionally be carved out of the root cell; channel
/// slots and vPCI lines are never donated.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize, Setters)]
#[serde(default, deny_unknown_fields)]
pub struct SharingPolicy {
    pub virt_must_match: bool,
    pub flags: FlagMatch,
    pub root_donation: bool,
}
