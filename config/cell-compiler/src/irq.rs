//! # Interrupt Mapper
//!
//! Turns the interrupt ranges of a cell into irqchip pin bitmaps, enforces
//! that a hardware line is owned by at most one cell, and reserves the block
//! of lines a cell's virtual PCI devices signal on.
//!
//! Bit `n` of word `w` in a bitmap stands for interrupt
//! `pin_base + w * 32 + n`; one irqchip entry covers 128 lines.

use crate::context::{CellId, SystemBuildContext};
use crate::error::{CompileError, InterruptRangeError, Location};
use crate::spec::CellSpec;
use cell_abi::{IRQCHIP_BITMAP_WORDS, IRQCHIP_PINS, IrqChip};
use log::{debug, trace, warn};
use std::collections::BTreeMap;

/// Fixed-width pin bitmap of one irqchip entry.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct PinBitmap([u32; IRQCHIP_BITMAP_WORDS]);

impl PinBitmap {
    #[must_use]
    pub const fn new() -> Self {
        Self([0; IRQCHIP_BITMAP_WORDS])
    }

    #[must_use]
    pub const fn from_words(words: [u32; IRQCHIP_BITMAP_WORDS]) -> Self {
        Self(words)
    }

    /// Set the bit for `pin` (relative to the pin base). Returns `false` if
    /// the pin is outside the bitmap.
    pub const fn set(&mut self, pin: u32) -> bool {
        if pin >= IRQCHIP_PINS {
            return false;
        }
        self.0[(pin / 32) as usize] |= 1 << (pin % 32);
        true
    }

    #[must_use]
    pub const fn is_set(&self, pin: u32) -> bool {
        pin < IRQCHIP_PINS && self.0[(pin / 32) as usize] & (1 << (pin % 32)) != 0
    }

    #[must_use]
    pub const fn words(&self) -> [u32; IRQCHIP_BITMAP_WORDS] {
        self.0
    }

    /// Set pins in ascending order.
    pub fn pins(&self) -> impl Iterator<Item = u32> + '_ {
        (0..IRQCHIP_PINS).filter(|&pin| self.is_set(pin))
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        let mut i = 0;
        while i < IRQCHIP_BITMAP_WORDS {
            if self.0[i] != 0 {
                return false;
            }
            i += 1;
        }
        true
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct IrqOwner {
    cell: CellId,
    shareable: bool,
    virtual_pci: bool,
}

/// System-wide owners of each `(controller, irq)` line.
///
/// Under root donation a guest may take a hardware line the root cell also
/// lists. Donation only runs from the root to a guest and never covers a
/// line reserved for virtual PCI.
#[derive(Debug, Default)]
pub struct IrqOwnership {
    lines: BTreeMap<(u64, u32), Vec<IrqOwner>>,
    root_donation: bool,
}

impl IrqOwnership {
    #[must_use]
    pub fn new(root_donation: bool) -> Self {
        Self {
            lines: BTreeMap::new(),
            root_donation,
        }
    }

    const fn donated(&self, owner: &IrqOwner, cell: CellId) -> bool {
        self.root_donation && !owner.virtual_pci && owner.cell.is_root() != cell.is_root()
    }

    /// Whether `owner` leaves the line to `cell` for a virtual PCI block.
    const fn donated_to(&self, owner: &IrqOwner, cell: CellId) -> bool {
        self.root_donation && !owner.virtual_pci && owner.cell.is_root() && !cell.is_root()
    }

    /// Record `cell` as an owner of the hardware line `irq` on `controller`.
    ///
    /// A cell may claim its own line more than once.
    ///
    /// # Errors
    /// Returns the cell that already owns the line when the two claims are
    /// not both shareable; nothing is recorded in that case.
    pub fn claim(
        &mut self,
        controller: u64,
        irq: u32,
        cell: CellId,
        shareable: bool,
    ) -> Result<(), CellId> {
        let owners = self.lines.get(&(controller, irq)).map_or(&[][..], Vec::as_slice);
        if let Some(other) = owners.iter().find(|o| {
            o.cell != cell
                && !(o.shareable && shareable && !o.virtual_pci)
                && !self.donated(o, cell)
        }) {
            return Err(other.cell);
        }
        self.record(controller, irq, cell, shareable, false);
        Ok(())
    }

    /// Reserve `irq` on `controller` for the virtual PCI devices of `cell`.
    ///
    /// # Errors
    /// Returns the other cell holding the line, unless the root cell donates
    /// it to a guest.
    pub fn claim_vpci(&mut self, controller: u64, irq: u32, cell: CellId) -> Result<(), CellId> {
        let owners = self.lines.get(&(controller, irq)).map_or(&[][..], Vec::as_slice);
        if let Some(other) = owners
            .iter()
            .find(|o| o.cell != cell && !self.donated_to(o, cell))
        {
            return Err(other.cell);
        }
        self.record(controller, irq, cell, false, true);
        Ok(())
    }

    fn record(
        &mut self,
        controller: u64,
        irq: u32,
        cell: CellId,
        shareable: bool,
        virtual_pci: bool,
    ) {
        let owners = self.lines.entry((controller, irq)).or_default();
        if !owners.iter().any(|o| o.cell == cell) {
            trace!("irq {irq}@{controller:#x} -> cell {cell}");
            owners.push(IrqOwner {
                cell,
                shareable,
                virtual_pci,
            });
        }
    }

    /// Whether [`claim_vpci`](Self::claim_vpci) would give `irq` to `cell`
    /// without `cell` holding it already.
    #[must_use]
    pub fn is_free_for(&self, controller: u64, irq: u32, cell: CellId) -> bool {
        self.lines.get(&(controller, irq)).is_none_or(|owners| {
            owners
                .iter()
                .all(|o| o.cell != cell && self.donated_to(o, cell))
        })
    }
}

/// Build the irqchip table of `cell` and claim its static interrupts.
pub fn map_irqchips(
    cell: CellId,
    spec: &CellSpec,
    ctx: &mut SystemBuildContext,
    errors: &mut Vec<CompileError>,
) -> Vec<IrqChip> {
    if spec.irqchips.is_empty() {
        warn!("cell `{}` has no interrupts", spec.name);
    }

    let mut chips = Vec::with_capacity(spec.irqchips.len());
    for (index, chip) in spec.irqchips.iter().enumerate() {
        let at = || Location::irqchip(&spec.name, index);
        let end = u64::from(chip.pin_base) + u64::from(IRQCHIP_PINS);
        let mut bitmap = PinBitmap::new();

        for range in &chip.ranges {
            if range.first > range.last {
                errors.push(CompileError::InterruptRange {
                    at: at(),
                    reason: InterruptRangeError::Reversed {
                        first: range.first,
                        last: range.last,
                    },
                });
                continue;
            }
            for irq in range.first..=range.last {
                let pin = irq.wrapping_sub(chip.pin_base);
                if irq < chip.pin_base || !bitmap.set(pin) {
                    errors.push(CompileError::InterruptRange {
                        at: at(),
                        reason: InterruptRangeError::OutsideController {
                            irq,
                            pin_base: chip.pin_base,
                            end,
                        },
                    });
                    break;
                }
                let shareable = range.shareable || ctx.is_shareable(irq);
                if let Err(other) = ctx.irqs.claim(chip.address, irq, cell, shareable) {
                    errors.push(CompileError::DuplicateInterrupt {
                        at: at(),
                        controller: chip.address,
                        irq,
                        first: ctx.cell_name(other).to_owned(),
                        second: spec.name.clone(),
                    });
                }
            }
        }

        debug!(
            "cell `{}` irqchip #{index} at {:#x}: {} line(s) from pin base {}",
            spec.name,
            chip.address,
            bitmap.pins().count(),
            chip.pin_base
        );
        chips.push(IrqChip {
            address: chip.address,
            pin_base: chip.pin_base,
            pin_bitmap: bitmap.words(),
        });
    }
    chips
}

/// Highest absolute interrupt set in any of `chips`.
fn highest_static_irq(chips: &[IrqChip]) -> Option<u32> {
    chips
        .iter()
        .filter_map(|chip| {
            PinBitmap::from_words(chip.pin_bitmap)
                .pins()
                .max()
                .map(|pin| chip.pin_base.saturating_add(pin))
        })
        .max()
}

/// Index of the chip whose window holds all of `[first, first + width)`.
fn covering_chip(chips: &[IrqChip], first: u32, width: u32) -> Option<usize> {
    let last = u64::from(first) + u64::from(width);
    if last > u64::from(u32::MAX) {
        return None;
    }
    chips.iter().position(|chip| {
        first >= chip.pin_base && last <= u64::from(chip.pin_base) + u64::from(IRQCHIP_PINS)
    })
}

/// First block of `width` lines after the cell's static interrupts that no
/// other cell owns and one of the cell's chips covers.
fn find_free_block(
    cell: CellId,
    chips: &[IrqChip],
    width: u32,
    offset: u32,
    ctx: &SystemBuildContext,
) -> Option<u32> {
    let start = highest_static_irq(chips).map_or(0, |irq| u64::from(irq) + 1);

    let mut order: Vec<&IrqChip> = chips.iter().collect();
    order.sort_by_key(|chip| chip.pin_base);

    for chip in order {
        let window_end = u64::from(chip.pin_base) + u64::from(IRQCHIP_PINS);
        let mut first = start.max(u64::from(chip.pin_base)).max(u64::from(offset));
        while first + u64::from(width) <= window_end {
            let block_free = (first..first + u64::from(width)).all(|irq| {
                u32::try_from(irq).is_ok_and(|irq| ctx.irqs.is_free_for(chip.address, irq, cell))
            });
            if block_free {
                return u32::try_from(first).ok();
            }
            first += 1;
        }
    }
    None
}

/// Reserve the vPCI interrupt block of `cell` and return the value stored in
/// the cell header (`block_start - pin_offset`).
///
/// Cells without PCI devices reserve nothing; an explicit base is still
/// carried into the header.
pub fn allocate_vpci(
    cell: CellId,
    spec: &CellSpec,
    chips: &mut [IrqChip],
    ctx: &mut SystemBuildContext,
    errors: &mut Vec<CompileError>,
) -> u32 {
    let width = ctx.options.vpci_irq_width;
    let offset = ctx.options.irq_pin_offset;
    let at = || Location::cell(&spec.name);

    if spec.pci_devices.is_empty() {
        return spec.vpci_irq_base.map_or(0, |base| base.saturating_sub(offset));
    }

    let first = match spec.vpci_irq_base {
        Some(base) => base,
        None => {
            let Some(first) = find_free_block(cell, chips, width, offset, ctx) else {
                errors.push(CompileError::InterruptRange {
                    at: at(),
                    reason: InterruptRangeError::Exhausted { width },
                });
                return 0;
            };
            first
        }
    };

    if first < offset {
        errors.push(CompileError::InterruptRange {
            at: at(),
            reason: InterruptRangeError::BelowPinOffset {
                base: first,
                offset,
            },
        });
        return 0;
    }

    let Some(chip_index) = covering_chip(chips, first, width) else {
        errors.push(CompileError::InterruptRange {
            at: at(),
            reason: InterruptRangeError::Uncovered {
                first,
                last: u64::from(first) + u64::from(width) - 1,
            },
        });
        return 0;
    };

    let chip = &mut chips[chip_index];
    let mut bitmap = PinBitmap::from_words(chip.pin_bitmap);
    for irq in first..first + width {
        bitmap.set(irq - chip.pin_base);
        if let Err(other) = ctx.irqs.claim_vpci(chip.address, irq, cell) {
            errors.push(CompileError::DuplicateInterrupt {
                at: Location::irqchip(&spec.name, chip_index),
                controller: chip.address,
                irq,
                first: ctx.cell_name(other).to_owned(),
                second: spec.name.clone(),
            });
        }
    }
    chip.pin_bitmap = bitmap.words();

    debug!(
        "cell `{}` vPCI interrupts {first}..={} (header base {})",
        spec.name,
        first + width - 1,
        first - offset
    );
    first - offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{CompileOptions, SharingPolicy};
    use crate::pci::Bdf;
    use crate::spec::{CpuSet, IrqChipSpec, IrqRange, PciDeviceSpec, RangeSpec, SystemSpec};

    const GIC: u64 = 0xff58_1000;

    fn context(root_donation: bool) -> SystemBuildContext {
        let policy = SharingPolicy::default().with_root_donation(root_donation);
        let spec = SystemSpec::new(
            RangeSpec::new(0x1f40_0000, 0x80_0000),
            CellSpec::new("root", CpuSet::from_ids([0])),
        )
        .with_cells(vec![CellSpec::new("guest", CpuSet::from_ids([1]))])
        .with_options(CompileOptions::default().with_policy(policy));
        SystemBuildContext::new(&spec)
    }

    fn cell(name: &str, chip: IrqChipSpec) -> CellSpec {
        CellSpec::new(name, CpuSet::from_ids([0]))
            .with_irqchip(chip)
            .with_pci_device(PciDeviceSpec::new(0, Bdf::from_raw(1 << 3), "ivshmem"))
    }

    fn range_errors(errors: &[CompileError]) -> Vec<InterruptRangeError> {
        errors
            .iter()
            .filter_map(|e| match e {
                CompileError::InterruptRange { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    /// Map the chips of `spec` and reserve its vPCI block.
    fn build(
        id: CellId,
        spec: &CellSpec,
        ctx: &mut SystemBuildContext,
    ) -> (Vec<IrqChip>, u32, Vec<CompileError>) {
        let mut errors = Vec::new();
        let mut chips = map_irqchips(id, spec, ctx, &mut errors);
        let base = allocate_vpci(id, spec, &mut chips, ctx, &mut errors);
        (chips, base, errors)
    }

    #[test]
    fn reversed_range_is_rejected() {
        let spec = cell("root", IrqChipSpec::new(GIC, 32).with_range(IrqRange::span(40, 35)));
        let mut errors = Vec::new();
        let chips = map_irqchips(CellId::ROOT, &spec, &mut context(false), &mut errors);
        assert_eq!(
            range_errors(&errors),
            [InterruptRangeError::Reversed { first: 40, last: 35 }]
        );
        assert_eq!(chips[0].pin_bitmap, [0; IRQCHIP_BITMAP_WORDS]);
    }

    #[test]
    fn lines_outside_the_window_are_rejected() {
        let chip = IrqChipSpec::new(GIC, 32)
            .with_range(IrqRange::single(31))
            .with_range(IrqRange::single(160))
            .with_range(IrqRange::single(159));
        let spec = cell("root", chip);
        let mut errors = Vec::new();
        let chips = map_irqchips(CellId::ROOT, &spec, &mut context(false), &mut errors);
        assert_eq!(
            range_errors(&errors),
            [
                InterruptRangeError::OutsideController { irq: 31, pin_base: 32, end: 160 },
                InterruptRangeError::OutsideController { irq: 160, pin_base: 32, end: 160 },
            ]
        );
        assert_eq!(chips[0].pin_bitmap, [0, 0, 0, 1 << 31]);
    }

    #[test]
    fn full_chip_has_no_vpci_block() {
        let spec = cell("root", IrqChipSpec::new(GIC, 32).with_range(IrqRange::span(32, 159)));
        let (_, base, errors) = build(CellId::ROOT, &spec, &mut context(false));
        assert_eq!(base, 0);
        assert_eq!(range_errors(&errors), [InterruptRangeError::Exhausted { width: 4 }]);
    }

    #[test]
    fn explicit_vpci_base_must_fit() {
        let chip = IrqChipSpec::new(GIC, 32);
        let low = cell("root", chip.clone()).with_vpci_irq_base(20);
        let (_, _, errors) = build(CellId::ROOT, &low, &mut context(false));
        assert_eq!(
            range_errors(&errors),
            [InterruptRangeError::BelowPinOffset { base: 20, offset: 32 }]
        );

        let straddling = cell("root", chip).with_vpci_irq_base(158);
        let (_, _, errors) = build(CellId::ROOT, &straddling, &mut context(false));
        assert_eq!(
            range_errors(&errors),
            [InterruptRangeError::Uncovered { first: 158, last: 161 }]
        );
    }

    #[test]
    fn root_vpci_block_skips_guest_lines_under_donation() {
        let mut ctx = context(true);
        let root = cell("root", IrqChipSpec::new(GIC, 32).with_range(IrqRange::span(32, 63)));
        let guest = cell("guest", IrqChipSpec::new(GIC, 32).with_range(IrqRange::span(64, 65)));

        let mut errors = Vec::new();
        let mut root_chips = map_irqchips(CellId::ROOT, &root, &mut ctx, &mut errors);
        let mut guest_chips = map_irqchips(CellId::new(1), &guest, &mut ctx, &mut errors);
        let root_base = allocate_vpci(CellId::ROOT, &root, &mut root_chips, &mut ctx, &mut errors);
        let guest_base =
            allocate_vpci(CellId::new(1), &guest, &mut guest_chips, &mut ctx, &mut errors);

        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(root_base, 66 - 32);
        assert_eq!(guest_base, 70 - 32);
        let root_lines = PinBitmap::from_words(root_chips[0].pin_bitmap);
        assert!(!root_lines.is_set(64 - 32));
        assert!((66..70).all(|irq| root_lines.is_set(irq - 32)));
    }

    #[test]
    fn bitmap_word_and_bit() {
        let mut bm = PinBitmap::new();
        assert!(bm.set(156 - 32));
        assert_eq!(bm.words(), [0, 0, 0, 1 << 28]);
        assert!(bm.is_set(124));
        assert!(!bm.set(128));
        assert_eq!(bm.pins().collect::<Vec<_>>(), [124]);
        assert!(!bm.is_empty());
        assert!(PinBitmap::new().is_empty());
    }

    #[test]
    fn exclusive_lines_conflict() {
        let mut irqs = IrqOwnership::new(false);
        irqs.claim(0xfd40_0000, 25, CellId::new(1), false).unwrap();
        assert_eq!(
            irqs.claim(0xfd40_0000, 25, CellId::new(2), false),
            Err(CellId::new(1))
        );
        // A different controller is a different line.
        irqs.claim(0xfd50_0000, 25, CellId::new(2), false).unwrap();
        // Re-claiming one's own line is fine.
        irqs.claim(0xfd40_0000, 25, CellId::new(1), false).unwrap();
    }

    #[test]
    fn shareable_needs_both_sides() {
        let mut irqs = IrqOwnership::new(false);
        irqs.claim(0, 25, CellId::new(1), true).unwrap();
        assert!(irqs.claim(0, 25, CellId::new(2), false).is_err());
        irqs.claim(0, 25, CellId::new(2), true).unwrap();
        irqs.claim(0, 25, CellId::new(3), true).unwrap();
        assert!(!irqs.is_free_for(0, 25, CellId::new(4)));
    }

    #[test]
    fn vpci_lines_are_only_donated_to_guests() {
        let mut irqs = IrqOwnership::new(true);
        let guest = CellId::new(1);

        irqs.claim(0, 64, guest, false).unwrap();
        assert!(!irqs.is_free_for(0, 64, CellId::ROOT));
        assert_eq!(irqs.claim_vpci(0, 64, CellId::ROOT), Err(guest));

        irqs.claim(0, 40, CellId::ROOT, false).unwrap();
        assert!(irqs.is_free_for(0, 40, guest));
        irqs.claim_vpci(0, 40, guest).unwrap();

        // A root vPCI line is no hardware line to give away.
        irqs.claim_vpci(0, 80, CellId::ROOT).unwrap();
        assert!(!irqs.is_free_for(0, 80, guest));
        assert_eq!(irqs.claim(0, 80, guest, false), Err(CellId::ROOT));
        assert_eq!(irqs.claim_vpci(0, 80, guest), Err(CellId::ROOT));
    }

    #[test]
    fn donation_excuses_root_claims() {
        let mut irqs = IrqOwnership::new(true);
        irqs.claim(0, 150, CellId::ROOT, false).unwrap();
        irqs.claim(0, 150, CellId::new(1), false).unwrap();
        assert!(irqs.claim(0, 150, CellId::new(2), false).is_err());
        assert!(irqs.is_free_for(0, 151, CellId::new(2)));
        assert!(!irqs.is_free_for(0, 150, CellId::new(2)));
        assert!(!irqs.is_free_for(0, 150, CellId::new(1)));
    }

    #[test]
    fn highest_static_irq_spans_chips() {
        let chips = [
            IrqChip {
                address: 0,
                pin_base: 32,
                pin_bitmap: [1, 0, 0, 0],
            },
            IrqChip {
                address: 0,
                pin_base: 160,
                pin_bitmap: [0, 1 << 3, 0, 0],
            },
        ];
        assert_eq!(highest_static_irq(&chips), Some(160 + 32 + 3));
        assert_eq!(covering_chip(&chips, 156, 4), Some(0));
        assert_eq!(covering_chip(&chips, 157, 4), None);
        assert_eq!(covering_chip(&chips, 160, 4), Some(1));
    }
}
