//! # Descriptor Reader
//!
//! Parsed view over an in-memory descriptor blob. Headers are decoded eagerly;
//! tables are decoded lazily through [`Records`] iterators.

use crate::wire::{Decoder, Record};
use crate::{
    CELL_SIGNATURE, CellHeader, IrqChip, MemoryRegion, ParseError, PciDevice, SYSTEM_SIGNATURE,
    SystemHeader,
};
use core::marker::PhantomData;

/// What kind of descriptor a blob holds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DescriptorKind {
    System,
    Cell,
}

/// Parsed descriptor view over a blob.
pub struct Descriptor<'a> {
    blob: &'a [u8],
    system: Option<SystemHeader>,
    cell: CellHeader,
    cpus_off: usize,
    regions_off: usize,
    irqchips_off: usize,
    pci_off: usize,
}

/// Iterator over the records of one table; yields `Result` per record.
pub struct Records<'a, R: Record> {
    blob: &'a [u8],
    off: usize,
    remaining: usize,
    _marker: PhantomData<R>,
}

fn table_len<R: Record>(count: u32) -> Result<usize, ParseError> {
    (count as usize)
        .checked_mul(R::SIZE)
        .ok_or(ParseError::InvalidField {
            field: "table count",
            value: u64::from(count),
        })
}

impl<'a> Descriptor<'a> {
    /// Parse and validate a descriptor blob.
    ///
    /// The header counts must describe the blob exactly: a blob that is too
    /// short for its tables or carries trailing bytes is rejected.
    ///
    /// # Errors
    /// See [`ParseError`].
    pub fn parse(blob: &'a [u8]) -> Result<Self, ParseError> {
        let mut dec = Decoder::new(blob);

        let signature = blob.get(..8).ok_or(ParseError::TooShort {
            offset: 0,
            needed: 8,
            available: blob.len(),
        })?;
        let system = if signature == SYSTEM_SIGNATURE {
            Some(SystemHeader::decode(&mut dec)?)
        } else if signature == CELL_SIGNATURE {
            None
        } else {
            return Err(ParseError::BadSignature);
        };

        let cell = CellHeader::decode(&mut dec)?;

        let cpus_off = dec.position();
        let regions_off = cpus_off + cell.cpu_set_size as usize;
        let irqchips_off = regions_off + table_len::<MemoryRegion>(cell.num_memory_regions)?;
        let pci_off = irqchips_off + table_len::<IrqChip>(cell.num_irqchips)?;
        let end = pci_off + table_len::<PciDevice>(cell.num_pci_devices)?;

        if end > blob.len() {
            return Err(ParseError::TooShort {
                offset: cpus_off,
                needed: end - cpus_off,
                available: blob.len() - cpus_off,
            });
        }
        if end < blob.len() {
            return Err(ParseError::TrailingBytes(blob.len() - end));
        }

        Ok(Self {
            blob,
            system,
            cell,
            cpus_off,
            regions_off,
            irqchips_off,
            pci_off,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> DescriptorKind {
        if self.system.is_some() {
            DescriptorKind::System
        } else {
            DescriptorKind::Cell
        }
    }

    /// The system header, for system descriptors.
    #[must_use]
    pub const fn system(&self) -> Option<&SystemHeader> {
        self.system.as_ref()
    }

    /// The (root) cell header.
    #[must_use]
    pub const fn cell(&self) -> &CellHeader {
        &self.cell
    }

    /// CPU bitmap words.
    pub fn cpus(&self) -> impl Iterator<Item = u64> + use<'a> {
        let words = &self.blob[self.cpus_off..self.regions_off];
        words.chunks_exact(8).map(|w| {
            let mut b = [0u8; 8];
            b.copy_from_slice(w);
            u64::from_le_bytes(b)
        })
    }

    #[must_use]
    pub fn memory_regions(&self) -> Records<'a, MemoryRegion> {
        Records::new(self.blob, self.regions_off, self.cell.num_memory_regions)
    }

    #[must_use]
    pub fn irqchips(&self) -> Records<'a, IrqChip> {
        Records::new(self.blob, self.irqchips_off, self.cell.num_irqchips)
    }

    #[must_use]
    pub fn pci_devices(&self) -> Records<'a, PciDevice> {
        Records::new(self.blob, self.pci_off, self.cell.num_pci_devices)
    }
}

impl<'a, R: Record> Records<'a, R> {
    const fn new(blob: &'a [u8], off: usize, count: u32) -> Self {
        Self {
            blob,
            off,
            remaining: count as usize,
            _marker: PhantomData,
        }
    }
}

impl<R: Record> Iterator for Records<'_, R> {
    type Item = Result<R, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let mut dec = Decoder::at(self.blob, self.off);
        self.off += R::SIZE;
        Some(R::decode(&mut dec))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<R: Record> ExactSizeIterator for Records<'_, R> {}

impl<R: Record> core::iter::FusedIterator for Records<'_, R> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Encoder;
    use crate::{Architecture, CONFIG_REVISION, CellFlags, Console, MemoryFlags};
    use alloc::vec::Vec;

    fn cell_blob(regions: &[MemoryRegion]) -> Vec<u8> {
        let header = CellHeader {
            architecture: Architecture::Arm64,
            revision: CONFIG_REVISION,
            flags: CellFlags::new(),
            name: CellHeader::encode_name("bomb-1").unwrap(),
            cpu_set_size: 8,
            num_memory_regions: u32::try_from(regions.len()).unwrap(),
            num_irqchips: 0,
            num_pci_devices: 0,
            vpci_irq_base: 0,
            console: Console::default(),
        };
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.put_record(&header);
        enc.put_u64(0b1000);
        for r in regions {
            enc.put_record(r);
        }
        buf
    }

    #[test]
    fn parses_cell_descriptor() {
        let ram = MemoryRegion {
            phys_start: 0x1fe0_0000,
            virt_start: 0,
            size: 0x20_0000,
            flags: MemoryFlags::new()
                .with_read(true)
                .with_write(true)
                .with_execute(true)
                .with_loadable(true),
        };
        let blob = cell_blob(&[ram, MemoryRegion::EMPTY]);
        let desc = Descriptor::parse(&blob).unwrap();
        assert_eq!(desc.kind(), DescriptorKind::Cell);
        assert_eq!(desc.cell().name_str(), Some("bomb-1"));
        assert_eq!(desc.cpus().collect::<Vec<_>>(), [0b1000]);

        let regions: Vec<_> = desc.memory_regions().collect::<Result<_, _>>().unwrap();
        assert_eq!(regions, [ram, MemoryRegion::EMPTY]);
        assert_eq!(desc.irqchips().len(), 0);
    }

    #[test]
    fn truncated_tables_are_rejected() {
        let mut blob = cell_blob(&[MemoryRegion::EMPTY]);
        blob.truncate(blob.len() - 1);
        assert!(matches!(
            Descriptor::parse(&blob),
            Err(ParseError::TooShort { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut blob = cell_blob(&[]);
        blob.push(0);
        assert!(matches!(
            Descriptor::parse(&blob),
            Err(ParseError::TrailingBytes(1))
        ));
    }

    #[test]
    fn unknown_signature_is_rejected() {
        let mut blob = cell_blob(&[]);
        blob[0] = b'X';
        assert!(matches!(
            Descriptor::parse(&blob),
            Err(ParseError::BadSignature)
        ));
    }
}
