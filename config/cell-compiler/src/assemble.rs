//! # Descriptor Assembler
//!
//! Freezes validated per-cell tables into descriptors and serializes them.
//! Header counts are derived from the tables and checked again right before
//! encoding; a mismatch is fatal because the loader trusts the counts.
//!
//! | Descriptor | Layout |
//! |------------|--------|
//! | [`SystemDescriptor`] | `SystemHeader`, root `CellHeader`, root tables |
//! | [`CellDescriptor`] | `CellHeader`, tables |

use crate::error::{CompileError, ConfigError, Location};
use crate::spec::CellSpec;
use cell_abi::parse::DescriptorKind;
use cell_abi::{
    Architecture, CONFIG_REVISION, CellHeader, Console, Encoder, IrqChip, MemoryRegion, PciDevice,
    Record, SystemHeader,
};
use log::debug;

/// One guest cell, or the root cell inside a [`SystemDescriptor`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CellDescriptor {
    pub header: CellHeader,
    pub cpus: Vec<u64>,
    pub memory_regions: Vec<MemoryRegion>,
    pub irqchips: Vec<IrqChip>,
    pub pci_devices: Vec<PciDevice>,
}

fn count(cell: &str, len: usize) -> Result<u32, CompileError> {
    u32::try_from(len).map_err(|_| CompileError::InvalidConfig {
        at: Location::cell(cell),
        reason: ConfigError::TableTooLarge(len),
    })
}

impl CellDescriptor {
    /// Build the header of `spec` around its finished tables.
    ///
    /// # Errors
    /// [`CompileError::InvalidConfig`] for an unencodable name or a table
    /// whose length does not fit the header.
    pub fn assemble(
        architecture: Architecture,
        spec: &CellSpec,
        vpci_irq_base: u32,
        memory_regions: Vec<MemoryRegion>,
        irqchips: Vec<IrqChip>,
        pci_devices: Vec<PciDevice>,
    ) -> Result<Self, CompileError> {
        let name = CellHeader::encode_name(&spec.name).ok_or_else(|| CompileError::InvalidConfig {
            at: Location::cell(&spec.name),
            reason: ConfigError::InvalidName(spec.name.clone()),
        })?;

        let mut cpus = spec.cpus.words().to_vec();
        if cpus.is_empty() {
            cpus.push(0);
        }

        let header = CellHeader {
            architecture,
            revision: CONFIG_REVISION,
            flags: spec.flags,
            name,
            cpu_set_size: count(&spec.name, cpus.len() * 8)?,
            num_memory_regions: count(&spec.name, memory_regions.len())?,
            num_irqchips: count(&spec.name, irqchips.len())?,
            num_pci_devices: count(&spec.name, pci_devices.len())?,
            vpci_irq_base,
            console: spec.console.as_ref().map_or_else(Console::default, |c| c.to_abi()),
        };

        debug!(
            "cell `{}`: {} region(s), {} irqchip(s), {} PCI device(s), vpci base {vpci_irq_base}",
            spec.name,
            memory_regions.len(),
            irqchips.len(),
            pci_devices.len()
        );

        Ok(Self {
            header,
            cpus,
            memory_regions,
            irqchips,
            pci_devices,
        })
    }

    /// The cell name as stored in the header.
    #[must_use]
    pub fn name(&self) -> &str {
        self.header.name_str().unwrap_or_default()
    }

    /// Compare every declared count with its table.
    ///
    /// # Errors
    /// [`CompileError::SchemaConsistency`] naming the first table that
    /// disagrees.
    pub fn check_consistency(&self) -> Result<(), CompileError> {
        let h = &self.header;
        let tables: [(&'static str, u32, usize); 4] = [
            ("cpu set size", h.cpu_set_size, self.cpus.len() * 8),
            ("memory region", h.num_memory_regions, self.memory_regions.len()),
            ("irqchip", h.num_irqchips, self.irqchips.len()),
            ("PCI device", h.num_pci_devices, self.pci_devices.len()),
        ];
        for (table, declared, actual) in tables {
            if u64::from(declared) != actual as u64 {
                return Err(CompileError::SchemaConsistency {
                    at: Location::cell(self.name()),
                    table,
                    declared: u64::from(declared),
                    actual: actual as u64,
                });
            }
        }
        Ok(())
    }

    /// Bytes this cell occupies after its header's predecessor.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        CellHeader::SIZE
            + self.cpus.len() * 8
            + self.memory_regions.len() * MemoryRegion::SIZE
            + self.irqchips.len() * IrqChip::SIZE
            + self.pci_devices.len() * PciDevice::SIZE
    }

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_record(&self.header);
        for &word in &self.cpus {
            enc.put_u64(word);
        }
        for region in &self.memory_regions {
            enc.put_record(region);
        }
        for chip in &self.irqchips {
            enc.put_record(chip);
        }
        for device in &self.pci_devices {
            enc.put_record(device);
        }
    }

    /// Serialize as a standalone cell descriptor.
    ///
    /// # Errors
    /// [`CompileError::SchemaConsistency`] if the counts or the encoded size
    /// disagree with the tables.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CompileError> {
        self.check_consistency()?;
        let expected = self.encoded_len();
        let mut out = Vec::with_capacity(expected);
        self.encode(&mut Encoder::new(&mut out));
        check_len(self.name(), expected, out.len())?;
        Ok(out)
    }
}

fn check_len(cell: &str, expected: usize, actual: usize) -> Result<(), CompileError> {
    if expected == actual {
        return Ok(());
    }
    Err(CompileError::SchemaConsistency {
        at: Location::cell(cell),
        table: "descriptor size",
        declared: expected as u64,
        actual: actual as u64,
    })
}

/// The hypervisor configuration together with the root cell.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SystemDescriptor {
    pub header: SystemHeader,
    pub root: CellDescriptor,
}

impl SystemDescriptor {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        SystemHeader::SIZE + self.root.encoded_len()
    }

    /// Serialize as a system descriptor.
    ///
    /// # Errors
    /// See [`CellDescriptor::to_bytes`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, CompileError> {
        self.root.check_consistency()?;
        let expected = self.encoded_len();
        let mut out = Vec::with_capacity(expected);
        let mut enc = Encoder::new(&mut out);
        enc.put_record(&self.header);
        self.root.encode(&mut enc);
        check_len(self.root.name(), expected, out.len())?;
        Ok(out)
    }
}

/// One serialized descriptor, ready to be written out.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Image {
    pub cell: String,
    pub kind: DescriptorKind,
    pub bytes: Vec<u8>,
}

impl Image {
    /// `<cell>.cell`; the system descriptor is named after the root cell.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.cell", self.cell)
    }
}

/// Every descriptor of one system.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompiledSystem {
    pub system: SystemDescriptor,
    pub cells: Vec<CellDescriptor>,
}

impl CompiledSystem {
    /// Serialize the system descriptor followed by every guest cell.
    ///
    /// # Errors
    /// [`CompileError::SchemaConsistency`]; nothing is returned for the
    /// other descriptors in that case.
    pub fn images(&self) -> Result<Vec<Image>, CompileError> {
        let mut images = Vec::with_capacity(1 + self.cells.len());
        images.push(Image {
            cell: self.system.root.name().to_owned(),
            kind: DescriptorKind::System,
            bytes: self.system.to_bytes()?,
        });
        for cell in &self.cells {
            images.push(Image {
                cell: cell.name().to_owned(),
                kind: DescriptorKind::Cell,
                bytes: cell.to_bytes()?,
            });
        }
        Ok(images)
    }

    /// Cell descriptor called `name`, root included.
    #[must_use]
    pub fn cell(&self, name: &str) -> Option<&CellDescriptor> {
        core::iter::once(&self.system.root)
            .chain(&self.cells)
            .find(|c| c.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::CpuSet;
    use cell_abi::MemoryFlags;
    use cell_abi::parse::Descriptor;

    fn guest() -> CellDescriptor {
        let spec = CellSpec::new("guest", CpuSet::from_ids([2, 3]));
        let region = MemoryRegion {
            phys_start: 0x4000_0000,
            virt_start: 0,
            size: 0x10_0000,
            flags: MemoryFlags::new().with_read(true).with_write(true),
        };
        CellDescriptor::assemble(
            Architecture::Arm64,
            &spec,
            0,
            vec![region],
            Vec::new(),
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn counts_follow_tables() {
        let cell = guest();
        assert_eq!(cell.header.cpu_set_size, 8);
        assert_eq!(cell.header.num_memory_regions, 1);
        assert_eq!(cell.cpus, vec![0b1100]);
        assert_eq!(cell.name(), "guest");
    }

    #[test]
    fn encoded_cell_parses_back() {
        let cell = guest();
        let bytes = cell.to_bytes().unwrap();
        assert_eq!(bytes.len(), CellHeader::SIZE + 8 + MemoryRegion::SIZE);

        let parsed = Descriptor::parse(&bytes).unwrap();
        assert_eq!(parsed.kind(), DescriptorKind::Cell);
        assert_eq!(parsed.cell().name_str(), Some("guest"));
        assert_eq!(parsed.cpus().collect::<Vec<_>>(), vec![0b1100]);
        assert_eq!(parsed.memory_regions().count(), 1);
    }

    #[test]
    fn tampered_count_is_fatal() {
        let mut cell = guest();
        cell.header.num_irqchips = 2;
        let err = cell.to_bytes().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            CompileError::SchemaConsistency {
                table: "irqchip",
                declared: 2,
                actual: 0,
                ..
            }
        ));
    }

    #[test]
    fn empty_cpu_set_still_emits_one_word() {
        let spec = CellSpec::new("idle", CpuSet::default());
        let cell = CellDescriptor::assemble(
            Architecture::Arm64,
            &spec,
            0,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(cell.cpus, vec![0]);
    }

    #[test]
    fn file_name_uses_cell_name() {
        let image = Image {
            cell: "rk3308-linux".into(),
            kind: DescriptorKind::Cell,
            bytes: Vec::new(),
        };
        assert_eq!(image.file_name(), "rk3308-linux.cell");
    }
}
