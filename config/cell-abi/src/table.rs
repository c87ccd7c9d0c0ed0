//! # Descriptor Tables
//!
//! The arrays following a [`CellHeader`](crate::CellHeader). Each record has a
//! fixed encoded size; arrays are packed without padding.

use crate::wire::{Decoder, Encoder, Record};
use crate::{IRQCHIP_BITMAP_WORDS, MemoryFlags, PCI_BAR_COUNT, ParseError};

/// One memory region of a cell.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct MemoryRegion {
    pub phys_start: u64,
    pub virt_start: u64,
    pub size: u64,
    pub flags: MemoryFlags,
}

impl MemoryRegion {
    /// All-zero entry, used for unused slots in a shared-memory channel.
    pub const EMPTY: Self = Self {
        phys_start: 0,
        virt_start: 0,
        size: 0,
        flags: MemoryFlags::new(),
    };

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Record for MemoryRegion {
    const SIZE: usize = 28;

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_u64(self.phys_start);
        enc.put_u64(self.virt_start);
        enc.put_u64(self.size);
        enc.put_u32(self.flags.into_bits());
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, ParseError> {
        Ok(Self {
            phys_start: dec.get_u64()?,
            virt_start: dec.get_u64()?,
            size: dec.get_u64()?,
            flags: MemoryFlags::from_bits(dec.get_u32()?),
        })
    }
}

/// Interrupt lines of one controller window assigned to a cell.
///
/// Bit `n` of word `w` stands for interrupt `pin_base + w * 32 + n`.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct IrqChip {
    pub address: u64,
    pub pin_base: u32,
    pub pin_bitmap: [u32; IRQCHIP_BITMAP_WORDS],
}

impl Record for IrqChip {
    const SIZE: usize = 28;

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_u64(self.address);
        enc.put_u32(self.pin_base);
        for word in self.pin_bitmap {
            enc.put_u32(word);
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, ParseError> {
        let address = dec.get_u64()?;
        let pin_base = dec.get_u32()?;
        let mut pin_bitmap = [0u32; IRQCHIP_BITMAP_WORDS];
        for word in &mut pin_bitmap {
            *word = dec.get_u32()?;
        }
        Ok(Self {
            address,
            pin_base,
            pin_bitmap,
        })
    }
}

/// Kind of a virtual PCI function.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PciDeviceType {
    Device = 1,
    Bridge = 2,
    Ivshmem = 3,
}

impl PciDeviceType {
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Device),
            2 => Some(Self::Bridge),
            3 => Some(Self::Ivshmem),
            _ => None,
        }
    }
}

/// Protocol spoken over a shared-memory channel.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum ShmemProtocol {
    /// Bare channel; the peers agree on the protocol out of band.
    #[default]
    Undefined,
    /// Virtual Ethernet between exactly two peers.
    Veth,
    /// Virtio front-end for the given virtio device id.
    VirtioFront(u16),
    /// Virtio back-end for the given virtio device id.
    VirtioBack(u16),
}

impl ShmemProtocol {
    const VIRTIO_FRONT: u16 = 0x8000;
    const VIRTIO_BACK: u16 = 0xc000;
    const VIRTIO_DEVICE_MASK: u16 = 0x3fff;

    /// Wire value of the protocol tag.
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        match self {
            Self::Undefined => 0x0000,
            Self::Veth => 0x0001,
            Self::VirtioFront(dev) => Self::VIRTIO_FRONT | (dev & Self::VIRTIO_DEVICE_MASK),
            Self::VirtioBack(dev) => Self::VIRTIO_BACK | (dev & Self::VIRTIO_DEVICE_MASK),
        }
    }

    #[must_use]
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0x0000 => Some(Self::Undefined),
            0x0001 => Some(Self::Veth),
            _ if raw & Self::VIRTIO_BACK == Self::VIRTIO_BACK => {
                Some(Self::VirtioBack(raw & Self::VIRTIO_DEVICE_MASK))
            }
            _ if raw & Self::VIRTIO_BACK == Self::VIRTIO_FRONT => {
                Some(Self::VirtioFront(raw & Self::VIRTIO_DEVICE_MASK))
            }
            _ => None,
        }
    }

    /// Number of peers the protocol is defined for, if it is fixed.
    #[must_use]
    pub const fn required_peers(self) -> Option<u8> {
        match self {
            Self::Undefined => None,
            Self::Veth | Self::VirtioFront(_) | Self::VirtioBack(_) => Some(2),
        }
    }
}

/// One virtual PCI function of a cell.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PciDevice {
    pub device_type: PciDeviceType,
    pub domain: u16,
    /// `bus << 8 | device << 3 | function`.
    pub bdf: u16,
    pub bar_mask: [u32; PCI_BAR_COUNT],
    /// Index of the channel's first region in the cell's region table.
    pub shmem_regions_start: u32,
    /// This cell's peer id on the channel.
    pub shmem_dev_id: u8,
    pub shmem_peers: u8,
    pub shmem_protocol: ShmemProtocol,
}

impl Record for PciDevice {
    const SIZE: usize = 40;

    fn encode(&self, enc: &mut Encoder<'_>) {
        enc.put_u8(self.device_type as u8);
        enc.put_u8(0);
        enc.put_u16(self.domain);
        enc.put_u16(self.bdf);
        enc.put_u16(0);
        for mask in self.bar_mask {
            enc.put_u32(mask);
        }
        enc.put_u32(self.shmem_regions_start);
        enc.put_u8(self.shmem_dev_id);
        enc.put_u8(self.shmem_peers);
        enc.put_u16(self.shmem_protocol.to_raw());
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, ParseError> {
        let raw_type = dec.get_u8()?;
        let device_type = PciDeviceType::from_raw(raw_type).ok_or(ParseError::InvalidField {
            field: "pci_device.type",
            value: u64::from(raw_type),
        })?;
        let _reserved = dec.get_u8()?;
        let domain = dec.get_u16()?;
        let bdf = dec.get_u16()?;
        let _reserved = dec.get_u16()?;
        let mut bar_mask = [0u32; PCI_BAR_COUNT];
        for mask in &mut bar_mask {
            *mask = dec.get_u32()?;
        }
        let shmem_regions_start = dec.get_u32()?;
        let shmem_dev_id = dec.get_u8()?;
        let shmem_peers = dec.get_u8()?;
        let raw_proto = dec.get_u16()?;
        let shmem_protocol = ShmemProtocol::from_raw(raw_proto).ok_or(ParseError::InvalidField {
            field: "pci_device.shmem_protocol",
            value: u64::from(raw_proto),
        })?;
        Ok(Self {
            device_type,
            domain,
            bdf,
            bar_mask,
            shmem_regions_start,
            shmem_dev_id,
            shmem_peers,
            shmem_protocol,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IVSHMEM_BAR_MASK_INTX;
    use alloc::vec::Vec;

    #[test]
    fn protocol_tags() {
        assert_eq!(ShmemProtocol::Undefined.to_raw(), 0);
        assert_eq!(ShmemProtocol::Veth.to_raw(), 1);
        assert_eq!(ShmemProtocol::VirtioFront(2).to_raw(), 0x8002);
        assert_eq!(ShmemProtocol::VirtioBack(2).to_raw(), 0xc002);
        for p in [
            ShmemProtocol::Undefined,
            ShmemProtocol::Veth,
            ShmemProtocol::VirtioFront(3),
            ShmemProtocol::VirtioBack(1),
        ] {
            assert_eq!(ShmemProtocol::from_raw(p.to_raw()), Some(p));
        }
        assert_eq!(ShmemProtocol::from_raw(0x0042), None);
    }

    #[test]
    fn pci_device_layout() {
        let dev = PciDevice {
            device_type: PciDeviceType::Ivshmem,
            domain: 1,
            bdf: 2 << 3,
            bar_mask: IVSHMEM_BAR_MASK_INTX,
            shmem_regions_start: 4,
            shmem_dev_id: 0,
            shmem_peers: 2,
            shmem_protocol: ShmemProtocol::Veth,
        };
        let mut buf = Vec::new();
        Encoder::new(&mut buf).put_record(&dev);
        assert_eq!(buf.len(), PciDevice::SIZE);
        assert_eq!(buf[0], 3);
        assert_eq!(&buf[2..4], &1u16.to_le_bytes());
        assert_eq!(&buf[4..6], &16u16.to_le_bytes());
        assert_eq!(&buf[8..12], &0xffff_f000u32.to_le_bytes());
        assert_eq!(&buf[32..36], &4u32.to_le_bytes());
        assert_eq!(buf[37], 2);
        assert_eq!(&buf[38..40], &1u16.to_le_bytes());
    }

    #[test]
    fn irqchip_layout() {
        let chip = IrqChip {
            address: 0xfd40_0000,
            pin_base: 32,
            pin_bitmap: [0, 0, 0, 1 << 28],
        };
        let mut buf = Vec::new();
        Encoder::new(&mut buf).put_record(&chip);
        assert_eq!(buf.len(), IrqChip::SIZE);
        let back = IrqChip::decode(&mut Decoder::new(&buf)).unwrap();
        assert_eq!(back, chip);
    }
}
