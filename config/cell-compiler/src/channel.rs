//! # Shared-Memory Channels
//!
//! A channel is a set of regions every peer maps at the same physical
//! address, plus an IVSHMEM PCI function per peer that tells the guest where
//! the regions start. Region flags depend on the peer: the state table is
//! read-only to all, the shared region writable by all, and each output
//! region writable only by its owner.
//!
//! ## Layouts
//!
//! | Layout | Regions | Geometry |
//! |--------|---------|----------|
//! | uniform | `peers + 2` | contiguous chunks of `chunk_size` from `base` |
//! | network | 4 | 4 KiB state table, empty slot, 508 KiB outputs at `+0x1000` and `+0x80000` |
//!
//! The empty slot of the network layout is an all-zero region entry; it keeps
//! the output regions at the indices the guest driver expects.

use crate::context::CellId;
use crate::error::{ChannelError, Span};
use crate::spec::{ChannelLayout, ChannelSpec, PciDeviceSpec};
use cell_abi::{MemoryFlags, MemoryRegion, PciDevice, PciDeviceType, ShmemProtocol};
use cell_addresses::{PhysicalAddress, PhysicalRange};
use std::collections::BTreeMap;

/// Size and alignment of a network channel window.
pub const NETWORK_WINDOW: u64 = 0x10_0000;
const NETWORK_STATE_SIZE: u64 = 0x1000;
const NETWORK_OUTPUT_OFFSETS: [u64; 2] = [0x1000, 0x8_0000];
const NETWORK_OUTPUT_SIZE: u64 = 0x7_f000;

/// A channel expanded into a cell's region table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PlacedChannel {
    pub spec: ChannelSpec,
    /// Index of the channel's first region in the cell's table.
    pub first_index: usize,
    /// Number of table entries the channel occupies.
    pub region_count: usize,
    pub span: PhysicalRange,
}

fn check_peers(spec: &ChannelSpec) -> Result<(), ChannelError> {
    if spec.peers < 2 {
        return Err(ChannelError::TooFewPeers { peers: spec.peers });
    }
    if let Some(required) = spec.protocol.required_peers()
        && spec.peers != required
    {
        return Err(ChannelError::ProtocolPeers {
            protocol: spec.protocol,
            required,
            peers: spec.peers,
        });
    }
    if spec.layout == ChannelLayout::Network && spec.peers != 2 {
        return Err(ChannelError::NetworkPeers { peers: spec.peers });
    }
    if spec.peer_id >= spec.peers {
        return Err(ChannelError::PeerIdOutOfRange {
            peer_id: spec.peer_id,
            peers: spec.peers,
        });
    }
    Ok(())
}

/// The physical window a channel occupies.
///
/// # Errors
/// Fails when the layout's size overflows or the window wraps.
pub fn span(spec: &ChannelSpec) -> Result<PhysicalRange, ChannelError> {
    let size = match spec.layout {
        ChannelLayout::Uniform { chunk_size } => chunk_size
            .checked_mul(u64::from(spec.peers) + 2)
            .ok_or(ChannelError::Wraps {
                base: spec.base,
                size: u64::MAX,
            })?,
        ChannelLayout::Network => NETWORK_WINDOW,
    };
    let range = PhysicalRange::new(PhysicalAddress::new(spec.base), size);
    if range.wraps() {
        return Err(ChannelError::Wraps {
            base: spec.base,
            size,
        });
    }
    Ok(range)
}

fn shared_flags() -> MemoryFlags {
    MemoryFlags::new().with_read(true).with_root_shared(true)
}

fn output_flags(slot_peer: u64, peer_id: u8) -> MemoryFlags {
    shared_flags().with_write(slot_peer == u64::from(peer_id))
}

/// Expand `spec` into the region entries of the cell with peer id
/// `spec.peer_id`.
///
/// # Errors
/// See [`ChannelError`]; no partial layout is returned.
pub fn expand(spec: &ChannelSpec, page_size: u64) -> Result<Vec<MemoryRegion>, ChannelError> {
    check_peers(spec)?;
    let window = span(spec)?;
    let base = spec.base;

    let regions: Vec<MemoryRegion> = match spec.layout {
        ChannelLayout::Uniform { chunk_size } => {
            if chunk_size == 0 || !chunk_size.is_multiple_of(page_size) {
                return Err(ChannelError::BadChunk {
                    chunk: chunk_size,
                    page_size,
                });
            }
            if !base.is_multiple_of(chunk_size) {
                return Err(ChannelError::BaseMisaligned {
                    base,
                    granule: chunk_size,
                });
            }
            let slots = u64::from(spec.peers) + 2;
            (0..slots)
                .map(|slot| {
                    let flags = match slot {
                        0 => shared_flags(),
                        1 => shared_flags().with_write(true),
                        n => output_flags(n - 2, spec.peer_id),
                    };
                    let phys_start = base + slot * chunk_size;
                    MemoryRegion {
                        phys_start,
                        virt_start: phys_start,
                        size: chunk_size,
                        flags,
                    }
                })
                .collect()
        }
        ChannelLayout::Network => {
            if !base.is_multiple_of(NETWORK_WINDOW) {
                return Err(ChannelError::BaseMisaligned {
                    base,
                    granule: NETWORK_WINDOW,
                });
            }
            if !NETWORK_OUTPUT_SIZE.is_multiple_of(page_size) {
                return Err(ChannelError::BadChunk {
                    chunk: NETWORK_OUTPUT_SIZE,
                    page_size,
                });
            }
            let mut regions = vec![
                MemoryRegion {
                    phys_start: base,
                    virt_start: base,
                    size: NETWORK_STATE_SIZE,
                    flags: shared_flags(),
                },
                MemoryRegion::EMPTY,
            ];
            for (peer, offset) in (0u64..).zip(NETWORK_OUTPUT_OFFSETS) {
                regions.push(MemoryRegion {
                    phys_start: base + offset,
                    virt_start: base + offset,
                    size: NETWORK_OUTPUT_SIZE,
                    flags: output_flags(peer, spec.peer_id),
                });
            }
            regions
        }
    };

    log::debug!(
        "channel `{}` at {window}: {} region(s), peer {}/{}",
        spec.name,
        regions.len(),
        spec.peer_id,
        spec.peers
    );
    Ok(regions)
}

/// Check that a channel lies inside the system's communication window.
///
/// # Errors
/// [`ChannelError::OutsideWindow`] when it does not.
pub fn check_window(channel: PhysicalRange, window: PhysicalRange) -> Result<(), ChannelError> {
    if window.contains_range(&channel) {
        return Ok(());
    }
    Err(ChannelError::OutsideWindow {
        span: Span {
            start: channel.start().as_u64(),
            size: channel.size(),
        },
        window: Span {
            start: window.start().as_u64(),
            size: window.size(),
        },
    })
}

/// The IVSHMEM function pointing at a channel whose first region sits at
/// `first_index` in the cell's region table.
#[must_use]
pub fn companion_device(spec: &ChannelSpec, first_index: u32, device: &PciDeviceSpec) -> PciDevice {
    PciDevice {
        device_type: PciDeviceType::Ivshmem,
        domain: device.domain,
        bdf: device.bdf.raw(),
        bar_mask: device.bar_mask.words(),
        shmem_regions_start: first_index,
        shmem_dev_id: spec.peer_id,
        shmem_peers: spec.peers,
        shmem_protocol: spec.protocol,
    }
}

/// Whether two peers' protocol tags describe the same channel.
///
/// Virtio channels pair one front-end with one back-end of the same device.
#[must_use]
pub const fn protocols_pair(a: ShmemProtocol, b: ShmemProtocol) -> bool {
    match (a, b) {
        (ShmemProtocol::Undefined, ShmemProtocol::Undefined)
        | (ShmemProtocol::Veth, ShmemProtocol::Veth) => true,
        (ShmemProtocol::VirtioFront(x), ShmemProtocol::VirtioBack(y))
        | (ShmemProtocol::VirtioBack(x), ShmemProtocol::VirtioFront(y)) => x == y,
        _ => false,
    }
}

#[derive(Debug)]
struct ChannelRecord {
    peers: u8,
    layout: ChannelLayout,
    protocol: ShmemProtocol,
    declared_by: String,
    members: BTreeMap<u8, (CellId, String)>,
}

/// Channels of the whole system, keyed by base address.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    by_base: BTreeMap<u64, ChannelRecord>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cell`'s end of the channel described by `spec`.
    ///
    /// # Errors
    /// Fails when an earlier declaration at the same base disagrees on the
    /// peer count, layout or protocol, or already uses the peer id.
    pub fn register(
        &mut self,
        cell: CellId,
        cell_name: &str,
        spec: &ChannelSpec,
    ) -> Result<(), ChannelError> {
        let record = self
            .by_base
            .entry(spec.base)
            .or_insert_with(|| ChannelRecord {
                peers: spec.peers,
                layout: spec.layout,
                protocol: spec.protocol,
                declared_by: cell_name.to_owned(),
                members: BTreeMap::new(),
            });

        let mismatch = |field| ChannelError::Mismatch {
            field,
            other: record.declared_by.clone(),
        };
        if record.peers != spec.peers {
            return Err(mismatch("peer count"));
        }
        if record.layout != spec.layout {
            return Err(mismatch("layout"));
        }
        let protocol_agrees = if record.members.is_empty() {
            record.protocol == spec.protocol
        } else {
            protocols_pair(record.protocol, spec.protocol)
        };
        if !protocol_agrees {
            return Err(mismatch("protocol"));
        }

        match record.members.get(&spec.peer_id) {
            Some((owner, _)) if *owner == cell => Ok(()),
            Some((_, owner_name)) => Err(ChannelError::DuplicatePeerId {
                peer_id: spec.peer_id,
                other: owner_name.clone(),
            }),
            None => {
                record
                    .members
                    .insert(spec.peer_id, (cell, cell_name.to_owned()));
                Ok(())
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::Bdf;

    fn demo(peer_id: u8) -> ChannelSpec {
        ChannelSpec::new("ivshmem", 0x1fc0_0000, 2, peer_id)
    }

    #[test]
    fn uniform_layout_offsets_and_flags() {
        let regions = expand(&demo(1), 0x1000).unwrap();
        let offsets: Vec<_> = regions.iter().map(|r| r.phys_start - 0x1fc0_0000).collect();
        assert_eq!(offsets, [0, 0x1_0000, 0x2_0000, 0x3_0000]);
        assert!(regions.iter().all(|r| r.size == 0x1_0000));
        assert!(regions.iter().all(|r| r.flags.root_shared() && r.flags.read()));
        assert!(regions.iter().all(|r| r.virt_start == r.phys_start));
        let writable: Vec<_> = regions.iter().map(|r| r.flags.write()).collect();
        assert_eq!(writable, [false, true, false, true]);
    }

    #[test]
    fn network_layout_matches_board_macro() {
        let spec = ChannelSpec::new("net", 0x1fd0_0000, 2, 0)
            .with_layout(ChannelLayout::Network)
            .with_protocol(ShmemProtocol::Veth);
        let regions = expand(&spec, 0x1000).unwrap();
        assert_eq!(regions.len(), 4);
        assert_eq!(regions[0].size, 0x1000);
        assert_eq!(regions[1], MemoryRegion::EMPTY);
        assert_eq!(regions[2].phys_start, 0x1fd0_1000);
        assert_eq!(regions[3].phys_start, 0x1fd8_0000);
        assert_eq!(regions[3].size, 0x7_f000);
        assert!(regions[2].flags.write());
        assert!(!regions[3].flags.write());
        assert_eq!(span(&spec).unwrap().size(), NETWORK_WINDOW);
    }

    #[test]
    fn network_layout_needs_a_1m_aligned_base() {
        let spec = ChannelSpec::new("net", 0x1fc1_0000, 2, 0).with_layout(ChannelLayout::Network);
        assert_eq!(
            expand(&spec, 0x1000),
            Err(ChannelError::BaseMisaligned {
                base: 0x1fc1_0000,
                granule: NETWORK_WINDOW
            })
        );
    }

    #[test]
    fn layout_failures() {
        assert_eq!(
            expand(&demo(2), 0x1000),
            Err(ChannelError::PeerIdOutOfRange { peer_id: 2, peers: 2 })
        );
        assert_eq!(
            expand(&ChannelSpec::new("x", 0x1fc0_8000, 2, 0), 0x1000),
            Err(ChannelError::BaseMisaligned {
                base: 0x1fc0_8000,
                granule: 0x1_0000
            })
        );
        assert_eq!(
            expand(&ChannelSpec::new("x", 0, 1, 0), 0x1000),
            Err(ChannelError::TooFewPeers { peers: 1 })
        );
        let veth3 = ChannelSpec::new("x", 0, 3, 0).with_protocol(ShmemProtocol::Veth);
        assert!(matches!(expand(&veth3, 0x1000), Err(ChannelError::ProtocolPeers { .. })));
        let odd = ChannelSpec::new("x", 0, 2, 0).with_layout(ChannelLayout::uniform(0x1800));
        assert!(matches!(expand(&odd, 0x1000), Err(ChannelError::BadChunk { .. })));
        let top = ChannelSpec::new("x", 0xffff_ffff_fffd_0000, 2, 0);
        assert!(matches!(expand(&top, 0x1000), Err(ChannelError::Wraps { .. })));
    }

    #[test]
    fn window_containment() {
        let window = PhysicalRange::new(PhysicalAddress::new(0x1fc0_0000), 0x20_0000);
        let ch = span(&demo(0)).unwrap();
        assert_eq!(check_window(ch, window), Ok(()));
        let tight = PhysicalRange::new(PhysicalAddress::new(0x1fc0_0000), 0x3_0000);
        assert!(matches!(check_window(ch, tight), Err(ChannelError::OutsideWindow { .. })));
    }

    #[test]
    fn companion_device_points_at_first_region() {
        let spec = demo(1).with_protocol(ShmemProtocol::VirtioFront(2));
        let dev = PciDeviceSpec::new(0, Bdf::from_raw(1 << 3), "ivshmem");
        let pci = companion_device(&spec, 5, &dev);
        assert_eq!(pci.device_type, PciDeviceType::Ivshmem);
        assert_eq!(pci.shmem_regions_start, 5);
        assert_eq!(pci.shmem_dev_id, 1);
        assert_eq!(pci.shmem_peers, 2);
        assert_eq!(pci.shmem_protocol, ShmemProtocol::VirtioFront(2));
        assert_eq!(pci.bar_mask, cell_abi::IVSHMEM_BAR_MASK_INTX);
    }

    #[test]
    fn registry_enforces_agreement() {
        let mut reg = ChannelRegistry::new();
        reg.register(CellId::ROOT, "root", &demo(0)).unwrap();
        reg.register(CellId::new(1), "guest", &demo(1)).unwrap();
        assert_eq!(
            reg.register(CellId::new(2), "other", &demo(0)),
            Err(ChannelError::DuplicatePeerId {
                peer_id: 0,
                other: "root".into()
            })
        );

        assert_eq!(
            reg.register(CellId::new(2), "other", &demo(1)),
            Err(ChannelError::DuplicatePeerId {
                peer_id: 1,
                other: "guest".into()
            })
        );

        let wide = ChannelSpec::new("ivshmem", 0x1fc0_0000, 3, 2);
        assert_eq!(
            reg.register(CellId::new(2), "other", &wide),
            Err(ChannelError::Mismatch {
                field: "peer count",
                other: "root".into()
            })
        );
    }

    #[test]
    fn virtio_pairs_front_with_back() {
        let mut reg = ChannelRegistry::new();
        let front = demo(0).with_protocol(ShmemProtocol::VirtioFront(2));
        let back = demo(1).with_protocol(ShmemProtocol::VirtioBack(2));
        reg.register(CellId::ROOT, "root", &back).unwrap();
        reg.register(CellId::new(1), "guest", &front).unwrap();

        let mut reg = ChannelRegistry::new();
        reg.register(CellId::ROOT, "root", &front.clone().with_peer_id(1)).unwrap();
        assert!(matches!(
            reg.register(CellId::new(1), "guest", &front.with_peer_id(0)),
            Err(ChannelError::Mismatch { field: "protocol", .. })
        ));
    }
}
