//! # Compile Errors
//!
//! Every violation names where it was found ([`Location`]) and, for
//! conflicts, the entity it collides with. Validation keeps going after an
//! error so that a board author sees every problem of a system in one run;
//! the collected list is returned as [`CompileErrors`].

use crate::pci::Bdf;
use cell_abi::ShmemProtocol;
use core::fmt;

/// The table entry or system part an error refers to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Item {
    Cell,
    Region(usize),
    IrqChip(usize),
    PciDevice(usize),
    Channel(String),
}

/// Where in the board an error was found.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Location {
    /// System-level options.
    Options,
    /// The platform block.
    Platform,
    HypervisorMemory,
    CommWindow,
    /// An entry of a named cell.
    Cell { cell: String, item: Item },
}

impl Location {
    #[must_use]
    pub fn cell(name: &str) -> Self {
        Self::Cell {
            cell: name.to_owned(),
            item: Item::Cell,
        }
    }

    #[must_use]
    pub fn region(name: &str, index: usize) -> Self {
        Self::Cell {
            cell: name.to_owned(),
            item: Item::Region(index),
        }
    }

    #[must_use]
    pub fn irqchip(name: &str, index: usize) -> Self {
        Self::Cell {
            cell: name.to_owned(),
            item: Item::IrqChip(index),
        }
    }

    #[must_use]
    pub fn pci_device(name: &str, index: usize) -> Self {
        Self::Cell {
            cell: name.to_owned(),
            item: Item::PciDevice(index),
        }
    }

    #[must_use]
    pub fn channel(name: &str, channel: &str) -> Self {
        Self::Cell {
            cell: name.to_owned(),
            item: Item::Channel(channel.to_owned()),
        }
    }

    /// The cell this location belongs to, if any.
    #[must_use]
    pub fn cell_name(&self) -> Option<&str> {
        match self {
            Self::Cell { cell, .. } => Some(cell),
            _ => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Options => f.write_str("options"),
            Self::Platform => f.write_str("platform"),
            Self::HypervisorMemory => f.write_str("hypervisor memory"),
            Self::CommWindow => f.write_str("communication window"),
            Self::Cell { cell, item } => match item {
                Item::Cell => write!(f, "cell `{cell}`"),
                Item::Region(i) => write!(f, "cell `{cell}` memory region #{i}"),
                Item::IrqChip(i) => write!(f, "cell `{cell}` irqchip #{i}"),
                Item::PciDevice(i) => write!(f, "cell `{cell}` pci device #{i}"),
                Item::Channel(name) => write!(f, "cell `{cell}` channel `{name}`"),
            },
        }
    }
}

/// Physical or cell-visible address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Space {
    Physical,
    Virtual,
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Physical => "physical",
            Self::Virtual => "virtual",
        })
    }
}

/// A `[start, start + size)` span as reported in errors.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Span {
    pub start: u64,
    pub size: u64,
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start.checked_add(self.size) {
            Some(end) => write!(f, "[{:#x}, {end:#x})", self.start),
            None => write!(f, "[{:#x} +{:#x})", self.start, self.size),
        }
    }
}

/// Why a single region is malformed.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    #[error("region size is zero")]
    ZeroSize,
    #[error("{space} range {start:#x} + {size:#x} wraps the address space")]
    Wraps { space: Space, start: u64, size: u64 },
    #[error("communication region must not have a physical start")]
    BackedCommRegion,
    #[error("region has no physical start")]
    MissingPhysStart,
    #[error("communication region has no virtual start")]
    MissingVirtStart,
    #[error("DMA region must be readable and writable")]
    DmaNotReadWrite,
    #[error("loadable region must be executable or writable")]
    LoadableNotExecOrWrite,
    #[error("expected {expected} communication region(s), found {found}")]
    CommRegionCount { expected: usize, found: usize },
}

/// Why an interrupt assignment is out of range.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InterruptRangeError {
    #[error("interrupt range {first}..={last} is reversed")]
    Reversed { first: u32, last: u32 },
    #[error("interrupt {irq} lies outside the controller window {pin_base}..{end}")]
    OutsideController { irq: u32, pin_base: u32, end: u64 },
    #[error("vPCI interrupt base {base} is below the pin offset {offset}")]
    BelowPinOffset { base: u32, offset: u32 },
    #[error("no irqchip of the cell covers vPCI interrupts {first}..={last}")]
    Uncovered { first: u32, last: u64 },
    #[error("no free block of {width} interrupts left for the virtual PCI devices")]
    Exhausted { width: u32 },
}

/// Why a shared-memory channel cannot be laid out or bound.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("a channel needs at least 2 peers, got {peers}")]
    TooFewPeers { peers: u8 },
    #[error("peer id {peer_id} is out of range for {peers} peers")]
    PeerIdOutOfRange { peer_id: u8, peers: u8 },
    #[error("protocol {protocol:?} requires exactly {required} peers, got {peers}")]
    ProtocolPeers {
        protocol: ShmemProtocol,
        required: u8,
        peers: u8,
    },
    #[error("the network layout requires exactly 2 peers, got {peers}")]
    NetworkPeers { peers: u8 },
    #[error("chunk size {chunk:#x} is not a non-zero multiple of the page size {page_size:#x}")]
    BadChunk { chunk: u64, page_size: u64 },
    #[error("base {base:#x} is not aligned to {granule:#x}")]
    BaseMisaligned { base: u64, granule: u64 },
    #[error("channel {base:#x} + {size:#x} wraps the address space")]
    Wraps { base: u64, size: u64 },
    #[error("channel {span} exceeds the communication window {window}")]
    OutsideWindow { span: Span, window: Span },
    #[error("channel name is used twice in this cell")]
    DuplicateName,
    #[error("{field} differs from the declaration in cell `{other}`")]
    Mismatch { field: &'static str, other: String },
    #[error("peer id {peer_id} is already taken by cell `{other}`")]
    DuplicatePeerId { peer_id: u8, other: String },
    #[error("channel is bound by more than one PCI device")]
    BoundTwice,
}

/// Why a cell, the options or the platform block is unusable.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("page size {0:#x} is not a power of two of at least 4 KiB")]
    InvalidPageSize(u64),
    #[error("vPCI interrupt width {0} is not within 1..=32")]
    InvalidVpciWidth(u32),
    #[error("cell name must be 1 to 31 bytes without NUL, path separators or a leading dot, got {0:?}")]
    InvalidName(String),
    #[error("cell name is used by more than one cell")]
    DuplicateName,
    #[error("cell owns no CPU")]
    EmptyCpuSet,
    #[error("{0} PMU interrupts given, at most 8 are supported")]
    TooManyPmuIrqs(usize),
    #[error("no channel named `{0}` in this cell")]
    UnknownChannel(String),
    #[error("table holds {0} entries, more than the descriptor can count")]
    TableTooLarge(usize),
}

/// A single validation failure.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("{at}: {what} {value:#x} is not aligned to {granule:#x}")]
    Alignment {
        at: Location,
        what: &'static str,
        value: u64,
        granule: u64,
    },
    #[error("{at}: {space} range {span} overlaps {other} {other_span}")]
    Overlap {
        space: Space,
        at: Location,
        span: Span,
        other: Location,
        other_span: Span,
    },
    #[error(
        "{at}: interrupt {irq} of controller {controller:#x} is claimed by both `{first}` and `{second}`"
    )]
    DuplicateInterrupt {
        at: Location,
        controller: u64,
        irq: u32,
        first: String,
        second: String,
    },
    #[error("{at}: {reason}")]
    InterruptRange {
        at: Location,
        reason: InterruptRangeError,
    },
    #[error("{at}: {reason}")]
    ChannelLayout { at: Location, reason: ChannelError },
    #[error("{at}: PCI device {domain:04x}:{bdf} is already declared by {other}")]
    PciIdentityConflict {
        at: Location,
        domain: u16,
        bdf: Bdf,
        other: Location,
    },
    #[error("{at}: {table} count {declared} does not match {actual} encoded entries")]
    SchemaConsistency {
        at: Location,
        table: &'static str,
        declared: u64,
        actual: u64,
    },
    #[error("{at}: {reason}")]
    InvalidRegion { at: Location, reason: RegionError },
    #[error("{at}: CPU {cpu} is also assigned to `{other}`")]
    CpuConflict {
        at: Location,
        cpu: u32,
        other: String,
    },
    #[error("{at}: {reason}")]
    InvalidConfig { at: Location, reason: ConfigError },
}

impl CompileError {
    /// Where the error was found.
    #[must_use]
    pub const fn location(&self) -> &Location {
        match self {
            Self::Alignment { at, .. }
            | Self::Overlap { at, .. }
            | Self::DuplicateInterrupt { at, .. }
            | Self::InterruptRange { at, .. }
            | Self::ChannelLayout { at, .. }
            | Self::PciIdentityConflict { at, .. }
            | Self::SchemaConsistency { at, .. }
            | Self::InvalidRegion { at, .. }
            | Self::CpuConflict { at, .. }
            | Self::InvalidConfig { at, .. } => at,
        }
    }

    /// Whether the error aborts compilation immediately.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SchemaConsistency { .. })
    }
}

/// All errors found in one system.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CompileErrors(Vec<CompileError>);

impl CompileErrors {
    /// Wrap a non-empty list.
    #[must_use]
    pub fn new(errors: Vec<CompileError>) -> Self {
        debug_assert!(!errors.is_empty());
        Self(errors)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, CompileError> {
        self.0.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[CompileError] {
        &self.0
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<CompileError> {
        self.0
    }
}

impl From<CompileError> for CompileErrors {
    fn from(error: CompileError) -> Self {
        Self(vec![error])
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [one] => write!(f, "{one}"),
            all => {
                write!(f, "{} configuration errors:", all.len())?;
                for e in all {
                    write!(f, "\n  {e}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CompileErrors {}

impl<'a> IntoIterator for &'a CompileErrors {
    type Item = &'a CompileError;
    type IntoIter = core::slice::Iter<'a, CompileError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for CompileErrors {
    type Item = CompileError;
    type IntoIter = std::vec::IntoIter<CompileError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
