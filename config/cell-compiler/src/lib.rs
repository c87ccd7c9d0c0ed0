//! # Cell Configuration Compiler
//!
//! Turns a board description ([`SystemSpec`]) into the binary descriptors the
//! hypervisor loader consumes: one system descriptor carrying the hypervisor
//! setup and the root cell, and one descriptor per guest cell.
//!
//! Compilation is a batch: every cell is validated against the whole system
//! (memory claims, interrupt ownership, PCI identities, shared-memory
//! channels) and all violations are reported together. Nothing is emitted
//! unless the system is clean.
//!
//! ```no_run
//! # fn demo(json: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let spec: cell_compiler::SystemSpec = serde_json::from_str(json)?;
//! let compiled = cell_compiler::compile_system(&spec)?;
//! for image in compiled.images()? {
//!     std::fs::write(image.file_name(), &image.bytes)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`spec`] | Board model and its JSON conventions |
//! | [`options`] | Page size, sharing policy, vPCI parameters |
//! | [`address_space`] | System-wide physical claims |
//! | [`irq`] | Interrupt bitmaps, ownership, vPCI block |
//! | [`channel`] | Shared-memory channel layout and registry |
//! | [`pci`] | BDF notation, BAR masks, PCI identity registry |
//! | [`assemble`] | Descriptor structures and serialization |
//! | [`error`] | Located validation errors |

pub mod address_space;
pub mod assemble;
pub mod channel;
mod compile;
mod context;
pub mod error;
pub mod irq;
pub mod options;
pub mod pci;
mod region;
pub mod spec;

pub use crate::assemble::{CellDescriptor, CompiledSystem, Image, SystemDescriptor};
pub use crate::compile::compile_system;
pub use crate::context::{CellId, SystemBuildContext};
pub use crate::error::{CompileError, CompileErrors, Location};
pub use crate::options::{CompileOptions, FlagMatch, SharingPolicy};
pub use crate::region::{CellRegions, check_region, lay_out};
pub use crate::spec::{CellSpec, SystemSpec};
