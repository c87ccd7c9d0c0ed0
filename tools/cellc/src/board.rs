//! Loading and compiling one board file.

use anyhow::Context;
use cell_compiler::{Image, SystemSpec, compile_system};
use log::debug;
use std::fs;
use std::path::Path;

/// Read and parse a JSON board file.
pub fn load(path: &Path) -> anyhow::Result<SystemSpec> {
    let text =
        fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{}: invalid board file", path.display()))
}

/// Compile the board at `path` into its descriptor images.
///
/// A `page_size` given on the command line wins over the board's options.
pub fn compile(path: &Path, page_size: Option<u64>) -> anyhow::Result<Vec<Image>> {
    let mut spec = load(path)?;
    if let Some(page_size) = page_size {
        spec.options.page_size = page_size;
    }

    let compiled = compile_system(&spec).with_context(|| path.display().to_string())?;
    let images = compiled
        .images()
        .with_context(|| path.display().to_string())?;
    for image in &images {
        debug!(
            "{}: {} ({:?}, {} bytes)",
            path.display(),
            image.file_name(),
            image.kind,
            image.bytes.len()
        );
    }
    Ok(images)
}
