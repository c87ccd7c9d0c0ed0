//! # cellc
//!
//! Command-line front end of the cell configuration compiler.
//!
//! ```text
//! cellc compile boards/rk3308.json --out-dir out/
//! cellc check boards/*.json
//! cellc inspect out/rk3308-linux.cell
//! ```

mod board;
mod inspect;
mod logger;

use anyhow::{Context, anyhow, bail};
use cell_abi::parse::Descriptor;
use cell_compiler::Image;
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use logger::StderrLogger;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Parser)]
#[command(
    name = "cellc",
    version,
    about = "Compile partition board files into hypervisor cell descriptors"
)]
struct Cli {
    /// More log output; repeat for trace output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate boards and write one `<cell>.cell` file per cell
    Compile {
        #[command(flatten)]
        boards: BoardArgs,

        /// Directory the descriptors are written to
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        out_dir: PathBuf,
    },
    /// Validate boards without writing anything
    Check {
        #[command(flatten)]
        boards: BoardArgs,
    },
    /// Decode and print a descriptor file
    Inspect {
        /// A `.cell` file produced by `compile`
        file: PathBuf,
    },
}

#[derive(Debug, Args)]
struct BoardArgs {
    /// JSON board files
    #[arg(required = true, value_name = "BOARD")]
    boards: Vec<PathBuf>,

    /// Override the page size of every board (decimal or 0x hex)
    #[arg(long, value_name = "BYTES", value_parser = parse_size)]
    page_size: Option<u64>,
}

fn parse_size(text: &str) -> Result<u64, String> {
    cell_compiler::spec::de::parse_u64(text).ok_or_else(|| format!("`{text}` is not an integer"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    StderrLogger::new(StderrLogger::level_for(cli.verbose, cli.quiet))
        .init()
        .map_err(|e| anyhow!("cannot install logger: {e}"))?;

    match cli.command {
        Command::Compile { boards, out_dir } => {
            let images = compile_all(&boards)?;
            write_images(&out_dir, &images)
        }
        Command::Check { boards } => {
            let images = compile_all(&boards)?;
            info!("{} board(s) ok, {} descriptor(s)", boards.boards.len(), images.len());
            Ok(())
        }
        Command::Inspect { file } => {
            let bytes = fs::read(&file).with_context(|| format!("cannot read {}", file.display()))?;
            let desc = Descriptor::parse(&bytes)
                .with_context(|| format!("{}: not a valid descriptor", file.display()))?;
            let text = inspect::render(&desc)
                .with_context(|| format!("{}: corrupt table entry", file.display()))?;
            print!("{text}");
            Ok(())
        }
    }
}

/// Compile every board on its own thread; fails if any board fails.
fn compile_all(args: &BoardArgs) -> anyhow::Result<Vec<Image>> {
    let page_size = args.page_size;
    let results: Vec<anyhow::Result<Vec<Image>>> = std::thread::scope(|s| {
        let handles: Vec<_> = args
            .boards
            .iter()
            .map(|path| s.spawn(move || board::compile(path, page_size)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("compiler thread panicked"))))
            .collect()
    });

    let mut images = Vec::new();
    let mut failed = 0usize;
    for result in results {
        match result {
            Ok(board_images) => images.extend(board_images),
            Err(e) => {
                error!("{e:#}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} board(s) failed to compile", args.boards.len());
    }

    let mut names = BTreeMap::new();
    for image in &images {
        if let Some(kind) = names.insert(image.file_name(), image.kind) {
            bail!(
                "{} is produced twice ({kind:?} and {:?} descriptor)",
                image.file_name(),
                image.kind
            );
        }
    }
    Ok(images)
}

/// Stage every image next to its target, then move them into place; a
/// failure while staging leaves `out_dir` untouched.
fn write_images(out_dir: &Path, images: &[Image]) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("cannot create {}", out_dir.display()))?;

    let mut staged = Vec::with_capacity(images.len());
    for image in images {
        let path = out_dir.join(image.file_name());
        if path.is_dir() {
            bail!("cannot write {}: it is a directory", path.display());
        }
        let mut file = NamedTempFile::new_in(out_dir)
            .with_context(|| format!("cannot create a temporary file in {}", out_dir.display()))?;
        file.write_all(&image.bytes)
            .with_context(|| format!("cannot stage {}", path.display()))?;
        staged.push((file, path, image.bytes.len()));
    }

    for (file, path, len) in staged {
        file.persist(&path)
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!("wrote {} ({len} bytes)", path.display());
    }
    Ok(())
}
