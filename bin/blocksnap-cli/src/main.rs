//! Blocksnap CLI
//!
//! Inspect raw disk images and copy their allocated blocks.

use anyhow::{Context, Result, bail};
use blocksnap_common::config::ReaderConfig;
use blocksnap_fs::{Filesystem, RawImageVolume};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "blocksnap")]
#[command(about = "Block-level disk image inspection and copy")]
#[command(version)]
struct Args {
    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Reader configuration file (JSON); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ClapArgs, Debug)]
struct VolumeArgs {
    /// Disk image or block device to read
    image: PathBuf,

    /// Block size in bytes
    #[arg(short, long, default_value_t = 4096)]
    block_size: u32,

    /// Sidecar used-block bitmap; without it every block is copied
    #[arg(long)]
    bitmap: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show volume geometry and allocation summary
    Info {
        #[command(flatten)]
        volume: VolumeArgs,
    },
    /// List allocated block ranges
    Used {
        #[command(flatten)]
        volume: VolumeArgs,
    },
    /// Copy allocated blocks into a sparse output image
    Dump {
        #[command(flatten)]
        volume: VolumeArgs,

        /// Output image path
        output: PathBuf,
    },
}

fn load_config(args: &Args) -> Result<ReaderConfig> {
    let Some(path) = &args.config else {
        return Ok(ReaderConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: ReaderConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

fn open_filesystem(volume: &VolumeArgs, config: &ReaderConfig) -> Result<Filesystem> {
    let provider = RawImageVolume::open(
        &volume.image,
        volume.block_size,
        volume.bitmap.as_deref(),
        config.direct_io,
    )
    .with_context(|| format!("opening {}", volume.image.display()))?;
    Filesystem::new(&provider, config).context("initializing block reader")
}

fn cmd_info(fs: &Filesystem) {
    let geometry = fs.geometry();
    println!("Block size:  {} bytes", geometry.block_size);
    println!("Total size:  {} bytes", geometry.total_size);
    println!("Blocks:      {}", fs.block_count());
    println!("Used space:  {} bytes", fs.used_space());
}

fn cmd_used(fs: &Filesystem) {
    let mut start: Option<u64> = None;
    let mut prev = 0u64;
    let mut ranges = 0u64;

    for block in 0..fs.block_count() {
        if fs.has_block(block) {
            if start.is_none() {
                start = Some(block);
            }
            prev = block;
        } else if let Some(first) = start.take() {
            println!("{first}..={prev}");
            ranges += 1;
        }
    }
    if let Some(first) = start {
        println!("{first}..={prev}");
        ranges += 1;
    }
    println!("{ranges} range(s)");
}

fn cmd_dump(fs: &Filesystem, output: &Path) -> Result<()> {
    let geometry = fs.geometry();
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .with_context(|| format!("creating {}", output.display()))?;
    out.set_len(geometry.total_size)
        .context("sizing output image")?;

    let mut copied = 0u64;
    for block in 0..fs.block_count() {
        let Some(buf) = fs.read_block(block).ok().flatten() else {
            continue;
        };
        out.seek(SeekFrom::Start(geometry.block_offset(block)))
            .context("seeking output image")?;
        out.write_all(&buf).context("writing output image")?;
        fs.release_buffer(buf);
        copied += 1;
    }
    out.flush().context("flushing output image")?;

    info!(copied, "image copy finished");
    println!(
        "Copied {copied} block(s), {} bytes",
        copied * u64::from(geometry.block_size)
    );

    if let Some(fault) = fs.fault() {
        bail!("device degraded during copy: {}", fault.reason);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;

    match &args.command {
        Commands::Info { volume } => {
            let fs = open_filesystem(volume, &config)?;
            cmd_info(&fs);
        }
        Commands::Used { volume } => {
            let fs = open_filesystem(volume, &config)?;
            cmd_used(&fs);
        }
        Commands::Dump { volume, output } => {
            let fs = open_filesystem(volume, &config)?;
            cmd_dump(&fs, output)?;
        }
    }

    Ok(())
}
