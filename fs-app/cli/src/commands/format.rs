//! Format command for making MINIX V3 filesystems

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::io::Write;
use std::path::PathBuf;

use mfsck::blockdev::{BlockDevice, FileBackedBlockDevice};
use mfsck::format::{self, Endian, FormatParams};

/// Make an empty MINIX V3 filesystem
#[derive(Parser, Debug)]
#[command(about = "Make an empty MINIX V3 filesystem")]
pub struct FormatArgs {
    /// Device or image file to format
    pub device: PathBuf,

    /// Create (or resize) an image file of this many MiB
    #[arg(short, long)]
    pub size: Option<u64>,

    /// Block size in bytes
    #[arg(short, long = "block-size", default_value_t = 4096)]
    pub block_size: usize,

    /// Number of inodes (default: one per four blocks)
    #[arg(short, long)]
    pub inodes: Option<u32>,

    /// Write the filesystem in big-endian byte order
    #[arg(long = "big-endian")]
    pub big_endian: bool,

    /// Format without confirmation
    #[arg(short, long)]
    pub force: bool,
}

pub async fn run(args: FormatArgs) -> Result<()> {
    if args.size.is_none() && !args.device.exists() {
        return Err(anyhow!(
            "{} does not exist; pass --size to create an image",
            args.device.display()
        ));
    }

    if !args.force && args.device.exists() {
        println!(
            "WARNING: this will make a new filesystem on {}.",
            args.device.display()
        );
        println!("All data on it will be lost!");
        print!("Are you sure you want to continue? [y/N] ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    let device = match args.size {
        Some(mib) => {
            let bytes = mib
                .checked_mul(1024 * 1024)
                .ok_or_else(|| anyhow!("Requested size is too large"))?;
            FileBackedBlockDevice::create(&args.device, bytes).await
        }
        None => FileBackedBlockDevice::open(&args.device, false).await,
    }
    .with_context(|| format!("Failed to open {}", args.device.display()))?;

    let params = FormatParams {
        block_size: args.block_size,
        inodes: args.inodes,
        endian: if args.big_endian {
            Endian::Big
        } else {
            Endian::Little
        },
    };

    info!(
        "Formatting {} ({} bytes, block size {})",
        args.device.display(),
        device.size(),
        params.block_size
    );

    let summary = format::format_device(&device, &params)
        .await
        .with_context(|| format!("Failed to format {}", args.device.display()))?;

    println!(
        "{}: {} inodes, {} zones of {} bytes, first data zone {}",
        args.device.display(),
        summary.inodes,
        summary.zones,
        summary.block_size,
        summary.first_data_zone
    );
    Ok(())
}
