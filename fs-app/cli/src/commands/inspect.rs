//! Inspect command: list the superblock and inodes of a filesystem

use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use mfsck::blockdev::{BlockDevice, FileBackedBlockDevice};
use mfsck::cache::BlockCache;
use mfsck::format::DiskInode;
use mfsck::inode_cache::read_inode;
use mfsck::Superblock;

/// Show filesystem metadata without checking it
#[derive(Parser, Debug)]
#[command(about = "Show the superblock or inodes of a MINIX filesystem")]
pub struct InspectArgs {
    /// Device or image file to inspect
    pub device: PathBuf,

    /// Show the superblock and the geometry derived from it
    #[arg(short = 's', long = "super")]
    pub superblock: bool,

    /// Show these inodes
    #[arg(short, long = "inode", num_args = 1..)]
    pub inodes: Vec<u32>,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: InspectArgs) -> Result<()> {
    if !args.superblock && args.inodes.is_empty() {
        return Err(anyhow!("nothing to show; pass --super or --inode"));
    }

    let device: Arc<dyn BlockDevice> = Arc::new(
        FileBackedBlockDevice::open(&args.device, true)
            .await
            .with_context(|| format!("Failed to open {}", args.device.display()))?,
    );
    let superblock = Superblock::load(device.as_ref())
        .await
        .with_context(|| format!("Failed to read the superblock of {}", args.device.display()))?;

    if args.superblock {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&superblock)?);
        } else {
            print_superblock(&superblock);
        }
    }

    let geometry = superblock.geometry;
    let cache = BlockCache::new(device, geometry.block_size, 16, true);
    for &inum in &args.inodes {
        let inode = read_inode(&cache, &geometry, superblock.endian, inum)
            .await
            .with_context(|| format!("Failed to read inode {}", inum))?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&inode)?);
        } else {
            print_inode(inum, &inode);
        }
    }
    Ok(())
}

fn print_superblock(sb: &Superblock) {
    let g = &sb.geometry;
    println!("Superblock:");
    println!("  Version:          {} ({:?}-endian)", sb.version, sb.endian);
    println!("  Magic:            0x{:04x}", sb.raw.magic);
    println!("  Flags:            0x{:04x}{}", sb.raw.flags, if sb.is_clean() { " (clean)" } else { "" });
    println!("  Inodes:           {}", g.ninodes);
    println!("  Zones:            {}", g.zones);
    println!("  Block size:       {}", g.block_size);
    println!("  Log zone size:    {}", g.log_zone_size);
    println!("  Max file size:    {}", sb.raw.max_size);
    println!("  Inode map:        {} blocks at {}", g.imap_blocks, g.imap_start());
    println!("  Zone map:         {} blocks at {}", g.zmap_blocks, g.zmap_start());
    println!("  Inode table:      {} blocks at {}", g.inode_table_blocks, g.inode_table);
    println!("  First data zone:  {}", g.first_data_zone);
    println!("  Data zones:       {}", g.data_zone_count());
}

fn mode_string(mode: u16) -> String {
    let mut s = String::with_capacity(10);
    s.push(mfsck::format::InodeType::from_mode(mode).symbol());
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        s.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    s
}

fn time_string(secs: u32) -> String {
    match Utc.timestamp_opt(i64::from(secs), 0).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => secs.to_string(),
    }
}

fn print_inode(inum: u32, inode: &DiskInode) {
    println!("Inode {}:", inum);
    println!("  Mode:   {} (0{:o})", mode_string(inode.mode), inode.mode);
    println!("  Links:  {}", inode.nlinks);
    println!("  Owner:  {}:{}", inode.uid, inode.gid);
    println!("  Size:   {}", inode.size);
    println!("  atime:  {}", time_string(inode.atime));
    println!("  mtime:  {}", time_string(inode.mtime));
    println!("  ctime:  {}", time_string(inode.ctime));
    let zones: Vec<String> = inode.zones.iter().map(|z| z.to_string()).collect();
    println!("  Zones:  {}", zones.join(" "));
}
