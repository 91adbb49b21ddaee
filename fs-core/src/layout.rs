//! Derived on-disk geometry of a MINIX filesystem

use serde::Serialize;

use crate::error::{Error, Result};
use crate::format::{
    RawSuperblock, Version, DIR_ENTRY_SIZE, IMAP_START, INODE_SIZE, ZONE_NUM_SIZE,
};
use crate::blockdev::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Largest zone-size shift accepted
pub const MAX_LOG_ZONE_SIZE: u16 = 8;

/// Block numbers and sizes of every filesystem structure, computed once from
/// the superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    /// Block size in bytes
    pub block_size: usize,
    /// log2(blocks per zone)
    pub log_zone_size: u16,
    /// Number of inodes (inode numbers run 1..=ninodes)
    pub ninodes: u32,
    /// Total zones, including the metadata area
    pub zones: u32,
    /// Blocks of the inode bitmap
    pub imap_blocks: u64,
    /// Blocks of the zone bitmap
    pub zmap_blocks: u64,
    /// First block of the inode table
    pub inode_table: u64,
    /// Blocks of the inode table
    pub inode_table_blocks: u64,
    /// First zone that holds file data
    pub first_data_zone: u32,
    /// Inodes per block
    pub inodes_per_block: u64,
    /// Zone numbers per indirect block
    pub nindirs: u64,
}

impl Geometry {
    /// Compute and validate the geometry for a superblock
    pub fn derive(raw: &RawSuperblock, version: Version) -> Result<Self> {
        let block_size = match version {
            Version::V2 => MIN_BLOCK_SIZE,
            Version::V3 => raw.block_size as usize,
        };
        // s_block_size is a u16, so 64 KiB shows up as 0
        let block_size = if version == Version::V3 && block_size == 0 {
            MAX_BLOCK_SIZE
        } else {
            block_size
        };

        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(Error::InvalidGeometry(format!(
                "block size {} is not a power of two between {} and {}",
                block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if raw.ninodes == 0 {
            return Err(Error::InvalidGeometry("inode count is zero".into()));
        }
        if raw.zones == 0 {
            return Err(Error::InvalidGeometry("zone count is zero".into()));
        }
        if raw.log_zone_size > MAX_LOG_ZONE_SIZE {
            return Err(Error::InvalidGeometry(format!(
                "zone size shift {} is larger than {}",
                raw.log_zone_size, MAX_LOG_ZONE_SIZE
            )));
        }

        let inodes_per_block = (block_size / INODE_SIZE) as u64;
        let imap_blocks = raw.imap_blocks as u64;
        let zmap_blocks = raw.zmap_blocks as u64;
        let inode_table = IMAP_START + imap_blocks + zmap_blocks;
        let inode_table_blocks = (raw.ninodes as u64 + inodes_per_block - 1) / inodes_per_block;
        let metadata_end = inode_table + inode_table_blocks;

        let first_data_zone = if raw.first_data_zone_old != 0 {
            raw.first_data_zone_old as u64
        } else {
            let per_zone = 1u64 << raw.log_zone_size;
            (metadata_end + per_zone - 1) >> raw.log_zone_size
        };

        let geometry = Self {
            block_size,
            log_zone_size: raw.log_zone_size,
            ninodes: raw.ninodes,
            zones: raw.zones,
            imap_blocks,
            zmap_blocks,
            inode_table,
            inode_table_blocks,
            first_data_zone: u32::try_from(first_data_zone).map_err(|_| {
                Error::InvalidGeometry(format!("first data zone {} overflows", first_data_zone))
            })?,
            inodes_per_block,
            nindirs: (block_size / ZONE_NUM_SIZE) as u64,
        };

        let bits = geometry.bits_per_block();
        if imap_blocks * bits < raw.ninodes as u64 + 1 {
            return Err(Error::InvalidGeometry(format!(
                "{} inode bitmap blocks cannot hold {} inodes",
                imap_blocks, raw.ninodes
            )));
        }
        if geometry.zone_block(geometry.first_data_zone) < metadata_end {
            return Err(Error::InvalidGeometry(format!(
                "first data zone {} overlaps the inode table",
                geometry.first_data_zone
            )));
        }
        if geometry.first_data_zone >= raw.zones {
            return Err(Error::InvalidGeometry(format!(
                "first data zone {} is past the last zone {}",
                geometry.first_data_zone, raw.zones
            )));
        }
        if zmap_blocks * bits < geometry.data_zone_count() as u64 + 1 {
            return Err(Error::InvalidGeometry(format!(
                "{} zone bitmap blocks cannot hold {} zones",
                zmap_blocks,
                geometry.data_zone_count()
            )));
        }

        Ok(geometry)
    }

    /// Bits held by one bitmap block
    pub fn bits_per_block(&self) -> u64 {
        self.block_size as u64 * 8
    }

    /// First block of the inode bitmap
    pub fn imap_start(&self) -> u64 {
        IMAP_START
    }

    /// First block of the zone bitmap
    pub fn zmap_start(&self) -> u64 {
        IMAP_START + self.imap_blocks
    }

    /// Bytes per zone
    pub fn zone_size(&self) -> u64 {
        (self.block_size as u64) << self.log_zone_size
    }

    /// First block of zone `zone`
    pub fn zone_block(&self, zone: u32) -> u64 {
        (zone as u64) << self.log_zone_size
    }

    /// Blocks of zone `zone` (one per block of a multi-block zone)
    pub fn zone_blocks(&self, zone: u32) -> std::ops::Range<u64> {
        let first = self.zone_block(zone);
        first..first + (1u64 << self.log_zone_size)
    }

    /// Whether `zone` may be referenced by an inode
    pub fn zone_in_range(&self, zone: u32) -> bool {
        zone >= self.first_data_zone && zone < self.zones
    }

    /// Number of data zones tracked by the zone bitmap
    pub fn data_zone_count(&self) -> u32 {
        self.zones - self.first_data_zone
    }

    /// Zone bitmap bit of a data zone
    pub fn zone_bit(&self, zone: u32) -> usize {
        (zone - self.first_data_zone) as usize + 1
    }

    /// Data zone of a zone bitmap bit
    pub fn bit_zone(&self, bit: usize) -> u32 {
        self.first_data_zone + bit as u32 - 1
    }

    /// Block and byte offset within it of inode `inum`
    pub fn inode_location(&self, inum: u32) -> (u64, usize) {
        let index = (inum - 1) as u64;
        let block = self.inode_table + index / self.inodes_per_block;
        let offset = (index % self.inodes_per_block) as usize * INODE_SIZE;
        (block, offset)
    }

    /// Directory entries per block
    pub fn entries_per_block(&self) -> usize {
        self.block_size / DIR_ENTRY_SIZE
    }

    /// Data zones needed for `size` bytes
    pub fn zones_for_size(&self, size: u64) -> u64 {
        (size + self.zone_size() - 1) / self.zone_size()
    }

    /// Bytes the filesystem occupies on the device
    pub fn byte_size(&self) -> u64 {
        self.zone_block(self.zones) * self.block_size as u64
    }
}
