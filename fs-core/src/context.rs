//! State of one check run
//!
//! Everything a run mutates lives in [`CheckContext`] and is passed
//! explicitly to each phase, so independent checks never share state.

use serde::Serialize;
use std::sync::Arc;

use crate::bitmap::{Bitmap, BitmapKind};
use crate::blockdev::BlockDevice;
use crate::cache::BlockCache;
use crate::error::Result;
use crate::format::{DiskInode, Endian, InodeType};
use crate::inode_cache::InodeCache;
use crate::layout::Geometry;
use crate::policy::CheckOptions;
use crate::superblock::Superblock;
use crate::zone_walker::ZoneClaims;

/// Reached inodes by file type, free resources, and zones by tree level
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub regular: u64,
    pub directories: u64,
    pub block_special: u64,
    pub char_special: u64,
    pub pipes: u64,
    pub symlinks: u64,
    pub sockets: u64,
    pub bad: u64,
    pub free_inodes: u64,
    pub free_zones: u64,
    /// Data zones, single-indirect tables, double-indirect tables
    pub zones_by_level: [u64; 3],
}

impl Counters {
    pub fn count_type(&mut self, file_type: InodeType) {
        let counter = match file_type {
            InodeType::Regular => &mut self.regular,
            InodeType::Directory => &mut self.directories,
            InodeType::BlockSpecial => &mut self.block_special,
            InodeType::CharSpecial => &mut self.char_special,
            InodeType::Pipe => &mut self.pipes,
            InodeType::Symlink => &mut self.symlinks,
            InodeType::Socket => &mut self.sockets,
            InodeType::Bad => &mut self.bad,
        };
        *counter += 1;
    }

    pub fn inodes_in_use(&self) -> u64 {
        self.regular
            + self.directories
            + self.block_special
            + self.char_special
            + self.pipes
            + self.symlinks
            + self.sockets
            + self.bad
    }

    pub fn zones_in_use(&self) -> u64 {
        self.zones_by_level.iter().sum()
    }
}

pub struct CheckContext {
    pub device: Arc<dyn BlockDevice>,
    pub dev: u64,
    pub superblock: Superblock,
    pub geometry: Geometry,
    pub endian: Endian,
    pub cache: BlockCache,
    pub inodes: InodeCache,
    /// On-disk inode bitmap
    pub imap: Bitmap,
    /// On-disk zone bitmap
    pub zmap: Bitmap,
    /// Inodes reached by the directory walk
    pub reached: Bitmap,
    /// Zones reached by the zone walks, with their first owner
    pub claims: ZoneClaims,
    /// Directory entries naming each inode
    pub tallies: Vec<u32>,
    pub counters: Counters,
}

impl CheckContext {
    /// Set up a run over `device` and load both on-disk bitmaps
    pub async fn open(
        device: Arc<dyn BlockDevice>,
        superblock: Superblock,
        options: &CheckOptions,
    ) -> Result<Self> {
        let geometry = superblock.geometry;
        let endian = superblock.endian;
        let cache = BlockCache::new(
            device.clone(),
            geometry.block_size,
            options.block_cache,
            false,
        );

        let imap = Bitmap::load(&cache, &geometry, endian, BitmapKind::Inode).await?;
        let zmap = Bitmap::load(&cache, &geometry, endian, BitmapKind::Zone).await?;

        Ok(Self {
            dev: device.device_id(),
            device,
            inodes: InodeCache::new(options.inode_cache, geometry, endian),
            reached: Bitmap::observed(&geometry, BitmapKind::Inode),
            claims: ZoneClaims::new(&geometry),
            tallies: vec![0; geometry.ninodes as usize + 1],
            counters: Counters::default(),
            superblock,
            geometry,
            endian,
            cache,
            imap,
            zmap,
        })
    }

    /// Copy of inode `inum`, through the inode cache
    pub async fn load_inode(&mut self, inum: u32) -> Result<DiskInode> {
        let handle = self.inodes.get(&self.cache, self.dev, inum).await?;
        let inode = self.inodes.inode(&handle).clone();
        self.inodes.put(handle);
        Ok(inode)
    }

    /// Change inode `inum` in the cache; it is written at the final flush
    pub async fn update_inode<F>(&mut self, inum: u32, change: F) -> Result<()>
    where
        F: FnOnce(&mut DiskInode),
    {
        let handle = self.inodes.get(&self.cache, self.dev, inum).await?;
        change(self.inodes.inode_mut(&handle));
        self.inodes.put(handle);
        Ok(())
    }

    pub fn is_reached(&self, inum: u32) -> bool {
        self.reached.is_set(inum as usize)
    }

    /// Mark `inum` reached; true on the first call for that inode
    pub fn mark_reached(&mut self, inum: u32) -> Result<bool> {
        Ok(self.reached.mark(inum as usize)?)
    }

    pub fn tally(&mut self, inum: u32) {
        self.tallies[inum as usize] += 1;
    }

    pub fn untally(&mut self, inum: u32) {
        let count = &mut self.tallies[inum as usize];
        *count = count.saturating_sub(1);
    }

    pub fn tally_of(&self, inum: u32) -> u32 {
        self.tallies[inum as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut counters = Counters::default();
        counters.count_type(InodeType::Directory);
        counters.count_type(InodeType::Regular);
        counters.count_type(InodeType::Regular);
        counters.zones_by_level = [5, 1, 0];
        assert_eq!(counters.regular, 2);
        assert_eq!(counters.inodes_in_use(), 3);
        assert_eq!(counters.zones_in_use(), 6);
    }
}
