//! In-memory MINIX images for the integration tests
//!
//! A [`TestImage`] is formatted with `format_device` and then edited as raw
//! bytes, so tests can build trees and plant exactly the corruption they
//! want without going through the checker.

#![allow(dead_code)]

use std::sync::Arc;

use mfsck::bitmap::BitmapKind;
use mfsck::blockdev::MemoryBlockDevice;
use mfsck::format::{
    detect_magic, format_device, DirEntry, DiskInode, Endian, FormatParams, RawSuperblock,
    DIR_ENTRY_SIZE, DOUBLE_INDIRECT, FLAG_CLEAN, I_DIRECTORY, I_REGULAR, NR_DZONES,
    SINGLE_INDIRECT, SUPER_DISK_SIZE, SUPER_OFFSET, ZONE_NUM_SIZE,
};
use mfsck::layout::Geometry;
use mfsck::{CheckOptions, Checker, Confirm, DeclineAll, FsckReport, RepairPolicy, Result};

pub const BLOCK_SIZE: usize = 1024;
pub const BLOCKS: usize = 1024;
pub const INODES: u32 = 64;

/// Fixed time stamped on every inode the builder makes
pub const BUILD_TIME: u32 = 1_600_000_000;

pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

pub struct TestImage {
    pub bytes: Vec<u8>,
    pub geometry: Geometry,
    pub endian: Endian,
}

impl TestImage {
    /// 1 MiB, 1 KiB blocks, 64 inodes, little-endian
    pub async fn new() -> Self {
        Self::with_params(
            FormatParams {
                block_size: BLOCK_SIZE,
                inodes: Some(INODES),
                endian: Endian::Little,
            },
            BLOCKS,
        )
        .await
    }

    pub async fn with_params(params: FormatParams, blocks: usize) -> Self {
        let device = MemoryBlockDevice::new(blocks * params.block_size);
        format_device(&device, &params).await.unwrap();
        Self::from_bytes(device.snapshot())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let (geometry, endian) = {
            let sb = &bytes[SUPER_OFFSET as usize..];
            let (version, endian) = detect_magic(sb).unwrap();
            let raw = RawSuperblock::decode(sb, endian);
            (Geometry::derive(&raw, version).unwrap(), endian)
        };
        Self {
            bytes,
            geometry,
            endian,
        }
    }

    pub fn device(&self) -> Arc<MemoryBlockDevice> {
        Arc::new(MemoryBlockDevice::from_bytes(self.bytes.clone()))
    }

    pub fn read_only_device(&self) -> Arc<MemoryBlockDevice> {
        Arc::new(MemoryBlockDevice::from_bytes(self.bytes.clone()).read_only())
    }

    /// Forced check with `policy`; the image takes on whatever was written
    pub async fn check(&mut self, policy: RepairPolicy) -> FsckReport {
        self.check_with(CheckOptions::with_policy(policy).force(true), &mut DeclineAll)
            .await
            .unwrap()
    }

    pub async fn check_with<C>(&mut self, options: CheckOptions, confirm: &mut C) -> Result<FsckReport>
    where
        C: Confirm + ?Sized,
    {
        let device = self.device();
        let report = Checker::new(device.clone(), options).run(confirm).await;
        self.bytes = device.snapshot();
        report
    }

    // Raw access

    pub fn block(&self, block: u64) -> &[u8] {
        let start = block as usize * self.geometry.block_size;
        &self.bytes[start..start + self.geometry.block_size]
    }

    pub fn block_mut(&mut self, block: u64) -> &mut [u8] {
        let start = block as usize * self.geometry.block_size;
        &mut self.bytes[start..start + self.geometry.block_size]
    }

    pub fn superblock(&self) -> RawSuperblock {
        RawSuperblock::decode(&self.bytes[SUPER_OFFSET as usize..], self.endian)
    }

    pub fn set_superblock(&mut self, raw: &RawSuperblock) {
        let start = SUPER_OFFSET as usize;
        raw.encode(&mut self.bytes[start..start + SUPER_DISK_SIZE], self.endian);
    }

    pub fn is_clean(&self) -> bool {
        self.superblock().flags & FLAG_CLEAN != 0
    }

    pub fn set_clean(&mut self, clean: bool) {
        let mut raw = self.superblock();
        if clean {
            raw.flags |= FLAG_CLEAN;
        } else {
            raw.flags &= !FLAG_CLEAN;
        }
        self.set_superblock(&raw);
    }

    pub fn inode(&self, inum: u32) -> DiskInode {
        let (block, offset) = self.geometry.inode_location(inum);
        DiskInode::decode(&self.block(block)[offset..], self.endian)
    }

    pub fn set_inode(&mut self, inum: u32, inode: &DiskInode) {
        let (block, offset) = self.geometry.inode_location(inum);
        let endian = self.endian;
        inode.encode(&mut self.block_mut(block)[offset..], endian);
    }

    pub fn update_inode(&mut self, inum: u32, change: impl FnOnce(&mut DiskInode)) {
        let mut inode = self.inode(inum);
        change(&mut inode);
        self.set_inode(inum, &inode);
    }

    fn bit_location(&self, kind: BitmapKind, index: usize) -> (u64, usize, u32) {
        let start = match kind {
            BitmapKind::Inode => self.geometry.imap_start(),
            BitmapKind::Zone => self.geometry.zmap_start(),
        };
        let per_block = self.geometry.block_size * 8;
        let within = index % per_block;
        (
            start + (index / per_block) as u64,
            (within / 32) * 4,
            1 << (within % 32),
        )
    }

    pub fn bit(&self, kind: BitmapKind, index: usize) -> bool {
        let (block, offset, mask) = self.bit_location(kind, index);
        self.endian.read_u32(&self.block(block)[offset..offset + 4]) & mask != 0
    }

    pub fn set_bit(&mut self, kind: BitmapKind, index: usize, set: bool) {
        let (block, offset, mask) = self.bit_location(kind, index);
        let endian = self.endian;
        let raw = &mut self.block_mut(block)[offset..offset + 4];
        let chunk = endian.read_u32(raw);
        endian.write_u32(raw, if set { chunk | mask } else { chunk & !mask });
    }

    pub fn zone_bit(&self, zone: u32) -> bool {
        self.bit(BitmapKind::Zone, self.geometry.zone_bit(zone))
    }

    pub fn set_zone_bit(&mut self, zone: u32, set: bool) {
        let bit = self.geometry.zone_bit(zone);
        self.set_bit(BitmapKind::Zone, bit, set);
    }

    // Allocation

    pub fn alloc_inode(&mut self) -> u32 {
        let inum = (2..=self.geometry.ninodes)
            .find(|&i| !self.bit(BitmapKind::Inode, i as usize))
            .expect("no free inode");
        self.set_bit(BitmapKind::Inode, inum as usize, true);
        inum
    }

    pub fn alloc_zone(&mut self) -> u32 {
        let bit = (1..=self.geometry.data_zone_count() as usize)
            .find(|&b| !self.bit(BitmapKind::Zone, b))
            .expect("no free zone");
        self.set_bit(BitmapKind::Zone, bit, true);
        let zone = self.geometry.bit_zone(bit);
        let block = self.geometry.zone_block(zone);
        self.block_mut(block).fill(0);
        zone
    }

    /// Write a fresh inode and mark it in the inode bitmap
    pub fn new_inode(&mut self, inum: u32, mode: u16, nlinks: u16) {
        let inode = DiskInode {
            mode,
            nlinks,
            uid: 0,
            gid: 0,
            size: 0,
            atime: BUILD_TIME,
            mtime: BUILD_TIME,
            ctime: BUILD_TIME,
            zones: Default::default(),
        };
        self.set_inode(inum, &inode);
        self.set_bit(BitmapKind::Inode, inum as usize, true);
    }

    fn table_entry(&self, table: u32, index: u64) -> u32 {
        let block = self.geometry.zone_block(table);
        let offset = index as usize * ZONE_NUM_SIZE;
        self.endian
            .read_u32(&self.block(block)[offset..offset + ZONE_NUM_SIZE])
    }

    pub fn set_table_entry(&mut self, table: u32, index: u64, zone: u32) {
        let block = self.geometry.zone_block(table);
        let offset = index as usize * ZONE_NUM_SIZE;
        let endian = self.endian;
        endian.write_u32(
            &mut self.block_mut(block)[offset..offset + ZONE_NUM_SIZE],
            zone,
        );
    }

    /// Point logical zone `position` of `inum` at `zone`, allocating
    /// indirect tables on the way
    pub fn map_zone(&mut self, inum: u32, position: u64, zone: u32) {
        let n = self.geometry.nindirs;
        let mut inode = self.inode(inum);
        let direct = NR_DZONES as u64;

        if position < direct {
            inode.zones[position as usize] = zone;
        } else if position < direct + n {
            if inode.zones[SINGLE_INDIRECT] == 0 {
                inode.zones[SINGLE_INDIRECT] = self.alloc_zone();
            }
            self.set_table_entry(inode.zones[SINGLE_INDIRECT], position - direct, zone);
        } else {
            let rel = position - direct - n;
            if inode.zones[DOUBLE_INDIRECT] == 0 {
                inode.zones[DOUBLE_INDIRECT] = self.alloc_zone();
            }
            let outer = inode.zones[DOUBLE_INDIRECT];
            let mut inner = self.table_entry(outer, rel / n);
            if inner == 0 {
                inner = self.alloc_zone();
                self.set_table_entry(outer, rel / n, inner);
            }
            self.set_table_entry(inner, rel % n, zone);
        }
        self.set_inode(inum, &inode);
    }

    /// Zone at logical `position` of `inum`, 0 for a hole
    pub fn zone_at(&self, inum: u32, position: u64) -> u32 {
        let n = self.geometry.nindirs;
        let inode = self.inode(inum);
        let direct = NR_DZONES as u64;

        if position < direct {
            inode.zones[position as usize]
        } else if position < direct + n {
            match inode.zones[SINGLE_INDIRECT] {
                0 => 0,
                table => self.table_entry(table, position - direct),
            }
        } else {
            let rel = position - direct - n;
            match inode.zones[DOUBLE_INDIRECT] {
                0 => 0,
                outer => match self.table_entry(outer, rel / n) {
                    0 => 0,
                    inner => self.table_entry(inner, rel % n),
                },
            }
        }
    }

    // Directories

    fn entry_offset(&self, dir: u32, slot: usize) -> (u64, usize) {
        let per_block = self.geometry.entries_per_block();
        let zone = self.zone_at(dir, (slot / per_block) as u64);
        (
            self.geometry.zone_block(zone),
            (slot % per_block) * DIR_ENTRY_SIZE,
        )
    }

    pub fn entry(&self, dir: u32, slot: usize) -> DirEntry {
        let (block, offset) = self.entry_offset(dir, slot);
        DirEntry::decode(&self.block(block)[offset..], self.endian)
    }

    pub fn set_entry(&mut self, dir: u32, slot: usize, entry: &DirEntry) {
        let (block, offset) = self.entry_offset(dir, slot);
        let endian = self.endian;
        entry.encode(&mut self.block_mut(block)[offset..], endian);
    }

    fn slots(&self, dir: u32) -> usize {
        self.inode(dir).size as usize / DIR_ENTRY_SIZE
    }

    /// Used entries of `dir` as (name, inode)
    pub fn entries(&self, dir: u32) -> Vec<(String, u32)> {
        (0..self.slots(dir))
            .map(|slot| self.entry(dir, slot))
            .filter(|entry| !entry.is_free())
            .map(|entry| (entry.display_name(), entry.inode))
            .collect()
    }

    pub fn find_entry(&self, dir: u32, name: &str) -> Option<usize> {
        (0..self.slots(dir)).find(|&slot| {
            let entry = self.entry(dir, slot);
            !entry.is_free() && entry.name_bytes() == name.as_bytes()
        })
    }

    /// Add an entry to `dir`, reusing a free slot or growing the directory
    pub fn add_entry(&mut self, dir: u32, name: &str, target: u32) {
        let entry = DirEntry::new(target, name.as_bytes());
        let slots = self.slots(dir);
        if let Some(slot) = (0..slots).find(|&slot| self.entry(dir, slot).is_free()) {
            self.set_entry(dir, slot, &entry);
            return;
        }

        let per_block = self.geometry.entries_per_block();
        if slots % per_block == 0 {
            let zone = self.alloc_zone();
            self.map_zone(dir, (slots / per_block) as u64, zone);
        }
        self.update_inode(dir, |inode| inode.size += DIR_ENTRY_SIZE as u32);
        self.set_entry(dir, slots, &entry);
    }

    /// Free the entry `name` of `dir` (the name stays), returning its inode
    pub fn remove_entry(&mut self, dir: u32, name: &str) -> u32 {
        let slot = self.find_entry(dir, name).expect("no such entry");
        let mut entry = self.entry(dir, slot);
        let target = entry.inode;
        entry.inode = 0;
        self.set_entry(dir, slot, &entry);
        target
    }

    pub fn set_entry_inode(&mut self, dir: u32, name: &str, target: u32) {
        let slot = self.find_entry(dir, name).expect("no such entry");
        let mut entry = self.entry(dir, slot);
        entry.inode = target;
        self.set_entry(dir, slot, &entry);
    }

    // Files and directories

    /// Regular file `inum` with `data_zones` zones, linked into `parent`
    pub fn add_file_at(&mut self, inum: u32, parent: u32, name: &str, data_zones: u64) -> u32 {
        self.new_inode(inum, I_REGULAR | 0o644, 1);
        for position in 0..data_zones {
            let zone = self.alloc_zone();
            self.map_zone(inum, position, zone);
        }
        let size = (data_zones * self.geometry.zone_size()) as u32;
        self.update_inode(inum, |inode| inode.size = size);
        self.add_entry(parent, name, inum);
        inum
    }

    pub fn add_file(&mut self, parent: u32, name: &str, data_zones: u64) -> u32 {
        let inum = self.alloc_inode();
        self.add_file_at(inum, parent, name, data_zones)
    }

    pub fn add_dir_at(&mut self, inum: u32, parent: u32, name: &str) -> u32 {
        self.new_inode(inum, I_DIRECTORY | 0o755, 2);
        self.add_entry(inum, ".", inum);
        self.add_entry(inum, "..", parent);
        self.add_entry(parent, name, inum);
        self.update_inode(parent, |inode| inode.nlinks += 1);
        inum
    }

    pub fn add_dir(&mut self, parent: u32, name: &str) -> u32 {
        let inum = self.alloc_inode();
        self.add_dir_at(inum, parent, name)
    }

    /// Corrupt the entry `name` of `parent` the way a faulty unlink would:
    ///
    /// 0. entry removed, link count lowered, inode left allocated
    /// 1. link count lowered, entry kept
    /// 2. entry removed, link count unchanged
    /// 3. link count raised and timestamps zeroed
    /// 4. parent timestamps zeroed
    /// 5. parent link count raised
    pub fn damage(&mut self, kind: u8, parent: u32, name: &str) {
        let slot = self.find_entry(parent, name).expect("no such entry");
        let target = self.entry(parent, slot).inode;
        match kind {
            0 => {
                self.remove_entry(parent, name);
                self.update_inode(target, |inode| inode.nlinks -= 1);
            }
            1 => self.update_inode(target, |inode| inode.nlinks -= 1),
            2 => {
                self.remove_entry(parent, name);
            }
            3 => self.update_inode(target, |inode| {
                inode.nlinks += 1;
                inode.atime = 0;
                inode.mtime = 0;
                inode.ctime = 0;
            }),
            4 => self.update_inode(parent, |inode| {
                inode.atime = 0;
                inode.mtime = 0;
                inode.ctime = 0;
            }),
            5 => self.update_inode(parent, |inode| inode.nlinks += 1),
            _ => panic!("unknown damage type {}", kind),
        }
    }
}

/// Categories of the records of a report, in report order
pub fn categories(report: &FsckReport) -> Vec<&'static str> {
    report.records.iter().map(|r| r.category).collect()
}
