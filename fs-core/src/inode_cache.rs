//! Fixed-capacity in-core inode table
//!
//! Inodes are held in a slot arena indexed by `(device, inode number)`.
//! [`InodeCache::get`] pins a slot and [`InodeCache::put`] releases it; a slot
//! whose count drops to zero joins the free list and is reused, least
//! recently freed first, when a miss needs room. Modified inodes are not
//! written immediately: a dirty slot that gets reused is parked in a pending
//! table, and [`InodeCache::flush`] writes everything in one pass.

use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::blockdev::BlockDeviceError;
use crate::cache::BlockCache;
use crate::format::{DiskInode, Endian};
use crate::layout::Geometry;

/// Error type for inode cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("All {0} inode slots are in use")]
    Exhausted(usize),
    #[error("Inode {0} is out of range")]
    OutOfRange(u32),
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
}

/// A pinned inode. Only [`InodeCache::get`] and [`InodeCache::dup`] make
/// one, and [`InodeCache::put`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct InodeHandle {
    slot: usize,
    inum: u32,
}

impl InodeHandle {
    pub fn inum(&self) -> u32 {
        self.inum
    }
}

#[derive(Debug, Default)]
struct Slot {
    dev: u64,
    /// 0 while the slot has never been used
    inum: u32,
    inode: DiskInode,
    count: u32,
    dirty: bool,
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InodeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub parked: u64,
    pub written: u64,
}

pub struct InodeCache {
    slots: Vec<Slot>,
    index: HashMap<(u64, u32), usize>,
    /// Unpinned slots, least recently freed first
    free: LruCache<usize, ()>,
    /// Dirty inodes whose slot was reused before the final flush
    pending: HashMap<(u64, u32), DiskInode>,
    geometry: Geometry,
    endian: Endian,
    stats: InodeCacheStats,
}

/// Read inode `inum` straight from the inode table
pub async fn read_inode(
    cache: &BlockCache,
    geometry: &Geometry,
    endian: Endian,
    inum: u32,
) -> Result<DiskInode, CacheError> {
    if inum == 0 || inum > geometry.ninodes {
        return Err(CacheError::OutOfRange(inum));
    }
    let (block, offset) = geometry.inode_location(inum);
    let data = cache.block(block).await?;
    Ok(DiskInode::decode(&data[offset..], endian))
}

/// Write inode `inum` into its inode-table block
pub async fn write_inode(
    cache: &BlockCache,
    geometry: &Geometry,
    endian: Endian,
    inum: u32,
    inode: &DiskInode,
) -> Result<(), CacheError> {
    if inum == 0 || inum > geometry.ninodes {
        return Err(CacheError::OutOfRange(inum));
    }
    let (block, offset) = geometry.inode_location(inum);
    let mut data = cache.block(block).await?;
    inode.encode(&mut data[offset..], endian);
    cache.write_block(block, &data).await?;
    Ok(())
}

impl InodeCache {
    /// Create a cache of `capacity` slots (at least one)
    pub fn new(capacity: usize, geometry: Geometry, endian: Endian) -> Self {
        let capacity = capacity.max(1);
        let mut free = LruCache::unbounded();
        for slot in 0..capacity {
            free.push(slot, ());
        }
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            index: HashMap::with_capacity(capacity),
            free,
            pending: HashMap::new(),
            geometry,
            endian,
            stats: InodeCacheStats::default(),
        }
    }

    pub fn stats(&self) -> InodeCacheStats {
        self.stats
    }

    /// Slots currently pinned
    pub fn pinned(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Pin inode `inum` of device `dev`, loading it on a miss
    pub async fn get(
        &mut self,
        cache: &BlockCache,
        dev: u64,
        inum: u32,
    ) -> Result<InodeHandle, CacheError> {
        if inum == 0 || inum > self.geometry.ninodes {
            return Err(CacheError::OutOfRange(inum));
        }

        if let Some(&slot) = self.index.get(&(dev, inum)) {
            if self.slots[slot].count == 0 {
                self.free.pop(&slot);
            }
            self.slots[slot].count += 1;
            self.stats.hits += 1;
            return Ok(InodeHandle { slot, inum });
        }

        let (slot, _) = self
            .free
            .pop_lru()
            .ok_or(CacheError::Exhausted(self.slots.len()))?;
        self.stats.misses += 1;

        let old = std::mem::take(&mut self.slots[slot]);
        if old.inum != 0 {
            self.index.remove(&(old.dev, old.inum));
            self.stats.evictions += 1;
            if old.dirty {
                log::debug!("INODE_CACHE: parking dirty inode {}", old.inum);
                self.pending.insert((old.dev, old.inum), old.inode);
                self.stats.parked += 1;
            }
        }

        let (inode, dirty) = match self.pending.remove(&(dev, inum)) {
            Some(parked) => (parked, true),
            None => match read_inode(cache, &self.geometry, self.endian, inum).await {
                Ok(inode) => (inode, false),
                Err(e) => {
                    // The slot stays usable
                    self.free.push(slot, ());
                    return Err(e);
                }
            },
        };

        self.slots[slot] = Slot {
            dev,
            inum,
            inode,
            count: 1,
            dirty,
        };
        self.index.insert((dev, inum), slot);
        Ok(InodeHandle { slot, inum })
    }

    /// Pin an already pinned inode once more
    pub fn dup(&mut self, handle: &InodeHandle) -> InodeHandle {
        self.slots[handle.slot].count += 1;
        InodeHandle {
            slot: handle.slot,
            inum: handle.inum,
        }
    }

    /// Release a pin; the last release makes the slot reusable
    pub fn put(&mut self, handle: InodeHandle) {
        let slot = &mut self.slots[handle.slot];
        slot.count = slot.count.saturating_sub(1);
        if slot.count == 0 {
            self.free.push(handle.slot, ());
        }
    }

    pub fn inode(&self, handle: &InodeHandle) -> &DiskInode {
        &self.slots[handle.slot].inode
    }

    /// Mutable access; the inode is marked dirty
    pub fn inode_mut(&mut self, handle: &InodeHandle) -> &mut DiskInode {
        let slot = &mut self.slots[handle.slot];
        slot.dirty = true;
        &mut slot.inode
    }

    /// Inodes waiting to be written
    pub fn dirty_count(&self) -> usize {
        self.slots.iter().filter(|s| s.dirty).count() + self.pending.len()
    }

    /// Write every dirty and parked inode, in inode-number order
    pub async fn flush(&mut self, cache: &BlockCache) -> Result<usize, CacheError> {
        let mut batch: Vec<(u32, DiskInode)> = self.pending.drain().map(|((_, i), n)| (i, n)).collect();
        for slot in self.slots.iter_mut().filter(|s| s.dirty) {
            batch.push((slot.inum, slot.inode.clone()));
            slot.dirty = false;
        }
        batch.sort_by_key(|(inum, _)| *inum);

        for (inum, inode) in &batch {
            write_inode(cache, &self.geometry, self.endian, *inum, inode).await?;
        }
        self.stats.written += batch.len() as u64;

        if !batch.is_empty() {
            log::debug!("INODE_CACHE: wrote {} inodes", batch.len());
        }
        Ok(batch.len())
    }
}
