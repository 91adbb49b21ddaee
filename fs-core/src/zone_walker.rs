//! Walk of one inode's zone tree
//!
//! [`ZoneWalker`] yields every non-zero zone pointer of an inode, depth first
//! and in logical order: the seven direct zones, then the single-indirect
//! table followed by its children, then the double-indirect table, each of its
//! level-1 tables and their children. Each yielded zone is claimed in
//! [`ZoneClaims`], and a table is only read when its claim succeeds.

use serde::Serialize;

use crate::bitmap::{Bitmap, BitmapError, BitmapKind};
use crate::cache::BlockCache;
use crate::error::Result;
use crate::format::{
    DiskInode, Endian, DOUBLE_INDIRECT, NR_DZONES, SINGLE_INDIRECT, TRIPLE_INDIRECT, ZONE_NUM_SIZE,
};
use crate::layout::Geometry;

/// Where a zone pointer is stored, so it can be cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ZoneSlot {
    /// Index into the inode's zone array
    Inode(usize),
    /// Entry of an indirect block
    Indirect { block: u64, index: usize },
}

/// A zone pointer found in an inode's tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZoneRef {
    pub zone: u32,
    /// Logical zone index in the file where this zone's coverage starts
    pub position: u64,
    /// Height in the tree: 0 data, 1 single-indirect table, 2 double-indirect table
    pub level: u8,
    pub slot: ZoneSlot,
}

/// Result of claiming a zone for an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClaimOutcome {
    /// First claim; the zone is now marked in use
    Claimed,
    /// Already claimed; the first claim stands
    Duplicate { first_owner: u32 },
    /// Outside the data zone area; not marked
    OutOfRange,
    /// A triple-indirect pointer, which the format does not use; not marked
    TooDeep,
}

/// One step of a zone walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneVisit {
    pub zone: ZoneRef,
    pub outcome: ClaimOutcome,
}

/// Observed zone bitmap plus the inode that first claimed each zone
#[derive(Debug)]
pub struct ZoneClaims {
    observed: Bitmap,
    owners: Vec<u32>,
}

impl ZoneClaims {
    pub fn new(geometry: &Geometry) -> Self {
        Self {
            observed: Bitmap::observed(geometry, BitmapKind::Zone),
            owners: vec![0; geometry.data_zone_count() as usize + 1],
        }
    }

    /// Claim `zone` for inode `inum`
    pub fn claim(
        &mut self,
        geometry: &Geometry,
        zone: u32,
        inum: u32,
    ) -> std::result::Result<ClaimOutcome, BitmapError> {
        if !geometry.zone_in_range(zone) {
            return Ok(ClaimOutcome::OutOfRange);
        }
        let bit = geometry.zone_bit(zone);
        match self.owners[bit] {
            0 => {
                self.owners[bit] = inum;
                self.observed.mark(bit)?;
                Ok(ClaimOutcome::Claimed)
            }
            first_owner => Ok(ClaimOutcome::Duplicate { first_owner }),
        }
    }

    /// Inode that claimed `zone`, if any
    pub fn owner(&self, geometry: &Geometry, zone: u32) -> Option<u32> {
        if !geometry.zone_in_range(zone) {
            return None;
        }
        match self.owners[geometry.zone_bit(zone)] {
            0 => None,
            inum => Some(inum),
        }
    }

    pub fn observed(&self) -> &Bitmap {
        &self.observed
    }
}

/// Single forward pass over the zone tree of one inode
pub struct ZoneWalker {
    inum: u32,
    geometry: Geometry,
    endian: Endian,
    stack: Vec<ZoneRef>,
    data_zones: u64,
}

impl ZoneWalker {
    pub fn new(inum: u32, inode: &DiskInode, geometry: &Geometry, endian: Endian) -> Self {
        let n = geometry.nindirs;
        let mut stack = Vec::with_capacity(16);

        let top = [
            (TRIPLE_INDIRECT, 3u8, NR_DZONES as u64 + n + n * n),
            (DOUBLE_INDIRECT, 2, NR_DZONES as u64 + n),
            (SINGLE_INDIRECT, 1, NR_DZONES as u64),
        ];
        for (index, level, position) in top {
            if inode.zones[index] != 0 {
                stack.push(ZoneRef {
                    zone: inode.zones[index],
                    position,
                    level,
                    slot: ZoneSlot::Inode(index),
                });
            }
        }
        for index in (0..NR_DZONES).rev() {
            if inode.zones[index] != 0 {
                stack.push(ZoneRef {
                    zone: inode.zones[index],
                    position: index as u64,
                    level: 0,
                    slot: ZoneSlot::Inode(index),
                });
            }
        }

        Self {
            inum,
            geometry: *geometry,
            endian,
            stack,
            data_zones: 0,
        }
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    /// Data zone pointers yielded so far
    pub fn data_zones(&self) -> u64 {
        self.data_zones
    }

    /// Yield the next zone, or `None` once the tree is exhausted
    pub async fn next(
        &mut self,
        cache: &BlockCache,
        claims: &mut ZoneClaims,
    ) -> Result<Option<ZoneVisit>> {
        let zone = match self.stack.pop() {
            Some(zone) => zone,
            None => return Ok(None),
        };

        if zone.level > 2 {
            return Ok(Some(ZoneVisit {
                zone,
                outcome: ClaimOutcome::TooDeep,
            }));
        }

        let outcome = claims.claim(&self.geometry, zone.zone, self.inum)?;
        if zone.level == 0 {
            self.data_zones += 1;
        } else if outcome == ClaimOutcome::Claimed {
            self.push_children(cache, &zone).await?;
        }

        Ok(Some(ZoneVisit { zone, outcome }))
    }

    async fn push_children(&mut self, cache: &BlockCache, table: &ZoneRef) -> Result<()> {
        let block = self.geometry.zone_block(table.zone);
        let data = cache.block(block).await?;
        let span = self.geometry.nindirs.pow(u32::from(table.level) - 1);

        for (index, raw) in data.chunks_exact(ZONE_NUM_SIZE).enumerate().rev() {
            let child = self.endian.read_u32(raw);
            if child == 0 {
                continue;
            }
            self.stack.push(ZoneRef {
                zone: child,
                position: table.position + index as u64 * span,
                level: table.level - 1,
                slot: ZoneSlot::Indirect { block, index },
            });
        }
        Ok(())
    }
}
