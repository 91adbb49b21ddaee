//! Inode and zone allocation bitmaps
//!
//! Each bitmap exists twice during a check: the on-disk copy, loaded
//! verbatim, and the observed copy, built up by the walkers as they reach
//! inodes and zones. Comparing the two yields the bitmap defects.
//!
//! Bits are kept in 32-bit chunks decoded in the filesystem's byte order, so
//! bit `b` lives in chunk `b / 32` at position `b % 32`. Bit 0 is reserved
//! and always set.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::blockdev::BlockDeviceError;
use crate::cache::BlockCache;
use crate::format::Endian;
use crate::layout::Geometry;

const CHUNK_BITS: usize = 32;
const CHUNK_BYTES: usize = 4;

/// Error type for bitmap operations
#[derive(Error, Debug)]
pub enum BitmapError {
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("{kind} bitmap index {index} out of range (1..={count})")]
    IndexOutOfRange {
        kind: BitmapKind,
        index: usize,
        count: usize,
    },
}

/// Which resource a bitmap tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BitmapKind {
    Inode,
    Zone,
}

impl fmt::Display for BitmapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitmapKind::Inode => write!(f, "inode"),
            BitmapKind::Zone => write!(f, "zone"),
        }
    }
}

/// How an on-disk bit disagrees with the observed one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BitDefect {
    /// Set on disk, never reached: allocated but unused
    Missing,
    /// Reached by the walk, clear on disk: in use but unmarked
    Extra,
}

/// One allocation bitmap
#[derive(Debug, Clone)]
pub struct Bitmap {
    kind: BitmapKind,
    chunks: Vec<u32>,
    /// Number of tracked resources; valid bits are 1..=count
    count: usize,
    start_block: u64,
    blocks: u64,
    dirty: bool,
}

impl Bitmap {
    fn layout(geometry: &Geometry, kind: BitmapKind) -> (u64, u64, usize) {
        match kind {
            BitmapKind::Inode => (
                geometry.imap_start(),
                geometry.imap_blocks,
                geometry.ninodes as usize,
            ),
            BitmapKind::Zone => (
                geometry.zmap_start(),
                geometry.zmap_blocks,
                geometry.data_zone_count() as usize,
            ),
        }
    }

    /// An empty bitmap with only the reserved bit set, as the walkers start with
    pub fn observed(geometry: &Geometry, kind: BitmapKind) -> Self {
        let (start_block, blocks, count) = Self::layout(geometry, kind);
        let chunks_per_block = geometry.block_size / CHUNK_BYTES;
        let mut chunks = vec![0u32; blocks as usize * chunks_per_block];
        chunks[0] = 1;
        Self {
            kind,
            chunks,
            count,
            start_block,
            blocks,
            dirty: false,
        }
    }

    /// Read the on-disk bitmap of `kind`
    pub async fn load(
        cache: &BlockCache,
        geometry: &Geometry,
        endian: Endian,
        kind: BitmapKind,
    ) -> Result<Self, BitmapError> {
        let mut bitmap = Self::observed(geometry, kind);
        let chunks_per_block = geometry.block_size / CHUNK_BYTES;

        for i in 0..bitmap.blocks {
            let block = cache.block(bitmap.start_block + i).await?;
            let base = i as usize * chunks_per_block;
            for (j, raw) in block.chunks_exact(CHUNK_BYTES).enumerate() {
                bitmap.chunks[base + j] = endian.read_u32(raw);
            }
        }

        if bitmap.chunks[0] & 1 == 0 {
            log::debug!("BITMAP: reserved bit 0 of the {} bitmap was clear", kind);
            bitmap.chunks[0] |= 1;
        }

        log::debug!(
            "BITMAP: loaded {} bitmap, {} blocks, {} of {} free",
            kind,
            bitmap.blocks,
            bitmap.count_free(),
            bitmap.count
        );
        Ok(bitmap)
    }

    /// Write the bitmap blocks back through the cache
    pub async fn save(
        &mut self,
        cache: &BlockCache,
        geometry: &Geometry,
        endian: Endian,
    ) -> Result<(), BitmapError> {
        let chunks_per_block = geometry.block_size / CHUNK_BYTES;
        let mut block = vec![0u8; geometry.block_size];

        for i in 0..self.blocks {
            let base = i as usize * chunks_per_block;
            for (j, raw) in block.chunks_exact_mut(CHUNK_BYTES).enumerate() {
                endian.write_u32(raw, self.chunks[base + j]);
            }
            cache.write_block(self.start_block + i, &block).await?;
        }

        self.dirty = false;
        log::debug!("BITMAP: saved {} bitmap", self.kind);
        Ok(())
    }

    /// Number of tracked resources
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether a repair changed a bit since the last load or save
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn check_index(&self, index: usize) -> Result<(), BitmapError> {
        if index == 0 || index > self.count {
            return Err(BitmapError::IndexOutOfRange {
                kind: self.kind,
                index,
                count: self.count,
            });
        }
        Ok(())
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.chunks
            .get(index / CHUNK_BITS)
            .map_or(false, |chunk| chunk & (1 << (index % CHUNK_BITS)) != 0)
    }

    /// Set a bit, returning whether it was clear before
    pub fn mark(&mut self, index: usize) -> Result<bool, BitmapError> {
        self.check_index(index)?;
        let was_set = self.is_set(index);
        self.chunks[index / CHUNK_BITS] |= 1 << (index % CHUNK_BITS);
        Ok(!was_set)
    }

    /// Force a bit to `set`, returning whether it changed
    pub fn repair(&mut self, index: usize, set: bool) -> Result<bool, BitmapError> {
        self.check_index(index)?;
        if self.is_set(index) == set {
            return Ok(false);
        }
        let mask = 1 << (index % CHUNK_BITS);
        if set {
            self.chunks[index / CHUNK_BITS] |= mask;
        } else {
            self.chunks[index / CHUNK_BITS] &= !mask;
        }
        self.dirty = true;
        Ok(true)
    }

    /// Clear bits among the tracked resources
    pub fn count_free(&self) -> usize {
        (1..=self.count).filter(|&i| !self.is_set(i)).count()
    }
}

/// Every tracked bit on which `on_disk` and `observed` disagree, in order
pub fn diff(on_disk: &Bitmap, observed: &Bitmap) -> Vec<(usize, BitDefect)> {
    let count = on_disk.count.min(observed.count);
    let mut defects = Vec::new();

    for (c, (&disk, &seen)) in on_disk.chunks.iter().zip(&observed.chunks).enumerate() {
        let mut delta = disk ^ seen;
        if c == 0 {
            delta &= !1;
        }
        while delta != 0 {
            let bit = delta.trailing_zeros() as usize;
            delta &= delta - 1;
            let index = c * CHUNK_BITS + bit;
            if index > count {
                return defects;
            }
            let defect = if disk & (1 << bit) != 0 {
                BitDefect::Missing
            } else {
                BitDefect::Extra
            };
            defects.push((index, defect));
        }
    }
    defects
}
