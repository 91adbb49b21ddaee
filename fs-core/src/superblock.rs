//! Superblock loading, validation and write-back

use serde::Serialize;

use crate::blockdev::{BlockDevice, BlockDeviceError};
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::format::{
    detect_magic, Endian, RawSuperblock, Version, FLAG_CLEAN, FLAG_MANDATORY_MASK, SUPER_DISK_SIZE,
    SUPER_OFFSET,
};
use crate::layout::Geometry;

/// In-core superblock: the on-disk fields plus what was learned reading them
#[derive(Debug, Clone, Serialize)]
pub struct Superblock {
    pub raw: RawSuperblock,
    pub version: Version,
    pub endian: Endian,
    pub read_only: bool,
    pub geometry: Geometry,
}

impl Superblock {
    /// Read and validate the superblock at byte 1024 of `device`.
    ///
    /// Fails before anything else is looked at when the magic is not a
    /// supported MINIX filesystem.
    pub async fn load(device: &dyn BlockDevice) -> Result<Self> {
        if device.size() < SUPER_OFFSET + SUPER_DISK_SIZE as u64 {
            return Err(Error::InvalidGeometry(format!(
                "device of {} bytes has no room for a superblock",
                device.size()
            )));
        }

        let mut buf = [0u8; SUPER_DISK_SIZE];
        device.read_at(SUPER_OFFSET, &mut buf).await?;

        let (version, endian) = detect_magic(&buf)?;
        let raw = RawSuperblock::decode(&buf, endian);
        log::debug!(
            "SUPERBLOCK: {} filesystem, {:?}-endian, magic 0x{:04x}",
            version,
            endian,
            raw.magic
        );

        if raw.flags & FLAG_MANDATORY_MASK != 0 {
            return Err(Error::UnsupportedFeatures(raw.flags));
        }

        let geometry = Geometry::derive(&raw, version)?;
        if geometry.byte_size() > device.size() {
            return Err(Error::InvalidGeometry(format!(
                "{} zones need {} bytes but the device has {}",
                raw.zones,
                geometry.byte_size(),
                device.size()
            )));
        }

        log::info!(
            "SUPERBLOCK: {} inodes, {} zones, block size {}, first data zone {}",
            raw.ninodes,
            raw.zones,
            geometry.block_size,
            geometry.first_data_zone
        );

        Ok(Self {
            raw,
            version,
            endian,
            read_only: device.is_read_only(),
            geometry,
        })
    }

    /// True when the magic was read in little-endian order
    pub fn is_native(&self) -> bool {
        self.endian == Endian::Little
    }

    /// Whether the filesystem was last left in a consistent state
    pub fn is_clean(&self) -> bool {
        self.raw.flags & FLAG_CLEAN != 0
    }

    /// Set or clear the CLEAN flag in core; [`Superblock::save`] persists it
    pub fn mark_clean(&mut self, clean: bool) {
        if clean {
            self.raw.flags |= FLAG_CLEAN;
        } else {
            self.raw.flags &= !FLAG_CLEAN;
        }
    }

    /// Write the on-disk fields back, leaving the rest of the block untouched
    pub async fn save(&self, cache: &BlockCache) -> Result<()> {
        if self.read_only || cache.is_read_only() {
            return Err(BlockDeviceError::ReadOnly.into());
        }
        let mut buf = [0u8; SUPER_DISK_SIZE];
        self.raw.encode(&mut buf, self.endian);
        cache.write_bytes(SUPER_OFFSET, &buf).await?;
        log::debug!("SUPERBLOCK: saved (flags 0x{:04x})", self.raw.flags);
        Ok(())
    }
}
