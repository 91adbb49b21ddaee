//! Block device trait definitions for mfsck

use std::io;
use thiserror::Error;

/// Smallest block size a MINIX filesystem can use (and the V2 block size)
pub const MIN_BLOCK_SIZE: usize = 1024;

/// Largest block size a MINIX V3 filesystem can declare
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Access out of range: offset {offset}, length {len}, device size {size}")]
    OutOfRange { offset: u64, len: usize, size: u64 },
    #[error("Invalid block number: {0}")]
    InvalidBlockNumber(u64),
    #[error("Invalid block size: {0} (expected {1})")]
    InvalidBlockSize(usize, usize),
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Device is already closed")]
    DeviceClosed,
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Trait for byte-addressed device access.
///
/// The block size of a MINIX filesystem is only known once the superblock
/// (which sits at byte 1024, inside block 0 for large block sizes) has been
/// read, so devices are addressed by byte offset and [`crate::cache::BlockCache`]
/// layers fixed-size blocks on top.
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes starting at `offset`
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at `offset`
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Get the size of the device in bytes
    fn size(&self) -> u64;

    /// Sync any pending writes to the device
    async fn sync(&self) -> Result<()>;

    /// Close the device
    async fn close(&mut self) -> Result<()>;

    /// Check if the device is read-only
    fn is_read_only(&self) -> bool {
        false
    }

    /// Identifier used to key cached inodes
    fn device_id(&self) -> u64 {
        0
    }
}

/// Reject accesses that would run past the end of the device.
pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(BlockDeviceError::OutOfRange { offset, len, size }),
    }
}
