use std::io;
use thiserror::Error;

use crate::bitmap::BitmapError;
use crate::blockdev::BlockDeviceError;
use crate::format::FormatError;
use crate::inode_cache::CacheError;

/// Conditions that end a check run.
///
/// Inconsistencies found on the filesystem are not errors; they are
/// [`crate::Defect`]s collected into the report.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Bad magic number 0x{0:04x}: not a MINIX V2/V3 filesystem")]
    BadMagic(u16),
    #[error("Unsupported filesystem version: V{0}")]
    UnsupportedVersion(u8),
    #[error("Filesystem uses unsupported mandatory features (flags 0x{0:04x})")]
    UnsupportedFeatures(u16),
    #[error("Invalid filesystem geometry: {0}")]
    InvalidGeometry(String),
    #[error("Root inode is not a directory")]
    RootNotDirectory,
    #[error("Inode cache exhausted: all {capacity} slots are in use")]
    CacheExhausted { capacity: usize },
    #[error("Inode {0} is out of range")]
    InodeOutOfRange(u32),
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Bitmap error: {0}")]
    Bitmap(#[from] BitmapError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Exhausted(capacity) => Error::CacheExhausted { capacity },
            CacheError::OutOfRange(inum) => Error::InodeOutOfRange(inum),
            CacheError::BlockDevice(e) => Error::BlockDevice(e),
        }
    }
}

impl From<FormatError> for Error {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::BlockDevice(e) => Error::BlockDevice(e),
            FormatError::InvalidMagic(magic) => Error::BadMagic(magic),
            FormatError::UnsupportedVersion(v) => Error::UnsupportedVersion(v),
            FormatError::TooSmall(size) => {
                Error::InvalidGeometry(format!("device of {} bytes is too small", size))
            }
            FormatError::InvalidParameter(msg) => Error::InvalidGeometry(msg),
        }
    }
}

impl Error {
    /// True for errors that mean the device does not hold a filesystem this
    /// checker can handle, as opposed to failures during the check itself.
    pub fn is_unrecognized(&self) -> bool {
        matches!(
            self,
            Error::BadMagic(_) | Error::UnsupportedVersion(_) | Error::UnsupportedFeatures(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
