//! mfsck core - offline consistency checker for MINIX V2/V3 filesystems
//!
//! This crate reads a MINIX filesystem image through a [`BlockDevice`],
//! walks its directory tree and zone trees, compares what it reached against
//! the on-disk bitmaps and link counts, and repairs what the chosen
//! [`RepairPolicy`] allows. [`Checker::run`] drives a whole check and returns
//! an [`FsckReport`].

#![warn(rust_2018_idioms)]

pub mod bitmap;
pub mod blockdev;
pub mod cache;
pub mod context;
pub mod defect;
pub mod dir_walker;
pub mod engine;
pub mod error;
pub mod format;
pub mod inode_cache;
pub mod layout;
pub mod link_count;
pub mod policy;
pub mod report;
pub mod superblock;
pub mod zone_walker;

pub use blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice, MemoryBlockDevice};
pub use defect::{Defect, EntryLocation};
pub use engine::Checker;
pub use error::{Error, Result};
pub use format::{format_device, FormatParams, FormatSummary, Version};
pub use policy::{CheckOptions, Confirm, DeclineAll, RepairPolicy};
pub use report::{DefectRecord, FsckReport, Outcome};
pub use superblock::Superblock;

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::BlockDevice;
    pub use crate::engine::Checker;
    pub use crate::error::Result;
    pub use crate::policy::{CheckOptions, Confirm, RepairPolicy};
}
