//! Inconsistencies a check can find
//!
//! A [`Defect`] is never an error: the engine records each one with the
//! outcome of its repair and moves on.

use serde::Serialize;
use std::fmt;

use crate::bitmap::{BitDefect, BitmapKind};
use crate::zone_walker::ZoneSlot;

/// Where a directory entry lives, so it can be rewritten or removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryLocation {
    /// Directory holding the entry
    pub dir: u32,
    /// Filesystem block holding the entry
    pub block: u64,
    /// Entry index within the block
    pub index: usize,
}

/// One inconsistency between on-disk metadata and what the walk observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum Defect {
    /// A bitmap bit disagrees with reachability. `number` is the inode or
    /// zone number.
    BitmapMismatch {
        map: BitmapKind,
        number: u32,
        bit: usize,
        defect: BitDefect,
    },
    /// Stored link count differs from the number of entries naming the inode
    LinkCountMismatch {
        inode: u32,
        stored: u16,
        counted: u32,
    },
    /// Allocated in the inode bitmap, non-zero mode, never reached
    OrphanInode { inode: u32, mode: u16 },
    /// Bit clear (after bitmap repair) but the inode still has a mode
    UnclearedFreeInode { inode: u32, mode: u16 },
    /// A zone claimed by two inodes; the first claim stands
    ZoneDoubleAllocation {
        zone: u32,
        first_owner: u32,
        second_owner: u32,
    },
    /// A zone pointer outside the data zone area
    ZoneOutOfRange {
        inode: u32,
        zone: u32,
        position: u64,
        slot: ZoneSlot,
    },
    /// More data zones than the file size needs
    ZoneCountExceedsSize {
        inode: u32,
        zones: u64,
        size: u32,
    },
    /// A non-zero triple-indirect pointer
    IndirectionTooDeep { inode: u32, zone: u32 },
    /// A device inode with zone pointers besides the device number
    SpecialFileZones { inode: u32 },
    /// Mode with an unknown file type
    BadInodeMode { inode: u32, mode: u16 },
    /// atime, mtime and ctime all zero
    ZeroedTimestamps { inode: u32 },
    /// `.` missing, pointing elsewhere, or repeated
    DotEntryMismatch {
        dir: u32,
        found: Option<u32>,
        duplicate: bool,
        at: Option<EntryLocation>,
    },
    /// `..` missing, not naming the parent, or repeated
    DotDotEntryMismatch {
        dir: u32,
        expected: u32,
        found: Option<u32>,
        duplicate: bool,
        at: Option<EntryLocation>,
    },
    /// An entry naming a directory that is an ancestor of its own directory
    DirectoryCycle {
        name: String,
        target: u32,
        at: EntryLocation,
    },
    /// A second entry naming a directory reached elsewhere
    UnexpectedHardLinkOnDirectory {
        name: String,
        target: u32,
        at: EntryLocation,
    },
    /// An entry naming an inode past the inode count
    EntryInodeOutOfRange {
        name: String,
        target: u32,
        at: EntryLocation,
    },
    /// An entry naming a free inode
    EntryToFreeInode {
        name: String,
        target: u32,
        at: EntryLocation,
    },
    /// An empty name or one containing `/`
    InvalidEntryName {
        name: String,
        target: u32,
        at: EntryLocation,
    },
}

/// A defect as found during the walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub defect: Defect,
    /// Inode whose link tally counts the offending entry; removing or
    /// rewriting the entry takes that reference back
    pub tallied: Option<u32>,
}

impl From<Defect> for Finding {
    fn from(defect: Defect) -> Self {
        Self {
            defect,
            tallied: None,
        }
    }
}

impl Defect {
    /// Short category name, as used in the JSON report
    pub fn category(&self) -> &'static str {
        match self {
            Defect::BitmapMismatch { .. } => "BitmapMismatch",
            Defect::LinkCountMismatch { .. } => "LinkCountMismatch",
            Defect::OrphanInode { .. } => "OrphanInode",
            Defect::UnclearedFreeInode { .. } => "UnclearedFreeInode",
            Defect::ZoneDoubleAllocation { .. } => "ZoneDoubleAllocation",
            Defect::ZoneOutOfRange { .. } => "ZoneOutOfRange",
            Defect::ZoneCountExceedsSize { .. } => "ZoneCountExceedsSize",
            Defect::IndirectionTooDeep { .. } => "IndirectionTooDeep",
            Defect::SpecialFileZones { .. } => "SpecialFileZones",
            Defect::BadInodeMode { .. } => "BadInodeMode",
            Defect::ZeroedTimestamps { .. } => "ZeroedTimestamps",
            Defect::DotEntryMismatch { .. } => "DotEntryMismatch",
            Defect::DotDotEntryMismatch { .. } => "DotDotEntryMismatch",
            Defect::DirectoryCycle { .. } => "DirectoryCycle",
            Defect::UnexpectedHardLinkOnDirectory { .. } => "UnexpectedHardLinkOnDirectory",
            Defect::EntryInodeOutOfRange { .. } => "EntryInodeOutOfRange",
            Defect::EntryToFreeInode { .. } => "EntryToFreeInode",
            Defect::InvalidEntryName { .. } => "InvalidEntryName",
        }
    }

    /// What answering "yes" does, or `None` when there is no safe repair
    pub fn resolution(&self) -> Option<&'static str> {
        match self {
            Defect::BitmapMismatch {
                defect: BitDefect::Missing,
                ..
            } => Some("clear bit"),
            Defect::BitmapMismatch {
                defect: BitDefect::Extra,
                ..
            } => Some("set bit"),
            // A reached inode with no readable entry naming it is never freed
            Defect::LinkCountMismatch { counted: 0, .. } => None,
            Defect::LinkCountMismatch { .. } => Some("fix link count"),
            Defect::OrphanInode { .. } | Defect::UnclearedFreeInode { .. } => Some("free inode"),
            Defect::ZoneOutOfRange { .. } | Defect::IndirectionTooDeep { .. } => {
                Some("clear zone pointer")
            }
            Defect::SpecialFileZones { .. } => Some("clear zones"),
            Defect::ZeroedTimestamps { .. } => Some("set timestamps"),
            Defect::DotEntryMismatch {
                duplicate: true, ..
            }
            | Defect::DotDotEntryMismatch {
                duplicate: true, ..
            } => Some("remove entry"),
            // A missing entry carries the free slot it can be written to
            Defect::DotEntryMismatch {
                found: None,
                at: Some(_),
                ..
            }
            | Defect::DotDotEntryMismatch {
                found: None,
                at: Some(_),
                ..
            } => Some("add entry"),
            Defect::DotEntryMismatch { found: None, .. }
            | Defect::DotDotEntryMismatch { found: None, .. } => None,
            Defect::DotEntryMismatch { .. } | Defect::DotDotEntryMismatch { .. } => {
                Some("fix entry")
            }
            Defect::DirectoryCycle { .. }
            | Defect::UnexpectedHardLinkOnDirectory { .. }
            | Defect::EntryInodeOutOfRange { .. }
            | Defect::EntryToFreeInode { .. } => Some("remove entry"),
            Defect::InvalidEntryName { .. } => Some("rename entry"),
            Defect::ZoneDoubleAllocation { .. }
            | Defect::ZoneCountExceedsSize { .. }
            | Defect::BadInodeMode { .. } => None,
        }
    }

    /// Answer used in automatic mode
    pub fn automatic_default(&self) -> bool {
        self.resolution().is_some()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Defect::BitmapMismatch {
                map, number, defect, ..
            } => match defect {
                BitDefect::Missing => {
                    write!(f, "{} {} is marked in use but unreachable", map, number)
                }
                BitDefect::Extra => {
                    write!(f, "{} {} is in use but not marked in the bitmap", map, number)
                }
            },
            Defect::LinkCountMismatch {
                inode,
                stored,
                counted,
            } => write!(
                f,
                "inode {} has link count {}, should be {}",
                inode, stored, counted
            ),
            Defect::OrphanInode { inode, mode } => write!(
                f,
                "inode {} (mode 0{:o}) is allocated but not in any directory",
                inode, mode
            ),
            Defect::UnclearedFreeInode { inode, mode } => {
                write!(f, "free inode {} has mode 0{:o}", inode, mode)
            }
            Defect::ZoneDoubleAllocation {
                zone,
                first_owner,
                second_owner,
            } => write!(
                f,
                "zone {} of inode {} is also claimed by inode {}",
                zone, second_owner, first_owner
            ),
            Defect::ZoneOutOfRange {
                inode,
                zone,
                position,
                ..
            } => write!(
                f,
                "inode {} zone {} at position {} is out of range",
                inode, zone, position
            ),
            Defect::ZoneCountExceedsSize { inode, zones, size } => write!(
                f,
                "inode {} has {} data zones but a size of {} bytes",
                inode, zones, size
            ),
            Defect::IndirectionTooDeep { inode, zone } => write!(
                f,
                "inode {} has a triple indirect zone {}",
                inode, zone
            ),
            Defect::SpecialFileZones { inode } => {
                write!(f, "special file inode {} has data zones", inode)
            }
            Defect::BadInodeMode { inode, mode } => {
                write!(f, "inode {} has bad mode 0{:o}", inode, mode)
            }
            Defect::ZeroedTimestamps { inode } => {
                write!(f, "inode {} has all timestamps zero", inode)
            }
            Defect::DotEntryMismatch {
                dir,
                found,
                duplicate,
                ..
            } => match (found, duplicate) {
                (_, true) => write!(f, "directory {} has more than one '.' entry", dir),
                (None, _) => write!(f, "directory {} has no '.' entry", dir),
                (Some(found), _) => write!(f, "directory {} has '.' pointing to {}", dir, found),
            },
            Defect::DotDotEntryMismatch {
                dir,
                expected,
                found,
                duplicate,
                ..
            } => match (found, duplicate) {
                (_, true) => write!(f, "directory {} has more than one '..' entry", dir),
                (None, _) => write!(f, "directory {} has no '..' entry", dir),
                (Some(found), _) => write!(
                    f,
                    "directory {} has '..' pointing to {} instead of {}",
                    dir, found, expected
                ),
            },
            Defect::DirectoryCycle { name, target, at } => write!(
                f,
                "entry '{}' in directory {} loops back to ancestor {}",
                name, at.dir, target
            ),
            Defect::UnexpectedHardLinkOnDirectory { name, target, at } => write!(
                f,
                "entry '{}' in directory {} is a second link to directory {}",
                name, at.dir, target
            ),
            Defect::EntryInodeOutOfRange { name, target, at } => write!(
                f,
                "entry '{}' in directory {} has out of range inode {}",
                name, at.dir, target
            ),
            Defect::EntryToFreeInode { name, target, at } => write!(
                f,
                "entry '{}' in directory {} points to free inode {}",
                name, at.dir, target
            ),
            Defect::InvalidEntryName { name, target, at } => write!(
                f,
                "entry '{}' (inode {}) in directory {} has an invalid name",
                name, target, at.dir
            ),
        }
    }
}
