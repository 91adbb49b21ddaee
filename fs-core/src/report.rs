//! Result of a check run

use serde::Serialize;
use std::fmt;

use crate::bitmap::BitmapKind;
use crate::context::Counters;
use crate::defect::Defect;
use crate::format::Version;
use crate::inode_cache::InodeCacheStats;
use crate::policy::CheckOptions;
use crate::superblock::Superblock;

/// What happened to a defect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Repaired,
    /// The policy or the user said no
    Declined,
    /// A repair was wanted but the device is read-only
    ReadOnly,
    /// No safe repair exists
    Unrepairable,
    /// List-only run
    Listed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Outcome::Repaired => "repaired",
            Outcome::Declined => "not repaired",
            Outcome::ReadOnly => "not repaired (read-only)",
            Outcome::Unrepairable => "cannot repair",
            Outcome::Listed => "listed",
        };
        f.write_str(text)
    }
}

/// A reported defect
#[derive(Debug, Clone, Serialize)]
pub struct DefectRecord {
    pub category: &'static str,
    pub message: String,
    pub defect: Defect,
    pub outcome: Outcome,
}

impl DefectRecord {
    pub fn new(defect: Defect, outcome: Outcome) -> Self {
        Self {
            category: defect.category(),
            message: defect.to_string(),
            defect,
            outcome,
        }
    }
}

/// Bitmap defects past the report cap: handled, but not listed one by one
#[derive(Debug, Clone, Default, Serialize)]
pub struct OmittedDefects {
    pub count: usize,
    pub repaired: usize,
}

/// Everything a run found and did
#[derive(Debug, Clone, Serialize)]
pub struct FsckReport {
    pub version: Version,
    pub block_size: usize,
    pub inodes: u32,
    /// Zones tracked by the zone bitmap
    pub data_zones: u32,
    pub options: CheckOptions,
    /// The filesystem was marked clean and was not checked
    pub skipped: bool,
    pub records: Vec<DefectRecord>,
    pub omitted_inode_bits: OmittedDefects,
    pub omitted_zone_bits: OmittedDefects,
    pub counters: Counters,
    pub inode_cache: InodeCacheStats,
    /// (hits, misses) of the block cache
    pub block_cache: (u64, u64),
    /// The CLEAN flag as left on disk
    pub marked_clean: bool,
}

impl FsckReport {
    pub(crate) fn new(superblock: &Superblock, options: &CheckOptions) -> Self {
        Self {
            version: superblock.version,
            block_size: superblock.geometry.block_size,
            inodes: superblock.geometry.ninodes,
            data_zones: superblock.geometry.data_zone_count(),
            options: options.clone(),
            skipped: false,
            records: Vec::new(),
            omitted_inode_bits: OmittedDefects::default(),
            omitted_zone_bits: OmittedDefects::default(),
            counters: Counters::default(),
            inode_cache: InodeCacheStats::default(),
            block_cache: (0, 0),
            marked_clean: superblock.is_clean(),
        }
    }

    pub fn omitted(&self, kind: BitmapKind) -> &OmittedDefects {
        match kind {
            BitmapKind::Inode => &self.omitted_inode_bits,
            BitmapKind::Zone => &self.omitted_zone_bits,
        }
    }

    pub(crate) fn omitted_mut(&mut self, kind: BitmapKind) -> &mut OmittedDefects {
        match kind {
            BitmapKind::Inode => &mut self.omitted_inode_bits,
            BitmapKind::Zone => &mut self.omitted_zone_bits,
        }
    }

    /// Defects found, listed or not
    pub fn defect_count(&self) -> usize {
        self.records.len() + self.omitted_inode_bits.count + self.omitted_zone_bits.count
    }

    pub fn repair_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.outcome == Outcome::Repaired)
            .count()
            + self.omitted_inode_bits.repaired
            + self.omitted_zone_bits.repaired
    }

    /// Defects still present on disk after the run
    pub fn unrepaired_count(&self) -> usize {
        self.defect_count() - self.repair_count()
    }

    pub fn is_clean(&self) -> bool {
        self.defect_count() == 0
    }

    /// Records of one category
    pub fn of_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a DefectRecord> {
        self.records.iter().filter(move |r| r.category == category)
    }

    /// One line per listed defect, plus a line per bitmap for the rest
    pub fn defect_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .records
            .iter()
            .map(|r| format!("{} ({})", r.message, r.outcome))
            .collect();
        for kind in [BitmapKind::Inode, BitmapKind::Zone] {
            let omitted = self.omitted(kind);
            if omitted.count > 0 {
                lines.push(format!(
                    "... {} more {} bitmap defects ({} repaired)",
                    omitted.count, kind, omitted.repaired
                ));
            }
        }
        lines
    }

    /// Totals in the traditional fsck layout
    pub fn summary_lines(&self) -> Vec<String> {
        let c = &self.counters;
        let used_inodes = (self.inodes as u64).saturating_sub(c.free_inodes);
        let used_zones = (self.data_zones as u64).saturating_sub(c.free_zones);
        vec![
            format!("{:9} inodes used ({} free)", used_inodes, c.free_inodes),
            format!("{:9} zones used ({} free)", used_zones, c.free_zones),
            format!("{:9} regular files", c.regular),
            format!("{:9} directories", c.directories),
            format!("{:9} block special files", c.block_special),
            format!("{:9} character special files", c.char_special),
            format!("{:9} named pipes", c.pipes),
            format!("{:9} symbolic links", c.symlinks),
            format!("{:9} sockets", c.sockets),
            format!("{:9} bad inodes", c.bad),
            format!("{:9} data zones", c.zones_by_level[0]),
            format!("{:9} single indirect zones", c.zones_by_level[1]),
            format!("{:9} double indirect zones", c.zones_by_level[2]),
        ]
    }
}
