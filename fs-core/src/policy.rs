//! Repair policy and run options

use serde::{Deserialize, Serialize};

use crate::defect::Defect;

/// Default inode cache size, in inodes
pub const DEFAULT_INODE_CACHE: usize = 512;
/// Default block cache size, in blocks
pub const DEFAULT_BLOCK_CACHE: usize = 256;
/// Default number of bitmap defects reported per bitmap
pub const DEFAULT_REPORT_CAP: usize = 80;

/// How defects are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairPolicy {
    /// Report only, never write
    ListOnly,
    /// Ask the [`Confirm`] callback about every repairable defect
    Interactive,
    /// Apply the safe default of every defect without asking
    Automatic,
}

/// Yes/no decision for a single repair
pub trait Confirm {
    fn confirm(&mut self, defect: &Defect) -> bool;
}

impl<F> Confirm for F
where
    F: FnMut(&Defect) -> bool,
{
    fn confirm(&mut self, defect: &Defect) -> bool {
        self(defect)
    }
}

/// Answers "no" to everything, as a prompt on non-interactive input does
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclineAll;

impl Confirm for DeclineAll {
    fn confirm(&mut self, _defect: &Defect) -> bool {
        false
    }
}

/// Options of a check run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOptions {
    pub policy: RepairPolicy,
    /// Check even when the superblock says the filesystem is clean
    pub force: bool,
    /// Inode cache slots
    pub inode_cache: usize,
    /// Block cache capacity in blocks
    pub block_cache: usize,
    /// Bitmap defects listed per bitmap before the rest are summarized
    pub max_report_lines: usize,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            policy: RepairPolicy::ListOnly,
            force: false,
            inode_cache: DEFAULT_INODE_CACHE,
            block_cache: DEFAULT_BLOCK_CACHE,
            max_report_lines: DEFAULT_REPORT_CAP,
        }
    }
}

impl CheckOptions {
    pub fn with_policy(policy: RepairPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Whether the run may write to the device at all
    pub fn may_write(&self) -> bool {
        self.policy != RepairPolicy::ListOnly
    }
}
