//! Check driver
//!
//! [`Checker::run`] takes a filesystem through the phases of a check in a
//! fixed order: superblock, directory walk, the repairs the walk asks for,
//! link counts and orphans, both bitmap diffs, the free-inode sweep and
//! finally the write-back. Discovery is finished before the first repair
//! decision is made, and every write goes through the block cache so nothing
//! reaches the device before the final flush.

use chrono::Utc;
use std::sync::Arc;

use crate::bitmap::{self, BitDefect, BitmapKind};
use crate::blockdev::BlockDevice;
use crate::context::CheckContext;
use crate::defect::{Defect, EntryLocation, Finding};
use crate::dir_walker;
use crate::error::Result;
use crate::format::{DirEntry, DiskInode, DIR_ENTRY_SIZE, TRIPLE_INDIRECT, ZONE_NUM_SIZE};
use crate::link_count::{free_inode, link_count_findings, orphan_findings, uncleared_findings};
use crate::policy::{CheckOptions, Confirm, RepairPolicy};
use crate::report::{DefectRecord, FsckReport, Outcome};
use crate::superblock::Superblock;
use crate::zone_walker::ZoneSlot;

/// Checks one device with a fixed set of options
pub struct Checker {
    device: Arc<dyn BlockDevice>,
    options: CheckOptions,
}

impl Checker {
    pub fn new(device: Arc<dyn BlockDevice>, options: CheckOptions) -> Self {
        Self { device, options }
    }

    pub fn options(&self) -> &CheckOptions {
        &self.options
    }

    /// Check the filesystem, repairing what the policy and `confirm` allow.
    ///
    /// Defects never fail the run; they are returned in the report. Errors
    /// are reserved for an unusable superblock, I/O failures, inode cache
    /// exhaustion and a root inode that is not a directory.
    pub async fn run<C>(&self, confirm: &mut C) -> Result<FsckReport>
    where
        C: Confirm + ?Sized,
    {
        let superblock = Superblock::load(self.device.as_ref()).await?;
        let mut report = FsckReport::new(&superblock, &self.options);

        if superblock.is_clean()
            && !self.options.force
            && self.options.policy == RepairPolicy::Automatic
        {
            log::info!("FSCK: filesystem is marked clean, not checking");
            report.skipped = true;
            return Ok(report);
        }

        log::info!(
            "FSCK: checking {} filesystem ({:?} policy{})",
            superblock.version,
            self.options.policy,
            if superblock.read_only { ", read-only" } else { "" }
        );

        let ctx = CheckContext::open(self.device.clone(), superblock, &self.options).await?;
        let mut run = Run {
            ctx,
            options: &self.options,
            confirm,
            report,
        };
        run.check().await?;
        run.finish().await
    }
}

enum Verdict {
    Apply,
    Leave(Outcome),
}

/// A check in progress
struct Run<'a, C: ?Sized> {
    ctx: CheckContext,
    options: &'a CheckOptions,
    confirm: &'a mut C,
    report: FsckReport,
}

impl<'a, C> Run<'a, C>
where
    C: Confirm + ?Sized,
{
    async fn check(&mut self) -> Result<()> {
        log::info!("FSCK: walking the directory tree");
        for finding in dir_walker::walk(&mut self.ctx).await? {
            self.handle(finding).await?;
        }

        log::info!("FSCK: checking link counts");
        for finding in link_count_findings(&mut self.ctx).await? {
            self.handle(finding).await?;
        }
        for finding in orphan_findings(&mut self.ctx).await? {
            self.handle(finding).await?;
        }

        log::info!("FSCK: checking bitmaps");
        self.check_bitmap(BitmapKind::Inode).await?;
        self.check_bitmap(BitmapKind::Zone).await?;

        for finding in uncleared_findings(&mut self.ctx).await? {
            self.handle(finding).await?;
        }
        Ok(())
    }

    fn record(&mut self, defect: Defect, outcome: Outcome) {
        log::warn!("{} ({})", defect, outcome);
        self.report.records.push(DefectRecord::new(defect, outcome));
    }

    async fn handle(&mut self, finding: Finding) -> Result<()> {
        let outcome = self.resolve(&finding, None).await?;
        self.record(finding.defect, outcome);
        Ok(())
    }

    /// Decide on a defect and apply the repair if the answer is yes.
    /// `remembered` stands in for asking, in interactive mode.
    async fn resolve(&mut self, finding: &Finding, remembered: Option<bool>) -> Result<Outcome> {
        match self.decide(&finding.defect, remembered) {
            Verdict::Leave(outcome) => Ok(outcome),
            Verdict::Apply => {
                if self.apply(finding).await? {
                    Ok(Outcome::Repaired)
                } else {
                    Ok(Outcome::Unrepairable)
                }
            }
        }
    }

    fn decide(&mut self, defect: &Defect, remembered: Option<bool>) -> Verdict {
        if defect.resolution().is_none() {
            return Verdict::Leave(Outcome::Unrepairable);
        }
        match self.options.policy {
            RepairPolicy::ListOnly => Verdict::Leave(Outcome::Listed),
            _ if self.ctx.superblock.read_only => Verdict::Leave(Outcome::ReadOnly),
            RepairPolicy::Interactive => {
                let yes = match remembered {
                    Some(answer) => answer,
                    None => self.confirm.confirm(defect),
                };
                if yes {
                    Verdict::Apply
                } else {
                    Verdict::Leave(Outcome::Declined)
                }
            }
            RepairPolicy::Automatic => Verdict::Apply,
        }
    }

    /// Diff one on-disk bitmap against what the walk observed. Past the
    /// report cap defects are only counted, and in interactive mode they
    /// take the last answer given for this bitmap.
    async fn check_bitmap(&mut self, kind: BitmapKind) -> Result<()> {
        let defects = match kind {
            BitmapKind::Inode => bitmap::diff(&self.ctx.imap, &self.ctx.reached),
            BitmapKind::Zone => bitmap::diff(&self.ctx.zmap, self.ctx.claims.observed()),
        };
        log::debug!("FSCK: {} {} bitmap differences", defects.len(), kind);

        let mut last_answer = None;
        for (shown, (bit, defect)) in defects.into_iter().enumerate() {
            let number = match kind {
                BitmapKind::Inode => bit as u32,
                BitmapKind::Zone => self.ctx.geometry.bit_zone(bit),
            };
            let finding = Finding::from(Defect::BitmapMismatch {
                map: kind,
                number,
                bit,
                defect,
            });

            let listed = shown < self.options.max_report_lines;
            let remembered = if listed { None } else { last_answer };
            let outcome = self.resolve(&finding, remembered).await?;
            match outcome {
                Outcome::Repaired => last_answer = Some(true),
                Outcome::Declined => last_answer = Some(false),
                _ => {}
            }

            if listed {
                self.record(finding.defect, outcome);
            } else {
                log::debug!("{} ({})", finding.defect, outcome);
                let omitted = self.report.omitted_mut(kind);
                omitted.count += 1;
                if outcome == Outcome::Repaired {
                    omitted.repaired += 1;
                }
            }
        }

        let omitted = self.report.omitted(kind);
        if omitted.count > 0 {
            log::warn!(
                "{} more {} bitmap defects ({} repaired)",
                omitted.count,
                kind,
                omitted.repaired
            );
        }
        Ok(())
    }

    /// Apply the repair of one defect. Returns false when it turned out
    /// not to be possible.
    async fn apply(&mut self, finding: &Finding) -> Result<bool> {
        match &finding.defect {
            Defect::BitmapMismatch {
                map, bit, defect, ..
            } => {
                let set = *defect == BitDefect::Extra;
                let bitmap = match map {
                    BitmapKind::Inode => &mut self.ctx.imap,
                    BitmapKind::Zone => &mut self.ctx.zmap,
                };
                bitmap.repair(*bit, set)?;
            }
            Defect::LinkCountMismatch { counted: 0, .. } => return Ok(false),
            Defect::LinkCountMismatch { inode, counted, .. } => {
                let nlinks = match u16::try_from(*counted) {
                    Ok(nlinks) => nlinks,
                    Err(_) => return Ok(false),
                };
                self.ctx
                    .update_inode(*inode, |disk| disk.nlinks = nlinks)
                    .await?;
            }
            Defect::OrphanInode { inode, .. } => {
                free_inode(&mut self.ctx, *inode).await?;
            }
            Defect::UnclearedFreeInode { inode, .. } => {
                self.ctx
                    .update_inode(*inode, |disk| *disk = DiskInode::default())
                    .await?;
            }
            Defect::ZoneOutOfRange { inode, slot, .. } => {
                self.clear_zone_slot(*inode, *slot).await?;
            }
            Defect::IndirectionTooDeep { inode, .. } => {
                self.clear_zone_slot(*inode, ZoneSlot::Inode(TRIPLE_INDIRECT))
                    .await?;
            }
            Defect::SpecialFileZones { inode } => {
                self.ctx
                    .update_inode(*inode, |disk| disk.zones[1..].fill(0))
                    .await?;
            }
            Defect::ZeroedTimestamps { inode } => {
                let now = Utc::now().timestamp().clamp(0, i64::from(u32::MAX)) as u32;
                self.ctx
                    .update_inode(*inode, |disk| {
                        disk.atime = now;
                        disk.mtime = now;
                        disk.ctime = now;
                    })
                    .await?;
            }
            Defect::DotEntryMismatch {
                dir,
                found,
                duplicate,
                at,
            } => {
                let at = match at {
                    Some(at) => *at,
                    None => return Ok(false),
                };
                self.fix_dot_entry(&at, b".", *dir, *found, *duplicate, finding.tallied)
                    .await?;
            }
            Defect::DotDotEntryMismatch {
                expected,
                found,
                duplicate,
                at,
                ..
            } => {
                let at = match at {
                    Some(at) => *at,
                    None => return Ok(false),
                };
                self.fix_dot_entry(&at, b"..", *expected, *found, *duplicate, finding.tallied)
                    .await?;
            }
            Defect::DirectoryCycle { at, .. }
            | Defect::UnexpectedHardLinkOnDirectory { at, .. }
            | Defect::EntryInodeOutOfRange { at, .. }
            | Defect::EntryToFreeInode { at, .. } => {
                self.modify_entry(at, |entry| entry.inode = 0).await?;
                if let Some(inum) = finding.tallied {
                    self.ctx.untally(inum);
                }
            }
            Defect::InvalidEntryName { target, at, .. } => {
                let target = *target;
                self.modify_entry(at, |entry| {
                    let name = repaired_name(entry.name_bytes(), target);
                    *entry = DirEntry::new(entry.inode, &name);
                })
                .await?;
            }
            Defect::ZoneDoubleAllocation { .. }
            | Defect::ZoneCountExceedsSize { .. }
            | Defect::BadInodeMode { .. } => return Ok(false),
        }
        Ok(true)
    }

    /// Remove a repeated `.`/`..`, point a wrong one at `target`, or write
    /// a missing one into the free slot `at`
    async fn fix_dot_entry(
        &mut self,
        at: &EntryLocation,
        name: &[u8],
        target: u32,
        found: Option<u32>,
        duplicate: bool,
        tallied: Option<u32>,
    ) -> Result<()> {
        if duplicate {
            self.modify_entry(at, |entry| entry.inode = 0).await?;
        } else if found.is_some() {
            self.modify_entry(at, |entry| entry.inode = target).await?;
            self.ctx.tally(target);
        } else {
            let added = DirEntry::new(target, name);
            self.modify_entry(at, |entry| *entry = added).await?;
            self.ctx.tally(target);
        }
        if let Some(inum) = tallied {
            self.ctx.untally(inum);
        }
        Ok(())
    }

    /// Read-modify-write one directory entry through the block cache
    async fn modify_entry<F>(&mut self, at: &EntryLocation, change: F) -> Result<()>
    where
        F: FnOnce(&mut DirEntry),
    {
        let endian = self.ctx.endian;
        let mut block = self.ctx.cache.block(at.block).await?;
        let offset = at.index * DIR_ENTRY_SIZE;
        let slot = &mut block[offset..offset + DIR_ENTRY_SIZE];
        let mut entry = DirEntry::decode(slot, endian);
        change(&mut entry);
        entry.encode(slot, endian);
        self.ctx.cache.write_block(at.block, &block).await?;
        Ok(())
    }

    async fn clear_zone_slot(&mut self, inum: u32, slot: ZoneSlot) -> Result<()> {
        match slot {
            ZoneSlot::Inode(index) => {
                self.ctx
                    .update_inode(inum, |disk| disk.zones[index] = 0)
                    .await
            }
            ZoneSlot::Indirect { block, index } => {
                let mut data = self.ctx.cache.block(block).await?;
                let offset = index * ZONE_NUM_SIZE;
                self.ctx
                    .endian
                    .write_u32(&mut data[offset..offset + ZONE_NUM_SIZE], 0);
                self.ctx.cache.write_block(block, &data).await?;
                Ok(())
            }
        }
    }

    /// Fill in the totals and write everything back
    async fn finish(mut self) -> Result<FsckReport> {
        let ctx = &mut self.ctx;
        ctx.counters.free_inodes = ctx.imap.count_free() as u64;
        ctx.counters.free_zones = ctx.zmap.count_free() as u64;

        if self.options.may_write() && !ctx.superblock.read_only {
            let inodes = ctx.inodes.flush(&ctx.cache).await?;
            if ctx.imap.is_dirty() {
                ctx.imap.save(&ctx.cache, &ctx.geometry, ctx.endian).await?;
            }
            if ctx.zmap.is_dirty() {
                ctx.zmap.save(&ctx.cache, &ctx.geometry, ctx.endian).await?;
            }

            let clean = self.report.is_clean();
            if ctx.superblock.is_clean() != clean {
                ctx.superblock.mark_clean(clean);
                ctx.superblock.save(&ctx.cache).await?;
            }
            ctx.cache.flush().await?;
            log::info!(
                "FSCK: wrote back {} inodes, filesystem {}",
                inodes,
                if clean { "clean" } else { "left unclean" }
            );
        }

        self.report.marked_clean = ctx.superblock.is_clean();
        self.report.counters = ctx.counters.clone();
        self.report.inode_cache = ctx.inodes.stats();
        self.report.block_cache = ctx.cache.stats();

        log::info!(
            "FSCK: {} defects, {} repaired",
            self.report.defect_count(),
            self.report.repair_count()
        );
        Ok(self.report)
    }
}

/// Replacement for an empty name or one containing `/`
fn repaired_name(name: &[u8], inum: u32) -> Vec<u8> {
    if name.is_empty() {
        return format!("#{}", inum).into_bytes();
    }
    name.iter()
        .map(|&b| if b == b'/' { b'_' } else { b })
        .collect()
}
