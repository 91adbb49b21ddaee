//! Depth-first walk of the directory tree
//!
//! The walk keeps one [`Frame`] per directory being read on an explicit
//! stack instead of recursing, so a deep or looping tree cannot exhaust the
//! call stack. Each frame reads its directory's zones through a
//! [`ZoneWalker`], one block at a time, and every entry is checked as it is
//! read. Nothing is written here: the walk only records findings, tallies
//! references and fills in the observed bitmaps.

use std::collections::VecDeque;

use crate::context::CheckContext;
use crate::defect::{Defect, EntryLocation, Finding};
use crate::error::{Error, Result};
use crate::format::{DirEntry, DiskInode, InodeType, DIR_ENTRY_SIZE, ROOT_INODE};
use crate::inode_cache::InodeHandle;
use crate::zone_walker::{ClaimOutcome, ZoneVisit, ZoneWalker};

struct LoadedBlock {
    number: u64,
    data: Vec<u8>,
    /// Byte offset of the block within the directory
    base: u64,
}

/// A directory being read
struct Frame {
    dir: u32,
    /// Parent as reached by the walk, not as claimed by `..`
    parent: u32,
    size: u64,
    handle: InodeHandle,
    zones: ZoneWalker,
    /// Blocks of the current zone not read yet, with their byte offsets
    pending: VecDeque<(u64, u64)>,
    current: Option<LoadedBlock>,
    index: usize,
    dot: bool,
    dotdot: bool,
    free_slots: Vec<EntryLocation>,
}

/// Walk the tree from the root, returning what was found in walk order
pub async fn walk(ctx: &mut CheckContext) -> Result<Vec<Finding>> {
    let mut walker = DirWalker {
        stack: Vec::new(),
        findings: Vec::new(),
    };
    walker.run(ctx).await?;
    Ok(walker.findings)
}

/// Whether `target` names an allocated inode, so the entry counts as a link.
/// An out-of-range `.` or `..` links nothing and is rewritten in place.
async fn links_to(ctx: &mut CheckContext, dir: u32, target: u32) -> Result<bool> {
    if target == dir {
        return Ok(true);
    }
    if target > ctx.geometry.ninodes {
        return Ok(false);
    }
    Ok(ctx.load_inode(target).await?.is_allocated())
}

struct DirWalker {
    stack: Vec<Frame>,
    findings: Vec<Finding>,
}

impl DirWalker {
    async fn run(&mut self, ctx: &mut CheckContext) -> Result<()> {
        let root = ctx.load_inode(ROOT_INODE).await?;
        if !root.is_dir() {
            log::error!("DIR_WALK: root inode has mode 0{:o}", root.mode);
            return Err(Error::RootNotDirectory);
        }

        ctx.mark_reached(ROOT_INODE)?;
        ctx.counters.count_type(InodeType::Directory);
        self.check_fields(ROOT_INODE, &root);
        self.enter(ctx, ROOT_INODE, ROOT_INODE, &root).await?;

        while !self.stack.is_empty() {
            match self.next_entry(ctx).await? {
                Some((at, entry)) => self.visit_entry(ctx, at, entry).await?,
                None => self.leave(ctx),
            }
        }

        log::info!(
            "DIR_WALK: reached {} inodes, {} findings",
            ctx.counters.inodes_in_use(),
            self.findings.len()
        );
        Ok(())
    }

    fn record(&mut self, defect: Defect, tallied: Option<u32>) {
        log::debug!("DIR_WALK: {}", defect);
        self.findings.push(Finding { defect, tallied });
    }

    async fn enter(
        &mut self,
        ctx: &mut CheckContext,
        dir: u32,
        parent: u32,
        inode: &DiskInode,
    ) -> Result<()> {
        log::debug!("DIR_WALK: entering directory {} (parent {})", dir, parent);
        let handle = ctx.inodes.get(&ctx.cache, ctx.dev, dir).await?;
        self.stack.push(Frame {
            dir,
            parent,
            size: inode.size as u64,
            handle,
            zones: ZoneWalker::new(dir, inode, &ctx.geometry, ctx.endian),
            pending: VecDeque::new(),
            current: None,
            index: 0,
            dot: false,
            dotdot: false,
            free_slots: Vec::new(),
        });
        Ok(())
    }

    fn leave(&mut self, ctx: &mut CheckContext) {
        let frame = match self.stack.pop() {
            Some(frame) => frame,
            None => return,
        };
        log::debug!("DIR_WALK: leaving directory {}", frame.dir);

        let mut slots = frame.free_slots.into_iter();
        if !frame.dot {
            self.record(
                Defect::DotEntryMismatch {
                    dir: frame.dir,
                    found: None,
                    duplicate: false,
                    at: slots.next(),
                },
                None,
            );
        }
        if !frame.dotdot {
            self.record(
                Defect::DotDotEntryMismatch {
                    dir: frame.dir,
                    expected: frame.parent,
                    found: None,
                    duplicate: false,
                    at: slots.next(),
                },
                None,
            );
        }

        let needed = ctx.geometry.zones_for_size(frame.size);
        if frame.zones.data_zones() > needed {
            self.record(
                Defect::ZoneCountExceedsSize {
                    inode: frame.dir,
                    zones: frame.zones.data_zones(),
                    size: frame.size as u32,
                },
                None,
            );
        }

        ctx.inodes.put(frame.handle);
    }

    /// Next used entry of the directory on top of the stack, or `None` when
    /// it has been read to the end
    async fn next_entry(
        &mut self,
        ctx: &mut CheckContext,
    ) -> Result<Option<(EntryLocation, DirEntry)>> {
        let per_block = ctx.geometry.entries_per_block();

        loop {
            let frame = match self.stack.last_mut() {
                Some(frame) => frame,
                None => return Ok(None),
            };

            if let Some(block) = &frame.current {
                while frame.index < per_block {
                    let index = frame.index;
                    frame.index += 1;
                    if block.base + (index * DIR_ENTRY_SIZE) as u64 >= frame.size {
                        break;
                    }
                    let entry = DirEntry::decode(&block.data[index * DIR_ENTRY_SIZE..], ctx.endian);
                    let at = EntryLocation {
                        dir: frame.dir,
                        block: block.number,
                        index,
                    };
                    if entry.is_free() {
                        frame.free_slots.push(at);
                        continue;
                    }
                    return Ok(Some((at, entry)));
                }
                frame.current = None;
            }

            if let Some((number, base)) = frame.pending.pop_front() {
                let data = ctx.cache.block(number).await?;
                frame.current = Some(LoadedBlock { number, data, base });
                frame.index = 0;
                continue;
            }

            let dir = frame.dir;
            let visit = match frame.zones.next(&ctx.cache, &mut ctx.claims).await? {
                Some(visit) => visit,
                None => return Ok(None),
            };
            self.record_zone(ctx, dir, visit);

            // A cross-linked zone is still read as this directory's entries,
            // so the children it names stay reachable
            let readable = matches!(
                visit.outcome,
                ClaimOutcome::Claimed | ClaimOutcome::Duplicate { .. }
            );
            if visit.zone.level == 0 && readable {
                if let Some(frame) = self.stack.last_mut() {
                    let zone_size = ctx.geometry.zone_size();
                    let block_size = ctx.geometry.block_size as u64;
                    for (k, number) in ctx.geometry.zone_blocks(visit.zone.zone).enumerate() {
                        let base = visit.zone.position * zone_size + k as u64 * block_size;
                        if base < frame.size {
                            frame.pending.push_back((number, base));
                        }
                    }
                }
            }
        }
    }

    async fn visit_entry(
        &mut self,
        ctx: &mut CheckContext,
        at: EntryLocation,
        entry: DirEntry,
    ) -> Result<()> {
        let target = entry.inode;
        let name = entry.display_name();

        if entry.is_dot() {
            return self.visit_dot(ctx, at, target).await;
        }
        if entry.is_dotdot() {
            return self.visit_dotdot(ctx, at, target).await;
        }
        if target > ctx.geometry.ninodes {
            self.record(Defect::EntryInodeOutOfRange { name, target, at }, None);
            return Ok(());
        }

        let raw_name = entry.name_bytes();
        if raw_name.is_empty() || raw_name.contains(&b'/') {
            self.record(
                Defect::InvalidEntryName {
                    name: name.clone(),
                    target,
                    at,
                },
                None,
            );
        }

        let inode = ctx.load_inode(target).await?;
        if !inode.is_allocated() {
            self.record(Defect::EntryToFreeInode { name, target, at }, None);
            return Ok(());
        }

        if inode.is_dir() {
            if self.stack.iter().any(|frame| frame.dir == target) {
                ctx.tally(target);
                self.record(Defect::DirectoryCycle { name, target, at }, Some(target));
                return Ok(());
            }
            if ctx.is_reached(target) {
                ctx.tally(target);
                self.record(
                    Defect::UnexpectedHardLinkOnDirectory { name, target, at },
                    Some(target),
                );
                return Ok(());
            }

            ctx.tally(target);
            ctx.mark_reached(target)?;
            ctx.counters.count_type(InodeType::Directory);
            self.check_fields(target, &inode);
            return self.enter(ctx, target, at.dir, &inode).await;
        }

        ctx.tally(target);
        if ctx.mark_reached(target)? {
            ctx.counters.count_type(inode.file_type());
            self.check_fields(target, &inode);
            self.walk_file(ctx, target, &inode).await?;
        }
        Ok(())
    }

    async fn visit_dot(&mut self, ctx: &mut CheckContext, at: EntryLocation, target: u32) -> Result<()> {
        let duplicate = match self.stack.last_mut() {
            Some(frame) => std::mem::replace(&mut frame.dot, true),
            None => return Ok(()),
        };

        let tallied = links_to(ctx, at.dir, target).await?.then_some(target);
        if let Some(inum) = tallied {
            ctx.tally(inum);
        }

        if duplicate || target != at.dir {
            self.record(
                Defect::DotEntryMismatch {
                    dir: at.dir,
                    found: Some(target),
                    duplicate,
                    at: Some(at),
                },
                tallied,
            );
        }
        Ok(())
    }

    async fn visit_dotdot(
        &mut self,
        ctx: &mut CheckContext,
        at: EntryLocation,
        target: u32,
    ) -> Result<()> {
        let (duplicate, expected) = match self.stack.last_mut() {
            Some(frame) => (std::mem::replace(&mut frame.dotdot, true), frame.parent),
            None => return Ok(()),
        };

        let tallied = links_to(ctx, at.dir, target).await?.then_some(target);
        if let Some(inum) = tallied {
            ctx.tally(inum);
        }

        if duplicate || target != expected {
            self.record(
                Defect::DotDotEntryMismatch {
                    dir: at.dir,
                    expected,
                    found: Some(target),
                    duplicate,
                    at: Some(at),
                },
                tallied,
            );
        }
        Ok(())
    }

    /// Checks that apply to every inode on its first visit
    fn check_fields(&mut self, inum: u32, inode: &DiskInode) {
        if inode.file_type() == InodeType::Bad {
            self.record(
                Defect::BadInodeMode {
                    inode: inum,
                    mode: inode.mode,
                },
                None,
            );
        }
        if inode.has_zeroed_times() {
            self.record(Defect::ZeroedTimestamps { inode: inum }, None);
        }
    }

    async fn walk_file(&mut self, ctx: &mut CheckContext, inum: u32, inode: &DiskInode) -> Result<()> {
        if matches!(
            inode.file_type(),
            InodeType::BlockSpecial | InodeType::CharSpecial
        ) {
            // zone[0] holds the device number
            if inode.zones[1..].iter().any(|&zone| zone != 0) {
                self.record(Defect::SpecialFileZones { inode: inum }, None);
            }
            return Ok(());
        }

        let mut zones = ZoneWalker::new(inum, inode, &ctx.geometry, ctx.endian);
        while let Some(visit) = zones.next(&ctx.cache, &mut ctx.claims).await? {
            self.record_zone(ctx, inum, visit);
        }

        let needed = ctx.geometry.zones_for_size(inode.size as u64);
        if zones.data_zones() > needed {
            self.record(
                Defect::ZoneCountExceedsSize {
                    inode: inum,
                    zones: zones.data_zones(),
                    size: inode.size,
                },
                None,
            );
        }
        Ok(())
    }

    fn record_zone(&mut self, ctx: &mut CheckContext, inum: u32, visit: ZoneVisit) {
        let zone = visit.zone;
        match visit.outcome {
            ClaimOutcome::Claimed => ctx.counters.zones_by_level[zone.level as usize] += 1,
            ClaimOutcome::Duplicate { first_owner } => self.record(
                Defect::ZoneDoubleAllocation {
                    zone: zone.zone,
                    first_owner,
                    second_owner: inum,
                },
                None,
            ),
            ClaimOutcome::OutOfRange => self.record(
                Defect::ZoneOutOfRange {
                    inode: inum,
                    zone: zone.zone,
                    position: zone.position,
                    slot: zone.slot,
                },
                None,
            ),
            ClaimOutcome::TooDeep => self.record(
                Defect::IndirectionTooDeep {
                    inode: inum,
                    zone: zone.zone,
                },
                None,
            ),
        }
    }
}
