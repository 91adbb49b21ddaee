//! Link counts and unreachable inodes
//!
//! Runs after the walk, once every directory entry has been tallied and the
//! structural repairs have adjusted the tallies.

use crate::context::CheckContext;
use crate::defect::{Defect, Finding};
use crate::error::Result;
use crate::format::{DiskInode, InodeType};
use crate::zone_walker::{ClaimOutcome, ZoneClaims, ZoneWalker};

/// Reached inodes whose stored link count differs from their tally
pub async fn link_count_findings(ctx: &mut CheckContext) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    for inum in 1..=ctx.geometry.ninodes {
        if !ctx.is_reached(inum) {
            continue;
        }
        let stored = ctx.load_inode(inum).await?.nlinks;
        let counted = ctx.tally_of(inum);
        if stored as u32 != counted {
            findings.push(
                Defect::LinkCountMismatch {
                    inode: inum,
                    stored,
                    counted,
                }
                .into(),
            );
        }
    }
    Ok(findings)
}

/// Inodes allocated in the on-disk bitmap, in use, but never reached
pub async fn orphan_findings(ctx: &mut CheckContext) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    for inum in 1..=ctx.geometry.ninodes {
        if !ctx.imap.is_set(inum as usize) || ctx.is_reached(inum) {
            continue;
        }
        let inode = ctx.load_inode(inum).await?;
        if inode.is_allocated() {
            findings.push(
                Defect::OrphanInode {
                    inode: inum,
                    mode: inode.mode,
                }
                .into(),
            );
        }
    }
    Ok(findings)
}

/// Inodes that are free in the (repaired) bitmap and unreached but still
/// carry a mode
pub async fn uncleared_findings(ctx: &mut CheckContext) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    for inum in 1..=ctx.geometry.ninodes {
        if ctx.imap.is_set(inum as usize) || ctx.is_reached(inum) {
            continue;
        }
        let inode = ctx.load_inode(inum).await?;
        if inode.is_allocated() {
            findings.push(
                Defect::UnclearedFreeInode {
                    inode: inum,
                    mode: inode.mode,
                }
                .into(),
            );
        }
    }
    Ok(findings)
}

/// Release an unreachable inode: zero it, clear its inode bit and the bits
/// of its zones that no other inode claimed.
///
/// Returns the number of zone bits cleared.
pub async fn free_inode(ctx: &mut CheckContext, inum: u32) -> Result<usize> {
    let inode = ctx.load_inode(inum).await?;
    let mut cleared = 0;

    if !matches!(
        inode.file_type(),
        InodeType::BlockSpecial | InodeType::CharSpecial
    ) {
        // Claims in a scratch map only serve to enumerate the tree once
        let mut scratch = ZoneClaims::new(&ctx.geometry);
        let mut zones = ZoneWalker::new(inum, &inode, &ctx.geometry, ctx.endian);
        while let Some(visit) = zones.next(&ctx.cache, &mut scratch).await? {
            if visit.outcome != ClaimOutcome::Claimed {
                continue;
            }
            let zone = visit.zone.zone;
            let shared = matches!(
                ctx.claims.owner(&ctx.geometry, zone),
                Some(owner) if owner != inum
            );
            if !shared && ctx.zmap.repair(ctx.geometry.zone_bit(zone), false)?
            {
                cleared += 1;
            }
        }
    }

    ctx.update_inode(inum, |inode| *inode = DiskInode::default()).await?;
    ctx.imap.repair(inum as usize, false)?;

    log::debug!(
        "LINK_COUNT: freed inode {} and {} of its zones",
        inum,
        cleared
    );
    Ok(cleared)
}
