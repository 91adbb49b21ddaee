mod common;

use common::{categories, init_logging, TestImage};
use mfsck::format::{I_CHAR_SPECIAL, I_REGULAR, ROOT_INODE};
use mfsck::zone_walker::ZoneSlot;
use mfsck::{Defect, Outcome, RepairPolicy};

/// Repair in automatic mode, then expect a clean second run
async fn repair_and_recheck(image: &mut TestImage) -> mfsck::FsckReport {
    let report = image.check(RepairPolicy::Automatic).await;
    let rerun = image.check(RepairPolicy::Automatic).await;
    assert!(rerun.is_clean(), "second run found: {:?}", rerun.defect_lines());
    report
}

#[tokio::test]
async fn test_damage_types_surface_as_defects() {
    init_logging();
    let expected: [&[&str]; 6] = [
        &["OrphanInode"],
        &["LinkCountMismatch"],
        &["OrphanInode"],
        &["ZeroedTimestamps", "LinkCountMismatch"],
        &["ZeroedTimestamps"],
        &["LinkCountMismatch"],
    ];

    for (kind, expected) in expected.iter().enumerate() {
        let mut image = TestImage::new().await;
        let dir = image.add_dir(ROOT_INODE, "dir");
        let victim = image.add_file(dir, "victim", 1);
        image.damage(kind as u8, dir, "victim");

        let report = repair_and_recheck(&mut image).await;
        assert_eq!(
            categories(&report),
            expected.to_vec(),
            "damage type {}: {:?}",
            kind,
            report.defect_lines()
        );
        assert_eq!(report.unrepaired_count(), 0);

        match kind {
            0 | 2 => assert_eq!(image.inode(victim).mode, 0),
            1 | 3 => assert_eq!(image.inode(victim).nlinks, 1),
            4 => assert_ne!(image.inode(dir).mtime, 0),
            _ => assert_eq!(image.inode(dir).nlinks, 2),
        }
    }
}

#[tokio::test]
async fn test_entry_to_free_inode_removed() {
    init_logging();
    let mut image = TestImage::new().await;
    image.add_entry(ROOT_INODE, "ghost", 9);

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(categories(&report), vec!["EntryToFreeInode"]);
    assert!(image.find_entry(ROOT_INODE, "ghost").is_none());
}

#[tokio::test]
async fn test_entry_out_of_range_removed() {
    init_logging();
    let mut image = TestImage::new().await;
    image.add_entry(ROOT_INODE, "far", 1000);

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(categories(&report), vec!["EntryInodeOutOfRange"]);
    assert!(image.find_entry(ROOT_INODE, "far").is_none());
}

#[tokio::test]
async fn test_invalid_name_renamed() {
    init_logging();
    let mut image = TestImage::new().await;
    let file = image.add_file(ROOT_INODE, "a/b", 1);

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(categories(&report), vec!["InvalidEntryName"]);
    assert!(image.find_entry(ROOT_INODE, "a/b").is_none());
    assert!(image
        .entries(ROOT_INODE)
        .contains(&("a_b".to_string(), file)));
}

#[tokio::test]
async fn test_out_of_range_zones_cleared() {
    init_logging();
    let mut image = TestImage::new().await;
    let direct = image.add_file(ROOT_INODE, "direct", 0);
    image.update_inode(direct, |inode| {
        inode.zones[0] = 5;
        inode.size = 1024;
    });
    let indirect = image.add_file(ROOT_INODE, "indirect", 0);
    image.map_zone(indirect, 7, 99_999);
    image.update_inode(indirect, |inode| inode.size = 8 * 1024);
    let table = image.inode(indirect).zones[7];

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(
        categories(&report),
        vec!["ZoneOutOfRange", "ZoneOutOfRange"]
    );
    assert!(matches!(
        report.records[0].defect,
        Defect::ZoneOutOfRange {
            zone: 5,
            slot: ZoneSlot::Inode(0),
            ..
        }
    ));
    assert!(matches!(
        report.records[1].defect,
        Defect::ZoneOutOfRange {
            zone: 99_999,
            position: 7,
            slot: ZoneSlot::Indirect { index: 0, .. },
            ..
        }
    ));
    assert_eq!(image.inode(direct).zones[0], 0);
    assert_eq!(image.zone_at(indirect, 7), 0);
    // The table itself stays
    assert_eq!(image.inode(indirect).zones[7], table);
}

#[tokio::test]
async fn test_triple_indirect_cleared() {
    init_logging();
    let mut image = TestImage::new().await;
    let file = image.add_file(ROOT_INODE, "deep", 1);
    image.update_inode(file, |inode| inode.zones[9] = 300);

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(categories(&report), vec!["IndirectionTooDeep"]);
    assert_eq!(image.inode(file).zones[9], 0);
}

#[tokio::test]
async fn test_special_file_zones_cleared() {
    init_logging();
    let mut image = TestImage::new().await;
    let dev = image.alloc_inode();
    image.new_inode(dev, I_CHAR_SPECIAL | 0o600, 1);
    image.update_inode(dev, |inode| {
        inode.zones[0] = 0x0301;
        inode.zones[3] = 77;
    });
    image.add_entry(ROOT_INODE, "tty", dev);

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(categories(&report), vec!["SpecialFileZones"]);
    assert_eq!(report.counters.char_special, 1);
    let zones = image.inode(dev).zones;
    assert_eq!(zones[0], 0x0301);
    assert!(zones[1..].iter().all(|&z| z == 0));
}

#[tokio::test]
async fn test_wrong_dot_entry_rewritten() {
    init_logging();
    let mut image = TestImage::new().await;
    let dir = image.add_dir(ROOT_INODE, "dir");
    image.set_entry_inode(dir, ".", ROOT_INODE);

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(categories(&report), vec!["DotEntryMismatch"]);
    assert_eq!(image.entry(dir, 0).inode, dir);
    assert_eq!(image.inode(ROOT_INODE).nlinks, 3);
}

#[tokio::test]
async fn test_missing_dotdot_entry_added() {
    init_logging();
    let mut image = TestImage::new().await;
    let dir = image.add_dir(ROOT_INODE, "dir");
    image.remove_entry(dir, "..");

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(categories(&report), vec!["DotDotEntryMismatch"]);
    assert!(matches!(
        report.records[0].defect,
        Defect::DotDotEntryMismatch {
            found: None,
            expected: ROOT_INODE,
            at: Some(_),
            ..
        }
    ));
    let slot = image.find_entry(dir, "..").unwrap();
    assert_eq!(image.entry(dir, slot).inode, ROOT_INODE);
}

#[tokio::test]
async fn test_missing_dot_without_room_is_unrepairable() {
    init_logging();
    let mut image = TestImage::new().await;
    let dir = image.add_dir(ROOT_INODE, "dir");
    // Reuse the "." slot for another name: no dot entry and no free slot
    image.remove_entry(dir, ".");
    image.add_entry(dir, "self", dir);

    let report = image.check(RepairPolicy::Automatic).await;
    let dots: Vec<_> = report.of_category("DotEntryMismatch").collect();
    assert_eq!(dots.len(), 1);
    assert_eq!(dots[0].outcome, Outcome::Unrepairable);
    assert!(matches!(
        dots[0].defect,
        Defect::DotEntryMismatch { at: None, .. }
    ));
}

#[tokio::test]
async fn test_second_directory_link_removed() {
    init_logging();
    let mut image = TestImage::new().await;
    let first = image.add_dir(ROOT_INODE, "first");
    let second = image.add_dir(ROOT_INODE, "second");
    image.add_entry(second, "alias", first);

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(categories(&report), vec!["UnexpectedHardLinkOnDirectory"]);
    assert!(image.find_entry(second, "alias").is_none());
    assert_eq!(image.inode(first).nlinks, 2);
}

#[tokio::test]
async fn test_uncleared_free_inode_zeroed() {
    init_logging();
    let mut image = TestImage::new().await;
    image.new_inode(9, I_REGULAR | 0o644, 1);
    image.set_bit(mfsck::bitmap::BitmapKind::Inode, 9, false);

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(categories(&report), vec!["UnclearedFreeInode"]);
    assert_eq!(image.inode(9).mode, 0);
}

#[tokio::test]
async fn test_ambiguous_defects_left_alone() {
    init_logging();
    let mut image = TestImage::new().await;
    let odd = image.alloc_inode();
    image.new_inode(odd, 0o070644, 1);
    image.add_entry(ROOT_INODE, "odd", odd);
    let big = image.add_file(ROOT_INODE, "big", 3);
    image.update_inode(big, |inode| inode.size = 100);

    let report = image.check(RepairPolicy::Automatic).await;
    assert_eq!(
        categories(&report),
        vec!["BadInodeMode", "ZoneCountExceedsSize"]
    );
    assert!(report
        .records
        .iter()
        .all(|r| r.outcome == Outcome::Unrepairable));
    assert_eq!(report.counters.bad, 1);
    assert_eq!(image.inode(odd).mode, 0o070644);
    assert_eq!(image.inode(big).size, 100);

    // Still there, and still not touched
    let rerun = image.check(RepairPolicy::Automatic).await;
    assert_eq!(rerun.unrepaired_count(), 2);
    assert!(!image.is_clean());
}

#[tokio::test]
async fn test_unreadable_root_is_never_freed() {
    init_logging();
    let mut image = TestImage::new().await;
    image.update_inode(ROOT_INODE, |inode| inode.size = 0);

    let expected = vec![
        "DotEntryMismatch",
        "DotDotEntryMismatch",
        "ZoneCountExceedsSize",
        "LinkCountMismatch",
    ];
    for _ in 0..2 {
        let report = image.check(RepairPolicy::Automatic).await;
        assert_eq!(categories(&report), expected, "{:?}", report.defect_lines());
        assert!(report
            .records
            .iter()
            .all(|r| r.outcome == Outcome::Unrepairable));
        let root = image.inode(ROOT_INODE);
        assert!(root.is_dir());
        assert_eq!(root.nlinks, 2);
        assert!(image.bit(mfsck::bitmap::BitmapKind::Inode, ROOT_INODE as usize));
    }
}

#[tokio::test]
async fn test_root_dot_entries_rewritten() {
    init_logging();
    let mut image = TestImage::new().await;
    image.add_file(ROOT_INODE, "f", 1);
    image.set_entry_inode(ROOT_INODE, ".", 9);
    image.set_entry_inode(ROOT_INODE, "..", 1000);

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(
        categories(&report),
        vec!["DotEntryMismatch", "DotDotEntryMismatch"]
    );
    assert_eq!(image.entry(ROOT_INODE, 0).inode, ROOT_INODE);
    assert_eq!(image.entry(ROOT_INODE, 1).inode, ROOT_INODE);
    assert_eq!(image.inode(ROOT_INODE).nlinks, 2);
}

#[tokio::test]
async fn test_out_of_range_dot_rewritten_in_place() {
    init_logging();
    let mut image = TestImage::new().await;
    let dir = image.add_dir(ROOT_INODE, "dir");
    image.set_entry_inode(dir, ".", 1000);

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(categories(&report), vec!["DotEntryMismatch"]);
    assert!(matches!(
        report.records[0].defect,
        Defect::DotEntryMismatch {
            found: Some(1000),
            duplicate: false,
            at: Some(_),
            ..
        }
    ));
    assert_eq!(image.entry(dir, 0).inode, dir);
    assert_eq!(image.inode(dir).nlinks, 2);
}

#[tokio::test]
async fn test_out_of_range_dotdot_rewritten_in_place() {
    init_logging();
    let mut image = TestImage::new().await;
    let dir = image.add_dir(ROOT_INODE, "dir");
    image.set_entry_inode(dir, "..", 1000);

    let report = repair_and_recheck(&mut image).await;
    assert_eq!(categories(&report), vec!["DotDotEntryMismatch"]);
    assert_eq!(image.entry(dir, 1).inode, ROOT_INODE);
    assert_eq!(image.inode(ROOT_INODE).nlinks, 3);
}

#[tokio::test]
async fn test_cross_linked_directory_zone_keeps_children() {
    init_logging();
    let mut image = TestImage::new().await;
    let file = image.add_file(ROOT_INODE, "a", 1);
    let dir = image.add_dir(ROOT_INODE, "d");
    let keep = image.add_file(dir, "keep", 2);
    let dir_zone = image.inode(dir).zones[0];
    let lost_zone = image.inode(file).zones[0];
    // The file, walked first, now claims the directory's only zone
    image.update_inode(file, |inode| inode.zones[0] = dir_zone);

    let report = image.check(RepairPolicy::Automatic).await;
    assert_eq!(
        categories(&report),
        vec!["ZoneDoubleAllocation", "BitmapMismatch"],
        "{:?}",
        report.defect_lines()
    );
    assert_eq!(
        report.records[0].defect,
        Defect::ZoneDoubleAllocation {
            zone: dir_zone,
            first_owner: file,
            second_owner: dir,
        }
    );
    assert_eq!(report.records[0].outcome, Outcome::Unrepairable);
    assert!(!image.zone_bit(lost_zone));

    let kept = image.inode(keep);
    assert_eq!(kept.mode, I_REGULAR | 0o644);
    assert_eq!(kept.nlinks, 1);
    assert!(image.zone_bit(image.zone_at(keep, 1)));
    assert_eq!(image.inode(ROOT_INODE).nlinks, 3);

    let rerun = image.check(RepairPolicy::Automatic).await;
    assert_eq!(categories(&rerun), vec!["ZoneDoubleAllocation"]);
}
