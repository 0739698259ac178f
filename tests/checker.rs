//! # Integrity Checker Tests
//!
//! End-to-end corruption and repair over real images:
//! 1. A freshly built tree checks clean after flush and reopen
//! 2. Localized node damage is detected, healed, and the healed image
//!    stays clean across another flush/reopen cycle
//! 3. Value-side damage clears or truncates only the affected list
//! 4. Damage the checker cannot localize is reported as fatal and
//!    nothing is modified

use tempfile::tempdir;

use hivedb::{
    CellId, CheckCode, CheckFlags, FileStore, Hive, HiveConfig, MemoryBacking, StorageKind,
};

fn new_hive() -> Hive {
    Hive::create(Box::new(MemoryBacking::new(0)), HiveConfig::default()).unwrap()
}

/// Overwrites bytes inside a cell the way in-image corruption would.
fn poke(hive: &mut Hive, cell: CellId, offset: usize, bytes: &[u8]) {
    hive.mark_cell_dirty(cell).unwrap();
    let mut guard = hive.cell(cell).unwrap();
    guard.data_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn node_field(hive: &mut Hive, cell: CellId, offset: usize) -> u32 {
    let guard = hive.cell(cell).unwrap();
    u32::from_le_bytes(guard.data()[offset..offset + 4].try_into().unwrap())
}

fn heal() -> CheckFlags {
    CheckFlags {
        heal: true,
        clear_volatile: false,
    }
}

#[test]
fn clean_tree_checks_clean_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.hive");

    {
        let backing = Box::new(FileStore::create(&path, 0).unwrap());
        let mut hive = Hive::create(backing, HiveConfig::default()).unwrap();
        let root = hive.create_root_key(b"root").unwrap();
        for i in 0..20 {
            let name = format!("key{i:02}");
            let key = hive
                .create_key(root, name.as_bytes(), StorageKind::Stable)
                .unwrap();
            hive.set_key_value(key, b"data", 3, &vec![i as u8; 100]).unwrap();
        }
        hive.set_key_value(root, b"blob", 3, &vec![7u8; 40_000]).unwrap();
        hive.flush().unwrap();
    }

    let backing = Box::new(FileStore::open(&path).unwrap());
    let mut hive = Hive::open(backing, HiveConfig::default()).unwrap();
    let outcome = hive
        .check(CheckFlags {
            heal: true,
            clear_volatile: true,
        })
        .unwrap();

    assert_eq!(outcome.status, 0);
    assert!(!outcome.healed);
    assert_eq!(outcome.repairs_applied, 0);
    assert!(!hive.self_healed());
}

#[test]
fn corrupt_signature_heals_and_stays_healed_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.hive");

    {
        let backing = Box::new(FileStore::create(&path, 0).unwrap());
        let mut hive = Hive::create(backing, HiveConfig::default()).unwrap();
        let root = hive.create_root_key(b"root").unwrap();
        let key = hive.create_key(root, b"victim", StorageKind::Stable).unwrap();
        hive.set_key_value(key, b"v", 4, &[1, 2, 3, 4]).unwrap();

        // stomp the node signature and push the damage to disk
        poke(&mut hive, key, 0, &[0xDE, 0xAD]);
        hive.flush().unwrap();
    }

    {
        let backing = Box::new(FileStore::open(&path).unwrap());
        let mut hive = Hive::open(backing, HiveConfig::default()).unwrap();
        let outcome = hive.check(heal()).unwrap();
        assert_eq!(outcome.status, 0);
        assert!(outcome.healed);
        assert_eq!(outcome.repairs_applied, 1);
        assert!(hive.self_healed());

        // the key is intact apart from the repaired signature
        let root = hive.root_cell();
        let key = hive.find_key(root, b"victim").unwrap().unwrap();
        let value = hive.get_key_value(key, b"v").unwrap().unwrap();
        assert_eq!(hive.read_value_data(value).unwrap(), [1, 2, 3, 4]);

        hive.flush().unwrap();
    }

    let backing = Box::new(FileStore::open(&path).unwrap());
    let mut hive = Hive::open(backing, HiveConfig::default()).unwrap();
    let outcome = hive.check(heal()).unwrap();
    assert_eq!(outcome.status, 0);
    assert!(!outcome.healed);
}

#[test]
fn wrong_parent_link_is_repointed() {
    let mut hive = new_hive();
    let root = hive.create_root_key(b"root").unwrap();
    let mid = hive.create_key(root, b"mid", StorageKind::Stable).unwrap();
    let leaf = hive.create_key(mid, b"leaf", StorageKind::Stable).unwrap();

    // the leaf claims the root as its parent
    poke(&mut hive, leaf, 12, &root.0.to_le_bytes());
    assert_eq!(node_field(&mut hive, leaf, 12), root.0);

    let outcome = hive.check(heal()).unwrap();
    assert_eq!(outcome.status, 0);
    assert!(outcome.healed);
    assert_eq!(hive.key_meta(leaf).unwrap().parent, mid);
}

#[test]
fn dangling_value_list_is_cleared() {
    let mut hive = new_hive();
    let root = hive.create_root_key(b"root").unwrap();
    let key = hive.create_key(root, b"k", StorageKind::Stable).unwrap();
    hive.set_key_value(key, b"a", 4, &[1]).unwrap();

    // repoint the value list at a byte offset that is no cell at all
    poke(&mut hive, key, 36, &CellId(0x0003_0004).0.to_le_bytes());

    let outcome = hive.check(heal()).unwrap();
    assert_eq!(outcome.status, 0);
    assert!(outcome.healed);
    let meta = hive.key_meta(key).unwrap();
    assert_eq!(meta.values, 0);
    assert!(hive.get_key_value(key, b"a").unwrap().is_none());
}

#[test]
fn bad_value_entry_truncates_the_tail() {
    let mut hive = new_hive();
    let root = hive.create_root_key(b"root").unwrap();
    let key = hive.create_key(root, b"k", StorageKind::Stable).unwrap();
    hive.set_key_value(key, b"first", 4, &[1]).unwrap();
    hive.set_key_value(key, b"second", 4, &[2]).unwrap();
    hive.set_key_value(key, b"third", 4, &[3]).unwrap();

    // corrupt the second slot of the value list
    let list = CellId(node_field(&mut hive, key, 36));
    poke(&mut hive, list, 4, &0x0005_0009u32.to_le_bytes());

    let outcome = hive.check(heal()).unwrap();
    assert_eq!(outcome.status, 0);
    assert!(outcome.healed);

    // everything from the bad slot on is dropped; the head survives
    assert_eq!(hive.key_meta(key).unwrap().values, 1);
    assert!(hive.get_key_value(key, b"first").unwrap().is_some());
    assert!(hive.get_key_value(key, b"second").unwrap().is_none());
    assert!(hive.get_key_value(key, b"third").unwrap().is_none());
}

#[test]
fn free_child_reference_is_unlinked() {
    let mut hive = new_hive();
    let root = hive.create_root_key(b"root").unwrap();
    let keep = hive.create_key(root, b"keep", StorageKind::Stable).unwrap();
    let gone = hive.create_key(root, b"zzgone", StorageKind::Stable).unwrap();
    hive.set_key_value(keep, b"v", 4, &[9]).unwrap();

    // free the child cell behind the index's back
    hive.free_cell(gone).unwrap();

    let outcome = hive.check(heal()).unwrap();
    assert_eq!(outcome.status, 0);
    assert!(outcome.healed);
    let meta = hive.key_meta(root).unwrap();
    assert_eq!(meta.stable_subkeys, 1);
    assert!(hive.find_key(root, b"keep").unwrap().is_some());
    assert!(hive.find_key(root, b"zzgone").unwrap().is_none());
}

#[test]
fn unmapped_root_is_fatal_and_reported() {
    let mut hive = new_hive();
    hive.create_root_key(b"root").unwrap();

    hive.set_root_cell(CellId(0x00FF_0008));

    let outcome = hive.check(heal()).unwrap();
    assert_eq!(outcome.status, CheckCode::UnmappedCell as u32);
    assert!(!outcome.healed);
    let debug = outcome.debug.unwrap();
    assert_eq!(debug.code, CheckCode::UnmappedCell);
    assert!(!hive.self_healed());
}

#[test]
fn detection_without_heal_reports_and_leaves_damage() {
    let mut hive = new_hive();
    let root = hive.create_root_key(b"root").unwrap();
    let key = hive.create_key(root, b"k", StorageKind::Stable).unwrap();
    poke(&mut hive, key, 0, &[0xDE, 0xAD]);

    let outcome = hive.check(CheckFlags::default()).unwrap();
    assert_eq!(outcome.status, CheckCode::BadSignature as u32);
    assert!(!outcome.healed);
    assert_eq!(outcome.repairs_applied, 0);

    // nothing was touched; a healing pass still has work to do
    let outcome = hive.check(heal()).unwrap();
    assert!(outcome.healed);
    assert_eq!(outcome.status, 0);
}
