//! # Durability and View Tests
//!
//! Flush/reopen round trips over a real file:
//! 1. A flushed tree survives close and reopen byte-exactly
//! 2. Unflushed mutations after a flush are invisible on reopen
//! 3. A torn flush (unequal sequence numbers) is detected and recovered
//! 4. Volatile keys vanish on reopen; the loader cleanup pass resets the
//!    stale volatile bookkeeping they leave in stable parents

use tempfile::tempdir;

use hivedb::{CheckFlags, FileStore, Hive, HiveConfig, StorageKind};

fn create_at(path: &std::path::Path) -> Hive {
    let backing = Box::new(FileStore::create(path, 0).unwrap());
    Hive::create(backing, HiveConfig::default()).unwrap()
}

fn open_at(path: &std::path::Path) -> Hive {
    let backing = Box::new(FileStore::open(path).unwrap());
    Hive::open(backing, HiveConfig::default()).unwrap()
}

#[test]
fn flushed_tree_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.hive");

    {
        let mut hive = create_at(&path);
        let root = hive.create_root_key(b"machine").unwrap();
        let key = hive.create_key(root, b"service", StorageKind::Stable).unwrap();
        hive.set_key_value(key, b"port", 4, &8080u32.to_le_bytes()).unwrap();
        hive.set_key_value(key, b"image", 1, b"C:\\svc.exe").unwrap();
        hive.set_key_value(key, b"blob", 3, &vec![0x5A; 30_000]).unwrap();
        hive.flush().unwrap();
    }

    let mut hive = open_at(&path);
    assert!(!hive.recovered());
    let root = hive.root_cell();
    assert_eq!(hive.key_name(root).unwrap(), b"machine");
    let key = hive.find_key(root, b"SERVICE").unwrap().unwrap();
    let port = hive.get_key_value(key, b"port").unwrap().unwrap();
    assert_eq!(hive.read_value_data(port).unwrap(), 8080u32.to_le_bytes());
    let blob = hive.get_key_value(key, b"blob").unwrap().unwrap();
    assert_eq!(hive.read_value_data(blob).unwrap(), vec![0x5A; 30_000]);
}

#[test]
fn unflushed_changes_do_not_persist() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.hive");

    {
        let mut hive = create_at(&path);
        let root = hive.create_root_key(b"root").unwrap();
        hive.set_key_value(root, b"v", 4, &[1]).unwrap();
        hive.flush().unwrap();

        // mutate after the flush, then drop without flushing
        hive.set_key_value(root, b"v", 4, &[2]).unwrap();
        hive.set_key_value(root, b"extra", 4, &[3]).unwrap();
    }

    let mut hive = open_at(&path);
    let root = hive.root_cell();
    let v = hive.get_key_value(root, b"v").unwrap().unwrap();
    assert_eq!(hive.read_value_data(v).unwrap(), vec![1]);
    assert!(hive.get_key_value(root, b"extra").unwrap().is_none());
}

#[test]
fn repeated_flushes_accumulate() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.hive");

    {
        let mut hive = create_at(&path);
        let root = hive.create_root_key(b"root").unwrap();
        for i in 0..50u32 {
            let name = format!("key{}", i);
            let key = hive
                .create_key(root, name.as_bytes(), StorageKind::Stable)
                .unwrap();
            hive.set_key_value(key, b"n", 4, &i.to_le_bytes()).unwrap();
            if i % 7 == 0 {
                hive.flush().unwrap();
            }
        }
        hive.flush().unwrap();
    }

    let mut hive = open_at(&path);
    let root = hive.root_cell();
    for i in 0..50u32 {
        let name = format!("key{}", i);
        let key = hive.find_key(root, name.as_bytes()).unwrap().unwrap();
        let v = hive.get_key_value(key, b"n").unwrap().unwrap();
        assert_eq!(hive.read_value_data(v).unwrap(), i.to_le_bytes());
    }
}

#[test]
fn torn_flush_is_detected_on_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.hive");

    {
        let mut hive = create_at(&path);
        let root = hive.create_root_key(b"root").unwrap();
        hive.set_key_value(root, b"v", 4, &[9]).unwrap();
        hive.flush().unwrap();
    }

    // forge a torn flush: bump sequence1 and refold the header checksum
    {
        let mut image = std::fs::read(&path).unwrap();
        let seq1 = u32::from_le_bytes(image[4..8].try_into().unwrap());
        image[4..8].copy_from_slice(&(seq1 + 1).to_le_bytes());
        let mut sum = 0u32;
        for word in 0..126 {
            sum ^= u32::from_le_bytes(image[word * 4..word * 4 + 4].try_into().unwrap());
        }
        let sum = match sum {
            0 => 1,
            u32::MAX => u32::MAX - 1,
            s => s,
        };
        image[504..508].copy_from_slice(&sum.to_le_bytes());
        std::fs::write(&path, image).unwrap();
    }

    let mut hive = open_at(&path);
    assert!(hive.recovered());
    let root = hive.root_cell();
    let v = hive.get_key_value(root, b"v").unwrap().unwrap();
    assert_eq!(hive.read_value_data(v).unwrap(), vec![9]);

    // the next flush heals the sequence pair
    hive.flush().unwrap();
    drop(hive);
    assert!(!open_at(&path).recovered());
}

#[test]
fn volatile_keys_vanish_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.hive");

    {
        let mut hive = create_at(&path);
        let root = hive.create_root_key(b"root").unwrap();
        hive.create_key(root, b"disk", StorageKind::Stable).unwrap();
        hive.create_key(root, b"session", StorageKind::Volatile).unwrap();
        hive.flush().unwrap();
    }

    let mut hive = open_at(&path);
    let root = hive.root_cell();

    // the stable parent still counts the volatile child it flushed;
    // the loader cleanup pass clears that bookkeeping
    let outcome = hive
        .check(CheckFlags {
            heal: false,
            clear_volatile: true,
        })
        .unwrap();
    assert_eq!(outcome.status, 0);

    let meta = hive.key_meta(root).unwrap();
    assert_eq!(meta.volatile_subkeys, 0);
    assert_eq!(meta.stable_subkeys, 1);
    assert!(hive.find_key(root, b"disk").unwrap().is_some());
    assert!(hive.find_key(root, b"session").unwrap().is_none());
}

#[test]
fn tiny_view_budget_still_serves_a_large_image() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.hive");

    {
        let cfg = HiveConfig::default();
        let backing = Box::new(FileStore::create(&path, 0).unwrap());
        let mut hive = Hive::create(backing, cfg).unwrap();
        let root = hive.create_root_key(b"root").unwrap();
        for i in 0..200u32 {
            let name = format!("key{}", i);
            let key = hive
                .create_key(root, name.as_bytes(), StorageKind::Stable)
                .unwrap();
            hive.set_key_value(key, b"pad", 3, &[i as u8; 2000]).unwrap();
        }
        hive.flush().unwrap();
    }

    // a cache of four windows forces constant eviction and refault
    let cfg = HiveConfig {
        view_capacity: 4,
        ..HiveConfig::default()
    };
    let backing = Box::new(FileStore::open(&path).unwrap());
    let mut hive = Hive::open(backing, cfg).unwrap();
    let root = hive.root_cell();
    for i in (0..200u32).rev() {
        let name = format!("key{}", i);
        let key = hive.find_key(root, name.as_bytes()).unwrap().unwrap();
        let v = hive.get_key_value(key, b"pad").unwrap().unwrap();
        assert_eq!(hive.read_value_data(v).unwrap(), vec![i as u8; 2000]);
    }
}
