//! Crash-safety tests. A crash is simulated by snapshotting the database
//! file between commits (the state a crash before the next meta fsync
//! would leave behind) and reopening the snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use burrowdb::Database;

const PAGE_SIZE: usize = 4096;

fn copy_to(src: &Path, dir: &Path, name: &str) -> PathBuf {
    let dst = dir.join(name);
    fs::copy(src, &dst).unwrap();
    dst
}

#[test]
fn every_commit_prefix_reopens_to_that_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.db");
    let mut db = Database::open(&path).unwrap();

    let mut snapshots = Vec::new();
    for i in 0..30 {
        db.set(format!("key{:02}", i).as_bytes(), format!("val{:02}", i).as_bytes())
            .unwrap();
        snapshots.push(copy_to(&path, dir.path(), &format!("snap{:02}.db", i)));
    }
    drop(db);

    for (i, snapshot) in snapshots.iter().enumerate() {
        let db = Database::open(snapshot).unwrap();
        for j in 0..30 {
            let key = format!("key{:02}", j);
            let expect = (j <= i).then(|| format!("val{:02}", j).into_bytes());
            assert_eq!(
                db.get(key.as_bytes()).unwrap(),
                expect,
                "snapshot {} key {}",
                i,
                j
            );
        }
    }
}

#[test]
fn data_written_without_meta_is_invisible() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.db");

    {
        let mut db = Database::open(&path).unwrap();
        db.set(b"committed", b"yes").unwrap();
        db.close().unwrap();
    }

    // a crash mid-commit leaves data pages past the high-watermark with the
    // old meta page; they must read as garbage
    let mut bytes = fs::read(&path).unwrap();
    bytes.extend_from_slice(&[0xDE; 2 * PAGE_SIZE]);
    fs::write(&path, &bytes).unwrap();

    let db = Database::open(&path).unwrap();
    assert_eq!(db.get(b"committed").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(db.get(b"phantom").unwrap(), None);
}

#[test]
fn crash_before_first_commit_completes_opens_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.db");

    // data pages landed, the first meta write did not: the meta page is
    // still all zeroes
    fs::write(&path, vec![0u8; 3 * PAGE_SIZE]).unwrap();

    let mut db = Database::open(&path).unwrap();
    assert_eq!(db.get(b"anything").unwrap(), None);

    db.set(b"first", b"value").unwrap();
    drop(db);

    let db = Database::open(&path).unwrap();
    assert_eq!(db.get(b"first").unwrap(), Some(b"value".to_vec()));
}

#[test]
fn deletes_are_crash_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.db");
    let mut db = Database::open(&path).unwrap();

    for i in 0..40 {
        db.set(format!("k{:02}", i).as_bytes(), b"v").unwrap();
    }
    let before_deletes = copy_to(&path, dir.path(), "before.db");

    for i in 0..20 {
        db.delete(format!("k{:02}", i).as_bytes()).unwrap();
    }
    let after_deletes = copy_to(&path, dir.path(), "after.db");
    drop(db);

    let db = Database::open(&before_deletes).unwrap();
    for i in 0..40 {
        assert_eq!(
            db.get(format!("k{:02}", i).as_bytes()).unwrap(),
            Some(b"v".to_vec())
        );
    }

    let db = Database::open(&after_deletes).unwrap();
    for i in 0..40 {
        let expect = (i >= 20).then(|| b"v".to_vec());
        assert_eq!(db.get(format!("k{:02}", i).as_bytes()).unwrap(), expect);
    }
}

#[test]
fn corrupt_signature_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.db");

    {
        let mut db = Database::open(&path).unwrap();
        db.set(b"a", b"1").unwrap();
        db.close().unwrap();
    }

    let mut bytes = fs::read(&path).unwrap();
    bytes[..4].copy_from_slice(b"junk");
    fs::write(&path, &bytes).unwrap();

    assert!(Database::open(&path).is_err());
}
