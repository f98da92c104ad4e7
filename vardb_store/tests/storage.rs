use std::fs::OpenOptions;
use std::io::Write;
use vardb_store::{Error, KeyedStore, LockMode, OpenMode};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn store_and_fetch_roundtrip() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vars");

    let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
    assert_eq!(store.fetch(b"a").unwrap(), None);

    store.store(b"a", b"1").unwrap();
    store.store(b"b", b"2").unwrap();
    assert_eq!(store.fetch(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.fetch(b"b").unwrap(), Some(b"2".to_vec()));

    store.store(b"a", b"overwritten").unwrap();
    assert_eq!(store.fetch(b"a").unwrap(), Some(b"overwritten".to_vec()));
}

#[test]
fn delete_removes_key() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vars");

    let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
    store.store(b"a", b"1").unwrap();
    store.delete(b"a").unwrap();
    assert_eq!(store.fetch(b"a").unwrap(), None);

    // deleting an absent key is not an error
    store.delete(b"never-existed").unwrap();
}

#[test]
fn keys_snapshots_live_set_only() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vars");

    let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
    store.store(b"a", b"1").unwrap();
    store.store(b"b", b"2").unwrap();
    store.store(b"c", b"3").unwrap();
    store.delete(b"b").unwrap();

    let mut keys = store.keys();
    keys.sort();
    assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
}

#[test]
fn reopen_recovers_committed_state() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vars");

    {
        let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
        store.store(b"a", b"1").unwrap();
        store.store(b"b", b"2").unwrap();
        store.delete(b"a").unwrap();
    }

    let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
    assert_eq!(store.fetch(b"a").unwrap(), None);
    assert_eq!(store.fetch(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn reopen_truncates_trailing_garbage() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vars");

    let good_len = {
        let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
        store.store(b"a", b"1").unwrap();
        store.store(b"b", b"2").unwrap();
        store.len()
    };

    // simulate a crash mid-write: append a partial record
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0u8, 9, 9, 9]).unwrap();
    }

    let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
    assert_eq!(store.fetch(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.fetch(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(store.len(), good_len);
}

#[test]
fn read_only_rejects_writes() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vars");

    {
        let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
        store.store(b"a", b"1").unwrap();
    }

    let mut store = KeyedStore::open(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(store.fetch(b"a").unwrap(), Some(b"1".to_vec()));
    match store.store(b"a", b"2") {
        Err(Error::ReadOnly) => {}
        other => panic!("expected ReadOnly error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn read_only_open_fails_if_missing() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("does-not-exist");

    match KeyedStore::open(&path, OpenMode::ReadOnly) {
        Err(Error::IoError(_)) => {}
        other => panic!("expected IoError, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn lock_and_unlock_round_trip() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vars");

    let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
    store.lock(LockMode::Exclusive).unwrap();
    store.store(b"a", b"1").unwrap();
    store.unlock().unwrap();
}

#[test]
fn compact_preserves_live_values_and_shrinks_file() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vars");

    let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
    for i in 0..20 {
        store.store(b"a", format!("v{}", i).as_bytes()).unwrap();
    }
    store.store(b"b", b"keep").unwrap();
    store.store(b"c", b"also-keep").unwrap();
    store.delete(b"c").unwrap();

    let before = store.len();
    store.lock(LockMode::Exclusive).unwrap();
    store.compact().unwrap();
    store.unlock().unwrap();
    let after = store.len();

    assert!(after < before, "compact should shrink the file ({} >= {})", after, before);
    assert_eq!(store.fetch(b"a").unwrap(), Some(b"v19".to_vec()));
    assert_eq!(store.fetch(b"b").unwrap(), Some(b"keep".to_vec()));
    assert_eq!(store.fetch(b"c").unwrap(), None);

    let mut keys = store.keys();
    keys.sort();
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn compact_survives_reopen() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vars");

    {
        let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
        store.store(b"a", b"1").unwrap();
        store.store(b"a", b"2").unwrap();
        store.delete(b"b").unwrap();
        store.lock(LockMode::Exclusive).unwrap();
        store.compact().unwrap();
        store.unlock().unwrap();
    }

    let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
    assert_eq!(store.fetch(b"a").unwrap(), Some(b"2".to_vec()));
}
