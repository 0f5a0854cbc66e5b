//! Tests for Environment and Database
//!
//! These tests verify:
//! - Point reads/writes and atomic updates
//! - Ordered cursors and range scans under custom comparators
//! - Persistence across reopen
//! - Temporary environments cleaning up after themselves

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use dirstore::storage::{bytewise, Environment, KeyComparator};
use dirstore::DirError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path()).unwrap();
    (temp_dir, env)
}

/// Orders keys by descending bytes
#[derive(Debug)]
struct Descending;

impl KeyComparator for Descending {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }

    fn name(&self) -> String {
        "descending".to_string()
    }
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_put_get_delete() {
    let (_temp, env) = setup_temp_env();
    let db = env.open_database("test", bytewise()).unwrap();

    db.put(b"alpha", b"1");
    db.put(b"beta", b"2");
    assert_eq!(db.get(b"alpha"), Some(b"1".to_vec()));
    assert_eq!(db.record_count(), 2);

    db.put(b"alpha", b"one");
    assert_eq!(db.get(b"alpha"), Some(b"one".to_vec()));

    assert!(db.delete(b"alpha"));
    assert!(!db.delete(b"alpha"));
    assert_eq!(db.get(b"alpha"), None);
    assert_eq!(db.record_count(), 1);
}

#[test]
fn test_put_no_overwrite() {
    let (_temp, env) = setup_temp_env();
    let db = env.open_database("test", bytewise()).unwrap();

    assert!(db.put_no_overwrite(b"k", b"first"));
    assert!(!db.put_no_overwrite(b"k", b"second"));
    assert_eq!(db.get(b"k"), Some(b"first".to_vec()));
}

#[test]
fn test_update_read_modify_write() {
    let (_temp, env) = setup_temp_env();
    let db = env.open_database("counter", bytewise()).unwrap();

    for _ in 0..5 {
        db.update(b"n", |old| {
            let n = old.map(|v| v[0]).unwrap_or(0);
            Ok(Some(vec![n + 1]))
        })
        .unwrap();
    }
    assert_eq!(db.get(b"n"), Some(vec![5]));

    // Returning None deletes the key
    db.update(b"n", |_| Ok(None)).unwrap();
    assert!(!db.contains(b"n"));
}

#[test]
fn test_update_error_leaves_value() {
    let (_temp, env) = setup_temp_env();
    let db = env.open_database("test", bytewise()).unwrap();
    db.put(b"k", b"v");

    let result = db.update(b"k", |_| Err(DirError::Storage("boom".to_string())));
    assert!(result.is_err());
    assert_eq!(db.get(b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_open_database_returns_same_handle() {
    let (_temp, env) = setup_temp_env();
    let a = env.open_database("shared", bytewise()).unwrap();
    let b = env.open_database("shared", bytewise()).unwrap();
    a.put(b"k", b"v");
    assert_eq!(b.get(b"k"), Some(b"v".to_vec()));
    assert!(Arc::ptr_eq(&a, &b));
}

// =============================================================================
// Ordering and Cursors
// =============================================================================

#[test]
fn test_range_bounds() {
    let (_temp, env) = setup_temp_env();
    let db = env.open_database("range", bytewise()).unwrap();
    for k in [b"a", b"b", b"c", b"d", b"e"] {
        db.put(k, b"");
    }

    let keys = |records: Vec<(Vec<u8>, Vec<u8>)>| records.into_iter().map(|(k, _)| k).collect::<Vec<_>>();

    let inclusive = db.range(Bound::Included(b"b".as_slice()), Bound::Included(b"d".as_slice()));
    assert_eq!(keys(inclusive), vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

    let exclusive = db.range(Bound::Excluded(b"b".as_slice()), Bound::Excluded(b"d".as_slice()));
    assert_eq!(keys(exclusive), vec![b"c".to_vec()]);

    let all = db.range(Bound::Unbounded, Bound::Unbounded);
    assert_eq!(all.len(), 5);
}

#[test]
fn test_custom_comparator_orders_keys() {
    let (_temp, env) = setup_temp_env();
    let db = env.open_database("desc", Arc::new(Descending)).unwrap();
    for k in [b"1", b"3", b"2"] {
        db.put(k, b"");
    }

    assert_eq!(db.first().map(|(k, _)| k), Some(b"3".to_vec()));
    assert_eq!(db.last().map(|(k, _)| k), Some(b"1".to_vec()));

    let mut cursor = db.cursor();
    let mut seen = Vec::new();
    while let Some((k, _)) = cursor.next() {
        seen.push(k);
    }
    assert_eq!(seen, vec![b"3".to_vec(), b"2".to_vec(), b"1".to_vec()]);
}

#[test]
fn test_seek_finds_first_key_at_or_after() {
    let (_temp, env) = setup_temp_env();
    let db = env.open_database("seek", bytewise()).unwrap();
    db.put(b"apple", b"1");
    db.put(b"cherry", b"3");

    assert_eq!(db.seek(b"banana").map(|(k, _)| k), Some(b"cherry".to_vec()));
    assert_eq!(db.seek(b"apple").map(|(k, _)| k), Some(b"apple".to_vec()));
    assert_eq!(db.seek(b"zebra"), None);
    assert_eq!(db.prev_before(b"cherry").map(|(k, _)| k), Some(b"apple".to_vec()));
}

#[test]
fn test_cursor_sees_concurrent_writes() {
    let (_temp, env) = setup_temp_env();
    let db = env.open_database("cursor", bytewise()).unwrap();
    db.put(b"a", b"");
    db.put(b"c", b"");

    let mut cursor = db.cursor();
    assert_eq!(cursor.next().map(|(k, _)| k), Some(b"a".to_vec()));
    db.put(b"b", b"");
    assert_eq!(cursor.next().map(|(k, _)| k), Some(b"b".to_vec()));
    assert_eq!(cursor.next().map(|(k, _)| k), Some(b"c".to_vec()));
    assert_eq!(cursor.next(), None);
}

#[test]
fn test_truncate() {
    let (_temp, env) = setup_temp_env();
    let db = env.open_database("t", bytewise()).unwrap();
    for i in 0u8..10 {
        db.put(&[i], &[i]);
    }
    db.truncate();
    assert!(db.is_empty());
    assert_eq!(db.disk_ordered_scan().len(), 0);
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_sync_and_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = Environment::open(temp_dir.path()).unwrap();
        let db = env.open_database("persist", bytewise()).unwrap();
        for i in 0u32..100 {
            db.put(&i.to_be_bytes(), format!("value-{}", i).as_bytes());
        }
        env.sync().unwrap();
    }

    let env = Environment::open(temp_dir.path()).unwrap();
    let db = env.open_database("persist", bytewise()).unwrap();
    assert_eq!(db.record_count(), 100);
    assert_eq!(db.get(&42u32.to_be_bytes()), Some(b"value-42".to_vec()));
    assert!(env.database_names().unwrap().contains(&"persist".to_string()));
}

#[test]
fn test_reopen_with_other_comparator_fails() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = Environment::open(temp_dir.path()).unwrap();
        let db = env.open_database("cmp", bytewise()).unwrap();
        db.put(b"k", b"v");
        env.sync().unwrap();
    }

    let env = Environment::open(temp_dir.path()).unwrap();
    let err = env.open_database("cmp", Arc::new(Descending)).unwrap_err();
    assert!(matches!(err, DirError::Storage(_)));
}

#[test]
fn test_remove_database_deletes_file() {
    let (temp, env) = setup_temp_env();
    let db = env.open_database("gone", bytewise()).unwrap();
    db.put(b"k", b"v");
    env.sync().unwrap();
    assert!(temp.path().join("gone.db").exists());

    env.remove_database("gone").unwrap();
    assert!(!temp.path().join("gone.db").exists());
}

#[test]
fn test_temporary_environment_removed_on_drop() {
    let temp_dir = TempDir::new().unwrap();
    let scratch = temp_dir.path().join("scratch");
    {
        let env = Environment::temporary(&scratch).unwrap();
        let db = env.open_database("tmp", bytewise()).unwrap();
        db.put(b"k", b"v");
        env.sync().unwrap();
        assert!(scratch.exists());
    }
    assert!(!scratch.exists());
}
