//! Tests for a single key → entry ID set index
//!
//! These tests verify:
//! - Entry limit handling with and without count maintenance
//! - Trusted and rebuild flags gate reads
//! - Range reads and membership checks

use dirstore::idset::ConditionResult;
use dirstore::index::{Index, State};
use dirstore::storage::Environment;
use dirstore::{EntryId, EntryIdSet};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_index(entry_limit: usize, maintain_count: bool) -> (TempDir, Environment, State, Index) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path()).unwrap();
    let state = State::open(&env, "test").unwrap();
    let index = Index::open(&env, &state, "test_cn.equality", entry_limit, maintain_count, true).unwrap();
    (temp_dir, env, state, index)
}

fn id(n: u64) -> EntryId {
    EntryId::new(n)
}

// =============================================================================
// Writes
// =============================================================================

#[test]
fn test_insert_and_delete_ids() {
    let (_temp, _env, _state, index) = setup_temp_index(10, true);

    index.insert_id(b"john", id(1)).unwrap();
    index.insert_id(b"john", id(3)).unwrap();
    index.insert_id(b"jane", id(2)).unwrap();
    assert_eq!(index.read_key(b"john").unwrap(), EntryIdSet::from_ids([id(1), id(3)]));
    assert_eq!(index.key_count(), 2);

    index.delete_id(b"john", id(1)).unwrap();
    index.delete_id(b"john", id(3)).unwrap();
    // An emptied key is removed
    assert_eq!(index.key_count(), 1);
    assert!(index.read_key(b"john").unwrap().is_empty());
}

#[test]
fn test_entry_limit_with_count() {
    let (_temp, _env, _state, index) = setup_temp_index(3, true);

    for n in 1..=3 {
        index.insert_id(b"person", id(n)).unwrap();
    }
    assert!(index.read_key(b"person").unwrap().is_defined());
    assert_eq!(index.entry_limit_exceeded_count(), 0);

    index.insert_id(b"person", id(4)).unwrap();
    assert_eq!(index.read_key(b"person").unwrap(), EntryIdSet::CountOnly(4));
    assert_eq!(index.entry_limit_exceeded_count(), 1);

    // Further changes only move the count
    index.insert_id(b"person", id(5)).unwrap();
    index.delete_id(b"person", id(1)).unwrap();
    assert_eq!(index.read_key(b"person").unwrap(), EntryIdSet::CountOnly(4));
    assert_eq!(index.entry_limit_exceeded_count(), 1);
}

#[test]
fn test_entry_limit_without_count() {
    let (_temp, _env, _state, index) = setup_temp_index(2, false);
    index
        .insert(b"top", &EntryIdSet::from_ids([id(1), id(2), id(3)]))
        .unwrap();
    assert_eq!(index.read_key(b"top").unwrap(), EntryIdSet::Undefined);
    assert_eq!(index.contains_id(b"top", id(1)).unwrap(), ConditionResult::Undefined);
    assert_eq!(index.entry_limit_exceeded_count(), 1);
}

#[test]
fn test_unlimited_index() {
    let (_temp, _env, _state, index) = setup_temp_index(0, true);
    let ids: Vec<EntryId> = (1..=500).map(id).collect();
    index.insert(b"k", &EntryIdSet::from_ids(ids)).unwrap();
    assert_eq!(index.read_key(b"k").unwrap().size(), Some(500));
}

#[test]
fn test_update_key_applies_both_sides() {
    let (_temp, _env, _state, index) = setup_temp_index(10, true);
    index.insert(b"k", &EntryIdSet::from_ids([id(1), id(2)])).unwrap();
    index
        .update_key(b"k", &EntryIdSet::single(id(1)), &EntryIdSet::single(id(7)))
        .unwrap();
    assert_eq!(index.read_key(b"k").unwrap(), EntryIdSet::from_ids([id(2), id(7)]));
}

#[test]
fn test_clear_resets_counter() {
    let (_temp, _env, _state, index) = setup_temp_index(1, true);
    index.insert(b"k", &EntryIdSet::from_ids([id(1), id(2)])).unwrap();
    assert_eq!(index.entry_limit_exceeded_count(), 1);

    index.clear();
    assert_eq!(index.key_count(), 0);
    assert_eq!(index.entry_limit_exceeded_count(), 0);
}

// =============================================================================
// Reads
// =============================================================================

#[test]
fn test_read_range_unions_keys() {
    let (_temp, _env, _state, index) = setup_temp_index(10, true);
    index.insert_id(b"a", id(1)).unwrap();
    index.insert_id(b"b", id(2)).unwrap();
    index.insert_id(b"c", id(3)).unwrap();
    index.insert_id(b"d", id(4)).unwrap();

    assert_eq!(
        index.read_range(b"b", b"c", true, true).unwrap(),
        EntryIdSet::from_ids([id(2), id(3)])
    );
    assert_eq!(
        index.read_range(b"b", b"d", false, false).unwrap(),
        EntryIdSet::from_ids([id(3)])
    );
    assert_eq!(index.read_range(b"", b"b", true, true).unwrap().size(), Some(2));
    assert_eq!(index.read_range(b"c", b"", true, true).unwrap().size(), Some(2));
}

#[test]
fn test_contains_id() {
    let (_temp, _env, _state, index) = setup_temp_index(10, true);
    index.insert_id(b"k", id(5)).unwrap();
    assert_eq!(index.contains_id(b"k", id(5)).unwrap(), ConditionResult::True);
    assert_eq!(index.contains_id(b"k", id(6)).unwrap(), ConditionResult::False);
    assert_eq!(index.contains_id(b"missing", id(5)).unwrap(), ConditionResult::False);
}

// =============================================================================
// Trusted State
// =============================================================================

#[test]
fn test_untrusted_index_reads_undefined() {
    let (_temp, _env, state, index) = setup_temp_index(10, true);
    index.insert_id(b"k", id(1)).unwrap();

    index.set_trusted(false);
    assert_eq!(state.get_trusted("test_cn.equality"), Some(false));
    assert_eq!(index.read_key(b"k").unwrap(), EntryIdSet::Undefined);
    assert_eq!(index.read_range(b"", b"", true, true).unwrap(), EntryIdSet::Undefined);
    // Raw reads ignore the flag
    assert_eq!(index.read_raw(b"k").unwrap(), EntryIdSet::single(id(1)));

    index.set_trusted(true);
    assert_eq!(index.read_key(b"k").unwrap(), EntryIdSet::single(id(1)));
}

#[test]
fn test_rebuild_running_reads_undefined() {
    let (_temp, _env, _state, index) = setup_temp_index(10, true);
    index.insert_id(b"k", id(1)).unwrap();
    index.set_rebuild_status(true);
    assert!(index.is_rebuild_running());
    assert_eq!(index.contains_id(b"k", id(1)).unwrap(), ConditionResult::Undefined);
    index.set_rebuild_status(false);
    assert_eq!(index.contains_id(b"k", id(1)).unwrap(), ConditionResult::True);
}

#[test]
fn test_new_index_on_populated_container_is_untrusted() {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path()).unwrap();
    let state = State::open(&env, "test").unwrap();

    let index = Index::open(&env, &state, "test_sn.equality", 10, true, false).unwrap();
    assert!(!index.is_trusted());
    assert_eq!(state.untrusted(), vec!["test_sn.equality".to_string()]);
}

#[test]
fn test_trusted_flag_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let env = Environment::open(temp_dir.path()).unwrap();
        let state = State::open(&env, "test").unwrap();
        let index = Index::open(&env, &state, "test_cn.equality", 10, true, true).unwrap();
        index.insert_id(b"k", id(1)).unwrap();
        index.set_trusted(false);
        env.sync().unwrap();
    }

    let env = Environment::open(temp_dir.path()).unwrap();
    let state = State::open(&env, "test").unwrap();
    let index = Index::open(&env, &state, "test_cn.equality", 10, true, false).unwrap();
    assert!(!index.is_trusted());
    assert_eq!(index.read_raw(b"k").unwrap(), EntryIdSet::single(id(1)));
}
