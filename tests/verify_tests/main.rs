//! Index verification tests
//!
//! These tests verify:
//! - A consistent backend verifies clean in both modes
//! - Complete mode finds entries missing from dn2id, subordinate,
//!   attribute and VLV indexes
//! - Clean mode finds index records that no longer match their entries
//! - Reference and entry limit statistics
//! - Verification never writes

use std::ops::Bound;
use std::sync::Arc;

use dirstore::config::IndexType::*;
use dirstore::{
    Config, DirError, Dn, Entry, EntryContainer, EntryId, IndexConfig, RootContainer, Schema, SearchScope,
    VerifyConfig, VerifyJob, VerifyResult, VlvIndexConfig,
};
use tempfile::TempDir;

const BASE: &str = "dc=example,dc=com";
const PEOPLE: &str = "ou=people,dc=example,dc=com";

fn dn(s: &str) -> Dn {
    Dn::parse(s).unwrap()
}

fn person(i: usize) -> Entry {
    Entry::new(dn(&format!("uid=user{},{}", i, PEOPLE)))
        .with("objectClass", &["top", "person"])
        .with("uid", &[&format!("user{}", i)])
        .with("cn", &[&format!("User {}", i)])
        .with("sn", &[&format!("Surname{}", i)])
}

fn config(dir: &std::path::Path, subordinate_indexes: bool) -> Config {
    Config::builder()
        .data_dir(dir)
        .base_dn(BASE)
        .unwrap()
        .indexes(vec![
            IndexConfig::new("objectclass", &[Equality]).with_entry_limit(5),
            IndexConfig::new("uid", &[Equality]),
            IndexConfig::new("cn", &[Equality, Substring]),
            IndexConfig::new("sn", &[Equality]),
        ])
        .vlv_index(
            VlvIndexConfig::new("bysn", BASE, SearchScope::WholeSubtree, "(objectClass=person)", "sn")
                .unwrap()
                .with_max_block_size(4),
        )
        .subordinate_indexes_enabled(subordinate_indexes)
        .build()
}

/// Base, ou=people and eight people
fn setup_temp_backend() -> (TempDir, RootContainer, Arc<EntryContainer>) {
    setup_temp_backend_with(true)
}

fn setup_temp_backend_with(subordinate_indexes: bool) -> (TempDir, RootContainer, Arc<EntryContainer>) {
    let temp_dir = TempDir::new().unwrap();
    let root = RootContainer::open(config(temp_dir.path(), subordinate_indexes), Schema::default_schema()).unwrap();
    let container = root.container(&dn(BASE)).unwrap();
    container
        .add_entry(&Entry::new(dn(BASE)).with("objectClass", &["top", "domain"]))
        .unwrap();
    container
        .add_entry(&Entry::new(dn(PEOPLE)).with("objectClass", &["top", "organizationalUnit"]))
        .unwrap();
    for i in 0..8 {
        container.add_entry(&person(i)).unwrap();
    }
    (temp_dir, root, container)
}

fn complete(root: &RootContainer, names: &[&str]) -> VerifyResult {
    VerifyJob::new(root, VerifyConfig::new(dn(BASE)).complete(names)).verify().unwrap()
}

fn clean(root: &RootContainer, name: &str) -> VerifyResult {
    VerifyJob::new(root, VerifyConfig::new(dn(BASE)).clean(name)).verify().unwrap()
}

fn id_of(container: &EntryContainer, i: usize) -> EntryId {
    container
        .entry_id_for_dn(&dn(&format!("uid=user{},{}", i, PEOPLE)))
        .unwrap()
        .unwrap()
}

/// Equality key of a cn value
fn cn_key(container: &EntryContainer, value: &str) -> Vec<u8> {
    let attr = container.attribute_index("cn").unwrap();
    let (indexer, _) = attr
        .indexers()
        .into_iter()
        .find(|(indexer, _)| indexer.index_id() == "equality")
        .unwrap();
    indexer.values_to_keys(&[value.as_bytes().to_vec()]).into_iter().next().unwrap()
}

// =============================================================================
// Consistent backend
// =============================================================================

#[test]
fn test_complete_on_consistent_backend() {
    let (_temp, root, _container) = setup_temp_backend();
    let result = complete(&root, &[]);
    assert!(result.is_clean(), "{:?}", result);
    assert!(!result.clean_mode);
    assert_eq!(result.key_count, 10);
}

#[test]
fn test_clean_on_consistent_backend() {
    let (_temp, root, _container) = setup_temp_backend();
    for name in ["dn2id", "id2children", "id2subtree", "cn", "uid.equality", "vlv.bysn"] {
        let result = clean(&root, name);
        assert!(result.clean_mode);
        assert!(result.is_clean(), "{}: {:?}", name, result);
        assert!(result.key_count > 0, "{}", name);
    }
}

#[test]
fn test_verify_is_read_only() {
    let (_temp, root, container) = setup_temp_backend();
    let before: Vec<_> = container
        .all_indexes()
        .iter()
        .map(|i| i.database().range(Bound::Unbounded, Bound::Unbounded))
        .collect();
    complete(&root, &[]);
    clean(&root, "cn.substring");
    let after: Vec<_> = container
        .all_indexes()
        .iter()
        .map(|i| i.database().range(Bound::Unbounded, Bound::Unbounded))
        .collect();
    assert_eq!(before, after);
}

// =============================================================================
// Complete mode errors
// =============================================================================

#[test]
fn test_complete_finds_missing_attribute_id() {
    let (_temp, root, container) = setup_temp_backend();
    let cn_eq = container.attribute_index("cn").unwrap().index("equality").unwrap();
    cn_eq.delete_id(&cn_key(&container, "User 3"), id_of(&container, 3)).unwrap();

    assert_eq!(complete(&root, &["cn.equality"]).error_count, 1);
    // The substring index is intact
    assert!(complete(&root, &["cn.substring"]).is_clean());
}

#[test]
fn test_complete_finds_missing_dn2id_record() {
    let (_temp, root, container) = setup_temp_backend();
    container.dn2id().remove(&dn(&format!("uid=user5,{}", PEOPLE)));

    // Missing key plus the record count mismatch
    assert_eq!(complete(&root, &["dn2id"]).error_count, 2);
}

#[test]
fn test_complete_finds_missing_subordinate_ids() {
    let (_temp, root, container) = setup_temp_backend();
    let people_id = container.entry_id_for_dn(&dn(PEOPLE)).unwrap().unwrap();
    let base_id = container.entry_id_for_dn(&dn(BASE)).unwrap().unwrap();
    container.id2children().delete_id(&people_id.to_bytes(), id_of(&container, 1)).unwrap();
    container.id2subtree().delete_id(&base_id.to_bytes(), id_of(&container, 2)).unwrap();

    assert_eq!(complete(&root, &["id2children"]).error_count, 1);
    assert_eq!(complete(&root, &["id2subtree"]).error_count, 1);
}

#[test]
fn test_complete_finds_missing_vlv_tuple() {
    let (_temp, root, container) = setup_temp_backend();
    let vlv = container.vlv_index("bysn").unwrap();
    let id = id_of(&container, 4);
    let entry = container.get_entry_by_id(id).unwrap().unwrap();
    vlv.update_index(Vec::new(), vec![vlv.sort_values(id, &entry)]).unwrap();

    let result = complete(&root, &["vlv.bysn"]);
    assert_eq!(result.error_count, 1);
}

#[test]
fn test_subordinate_checks_need_the_indexes() {
    let (_temp, root, _container) = setup_temp_backend_with(false);
    let err = VerifyJob::new(&root, VerifyConfig::new(dn(BASE)).complete(&["id2children"]))
        .verify()
        .unwrap_err();
    assert!(matches!(err, DirError::Config(_)));
    assert!(complete(&root, &[]).is_clean());
}

// =============================================================================
// Clean mode errors
// =============================================================================

#[test]
fn test_clean_finds_foreign_id() {
    let (_temp, root, container) = setup_temp_backend();
    let cn_eq = container.attribute_index("cn").unwrap().index("equality").unwrap();
    cn_eq.insert_id(&cn_key(&container, "User 3"), id_of(&container, 6)).unwrap();
    cn_eq.insert_id(&cn_key(&container, "User 4"), EntryId::new(9999)).unwrap();

    assert_eq!(clean(&root, "cn.equality").error_count, 2);
    // Complete mode only checks that expected IDs are present
    assert!(complete(&root, &["cn.equality"]).is_clean());
}

#[test]
fn test_clean_finds_stale_entry_data() {
    let (_temp, root, container) = setup_temp_backend();
    let id = id_of(&container, 2);
    let mut entry = container.get_entry_by_id(id).unwrap().unwrap();
    entry.replace_values("sn", vec![b"Changed".to_vec()]);
    // Bypass index maintenance
    container.id2entry().put(id, &entry).unwrap();

    assert_eq!(clean(&root, "sn").error_count, 1);
    assert_eq!(clean(&root, "vlv.bysn").error_count, 1);
    assert_eq!(complete(&root, &["sn"]).error_count, 1);
}

#[test]
fn test_clean_finds_misplaced_child() {
    let (_temp, root, container) = setup_temp_backend();
    let base_id = container.entry_id_for_dn(&dn(BASE)).unwrap().unwrap();
    container.id2children().insert_id(&base_id.to_bytes(), id_of(&container, 0)).unwrap();

    assert_eq!(clean(&root, "id2children").error_count, 1);
    assert!(clean(&root, "id2subtree").is_clean());
}

#[test]
fn test_clean_finds_dangling_dn2id() {
    let (_temp, root, container) = setup_temp_backend();
    container.id2entry().remove(id_of(&container, 7));
    assert_eq!(clean(&root, "dn2id").error_count, 1);
}

// =============================================================================
// Statistics
// =============================================================================

#[test]
fn test_clean_reference_statistics() {
    let (_temp, root, _container) = setup_temp_backend();
    // Keys: top (10 entries) and person (8) are past the limit of 5,
    // domain and organizationalunit hold one entry each
    let result = clean(&root, "objectclass.equality");
    assert!(result.is_clean());
    assert_eq!(result.key_count, 4);
    assert_eq!(result.entry_limit_exceeded_count, 2);
    assert_eq!(result.multi_reference_count, 2);
    assert_eq!(result.entry_references_count, 2);
    assert_eq!(result.max_entry_per_value, 1);
    assert_eq!(result.average_references(), 0);
}

#[test]
fn test_complete_entry_limit_statistics() {
    let (_temp, root, container) = setup_temp_backend();
    let result = complete(&root, &["objectclass"]);
    assert!(result.is_clean());

    let name = container.attribute_index("objectclass").unwrap().index("equality").unwrap().name().to_string();
    assert_eq!(result.entry_limit_stats.len(), 1);
    let stats = &result.entry_limit_stats[0];
    assert_eq!(stats.index, name);
    assert_eq!(stats.keys, 2);
    assert_eq!(stats.min, 8);
    assert_eq!(stats.max, 10);
    assert_eq!(stats.median, 9);
}

// =============================================================================
// Configuration errors
// =============================================================================

#[test]
fn test_unknown_names() {
    let (_temp, root, _container) = setup_temp_backend();
    for name in ["mail", "cn.ordering", "vlv.missing"] {
        let err = VerifyJob::new(&root, VerifyConfig::new(dn(BASE)).complete(&[name]))
            .verify()
            .unwrap_err();
        assert!(matches!(err, DirError::IndexNotConfigured(_)), "{}", name);
    }
    let err = VerifyJob::new(&root, VerifyConfig::new(dn("dc=other"))).verify().unwrap_err();
    assert!(matches!(err, DirError::Config(_)));
}
