//! Tests for attribute indexes inside a container
//!
//! These tests verify:
//! - Keys are maintained across add, modify and delete
//! - Each filter type is answered by the matching index
//! - Entry limits turn keys undefined and count the flips
//! - Reconfiguration adds, drops and distrusts indexes

use std::sync::Arc;

use dirstore::config::IndexType::{self, *};
use dirstore::idset::ConditionResult;
use dirstore::index::PRESENCE_KEY;
use dirstore::{
    Config, Dn, Entry, EntryContainer, EntryId, EntryIdSet, Filter, IndexConfig, Modification, RootContainer, Schema,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const BASE: &str = "dc=example,dc=com";

fn setup_temp_container(indexes: Vec<IndexConfig>, entry_limit: usize) -> (TempDir, RootContainer, Arc<EntryContainer>) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .base_dn(BASE)
        .unwrap()
        .indexes(indexes)
        .index_entry_limit(entry_limit)
        .build();
    let root = RootContainer::open(config, Schema::default_schema()).unwrap();
    let container = root.container(&dn(BASE)).unwrap();
    container
        .add_entry(&Entry::new(dn(BASE)).with("objectClass", &["top", "domain"]).with("dc", &["example"]))
        .unwrap();
    container
        .add_entry(&Entry::new(dn("ou=people,dc=example,dc=com")).with("objectClass", &["organizationalUnit"]))
        .unwrap();
    (temp_dir, root, container)
}

fn dn(s: &str) -> Dn {
    Dn::parse(s).unwrap()
}

fn person(uid: &str, cn: &str, number: u32) -> Entry {
    Entry::new(dn(&format!("uid={},ou=people,dc=example,dc=com", uid)))
        .with("objectClass", &["top", "person"])
        .with("uid", &[uid])
        .with("cn", &[cn])
        .with("uidNumber", &[&number.to_string()])
}

fn eval(container: &EntryContainer, filter: &str) -> EntryIdSet {
    container.evaluate_filter(&Filter::parse(filter).unwrap(), &mut None)
}

fn people_indexes() -> Vec<IndexConfig> {
    vec![
        IndexConfig::new("objectclass", &[Equality]),
        IndexConfig::new("cn", &[Presence, Equality, Substring, Approximate]),
        IndexConfig::new("uid", &[Equality]),
        IndexConfig::new("uidnumber", &[Equality, Ordering]),
    ]
}

// =============================================================================
// Key Maintenance
// =============================================================================

#[test]
fn test_add_entry_writes_every_index() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    let id = container.add_entry(&person("jdoe", "John Doe", 1000)).unwrap();

    let cn = container.attribute_index("cn").unwrap();
    let presence = cn.index_of_type(Presence).unwrap();
    assert_eq!(presence.read_key(PRESENCE_KEY).unwrap(), EntryIdSet::single(id));
    let equality = cn.index("equality").unwrap();
    assert_eq!(equality.read_key(b"john doe").unwrap(), EntryIdSet::single(id));
    let substring = cn.index("substring").unwrap();
    assert_eq!(substring.read_key(b"ohn do").unwrap(), EntryIdSet::single(id));
}

#[test]
fn test_modify_moves_keys() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    let id = container.add_entry(&person("jdoe", "John Doe", 1000)).unwrap();

    container
        .modify_entry(
            &dn("uid=jdoe,ou=people,dc=example,dc=com"),
            &[Modification::replace("cn", &["Johnny"])],
        )
        .unwrap();

    assert!(eval(&container, "(cn=John Doe)").is_empty());
    assert_eq!(eval(&container, "(cn=johnny)"), EntryIdSet::single(id));
    // Presence key stays since cn still has a value
    assert_eq!(eval(&container, "(cn=*)"), EntryIdSet::single(id));
}

#[test]
fn test_delete_removes_keys() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    container.add_entry(&person("jdoe", "John Doe", 1000)).unwrap();
    container
        .delete_entry(&dn("uid=jdoe,ou=people,dc=example,dc=com"), false)
        .unwrap();

    let cn = container.attribute_index("cn").unwrap();
    for index in cn.indexes() {
        assert_eq!(index.key_count(), 0, "{} still has keys", index.name());
    }
}

// =============================================================================
// Filter Evaluation
// =============================================================================

#[test]
fn test_equality_and_presence() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    let a = container.add_entry(&person("a", "Alice Smith", 1)).unwrap();
    let b = container.add_entry(&person("b", "Bob Smith", 2)).unwrap();

    assert_eq!(eval(&container, "(uid=A)"), EntryIdSet::single(a));
    assert_eq!(eval(&container, "(cn=*)"), EntryIdSet::from_ids([a, b]));
    assert!(eval(&container, "(uid=nobody)").is_empty());
}

#[test]
fn test_substring_filters() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    let a = container.add_entry(&person("a", "Alice Smith", 1)).unwrap();
    let b = container.add_entry(&person("b", "Bob Smithers", 2)).unwrap();

    assert_eq!(eval(&container, "(cn=*smith*)"), EntryIdSet::from_ids([a, b]));
    assert_eq!(eval(&container, "(cn=alice*)"), EntryIdSet::single(a));
    // Long elements become exact window lookups
    assert_eq!(eval(&container, "(cn=*smithers)"), EntryIdSet::single(b));
}

#[test]
fn test_ordering_ranges() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    let ids: Vec<EntryId> = (0..5)
        .map(|i| container.add_entry(&person(&format!("u{}", i), "x", 100 + i)).unwrap())
        .collect();

    assert_eq!(eval(&container, "(uidNumber>=103)"), EntryIdSet::from_ids([ids[3], ids[4]]));
    assert_eq!(eval(&container, "(uidNumber<=100)"), EntryIdSet::single(ids[0]));
    assert_eq!(
        eval(&container, "(&(uidNumber>=101)(uidNumber<=102))"),
        EntryIdSet::from_ids([ids[1], ids[2]])
    );
}

#[test]
fn test_approximate() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    let id = container.add_entry(&person("r", "Robert", 1)).unwrap();
    assert_eq!(eval(&container, "(cn~=Rupert)"), EntryIdSet::single(id));
}

#[test]
fn test_unindexed_filters_are_undefined() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    container.add_entry(&person("a", "Alice", 1)).unwrap();

    assert_eq!(eval(&container, "(sn=smith)"), EntryIdSet::Undefined);
    assert_eq!(eval(&container, "(!(uid=a))"), EntryIdSet::Undefined);
    // No ordering index on uid
    assert_eq!(eval(&container, "(uid>=a)"), EntryIdSet::Undefined);
}

#[test]
fn test_and_or_combination() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    let a = container.add_entry(&person("a", "Alice", 1)).unwrap();
    let b = container.add_entry(&person("b", "Bob", 2)).unwrap();
    container.add_entry(&person("c", "Carol", 3)).unwrap();

    assert_eq!(eval(&container, "(|(uid=a)(uid=b))"), EntryIdSet::from_ids([a, b]));
    assert_eq!(eval(&container, "(&(objectClass=person)(uid=b))"), EntryIdSet::single(b));
    // An unindexed OR branch makes the OR undefined
    assert_eq!(eval(&container, "(|(uid=a)(sn=x))"), EntryIdSet::Undefined);
    // An unindexed AND branch is ignored
    assert_eq!(eval(&container, "(&(uid=a)(sn=x))"), EntryIdSet::single(a));
}

#[test]
fn test_extensible_filters() {
    let indexes = vec![IndexConfig::new("cn", &[Equality]).with_extensible_rules(&["caseExactMatch"])];
    let (_temp, _root, container) = setup_temp_container(indexes, 4000);
    let id = container.add_entry(&person("a", "Alice", 1)).unwrap();

    assert_eq!(eval(&container, "(cn:caseExactMatch:=Alice)"), EntryIdSet::single(id));
    assert!(eval(&container, "(cn:caseExactMatch:=alice)").is_empty());
    // The attribute's equality rule falls back to the equality index
    assert_eq!(eval(&container, "(cn:caseIgnoreMatch:=ALICE)"), EntryIdSet::single(id));
    assert_eq!(eval(&container, "(cn:=alice)"), EntryIdSet::single(id));
    // No index for this rule
    assert_eq!(eval(&container, "(cn:integerMatch:=1)"), EntryIdSet::Undefined);
}

#[test]
fn test_debug_trace() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    container.add_entry(&person("a", "Alice", 1)).unwrap();

    let mut trace = String::new();
    container.evaluate_filter(&Filter::parse("(|(uid=a)(sn=x))").unwrap(), &mut Some(&mut trace));
    assert!(trace.contains("[INDEX:uid.equality]"), "trace: {}", trace);
    assert!(trace.contains("[NOT-INDEXED]"), "trace: {}", trace);
}

// =============================================================================
// Entry Limit
// =============================================================================

#[test]
fn test_entry_limit_makes_key_undefined() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 3);
    for i in 0..5 {
        container.add_entry(&person(&format!("u{}", i), "same", i)).unwrap();
    }

    // objectClass=person is over the limit; uid still narrows it down
    let set = eval(&container, "(objectClass=person)");
    assert!(!set.is_defined());
    assert_eq!(set.size(), Some(5));
    // "top" and "person" each crossed the limit once
    assert_eq!(container.attribute_index("objectclass").unwrap().entry_limit_exceeded_count(), 2);
    assert_eq!(eval(&container, "(&(objectClass=person)(uid=u2))").size(), Some(1));
}

#[test]
fn test_entry_limit_counted_once_per_key() {
    let indexes = vec![
        IndexConfig::new("objectclass", &[Equality]),
        IndexConfig::new("uid", &[Equality]),
        IndexConfig::new("cn", &[Equality]).with_entry_limit(100),
    ];
    let (_temp, _root, container) = setup_temp_container(indexes, 4000);
    let cn = container.attribute_index("cn").unwrap();
    let cn_eq = cn.index("equality").unwrap();

    let mut ids = Vec::new();
    for i in 0..150u32 {
        ids.push(container.add_entry(&person(&format!("u{}", i), "Shared", i)).unwrap());
        let expected = if i < 100 { 0 } else { 1 };
        assert_eq!(cn.entry_limit_exceeded_count(), expected, "after add {}", i);
    }

    assert_eq!(cn.entry_limit_exceeded_count(), 1);
    for id in [ids[0], ids[99], ids[149]] {
        assert_eq!(cn_eq.contains_id(b"shared", id).unwrap(), ConditionResult::Undefined);
    }
    assert!(!eval(&container, "(cn=shared)").is_defined());
    // Keys under the limit stay exact
    assert_eq!(cn_eq.contains_id(b"other", ids[0]).unwrap(), ConditionResult::False);
    assert_eq!(eval(&container, "(uid=u42)"), EntryIdSet::single(ids[42]));
    assert_eq!(container.attribute_index("objectclass").unwrap().entry_limit_exceeded_count(), 0);
}

#[test]
fn test_per_index_entry_limit_override() {
    let indexes = vec![
        IndexConfig::new("objectclass", &[Equality]).with_entry_limit(0),
        IndexConfig::new("cn", &[Equality]).with_entry_limit(2),
    ];
    let (_temp, _root, container) = setup_temp_container(indexes, 4000);
    for i in 0..4 {
        container.add_entry(&person(&format!("u{}", i), "same", i)).unwrap();
    }
    assert!(eval(&container, "(objectClass=person)").is_defined());
    assert!(!eval(&container, "(cn=same)").is_defined());
}

// =============================================================================
// Reconfiguration
// =============================================================================

#[test]
fn test_new_index_on_populated_container_needs_rebuild() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    container.add_entry(&person("a", "Alice", 1)).unwrap();

    let result = container.apply_index_config(IndexConfig::new("sn", &[Equality])).unwrap();
    assert!(result.admin_action_required);
    let sn = container.attribute_index("sn").unwrap();
    assert!(!sn.index("equality").unwrap().is_trusted());
    assert_eq!(eval(&container, "(sn=x)"), EntryIdSet::Undefined);
}

#[test]
fn test_removing_index_type_drops_database() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    let cn = container.attribute_index("cn").unwrap();
    let substring_name = cn.index("substring").unwrap().name().to_string();

    let result = cn
        .apply_configuration_change(IndexConfig::new("cn", &[Equality]), false)
        .unwrap();
    assert!(!result.admin_action_required);
    assert!(cn.index("substring").is_none());
    assert!(!container.index_names().contains(&substring_name));
    assert_eq!(eval(&container, "(cn=*smith*)"), EntryIdSet::Undefined);
}

#[test]
fn test_substring_length_change_distrusts_index() {
    let (_temp, _root, container) = setup_temp_container(people_indexes(), 4000);
    container.add_entry(&person("a", "Alice", 1)).unwrap();

    let types: Vec<IndexType> = vec![Presence, Equality, Substring, Approximate];
    let result = container
        .apply_index_config(IndexConfig::new("cn", &types).with_substring_length(3))
        .unwrap();
    assert!(result.admin_action_required);
    assert!(!container.attribute_index("cn").unwrap().index("substring").unwrap().is_trusted());
    assert!(container.attribute_index("cn").unwrap().index("equality").unwrap().is_trusted());
}

#[test]
fn test_missing_matching_rule_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .base_dn(BASE)
        .unwrap()
        .indexes(vec![IndexConfig::new("member", &[Substring])])
        .build();
    assert!(matches!(
        RootContainer::open(config, Schema::default_schema()),
        Err(dirstore::DirError::Config(_))
    ));
}
