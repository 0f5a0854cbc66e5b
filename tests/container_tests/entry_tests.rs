//! Tests for entry writes
//!
//! These tests verify:
//! - Parent and duplicate checks on add
//! - Leaf and subtree delete
//! - Modify keeps RDN values
//! - Rename moves whole subtrees and keeps subordinate indexes correct
//! - Referral bookkeeping and persistence across reopen

use dirstore::idset::ConditionResult;
use dirstore::{DirError, Entry, EntryId, Modification, RootContainer, Schema};

use crate::common::*;

// =============================================================================
// Add
// =============================================================================

#[test]
fn test_add_and_get() {
    let (_temp, _root, container) = setup_temp_container();
    let id = container.add_entry(&person("jdoe", "John Doe", "Doe")).unwrap();

    let entry = container.get_entry(&dn(&format!("uid=jdoe,{}", PEOPLE))).unwrap().unwrap();
    assert_eq!(entry.values("cn"), &[b"John Doe".to_vec()]);
    assert_eq!(container.entry_id_for_dn(entry.dn()).unwrap(), Some(id));
    assert_eq!(container.get_entry_by_id(id).unwrap().unwrap(), entry);
    assert_eq!(container.entry_count(), 3);
}

#[test]
fn test_add_duplicate_rejected() {
    let (_temp, _root, container) = setup_temp_container();
    container.add_entry(&person("jdoe", "John", "Doe")).unwrap();
    let err = container.add_entry(&person("JDOE", "Other", "Doe")).unwrap_err();
    assert!(matches!(err, DirError::EntryAlreadyExists(_)));
}

#[test]
fn test_add_without_parent_rejected() {
    let (_temp, _root, container) = setup_temp_container();
    let orphan = Entry::new(dn("uid=x,ou=missing,dc=example,dc=com")).with("objectClass", &["person"]);
    assert!(matches!(container.add_entry(&orphan), Err(DirError::NoSuchEntry(_))));

    let foreign = Entry::new(dn("dc=other,dc=org")).with("objectClass", &["domain"]);
    assert!(matches!(container.add_entry(&foreign), Err(DirError::NoSuchEntry(_))));
}

#[test]
fn test_ids_increase() {
    let (_temp, _root, container) = setup_temp_container();
    let a = container.add_entry(&person("a", "A", "A")).unwrap();
    let b = container.add_entry(&person("b", "B", "B")).unwrap();
    assert!(b > a);
}

#[test]
fn test_subordinate_indexes_track_tree() {
    let (_temp, _root, container) = setup_temp_container();
    let base_id = container.entry_id_for_dn(&dn(BASE)).unwrap().unwrap();
    let people_id = container.entry_id_for_dn(&dn(PEOPLE)).unwrap().unwrap();
    let id = container.add_entry(&person("jdoe", "John", "Doe")).unwrap();

    let children = container.id2children();
    let subtree = container.id2subtree();
    assert_eq!(children.contains_id(&people_id.to_bytes(), id).unwrap(), ConditionResult::True);
    assert_eq!(children.contains_id(&base_id.to_bytes(), id).unwrap(), ConditionResult::False);
    assert_eq!(subtree.contains_id(&base_id.to_bytes(), id).unwrap(), ConditionResult::True);
    assert_eq!(subtree.contains_id(&base_id.to_bytes(), people_id).unwrap(), ConditionResult::True);

    assert_eq!(container.num_subordinates(&dn(BASE), false).unwrap(), Some(1));
    assert_eq!(container.num_subordinates(&dn(BASE), true).unwrap(), Some(2));
    assert!(container.has_subordinates(&dn(PEOPLE)).unwrap());
    assert!(!container.has_subordinates(&dn(&format!("uid=jdoe,{}", PEOPLE))).unwrap());
}

#[test]
fn test_counts_without_subordinate_indexes() {
    let (_temp, _root, container) = setup_temp_container_with(false);
    container.add_entry(&person("a", "A", "A")).unwrap();
    container.add_entry(&person("b", "B", "B")).unwrap();

    assert_eq!(container.num_subordinates(&dn(PEOPLE), false).unwrap(), Some(2));
    assert_eq!(container.num_subordinates(&dn(BASE), true).unwrap(), Some(3));
    assert_eq!(container.num_subordinates(&dn("ou=none,dc=example,dc=com"), false).unwrap(), None);
    assert!(container.has_subordinates(&dn(PEOPLE)).unwrap());
}

// =============================================================================
// Delete
// =============================================================================

#[test]
fn test_delete_leaf() {
    let (_temp, _root, container) = setup_temp_container();
    let people_id = container.entry_id_for_dn(&dn(PEOPLE)).unwrap().unwrap();
    let id = container.add_entry(&person("jdoe", "John", "Doe")).unwrap();

    assert_eq!(container.delete_entry(&dn(&format!("uid=jdoe,{}", PEOPLE)), false).unwrap(), 1);
    assert!(container.get_entry_by_id(id).unwrap().is_none());
    assert_eq!(
        container.id2children().contains_id(&people_id.to_bytes(), id).unwrap(),
        ConditionResult::False
    );
    assert!(matches!(
        container.delete_entry(&dn(&format!("uid=jdoe,{}", PEOPLE)), false),
        Err(DirError::NoSuchEntry(_))
    ));
}

#[test]
fn test_delete_non_leaf_needs_subtree_flag() {
    let (_temp, _root, container) = setup_temp_container();
    container.add_entry(&person("a", "A", "A")).unwrap();
    container.add_entry(&person("b", "B", "B")).unwrap();

    assert!(matches!(
        container.delete_entry(&dn(PEOPLE), false),
        Err(DirError::NotAllowedOnNonLeaf(_))
    ));
    assert_eq!(container.delete_entry(&dn(PEOPLE), true).unwrap(), 3);
    assert_eq!(container.entry_count(), 1);
    assert_eq!(container.num_subordinates(&dn(BASE), true).unwrap(), Some(0));
}

// =============================================================================
// Modify
// =============================================================================

#[test]
fn test_modify_add_delete_replace() {
    let (_temp, _root, container) = setup_temp_container();
    let target = dn(&format!("uid=jdoe,{}", PEOPLE));
    container.add_entry(&person("jdoe", "John", "Doe")).unwrap();

    let updated = container
        .modify_entry(
            &target,
            &[
                Modification::add("mail", &["jdoe@example.com"]),
                Modification::delete("cn", &["John"]),
                Modification::add("cn", &["Johnny"]),
                Modification::replace("sn", &["Smith"]),
            ],
        )
        .unwrap();
    assert_eq!(updated.values("cn"), &[b"Johnny".to_vec()]);
    assert_eq!(updated.values("sn"), &[b"Smith".to_vec()]);
    assert_eq!(container.get_entry(&target).unwrap().unwrap(), updated);
}

#[test]
fn test_modify_cannot_drop_rdn_value() {
    let (_temp, _root, container) = setup_temp_container();
    let target = dn(&format!("uid=jdoe,{}", PEOPLE));
    container.add_entry(&person("jdoe", "John", "Doe")).unwrap();

    let err = container
        .modify_entry(&target, &[Modification::replace("uid", &["other"])])
        .unwrap_err();
    assert!(matches!(err, DirError::EntryRejected(_)));
    // Nothing changed
    assert_eq!(container.get_entry(&target).unwrap().unwrap().values("uid"), &[b"jdoe".to_vec()]);
}

// =============================================================================
// Rename
// =============================================================================

#[test]
fn test_rename_leaf() {
    let (_temp, _root, container) = setup_temp_container();
    let id = container.add_entry(&person("jdoe", "John", "Doe")).unwrap();

    let new_dn = container
        .rename_entry(&dn(&format!("uid=jdoe,{}", PEOPLE)), "uid=john", true, None)
        .unwrap();
    assert_eq!(new_dn, dn(&format!("uid=john,{}", PEOPLE)));
    assert_eq!(container.entry_id_for_dn(&new_dn).unwrap(), Some(id));
    assert!(container.get_entry(&dn(&format!("uid=jdoe,{}", PEOPLE))).unwrap().is_none());

    let entry = container.get_entry(&new_dn).unwrap().unwrap();
    assert_eq!(entry.values("uid"), &[b"john".to_vec()]);
}

#[test]
fn test_rename_keeps_old_rdn_value() {
    let (_temp, _root, container) = setup_temp_container();
    container.add_entry(&person("jdoe", "John", "Doe")).unwrap();

    let new_dn = container
        .rename_entry(&dn(&format!("uid=jdoe,{}", PEOPLE)), "uid=john", false, None)
        .unwrap();
    let entry = container.get_entry(&new_dn).unwrap().unwrap();
    assert_eq!(entry.values("uid").len(), 2);
}

#[test]
fn test_move_subtree() {
    let (_temp, _root, container) = setup_temp_container();
    let groups = dn("ou=groups,dc=example,dc=com");
    let groups_id = container
        .add_entry(&Entry::new(groups.clone()).with("objectClass", &["organizationalUnit"]))
        .unwrap();
    let team = dn("cn=team,ou=groups,dc=example,dc=com");
    let team_id = container
        .add_entry(&Entry::new(team.clone()).with("objectClass", &["groupOfNames"]).with("cn", &["team"]))
        .unwrap();
    let member = dn("cn=lead,cn=team,ou=groups,dc=example,dc=com");
    let member_id = container
        .add_entry(&Entry::new(member).with("objectClass", &["person"]).with("cn", &["lead"]))
        .unwrap();
    let people_id = container.entry_id_for_dn(&dn(PEOPLE)).unwrap().unwrap();

    let moved = container.rename_entry(&team, "cn=team", false, Some(&dn(PEOPLE))).unwrap();
    assert_eq!(moved, dn(&format!("cn=team,{}", PEOPLE)));
    assert_eq!(
        container.entry_id_for_dn(&dn(&format!("cn=lead,cn=team,{}", PEOPLE))).unwrap(),
        Some(member_id)
    );

    let subtree = container.id2subtree();
    assert_eq!(subtree.contains_id(&people_id.to_bytes(), member_id).unwrap(), ConditionResult::True);
    assert_eq!(subtree.contains_id(&groups_id.to_bytes(), member_id).unwrap(), ConditionResult::False);
    assert_eq!(
        container.id2children().contains_id(&people_id.to_bytes(), team_id).unwrap(),
        ConditionResult::True
    );
    assert!(!container.has_subordinates(&groups).unwrap());
}

#[test]
fn test_rename_errors() {
    let (_temp, _root, container) = setup_temp_container();
    container.add_entry(&person("a", "A", "A")).unwrap();
    container.add_entry(&person("b", "B", "B")).unwrap();

    let a = dn(&format!("uid=a,{}", PEOPLE));
    assert!(matches!(
        container.rename_entry(&a, "uid=b", true, None),
        Err(DirError::EntryAlreadyExists(_))
    ));
    assert!(matches!(
        container.rename_entry(&dn(BASE), "dc=new", true, None),
        Err(DirError::NotAllowedOnNonLeaf(_))
    ));
    assert!(matches!(
        container.rename_entry(&dn(PEOPLE), "ou=people", true, Some(&a)),
        Err(DirError::NotAllowedOnNonLeaf(_))
    ));
    assert!(matches!(
        container.rename_entry(&a, "uid=a", true, Some(&dn("ou=nowhere,dc=example,dc=com"))),
        Err(DirError::NoSuchEntry(_))
    ));
}

// =============================================================================
// Referrals
// =============================================================================

fn referral(dn_str: &str, uri: &str) -> Entry {
    Entry::new(dn(dn_str))
        .with("objectClass", &["referral", "extensibleObject"])
        .with("ref", &[uri])
}

#[test]
fn test_target_referral_found_above() {
    let (_temp, _root, container) = setup_temp_container();
    container
        .add_entry(&referral("ou=remote,dc=example,dc=com", "ldap://other.example.com/ou=remote"))
        .unwrap();

    let found = container
        .target_referral(&dn("uid=x,ou=remote,dc=example,dc=com"))
        .unwrap()
        .unwrap();
    assert_eq!(found.dn, dn("ou=remote,dc=example,dc=com"));
    assert_eq!(found.uris, vec!["ldap://other.example.com/ou=remote".to_string()]);
    assert!(container.target_referral(&dn(PEOPLE)).unwrap().is_none());
}

#[test]
fn test_referral_removed_with_entry_or_attribute() {
    let (_temp, _root, container) = setup_temp_container();
    let remote = dn("ou=remote,dc=example,dc=com");
    container.add_entry(&referral("ou=remote,dc=example,dc=com", "ldap://a/")).unwrap();
    assert_eq!(container.dn2uri().count(), 1);

    container
        .modify_entry(&remote, &[Modification::replace("ref", &["ldap://b/"])])
        .unwrap();
    assert_eq!(container.target_referral(&remote).unwrap().unwrap().uris, vec!["ldap://b/".to_string()]);

    container
        .modify_entry(&remote, &[Modification::replace("objectClass", &["organizationalUnit"])])
        .unwrap();
    assert_eq!(container.dn2uri().count(), 0);
    container.delete_entry(&remote, false).unwrap();
    assert_eq!(container.dn2uri().count(), 0);
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_reopen_resumes_ids() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let last_id: EntryId;
    {
        let root = RootContainer::open(config(temp_dir.path(), true), Schema::default_schema()).unwrap();
        let container = root.container(&dn(BASE)).unwrap();
        container.add_entry(&Entry::new(dn(BASE)).with("objectClass", &["domain"])).unwrap();
        container
            .add_entry(&Entry::new(dn(PEOPLE)).with("objectClass", &["organizationalUnit"]))
            .unwrap();
        last_id = container.add_entry(&person("a", "A", "A")).unwrap();
        root.sync().unwrap();
    }

    let root = RootContainer::open(config(temp_dir.path(), true), Schema::default_schema()).unwrap();
    assert_eq!(root.entry_count(), 3);
    let container = root.container(&dn(BASE)).unwrap();
    let next = container.add_entry(&person("b", "B", "B")).unwrap();
    assert!(next > last_id);
    // Indexes of a reopened non-empty container keep their trusted flag
    assert!(container.attribute_index("uid").unwrap().index("equality").unwrap().is_trusted());
}

#[test]
fn test_clear_empties_and_trusts() {
    let (_temp, _root, container) = setup_temp_container();
    container.add_entry(&person("a", "A", "A")).unwrap();
    container.attribute_index("cn").unwrap().index("equality").unwrap().set_trusted(false);

    container.clear();
    assert!(container.is_empty());
    assert_eq!(container.dn2id().count(), 0);
    for index in container.all_indexes() {
        assert!(index.is_trusted());
        assert_eq!(index.key_count(), 0);
    }
}

#[test]
fn test_root_routes_to_deepest_container() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = dirstore::Config::builder()
        .data_dir(temp_dir.path())
        .base_dns(vec![dn("dc=com"), dn(BASE)])
        .build();
    let root = RootContainer::open(config, Schema::default_schema()).unwrap();

    let target = root.container_for(&dn(&format!("uid=x,{}", PEOPLE))).unwrap();
    assert_eq!(target.base_dn(), &dn(BASE));
    let other = root.container_for(&dn("dc=other,dc=com")).unwrap();
    assert_eq!(other.base_dn(), &dn("dc=com"));
    assert!(root.container_for(&dn("dc=org")).is_none());
    assert_ne!(target.database_prefix(), other.database_prefix());
}
