//! Tests for container searches
//!
//! These tests verify:
//! - Every search scope
//! - Index use, scan fallback and the debug trace
//! - Size limits and in-memory sorting
//! - Missing search bases

use std::collections::BTreeSet;

use dirstore::{DirError, Entry, EntryContainer, Filter, SearchRequest, SearchScope, SortOrder, VlvRequest};

use crate::common::*;

fn search(container: &EntryContainer, base: &str, scope: SearchScope, filter: &str) -> BTreeSet<String> {
    let request = SearchRequest::new(dn(base), scope, Filter::parse(filter).unwrap());
    container
        .search(&request)
        .unwrap()
        .entries
        .iter()
        .map(|e| e.dn().to_normalized_string())
        .collect()
}

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| dn(s).to_normalized_string()).collect()
}

fn populate(container: &EntryContainer) {
    container.add_entry(&person("alice", "Alice Adams", "Adams")).unwrap();
    container.add_entry(&person("bob", "Bob Brown", "Brown")).unwrap();
    container.add_entry(&person("carol", "Carol Clark", "Clark")).unwrap();
    container
        .add_entry(
            &Entry::new(dn("ou=groups,dc=example,dc=com"))
                .with("objectClass", &["top", "organizationalUnit"])
                .with("ou", &["groups"]),
        )
        .unwrap();
}

// =============================================================================
// Scopes
// =============================================================================

#[test]
fn test_scopes() {
    let (_temp, _root, container) = setup_temp_container();
    populate(&container);

    assert_eq!(
        search(&container, BASE, SearchScope::BaseObject, "(objectClass=*)"),
        names(&[BASE])
    );
    assert_eq!(
        search(&container, BASE, SearchScope::SingleLevel, "(objectClass=*)"),
        names(&[PEOPLE, "ou=groups,dc=example,dc=com"])
    );
    assert_eq!(
        search(&container, PEOPLE, SearchScope::WholeSubtree, "(objectClass=person)"),
        names(&[
            "uid=alice,ou=people,dc=example,dc=com",
            "uid=bob,ou=people,dc=example,dc=com",
            "uid=carol,ou=people,dc=example,dc=com",
        ])
    );
    let subordinates = search(&container, PEOPLE, SearchScope::Subordinates, "(objectClass=*)");
    assert_eq!(subordinates.len(), 3);
    assert!(!subordinates.contains(&dn(PEOPLE).to_normalized_string()));
}

#[test]
fn test_scopes_without_subordinate_indexes() {
    let (_temp, _root, container) = setup_temp_container_with(false);
    populate(&container);

    assert_eq!(search(&container, BASE, SearchScope::SingleLevel, "(objectClass=*)").len(), 2);
    assert_eq!(search(&container, BASE, SearchScope::WholeSubtree, "(objectClass=*)").len(), 6);
    assert_eq!(search(&container, BASE, SearchScope::Subordinates, "(objectClass=*)").len(), 5);
}

#[test]
fn test_missing_base() {
    let (_temp, _root, container) = setup_temp_container();
    let request = SearchRequest::new(
        dn("ou=missing,dc=example,dc=com"),
        SearchScope::WholeSubtree,
        Filter::parse("(objectClass=*)").unwrap(),
    );
    assert!(matches!(container.search(&request), Err(DirError::NoSuchEntry(_))));
}

// =============================================================================
// Index use
// =============================================================================

#[test]
fn test_indexed_search() {
    let (_temp, _root, container) = setup_temp_container();
    populate(&container);

    let request = SearchRequest::new(dn(BASE), SearchScope::WholeSubtree, Filter::parse("(cn=*ob*)").unwrap());
    let result = container.search(&request).unwrap();
    assert!(result.indexed);
    assert_eq!(result.entries.len(), 1);
    assert_eq!(result.entries[0].values("uid"), &[b"bob".to_vec()]);
}

#[test]
fn test_unindexed_search_scans() {
    let (_temp, _root, container) = setup_temp_container_with(false);
    populate(&container);

    let request = SearchRequest::new(dn(BASE), SearchScope::WholeSubtree, Filter::parse("(ou=groups)").unwrap())
        .with_debug(true);
    let result = container.search(&request).unwrap();
    assert!(!result.indexed);
    assert_eq!(result.entries.len(), 1);
    let trace = result.debug.unwrap();
    assert!(trace.contains("[NOT-INDEXED]"));
    assert!(trace.contains("[SCAN:"));
}

#[test]
fn test_scope_set_narrows_unindexed_filter() {
    let (_temp, _root, container) = setup_temp_container();
    populate(&container);

    // The filter is unindexed but id2subtree still bounds the candidates
    let request = SearchRequest::new(dn(PEOPLE), SearchScope::WholeSubtree, Filter::parse("(mail=*)").unwrap());
    let result = container.search(&request).unwrap();
    assert!(result.indexed);
    assert!(result.entries.is_empty());
}

#[test]
fn test_candidates_rechecked_against_filter() {
    let (_temp, _root, container) = setup_temp_container();
    populate(&container);

    // The substring index yields candidates for "*ad*" ; the entry filter rejects non matches
    let found = search(&container, BASE, SearchScope::WholeSubtree, "(&(cn=*ad*)(sn=Adams))");
    assert_eq!(found, names(&["uid=alice,ou=people,dc=example,dc=com"]));
    let none = search(&container, BASE, SearchScope::WholeSubtree, "(&(uid=alice)(sn=Brown))");
    assert!(none.is_empty());
}

// =============================================================================
// Limits and sorting
// =============================================================================

#[test]
fn test_size_limit() {
    let (_temp, _root, container) = setup_temp_container();
    populate(&container);

    let request = SearchRequest::new(dn(BASE), SearchScope::WholeSubtree, Filter::parse("(objectClass=*)").unwrap())
        .with_size_limit(2);
    let result = container.search(&request).unwrap();
    assert_eq!(result.entries.len(), 2);
    assert!(result.size_limit_exceeded);

    let request = SearchRequest::new(dn(PEOPLE), SearchScope::SingleLevel, Filter::parse("(objectClass=*)").unwrap())
        .with_size_limit(3);
    let result = container.search(&request).unwrap();
    assert_eq!(result.entries.len(), 3);
    assert!(!result.size_limit_exceeded);
}

#[test]
fn test_sorted_without_vlv_index() {
    let (_temp, _root, container) = setup_temp_container();
    populate(&container);

    let request = SearchRequest::new(dn(PEOPLE), SearchScope::SingleLevel, Filter::parse("(objectClass=person)").unwrap())
        .with_sort(SortOrder::parse("-sn").unwrap());
    let result = container.search(&request).unwrap();
    assert!(result.vlv_index.is_none());
    let surnames: Vec<Vec<u8>> = result.entries.iter().map(|e| e.values("sn")[0].clone()).collect();
    assert_eq!(surnames, vec![b"Clark".to_vec(), b"Brown".to_vec(), b"Adams".to_vec()]);
}

#[test]
fn test_in_memory_vlv_window() {
    let (_temp, _root, container) = setup_temp_container();
    populate(&container);

    let request = SearchRequest::new(dn(PEOPLE), SearchScope::SingleLevel, Filter::parse("(objectClass=person)").unwrap())
        .with_sort(SortOrder::parse("sn").unwrap())
        .with_vlv(VlvRequest::ByOffset {
            before_count: 0,
            after_count: 1,
            offset: 2,
            content_count: 0,
        });
    let result = container.search(&request).unwrap();
    let surnames: Vec<Vec<u8>> = result.entries.iter().map(|e| e.values("sn")[0].clone()).collect();
    assert_eq!(surnames, vec![b"Brown".to_vec(), b"Clark".to_vec()]);
    let response = result.vlv_response.unwrap();
    assert_eq!(response.target_position, 2);
    assert_eq!(response.content_count, 3);
}

// =============================================================================
// Renames and searches
// =============================================================================

#[test]
fn test_search_after_move() {
    let (_temp, _root, container) = setup_temp_container();
    populate(&container);

    container
        .rename_entry(
            &dn("uid=bob,ou=people,dc=example,dc=com"),
            "uid=bob",
            false,
            Some(&dn("ou=groups,dc=example,dc=com")),
        )
        .unwrap();

    assert_eq!(search(&container, PEOPLE, SearchScope::SingleLevel, "(uid=bob)").len(), 0);
    assert_eq!(
        search(&container, "ou=groups,dc=example,dc=com", SearchScope::SingleLevel, "(uid=bob)"),
        names(&["uid=bob,ou=groups,dc=example,dc=com"])
    );
}
