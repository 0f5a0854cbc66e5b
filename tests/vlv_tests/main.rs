//! VLV index tests
//!
//! These tests verify:
//! - Runs stay below the block size and keep their ordering bounds
//! - Sorted searches are answered from the index
//! - Offset and assertion windows follow the VLV boundary rules
//! - Trust state and definition changes take the index out of service

use std::sync::Arc;

use dirstore::filter::VlvResponse;
use dirstore::storage::KeyComparator;
use dirstore::vlv::VlvIndex;
use dirstore::{
    Config, Dn, DirError, Entry, EntryContainer, Filter, IndexConfig, Modification, RootContainer, Schema,
    SearchRequest, SearchScope, SortOrder, VlvIndexConfig, VlvRequest,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const BASE: &str = "dc=example,dc=com";
const PEOPLE: &str = "ou=people,dc=example,dc=com";
const FILTER: &str = "(objectClass=person)";

fn dn(s: &str) -> Dn {
    Dn::parse(s).unwrap()
}

fn setup_temp_vlv(sort: &str, block_size: usize) -> (TempDir, RootContainer, Arc<EntryContainer>, Arc<VlvIndex>) {
    let temp_dir = TempDir::new().unwrap();
    let vlv = VlvIndexConfig::new("people", BASE, SearchScope::WholeSubtree, FILTER, sort)
        .unwrap()
        .with_max_block_size(block_size);
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .base_dn(BASE)
        .unwrap()
        .indexes(vec![IndexConfig::new("objectclass", &[dirstore::IndexType::Equality])])
        .vlv_index(vlv)
        .build();
    let root = RootContainer::open(config, Schema::default_schema()).unwrap();
    let container = root.container(&dn(BASE)).unwrap();
    container
        .add_entry(&Entry::new(dn(BASE)).with("objectClass", &["domain"]))
        .unwrap();
    container
        .add_entry(&Entry::new(dn(PEOPLE)).with("objectClass", &["organizationalUnit"]))
        .unwrap();
    let index = container.vlv_index("people").unwrap();
    (temp_dir, root, container, index)
}

fn person(uid: &str, sn: &str) -> Entry {
    Entry::new(dn(&format!("uid={},{}", uid, PEOPLE)))
        .with("objectClass", &["person"])
        .with("uid", &[uid])
        .with("sn", &[sn])
}

/// Add `n` people whose surnames arrive out of order
fn add_people(container: &EntryContainer, n: usize) {
    for i in 0..n {
        let k = (i * 7) % n;
        container
            .add_entry(&person(&format!("u{}", i), &format!("name{:03}", k)))
            .unwrap();
    }
}

fn sorted_request(sort: &str) -> SearchRequest {
    SearchRequest::new(dn(BASE), SearchScope::WholeSubtree, Filter::parse(FILTER).unwrap())
        .with_sort(SortOrder::parse(sort).unwrap())
}

fn surnames(entries: &[Entry]) -> Vec<String> {
    entries
        .iter()
        .map(|e| String::from_utf8_lossy(&e.values("sn")[0]).into_owned())
        .collect()
}

fn assert_run_invariants(index: &VlvIndex) {
    let runs = index.runs().unwrap();
    let cmp = index.comparator();
    let mut previous: Option<Vec<u8>> = None;
    for (i, (key, run)) in runs.iter().enumerate() {
        assert!(run.len() < index.block_size(), "run {} has {} entries", i, run.len());
        assert!(!run.is_empty());
        // Only the last run may carry the unbounded key
        if key.is_empty() {
            assert_eq!(i, runs.len() - 1);
        }
        let encoded: Vec<Vec<u8>> = run.entries().iter().map(|sv| cmp.encode(sv)).collect();
        for pair in encoded.windows(2) {
            assert!(cmp.compare(&pair[0], &pair[1]).is_lt());
        }
        for k in &encoded {
            if !key.is_empty() {
                assert!(cmp.compare(k, key).is_le());
            }
            if let Some(prev) = &previous {
                assert!(cmp.compare(k, prev).is_gt());
            }
        }
        previous = Some(key.clone());
    }
}

// =============================================================================
// Run Maintenance
// =============================================================================

#[test]
fn test_runs_split_below_block_size() {
    let (_temp, _root, container, index) = setup_temp_vlv("sn", 4);
    add_people(&container, 20);

    assert_eq!(index.count(), 20);
    assert!(index.run_count() >= 3, "only {} runs", index.run_count());
    assert_run_invariants(&index);
}

#[test]
fn test_out_of_scope_entries_are_skipped() {
    let (_temp, _root, container, index) = setup_temp_vlv("sn", 4);
    add_people(&container, 3);
    container
        .add_entry(&Entry::new(dn("ou=groups,dc=example,dc=com")).with("objectClass", &["organizationalUnit"]))
        .unwrap();
    assert_eq!(index.count(), 3);
}

#[test]
fn test_delete_and_modify_keep_order() {
    let (_temp, _root, container, index) = setup_temp_vlv("sn", 4);
    add_people(&container, 12);

    for i in [0, 5, 11] {
        container
            .delete_entry(&dn(&format!("uid=u{},{}", i, PEOPLE)), false)
            .unwrap();
    }
    assert_eq!(index.count(), 9);

    container
        .modify_entry(&dn(&format!("uid=u3,{}", PEOPLE)), &[Modification::replace("sn", &["aaa"])])
        .unwrap();
    assert_eq!(index.count(), 9);
    assert_run_invariants(&index);

    let result = container.search(&sorted_request("sn")).unwrap();
    assert_eq!(surnames(&result.entries)[0], "aaa");
}

#[test]
fn test_entry_leaving_filter_is_removed() {
    let (_temp, _root, container, index) = setup_temp_vlv("sn", 4);
    add_people(&container, 5);
    container
        .modify_entry(
            &dn(&format!("uid=u1,{}", PEOPLE)),
            &[Modification::replace("objectClass", &["account"])],
        )
        .unwrap();
    assert_eq!(index.count(), 4);
}

#[test]
fn test_missing_sort_value_sorts_last() {
    let (_temp, _root, container, _index) = setup_temp_vlv("sn", 4);
    container
        .add_entry(
            &Entry::new(dn(&format!("uid=nosn,{}", PEOPLE)))
                .with("objectClass", &["person"])
                .with("uid", &["nosn"]),
        )
        .unwrap();
    container.add_entry(&person("a", "zzz")).unwrap();

    let result = container.search(&sorted_request("sn")).unwrap();
    assert_eq!(result.entries.len(), 2);
    assert_eq!(result.entries[1].dn(), &dn(&format!("uid=nosn,{}", PEOPLE)));
}

// =============================================================================
// Sorted Search
// =============================================================================

#[test]
fn test_sorted_search_uses_index() {
    let (_temp, _root, container, _index) = setup_temp_vlv("sn", 4);
    add_people(&container, 20);

    let result = container.search(&sorted_request("sn")).unwrap();
    assert_eq!(result.vlv_index.as_deref(), Some("people"));
    let names = surnames(&result.entries);
    let mut expected = names.clone();
    expected.sort();
    assert_eq!(names, expected);
    assert_eq!(names.len(), 20);
}

#[test]
fn test_descending_sort() {
    let (_temp, _root, container, index) = setup_temp_vlv("-sn", 4);
    add_people(&container, 10);
    assert_run_invariants(&index);

    let result = container.search(&sorted_request("-sn")).unwrap();
    assert!(result.vlv_index.is_some());
    assert_eq!(surnames(&result.entries).first().map(String::as_str), Some("name009"));
    assert_eq!(surnames(&result.entries).last().map(String::as_str), Some("name000"));
}

#[test]
fn test_other_sort_order_falls_back() {
    let (_temp, _root, container, _index) = setup_temp_vlv("sn", 4);
    add_people(&container, 5);

    let result = container.search(&sorted_request("uid")).unwrap();
    assert!(result.vlv_index.is_none());
    assert_eq!(result.entries.len(), 5);
}

// =============================================================================
// VLV Windows
// =============================================================================

fn by_offset(before: usize, after: usize, offset: i64) -> VlvRequest {
    VlvRequest::ByOffset {
        before_count: before,
        after_count: after,
        offset,
        content_count: 0,
    }
}

#[test]
fn test_window_by_offset() {
    let (_temp, _root, container, _index) = setup_temp_vlv("sn", 4);
    add_people(&container, 20);

    let result = container.search(&sorted_request("sn").with_vlv(by_offset(1, 2, 5))).unwrap();
    assert_eq!(surnames(&result.entries), vec!["name003", "name004", "name005", "name006"]);
    assert_eq!(
        result.vlv_response,
        Some(VlvResponse {
            target_position: 5,
            content_count: 20
        })
    );
}

#[test]
fn test_window_clamped_at_start() {
    let (_temp, _root, container, _index) = setup_temp_vlv("sn", 4);
    add_people(&container, 20);

    let result = container.search(&sorted_request("sn").with_vlv(by_offset(5, 1, 0))).unwrap();
    assert_eq!(surnames(&result.entries), vec!["name000", "name001"]);
    assert_eq!(result.vlv_response.unwrap().target_position, 1);
}

#[test]
fn test_offset_past_end() {
    let (_temp, _root, container, _index) = setup_temp_vlv("sn", 4);
    add_people(&container, 20);

    let result = container.search(&sorted_request("sn").with_vlv(by_offset(2, 3, 50))).unwrap();
    assert_eq!(surnames(&result.entries), vec!["name018", "name019"]);
    assert_eq!(
        result.vlv_response,
        Some(VlvResponse {
            target_position: 21,
            content_count: 20
        })
    );
}

#[test]
fn test_negative_offset_rejected() {
    let (_temp, _root, container, _index) = setup_temp_vlv("sn", 4);
    add_people(&container, 3);

    let err = container
        .search(&sorted_request("sn").with_vlv(by_offset(0, 0, -1)))
        .unwrap_err();
    assert!(matches!(err, DirError::InvalidVlvRequest(_)));
}

#[test]
fn test_window_by_assertion() {
    let (_temp, _root, container, _index) = setup_temp_vlv("sn", 4);
    add_people(&container, 20);

    let request = VlvRequest::ByAssertion {
        before_count: 1,
        after_count: 1,
        assertion: b"NAME010".to_vec(),
    };
    let result = container.search(&sorted_request("sn").with_vlv(request)).unwrap();
    assert_eq!(surnames(&result.entries), vec!["name009", "name010", "name011"]);
    assert_eq!(result.vlv_response.unwrap().target_position, 11);
}

#[test]
fn test_assertion_past_every_value() {
    let (_temp, _root, container, _index) = setup_temp_vlv("sn", 4);
    add_people(&container, 5);

    let request = VlvRequest::ByAssertion {
        before_count: 0,
        after_count: 0,
        assertion: b"zzz".to_vec(),
    };
    let result = container.search(&sorted_request("sn").with_vlv(request)).unwrap();
    assert_eq!(result.vlv_response.unwrap().target_position, 6);
}

fn add_person_without_surname(container: &EntryContainer) -> Dn {
    let nosn = dn(&format!("uid=nosn,{}", PEOPLE));
    container
        .add_entry(
            &Entry::new(nosn.clone())
                .with("objectClass", &["person"])
                .with("uid", &["nosn"]),
        )
        .unwrap();
    nosn
}

#[test]
fn test_empty_assertion_targets_lowest_value() {
    let (_temp, _root, container, _index) = setup_temp_vlv("sn", 4);
    add_people(&container, 5);
    add_person_without_surname(&container);

    let request = VlvRequest::ByAssertion {
        before_count: 0,
        after_count: 1,
        assertion: Vec::new(),
    };
    let result = container.search(&sorted_request("sn").with_vlv(request)).unwrap();
    assert_eq!(result.vlv_index.as_deref(), Some("people"));
    assert_eq!(surnames(&result.entries), vec!["name000", "name001"]);
    let response = result.vlv_response.unwrap();
    assert_eq!(response.target_position, 1);
    assert_eq!(response.content_count, 6);
}

#[test]
fn test_empty_assertion_descending_stops_before_missing_values() {
    let (_temp, _root, container, _index) = setup_temp_vlv("-sn", 4);
    add_people(&container, 3);
    let nosn = add_person_without_surname(&container);

    let request = VlvRequest::ByAssertion {
        before_count: 1,
        after_count: 0,
        assertion: Vec::new(),
    };
    let result = container.search(&sorted_request("-sn").with_vlv(request)).unwrap();
    assert!(result.vlv_index.is_some());
    assert_eq!(result.entries.len(), 2);
    assert_eq!(surnames(&result.entries[..1]), vec!["name000"]);
    assert_eq!(result.entries[1].dn(), &nosn);
    assert_eq!(result.vlv_response.unwrap().target_position, 4);
}

// =============================================================================
// Trust and Configuration
// =============================================================================

#[test]
fn test_untrusted_index_is_not_used() {
    let (_temp, _root, container, index) = setup_temp_vlv("sn", 4);
    add_people(&container, 5);

    index.set_trusted(false);
    let result = container.search(&sorted_request("sn")).unwrap();
    assert!(result.vlv_index.is_none());
    // The fallback still sorts
    let names = surnames(&result.entries);
    let mut expected = names.clone();
    expected.sort();
    assert_eq!(names, expected);
}

#[test]
fn test_sort_order_cannot_change() {
    let (_temp, _root, container, _index) = setup_temp_vlv("sn", 4);
    let changed = VlvIndexConfig::new("people", BASE, SearchScope::WholeSubtree, FILTER, "uid").unwrap();
    assert!(matches!(container.apply_vlv_config(changed), Err(DirError::Config(_))));
}

#[test]
fn test_filter_change_requires_rebuild() {
    let (_temp, _root, container, index) = setup_temp_vlv("sn", 4);
    add_people(&container, 5);

    let changed = VlvIndexConfig::new("people", BASE, SearchScope::WholeSubtree, "(objectClass=inetOrgPerson)", "sn")
        .unwrap()
        .with_max_block_size(4);
    let result = container.apply_vlv_config(changed).unwrap();
    assert!(result.admin_action_required);
    assert!(!index.is_trusted());
}

#[test]
fn test_block_size_change_applies_at_once() {
    let (_temp, _root, container, index) = setup_temp_vlv("sn", 4);
    let changed = VlvIndexConfig::new("people", BASE, SearchScope::WholeSubtree, FILTER, "sn")
        .unwrap()
        .with_max_block_size(10);
    let result = container.apply_vlv_config(changed).unwrap();
    assert!(!result.admin_action_required);
    assert_eq!(index.block_size(), 10);
}
