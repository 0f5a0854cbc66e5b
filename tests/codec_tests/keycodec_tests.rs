//! Tests for DN keys and packed integers
//!
//! These tests verify:
//! - DN keys order parents before children and keep subtrees contiguous
//! - Separator bytes inside values are escaped
//! - Parent/child key relationships
//! - Packed integers and substring keys

use dirstore::keycodec::{
    dn_to_key, find_parent_key_boundary, is_child_key, is_descendant_key, packed_len, parent_key, read_packed,
    substring_keys, subtree_upper_bound, write_packed, DN_SEPARATOR,
};
use dirstore::Dn;

// =============================================================================
// Helper Functions
// =============================================================================

const BASE_RDNS: usize = 2;

fn key(dn: &str) -> Vec<u8> {
    dn_to_key(&Dn::parse(dn).unwrap(), BASE_RDNS)
}

// =============================================================================
// DN Keys
// =============================================================================

#[test]
fn test_base_entry_has_empty_key() {
    assert!(key("dc=example,dc=com").is_empty());
}

#[test]
fn test_key_layout_top_down() {
    let k = key("uid=jdoe,ou=people,dc=example,dc=com");
    let mut expected = vec![DN_SEPARATOR];
    expected.extend_from_slice(b"ou=people");
    expected.push(DN_SEPARATOR);
    expected.extend_from_slice(b"uid=jdoe");
    assert_eq!(k, expected);
}

#[test]
fn test_key_uses_normalized_form() {
    assert_eq!(
        key("UID=JDoe, OU=People,dc=example,dc=com"),
        key("uid=jdoe,ou=people,dc=example,dc=com")
    );
}

#[test]
fn test_parent_sorts_before_children() {
    let parent = key("ou=people,dc=example,dc=com");
    let child = key("uid=a,ou=people,dc=example,dc=com");
    let grandchild = key("cn=x,uid=a,ou=people,dc=example,dc=com");
    assert!(parent < child);
    assert!(child < grandchild);
}

#[test]
fn test_subtree_is_contiguous() {
    let mut keys: Vec<Vec<u8>> = [
        "ou=a,dc=example,dc=com",
        "uid=1,ou=a,dc=example,dc=com",
        "cn=deep,uid=1,ou=a,dc=example,dc=com",
        "uid=2,ou=a,dc=example,dc=com",
        "ou=a-b,dc=example,dc=com",
        "uid=9,ou=a-b,dc=example,dc=com",
        "ou=b,dc=example,dc=com",
        "ou=0,dc=example,dc=com",
    ]
    .iter()
    .map(|dn| key(dn))
    .collect();
    keys.sort();

    let ou_a = key("ou=a,dc=example,dc=com");
    let upper = subtree_upper_bound(&ou_a);
    let in_range: Vec<&Vec<u8>> = keys.iter().filter(|k| **k > ou_a && **k < upper).collect();
    let descendants: Vec<&Vec<u8>> = keys.iter().filter(|k| is_descendant_key(&ou_a, k)).collect();

    assert_eq!(in_range.len(), 3);
    assert_eq!(in_range, descendants);

    // The descendants sit in one run right after ou=a
    let start = keys.iter().position(|k| *k == ou_a).unwrap();
    for (offset, k) in descendants.iter().enumerate() {
        assert_eq!(&keys[start + 1 + offset], *k);
    }
}

#[test]
fn test_separator_bytes_in_values_are_escaped() {
    let k = key("cn=a\\00b,ou=people,dc=example,dc=com");
    // Only the two RDN separators remain as 0x00
    assert_eq!(k.iter().filter(|&&b| b == DN_SEPARATOR).count(), 2);
    assert_eq!(parent_key(&k), Some(key("ou=people,dc=example,dc=com").as_slice()));
}

#[test]
fn test_parent_key_relationships() {
    let root = key("dc=example,dc=com");
    let ou = key("ou=people,dc=example,dc=com");
    let leaf = key("uid=jdoe,ou=people,dc=example,dc=com");

    assert_eq!(find_parent_key_boundary(&root), None);
    assert_eq!(parent_key(&ou), Some(root.as_slice()));
    assert_eq!(parent_key(&leaf), Some(ou.as_slice()));

    assert!(is_child_key(&ou, &leaf));
    assert!(!is_child_key(&root, &leaf));
    assert!(is_descendant_key(&root, &leaf));
    assert!(!is_descendant_key(&leaf, &ou));
}

#[test]
fn test_prefix_rdns_larger_than_dn() {
    let dn = Dn::parse("dc=com").unwrap();
    assert!(dn_to_key(&dn, 5).is_empty());
}

// =============================================================================
// Packed Integers
// =============================================================================

#[test]
fn test_packed_sequence() {
    let values = [0u64, 5, 127, 128, 16_383, 16_384, 1 << 40];
    let mut buf = Vec::new();
    for v in values {
        write_packed(&mut buf, v);
    }
    assert_eq!(buf.len(), values.iter().map(|v| packed_len(*v)).sum::<usize>());

    let mut input = buf.as_slice();
    for v in values {
        assert_eq!(read_packed(&mut input).unwrap(), v);
    }
    assert!(input.is_empty());
}

#[test]
fn test_packed_lengths() {
    assert_eq!(packed_len(0), 1);
    assert_eq!(packed_len(127), 1);
    assert_eq!(packed_len(128), 2);
    assert_eq!(packed_len(u64::MAX), 10);
}

#[test]
fn test_packed_truncated() {
    let mut input: &[u8] = &[0xFF];
    assert!(read_packed(&mut input).is_err());
}

// =============================================================================
// Substring Keys
// =============================================================================

#[test]
fn test_substring_keys() {
    let keys: Vec<Vec<u8>> = substring_keys(b"abcde", 3).into_iter().collect();
    let expected: Vec<Vec<u8>> = ["abc", "bcd", "cde", "de", "e"].iter().map(|s| s.as_bytes().to_vec()).collect();
    let mut expected = expected;
    expected.sort();
    assert_eq!(keys, expected);
}

#[test]
fn test_substring_keys_deduplicate() {
    let keys = substring_keys(b"aaaa", 2);
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(b"aa".as_slice()));
    assert!(keys.contains(b"a".as_slice()));
}
