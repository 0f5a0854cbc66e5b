//! Key codec
//!
//! Order-preserving byte encodings shared by every database.
//!
//! ## DN keys
//! ```text
//!   uid=jdoe,ou=people,dc=example,dc=com   (base dc=example,dc=com)
//!
//!   ┌────┬───────────┬────┬──────────┐
//!   │ 00 │ ou=people │ 00 │ uid=jdoe │
//!   └────┴───────────┴────┴──────────┘
//!    sep   RDN (top)  sep   RDN (leaf)
//! ```
//! RDNs are written from the top of the naming context down to the leaf,
//! each preceded by the separator `0x00`. Content bytes `0x00` and `0x01`
//! are escaped as `01 01` and `01 02`, so every `0x00` in a key is a
//! separator. A parent key is a strict prefix of its children's keys and the
//! next byte is the smallest possible, so a subtree is one contiguous range.
//! The base entry itself has the empty key.
//!
//! ## Packed integers
//! Unsigned LEB128: 7 bits per byte, high bit set on every byte but the last.

use std::collections::BTreeSet;

use crate::dn::Dn;
use crate::error::{DirError, Result};
use crate::idset::EntryId;

/// Separator preceding each RDN in a DN key
pub const DN_SEPARATOR: u8 = 0x00;

/// Escape byte for separator/escape bytes inside RDN content
pub const DN_ESCAPE: u8 = 0x01;

// =============================================================================
// Entry IDs
// =============================================================================

/// Encode an entry ID as 8 big-endian bytes
pub fn entry_id_to_bytes(id: EntryId) -> [u8; 8] {
    id.as_u64().to_be_bytes()
}

/// Decode the first 8 bytes as a big-endian entry ID
pub fn bytes_to_entry_id(bytes: &[u8]) -> Result<EntryId> {
    let head: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            DirError::Decode(format!("entry ID needs 8 bytes, got {}", bytes.len()))
        })?;
    Ok(EntryId::new(u64::from_be_bytes(head)))
}

// =============================================================================
// DN keys
// =============================================================================

/// Build the key for `dn`, dropping the top `prefix_rdns` RDNs (the base DN)
pub fn dn_to_key(dn: &Dn, prefix_rdns: usize) -> Vec<u8> {
    let mut key = Vec::new();
    let size = dn.size();
    if size <= prefix_rdns {
        return key;
    }
    for i in (0..size - prefix_rdns).rev() {
        key.push(DN_SEPARATOR);
        if let Some(rdn) = dn.rdn_at(i) {
            for &b in rdn.normalized().as_bytes() {
                match b {
                    DN_SEPARATOR => key.extend_from_slice(&[DN_ESCAPE, 0x01]),
                    DN_ESCAPE => key.extend_from_slice(&[DN_ESCAPE, 0x02]),
                    _ => key.push(b),
                }
            }
        }
    }
    key
}

/// Length of the parent's key inside `key`.
///
/// `key[..n]` is the immediate parent's key. Returns `None` for the empty
/// key (the base entry has no parent inside the container) or a key with no
/// separator at all.
pub fn find_parent_key_boundary(key: &[u8]) -> Option<usize> {
    if key.is_empty() {
        return None;
    }
    key.iter().rposition(|&b| b == DN_SEPARATOR)
}

/// Parent key slice of `key`, if any
pub fn parent_key(key: &[u8]) -> Option<&[u8]> {
    find_parent_key_boundary(key).map(|n| &key[..n])
}

/// True if `child` is exactly one level below `parent`
pub fn is_child_key(parent: &[u8], child: &[u8]) -> bool {
    parent_key(child) == Some(parent)
}

/// True if `key` lies strictly below `ancestor`
pub fn is_descendant_key(ancestor: &[u8], key: &[u8]) -> bool {
    key.len() > ancestor.len()
        && key.starts_with(ancestor)
        && key[ancestor.len()] == DN_SEPARATOR
}

/// Exclusive upper bound of the subtree under `key` (descendants only)
pub fn subtree_upper_bound(key: &[u8]) -> Vec<u8> {
    let mut upper = key.to_vec();
    upper.push(DN_ESCAPE);
    upper
}

// =============================================================================
// Substring keys
// =============================================================================

/// Every substring of length `min(len, remaining)` starting at each offset.
///
/// `"ABCDE"` with length 3 gives `{ABC, BCD, CDE, DE, E}`.
pub fn substring_keys(value: &[u8], substring_length: usize) -> BTreeSet<Vec<u8>> {
    let mut keys = BTreeSet::new();
    let len = substring_length.max(1);
    for i in 0..value.len() {
        let end = value.len().min(i + len);
        keys.insert(value[i..end].to_vec());
    }
    keys
}

// =============================================================================
// Packed integers
// =============================================================================

/// Append `v` as unsigned LEB128
pub fn write_packed(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Number of bytes `write_packed` uses for `v`
pub fn packed_len(v: u64) -> usize {
    let bits = 64 - v.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Read an unsigned LEB128 value, advancing `input`
pub fn read_packed(input: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = input
            .split_first()
            .ok_or_else(|| DirError::Decode("truncated packed integer".to_string()))?;
        *input = rest;
        if shift >= 64 {
            return Err(DirError::Decode("packed integer overflow".to_string()));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

// =============================================================================
// BER lengths (VLV keys)
// =============================================================================

/// Append a BER definite length
pub fn write_ber_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = (len as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    out.push(0x80 | (8 - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Read a BER definite length, advancing `input`
pub fn read_ber_length(input: &mut &[u8]) -> Result<usize> {
    let (&first, rest) = input
        .split_first()
        .ok_or_else(|| DirError::Decode("truncated BER length".to_string()))?;
    *input = rest;
    if first & 0x80 == 0 {
        return Ok(first as usize);
    }
    let n = (first & 0x7F) as usize;
    if n == 0 || n > 8 || input.len() < n {
        return Err(DirError::Decode("malformed BER length".to_string()));
    }
    let mut len = 0usize;
    for &b in &input[..n] {
        len = (len << 8) | b as usize;
    }
    *input = &input[n..];
    Ok(len)
}
