//! VLV key comparator
//!
//! Key layout (one run = one key):
//!
//! ```text
//! +-----------+---------+-----------+---------+-----+----------------+
//! | BER len 1 | value 1 | BER len 2 | value 2 | ... | entry ID (8 B) |
//! +-----------+---------+-----------+---------+-----+----------------+
//! ```
//!
//! A zero length marks an entry with no value for that sort key. The empty
//! key is the unbounded last run and sorts after everything. Keys with fewer
//! values than the sort order (assertion search keys) sort before every full
//! key sharing their prefix.

use std::cmp::Ordering;

use crate::idset::EntryId;
use crate::keycodec::{read_ber_length, write_ber_length};
use crate::storage::KeyComparator;

use super::sort_values::SortValues;

/// Orders VLV keys by the configured sort order, then entry ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvKeyComparator {
    /// One flag per sort key; true = descending
    reverse: Vec<bool>,
}

struct DecodedKey<'a> {
    values: Vec<Option<&'a [u8]>>,
    id: Option<u64>,
}

impl VlvKeyComparator {
    pub fn new(reverse: Vec<bool>) -> Self {
        Self { reverse }
    }

    pub fn key_count(&self) -> usize {
        self.reverse.len()
    }

    /// Full run key for a sort-values tuple
    pub fn encode(&self, sv: &SortValues) -> Vec<u8> {
        let mut out = Vec::new();
        for value in &sv.values {
            match value {
                Some(v) if !v.is_empty() => {
                    write_ber_length(&mut out, v.len());
                    out.extend_from_slice(v);
                }
                _ => write_ber_length(&mut out, 0),
            }
        }
        out.extend_from_slice(&sv.id.to_bytes());
        out
    }

    /// Partial search key holding only the first sort value
    pub fn encode_assertion(&self, normalized: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(normalized.len() + 4);
        write_ber_length(&mut out, normalized.len());
        out.extend_from_slice(normalized);
        out
    }

    /// Decode a full key back into a sort-values tuple
    pub fn decode(&self, key: &[u8]) -> Option<SortValues> {
        let decoded = self.split(key)?;
        let id = decoded.id?;
        if decoded.values.len() != self.reverse.len() {
            return None;
        }
        Some(SortValues {
            id: EntryId::new(id),
            values: decoded.values.into_iter().map(|v| v.map(<[u8]>::to_vec)).collect(),
        })
    }

    fn split<'a>(&self, key: &'a [u8]) -> Option<DecodedKey<'a>> {
        let mut input = key;
        let mut values = Vec::with_capacity(self.reverse.len());
        while values.len() < self.reverse.len() && !input.is_empty() {
            let len = read_ber_length(&mut input).ok()?;
            if input.len() < len {
                return None;
            }
            let (value, rest) = input.split_at(len);
            values.push(if len == 0 { None } else { Some(value) });
            input = rest;
        }
        let id = match input.len() {
            0 => None,
            8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(input);
                Some(u64::from_be_bytes(b))
            }
            _ => return None,
        };
        Some(DecodedKey { values, id })
    }
}

/// Absent values sort after present ones regardless of direction
pub(crate) fn compare_value(a: Option<&[u8]>, b: Option<&[u8]>, reverse: bool) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) if reverse => y.cmp(x),
        (Some(x), Some(y)) => x.cmp(y),
    }
}

impl KeyComparator for VlvKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (a.is_empty(), b.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
        let (Some(ka), Some(kb)) = (self.split(a), self.split(b)) else {
            return a.cmp(b);
        };
        for (i, reverse) in self.reverse.iter().enumerate() {
            match (ka.values.get(i), kb.values.get(i)) {
                (Some(x), Some(y)) => {
                    let ord = compare_value(*x, *y, *reverse);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
            }
        }
        match (ka.id, kb.id) {
            (Some(x), Some(y)) => x.cmp(&y),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        }
    }

    fn name(&self) -> String {
        let dirs: String = self.reverse.iter().map(|r| if *r { '-' } else { '+' }).collect();
        format!("vlv{}", dirs)
    }
}
