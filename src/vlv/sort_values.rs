//! Sort values and runs
//!
//! A [`SortValuesSet`] is one run of the VLV index: tuples kept in sort
//! order, persisted as a single database record.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::filter::SortOrder;
use crate::idset::EntryId;
use crate::schema::{MatchingRule, Schema};

use super::comparator::{compare_value, VlvKeyComparator};

/// Normalized sort values of one entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortValues {
    pub id: EntryId,
    /// One slot per sort key; None when the entry has no value
    pub values: Vec<Option<Vec<u8>>>,
}

impl SortValues {
    /// Extract and normalize the sort values of `entry`.
    ///
    /// A multi-valued attribute contributes its smallest value for an
    /// ascending key and its largest for a descending one.
    pub fn from_entry(id: EntryId, entry: &Entry, order: &SortOrder, schema: &Schema) -> Self {
        let values = order
            .keys
            .iter()
            .map(|key| {
                let rule = key
                    .rule
                    .or_else(|| schema.attribute_type(&key.attribute).ordering)
                    .unwrap_or(MatchingRule::CaseIgnore);
                let normalized = entry
                    .values(&key.attribute)
                    .iter()
                    .filter_map(|v| rule.normalize(v).ok())
                    .filter(|v| !v.is_empty());
                if key.reverse {
                    normalized.max()
                } else {
                    normalized.min()
                }
            })
            .collect();
        Self { id, values }
    }

    /// Order under the given per-key directions, ID last
    pub fn compare(&self, other: &SortValues, reverse: &[bool]) -> Ordering {
        for (i, rev) in reverse.iter().enumerate() {
            let a = self.values.get(i).and_then(|v| v.as_deref());
            let b = other.values.get(i).and_then(|v| v.as_deref());
            let ord = compare_value(a, b, *rev);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.id.cmp(&other.id)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredRun {
    entries: Vec<(u64, Vec<Option<Vec<u8>>>)>,
}

/// One run of sort values, always in sort order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortValuesSet {
    entries: Vec<SortValues>,
}

impl SortValuesSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SortValues] {
        &self.entries
    }

    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.entries.iter().map(|sv| sv.id)
    }

    pub fn last(&self) -> Option<&SortValues> {
        self.entries.last()
    }

    /// Binary search for a tuple
    pub fn search(&self, sv: &SortValues, reverse: &[bool]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.compare(sv, reverse))
    }

    /// Insert keeping order; false if already present
    pub fn add(&mut self, sv: SortValues, reverse: &[bool]) -> bool {
        match self.search(&sv, reverse) {
            Ok(_) => false,
            Err(pos) => {
                self.entries.insert(pos, sv);
                true
            }
        }
    }

    /// Remove a tuple; false if absent
    pub fn remove(&mut self, sv: &SortValues, reverse: &[bool]) -> bool {
        match self.search(sv, reverse) {
            Ok(pos) => {
                self.entries.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Position of the first tuple whose key is >= `search_key`
    pub fn lower_bound(&self, search_key: &[u8], cmp: &VlvKeyComparator) -> usize {
        use crate::storage::KeyComparator;
        self.entries
            .partition_point(|e| cmp.compare(&cmp.encode(e), search_key) == Ordering::Less)
    }

    /// Split into pieces each smaller than `capacity`, lowest first.
    ///
    /// The common case (a run that just reached capacity) yields two runs
    /// with the lower half first.
    pub fn split(self, capacity: usize) -> Vec<SortValuesSet> {
        let capacity = capacity.max(2);
        let len = self.entries.len();
        if len < capacity {
            return vec![self];
        }
        let mut pieces = 2;
        while len.div_ceil(pieces) >= capacity {
            pieces += 1;
        }
        let base = len / pieces;
        let extra = len % pieces;
        let mut out = Vec::with_capacity(pieces);
        let mut iter = self.entries.into_iter();
        for i in 0..pieces {
            // Lower pieces take the floor, upper ones absorb the remainder
            let size = base + usize::from(i >= pieces - extra);
            out.push(SortValuesSet {
                entries: iter.by_ref().take(size).collect(),
            });
        }
        out
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let stored = StoredRun {
            entries: self
                .entries
                .iter()
                .map(|sv| (sv.id.as_u64(), sv.values.clone()))
                .collect(),
        };
        Ok(bincode::serialize(&stored)?)
    }

    pub fn decode(bytes: &[u8], reverse: &[bool]) -> Result<Self> {
        let stored: StoredRun = bincode::deserialize(bytes)?;
        let entries: Vec<SortValues> = stored
            .entries
            .into_iter()
            .map(|(id, values)| SortValues {
                id: EntryId::new(id),
                values,
            })
            .collect();
        if entries
            .windows(2)
            .any(|w| w[0].compare(&w[1], reverse) != Ordering::Less)
        {
            return Err(DirError::Decode("VLV run out of order".to_string()));
        }
        Ok(Self { entries })
    }
}

impl FromIterator<SortValues> for SortValuesSet {
    fn from_iter<I: IntoIterator<Item = SortValues>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
