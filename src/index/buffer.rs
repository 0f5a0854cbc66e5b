//! Index write buffer
//!
//! Collects the key deltas of one entry operation across every index and
//! applies them together on `flush`. An add that follows a delete of the
//! same (key, ID) cancels it, and vice versa, so each key is written once.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::idset::{EntryId, EntryIdSet};
use crate::vlv::{SortValues, VlvIndex};

use super::db::Index;

/// Pending additions and deletions for one key
#[derive(Debug, Default, Clone)]
pub struct BufferedIndexValues {
    pub added: EntryIdSet,
    pub deleted: EntryIdSet,
}

impl BufferedIndexValues {
    pub fn add_entry_id(&mut self, id: EntryId) {
        if !self.deleted.remove(id) {
            self.added.add(id);
        }
    }

    pub fn delete_entry_id(&mut self, id: EntryId) {
        if !self.added.remove(id) {
            self.deleted.add(id);
        }
    }
}

/// Pending additions and deletions for one VLV index
#[derive(Debug, Default, Clone)]
pub struct BufferedVlvValues {
    pub added: Vec<SortValues>,
    pub deleted: Vec<SortValues>,
}

impl BufferedVlvValues {
    pub fn add_values(&mut self, sv: SortValues) {
        match self.deleted.iter().position(|d| d == &sv) {
            Some(pos) => {
                self.deleted.swap_remove(pos);
            }
            None => self.added.push(sv),
        }
    }

    pub fn delete_values(&mut self, sv: SortValues) {
        match self.added.iter().position(|a| a == &sv) {
            Some(pos) => {
                self.added.swap_remove(pos);
            }
            None => self.deleted.push(sv),
        }
    }
}

/// Per-operation write buffer
#[derive(Default)]
pub struct IndexBuffer {
    indexes: BTreeMap<String, (Arc<Index>, BTreeMap<Vec<u8>, BufferedIndexValues>)>,
    vlv_indexes: BTreeMap<String, (Arc<VlvIndex>, BufferedVlvValues)>,
}

impl IndexBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending values of `key` in `index`
    pub fn values_for(&mut self, index: &Arc<Index>, key: Vec<u8>) -> &mut BufferedIndexValues {
        let (_, keys) = self
            .indexes
            .entry(index.name().to_string())
            .or_insert_with(|| (index.clone(), BTreeMap::new()));
        keys.entry(key).or_default()
    }

    pub fn add_id(&mut self, index: &Arc<Index>, key: Vec<u8>, id: EntryId) {
        self.values_for(index, key).add_entry_id(id);
    }

    pub fn delete_id(&mut self, index: &Arc<Index>, key: Vec<u8>, id: EntryId) {
        self.values_for(index, key).delete_entry_id(id);
    }

    /// Pending values of a VLV index
    pub fn vlv_values_for(&mut self, vlv: &Arc<VlvIndex>) -> &mut BufferedVlvValues {
        let (_, values) = self
            .vlv_indexes
            .entry(vlv.name().to_string())
            .or_insert_with(|| (vlv.clone(), BufferedVlvValues::default()));
        values
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty() && self.vlv_indexes.is_empty()
    }

    /// Number of buffered (index, key) pairs
    pub fn key_count(&self) -> usize {
        self.indexes.values().map(|(_, keys)| keys.len()).sum()
    }

    /// Apply every buffered delta
    pub fn flush(self) -> Result<()> {
        for (_, (index, keys)) in self.indexes {
            for (key, values) in keys {
                index.update_key(&key, &values.deleted, &values.added)?;
            }
        }
        for (_, (vlv, values)) in self.vlv_indexes {
            vlv.update_index(values.added, values.deleted)?;
        }
        Ok(())
    }
}
