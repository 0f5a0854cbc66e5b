//! Per-key insert/delete deltas built during import
//!
//! A delta keeps disjoint insert and delete sets. The latest operation on
//! an (key, entry ID) pair wins, so applying the inserts and then the
//! deletes gives the same result as replaying every record in order.

use crate::idset::{EntryId, EntryIdSet};

/// Consolidated changes to one index key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDelta {
    pub inserts: EntryIdSet,
    pub deletes: EntryIdSet,
    limit: usize,
    maintain_count: bool,
}

impl KeyDelta {
    /// `limit` of 0 means unlimited
    pub fn new(limit: usize, maintain_count: bool) -> Self {
        Self {
            inserts: EntryIdSet::new(),
            deletes: EntryIdSet::new(),
            limit,
            maintain_count,
        }
    }

    pub fn insert(&mut self, id: EntryId) {
        self.deletes.remove(id);
        self.inserts.add(id);
        self.enforce_limit();
    }

    pub fn delete(&mut self, id: EntryId) {
        self.inserts.remove(id);
        self.deletes.add(id);
    }

    pub fn record(&mut self, id: EntryId, insert: bool) {
        if insert {
            self.insert(id);
        } else {
            self.delete(id);
        }
    }

    /// Fold in a delta that happened after this one
    pub fn absorb(&mut self, later: &KeyDelta) {
        self.absorb_sets(&later.inserts, &later.deletes);
    }

    /// Fold in the insert and delete sets of a later delta
    pub fn absorb_sets(&mut self, inserts: &EntryIdSet, deletes: &EntryIdSet) {
        match inserts {
            EntryIdSet::Defined(ids) => {
                for id in ids {
                    self.deletes.remove(*id);
                    self.inserts.add(*id);
                }
            }
            other => self.inserts.add_all(other),
        }
        match deletes {
            EntryIdSet::Defined(ids) => {
                for id in ids {
                    self.inserts.remove(*id);
                    self.deletes.add(*id);
                }
            }
            other => self.deletes.add_all(other),
        }
        self.enforce_limit();
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }

    fn enforce_limit(&mut self) {
        if let EntryIdSet::Defined(ids) = &self.inserts {
            if self.limit > 0 && ids.len() > self.limit {
                let set = std::mem::take(&mut self.inserts);
                self.inserts = set.apply_limit(self.limit, self.maintain_count).0;
            }
        }
    }
}
