//! DN → entry ID database
//!
//! Keys are DN keys relative to the container's base DN (the base entry
//! itself has the empty key); values are 8-byte big-endian entry IDs.

use std::ops::Bound;
use std::sync::Arc;

use crate::dn::Dn;
use crate::error::Result;
use crate::idset::EntryId;
use crate::keycodec::{self, dn_to_key, subtree_upper_bound};
use crate::storage::{bytewise, Database, Environment, Record};

#[derive(Debug, Clone)]
pub struct Dn2Id {
    db: Arc<Database>,
    /// RDNs stripped from every key (the base DN's size)
    prefix_rdns: usize,
}

impl Dn2Id {
    pub fn open(env: &Environment, prefix: &str, base_dn: &Dn) -> Result<Self> {
        let db = env.open_database(&format!("{}_dn2id", prefix), bytewise())?;
        Ok(Self {
            db,
            prefix_rdns: base_dn.size(),
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Key of a DN under this container
    pub fn key(&self, dn: &Dn) -> Vec<u8> {
        dn_to_key(dn, self.prefix_rdns)
    }

    pub fn get(&self, dn: &Dn) -> Result<Option<EntryId>> {
        self.get_by_key(&self.key(dn))
    }

    pub fn get_by_key(&self, key: &[u8]) -> Result<Option<EntryId>> {
        self.db.get(key).map(|v| keycodec::bytes_to_entry_id(&v)).transpose()
    }

    /// Insert; false if the DN is already present
    pub fn insert(&self, dn: &Dn, id: EntryId) -> bool {
        self.db.put_no_overwrite(&self.key(dn), &id.to_bytes())
    }

    pub fn put_key(&self, key: &[u8], id: EntryId) {
        self.db.put(key, &id.to_bytes());
    }

    pub fn remove(&self, dn: &Dn) -> bool {
        self.db.delete(&self.key(dn))
    }

    /// Every record at or below `dn`, in key order (parents first)
    pub fn subtree(&self, dn: &Dn) -> Vec<Record> {
        let key = self.key(dn);
        if key.is_empty() {
            return self.db.range(Bound::Unbounded, Bound::Unbounded);
        }
        let upper = subtree_upper_bound(&key);
        self.db.range(Bound::Included(key.as_slice()), Bound::Excluded(upper.as_slice()))
    }

    /// Whether any record lies strictly below `dn`
    pub fn has_children(&self, dn: &Dn) -> bool {
        let key = self.key(dn);
        match self.db.next_after(&key) {
            Some((next, _)) => keycodec::is_descendant_key(&key, &next),
            None => false,
        }
    }

    pub fn count(&self) -> u64 {
        self.db.record_count()
    }
}
