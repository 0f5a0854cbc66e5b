//! Referral database
//!
//! Holds the `ref` URIs of every entry with object class `referral`, keyed
//! by DN key so the closest referral above a DN is a short walk up its
//! parent keys.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::Result;
use crate::keycodec::{dn_to_key, parent_key};
use crate::storage::{bytewise, Database, Environment};

const REFERRAL_OBJECT_CLASS: &str = "referral";
const REF_ATTRIBUTE: &str = "ref";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredReferral {
    dn: String,
    uris: Vec<String>,
}

/// A referral found above (or at) a DN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Referral {
    pub dn: Dn,
    pub uris: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Dn2Uri {
    db: Arc<Database>,
    prefix_rdns: usize,
}

impl Dn2Uri {
    pub fn open(env: &Environment, prefix: &str, base_dn: &Dn) -> Result<Self> {
        let db = env.open_database(&format!("{}_referral", prefix), bytewise())?;
        Ok(Self {
            db,
            prefix_rdns: base_dn.size(),
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn is_referral(entry: &Entry) -> bool {
        entry.has_object_class(REFERRAL_OBJECT_CLASS) && entry.has_attribute(REF_ATTRIBUTE)
    }

    /// Record the entry's referral URIs, if it is a referral
    pub fn add_entry(&self, entry: &Entry) -> Result<bool> {
        if !Self::is_referral(entry) {
            return Ok(false);
        }
        let stored = StoredReferral {
            dn: entry.dn().to_string(),
            uris: entry
                .values(REF_ATTRIBUTE)
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect(),
        };
        let key = dn_to_key(entry.dn(), self.prefix_rdns);
        self.db.put(&key, &bincode::serialize(&stored)?);
        Ok(true)
    }

    pub fn remove_entry(&self, dn: &Dn) -> bool {
        self.db.delete(&dn_to_key(dn, self.prefix_rdns))
    }

    /// Replace the stored record after a modify
    pub fn modify_entry(&self, old: &Entry, new: &Entry) -> Result<()> {
        if Self::is_referral(old) {
            self.remove_entry(old.dn());
        }
        self.add_entry(new)?;
        Ok(())
    }

    /// Closest referral at or above `dn`
    pub fn target_referral(&self, dn: &Dn) -> Result<Option<Referral>> {
        if self.db.is_empty() {
            return Ok(None);
        }
        let full = dn_to_key(dn, self.prefix_rdns);
        let mut key: &[u8] = &full;
        loop {
            if let Some(bytes) = self.db.get(key) {
                let stored: StoredReferral = bincode::deserialize(&bytes)?;
                return Ok(Some(Referral {
                    dn: Dn::parse(&stored.dn)?,
                    uris: stored.uris,
                }));
            }
            match parent_key(key) {
                Some(parent) => key = parent,
                None => return Ok(None),
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.db.record_count()
    }
}
