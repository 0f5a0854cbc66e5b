//! Temporary DN cache used to validate DNs during an import
//!
//! Keys are the 64-bit FNV-1a hash of the normalized DN. Values hold every
//! (DN, entry ID) pair that hashed to the key, so collisions only cost a
//! short linear scan.

use std::path::Path;
use std::sync::Arc;

use crate::dn::Dn;
use crate::error::Result;
use crate::idset::EntryId;
use crate::storage::{bytewise, Database, Environment};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

type Chain = Vec<(String, u64)>;

/// Disk-backed DN set, removed with its scratch directory on drop
pub struct DnCache {
    _env: Environment,
    db: Arc<Database>,
}

impl DnCache {
    pub fn open(dir: &Path) -> Result<Self> {
        let env = Environment::temporary(dir)?;
        let db = env.open_database("dn_cache", bytewise())?;
        Ok(Self { _env: env, db })
    }

    /// Record `dn`; false if it was already present
    pub fn insert(&self, dn: &Dn, id: EntryId) -> Result<bool> {
        let normalized = dn.to_normalized_string();
        let key = fnv1a_64(normalized.as_bytes()).to_be_bytes();
        let mut inserted = false;
        self.db.update(&key, |existing| {
            let mut chain: Chain = match existing {
                Some(bytes) => bincode::deserialize(bytes)?,
                None => Vec::new(),
            };
            if chain.iter().any(|(d, _)| d == &normalized) {
                return Ok(Some(bincode::serialize(&chain)?));
            }
            chain.push((normalized.clone(), id.as_u64()));
            inserted = true;
            Ok(Some(bincode::serialize(&chain)?))
        })?;
        Ok(inserted)
    }

    pub fn get(&self, dn: &Dn) -> Result<Option<EntryId>> {
        let normalized = dn.to_normalized_string();
        let key = fnv1a_64(normalized.as_bytes()).to_be_bytes();
        let Some(bytes) = self.db.get(&key) else {
            return Ok(None);
        };
        let chain: Chain = bincode::deserialize(&bytes)?;
        Ok(chain
            .into_iter()
            .find(|(d, _)| d == &normalized)
            .map(|(_, id)| EntryId::new(id)))
    }

    pub fn contains(&self, dn: &Dn) -> Result<bool> {
        Ok(self.get(dn)?.is_some())
    }

    /// Number of distinct hash keys
    pub fn len(&self) -> u64 {
        self.db.record_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
