//! Entry ID → entry database

use std::sync::Arc;

use crate::entry::Entry;
use crate::error::Result;
use crate::idset::EntryId;
use crate::storage::{bytewise, Database, Environment};

#[derive(Debug, Clone)]
pub struct Id2Entry {
    db: Arc<Database>,
}

impl Id2Entry {
    pub fn open(env: &Environment, prefix: &str) -> Result<Self> {
        let db = env.open_database(&format!("{}_id2entry", prefix), bytewise())?;
        Ok(Self { db })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn get(&self, id: EntryId) -> Result<Option<Entry>> {
        self.db.get(&id.to_bytes()).map(|v| Entry::decode(&v)).transpose()
    }

    pub fn put(&self, id: EntryId, entry: &Entry) -> Result<()> {
        self.db.put(&id.to_bytes(), &entry.encode()?);
        Ok(())
    }

    pub fn remove(&self, id: EntryId) -> bool {
        self.db.delete(&id.to_bytes())
    }

    /// Highest stored ID
    pub fn highest_id(&self) -> Result<Option<EntryId>> {
        self.db.last().map(|(k, _)| EntryId::from_bytes(&k)).transpose()
    }

    pub fn count(&self) -> u64 {
        self.db.record_count()
    }
}
