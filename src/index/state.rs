//! Index state database
//!
//! Records whether each index of a container is trusted. Keyed by the
//! index's database name; the value is a single byte (1 = trusted).

use std::sync::Arc;

use crate::error::Result;
use crate::storage::{bytewise, Database, Environment};

const TRUSTED: u8 = 1;
const UNTRUSTED: u8 = 0;

/// Trusted/untrusted flags of every index in a container
#[derive(Debug, Clone)]
pub struct State {
    db: Arc<Database>,
}

impl State {
    /// Open `{prefix}_state`
    pub fn open(env: &Environment, prefix: &str) -> Result<Self> {
        let db = env.open_database(&format!("{}_state", prefix), bytewise())?;
        Ok(Self { db })
    }

    /// Stored flag, or None if the index never recorded one
    pub fn get_trusted(&self, index_name: &str) -> Option<bool> {
        self.db
            .get(index_name.as_bytes())
            .map(|v| v.first() == Some(&TRUSTED))
    }

    pub fn put_trusted(&self, index_name: &str, trusted: bool) {
        let flag = if trusted { TRUSTED } else { UNTRUSTED };
        self.db.put(index_name.as_bytes(), &[flag]);
    }

    pub fn remove(&self, index_name: &str) {
        self.db.delete(index_name.as_bytes());
    }

    /// Names of every index currently flagged untrusted
    pub fn untrusted(&self) -> Vec<String> {
        self.db
            .disk_ordered_scan()
            .into_iter()
            .filter(|(_, v)| v.first() != Some(&TRUSTED))
            .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
            .collect()
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}
