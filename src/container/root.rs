//! Root container
//!
//! Owns the storage environment, the entry ID allocator, and one
//! [`EntryContainer`] per configured base DN.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::config::Config;
use crate::dn::Dn;
use crate::error::Result;
use crate::idset::EntryId;
use crate::schema::Schema;
use crate::storage::Environment;

use super::EntryContainer;

/// Database name prefix for a base DN: its normalized form with every
/// character outside `[a-z0-9]` replaced by `_`
pub fn database_prefix(base_dn: &Dn) -> String {
    if base_dn.is_root() {
        return "root".to_string();
    }
    base_dn
        .to_normalized_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Hands out monotonically increasing entry IDs shared by every container
#[derive(Debug)]
pub struct EntryIdAllocator {
    next: AtomicU64,
}

impl EntryIdAllocator {
    /// IDs start at 1
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> EntryId {
        EntryId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// The ID the next call would return
    pub fn peek(&self) -> EntryId {
        EntryId::new(self.next.load(Ordering::Relaxed))
    }

    /// Make sure future IDs are greater than `id`
    pub fn advance_past(&self, id: EntryId) {
        self.next.fetch_max(id.as_u64() + 1, Ordering::Relaxed);
    }
}

impl Default for EntryIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Every naming context of a backend
pub struct RootContainer {
    config: Config,
    env: Arc<Environment>,
    schema: Arc<Schema>,
    allocator: Arc<EntryIdAllocator>,
    /// Keyed by normalized base DN
    containers: RwLock<BTreeMap<String, Arc<EntryContainer>>>,
}

impl RootContainer {
    /// Open the environment and every configured container. The allocator
    /// resumes after the highest stored entry ID.
    pub fn open(config: Config, schema: Schema) -> Result<Self> {
        config.validate()?;
        let env = Arc::new(Environment::open(&config.data_dir)?);
        let schema = Arc::new(schema);
        let allocator = Arc::new(EntryIdAllocator::new());

        let mut containers = BTreeMap::new();
        for base_dn in &config.base_dns {
            let container = EntryContainer::open(
                env.clone(),
                base_dn.clone(),
                &config,
                schema.clone(),
                allocator.clone(),
            )?;
            if let Some(highest) = container.id2entry().highest_id()? {
                allocator.advance_past(highest);
            }
            containers.insert(base_dn.to_normalized_string(), Arc::new(container));
        }

        info!(
            data_dir = %config.data_dir.display(),
            containers = containers.len(),
            next_id = %allocator.peek(),
            "Opened root container"
        );
        Ok(Self {
            config,
            env,
            schema,
            allocator,
            containers: RwLock::new(containers),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn allocator(&self) -> &Arc<EntryIdAllocator> {
        &self.allocator
    }

    /// Container whose base DN is exactly `base_dn`
    pub fn container(&self, base_dn: &Dn) -> Option<Arc<EntryContainer>> {
        self.containers.read().get(&base_dn.to_normalized_string()).cloned()
    }

    /// Container holding `dn`: the one with the deepest matching base DN
    pub fn container_for(&self, dn: &Dn) -> Option<Arc<EntryContainer>> {
        self.containers
            .read()
            .values()
            .filter(|c| c.handles(dn))
            .max_by_key(|c| c.base_dn().size())
            .cloned()
    }

    pub fn containers(&self) -> Vec<Arc<EntryContainer>> {
        self.containers.read().values().cloned().collect()
    }

    /// Entries across every container
    pub fn entry_count(&self) -> u64 {
        self.containers.read().values().map(|c| c.entry_count()).sum()
    }

    /// Flush every database to disk
    pub fn sync(&self) -> Result<()> {
        self.env.sync()
    }
}
