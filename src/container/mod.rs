//! Entry Container Module
//!
//! Every database of one naming context (base DN).
//!
//! ## Databases
//! ```text
//!   {prefix}_dn2id          DN key      -> entry ID
//!   {prefix}_id2entry       entry ID    -> encoded entry
//!   {prefix}_referral       DN key      -> referral URIs
//!   {prefix}_id2children    parent ID   -> IDs of immediate children
//!   {prefix}_id2subtree     ancestor ID -> IDs of every descendant
//!   {prefix}_{attr}.{type}  index key   -> IDs
//!   {prefix}_vlv.{name}     run bound   -> sort-values run
//!   {prefix}_state          index name  -> trusted flag
//! ```
//!
//! ## Concurrency:
//! - entry mutations are serialized by `write_lock`
//! - reads go straight to the databases and never block writers for long

mod dn2id;
mod dn2uri;
mod id2entry;
mod root;
mod search;

pub use dn2id::Dn2Id;
pub use dn2uri::{Dn2Uri, Referral};
pub use id2entry::Id2Entry;
pub use root::{database_prefix, EntryIdAllocator, RootContainer};
pub use search::{SearchRequest, SearchResult, FILTER_CANDIDATE_THRESHOLD};

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{Config, IndexConfig, VlvIndexConfig};
use crate::dn::{Dn, Rdn};
use crate::entry::{Entry, Modification};
use crate::error::{DirError, Result};
use crate::idset::EntryId;
use crate::index::{AttributeIndex, ConfigChangeResult, FilterUseMonitor, Index, IndexBuffer, IndexDefaults, State};
use crate::schema::Schema;
use crate::storage::Environment;
use crate::vlv::VlvIndex;

/// Name of the id2children index
pub const ID2CHILDREN: &str = "id2children";
/// Name of the id2subtree index
pub const ID2SUBTREE: &str = "id2subtree";

/// All databases of one base DN
pub struct EntryContainer {
    base_dn: Dn,
    prefix: String,
    env: Arc<Environment>,
    schema: Arc<Schema>,
    allocator: Arc<EntryIdAllocator>,
    defaults: IndexDefaults,
    subordinate_indexes_enabled: bool,

    state: State,
    dn2id: Dn2Id,
    id2entry: Id2Entry,
    dn2uri: Dn2Uri,
    id2children: Arc<Index>,
    id2subtree: Arc<Index>,
    attr_indexes: RwLock<BTreeMap<String, Arc<AttributeIndex>>>,
    vlv_indexes: RwLock<BTreeMap<String, Arc<VlvIndex>>>,

    filter_monitor: FilterUseMonitor,
    write_lock: Mutex<()>,
}

impl EntryContainer {
    /// Open (or create) every database of `base_dn`
    pub fn open(
        env: Arc<Environment>,
        base_dn: Dn,
        config: &Config,
        schema: Arc<Schema>,
        allocator: Arc<EntryIdAllocator>,
    ) -> Result<Self> {
        let prefix = database_prefix(&base_dn);
        let state = State::open(&env, &prefix)?;
        let dn2id = Dn2Id::open(&env, &prefix, &base_dn)?;
        let id2entry = Id2Entry::open(&env, &prefix)?;
        let dn2uri = Dn2Uri::open(&env, &prefix, &base_dn)?;
        let container_empty = id2entry.count() == 0;

        let defaults = IndexDefaults {
            entry_limit: config.index_entry_limit,
            substring_length: config.substring_length,
            maintain_count: config.maintain_count,
        };
        let open_sub = |name: &str| -> Result<Arc<Index>> {
            Ok(Arc::new(Index::open(
                &env,
                &state,
                &format!("{}_{}", prefix, name),
                defaults.entry_limit,
                defaults.maintain_count,
                container_empty,
            )?))
        };
        let id2children = open_sub(ID2CHILDREN)?;
        let id2subtree = open_sub(ID2SUBTREE)?;

        let container = Self {
            base_dn,
            prefix,
            env: env.clone(),
            schema,
            allocator,
            defaults,
            subordinate_indexes_enabled: config.subordinate_indexes_enabled,
            state,
            dn2id,
            id2entry,
            dn2uri,
            id2children,
            id2subtree,
            attr_indexes: RwLock::new(BTreeMap::new()),
            vlv_indexes: RwLock::new(BTreeMap::new()),
            filter_monitor: FilterUseMonitor::new(false),
            write_lock: Mutex::new(()),
        };

        for index_config in &config.indexes {
            container.open_attribute_index(index_config.clone(), container_empty)?;
        }
        for vlv_config in &config.vlv_indexes {
            if vlv_config.base_dn.is_descendant_of(&container.base_dn) {
                container.open_vlv_index(vlv_config.clone(), container_empty)?;
            }
        }

        info!(
            base_dn = %container.base_dn,
            entries = container.entry_count(),
            indexes = container.attr_indexes.read().len(),
            vlv_indexes = container.vlv_indexes.read().len(),
            "Opened entry container"
        );
        Ok(container)
    }

    fn open_attribute_index(&self, config: IndexConfig, container_empty: bool) -> Result<Arc<AttributeIndex>> {
        let attr_type = self.schema.attribute_type(&config.attribute);
        let index = Arc::new(AttributeIndex::open(
            &self.env,
            &self.state,
            &self.prefix,
            attr_type,
            config,
            self.defaults,
            container_empty,
        )?);
        self.attr_indexes
            .write()
            .insert(index.attribute_name().to_string(), index.clone());
        Ok(index)
    }

    fn open_vlv_index(&self, config: VlvIndexConfig, container_empty: bool) -> Result<Arc<VlvIndex>> {
        let vlv = Arc::new(VlvIndex::open(
            &self.env,
            &self.state,
            &self.prefix,
            config,
            self.schema.clone(),
            container_empty,
        )?);
        self.vlv_indexes.write().insert(vlv.name().to_string(), vlv.clone());
        Ok(vlv)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    /// Prefix of every database name in this container
    pub fn database_prefix(&self) -> &str {
        &self.prefix
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

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn dn2id(&self) -> &Dn2Id {
        &self.dn2id
    }

    pub fn id2entry(&self) -> &Id2Entry {
        &self.id2entry
    }

    pub fn dn2uri(&self) -> &Dn2Uri {
        &self.dn2uri
    }

    pub fn id2children(&self) -> &Arc<Index> {
        &self.id2children
    }

    pub fn id2subtree(&self) -> &Arc<Index> {
        &self.id2subtree
    }

    pub fn subordinate_indexes_enabled(&self) -> bool {
        self.subordinate_indexes_enabled
    }

    pub fn attribute_index(&self, attribute: &str) -> Option<Arc<AttributeIndex>> {
        self.attr_indexes.read().get(&attribute.to_ascii_lowercase()).cloned()
    }

    pub fn attribute_indexes(&self) -> Vec<Arc<AttributeIndex>> {
        self.attr_indexes.read().values().cloned().collect()
    }

    pub fn vlv_index(&self, name: &str) -> Option<Arc<VlvIndex>> {
        self.vlv_indexes.read().get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn vlv_indexes(&self) -> Vec<Arc<VlvIndex>> {
        self.vlv_indexes.read().values().cloned().collect()
    }

    pub fn filter_monitor(&self) -> &FilterUseMonitor {
        &self.filter_monitor
    }

    pub fn entry_count(&self) -> u64 {
        self.id2entry.count()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Whether `dn` belongs to this naming context
    pub fn handles(&self, dn: &Dn) -> bool {
        dn.is_descendant_of(&self.base_dn)
    }

    /// Every index and VLV index database name, as recorded in the state db
    pub fn index_names(&self) -> Vec<String> {
        let mut names = vec![
            self.id2children.name().to_string(),
            self.id2subtree.name().to_string(),
        ];
        for attr in self.attribute_indexes() {
            names.extend(attr.indexes().iter().map(|i| i.name().to_string()));
        }
        names.extend(self.vlv_indexes().iter().map(|v| v.database_name().to_string()));
        names
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn entry_id_for_dn(&self, dn: &Dn) -> Result<Option<EntryId>> {
        if !self.handles(dn) {
            return Ok(None);
        }
        self.dn2id.get(dn)
    }

    pub fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>> {
        match self.entry_id_for_dn(dn)? {
            Some(id) => self.id2entry.get(id),
            None => Ok(None),
        }
    }

    pub fn get_entry_by_id(&self, id: EntryId) -> Result<Option<Entry>> {
        self.id2entry.get(id)
    }

    /// Number of immediate children (or all descendants when `subtree`).
    /// None if the entry does not exist.
    pub fn num_subordinates(&self, dn: &Dn, subtree: bool) -> Result<Option<u64>> {
        let Some(id) = self.entry_id_for_dn(dn)? else {
            return Ok(None);
        };
        if self.subordinate_indexes_enabled {
            let index = if subtree { &self.id2subtree } else { &self.id2children };
            if let Some(n) = index.read_key(&id.to_bytes())?.size() {
                return Ok(Some(n));
            }
        }
        // Count through dn2id
        let key = self.dn2id.key(dn);
        let n = self
            .dn2id
            .subtree(dn)
            .iter()
            .filter(|(k, _)| {
                if subtree {
                    k != &key
                } else {
                    crate::keycodec::is_child_key(&key, k)
                }
            })
            .count();
        Ok(Some(n as u64))
    }

    /// Closest referral at or above `dn`
    pub fn target_referral(&self, dn: &Dn) -> Result<Option<Referral>> {
        self.dn2uri.target_referral(dn)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Add an entry; its parent must exist unless it is the base entry
    pub fn add_entry(&self, entry: &Entry) -> Result<EntryId> {
        let dn = entry.dn();
        if !self.handles(dn) {
            return Err(DirError::NoSuchEntry(format!("{} is not under {}", dn, self.base_dn)));
        }
        let _guard = self.write_lock.lock();
        if self.dn2id.get(dn)?.is_some() {
            return Err(DirError::EntryAlreadyExists(dn.to_string()));
        }
        if dn != &self.base_dn {
            let parent = dn.parent().unwrap_or_default();
            if self.dn2id.get(&parent)?.is_none() {
                return Err(DirError::NoSuchEntry(format!("parent {} of {}", parent, dn)));
            }
        }

        let id = self.allocator.next_id();
        let mut buffer = IndexBuffer::new();
        self.index_entry(&mut buffer, id, entry);
        self.index_subordinates(&mut buffer, id, dn, true)?;

        self.id2entry.put(id, entry)?;
        self.dn2id.insert(dn, id);
        self.dn2uri.add_entry(entry)?;
        buffer.flush()?;
        debug!(dn = %dn, id = %id, "Added entry");
        Ok(id)
    }

    /// Delete an entry, or its whole subtree when `subtree_delete` is set
    pub fn delete_entry(&self, dn: &Dn, subtree_delete: bool) -> Result<u64> {
        let _guard = self.write_lock.lock();
        if self.entry_id_for_dn(dn)?.is_none() {
            return Err(DirError::NoSuchEntry(dn.to_string()));
        }
        let records = self.dn2id.subtree(dn);
        if records.len() > 1 && !subtree_delete {
            return Err(DirError::NotAllowedOnNonLeaf(dn.to_string()));
        }

        let mut buffer = IndexBuffer::new();
        let mut removed = Vec::with_capacity(records.len());
        // Children sort after parents, walk leaves first
        for (_, id_bytes) in records.iter().rev() {
            let id = EntryId::from_bytes(id_bytes)?;
            let entry = self
                .id2entry
                .get(id)?
                .ok_or_else(|| DirError::Corruption(format!("dn2id references missing entry {}", id)))?;
            self.unindex_entry(&mut buffer, id, &entry);
            self.index_subordinates(&mut buffer, id, entry.dn(), false)?;
            removed.push((id, entry));
        }
        buffer.flush()?;

        for (id, entry) in &removed {
            self.dn2id.remove(entry.dn());
            self.id2entry.remove(*id);
            self.dn2uri.remove_entry(entry.dn());
            self.id2children.remove_key(&id.to_bytes());
            self.id2subtree.remove_key(&id.to_bytes());
        }
        debug!(dn = %dn, entries = removed.len(), "Deleted entry");
        Ok(removed.len() as u64)
    }

    /// Apply modifications and return the new entry
    pub fn modify_entry(&self, dn: &Dn, mods: &[Modification]) -> Result<Entry> {
        let _guard = self.write_lock.lock();
        let id = self
            .entry_id_for_dn(dn)?
            .ok_or_else(|| DirError::NoSuchEntry(dn.to_string()))?;
        let old = self
            .id2entry
            .get(id)?
            .ok_or_else(|| DirError::Corruption(format!("dn2id references missing entry {}", id)))?;
        let mut new = old.clone();
        for m in mods {
            new.apply(m);
        }
        if let Some(rdn) = dn.rdn() {
            check_rdn_values(&new, rdn)?;
        }

        let mut buffer = IndexBuffer::new();
        for attr in self.attribute_indexes() {
            attr.modify_entry(&mut buffer, id, &old, &new, mods);
        }
        for vlv in self.vlv_indexes() {
            vlv.modify_entry(&mut buffer, id, &old, &new, mods);
        }
        buffer.flush()?;
        self.id2entry.put(id, &new)?;
        self.dn2uri.modify_entry(&old, &new)?;
        Ok(new)
    }

    /// Rename an entry (and move its subtree). Returns the new DN.
    pub fn rename_entry(
        &self,
        dn: &Dn,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&Dn>,
    ) -> Result<Dn> {
        let _guard = self.write_lock.lock();
        if dn == &self.base_dn {
            return Err(DirError::NotAllowedOnNonLeaf(format!("cannot rename base entry {}", dn)));
        }
        let root_id = self
            .entry_id_for_dn(dn)?
            .ok_or_else(|| DirError::NoSuchEntry(dn.to_string()))?;
        let rdn = Rdn::parse(new_rdn)?;
        let new_parent = match new_superior {
            Some(p) => p.clone(),
            None => dn.parent().unwrap_or_default(),
        };
        if !self.handles(&new_parent) || self.dn2id.get(&new_parent)?.is_none() {
            return Err(DirError::NoSuchEntry(format!("new superior {}", new_parent)));
        }
        if new_parent.is_descendant_of(dn) {
            return Err(DirError::NotAllowedOnNonLeaf(format!(
                "cannot move {} below itself",
                dn
            )));
        }
        let new_dn = new_parent.child(rdn.clone());
        if self.dn2id.get(&new_dn)?.is_some() {
            return Err(DirError::EntryAlreadyExists(new_dn.to_string()));
        }

        let records = self.dn2id.subtree(dn);
        let mut moved = Vec::with_capacity(records.len());
        for (_, id_bytes) in &records {
            let id = EntryId::from_bytes(id_bytes)?;
            let old = self
                .id2entry
                .get(id)?
                .ok_or_else(|| DirError::Corruption(format!("dn2id references missing entry {}", id)))?;
            let target = old
                .dn()
                .rebase(dn, &new_dn)
                .ok_or_else(|| DirError::Corruption(format!("{} is not below {}", old.dn(), dn)))?;
            let mut new = old.clone();
            new.set_dn(target);
            if id == root_id {
                apply_rdn_change(&mut new, dn.rdn(), &rdn, delete_old_rdn);
            }
            moved.push((id, old, new));
        }

        let mut buffer = IndexBuffer::new();
        for (id, old, new) in &moved {
            self.index_subordinates(&mut buffer, *id, old.dn(), false)?;
            if *id == root_id {
                for attr in self.attribute_indexes() {
                    attr.modify_entry(&mut buffer, *id, old, new, &[]);
                }
            }
            for vlv in self.vlv_indexes() {
                vlv.modify_entry(&mut buffer, *id, old, new, &[]);
            }
        }
        for (_, old, _) in &moved {
            self.dn2id.remove(old.dn());
            self.dn2uri.remove_entry(old.dn());
        }
        for (id, _, new) in &moved {
            self.dn2id.insert(new.dn(), *id);
        }
        for (id, _, new) in &moved {
            self.index_subordinates(&mut buffer, *id, new.dn(), true)?;
            self.id2entry.put(*id, new)?;
            self.dn2uri.add_entry(new)?;
        }
        buffer.flush()?;
        debug!(old = %dn, new = %new_dn, entries = moved.len(), "Renamed entry");
        Ok(new_dn)
    }

    /// Queue attribute and VLV index inserts for an entry
    pub(crate) fn index_entry(&self, buffer: &mut IndexBuffer, id: EntryId, entry: &Entry) {
        for attr in self.attribute_indexes() {
            attr.add_entry(buffer, id, entry);
        }
        for vlv in self.vlv_indexes() {
            vlv.add_entry(buffer, id, entry);
        }
    }

    /// Queue attribute and VLV index deletes for an entry
    pub(crate) fn unindex_entry(&self, buffer: &mut IndexBuffer, id: EntryId, entry: &Entry) {
        for attr in self.attribute_indexes() {
            attr.remove_entry(buffer, id, entry);
        }
        for vlv in self.vlv_indexes() {
            vlv.remove_entry(buffer, id, entry);
        }
    }

    /// Queue id2children (parent) and id2subtree (every ancestor up to the
    /// base) updates for `id` at `dn`
    fn index_subordinates(&self, buffer: &mut IndexBuffer, id: EntryId, dn: &Dn, add: bool) -> Result<()> {
        if !self.subordinate_indexes_enabled {
            return Ok(());
        }
        let mut parent = if dn == &self.base_dn { None } else { dn.parent() };
        let mut immediate = true;
        while let Some(p) = parent {
            if !self.handles(&p) {
                break;
            }
            let Some(pid) = self.dn2id.get(&p)? else {
                break;
            };
            let key = pid.to_bytes().to_vec();
            if immediate {
                if add {
                    buffer.add_id(&self.id2children, key.clone(), id);
                } else {
                    buffer.delete_id(&self.id2children, key.clone(), id);
                }
                immediate = false;
            }
            if add {
                buffer.add_id(&self.id2subtree, key, id);
            } else {
                buffer.delete_id(&self.id2subtree, key, id);
            }
            parent = if p == self.base_dn { None } else { p.parent() };
        }
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Truncate every database; the now-empty indexes are trusted
    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.dn2id.database().truncate();
        self.id2entry.database().truncate();
        self.dn2uri.database().truncate();
        for index in self.all_indexes() {
            index.clear();
            index.set_trusted(true);
        }
        for vlv in self.vlv_indexes() {
            vlv.clear();
            vlv.set_trusted(true);
        }
        info!(base_dn = %self.base_dn, "Cleared entry container");
    }

    /// id2children, id2subtree and every attribute index
    pub fn all_indexes(&self) -> Vec<Arc<Index>> {
        let mut out = vec![self.id2children.clone(), self.id2subtree.clone()];
        for attr in self.attribute_indexes() {
            out.extend(attr.indexes());
        }
        out
    }

    /// Add or reconfigure the indexes of one attribute
    pub fn apply_index_config(&self, config: IndexConfig) -> Result<ConfigChangeResult> {
        let empty = self.is_empty();
        match self.attribute_index(&config.attribute) {
            Some(existing) => existing.apply_configuration_change(config, empty),
            None => {
                let attr = self.open_attribute_index(config, empty)?;
                let mut result = ConfigChangeResult::default();
                if attr.indexes().iter().any(|i| !i.is_trusted()) {
                    result.admin_action_required = true;
                    result.messages.push(format!(
                        "indexes of {} must be rebuilt before they can be used",
                        attr.attribute_name()
                    ));
                }
                Ok(result)
            }
        }
    }

    /// Drop every index of an attribute
    pub fn remove_attribute_index(&self, attribute: &str) -> Result<bool> {
        let removed = self.attr_indexes.write().remove(&attribute.to_ascii_lowercase());
        match removed {
            Some(attr) => {
                attr.delete_all()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Add or reconfigure a VLV index
    pub fn apply_vlv_config(&self, config: VlvIndexConfig) -> Result<ConfigChangeResult> {
        match self.vlv_index(&config.name) {
            Some(existing) => existing.apply_configuration_change(config),
            None => {
                let vlv = self.open_vlv_index(config, self.is_empty())?;
                let mut result = ConfigChangeResult::default();
                if !vlv.is_trusted() {
                    result.admin_action_required = true;
                    result
                        .messages
                        .push(format!("VLV index {} must be rebuilt before it can be used", vlv.name()));
                }
                Ok(result)
            }
        }
    }

    /// Whether the entry has at least one child
    pub fn has_subordinates(&self, dn: &Dn) -> Result<bool> {
        if self.subordinate_indexes_enabled {
            if let Some(id) = self.entry_id_for_dn(dn)? {
                if let Some(n) = self.id2children.read_key(&id.to_bytes())?.size() {
                    return Ok(n > 0);
                }
            }
        }
        Ok(self.dn2id.has_children(dn))
    }
}

/// Every RDN value of the entry's DN must stay present
fn check_rdn_values(entry: &Entry, rdn: &Rdn) -> Result<()> {
    for (attr, value) in rdn.attribute_values() {
        let present = entry
            .values(&attr)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(value.as_bytes()));
        if !present {
            return Err(DirError::EntryRejected(format!(
                "modification removes RDN value {}={}",
                attr, value
            )));
        }
    }
    Ok(())
}

/// Add the new RDN's values and optionally drop the old RDN's values
fn apply_rdn_change(entry: &mut Entry, old_rdn: Option<&Rdn>, new_rdn: &Rdn, delete_old_rdn: bool) {
    let new_avas = new_rdn.attribute_values();
    if delete_old_rdn {
        if let Some(old) = old_rdn {
            for (attr, value) in old.attribute_values() {
                let kept = new_avas
                    .iter()
                    .any(|(a, v)| a.eq_ignore_ascii_case(&attr) && v.eq_ignore_ascii_case(&value));
                if !kept {
                    entry.remove_value(&attr, value.as_bytes());
                }
            }
        }
    }
    for (attr, value) in new_avas {
        let present = entry
            .values(&attr)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(value.as_bytes()));
        if !present {
            entry.add_value(&attr, value.into_bytes());
        }
    }
}
