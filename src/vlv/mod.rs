//! VLV Index Module
//!
//! Pre-sorted result lists for one (base DN, scope, filter, sort order)
//! combination, so sorted and paged searches need no sort at query time.
//!
//! ## Layout
//! ```text
//!   key(run 1)        key(run 2)             <empty>
//!   = last of run 1   = last of run 2        = unbounded last run
//!  +--------------+  +--------------+  ...  +--------------+
//!  | a1 a2 .. aN  |  | b1 b2 .. bM  |       | z1 z2 .. zK  |
//!  +--------------+  +--------------+       +--------------+
//! ```
//! Every tuple of a run sorts <= the run's key and > the previous run's key.
//! A run that reaches the block size is split at its midpoint; the lower
//! half is stored under its own last tuple, the upper half keeps the old key.
//! Runs are never merged back together.

mod comparator;
mod sort_values;

pub(crate) use comparator::compare_value;
pub use comparator::VlvKeyComparator;
pub use sort_values::{SortValues, SortValuesSet};

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::VlvIndexConfig;
use crate::dn::Dn;
use crate::entry::{Entry, Modification};
use crate::error::{DirError, Result};
use crate::filter::{Filter, SearchScope, SortOrder, VlvRequest, VlvResponse};
use crate::idset::EntryId;
use crate::index::{ConfigChangeResult, IndexBuffer, State};
use crate::schema::{MatchingRule, Schema};
use crate::storage::{Database, Environment, KeyComparator};


/// Entry IDs in sort order plus the VLV response, if one was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvResult {
    pub ids: Vec<EntryId>,
    pub response: Option<VlvResponse>,
}

/// A VLV sorted index
pub struct VlvIndex {
    name: String,
    db_name: String,
    db: Arc<Database>,
    state: State,
    comparator: Arc<VlvKeyComparator>,
    reverse: Vec<bool>,
    schema: Arc<Schema>,
    config: RwLock<VlvIndexConfig>,
    count: AtomicU64,
    trusted: AtomicBool,
    rebuild_running: AtomicBool,
    /// Serializes run read-modify-write cycles
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for VlvIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VlvIndex")
            .field("name", &self.name)
            .field("count", &self.count())
            .finish()
    }
}

impl VlvIndex {
    /// Open `{prefix}_vlv.{name}`; an index created on an empty container
    /// starts out trusted.
    pub fn open(
        env: &Environment,
        state: &State,
        prefix: &str,
        config: VlvIndexConfig,
        schema: Arc<Schema>,
        container_empty: bool,
    ) -> Result<Self> {
        if config.max_block_size < 2 {
            return Err(DirError::Config(format!(
                "VLV index {} needs a block size of at least 2",
                config.name
            )));
        }
        let reverse: Vec<bool> = config.sort_order.keys.iter().map(|k| k.reverse).collect();
        let comparator = Arc::new(VlvKeyComparator::new(reverse.clone()));
        let db_name = format!("{}_vlv.{}", prefix, config.name);
        let db = env.open_database(&db_name, comparator.clone())?;

        let stored = state.get_trusted(&db_name);
        let trusted = stored.unwrap_or(false) || container_empty;
        if stored != Some(trusted) {
            state.put_trusted(&db_name, trusted);
        }

        let index = Self {
            name: config.name.clone(),
            db_name,
            db,
            state: state.clone(),
            comparator,
            reverse,
            schema,
            config: RwLock::new(config),
            count: AtomicU64::new(0),
            trusted: AtomicBool::new(trusted),
            rebuild_running: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        };
        let count = index.recount();
        index.count.store(count, AtomicOrdering::Relaxed);
        debug!(vlv = %index.name, trusted, count, "Opened VLV index");
        Ok(index)
    }

    fn recount(&self) -> u64 {
        let mut total = 0u64;
        for (key, value) in self.db.disk_ordered_scan() {
            match SortValuesSet::decode(&value, &self.reverse) {
                Ok(run) => total += run.len() as u64,
                Err(e) => warn!(vlv = %self.name, key_len = key.len(), error = %e, "Unreadable VLV run"),
            }
        }
        total
    }

    /// Configured name (without the container prefix)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the backing database, also the state-db key
    pub fn database_name(&self) -> &str {
        &self.db_name
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn config(&self) -> VlvIndexConfig {
        self.config.read().clone()
    }

    pub fn comparator(&self) -> &Arc<VlvKeyComparator> {
        &self.comparator
    }

    /// Number of indexed entries
    pub fn count(&self) -> u64 {
        self.count.load(AtomicOrdering::Relaxed)
    }

    pub fn run_count(&self) -> u64 {
        self.db.record_count()
    }

    pub fn block_size(&self) -> usize {
        self.config.read().max_block_size
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted.load(AtomicOrdering::Acquire)
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.state.put_trusted(&self.db_name, trusted);
        self.trusted.store(trusted, AtomicOrdering::Release);
        info!(vlv = %self.name, trusted, "VLV index trust state changed");
    }

    pub fn is_rebuild_running(&self) -> bool {
        self.rebuild_running.load(AtomicOrdering::Acquire)
    }

    pub fn set_rebuild_status(&self, running: bool) {
        self.rebuild_running.store(running, AtomicOrdering::Release);
    }

    /// Drop every run
    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.db.truncate();
        self.count.store(0, AtomicOrdering::Relaxed);
    }

    // =========================================================================
    // Entry maintenance
    // =========================================================================

    /// Whether `entry` belongs in this index
    pub fn include_entry(&self, entry: &Entry) -> bool {
        let config = self.config.read();
        config.scope.contains(&config.base_dn, entry.dn()) && config.filter.matches(entry, &self.schema)
    }

    pub fn sort_values(&self, id: EntryId, entry: &Entry) -> SortValues {
        let order = self.config.read().sort_order.clone();
        SortValues::from_entry(id, entry, &order, &self.schema)
    }

    /// Queue the entry's sort values; false if it is out of scope
    pub fn add_entry(self: &Arc<Self>, buffer: &mut IndexBuffer, id: EntryId, entry: &Entry) -> bool {
        if !self.include_entry(entry) {
            return false;
        }
        let sv = self.sort_values(id, entry);
        buffer.vlv_values_for(self).add_values(sv);
        true
    }

    pub fn remove_entry(self: &Arc<Self>, buffer: &mut IndexBuffer, id: EntryId, entry: &Entry) -> bool {
        if !self.include_entry(entry) {
            return false;
        }
        let sv = self.sort_values(id, entry);
        buffer.vlv_values_for(self).delete_values(sv);
        true
    }

    /// Reindex an entry whose scope membership or sort values changed
    pub fn modify_entry(
        self: &Arc<Self>,
        buffer: &mut IndexBuffer,
        id: EntryId,
        old: &Entry,
        new: &Entry,
        mods: &[Modification],
    ) {
        match (self.include_entry(old), self.include_entry(new)) {
            (true, true) => {
                let sorted_attr_changed = mods.is_empty()
                    || self.config.read().sort_order.keys.iter().any(|k| {
                        mods.iter().any(|m| m.attribute().eq_ignore_ascii_case(&k.attribute))
                    });
                if sorted_attr_changed {
                    self.remove_entry(buffer, id, old);
                    self.add_entry(buffer, id, new);
                }
            }
            (true, false) => {
                self.remove_entry(buffer, id, old);
            }
            (false, true) => {
                self.add_entry(buffer, id, new);
            }
            (false, false) => {}
        }
    }

    /// Insert one entry straight into its run, splitting if needed.
    /// Returns false when the entry is out of scope or already indexed.
    pub fn insert_entry(&self, id: EntryId, entry: &Entry) -> Result<bool> {
        if !self.include_entry(entry) {
            return Ok(false);
        }
        self.insert_values(self.sort_values(id, entry))
    }

    /// Insert one tuple straight into its run
    pub fn insert_values(&self, sv: SortValues) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let key = self.comparator.encode(&sv);
        let (run_key, mut run) = self.run_for(&key)?;
        let added = run.add(sv, &self.reverse);
        self.store_run(run_key, run)?;
        if added {
            self.count.fetch_add(1, AtomicOrdering::Relaxed);
        }
        Ok(added)
    }

    /// Apply a batch of additions and deletions in one pass over the runs.
    ///
    /// Both sides are sorted, then walked together: each step loads the run
    /// holding the smallest pending tuple and consumes every pending tuple
    /// up to that run's bound.
    pub fn update_index(&self, mut added: Vec<SortValues>, mut deleted: Vec<SortValues>) -> Result<()> {
        if added.is_empty() && deleted.is_empty() {
            return Ok(());
        }
        let reverse = &self.reverse;
        added.sort_by(|a, b| a.compare(b, reverse));
        added.dedup();
        deleted.sort_by(|a, b| a.compare(b, reverse));
        deleted.dedup();

        let _guard = self.write_lock.lock();
        let (mut ai, mut di) = (0, 0);
        while ai < added.len() || di < deleted.len() {
            let next = match (added.get(ai), deleted.get(di)) {
                (Some(a), Some(d)) if a.compare(d, reverse).is_lt() => a,
                (Some(_), Some(d)) => d,
                (Some(a), None) => a,
                (None, Some(d)) => d,
                (None, None) => break,
            };
            let (run_key, mut run) = self.run_for(&self.comparator.encode(next))?;
            let old_size = run.len() as i64;

            let within = |sv: &SortValues| {
                run_key.is_empty() || self.comparator.compare(&self.comparator.encode(sv), &run_key).is_le()
            };
            while let Some(a) = added.get(ai).filter(|a| within(*a)) {
                run.add(a.clone(), reverse);
                ai += 1;
            }
            while let Some(d) = deleted.get(di).filter(|d| within(*d)) {
                run.remove(d, reverse);
                di += 1;
            }

            let delta = run.len() as i64 - old_size;
            self.store_run(run_key, run)?;
            if delta >= 0 {
                self.count.fetch_add(delta as u64, AtomicOrdering::Relaxed);
            } else {
                self.count.fetch_sub(delta.unsigned_abs(), AtomicOrdering::Relaxed);
            }
        }
        Ok(())
    }

    /// Whether the tuple is indexed
    pub fn contains(&self, sv: &SortValues) -> Result<bool> {
        let (_, run) = self.run_for(&self.comparator.encode(sv))?;
        Ok(run.search(sv, &self.reverse).is_ok())
    }

    /// The run that should hold `key`: the first run whose key is >= it.
    /// With no such run a fresh unbounded run is returned.
    fn run_for(&self, key: &[u8]) -> Result<(Vec<u8>, SortValuesSet)> {
        match self.db.seek(key) {
            Some((run_key, data)) => {
                trace!(vlv = %self.name, run_key_len = run_key.len(), "Located VLV run");
                Ok((run_key, SortValuesSet::decode(&data, &self.reverse)?))
            }
            None => Ok((Vec::new(), SortValuesSet::new())),
        }
    }

    /// Persist a run under `run_key`, splitting or deleting as needed
    fn store_run(&self, run_key: Vec<u8>, run: SortValuesSet) -> Result<()> {
        if run.is_empty() {
            self.db.delete(&run_key);
            return Ok(());
        }
        let capacity = self.block_size();
        if run.len() < capacity {
            self.db.put(&run_key, &run.encode()?);
            return Ok(());
        }

        let size = run.len();
        let mut pieces = run.split(capacity);
        // The highest piece keeps the original bound
        let Some(top) = pieces.pop() else {
            return Ok(());
        };
        for piece in &pieces {
            if let Some(last) = piece.last() {
                self.db.put(&self.comparator.encode(last), &piece.encode()?);
            }
        }
        self.db.put(&run_key, &top.encode()?);
        debug!(vlv = %self.name, size, runs = pieces.len() + 1, "Split VLV run");
        Ok(())
    }

    /// Every run in key order, for verification and tests
    pub fn runs(&self) -> Result<Vec<(Vec<u8>, SortValuesSet)>> {
        let mut out = Vec::new();
        let mut cursor = self.db.cursor();
        while let Some((key, data)) = cursor.next() {
            out.push((key, SortValuesSet::decode(&data, &self.reverse)?));
        }
        Ok(out)
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Sorted (and optionally paged) IDs for a search this index was built
    /// for. Returns None when the index cannot answer: untrusted, rebuilding,
    /// or the search does not match the index definition.
    pub fn evaluate(
        &self,
        base: &Dn,
        scope: SearchScope,
        filter: &Filter,
        sort_order: &SortOrder,
        request: Option<&VlvRequest>,
        debug: &mut Option<&mut String>,
    ) -> Result<Option<VlvResult>> {
        if !self.is_trusted() || self.is_rebuild_running() {
            return Ok(None);
        }
        {
            let config = self.config.read();
            if &config.base_dn != base || config.scope != scope || &config.filter != filter || &config.sort_order != sort_order {
                return Ok(None);
            }
        }
        if let Some(buf) = debug.as_deref_mut() {
            let _ = write!(buf, "vlv=[INDEX:{}]", self.name);
        }

        let (ids, response, scanned) = match request {
            None => {
                let ids = self.all_ids()?;
                let n = ids.len();
                (ids, None, n)
            }
            Some(VlvRequest::ByOffset {
                before_count,
                after_count,
                offset,
                ..
            }) => self.evaluate_by_offset(*before_count, *after_count, *offset)?,
            Some(VlvRequest::ByAssertion {
                before_count,
                after_count,
                assertion,
            }) => self.evaluate_by_assertion(*before_count, *after_count, assertion)?,
        };
        if let Some(buf) = debug.as_deref_mut() {
            let _ = write!(buf, "[COUNT:{}]", scanned);
        }
        Ok(Some(VlvResult { ids, response }))
    }

    fn all_ids(&self) -> Result<Vec<EntryId>> {
        let mut ids = Vec::with_capacity(self.count() as usize);
        for (_, run) in self.runs()? {
            ids.extend(run.ids());
        }
        Ok(ids)
    }

    /// Window around a 1-based offset. Offset 0 means 1; an offset past the
    /// end keeps only the before-count window.
    fn evaluate_by_offset(
        &self,
        before_count: usize,
        after_count: usize,
        offset: i64,
    ) -> Result<(Vec<EntryId>, Option<VlvResponse>, usize)> {
        if offset < 0 {
            return Err(DirError::InvalidVlvRequest(format!(
                "negative target offset {}",
                offset
            )));
        }
        let current = self.count() as usize;
        let mut target = (offset.max(1)) as usize;
        let mut before = before_count;
        let mut after = after_count;
        let mut list_offset = target - 1;

        let start = if list_offset < before {
            before = list_offset;
            0
        } else if list_offset - before >= current {
            target = current + 1;
            list_offset = current;
            after = 0;
            before = before.min(list_offset);
            list_offset - before
        } else {
            list_offset - before
        };

        let wanted = 1 + before + after;
        let mut selected = Vec::with_capacity(wanted);
        let mut seen = 0usize;
        for (_, run) in self.runs()? {
            let len = run.len();
            if selected.len() < wanted && seen + len > start {
                let from = start.saturating_sub(seen);
                selected.extend(run.ids().skip(from).take(wanted - selected.len()));
            }
            seen += len;
        }
        let response = VlvResponse {
            target_position: target,
            content_count: current,
        };
        Ok((selected, Some(response), seen))
    }

    /// Window around the first tuple >= the assertion on the primary sort key
    fn evaluate_by_assertion(
        &self,
        before_count: usize,
        after_count: usize,
        assertion: &[u8],
    ) -> Result<(Vec<EntryId>, Option<VlvResponse>, usize)> {
        let current = self.count() as usize;
        let (normalized, descending) = {
            let config = self.config.read();
            let Some(first) = config.sort_order.keys.first() else {
                return Err(DirError::InvalidVlvRequest("index has no sort keys".to_string()));
            };
            let rule = first
                .rule
                .or_else(|| self.schema.attribute_type(&first.attribute).ordering)
                .unwrap_or(MatchingRule::CaseIgnore);
            let normalized = rule
                .normalize(assertion)
                .map_err(|e| DirError::InvalidVlvRequest(format!("bad assertion value: {}", e)))?;
            (normalized, first.reverse)
        };

        let runs = self.runs()?;
        let target_offset = if normalized.is_empty() {
            // A zero-length key would read as an absent value; an empty
            // assertion is the lowest present value instead
            runs.iter()
                .flat_map(|(_, r)| r.entries())
                .take_while(|sv| {
                    let value = sv.values.first().and_then(|v| v.as_deref());
                    compare_value(value, Some(&[][..]), descending) == Ordering::Less
                })
                .count()
        } else {
            let search_key = self.comparator.encode_assertion(&normalized);
            let Some(run_idx) = runs
                .iter()
                .position(|(key, _)| self.comparator.compare(key, &search_key).is_ge())
            else {
                let response = VlvResponse {
                    target_position: current + 1,
                    content_count: current,
                };
                return Ok((Vec::new(), Some(response), 0));
            };
            let in_run = runs[run_idx].1.lower_bound(&search_key, &self.comparator);
            let preceding: usize = runs[..run_idx].iter().map(|(_, r)| r.len()).sum();
            preceding + in_run
        };

        // Flatten once; runs are already in order
        let flat: Vec<EntryId> = runs.iter().flat_map(|(_, r)| r.ids()).collect();
        let from = target_offset.saturating_sub(before_count);
        let to = (target_offset + after_count + 1).min(flat.len());
        let ids = flat[from..to.max(from)].to_vec();

        let response = VlvResponse {
            target_position: target_offset + 1,
            content_count: current,
        };
        Ok((ids, Some(response), to))
    }

    // =========================================================================
    // Reconfiguration
    // =========================================================================

    /// Apply a changed definition. Block size changes apply at once; base,
    /// scope or filter changes leave the index untrusted until rebuilt.
    /// The sort order is fixed for the lifetime of the database.
    pub fn apply_configuration_change(&self, new_config: VlvIndexConfig) -> Result<ConfigChangeResult> {
        if new_config.max_block_size < 2 {
            return Err(DirError::Config(format!(
                "VLV index {} needs a block size of at least 2",
                new_config.name
            )));
        }
        let mut config = self.config.write();
        if config.sort_order != new_config.sort_order {
            return Err(DirError::Config(format!(
                "sort order of VLV index {} cannot change; remove and recreate it",
                self.name
            )));
        }
        let mut result = ConfigChangeResult::default();
        let definition_changed = config.base_dn != new_config.base_dn
            || config.scope != new_config.scope
            || config.filter != new_config.filter;
        if definition_changed && !self.db.is_empty() {
            self.set_trusted(false);
            result.admin_action_required = true;
            result
                .messages
                .push(format!("VLV index {} must be rebuilt before it can be used", self.name));
        }
        *config = new_config;
        Ok(result)
    }
}
