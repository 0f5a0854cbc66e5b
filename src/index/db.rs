//! Index database
//!
//! A key → [`EntryIdSet`] database. Writes that push a key's set past the
//! entry limit turn it into a count-only (or undefined) marker; the key
//! stays that way until the index is rebuilt.
//!
//! An index that is not trusted (never built, or being rebuilt) answers
//! every read with an undefined set so callers fall back to a full scan.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::idset::{ConditionResult, EntryId, EntryIdSet};
use crate::storage::{bytewise, Database, Environment};

use super::state::State;

/// One key → entry-ID-set database
#[derive(Debug)]
pub struct Index {
    name: String,
    db: Arc<Database>,
    state: State,
    /// 0 means unlimited
    entry_limit: AtomicUsize,
    maintain_count: bool,
    trusted: AtomicBool,
    rebuild_running: AtomicBool,
    /// Keys that crossed the entry limit since open
    entry_limit_exceeded: AtomicU64,
}

impl Index {
    /// Open (or create) the index database `name`.
    ///
    /// A missing trusted flag means trusted when the container holds no
    /// entries yet, untrusted otherwise.
    pub fn open(
        env: &Environment,
        state: &State,
        name: &str,
        entry_limit: usize,
        maintain_count: bool,
        container_empty: bool,
    ) -> Result<Self> {
        let db = env.open_database(name, bytewise())?;
        let stored = state.get_trusted(name);
        let trusted = stored.unwrap_or(false) || container_empty;
        if stored != Some(trusted) {
            state.put_trusted(name, trusted);
        }
        debug!(index = name, trusted, entry_limit, "Opened index");

        Ok(Self {
            name: name.to_string(),
            db,
            state: state.clone(),
            entry_limit: AtomicUsize::new(entry_limit),
            maintain_count,
            trusted: AtomicBool::new(trusted),
            rebuild_running: AtomicBool::new(false),
            entry_limit_exceeded: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn entry_limit(&self) -> usize {
        self.entry_limit.load(Ordering::Relaxed)
    }

    /// Change the entry limit; returns true if it differs from the old one
    pub fn set_entry_limit(&self, limit: usize) -> bool {
        self.entry_limit.swap(limit, Ordering::Relaxed) != limit
    }

    pub fn maintain_count(&self) -> bool {
        self.maintain_count
    }

    /// Number of keys that crossed the entry limit
    pub fn entry_limit_exceeded_count(&self) -> u64 {
        self.entry_limit_exceeded.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Trust / rebuild state
    // =========================================================================

    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::Acquire)
    }

    /// Persist and apply the trusted flag
    pub fn set_trusted(&self, trusted: bool) {
        self.state.put_trusted(&self.name, trusted);
        self.trusted.store(trusted, Ordering::Release);
        info!(index = %self.name, trusted, "Index trust state changed");
    }

    pub fn is_rebuild_running(&self) -> bool {
        self.rebuild_running.load(Ordering::Acquire)
    }

    pub fn set_rebuild_status(&self, running: bool) {
        self.rebuild_running.store(running, Ordering::Release);
    }

    fn usable(&self) -> bool {
        self.is_trusted() && !self.is_rebuild_running()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a delta to one key: `deleted` IDs are removed, `added` IDs
    /// are inserted. A defined result past the entry limit becomes a
    /// count-only marker (or undefined without count maintenance).
    pub fn update_key(&self, key: &[u8], deleted: &EntryIdSet, added: &EntryIdSet) -> Result<()> {
        if deleted.is_empty() && added.is_empty() {
            return Ok(());
        }
        let limit = self.entry_limit();
        let mut flipped = false;

        self.db.update(key, |current| {
            let mut set = match current {
                Some(bytes) => EntryIdSet::decode(bytes)?,
                None => EntryIdSet::new(),
            };
            let was_defined = set.is_defined();
            set.delete_all(deleted);
            set.add_all(added);
            let (set, crossed) = set.apply_limit(limit, self.maintain_count);
            // Bulk deltas may arrive already past the limit
            flipped = crossed || (was_defined && !set.is_defined());
            if set.is_empty() {
                Ok(None)
            } else {
                Ok(Some(set.encode()))
            }
        })?;

        if flipped {
            self.entry_limit_exceeded.fetch_add(1, Ordering::Relaxed);
            debug!(index = %self.name, limit, "Index key exceeded entry limit");
        }
        Ok(())
    }

    /// Add IDs to a key
    pub fn insert(&self, key: &[u8], ids: &EntryIdSet) -> Result<()> {
        self.update_key(key, &EntryIdSet::new(), ids)
    }

    /// Add one ID to a key
    pub fn insert_id(&self, key: &[u8], id: EntryId) -> Result<()> {
        self.insert(key, &EntryIdSet::single(id))
    }

    /// Remove IDs from a key
    pub fn delete(&self, key: &[u8], ids: &EntryIdSet) -> Result<()> {
        self.update_key(key, ids, &EntryIdSet::new())
    }

    /// Remove one ID from a key
    pub fn delete_id(&self, key: &[u8], id: EntryId) -> Result<()> {
        self.delete(key, &EntryIdSet::single(id))
    }

    /// Drop a key entirely
    pub fn remove_key(&self, key: &[u8]) -> bool {
        self.db.delete(key)
    }

    /// Remove every key and reset the exceeded counter
    pub fn clear(&self) {
        self.db.truncate();
        self.entry_limit_exceeded.store(0, Ordering::Relaxed);
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Stored set of a key, ignoring the trusted flag
    pub fn read_raw(&self, key: &[u8]) -> Result<EntryIdSet> {
        match self.db.get(key) {
            Some(bytes) => EntryIdSet::decode(&bytes),
            None => Ok(EntryIdSet::new()),
        }
    }

    /// IDs for `key`; undefined when the index cannot be trusted
    pub fn read_key(&self, key: &[u8]) -> Result<EntryIdSet> {
        if !self.usable() {
            return Ok(EntryIdSet::Undefined);
        }
        self.read_raw(key)
    }

    /// Union of the sets of every key between the bounds.
    ///
    /// An empty `lower` means "from the first key"; an empty `upper` means
    /// "to the last key".
    pub fn read_range(
        &self,
        lower: &[u8],
        upper: &[u8],
        lower_inclusive: bool,
        upper_inclusive: bool,
    ) -> Result<EntryIdSet> {
        if !self.usable() {
            return Ok(EntryIdSet::Undefined);
        }
        let lo = match (lower.is_empty(), lower_inclusive) {
            (true, _) => Bound::Unbounded,
            (false, true) => Bound::Included(lower),
            (false, false) => Bound::Excluded(lower),
        };
        let hi = match (upper.is_empty(), upper_inclusive) {
            (true, _) => Bound::Unbounded,
            (false, true) => Bound::Included(upper),
            (false, false) => Bound::Excluded(upper),
        };

        let mut result = EntryIdSet::new();
        for (_, value) in self.db.range(lo, hi) {
            let set = EntryIdSet::decode(&value)?;
            result.add_all(&set);
            if result == EntryIdSet::Undefined {
                break;
            }
        }
        Ok(result)
    }

    /// Whether `key` references `id`
    pub fn contains_id(&self, key: &[u8], id: EntryId) -> Result<ConditionResult> {
        if !self.usable() {
            return Ok(ConditionResult::Undefined);
        }
        match self.db.get(key) {
            Some(bytes) => Ok(EntryIdSet::decode(&bytes)?.contains(id)),
            None => Ok(ConditionResult::False),
        }
    }

    pub fn key_count(&self) -> u64 {
        self.db.record_count()
    }
}
