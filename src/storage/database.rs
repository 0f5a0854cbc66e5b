//! Named database
//!
//! An ordered key/value map under a pluggable comparator.
//!
//! ## Concurrency:
//! - `records`: protected by RwLock (many concurrent readers, exclusive writer)
//! - every mutating call is atomic; `update` gives read-modify-write
//! - cursors hold no lock between steps, they re-seek from their last key

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{DirError, Result};

use super::comparator::KeyComparator;
use super::dbfile::{DbFileBuilder, DbFileReader};

/// A key paired with the comparator that orders it
#[derive(Clone)]
struct DbKey {
    bytes: Vec<u8>,
    cmp: Arc<dyn KeyComparator>,
}

impl PartialEq for DbKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DbKey {}

impl PartialOrd for DbKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DbKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp.compare(&self.bytes, &other.bytes)
    }
}

/// Key/value pair returned by reads
pub type Record = (Vec<u8>, Vec<u8>);

/// One named key/value database
pub struct Database {
    name: String,
    path: PathBuf,
    comparator: Arc<dyn KeyComparator>,
    records: RwLock<BTreeMap<DbKey, Vec<u8>>>,
    dirty: AtomicBool,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("comparator", &self.comparator.name())
            .finish()
    }
}

impl Database {
    /// Open a database, loading `path` if it exists
    pub(crate) fn open(name: &str, path: PathBuf, comparator: Arc<dyn KeyComparator>) -> Result<Self> {
        let mut records = BTreeMap::new();
        if path.exists() {
            let mut reader = DbFileReader::open(&path)?;
            if reader.comparator_name() != comparator.name() {
                return Err(DirError::Storage(format!(
                    "database '{}' was written with comparator '{}', opened with '{}'",
                    name,
                    reader.comparator_name(),
                    comparator.name()
                )));
            }
            for record in reader.iter()? {
                let (key, value) = record?;
                records.insert(
                    DbKey {
                        bytes: key,
                        cmp: comparator.clone(),
                    },
                    value,
                );
            }
            debug!(database = name, records = records.len(), "Loaded database");
        }

        Ok(Self {
            name: name.to_string(),
            path,
            comparator,
            records: RwLock::new(records),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn comparator(&self) -> &Arc<dyn KeyComparator> {
        &self.comparator
    }

    fn key(&self, bytes: &[u8]) -> DbKey {
        DbKey {
            bytes: bytes.to_vec(),
            cmp: self.comparator.clone(),
        }
    }

    fn bound(&self, b: Bound<&[u8]>) -> Bound<DbKey> {
        match b {
            Bound::Included(k) => Bound::Included(self.key(k)),
            Bound::Excluded(k) => Bound::Excluded(self.key(k)),
            Bound::Unbounded => Bound::Unbounded,
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, AtomicOrdering::Release);
    }

    // =========================================================================
    // Point operations
    // =========================================================================

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.records.read().get(&self.key(key)).cloned()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.records.read().contains_key(&self.key(key))
    }

    /// Insert or overwrite
    pub fn put(&self, key: &[u8], value: &[u8]) {
        self.records.write().insert(self.key(key), value.to_vec());
        self.mark_dirty();
    }

    /// Insert only if absent; returns false when the key already exists
    pub fn put_no_overwrite(&self, key: &[u8], value: &[u8]) -> bool {
        let mut records = self.records.write();
        let k = self.key(key);
        if records.contains_key(&k) {
            return false;
        }
        records.insert(k, value.to_vec());
        drop(records);
        self.mark_dirty();
        true
    }

    /// Delete a key; returns whether it existed
    pub fn delete(&self, key: &[u8]) -> bool {
        let removed = self.records.write().remove(&self.key(key)).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Atomic read-modify-write. `f` sees the current value and returns the
    /// new one (`None` deletes the key).
    pub fn update<F>(&self, key: &[u8], f: F) -> Result<()>
    where
        F: FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>>,
    {
        let mut records = self.records.write();
        let k = self.key(key);
        let new_value = f(records.get(&k).map(|v| v.as_slice()))?;
        match new_value {
            Some(v) => {
                records.insert(k, v);
            }
            None => {
                records.remove(&k);
            }
        }
        drop(records);
        self.mark_dirty();
        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.records.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Remove every record
    pub fn truncate(&self) {
        self.records.write().clear();
        self.mark_dirty();
    }

    // =========================================================================
    // Ordered access
    // =========================================================================

    /// First record with key >= `key` (search-key-range)
    pub fn seek(&self, key: &[u8]) -> Option<Record> {
        self.first_in(Bound::Included(key), Bound::Unbounded)
    }

    /// First record strictly after `key`
    pub fn next_after(&self, key: &[u8]) -> Option<Record> {
        self.first_in(Bound::Excluded(key), Bound::Unbounded)
    }

    /// Last record strictly before `key`
    pub fn prev_before(&self, key: &[u8]) -> Option<Record> {
        let records = self.records.read();
        records
            .range((Bound::Unbounded, Bound::Excluded(self.key(key))))
            .next_back()
            .map(|(k, v)| (k.bytes.clone(), v.clone()))
    }

    pub fn first(&self) -> Option<Record> {
        self.first_in(Bound::Unbounded, Bound::Unbounded)
    }

    pub fn last(&self) -> Option<Record> {
        self.records
            .read()
            .iter()
            .next_back()
            .map(|(k, v)| (k.bytes.clone(), v.clone()))
    }

    fn first_in(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Option<Record> {
        self.records
            .read()
            .range((self.bound(lower), self.bound(upper)))
            .next()
            .map(|(k, v)| (k.bytes.clone(), v.clone()))
    }

    /// Snapshot of the records within the bounds, in key order
    pub fn range(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Vec<Record> {
        if let (Bound::Included(l) | Bound::Excluded(l), Bound::Included(u) | Bound::Excluded(u)) =
            (lower, upper)
        {
            let both_excluded =
                matches!(lower, Bound::Excluded(_)) && matches!(upper, Bound::Excluded(_));
            match self.comparator.compare(l, u) {
                Ordering::Greater => return Vec::new(),
                Ordering::Equal if both_excluded => return Vec::new(),
                _ => {}
            }
        }
        self.records
            .read()
            .range((self.bound(lower), self.bound(upper)))
            .map(|(k, v)| (k.bytes.clone(), v.clone()))
            .collect()
    }

    /// Snapshot of every record, for bulk reads that do not care about order
    pub fn disk_ordered_scan(&self) -> Vec<Record> {
        self.records
            .read()
            .iter()
            .map(|(k, v)| (k.bytes.clone(), v.clone()))
            .collect()
    }

    /// Cursor positioned before the first record
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor {
            db: self,
            position: None,
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write the database file if anything changed since the last sync
    pub fn sync(&self) -> Result<()> {
        if !self.dirty.swap(false, AtomicOrdering::AcqRel) {
            return Ok(());
        }
        let records = self.records.read();
        let written = (|| {
            let mut builder = DbFileBuilder::new(&self.path, &self.comparator.name())?;
            for (k, v) in records.iter() {
                builder.add(&k.bytes, v)?;
            }
            builder.finish()
        })();
        match written {
            Ok(count) => {
                debug!(database = %self.name, records = count, "Synced database");
                Ok(())
            }
            Err(e) => {
                self.mark_dirty();
                warn!(database = %self.name, error = %e, "Database sync failed");
                Err(e)
            }
        }
    }
}

/// Bidirectional cursor over a database.
///
/// Each step re-seeks from the last returned key, so concurrent writers are
/// never blocked and the cursor sees their committed changes.
pub struct Cursor<'a> {
    db: &'a Database,
    position: Option<Vec<u8>>,
}

impl<'a> Cursor<'a> {
    pub fn first(&mut self) -> Option<Record> {
        self.moved(self.db.first())
    }

    pub fn last(&mut self) -> Option<Record> {
        self.moved(self.db.last())
    }

    /// Position at the first record with key >= `key`
    pub fn seek(&mut self, key: &[u8]) -> Option<Record> {
        self.moved(self.db.seek(key))
    }

    /// Position exactly at `key`
    pub fn seek_exact(&mut self, key: &[u8]) -> Option<Record> {
        let value = self.db.get(key)?;
        self.moved(Some((key.to_vec(), value)))
    }

    /// Step forward; from the initial position this is `first()`
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Record> {
        let found = match &self.position {
            None => self.db.first(),
            Some(k) => self.db.next_after(k),
        };
        self.moved(found)
    }

    /// Step backward; from the initial position this is `last()`
    pub fn prev(&mut self) -> Option<Record> {
        let found = match &self.position {
            None => self.db.last(),
            Some(k) => self.db.prev_before(k),
        };
        self.moved(found)
    }

    fn moved(&mut self, found: Option<Record>) -> Option<Record> {
        if let Some((k, _)) = &found {
            self.position = Some(k.clone());
        }
        found
    }
}
