//! Verify Module
//!
//! Read-only consistency check of one backend.
//!
//! ## Modes
//! ```text
//!   complete  id2entry ──► for every entry, every expected key ──► contains ID?
//!             (dn2id, id2children, id2subtree, attribute indexes, VLV)
//!
//!   clean     one index ──► for every key, every referenced ID ──► entry exists
//!             and still produces that key?
//! ```
//!
//! Nothing is ever written. Malformed records are counted as errors and the
//! walk continues with the next record.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, trace};

use crate::config::VerifyConfig;
use crate::container::{EntryContainer, RootContainer};
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::idset::{ConditionResult, EntryId, EntryIdSet};
use crate::index::{AttributeIndex, Index, Indexer};
use crate::storage::KeyComparator;
use crate::vlv::VlvIndex;

/// Distribution of how many entries referenced each over-limit key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLimitStats {
    pub index: String,
    /// Distinct keys found past the limit
    pub keys: usize,
    pub min: u64,
    pub max: u64,
    pub median: u64,
}

/// Totals of one verify run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyResult {
    pub clean_mode: bool,
    pub key_count: u64,
    pub error_count: u64,
    pub entry_limit_exceeded_count: u64,
    pub multi_reference_count: u64,
    pub entry_references_count: u64,
    pub max_entry_per_value: u64,
    /// Complete mode only
    pub entry_limit_stats: Vec<EntryLimitStats>,
    pub elapsed: Duration,
}

impl VerifyResult {
    pub fn is_clean(&self) -> bool {
        self.error_count == 0
    }

    pub fn average_references(&self) -> u64 {
        if self.key_count == 0 {
            0
        } else {
            self.entry_references_count / self.key_count
        }
    }
}

/// Which indexes one run checks
#[derive(Default)]
struct Targets {
    dn2id: bool,
    id2children: bool,
    id2subtree: bool,
    /// (attribute index, restrict to one index id)
    attributes: Vec<(Arc<AttributeIndex>, Option<String>)>,
    vlvs: Vec<Arc<VlvIndex>>,
}

/// Checks the indexes of one base DN against id2entry
pub struct VerifyJob<'a> {
    root: &'a RootContainer,
    config: VerifyConfig,
}

impl<'a> VerifyJob<'a> {
    pub fn new(root: &'a RootContainer, config: VerifyConfig) -> Self {
        Self { root, config }
    }

    pub fn verify(&self) -> Result<VerifyResult> {
        let _span = info_span!("verify", base_dn = %self.config.base_dn).entered();
        let container = self
            .root
            .container(&self.config.base_dn)
            .ok_or_else(|| DirError::Config(format!("no backend for base DN {}", self.config.base_dn)))?;

        let clean_mode = self.config.complete_list.is_empty() && !self.config.clean_list.is_empty();
        let targets = self.targets(&container, clean_mode)?;
        let mut run = Verifier::new(&container, targets, self.config.progress_interval);
        let started = Instant::now();
        if clean_mode {
            run.clean()?;
        } else {
            run.complete()?;
        }
        let result = run.finish(clean_mode, started.elapsed());

        let rate = result.key_count as f64 / result.elapsed.as_secs_f64().max(0.001);
        info!(
            keys = result.key_count,
            errors = result.error_count,
            elapsed_secs = result.elapsed.as_secs(),
            rate = rate as u64,
            clean_mode,
            "Verify finished"
        );
        if clean_mode && result.multi_reference_count > 0 {
            debug!(
                multi_reference = result.multi_reference_count,
                limit_exceeded = result.entry_limit_exceeded_count,
                average_references = result.average_references(),
                max_references = result.max_entry_per_value,
                "Index reference statistics"
            );
        }
        for stats in &result.entry_limit_stats {
            debug!(
                index = %stats.index,
                keys = stats.keys,
                min = stats.min,
                max = stats.max,
                median = stats.median,
                "Entry limit statistics"
            );
        }
        Ok(result)
    }

    fn targets(&self, container: &EntryContainer, clean_mode: bool) -> Result<Targets> {
        let mut targets = Targets::default();
        let names: &[String] = if clean_mode {
            // One index per clean run
            &self.config.clean_list[..1]
        } else {
            &self.config.complete_list
        };

        if names.is_empty() {
            targets.dn2id = true;
            targets.id2children = container.subordinate_indexes_enabled();
            targets.id2subtree = container.subordinate_indexes_enabled();
            targets.attributes = container.attribute_indexes().into_iter().map(|a| (a, None)).collect();
            targets.vlvs = container.vlv_indexes();
            return Ok(targets);
        }

        for name in names {
            let lower = name.to_ascii_lowercase();
            match lower.as_str() {
                "dn2id" => targets.dn2id = true,
                "id2children" | "id2subtree" => {
                    if !container.subordinate_indexes_enabled() {
                        return Err(DirError::Config(format!(
                            "{} cannot be verified: subordinate indexes are disabled",
                            lower
                        )));
                    }
                    if lower == "id2children" {
                        targets.id2children = true;
                    } else {
                        targets.id2subtree = true;
                    }
                }
                _ => {
                    if let Some(vlv_name) = lower.strip_prefix("vlv.") {
                        let vlv = container
                            .vlv_index(vlv_name)
                            .ok_or_else(|| DirError::IndexNotConfigured(lower.clone()))?;
                        targets.vlvs.push(vlv);
                        continue;
                    }
                    let (attribute, index_id) = match lower.split_once('.') {
                        Some((a, i)) => (a, Some(i.to_string())),
                        None => (lower.as_str(), None),
                    };
                    let attr = container
                        .attribute_index(attribute)
                        .ok_or_else(|| DirError::IndexNotConfigured(name.clone()))?;
                    if let Some(id) = &index_id {
                        if attr.index(id).is_none() {
                            return Err(DirError::IndexNotConfigured(name.clone()));
                        }
                    }
                    targets.attributes.push((attr, index_id));
                }
            }
        }
        Ok(targets)
    }
}

// =============================================================================
// Verifier
// =============================================================================

struct Verifier<'c> {
    container: &'c EntryContainer,
    targets: Targets,
    key_count: u64,
    error_count: u64,
    entry_limit_exceeded_count: u64,
    multi_reference_count: u64,
    entry_references_count: u64,
    max_entry_per_value: u64,
    /// index name -> over-limit key -> entries that expected it
    entry_limits: BTreeMap<String, HashMap<Vec<u8>, u64>>,
    progress_interval: Duration,
    last_report: Instant,
    last_keys: u64,
}

impl<'c> Verifier<'c> {
    fn new(container: &'c EntryContainer, targets: Targets, progress_interval: Duration) -> Self {
        Self {
            container,
            targets,
            key_count: 0,
            error_count: 0,
            entry_limit_exceeded_count: 0,
            multi_reference_count: 0,
            entry_references_count: 0,
            max_entry_per_value: 0,
            entry_limits: BTreeMap::new(),
            progress_interval,
            last_report: Instant::now(),
            last_keys: 0,
        }
    }

    fn error(&mut self) {
        self.error_count += 1;
    }

    fn progress(&mut self) {
        if self.last_report.elapsed() < self.progress_interval {
            return;
        }
        let elapsed = self.last_report.elapsed().as_secs_f64().max(0.001);
        info!(
            keys = self.key_count,
            errors = self.error_count,
            rate = ((self.key_count - self.last_keys) as f64 / elapsed) as u64,
            "Verify progress"
        );
        self.last_report = Instant::now();
        self.last_keys = self.key_count;
    }

    fn finish(self, clean_mode: bool, elapsed: Duration) -> VerifyResult {
        let entry_limit_stats = self
            .entry_limits
            .into_iter()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(index, keys)| {
                let mut values: Vec<u64> = keys.into_values().collect();
                values.sort_unstable();
                let x = values.len() / 2;
                let median = if values.len() % 2 == 0 {
                    (values[x] + values[x - 1]) / 2
                } else {
                    values[x]
                };
                EntryLimitStats {
                    index,
                    keys: values.len(),
                    min: values[0],
                    max: values[values.len() - 1],
                    median,
                }
            })
            .collect();
        VerifyResult {
            clean_mode,
            key_count: self.key_count,
            error_count: self.error_count,
            entry_limit_exceeded_count: self.entry_limit_exceeded_count,
            multi_reference_count: self.multi_reference_count,
            entry_references_count: self.entry_references_count,
            max_entry_per_value: self.max_entry_per_value,
            entry_limit_stats,
            elapsed,
        }
    }

    fn update_index_stats(&mut self, set: &EntryIdSet) {
        match set.size().filter(|_| set.is_defined()) {
            Some(size) => {
                if size > 1 {
                    self.multi_reference_count += 1;
                }
                self.entry_references_count += size;
                self.max_entry_per_value = self.max_entry_per_value.max(size);
            }
            None => {
                self.entry_limit_exceeded_count += 1;
                self.multi_reference_count += 1;
            }
        }
    }

    fn incr_entry_limit_stats(&mut self, index: &Index, key: &[u8]) {
        *self
            .entry_limits
            .entry(index.name().to_string())
            .or_default()
            .entry(key.to_vec())
            .or_insert(0) += 1;
    }

    fn read_entry(&mut self, id: EntryId, context: &str) -> Option<Entry> {
        match self.container.id2entry().get(id) {
            Ok(Some(entry)) => Some(entry),
            Ok(None) => {
                trace!(id = %id, context, "Reference to unknown entry ID");
                self.error();
                None
            }
            Err(e) => {
                trace!(id = %id, context, error = %e, "Malformed id2entry record");
                self.error();
                None
            }
        }
    }

    // =========================================================================
    // Complete mode
    // =========================================================================

    fn complete(&mut self) -> Result<()> {
        let records = self
            .container
            .id2entry()
            .database()
            .range(Bound::Unbounded, Bound::Unbounded);
        for (key, value) in &records {
            self.key_count += 1;
            self.progress();
            let id = match EntryId::from_bytes(key) {
                Ok(id) => id,
                Err(e) => {
                    trace!(key = ?key, error = %e, "Malformed id2entry ID");
                    self.error();
                    continue;
                }
            };
            let entry = match Entry::decode(value) {
                Ok(entry) => entry,
                Err(e) => {
                    trace!(id = %id, error = %e, "Malformed id2entry record");
                    self.error();
                    continue;
                }
            };
            self.verify_entry(id, &entry)?;
        }

        if self.targets.dn2id {
            let stored = self.container.dn2id().count();
            if stored != self.key_count {
                trace!(dn2id = stored, id2entry = self.key_count, "Entry count mismatch");
                self.error();
            }
        }
        let vlvs = self.targets.vlvs.clone();
        for vlv in &vlvs {
            self.verify_vlv_order(vlv)?;
        }
        Ok(())
    }

    fn verify_entry(&mut self, id: EntryId, entry: &Entry) -> Result<()> {
        if self.targets.dn2id {
            self.verify_dn2id(id, entry)?;
        }
        if self.targets.id2children {
            self.verify_id2children(id, entry)?;
        }
        if self.targets.id2subtree {
            self.verify_id2subtree(id, entry)?;
        }
        let attributes = std::mem::take(&mut self.targets.attributes);
        for (attr, only) in &attributes {
            let values = entry.values(attr.attribute_name());
            if values.is_empty() {
                continue;
            }
            for (indexer, index) in attr.indexers() {
                if only.as_ref().is_some_and(|o| o != &indexer.index_id()) {
                    continue;
                }
                self.verify_keys(&index, &indexer, values, id, entry)?;
            }
        }
        self.targets.attributes = attributes;

        let vlvs = self.targets.vlvs.clone();
        for vlv in &vlvs {
            if vlv.include_entry(entry) && !vlv.contains(&vlv.sort_values(id, entry))? {
                trace!(dn = %entry.dn(), vlv = %vlv.name(), "Missing entry in VLV index");
                self.error();
            }
        }
        Ok(())
    }

    fn verify_keys(
        &mut self,
        index: &Index,
        indexer: &Indexer,
        values: &[Vec<u8>],
        id: EntryId,
        entry: &Entry,
    ) -> Result<()> {
        for key in indexer.values_to_keys(values) {
            self.verify_id_in(index, &key, id, entry)?;
        }
        Ok(())
    }

    fn verify_id_in(&mut self, index: &Index, key: &[u8], id: EntryId, entry: &Entry) -> Result<()> {
        match index.read_raw(key) {
            Ok(set) => match set.contains(id) {
                ConditionResult::True => {}
                ConditionResult::False => {
                    trace!(index = %index.name(), dn = %entry.dn(), id = %id, "Missing ID");
                    self.error();
                }
                ConditionResult::Undefined => self.incr_entry_limit_stats(index, key),
            },
            Err(e) => {
                trace!(index = %index.name(), error = %e, "Malformed ID list");
                self.error();
            }
        }
        Ok(())
    }

    fn verify_dn2id(&mut self, id: EntryId, entry: &Entry) -> Result<()> {
        let container = self.container;
        let dn2id = container.dn2id();
        match dn2id.get(entry.dn())? {
            None => {
                trace!(dn = %entry.dn(), "dn2id is missing key");
                self.error();
            }
            Some(stored) if stored != id => {
                trace!(dn = %entry.dn(), stored = %stored, expected = %id, "dn2id has the wrong ID");
                self.error();
            }
            Some(_) => {}
        }
        if entry.dn() != container.base_dn() {
            if let Some(parent) = entry.dn().parent() {
                if dn2id.get(&parent)?.is_none() {
                    trace!(dn = %parent, "dn2id is missing parent key");
                    self.error();
                }
            }
        }
        Ok(())
    }

    fn verify_id2children(&mut self, id: EntryId, entry: &Entry) -> Result<()> {
        if entry.dn() == self.container.base_dn() {
            return Ok(());
        }
        let Some(parent) = entry.dn().parent() else {
            return Ok(());
        };
        match self.container.dn2id().get(&parent)? {
            Some(parent_id) => {
                let index = self.container.id2children().clone();
                self.verify_id_in(&index, &parent_id.to_bytes(), id, entry)?;
            }
            None => {
                trace!(dn = %parent, "dn2id is missing parent key");
                self.error();
            }
        }
        Ok(())
    }

    fn verify_id2subtree(&mut self, id: EntryId, entry: &Entry) -> Result<()> {
        let index = self.container.id2subtree().clone();
        let base = self.container.base_dn().clone();
        let mut current = entry.dn().clone();
        while current != base {
            let Some(ancestor) = current.parent() else {
                break;
            };
            match self.container.dn2id().get(&ancestor)? {
                Some(ancestor_id) => self.verify_id_in(&index, &ancestor_id.to_bytes(), id, entry)?,
                None => {
                    trace!(dn = %ancestor, "dn2id is missing ancestor key");
                    self.error();
                }
            }
            current = ancestor;
        }
        Ok(())
    }

    /// Every run sorted, bounded by its key, and above the previous run
    fn verify_vlv_order(&mut self, vlv: &VlvIndex) -> Result<()> {
        let comparator = vlv.comparator().clone();
        let runs = match vlv.runs() {
            Ok(runs) => runs,
            Err(e) => {
                trace!(vlv = %vlv.name(), error = %e, "Malformed VLV run");
                self.error();
                return Ok(());
            }
        };
        let mut previous: Option<Vec<u8>> = None;
        for (run_key, run) in &runs {
            let mut last: Option<Vec<u8>> = None;
            for sv in run.entries() {
                let key = comparator.encode(sv);
                if let Some(prev) = &last {
                    if comparator.compare(prev, &key).is_ge() {
                        trace!(vlv = %vlv.name(), id = %sv.id, "VLV run out of order");
                        self.error();
                    }
                }
                if !run_key.is_empty() && comparator.compare(&key, run_key).is_gt() {
                    trace!(vlv = %vlv.name(), id = %sv.id, "VLV tuple above its run bound");
                    self.error();
                }
                if let Some(prev) = &previous {
                    if comparator.compare(&key, prev).is_le() {
                        trace!(vlv = %vlv.name(), id = %sv.id, "VLV tuple below the previous run");
                        self.error();
                    }
                }
                last = Some(key);
            }
            previous = Some(run_key.clone());
        }
        Ok(())
    }

    // =========================================================================
    // Clean mode
    // =========================================================================

    fn clean(&mut self) -> Result<()> {
        if self.targets.dn2id {
            self.clean_dn2id();
        }
        if self.targets.id2children {
            let index = self.container.id2children().clone();
            self.clean_subordinates(&index, true);
        }
        if self.targets.id2subtree {
            let index = self.container.id2subtree().clone();
            self.clean_subordinates(&index, false);
        }
        let attributes = std::mem::take(&mut self.targets.attributes);
        for (attr, only) in &attributes {
            for (indexer, index) in attr.indexers() {
                if only.as_ref().is_some_and(|o| o != &indexer.index_id()) {
                    continue;
                }
                self.clean_attribute_index(attr.attribute_name(), &indexer, &index);
            }
        }
        let vlvs = std::mem::take(&mut self.targets.vlvs);
        for vlv in &vlvs {
            self.clean_vlv(vlv);
        }
        Ok(())
    }

    fn clean_dn2id(&mut self) {
        let container = self.container;
        let dn2id = container.dn2id();
        for (key, value) in dn2id.database().range(Bound::Unbounded, Bound::Unbounded) {
            self.key_count += 1;
            self.progress();
            let id = match EntryId::from_bytes(&value) {
                Ok(id) => id,
                Err(e) => {
                    trace!(key = ?key, error = %e, "dn2id has a malformed ID");
                    self.error();
                    continue;
                }
            };
            let Some(entry) = self.read_entry(id, "dn2id") else {
                continue;
            };
            if dn2id.key(entry.dn()) != key {
                trace!(id = %id, dn = %entry.dn(), "dn2id key references an entry with another DN");
                self.error();
            }
        }
    }

    fn clean_subordinates(&mut self, index: &Index, children: bool) {
        for (key, value) in index.database().range(Bound::Unbounded, Bound::Unbounded) {
            self.key_count += 1;
            self.progress();
            let parent_id = match EntryId::from_bytes(&key) {
                Ok(id) => id,
                Err(e) => {
                    trace!(index = %index.name(), error = %e, "Malformed ID key");
                    self.error();
                    continue;
                }
            };
            let set = match EntryIdSet::decode(&value) {
                Ok(set) => set,
                Err(e) => {
                    trace!(index = %index.name(), id = %parent_id, error = %e, "Malformed ID list");
                    self.error();
                    continue;
                }
            };
            self.update_index_stats(&set);
            let Some(parent) = self.read_entry(parent_id, index.name()) else {
                continue;
            };
            for id in set.iter() {
                let Some(child) = self.read_entry(id, index.name()) else {
                    continue;
                };
                let related = if children {
                    child.dn().parent().as_ref() == Some(parent.dn())
                } else {
                    child.dn() != parent.dn() && child.dn().is_descendant_of(parent.dn())
                };
                if !related {
                    trace!(
                        index = %index.name(),
                        parent = %parent.dn(),
                        dn = %child.dn(),
                        "Subordinate ID does not belong under its key"
                    );
                    self.error();
                }
            }
        }
    }

    fn clean_attribute_index(&mut self, attribute: &str, indexer: &Indexer, index: &Index) {
        for (key, value) in index.database().range(Bound::Unbounded, Bound::Unbounded) {
            self.key_count += 1;
            self.progress();
            let set = match EntryIdSet::decode(&value) {
                Ok(set) => set,
                Err(e) => {
                    trace!(index = %index.name(), error = %e, "Malformed ID list");
                    self.error();
                    continue;
                }
            };
            self.update_index_stats(&set);
            for id in set.iter() {
                let Some(entry) = self.read_entry(id, index.name()) else {
                    continue;
                };
                if !indexer.values_to_keys(entry.values(attribute)).contains(&key) {
                    trace!(index = %index.name(), dn = %entry.dn(), "Entry does not match the key");
                    self.error();
                }
            }
        }
    }

    fn clean_vlv(&mut self, vlv: &VlvIndex) {
        let runs = match vlv.runs() {
            Ok(runs) => runs,
            Err(e) => {
                trace!(vlv = %vlv.name(), error = %e, "Malformed VLV run");
                self.error();
                return;
            }
        };
        for (_, run) in runs {
            for sv in run.entries() {
                self.key_count += 1;
                self.progress();
                let Some(entry) = self.read_entry(sv.id, vlv.name()) else {
                    continue;
                };
                if !vlv.include_entry(&entry) || &vlv.sort_values(sv.id, &entry) != sv {
                    trace!(vlv = %vlv.name(), id = %sv.id, "VLV tuple does not match its entry");
                    self.error();
                }
            }
        }
    }
}
