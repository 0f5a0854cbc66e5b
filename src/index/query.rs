//! Index queries
//!
//! A query is a small set-algebra expression over index keys, built from a
//! filter by the attribute index and evaluated against its databases.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::idset::EntryIdSet;

use super::db::Index;

/// Expression over the keys of one attribute's indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
    /// IDs of one key
    ExactMatch { index_id: String, key: Vec<u8> },
    /// Union of the IDs of a key range (empty bound = open)
    RangeMatch {
        index_id: String,
        lower: Vec<u8>,
        upper: Vec<u8>,
        lower_inclusive: bool,
        upper_inclusive: bool,
    },
    Intersection(Vec<IndexQuery>),
    Union(Vec<IndexQuery>),
    /// No index can answer; the result is undefined
    Null,
}

impl IndexQuery {
    pub fn exact(index_id: &str, key: Vec<u8>) -> Self {
        IndexQuery::ExactMatch {
            index_id: index_id.to_string(),
            key,
        }
    }

    /// Keys starting with `prefix`
    pub fn prefix(index_id: &str, prefix: Vec<u8>) -> Self {
        let upper = prefix_upper_bound(&prefix);
        IndexQuery::RangeMatch {
            index_id: index_id.to_string(),
            lower: prefix,
            upper,
            lower_inclusive: true,
            upper_inclusive: false,
        }
    }

    /// Evaluate against the given indexes (keyed by index id).
    ///
    /// Read failures degrade to an empty set; a missing index yields an
    /// undefined set.
    pub fn evaluate(
        &self,
        attribute: &str,
        indexes: &BTreeMap<String, Arc<Index>>,
        debug: &mut Option<&mut String>,
    ) -> EntryIdSet {
        match self {
            IndexQuery::ExactMatch { index_id, key } => {
                let Some(index) = indexes.get(index_id) else {
                    return not_indexed(debug);
                };
                append_debug(debug, attribute, index_id);
                index.read_key(key).unwrap_or_else(|e| {
                    trace!(index = %index.name(), error = %e, "Index read failed");
                    EntryIdSet::new()
                })
            }
            IndexQuery::RangeMatch {
                index_id,
                lower,
                upper,
                lower_inclusive,
                upper_inclusive,
            } => {
                let Some(index) = indexes.get(index_id) else {
                    return not_indexed(debug);
                };
                append_debug(debug, attribute, index_id);
                index
                    .read_range(lower, upper, *lower_inclusive, *upper_inclusive)
                    .unwrap_or_else(|e| {
                        trace!(index = %index.name(), error = %e, "Index range read failed");
                        EntryIdSet::new()
                    })
            }
            IndexQuery::Intersection(parts) => {
                let mut result: Option<EntryIdSet> = None;
                for part in parts {
                    let set = part.evaluate(attribute, indexes, debug);
                    match &mut result {
                        None => result = Some(set),
                        Some(r) => r.retain_all(&set),
                    }
                    if result.as_ref().is_some_and(EntryIdSet::is_empty) {
                        break;
                    }
                }
                result.unwrap_or(EntryIdSet::Undefined)
            }
            IndexQuery::Union(parts) => {
                let mut result = EntryIdSet::new();
                for part in parts {
                    result.add_all(&part.evaluate(attribute, indexes, debug));
                    if result == EntryIdSet::Undefined {
                        break;
                    }
                }
                result
            }
            IndexQuery::Null => not_indexed(debug),
        }
    }
}

fn append_debug(debug: &mut Option<&mut String>, attribute: &str, index_id: &str) {
    if let Some(buf) = debug.as_deref_mut() {
        let _ = write!(buf, "[INDEX:{}.{}]", attribute, index_id);
    }
}

fn not_indexed(debug: &mut Option<&mut String>) -> EntryIdSet {
    if let Some(buf) = debug.as_deref_mut() {
        buf.push_str("[NOT-INDEXED]");
    }
    EntryIdSet::Undefined
}

/// Smallest key greater than every key starting with `prefix`; empty when
/// there is none (all bytes 0xFF).
pub fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xFF {
            upper.push(last + 1);
            return upper;
        }
    }
    upper
}

// =============================================================================
// Filter use monitor
// =============================================================================

/// What one filter's index evaluations produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterUseStats {
    pub evaluations: u64,
    /// Candidate count of the last defined evaluation
    pub last_candidates: Option<u64>,
    /// Why the last evaluation was not indexed
    pub last_message: Option<String>,
}

/// Records per-filter index usage when enabled
#[derive(Debug, Default)]
pub struct FilterUseMonitor {
    enabled: AtomicBool,
    stats: Mutex<HashMap<String, FilterUseStats>>,
}

impl FilterUseMonitor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Record the outcome of evaluating `filter`
    pub fn record(&self, filter: &str, result: &EntryIdSet) {
        if !self.is_enabled() {
            return;
        }
        let mut stats = self.stats.lock();
        let s = stats.entry(filter.to_string()).or_default();
        s.evaluations += 1;
        if result.is_defined() {
            s.last_candidates = result.size();
            s.last_message = None;
        } else {
            s.last_message = Some("index entry limit exceeded or not trusted".to_string());
        }
    }

    /// Record that `filter` could not use any index
    pub fn record_message(&self, filter: &str, message: &str) {
        if !self.is_enabled() {
            return;
        }
        let mut stats = self.stats.lock();
        let s = stats.entry(filter.to_string()).or_default();
        s.evaluations += 1;
        s.last_message = Some(message.to_string());
    }

    pub fn stats(&self, filter: &str) -> Option<FilterUseStats> {
        self.stats.lock().get(filter).cloned()
    }

    pub fn reset(&self) {
        self.stats.lock().clear();
    }
}
