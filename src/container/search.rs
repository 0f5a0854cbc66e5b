//! Search over an entry container
//!
//! ## Flow
//! ```text
//!   sort requested? ──► try each VLV index ──► hit: fetch entries, done
//!         │
//!         ▼
//!   filter candidates ∩ scope candidates (id2children / id2subtree)
//!         │  undefined
//!         ├──────────────► dn2id scan of the base subtree
//!         ▼
//!   fetch + re-check filter and scope ──► sort ──► VLV window / size limit
//! ```

use std::cmp::Ordering;
use std::fmt::Write as _;

use tracing::{debug, trace};

use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::filter::{Filter, SearchScope, SortOrder, VlvRequest, VlvResponse};
use crate::idset::{EntryId, EntryIdSet};
use crate::schema::MatchingRule;
use crate::vlv::{compare_value, SortValues};

use super::EntryContainer;

/// An AND stops evaluating further components once its candidate set is
/// this small
pub const FILTER_CANDIDATE_THRESHOLD: u64 = 10;

/// A search against one container
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base: Dn,
    pub scope: SearchScope,
    pub filter: Filter,
    pub sort: Option<SortOrder>,
    pub vlv: Option<VlvRequest>,
    /// 0 means unlimited
    pub size_limit: usize,
    /// Collect an index debug trace
    pub debug: bool,
}

impl SearchRequest {
    pub fn new(base: Dn, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base,
            scope,
            filter,
            sort: None,
            vlv: None,
            size_limit: 0,
            debug: false,
        }
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_vlv(mut self, vlv: VlvRequest) -> Self {
        self.vlv = Some(vlv);
        self
    }

    pub fn with_size_limit(mut self, limit: usize) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Entries returned by a search
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub entries: Vec<Entry>,
    pub vlv_response: Option<VlvResponse>,
    /// Index debug trace when requested
    pub debug: Option<String>,
    /// False when the candidates came from a full scan
    pub indexed: bool,
    /// VLV index that answered, if any
    pub vlv_index: Option<String>,
    pub size_limit_exceeded: bool,
}

impl EntryContainer {
    // =========================================================================
    // Filter evaluation
    // =========================================================================

    /// Candidate IDs for `filter`. Undefined means every entry is a
    /// candidate.
    pub fn evaluate_filter(&self, filter: &Filter, debug: &mut Option<&mut String>) -> EntryIdSet {
        match filter {
            Filter::And(parts) => self.evaluate_and(parts, debug),
            Filter::Or(parts) => {
                let mut result = EntryIdSet::new();
                for part in parts {
                    result.add_all(&self.evaluate_filter(part, debug));
                    if !result.is_defined() {
                        break;
                    }
                }
                result
            }
            Filter::Not(_) => EntryIdSet::undefined(),
            _ => {
                let Some(attribute) = filter.attribute() else {
                    self.filter_monitor
                        .record_message(&filter.to_string(), "no attribute in filter");
                    return not_indexed(debug);
                };
                match self.attribute_index(attribute) {
                    Some(index) => index.evaluate_filter(filter, debug, &self.filter_monitor),
                    None => {
                        self.filter_monitor.record_message(
                            &filter.to_string(),
                            &format!("attribute {} is not indexed", attribute),
                        );
                        not_indexed(debug)
                    }
                }
            }
        }
    }

    /// Intersect the components, pairing `>=` and `<=` on the same attribute
    /// into a bounded range
    fn evaluate_and(&self, parts: &[Filter], debug: &mut Option<&mut String>) -> EntryIdSet {
        let mut used = vec![false; parts.len()];
        let mut result: Option<EntryIdSet> = None;

        let intersect = |result: &mut Option<EntryIdSet>, set: EntryIdSet| match result {
            None => *result = Some(set),
            Some(r) => r.retain_all(&set),
        };
        let small_enough = |result: &Option<EntryIdSet>| {
            result
                .as_ref()
                .and_then(|r| if r.is_defined() { r.size() } else { None })
                .is_some_and(|n| n <= FILTER_CANDIDATE_THRESHOLD)
        };

        for i in 0..parts.len() {
            let Filter::GreaterOrEqual { attribute, .. } = &parts[i] else {
                continue;
            };
            let partner = parts.iter().enumerate().position(|(j, p)| {
                !used[j] && matches!(p, Filter::LessOrEqual { attribute: a, .. } if a.eq_ignore_ascii_case(attribute))
            });
            let (Some(j), Some(index)) = (partner, self.attribute_index(attribute)) else {
                continue;
            };
            used[i] = true;
            used[j] = true;
            let set = index.evaluate_bounded_range(&parts[j], &parts[i], debug, &self.filter_monitor);
            intersect(&mut result, set);
            if small_enough(&result) {
                return result.unwrap_or_default();
            }
        }

        for (i, part) in parts.iter().enumerate() {
            if used[i] {
                continue;
            }
            let set = self.evaluate_filter(part, debug);
            intersect(&mut result, set);
            if small_enough(&result) {
                break;
            }
        }
        result.unwrap_or_else(EntryIdSet::undefined)
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Run a search. The base entry must exist.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResult> {
        let base_id = self
            .entry_id_for_dn(&request.base)?
            .ok_or_else(|| DirError::NoSuchEntry(request.base.to_string()))?;
        let mut trace_buf = String::new();
        let mut debug_out: Option<&mut String> = if request.debug { Some(&mut trace_buf) } else { None };
        let mut result = SearchResult::default();

        if let Some(sort) = &request.sort {
            for vlv in self.vlv_indexes() {
                let hit = vlv.evaluate(
                    &request.base,
                    request.scope,
                    &request.filter,
                    sort,
                    request.vlv.as_ref(),
                    &mut debug_out,
                )?;
                if let Some(hit) = hit {
                    for id in hit.ids {
                        if let Some(entry) = self.id2entry.get(id)? {
                            result.entries.push(entry);
                        }
                    }
                    result.vlv_response = hit.response;
                    result.indexed = true;
                    result.vlv_index = Some(vlv.name().to_string());
                    apply_size_limit(&mut result, request.size_limit);
                    if request.debug {
                        result.debug = Some(trace_buf);
                    }
                    return Ok(result);
                }
            }
        }

        let mut candidates = self.evaluate_filter(&request.filter, &mut debug_out);
        candidates.retain_all(&self.scope_candidates(base_id, request.scope)?);
        result.indexed = candidates.is_defined();

        let ids: Vec<_> = match &candidates {
            EntryIdSet::Defined(ids) => ids.clone(),
            _ => {
                if let Some(buf) = debug_out.as_deref_mut() {
                    let _ = write!(buf, "[SCAN:{}]", request.base);
                }
                let mut ids = Vec::new();
                for (_, value) in self.dn2id.subtree(&request.base) {
                    ids.push(crate::keycodec::bytes_to_entry_id(&value)?);
                }
                ids.sort_unstable();
                ids
            }
        };

        for id in ids {
            let Some(entry) = self.id2entry.get(id)? else {
                trace!(id = %id, "Candidate without entry");
                continue;
            };
            if request.scope.contains(&request.base, entry.dn()) && request.filter.matches(&entry, &self.schema) {
                result.entries.push(entry);
            }
        }

        if let Some(sort) = &request.sort {
            let reverse: Vec<bool> = sort.keys.iter().map(|k| k.reverse).collect();
            let mut keyed: Vec<(SortValues, Entry)> = result
                .entries
                .drain(..)
                .enumerate()
                .map(|(i, e)| {
                    let sv = SortValues::from_entry(EntryId::new(i as u64), &e, sort, &self.schema);
                    (sv, e)
                })
                .collect();
            keyed.sort_by(|a, b| a.0.compare(&b.0, &reverse));

            match &request.vlv {
                Some(vlv) => {
                    let (window, response) = self.vlv_window(&keyed, sort, &reverse, vlv)?;
                    result.entries = window;
                    result.vlv_response = Some(response);
                }
                None => result.entries = keyed.into_iter().map(|(_, e)| e).collect(),
            }
        }

        apply_size_limit(&mut result, request.size_limit);
        debug!(
            base = %request.base,
            filter = %request.filter,
            indexed = result.indexed,
            entries = result.entries.len(),
            "Search complete"
        );
        if request.debug {
            result.debug = Some(trace_buf);
        }
        Ok(result)
    }

    /// IDs the scope can contain, from the subordinate indexes
    fn scope_candidates(&self, base_id: EntryId, scope: SearchScope) -> Result<EntryIdSet> {
        if scope == SearchScope::BaseObject {
            return Ok(EntryIdSet::single(base_id));
        }
        if !self.subordinate_indexes_enabled {
            return Ok(EntryIdSet::undefined());
        }
        let key = base_id.to_bytes();
        Ok(match scope {
            SearchScope::SingleLevel => self.id2children.read_key(&key)?,
            SearchScope::Subordinates => self.id2subtree.read_key(&key)?,
            _ => {
                let mut set = self.id2subtree.read_key(&key)?;
                if set.is_defined() {
                    set.add(base_id);
                }
                set
            }
        })
    }

    /// Window of an in-memory sorted list, with the same boundary rules as
    /// a VLV index
    fn vlv_window(
        &self,
        sorted: &[(SortValues, Entry)],
        sort: &SortOrder,
        reverse: &[bool],
        request: &VlvRequest,
    ) -> Result<(Vec<Entry>, VlvResponse)> {
        let count = sorted.len();
        let (target, before, after) = match request {
            VlvRequest::ByOffset {
                before_count,
                after_count,
                offset,
                ..
            } => {
                if *offset < 0 {
                    return Err(DirError::InvalidVlvRequest(format!("negative target offset {}", offset)));
                }
                let offset = (*offset).max(1) as usize;
                if offset > count {
                    (count, *before_count, 0)
                } else {
                    (offset - 1, *before_count, *after_count)
                }
            }
            VlvRequest::ByAssertion {
                before_count,
                after_count,
                assertion,
            } => {
                let Some(first) = sort.keys.first() else {
                    return Err(DirError::InvalidVlvRequest("empty sort order".to_string()));
                };
                let rule = first
                    .rule
                    .or_else(|| self.schema.attribute_type(&first.attribute).ordering)
                    .unwrap_or(MatchingRule::CaseIgnore);
                let normalized = rule
                    .normalize(assertion)
                    .map_err(|e| DirError::InvalidVlvRequest(format!("bad assertion value: {}", e)))?;
                let reverse_first = reverse.first().copied().unwrap_or(false);
                let pos = sorted.partition_point(|(sv, _)| {
                    let value = sv.values.first().and_then(|v| v.as_deref());
                    compare_value(value, Some(&normalized), reverse_first) == Ordering::Less
                });
                (pos, *before_count, *after_count)
            }
        };
        let from = target.saturating_sub(before);
        let to = (target + after + 1).min(count);
        let window = sorted[from.min(to)..to].iter().map(|(_, e)| e.clone()).collect();
        Ok((
            window,
            VlvResponse {
                target_position: target + 1,
                content_count: count,
            },
        ))
    }
}

fn not_indexed(debug: &mut Option<&mut String>) -> EntryIdSet {
    if let Some(buf) = debug.as_deref_mut() {
        buf.push_str("[NOT-INDEXED]");
    }
    EntryIdSet::undefined()
}

fn apply_size_limit(result: &mut SearchResult, limit: usize) {
    if limit > 0 && result.entries.len() > limit {
        result.entries.truncate(limit);
        result.size_limit_exceeded = true;
    }
}
