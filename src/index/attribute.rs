//! Attribute index
//!
//! All indexes configured for one attribute type: key maintenance for entry
//! add/delete/modify, filter evaluation, and live reconfiguration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{IndexConfig, IndexType};
use crate::entry::{Entry, Modification};
use crate::error::{DirError, Result};
use crate::filter::Filter;
use crate::idset::{EntryId, EntryIdSet};
use crate::schema::{AttributeType, MatchingRule};
use crate::storage::Environment;

use super::buffer::IndexBuffer;
use super::db::Index;
use super::indexer::{Indexer, PRESENCE_KEY};
use super::query::{FilterUseMonitor, IndexQuery};
use super::state::State;

/// Outcome of a reconfiguration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigChangeResult {
    /// Some index must be rebuilt before it can be trusted again
    pub admin_action_required: bool,
    pub messages: Vec<String>,
}

/// Backend-wide defaults an index config may override
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexDefaults {
    pub entry_limit: usize,
    pub substring_length: usize,
    pub maintain_count: bool,
}

#[derive(Debug, Clone)]
struct Slot {
    indexer: Indexer,
    index: Arc<Index>,
}

/// Every index of one attribute
pub struct AttributeIndex {
    attr_type: Arc<AttributeType>,
    env: Arc<Environment>,
    state: State,
    prefix: String,
    defaults: IndexDefaults,
    config: RwLock<IndexConfig>,
    /// Keyed by index id
    slots: RwLock<BTreeMap<String, Slot>>,
}

impl AttributeIndex {
    /// Open every index the config asks for.
    ///
    /// Fails if a requested type has no matching rule for the attribute.
    pub(crate) fn open(
        env: &Arc<Environment>,
        state: &State,
        prefix: &str,
        attr_type: Arc<AttributeType>,
        config: IndexConfig,
        defaults: IndexDefaults,
        container_empty: bool,
    ) -> Result<Self> {
        let indexers = build_indexers(&attr_type, &config, defaults)?;
        let entry_limit = config.entry_limit.unwrap_or(defaults.entry_limit);

        let mut slots = BTreeMap::new();
        for indexer in indexers {
            let id = indexer.index_id();
            let name = index_name(prefix, &attr_type.name, &id);
            let index = Index::open(env, state, &name, entry_limit, defaults.maintain_count, container_empty)?;
            slots.insert(
                id,
                Slot {
                    indexer,
                    index: Arc::new(index),
                },
            );
        }
        debug!(attribute = %attr_type.name, indexes = slots.len(), "Opened attribute index");

        Ok(Self {
            attr_type,
            env: env.clone(),
            state: state.clone(),
            prefix: prefix.to_string(),
            defaults,
            config: RwLock::new(config),
            slots: RwLock::new(slots),
        })
    }

    /// Lower-case attribute name
    pub fn attribute_name(&self) -> &str {
        &self.attr_type.name
    }

    pub fn attribute_type(&self) -> &Arc<AttributeType> {
        &self.attr_type
    }

    pub fn config(&self) -> IndexConfig {
        self.config.read().clone()
    }

    /// Every (indexer, index) pair
    pub fn indexers(&self) -> Vec<(Indexer, Arc<Index>)> {
        self.slots
            .read()
            .values()
            .map(|s| (s.indexer.clone(), s.index.clone()))
            .collect()
    }

    pub fn indexes(&self) -> Vec<Arc<Index>> {
        self.slots.read().values().map(|s| s.index.clone()).collect()
    }

    /// Index by id (`equality`, `substring`, ..., or an extensible rule name)
    pub fn index(&self, index_id: &str) -> Option<Arc<Index>> {
        self.slots
            .read()
            .get(&index_id.to_ascii_lowercase())
            .map(|s| s.index.clone())
    }

    pub fn index_of_type(&self, index_type: IndexType) -> Option<Arc<Index>> {
        self.slots
            .read()
            .values()
            .find(|s| s.indexer.index_type() == index_type)
            .map(|s| s.index.clone())
    }

    fn index_map(&self) -> BTreeMap<String, Arc<Index>> {
        self.slots
            .read()
            .iter()
            .map(|(id, s)| (id.clone(), s.index.clone()))
            .collect()
    }

    // =========================================================================
    // Key maintenance
    // =========================================================================

    /// Queue inserts of every key of `entry`
    pub fn add_entry(&self, buffer: &mut IndexBuffer, id: EntryId, entry: &Entry) {
        let values = entry.values(&self.attr_type.name);
        if values.is_empty() {
            return;
        }
        for slot in self.slots.read().values() {
            for key in slot.indexer.values_to_keys(values) {
                buffer.add_id(&slot.index, key, id);
            }
        }
    }

    /// Queue deletes of every key of `entry`
    pub fn remove_entry(&self, buffer: &mut IndexBuffer, id: EntryId, entry: &Entry) {
        let values = entry.values(&self.attr_type.name);
        if values.is_empty() {
            return;
        }
        for slot in self.slots.read().values() {
            for key in slot.indexer.values_to_keys(values) {
                buffer.delete_id(&slot.index, key, id);
            }
        }
    }

    /// Queue the key differences between `old` and `new`
    pub fn modify_entry(
        &self,
        buffer: &mut IndexBuffer,
        id: EntryId,
        old: &Entry,
        new: &Entry,
        mods: &[Modification],
    ) {
        let name = &self.attr_type.name;
        if !mods.is_empty() && !mods.iter().any(|m| m.attribute().eq_ignore_ascii_case(name)) {
            return;
        }
        let old_values = old.values(name);
        let new_values = new.values(name);
        for slot in self.slots.read().values() {
            let old_keys = slot.indexer.values_to_keys(old_values);
            let new_keys = slot.indexer.values_to_keys(new_values);
            for key in old_keys.difference(&new_keys) {
                buffer.delete_id(&slot.index, key.clone(), id);
            }
            for key in new_keys.difference(&old_keys) {
                buffer.add_id(&slot.index, key.clone(), id);
            }
        }
    }

    // =========================================================================
    // Filter evaluation
    // =========================================================================

    /// Candidate IDs for a simple filter on this attribute.
    ///
    /// Values the matching rule rejects give an empty set; a filter type
    /// with no index gives an undefined set.
    pub fn evaluate_filter(
        &self,
        filter: &Filter,
        debug: &mut Option<&mut String>,
        monitor: &FilterUseMonitor,
    ) -> EntryIdSet {
        if let Filter::Extensible { rule, value, .. } = filter {
            return self.evaluate_extensible_filter(filter, rule.as_deref(), value, debug, monitor);
        }
        let result = match self.query_for(filter) {
            Ok(query) => query.evaluate(&self.attr_type.name, &self.index_map(), debug),
            Err(e) => {
                debug!(attribute = %self.attr_type.name, error = %e, "Filter value not indexable");
                EntryIdSet::new()
            }
        };
        monitor.record(&filter.to_string(), &result);
        result
    }

    /// Evaluate `ge <= attr <= le` as two independent evaluations
    /// intersected together.
    pub fn evaluate_bounded_range(
        &self,
        le_filter: &Filter,
        ge_filter: &Filter,
        debug: &mut Option<&mut String>,
        monitor: &FilterUseMonitor,
    ) -> EntryIdSet {
        let mut results = self.evaluate_filter(le_filter, debug, monitor);
        let ge = self.evaluate_filter(ge_filter, debug, monitor);
        results.retain_all(&ge);
        results
    }

    /// Extensible-match evaluation.
    ///
    /// No rule, or the attribute's equality rule, falls back to the
    /// equality index. A rule with no index of its own gives the null
    /// query (undefined).
    pub fn evaluate_extensible_filter(
        &self,
        filter: &Filter,
        rule: Option<&str>,
        value: &[u8],
        debug: &mut Option<&mut String>,
        monitor: &FilterUseMonitor,
    ) -> EntryIdSet {
        let filter_str = filter.to_string();
        let resolved = rule.map(MatchingRule::from_name_or_oid);

        let equality_rule = self.attr_type.equality;
        let use_equality = match resolved {
            None => true,
            Some(r) => r.is_some() && r == equality_rule,
        };
        if use_equality {
            let eq = Filter::Equality {
                attribute: self.attr_type.name.clone(),
                value: value.to_vec(),
            };
            let result = match self.query_for(&eq) {
                Ok(q) => q.evaluate(&self.attr_type.name, &self.index_map(), debug),
                Err(_) => EntryIdSet::new(),
            };
            monitor.record(&filter_str, &result);
            return result;
        }

        let Some(Some(rule)) = resolved else {
            monitor.record_message(&filter_str, "matching rule is not defined");
            return IndexQuery::Null.evaluate(&self.attr_type.name, &self.index_map(), debug);
        };
        let id = Indexer::Extensible(rule).index_id();
        if !self.slots.read().contains_key(&id) {
            monitor.record_message(
                &filter_str,
                &format!("no extensible index for rule {} on {}", rule, self.attr_type.name),
            );
            return IndexQuery::Null.evaluate(&self.attr_type.name, &self.index_map(), debug);
        }
        let result = match rule.normalize(value) {
            Ok(key) => IndexQuery::exact(&id, key).evaluate(&self.attr_type.name, &self.index_map(), debug),
            Err(_) => EntryIdSet::new(),
        };
        monitor.record(&filter_str, &result);
        result
    }

    /// Translate a simple filter into an index query
    fn query_for(&self, filter: &Filter) -> Result<IndexQuery> {
        let attr = &self.attr_type;
        let no_rule = |what: &str| {
            DirError::Config(format!("attribute {} has no {} matching rule", attr.name, what))
        };
        Ok(match filter {
            Filter::Presence { .. } => IndexQuery::exact(IndexType::Presence.as_str(), PRESENCE_KEY.to_vec()),
            Filter::Equality { value, .. } => {
                let rule = attr.equality.ok_or_else(|| no_rule("equality"))?;
                IndexQuery::exact(IndexType::Equality.as_str(), rule.normalize(value)?)
            }
            Filter::Approximate { value, .. } => {
                let rule = attr.approximate.ok_or_else(|| no_rule("approximate"))?;
                IndexQuery::exact(IndexType::Approximate.as_str(), rule.normalize(value)?)
            }
            Filter::GreaterOrEqual { value, .. } => {
                let rule = attr.ordering.ok_or_else(|| no_rule("ordering"))?;
                IndexQuery::RangeMatch {
                    index_id: IndexType::Ordering.as_str().to_string(),
                    lower: rule.normalize(value)?,
                    upper: Vec::new(),
                    lower_inclusive: true,
                    upper_inclusive: false,
                }
            }
            Filter::LessOrEqual { value, .. } => {
                let rule = attr.ordering.ok_or_else(|| no_rule("ordering"))?;
                IndexQuery::RangeMatch {
                    index_id: IndexType::Ordering.as_str().to_string(),
                    lower: Vec::new(),
                    upper: rule.normalize(value)?,
                    lower_inclusive: false,
                    upper_inclusive: true,
                }
            }
            Filter::Substring {
                initial,
                any,
                final_,
                ..
            } => self.substring_query(initial.as_deref(), any, final_.as_deref())?,
            _ => IndexQuery::Null,
        })
    }

    /// Every element of the assertion must appear: elements at least as
    /// long as the substring length become exact lookups of each window,
    /// shorter ones become prefix ranges.
    fn substring_query(
        &self,
        initial: Option<&[u8]>,
        any: &[Vec<u8>],
        final_: Option<&[u8]>,
    ) -> Result<IndexQuery> {
        let Some(slot_len) = self.substring_length() else {
            return Ok(IndexQuery::Null);
        };
        let rule = self.attr_type.substring.unwrap_or(MatchingRule::CaseIgnore);
        let id = IndexType::Substring.as_str();

        let mut elements: Vec<Vec<u8>> = Vec::new();
        for raw in initial.into_iter().chain(any.iter().map(|v| v.as_slice())).chain(final_) {
            let norm = rule.normalize(raw)?;
            if !norm.is_empty() {
                elements.push(norm);
            }
        }

        let mut parts = Vec::new();
        for element in elements {
            if element.len() >= slot_len {
                let windows: BTreeSet<Vec<u8>> =
                    element.windows(slot_len).map(|w| w.to_vec()).collect();
                parts.extend(windows.into_iter().map(|k| IndexQuery::exact(id, k)));
            } else {
                parts.push(IndexQuery::prefix(id, element));
            }
        }
        if parts.is_empty() {
            return Ok(IndexQuery::Null);
        }
        Ok(IndexQuery::Intersection(parts))
    }

    fn substring_length(&self) -> Option<usize> {
        self.slots.read().values().find_map(|s| match s.indexer {
            Indexer::Substring { length, .. } => Some(length),
            _ => None,
        })
    }

    /// Total keys past their entry limit across every index
    pub fn entry_limit_exceeded_count(&self) -> u64 {
        self.slots
            .read()
            .values()
            .map(|s| s.index.entry_limit_exceeded_count())
            .sum()
    }

    // =========================================================================
    // Reconfiguration
    // =========================================================================

    /// Apply a new configuration: open added indexes, drop removed ones,
    /// adjust entry limits of the rest.
    pub fn apply_configuration_change(
        &self,
        new_config: IndexConfig,
        container_empty: bool,
    ) -> Result<ConfigChangeResult> {
        let indexers = build_indexers(&self.attr_type, &new_config, self.defaults)?;
        let entry_limit = new_config.entry_limit.unwrap_or(self.defaults.entry_limit);
        let mut result = ConfigChangeResult::default();
        let mut slots = self.slots.write();

        let wanted: BTreeMap<String, Indexer> =
            indexers.into_iter().map(|i| (i.index_id(), i)).collect();

        // Removed index types
        let removed: Vec<String> = slots.keys().filter(|id| !wanted.contains_key(*id)).cloned().collect();
        for id in removed {
            if let Some(slot) = slots.remove(&id) {
                self.env.remove_database(slot.index.name())?;
                self.state.remove(slot.index.name());
                info!(index = %slot.index.name(), "Removed index");
            }
        }

        for (id, indexer) in wanted {
            match slots.get_mut(&id) {
                Some(slot) => {
                    if slot.index.set_entry_limit(entry_limit) {
                        result.admin_action_required = true;
                        result.messages.push(format!(
                            "entry limit of index {} changed to {}; rebuild it to apply the limit to existing keys",
                            slot.index.name(),
                            entry_limit
                        ));
                    }
                    if slot.indexer != indexer {
                        // Same id, different key derivation (substring length)
                        slot.indexer = indexer;
                        if !container_empty {
                            slot.index.set_trusted(false);
                            result.admin_action_required = true;
                            result.messages.push(format!(
                                "index {} must be rebuilt before it can be used",
                                slot.index.name()
                            ));
                        }
                    }
                }
                None => {
                    let name = index_name(&self.prefix, &self.attr_type.name, &id);
                    let index = Arc::new(Index::open(
                        &self.env,
                        &self.state,
                        &name,
                        entry_limit,
                        self.defaults.maintain_count,
                        container_empty,
                    )?);
                    if !index.is_trusted() {
                        result.admin_action_required = true;
                        result.messages.push(format!(
                            "index {} is new and must be rebuilt before it can be used",
                            name
                        ));
                    }
                    slots.insert(id, Slot { indexer, index });
                }
            }
        }

        *self.config.write() = new_config;
        Ok(result)
    }

    /// Delete every index database of this attribute
    pub(crate) fn delete_all(&self) -> Result<()> {
        let mut slots = self.slots.write();
        for slot in slots.values() {
            self.env.remove_database(slot.index.name())?;
            self.state.remove(slot.index.name());
        }
        slots.clear();
        Ok(())
    }
}

/// `{prefix}_{attribute}.{index id}`
pub(crate) fn index_name(prefix: &str, attribute: &str, index_id: &str) -> String {
    format!("{}_{}.{}", prefix, attribute, index_id)
}

/// Indexers for a config, validating the attribute's matching rules
fn build_indexers(attr: &AttributeType, config: &IndexConfig, defaults: IndexDefaults) -> Result<Vec<Indexer>> {
    let missing = |what: &str| {
        DirError::Config(format!(
            "attribute {} has no {} matching rule for a {} index",
            attr.name, what, what
        ))
    };
    let mut indexers = Vec::new();
    for t in &config.types {
        match t {
            IndexType::Presence => indexers.push(Indexer::Presence),
            IndexType::Equality => {
                indexers.push(Indexer::Equality(attr.equality.ok_or_else(|| missing("equality"))?))
            }
            IndexType::Ordering => {
                indexers.push(Indexer::Ordering(attr.ordering.ok_or_else(|| missing("ordering"))?))
            }
            IndexType::Approximate => indexers.push(Indexer::Approximate(
                attr.approximate.ok_or_else(|| missing("approximate"))?,
            )),
            IndexType::Substring => {
                let rule = attr
                    .substring
                    .filter(MatchingRule::supports_substrings)
                    .ok_or_else(|| missing("substring"))?;
                let length = config.substring_length.unwrap_or(defaults.substring_length);
                if length == 0 {
                    return Err(DirError::Config("substring length must be at least 1".to_string()));
                }
                indexers.push(Indexer::Substring { rule, length });
            }
            IndexType::Extensible => {
                let mut valid = 0;
                for name in &config.extensible_rules {
                    match MatchingRule::from_name_or_oid(name) {
                        Some(rule) if Some(rule) == attr.equality && config.types.contains(&IndexType::Equality) => {
                            // Served by the equality index
                            valid += 1;
                        }
                        Some(rule) => {
                            valid += 1;
                            indexers.push(Indexer::Extensible(rule));
                        }
                        None => warn!(
                            attribute = %attr.name,
                            rule = %name,
                            "Unknown extensible matching rule, index omitted"
                        ),
                    }
                }
                if valid == 0 {
                    return Err(DirError::Config(format!(
                        "extensible index on {} lists no valid matching rule",
                        attr.name
                    )));
                }
            }
        }
    }
    Ok(indexers)
}
