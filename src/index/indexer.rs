//! Indexers
//!
//! One strategy per index flavor, selected by variant rather than by a
//! subclass hierarchy. Every variant answers the same question: which keys
//! does this attribute value produce?

use std::collections::BTreeSet;

use tracing::trace;

use crate::config::IndexType;
use crate::keycodec;
use crate::schema::MatchingRule;

/// Key stored in presence indexes
pub const PRESENCE_KEY: &[u8] = b"+";

/// Value → keys strategy for one index flavor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indexer {
    Presence,
    Equality(MatchingRule),
    Substring { rule: MatchingRule, length: usize },
    Ordering(MatchingRule),
    Approximate(MatchingRule),
    Extensible(MatchingRule),
}

impl Indexer {
    /// Stable identifier of the index this indexer feeds
    pub fn index_id(&self) -> String {
        match self {
            Indexer::Extensible(rule) => rule.name().to_ascii_lowercase(),
            other => other.index_type().as_str().to_string(),
        }
    }

    pub fn index_type(&self) -> IndexType {
        match self {
            Indexer::Presence => IndexType::Presence,
            Indexer::Equality(_) => IndexType::Equality,
            Indexer::Substring { .. } => IndexType::Substring,
            Indexer::Ordering(_) => IndexType::Ordering,
            Indexer::Approximate(_) => IndexType::Approximate,
            Indexer::Extensible(_) => IndexType::Extensible,
        }
    }

    /// Matching rule backing the indexer, if any
    pub fn rule(&self) -> Option<MatchingRule> {
        match self {
            Indexer::Presence => None,
            Indexer::Equality(r)
            | Indexer::Ordering(r)
            | Indexer::Approximate(r)
            | Indexer::Extensible(r) => Some(*r),
            Indexer::Substring { rule, .. } => Some(*rule),
        }
    }

    /// Add the keys of one value to `keys`.
    ///
    /// Values the rule cannot normalize produce no keys.
    pub fn value_to_keys(&self, value: &[u8], keys: &mut BTreeSet<Vec<u8>>) {
        match self {
            Indexer::Presence => {
                keys.insert(PRESENCE_KEY.to_vec());
            }
            Indexer::Substring { rule, length } => match rule.normalize(value) {
                Ok(norm) => keys.extend(keycodec::substring_keys(&norm, *length)),
                Err(e) => trace!(rule = %rule, error = %e, "Value not indexable"),
            },
            Indexer::Equality(rule)
            | Indexer::Ordering(rule)
            | Indexer::Approximate(rule)
            | Indexer::Extensible(rule) => match rule.normalize(value) {
                Ok(norm) => {
                    keys.insert(norm);
                }
                Err(e) => trace!(rule = %rule, error = %e, "Value not indexable"),
            },
        }
    }

    /// Keys of every value of an attribute
    pub fn values_to_keys(&self, values: &[Vec<u8>]) -> BTreeSet<Vec<u8>> {
        let mut keys = BTreeSet::new();
        if matches!(self, Indexer::Presence) {
            if !values.is_empty() {
                keys.insert(PRESENCE_KEY.to_vec());
            }
            return keys;
        }
        for v in values {
            self.value_to_keys(v, &mut keys);
        }
        keys
    }
}
