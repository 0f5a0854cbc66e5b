//! Entry IDs and entry ID sets
//!
//! Every index maps a key to an [`EntryIdSet`]. A set is either an explicit
//! sorted list of IDs, or (once it grows past the index entry limit) a
//! count-only or fully undefined marker that means "assume everything
//! matches".
//!
//! ## Stored format
//! ```text
//!   Defined     [id: u64 BE][id: u64 BE]...      (N x 8 bytes)
//!   CountOnly   [0x80 | count: u64 BE]           (8 bytes, high bit set)
//!   Undefined   [FF FF FF FF FF FF FF FF]        (8 bytes)
//! ```
//! Entry IDs never use the high bit, so an 8-byte record with the high bit
//! set is always a marker.

use std::fmt;

use crate::error::{DirError, Result};
use crate::keycodec;

const UNDEFINED_MARKER: u64 = u64::MAX;
const COUNT_FLAG: u64 = 1 << 63;

// =============================================================================
// EntryId
// =============================================================================

/// Identifier of an entry within a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId(u64);

impl EntryId {
    /// Largest assignable ID
    pub const MAX: EntryId = EntryId(COUNT_FLAG - 1);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        keycodec::entry_id_to_bytes(*self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        keycodec::bytes_to_entry_id(bytes)
    }

    pub fn next(&self) -> EntryId {
        EntryId(self.0 + 1)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntryId {
    fn from(v: u64) -> Self {
        EntryId(v)
    }
}

// =============================================================================
// ConditionResult
// =============================================================================

/// Three-valued membership answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionResult {
    True,
    False,
    /// The set is past its entry limit; membership cannot be decided
    Undefined,
}

impl From<bool> for ConditionResult {
    fn from(b: bool) -> Self {
        if b {
            ConditionResult::True
        } else {
            ConditionResult::False
        }
    }
}

// =============================================================================
// EntryIdSet
// =============================================================================

/// A set of entry IDs for one index key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryIdSet {
    /// Sorted, duplicate-free IDs
    Defined(Vec<EntryId>),
    /// Past the entry limit, size still tracked
    CountOnly(u64),
    /// Past the entry limit, size unknown
    Undefined,
}

impl Default for EntryIdSet {
    fn default() -> Self {
        EntryIdSet::Defined(Vec::new())
    }
}

impl EntryIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn undefined() -> Self {
        EntryIdSet::Undefined
    }

    /// Build a defined set from arbitrary IDs
    pub fn from_ids(ids: impl IntoIterator<Item = EntryId>) -> Self {
        let mut v: Vec<EntryId> = ids.into_iter().collect();
        v.sort_unstable();
        v.dedup();
        EntryIdSet::Defined(v)
    }

    pub fn single(id: EntryId) -> Self {
        EntryIdSet::Defined(vec![id])
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, EntryIdSet::Defined(_))
    }

    /// Number of IDs if known
    pub fn size(&self) -> Option<u64> {
        match self {
            EntryIdSet::Defined(ids) => Some(ids.len() as u64),
            EntryIdSet::CountOnly(n) => Some(*n),
            EntryIdSet::Undefined => None,
        }
    }

    /// True only for a defined, empty set
    pub fn is_empty(&self) -> bool {
        matches!(self, EntryIdSet::Defined(ids) if ids.is_empty())
    }

    pub fn ids(&self) -> &[EntryId] {
        match self {
            EntryIdSet::Defined(ids) => ids,
            _ => &[],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.ids().iter().copied()
    }

    pub fn contains(&self, id: EntryId) -> ConditionResult {
        match self {
            EntryIdSet::Defined(ids) => ids.binary_search(&id).is_ok().into(),
            _ => ConditionResult::Undefined,
        }
    }

    /// Add one ID; returns true if the set changed
    pub fn add(&mut self, id: EntryId) -> bool {
        match self {
            EntryIdSet::Defined(ids) => match ids.binary_search(&id) {
                Ok(_) => false,
                Err(pos) => {
                    ids.insert(pos, id);
                    true
                }
            },
            EntryIdSet::CountOnly(n) => {
                *n += 1;
                true
            }
            EntryIdSet::Undefined => false,
        }
    }

    /// Remove one ID; returns true if the set changed
    pub fn remove(&mut self, id: EntryId) -> bool {
        match self {
            EntryIdSet::Defined(ids) => match ids.binary_search(&id) {
                Ok(pos) => {
                    ids.remove(pos);
                    true
                }
                Err(_) => false,
            },
            EntryIdSet::CountOnly(n) => {
                *n = n.saturating_sub(1);
                true
            }
            EntryIdSet::Undefined => false,
        }
    }

    /// Union in place
    pub fn add_all(&mut self, other: &EntryIdSet) {
        match (&mut *self, other) {
            (EntryIdSet::Defined(a), EntryIdSet::Defined(b)) => {
                *a = merge_union(a, b);
            }
            (EntryIdSet::Undefined, _) => {}
            (_, EntryIdSet::Undefined) => *self = EntryIdSet::Undefined,
            (s, o) => {
                let total = s.size().unwrap_or(0) + o.size().unwrap_or(0);
                *s = EntryIdSet::CountOnly(total);
            }
        }
    }

    /// Difference in place
    pub fn delete_all(&mut self, other: &EntryIdSet) {
        match (&mut *self, other) {
            (EntryIdSet::Defined(a), EntryIdSet::Defined(b)) => {
                a.retain(|id| b.binary_search(id).is_err());
            }
            (EntryIdSet::CountOnly(n), EntryIdSet::Defined(b)) => {
                *n = n.saturating_sub(b.len() as u64);
            }
            _ => {}
        }
    }

    /// Intersection in place. An undefined side takes the other side's value.
    pub fn retain_all(&mut self, other: &EntryIdSet) {
        match (&mut *self, other) {
            (EntryIdSet::Defined(a), EntryIdSet::Defined(b)) => {
                a.retain(|id| b.binary_search(id).is_ok());
            }
            (EntryIdSet::Defined(_), _) => {}
            (_, o) => *self = o.clone(),
        }
    }

    /// Convert to count-only/undefined when past `limit` (0 means unlimited)
    pub fn apply_limit(self, limit: usize, maintain_count: bool) -> (EntryIdSet, bool) {
        match self {
            EntryIdSet::Defined(ids) if limit > 0 && ids.len() > limit => {
                let replacement = if maintain_count {
                    EntryIdSet::CountOnly(ids.len() as u64)
                } else {
                    EntryIdSet::Undefined
                };
                (replacement, true)
            }
            other => (other, false),
        }
    }

    // -------------------------------------------------------------------------
    // Encoding
    // -------------------------------------------------------------------------

    pub fn encode(&self) -> Vec<u8> {
        match self {
            EntryIdSet::Defined(ids) => {
                let mut out = Vec::with_capacity(ids.len() * 8);
                for id in ids {
                    out.extend_from_slice(&id.to_bytes());
                }
                out
            }
            EntryIdSet::CountOnly(n) => (COUNT_FLAG | n).to_be_bytes().to_vec(),
            EntryIdSet::Undefined => UNDEFINED_MARKER.to_be_bytes().to_vec(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 8 != 0 {
            return Err(DirError::Decode(format!(
                "entry ID set length {} is not a multiple of 8",
                bytes.len()
            )));
        }
        if bytes.len() == 8 {
            let raw = u64::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]);
            if raw == UNDEFINED_MARKER {
                return Ok(EntryIdSet::Undefined);
            }
            if raw & COUNT_FLAG != 0 {
                return Ok(EntryIdSet::CountOnly(raw & !COUNT_FLAG));
            }
        }
        let mut ids = Vec::with_capacity(bytes.len() / 8);
        for chunk in bytes.chunks_exact(8) {
            let id = EntryId::from_bytes(chunk)?;
            if id > EntryId::MAX {
                return Err(DirError::Decode(format!("entry ID {} out of range", id)));
            }
            ids.push(id);
        }
        if ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DirError::Decode("entry ID set is not strictly ascending".to_string()));
        }
        Ok(EntryIdSet::Defined(ids))
    }
}

impl fmt::Display for EntryIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryIdSet::Defined(ids) => {
                let parts: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", parts.join(","))
            }
            EntryIdSet::CountOnly(n) => write!(f, "[NOT-INDEXED] count={}", n),
            EntryIdSet::Undefined => write!(f, "[NOT-INDEXED]"),
        }
    }
}

impl FromIterator<EntryId> for EntryIdSet {
    fn from_iter<T: IntoIterator<Item = EntryId>>(iter: T) -> Self {
        EntryIdSet::from_ids(iter)
    }
}

fn merge_union(a: &[EntryId], b: &[EntryId]) -> Vec<EntryId> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}
