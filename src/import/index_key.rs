//! Routing of import records to scratch files and target indexes
//!
//! Records are tagged with a small synthetic index ID. Every ID maps to one
//! target (an attribute index of one container, or one container's DN
//! index). Targets that share an [`IndexKey`] share a scratch file.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::container::EntryContainer;
use crate::index::Index;

/// What a scratch file holds
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKind {
    /// DN keys feeding dn2id, id2children and id2subtree
    Dn,
    /// Keys of one attribute
    Attribute(String),
}

/// Identity of a scratch file: equal when kind and index ID match
#[derive(Debug, Clone)]
pub struct IndexKey {
    pub kind: IndexKind,
    /// Index flavor, e.g. `equality` or `substring`
    pub index_id: String,
    /// Entry limit used while consolidating ID sets
    pub entry_limit: usize,
}

impl IndexKey {
    pub fn dn() -> Self {
        Self {
            kind: IndexKind::Dn,
            index_id: "dn2id".to_string(),
            entry_limit: 1,
        }
    }

    pub fn attribute(attribute: &str, index_id: &str, entry_limit: usize) -> Self {
        Self {
            kind: IndexKind::Attribute(attribute.to_ascii_lowercase()),
            index_id: index_id.to_string(),
            entry_limit,
        }
    }

    pub fn is_dn(&self) -> bool {
        self.kind == IndexKind::Dn
    }

    /// Base name of the scratch file
    pub fn file_name(&self) -> String {
        match &self.kind {
            IndexKind::Dn => "dn".to_string(),
            IndexKind::Attribute(attr) => format!("{}.{}", attr, self.index_id).replace(':', "_"),
        }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.index_id == other.index_id
    }
}

impl Eq for IndexKey {}

impl Hash for IndexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.index_id.hash(state);
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Where phase two applies the records of one synthetic index ID
#[derive(Clone)]
pub enum ImportTarget {
    Index(Arc<Index>),
    /// dn2id of the container; id2children / id2subtree when enabled
    Dn {
        container: Arc<EntryContainer>,
        subordinates: bool,
    },
}

impl fmt::Debug for ImportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportTarget::Index(index) => write!(f, "Index({})", index.name()),
            ImportTarget::Dn { container, .. } => write!(f, "Dn({})", container.base_dn()),
        }
    }
}

/// One registered target
#[derive(Debug, Clone)]
pub struct RegisteredIndex {
    pub id: u32,
    pub key: IndexKey,
    pub target: ImportTarget,
    pub entry_limit: usize,
    pub maintain_count: bool,
}

/// Synthetic index IDs of one run
#[derive(Debug, Default, Clone)]
pub struct IndexRegistry {
    entries: Vec<RegisteredIndex>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attribute index; returns its synthetic ID
    pub fn register_index(&mut self, attribute: &str, index_id: &str, index: Arc<Index>) -> u32 {
        let id = self.entries.len() as u32;
        self.entries.push(RegisteredIndex {
            id,
            key: IndexKey::attribute(attribute, index_id, index.entry_limit()),
            entry_limit: index.entry_limit(),
            maintain_count: index.maintain_count(),
            target: ImportTarget::Index(index),
        });
        id
    }

    /// Register the DN index of a container
    pub fn register_dn(&mut self, container: Arc<EntryContainer>, subordinates: bool) -> u32 {
        let id = self.entries.len() as u32;
        self.entries.push(RegisteredIndex {
            id,
            key: IndexKey::dn(),
            entry_limit: 0,
            maintain_count: false,
            target: ImportTarget::Dn {
                container,
                subordinates,
            },
        });
        id
    }

    pub fn get(&self, id: u32) -> Option<&RegisteredIndex> {
        self.entries.get(id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredIndex> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct scratch files
    pub fn index_keys(&self) -> Vec<IndexKey> {
        let mut keys: Vec<IndexKey> = Vec::new();
        for e in &self.entries {
            if !keys.contains(&e.key) {
                keys.push(e.key.clone());
            }
        }
        keys
    }

    /// Synthetic ID of the DN target of `container`
    pub fn dn_id_for(&self, container: &EntryContainer) -> Option<u32> {
        self.entries.iter().find_map(|e| match &e.target {
            ImportTarget::Dn { container: c, .. } if c.base_dn() == container.base_dn() => Some(e.id),
            _ => None,
        })
    }

    /// Synthetic ID of an attribute index target
    pub fn id_for_index(&self, index: &Index) -> Option<u32> {
        self.entries.iter().find_map(|e| match &e.target {
            ImportTarget::Index(i) if i.name() == index.name() => Some(e.id),
            _ => None,
        })
    }
}
