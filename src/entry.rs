//! Directory entries
//!
//! An entry is a DN plus a set of multi-valued attributes. Attribute names
//! are matched case-insensitively; values are kept as raw bytes and only
//! normalized by matching rules when index keys are derived.
//!
//! ## id2entry record format
//! ```text
//! ┌───────────┬──────────────────────────────────┐
//! │ Ver (1)   │ bincode(StoredEntry)             │
//! └───────────┴──────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dn::Dn;
use crate::error::{DirError, Result};

/// Format version byte prefixed to every id2entry record
pub const ENTRY_FORMAT_VERSION: u8 = 1;

/// A named attribute with its values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Name as first supplied
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// A directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    dn: Dn,
    /// Keyed by lower-case attribute name
    attributes: BTreeMap<String, Attribute>,
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attributes: BTreeMap::new(),
        }
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn set_dn(&mut self, dn: Dn) {
        self.dn = dn;
    }

    /// Builder-style helper: add string values for an attribute
    pub fn with(mut self, name: &str, values: &[&str]) -> Self {
        for v in values {
            self.add_value(name, v.as_bytes().to_vec());
        }
        self
    }

    /// Add one value, ignoring an exact duplicate
    pub fn add_value(&mut self, name: &str, value: Vec<u8>) {
        let attr = self
            .attributes
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| Attribute::new(name, Vec::new()));
        if !attr.values.contains(&value) {
            attr.values.push(value);
        }
    }

    /// Remove one value; returns whether it was present
    pub fn remove_value(&mut self, name: &str, value: &[u8]) -> bool {
        let key = name.to_ascii_lowercase();
        let Some(attr) = self.attributes.get_mut(&key) else {
            return false;
        };
        let before = attr.values.len();
        attr.values.retain(|v| v != value);
        let removed = attr.values.len() != before;
        if attr.values.is_empty() {
            self.attributes.remove(&key);
        }
        removed
    }

    /// Replace all values of an attribute (empty removes it)
    pub fn replace_values(&mut self, name: &str, values: Vec<Vec<u8>>) {
        let key = name.to_ascii_lowercase();
        if values.is_empty() {
            self.attributes.remove(&key);
        } else {
            self.attributes.insert(key, Attribute::new(name, values));
        }
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Attribute> {
        self.attributes.remove(&name.to_ascii_lowercase())
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(&name.to_ascii_lowercase())
    }

    /// Values of an attribute, empty when absent
    pub fn values(&self, name: &str) -> &[Vec<u8>] {
        self.attribute(name).map(|a| a.values.as_slice()).unwrap_or(&[])
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(&name.to_ascii_lowercase())
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    /// True if the entry has the given objectClass value (case-insensitive)
    pub fn has_object_class(&self, oc: &str) -> bool {
        self.values("objectclass")
            .iter()
            .any(|v| v.eq_ignore_ascii_case(oc.as_bytes()))
    }

    /// Apply a modification in place
    pub fn apply(&mut self, modification: &Modification) {
        match modification {
            Modification::Add { attribute, values } => {
                for v in values {
                    self.add_value(attribute, v.clone());
                }
            }
            Modification::Delete { attribute, values } => {
                if values.is_empty() {
                    self.remove_attribute(attribute);
                } else {
                    for v in values {
                        self.remove_value(attribute, v);
                    }
                }
            }
            Modification::Replace { attribute, values } => {
                self.replace_values(attribute, values.clone());
            }
        }
    }

    // -------------------------------------------------------------------------
    // id2entry encoding
    // -------------------------------------------------------------------------

    /// Encode for storage in id2entry
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![ENTRY_FORMAT_VERSION];
        out.extend(bincode::serialize(self)?);
        Ok(out)
    }

    /// Decode an id2entry record
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.first() {
            Some(&ENTRY_FORMAT_VERSION) => Ok(bincode::deserialize(&bytes[1..])?),
            Some(v) => Err(DirError::Decode(format!("unknown entry format version {}", v))),
            None => Err(DirError::Decode("empty entry record".to_string())),
        }
    }
}

/// One attribute modification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    Add { attribute: String, values: Vec<Vec<u8>> },
    /// Empty `values` deletes the whole attribute
    Delete { attribute: String, values: Vec<Vec<u8>> },
    Replace { attribute: String, values: Vec<Vec<u8>> },
}

impl Modification {
    pub fn attribute(&self) -> &str {
        match self {
            Modification::Add { attribute, .. }
            | Modification::Delete { attribute, .. }
            | Modification::Replace { attribute, .. } => attribute,
        }
    }

    pub fn replace(attribute: &str, values: &[&str]) -> Self {
        Modification::Replace {
            attribute: attribute.to_string(),
            values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        }
    }

    pub fn add(attribute: &str, values: &[&str]) -> Self {
        Modification::Add {
            attribute: attribute.to_string(),
            values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        }
    }

    pub fn delete(attribute: &str, values: &[&str]) -> Self {
        Modification::Delete {
            attribute: attribute.to_string(),
            values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        }
    }
}
