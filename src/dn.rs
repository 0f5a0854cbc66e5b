//! Distinguished names
//!
//! A DN is stored leaf-first: `rdns[0]` is the entry's own RDN and the last
//! element is the top of the naming context. Equality, hashing and ordering
//! use the normalized form only; the user-provided spelling is kept for
//! display.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{DirError, Result};

/// One relative distinguished name (possibly multi-valued, `cn=a+sn=b`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rdn {
    raw: String,
    normalized: String,
}

impl Rdn {
    /// Parse a single RDN (`attr=value[+attr=value...]`)
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DirError::InvalidDn("empty RDN".to_string()));
        }

        let mut avas = Vec::new();
        for ava in split_unescaped(s, '+') {
            let (attr, value) = split_once_unescaped(&ava, '=')
                .ok_or_else(|| DirError::InvalidDn(format!("RDN '{}' has no '='", s)))?;
            let attr = attr.trim().to_ascii_lowercase();
            if attr.is_empty() {
                return Err(DirError::InvalidDn(format!("RDN '{}' has no attribute type", s)));
            }
            let value = unescape(value.trim())?;
            let value = value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
            avas.push(format!("{}={}", attr, escape(&value)));
        }
        avas.sort();

        Ok(Self {
            raw: s.to_string(),
            normalized: avas.join("+"),
        })
    }

    /// Normalized `attr=value` form
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Attribute/value pairs, unescaped, from the raw spelling
    pub fn attribute_values(&self) -> Vec<(String, String)> {
        split_unescaped(&self.raw, '+')
            .iter()
            .filter_map(|ava| {
                let (a, v) = split_once_unescaped(ava, '=')?;
                Some((a.trim().to_string(), unescape(v.trim()).ok()?))
            })
            .collect()
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Rdn {}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A distinguished name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dn {
    /// Leaf first
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The root DSE (zero RDNs)
    pub fn root() -> Self {
        Self { rdns: Vec::new() }
    }

    /// Parse a string DN such as `uid=jdoe,ou=People,dc=example,dc=com`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::root());
        }
        let rdns = split_unescaped(s, ',')
            .iter()
            .map(|r| Rdn::parse(r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rdns })
    }

    /// Number of RDN components
    pub fn size(&self) -> usize {
        self.rdns.len()
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// RDN at `index` (0 is the leaf)
    pub fn rdn_at(&self, index: usize) -> Option<&Rdn> {
        self.rdns.get(index)
    }

    /// Leaf RDN
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// Immediate parent, or None for the root DSE
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            return None;
        }
        Some(Dn {
            rdns: self.rdns[1..].to_vec(),
        })
    }

    /// A child of this DN with the given RDN
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Dn { rdns }
    }

    /// True if `self` equals `ancestor` or lies below it
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        let n = ancestor.rdns.len();
        if n > self.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - n;
        self.rdns[offset..] == ancestor.rdns[..]
    }

    /// True if `self` equals `descendant` or is above it
    pub fn is_ancestor_of(&self, descendant: &Dn) -> bool {
        descendant.is_descendant_of(self)
    }

    /// Replace the `old_base` suffix of this DN with `new_base`
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Option<Dn> {
        if !self.is_descendant_of(old_base) {
            return None;
        }
        let keep = self.rdns.len() - old_base.rdns.len();
        let mut rdns = self.rdns[..keep].to_vec();
        rdns.extend(new_base.rdns.iter().cloned());
        Some(Dn { rdns })
    }

    /// Normalized RDN strings, leaf first
    pub fn normalized_rdns(&self) -> impl Iterator<Item = &str> {
        self.rdns.iter().map(|r| r.normalized())
    }

    /// Normalized string form; equal DNs always produce equal strings
    pub fn to_normalized_string(&self) -> String {
        self.normalized_rdns().collect::<Vec<_>>().join(",")
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns == other.rdns
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for rdn in &self.rdns {
            rdn.normalized.hash(state);
        }
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.rdns.iter().map(|r| r.raw.as_str()).collect();
        f.write_str(&parts.join(","))
    }
}

impl std::str::FromStr for Dn {
    type Err = DirError;

    fn from_str(s: &str) -> Result<Self> {
        Dn::parse(s)
    }
}

// =============================================================================
// Escaping helpers
// =============================================================================

/// Split on `sep` where it is not preceded by a backslash escape
fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn split_once_unescaped(s: &str, sep: char) -> Option<(String, String)> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            return Some((s[..i].to_string(), s[i + c.len_utf8()..].to_string()));
        }
    }
    None
}

/// Resolve `\c` and `\HH` escapes
fn unescape(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    let next = bytes.get(i + 1).ok_or_else(|| {
                        DirError::InvalidDn(format!("dangling escape in '{}'", s))
                    })?;
                    out.push(*next);
                    i += 2;
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|e| DirError::InvalidDn(e.to_string()))
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | '+' | '\\' | '=' | '"' | '<' | '>' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
