//! Attribute types and matching rules
//!
//! The storage engine treats this as a black box: a matching rule turns a
//! raw attribute value into a normalized, order-preserving byte string, and
//! an attribute type says which rule to use for equality, ordering, substring
//! and approximate matching.
//!
//! The registry is an explicit [`Schema`] value handed to every component
//! that needs it. There is no global attribute-type cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::dn::Dn;
use crate::error::{DirError, Result};

// =============================================================================
// Matching Rules
// =============================================================================

/// Matching rules known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchingRule {
    CaseIgnore,
    CaseExact,
    Integer,
    OctetString,
    TelephoneNumber,
    DistinguishedName,
    /// Phonetic approximate match (soundex code).
    Soundex,
}

impl MatchingRule {
    pub const ALL: [MatchingRule; 7] = [
        MatchingRule::CaseIgnore,
        MatchingRule::CaseExact,
        MatchingRule::Integer,
        MatchingRule::OctetString,
        MatchingRule::TelephoneNumber,
        MatchingRule::DistinguishedName,
        MatchingRule::Soundex,
    ];

    /// Rule name as used in configuration and extensible filters
    pub fn name(&self) -> &'static str {
        match self {
            MatchingRule::CaseIgnore => "caseIgnoreMatch",
            MatchingRule::CaseExact => "caseExactMatch",
            MatchingRule::Integer => "integerMatch",
            MatchingRule::OctetString => "octetStringMatch",
            MatchingRule::TelephoneNumber => "telephoneNumberMatch",
            MatchingRule::DistinguishedName => "distinguishedNameMatch",
            MatchingRule::Soundex => "soundexMatch",
        }
    }

    /// Numeric OID; the phonetic rule only has a name.
    pub fn oid(&self) -> &'static str {
        match self {
            MatchingRule::CaseIgnore => "2.5.13.2",
            MatchingRule::CaseExact => "2.5.13.5",
            MatchingRule::Integer => "2.5.13.14",
            MatchingRule::OctetString => "2.5.13.17",
            MatchingRule::TelephoneNumber => "2.5.13.20",
            MatchingRule::DistinguishedName => "2.5.13.1",
            MatchingRule::Soundex => "soundexMatch",
        }
    }

    /// Resolve a rule from its name or OID (case-insensitive name match)
    pub fn from_name_or_oid(s: &str) -> Option<MatchingRule> {
        let s = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.oid() == s || r.name().eq_ignore_ascii_case(s))
    }

    /// Normalize a raw value into its index representation.
    ///
    /// The result compares byte-wise in the rule's ordering.
    pub fn normalize(&self, value: &[u8]) -> Result<Vec<u8>> {
        match self {
            MatchingRule::CaseIgnore => Ok(collapse_spaces(&utf8(value)?).to_lowercase().into_bytes()),
            MatchingRule::CaseExact => Ok(collapse_spaces(&utf8(value)?).into_bytes()),
            MatchingRule::Integer => normalize_integer(&utf8(value)?),
            MatchingRule::OctetString => Ok(value.to_vec()),
            MatchingRule::TelephoneNumber => Ok(utf8(value)?
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '-')
                .collect::<String>()
                .into_bytes()),
            MatchingRule::DistinguishedName => {
                let dn = Dn::parse(&utf8(value)?)?;
                Ok(dn.to_normalized_string().into_bytes())
            }
            MatchingRule::Soundex => Ok(soundex(&utf8(value)?).into_bytes()),
        }
    }

    /// Whether substring matching is meaningful for this rule
    pub fn supports_substrings(&self) -> bool {
        matches!(
            self,
            MatchingRule::CaseIgnore | MatchingRule::CaseExact | MatchingRule::TelephoneNumber
        )
    }
}

impl fmt::Display for MatchingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn utf8(value: &[u8]) -> Result<String> {
    String::from_utf8(value.to_vec())
        .map_err(|e| DirError::Decode(format!("value is not valid UTF-8: {}", e)))
}

fn collapse_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Integers are keyed as a big-endian u64 with the sign bit flipped so that
/// byte order matches numeric order.
fn normalize_integer(s: &str) -> Result<Vec<u8>> {
    let n: i64 = s
        .trim()
        .parse()
        .map_err(|_| DirError::Decode(format!("'{}' is not a valid integer", s.trim())))?;
    Ok(((n as u64) ^ (1u64 << 63)).to_be_bytes().to_vec())
}

/// American soundex code of the letters in `s` (e.g. "Robert" -> "R163").
pub fn soundex(s: &str) -> String {
    fn code(c: char) -> Option<char> {
        match c {
            'B' | 'F' | 'P' | 'V' => Some('1'),
            'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some('2'),
            'D' | 'T' => Some('3'),
            'L' => Some('4'),
            'M' | 'N' => Some('5'),
            'R' => Some('6'),
            _ => None,
        }
    }

    let letters: Vec<char> = s
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let Some(&first) = letters.first() else {
        return String::new();
    };

    let mut out = String::with_capacity(4);
    out.push(first);
    let mut last = code(first);
    for &c in &letters[1..] {
        let current = code(c);
        if current.is_some() && current != last {
            if let Some(d) = current {
                out.push(d);
            }
            if out.len() == 4 {
                break;
            }
        }
        // H and W do not separate letters with the same code
        if c != 'H' && c != 'W' {
            last = current;
        }
    }
    while out.len() < 4 {
        out.push('0');
    }
    out
}

// =============================================================================
// Attribute Types
// =============================================================================

/// An attribute type with its matching rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeType {
    /// Lower-case canonical name
    pub name: String,
    pub equality: Option<MatchingRule>,
    pub ordering: Option<MatchingRule>,
    pub substring: Option<MatchingRule>,
    pub approximate: Option<MatchingRule>,
}

impl AttributeType {
    /// Case-ignore string attribute with every rule defined
    pub fn directory_string(name: &str) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            equality: Some(MatchingRule::CaseIgnore),
            ordering: Some(MatchingRule::CaseIgnore),
            substring: Some(MatchingRule::CaseIgnore),
            approximate: Some(MatchingRule::Soundex),
        }
    }

    pub fn with_rules(
        name: &str,
        equality: Option<MatchingRule>,
        ordering: Option<MatchingRule>,
        substring: Option<MatchingRule>,
        approximate: Option<MatchingRule>,
    ) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            equality,
            ordering,
            substring,
            approximate,
        }
    }
}

/// Registry of attribute types
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: HashMap<String, Arc<AttributeType>>,
}

impl Schema {
    /// Empty registry; unknown attributes resolve to case-ignore strings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the usual user and operational attributes
    pub fn default_schema() -> Self {
        use MatchingRule::*;

        let mut schema = Self::new();
        for name in [
            "cn", "sn", "givenname", "uid", "mail", "ou", "o", "dc", "l", "st",
            "description", "title", "displayname", "objectclass", "street",
        ] {
            schema.add(AttributeType::directory_string(name));
        }
        schema.add(AttributeType::with_rules(
            "telephonenumber",
            Some(TelephoneNumber),
            None,
            Some(TelephoneNumber),
            None,
        ));
        for name in ["uidnumber", "gidnumber", "employeenumber"] {
            schema.add(AttributeType::with_rules(name, Some(Integer), Some(Integer), None, None));
        }
        for name in ["member", "uniquemember", "manager", "seealso"] {
            schema.add(AttributeType::with_rules(name, Some(DistinguishedName), None, None, None));
        }
        schema.add(AttributeType::with_rules("ref", Some(CaseExact), None, None, None));
        schema.add(AttributeType::with_rules(
            "userpassword",
            Some(OctetString),
            Some(OctetString),
            None,
            None,
        ));
        schema
    }

    /// Register (or replace) an attribute type
    pub fn add(&mut self, attr: AttributeType) {
        self.types.insert(attr.name.clone(), Arc::new(attr));
    }

    /// Look up a registered attribute type
    pub fn get(&self, name: &str) -> Option<Arc<AttributeType>> {
        self.types.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Look up an attribute type, defaulting to a case-ignore string type
    pub fn attribute_type(&self, name: &str) -> Arc<AttributeType> {
        self.get(name)
            .unwrap_or_else(|| Arc::new(AttributeType::directory_string(name)))
    }
}
