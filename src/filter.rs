//! Search filters, scopes and sort orders
//!
//! Filters use the RFC 4515 string form, e.g.
//! `(&(objectClass=person)(|(cn=jo*)(sn~=smith)))`.

use std::fmt;

use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::schema::{MatchingRule, Schema};

// =============================================================================
// Filter
// =============================================================================

/// A search filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality { attribute: String, value: Vec<u8> },
    Presence { attribute: String },
    GreaterOrEqual { attribute: String, value: Vec<u8> },
    LessOrEqual { attribute: String, value: Vec<u8> },
    Substring {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
    Approximate { attribute: String, value: Vec<u8> },
    Extensible {
        rule: Option<String>,
        attribute: Option<String>,
        value: Vec<u8>,
    },
}

impl Filter {
    /// Parse the string representation of a filter
    pub fn parse(s: &str) -> Result<Filter> {
        let s = s.trim();
        let (filter, rest) = parse_filter(s)?;
        if !rest.trim().is_empty() {
            return Err(DirError::InvalidFilter(format!("trailing characters in '{}'", s)));
        }
        Ok(filter)
    }

    pub fn equality(attribute: &str, value: &str) -> Filter {
        Filter::Equality {
            attribute: attribute.to_string(),
            value: value.as_bytes().to_vec(),
        }
    }

    pub fn presence(attribute: &str) -> Filter {
        Filter::Presence {
            attribute: attribute.to_string(),
        }
    }

    /// Attribute the filter component applies to, if any
    pub fn attribute(&self) -> Option<&str> {
        match self {
            Filter::Equality { attribute, .. }
            | Filter::Presence { attribute }
            | Filter::GreaterOrEqual { attribute, .. }
            | Filter::LessOrEqual { attribute, .. }
            | Filter::Substring { attribute, .. }
            | Filter::Approximate { attribute, .. } => Some(attribute),
            Filter::Extensible { attribute, .. } => attribute.as_deref(),
            _ => None,
        }
    }

    /// Evaluate the filter directly against an entry
    pub fn matches(&self, entry: &Entry, schema: &Schema) -> bool {
        match self {
            Filter::And(parts) => parts.iter().all(|f| f.matches(entry, schema)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(entry, schema)),
            Filter::Not(inner) => !inner.matches(entry, schema),
            Filter::Presence { attribute } => {
                attribute.eq_ignore_ascii_case("objectclass") || entry.has_attribute(attribute)
            }
            Filter::Equality { attribute, value } => {
                let rule = schema.attribute_type(attribute).equality;
                any_value(entry, attribute, rule, value, |a, b| a == b)
            }
            Filter::GreaterOrEqual { attribute, value } => {
                let rule = schema.attribute_type(attribute).ordering;
                any_value(entry, attribute, rule, value, |a, b| a >= b)
            }
            Filter::LessOrEqual { attribute, value } => {
                let rule = schema.attribute_type(attribute).ordering;
                any_value(entry, attribute, rule, value, |a, b| a <= b)
            }
            Filter::Approximate { attribute, value } => {
                let rule = schema
                    .attribute_type(attribute)
                    .approximate
                    .or(Some(MatchingRule::Soundex));
                any_value(entry, attribute, rule, value, |a, b| a == b)
            }
            Filter::Substring {
                attribute,
                initial,
                any,
                final_,
            } => {
                let rule = schema
                    .attribute_type(attribute)
                    .substring
                    .unwrap_or(MatchingRule::CaseIgnore);
                let norm = |v: &[u8]| rule.normalize(v).ok();
                let initial = initial.as_deref().and_then(norm);
                let final_ = final_.as_deref().and_then(norm);
                let any: Vec<Vec<u8>> = any.iter().filter_map(|v| norm(v)).collect();
                entry.values(attribute).iter().any(|v| match norm(v) {
                    Some(v) => substring_matches(&v, initial.as_deref(), &any, final_.as_deref()),
                    None => false,
                })
            }
            Filter::Extensible {
                rule,
                attribute,
                value,
            } => {
                let Some(attribute) = attribute else {
                    return false;
                };
                let rule = rule
                    .as_deref()
                    .and_then(MatchingRule::from_name_or_oid)
                    .or(schema.attribute_type(attribute).equality);
                any_value(entry, attribute, rule, value, |a, b| a == b)
            }
        }
    }
}

fn any_value(
    entry: &Entry,
    attribute: &str,
    rule: Option<MatchingRule>,
    assertion: &[u8],
    cmp: impl Fn(&[u8], &[u8]) -> bool,
) -> bool {
    let Some(rule) = rule else {
        return false;
    };
    let Ok(assertion) = rule.normalize(assertion) else {
        return false;
    };
    entry
        .values(attribute)
        .iter()
        .filter_map(|v| rule.normalize(v).ok())
        .any(|v| cmp(&v, &assertion))
}

fn substring_matches(value: &[u8], initial: Option<&[u8]>, any: &[Vec<u8>], final_: Option<&[u8]>) -> bool {
    let mut pos = 0;
    if let Some(init) = initial {
        if !value.starts_with(init) {
            return false;
        }
        pos = init.len();
    }
    for part in any {
        match find(&value[pos..], part) {
            Some(i) => pos += i + part.len(),
            None => return false,
        }
    }
    if let Some(fin) = final_ {
        return value.len() >= pos + fin.len() && value.ends_with(fin);
    }
    true
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = |v: &[u8]| String::from_utf8_lossy(v).into_owned();
        match self {
            Filter::And(parts) => {
                write!(f, "(&")?;
                for p in parts {
                    write!(f, "{}", p)?;
                }
                write!(f, ")")
            }
            Filter::Or(parts) => {
                write!(f, "(|")?;
                for p in parts {
                    write!(f, "{}", p)?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality { attribute, value } => write!(f, "({}={})", attribute, s(value)),
            Filter::Presence { attribute } => write!(f, "({}=*)", attribute),
            Filter::GreaterOrEqual { attribute, value } => write!(f, "({}>={})", attribute, s(value)),
            Filter::LessOrEqual { attribute, value } => write!(f, "({}<={})", attribute, s(value)),
            Filter::Approximate { attribute, value } => write!(f, "({}~={})", attribute, s(value)),
            Filter::Substring {
                attribute,
                initial,
                any,
                final_,
            } => {
                write!(f, "({}=", attribute)?;
                if let Some(i) = initial {
                    write!(f, "{}", s(i))?;
                }
                write!(f, "*")?;
                for a in any {
                    write!(f, "{}*", s(a))?;
                }
                if let Some(fi) = final_ {
                    write!(f, "{}", s(fi))?;
                }
                write!(f, ")")
            }
            Filter::Extensible {
                rule,
                attribute,
                value,
            } => {
                write!(f, "(")?;
                if let Some(a) = attribute {
                    write!(f, "{}", a)?;
                }
                if let Some(r) = rule {
                    write!(f, ":{}", r)?;
                }
                write!(f, ":={})", s(value))
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Parser
// -----------------------------------------------------------------------------

fn parse_filter(s: &str) -> Result<(Filter, &str)> {
    let s = s.trim_start();
    let body = s
        .strip_prefix('(')
        .ok_or_else(|| DirError::InvalidFilter(format!("expected '(' at '{}'", s)))?;

    match body.chars().next() {
        Some('&') => {
            let (parts, rest) = parse_list(&body[1..])?;
            Ok((Filter::And(parts), rest))
        }
        Some('|') => {
            let (parts, rest) = parse_list(&body[1..])?;
            Ok((Filter::Or(parts), rest))
        }
        Some('!') => {
            let (inner, rest) = parse_filter(&body[1..])?;
            let rest = close(rest)?;
            Ok((Filter::Not(Box::new(inner)), rest))
        }
        Some(_) => {
            let end = find_close(body)?;
            let item = parse_item(&body[..end])?;
            Ok((item, &body[end + 1..]))
        }
        None => Err(DirError::InvalidFilter("unexpected end of filter".to_string())),
    }
}

fn parse_list(mut s: &str) -> Result<(Vec<Filter>, &str)> {
    let mut parts = Vec::new();
    loop {
        s = s.trim_start();
        if let Some(rest) = s.strip_prefix(')') {
            return Ok((parts, rest));
        }
        if s.is_empty() {
            return Err(DirError::InvalidFilter("unterminated filter list".to_string()));
        }
        let (f, rest) = parse_filter(s)?;
        parts.push(f);
        s = rest;
    }
}

fn close(s: &str) -> Result<&str> {
    s.trim_start()
        .strip_prefix(')')
        .ok_or_else(|| DirError::InvalidFilter(format!("expected ')' at '{}'", s)))
}

/// Position of the unescaped ')' closing a simple item
fn find_close(s: &str) -> Result<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ')' {
            return Ok(i);
        } else if c == '(' {
            break;
        }
    }
    Err(DirError::InvalidFilter(format!("unterminated item '{}'", s)))
}

fn parse_item(item: &str) -> Result<Filter> {
    let bad = || DirError::InvalidFilter(format!("malformed filter item '{}'", item));

    if let Some(i) = item.find(":=") {
        let lhs = &item[..i];
        let value = unescape_value(&item[i + 2..])?;
        let mut parts = lhs.split(':');
        let attribute = parts.next().filter(|a| !a.is_empty()).map(str::to_string);
        let rule = parts
            .filter(|p| !p.eq_ignore_ascii_case("dn"))
            .last()
            .map(str::to_string);
        if attribute.is_none() && rule.is_none() {
            return Err(bad());
        }
        return Ok(Filter::Extensible {
            rule,
            attribute,
            value,
        });
    }

    for (op, ctor) in [
        (">=", 0u8),
        ("<=", 1u8),
        ("~=", 2u8),
    ] {
        if let Some(i) = item.find(op) {
            let attribute = item[..i].trim().to_string();
            if attribute.is_empty() {
                return Err(bad());
            }
            let value = unescape_value(&item[i + 2..])?;
            return Ok(match ctor {
                0 => Filter::GreaterOrEqual { attribute, value },
                1 => Filter::LessOrEqual { attribute, value },
                _ => Filter::Approximate { attribute, value },
            });
        }
    }

    let i = item.find('=').ok_or_else(bad)?;
    let attribute = item[..i].trim().to_string();
    if attribute.is_empty() {
        return Err(bad());
    }
    let raw = &item[i + 1..];
    if raw == "*" {
        return Ok(Filter::Presence { attribute });
    }
    if !raw.contains('*') {
        return Ok(Filter::Equality {
            attribute,
            value: unescape_value(raw)?,
        });
    }

    let pieces: Vec<&str> = raw.split('*').collect();
    let last = pieces.len() - 1;
    let mut initial = None;
    let mut final_ = None;
    let mut any = Vec::new();
    for (n, piece) in pieces.iter().enumerate() {
        if piece.is_empty() {
            continue;
        }
        let v = unescape_value(piece)?;
        if n == 0 {
            initial = Some(v);
        } else if n == last {
            final_ = Some(v);
        } else {
            any.push(v);
        }
    }
    Ok(Filter::Substring {
        attribute,
        initial,
        any,
        final_,
    })
}

/// Resolve `\HH` escapes in an assertion value
fn unescape_value(s: &str) -> Result<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| DirError::InvalidFilter(format!("bad escape in '{}'", s)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

// =============================================================================
// Search scope
// =============================================================================

/// Scope of a search relative to its base DN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject,
    SingleLevel,
    WholeSubtree,
    Subordinates,
}

impl SearchScope {
    /// Whether `dn` falls within this scope under `base`
    pub fn contains(&self, base: &Dn, dn: &Dn) -> bool {
        match self {
            SearchScope::BaseObject => dn == base,
            SearchScope::SingleLevel => dn.parent().as_ref() == Some(base),
            SearchScope::WholeSubtree => dn.is_descendant_of(base),
            SearchScope::Subordinates => dn != base && dn.is_descendant_of(base),
        }
    }
}

impl std::str::FromStr for SearchScope {
    type Err = DirError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "base" | "base-object" => Ok(SearchScope::BaseObject),
            "one" | "single-level" => Ok(SearchScope::SingleLevel),
            "sub" | "whole-subtree" => Ok(SearchScope::WholeSubtree),
            "subordinates" | "subordinate-subtree" => Ok(SearchScope::Subordinates),
            other => Err(DirError::Config(format!("unknown search scope '{}'", other))),
        }
    }
}

// =============================================================================
// Sort order
// =============================================================================

/// One key of a sort order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attribute: String,
    /// Descending when true
    pub reverse: bool,
    /// Ordering rule override; defaults to the attribute's ordering rule
    pub rule: Option<MatchingRule>,
}

/// A multi-key sort order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortOrder {
    pub keys: Vec<SortKey>,
}

impl SortOrder {
    /// Parse `+cn -sn` (or `cn,-sn`); `+` is optional
    pub fn parse(s: &str) -> Result<SortOrder> {
        let mut keys = Vec::new();
        for token in s.split(|c: char| c.is_whitespace() || c == ',') {
            if token.is_empty() {
                continue;
            }
            let (reverse, rest) = match token.as_bytes()[0] {
                b'-' => (true, &token[1..]),
                b'+' => (false, &token[1..]),
                _ => (false, token),
            };
            let (attribute, rule) = match rest.split_once(':') {
                Some((a, r)) => {
                    let rule = MatchingRule::from_name_or_oid(r)
                        .ok_or_else(|| DirError::Config(format!("unknown ordering rule '{}'", r)))?;
                    (a, Some(rule))
                }
                None => (rest, None),
            };
            if attribute.is_empty() {
                return Err(DirError::Config(format!("malformed sort key '{}'", token)));
            }
            keys.push(SortKey {
                attribute: attribute.to_ascii_lowercase(),
                reverse,
                rule,
            });
        }
        if keys.is_empty() {
            return Err(DirError::Config("empty sort order".to_string()));
        }
        Ok(SortOrder { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .keys
            .iter()
            .map(|k| format!("{}{}", if k.reverse { "-" } else { "+" }, k.attribute))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

// =============================================================================
// VLV request
// =============================================================================

/// Virtual list view request control
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlvRequest {
    ByOffset {
        before_count: usize,
        after_count: usize,
        /// 1-based target offset; 0 is treated as 1
        offset: i64,
        content_count: usize,
    },
    ByAssertion {
        before_count: usize,
        after_count: usize,
        assertion: Vec<u8>,
    },
}

/// Result of a VLV evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvResponse {
    /// 1-based position of the target entry
    pub target_position: usize,
    pub content_count: usize,
}
