//! Key comparators
//!
//! Every database orders its keys with a comparator installed at open time.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Total order over raw database keys
pub trait KeyComparator: Send + Sync + fmt::Debug {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Stable name recorded in the database file header
    fn name(&self) -> String;
}

/// Unsigned lexicographic byte order
#[derive(Debug, Clone, Copy, Default)]
pub struct Bytewise;

impl KeyComparator for Bytewise {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> String {
        "bytewise".to_string()
    }
}

/// Shared byte-order comparator
pub fn bytewise() -> Arc<dyn KeyComparator> {
    Arc::new(Bytewise)
}
