//! Database file
//!
//! Immutable sorted snapshot of one named database, rewritten whole on
//! every sync.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (16 + N bytes)                                   │
//! │   Magic: "DSDB" (4) | Version: u16 (2) | Count: u64 (8) │
//! │   CmpLen: u16 (2) | Comparator name (N)                 │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [KeyLen: u32][ValLen: u32][Key][Value]                │
//! │   ... repeated for each record, in comparator order ... │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (16 bytes)                                       │
//! │   DataEnd: u64 (8) | DataCRC: u32 (4) | Padding (4)     │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod builder;
mod iterator;
mod reader;

pub use builder::DbFileBuilder;
pub use iterator::DbFileIterator;
pub use reader::DbFileReader;

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

/// Magic bytes identifying a dirstore database file
pub(crate) const MAGIC: &[u8; 4] = b"DSDB";

/// Current file format version
pub(crate) const VERSION: u16 = 1;

/// Fixed part of the header: Magic (4) + Version (2) + Count (8) + CmpLen (2)
pub(crate) const FIXED_HEADER_SIZE: u64 = 16;

/// Footer size: DataEnd (8) + DataCRC (4) + Padding (4) = 16 bytes
pub(crate) const FOOTER_SIZE: u64 = 16;

/// File extension of database files
pub const DB_FILE_EXTENSION: &str = "db";
