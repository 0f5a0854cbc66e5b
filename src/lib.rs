//! # dirstore
//!
//! Storage engine of an LDAP directory backend:
//! - Order-preserving DN and entry-ID key encoding
//! - Attribute indexes (presence, equality, substring, ordering, approximate,
//!   extensible) with entry limits and filter evaluation
//! - VLV sorted indexes split into bounded runs
//! - Multi-threaded bulk import and offline index rebuild
//! - Read-only index verification
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Importer / RebuildManager            VerifyJob       │
//! │     (phase one: sort  ──►  phase two: merge)                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                    RootContainer                            │
//! │          one EntryContainer per base DN                     │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!     ┌─────────┬───────┴──────┬──────────────┬──────────┐
//!     ▼         ▼              ▼              ▼          ▼
//!  ┌───────┐ ┌──────────┐ ┌───────────┐ ┌───────────┐ ┌───────┐
//!  │ dn2id │ │ id2entry │ │ id2children│ │ attribute │ │  VLV  │
//!  │       │ │          │ │ id2subtree│ │  indexes  │ │ index │
//!  └───┬───┘ └────┬─────┘ └─────┬─────┘ └─────┬─────┘ └───┬───┘
//!      └──────────┴─────────────┴─────────────┴───────────┘
//!                               │
//!                               ▼
//!                       ┌──────────────┐
//!                       │   Storage    │
//!                       │ (Environment)│
//!                       └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod schema;
pub mod dn;
pub mod entry;
pub mod filter;
pub mod keycodec;
pub mod idset;

pub mod storage;
pub mod index;
pub mod vlv;
pub mod container;
pub mod import;
pub mod verify;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, ImportConfig, IndexConfig, IndexType, RebuildConfig, RebuildMode, VerifyConfig, VlvIndexConfig};
pub use container::{EntryContainer, RootContainer, SearchRequest, SearchResult};
pub use dn::Dn;
pub use entry::{Entry, Modification};
pub use error::{DirError, Result};
pub use filter::{Filter, SearchScope, SortOrder, VlvRequest};
pub use idset::{EntryId, EntryIdSet};
pub use import::{ImportResult, Importer, RebuildManager, RebuildResult};
pub use schema::Schema;
pub use verify::{VerifyJob, VerifyResult};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of dirstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
