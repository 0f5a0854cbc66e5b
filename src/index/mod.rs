//! Index Module
//!
//! Secondary indexes mapping keys to entry ID sets.
//!
//! ## Responsibilities
//! - [`Index`]: one key → ID-set database with entry-limit handling and a
//!   persisted trusted flag
//! - [`Indexer`]: turns attribute values into keys for one index flavor
//! - [`AttributeIndex`]: every index configured for one attribute, filter
//!   evaluation and reconfiguration
//! - [`IndexBuffer`]: batches key deltas of one operation and applies them
//!   together
//!
//! ## Naming
//! ```text
//!   {container prefix}_{attribute}.{index id}
//!   e.g. dc_example_dc_com_cn.substring
//! ```

mod attribute;
mod buffer;
mod db;
mod indexer;
mod query;
mod state;

pub use attribute::{AttributeIndex, ConfigChangeResult};
pub(crate) use attribute::IndexDefaults;
pub use buffer::{BufferedIndexValues, BufferedVlvValues, IndexBuffer};
pub use db::Index;
pub use indexer::{Indexer, PRESENCE_KEY};
pub use query::{prefix_upper_bound, FilterUseMonitor, FilterUseStats, IndexQuery};
pub use state::State;
