//! Configuration for dirstore
//!
//! Backend configuration plus the per-operation settings of import, rebuild
//! and verify. All of them come with sensible defaults and builders.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::dn::Dn;
use crate::error::{DirError, Result};
use crate::filter::{Filter, SearchScope, SortOrder};

/// Default maximum number of IDs kept per index key
pub const DEFAULT_INDEX_ENTRY_LIMIT: usize = 4000;

/// Default substring key length
pub const DEFAULT_SUBSTRING_LENGTH: usize = 6;

/// Default maximum number of entries per VLV sort-values run
pub const DEFAULT_VLV_MAX_BLOCK_SIZE: usize = 4000;

/// Default interval between progress reports
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Default memory given to an import when none is configured (512 MB)
pub const DEFAULT_IMPORT_MEMORY: u64 = 512 * 1024 * 1024;

// =============================================================================
// Index types
// =============================================================================

/// Flavor of an attribute index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexType {
    Presence,
    Equality,
    Substring,
    Ordering,
    Approximate,
    Extensible,
}

impl IndexType {
    pub const ALL: [IndexType; 6] = [
        IndexType::Presence,
        IndexType::Equality,
        IndexType::Substring,
        IndexType::Ordering,
        IndexType::Approximate,
        IndexType::Extensible,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::Presence => "presence",
            IndexType::Equality => "equality",
            IndexType::Substring => "substring",
            IndexType::Ordering => "ordering",
            IndexType::Approximate => "approximate",
            IndexType::Extensible => "extensible",
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexType {
    type Err = DirError;

    fn from_str(s: &str) -> Result<Self> {
        IndexType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DirError::Config(format!("unknown index type '{}'", s.trim())))
    }
}

// =============================================================================
// Attribute index configuration
// =============================================================================

/// Configuration of one attribute index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Lower-case attribute name
    pub attribute: String,
    pub types: BTreeSet<IndexType>,
    /// Overrides the backend-wide entry limit
    pub entry_limit: Option<usize>,
    /// Overrides the backend-wide substring length
    pub substring_length: Option<usize>,
    /// Matching rule names/OIDs for the extensible index type
    pub extensible_rules: Vec<String>,
}

impl IndexConfig {
    pub fn new(attribute: &str, types: &[IndexType]) -> Self {
        Self {
            attribute: attribute.to_ascii_lowercase(),
            types: types.iter().copied().collect(),
            entry_limit: None,
            substring_length: None,
            extensible_rules: Vec::new(),
        }
    }

    pub fn with_entry_limit(mut self, limit: usize) -> Self {
        self.entry_limit = Some(limit);
        self
    }

    pub fn with_substring_length(mut self, len: usize) -> Self {
        self.substring_length = Some(len);
        self
    }

    pub fn with_extensible_rules(mut self, rules: &[&str]) -> Self {
        self.types.insert(IndexType::Extensible);
        self.extensible_rules = rules.iter().map(|r| r.to_string()).collect();
        self
    }
}

impl FromStr for IndexConfig {
    type Err = DirError;

    /// `attr:type[,type...][;limit=N][;substring-length=N][;rules=a|b]`
    fn from_str(s: &str) -> Result<Self> {
        let mut sections = s.split(';');
        let head = sections.next().unwrap_or_default();
        let (attribute, types) = head
            .split_once(':')
            .ok_or_else(|| DirError::Config(format!("index '{}' must be attr:type[,type]", s)))?;
        if attribute.trim().is_empty() {
            return Err(DirError::Config(format!("index '{}' has no attribute", s)));
        }
        let types = types
            .split(',')
            .filter(|t| !t.trim().is_empty())
            .map(IndexType::from_str)
            .collect::<Result<Vec<_>>>()?;
        let mut config = IndexConfig::new(attribute.trim(), &types);

        for option in sections {
            let (name, value) = option
                .split_once('=')
                .ok_or_else(|| DirError::Config(format!("malformed index option '{}'", option)))?;
            let number = || {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| DirError::Config(format!("'{}' is not a number", value)))
            };
            match name.trim() {
                "limit" | "entry-limit" => config.entry_limit = Some(number()?),
                "substring-length" => config.substring_length = Some(number()?),
                "rules" => {
                    config.extensible_rules =
                        value.split('|').map(|r| r.trim().to_string()).collect();
                    config.types.insert(IndexType::Extensible);
                }
                other => return Err(DirError::Config(format!("unknown index option '{}'", other))),
            }
        }
        Ok(config)
    }
}

// =============================================================================
// VLV index configuration
// =============================================================================

/// Configuration of one VLV index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvIndexConfig {
    pub name: String,
    pub base_dn: Dn,
    pub scope: SearchScope,
    pub filter: Filter,
    pub sort_order: SortOrder,
    /// Maximum number of entries per sort-values run
    pub max_block_size: usize,
}

impl VlvIndexConfig {
    pub fn new(name: &str, base_dn: &str, scope: SearchScope, filter: &str, sort_order: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_ascii_lowercase(),
            base_dn: Dn::parse(base_dn)?,
            scope,
            filter: Filter::parse(filter)?,
            sort_order: SortOrder::parse(sort_order)?,
            max_block_size: DEFAULT_VLV_MAX_BLOCK_SIZE,
        })
    }

    pub fn with_max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = size;
        self
    }
}

// =============================================================================
// Backend configuration
// =============================================================================

/// Main configuration for a backend
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all database files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── *.db             (one file per database)
    ///     └── import-tmp/      (scratch files during import/rebuild)
    pub data_dir: PathBuf,

    /// Naming contexts served by this backend
    pub base_dns: Vec<Dn>,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    pub indexes: Vec<IndexConfig>,

    pub vlv_indexes: Vec<VlvIndexConfig>,

    /// Maximum IDs per index key before the key becomes undefined
    pub index_entry_limit: usize,

    /// Substring key length
    pub substring_length: usize,

    /// Maintain id2children / id2subtree
    pub subordinate_indexes_enabled: bool,

    /// Keep a count once a key passes its entry limit
    pub maintain_count: bool,
}

impl Default for Config {
    fn default() -> Self {
        use IndexType::*;

        Self {
            data_dir: PathBuf::from("./dirstore_data"),
            base_dns: vec![Dn::parse("dc=example,dc=com").unwrap_or_default()],
            indexes: vec![
                IndexConfig::new("objectclass", &[Equality]),
                IndexConfig::new("cn", &[Equality, Substring]),
                IndexConfig::new("sn", &[Equality, Substring]),
                IndexConfig::new("uid", &[Equality]),
                IndexConfig::new("mail", &[Equality]),
            ],
            vlv_indexes: Vec::new(),
            index_entry_limit: DEFAULT_INDEX_ENTRY_LIMIT,
            substring_length: DEFAULT_SUBSTRING_LENGTH,
            subordinate_indexes_enabled: true,
            maintain_count: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.base_dns.is_empty() {
            return Err(DirError::Config("at least one base DN is required".to_string()));
        }
        if self.base_dns.iter().any(Dn::is_root) {
            return Err(DirError::Config("the root DSE cannot be a base DN".to_string()));
        }
        if self.substring_length == 0 {
            return Err(DirError::Config("substring length must be at least 1".to_string()));
        }
        let mut seen = BTreeSet::new();
        for index in &self.indexes {
            if !seen.insert(index.attribute.as_str()) {
                return Err(DirError::Config(format!(
                    "attribute '{}' is indexed twice",
                    index.attribute
                )));
            }
            if index.types.is_empty() {
                return Err(DirError::Config(format!(
                    "index '{}' has no index types",
                    index.attribute
                )));
            }
        }
        for vlv in &self.vlv_indexes {
            if vlv.max_block_size < 2 {
                return Err(DirError::Config(format!(
                    "VLV index '{}' needs a max block size of at least 2",
                    vlv.name
                )));
            }
        }
        Ok(())
    }

    pub fn index_config(&self, attribute: &str) -> Option<&IndexConfig> {
        self.indexes
            .iter()
            .find(|i| i.attribute.eq_ignore_ascii_case(attribute))
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Replace the base DNs
    pub fn base_dns(mut self, dns: Vec<Dn>) -> Self {
        self.config.base_dns = dns;
        self
    }

    /// Serve a single base DN
    pub fn base_dn(self, dn: &str) -> Result<Self> {
        Ok(self.base_dns(vec![Dn::parse(dn)?]))
    }

    /// Replace all attribute indexes
    pub fn indexes(mut self, indexes: Vec<IndexConfig>) -> Self {
        self.config.indexes = indexes;
        self
    }

    /// Add one attribute index
    pub fn index(mut self, index: IndexConfig) -> Self {
        self.config.indexes.retain(|i| i.attribute != index.attribute);
        self.config.indexes.push(index);
        self
    }

    /// Add one VLV index
    pub fn vlv_index(mut self, vlv: VlvIndexConfig) -> Self {
        self.config.vlv_indexes.push(vlv);
        self
    }

    /// Set the default index entry limit
    pub fn index_entry_limit(mut self, limit: usize) -> Self {
        self.config.index_entry_limit = limit;
        self
    }

    /// Set the default substring length
    pub fn substring_length(mut self, len: usize) -> Self {
        self.config.substring_length = len;
        self
    }

    /// Enable or disable id2children/id2subtree
    pub fn subordinate_indexes_enabled(mut self, enabled: bool) -> Self {
        self.config.subordinate_indexes_enabled = enabled;
        self
    }

    /// Keep counts for keys past their entry limit
    pub fn maintain_count(mut self, maintain: bool) -> Self {
        self.config.maintain_count = maintain;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

// =============================================================================
// Import configuration
// =============================================================================

/// Settings of one LDIF import
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Phase-one worker threads; 0 means twice the CPU count
    pub thread_count: usize,
    /// Scratch directory; defaults to `{data_dir}/import-tmp`
    pub tmp_dir: Option<PathBuf>,
    /// Skip parent/duplicate checks on DNs
    pub skip_dn_validation: bool,
    /// Keep existing entries and add to them
    pub append: bool,
    /// In append mode, replace entries that already exist
    pub replace_existing: bool,
    /// Remove all existing entries of the targeted base DNs first
    pub clear_backend: bool,
    /// Only import entries below these branches (empty = whole base DN)
    pub include_branches: Vec<Dn>,
    /// Skip entries below these branches
    pub exclude_branches: Vec<Dn>,
    /// Memory the import may use, in bytes
    pub available_memory: u64,
    pub progress_interval: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            tmp_dir: None,
            skip_dn_validation: false,
            append: false,
            replace_existing: false,
            clear_backend: false,
            include_branches: Vec::new(),
            exclude_branches: Vec::new(),
            available_memory: DEFAULT_IMPORT_MEMORY,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl ImportConfig {
    pub fn builder() -> ImportConfigBuilder {
        ImportConfigBuilder::default()
    }
}

/// Builder for ImportConfig
#[derive(Default)]
pub struct ImportConfigBuilder {
    config: ImportConfig,
}

impl ImportConfigBuilder {
    pub fn thread_count(mut self, count: usize) -> Self {
        self.config.thread_count = count;
        self
    }

    pub fn tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.tmp_dir = Some(dir.into());
        self
    }

    pub fn skip_dn_validation(mut self, skip: bool) -> Self {
        self.config.skip_dn_validation = skip;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.config.append = append;
        self
    }

    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.config.replace_existing = replace;
        self
    }

    pub fn clear_backend(mut self, clear: bool) -> Self {
        self.config.clear_backend = clear;
        self
    }

    pub fn include_branch(mut self, dn: Dn) -> Self {
        self.config.include_branches.push(dn);
        self
    }

    pub fn exclude_branch(mut self, dn: Dn) -> Self {
        self.config.exclude_branches.push(dn);
        self
    }

    pub fn available_memory(mut self, bytes: u64) -> Self {
        self.config.available_memory = bytes;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress_interval = interval;
        self
    }

    pub fn build(self) -> ImportConfig {
        self.config
    }
}

// =============================================================================
// Rebuild configuration
// =============================================================================

/// Which indexes a rebuild targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildMode {
    /// Every index including dn2id, id2children, id2subtree, dn2uri and VLV
    All,
    /// Only indexes currently marked untrusted
    Degraded,
    /// The listed index names
    UserDefined(Vec<String>),
}

/// Settings of one index rebuild
#[derive(Debug, Clone)]
pub struct RebuildConfig {
    pub base_dn: Dn,
    pub mode: RebuildMode,
    /// Mark degraded indexes trusted without rebuilding them
    pub clear_degraded_state: bool,
    pub tmp_dir: Option<PathBuf>,
    pub thread_count: usize,
    pub available_memory: u64,
    pub progress_interval: Duration,
}

impl RebuildConfig {
    pub fn new(base_dn: Dn, mode: RebuildMode) -> Self {
        Self {
            base_dn,
            mode,
            clear_degraded_state: false,
            tmp_dir: None,
            thread_count: 0,
            available_memory: DEFAULT_IMPORT_MEMORY,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Convenience for `UserDefined` with string names
    pub fn for_indexes(base_dn: Dn, names: &[&str]) -> Self {
        Self::new(
            base_dn,
            RebuildMode::UserDefined(names.iter().map(|n| n.to_ascii_lowercase()).collect()),
        )
    }

    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = Some(dir.into());
        self
    }

    pub fn with_available_memory(mut self, bytes: u64) -> Self {
        self.available_memory = bytes;
        self
    }

    pub fn with_clear_degraded_state(mut self, clear: bool) -> Self {
        self.clear_degraded_state = clear;
        self
    }
}

// =============================================================================
// Verify configuration
// =============================================================================

/// Settings of one verify run
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub base_dn: Dn,
    /// Indexes checked entry-by-entry (empty with an empty clean list = all)
    pub complete_list: Vec<String>,
    /// Index checked key-by-key; only the first name is used
    pub clean_list: Vec<String>,
    pub progress_interval: Duration,
}

impl VerifyConfig {
    pub fn new(base_dn: Dn) -> Self {
        Self {
            base_dn,
            complete_list: Vec::new(),
            clean_list: Vec::new(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn complete(mut self, names: &[&str]) -> Self {
        self.complete_list = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn clean(mut self, name: &str) -> Self {
        self.clean_list = vec![name.to_string()];
        self
    }
}
