//! dirstore admin tool
//!
//! Offline maintenance of a backend: index rebuild, verification, searches
//! and index listing.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dirstore::import::write_ldif_entry;
use dirstore::{
    Config, Dn, Filter, IndexConfig, RebuildConfig, RebuildManager, RebuildMode, RootContainer, Schema, SearchRequest,
    SearchScope, SortOrder, VerifyConfig, VerifyJob, VlvIndexConfig, VlvRequest,
};
use tracing_subscriber::{fmt, EnvFilter};

/// dirstore admin
#[derive(Parser, Debug)]
#[command(name = "dirstore-admin")]
#[command(about = "Maintenance tool for dirstore backends")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./dirstore_data")]
    data_dir: PathBuf,

    /// Base DN served by the backend (repeatable)
    #[arg(short, long = "base-dn", required = true)]
    base_dns: Vec<Dn>,

    /// Index definition, e.g. "cn:equality,substring" (repeatable)
    #[arg(short, long = "index")]
    indexes: Vec<IndexConfig>,

    /// VLV index as "name|base|scope|filter|sort" (repeatable)
    #[arg(long = "vlv")]
    vlv_indexes: Vec<String>,

    /// Default entry limit of every index
    #[arg(long, default_value = "4000")]
    entry_limit: usize,

    /// Do not maintain id2children / id2subtree
    #[arg(long)]
    no_subordinate_indexes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rebuild indexes from id2entry
    Rebuild {
        /// Base DN whose indexes are rebuilt
        #[arg(long)]
        base: Dn,

        /// Rebuild every index
        #[arg(long, conflicts_with_all = ["degraded", "names"])]
        all: bool,

        /// Rebuild only untrusted indexes
        #[arg(long, conflicts_with = "names")]
        degraded: bool,

        /// Mark untrusted indexes trusted (empty backend only)
        #[arg(long)]
        clear_degraded_state: bool,

        /// Scratch directory
        #[arg(long)]
        tmp_dir: Option<PathBuf>,

        /// Memory available to the rebuild, in MB
        #[arg(short = 'm', long, default_value = "512")]
        memory_mb: u64,

        /// Index names: dn2id, dn2uri, vlv.<name>, <attr>, <attr>.<type>
        names: Vec<String>,
    },

    /// Check index consistency
    Verify {
        /// Base DN to verify
        #[arg(long)]
        base: Dn,

        /// Check key-by-key that this index only references matching entries
        #[arg(long, conflicts_with = "complete")]
        clean: Option<String>,

        /// Indexes to check entry-by-entry (default: all)
        complete: Vec<String>,
    },

    /// Search a base DN
    Search {
        /// Search base
        #[arg(long)]
        base: Dn,

        /// base, one, sub or subordinates
        #[arg(short, long, default_value = "sub")]
        scope: SearchScope,

        /// Sort order, e.g. "sn,-givenName"
        #[arg(long)]
        sort: Option<String>,

        /// VLV window as "before:after:offset:count"
        #[arg(long, requires = "sort")]
        vlv: Option<String>,

        /// Maximum entries returned (0 = unlimited)
        #[arg(short = 'z', long, default_value = "0")]
        size_limit: usize,

        /// Print the index debug trace
        #[arg(long)]
        debug_search_index: bool,

        /// LDAP filter
        #[arg(default_value = "(objectClass=*)")]
        filter: String,
    },

    /// List every index of every base DN
    ListIndexes,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,dirstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> dirstore::Result<()> {
    let mut builder = Config::builder()
        .data_dir(&args.data_dir)
        .base_dns(args.base_dns.clone())
        .index_entry_limit(args.entry_limit)
        .subordinate_indexes_enabled(!args.no_subordinate_indexes);
    if !args.indexes.is_empty() {
        builder = builder.indexes(args.indexes.clone());
    }
    for definition in &args.vlv_indexes {
        builder = builder.vlv_index(parse_vlv(definition)?);
    }
    let root = RootContainer::open(builder.build(), Schema::default_schema())?;

    match args.command {
        Commands::Rebuild {
            base,
            all,
            degraded,
            clear_degraded_state,
            tmp_dir,
            memory_mb,
            names,
        } => {
            let mode = if all {
                RebuildMode::All
            } else if degraded {
                RebuildMode::Degraded
            } else if names.is_empty() {
                return Err(dirstore::DirError::Config(
                    "name the indexes to rebuild, or pass --all or --degraded".to_string(),
                ));
            } else {
                RebuildMode::UserDefined(names)
            };
            let mut config = RebuildConfig::new(base, mode)
                .with_available_memory(memory_mb * 1024 * 1024)
                .with_clear_degraded_state(clear_degraded_state);
            if let Some(dir) = tmp_dir {
                config = config.with_tmp_dir(dir);
            }
            let result = RebuildManager::new(&root, config).rebuild()?;
            println!(
                "Rebuilt {} indexes over {} entries in {:.1}s ({:.0}/s)",
                result.indexes.len(),
                result.entries_processed,
                result.elapsed.as_secs_f64(),
                result.rate()
            );
            for name in &result.indexes {
                println!("  {}", name);
            }
        }

        Commands::Verify { base, clean, complete } => {
            let mut config = VerifyConfig::new(base);
            config.complete_list = complete;
            if let Some(name) = clean {
                config.clean_list = vec![name];
            }
            let result = VerifyJob::new(&root, config).verify()?;
            println!(
                "Checked {} keys, found {} errors in {:.1}s",
                result.key_count,
                result.error_count,
                result.elapsed.as_secs_f64()
            );
            if result.clean_mode {
                println!(
                    "  multiple references: {}, over entry limit: {}, average references: {}, max references: {}",
                    result.multi_reference_count,
                    result.entry_limit_exceeded_count,
                    result.average_references(),
                    result.max_entry_per_value
                );
            }
            for stats in &result.entry_limit_stats {
                println!(
                    "  {}: {} keys over limit (min {}, max {}, median {})",
                    stats.index, stats.keys, stats.min, stats.max, stats.median
                );
            }
            if !result.is_clean() {
                std::process::exit(2);
            }
        }

        Commands::Search {
            base,
            scope,
            sort,
            vlv,
            size_limit,
            debug_search_index,
            filter,
        } => {
            let container = root
                .container_for(&base)
                .ok_or_else(|| dirstore::DirError::NoSuchEntry(base.to_string()))?;
            let mut request = SearchRequest::new(base, scope, Filter::parse(&filter)?)
                .with_size_limit(size_limit)
                .with_debug(debug_search_index);
            if let Some(sort) = sort {
                request = request.with_sort(SortOrder::parse(&sort)?);
            }
            if let Some(window) = vlv {
                request = request.with_vlv(parse_window(&window)?);
            }
            let result = container.search(&request)?;

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for entry in &result.entries {
                write_ldif_entry(&mut out, entry)?;
                writeln!(out)?;
            }
            if let Some(debug) = &result.debug {
                writeln!(out, "# debugsearchindex: {}", debug)?;
            }
            if let Some(response) = &result.vlv_response {
                writeln!(out, "# vlv: {:?}", response)?;
            }
            writeln!(
                out,
                "# {} entries{}",
                result.entries.len(),
                if result.indexed { "" } else { " (unindexed)" }
            )?;
        }

        Commands::ListIndexes => {
            for container in root.containers() {
                println!("{} ({} entries)", container.base_dn(), container.entry_count());
                for name in container.index_names() {
                    println!("  {}", name);
                }
            }
        }
    }
    Ok(())
}

fn parse_vlv(definition: &str) -> dirstore::Result<VlvIndexConfig> {
    let parts: Vec<&str> = definition.split('|').collect();
    let [name, base, scope, filter, sort] = parts.as_slice() else {
        return Err(dirstore::DirError::Config(format!(
            "VLV index '{}' must be name|base|scope|filter|sort",
            definition
        )));
    };
    VlvIndexConfig::new(name, base, scope.parse()?, filter, sort)
}

fn parse_window(window: &str) -> dirstore::Result<VlvRequest> {
    let numbers = window
        .split(':')
        .map(|p| p.trim().parse::<i64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| dirstore::DirError::InvalidVlvRequest(format!("malformed VLV window '{}'", window)))?;
    let [before, after, offset, count] = numbers.as_slice() else {
        return Err(dirstore::DirError::InvalidVlvRequest(format!(
            "VLV window '{}' must be before:after:offset:count",
            window
        )));
    };
    Ok(VlvRequest::ByOffset {
        before_count: (*before).max(0) as usize,
        after_count: (*after).max(0) as usize,
        offset: *offset,
        content_count: (*count).max(0) as usize,
    })
}
