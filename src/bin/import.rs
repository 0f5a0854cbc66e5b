//! dirstore LDIF import
//!
//! Bulk loads an LDIF file into a backend.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dirstore::{Config, Dn, ImportConfig, Importer, IndexConfig, RootContainer, Schema};
use tracing_subscriber::{fmt, EnvFilter};

/// dirstore LDIF import
#[derive(Parser, Debug)]
#[command(name = "dirstore-import")]
#[command(about = "Import an LDIF file into a dirstore backend")]
#[command(version)]
struct Args {
    /// LDIF file to import
    ldif: PathBuf,

    /// Data directory
    #[arg(short, long, default_value = "./dirstore_data")]
    data_dir: PathBuf,

    /// Base DN served by the backend (repeatable)
    #[arg(short, long = "base-dn", required = true)]
    base_dns: Vec<Dn>,

    /// Index definition, e.g. "cn:equality,substring" (repeatable)
    #[arg(short, long = "index")]
    indexes: Vec<IndexConfig>,

    /// Default entry limit of every index
    #[arg(long, default_value = "4000")]
    entry_limit: usize,

    /// Do not maintain id2children / id2subtree
    #[arg(long)]
    no_subordinate_indexes: bool,

    /// Phase-one worker threads (0 = twice the CPU count)
    #[arg(short, long, default_value = "0")]
    threads: usize,

    /// Scratch directory
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Memory available to the import, in MB
    #[arg(short = 'm', long, default_value = "512")]
    memory_mb: u64,

    /// Skip parent and duplicate DN checks
    #[arg(long)]
    skip_dn_validation: bool,

    /// Keep existing entries
    #[arg(long)]
    append: bool,

    /// With --append, replace entries that already exist
    #[arg(long, requires = "append")]
    replace_existing: bool,

    /// Drop every existing entry of the targeted base DNs
    #[arg(long)]
    clear_backend: bool,

    /// Only import entries below this branch (repeatable)
    #[arg(long = "include-branch")]
    include_branches: Vec<Dn>,

    /// Skip entries below this branch (repeatable)
    #[arg(long = "exclude-branch")]
    exclude_branches: Vec<Dn>,

    /// Seconds between progress reports
    #[arg(long, default_value = "10")]
    progress_secs: u64,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,dirstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("dirstore import v{}", dirstore::VERSION);
    tracing::info!("Data directory: {}", args.data_dir.display());
    tracing::info!("LDIF file: {}", args.ldif.display());

    let mut builder = Config::builder()
        .data_dir(&args.data_dir)
        .base_dns(args.base_dns.clone())
        .index_entry_limit(args.entry_limit)
        .subordinate_indexes_enabled(!args.no_subordinate_indexes);
    if !args.indexes.is_empty() {
        builder = builder.indexes(args.indexes.clone());
    }
    let config = builder.build();

    let root = match RootContainer::open(config, Schema::default_schema()) {
        Ok(root) => root,
        Err(e) => {
            tracing::error!("Failed to open backend: {}", e);
            std::process::exit(1);
        }
    };

    let mut import = ImportConfig::builder()
        .thread_count(args.threads)
        .skip_dn_validation(args.skip_dn_validation)
        .append(args.append)
        .replace_existing(args.replace_existing)
        .clear_backend(args.clear_backend)
        .available_memory(args.memory_mb * 1024 * 1024)
        .progress_interval(Duration::from_secs(args.progress_secs.max(1)));
    if let Some(dir) = &args.tmp_dir {
        import = import.tmp_dir(dir);
    }
    for dn in args.include_branches {
        import = import.include_branch(dn);
    }
    for dn in args.exclude_branches {
        import = import.exclude_branch(dn);
    }

    match Importer::new(&root, import.build()).import_ldif(&args.ldif) {
        Ok(result) => {
            println!(
                "Processed {} entries: {} imported, {} rejected, {} skipped, {} migrated in {:.1}s ({:.0}/s)",
                result.entries_read,
                result.entries_imported,
                result.entries_rejected,
                result.entries_ignored,
                result.entries_migrated,
                result.elapsed.as_secs_f64(),
                result.rate()
            );
        }
        Err(e) => {
            tracing::error!("Import failed: {}", e);
            std::process::exit(1);
        }
    }
}
