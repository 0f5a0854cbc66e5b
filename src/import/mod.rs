//! Import Module
//!
//! Bulk loading of entries (LDIF import) and offline index rebuilds. Both
//! run the same two-phase pipeline.
//!
//! ## Pipeline
//! ```text
//!  ┌───────────────────────────────────────────────────────────────────┐
//!  │ Setup                                                             │
//!  │   memory plan, DN cache, migration of kept entries, clear targets │
//!  │   every target index marked untrusted                             │
//!  ├───────────────────────────────────────────────────────────────────┤
//!  │ Phase one                                                         │
//!  │   workers: entry ──► index keys ──► sorted buffers                │
//!  │   scratch writers: buffers ──► one sorted run per batch           │
//!  ├───────────────────────────────────────────────────────────────────┤
//!  │ Phase two                                                         │
//!  │   per scratch file: N-way merge of its runs ──► target index      │
//!  ├───────────────────────────────────────────────────────────────────┤
//!  │ Finish: targets marked trusted, environment synced                │
//!  └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Any failure cancels the whole pipeline; targets stay untrusted. A full
//! disk reported by the [`DiskSpaceMonitor`] surfaces as
//! [`DirError::DiskSpace`] naming the phase.

mod dn_cache;
mod id_set;
mod index_key;
mod input_buffer;
mod memory;
mod monitor;
mod output_buffer;
mod permits;
mod phase_one;
mod phase_two;
mod rebuild;
mod scratch;
mod source;

pub use dn_cache::{fnv1a_64, DnCache};
pub use id_set::KeyDelta;
pub use index_key::{ImportTarget, IndexKey, IndexKind, IndexRegistry, RegisteredIndex};
pub use memory::{
    plan_buffers, plan_read_ahead, usable_memory, BufferPlan, MemoryParams, ReadAheadPlan, MAX_BUFFER_SIZE,
    MIN_BUFFER_SIZE, MIN_READ_AHEAD_CACHE_SIZE, READER_WRITER_BUFFER_SIZE,
};
pub use monitor::{
    CancellationToken, DiskSpaceHandler, DiskSpaceMonitor, ImportCounters, ImportListener, ImportPhase,
    ManualDiskMonitor, ProgressReporter,
};
pub use output_buffer::{ImportRecord, OutputBuffer};
pub use permits::{PermitGuard, Permits};
pub use phase_two::DN_STATE_CACHE_SIZE;
pub use rebuild::{RebuildManager, RebuildResult};
pub use scratch::{ScratchFile, ScratchRecord, ScratchWriter};
pub use source::{
    write_ldif_entry, ChainedSource, EntryFileSource, EntryFileWriter, EntrySource, Id2EntrySource, LdifReader,
    SourceEntry,
};

use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, info_span, warn};

use crate::config::ImportConfig;
use crate::container::{EntryContainer, RootContainer};
use crate::dn::Dn;
use crate::error::{DirError, Result};
use crate::idset::EntryId;
use crate::index::{Index, Indexer};

use monitor::ImportDiskHandler;
use phase_one::{AttributePlan, ContainerPlan, EntryRules, PhaseOne, PhaseOneSizing};
use phase_two::PhaseTwo;

/// Buffers a scratch writer takes from its queue per run, past the first
pub const DRAIN_TO: usize = 3;

/// Totals of one import
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportResult {
    pub entries_read: u64,
    pub entries_imported: u64,
    pub entries_rejected: u64,
    pub entries_ignored: u64,
    pub entries_migrated: u64,
    /// Sorted scratch runs written by phase one
    pub runs_written: u64,
    /// Run batches merged by phase two; above the scratch file count when
    /// read-ahead memory forced a file to merge in several passes
    pub merge_batches: u64,
    pub elapsed: Duration,
}

impl ImportResult {
    fn from_counters(counters: &ImportCounters, elapsed: Duration) -> Self {
        Self {
            entries_read: ImportCounters::get(&counters.entries_read),
            entries_imported: ImportCounters::get(&counters.entries_imported),
            entries_rejected: ImportCounters::get(&counters.entries_rejected),
            entries_ignored: ImportCounters::get(&counters.entries_ignored),
            entries_migrated: ImportCounters::get(&counters.entries_migrated),
            runs_written: ImportCounters::get(&counters.runs_written),
            merge_batches: ImportCounters::get(&counters.merge_batches),
            elapsed,
        }
    }

    /// Imported entries per second
    pub fn rate(&self) -> f64 {
        self.entries_imported as f64 / self.elapsed.as_secs_f64().max(0.001)
    }
}

// =============================================================================
// Shared pipeline driver
// =============================================================================

/// Everything both phases need besides the plans
pub(crate) struct Pipeline {
    pub tmp_dir: PathBuf,
    pub data_dir: PathBuf,
    pub thread_count: usize,
    pub progress_interval: Duration,
    pub cancel: CancellationToken,
    pub counters: Arc<ImportCounters>,
    pub listener: Option<Arc<dyn ImportListener>>,
    pub disk_monitor: Option<Arc<dyn DiskSpaceMonitor>>,
}

impl Pipeline {
    /// Create an empty scratch directory
    pub(crate) fn prepare_tmp_dir(&self) -> Result<()> {
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        fs::create_dir_all(&self.tmp_dir)?;
        Ok(())
    }

    pub(crate) fn remove_tmp_dir(&self) {
        if let Err(e) = fs::remove_dir_all(&self.tmp_dir) {
            if self.tmp_dir.exists() {
                warn!(dir = %self.tmp_dir.display(), error = %e, "Could not remove scratch directory");
            }
        }
    }

    fn notify(&self, handler: &ImportDiskHandler, phase: ImportPhase) {
        handler.set_phase(phase);
        if let Some(listener) = &self.listener {
            listener.phase_started(phase);
        }
    }

    /// Run phase one and phase two
    pub(crate) fn run(
        &self,
        plans: Vec<ContainerPlan>,
        registry: Arc<IndexRegistry>,
        rules: Option<EntryRules>,
        source: Box<dyn EntrySource>,
        dn_cache: Option<DnCache>,
        params: MemoryParams,
    ) -> Result<()> {
        let handler = Arc::new(ImportDiskHandler::new(self.cancel.clone()));
        if let Some(monitor) = &self.disk_monitor {
            monitor.register(&self.tmp_dir, handler.clone());
            monitor.register(&self.data_dir, handler.clone());
        }
        let result = self.run_phases(&handler, plans, registry, rules, source, dn_cache, params);
        if let Some(monitor) = &self.disk_monitor {
            monitor.deregister(&self.tmp_dir);
            monitor.deregister(&self.data_dir);
        }
        match result {
            Err(DirError::Canceled) => Err(handler.failure().unwrap_or(DirError::Canceled)),
            Err(e) => Err(e),
            Ok(()) => {
                // A full disk reported after the last check still fails the run
                match handler.failure() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phases(
        &self,
        handler: &ImportDiskHandler,
        plans: Vec<ContainerPlan>,
        registry: Arc<IndexRegistry>,
        rules: Option<EntryRules>,
        source: Box<dyn EntrySource>,
        dn_cache: Option<DnCache>,
        params: MemoryParams,
    ) -> Result<()> {
        self.notify(handler, ImportPhase::Setup);
        let plan = plan_buffers(&params)?;
        self.cancel.check()?;

        let files = {
            let _span = info_span!("phase_one").entered();
            self.notify(handler, ImportPhase::PhaseOne);
            let started = Instant::now();
            let reporter = ProgressReporter::start(ImportPhase::PhaseOne, self.counters.clone(), self.progress_interval);
            let phase = PhaseOne::new(
                plans,
                registry.clone(),
                rules,
                source,
                dn_cache,
                PhaseOneSizing {
                    threads: plan.thread_count,
                    buffer_size: plan.buffer_size,
                    buffer_count: plan.buffer_count,
                },
                self.tmp_dir.clone(),
                self.cancel.clone(),
                self.counters.clone(),
                self.listener.clone(),
            );
            let files = phase.run();
            reporter.stop();
            let files = files?;
            info!(
                files = files.len(),
                runs = files.iter().map(|f| f.runs).sum::<usize>(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Phase one finished"
            );
            files
        };

        let _span = info_span!("phase_two").entered();
        self.notify(handler, ImportPhase::PhaseTwo);
        if let Err(e) = self.cancel.check() {
            for file in &files {
                file.remove();
            }
            return Err(e);
        }
        let started = Instant::now();
        let runs: Vec<usize> = files.iter().map(|f| f.runs).collect();
        let read_ahead = plan_read_ahead(&plan, &runs, cores());
        let reporter = ProgressReporter::start(ImportPhase::PhaseTwo, self.counters.clone(), self.progress_interval);
        let result = PhaseTwo::new(registry, read_ahead, self.cancel.clone(), self.counters.clone()).run(files);
        reporter.stop();
        result?;
        info!(
            keys = ImportCounters::get(&self.counters.keys_written),
            bytes = ImportCounters::get(&self.counters.bytes_read),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Phase two finished"
        );
        self.notify(handler, ImportPhase::Finished);
        Ok(())
    }
}

pub(crate) fn cores() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Register the given indexers of one attribute
pub(crate) fn attribute_plan(
    registry: &mut IndexRegistry,
    attribute: &str,
    indexers: Vec<(Indexer, Arc<Index>)>,
) -> AttributePlan {
    let slots = indexers
        .into_iter()
        .map(|(indexer, index)| {
            let id = registry.register_index(attribute, &indexer.index_id(), index);
            (indexer, id)
        })
        .collect();
    AttributePlan {
        attribute: attribute.to_string(),
        slots,
    }
}

/// Set the trusted flag of every index and VLV index of a container
pub(crate) fn set_container_trusted(container: &EntryContainer, trusted: bool) {
    for index in container.all_indexes() {
        index.set_trusted(trusted);
    }
    for vlv in container.vlv_indexes() {
        vlv.set_trusted(trusted);
    }
}

// =============================================================================
// Importer
// =============================================================================

/// Loads LDIF into a backend
pub struct Importer<'a> {
    root: &'a RootContainer,
    config: ImportConfig,
    listener: Option<Arc<dyn ImportListener>>,
    disk_monitor: Option<Arc<dyn DiskSpaceMonitor>>,
    cancel: CancellationToken,
}

impl<'a> Importer<'a> {
    pub fn new(root: &'a RootContainer, config: ImportConfig) -> Self {
        Self {
            root,
            config,
            listener: None,
            disk_monitor: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ImportListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_disk_monitor(mut self, monitor: Arc<dyn DiskSpaceMonitor>) -> Self {
        self.disk_monitor = Some(monitor);
        self
    }

    /// Token that cancels this import from another thread
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn import_ldif(&self, path: &Path) -> Result<ImportResult> {
        self.import(Box::new(LdifReader::open(path)?))
    }

    /// Import every entry of `source`
    pub fn import(&self, source: Box<dyn EntrySource>) -> Result<ImportResult> {
        let _span = info_span!("import").entered();
        let started = Instant::now();
        let config = &self.config;
        let threads = if config.thread_count == 0 {
            2 * cores()
        } else {
            config.thread_count
        };
        let pipeline = Pipeline {
            tmp_dir: config
                .tmp_dir
                .clone()
                .unwrap_or_else(|| self.root.config().data_dir.join("import-tmp")),
            data_dir: self.root.config().data_dir.clone(),
            thread_count: threads,
            progress_interval: config.progress_interval,
            cancel: self.cancel.clone(),
            counters: Arc::new(ImportCounters::default()),
            listener: self.listener.clone(),
            disk_monitor: self.disk_monitor.clone(),
        };
        pipeline.prepare_tmp_dir()?;
        let result = self.run(&pipeline, source);
        pipeline.remove_tmp_dir();

        let totals = ImportResult::from_counters(&pipeline.counters, started.elapsed());
        match &result {
            Ok(()) => info!(
                read = totals.entries_read,
                imported = totals.entries_imported,
                rejected = totals.entries_rejected,
                ignored = totals.entries_ignored,
                migrated = totals.entries_migrated,
                elapsed_secs = totals.elapsed.as_secs_f64(),
                rate = totals.rate() as u64,
                "Import finished"
            ),
            Err(e) => warn!(
                read = totals.entries_read,
                imported = totals.entries_imported,
                rejected = totals.entries_rejected,
                error = %e,
                "Import aborted"
            ),
        }
        result.map(|_| totals)
    }

    /// Containers the import writes to
    fn targets(&self) -> Vec<Arc<EntryContainer>> {
        let includes = &self.config.include_branches;
        self.root
            .containers()
            .into_iter()
            .filter(|c| includes.is_empty() || includes.iter().any(|b| c.handles(b) || b.is_ancestor_of(c.base_dn())))
            .collect()
    }

    fn run(&self, pipeline: &Pipeline, source: Box<dyn EntrySource>) -> Result<()> {
        let config = &self.config;
        let targets = self.targets();
        if targets.is_empty() {
            return Err(DirError::Config("no base DN matches the include branches".to_string()));
        }

        // Keep, clear, then untrust
        let mut before = None;
        let mut after = None;
        if !config.append {
            for container in &targets {
                if !config.clear_backend && !container.is_empty() && self.has_branch_rules() {
                    let (b, a) = self.migrate(pipeline, container, before.take(), after.take())?;
                    before = b;
                    after = a;
                }
                container.clear();
            }
        }
        for container in &targets {
            set_container_trusted(container, false);
        }

        let mut registry = IndexRegistry::new();
        let mut plans = Vec::with_capacity(targets.len());
        for container in &targets {
            let dn_target = registry.register_dn(container.clone(), container.subordinate_indexes_enabled());
            let attributes = container
                .attribute_indexes()
                .iter()
                .map(|attr| attribute_plan(&mut registry, attr.attribute_name(), attr.indexers()))
                .collect();
            plans.push(ContainerPlan {
                container: container.clone(),
                dn_target: Some(dn_target),
                attributes,
                vlvs: container.vlv_indexes(),
                write_entries: true,
                write_dn2uri: true,
            });
        }
        let registry = Arc::new(registry);

        let mut chain = ChainedSource::new();
        if let Some(writer) = before {
            chain.push(Box::new(writer.into_source()?));
        }
        chain.push(source);
        if let Some(writer) = after {
            chain.push(Box::new(writer.into_source()?));
        }

        let dn_cache = if config.skip_dn_validation {
            None
        } else {
            Some(DnCache::open(&pipeline.tmp_dir.join("dn-cache"))?)
        };
        let params = MemoryParams {
            total_memory: config.available_memory,
            index_count: registry.index_keys().len(),
            thread_count: pipeline.thread_count,
            needs_dn_cache: dn_cache.is_some(),
            skip_dn_validation: config.skip_dn_validation,
            cleared_backend: !config.append,
            rebuild: false,
        };
        let rules = EntryRules {
            validate_dns: !config.skip_dn_validation,
            append: config.append,
            replace_existing: config.replace_existing,
            include_branches: config.include_branches.clone(),
            exclude_branches: config.exclude_branches.clone(),
        };

        pipeline.run(plans, registry, Some(rules), Box::new(chain), dn_cache, params)?;

        for container in &targets {
            if let Some(highest) = container.id2entry().highest_id()? {
                container.allocator().advance_past(highest);
            }
            set_container_trusted(container, true);
        }
        self.root.sync()?;
        Ok(())
    }

    fn has_branch_rules(&self) -> bool {
        !self.config.include_branches.is_empty() || !self.config.exclude_branches.is_empty()
    }

    /// Spill the entries the import keeps: those outside every include
    /// branch (imported before the LDIF) and those inside an exclude branch
    /// (imported after it). Entries are read in DN order.
    fn migrate(
        &self,
        pipeline: &Pipeline,
        container: &EntryContainer,
        mut before: Option<EntryFileWriter>,
        mut after: Option<EntryFileWriter>,
    ) -> Result<(Option<EntryFileWriter>, Option<EntryFileWriter>)> {
        let includes = &self.config.include_branches;
        let excludes = &self.config.exclude_branches;
        let mut kept = 0u64;
        for (_, id_bytes) in container.dn2id().database().range(Bound::Unbounded, Bound::Unbounded) {
            pipeline.cancel.check()?;
            let id = EntryId::from_bytes(&id_bytes)?;
            let Some(entry) = container.get_entry_by_id(id)? else {
                continue;
            };
            let dn: &Dn = entry.dn();
            let outside = !includes.is_empty() && !includes.iter().any(|b| dn.is_descendant_of(b));
            let excluded = excludes.iter().any(|b| dn.is_descendant_of(b));
            let slot = if outside {
                &mut before
            } else if excluded {
                &mut after
            } else {
                continue;
            };
            if slot.is_none() {
                let name = if outside { "migrated-before" } else { "migrated-after" };
                *slot = Some(EntryFileWriter::create(&pipeline.tmp_dir.join(name))?);
            }
            if let Some(writer) = slot.as_mut() {
                writer.append(&entry)?;
                kept += 1;
            }
        }
        info!(base_dn = %container.base_dn(), entries = kept, "Migrating existing entries");
        Ok((before, after))
    }
}
