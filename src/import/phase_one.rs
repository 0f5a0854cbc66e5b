//! Phase one: entries in, sorted scratch runs out
//!
//! ```text
//!                 ┌──────────────┐
//!  EntrySource ──►│ worker 1..N  │── full buffer, sorted ──► queue[index key] ──► scratch writer
//!   (shared,      │ per-key      │                                                  │
//!    locked)      │ buffers      │◄────────────── free pool ◄───────────────────────┘
//!                 └──────────────┘
//! ```
//!
//! ## Concurrency:
//! - the source and the DN checks run under one mutex, so DN validation
//!   sees entries in stream order
//! - every worker owns one buffer per scratch file; a full buffer is sorted
//!   by the worker itself and queued, keeping each worker's buffers in fill
//!   order on the queue
//! - scratch writers are spawned on the first buffer for their key and stop
//!   on the poison buffer
//! - buffers come from a bounded pool; workers block when it is empty

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Scope};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::container::EntryContainer;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::idset::EntryId;
use crate::index::Indexer;
use crate::vlv::VlvIndex;

use super::dn_cache::DnCache;
use super::index_key::{IndexKey, IndexRegistry};
use super::memory::min_pool_buffers;
use super::monitor::{CancellationToken, ImportCounters, ImportListener};
use super::output_buffer::OutputBuffer;
use super::scratch::{run_writer, ScratchFile, ScratchWriter};
use super::source::{EntrySource, SourceEntry};
use super::DRAIN_TO;

const POOL_POLL: Duration = Duration::from_millis(100);

// =============================================================================
// Plan
// =============================================================================

/// What phase one produces for one container
pub(crate) struct ContainerPlan {
    pub container: Arc<EntryContainer>,
    /// Registry ID of the container's DN target
    pub dn_target: Option<u32>,
    pub attributes: Vec<AttributePlan>,
    pub vlvs: Vec<Arc<VlvIndex>>,
    /// Write id2entry (imports) or leave it alone (rebuilds)
    pub write_entries: bool,
    pub write_dn2uri: bool,
}

/// Indexers of one attribute and their registry IDs
pub(crate) struct AttributePlan {
    pub attribute: String,
    pub slots: Vec<(Indexer, u32)>,
}

/// DN and scope rules of an LDIF import. Rebuilds run without rules.
#[derive(Debug, Clone, Default)]
pub(crate) struct EntryRules {
    pub validate_dns: bool,
    pub append: bool,
    pub replace_existing: bool,
    pub include_branches: Vec<Dn>,
    pub exclude_branches: Vec<Dn>,
}

/// Sizing of the phase
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhaseOneSizing {
    pub threads: usize,
    pub buffer_size: usize,
    pub buffer_count: usize,
}

struct SharedSource {
    source: Box<dyn EntrySource>,
    dn_cache: Option<DnCache>,
}

/// An entry that passed validation
struct Prepared {
    entry: Entry,
    id: EntryId,
    plan: usize,
    /// Stored entry being replaced under the same ID
    old: Option<Entry>,
    migrated: bool,
}

// =============================================================================
// Buffer pool and writers
// =============================================================================

struct BufferPool {
    free_tx: Sender<OutputBuffer>,
    free_rx: Receiver<OutputBuffer>,
    created: AtomicUsize,
    limit: usize,
    buffer_size: usize,
}

impl BufferPool {
    fn new(limit: usize, buffer_size: usize) -> Self {
        let (free_tx, free_rx) = channel::bounded(limit);
        Self {
            free_tx,
            free_rx,
            created: AtomicUsize::new(0),
            limit,
            buffer_size,
        }
    }

    /// A free buffer, allocating until the limit and blocking after it
    fn take(&self, cancel: &CancellationToken) -> Result<OutputBuffer> {
        if let Ok(buffer) = self.free_rx.try_recv() {
            return Ok(buffer);
        }
        let grew = self
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.limit).then_some(n + 1))
            .is_ok();
        if grew {
            return Ok(OutputBuffer::new(self.buffer_size));
        }
        loop {
            cancel.check()?;
            match self.free_rx.recv_timeout(POOL_POLL) {
                Ok(buffer) => return Ok(buffer),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(DirError::Canceled),
            }
        }
    }

    fn give_back(&self, mut buffer: OutputBuffer) {
        buffer.reset();
        // The channel holds `limit` buffers, so only a closed pool refuses one
        if let Err(e) = self.free_tx.try_send(buffer) {
            debug!(error = %e, "Dropped a buffer returned to the pool");
        }
    }
}

/// Lazily spawned scratch writers, one per index key
struct Writers {
    senders: Mutex<Vec<Option<Sender<OutputBuffer>>>>,
    results_tx: Mutex<Option<Sender<Result<ScratchFile>>>>,
    results_rx: Receiver<Result<ScratchFile>>,
}

impl Writers {
    fn new(files: usize) -> Self {
        let (results_tx, results_rx) = channel::unbounded();
        Self {
            senders: Mutex::new(vec![None; files]),
            results_tx: Mutex::new(Some(results_tx)),
            results_rx,
        }
    }
}

// =============================================================================
// Phase one
// =============================================================================

pub(crate) struct PhaseOne {
    plans: Vec<ContainerPlan>,
    registry: Arc<IndexRegistry>,
    keys: Vec<IndexKey>,
    /// Registry ID to scratch file slot
    slot_of: Vec<usize>,
    rules: Option<EntryRules>,
    sizing: PhaseOneSizing,
    tmp_dir: PathBuf,
    source: Mutex<SharedSource>,
    pool: BufferPool,
    writers: Writers,
    sequence: AtomicU64,
    cancel: CancellationToken,
    counters: Arc<ImportCounters>,
    listener: Option<Arc<dyn ImportListener>>,
}

impl PhaseOne {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        plans: Vec<ContainerPlan>,
        registry: Arc<IndexRegistry>,
        rules: Option<EntryRules>,
        source: Box<dyn EntrySource>,
        dn_cache: Option<DnCache>,
        sizing: PhaseOneSizing,
        tmp_dir: PathBuf,
        cancel: CancellationToken,
        counters: Arc<ImportCounters>,
        listener: Option<Arc<dyn ImportListener>>,
    ) -> Self {
        let keys = registry.index_keys();
        let slot_of = registry
            .iter()
            .map(|r| keys.iter().position(|k| k == &r.key).unwrap_or(0))
            .collect();
        let threads = sizing.threads.max(1);
        let minimum = min_pool_buffers(keys.len(), threads);
        let buffer_count = if sizing.buffer_count < minimum {
            warn!(
                planned = sizing.buffer_count,
                buffers = minimum,
                "Raising the buffer pool above the memory plan"
            );
            minimum
        } else {
            sizing.buffer_count
        };
        Self {
            pool: BufferPool::new(buffer_count, sizing.buffer_size),
            writers: Writers::new(keys.len()),
            plans,
            registry,
            slot_of,
            rules,
            sizing: PhaseOneSizing {
                threads,
                buffer_count,
                ..sizing
            },
            tmp_dir,
            source: Mutex::new(SharedSource { source, dn_cache }),
            keys,
            sequence: AtomicU64::new(0),
            cancel,
            counters,
            listener,
        }
    }

    /// Run every worker to the end of the source and close the scratch files
    pub(crate) fn run(&self) -> Result<Vec<ScratchFile>> {
        debug!(
            threads = self.sizing.threads,
            buffers = self.sizing.buffer_count,
            buffer_size = self.sizing.buffer_size,
            files = self.keys.len(),
            "Starting phase one workers"
        );
        let mut failure: Option<DirError> = None;
        let files = thread::scope(|s| {
            let mut handles = Vec::with_capacity(self.sizing.threads);
            for i in 0..self.sizing.threads {
                let spawned = thread::Builder::new()
                    .name(format!("import-worker-{}", i))
                    .spawn_scoped(s, move || self.worker(s));
                match spawned {
                    Ok(h) => handles.push(h),
                    Err(e) => {
                        self.cancel.cancel();
                        keep_error(&mut failure, e.into());
                    }
                }
            }
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => keep_error(&mut failure, e),
                    Err(_) => {
                        self.cancel.cancel();
                        keep_error(&mut failure, DirError::ThreadPanicked("import worker".to_string()));
                    }
                }
            }

            // Stop the writers and gather their files
            for sender in self.writers.senders.lock().iter_mut() {
                if let Some(tx) = sender.take() {
                    let _ = tx.send(OutputBuffer::poison());
                }
            }
            self.writers.results_tx.lock().take();
            let mut files = Vec::new();
            for result in self.writers.results_rx.iter() {
                match result {
                    Ok(file) => files.push(file),
                    Err(e) => keep_error(&mut failure, e),
                }
            }
            files
        });
        match failure {
            Some(e) => {
                for file in &files {
                    file.remove();
                }
                Err(e)
            }
            None => Ok(files),
        }
    }

    fn worker<'scope, 'env>(&'scope self, s: &'scope Scope<'scope, 'env>) -> Result<()> {
        let mut buffers: Vec<Option<OutputBuffer>> = (0..self.keys.len()).map(|_| None).collect();
        let result = (|| -> Result<()> {
            while let Some(prepared) = self.next_prepared()? {
                self.cancel.check()?;
                self.process(&mut buffers, prepared, s)?;
            }
            for slot in 0..buffers.len() {
                if let Some(buffer) = buffers[slot].take() {
                    if buffer.is_empty() {
                        self.pool.give_back(buffer);
                    } else {
                        self.hand_off(slot, buffer, s)?;
                    }
                }
            }
            Ok(())
        })();
        if result.is_err() {
            self.cancel.cancel();
            for buffer in buffers.into_iter().flatten() {
                self.pool.give_back(buffer);
            }
        }
        result
    }

    // =========================================================================
    // Reading and validation
    // =========================================================================

    fn next_prepared(&self) -> Result<Option<Prepared>> {
        let mut shared = self.source.lock();
        loop {
            self.cancel.check()?;
            let item = match shared.source.next_entry() {
                Ok(Some(item)) => item,
                Ok(None) => return Ok(None),
                Err(DirError::EntryRejected(reason)) => {
                    ImportCounters::incr(&self.counters.entries_read);
                    self.reject("", &reason);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !item.migrated {
                ImportCounters::incr(&self.counters.entries_read);
            }
            let dn = item.entry.dn().to_string();
            match self.prepare(&shared, item) {
                Ok(Some(p)) => return Ok(Some(p)),
                Ok(None) => {
                    ImportCounters::incr(&self.counters.entries_ignored);
                }
                Err(DirError::EntryRejected(reason)) => self.reject(&dn, &reason),
                Err(e) => return Err(e),
            }
        }
    }

    fn reject(&self, dn: &str, reason: &str) {
        ImportCounters::incr(&self.counters.entries_rejected);
        warn!(dn, reason, "Rejected entry");
        if let Some(listener) = &self.listener {
            listener.entry_rejected(dn, reason);
        }
    }

    /// Deepest container holding `dn`
    fn plan_for(&self, dn: &Dn) -> Option<usize> {
        self.plans
            .iter()
            .enumerate()
            .filter(|(_, p)| p.container.handles(dn))
            .max_by_key(|(_, p)| p.container.base_dn().size())
            .map(|(i, _)| i)
    }

    fn prepare(&self, shared: &SharedSource, item: SourceEntry) -> Result<Option<Prepared>> {
        let dn = item.entry.dn().clone();
        let Some(plan) = self.plan_for(&dn) else {
            debug!(dn = %dn, "No container for entry");
            return Ok(None);
        };

        let Some(rules) = &self.rules else {
            let id = item
                .id
                .ok_or_else(|| DirError::Corruption(format!("rebuild source gave no ID for {}", dn)))?;
            return Ok(Some(Prepared {
                entry: item.entry,
                id,
                plan,
                old: None,
                migrated: item.migrated,
            }));
        };

        if !item.migrated {
            if !rules.include_branches.is_empty() && !rules.include_branches.iter().any(|b| dn.is_descendant_of(b)) {
                return Ok(None);
            }
            if rules.exclude_branches.iter().any(|b| dn.is_descendant_of(b)) {
                return Ok(None);
            }
        }

        let container = &self.plans[plan].container;
        let mut existing = None;
        if rules.append {
            if let Some(old_id) = container.entry_id_for_dn(&dn)? {
                if !rules.replace_existing {
                    return Err(DirError::EntryRejected("entry already exists".to_string()));
                }
                existing = Some(old_id);
            }
        }

        if rules.validate_dns {
            if let Some(cache) = &shared.dn_cache {
                if cache.contains(&dn)? {
                    return Err(DirError::EntryRejected("duplicate entry in the import".to_string()));
                }
                if &dn != container.base_dn() {
                    let parent = dn.parent().unwrap_or_default();
                    let known = cache.contains(&parent)?
                        || (rules.append && container.entry_id_for_dn(&parent)?.is_some());
                    if !known {
                        return Err(DirError::EntryRejected(format!("parent entry {} does not exist", parent)));
                    }
                }
            }
        }

        let (id, old) = match existing {
            Some(old_id) => (old_id, container.get_entry_by_id(old_id)?),
            None => (item.id.unwrap_or_else(|| container.allocator().next_id()), None),
        };
        if rules.validate_dns {
            if let Some(cache) = &shared.dn_cache {
                cache.insert(&dn, id)?;
            }
        }
        Ok(Some(Prepared {
            entry: item.entry,
            id,
            plan,
            old,
            migrated: item.migrated,
        }))
    }

    // =========================================================================
    // Record generation
    // =========================================================================

    fn process<'scope, 'env>(
        &'scope self,
        buffers: &mut [Option<OutputBuffer>],
        p: Prepared,
        s: &'scope Scope<'scope, 'env>,
    ) -> Result<()> {
        let plan = &self.plans[p.plan];
        let container = &plan.container;
        let entry = &p.entry;

        if let Some(old) = &p.old {
            for attr in &plan.attributes {
                let values = old.values(&attr.attribute);
                for (indexer, reg) in &attr.slots {
                    for key in indexer.values_to_keys(values) {
                        self.add(buffers, *reg, &key, p.id, false, s)?;
                    }
                }
            }
            for vlv in &plan.vlvs {
                if vlv.include_entry(old) {
                    vlv.update_index(Vec::new(), vec![vlv.sort_values(p.id, old)])?;
                }
            }
        }

        if plan.write_entries {
            container.id2entry().put(p.id, entry)?;
        }
        if plan.write_dn2uri {
            match &p.old {
                Some(old) => container.dn2uri().modify_entry(old, entry)?,
                None => {
                    container.dn2uri().add_entry(entry)?;
                }
            }
        }

        for attr in &plan.attributes {
            let values = entry.values(&attr.attribute);
            if values.is_empty() {
                continue;
            }
            for (indexer, reg) in &attr.slots {
                for key in indexer.values_to_keys(values) {
                    self.add(buffers, *reg, &key, p.id, true, s)?;
                }
            }
        }
        for vlv in &plan.vlvs {
            vlv.insert_entry(p.id, entry)?;
        }
        if p.old.is_none() {
            if let Some(reg) = plan.dn_target {
                let key = container.dn2id().key(entry.dn());
                self.add(buffers, reg, &key, p.id, true, s)?;
            }
        }

        if p.migrated {
            ImportCounters::incr(&self.counters.entries_migrated);
        } else {
            ImportCounters::incr(&self.counters.entries_imported);
        }
        Ok(())
    }

    fn add<'scope, 'env>(
        &'scope self,
        buffers: &mut [Option<OutputBuffer>],
        reg: u32,
        key: &[u8],
        id: EntryId,
        insert: bool,
        s: &'scope Scope<'scope, 'env>,
    ) -> Result<()> {
        let slot = self.slot_of[reg as usize];
        loop {
            if buffers[slot].is_none() {
                buffers[slot] = Some(self.pool.take(&self.cancel)?);
            }
            if let Some(buffer) = buffers[slot].as_mut() {
                if buffer.fits(key, id) {
                    buffer.add(key, id, reg, insert);
                    return Ok(());
                }
            }
            if let Some(full) = buffers[slot].take() {
                self.hand_off(slot, full, s)?;
            }
        }
    }

    /// Sort a full buffer and queue it for its scratch writer
    fn hand_off<'scope, 'env>(
        &'scope self,
        slot: usize,
        mut buffer: OutputBuffer,
        s: &'scope Scope<'scope, 'env>,
    ) -> Result<()> {
        buffer.sort();
        buffer.set_sequence(self.sequence.fetch_add(1, Ordering::Relaxed));
        let sender = self.writer_for(slot, s)?;
        sender.send(buffer).map_err(|_| DirError::Canceled)
    }

    fn writer_for<'scope, 'env>(&'scope self, slot: usize, s: &'scope Scope<'scope, 'env>) -> Result<Sender<OutputBuffer>> {
        let mut senders = self.writers.senders.lock();
        if let Some(tx) = &senders[slot] {
            return Ok(tx.clone());
        }
        let results = self
            .writers
            .results_tx
            .lock()
            .clone()
            .ok_or(DirError::Canceled)?;
        let key = self.keys[slot].clone();
        let writer = ScratchWriter::create(&self.tmp_dir, key.clone(), self.registry.clone())?;
        let (tx, rx) = channel::bounded(DRAIN_TO * 2);
        let free = self.pool.free_tx.clone();
        let cancel = self.cancel.clone();
        let counters = self.counters.clone();
        thread::Builder::new()
            .name(format!("scratch-{}", key))
            .spawn_scoped(s, move || {
                let result = run_writer(writer, rx, free, cancel, counters);
                let _ = results.send(result);
            })?;
        debug!(file = %key, "Started scratch writer");
        senders[slot] = Some(tx.clone());
        Ok(tx)
    }
}

/// Keep the most useful error: a real failure beats a cancellation
pub(crate) fn keep_error(slot: &mut Option<DirError>, e: DirError) {
    match slot {
        None => *slot = Some(e),
        Some(DirError::Canceled) if !matches!(e, DirError::Canceled) => *slot = Some(e),
        Some(_) => {}
    }
}
