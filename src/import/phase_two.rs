//! Phase two: merge every scratch file into its target indexes
//!
//! ```text
//!   scratch files (largest first) ──► task queue ──► db thread 1..N
//!                                                     │ acquire permits
//!                                                     │ open one InputBuffer per run
//!                                                     │ N-way merge by (key, index id)
//!                                                     ▼
//!                                         Index::insert / Index::delete
//!                                         dn2id + id2children / id2subtree
//! ```
//!
//! ## Concurrency:
//! - files are independent; each one is popped from a shared queue and
//!   merged by a single thread
//! - read-ahead buffers are bounded by the shared [`Permits`]; a file with
//!   more runs than permits is merged in consecutive batches of runs
//! - the merge of each key folds runs in write order so the latest
//!   operation on a (key, entry ID) pair wins

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread;

use crossbeam::queue::SegQueue;
use tracing::{debug, trace};

use crate::container::EntryContainer;
use crate::error::{DirError, Result};
use crate::idset::{EntryId, EntryIdSet};
use crate::keycodec;

use super::id_set::KeyDelta;
use super::index_key::{ImportTarget, IndexRegistry};
use super::input_buffer::InputBuffer;
use super::memory::ReadAheadPlan;
use super::monitor::{CancellationToken, ImportCounters};
use super::permits::Permits;
use super::phase_one::keep_error;
use super::scratch::ScratchFile;

/// Parents cached by a [`DnState`] before its subordinate sets are written
pub const DN_STATE_CACHE_SIZE: usize = 64 * 1024;

pub(crate) struct PhaseTwo {
    registry: Arc<IndexRegistry>,
    plan: ReadAheadPlan,
    permits: Permits,
    cancel: CancellationToken,
    counters: Arc<ImportCounters>,
}

impl PhaseTwo {
    pub(crate) fn new(
        registry: Arc<IndexRegistry>,
        plan: ReadAheadPlan,
        cancel: CancellationToken,
        counters: Arc<ImportCounters>,
    ) -> Self {
        Self {
            permits: Permits::new(plan.permits),
            registry,
            plan,
            cancel,
            counters,
        }
    }

    /// Merge every file, largest first. Files are deleted once applied.
    pub(crate) fn run(&self, mut files: Vec<ScratchFile>) -> Result<()> {
        files.sort_by(|a, b| b.bytes.cmp(&a.bytes));
        let queue = SegQueue::new();
        files.into_iter().for_each(|file| queue.push(file));

        let threads = self.plan.db_threads.max(1);
        debug!(
            threads,
            permits = self.permits.total(),
            read_ahead = self.plan.read_ahead_size,
            "Starting phase two"
        );
        let mut failure: Option<DirError> = None;
        thread::scope(|s| {
            let mut handles = Vec::with_capacity(threads);
            for i in 0..threads {
                let queue = &queue;
                let spawned = thread::Builder::new()
                    .name(format!("import-db-{}", i))
                    .spawn_scoped(s, move || -> Result<()> {
                        while let Some(file) = queue.pop() {
                            if let Err(e) = self.cancel.check().and_then(|_| self.merge_file(&file)) {
                                self.cancel.cancel();
                                file.remove();
                                return Err(e);
                            }
                            file.remove();
                        }
                        Ok(())
                    });
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
                        keep_error(&mut failure, DirError::ThreadPanicked("import db thread".to_string()));
                    }
                }
            }
        });
        // Files left in the queue after a failure
        while let Some(file) = queue.pop() {
            file.remove();
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn merge_file(&self, file: &ScratchFile) -> Result<()> {
        let offsets = file.read_offsets()?;
        let mut dn_states: HashMap<u32, DnState> = HashMap::new();
        let mut start = 0;
        while start < offsets.len() {
            self.cancel.check()?;
            let permits = self.permits.acquire(offsets.len() - start, &self.cancel)?;
            let end = start + permits.count();
            let mut inputs = Vec::with_capacity(end - start);
            for run in start..end {
                inputs.push(InputBuffer::open(
                    &file.data_path,
                    run,
                    offsets[run],
                    self.plan.read_ahead_size,
                    self.counters.clone(),
                )?);
            }
            let keys = self.merge_runs(&mut inputs, &mut dn_states)?;
            ImportCounters::incr(&self.counters.merge_batches);
            trace!(file = %file.key, runs = end - start, keys, "Merged scratch runs");
            start = end;
        }
        for state in dn_states.values_mut() {
            state.flush()?;
        }
        debug!(file = %file.key, runs = offsets.len(), "Applied scratch file");
        Ok(())
    }

    /// N-way merge of one batch of runs; returns the number of keys applied
    fn merge_runs(&self, inputs: &mut [InputBuffer], dn_states: &mut HashMap<u32, DnState>) -> Result<u64> {
        let mut heap: BinaryHeap<Reverse<(Vec<u8>, u32, usize)>> = BinaryHeap::new();
        for (i, input) in inputs.iter().enumerate() {
            if let Some(record) = input.current() {
                heap.push(Reverse((record.key.clone(), record.index_id, i)));
            }
        }

        let mut keys = 0u64;
        while let Some(Reverse((key, index_id, first))) = heap.pop() {
            if self.cancel.is_canceled() {
                return Err(DirError::Canceled);
            }
            let registered = self
                .registry
                .get(index_id)
                .ok_or_else(|| DirError::Corruption(format!("scratch record for unknown index {}", index_id)))?;
            let mut delta = KeyDelta::new(registered.entry_limit, registered.maintain_count);
            self.fold(&mut inputs[first], first, &mut delta, &mut heap)?;
            while let Some(Reverse((next_key, next_id, _))) = heap.peek() {
                if next_key != &key || *next_id != index_id {
                    break;
                }
                if let Some(Reverse((_, _, i))) = heap.pop() {
                    self.fold(&mut inputs[i], i, &mut delta, &mut heap)?;
                }
            }

            match &registered.target {
                ImportTarget::Index(index) => {
                    if !delta.inserts.is_empty() {
                        index.insert(&key, &delta.inserts)?;
                    }
                    if !delta.deletes.is_empty() {
                        index.delete(&key, &delta.deletes)?;
                    }
                }
                ImportTarget::Dn {
                    container,
                    subordinates,
                } => {
                    dn_states
                        .entry(index_id)
                        .or_insert_with(|| DnState::new(container.clone(), *subordinates))
                        .apply(&key, &delta)?;
                }
            }
            ImportCounters::incr(&self.counters.keys_written);
            keys += 1;
        }
        Ok(keys)
    }

    /// Fold the current record of `input` into `delta` and queue its next one
    fn fold(
        &self,
        input: &mut InputBuffer,
        i: usize,
        delta: &mut KeyDelta,
        heap: &mut BinaryHeap<Reverse<(Vec<u8>, u32, usize)>>,
    ) -> Result<()> {
        if let Some(record) = input.take_current() {
            delta.absorb_sets(&record.inserts, &record.deletes);
        }
        input.advance()?;
        if let Some(next) = input.current() {
            heap.push(Reverse((next.key.clone(), next.index_id, i)));
        }
        Ok(())
    }
}

// =============================================================================
// DN state
// =============================================================================

/// Writes dn2id and accumulates id2children / id2subtree for one container.
///
/// Keys arrive in DN order, so the ancestors of the current entry are the
/// tail of `parents`. A key whose parent is not on the stack (the first key
/// of a batch, or a branch imported earlier) rebuilds the stack from dn2id.
pub(crate) struct DnState {
    container: Arc<EntryContainer>,
    subordinates: bool,
    /// (DN key, entry ID), root first
    parents: Vec<(Vec<u8>, EntryId)>,
    children: BTreeMap<EntryId, EntryIdSet>,
    subtree: BTreeMap<EntryId, EntryIdSet>,
}

impl DnState {
    pub(crate) fn new(container: Arc<EntryContainer>, subordinates: bool) -> Self {
        Self {
            container,
            subordinates,
            parents: Vec::new(),
            children: BTreeMap::new(),
            subtree: BTreeMap::new(),
        }
    }

    pub(crate) fn apply(&mut self, key: &[u8], delta: &KeyDelta) -> Result<()> {
        let container = self.container.clone();
        let dn2id = container.dn2id();
        for id in delta.deletes.iter() {
            if dn2id.get_by_key(key)? == Some(id) {
                dn2id.database().delete(key);
            }
        }
        for id in delta.inserts.iter() {
            dn2id.put_key(key, id);
            if self.subordinates {
                self.index_subordinates(key, id)?;
            }
            self.parents.push((key.to_vec(), id));
        }
        if self.children.len() + self.subtree.len() > DN_STATE_CACHE_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    fn index_subordinates(&mut self, key: &[u8], id: EntryId) -> Result<()> {
        while let Some((top, _)) = self.parents.last() {
            if keycodec::is_descendant_key(top, key) {
                break;
            }
            self.parents.pop();
        }
        let Some(parent) = keycodec::parent_key(key) else {
            // The base entry
            self.parents.clear();
            return Ok(());
        };
        let parent_on_stack = matches!(self.parents.last(), Some((top, _)) if top.as_slice() == parent);
        if !parent_on_stack {
            self.load_ancestors(parent)?;
        }

        let mut immediate = true;
        for (_, ancestor) in self.parents.iter().rev() {
            if immediate {
                self.children.entry(*ancestor).or_default().add(id);
                immediate = false;
            }
            self.subtree.entry(*ancestor).or_default().add(id);
        }
        Ok(())
    }

    /// Replace the stack with the stored ancestor chain of `parent`
    fn load_ancestors(&mut self, parent: &[u8]) -> Result<()> {
        let dn2id = self.container.dn2id();
        let mut chain = Vec::new();
        let mut current = Some(parent);
        while let Some(k) = current {
            match dn2id.get_by_key(k)? {
                Some(id) => chain.push((k.to_vec(), id)),
                None => break,
            }
            current = keycodec::parent_key(k);
        }
        chain.reverse();
        self.parents = chain;
        Ok(())
    }

    /// Write the cached subordinate sets
    pub(crate) fn flush(&mut self) -> Result<()> {
        for (parent, ids) in std::mem::take(&mut self.children) {
            self.container.id2children().insert(&parent.to_bytes(), &ids)?;
        }
        for (ancestor, ids) in std::mem::take(&mut self.subtree) {
            self.container.id2subtree().insert(&ancestor.to_bytes(), &ids)?;
        }
        Ok(())
    }
}
