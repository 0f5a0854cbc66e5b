//! Memory budget of the import pipeline
//!
//! Splits the memory given to an import between the storage cache, the
//! temporary DN cache and the phase-one output buffers, then sizes the
//! phase-two read-ahead caches from what is left.

use tracing::{info, warn};

use crate::error::{DirError, Result};

use super::DRAIN_TO;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;

/// Largest phase-one buffer
pub const MAX_BUFFER_SIZE: u64 = 2 * MB;
/// Smallest usable phase-one buffer
pub const MIN_BUFFER_SIZE: u64 = 4 * KB;
/// Smallest phase-two read-ahead cache
pub const MIN_READ_AHEAD_CACHE_SIZE: u64 = 2 * KB;
/// I/O buffer held by each scratch writer
pub const READER_WRITER_BUFFER_SIZE: u64 = 8 * KB;

const MAX_DB_CACHE_SIZE: u64 = 8 * MB;
const MAX_DB_LOG_SIZE: u64 = 10 * MB;
const MIN_DB_CACHE_SIZE: u64 = 4 * MB;
const MIN_DB_CACHE_MEMORY: u64 = MAX_DB_CACHE_SIZE + MAX_DB_LOG_SIZE;
const SMALL_HEAP_SIZE: u64 = 256 * MB;

/// Inputs of the phase-one plan
#[derive(Debug, Clone, Copy)]
pub struct MemoryParams {
    /// Memory the operation may use before fudge factors
    pub total_memory: u64,
    /// Distinct scratch files (index keys) the run writes
    pub index_count: usize,
    pub thread_count: usize,
    /// A temporary DN cache is needed (DN validation or rebuild)
    pub needs_dn_cache: bool,
    pub skip_dn_validation: bool,
    /// The target was cleared, so dn2id is not queried
    pub cleared_backend: bool,
    pub rebuild: bool,
}

/// Resulting phase-one sizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPlan {
    /// Memory left after fudge factors
    pub available_memory: u64,
    pub db_cache_size: u64,
    pub dn_cache_size: u64,
    pub buffer_size: usize,
    pub thread_count: usize,
    /// Buffers in the free pool
    pub buffer_count: usize,
}

/// Resulting phase-two sizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAheadPlan {
    pub db_threads: usize,
    pub read_ahead_size: usize,
    /// Total read-ahead buffers that may be open at once
    pub permits: usize,
}

/// Memory usable after fudge factors: 90%, less 25 points on small heaps and
/// 15 more for rebuilds
pub fn usable_memory(total: u64, rebuild: bool) -> u64 {
    let mut pct = 90;
    if total <= SMALL_HEAP_SIZE {
        pct -= 25;
    }
    if rebuild {
        pct -= 15;
    }
    total * pct / 100
}

/// Fewest pool buffers phase one can run with: one per worker and file,
/// plus a full drain batch per scratch writer and one to hand off
pub fn min_pool_buffers(index_count: usize, threads: usize) -> usize {
    threads * index_count + index_count * DRAIN_TO + 1
}

/// Plan the phase-one buffers, lowering the thread count until each buffer
/// is at least [`MIN_BUFFER_SIZE`]
pub fn plan_buffers(params: &MemoryParams) -> Result<BufferPlan> {
    let available = usable_memory(params.total_memory, params.rebuild);
    let index_count = params.index_count as u64;
    let usable = available.saturating_sub(index_count * READER_WRITER_BUFFER_SIZE);

    let (mut db_cache, mut dn_cache) = if params.needs_dn_cache {
        if usable < MIN_DB_CACHE_MEMORY + MIN_DB_CACHE_SIZE {
            (MIN_DB_CACHE_SIZE, MIN_DB_CACHE_SIZE)
        } else if !params.cleared_backend {
            (usable * 33 / 100, usable * 33 / 100)
        } else {
            (MAX_DB_CACHE_SIZE, usable * 66 / 100)
        }
    } else if usable < MIN_DB_CACHE_MEMORY {
        (MIN_DB_CACHE_SIZE, 0)
    } else {
        (MAX_DB_CACHE_SIZE, 0)
    };

    let phase_one_memory = usable.saturating_sub(db_cache + dn_cache);
    let requested_threads = params.thread_count.max(1);
    let mut threads = requested_threads;
    let mut buffer_size = MAX_BUFFER_SIZE;
    let mut buffer_count = 0usize;

    if index_count > 0 {
        loop {
            buffer_count = (2 * params.index_count * threads).max(min_pool_buffers(params.index_count, threads));
            // Scratch writers hold four buffers per index as well
            let total_buffers = (buffer_count + 4 * params.index_count) as u64;
            buffer_size = phase_one_memory / total_buffers;

            if buffer_size > MAX_BUFFER_SIZE {
                if !params.skip_dn_validation {
                    buffer_size = MAX_BUFFER_SIZE;
                    let extra = phase_one_memory - total_buffers * buffer_size;
                    if !params.cleared_backend {
                        db_cache += extra / 2;
                        dn_cache += extra / 2;
                    } else {
                        dn_cache += extra;
                    }
                }
                break;
            } else if buffer_size > MIN_BUFFER_SIZE {
                break;
            } else if threads > 1 {
                threads -= 1;
            } else {
                return Err(DirError::InsufficientMemory {
                    usable,
                    required: total_buffers * MIN_BUFFER_SIZE + db_cache + dn_cache,
                });
            }
        }
    }

    if threads != requested_threads {
        info!(requested = requested_threads, threads, "Adjusted import thread count to fit memory");
    }
    let plan = BufferPlan {
        available_memory: available,
        db_cache_size: db_cache,
        dn_cache_size: dn_cache,
        buffer_size: buffer_size.min(MAX_BUFFER_SIZE) as usize,
        thread_count: threads,
        buffer_count,
    };
    info!(
        available = plan.available_memory,
        buffers = plan.buffer_count,
        buffer_size = plan.buffer_size,
        db_cache = plan.db_cache_size,
        dn_cache = plan.dn_cache_size,
        "Import memory plan"
    );
    Ok(plan)
}

/// Plan phase two. `runs_per_file` holds the number of sorted runs in each
/// scratch file. Threads are reduced until every open run gets at least
/// [`MIN_READ_AHEAD_CACHE_SIZE`]; past that the biggest files are merged in
/// batches.
pub fn plan_read_ahead(plan: &BufferPlan, runs_per_file: &[usize], cores: usize) -> ReadAheadPlan {
    let usable = plan.available_memory.saturating_sub(plan.db_cache_size);
    let mut sorted: Vec<usize> = runs_per_file.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));

    let mut db_threads = cores.max(4);
    let (read_ahead, permits) = loop {
        let limit = db_threads.min(sorted.len());
        let buffers: usize = sorted[..limit].iter().sum::<usize>().max(1);
        let size = usable / buffers as u64;
        if size > plan.buffer_size as u64 {
            break (plan.buffer_size as u64, buffers);
        } else if size > MIN_READ_AHEAD_CACHE_SIZE {
            break (size, buffers);
        } else if db_threads > 1 {
            db_threads -= 1;
        } else {
            let buffers = (usable / MIN_READ_AHEAD_CACHE_SIZE).max(1) as usize;
            warn!(usable, "Not enough memory for phase two, merging in batches");
            break (MIN_READ_AHEAD_CACHE_SIZE, buffers);
        }
    };

    let read_ahead = ReadAheadPlan {
        db_threads: db_threads.max(2),
        read_ahead_size: read_ahead as usize,
        permits,
    };
    info!(
        read_ahead = read_ahead.read_ahead_size,
        permits = read_ahead.permits,
        threads = read_ahead.db_threads,
        "Phase two memory plan"
    );
    read_ahead
}
