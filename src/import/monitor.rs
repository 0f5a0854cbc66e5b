//! Cancellation, disk-space monitoring and progress reporting for the
//! import pipeline.
//!
//! ## Concurrency:
//! - `CancellationToken` is a shared atomic flag checked at the top of every
//!   worker loop
//! - disk-space callbacks may arrive from any thread; they record the phase
//!   and directory, then cancel
//! - the progress reporter runs on its own thread and only reads counters

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::{DirError, Result};

// =============================================================================
// Cancellation
// =============================================================================

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    canceled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// `Err(Canceled)` once canceled
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(DirError::Canceled)
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// Phases
// =============================================================================

/// Stage of an import or rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    Setup,
    PhaseOne,
    PhaseTwo,
    Finished,
}

impl ImportPhase {
    fn as_u8(self) -> u8 {
        match self {
            ImportPhase::Setup => 0,
            ImportPhase::PhaseOne => 1,
            ImportPhase::PhaseTwo => 2,
            ImportPhase::Finished => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ImportPhase::PhaseOne,
            2 => ImportPhase::PhaseTwo,
            3 => ImportPhase::Finished,
            _ => ImportPhase::Setup,
        }
    }
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImportPhase::Setup => "setup",
            ImportPhase::PhaseOne => "phase one",
            ImportPhase::PhaseTwo => "phase two",
            ImportPhase::Finished => "finished",
        })
    }
}

/// Callbacks fired as an import moves through its phases
pub trait ImportListener: Send + Sync {
    fn phase_started(&self, _phase: ImportPhase) {}

    fn entry_rejected(&self, _dn: &str, _reason: &str) {}
}

// =============================================================================
// Disk space monitoring
// =============================================================================

/// Receives threshold notifications for a registered directory
pub trait DiskSpaceHandler: Send + Sync {
    /// Free space dropped below the low threshold
    fn disk_low(&self, dir: &Path, free_bytes: u64);

    /// Free space dropped below the full threshold
    fn disk_full(&self, dir: &Path, free_bytes: u64);

    /// Free space is back above both thresholds
    fn disk_restored(&self, _dir: &Path, _free_bytes: u64) {}
}

/// Watches directories for low and full disk conditions
pub trait DiskSpaceMonitor: Send + Sync {
    fn register(&self, dir: &Path, handler: Arc<dyn DiskSpaceHandler>);

    fn deregister(&self, dir: &Path);
}

/// A monitor driven by explicit free-space reports
///
/// Operators (or tests) call [`ManualDiskMonitor::report_free_space`]; the
/// registered handlers fire when a threshold is crossed.
pub struct ManualDiskMonitor {
    low_threshold: u64,
    full_threshold: u64,
    handlers: Mutex<HashMap<PathBuf, Arc<dyn DiskSpaceHandler>>>,
}

impl ManualDiskMonitor {
    pub fn new(low_threshold: u64, full_threshold: u64) -> Self {
        Self {
            low_threshold,
            full_threshold,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Report the free space of `dir` (and everything below it)
    pub fn report_free_space(&self, dir: &Path, free_bytes: u64) {
        let targets: Vec<(PathBuf, Arc<dyn DiskSpaceHandler>)> = self
            .handlers
            .lock()
            .iter()
            .filter(|(registered, _)| registered.starts_with(dir))
            .map(|(p, h)| (p.clone(), h.clone()))
            .collect();
        for (path, handler) in targets {
            if free_bytes <= self.full_threshold {
                handler.disk_full(&path, free_bytes);
            } else if free_bytes <= self.low_threshold {
                handler.disk_low(&path, free_bytes);
            } else {
                handler.disk_restored(&path, free_bytes);
            }
        }
    }

    /// Report the same free space for every registered directory
    pub fn report_all(&self, free_bytes: u64) {
        let dirs: Vec<PathBuf> = self.handlers.lock().keys().cloned().collect();
        for dir in dirs {
            self.report_free_space(&dir, free_bytes);
        }
    }

    pub fn registered(&self) -> Vec<PathBuf> {
        self.handlers.lock().keys().cloned().collect()
    }
}

impl DiskSpaceMonitor for ManualDiskMonitor {
    fn register(&self, dir: &Path, handler: Arc<dyn DiskSpaceHandler>) {
        self.handlers.lock().insert(dir.to_path_buf(), handler);
    }

    fn deregister(&self, dir: &Path) {
        self.handlers.lock().remove(dir);
    }
}

/// Cancels the pipeline when a watched directory runs out of space
pub(crate) struct ImportDiskHandler {
    cancel: CancellationToken,
    phase: AtomicU8,
    failure: Mutex<Option<(ImportPhase, PathBuf)>>,
}

impl ImportDiskHandler {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            phase: AtomicU8::new(ImportPhase::Setup.as_u8()),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn set_phase(&self, phase: ImportPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn phase(&self) -> ImportPhase {
        ImportPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// The disk failure that canceled the pipeline, if any
    pub(crate) fn failure(&self) -> Option<DirError> {
        self.failure.lock().as_ref().map(|(phase, path)| DirError::DiskSpace {
            phase: phase.to_string(),
            path: path.clone(),
        })
    }
}

impl DiskSpaceHandler for ImportDiskHandler {
    fn disk_low(&self, dir: &Path, free_bytes: u64) {
        warn!(dir = %dir.display(), free_bytes, phase = %self.phase(), "Disk space is low");
    }

    fn disk_full(&self, dir: &Path, free_bytes: u64) {
        let phase = self.phase();
        error!(dir = %dir.display(), free_bytes, phase = %phase, "Disk full, canceling");
        self.failure.lock().get_or_insert_with(|| (phase, dir.to_path_buf()));
        self.cancel.cancel();
    }
}

// =============================================================================
// Progress reporting
// =============================================================================

/// Counters shared between the pipeline and its progress reporter
#[derive(Debug, Default)]
pub struct ImportCounters {
    pub entries_read: AtomicU64,
    pub entries_imported: AtomicU64,
    pub entries_rejected: AtomicU64,
    pub entries_ignored: AtomicU64,
    pub entries_migrated: AtomicU64,
    /// Sorted runs appended to scratch files
    pub runs_written: AtomicU64,
    /// Batches of runs merged in phase two
    pub merge_batches: AtomicU64,
    pub bytes_read: AtomicU64,
    pub keys_written: AtomicU64,
}

impl ImportCounters {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Logs throughput at a fixed interval until stopped
pub struct ProgressReporter {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Start reporting for `phase`
    pub fn start(phase: ImportPhase, counters: Arc<ImportCounters>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name(format!("progress-{}", phase.as_u8()))
            .spawn(move || {
                let started = Instant::now();
                let mut last_entries = 0u64;
                let mut last_bytes = 0u64;
                let mut last_tick = Instant::now();
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    let elapsed = last_tick.elapsed().as_secs_f64().max(0.001);
                    last_tick = Instant::now();
                    match phase {
                        ImportPhase::PhaseTwo => {
                            let bytes = ImportCounters::get(&counters.bytes_read);
                            let keys = ImportCounters::get(&counters.keys_written);
                            info!(
                                phase = %phase,
                                bytes_read = bytes,
                                keys_written = keys,
                                kb_per_sec = ((bytes - last_bytes) as f64 / 1024.0 / elapsed) as u64,
                                "Import progress"
                            );
                            last_bytes = bytes;
                        }
                        _ => {
                            let read = ImportCounters::get(&counters.entries_read);
                            info!(
                                phase = %phase,
                                entries_read = read,
                                imported = ImportCounters::get(&counters.entries_imported),
                                rejected = ImportCounters::get(&counters.entries_rejected),
                                runs = ImportCounters::get(&counters.runs_written),
                                rate = ((read - last_entries) as f64 / elapsed) as u64,
                                elapsed_secs = started.elapsed().as_secs(),
                                "Import progress"
                            );
                            last_entries = read;
                        }
                    }
                }
            })
            .ok();
        Self {
            stop: Some(stop_tx),
            handle,
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
