//! Counting semaphore bounding phase-two read-ahead buffers

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

use super::monitor::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read-ahead buffer budget shared by every phase-two task
#[derive(Debug)]
pub struct Permits {
    total: usize,
    available: Mutex<usize>,
    released: Condvar,
}

impl Permits {
    pub fn new(total: usize) -> Self {
        let total = total.max(1);
        Self {
            total,
            available: Mutex::new(total),
            released: Condvar::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    /// Block until `count` permits are free. Requests above the total are
    /// clamped so a single large file can always proceed alone.
    pub fn acquire(&self, count: usize, cancel: &CancellationToken) -> Result<PermitGuard<'_>> {
        let count = count.clamp(1, self.total);
        let mut available = self.available.lock();
        while *available < count {
            cancel.check()?;
            self.released.wait_for(&mut available, POLL_INTERVAL);
        }
        *available -= count;
        Ok(PermitGuard { permits: self, count })
    }

    fn release(&self, count: usize) {
        let mut available = self.available.lock();
        *available += count;
        self.released.notify_all();
    }
}

/// Returns its permits on drop
#[derive(Debug)]
pub struct PermitGuard<'a> {
    permits: &'a Permits,
    count: usize,
}

impl PermitGuard<'_> {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        self.permits.release(self.count);
    }
}
