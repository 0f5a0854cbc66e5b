//! Read-ahead cursor over one sorted run of a scratch file
//!
//! Each buffer owns its file handle and pulls the run into memory in
//! `read_ahead` sized chunks, decoding one [`ScratchRecord`] at a time.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BytesMut};

use crate::error::{DirError, Result};

use super::monitor::ImportCounters;
use super::scratch::ScratchRecord;

const LENGTH_PREFIX: usize = 4;

pub struct InputBuffer {
    file: File,
    /// Next file offset to read
    position: u64,
    end: u64,
    read_ahead: usize,
    cache: BytesMut,
    run: usize,
    current: Option<ScratchRecord>,
    counters: Arc<ImportCounters>,
}

impl InputBuffer {
    /// Open run `run` spanning `[begin, end)` of `path` and load its first record
    pub fn open(
        path: &Path,
        run: usize,
        (begin, end): (u64, u64),
        read_ahead: usize,
        counters: Arc<ImportCounters>,
    ) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(begin))?;
        let mut buffer = Self {
            file,
            position: begin,
            end,
            read_ahead: read_ahead.max(LENGTH_PREFIX),
            cache: BytesMut::new(),
            run,
            current: None,
            counters,
        };
        buffer.advance()?;
        Ok(buffer)
    }

    pub fn run(&self) -> usize {
        self.run
    }

    pub fn current(&self) -> Option<&ScratchRecord> {
        self.current.as_ref()
    }

    pub fn take_current(&mut self) -> Option<ScratchRecord> {
        self.current.take()
    }

    /// Load the next record; `current()` is None once the run is exhausted
    pub fn advance(&mut self) -> Result<()> {
        self.current = None;
        if !self.fill(LENGTH_PREFIX)? {
            return Ok(());
        }
        let len = (&self.cache[..LENGTH_PREFIX]).get_u32_le() as usize;
        if !self.fill(LENGTH_PREFIX + len)? {
            return Err(DirError::Corruption(format!(
                "scratch run {} ends inside a record",
                self.run
            )));
        }
        self.cache.advance(LENGTH_PREFIX);
        let body = self.cache.split_to(len);
        self.current = Some(ScratchRecord::decode(&body)?);
        Ok(())
    }

    /// Make sure `needed` bytes are cached. False when the run holds no more
    /// data at all.
    fn fill(&mut self, needed: usize) -> Result<bool> {
        while self.cache.len() < needed {
            let remaining = self.end.saturating_sub(self.position);
            if remaining == 0 {
                if self.cache.is_empty() {
                    return Ok(false);
                }
                return Err(DirError::Corruption(format!(
                    "scratch run {} has {} trailing bytes",
                    self.run,
                    self.cache.len()
                )));
            }
            let want = self.read_ahead.max(needed - self.cache.len()).min(remaining as usize);
            let start = self.cache.len();
            self.cache.resize(start + want, 0);
            self.file.read_exact(&mut self.cache[start..])?;
            self.position += want as u64;
            self.counters
                .bytes_read
                .fetch_add(want as u64, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(true)
    }
}
