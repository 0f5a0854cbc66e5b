//! Scratch files written at the end of phase one
//!
//! Each [`IndexKey`] gets a data file and an offsets file. Every batch of
//! sorted output buffers is merged into one sorted run of consolidated
//! key records appended to the data file; the offsets file records where
//! each run starts and ends.
//!
//! ## Data file record
//! ```text
//! +-----------+----------+---------+-----+---------+---------+---------+---------+
//! | len (u32) | index id | key len | key | ins len | inserts | del len | deletes |
//! |   (LE)    | (u32 LE) | (packed)|     | (packed)|  (set)  | (packed)|  (set)  |
//! +-----------+----------+---------+-----+---------+---------+---------+---------+
//! ```
//! ## Offsets file
//! ```text
//! +-------------+-----------+-------------+-----------+----
//! | begin (u64) | end (u64) | begin (u64) | end (u64) | ...   little endian
//! +-------------+-----------+-------------+-----------+----
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::error::{DirError, Result};
use crate::idset::EntryIdSet;
use crate::keycodec::{read_packed, write_packed};

use super::id_set::KeyDelta;
use super::index_key::{IndexKey, IndexRegistry};
use super::monitor::{CancellationToken, ImportCounters};
use super::output_buffer::OutputBuffer;
use super::DRAIN_TO;

const OFFSET_PAIR_SIZE: usize = 16;

/// One consolidated key of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchRecord {
    pub index_id: u32,
    pub key: Vec<u8>,
    pub inserts: EntryIdSet,
    pub deletes: EntryIdSet,
}

impl ScratchRecord {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(self.key.len() + 32);
        body.put_u32_le(self.index_id);
        write_packed(&mut body, self.key.len() as u64);
        body.put_slice(&self.key);
        for set in [&self.inserts, &self.deletes] {
            let bytes = set.encode();
            write_packed(&mut body, bytes.len() as u64);
            body.put_slice(&bytes);
        }
        out.put_u32_le(body.len() as u32);
        out.put_slice(&body);
    }

    /// Decode a record body (without its length prefix)
    pub fn decode(mut body: &[u8]) -> Result<Self> {
        if body.remaining() < 4 {
            return Err(DirError::Decode("truncated scratch record".to_string()));
        }
        let index_id = body.get_u32_le();
        let key = take(&mut body)?.to_vec();
        let inserts = EntryIdSet::decode(take(&mut body)?)?;
        let deletes = EntryIdSet::decode(take(&mut body)?)?;
        Ok(Self {
            index_id,
            key,
            inserts,
            deletes,
        })
    }
}

fn take<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_packed(input)? as usize;
    if input.len() < len {
        return Err(DirError::Decode("truncated scratch record field".to_string()));
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    Ok(head)
}

/// A finished scratch file
#[derive(Debug, Clone)]
pub struct ScratchFile {
    pub key: IndexKey,
    pub data_path: PathBuf,
    pub offsets_path: PathBuf,
    pub runs: usize,
    pub bytes: u64,
}

impl ScratchFile {
    /// (begin, end) of every run, in write order
    pub fn read_offsets(&self) -> Result<Vec<(u64, u64)>> {
        let mut raw = Vec::new();
        File::open(&self.offsets_path)?.read_to_end(&mut raw)?;
        if raw.len() % OFFSET_PAIR_SIZE != 0 {
            return Err(DirError::Corruption(format!(
                "offsets file {} has a partial entry",
                self.offsets_path.display()
            )));
        }
        let mut buf = &raw[..];
        let mut out = Vec::with_capacity(raw.len() / OFFSET_PAIR_SIZE);
        while buf.has_remaining() {
            out.push((buf.get_u64_le(), buf.get_u64_le()));
        }
        Ok(out)
    }

    /// Delete both files, returning false when one of them is left behind
    pub fn remove(&self) -> bool {
        let mut removed = true;
        for path in [&self.data_path, &self.offsets_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Could not remove scratch file");
                    removed = false;
                }
            }
        }
        removed
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Appends sorted runs for one index key
pub struct ScratchWriter {
    key: IndexKey,
    registry: Arc<IndexRegistry>,
    data_path: PathBuf,
    offsets_path: PathBuf,
    data: BufWriter<File>,
    offsets: BufWriter<File>,
    position: u64,
    runs: usize,
    scratch: Vec<u8>,
}

impl ScratchWriter {
    pub fn create(dir: &Path, key: IndexKey, registry: Arc<IndexRegistry>) -> Result<Self> {
        let data_path = dir.join(format!("{}.data", key.file_name()));
        let offsets_path = dir.join(format!("{}.offsets", key.file_name()));
        let open = |p: &Path| -> Result<BufWriter<File>> {
            Ok(BufWriter::new(
                OpenOptions::new().create(true).write(true).truncate(true).open(p)?,
            ))
        };
        Ok(Self {
            data: open(&data_path)?,
            offsets: open(&offsets_path)?,
            key,
            registry,
            data_path,
            offsets_path,
            position: 0,
            runs: 0,
            scratch: Vec::new(),
        })
    }

    /// Merge sorted buffers (in fill order) into one run
    pub fn write_run(&mut self, buffers: &[OutputBuffer]) -> Result<u64> {
        let begin = self.position;
        let mut heap: BinaryHeap<Reverse<Cursor<'_>>> = BinaryHeap::new();
        for (buf_idx, buf) in buffers.iter().enumerate() {
            if !buf.is_empty() {
                heap.push(Reverse(Cursor::new(buf, buf_idx, 0)));
            }
        }

        let mut current: Option<(Vec<u8>, u32, KeyDelta)> = None;
        let mut keys = 0u64;
        while let Some(Reverse(cursor)) = heap.pop() {
            let record = cursor.buffer.record(cursor.pos);
            let same = matches!(&current, Some((k, i, _)) if k.as_slice() == record.key && *i == record.index_id);
            if !same {
                if let Some((key, index_id, delta)) = current.take() {
                    self.emit(key, index_id, delta)?;
                    keys += 1;
                }
                let (limit, maintain) = self
                    .registry
                    .get(record.index_id)
                    .map(|r| (r.entry_limit, r.maintain_count))
                    .unwrap_or((0, false));
                current = Some((record.key.to_vec(), record.index_id, KeyDelta::new(limit, maintain)));
            }
            if let Some((_, _, delta)) = current.as_mut() {
                delta.record(record.entry_id, record.insert);
            }
            if cursor.pos + 1 < cursor.buffer.len() {
                heap.push(Reverse(Cursor::new(cursor.buffer, cursor.buf_idx, cursor.pos + 1)));
            }
        }
        if let Some((key, index_id, delta)) = current.take() {
            self.emit(key, index_id, delta)?;
            keys += 1;
        }

        let mut pair = Vec::with_capacity(OFFSET_PAIR_SIZE);
        pair.put_u64_le(begin);
        pair.put_u64_le(self.position);
        self.offsets.write_all(&pair)?;
        self.runs += 1;
        trace!(file = %self.key, run = self.runs, keys, bytes = self.position - begin, "Wrote scratch run");
        Ok(keys)
    }

    fn emit(&mut self, key: Vec<u8>, index_id: u32, delta: KeyDelta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let record = ScratchRecord {
            index_id,
            key,
            inserts: delta.inserts,
            deletes: delta.deletes,
        };
        self.scratch.clear();
        record.encode(&mut self.scratch);
        self.data.write_all(&self.scratch)?;
        self.position += self.scratch.len() as u64;
        Ok(())
    }

    pub fn finish(mut self) -> Result<ScratchFile> {
        self.data.flush()?;
        self.offsets.flush()?;
        Ok(ScratchFile {
            key: self.key,
            data_path: self.data_path,
            offsets_path: self.offsets_path,
            runs: self.runs,
            bytes: self.position,
        })
    }
}

/// Position in one sorted buffer, ordered by (key, index id, fill order)
struct Cursor<'a> {
    buffer: &'a OutputBuffer,
    buf_idx: usize,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buffer: &'a OutputBuffer, buf_idx: usize, pos: usize) -> Self {
        Self { buffer, buf_idx, pos }
    }
}

impl Ord for Cursor<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.buffer.record(self.pos);
        let b = other.buffer.record(other.pos);
        a.key
            .cmp(b.key)
            .then(a.index_id.cmp(&b.index_id))
            .then(self.buffer.sequence().cmp(&other.buffer.sequence()))
            .then(self.buf_idx.cmp(&other.buf_idx))
    }
}

impl PartialOrd for Cursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Cursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cursor<'_> {}

/// Body of a scratch writer thread: drain sorted buffers until the poison
/// buffer arrives, returning every buffer to the free pool
pub(crate) fn run_writer(
    mut writer: ScratchWriter,
    queue: Receiver<OutputBuffer>,
    free_pool: Sender<OutputBuffer>,
    cancel: CancellationToken,
    counters: Arc<ImportCounters>,
) -> Result<ScratchFile> {
    let mut batch: Vec<OutputBuffer> = Vec::with_capacity(DRAIN_TO + 1);
    let mut done = false;
    while !done {
        let first = match queue.recv() {
            Ok(b) => b,
            Err(_) => break,
        };
        batch.push(first);
        while batch.len() <= DRAIN_TO {
            match queue.try_recv() {
                Ok(b) => batch.push(b),
                Err(_) => break,
            }
        }
        if let Some(pos) = batch.iter().position(OutputBuffer::is_poison) {
            batch.truncate(pos);
            done = true;
        }

        if cancel.is_canceled() {
            recycle(&mut batch, &free_pool);
            return Err(DirError::Canceled);
        }
        if !batch.is_empty() {
            let written = writer.write_run(&batch);
            ImportCounters::incr(&counters.runs_written);
            recycle(&mut batch, &free_pool);
            if let Err(e) = written {
                cancel.cancel();
                return Err(e);
            }
        }
    }
    let file = writer.finish()?;
    debug!(file = %file.key, runs = file.runs, bytes = file.bytes, "Closed scratch file");
    Ok(file)
}

/// Reset and return a batch to the free pool, counting the buffers the pool
/// refused
fn recycle(batch: &mut Vec<OutputBuffer>, free_pool: &Sender<OutputBuffer>) -> usize {
    let mut dropped = 0;
    for mut buffer in batch.drain(..) {
        buffer.reset();
        if free_pool.try_send(buffer).is_err() {
            dropped += 1;
        }
    }
    if dropped > 0 {
        debug!(dropped, "Free pool refused returned buffers");
    }
    dropped
}
