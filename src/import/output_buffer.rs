//! Phase-one output buffer
//!
//! Records are appended to a byte arena; a parallel array of `u32` offsets
//! addresses them. Sorting only moves the offsets.
//!
//! ## Record layout
//! ```text
//! +-------------+------+------------+-------------+-------------+-----+
//! | record size | flag |  index id  |  entry id   | key length  | key |
//! |  (packed)   | (1B) | (4B, BE)   |  (packed)   |  (packed)   |     |
//! +-------------+------+------------+-------------+-------------+-----+
//! ```
//! Records sort by key bytes, then index id, then arena offset. The offset
//! tiebreak keeps records of the same key in the order they were added.

use std::cmp::Ordering;

use bytes::BufMut;

use crate::idset::EntryId;
use crate::keycodec::{packed_len, write_packed};

const FLAG_INSERT: u8 = 1;
const FLAG_DELETE: u8 = 0;
const OFFSET_SIZE: usize = 4;
const INDEX_ID_SIZE: usize = 4;
const INSERTION_SORT_THRESHOLD: usize = 7;
const NINTHER_THRESHOLD: usize = 40;

/// One decoded record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportRecord<'a> {
    pub key: &'a [u8],
    pub index_id: u32,
    pub entry_id: EntryId,
    pub insert: bool,
}

/// Fixed-capacity buffer of import records
#[derive(Debug)]
pub struct OutputBuffer {
    arena: Vec<u8>,
    offsets: Vec<u32>,
    capacity: usize,
    /// Order in which this buffer was filled
    sequence: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Vec::with_capacity(capacity),
            offsets: Vec::new(),
            capacity,
            sequence: 0,
        }
    }

    /// Zero-capacity sentinel that stops a scratch writer
    pub fn poison() -> Self {
        Self::new(0)
    }

    pub fn is_poison(&self) -> bool {
        self.capacity == 0
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Bytes used by records and offsets
    pub fn used(&self) -> usize {
        self.arena.len() + self.offsets.len() * OFFSET_SIZE
    }

    /// Whether a record for `key` and `id` still fits. An empty buffer
    /// accepts any single record.
    pub fn fits(&self, key: &[u8], id: EntryId) -> bool {
        self.is_empty() || self.used() + record_size(key, id) + OFFSET_SIZE <= self.capacity
    }

    /// Append a record
    pub fn add(&mut self, key: &[u8], id: EntryId, index_id: u32, insert: bool) {
        let offset = self.arena.len() as u32;
        let body = body_size(key, id);
        write_packed(&mut self.arena, body as u64);
        self.arena.put_u8(if insert { FLAG_INSERT } else { FLAG_DELETE });
        self.arena.put_u32(index_id);
        write_packed(&mut self.arena, id.as_u64());
        write_packed(&mut self.arena, key.len() as u64);
        self.arena.put_slice(key);
        self.offsets.push(offset);
    }

    /// Record at sorted position `i`
    pub fn record(&self, i: usize) -> ImportRecord<'_> {
        self.parse(self.offsets[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = ImportRecord<'_>> + '_ {
        self.offsets.iter().map(move |&o| self.parse(o))
    }

    /// Empty the buffer for reuse
    pub fn reset(&mut self) {
        self.arena.clear();
        self.offsets.clear();
        self.sequence = 0;
    }

    fn parse(&self, offset: u32) -> ImportRecord<'_> {
        let buf = &self.arena[offset as usize..];
        let (_, mut pos) = packed_at(buf, 0);
        let insert = buf[pos] == FLAG_INSERT;
        pos += 1;
        let index_id = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        pos += INDEX_ID_SIZE;
        let (id, n) = packed_at(buf, pos);
        pos += n;
        let (key_len, n) = packed_at(buf, pos);
        pos += n;
        ImportRecord {
            key: &buf[pos..pos + key_len as usize],
            index_id,
            entry_id: EntryId::new(id),
            insert,
        }
    }

    fn compare_offsets(&self, a: u32, b: u32) -> Ordering {
        let ra = self.parse(a);
        let rb = self.parse(b);
        ra.key
            .cmp(rb.key)
            .then(ra.index_id.cmp(&rb.index_id))
            .then(a.cmp(&b))
    }

    // =========================================================================
    // Sorting
    // =========================================================================

    /// Sort the offsets by (key, index id, insertion order)
    pub fn sort(&mut self) {
        let mut offsets = std::mem::take(&mut self.offsets);
        let len = offsets.len();
        self.quicksort(&mut offsets, 0, len);
        self.offsets = offsets;
    }

    /// Three-way partitioning quicksort over `x[off..off+len]`
    fn quicksort(&self, x: &mut [u32], mut off: usize, mut len: usize) {
        loop {
            if len < INSERTION_SORT_THRESHOLD {
                for i in off..off + len {
                    let mut j = i;
                    while j > off && self.compare_offsets(x[j - 1], x[j]) == Ordering::Greater {
                        x.swap(j, j - 1);
                        j -= 1;
                    }
                }
                return;
            }

            let mut m = off + len / 2;
            if len > INSERTION_SORT_THRESHOLD {
                let mut l = off;
                let mut n = off + len - 1;
                if len > NINTHER_THRESHOLD {
                    let s = len / 8;
                    l = self.med3(x, l, l + s, l + 2 * s);
                    m = self.med3(x, m - s, m, m + s);
                    n = self.med3(x, n - 2 * s, n - s, n);
                }
                m = self.med3(x, l, m, n);
            }
            let pivot = x[m];

            // a..b: equal at the front, c..d: equal at the back
            let (mut a, mut b) = (off, off);
            let (mut c, mut d) = (off + len, off + len);
            loop {
                while b < c {
                    match self.compare_offsets(x[b], pivot) {
                        Ordering::Greater => break,
                        Ordering::Equal => {
                            x.swap(a, b);
                            a += 1;
                        }
                        Ordering::Less => {}
                    }
                    b += 1;
                }
                while c > b {
                    match self.compare_offsets(x[c - 1], pivot) {
                        Ordering::Less => break,
                        Ordering::Equal => {
                            x.swap(c - 1, d - 1);
                            d -= 1;
                        }
                        Ordering::Greater => {}
                    }
                    c -= 1;
                }
                if b >= c {
                    break;
                }
                x.swap(b, c - 1);
                b += 1;
                c -= 1;
            }

            // Move the equal runs to the middle
            let n = off + len;
            let s = (a - off).min(b - a);
            vecswap(x, off, b - s, s);
            let s = (d - c).min(n - d);
            vecswap(x, b, n - s, s);

            let left = b - a;
            let right = d - c;
            // Recurse into the smaller side, loop on the larger
            if left < right {
                if left > 1 {
                    self.quicksort(x, off, left);
                }
                if right <= 1 {
                    return;
                }
                off = n - right;
                len = right;
            } else {
                if right > 1 {
                    self.quicksort(x, n - right, right);
                }
                if left <= 1 {
                    return;
                }
                len = left;
            }
        }
    }

    fn med3(&self, x: &[u32], a: usize, b: usize, c: usize) -> usize {
        let ab = self.compare_offsets(x[a], x[b]);
        let bc = self.compare_offsets(x[b], x[c]);
        let ac = self.compare_offsets(x[a], x[c]);
        if ab == Ordering::Less {
            if bc == Ordering::Less {
                b
            } else if ac == Ordering::Less {
                c
            } else {
                a
            }
        } else if bc == Ordering::Greater {
            b
        } else if ac == Ordering::Greater {
            c
        } else {
            a
        }
    }
}

fn vecswap(x: &mut [u32], a: usize, b: usize, n: usize) {
    for i in 0..n {
        x.swap(a + i, b + i);
    }
}

fn body_size(key: &[u8], id: EntryId) -> usize {
    1 + INDEX_ID_SIZE + packed_len(id.as_u64()) + packed_len(key.len() as u64) + key.len()
}

fn record_size(key: &[u8], id: EntryId) -> usize {
    let body = body_size(key, id);
    packed_len(body as u64) + body
}

/// Decode a packed integer written by the arena; returns (value, bytes used)
fn packed_at(buf: &[u8], pos: usize) -> (u64, usize) {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut n = 0usize;
    for &byte in &buf[pos..] {
        n += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 || shift >= 63 {
            break;
        }
        shift += 7;
    }
    (value, n)
}
