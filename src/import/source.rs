//! Entry sources feeding phase one
//!
//! - [`LdifReader`]: LDIF content records (folded lines, comments, base64
//!   values)
//! - [`Id2EntrySource`]: every stored entry of a container, used by rebuilds
//! - [`EntryFileSource`]: entries spilled to a scratch file while migrating
//! - [`ChainedSource`]: several sources read one after the other
//!
//! A malformed record yields `Err(EntryRejected)`; the reader stays usable
//! and the next call continues with the following record.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, BufMut};

use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{DirError, Result};
use crate::idset::EntryId;
use crate::storage::Record;

/// One entry handed to phase one
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub entry: Entry,
    /// Already assigned ID (rebuilds); None to allocate a new one
    pub id: Option<EntryId>,
    /// Entry carried over from the existing backend
    pub migrated: bool,
}

impl SourceEntry {
    pub fn new(entry: Entry) -> Self {
        Self {
            entry,
            id: None,
            migrated: false,
        }
    }
}

/// A stream of entries
pub trait EntrySource: Send {
    /// Next entry, or None at the end of the stream
    fn next_entry(&mut self) -> Result<Option<SourceEntry>>;
}

// =============================================================================
// LDIF
// =============================================================================

/// Reads LDIF content records
pub struct LdifReader<R> {
    input: R,
    line_number: usize,
    /// Line read ahead while unfolding continuations
    pending: Option<String>,
    eof: bool,
}

impl LdifReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> LdifReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line_number: 0,
            pending: None,
            eof: false,
        }
    }

    fn read_raw_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.pending.take() {
            return Ok(Some(line));
        }
        if self.eof {
            return Ok(None);
        }
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            self.eof = true;
            return Ok(None);
        }
        self.line_number += 1;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Next logical line with continuations joined
    fn read_line(&mut self) -> Result<Option<String>> {
        let Some(mut line) = self.read_raw_line()? else {
            return Ok(None);
        };
        loop {
            match self.read_raw_line()? {
                Some(next) if next.starts_with(' ') => line.push_str(&next[1..]),
                Some(next) => {
                    self.pending = Some(next);
                    break;
                }
                None => break,
            }
        }
        Ok(Some(line))
    }

    /// Lines of the next record, skipping comments and blank separators
    fn read_record(&mut self) -> Result<Option<(usize, Vec<String>)>> {
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(line) = self.read_line()? {
            if line.is_empty() {
                if lines.is_empty() {
                    continue;
                }
                break;
            }
            if line.starts_with('#') {
                continue;
            }
            if lines.is_empty() {
                start = self.line_number;
            }
            lines.push(line);
        }
        if lines.is_empty() {
            Ok(None)
        } else {
            Ok(Some((start, lines)))
        }
    }
}

/// Split `attr: value`, `attr:: base64` or `attr:< url`
fn parse_line(line: &str, line_number: usize) -> Result<(String, Vec<u8>)> {
    let colon = line
        .find(':')
        .ok_or_else(|| DirError::EntryRejected(format!("line {}: missing ':' in {:?}", line_number, line)))?;
    let name = line[..colon].trim();
    let name = name.split(';').next().unwrap_or(name).to_string();
    if name.is_empty() {
        return Err(DirError::EntryRejected(format!("line {}: empty attribute name", line_number)));
    }
    let rest = &line[colon + 1..];
    let value = if let Some(encoded) = rest.strip_prefix(':') {
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| DirError::EntryRejected(format!("line {}: bad base64 value: {}", line_number, e)))?
    } else if rest.starts_with('<') {
        return Err(DirError::EntryRejected(format!(
            "line {}: URL values are not supported",
            line_number
        )));
    } else {
        rest.trim_start().as_bytes().to_vec()
    };
    Ok((name, value))
}

fn parse_record(start: usize, lines: &[String]) -> Result<Entry> {
    let mut iter = lines.iter().enumerate();
    let (_, first) = iter
        .next()
        .ok_or_else(|| DirError::EntryRejected(format!("line {}: empty record", start)))?;
    let (name, value) = parse_line(first, start)?;
    if !name.eq_ignore_ascii_case("dn") {
        return Err(DirError::EntryRejected(format!(
            "line {}: record does not start with dn",
            start
        )));
    }
    let dn_string = String::from_utf8(value)
        .map_err(|_| DirError::EntryRejected(format!("line {}: DN is not UTF-8", start)))?;
    let dn = Dn::parse(&dn_string).map_err(|e| DirError::EntryRejected(format!("{}: {}", dn_string, e)))?;
    let mut entry = Entry::new(dn);
    for (offset, line) in iter {
        let (name, value) = parse_line(line, start + offset)?;
        if name.eq_ignore_ascii_case("changetype") {
            return Err(DirError::EntryRejected(format!(
                "{}: change records cannot be imported",
                dn_string
            )));
        }
        entry.add_value(&name, value);
    }
    Ok(entry)
}

impl<R: BufRead + Send> EntrySource for LdifReader<R> {
    fn next_entry(&mut self) -> Result<Option<SourceEntry>> {
        loop {
            let Some((start, lines)) = self.read_record()? else {
                return Ok(None);
            };
            // A lone version line is a header, not an entry
            if lines.len() == 1 && lines[0].to_ascii_lowercase().starts_with("version:") {
                continue;
            }
            let lines = if lines[0].to_ascii_lowercase().starts_with("version:") {
                lines[1..].to_vec()
            } else {
                lines
            };
            return parse_record(start, &lines).map(|e| Some(SourceEntry::new(e)));
        }
    }
}

/// Write `entry` as an LDIF record
pub fn write_ldif_entry<W: Write>(out: &mut W, entry: &Entry) -> Result<()> {
    writeln!(out, "dn: {}", entry.dn())?;
    for attr in entry.attributes() {
        for value in &attr.values {
            match std::str::from_utf8(value) {
                Ok(s) if is_safe_string(s) => writeln!(out, "{}: {}", attr.name, s)?,
                _ => writeln!(out, "{}:: {}", attr.name, STANDARD.encode(value))?,
            }
        }
    }
    writeln!(out)?;
    Ok(())
}

fn is_safe_string(s: &str) -> bool {
    !s.starts_with([' ', ':', '<']) && !s.ends_with(' ') && !s.contains(['\n', '\r', '\0'])
}

// =============================================================================
// id2entry
// =============================================================================

/// Every record of an id2entry snapshot, in ID order
pub struct Id2EntrySource {
    records: std::vec::IntoIter<Record>,
}

impl Id2EntrySource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

impl EntrySource for Id2EntrySource {
    fn next_entry(&mut self) -> Result<Option<SourceEntry>> {
        let Some((key, value)) = self.records.next() else {
            return Ok(None);
        };
        let id = EntryId::from_bytes(&key)?;
        let entry = Entry::decode(&value)?;
        Ok(Some(SourceEntry {
            entry,
            id: Some(id),
            migrated: false,
        }))
    }
}

// =============================================================================
// Migrated entry files
// =============================================================================

/// Appends length-prefixed id2entry records to a scratch file
pub struct EntryFileWriter {
    path: PathBuf,
    out: BufWriter<File>,
    count: u64,
}

impl EntryFileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(File::create(path)?),
            count: 0,
        })
    }

    pub fn append(&mut self, entry: &Entry) -> Result<()> {
        let bytes = entry.encode()?;
        let mut prefix = Vec::with_capacity(4);
        prefix.put_u32_le(bytes.len() as u32);
        self.out.write_all(&prefix)?;
        self.out.write_all(&bytes)?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flush and reopen for reading
    pub fn into_source(mut self) -> Result<EntryFileSource> {
        self.out.flush()?;
        EntryFileSource::open(&self.path)
    }
}

/// Reads back an [`EntryFileWriter`] file; every entry is flagged migrated
pub struct EntryFileSource {
    input: BufReader<File>,
}

impl EntryFileSource {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            input: BufReader::new(File::open(path)?),
        })
    }
}

impl EntrySource for EntryFileSource {
    fn next_entry(&mut self) -> Result<Option<SourceEntry>> {
        let mut prefix = [0u8; 4];
        match self.input.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = (&prefix[..]).get_u32_le() as usize;
        let mut body = vec![0u8; len];
        self.input.read_exact(&mut body)?;
        Ok(Some(SourceEntry {
            entry: Entry::decode(&body)?,
            id: None,
            migrated: true,
        }))
    }
}

// =============================================================================
// Chaining
// =============================================================================

/// Reads each source to its end before moving to the next
#[derive(Default)]
pub struct ChainedSource {
    sources: VecDeque<Box<dyn EntrySource>>,
}

impl ChainedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: Box<dyn EntrySource>) {
        self.sources.push_back(source);
    }
}

impl EntrySource for ChainedSource {
    fn next_entry(&mut self) -> Result<Option<SourceEntry>> {
        while let Some(source) = self.sources.front_mut() {
            match source.next_entry()? {
                Some(entry) => return Ok(Some(entry)),
                None => {
                    self.sources.pop_front();
                }
            }
        }
        Ok(None)
    }
}
