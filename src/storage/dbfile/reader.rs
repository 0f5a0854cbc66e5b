//! Database file reader
//!
//! Validates header, footer and data checksum, then hands out an iterator
//! over the records.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{DirError, Result};

use super::iterator::DbFileIterator;
use super::{FIXED_HEADER_SIZE, FOOTER_SIZE, MAGIC, VERSION};

/// Reader for one database file
pub struct DbFileReader {
    path: PathBuf,
    pub(super) file: BufReader<File>,
    record_count: u64,
    comparator_name: String,
    /// First byte of the data block
    pub(super) data_start: u64,
    /// One past the last byte of the data block
    pub(super) data_end: u64,
}

impl DbFileReader {
    /// Open and validate a database file
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < FIXED_HEADER_SIZE + FOOTER_SIZE {
            return Err(DirError::Corruption(format!(
                "{} is too short ({} bytes)",
                path.display(),
                file_size
            )));
        }

        let mut header = [0u8; FIXED_HEADER_SIZE as usize];
        file.read_exact(&mut header)?;

        if &header[0..4] != MAGIC {
            return Err(DirError::Corruption(format!(
                "Invalid database magic in {}: expected DSDB, got {:?}",
                path.display(),
                &header[0..4]
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(DirError::Corruption(format!(
                "Unsupported database file version: {}",
                version
            )));
        }

        let mut count = [0u8; 8];
        count.copy_from_slice(&header[6..14]);
        let record_count = u64::from_le_bytes(count);
        let name_len = u16::from_le_bytes([header[14], header[15]]) as usize;

        let mut name = vec![0u8; name_len];
        file.read_exact(&mut name)?;
        let comparator_name = String::from_utf8(name)
            .map_err(|e| DirError::Corruption(format!("comparator name: {}", e)))?;

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;
        let mut end = [0u8; 8];
        end.copy_from_slice(&footer[0..8]);
        let data_end = u64::from_le_bytes(end);
        let data_crc = u32::from_le_bytes([footer[8], footer[9], footer[10], footer[11]]);

        let data_start = FIXED_HEADER_SIZE + name_len as u64;
        if data_end < data_start || data_end > file_size - FOOTER_SIZE {
            return Err(DirError::Corruption(format!(
                "{}: data block end {} out of bounds",
                path.display(),
                data_end
            )));
        }

        // Checksum the data block before handing out any record
        file.seek(SeekFrom::Start(data_start))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = data_end - data_start;
        let mut chunk = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u64) as usize;
            file.read_exact(&mut chunk[..n])?;
            hasher.update(&chunk[..n]);
            remaining -= n as u64;
        }
        if hasher.finalize() != data_crc {
            return Err(DirError::Corruption(format!(
                "{}: data checksum mismatch",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: BufReader::new(file),
            record_count,
            comparator_name,
            data_start,
            data_end,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Name of the comparator the records were sorted with
    pub fn comparator_name(&self) -> &str {
        &self.comparator_name
    }

    /// Iterate over every record in file order
    pub fn iter(&mut self) -> Result<DbFileIterator<'_>> {
        DbFileIterator::new(&mut self.file, self.data_start, self.data_end)
    }
}
