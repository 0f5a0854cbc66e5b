//! Database file builder
//!
//! Writes sorted records to a temporary file and renames it over the target
//! once the footer is durable.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{DirError, Result};

use super::{FIXED_HEADER_SIZE, MAGIC, VERSION};

/// Builder for a database file; records must be added in comparator order
pub struct DbFileBuilder {
    /// Final file path
    path: PathBuf,
    /// Path written until `finish()` renames it
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    record_count: u64,
    current_offset: u64,
    data_hasher: crc32fast::Hasher,
}

impl DbFileBuilder {
    /// Create a builder; the header is written immediately
    pub fn new(path: &Path, comparator_name: &str) -> Result<Self> {
        let tmp_path = path.with_extension("db.tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut writer = BufWriter::new(file);
        let name = comparator_name.as_bytes();
        let name_len = u16::try_from(name.len())
            .map_err(|_| DirError::Storage(format!("comparator name too long: {}", comparator_name)))?;

        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?; // Placeholder for record count
        writer.write_all(&name_len.to_le_bytes())?;
        writer.write_all(name)?;

        Ok(Self {
            path: path.to_path_buf(),
            tmp_path,
            writer,
            record_count: 0,
            current_offset: FIXED_HEADER_SIZE + name.len() as u64,
            data_hasher: crc32fast::Hasher::new(),
        })
    }

    /// Append one record
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| DirError::Storage("key too large".to_string()))?
            .to_le_bytes();
        let val_len = u32::try_from(value.len())
            .map_err(|_| DirError::Storage("value too large".to_string()))?
            .to_le_bytes();

        for part in [&key_len[..], &val_len[..], key, value] {
            self.writer.write_all(part)?;
            self.data_hasher.update(part);
        }

        self.current_offset += 8 + key.len() as u64 + value.len() as u64;
        self.record_count += 1;
        Ok(())
    }

    /// Write the footer, patch the record count, fsync and rename into place.
    ///
    /// Returns the number of records written.
    pub fn finish(mut self) -> Result<u64> {
        let data_end = self.current_offset;
        let data_crc = self.data_hasher.finalize();

        self.writer.write_all(&data_end.to_le_bytes())?;
        self.writer.write_all(&data_crc.to_le_bytes())?;
        self.writer.write_all(&[0u8; 4])?;
        self.writer.flush()?;

        let mut file = self.writer.into_inner().map_err(|e| {
            DirError::Storage(format!("Failed to flush database file: {}", e))
        })?;
        file.seek(SeekFrom::Start(6))?; // After magic + version
        file.write_all(&self.record_count.to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;
        Ok(self.record_count)
    }
}
