//! Database file iterator
//!
//! Sequential iteration over the data block.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

use crate::error::{DirError, Result};

/// Iterator over records in file order
pub struct DbFileIterator<'a> {
    file: &'a mut BufReader<File>,
    /// Stop reading at this offset (start of footer)
    end_offset: u64,
    current_offset: u64,
}

impl<'a> DbFileIterator<'a> {
    pub(super) fn new(file: &'a mut BufReader<File>, start: u64, end_offset: u64) -> Result<Self> {
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            file,
            end_offset,
            current_offset: start,
        })
    }

    fn read_record(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut header = [0u8; 8];
        self.file.read_exact(&mut header)?;
        let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let val_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;

        let record_end = self.current_offset + 8 + key_len + val_len;
        if record_end > self.end_offset {
            return Err(DirError::Corruption(format!(
                "record at offset {} runs past the data block",
                self.current_offset
            )));
        }

        let mut key = vec![0u8; key_len as usize];
        self.file.read_exact(&mut key)?;
        let mut value = vec![0u8; val_len as usize];
        self.file.read_exact(&mut value)?;

        self.current_offset = record_end;
        Ok((key, value))
    }
}

impl<'a> Iterator for DbFileIterator<'a> {
    /// (key, value)
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_offset >= self.end_offset {
            return None;
        }
        let record = self.read_record();
        if record.is_err() {
            // Stop after the first malformed record
            self.current_offset = self.end_offset;
        }
        Some(record)
    }
}
