//! Storage Module
//!
//! The backing key/value store: an [`Environment`] directory holding named
//! [`Database`]s, each an ordered map under its own comparator.
//!
//! ## Responsibilities
//! - Open/create named databases with a pluggable key comparator
//! - Point reads/writes, atomic read-modify-write, ordered cursors and
//!   range scans, unordered full scans for bulk readers
//! - Persist each database to `<name>.db` on sync and reload it on open
//!
//! ## Layout
//! ```text
//!   {env_dir}/
//!     ├── dc_example_dc_com_id2entry.db
//!     ├── dc_example_dc_com_dn2id.db
//!     ├── dc_example_dc_com_cn.equality.db
//!     └── ...
//! ```

mod comparator;
mod database;
mod dbfile;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;

pub use comparator::{bytewise, Bytewise, KeyComparator};
pub use database::{Cursor, Database, Record};
pub use dbfile::{DbFileBuilder, DbFileIterator, DbFileReader, DB_FILE_EXTENSION};

/// A directory of named databases
pub struct Environment {
    dir: PathBuf,
    databases: Mutex<HashMap<String, Arc<Database>>>,
    /// Remove the whole directory when dropped (scratch environments)
    temporary: bool,
}

impl Environment {
    /// Open or create an environment in `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        info!(dir = %dir.display(), "Opened storage environment");
        Ok(Self {
            dir: dir.to_path_buf(),
            databases: Mutex::new(HashMap::new()),
            temporary: false,
        })
    }

    /// Open a scratch environment that deletes its directory on drop
    pub fn temporary(dir: &Path) -> Result<Self> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            databases: Mutex::new(HashMap::new()),
            temporary: true,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open (or return the already-open) database `name`
    pub fn open_database(&self, name: &str, comparator: Arc<dyn KeyComparator>) -> Result<Arc<Database>> {
        let mut dbs = self.databases.lock();
        if let Some(db) = dbs.get(name) {
            return Ok(db.clone());
        }
        let db = Arc::new(Database::open(name, self.database_path(name), comparator)?);
        dbs.insert(name.to_string(), db.clone());
        Ok(db)
    }

    /// Close and delete database `name` and its file
    pub fn remove_database(&self, name: &str) -> Result<()> {
        self.databases.lock().remove(name);
        let path = self.database_path(name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        debug!(database = name, "Removed database");
        Ok(())
    }

    /// Names of open databases plus those found on disk
    pub fn database_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.databases.lock().keys().cloned().collect();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(DB_FILE_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Persist every modified database
    pub fn sync(&self) -> Result<()> {
        let dbs: Vec<Arc<Database>> = self.databases.lock().values().cloned().collect();
        for db in dbs {
            db.sync()?;
        }
        Ok(())
    }

    fn database_path(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.{}", file, DB_FILE_EXTENSION))
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.temporary {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                warn!(dir = %self.dir.display(), error = %e, "Failed to remove scratch environment");
            }
        } else if let Err(e) = self.sync() {
            warn!(dir = %self.dir.display(), error = %e, "Failed to sync environment on close");
        }
    }
}
