//! Error types for dirstore
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using DirError
pub type Result<T> = std::result::Result<T, DirError>;

/// Unified error type for dirstore operations
#[derive(Debug, Error)]
pub enum DirError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database file corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Decode / Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid DN: {0}")]
    InvalidDn(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Index not configured: {0}")]
    IndexNotConfigured(String),

    #[error("Invalid VLV request: {0}")]
    InvalidVlvRequest(String),

    // -------------------------------------------------------------------------
    // Entry Errors
    // -------------------------------------------------------------------------
    #[error("No such entry: {0}")]
    NoSuchEntry(String),

    #[error("Entry already exists: {0}")]
    EntryAlreadyExists(String),

    #[error("Operation not allowed on non-leaf entry: {0}")]
    NotAllowedOnNonLeaf(String),

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    #[error("Insufficient memory for import: {usable} bytes usable, {required} bytes required")]
    InsufficientMemory { usable: u64, required: u64 },

    #[error("Not enough disk space during {phase} on {}", path.display())]
    DiskSpace { phase: String, path: PathBuf },

    // -------------------------------------------------------------------------
    // Pipeline Errors
    // -------------------------------------------------------------------------
    #[error("Operation canceled")]
    Canceled,

    #[error("Entry rejected: {0}")]
    EntryRejected(String),

    #[error("Worker thread panicked: {0}")]
    ThreadPanicked(String),
}

impl DirError {
    /// Whether this error aborts a bulk operation, as opposed to rejecting a
    /// single entry.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DirError::EntryRejected(_))
    }
}

impl From<bincode::Error> for DirError {
    fn from(e: bincode::Error) -> Self {
        DirError::Serialization(e.to_string())
    }
}
