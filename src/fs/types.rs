//! Disk Types
//!
//! Core types and the trait for filesystem access.

use thiserror::Error;

/// File modification time in nanoseconds since the epoch.
///
/// `0` means the file does not exist. Stat errors are reported through
/// `DiskError`, never encoded in the timestamp.
pub type TimeStamp = i64;

/// Disk access errors.
#[derive(Error, Debug)]
pub enum DiskError {
    #[error("stat({path}): {source}")]
    Stat { path: String, source: std::io::Error },

    #[error("reading {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("writing {path}: {source}")]
    Write { path: String, source: std::io::Error },

    #[error("mkdir({path}): {source}")]
    MakeDir { path: String, source: std::io::Error },

    #[error("remove({path}): {source}")]
    Remove { path: String, source: std::io::Error },
}

/// Abstract disk interface so the scanner and driver can be tested
/// against an in-memory backend.
pub trait Disk {
    /// Stat a path. Returns 0 for a missing file.
    fn stat(&self, path: &str) -> Result<TimeStamp, DiskError>;

    /// Read a whole file. Returns None if the file does not exist.
    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, DiskError>;

    /// Write a whole file, replacing any existing contents.
    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), DiskError>;

    /// Create the directory containing `path`, and any missing parents.
    fn make_dirs_for(&self, path: &str) -> Result<(), DiskError>;

    /// Remove a file. Returns false if it did not exist.
    fn remove_file(&self, path: &str) -> Result<bool, DiskError>;
}

/// Split off the directory portion of a slash-separated path, if any.
pub fn parent_dir(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}
