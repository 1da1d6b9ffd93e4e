//! Real Disk
//!
//! Disk implementation backed by the actual filesystem.

use std::io::ErrorKind;
use std::time::UNIX_EPOCH;

use crate::fs::types::{parent_dir, Disk, DiskError, TimeStamp};

/// Disk backed by std::fs.
#[derive(Default)]
pub struct RealDisk;

impl RealDisk {
    pub fn new() -> Self {
        RealDisk
    }
}

impl Disk for RealDisk {
    fn stat(&self, path: &str) -> Result<TimeStamp, DiskError> {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta.modified().map_err(|source| DiskError::Stat {
                    path: path.to_string(),
                    source,
                })?;
                let nanos = match mtime.duration_since(UNIX_EPOCH) {
                    Ok(d) => d.as_nanos().min(i64::MAX as u128) as i64,
                    // Pre-epoch mtimes exist in the wild (touch -d 1970);
                    // clamp them to the smallest existing timestamp.
                    Err(_) => 1,
                };
                Ok(nanos.max(1))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(source) => Err(DiskError::Stat {
                path: path.to_string(),
                source,
            }),
        }
    }

    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, DiskError> {
        match std::fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(DiskError::Read {
                path: path.to_string(),
                source,
            }),
        }
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), DiskError> {
        std::fs::write(path, contents).map_err(|source| DiskError::Write {
            path: path.to_string(),
            source,
        })
    }

    fn make_dirs_for(&self, path: &str) -> Result<(), DiskError> {
        if let Some(dir) = parent_dir(path) {
            std::fs::create_dir_all(dir).map_err(|source| DiskError::MakeDir {
                path: dir.to_string(),
                source,
            })?;
        }
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<bool, DiskError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(DiskError::Remove {
                path: path.to_string(),
                source,
            }),
        }
    }
}
