//! In-Memory Disk
//!
//! Disk implementation holding files in a map, used by tests to control
//! mtimes exactly. Each write advances a fake clock by one tick so
//! relative ordering is deterministic.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use crate::fs::types::{Disk, DiskError, TimeStamp};

/// In-memory disk for tests.
#[derive(Default)]
pub struct InMemoryDisk {
    files: RefCell<HashMap<String, (TimeStamp, Vec<u8>)>>,
    dirs: RefCell<HashSet<String>>,
    now: RefCell<TimeStamp>,
    /// Files removed through the trait, in removal order.
    removed: RefCell<Vec<String>>,
}

impl InMemoryDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the fake clock and return the new time.
    pub fn tick(&self) -> TimeStamp {
        let mut now = self.now.borrow_mut();
        *now += 1;
        *now
    }

    /// Create a file with the current tick as its mtime.
    pub fn create(&self, path: &str, contents: &str) {
        let t = self.tick();
        self.files
            .borrow_mut()
            .insert(path.to_string(), (t, contents.as_bytes().to_vec()));
    }

    /// Set a file's mtime without touching its contents.
    pub fn touch(&self, path: &str) {
        let t = self.tick();
        let mut files = self.files.borrow_mut();
        match files.get_mut(path) {
            Some(entry) => entry.0 = t,
            None => {
                files.insert(path.to_string(), (t, Vec::new()));
            }
        }
    }

    pub fn mtime(&self, path: &str) -> TimeStamp {
        self.files.borrow().get(path).map_or(0, |e| e.0)
    }

    pub fn contents(&self, path: &str) -> Option<String> {
        self.files
            .borrow()
            .get(path)
            .map(|e| String::from_utf8_lossy(&e.1).to_string())
    }

    pub fn removed_files(&self) -> Vec<String> {
        self.removed.borrow().clone()
    }

    pub fn has_dir(&self, dir: &str) -> bool {
        self.dirs.borrow().contains(dir)
    }
}

impl Disk for InMemoryDisk {
    fn stat(&self, path: &str) -> Result<TimeStamp, DiskError> {
        Ok(self.mtime(path))
    }

    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, DiskError> {
        Ok(self.files.borrow().get(path).map(|e| e.1.clone()))
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), DiskError> {
        let t = self.tick();
        self.files
            .borrow_mut()
            .insert(path.to_string(), (t, contents.to_vec()));
        Ok(())
    }

    fn make_dirs_for(&self, path: &str) -> Result<(), DiskError> {
        if let Some(dir) = crate::fs::types::parent_dir(path) {
            self.dirs.borrow_mut().insert(dir.to_string());
        }
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<bool, DiskError> {
        let existed = self.files.borrow_mut().remove(path).is_some();
        if existed {
            self.removed.borrow_mut().push(path.to_string());
        }
        Ok(existed)
    }
}
