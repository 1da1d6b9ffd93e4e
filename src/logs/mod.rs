//! Persistent Build State
//!
//! Two append-only on-disk stores survive between builds:
//! - the build log: per-output command hashes and mtimes, text format
//! - the deps log: per-output discovered dependencies, binary format
//!
//! Both are replayed into memory on startup, appended to during the
//! build, and compacted when too many dead records accumulate.
//! Corruption is never fatal: the file is truncated to the last good
//! record or recreated, and the build proceeds.

pub mod build_log;
pub mod deps_log;

pub use build_log::{BuildLog, LogEntry};
pub use deps_log::{DepsLog, DepsRecord};
