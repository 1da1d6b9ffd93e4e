//! Subprocess Execution
//!
//! Runs build commands as child processes with merged, per-child output
//! capture. The set multiplexes up to N children over a single poll
//! loop; a self-pipe makes signal delivery wake the poll atomically.

pub mod subprocess;
pub mod subprocess_set;

pub use subprocess::{ExitStatus, Subprocess};
pub use subprocess_set::SubprocessSet;
