//! just-build - a small, fast build tool
//!
//! Executes pre-generated build manifests: parses the static dependency
//! graph, decides the minimal set of commands needed to bring the
//! requested targets up to date, and runs them with bounded parallelism.

pub mod build;
pub mod canon;
pub mod eval;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod jobserver;
pub mod logs;
pub mod parser;
pub mod process;
pub mod status;
pub mod tool;

pub use build::{BuildConfig, Builder};
pub use graph::{BuildError, State};
pub use parser::{ManifestParser, ParseException};
