//! Manifest, Depfile, and Dyndep Parsing
//!
//! The lexer and recursive parser for build manifests, plus the two
//! small auxiliary formats ingested during a build: Makefile-style
//! depfiles and dyndep files.

pub mod types;
pub mod lexer;
pub mod manifest;
pub mod depfile;
pub mod dyndep;

pub use types::ParseException;
pub use lexer::{Lexer, Token};
pub use manifest::ManifestParser;
pub use depfile::{parse_depfile, Depfile, DepfileError};
pub use dyndep::{parse_dyndep, DyndepEntry, DyndepFile};
