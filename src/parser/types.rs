//! Parser Types and Constants
//!
//! Shared error type used by the manifest lexer and parsers.

use std::fmt;
use thiserror::Error;

// Parser limits to prevent runaway inputs.
pub const MAX_INCLUDE_DEPTH: usize = 100;

/// A lex or parse error with position information. Displays as
/// `file:line:col: message`, followed by the offending line.
#[derive(Debug, Error)]
pub struct ParseException {
    pub filename: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
    /// The text of the offending line, for context.
    pub context: String,
}

impl fmt::Display for ParseException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}",
            self.filename, self.line, self.column, self.message
        )?;
        if !self.context.is_empty() {
            write!(f, "\n{}\n{:>width$}", self.context, "^", width = self.column)?;
        }
        Ok(())
    }
}

impl ParseException {
    pub fn new(
        filename: impl Into<String>,
        line: usize,
        column: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            line,
            column,
            message: message.into(),
            context: String::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// An error not tied to a position within the file, e.g. a missing
    /// include.
    pub fn file_error(filename: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(filename, 0, 0, message)
    }
}
