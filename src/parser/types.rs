//! Parser Types and Constants
//!
//! Shared error type and limits used by the lexer and parser.

use std::fmt;
use thiserror::Error;

// Parser limits to prevent hangs and resource exhaustion
pub const MAX_INPUT_SIZE: usize = 10_000_000;
pub const MAX_PARSER_DEPTH: usize = 256;

/// A lexical or syntactic error, carrying the source position it
/// occurred at. Renders as `source:line:col: message`.
#[derive(Debug, Clone, Error)]
pub struct ParseError {
    pub source_name: String,
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl ParseError {
    pub fn new(
        source_name: impl Into<String>,
        message: impl Into<String>,
        line: usize,
        col: usize,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            message: message.into(),
            line,
            col,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}",
            self.source_name, self.line, self.col, self.message
        )
    }
}
