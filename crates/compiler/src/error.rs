//! Compile-time diagnostics.

use thiserror::Error;

/// One compile error: a line number, a location clause, and a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("[line {line}] Error{at}: {message}")]
pub struct CompileError {
    pub line: u32,
    /// `" at end"`, `" at 'lexeme'"`, or empty for an error with no useful token.
    pub at: String,
    pub message: String,
}

/// Every distinct error surfaced by one compile, after panic-mode resync has
/// suppressed the merely-cascading ones.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("compilation failed with {} error(s)", .0.len())]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    pub fn errors(&self) -> &[CompileError] {
        &self.0
    }
}
