//! Runtime diagnostics: a message plus the call stack active when it fired.

use std::fmt;
use thiserror::Error;

/// One active call frame at the moment a runtime error was raised, innermost
/// first, matching the order the VM's backtrace print walks.
#[derive(Debug, Clone)]
pub struct BacktraceFrame {
    /// `None` for the top-level script frame.
    pub function_name: Option<String>,
    pub line: u32,
}

impl fmt::Display for BacktraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function_name {
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A failure raised by an opcode handler. Carries the frame stack active at
/// the moment of the fault so the CLI can print a "message, then backtrace
/// innermost first" shape.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub backtrace: Vec<BacktraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, backtrace: Vec<BacktraceFrame>) -> Self {
        RuntimeError { message: message.into(), backtrace }
    }

    /// Render the error: the message, then one backtrace line per frame,
    /// innermost first.
    pub fn render(&self) -> String {
        let mut out = self.message.clone();
        for frame in &self.backtrace {
            out.push('\n');
            out.push_str(&frame.to_string());
        }
        out
    }
}
