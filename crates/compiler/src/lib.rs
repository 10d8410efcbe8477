//! lumenc: scanner plus single-pass Pratt compiler for the Lumen language.
//!
//! `compile` is the only entry point most callers need: it turns source
//! text into a root script `Function`, allocated through whatever [`Heap`]
//! the caller's VM provides.

pub mod compiler;
pub mod config;
pub mod error;
pub mod scanner;

pub use compiler::{FunctionType, compile};
pub use config::CompilerConfig;
pub use error::{CompileError, CompileErrors};
pub use scanner::{Scanner, Token, TokenKind};

pub use lumen_core::Heap;
