//! Lumen Runtime: the stack VM, its tracing garbage collector, the native
//! function ABI, and runtime-facing configuration/error types.
//!
//! `lumen-runtime` is the allocator: it's the only crate that links heap
//! objects into a GC object list and drives collection. The compiler
//! allocates through [`lumen_core::Heap`], implemented here by [`Vm`].
//!
//! # Modules
//!
//! - `vm`: call frames, dispatch loop, allocation, and the collector.
//! - `natives`: the six required native functions (`print`, `println`,
//!   `readStr`, `readNum`, `append`, `del`).
//! - `error`: [`RuntimeError`] and its backtrace.
//! - `config`: [`VmOptions`].
//! - `diagnostics`: the optional SIGQUIT stats dump.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod natives;
pub mod vm;

pub use config::VmOptions;
pub use error::{BacktraceFrame, RuntimeError};
pub use vm::Vm;

pub use lumen_core::Heap;
