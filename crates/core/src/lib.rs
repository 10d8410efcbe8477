//! Lumen Core: value and object model, string interning, hash table, and
//! bytecode chunk.
//!
//! This crate is the language-agnostic foundation shared by the compiler
//! and the runtime: both need to agree on what a `Value` is, how heap
//! objects are laid out and linked for the collector, and the shape of a
//! compiled `Chunk`, without either one owning the allocator (that lives in
//! `lumen-runtime`, which links objects into the VM's object list and
//! drives the collector).
//!
//! # Modules
//!
//! - `value`: the tagged `Value` union (nil, bool, number, heap pointer).
//! - `object`: heap object variants (`ObjString`, `ObjFunction`, ...).
//! - `table`: the open-addressed hash table backing globals/fields/methods.
//! - `strings`: canonical string interning built on `table`.
//! - `chunk`: packed bytecode + constant pool + line map.

pub mod chunk;
pub mod heap;
pub mod object;
pub mod strings;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::Heap;
pub use object::{
    NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjData, ObjFunction, ObjInstance,
    ObjKind, ObjList, ObjNative, ObjString, ObjUpvalue, UpvalueState, fnv1a_hash,
};
pub use strings::Interner;
pub use table::Table;
pub use value::Value;
