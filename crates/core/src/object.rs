//! Heap object model.
//!
//! Every heap-allocated value in Lumen is an [`Obj`] linked into the VM's
//! intrusive object list via `next`. Objects are never moved once allocated
//! (`Box::into_raw`), so a raw `*mut Obj` remains valid for the object's
//! entire lifetime and is only ever invalidated by the collector's sweep.
//!
//! A plain header-plus-payload struct rather than `Rc`/`Arc`: the collector
//! is a tracing mark-sweep, not reference counting, and cycles (class <->
//! method closures <-> instances) must be collectible.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Discriminant for the heap object union, used for fast `is_*`/`as_*` checks
/// without matching through [`ObjData`] at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Function,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
    Native,
    List,
}

/// A function that implements the native ABI: `(heap, args) -> Value`.
///
/// The `heap` handle lets a native that allocates (e.g. reading a line from
/// stdin into a new interned string) do so without `lumen-core` depending on
/// `lumen-runtime`, since `Heap` is defined right here. Natives report errors
/// as `Err(String)` rather than a `RuntimeError`; the VM wraps the string into
/// a proper `RuntimeError` at the call site.
pub type NativeFn = fn(heap: &mut dyn crate::heap::Heap, args: &[Value]) -> Result<Value, String>;

/// Common header plus payload for every heap object.
///
/// `marked`/`next` are plain fields, not `Cell`s: all mutation happens
/// through the raw pointer the VM already holds (see the `unsafe` accessor
/// methods below), matching how the rest of this workspace treats heap
/// pointers as the unit of aliasing control rather than `Cell`/`RefCell`.
pub struct Obj {
    pub marked: bool,
    pub next: *mut Obj,
    pub data: ObjData,
}

pub enum ObjData {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Native(ObjNative),
    List(ObjList),
}

/// Canonically interned string: length, immutable buffer, precomputed hash.
///
/// The buffer carries a trailing NUL byte for host interop (e.g. handing a
/// pointer to a native function written against a C-like ABI) without an
/// extra allocation at the boundary.
pub struct ObjString {
    /// Content bytes followed by one trailing `\0`.
    bytes: Box<[u8]>,
    pub hash: u32,
}

impl ObjString {
    pub fn new(s: &str) -> Self {
        let hash = fnv1a_hash(s.as_bytes());
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        ObjString {
            bytes: bytes.into_boxed_slice(),
            hash,
        }
    }

    pub fn as_str(&self) -> &str {
        // Safety: constructed only from valid UTF-8 in `new`.
        std::str::from_utf8(&self.bytes[..self.bytes.len() - 1]).expect("ObjString is valid utf8")
    }

    pub fn len(&self) -> usize {
        self.bytes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pointer to the NUL-terminated buffer, for FFI-shaped natives.
    pub fn as_ptr_with_nul(&self) -> *const u8 {
        self.bytes.as_ptr()
    }
}

/// FNV-1a, 32-bit. Deterministic across platforms so that, together with
/// interning, two equal-content strings always hash identically and
/// collapse to one object.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A compiled function: arity, declared upvalue count, owned chunk, optional name.
///
/// Immutable once the compiler finishes with it; shared (read-only) by every
/// [`ObjClosure`] built over it.
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<*mut Obj>,
}

impl ObjFunction {
    pub fn new(name: Option<*mut Obj>) -> Self {
        ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }

    /// Safety: caller must ensure `name`, if present, still points at a live
    /// `ObjString` (true as long as this function itself is reachable, since
    /// the collector marks the name alongside the function).
    pub unsafe fn name_str(&self) -> Option<&str> {
        self.name
            .map(|p| unsafe { (*p).as_string().expect("function name is a string") })
    }
}

/// A function paired with its resolved upvalues: the callable runtime object.
pub struct ObjClosure {
    pub function: *mut Obj, // ObjFunction
    pub upvalues: Box<[*mut Obj]>, // each an ObjUpvalue
}

/// Either OPEN (pointing at a live stack slot, by index rather than raw
/// pointer since the value stack is a fixed-capacity, never-reallocated
/// backing array but indices are still safer to carry across GC pauses) or
/// CLOSED (owning the escaped value inline).
///
/// Represented as a tagged enum per the reference design notes, rather than
/// a self-pointer trick.
#[derive(Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct ObjUpvalue {
    pub state: UpvalueState,
    /// Next node in the VM's open-upvalue list, sorted by descending stack
    /// address. Unrelated to `Obj::next` (the global GC object list).
    pub open_next: *mut Obj,
}

/// Name plus method table. Methods install by later overwrite, so a
/// subclass method defined after `INHERIT` shadows the copied one.
pub struct ObjClass {
    pub name: *mut Obj, // ObjString
    pub methods: Table,
}

/// A class reference plus a field table.
pub struct ObjInstance {
    pub class: *mut Obj, // ObjClass
    pub fields: Table,
}

/// A receiver bound to a method closure, produced by reading a method off
/// an instance (`obj.method` without a call).
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: *mut Obj, // ObjClosure
}

pub struct ObjNative {
    pub name: &'static str,
    pub func: NativeFn,
}

/// Dynamic contiguous buffer of values.
pub struct ObjList {
    pub items: Vec<Value>,
}

impl Obj {
    pub fn kind(&self) -> ObjKind {
        match &self.data {
            ObjData::String(_) => ObjKind::String,
            ObjData::Function(_) => ObjKind::Function,
            ObjData::Closure(_) => ObjKind::Closure,
            ObjData::Upvalue(_) => ObjKind::Upvalue,
            ObjData::Class(_) => ObjKind::Class,
            ObjData::Instance(_) => ObjKind::Instance,
            ObjData::BoundMethod(_) => ObjKind::BoundMethod,
            ObjData::Native(_) => ObjKind::Native,
            ObjData::List(_) => ObjKind::List,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match &self.data {
            ObjData::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_obj_string(&self) -> Option<&ObjString> {
        match &self.data {
            ObjData::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ObjFunction> {
        match &self.data {
            ObjData::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut ObjFunction> {
        match &mut self.data {
            ObjData::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&ObjClosure> {
        match &self.data {
            ObjData::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_upvalue(&self) -> Option<&ObjUpvalue> {
        match &self.data {
            ObjData::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_upvalue_mut(&mut self) -> Option<&mut ObjUpvalue> {
        match &mut self.data {
            ObjData::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ObjClass> {
        match &self.data {
            ObjData::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class_mut(&mut self) -> Option<&mut ObjClass> {
        match &mut self.data {
            ObjData::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ObjInstance> {
        match &self.data {
            ObjData::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut ObjInstance> {
        match &mut self.data {
            ObjData::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bound_method(&self) -> Option<&ObjBoundMethod> {
        match &self.data {
            ObjData::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&ObjNative> {
        match &self.data {
            ObjData::Native(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ObjList> {
        match &self.data {
            ObjData::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut ObjList> {
        match &mut self.data {
            ObjData::List(l) => Some(l),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_for_empty_string() {
        // FNV offset basis with no bytes folded in.
        assert_eq!(fnv1a_hash(b""), 2166136261);
    }

    #[test]
    fn obj_string_round_trips_and_nul_terminates() {
        let s = ObjString::new("hi");
        assert_eq!(s.as_str(), "hi");
        assert_eq!(s.len(), 2);
        unsafe {
            assert_eq!(*s.as_ptr_with_nul().add(2), 0);
        }
    }

    #[test]
    fn empty_string_is_empty() {
        let s = ObjString::new("");
        assert!(s.is_empty());
    }
}
