//! Canonical string interning.
//!
//! The interner is a thin, purpose-built wrapper over [`Table`]: it only
//! ever stores string keys mapped to `nil`, using the table purely as a
//! weak-keyed set. Two strings with equal contents must share one
//! [`ObjString`](crate::object::ObjString) allocation, and the interner is
//! the place that invariant is upheld.
//!
//! Allocation itself (and registering the new object into the VM's object
//! list) is the allocator's job, in `lumen-runtime`; this type only answers
//! "do we already have this content interned" and "remember that we do now".

use crate::object::{Obj, fnv1a_hash};
use crate::table::Table;
use crate::value::Value;

#[derive(Default)]
pub struct Interner {
    table: Table,
}

impl Interner {
    pub fn new() -> Self {
        Interner::default()
    }

    pub fn hash_of(s: &str) -> u32 {
        fnv1a_hash(s.as_bytes())
    }

    /// Look up an already-interned string by content.
    pub fn find(&self, s: &str, hash: u32) -> Option<*mut Obj> {
        self.table.find_string(s, hash)
    }

    /// Record a freshly allocated `ObjString` as interned.
    pub fn record(&mut self, obj: *mut Obj) {
        self.table.set(obj, Value::Nil);
    }

    /// Weak-table pruning: drop entries whose key object the collector
    /// didn't mark. Must run before sweep frees unmarked strings, or the
    /// table would retain dangling pointers.
    pub fn remove_unmarked(&mut self) {
        self.table.remove_unmarked_keys();
    }

    pub fn iter(&self) -> impl Iterator<Item = *mut Obj> + '_ {
        self.table.iter().map(|(k, _)| k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjData, ObjString};

    fn make(s: &str) -> *mut Obj {
        Box::into_raw(Box::new(Obj {
            marked: false,
            next: std::ptr::null_mut(),
            data: ObjData::String(ObjString::new(s)),
        }))
    }

    #[test]
    fn find_after_record_locates_same_content() {
        let mut interner = Interner::new();
        let obj = make("hello");
        let hash = Interner::hash_of("hello");
        assert!(interner.find("hello", hash).is_none());
        interner.record(obj);
        assert_eq!(interner.find("hello", hash), Some(obj));
    }
}
