//! Open-addressed, string-keyed hash table.
//!
//! Used for globals, instance fields, class method tables, and (by
//! `lumen-runtime`) the string intern table. Keys are `*mut Obj` pointers to
//! `ObjString`s; since strings are canonically interned, pointer equality of
//! keys is content equality, so lookups are a hash-and-probe over raw
//! pointers rather than a byte compare.
//!
//! `set` reports whether the key was newly inserted, because
//! `SET_GLOBAL`'s undefined-variable detection depends on that contract
//! (see the design notes on global `SET` of a newly inserted key).

use crate::object::Obj;
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    /// `None` marks an empty-or-tombstone slot. Tombstones are
    /// distinguished from true-empty by `value` being `Bool(true)`.
    key: Option<*mut Obj>,
    value: Value,
}

pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn is_tombstone(key: Option<*mut Obj>, value: &Value) -> bool {
        key.is_none() && matches!(value, Value::Bool(true))
    }

    /// Find the slot `key` belongs in: an existing entry, or the first
    /// empty/tombstone slot on its probe sequence.
    fn find_entry(entries: &[Entry], capacity: usize, key: *mut Obj) -> usize {
        let hash = unsafe { (*key).as_obj_string().expect("table key is a string").hash };
        let mut index = (hash as usize) & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if Self::is_tombstone(entry.key, &entry.value) {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(k) if std::ptr::eq(k, key) => return index,
                Some(_) => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![
            Entry {
                key: None,
                value: Value::Nil,
            };
            capacity
        ];
        let mut count = 0;
        for entry in &self.entries {
            let Some(key) = entry.key else { continue };
            let index = Self::find_entry(&entries, capacity, key);
            entries[index] = Entry {
                key: Some(key),
                value: entry.value,
            };
            count += 1;
        }
        self.entries = entries;
        self.count = count;
    }

    pub fn get(&self, key: *mut Obj) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    /// Insert or overwrite. Returns `true` iff the slot was previously
    /// empty-or-tombstone (i.e. this key was not already present). This is
    /// the contract `SET_GLOBAL` relies on to detect an undefined global.
    pub fn set(&mut self, key: *mut Obj, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * TABLE_MAX_LOAD {
            let new_capacity = grow_capacity(self.capacity());
            self.adjust_capacity(new_capacity);
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key);
        let entry = &mut self.entries[index];
        let new_key = entry.key.is_none();
        if new_key && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        new_key
    }

    pub fn delete(&mut self, key: *mut Obj) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry {
            key: None,
            value: Value::Bool(true),
        };
        true
    }

    pub fn add_all_into(&self, into: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                into.set(key, entry.value);
            }
        }
    }

    /// Find an interned string by content without allocating a probe key,
    /// used by the string interner before it has a candidate `ObjString` to
    /// compare pointers against.
    pub fn find_string(&self, s: &str, hash: u32) -> Option<*mut Obj> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if !Self::is_tombstone(entry.key, &entry.value) {
                        return None;
                    }
                }
                Some(k) => {
                    let candidate = unsafe { (*k).as_obj_string().expect("interned key is a string") };
                    if candidate.hash == hash && candidate.as_str() == s {
                        return Some(k);
                    }
                }
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Remove every entry whose key is unmarked. Must run after marking and
    /// before sweeping so the intern table never holds a dangling pointer
    /// once sweep frees unmarked strings.
    pub fn remove_unmarked_keys(&mut self) {
        let keys: Vec<*mut Obj> = self
            .entries
            .iter()
            .filter_map(|e| e.key)
            .filter(|k| unsafe { !(**k).marked })
            .collect();
        for key in keys {
            self.delete(key);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut Obj, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 { 8 } else { capacity * 2 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Obj, ObjData, ObjString};

    fn intern(s: &str) -> *mut Obj {
        Box::into_raw(Box::new(Obj {
            marked: false,
            next: std::ptr::null_mut(),
            data: ObjData::String(ObjString::new(s)),
        }))
    }

    #[test]
    fn set_reports_new_key_then_overwrite_reports_existing() {
        let mut t = Table::new();
        let k = intern("x");
        assert!(t.set(k, Value::Number(1.0)));
        assert!(!t.set(k, Value::Number(2.0)));
        assert_eq!(t.get(k).unwrap().as_number(), Some(2.0));
    }

    #[test]
    fn delete_then_set_reports_new_key_again() {
        let mut t = Table::new();
        let k = intern("x");
        t.set(k, Value::Number(1.0));
        assert!(t.delete(k));
        assert!(t.set(k, Value::Number(3.0)));
    }

    #[test]
    fn delete_of_absent_key_returns_false() {
        let mut t = Table::new();
        let k = intern("x");
        assert!(!t.delete(k));
    }

    #[test]
    fn add_all_into_copies_every_entry() {
        let mut from = Table::new();
        let mut to = Table::new();
        let a = intern("a");
        let b = intern("b");
        from.set(a, Value::Number(1.0));
        from.set(b, Value::Number(2.0));
        from.add_all_into(&mut to);
        assert_eq!(to.get(a).unwrap().as_number(), Some(1.0));
        assert_eq!(to.get(b).unwrap().as_number(), Some(2.0));
    }

    #[test]
    fn find_string_locates_interned_content() {
        let mut t = Table::new();
        let k = intern("hello");
        let hash = unsafe { (*k).as_obj_string().unwrap().hash };
        t.set(k, Value::Nil);
        assert_eq!(t.find_string("hello", hash), Some(k));
        assert_eq!(t.find_string("nope", hash), None);
    }
}
