//! Open-addressed hash table keyed by `Value`, linearly probed, with
//! tombstone deletion (§4.2). Backs maps, the string intern set, and the
//! module registry alike.

use crate::error::VmError;
use crate::gc::{Heap, ObjId};
use crate::value::Value;

const MAX_LOAD_FACTOR: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: Value::Null,
            value: Value::Null,
        }
    }

    /// An empty slot has never held an entry: both key and value are Null.
    fn is_empty_slot(&self) -> bool {
        matches!(self.key, Value::Null) && matches!(self.value, Value::Null)
    }

    /// A tombstone is a deleted entry: Null key, but a non-Null (`true`)
    /// value, distinguishing it from a slot that was always empty.
    fn is_tombstone(&self) -> bool {
        matches!(self.key, Value::Null) && matches!(self.value, Value::Bool(true))
    }
}

/// An open-addressed hash table. `count` tracks active entries *and*
/// tombstones together, since both occupy a slot in the probe sequence and
/// both must be accounted for when deciding to grow.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry_index(entries: &[Entry], heap: &Heap, key: Value) -> Result<usize, VmError> {
        let capacity = entries.len();
        let hash = key.hash(heap)?;
        let mut index = (hash as usize) % capacity;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            if entry.is_empty_slot() {
                return Ok(tombstone.unwrap_or(index));
            } else if entry.is_tombstone() {
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == key {
                return Ok(index);
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self, heap: &Heap, new_capacity: usize) -> Result<(), VmError> {
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut new_count = 0;

        for entry in &self.entries {
            if matches!(entry.key, Value::Null) {
                continue; // skip empty slots and tombstones: count resets.
            }
            let index = Self::find_entry_index(&new_entries, heap, entry.key)?;
            new_entries[index] = *entry;
            new_count += 1;
        }

        self.entries = new_entries;
        self.count = new_count;
        Ok(())
    }

    fn ensure_capacity(&mut self, heap: &Heap) -> Result<(), VmError> {
        if self.entries.is_empty() {
            self.grow(heap, MIN_CAPACITY)?;
        } else if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR {
            self.grow(heap, self.capacity() * 2)?;
        }
        Ok(())
    }

    /// Inserts or overwrites `key -> value`. Returns whether the key was
    /// newly inserted (not previously present).
    pub fn set(&mut self, heap: &Heap, key: Value, value: Value) -> Result<bool, VmError> {
        self.ensure_capacity(heap)?;
        let index = Self::find_entry_index(&self.entries, heap, key)?;
        let is_new_key = self.entries[index].is_empty_slot();
        if is_new_key {
            self.count += 1;
        }
        self.entries[index] = Entry { key, value };
        Ok(is_new_key)
    }

    pub fn get(&self, heap: &Heap, key: Value) -> Result<Option<Value>, VmError> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let index = Self::find_entry_index(&self.entries, heap, key)?;
        let entry = &self.entries[index];
        if matches!(entry.key, Value::Null) {
            Ok(None)
        } else {
            Ok(Some(entry.value))
        }
    }

    pub fn contains(&self, heap: &Heap, key: Value) -> Result<bool, VmError> {
        Ok(self.get(heap, key)?.is_some())
    }

    /// Writes a tombstone in place of the entry. Returns whether a live
    /// entry was actually found.
    pub fn delete(&mut self, heap: &Heap, key: Value) -> Result<bool, VmError> {
        if self.entries.is_empty() {
            return Ok(false);
        }
        let index = Self::find_entry_index(&self.entries, heap, key)?;
        if matches!(self.entries[index].key, Value::Null) {
            return Ok(false);
        }
        self.entries[index] = Entry {
            key: Value::Null,
            value: Value::Bool(true),
        };
        Ok(true)
    }

    /// Copies every live entry of `other` into `self`, overwriting on key
    /// collision. Used by `Inherit` to seed a subclass's method table.
    pub fn add_all(&mut self, heap: &Heap, other: &Table) -> Result<(), VmError> {
        for entry in &other.entries {
            if matches!(entry.key, Value::Null) {
                continue;
            }
            self.set(heap, entry.key, entry.value)?;
        }
        Ok(())
    }

    /// Specialized lookup used only by the string interner: finds an
    /// already-interned string with these exact bytes without needing a
    /// `Value` (and therefore without needing the candidate to already be
    /// allocated on the heap).
    #[must_use]
    pub fn find_string(&self, heap: &Heap, bytes: &[u8], hash: u32) -> Option<ObjId> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = (hash as usize) % capacity;

        loop {
            let entry = &self.entries[index];
            if entry.is_empty_slot() {
                return None;
            } else if !entry.is_tombstone() {
                if let Value::Object(id) = entry.key {
                    if let Ok(s) = heap.as_string(id) {
                        if s.hash == hash && s.bytes == bytes {
                            return Some(id);
                        }
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Deletes every entry whose key is an unmarked object (§4.4's
    /// "weak-table prune"). Run on the intern set and module registry
    /// before sweep so unreachable strings/modules are collected this
    /// cycle instead of the next.
    pub fn remove_white(&mut self, heap: &Heap) {
        for entry in &mut self.entries {
            if let Value::Object(id) = entry.key {
                if !heap.is_marked(id) {
                    *entry = Entry {
                        key: Value::Null,
                        value: Value::Bool(true),
                    };
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !matches!(e.key, Value::Null))
            .map(|e| (e.key, e.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    #[test]
    fn set_then_get_roundtrips() {
        let mut heap = Heap::new(false);
        let mut table = Table::new();
        let key = Value::Int(42);
        assert!(table.set(&heap, key, Value::Bool(true)).unwrap());
        assert_eq!(table.get(&heap, key).unwrap(), Some(Value::Bool(true)));
        let _ = &mut heap;
    }

    #[test]
    fn delete_then_get_returns_none() {
        let heap = Heap::new(false);
        let mut table = Table::new();
        table.set(&heap, Value::Int(1), Value::Int(2)).unwrap();
        assert!(table.delete(&heap, Value::Int(1)).unwrap());
        assert_eq!(table.get(&heap, Value::Int(1)).unwrap(), None);
    }

    #[test]
    fn grows_past_load_factor() {
        let heap = Heap::new(false);
        let mut table = Table::new();
        for i in 0..100 {
            table.set(&heap, Value::Int(i), Value::Int(i)).unwrap();
        }
        assert!(table.capacity() as f64 * MAX_LOAD_FACTOR >= 100.0);
        for i in 0..100 {
            assert_eq!(table.get(&heap, Value::Int(i)).unwrap(), Some(Value::Int(i)));
        }
    }
}
