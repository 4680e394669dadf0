//! Thread-safe open-addressing hash table.
//!
//! Every symbol table in the runtime (globals, module registry, interned
//! strings, module namespaces) is a [`Table`]. Each table carries its own
//! lock, held for the whole of every public operation.
//!
//! Collisions are resolved by linear probing. Deleted entries become
//! tombstones so that probe chains crossing them stay intact; tombstones are
//! dropped the next time the table grows.

use std::fmt;
use std::ptr;

use parking_lot::Mutex;

use super::Value;
use super::heap::{GcRef, Heap};

/// Maximum ratio of occupied slots to capacity before growing.
pub const MAX_LOAD: f64 = 0.75;

/// Capacity of a table after its first growth.
pub const MIN_CAPACITY: usize = 8;

fn grow_capacity(capacity: usize) -> usize {
    if capacity < MIN_CAPACITY {
        MIN_CAPACITY
    } else {
        capacity * 2
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Occupied { key: Value, value: Value },
}

enum Probe {
    /// Slot holding the key
    Found(usize),
    /// First reusable slot on the key's chain
    Vacant(usize),
    /// No key match and no reusable slot (zero capacity)
    Full,
}

struct Entries {
    slots: Vec<Slot>,
    /// Occupied slots; tombstones are not counted
    count: usize,
}

impl Entries {
    fn probe(slots: &[Slot], key: &Value) -> Probe {
        let capacity = slots.len();
        if capacity == 0 {
            return Probe::Full;
        }
        let mask = capacity - 1;
        let mut index = key.hash_value() as usize & mask;
        let mut tombstone = None;

        for _ in 0..capacity {
            match &slots[index] {
                Slot::Empty => return Probe::Vacant(tombstone.unwrap_or(index)),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Occupied { key: k, .. } if k == key => return Probe::Found(index),
                Slot::Occupied { .. } => {}
            }
            index = (index + 1) & mask;
        }

        match tombstone {
            Some(index) => Probe::Vacant(index),
            None => Probe::Full,
        }
    }

    fn get(&self, key: &Value) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        match Self::probe(&self.slots, key) {
            Probe::Found(i) => match self.slots[i] {
                Slot::Occupied { value, .. } => Some(value),
                _ => None,
            },
            _ => None,
        }
    }

    fn insert(&mut self, key: Value, value: Value) -> bool {
        if (self.count + 1) as f64 > self.slots.len() as f64 * MAX_LOAD {
            self.resize(grow_capacity(self.slots.len()));
        }

        loop {
            match Self::probe(&self.slots, &key) {
                Probe::Found(i) => {
                    self.slots[i] = Slot::Occupied { key, value };
                    return false;
                }
                Probe::Vacant(i) => {
                    self.slots[i] = Slot::Occupied { key, value };
                    self.count += 1;
                    return true;
                }
                Probe::Full => self.resize(grow_capacity(self.slots.len())),
            }
        }
    }

    fn remove(&mut self, key: &Value) -> bool {
        if self.count == 0 {
            return false;
        }
        match Self::probe(&self.slots, key) {
            Probe::Found(i) => {
                self.slots[i] = Slot::Tombstone;
                self.count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Rehash every occupied entry into `capacity` fresh slots.
    fn resize(&mut self, capacity: usize) {
        debug_assert!(capacity.is_power_of_two());
        let mut slots = vec![Slot::Empty; capacity];
        let mut count = 0;

        for slot in &self.slots {
            if let Slot::Occupied { key, value } = *slot {
                if let Probe::Vacant(i) = Self::probe(&slots, &key) {
                    slots[i] = Slot::Occupied { key, value };
                    count += 1;
                }
            }
        }

        log::debug!(
            "table resized {} -> {} slots ({} entries)",
            self.slots.len(),
            capacity,
            count
        );
        self.slots = slots;
        self.count = count;
    }

    fn occupied(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match *slot {
            Slot::Occupied { key, value } => Some((key, value)),
            _ => None,
        })
    }
}

/// A mapping from [`Value`] to [`Value`] with internal mutual exclusion.
///
/// The lock is not reentrant; none of the methods below call back into the
/// same table while holding it.
pub struct Table {
    entries: Mutex<Entries>,
}

impl Table {
    /// Create a new, empty table. No slots are allocated until the first insert.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                slots: Vec::new(),
                count: 0,
            }),
        }
    }

    /// Number of occupied entries.
    pub fn len(&self) -> usize {
        self.entries.lock().count
    }

    /// Check if the table has no occupied entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots, always zero or a power of two.
    pub fn capacity(&self) -> usize {
        self.entries.lock().slots.len()
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.entries.lock().get(key)
    }

    /// Insert or overwrite. Returns `true` when the key was not present.
    pub fn set(&self, key: Value, value: Value) -> bool {
        self.entries.lock().insert(key, value)
    }

    /// Replace the key's entry with a tombstone. Returns `true` if it was present.
    pub fn delete(&self, key: &Value) -> bool {
        self.entries.lock().remove(key)
    }

    /// Snapshot of all occupied entries, in bucket order.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.entries.lock().occupied().collect()
    }

    /// Snapshot of all occupied keys, in bucket order.
    pub fn get_keys(&self) -> Vec<Value> {
        self.entries.lock().occupied().map(|(k, _)| k).collect()
    }

    /// First key (in bucket order) whose value equals `value`.
    pub fn find_key(&self, value: &Value) -> Option<Value> {
        self.entries
            .lock()
            .occupied()
            .find(|(_, v)| v == value)
            .map(|(k, _)| k)
    }

    /// Look up an interned string by raw content and precomputed hash,
    /// without building a key.
    pub fn find_string(&self, chars: &[u8], hash: u32, heap: &Heap) -> Option<GcRef> {
        let entries = self.entries.lock();
        if entries.count == 0 {
            return None;
        }
        let capacity = entries.slots.len();
        let mask = capacity - 1;
        let mut index = hash as usize & mask;

        for _ in 0..capacity {
            match entries.slots[index] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied {
                    key: Value::Obj(r), ..
                } if r.hash() == hash => {
                    let matches = heap
                        .get(r)
                        .and_then(|obj| obj.as_string().map(|s| s.as_bytes() == chars))
                        .unwrap_or(false);
                    if matches {
                        return Some(r);
                    }
                }
                Slot::Occupied { .. } => {}
            }
            index = (index + 1) & mask;
        }
        None
    }

    /// Insert a batch of entries under a single lock acquisition.
    pub fn extend<I>(&self, pairs: I)
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        let mut entries = self.entries.lock();
        for (key, value) in pairs {
            entries.insert(key, value);
        }
    }

    /// Copy every entry of `from` into `to`.
    pub fn add_all(from: &Table, to: &Table) {
        if ptr::eq(from, to) {
            return;
        }
        to.extend(from.entries());
    }

    /// Like [`add_all`](Self::add_all), skipping entries whose value is a module.
    pub fn import_all<F>(from: &Table, to: &Table, is_module: F)
    where
        F: Fn(&Value) -> bool,
    {
        if ptr::eq(from, to) {
            return;
        }
        let pairs: Vec<_> = from
            .entries()
            .into_iter()
            .filter(|(_, v)| !is_module(v))
            .collect();
        to.extend(pairs);
    }

    /// Like [`add_all`](Self::add_all), passing every value through `copy_value` first.
    pub fn copy<F>(from: &Table, to: &Table, mut copy_value: F)
    where
        F: FnMut(Value) -> Value,
    {
        let pairs: Vec<_> = from
            .entries()
            .into_iter()
            .map(|(k, v)| (k, copy_value(v)))
            .collect();
        to.extend(pairs);
    }

    /// GC root-marking hook: report every occupied key and value.
    pub fn mark_roots<F>(&self, mut mark: F)
    where
        F: FnMut(&Value),
    {
        let entries = self.entries.lock();
        for (key, value) in entries.occupied() {
            mark(&key);
            mark(&value);
        }
    }

    /// GC sweep hook: tombstone every entry whose object key is not marked.
    ///
    /// Doomed slots are rewritten in place under one lock acquisition.
    /// Returns the number of entries removed.
    pub fn remove_whites<F>(&self, is_marked: F) -> usize
    where
        F: Fn(&Value) -> bool,
    {
        let mut entries = self.entries.lock();
        let mut removed = 0;
        for slot in entries.slots.iter_mut() {
            if let Slot::Occupied { key, .. } = slot {
                if key.is_obj() && !is_marked(key) {
                    *slot = Slot::Tombstone;
                    removed += 1;
                }
            }
        }
        entries.count -= removed;
        removed
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_map().entries(entries.occupied()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::heap::HeapObject;
    use crate::vm::object::{ObjString, hash_string};

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    #[test]
    fn test_get_on_empty_table() {
        let table = Table::new();
        assert_eq!(table.get(&num(1.0)), None);
        assert_eq!(table.capacity(), 0);
        assert!(table.is_empty());

        table.set(num(1.0), num(2.0));
        assert!(!table.is_empty());
        table.delete(&num(1.0));
        assert!(table.is_empty());
    }

    #[test]
    fn test_set_and_get() {
        let table = Table::new();
        assert!(table.set(num(1.0), Value::Bool(true)));
        assert!(!table.set(num(1.0), Value::Bool(false)));
        assert_eq!(table.get(&num(1.0)), Some(Value::Bool(false)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_nil_value_is_stored() {
        let table = Table::new();
        table.set(num(1.0), Value::Nil);
        assert_eq!(table.get(&num(1.0)), Some(Value::Nil));
    }

    #[test]
    fn test_missing_key() {
        let table = Table::new();
        table.set(num(1.0), num(10.0));
        assert_eq!(table.get(&num(2.0)), None);
        assert!(!table.delete(&num(2.0)));
    }

    #[test]
    fn test_delete_then_get() {
        let table = Table::new();
        table.set(num(1.0), num(10.0));
        assert!(table.delete(&num(1.0)));
        assert_eq!(table.get(&num(1.0)), None);
        assert!(!table.delete(&num(1.0)));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_tombstone_reuse_keeps_count() {
        let table = Table::new();
        table.set(num(1.0), num(10.0));
        table.set(num(2.0), num(20.0));
        let before = table.len();

        table.delete(&num(1.0));
        assert!(table.set(num(1.0), num(11.0)));

        assert_eq!(table.len(), before);
        assert_eq!(table.get(&num(1.0)), Some(num(11.0)));
    }

    #[test]
    fn test_grow_preserves_entries() {
        let table = Table::new();
        for i in 0..6 {
            table.set(num(i as f64), num(i as f64 * 10.0));
        }
        assert_eq!(table.capacity(), 8);

        table.set(num(6.0), num(60.0));
        assert_eq!(table.capacity(), 16);
        for i in 0..7 {
            assert_eq!(table.get(&num(i as f64)), Some(num(i as f64 * 10.0)));
        }
    }

    #[test]
    fn test_capacity_invariant() {
        let table = Table::new();
        for i in 0..500 {
            table.set(num(i as f64), Value::Nil);
            let capacity = table.capacity();
            assert!(capacity.is_power_of_two());
            assert!(table.len() as f64 <= capacity as f64 * MAX_LOAD);
            if i % 3 == 0 {
                table.delete(&num((i / 2) as f64));
            }
        }
    }

    #[test]
    fn test_probe_chain_survives_delete() {
        // Keys sharing a bucket form one chain; deleting the head must not
        // hide the rest of it.
        let table = Table::new();
        let colliding: Vec<Value> = (0..1000)
            .map(|i| num(i as f64))
            .filter(|v| v.hash_value() & 7 == num(0.0).hash_value() & 7)
            .take(3)
            .collect();
        for k in &colliding {
            table.set(*k, *k);
        }
        table.delete(&colliding[0]);
        for k in &colliding[1..] {
            assert_eq!(table.get(k), Some(*k));
        }
    }

    #[test]
    fn test_churn_without_empty_slots_terminates() {
        let table = Table::new();
        for round in 0..20 {
            for i in 0..6 {
                table.set(num((round * 6 + i) as f64), Value::Nil);
            }
            for i in 0..6 {
                table.delete(&num((round * 6 + i) as f64));
            }
        }
        assert!(table.is_empty());
        assert_eq!(table.get(&num(-1.0)), None);
    }

    #[test]
    fn test_find_key() {
        let table = Table::new();
        table.set(num(1.0), Value::Bool(true));
        assert_eq!(table.find_key(&Value::Bool(true)), Some(num(1.0)));
        assert_eq!(table.find_key(&Value::Bool(false)), None);
    }

    #[test]
    fn test_get_keys_skips_tombstones() {
        let table = Table::new();
        table.set(num(1.0), Value::Nil);
        table.set(num(2.0), Value::Nil);
        table.delete(&num(1.0));
        assert_eq!(table.get_keys(), vec![num(2.0)]);
    }

    #[test]
    fn test_add_all_and_import_all() {
        let from = Table::new();
        from.set(num(1.0), num(10.0));
        from.set(num(2.0), Value::Bool(true));

        let to = Table::new();
        Table::add_all(&from, &to);
        assert_eq!(to.len(), 2);

        let imported = Table::new();
        Table::import_all(&from, &imported, |v| v.is_bool());
        assert_eq!(imported.get(&num(1.0)), Some(num(10.0)));
        assert_eq!(imported.get(&num(2.0)), None);

        Table::add_all(&to, &to);
        assert_eq!(to.len(), 2);
    }

    #[test]
    fn test_copy_maps_values() {
        let from = Table::new();
        from.set(num(1.0), num(10.0));
        let to = Table::new();
        Table::copy(&from, &to, |v| match v {
            Value::Number(n) => Value::Number(n + 1.0),
            other => other,
        });
        assert_eq!(to.get(&num(1.0)), Some(num(11.0)));
    }

    #[test]
    fn test_find_string() {
        let heap = Heap::new();
        let table = Table::new();
        let r = heap.alloc(HeapObject::String(ObjString::new("hi".to_string())));
        table.set(Value::Obj(r), Value::Nil);

        assert_eq!(table.find_string(b"hi", hash_string(b"hi"), &heap), Some(r));
        assert_eq!(table.find_string(b"ho", hash_string(b"ho"), &heap), None);
    }

    #[test]
    fn test_remove_whites() {
        let heap = Heap::new();
        let table = Table::new();
        let live = heap.alloc(HeapObject::String(ObjString::new("live".to_string())));
        let dead = heap.alloc(HeapObject::String(ObjString::new("dead".to_string())));
        table.set(Value::Obj(live), Value::Nil);
        table.set(Value::Obj(dead), Value::Nil);
        table.set(num(1.0), Value::Nil);

        let removed = table.remove_whites(|v| *v != Value::Obj(dead));
        assert_eq!(removed, 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&Value::Obj(dead)), None);
        assert_eq!(table.get(&Value::Obj(live)), Some(Value::Nil));
    }

    #[test]
    fn test_mark_roots_reports_keys_and_values() {
        let table = Table::new();
        table.set(num(1.0), num(2.0));
        let mut seen = Vec::new();
        table.mark_roots(|v| seen.push(*v));
        assert_eq!(seen, vec![num(1.0), num(2.0)]);
    }

    #[test]
    fn test_concurrent_sets() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(Table::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..250 {
                        table.set(num((t * 1000 + i) as f64), num(i as f64));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 1000);
        assert_eq!(table.get(&num(3249.0)), Some(num(249.0)));
    }
}
