//! Shared runtime state: the object heap and the runtime-wide tables.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::RuntimeConfig;

use super::chunk::Chunk;
use super::heap::{GcRef, Heap, HeapObject, Marker, RootGuard};
use super::object::{Closure, Function, Module, ObjString, SwitchTable, hash_string};
use super::table::Table;
use super::Value;

/// Result of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub freed: usize,
    pub live: usize,
    /// Interned strings dropped from the intern table
    pub strings_removed: usize,
}

/// Heap, string-intern table, module registry and globals.
///
/// Shared across execution units behind an `Arc`.
pub struct Runtime {
    config: RuntimeConfig,
    heap: Heap,
    strings: Table,
    modules: Table,
    globals: Table,
    /// Held while interning and while collecting. A string found in the
    /// intern table is rooted before the lock is released.
    strings_lock: Mutex<()>,
    /// Serializes module lookup-or-create
    modules_lock: Mutex<()>,
    collections: AtomicUsize,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            config,
            heap: Heap::new(),
            strings: Table::new(),
            modules: Table::new(),
            globals: Table::new(),
            strings_lock: Mutex::new(()),
            modules_lock: Mutex::new(()),
            collections: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn strings(&self) -> &Table {
        &self.strings
    }

    /// Module registry, keyed by interned module name.
    pub fn modules(&self) -> &Table {
        &self.modules
    }

    pub fn globals(&self) -> &Table {
        &self.globals
    }

    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    fn alloc(&self, object: HeapObject) -> (GcRef, RootGuard<'_>) {
        self.maybe_collect();
        self.heap.alloc_rooted(object)
    }

    fn maybe_collect(&self) {
        if self.config.gc_enabled && self.heap.should_collect(self.config.gc_threshold) {
            self.collect_garbage();
        }
    }

    // =========================================================================
    // Object constructors
    // =========================================================================
    //
    // Each constructor has a `_rooted` form returning the handle together
    // with a guard. The plain form drops the guard on return: its handle
    // stays valid only until the next collection, so use it where no other
    // thread can collect or where the handle is stored before the next
    // allocation.

    /// Canonical string object for `chars`.
    pub fn intern(&self, chars: impl AsRef<[u8]>) -> GcRef {
        self.intern_rooted(chars).0
    }

    /// [`intern`](Self::intern), rooted until the guard is dropped.
    pub fn intern_rooted(&self, chars: impl AsRef<[u8]>) -> (GcRef, RootGuard<'_>) {
        let bytes = chars.as_ref();
        let hash = hash_string(bytes);
        self.maybe_collect();

        let _lock = self.strings_lock.lock();
        if let Some(r) = self.strings.find_string(bytes, hash, &self.heap) {
            return (r, self.heap.protect(Value::Obj(r)));
        }
        let (r, guard) = self
            .heap
            .alloc_rooted(HeapObject::String(ObjString::new(bytes)));
        self.strings.set(Value::Obj(r), Value::Nil);
        (r, guard)
    }

    /// Move a fully built function onto the heap.
    pub fn new_function(&self, function: Function) -> GcRef {
        self.new_function_rooted(function).0
    }

    pub fn new_function_rooted(&self, function: Function) -> (GcRef, RootGuard<'_>) {
        let _module = self.heap.protect(Value::Obj(function.module));
        let _name = function.name.map(|n| self.heap.protect(Value::Obj(n)));
        let _constants: Vec<_> = function
            .chunk
            .constants()
            .into_iter()
            .map(|v| self.heap.protect(v))
            .collect();
        self.alloc(HeapObject::Function(function))
    }

    pub fn new_closure(&self, closure: Closure) -> GcRef {
        self.new_closure_rooted(closure).0
    }

    pub fn new_closure_rooted(&self, closure: Closure) -> (GcRef, RootGuard<'_>) {
        let _function = self.heap.protect(Value::Obj(closure.function));
        self.alloc(HeapObject::Closure(closure))
    }

    pub fn new_module(&self, name: &str, file: &str) -> GcRef {
        self.new_module_rooted(name, file).0
    }

    pub fn new_module_rooted(&self, name: &str, file: &str) -> (GcRef, RootGuard<'_>) {
        self.alloc(HeapObject::Module(Module::new(name, file)))
    }

    pub fn new_switch(&self, exit_jump: usize) -> GcRef {
        self.alloc(HeapObject::Switch(SwitchTable::new(exit_jump))).0
    }

    /// Register a module in the module registry and in globals under its name.
    pub fn add_module(&self, module: GcRef) {
        let _root = self.heap.protect(Value::Obj(module));
        let Some(name) = self
            .heap
            .get(module)
            .and_then(|obj| obj.as_module().map(|m| m.name.clone()))
        else {
            return;
        };
        let (key, _key_root) = self.intern_rooted(&name);
        self.modules.set(Value::Obj(key), Value::Obj(module));
        self.globals.set(Value::Obj(key), Value::Obj(module));
        log::debug!("registered module '{}'", name);
    }

    /// Look a module up by name without interning the name.
    pub fn find_module(&self, name: &str) -> Option<GcRef> {
        let bytes = name.as_bytes();
        let key = self
            .strings
            .find_string(bytes, hash_string(bytes), &self.heap)?;
        self.modules.get(&Value::Obj(key))?.as_obj()
    }

    /// Registered module named `name`, creating and registering one if absent.
    ///
    /// Registered modules are reachable from the registry, so the handle
    /// stays valid.
    pub fn module_or_register(&self, name: &str, file: &str) -> GcRef {
        let _lock = self.modules_lock.lock();
        if let Some(module) = self.find_module(name) {
            return module;
        }
        let (module, _root) = self.new_module_rooted(name, file);
        self.add_module(module);
        module
    }

    /// Append `value` to `chunk` while keeping it rooted.
    ///
    /// Appending may allocate, and allocation may collect.
    pub fn add_constant(&self, chunk: &Chunk, value: Value) -> usize {
        let _root = self.heap.protect(value);
        self.maybe_collect();
        chunk.add_constant(value)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Raw bytes of a string object.
    pub fn string_bytes(&self, r: GcRef) -> Option<Vec<u8>> {
        self.heap
            .get(r)
            .and_then(|obj| obj.as_string().map(|s| s.chars.clone()))
    }

    /// Contents of a string object as text; invalid UTF-8 is replaced.
    pub fn string(&self, r: GcRef) -> Option<String> {
        self.heap.get(r).and_then(|obj| {
            obj.as_string()
                .map(|s| String::from_utf8_lossy(&s.chars).into_owned())
        })
    }

    pub fn is_module(&self, value: &Value) -> bool {
        self.object_type(value) == Some("module")
    }

    /// Heap type name of an object value.
    pub fn object_type(&self, value: &Value) -> Option<&'static str> {
        let r = value.as_obj()?;
        self.heap.get(r).map(|obj| obj.type_name())
    }

    /// Copy semantics for [`Table::copy`]: closures get a fresh closure over
    /// the same function, everything else is shared.
    pub fn copy_value(&self, value: Value) -> Value {
        let Some(r) = value.as_obj() else {
            return value;
        };
        match self.heap.get(r).as_deref() {
            Some(HeapObject::Closure(c)) => Value::Obj(self.new_closure(*c)),
            _ => value,
        }
    }

    /// [`Table::import_all`] with module detection from this heap.
    pub fn import_all(&self, from: &Table, to: &Table) {
        Table::import_all(from, to, |v| self.is_module(v));
    }

    /// [`Table::copy`] with [`copy_value`](Self::copy_value).
    pub fn copy_table(&self, from: &Table, to: &Table) {
        let _pause = self.heap.pause_collection();
        Table::copy(from, to, |v| self.copy_value(v));
    }

    /// Recursive equality: strings by content, functions by header, module
    /// name/file and chunk contents, closures by upvalue count and function.
    pub fn structural_eq(&self, a: &Value, b: &Value) -> bool {
        let (Value::Obj(x), Value::Obj(y)) = (a, b) else {
            return a == b;
        };
        if x == y {
            return true;
        }
        let (Some(ox), Some(oy)) = (self.heap.get(*x), self.heap.get(*y)) else {
            return false;
        };
        match (&*ox, &*oy) {
            (HeapObject::String(s), HeapObject::String(t)) => s.chars == t.chars,
            (HeapObject::Function(f), HeapObject::Function(g)) => self.functions_eq(f, g),
            (HeapObject::Closure(c), HeapObject::Closure(d)) => {
                c.upvalue_count == d.upvalue_count
                    && self.structural_eq(&Value::Obj(c.function), &Value::Obj(d.function))
            }
            (HeapObject::Module(m), HeapObject::Module(n)) => m.name == n.name && m.file == n.file,
            _ => false,
        }
    }

    fn functions_eq(&self, f: &Function, g: &Function) -> bool {
        let names_eq = match (f.name, g.name) {
            (None, None) => true,
            (Some(a), Some(b)) => self.structural_eq(&Value::Obj(a), &Value::Obj(b)),
            _ => false,
        };
        if f.kind != g.kind
            || f.arity != g.arity
            || f.upvalue_count != g.upvalue_count
            || f.is_variadic != g.is_variadic
            || !names_eq
            || !self.structural_eq(&Value::Obj(f.module), &Value::Obj(g.module))
        {
            return false;
        }
        let (a, b) = (f.chunk.snapshot(), g.chunk.snapshot());
        a.code == b.code
            && a.lines == b.lines
            && a.constants.len() == b.constants.len()
            && a
                .constants
                .iter()
                .zip(&b.constants)
                .all(|(x, y)| self.structural_eq(x, y))
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Run a full mark/sweep cycle.
    ///
    /// Roots are the heap's pinned values, globals and the module registry.
    /// The intern table is weak: unmarked strings are removed from it.
    pub fn collect_garbage(&self) -> GcStats {
        let _lock = self.strings_lock.lock();

        let mut marker = Marker::new(&self.heap);
        for root in self.heap.roots() {
            marker.mark_value(&root);
        }
        self.globals.mark_roots(|v| marker.mark_value(v));
        self.modules.mark_roots(|v| marker.mark_value(v));
        marker.trace(&self.heap);

        let strings_removed = self.strings.remove_whites(|v| marker.is_marked(v));
        let freed = self.heap.sweep(&marker);
        let stats = GcStats {
            freed,
            live: self.heap.object_count(),
            strings_removed,
        };

        let cycle = self.collections.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.gc_stats {
            log::info!(
                "[GC] cycle {}: freed {}, live {}, interned strings dropped {}",
                cycle,
                stats.freed,
                stats.live,
                stats.strings_removed
            );
        }
        stats
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
