use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use super::Value;
use super::object::{Closure, Function, Module, ObjString, SwitchTable};

// =============================================================================
// GcRef - handle into the object arena
// =============================================================================

/// A reference to a heap object.
///
/// `index` is the arena slot and `generation` the number of times that slot
/// had been freed when the object was placed in it, so a handle to a swept
/// object never equals a handle to the slot's next occupant. `hash` is fixed
/// at allocation: the content hash for strings, a mix of slot and generation
/// for everything else. Because strings are interned, identity on `GcRef`
/// doubles as string equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRef {
    index: u32,
    generation: u32,
    hash: u32,
}

impl GcRef {
    pub(crate) fn new(index: u32, generation: u32, hash: u32) -> Self {
        Self {
            index,
            generation,
            hash,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

fn identity_hash(index: u32, generation: u32) -> u32 {
    (index.wrapping_add(1) ^ generation.rotate_left(16)).wrapping_mul(0x9E37_79B1)
}

// =============================================================================
// HeapObject
// =============================================================================

#[derive(Debug)]
pub enum HeapObject {
    String(ObjString),
    Function(Function),
    Closure(Closure),
    Module(Module),
    Switch(SwitchTable),
}

impl HeapObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapObject::String(_) => "string",
            HeapObject::Function(_) => "function",
            HeapObject::Closure(_) => "closure",
            HeapObject::Module(_) => "module",
            HeapObject::Switch(_) => "switch",
        }
    }

    pub fn as_string(&self) -> Option<&ObjString> {
        match self {
            HeapObject::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            HeapObject::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Closure> {
        match self {
            HeapObject::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&Module> {
        match self {
            HeapObject::Module(m) => Some(m),
            _ => None,
        }
    }

    /// Push every object this one refers to onto the marker's gray list.
    fn trace(&self, marker: &mut Marker) {
        match self {
            HeapObject::String(_) => {}
            HeapObject::Function(f) => {
                if let Some(name) = f.name {
                    marker.mark_ref(name);
                }
                marker.mark_ref(f.module);
                f.chunk.mark_constants(|v| marker.mark_value(v));
            }
            HeapObject::Closure(c) => marker.mark_ref(c.function),
            HeapObject::Module(m) => m.values.mark_roots(|v| marker.mark_value(v)),
            HeapObject::Switch(s) => s.table.mark_roots(|v| marker.mark_value(v)),
        }
    }
}

// =============================================================================
// Heap - object arena
// =============================================================================

struct Slots {
    objects: Vec<Option<Arc<HeapObject>>>,
    /// Current generation of each slot; bumped when the slot is freed
    generations: Vec<u32>,
    free: Vec<u32>,
}

/// Identifier of a pinned root. Release it with [`Heap::unpin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootId(u64);

/// The garbage-collected object arena.
///
/// Objects live in slots addressed by [`GcRef`]. Freed slots go on a free
/// list and are reused by later allocations.
pub struct Heap {
    slots: RwLock<Slots>,
    /// Values kept alive independently of any table (scoped guards, pins)
    roots: Mutex<Vec<(u64, Value)>>,
    next_root: AtomicU64,
    /// Active [`CollectionPause`] guards
    paused: AtomicUsize,
    /// Allocations since the last sweep
    allocations: AtomicUsize,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                objects: Vec::new(),
                generations: Vec::new(),
                free: Vec::new(),
            }),
            roots: Mutex::new(Vec::new()),
            next_root: AtomicU64::new(1),
            paused: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
        }
    }

    /// Place an object in the arena. Never triggers a collection by itself.
    ///
    /// The returned handle is not a root; see [`alloc_rooted`](Self::alloc_rooted).
    pub fn alloc(&self, object: HeapObject) -> GcRef {
        let (r, guard) = self.alloc_rooted(object);
        drop(guard);
        r
    }

    /// Place an object in the arena and root it before any collector can see
    /// the slot.
    pub fn alloc_rooted(&self, object: HeapObject) -> (GcRef, RootGuard<'_>) {
        let string_hash = object.as_string().map(|s| s.hash);
        let object = Some(Arc::new(object));

        let mut slots = self.slots.write();
        let index = match slots.free.pop() {
            Some(index) => {
                slots.objects[index as usize] = object;
                index
            }
            None => {
                let index = u32::try_from(slots.objects.len())
                    .unwrap_or_else(|_| panic!("object arena exhausted"));
                slots.objects.push(object);
                slots.generations.push(0);
                index
            }
        };
        let generation = slots.generations[index as usize];
        let hash = string_hash.unwrap_or_else(|| identity_hash(index, generation));
        let r = GcRef::new(index, generation, hash);
        // Pinned while the arena is still locked: a collector snapshots the
        // arena before it reads the roots, so it sees either both or neither.
        let guard = self.protect(Value::Obj(r));
        drop(slots);

        self.allocations.fetch_add(1, Ordering::Relaxed);
        (r, guard)
    }

    /// The object behind `r`, or `None` once it has been swept.
    pub fn get(&self, r: GcRef) -> Option<Arc<HeapObject>> {
        let slots = self.slots.read();
        if slots.generations.get(r.index()) != Some(&r.generation) {
            return None;
        }
        slots.objects.get(r.index())?.clone()
    }

    /// Number of live (not yet swept) objects.
    pub fn object_count(&self) -> usize {
        let slots = self.slots.read();
        slots.objects.len() - slots.free.len()
    }

    pub fn allocations_since_sweep(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Keep `value` alive until the returned guard is dropped.
    pub fn protect(&self, value: Value) -> RootGuard<'_> {
        RootGuard {
            heap: self,
            id: self.pin(value),
        }
    }

    /// Keep `value` alive until [`unpin`](Self::unpin) is called with the returned id.
    pub fn pin(&self, value: Value) -> RootId {
        let id = self.next_root.fetch_add(1, Ordering::Relaxed);
        self.roots.lock().push((id, value));
        RootId(id)
    }

    pub fn unpin(&self, id: RootId) {
        let mut roots = self.roots.lock();
        if let Some(pos) = roots.iter().rposition(|(rid, _)| *rid == id.0) {
            roots.swap_remove(pos);
        }
    }

    pub fn roots(&self) -> Vec<Value> {
        self.roots.lock().iter().map(|(_, v)| *v).collect()
    }

    /// Suspend automatic collection until the returned guard is dropped.
    pub fn pause_collection(&self) -> CollectionPause<'_> {
        self.paused.fetch_add(1, Ordering::AcqRel);
        CollectionPause { heap: self }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire) > 0
    }

    /// Whether an automatic collection is due after `threshold` allocations.
    pub fn should_collect(&self, threshold: usize) -> bool {
        !self.is_paused() && self.allocations_since_sweep() >= threshold
    }

    /// Sweep phase: free every object that was live when `marker` was
    /// created and has not been marked since. Returns the number freed.
    pub fn sweep(&self, marker: &Marker) -> usize {
        let mut slots = self.slots.write();
        let mut freed = 0;
        for index in 0..slots.objects.len() {
            let live_at_start = marker.live_at_start.get(index).copied().unwrap_or(false);
            if live_at_start && !marker.marked[index] && slots.objects[index].is_some() {
                slots.objects[index] = None;
                slots.generations[index] = slots.generations[index].wrapping_add(1);
                slots.free.push(index as u32);
                freed += 1;
            }
        }
        self.allocations.store(0, Ordering::Relaxed);
        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped root: the protected value survives collections while this lives.
pub struct RootGuard<'h> {
    heap: &'h Heap,
    id: RootId,
}

impl RootGuard<'_> {
    /// Hand the root over to the caller, who must [`unpin`](Heap::unpin) it.
    pub fn into_id(self) -> RootId {
        let id = self.id;
        std::mem::forget(self);
        id
    }
}

impl Drop for RootGuard<'_> {
    fn drop(&mut self) {
        self.heap.unpin(self.id);
    }
}

pub struct CollectionPause<'h> {
    heap: &'h Heap,
}

impl Drop for CollectionPause<'_> {
    fn drop(&mut self) {
        self.heap.paused.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// Marker - mark phase state
// =============================================================================

/// Mark bits and gray worklist for one collection cycle.
///
/// Objects allocated after the marker was created are treated as marked,
/// so concurrent allocations survive the cycle.
pub struct Marker {
    marked: Vec<bool>,
    live_at_start: Vec<bool>,
    gray: Vec<GcRef>,
}

impl Marker {
    pub fn new(heap: &Heap) -> Self {
        let slots = heap.slots.read();
        let live_at_start: Vec<bool> = slots.objects.iter().map(Option::is_some).collect();
        Self {
            marked: vec![false; live_at_start.len()],
            live_at_start,
            gray: Vec::new(),
        }
    }

    pub fn mark_value(&mut self, value: &Value) {
        if let Value::Obj(r) = value {
            self.mark_ref(*r);
        }
    }

    pub fn mark_ref(&mut self, r: GcRef) {
        if let Some(bit) = self.marked.get_mut(r.index()) {
            if !*bit {
                *bit = true;
                self.gray.push(r);
            }
        }
    }

    /// Whether `value` survives this cycle. Non-objects always do.
    pub fn is_marked(&self, value: &Value) -> bool {
        match value {
            Value::Obj(r) => self.marked.get(r.index()).copied().unwrap_or(true),
            _ => true,
        }
    }

    /// Drain the gray list, marking everything reachable from it.
    pub fn trace(&mut self, heap: &Heap) {
        while let Some(r) = self.gray.pop() {
            if let Some(object) = heap.get(r) {
                object.trace(self);
            }
        }
    }
}
