//! Runtime core: values, the object heap, tables, chunks, the chunk codec
//! and execution units.

mod chunk;
mod heap;
mod object;
mod runtime;
mod table;
mod value;

pub mod bytecode;
pub mod threads;

pub use bytecode::{RootedChunk, SerializeError};
pub use chunk::{Chunk, ChunkData};
pub use heap::{CollectionPause, GcRef, Heap, HeapObject, Marker, RootGuard, RootId};
pub use object::{Closure, Function, FunctionKind, Module, ObjString, SwitchTable, hash_string};
pub use runtime::{GcStats, Runtime};
pub use table::{MAX_LOAD, MIN_CAPACITY, Table};
pub use threads::{CancelToken, Execute, ExecutionContext, ExecutionUnit, UnitError, UnitState};
pub use value::Value;
