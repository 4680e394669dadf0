//! Heap object payloads.

use super::chunk::Chunk;
use super::heap::GcRef;
use super::table::Table;

/// FNV-1a over raw string bytes. Interning and table probing both use it.
pub fn hash_string(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// An interned string: raw bytes, not necessarily UTF-8.
#[derive(Debug)]
pub struct ObjString {
    pub chars: Vec<u8>,
    pub hash: u32,
}

impl ObjString {
    pub fn new(chars: impl Into<Vec<u8>>) -> Self {
        let chars = chars.into();
        let hash = hash_string(&chars);
        Self { chars, hash }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.chars
    }

    /// The contents as text, if they are valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.chars).ok()
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

/// What a function was compiled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionKind {
    Function = 0,
    Method = 1,
    Initializer = 2,
    Private = 3,
    Static = 4,
    Script = 5,
}

impl FunctionKind {
    pub fn from_raw(raw: i64) -> Option<Self> {
        Some(match raw {
            0 => FunctionKind::Function,
            1 => FunctionKind::Method,
            2 => FunctionKind::Initializer,
            3 => FunctionKind::Private,
            4 => FunctionKind::Static,
            5 => FunctionKind::Script,
            _ => return None,
        })
    }
}

/// A compiled function. Owns its chunk exclusively.
#[derive(Debug)]
pub struct Function {
    pub kind: FunctionKind,
    pub arity: usize,
    pub upvalue_count: usize,
    pub is_variadic: bool,
    /// Interned name; `None` for anonymous functions.
    pub name: Option<GcRef>,
    pub module: GcRef,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(kind: FunctionKind, module: GcRef) -> Self {
        Self {
            kind,
            arity: 0,
            upvalue_count: 0,
            is_variadic: false,
            name: None,
            module,
            chunk: Chunk::new(),
        }
    }
}

/// A function paired with its own set of captured upvalues.
///
/// Several closures may share one function.
#[derive(Debug, Clone, Copy)]
pub struct Closure {
    pub upvalue_count: usize,
    pub function: GcRef,
}

/// A module namespace.
#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub file: String,
    pub values: Table,
}

impl Module {
    pub fn new(name: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            values: Table::new(),
        }
    }
}

/// Jump table emitted for `switch` statements.
#[derive(Debug)]
pub struct SwitchTable {
    pub table: Table,
    pub default_jump: Option<usize>,
    pub exit_jump: usize,
}

impl SwitchTable {
    pub fn new(exit_jump: usize) -> Self {
        Self {
            table: Table::new(),
            default_jump: None,
            exit_jump,
        }
    }
}
