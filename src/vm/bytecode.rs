//! Portable chunk serialization.
//!
//! Binary format (little-endian):
//! - int: 8-byte IEEE-754 double, truncated on decode
//! - string: int length, then that many raw bytes (module names and files
//!   must be UTF-8; string constants and function names may hold any bytes)
//! - chunk: int instruction count, one int line per instruction, the raw
//!   instruction bytes, int constant count, then the tagged constants
//! - constant: int tag, then the payload for that tag
//! - function: int kind, int arity, int upvalue count, 1 byte variadic flag,
//!   string name (empty = anonymous), string module name, string module file,
//!   int nested chunk length, then the nested chunk
//! - closure: int upvalue count, then a function record
//!
//! Every int is written as a double so the format does not depend on the
//! writer's native integer width.

use std::io::{self, Write};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use tempfile::NamedTempFile;

use super::chunk::{Chunk, ChunkData};
use super::heap::{GcRef, HeapObject, RootGuard};
use super::object::{Closure, Function, FunctionKind};
use super::runtime::Runtime;
use super::Value;

const TAG_NIL: i64 = 0;
const TAG_BOOL: i64 = 1;
const TAG_NUMBER: i64 = 2;
const TAG_STRING: i64 = 3;
const TAG_FUNCTION: i64 = 4;
const TAG_CLOSURE: i64 = 5;
const TAG_SWITCH: i64 = 6;

const INT_SIZE: usize = 8;
/// Smallest encoding of one instruction: its line plus the byte itself
const MIN_INSTRUCTION_SIZE: usize = INT_SIZE + 1;
/// Smallest encoding of one constant: a tag plus a one-byte payload
const MIN_CONSTANT_SIZE: usize = INT_SIZE + 1;
/// Largest integer a double represents exactly
const MAX_INT: f64 = 9_007_199_254_740_992.0;
const MAX_NESTING: usize = 256;

/// Error type for chunk serialization
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    /// Truncated, malformed or trailing input
    #[error("corrupt stream: {0}")]
    CorruptStream(String),
    /// A constant with no defined encoding
    #[error("unserializable value: {0}")]
    Unserializable(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn corrupt(msg: impl Into<String>) -> SerializeError {
    SerializeError::CorruptStream(msg.into())
}

// =============================================================================
// Entry points
// =============================================================================

/// Encode a chunk to bytes.
pub fn encode(rt: &Runtime, chunk: &Chunk) -> Result<Vec<u8>, SerializeError> {
    let _pause = rt.heap().pause_collection();
    let mut buf = Vec::new();
    Encoder { rt }.chunk(&mut buf, &chunk.snapshot(), 0)?;
    Ok(buf)
}

/// A decoded chunk whose constants stay rooted while it is alive.
///
/// Derefs to the [`Chunk`]. Objects nested in function constants are
/// reachable through those functions.
pub struct RootedChunk<'rt> {
    chunk: Chunk,
    _roots: Vec<RootGuard<'rt>>,
}

impl RootedChunk<'_> {
    /// Release the roots and return the bare chunk. Its constants must be
    /// reachable from some other root before the next collection.
    pub fn into_chunk(self) -> Chunk {
        self.chunk
    }
}

impl Deref for RootedChunk<'_> {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        &self.chunk
    }
}

/// Decode a chunk. The whole of `data` must be one chunk encoding.
///
/// Decoded functions are attached to registered modules, looked up by name
/// and created on first use.
pub fn decode<'rt>(rt: &'rt Runtime, data: &[u8]) -> Result<RootedChunk<'rt>, SerializeError> {
    let mut reader = Reader::new(data);
    let mut decoder = Decoder {
        rt,
        roots: Vec::new(),
    };
    let decoded = decoder.chunk(&mut reader, 0)?;
    reader.finish()?;

    let roots = decoded.constants.iter().map(|v| rt.heap().protect(*v)).collect();
    drop(decoder);
    Ok(RootedChunk {
        chunk: Chunk::from_data(decoded),
        _roots: roots,
    })
}

/// Encode `chunk` to a writer.
pub fn write_chunk<W: Write>(w: &mut W, rt: &Runtime, chunk: &Chunk) -> Result<(), SerializeError> {
    let bytes = encode(rt, chunk)?;
    w.write_all(&bytes)?;
    Ok(())
}

/// Encode `chunk` and write it to `destination`, returning the encoded bytes.
///
/// The file is written to a temporary sibling and renamed into place, so on
/// failure `destination` is left untouched.
pub fn serialize(rt: &Runtime, chunk: &Chunk, destination: &Path) -> Result<Vec<u8>, SerializeError> {
    let bytes = encode(rt, chunk)?;

    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(&bytes)?;
    file.flush()?;
    file.persist(destination).map_err(|e| e.error)?;

    log::debug!("wrote {} bytes to {}", bytes.len(), destination.display());
    Ok(bytes)
}

/// Decode a previously serialized chunk.
pub fn deserialize<'rt>(rt: &'rt Runtime, bytes: &[u8]) -> Result<RootedChunk<'rt>, SerializeError> {
    decode(rt, bytes)
}

// =============================================================================
// Writing
// =============================================================================

fn write_int<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_all(&(v as f64).to_le_bytes())
}

fn write_len<W: Write>(w: &mut W, len: usize) -> io::Result<()> {
    write_int(w, len as i64)
}

fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn write_f64<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_len(w, bytes.len())?;
    w.write_all(bytes)
}

fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_bytes(w, s.as_bytes())
}

struct Encoder<'rt> {
    rt: &'rt Runtime,
}

impl Encoder<'_> {
    fn chunk(&self, w: &mut Vec<u8>, data: &ChunkData, depth: usize) -> Result<(), SerializeError> {
        if depth > MAX_NESTING {
            return Err(SerializeError::Unserializable("function nesting too deep"));
        }

        write_len(w, data.code.len())?;
        for &line in &data.lines {
            write_int(w, line as i64)?;
        }
        w.write_all(&data.code)?;

        write_len(w, data.constants.len())?;
        for constant in &data.constants {
            self.constant(w, constant, depth)?;
        }
        Ok(())
    }

    fn constant(&self, w: &mut Vec<u8>, value: &Value, depth: usize) -> Result<(), SerializeError> {
        match value {
            Value::Nil => {
                write_int(w, TAG_NIL)?;
                write_u8(w, 0)?;
            }
            Value::Bool(b) => {
                write_int(w, TAG_BOOL)?;
                write_u8(w, *b as u8)?;
            }
            Value::Number(n) => {
                write_int(w, TAG_NUMBER)?;
                write_f64(w, *n)?;
            }
            Value::Obj(r) => {
                let object = self.object(*r)?;
                match &*object {
                    HeapObject::String(s) => {
                        write_int(w, TAG_STRING)?;
                        write_bytes(w, s.as_bytes())?;
                    }
                    HeapObject::Function(f) => {
                        write_int(w, TAG_FUNCTION)?;
                        self.function(w, f, depth)?;
                    }
                    HeapObject::Closure(c) => {
                        write_int(w, TAG_CLOSURE)?;
                        write_len(w, c.upvalue_count)?;
                        let function = self.object(c.function)?;
                        let f = function
                            .as_function()
                            .ok_or(SerializeError::Unserializable("closure over a non-function"))?;
                        self.function(w, f, depth)?;
                    }
                    HeapObject::Switch(_) => return Err(SerializeError::Unserializable("switch")),
                    HeapObject::Module(_) => return Err(SerializeError::Unserializable("module")),
                }
            }
        }
        Ok(())
    }

    fn function(&self, w: &mut Vec<u8>, f: &Function, depth: usize) -> Result<(), SerializeError> {
        write_int(w, f.kind as i64)?;
        write_len(w, f.arity)?;
        write_len(w, f.upvalue_count)?;
        write_u8(w, f.is_variadic as u8)?;

        let name = match f.name {
            Some(r) => self
                .rt
                .string_bytes(r)
                .ok_or(SerializeError::Unserializable("function name is not a string"))?,
            None => Vec::new(),
        };
        write_bytes(w, &name)?;

        let module = self.object(f.module)?;
        let module = module
            .as_module()
            .ok_or(SerializeError::Unserializable("function module is not a module"))?;
        write_str(w, &module.name)?;
        write_str(w, &module.file)?;

        let mut nested = Vec::new();
        self.chunk(&mut nested, &f.chunk.snapshot(), depth + 1)?;
        write_len(w, nested.len())?;
        w.write_all(&nested)?;
        Ok(())
    }

    fn object(&self, r: GcRef) -> Result<Arc<HeapObject>, SerializeError> {
        self.rt
            .heap()
            .get(r)
            .ok_or(SerializeError::Unserializable("dangling reference"))
    }
}

// =============================================================================
// Reading
// =============================================================================

/// Bounds-checked cursor over an encoded chunk.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SerializeError> {
        if n > self.remaining() {
            return Err(corrupt(format!(
                "unexpected end of stream at offset {} (wanted {} bytes, {} left)",
                self.pos,
                n,
                self.remaining()
            )));
        }
        let data: &'a [u8] = self.data;
        let bytes = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, SerializeError> {
        Ok(self.take(1)?[0])
    }

    fn read_f64(&mut self) -> Result<f64, SerializeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(buf))
    }

    fn read_int(&mut self) -> Result<i64, SerializeError> {
        let d = self.read_f64()?;
        if !d.is_finite() || d.abs() >= MAX_INT {
            return Err(corrupt(format!("integer field out of range: {}", d)));
        }
        Ok(d.trunc() as i64)
    }

    /// A non-negative count.
    fn read_count(&mut self, what: &str) -> Result<usize, SerializeError> {
        let n = self.read_int()?;
        usize::try_from(n).map_err(|_| corrupt(format!("negative {}: {}", what, n)))
    }

    /// A count of elements that each occupy at least `min_size` bytes,
    /// checked against what is left of the stream.
    fn read_len(&mut self, what: &str, min_size: usize) -> Result<usize, SerializeError> {
        let n = self.read_count(what)?;
        match n.checked_mul(min_size) {
            Some(needed) if needed <= self.remaining() => Ok(n),
            _ => Err(corrupt(format!(
                "{} {} exceeds remaining {} bytes",
                what,
                n,
                self.remaining()
            ))),
        }
    }

    fn read_bytes(&mut self, what: &str) -> Result<&'a [u8], SerializeError> {
        let len = self.read_len(what, 1)?;
        self.take(len)
    }

    fn read_str(&mut self, what: &str) -> Result<String, SerializeError> {
        let bytes = self.read_bytes(what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| corrupt(format!("{} is not valid UTF-8", what)))
    }

    fn finish(&self) -> Result<(), SerializeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(corrupt(format!("{} trailing bytes after chunk", n))),
        }
    }
}

/// Every object allocated while decoding stays rooted until the decoder is
/// dropped, since nothing else reaches it until the chunk is complete.
struct Decoder<'rt> {
    rt: &'rt Runtime,
    roots: Vec<RootGuard<'rt>>,
}

impl<'rt> Decoder<'rt> {
    fn keep(&mut self, (r, guard): (GcRef, RootGuard<'rt>)) -> GcRef {
        self.roots.push(guard);
        r
    }

    fn chunk(&mut self, r: &mut Reader<'_>, depth: usize) -> Result<ChunkData, SerializeError> {
        if depth > MAX_NESTING {
            return Err(corrupt("function nesting too deep"));
        }

        let count = r.read_len("instruction count", MIN_INSTRUCTION_SIZE)?;
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            let line = r.read_int()?;
            let line = u32::try_from(line).map_err(|_| corrupt(format!("invalid line number: {}", line)))?;
            lines.push(line);
        }
        let code = r.take(count)?.to_vec();

        let constant_count = r.read_len("constant count", MIN_CONSTANT_SIZE)?;
        let mut constants = Vec::with_capacity(constant_count);
        for index in 0..constant_count {
            let value = self.constant(r, depth)?;
            log::trace!("decoded constant {} at depth {}: {:?}", index, depth, value);
            constants.push(value);
        }

        Ok(ChunkData {
            code,
            lines,
            constants,
        })
    }

    fn constant(&mut self, r: &mut Reader<'_>, depth: usize) -> Result<Value, SerializeError> {
        let tag = r.read_int()?;
        match tag {
            TAG_NIL => match r.read_u8()? {
                0 => Ok(Value::Nil),
                b => Err(corrupt(format!("invalid nil payload: {}", b))),
            },
            TAG_BOOL => match r.read_u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                b => Err(corrupt(format!("invalid bool payload: {}", b))),
            },
            TAG_NUMBER => Ok(Value::Number(r.read_f64()?)),
            TAG_STRING => {
                let bytes = r.read_bytes("string length")?;
                let rt = self.rt;
                Ok(Value::Obj(self.keep(rt.intern_rooted(bytes))))
            }
            TAG_FUNCTION => Ok(Value::Obj(self.function(r, depth)?)),
            TAG_CLOSURE => {
                let upvalue_count = r.read_count("closure upvalue count")?;
                let function = self.function(r, depth)?;
                let rt = self.rt;
                Ok(Value::Obj(self.keep(rt.new_closure_rooted(Closure {
                    upvalue_count,
                    function,
                }))))
            }
            TAG_SWITCH => Err(corrupt("switch constants have no encoding")),
            _ => Err(corrupt(format!("unknown constant tag: {}", tag))),
        }
    }

    fn function(&mut self, r: &mut Reader<'_>, depth: usize) -> Result<GcRef, SerializeError> {
        let raw_kind = r.read_int()?;
        let kind = FunctionKind::from_raw(raw_kind)
            .ok_or_else(|| corrupt(format!("unknown function kind: {}", raw_kind)))?;
        let arity = r.read_count("arity")?;
        let upvalue_count = r.read_count("upvalue count")?;
        let is_variadic = match r.read_u8()? {
            0 => false,
            1 => true,
            b => return Err(corrupt(format!("invalid variadic flag: {}", b))),
        };
        let name = r.read_bytes("function name")?;
        let module_name = r.read_str("module name")?;
        let module_file = r.read_str("module file")?;

        let len = r.read_len("nested chunk length", 1)?;
        let mut nested = Reader::new(r.take(len)?);
        let chunk = self.chunk(&mut nested, depth + 1)?;
        nested.finish()?;

        let rt = self.rt;
        let module = rt.module_or_register(&module_name, &module_file);
        let name = if name.is_empty() {
            None
        } else {
            Some(self.keep(rt.intern_rooted(name)))
        };

        Ok(self.keep(rt.new_function_rooted(Function {
            kind,
            arity,
            upvalue_count,
            is_variadic,
            name,
            module,
            chunk: Chunk::from_data(chunk),
        })))
    }
}
