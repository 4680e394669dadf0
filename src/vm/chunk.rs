use std::fmt;

use parking_lot::Mutex;

use super::Value;

/// Plain contents of a [`Chunk`].
///
/// `code` and `lines` always have the same length: `lines[i]` is the source
/// line of `code[i]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkData {
    pub code: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
}

/// A growable instruction buffer with a parallel line table and a constant pool.
///
/// All operations take the chunk's own lock for their whole duration.
pub struct Chunk {
    data: Mutex<ChunkData>,
}

impl Chunk {
    /// Create a new, empty chunk.
    pub fn new() -> Self {
        Self {
            data: Mutex::new(ChunkData::default()),
        }
    }

    pub(crate) fn from_data(data: ChunkData) -> Self {
        debug_assert_eq!(data.code.len(), data.lines.len());
        Self {
            data: Mutex::new(data),
        }
    }

    /// Append one instruction byte compiled from `line`.
    pub fn write(&self, byte: u8, line: u32) {
        let mut data = self.data.lock();
        data.code.push(byte);
        data.lines.push(line);
    }

    /// Append a constant and return its index in the pool.
    ///
    /// The index is permanent for the life of the chunk. The caller must keep
    /// `value` reachable from a root for the duration of the call; see
    /// [`Runtime::add_constant`](super::Runtime::add_constant).
    pub fn add_constant(&self, value: Value) -> usize {
        let mut data = self.data.lock();
        data.constants.push(value);
        data.constants.len() - 1
    }

    /// Release all buffers. Idempotent.
    pub fn clear(&self) {
        *self.data.lock() = ChunkData::default();
    }

    /// Number of instruction bytes.
    pub fn len(&self) -> usize {
        self.data.lock().code.len()
    }

    /// Check if the chunk has no instructions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the instruction bytes.
    pub fn code(&self) -> Vec<u8> {
        self.data.lock().code.clone()
    }

    /// Copy of the line table.
    pub fn lines(&self) -> Vec<u32> {
        self.data.lock().lines.clone()
    }

    /// Copy of the constant pool.
    pub fn constants(&self) -> Vec<Value> {
        self.data.lock().constants.clone()
    }

    /// Get the constant at `index`.
    pub fn constant(&self, index: usize) -> Option<Value> {
        self.data.lock().constants.get(index).copied()
    }

    /// Number of constants in the pool.
    pub fn constant_count(&self) -> usize {
        self.data.lock().constants.len()
    }

    /// Source line of the instruction at `offset`.
    pub fn line_at(&self, offset: usize) -> Option<u32> {
        self.data.lock().lines.get(offset).copied()
    }

    /// Copy of the whole chunk, taken under one lock.
    pub fn snapshot(&self) -> ChunkData {
        self.data.lock().clone()
    }

    pub(crate) fn mark_constants<F>(&self, mut mark: F)
    where
        F: FnMut(&Value),
    {
        for value in &self.data.lock().constants {
            mark(value);
        }
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.lock();
        f.debug_struct("Chunk")
            .field("code", &data.code.len())
            .field("constants", &data.constants.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chunk_is_empty() {
        let chunk = Chunk::new();
        assert!(chunk.is_empty());
        assert_eq!(chunk.constant_count(), 0);
        chunk.write(0x01, 1);
        assert!(!chunk.is_empty());
    }

    #[test]
    fn test_write_keeps_lines_parallel() {
        let chunk = Chunk::new();
        for i in 0..100u8 {
            chunk.write(i, i as u32 / 10);
        }
        let data = chunk.snapshot();
        assert_eq!(data.code.len(), 100);
        assert_eq!(data.lines.len(), 100);
        assert_eq!(chunk.line_at(57), Some(5));
        assert_eq!(chunk.line_at(100), None);
    }

    #[test]
    fn test_constant_indices_are_sequential() {
        let chunk = Chunk::new();
        assert_eq!(chunk.add_constant(Value::Nil), 0);
        assert_eq!(chunk.add_constant(Value::Number(2.0)), 1);
        assert_eq!(chunk.constant(1), Some(Value::Number(2.0)));
        assert_eq!(chunk.constant_count(), 2);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let chunk = Chunk::new();
        chunk.write(1, 1);
        chunk.add_constant(Value::Bool(true));
        chunk.clear();
        chunk.clear();
        assert!(chunk.is_empty());
        assert_eq!(chunk.snapshot(), ChunkData::default());
    }
}
