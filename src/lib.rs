//! Kiln - runtime core for a bytecode language
//!
//! This library provides the concurrent symbol table, bytecode chunks, a
//! portable chunk serialization format and OS-thread execution units.

pub mod config;
pub mod vm;

// Re-export commonly used types
pub use config::{ConfigError, RuntimeConfig};
pub use vm::{Chunk, ExecutionUnit, Runtime, Table, Value};
