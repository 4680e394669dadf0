use std::fmt;

use super::heap::GcRef;

/// A runtime value.
///
/// - Nil: the absent value
/// - Bool: true/false
/// - Number: 64-bit IEEE 754 double
/// - Obj: handle to a heap object (string, function, closure, module, ...)
///
/// Strings are interned, so two `Obj` handles to strings are equal exactly
/// when their contents are equal.
#[derive(Clone, Copy)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(GcRef),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    pub fn is_obj(&self) -> bool {
        matches!(self, Value::Obj(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<GcRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Obj(_) => true,
        }
    }

    /// Get the type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Obj(_) => "object",
        }
    }

    /// Hash used by [`Table`](super::Table) to pick a starting bucket.
    ///
    /// Equal values hash equal: `0.0` and `-0.0` share a hash, and object
    /// handles reuse the hash cached at allocation (content hash for strings).
    pub fn hash_value(&self) -> u32 {
        match self {
            Value::Nil => 0,
            Value::Bool(b) => {
                if *b {
                    3
                } else {
                    5
                }
            }
            Value::Number(n) => hash_number(*n),
            Value::Obj(r) => r.hash(),
        }
    }
}

fn hash_number(n: f64) -> u32 {
    let n = if n == 0.0 { 0.0 } else { n };
    (n.to_bits().wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as u32
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<GcRef> for Value {
    fn from(r: GcRef) -> Self {
        Value::Obj(r)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::Obj(r) => write!(f, "Obj({})", r.index()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Obj(r) => write!(f, "<object {}>", r.index()),
        }
    }
}
