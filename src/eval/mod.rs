// This module is a small reference interpreter for the textual IR that kernelgen emits.
// Tests use it to check what a lowered program computes as well as how it reads. The
// parser turns one `define` (plus any module-level `@local_N` arrays) into blocks of
// pre-decoded instructions; the machine then runs them over byte buffers owned by the
// caller, one instruction at a time, with phi nodes resolved against the block the
// branch came from. Only the instruction subset the lowering engine produces is
// understood. Anything it cannot evaluate faithfully, such as AMX inline assembly or
// the WMMA intrinsics, is reported as unsupported instead of being approximated.

//! Reference evaluator for emitted programs.
//!
//! ```ignore
//! use kernelgen::eval::{self, Machine, Value};
//!
//! let program = eval::parse(&text)?;
//! let mut machine = Machine::new(&program);
//! let data = machine.alloc_f32(&[1.0, 2.0, 3.0, 4.0]);
//! let out = machine.alloc_f32(&[0.0]);
//! machine.run(&[data, out])?;
//! assert_eq!(machine.read_f32(&out)?, vec![10.0]);
//! ```

pub mod machine;
pub mod parser;

use std::fmt;

use thiserror::Error;

use crate::core::dtype::ScalarType;

pub use machine::Machine;
pub use parser::{parse, Block, Inst, Operand, Program, Typed};

/// Errors raised while reading or running a program.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("read of undefined value {0}")]
    UndefinedValue(String),

    #[error("branch to unknown label %{0}")]
    UnknownLabel(String),

    #[error("phi {phi} has no incoming value for block %{block}")]
    MissingIncoming { phi: String, block: String },

    #[error("access of {size} bytes at offset {offset} is outside buffer {buffer} ({len} bytes)")]
    OutOfBounds { buffer: usize, offset: i64, size: usize, len: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("type error: expected {expected}, got {got}")]
    TypeError { expected: String, got: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("step limit of {0} instructions exceeded")]
    StepLimit(u64),

    #[error("expected {expected} arguments, got {got}")]
    ArgumentCount { expected: usize, got: usize },
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Types of the textual IR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    Int(u32),
    Half,
    BFloat,
    Float,
    Double,
    Ptr(Box<Type>),
    Vector(u32, Box<Type>),
    Array(u32, Box<Type>),
}

impl Type {
    /// Storage size in bytes. `i1` occupies a byte.
    pub fn size(&self) -> usize {
        match self {
            Type::Void => 0,
            Type::Int(bits) => (*bits as usize).div_ceil(8),
            Type::Half | Type::BFloat => 2,
            Type::Float => 4,
            Type::Double => 8,
            Type::Ptr(_) => 8,
            Type::Vector(n, elem) | Type::Array(n, elem) => *n as usize * elem.size(),
        }
    }

    pub fn is_float(&self) -> bool {
        self.float_kind().is_some()
    }

    /// Scalar kind used for rounding float results to this type.
    pub(crate) fn float_kind(&self) -> Option<ScalarType> {
        match self {
            Type::Half => Some(ScalarType::F16),
            Type::BFloat => Some(ScalarType::BF16),
            Type::Float => Some(ScalarType::F32),
            Type::Double => Some(ScalarType::F64),
            _ => None,
        }
    }

    /// Element type of a vector, or the type itself.
    pub fn element(&self) -> &Type {
        match self {
            Type::Vector(_, elem) => elem,
            other => other,
        }
    }

    pub fn lanes(&self) -> Option<u32> {
        match self {
            Type::Vector(n, _) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => f.write_str("void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Half => f.write_str("half"),
            Type::BFloat => f.write_str("bfloat"),
            Type::Float => f.write_str("float"),
            Type::Double => f.write_str("double"),
            Type::Ptr(base) => write!(f, "{base}*"),
            Type::Vector(n, elem) => write!(f, "<{n} x {elem}>"),
            Type::Array(n, elem) => write!(f, "[{n} x {elem}]"),
        }
    }
}

/// Address into one of the machine's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pointer {
    pub buffer: usize,
    pub offset: i64,
}

/// A runtime value.
#[derive(Clone, PartialEq)]
pub enum Value {
    /// Integer bits, zero-extended from the type's width.
    Int(u64),
    Float(f64),
    Ptr(Pointer),
    Vector(Vec<Value>),
    Poison,
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Ptr(p) => write!(f, "<buffer {} + {}>", p.buffer, p.offset),
            Self::Vector(lanes) => f.debug_list().entries(lanes).finish(),
            Self::Poison => f.write_str("poison"),
        }
    }
}

impl Value {
    /// Integer argument of width `bits`.
    pub fn int(bits: u32, v: i64) -> Value {
        Value::Int(mask(v as u64, bits))
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<Pointer> {
        match self {
            Self::Ptr(p) => Some(*p),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Ptr(_) => "pointer",
            Self::Vector(_) => "vector",
            Self::Poison => "poison",
        }
    }
}

/// Keep the low `bits` bits.
pub(crate) fn mask(v: u64, bits: u32) -> u64 {
    if bits >= 64 {
        v
    } else {
        v & ((1u64 << bits) - 1)
    }
}

/// Sign-extend the low `bits` bits.
pub(crate) fn sext(v: u64, bits: u32) -> i64 {
    if bits >= 64 || bits == 0 {
        v as i64
    } else {
        let shift = 64 - bits;
        ((v << shift) as i64) >> shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widths() {
        assert_eq!(Value::int(8, -1), Value::Int(0xff));
        assert_eq!(sext(0xff, 8), -1);
        assert_eq!(sext(0x7f, 8), 127);
        assert_eq!(mask(u64::MAX, 1), 1);
        assert_eq!(Type::Int(1).size(), 1);
        assert_eq!(Type::Vector(8, Box::new(Type::Half)).size(), 16);
    }
}
