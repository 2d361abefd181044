// This module defines error types for kernelgen using the thiserror crate. CompileError
// covers the two fatal families of the lowering call: unsupported lowerings (a node or
// cast with no rule for the chosen target) and invariant violations in the input graph
// (operands referenced before definition, accumulators assigned twice, malformed
// immediates). Each variant carries enough context (op, result type, operand types,
// node ids) for the caller to add a rule or reject the program. CompileResult<T> is the
// crate-wide alias for Result<T, CompileError>.

//! Error types for the lowering engine.

use thiserror::Error;

use super::dtype::DType;
use super::node::{NodeId, Op};

/// Main error type for lowering.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("failed to render {op} with {dtype} srcs [{}]", join_types(.operands))]
    UnsupportedLowering {
        op: Op,
        dtype: DType,
        operands: Vec<DType>,
    },

    #[error("cast from {from} -> {to} not implemented")]
    UnsupportedCast {
        from: DType,
        to: DType,
    },

    #[error("can't assign to accumulator {acc} twice")]
    DuplicateAssign {
        acc: NodeId,
    },

    #[error("node {node} references {operand} before it is defined")]
    UndefinedOperand {
        node: NodeId,
        operand: NodeId,
    },

    #[error("invalid node {node}: {reason}")]
    InvalidNode {
        node: NodeId,
        reason: String,
    },

    #[error("legalization of node {node} did not settle")]
    LegalizationDepth {
        node: NodeId,
    },
}

fn join_types(types: &[DType]) -> String {
    types.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
}

/// Result type alias for lowering operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_lowering_message() {
        let err = CompileError::UnsupportedLowering {
            op: Op::Max,
            dtype: DType::F32,
            operands: vec![DType::F32, DType::F32],
        };
        assert_eq!(err.to_string(), "failed to render max with f32 srcs [f32, f32]");
    }
}
