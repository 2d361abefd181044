// This module gathers the target-independent building blocks of kernelgen: the semantic
// types and node graph the engine consumes, the structural pattern matcher and ordered
// rule sets shared by legalization and selection, the arena-backed lowering session that
// owns names and emitted text for one call, the immutable target configuration, and the
// error types. Nothing here knows the textual IR; rendering lives in the llvm module.

//! Core infrastructure shared by every target.
//!
//! - [`dtype`]: scalar kinds, vectors and pointers
//! - [`node`]: ops, nodes and the topologically ordered [`Graph`]
//! - [`pattern`]: patterns, captures and priority-ordered rule sets
//! - [`session`]: name table and instruction buffer (arena allocated)
//! - [`target`]: capability flags and rule sets of an output dialect
//! - [`error`]: [`CompileError`]

pub mod dtype;
pub mod error;
pub mod node;
pub mod pattern;
pub mod session;
pub mod target;

pub use dtype::{DType, PtrInfo, ScalarType};
pub use error::{CompileError, CompileResult};
pub use node::{Arg, ConstValue, Graph, Node, NodeId, Op, OpInfo, WmmaArg};
pub use pattern::{Match, Pattern, Rule, RuleSet};
pub use session::{LoweringSession, SessionStats};
pub use target::{LegalizeFn, PrepassFn, SelectFn, Target};
