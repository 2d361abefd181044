//! kernelgen - kernel node lists to textual LLVM-style IR.
//!
//! kernelgen takes a topologically ordered list of typed kernel operations
//! (arithmetic, memory access, loops, conditionals, matrix multiplies) and
//! emits one textual IR function for a chosen target. Lowering happens in
//! three steps: legalization rewrites nodes a target cannot express, pass 1
//! plans loop-carried accumulators, and pass 2 names every node and selects
//! its instruction text through a priority-ordered rule list.
//!
//! # Primary Usage
//!
//! ```ignore
//! use kernelgen::core::{DType, Graph, Target};
//! use kernelgen::llvm::lower;
//!
//! let mut g = Graph::new();
//! g.name("fill")?;
//! let out = g.define_global(0, DType::F32.ptr())?;
//! let i = g.const_int(DType::I32, 0)?;
//! let one = g.const_float(DType::F32, 1.0)?;
//! let idx = g.index(out, i)?;
//! g.store(idx, one)?;
//! let text = lower(&g, &Target::amdgpu("gfx1100"))?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - node model, patterns, session, target configuration, errors
//! - [`llvm`] - shared legalization, selection and control-flow lowering
//! - [`cpu`] - sequential target and its AMX matrix templates
//! - [`amdgpu`] - parallel AMD GPU target
//! - [`text`] - node-list text format and FileCheck-style filetests
//! - [`eval`] - reference evaluator for emitted programs

pub mod amdgpu;
pub mod core;
pub mod cpu;
pub mod eval;
pub mod llvm;
pub mod text;

pub use core::{CompileError, CompileResult, DType, Graph, Node, NodeId, Op, ScalarType, SessionStats, Target};
pub use llvm::{lower, lower_with_stats, Lowered};
