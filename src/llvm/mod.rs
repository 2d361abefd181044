//! Shared lowering engine for the textual LLVM-style IR.
//!
//! The engine is target independent; targets contribute rules through
//! [`crate::core::target::Target`].
//!
//! # Example
//! ```ignore
//! use kernelgen::core::{DType, Graph, Target};
//! use kernelgen::llvm::lower;
//!
//! let mut g = Graph::new();
//! let out = g.define_global(0, DType::F32.ptr())?;
//! let zero = g.const_int(DType::I32, 0)?;
//! let one = g.const_float(DType::F32, 1.0)?;
//! let idx = g.index(out, zero)?;
//! g.store(idx, one)?;
//! let text = lower(&g, &Target::cpu())?;
//! ```

pub mod compiler;
pub mod control;
pub mod legalize;
pub mod rules;
pub mod types;

pub use compiler::{lower, lower_with_stats, Lowered};
pub use control::{plan_accumulators, Accumulator, AccumulatorPlan};
pub use legalize::{legalize, Legalizer};
pub use rules::Renderer;
pub use types::{lcast, lconst, ldt};
