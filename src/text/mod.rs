//! Textual node-list format (KIR) used by the CLI and the filetests.
//!
//! One node per line, in topological order:
//!
//! ```text
//! ; comments start with a semicolon
//! %buf  = define_global *f32[4] [0]
//! %zero = const i32 [0]
//! %four = const i32 [4]
//! %init = const f32 [0.0]
//! %r    = range i32 %zero, %four [0]
//! %acc  = define_acc f32 %init, %r
//! %idx  = index *f32[4] %buf, %r
//! %x    = load f32 %idx
//! %sum  = add f32 %acc, %x
//! %a    = assign f32 %acc, %sum
//!         endrange void %r
//! ```
//!
//! Every line is `[%name =] op type [operands] [[args]]`. Types are written
//! the way [`DType`](crate::core::DType) displays them (`f32`, `f16x8`,
//! `*f32[16]`, `*local f32[256]`). The bracketed immediates depend on the op:
//! a literal for `const`, an index for `define_global`/`define_local`/`range`,
//! `name, min, max` for `define_var`, `name, size` for `special`, lanes for
//! `gep`, `name, in, out, a, b, c` for `wmma` and the kernel name for `name`.

pub mod check;
pub mod parser;

use std::fmt::Write;

use thiserror::Error;

use crate::core::error::CompileError;
use crate::core::node::{Arg, ConstValue, Graph};

pub use check::{CheckDirective, RunDirective, TestRunner, TestSpec};
pub use parser::parse;

/// Error reading the node-list format.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: unknown op '{op}'")]
    UnknownOp { line: usize, op: String },

    #[error("line {line}: undefined value %{name}")]
    UndefinedValue { line: usize, name: String },

    #[error("line {line}: %{name} is defined twice")]
    Redefined { line: usize, name: String },

    #[error("line {line}: {source}")]
    Graph {
        line: usize,
        #[source]
        source: CompileError,
    },
}

fn write_const(out: &mut String, v: ConstValue) {
    let _ = match v {
        ConstValue::Bool(b) => write!(out, "{b}"),
        ConstValue::Int(i) => write!(out, "{i}"),
        ConstValue::Float(f) => write!(out, "{f:?}"),
    };
}

/// Print `graph` in the node-list format. Nodes are named `%0`, `%1`, ...
pub fn print(graph: &Graph) -> String {
    let mut out = String::new();
    for (id, node) in graph.iter() {
        let _ = write!(out, "%{} = {} {}", id.0, node.op, node.dtype);
        for (i, s) in node.src.iter().enumerate() {
            out.push_str(if i == 0 { " " } else { ", " });
            let _ = write!(out, "%{}", s.0);
        }
        let args = match &node.arg {
            Arg::None => None,
            Arg::Const(v) => {
                let mut s = String::new();
                write_const(&mut s, *v);
                Some(s)
            }
            Arg::Index(i) => Some(i.to_string()),
            Arg::Var { name, min, max } => Some(format!("{name}, {min}, {max}")),
            Arg::Name(name) => Some(name.clone()),
            Arg::Special { name, size } => Some(format!("{name}, {size}")),
            Arg::Lanes(lanes) => Some(lanes.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(", ")),
            Arg::Wmma(w) => Some(format!(
                "{}, {}, {}, {}, {}, {}",
                w.name, w.dtype_in, w.dtype_out, w.upcast[0], w.upcast[1], w.upcast[2]
            )),
        };
        if let Some(args) = args {
            let _ = write!(out, " [{args}]");
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dtype::DType;
    use crate::core::node::Op;

    #[test]
    fn test_print_reads_back() {
        let mut g = Graph::new();
        g.name("k").unwrap();
        let buf = g.define_global(0, DType::F32.ptr_sized(4)).unwrap();
        let n = g.define_var("n", DType::I32, 1, 9).unwrap();
        let nan = g.const_float(DType::F32, f64::NAN).unwrap();
        let idx = g.index(buf, n).unwrap();
        let v = g.alu(Op::Max, nan, nan).unwrap();
        g.store(idx, v).unwrap();

        let text = print(&g);
        assert!(text.contains("%1 = define_global *f32[4] [0]\n"), "{text}");
        assert!(text.contains("%2 = define_var i32 [n, 1, 9]\n"), "{text}");
        let back = parse(&text).unwrap();
        assert_eq!(back.len(), g.len());
        assert_eq!(print(&back), text);
    }
}
