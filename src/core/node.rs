// This module defines the kernel node model consumed by the lowering engine. A Graph is
// an append-only vector of immutable Nodes stored in topological order: every operand
// of node i refers to a node with a smaller index, and Graph::push rejects anything
// else with CompileError::UndefinedOperand. Node identity is the NodeId (position), never
// structural equality, so two equal constants remain two nodes. Op is a closed enum
// with a const info() table in the style of an opcode descriptor; Arg is the per-op
// immediate payload (constant, buffer index, loop id, special index, WMMA shape, ...).
// The builder helpers compute result types the same way for every producer (tests, the
// text parser, legalization rules) so graphs built by hand and graphs read from text
// agree.

//! Kernel node model.

use std::fmt;
use std::ops::Index;

use super::dtype::{DType, ScalarType};
use super::error::{CompileError, CompileResult};

/// Position of a node in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Const,
    DefineGlobal,
    DefineVar,
    DefineLocal,
    DefineAcc,
    Name,
    Special,
    Index,
    Load,
    Store,
    Gep,
    Vectorize,
    Cast,
    Bitcast,
    Exp2,
    Log2,
    Sin,
    Sqrt,
    Recip,
    Add,
    Sub,
    Mul,
    IDiv,
    Mod,
    Max,
    CmpLt,
    CmpNe,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    FDiv,
    Where,
    Range,
    EndRange,
    If,
    EndIf,
    Assign,
    Wmma,
    Barrier,
}

/// Static description of an op.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    /// Has an effect beyond its value (memory, control flow, declarations).
    pub side_effect: bool,
    /// Fixed operand count, `None` for variadic ops.
    pub operands: Option<u8>,
    /// Lower bound on the operand count of a variadic op.
    pub min_operands: u8,
}

impl Op {
    /// Two-operand ALU ops.
    pub const BINARY: &'static [Op] = &[
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::IDiv,
        Op::Mod,
        Op::Max,
        Op::CmpLt,
        Op::CmpNe,
        Op::And,
        Op::Or,
        Op::Xor,
        Op::Shl,
        Op::Shr,
        Op::FDiv,
    ];

    /// Single-operand transcendental ops lowered to intrinsic calls.
    pub const TRANSCENDENTAL: &'static [Op] = &[Op::Exp2, Op::Log2, Op::Sin, Op::Sqrt];

    pub const ALL: &'static [Op] = &[
        Op::Const,
        Op::DefineGlobal,
        Op::DefineVar,
        Op::DefineLocal,
        Op::DefineAcc,
        Op::Name,
        Op::Special,
        Op::Index,
        Op::Load,
        Op::Store,
        Op::Gep,
        Op::Vectorize,
        Op::Cast,
        Op::Bitcast,
        Op::Exp2,
        Op::Log2,
        Op::Sin,
        Op::Sqrt,
        Op::Recip,
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::IDiv,
        Op::Mod,
        Op::Max,
        Op::CmpLt,
        Op::CmpNe,
        Op::And,
        Op::Or,
        Op::Xor,
        Op::Shl,
        Op::Shr,
        Op::FDiv,
        Op::Where,
        Op::Range,
        Op::EndRange,
        Op::If,
        Op::EndIf,
        Op::Assign,
        Op::Wmma,
        Op::Barrier,
    ];

    pub const fn info(self) -> OpInfo {
        use Op::*;
        const fn i(name: &'static str, side_effect: bool, operands: Option<u8>) -> OpInfo {
            let min_operands = match operands {
                Some(n) => n,
                None => 1,
            };
            OpInfo { name, side_effect, operands, min_operands }
        }
        match self {
            Const => i("const", false, Some(0)),
            DefineGlobal => i("define_global", true, Some(0)),
            DefineVar => i("define_var", true, Some(0)),
            DefineLocal => i("define_local", true, Some(0)),
            DefineAcc => i("define_acc", false, None),
            Name => i("name", true, Some(0)),
            Special => i("special", false, Some(0)),
            Index => OpInfo { min_operands: 2, ..i("index", false, None) },
            Load => i("load", false, None),
            Store => i("store", true, Some(2)),
            Gep => i("gep", false, Some(1)),
            Vectorize => i("vectorize", false, None),
            Cast => i("cast", false, Some(1)),
            Bitcast => i("bitcast", false, Some(1)),
            Exp2 => i("exp2", false, Some(1)),
            Log2 => i("log2", false, Some(1)),
            Sin => i("sin", false, Some(1)),
            Sqrt => i("sqrt", false, Some(1)),
            Recip => i("recip", false, Some(1)),
            Add => i("add", false, Some(2)),
            Sub => i("sub", false, Some(2)),
            Mul => i("mul", false, Some(2)),
            IDiv => i("idiv", false, Some(2)),
            Mod => i("mod", false, Some(2)),
            Max => i("max", false, Some(2)),
            CmpLt => i("cmplt", false, Some(2)),
            CmpNe => i("cmpne", false, Some(2)),
            And => i("and", false, Some(2)),
            Or => i("or", false, Some(2)),
            Xor => i("xor", false, Some(2)),
            Shl => i("shl", false, Some(2)),
            Shr => i("shr", false, Some(2)),
            FDiv => i("fdiv", false, Some(2)),
            Where => i("where", false, Some(3)),
            Range => i("range", true, Some(2)),
            EndRange => i("endrange", true, Some(1)),
            If => i("if", true, Some(1)),
            EndIf => i("endif", true, Some(1)),
            Assign => i("assign", true, Some(2)),
            Wmma => i("wmma", true, Some(3)),
            Barrier => i("barrier", true, Some(0)),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Op::ALL.iter().copied().find(|op| op.info().name == s)
    }

    pub fn is_binary(self) -> bool {
        Op::BINARY.contains(&self)
    }

    pub const fn is_compare(self) -> bool {
        matches!(self, Op::CmpLt | Op::CmpNe)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.info().name)
    }
}

/// Constant payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ConstValue {
    pub fn as_f64(self) -> f64 {
        match self {
            ConstValue::Bool(b) => b as i64 as f64,
            ConstValue::Int(v) => v as f64,
            ConstValue::Float(v) => v,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            ConstValue::Bool(b) => b as i64,
            ConstValue::Int(v) => v,
            ConstValue::Float(v) => v as i64,
        }
    }

    /// Coerce to the payload kind a constant of `dtype` carries.
    pub fn coerce(self, dtype: DType) -> ConstValue {
        if dtype.scalar.is_float() {
            ConstValue::Float(self.as_f64())
        } else if dtype.scalar.is_bool() {
            ConstValue::Bool(self.as_f64() != 0.0)
        } else {
            ConstValue::Int(self.as_i64())
        }
    }
}

/// Shape of a matrix-multiply node.
#[derive(Debug, Clone, PartialEq)]
pub struct WmmaArg {
    pub name: String,
    pub dtype_in: ScalarType,
    pub dtype_out: ScalarType,
    /// Lane counts of the A, B and C operands.
    pub upcast: [u32; 3],
}

/// Per-op immediate payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    None,
    Const(ConstValue),
    /// Buffer index for DefineGlobal/DefineLocal, loop id for Range.
    Index(u32),
    Var { name: String, min: i64, max: i64 },
    Name(String),
    /// Parallel index such as `gidx0` or `lidx2`, with its launch size.
    Special { name: String, size: u32 },
    /// Lane selection for Gep.
    Lanes(Vec<u32>),
    Wmma(WmmaArg),
}

/// One kernel operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub op: Op,
    pub dtype: DType,
    pub src: Vec<NodeId>,
    pub arg: Arg,
}

impl Node {
    pub fn new(op: Op, dtype: DType, src: Vec<NodeId>, arg: Arg) -> Self {
        Self { op, dtype, src, arg }
    }
}

/// Topologically ordered list of nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Build a graph from an already ordered node list, checking the order.
    pub fn from_nodes(nodes: Vec<Node>) -> CompileResult<Self> {
        let mut graph = Graph::new();
        for node in nodes {
            graph.push(node)?;
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i as u32), n))
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Append a node. Operands must already be defined.
    pub fn push(&mut self, node: Node) -> CompileResult<NodeId> {
        let id = NodeId(self.nodes.len() as u32);
        if let Some(&bad) = node.src.iter().find(|s| s.index() >= self.nodes.len()) {
            return Err(CompileError::UndefinedOperand { node: id, operand: bad });
        }
        let info = node.op.info();
        if let Some(n) = info.operands {
            if node.src.len() != n as usize {
                return Err(CompileError::InvalidNode {
                    node: id,
                    reason: format!("{} takes {} operands, got {}", node.op, n, node.src.len()),
                });
            }
        } else if node.src.len() < info.min_operands as usize {
            return Err(CompileError::InvalidNode {
                node: id,
                reason: format!("{} takes at least {} operands, got {}", node.op, info.min_operands, node.src.len()),
            });
        }
        self.nodes.push(node);
        Ok(id)
    }

    /// Number of users of every node.
    pub fn use_counts(&self) -> Vec<u32> {
        let mut uses = vec![0u32; self.nodes.len()];
        for node in &self.nodes {
            for s in &node.src {
                uses[s.index()] += 1;
            }
        }
        uses
    }

    fn add(&mut self, op: Op, dtype: DType, src: Vec<NodeId>, arg: Arg) -> CompileResult<NodeId> {
        self.push(Node::new(op, dtype, src, arg))
    }

    pub fn constant(&mut self, dtype: DType, value: ConstValue) -> CompileResult<NodeId> {
        self.add(Op::Const, dtype, vec![], Arg::Const(value.coerce(dtype)))
    }

    pub fn const_int(&mut self, dtype: DType, value: i64) -> CompileResult<NodeId> {
        self.constant(dtype, ConstValue::Int(value))
    }

    pub fn const_float(&mut self, dtype: DType, value: f64) -> CompileResult<NodeId> {
        self.constant(dtype, ConstValue::Float(value))
    }

    pub fn const_bool(&mut self, value: bool) -> CompileResult<NodeId> {
        self.constant(DType::BOOL, ConstValue::Bool(value))
    }

    /// Constant with the same type as `like`.
    pub fn const_like(&mut self, like: NodeId, value: ConstValue) -> CompileResult<NodeId> {
        let dtype = self[like].dtype;
        self.constant(dtype, value)
    }

    pub fn define_global(&mut self, index: u32, dtype: DType) -> CompileResult<NodeId> {
        self.add(Op::DefineGlobal, dtype, vec![], Arg::Index(index))
    }

    pub fn define_local(&mut self, index: u32, dtype: DType) -> CompileResult<NodeId> {
        self.add(Op::DefineLocal, dtype, vec![], Arg::Index(index))
    }

    pub fn define_var(&mut self, name: &str, dtype: DType, min: i64, max: i64) -> CompileResult<NodeId> {
        self.add(Op::DefineVar, dtype, vec![], Arg::Var { name: name.to_string(), min, max })
    }

    pub fn name(&mut self, name: &str) -> CompileResult<NodeId> {
        self.add(Op::Name, DType::VOID, vec![], Arg::Name(name.to_string()))
    }

    pub fn special(&mut self, name: &str, size: u32) -> CompileResult<NodeId> {
        self.add(Op::Special, DType::I32, vec![], Arg::Special { name: name.to_string(), size })
    }

    /// Element address `buf[idx]`; the result points at the buffer's element type.
    pub fn index(&mut self, buf: NodeId, idx: NodeId) -> CompileResult<NodeId> {
        let dtype = self[buf].dtype;
        self.add(Op::Index, dtype, vec![buf, idx], Arg::None)
    }

    /// Element address guarded by a boolean mask.
    pub fn index_masked(&mut self, buf: NodeId, idx: NodeId, mask: NodeId) -> CompileResult<NodeId> {
        let dtype = self[buf].dtype;
        self.add(Op::Index, dtype, vec![buf, idx, mask], Arg::None)
    }

    pub fn load(&mut self, idx: NodeId) -> CompileResult<NodeId> {
        let dtype = self[idx].dtype.base();
        self.add(Op::Load, dtype, vec![idx], Arg::None)
    }

    /// Load through a masked index yielding `alt` when the mask is false.
    pub fn load_masked(&mut self, idx: NodeId, alt: NodeId) -> CompileResult<NodeId> {
        let dtype = self[idx].dtype.base();
        self.add(Op::Load, dtype, vec![idx, alt], Arg::None)
    }

    pub fn store(&mut self, idx: NodeId, value: NodeId) -> CompileResult<NodeId> {
        self.add(Op::Store, DType::VOID, vec![idx, value], Arg::None)
    }

    /// Binary ALU op. Compares produce bool (lane-matched), everything else the lhs type.
    pub fn alu(&mut self, op: Op, lhs: NodeId, rhs: NodeId) -> CompileResult<NodeId> {
        let lt = self[lhs].dtype;
        let dtype = if op.is_compare() { DType::BOOL.vec(lt.count) } else { lt };
        self.add(op, dtype, vec![lhs, rhs], Arg::None)
    }

    pub fn unary(&mut self, op: Op, x: NodeId) -> CompileResult<NodeId> {
        let dtype = self[x].dtype;
        self.add(op, dtype, vec![x], Arg::None)
    }

    /// Value cast. A cast to the operand's own type is the operand itself.
    pub fn cast(&mut self, x: NodeId, dtype: DType) -> CompileResult<NodeId> {
        if self[x].dtype == dtype {
            return Ok(x);
        }
        self.add(Op::Cast, dtype, vec![x], Arg::None)
    }

    pub fn bitcast(&mut self, x: NodeId, dtype: DType) -> CompileResult<NodeId> {
        self.add(Op::Bitcast, dtype, vec![x], Arg::None)
    }

    pub fn where_(&mut self, cond: NodeId, then: NodeId, otherwise: NodeId) -> CompileResult<NodeId> {
        let dtype = self[then].dtype;
        self.add(Op::Where, dtype, vec![cond, then, otherwise], Arg::None)
    }

    pub fn gep(&mut self, x: NodeId, lane: u32) -> CompileResult<NodeId> {
        let dtype = self[x].dtype.scalar_type();
        self.add(Op::Gep, dtype, vec![x], Arg::Lanes(vec![lane]))
    }

    pub fn vectorize(&mut self, lanes: &[NodeId]) -> CompileResult<NodeId> {
        let first = lanes.first().copied().ok_or_else(|| CompileError::InvalidNode {
            node: NodeId(self.nodes.len() as u32),
            reason: "vectorize needs at least one lane".to_string(),
        })?;
        let dtype = self[first].dtype.vec(lanes.len() as u32);
        self.add(Op::Vectorize, dtype, lanes.to_vec(), Arg::None)
    }

    /// Loop over `start..end` identified by `id`.
    pub fn range(&mut self, id: u32, start: NodeId, end: NodeId) -> CompileResult<NodeId> {
        let dtype = self[start].dtype;
        self.add(Op::Range, dtype, vec![start, end], Arg::Index(id))
    }

    pub fn end_range(&mut self, range: NodeId) -> CompileResult<NodeId> {
        self.add(Op::EndRange, DType::VOID, vec![range], Arg::None)
    }

    pub fn if_(&mut self, cond: NodeId) -> CompileResult<NodeId> {
        self.add(Op::If, DType::VOID, vec![cond], Arg::None)
    }

    pub fn end_if(&mut self, if_node: NodeId) -> CompileResult<NodeId> {
        self.add(Op::EndIf, DType::VOID, vec![if_node], Arg::None)
    }

    /// Accumulator starting at `init`, carried across `ranges`.
    pub fn define_acc(&mut self, init: NodeId, ranges: &[NodeId]) -> CompileResult<NodeId> {
        let dtype = self[init].dtype;
        let mut src = vec![init];
        src.extend_from_slice(ranges);
        self.add(Op::DefineAcc, dtype, src, Arg::None)
    }

    pub fn assign(&mut self, acc: NodeId, value: NodeId) -> CompileResult<NodeId> {
        let dtype = self[value].dtype;
        self.add(Op::Assign, dtype, vec![acc, value], Arg::None)
    }

    pub fn wmma(&mut self, dtype: DType, a: NodeId, b: NodeId, c: NodeId, arg: WmmaArg) -> CompileResult<NodeId> {
        self.add(Op::Wmma, dtype, vec![a, b, c], Arg::Wmma(arg))
    }

    pub fn barrier(&mut self) -> CompileResult<NodeId> {
        self.add(Op::Barrier, DType::VOID, vec![], Arg::None)
    }

    /// Append an arbitrary node.
    pub fn raw(&mut self, op: Op, dtype: DType, src: Vec<NodeId>, arg: Arg) -> CompileResult<NodeId> {
        self.add(op, dtype, src, arg)
    }
}

impl Index<NodeId> for Graph {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_rejects_forward_reference() {
        let mut g = Graph::new();
        let err = g.push(Node::new(Op::Cast, DType::F32, vec![NodeId(3)], Arg::None)).unwrap_err();
        assert!(matches!(err, CompileError::UndefinedOperand { operand: NodeId(3), .. }));
    }

    #[test]
    fn test_equal_constants_stay_distinct() {
        let mut g = Graph::new();
        let a = g.const_int(DType::I32, 1).unwrap();
        let b = g.const_int(DType::I32, 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(g[a], g[b]);
    }

    #[test]
    fn test_builder_result_types() {
        let mut g = Graph::new();
        let buf = g.define_global(0, DType::F32.ptr_sized(4)).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let idx = Graph::index(&mut g, buf, zero).unwrap();
        let ld = g.load(idx).unwrap();
        assert_eq!(g[ld].dtype, DType::F32);

        let lt = g.alu(Op::CmpLt, ld, ld).unwrap();
        assert_eq!(g[lt].dtype, DType::BOOL);

        // Casting to the same type does not create a node.
        assert_eq!(g.cast(ld, DType::F32).unwrap(), ld);
    }

    #[test]
    fn test_op_names_round_trip() {
        for &op in Op::ALL {
            assert_eq!(Op::parse(op.info().name), Some(op));
        }
    }

    #[test]
    fn test_arity_is_checked() {
        let mut g = Graph::new();
        let a = g.const_int(DType::I32, 1).unwrap();
        let err = g.raw(Op::Add, DType::I32, vec![a], Arg::None).unwrap_err();
        assert!(matches!(err, CompileError::InvalidNode { .. }));
    }

    #[test]
    fn test_variadic_minimum_is_checked() {
        let mut g = Graph::new();
        let err = g.raw(Op::DefineAcc, DType::F32, vec![], Arg::None).unwrap_err();
        assert!(matches!(err, CompileError::InvalidNode { .. }), "{err}");
        let buf = g.define_global(0, DType::F32.ptr()).unwrap();
        assert!(g.raw(Op::Index, DType::F32.ptr(), vec![buf], Arg::None).is_err());
        assert!(g.raw(Op::Vectorize, DType::F32.vec(2), vec![], Arg::None).is_err());
        let init = g.const_float(DType::F32, 0.0).unwrap();
        assert!(g.define_acc(init, &[]).is_ok());
    }
}
