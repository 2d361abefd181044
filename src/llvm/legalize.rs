// This module implements the legalization stage. legalize() walks the input graph once
// in order, copies each node into a fresh output graph with its operands remapped, and
// offers the copy to the target's legalization rules (first match wins). A handler that
// accepts the node builds its replacement through Legalizer::build, which offers every
// node it creates to the same rules, so a replacement that itself needs legalizing (an
// upcast feeding a bf16 load, say) is settled before it is used. The superseded copy and
// anything only it used are dropped by prune_dead() at the end; nodes with side effects
// always survive. The base rules below cover what the textual IR has no instruction for
// on every target: reciprocal, cast-to-bool, max, and bfloat16 storage and arithmetic.

//! Legalization: rewrite unsupported nodes into supported primitives.

use hashbrown::HashSet;
use log::trace;

use crate::core::dtype::{DType, ScalarType};
use crate::core::error::{CompileError, CompileResult};
use crate::core::node::{ConstValue, Graph, Node, NodeId, Op};
use crate::core::pattern::{Match, Pattern, Rule, RuleSet};
use crate::core::target::LegalizeFn;

/// Rewrite chains deeper than this are reported as not settling.
const MAX_DEPTH: u32 = 32;

/// Output graph under construction plus the rules applied to it.
pub struct Legalizer<'t> {
    out: Graph,
    rules: &'t RuleSet<LegalizeFn>,
    depth: u32,
    superseded: HashSet<NodeId>,
}

impl<'t> Legalizer<'t> {
    pub fn new(rules: &'t RuleSet<LegalizeFn>) -> Self {
        Self { out: Graph::new(), rules, depth: 0, superseded: HashSet::new() }
    }

    pub fn graph(&self) -> &Graph {
        &self.out
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.out[id]
    }

    pub fn dtype(&self, id: NodeId) -> DType {
        self.out[id].dtype
    }

    /// Create a node with one of the graph builder methods, then legalize it.
    pub fn build(&mut self, f: impl FnOnce(&mut Graph) -> CompileResult<NodeId>) -> CompileResult<NodeId> {
        let before = self.out.len();
        let id = f(&mut self.out)?;
        if id.index() >= before {
            self.settle(id)
        } else {
            Ok(id)
        }
    }

    pub fn constant(&mut self, dtype: DType, value: ConstValue) -> CompileResult<NodeId> {
        self.build(|g| g.constant(dtype, value))
    }

    pub fn alu(&mut self, op: Op, a: NodeId, b: NodeId) -> CompileResult<NodeId> {
        self.build(|g| g.alu(op, a, b))
    }

    pub fn cast(&mut self, x: NodeId, dtype: DType) -> CompileResult<NodeId> {
        self.build(|g| g.cast(x, dtype))
    }

    /// Offer `id` to the rules; returns the node that stands for it afterwards.
    fn settle(&mut self, id: NodeId) -> CompileResult<NodeId> {
        if self.depth >= MAX_DEPTH {
            return Err(CompileError::LegalizationDepth { node: id });
        }
        let rules = self.rules;
        for rule in rules.iter() {
            let Some(m) = rule.pattern.match_node(&self.out, id) else {
                continue;
            };
            self.depth += 1;
            let replaced = (rule.handler)(self, &m);
            self.depth -= 1;
            if let Some(new) = replaced? {
                if new != id {
                    self.superseded.insert(id);
                }
                trace!("legalized {} {} -> {}", self.out[id].op, id, new);
                return Ok(new);
            }
        }
        Ok(id)
    }
}

/// Legalize `graph` with `rules`, returning a new, pruned graph.
pub fn legalize(graph: &Graph, rules: &RuleSet<LegalizeFn>) -> CompileResult<Graph> {
    let mut lz = Legalizer::new(rules);
    let mut remap: Vec<NodeId> = Vec::with_capacity(graph.len());
    for (id, node) in graph.iter() {
        let mut src = Vec::with_capacity(node.src.len());
        for s in &node.src {
            let mapped = remap.get(s.index()).copied().ok_or(CompileError::UndefinedOperand { node: id, operand: *s })?;
            src.push(mapped);
        }
        let copy = lz.out.push(Node::new(node.op, node.dtype, src, node.arg.clone()))?;
        remap.push(lz.settle(copy)?);
    }
    prune_dead(&lz.out, &lz.superseded)
}

/// Drop value nodes that nothing with an effect depends on, and effects that were
/// replaced by a rewrite.
pub fn prune_dead(graph: &Graph, superseded: &HashSet<NodeId>) -> CompileResult<Graph> {
    let mut live = vec![false; graph.len()];
    for (id, node) in graph.iter().collect::<Vec<_>>().into_iter().rev() {
        if node.op.info().side_effect && !superseded.contains(&id) {
            live[id.index()] = true;
        }
        if live[id.index()] {
            for s in &node.src {
                live[s.index()] = true;
            }
        }
    }
    let mut out = Graph::new();
    let mut remap: Vec<Option<NodeId>> = vec![None; graph.len()];
    for (id, node) in graph.iter() {
        if !live[id.index()] {
            continue;
        }
        let src = node.src.iter().map(|s| remap[s.index()].ok_or(CompileError::UndefinedOperand { node: id, operand: *s }));
        let src = src.collect::<CompileResult<Vec<_>>>()?;
        remap[id.index()] = Some(out.push(Node::new(node.op, node.dtype, src, node.arg.clone()))?);
    }
    Ok(out)
}

fn recip_to_fdiv(lz: &mut Legalizer<'_>, m: &Match) -> CompileResult<Option<NodeId>> {
    let x = m["x"];
    let src = lz.node(x).src[0];
    let dtype = lz.dtype(x);
    let one = lz.constant(dtype, ConstValue::Float(1.0))?;
    lz.alu(Op::FDiv, one, src).map(Some)
}

fn cast_bool_to_cmpne(lz: &mut Legalizer<'_>, m: &Match) -> CompileResult<Option<NodeId>> {
    let y = lz.node(m["x"]).src[0];
    let dtype = lz.dtype(y);
    let zero = lz.constant(dtype, ConstValue::Int(0))?;
    lz.alu(Op::CmpNe, y, zero).map(Some)
}

/// max(a, b) = where(a < b, b, a). An unordered float compare selects `b`.
fn max_to_where(lz: &mut Legalizer<'_>, m: &Match) -> CompileResult<Option<NodeId>> {
    let (a, b) = (m["a"], m["b"]);
    let lt = lz.alu(Op::CmpLt, a, b)?;
    lz.build(|g| g.where_(lt, b, a)).map(Some)
}

/// Reproduce a bf16 load as a u16 load shifted into the high half of an f32.
fn bf16_load_cast(lz: &mut Legalizer<'_>, m: &Match) -> CompileResult<Option<NodeId>> {
    let (idx, root) = (m["idx"], m["root"]);
    let u16_ptr = lz.dtype(idx).with_scalar(ScalarType::U16);
    let p = lz.cast(idx, u16_ptr)?;
    let raw = lz.build(|g| g.load(p))?;
    let wide = lz.cast(raw, DType::U32)?;
    let shift = lz.constant(DType::U32, ConstValue::Int(1 << 16))?;
    let hi = lz.alu(Op::Mul, wide, shift)?;
    let f = lz.build(|g| g.bitcast(hi, DType::F32))?;
    let target = lz.dtype(root);
    lz.cast(f, target).map(Some)
}

/// Store a bf16 value as the high half of its f32 bit pattern (truncating).
fn bf16_store(lz: &mut Legalizer<'_>, m: &Match) -> CompileResult<Option<NodeId>> {
    let (idx, val) = (m["idx"], m["val"]);
    let u16_ptr = lz.dtype(idx).with_scalar(ScalarType::U16);
    let p = lz.cast(idx, u16_ptr)?;
    let f = lz.cast(val, DType::F32)?;
    let bits = lz.build(|g| g.bitcast(f, DType::U32))?;
    let shift = lz.constant(DType::U32, ConstValue::Int(1 << 16))?;
    let hi = lz.alu(Op::IDiv, bits, shift)?;
    let half = lz.cast(hi, DType::U16)?;
    lz.build(|g| g.store(p, half)).map(Some)
}

/// Compute a transcendental on bf16 in f32.
fn bf16_upcast_unary(lz: &mut Legalizer<'_>, m: &Match) -> CompileResult<Option<NodeId>> {
    let x = m["x"];
    let (op, src) = (lz.node(x).op, lz.node(x).src[0]);
    let wide = lz.cast(src, DType::F32)?;
    let r = lz.build(|g| g.unary(op, wide))?;
    lz.cast(r, DType::BF16).map(Some)
}

fn cast_from_bf16(lz: &mut Legalizer<'_>, m: &Match) -> CompileResult<Option<NodeId>> {
    let (x, y) = (m["x"], m["y"]);
    let target = lz.dtype(x);
    if target == DType::F32 {
        return Ok(None);
    }
    let f = lz.cast(y, DType::F32)?;
    lz.cast(f, target).map(Some)
}

fn cast_to_bf16(lz: &mut Legalizer<'_>, m: &Match) -> CompileResult<Option<NodeId>> {
    let x = m["x"];
    if lz.dtype(x) == DType::F32 {
        return Ok(None);
    }
    let f = lz.cast(x, DType::F32)?;
    lz.cast(f, DType::BF16).map(Some)
}

pub(crate) fn rule(pattern: Pattern, handler: LegalizeFn) -> Rule<LegalizeFn> {
    Rule::new(pattern, handler)
}

/// Rules every target inherits.
pub fn base_rules() -> RuleSet<LegalizeFn> {
    RuleSet::new(vec![
        rule(Pattern::op(Op::Recip).named("x"), recip_to_fdiv),
        rule(Pattern::op(Op::Cast).dtype(DType::BOOL).named("x"), cast_bool_to_cmpne),
        rule(Pattern::op(Op::Max).src(vec![Pattern::var("a"), Pattern::var("b")]), max_to_where),
        rule(
            Pattern::op(Op::Cast)
                .src(vec![Pattern::op(Op::Load)
                    .dtype(DType::BF16)
                    .src(vec![Pattern::op(Op::Index).src(vec![Pattern::any(), Pattern::any()]).named("idx")])])
                .named("root"),
            bf16_load_cast,
        ),
        rule(
            Pattern::op(Op::Store).src(vec![
                Pattern::op(Op::Index).scalar(ScalarType::BF16).src(vec![Pattern::any(), Pattern::any()]).named("idx"),
                Pattern::var("val").dtype(DType::BF16),
            ]),
            bf16_store,
        ),
        rule(Pattern::ops(Op::TRANSCENDENTAL).dtype(DType::BF16).named("x"), bf16_upcast_unary),
        rule(Pattern::op(Op::Cast).src(vec![Pattern::var("y").dtype(DType::BF16)]).named("x"), cast_from_bf16),
        rule(Pattern::op(Op::Cast).dtype(DType::BF16).src(vec![Pattern::var("x")]), cast_to_bf16),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(g: &Graph) -> Vec<Op> {
        g.nodes().iter().map(|n| n.op).collect()
    }

    #[test]
    fn test_max_becomes_compare_and_select() {
        let mut g = Graph::new();
        let buf = g.define_global(0, DType::F32.ptr()).unwrap();
        let a = g.const_float(DType::F32, 1.0).unwrap();
        let b = g.const_float(DType::F32, 2.0).unwrap();
        let m = g.alu(Op::Max, a, b).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let idx = g.index(buf, zero).unwrap();
        g.store(idx, m).unwrap();

        let out = legalize(&g, &base_rules()).unwrap();
        let kinds = ops(&out);
        assert!(!kinds.contains(&Op::Max));
        assert!(kinds.contains(&Op::CmpLt));
        let w = out.nodes().iter().find(|n| n.op == Op::Where).unwrap();
        // where(a < b, b, a)
        assert_eq!(out[w.src[1]].arg, out[out[w.src[0]].src[1]].arg);
        assert_eq!(out[w.src[2]].arg, out[out[w.src[0]].src[0]].arg);
    }

    #[test]
    fn test_recip_becomes_divide() {
        let mut g = Graph::new();
        let buf = g.define_global(0, DType::F32.ptr()).unwrap();
        let x = g.const_float(DType::F32, 4.0).unwrap();
        let r = g.unary(Op::Recip, x).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let idx = g.index(buf, zero).unwrap();
        g.store(idx, r).unwrap();

        let out = legalize(&g, &base_rules()).unwrap();
        let div = out.nodes().iter().find(|n| n.op == Op::FDiv).unwrap();
        assert_eq!(out[div.src[0]].arg, crate::core::node::Arg::Const(ConstValue::Float(1.0)));
        assert!(!ops(&out).contains(&Op::Recip));
    }

    #[test]
    fn test_unused_values_are_pruned() {
        let mut g = Graph::new();
        g.const_float(DType::F32, 4.0).unwrap();
        g.define_global(0, DType::F32.ptr()).unwrap();
        let out = legalize(&g, &base_rules()).unwrap();
        assert_eq!(ops(&out), vec![Op::DefineGlobal]);
    }

    #[test]
    fn test_bf16_load_uses_integer_bits() {
        let mut g = Graph::new();
        let src = g.define_global(0, DType::BF16.ptr()).unwrap();
        let dst = g.define_global(1, DType::F32.ptr()).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let idx = g.index(src, zero).unwrap();
        let ld = g.load(idx).unwrap();
        let f = g.cast(ld, DType::F32).unwrap();
        let out_idx = g.index(dst, zero).unwrap();
        g.store(out_idx, f).unwrap();

        let out = legalize(&g, &base_rules()).unwrap();
        let load = out.nodes().iter().find(|n| n.op == Op::Load).unwrap();
        assert_eq!(load.dtype, DType::U16);
        assert!(ops(&out).contains(&Op::Bitcast));
        assert!(out.nodes().iter().all(|n| n.dtype != DType::BF16));
    }

    #[test]
    fn test_bf16_sqrt_computed_in_f32() {
        let mut g = Graph::new();
        let buf = g.define_global(0, DType::BF16.ptr()).unwrap();
        let v = g.define_var("x", DType::F32, 0, 10).unwrap();
        let b = g.cast(v, DType::BF16).unwrap();
        let s = g.unary(Op::Sqrt, b).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let idx = g.index(buf, zero).unwrap();
        g.store(idx, s).unwrap();

        let out = legalize(&g, &base_rules()).unwrap();
        let sqrt = out.nodes().iter().find(|n| n.op == Op::Sqrt).unwrap();
        assert_eq!(sqrt.dtype, DType::F32);
        // The bf16 store became a u16 store and the original is gone.
        let stores: Vec<_> = out.nodes().iter().filter(|n| n.op == Op::Store).collect();
        assert_eq!(stores.len(), 1);
        assert_eq!(out[stores[0].src[1]].dtype, DType::U16);
    }

    #[test]
    fn test_cast_between_bf16_and_int_goes_through_f32() {
        let mut g = Graph::new();
        let buf = g.define_global(0, DType::I32.ptr()).unwrap();
        let v = g.define_var("x", DType::F32, 0, 10).unwrap();
        let b = g.cast(v, DType::BF16).unwrap();
        let i = g.cast(b, DType::I32).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let idx = g.index(buf, zero).unwrap();
        g.store(idx, i).unwrap();

        let out = legalize(&g, &base_rules()).unwrap();
        let casts: Vec<(DType, DType)> = out
            .nodes()
            .iter()
            .filter(|n| n.op == Op::Cast)
            .map(|n| (out[n.src[0]].dtype, n.dtype))
            .collect();
        assert_eq!(casts, vec![(DType::F32, DType::BF16), (DType::BF16, DType::F32), (DType::F32, DType::I32)]);
    }
}
