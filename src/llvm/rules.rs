// This module implements the shared instruction-selection rules. A Renderer gives a
// handler read access to the legalized graph and to the session's name table; every
// operand it references has already been named by the time its user is rendered, and the
// node itself is named before its handler runs. Handlers return the node's instruction
// text (possibly several lines, possibly containing block labels) or None to let the
// next rule try. base_rules() lists memory access, vector assembly, casts, binary ALU
// ops through the opcode tables, select, and transcendental intrinsic calls, followed by
// the control-flow rules from the control module. Targets prepend their own rules.

//! Base selection rules and the renderer handed to selection handlers.

use crate::core::dtype::{DType, ScalarType};
use crate::core::error::{CompileError, CompileResult};
use crate::core::node::{Arg, Graph, Node, NodeId, Op};
use crate::core::pattern::{Match, Pattern, Rule, RuleSet};
use crate::core::session::LoweringSession;
use crate::core::target::SelectFn;

use super::control;
use super::types::{intrinsic_suffix, lcast, ldt};

/// View handed to selection handlers.
pub struct Renderer<'g, 's, 'arena> {
    graph: &'g Graph,
    session: &'s mut LoweringSession<'arena>,
}

impl<'g, 's, 'arena> Renderer<'g, 's, 'arena> {
    pub fn new(graph: &'g Graph, session: &'s mut LoweringSession<'arena>) -> Self {
        Self { graph, session }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn node(&self, id: NodeId) -> &'g Node {
        &self.graph[id]
    }

    pub fn dtype(&self, id: NodeId) -> DType {
        self.graph[id].dtype
    }

    /// Textual type of a node's result.
    pub fn ty(&self, id: NodeId) -> String {
        ldt(self.dtype(id))
    }

    /// Symbol of an already named node.
    pub fn name(&self, id: NodeId) -> CompileResult<&'arena str> {
        self.session.lookup(id).ok_or_else(|| CompileError::InvalidNode {
            node: id,
            reason: format!("{} is used before it has a value", self.graph[id].op),
        })
    }

    /// `<type> <name>` of an operand.
    pub fn typed(&self, id: NodeId) -> CompileResult<String> {
        Ok(format!("{} {}", self.ty(id), self.name(id)?))
    }

    /// Operand `i` of `id`.
    pub fn src(&self, id: NodeId, i: usize) -> CompileResult<NodeId> {
        self.graph[id].src.get(i).copied().ok_or_else(|| CompileError::InvalidNode {
            node: id,
            reason: format!("{} has no operand {}", self.graph[id].op, i),
        })
    }

    /// Add a trailing module declaration such as an intrinsic prototype.
    pub fn declare(&mut self, decl: &str) {
        self.session.declare_trailing(decl);
    }

    pub fn session(&mut self) -> &mut LoweringSession<'arena> {
        self.session
    }
}

/// Opcode of a binary op on operands of kind `scalar`.
pub fn lop(scalar: ScalarType, op: Op) -> Option<&'static str> {
    if scalar.is_float() {
        return Some(match op {
            Op::Add => "fadd nsz arcp contract afn",
            Op::Sub => "fsub nsz arcp contract afn",
            Op::Mul => "fmul nsz arcp contract afn",
            Op::FDiv => "fdiv nsz arcp contract afn",
            Op::CmpLt => "fcmp nsz arcp contract afn ult",
            Op::CmpNe => "fcmp nsz arcp contract afn une",
            _ => return None,
        });
    }
    let signed = scalar.is_signed();
    if !signed && !scalar.is_unsigned() && !scalar.is_bool() {
        return None;
    }
    Some(match op {
        Op::Add => "add",
        Op::Sub => "sub",
        Op::Mul => "mul",
        Op::IDiv if signed => "sdiv",
        Op::IDiv => "udiv",
        Op::Mod if signed => "srem",
        Op::Mod => "urem",
        Op::CmpLt if signed => "icmp slt",
        Op::CmpLt => "icmp ult",
        Op::CmpNe => "icmp ne",
        Op::And => "and",
        Op::Or => "or",
        Op::Xor => "xor",
        Op::Shl => "shl",
        Op::Shr if signed => "ashr",
        Op::Shr => "lshr",
        _ => return None,
    })
}

fn index(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let (buf, idx) = (r.src(x, 0)?, r.src(x, 1)?);
    Ok(Some(format!(
        "  {} = getelementptr inbounds {}, {}, {}",
        r.name(x)?,
        ldt(r.dtype(x).base()),
        r.typed(buf)?,
        r.typed(idx)?
    )))
}

fn load(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    Ok(Some(format!("  {} = load {}, {}", r.name(x)?, r.ty(x), r.typed(m["idx"])?)))
}

fn store(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    Ok(Some(format!("  store {}, {}", r.typed(m["val"])?, r.typed(m["idx"])?)))
}

fn gep(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let lane = match &r.node(x).arg {
        Arg::Lanes(lanes) if lanes.len() == 1 => lanes[0],
        _ => return Ok(None),
    };
    Ok(Some(format!("  {} = extractelement {}, i32 {}", r.name(x)?, r.typed(r.src(x, 0)?)?, lane)))
}

fn broadcast(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let (x, y) = (m.root, m["y"]);
    let (name, ty) = (r.name(x)?, r.ty(y));
    Ok(Some(format!(
        "  {name}_z = insertelement <1 x {ty}> poison, {ty} {}, i32 0\n  {name} = shufflevector <1 x {ty}> {name}_z, <1 x {ty}> poison, <{} x i32> zeroinitializer",
        r.name(y)?,
        r.dtype(x).count
    )))
}

fn vectorize(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let (name, ty) = (r.name(x)?, r.ty(x));
    let lanes = &r.node(x).src;
    let mut lines = Vec::with_capacity(lanes.len());
    for (i, &lane) in lanes.iter().enumerate() {
        let dst = if i + 1 == lanes.len() { name.to_string() } else { format!("{name}_{i}") };
        let prev = if i == 0 { "poison".to_string() } else { format!("{name}_{}", i - 1) };
        lines.push(format!("  {dst} = insertelement {ty} {prev}, {}, i32 {i}", r.typed(lane)?));
    }
    Ok(Some(lines.join("\n")))
}

fn pointer_cast(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    if !r.dtype(x).is_ptr() {
        return Ok(None);
    }
    bitcast(r, m)
}

fn bitcast(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    Ok(Some(format!("  {} = bitcast {} to {}", r.name(x)?, r.typed(r.src(x, 0)?)?, r.ty(x))))
}

fn cast(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let y = r.src(x, 0)?;
    let op = lcast(r.dtype(y), r.dtype(x))?;
    Ok(Some(format!("  {} = {} {} to {}", r.name(x)?, op, r.typed(y)?, r.ty(x))))
}

fn binary(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let (a, b) = (r.src(x, 0)?, r.src(x, 1)?);
    let Some(op) = lop(r.dtype(a).scalar, r.node(x).op) else {
        return Ok(None);
    };
    Ok(Some(format!("  {} = {} {}, {}", r.name(x)?, op, r.typed(a)?, r.name(b)?)))
}

fn select(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    Ok(Some(format!(
        "  {} = select {}, {}, {}",
        r.name(x)?,
        r.typed(r.src(x, 0)?)?,
        r.typed(r.src(x, 1)?)?,
        r.typed(r.src(x, 2)?)?
    )))
}

fn intrinsic(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let func = match r.node(x).op {
        Op::Sqrt => "sqrt",
        Op::Exp2 => "exp2",
        Op::Log2 => "log2",
        Op::Sin => "sin",
        _ => return Ok(None),
    };
    let (ty, suffix) = (r.ty(x), intrinsic_suffix(r.dtype(x)));
    r.declare(&format!("declare {ty} @llvm.{func}.{suffix}({ty})"));
    Ok(Some(format!("  {} = call {ty} @llvm.{func}.{suffix}({})", r.name(x)?, r.typed(r.src(x, 0)?)?)))
}

pub(crate) fn rule(pattern: Pattern, handler: SelectFn) -> Rule<SelectFn> {
    Rule::new(pattern, handler)
}

/// Rules every target inherits: memory, vectors, casts, ALU, then control flow.
pub fn base_rules() -> RuleSet<SelectFn> {
    RuleSet::new(vec![
        rule(Pattern::op(Op::Index).src_prefix(vec![Pattern::any(), Pattern::any()]), index),
        control::masked_load_rule(),
        rule(Pattern::op(Op::Load).src_prefix(vec![Pattern::var("idx")]), load),
        rule(Pattern::op(Op::Store).src(vec![Pattern::var("idx"), Pattern::var("val")]), store),
        rule(Pattern::op(Op::Gep), gep),
        rule(Pattern::op(Op::Vectorize).src_each(Pattern::var("y")), broadcast),
        rule(Pattern::op(Op::Vectorize), vectorize),
        rule(Pattern::op(Op::Cast), pointer_cast),
        rule(Pattern::op(Op::Bitcast), bitcast),
        rule(Pattern::op(Op::Cast), cast),
        rule(Pattern::ops(Op::BINARY), binary),
        rule(Pattern::op(Op::Where), select),
        rule(Pattern::ops(Op::TRANSCENDENTAL).float(), intrinsic),
    ])
    .then(control::rules())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llvm::types::lconst;
    use bumpalo::Bump;

    /// Name every node the way pass 2 would and render `id` with the base rules.
    fn render(g: &Graph, id: NodeId) -> Option<String> {
        let arena = Bump::new();
        let mut session = LoweringSession::new(&arena);
        for (i, node) in g.iter() {
            match node.op {
                Op::Const => {
                    if let Arg::Const(v) = node.arg {
                        session.bind(i, &lconst(v, node.dtype));
                    }
                }
                Op::DefineGlobal => {
                    if let Arg::Index(n) = node.arg {
                        session.bind(i, &format!("%data{n}"));
                    }
                }
                _ => {
                    session.name(i);
                }
            }
        }
        let rules = base_rules();
        let mut r = Renderer::new(g, &mut session);
        for rule in rules.iter() {
            if let Some(m) = rule.pattern.match_node(g, id) {
                if let Some(text) = (rule.handler)(&mut r, &m).unwrap() {
                    return Some(text);
                }
            }
        }
        None
    }

    #[test]
    fn test_opcode_tables() {
        assert_eq!(lop(ScalarType::U32, Op::IDiv), Some("udiv"));
        assert_eq!(lop(ScalarType::I32, Op::IDiv), Some("sdiv"));
        assert_eq!(lop(ScalarType::I8, Op::CmpLt), Some("icmp slt"));
        assert_eq!(lop(ScalarType::Bool, Op::CmpLt), Some("icmp ult"));
        assert_eq!(lop(ScalarType::I64, Op::Shr), Some("ashr"));
        assert_eq!(lop(ScalarType::U64, Op::Shr), Some("lshr"));
        assert_eq!(lop(ScalarType::F32, Op::CmpNe), Some("fcmp nsz arcp contract afn une"));
        assert_eq!(lop(ScalarType::F16, Op::Mod), None);
        assert_eq!(lop(ScalarType::F32, Op::Max), None);
    }

    #[test]
    fn test_memory_instructions() {
        let mut g = Graph::new();
        let buf = g.define_global(0, DType::F32.ptr()).unwrap();
        let i = g.const_int(DType::I32, 3).unwrap();
        let idx = g.index(buf, i).unwrap();
        let ld = g.load(idx).unwrap();
        let st = g.store(idx, ld).unwrap();
        assert_eq!(
            render(&g, idx).unwrap(),
            "  %v0 = getelementptr inbounds float, float* %data0, i32 3"
        );
        assert_eq!(render(&g, ld).unwrap(), "  %v1 = load float, float* %v0");
        assert_eq!(render(&g, st).unwrap(), "  store float %v1, float* %v0");
    }

    #[test]
    fn test_float_binary_carries_fast_math_flags() {
        let mut g = Graph::new();
        let a = g.const_float(DType::F32, 1.0).unwrap();
        let b = g.const_float(DType::F32, 2.5).unwrap();
        let add = g.alu(Op::Add, a, b).unwrap();
        let lt = g.alu(Op::CmpLt, a, b).unwrap();
        assert_eq!(render(&g, add).unwrap(), "  %v0 = fadd nsz arcp contract afn float 1.0, 2.5");
        assert_eq!(render(&g, lt).unwrap(), "  %v1 = fcmp nsz arcp contract afn ult float 1.0, 2.5");
    }

    #[test]
    fn test_vector_assembly() {
        let mut g = Graph::new();
        let a = g.const_float(DType::F32, 1.0).unwrap();
        let b = g.const_float(DType::F32, 2.0).unwrap();
        let splat = g.vectorize(&[a, a, a, a]).unwrap();
        let pair = g.vectorize(&[a, b]).unwrap();
        let lane = g.gep(pair, 1).unwrap();
        assert_eq!(
            render(&g, splat).unwrap(),
            "  %v0_z = insertelement <1 x float> poison, float 1.0, i32 0\n  \
             %v0 = shufflevector <1 x float> %v0_z, <1 x float> poison, <4 x i32> zeroinitializer"
        );
        assert_eq!(
            render(&g, pair).unwrap(),
            "  %v1_0 = insertelement <2 x float> poison, float 1.0, i32 0\n  \
             %v1 = insertelement <2 x float> %v1_0, float 2.0, i32 1"
        );
        assert_eq!(render(&g, lane).unwrap(), "  %v2 = extractelement <2 x float> %v1, i32 1");
    }

    #[test]
    fn test_casts() {
        let mut g = Graph::new();
        let buf = g.define_global(0, DType::F32.ptr()).unwrap();
        let h = g.const_float(DType::F16, 1.0).unwrap();
        let wide = g.cast(h, DType::F32).unwrap();
        let p = g.cast(buf, DType::F32.vec(4).ptr()).unwrap();
        let bits = g.bitcast(wide, DType::U32).unwrap();
        assert_eq!(render(&g, wide).unwrap(), "  %v0 = fpext half 1.0 to float");
        assert_eq!(render(&g, p).unwrap(), "  %v1 = bitcast float* %data0 to <4 x float>*");
        assert_eq!(render(&g, bits).unwrap(), "  %v2 = bitcast float %v0 to i32");
    }

    #[test]
    fn test_intrinsic_call() {
        let mut g = Graph::new();
        let x = g.const_float(DType::F32, 4.0).unwrap();
        let s = g.unary(Op::Sqrt, x).unwrap();
        assert_eq!(render(&g, s).unwrap(), "  %v0 = call float @llvm.sqrt.f32(float 4.0)");
    }

    #[test]
    fn test_unsupported_combination_has_no_rule() {
        let mut g = Graph::new();
        let a = g.const_float(DType::F32, 1.0).unwrap();
        let m = g.alu(Op::Max, a, a).unwrap();
        assert!(render(&g, m).is_none());
    }
}
