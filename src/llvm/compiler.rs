// This module drives one lowering call. lower() legalizes the input graph with the
// target's legalization rules, creates a fresh bumpalo arena and LoweringSession, runs
// pass 1 (accumulator planning plus the target prepass) to completion, and then walks
// the legalized graph once in order (pass 2). Declarations become parameters or shared
// storage, constants and same-representation casts become aliases of existing names,
// and every other node is named and handed to the first selection rule that accepts it.
// A node no rule accepts aborts the call with UnsupportedLowering; no partial output is
// ever returned. Every Range is followed by the phis of the accumulators it carries. The
// session's finish() assembles the program text and the arena is dropped on return.

//! Lowering entry point.

use bumpalo::Bump;
use log::{debug, trace};

use crate::core::error::{CompileError, CompileResult};
use crate::core::node::{Arg, Graph, NodeId, Op};
use crate::core::session::{LoweringSession, SessionStats};
use crate::core::target::Target;

use super::control::{accumulator_phis, plan_accumulators, AccumulatorPlan};
use super::legalize::legalize;
use super::rules::Renderer;
use super::types::{lconst, ldt};

/// Program text plus what was emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Lowered {
    pub text: String,
    pub stats: SessionStats,
}

/// Lower `graph` for `target` into program text.
pub fn lower(graph: &Graph, target: &Target) -> CompileResult<String> {
    lower_with_stats(graph, target).map(|l| l.text)
}

pub fn lower_with_stats(graph: &Graph, target: &Target) -> CompileResult<Lowered> {
    let legal = legalize(graph, &target.legalize)?;
    debug!("lowering {} nodes ({} after legalization) for {}", graph.len(), legal.len(), target);

    let arena = Bump::new();
    let mut session = LoweringSession::new(&arena);
    let plan = plan_accumulators(&legal, &mut session, target.prepass)?;
    session.stats_mut().accumulators = plan.len();
    emit(&legal, target, &plan, &mut session)?;

    let stats = session.stats();
    debug!("@{}: {}", session.function_name(), stats);
    Ok(Lowered { text: session.finish(target.abi), stats })
}

/// Pass 2.
fn emit(graph: &Graph, target: &Target, plan: &AccumulatorPlan, session: &mut LoweringSession<'_>) -> CompileResult<()> {
    for (id, node) in graph.iter() {
        session.stats_mut().nodes_lowered += 1;
        match node.op {
            Op::Name => match &node.arg {
                Arg::Name(name) => session.set_function_name(name),
                _ => return Err(invalid(id, "name without a kernel name")),
            },
            Op::DefineGlobal => {
                let Arg::Index(i) = node.arg else {
                    return Err(invalid(id, "global without a buffer index"));
                };
                let name = session.bind(id, &format!("%data{i}"));
                let attrs = if node.dtype.is_ptr() { " noalias align 32" } else { "" };
                session.add_param(&format!("{}{} {}", ldt(node.dtype), attrs, name));
                materialize(graph, plan, session, id, name)?;
            }
            Op::DefineVar => {
                let Arg::Var { name, .. } = &node.arg else {
                    return Err(invalid(id, "variable without a name"));
                };
                let name = session.bind(id, &format!("%{name}"));
                session.add_param(&format!("{} {}", ldt(node.dtype), name));
                materialize(graph, plan, session, id, name)?;
            }
            Op::DefineLocal => {
                if !(target.has_local && target.has_shared) {
                    return Err(unsupported(graph, id));
                }
                let (Arg::Index(i), Some(size)) = (&node.arg, node.dtype.ptr.and_then(|p| p.size)) else {
                    return Err(invalid(id, "local buffer needs an index and a size"));
                };
                let name = session.bind(id, &format!("@local_{i}"));
                session.declare_shared(&format!(
                    "{name} = internal unnamed_addr addrspace(3) global [{size} x {}] undef, align 16",
                    ldt(node.dtype.base())
                ));
                materialize(graph, plan, session, id, name)?;
            }
            // Named by pass 1.
            Op::Assign => {}
            Op::DefineAcc => {
                let Some(&init) = node.src.first() else {
                    return Err(invalid(id, "accumulator without an initial value"));
                };
                let carried = plan.accumulators().iter().any(|a| a.acc == id && !a.loops.is_empty());
                let value = if carried { session.lookup(id) } else { session.lookup(init) };
                let value = value.ok_or(CompileError::UndefinedOperand { node: id, operand: init })?;
                session.bind(id, value);
                materialize(graph, plan, session, id, value)?;
            }
            Op::Const => {
                let Arg::Const(v) = node.arg else {
                    return Err(invalid(id, "constant without a value"));
                };
                let value = session.bind(id, &lconst(v, node.dtype));
                materialize(graph, plan, session, id, value)?;
            }
            Op::Cast if ldt(node.dtype) == ldt(graph[node.src[0]].dtype) => {
                let src = node.src[0];
                let value = session.lookup(src).ok_or(CompileError::UndefinedOperand { node: id, operand: src })?;
                session.bind(id, value);
                materialize(graph, plan, session, id, value)?;
            }
            Op::Load | Op::Store if !target.supports_float4 && is_vector_access(graph, id) => {
                return Err(unsupported(graph, id));
            }
            _ => {
                let name = session.name(id);
                let text = select(graph, target, session, id)?;
                trace!("{} {} {} -> {}", id, node.op, node.dtype, name);
                session.emit(&text);
                if node.op == Op::Range {
                    session.stats_mut().loops += 1;
                    for line in accumulator_phis(graph, session, plan, id)? {
                        session.emit(&line);
                    }
                }
            }
        }
    }
    Ok(())
}

/// A node whose value is an alias still has to define the symbol an assignment
/// reserved for it.
fn materialize(
    graph: &Graph,
    plan: &AccumulatorPlan,
    session: &mut LoweringSession<'_>,
    id: NodeId,
    value: &str,
) -> CompileResult<()> {
    if !plan.is_reserved(id) {
        return Ok(());
    }
    let Some(a) = plan.accumulators().iter().find(|a| a.value == id) else {
        return Ok(());
    };
    let reserved = session.lookup(a.assign).ok_or(CompileError::UndefinedOperand { node: a.assign, operand: id })?;
    let ty = ldt(graph[id].dtype);
    session.emit(&format!("  {reserved} = select i1 true, {ty} {value}, {ty} {value}"));
    Ok(())
}

fn select(graph: &Graph, target: &Target, session: &mut LoweringSession<'_>, id: NodeId) -> CompileResult<String> {
    let mut r = Renderer::new(graph, session);
    for rule in target.select.iter() {
        if let Some(m) = rule.pattern.match_node(graph, id) {
            if let Some(text) = (rule.handler)(&mut r, &m)? {
                return Ok(text);
            }
        }
    }
    Err(unsupported(graph, id))
}

/// A load or store that moves more than one lane at once.
fn is_vector_access(graph: &Graph, id: NodeId) -> bool {
    let node = &graph[id];
    let moved = if node.op == Op::Store { node.src.get(1).map(|&v| graph[v].dtype) } else { Some(node.dtype) };
    moved.is_some_and(|d| d.count > 1)
}

fn unsupported(graph: &Graph, id: NodeId) -> CompileError {
    let node = &graph[id];
    CompileError::UnsupportedLowering {
        op: node.op,
        dtype: node.dtype,
        operands: node.src.iter().map(|&s| graph[s].dtype).collect(),
    }
}

fn invalid(node: NodeId, reason: &str) -> CompileError {
    CompileError::InvalidNode { node, reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dtype::DType;

    #[test]
    fn test_empty_kernel() {
        let mut g = Graph::new();
        g.name("empty").unwrap();
        let out = lower(&g, &Target::cpu()).unwrap();
        assert!(out.contains("void @empty() #0 {\n  ret void\n}\n"));
        assert!(out.ends_with("attributes #0 = { nounwind \"no-builtins\" \"no-trapping-math\"=\"true\" }\n"));
    }

    #[test]
    fn test_parameters() {
        let mut g = Graph::new();
        let out_buf = g.define_global(0, DType::F32.ptr()).unwrap();
        let n = g.define_var("n", DType::I32, 1, 128).unwrap();
        let f = g.cast(n, DType::F32).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let idx = g.index(out_buf, zero).unwrap();
        g.store(idx, f).unwrap();
        let out = lower(&g, &Target::cpu()).unwrap();
        assert!(out.contains("@test(float* noalias align 32 %data0,i32 %n) #0 {"), "{out}");
        assert!(out.contains("  %v0 = sitofp i32 %n to float\n"), "{out}");
        assert!(out.contains("  %v1 = getelementptr inbounds float, float* %data0, i32 0\n"), "{out}");
        assert!(out.contains("  store float %v0, float* %v1\n"), "{out}");
    }

    #[test]
    fn test_same_representation_cast_is_alias() {
        let mut g = Graph::new();
        let buf = g.define_global(0, DType::U32.ptr()).unwrap();
        let n = g.define_var("n", DType::I32, 0, 8).unwrap();
        let u = g.cast(n, DType::U32).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let idx = g.index(buf, zero).unwrap();
        g.store(idx, u).unwrap();
        let out = lower(&g, &Target::cpu()).unwrap();
        assert!(out.contains("  store i32 %n, i32* %v0\n"), "{out}");
    }

    #[test]
    fn test_local_buffer_needs_shared_storage() {
        let mut g = Graph::new();
        g.define_local(0, DType::F32.local_ptr(16)).unwrap();
        let err = lower(&g, &Target::cpu()).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedLowering { op: Op::DefineLocal, .. }));
    }

    #[test]
    fn test_local_buffer_needs_local_memory() {
        let mut g = Graph::new();
        g.define_local(0, DType::F32.local_ptr(16)).unwrap();
        let target = Target { has_local: false, ..Target::amdgpu("gfx1100") };
        let err = lower(&g, &target).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedLowering { op: Op::DefineLocal, .. }));
    }

    #[test]
    fn test_vector_access_needs_float4() {
        let mut g = Graph::new();
        let src = g.define_global(0, DType::F32.vec(4).ptr()).unwrap();
        let dst = g.define_global(1, DType::F32.vec(4).ptr()).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let i = g.index(src, zero).unwrap();
        let x = g.load(i).unwrap();
        let o = g.index(dst, zero).unwrap();
        g.store(o, x).unwrap();
        assert!(lower(&g, &Target::cpu()).unwrap().contains("load <4 x float>"));
        let target = Target { supports_float4: false, ..Target::cpu() };
        let err = lower(&g, &target).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedLowering { op: Op::Load, .. }), "{err}");
    }

    #[test]
    fn test_missing_rule_reports_node() {
        let mut g = Graph::new();
        let buf = g.define_global(0, DType::F32.ptr()).unwrap();
        let a = g.const_float(DType::F32, 1.0).unwrap();
        let m = g.alu(Op::Mod, a, a).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let idx = g.index(buf, zero).unwrap();
        g.store(idx, m).unwrap();
        let err = lower(&g, &Target::cpu()).unwrap_err();
        assert_eq!(err.to_string(), "failed to render mod with f32 srcs [f32, f32]");
    }

    #[test]
    fn test_constant_assignment_is_materialized() {
        let mut g = Graph::new();
        let buf = g.define_global(0, DType::F32.ptr()).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let two = g.const_int(DType::I32, 2).unwrap();
        let init = g.const_float(DType::F32, 0.0).unwrap();
        let rng = g.range(0, zero, two).unwrap();
        let acc = g.define_acc(init, &[rng]).unwrap();
        let seven = g.const_float(DType::F32, 7.0).unwrap();
        let asg = g.assign(acc, seven).unwrap();
        g.end_range(rng).unwrap();
        let idx = g.index(buf, zero).unwrap();
        g.store(idx, asg).unwrap();
        let out = lower(&g, &Target::cpu()).unwrap();
        assert!(out.contains("  %assign0 = select i1 true, float 7.0, float 7.0\n"), "{out}");
        assert!(out.contains("  store float %assign0, float* "), "{out}");
    }
}
