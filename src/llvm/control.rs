// This module synthesizes basic blocks for the structured control-flow nodes. A Range
// opens four labeled blocks keyed by its loop id (entry, body, latch, exit): the range
// itself emits the branch into entry, the branch into body and the induction-variable
// phi, and the matching EndRange emits the latch (increment, unsigned bound test, back
// edge) and the exit label that later nodes fall through into. Conditionals branch into
// an ifbody block and rejoin at ifskip; masked loads get their own entry/load/exit
// triangle with a phi choosing between the loaded value and the default.
//
// Accumulators need names before their loop body is emitted, because the latch edge of
// the accumulator phi refers to the value assigned at the end of the body. Pass 1
// (plan_accumulators) walks the whole graph before any emission: every Assign reserves
// one %assignN symbol shared by the assignment and its right-hand side, and records which
// ranges its accumulator is carried across. Pass 2 reads that plan to emit one phi per
// (range, accumulator) pair right after the induction phi and to rebind the accumulator
// to that phi for the rest of the body.

//! Loop, conditional and masked-load lowering plus accumulator planning.

use hashbrown::{HashMap, HashSet};
use log::trace;

use crate::core::error::{CompileError, CompileResult};
use crate::core::node::{Arg, Graph, NodeId, Op};
use crate::core::pattern::{Match, Pattern, Rule, RuleSet};
use crate::core::session::LoweringSession;
use crate::core::target::{PrepassFn, SelectFn};

use super::rules::{rule, Renderer};
use super::types::ldt;

/// One accumulator and the assignment that updates it.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    pub acc: NodeId,
    /// Right-hand side of the assignment; its symbol is shared with `assign`.
    pub value: NodeId,
    pub assign: NodeId,
    /// Ranges the accumulator is carried across, outermost first.
    pub loops: Vec<NodeId>,
}

/// Result of pass 1, read-only during emission.
#[derive(Debug, Clone, Default)]
pub struct AccumulatorPlan {
    accs: Vec<Accumulator>,
    reserved: HashSet<NodeId>,
}

impl AccumulatorPlan {
    pub fn accumulators(&self) -> &[Accumulator] {
        &self.accs
    }

    /// Accumulators carried across `range`, in assignment order.
    pub fn for_range(&self, range: NodeId) -> impl Iterator<Item = &Accumulator> {
        self.accs.iter().filter(move |a| a.loops.contains(&range))
    }

    /// Whether `id` is the right-hand side of an assignment.
    pub fn is_reserved(&self, id: NodeId) -> bool {
        self.reserved.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.accs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accs.is_empty()
    }
}

/// Pass 1: reserve accumulator names and run the target prepass.
pub fn plan_accumulators(
    graph: &Graph,
    session: &mut LoweringSession<'_>,
    prepass: Option<PrepassFn>,
) -> CompileResult<AccumulatorPlan> {
    let mut plan = AccumulatorPlan::default();
    let mut assigned: HashMap<NodeId, NodeId> = HashMap::new();
    for (id, node) in graph.iter() {
        if node.op == Op::Assign {
            let (acc, value) = (node.src[0], node.src[1]);
            if assigned.insert(acc, id).is_some() {
                return Err(CompileError::DuplicateAssign { acc });
            }
            // Assignments sharing a right-hand side share its symbol.
            let name = match session.lookup(value) {
                Some(name) if plan.reserved.contains(&value) => name,
                _ => session.fresh("assign"),
            };
            session.bind(id, name);
            session.bind(value, name);
            let loops = match graph[acc].op {
                Op::DefineAcc => {
                    let ranges = graph[acc].src.get(1..).ok_or_else(|| CompileError::InvalidNode {
                        node: acc,
                        reason: "accumulator without an initial value".to_string(),
                    })?;
                    ranges.iter().copied().filter(|&r| graph[r].op == Op::Range).collect()
                }
                _ => Vec::new(),
            };
            trace!("accumulator {} assigned by {} as {}, carried across {:?}", acc, id, name, loops);
            plan.reserved.insert(value);
            plan.accs.push(Accumulator { acc, value, assign: id, loops });
        }
        if let Some(hook) = prepass {
            hook(session, graph, id)?;
        }
    }
    Ok(plan)
}

/// Pass 2 helper: the accumulator phis that follow `range`'s induction phi.
pub fn accumulator_phis(
    graph: &Graph,
    session: &mut LoweringSession<'_>,
    plan: &AccumulatorPlan,
    range: NodeId,
) -> CompileResult<Vec<String>> {
    let id = loop_id(graph, range)?;
    let mut lines = Vec::new();
    for a in plan.for_range(range) {
        let init = *graph[a.acc].src.first().ok_or_else(|| CompileError::InvalidNode {
            node: a.acc,
            reason: "accumulator without an initial value".to_string(),
        })?;
        let entry = session.lookup(a.acc).or_else(|| session.lookup(init)).ok_or_else(|| {
            CompileError::InvalidNode {
                node: a.acc,
                reason: format!("initial value of accumulator has no value at entry of loop {id}"),
            }
        })?;
        let latch = session.lookup(a.value).ok_or(CompileError::UndefinedOperand { node: a.assign, operand: a.value })?;
        let phi = session.fresh("acc");
        lines.push(format!(
            "  {phi} = phi {} [{entry}, %loop_entry_{id}], [{latch}, %loop_latch_{id}]",
            ldt(graph[a.acc].dtype)
        ));
        session.bind(a.acc, phi);
    }
    Ok(lines)
}

fn loop_id(graph: &Graph, range: NodeId) -> CompileResult<u32> {
    match graph[range].arg {
        Arg::Index(id) if graph[range].op == Op::Range => Ok(id),
        _ => Err(CompileError::InvalidNode { node: range, reason: "range without a loop id".to_string() }),
    }
}

fn range(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let id = loop_id(r.graph(), x)?;
    let name = r.name(x)?;
    Ok(Some(format!(
        "  br label %loop_entry_{id}\nloop_entry_{id}:\n  br label %loop_body_{id}\nloop_body_{id}:\n  \
         {name} = phi {} [{}, %loop_entry_{id}], [{name}phi, %loop_latch_{id}]",
        r.ty(x),
        r.name(r.src(x, 0)?)?
    )))
}

fn end_range(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let (x, rng) = (m.root, m["range"]);
    let id = loop_id(r.graph(), rng)?;
    let (name, var, ty) = (r.name(x)?, r.name(rng)?, r.ty(rng));
    let end = r.name(r.src(rng, 1)?)?;
    Ok(Some(format!(
        "  br label %loop_latch_{id}\nloop_latch_{id}:\n  {var}phi = add {ty} {var}, 1\n  \
         {name} = icmp ult {ty} {var}phi, {end}\n  br i1 {name}, label %loop_body_{id}, label %loop_exit_{id}\nloop_exit_{id}:"
    )))
}

fn if_(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let label = &r.name(x)?[1..];
    Ok(Some(format!(
        "  br i1 {}, label %ifbody_{label}, label %ifskip_{label}\nifbody_{label}:",
        r.name(r.src(x, 0)?)?
    )))
}

fn end_if(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let label = &r.name(m["if"])?[1..];
    Ok(Some(format!("  br label %ifskip_{label}\nifskip_{label}:")))
}

fn masked_load(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let (name, ty) = (r.name(x)?, r.ty(x));
    let label = &name[1..];
    Ok(Some(format!(
        "  br label {name}_entry\n{label}_entry:\n  br i1 {}, label {name}_load, label {name}_exit\n{label}_load:\n  \
         {name}_yes = load {ty}, {}\n  br label {name}_exit\n{label}_exit:\n  \
         {name} = phi {ty} [{name}_yes, {name}_load], [{}, {name}_entry]",
        r.name(m["mask"])?,
        r.typed(m["idx"])?,
        r.name(m["alt"])?
    )))
}

/// Load through a masked index with a default value.
pub fn masked_load_rule() -> Rule<SelectFn> {
    let gated = Pattern::op(Op::Index).src(vec![Pattern::any(), Pattern::any(), Pattern::var("mask")]).or_casted("idx");
    rule(Pattern::op(Op::Load).src(vec![gated, Pattern::var("alt")]), masked_load)
}

/// Loop and conditional rules.
pub fn rules() -> RuleSet<SelectFn> {
    RuleSet::new(vec![
        rule(Pattern::op(Op::Range), range),
        rule(Pattern::op(Op::EndRange).src(vec![Pattern::op(Op::Range).named("range")]), end_range),
        rule(Pattern::op(Op::If), if_),
        rule(Pattern::op(Op::EndIf).src(vec![Pattern::op(Op::If).named("if")]), end_if),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dtype::DType;
    use bumpalo::Bump;

    fn sum_loop() -> (Graph, NodeId, NodeId, NodeId) {
        let mut g = Graph::new();
        let buf = g.define_global(0, DType::F32.ptr_sized(4)).unwrap();
        let zero = g.const_int(DType::I32, 0).unwrap();
        let four = g.const_int(DType::I32, 4).unwrap();
        let init = g.const_float(DType::F32, 0.0).unwrap();
        let rng = g.range(0, zero, four).unwrap();
        let acc = g.define_acc(init, &[rng]).unwrap();
        let idx = g.index(buf, rng).unwrap();
        let ld = g.load(idx).unwrap();
        let sum = g.alu(Op::Add, acc, ld).unwrap();
        let asg = g.assign(acc, sum).unwrap();
        g.end_range(rng).unwrap();
        (g, rng, acc, asg)
    }

    #[test]
    fn test_plan_reserves_shared_name() {
        let (g, rng, acc, asg) = sum_loop();
        let arena = Bump::new();
        let mut s = LoweringSession::new(&arena);
        let plan = plan_accumulators(&g, &mut s, None).unwrap();
        assert_eq!(plan.len(), 1);
        let a = &plan.accumulators()[0];
        assert_eq!((a.acc, a.assign, a.loops.clone()), (acc, asg, vec![rng]));
        assert_eq!(s.lookup(asg), Some("%assign0"));
        assert_eq!(s.lookup(a.value), Some("%assign0"));
        assert!(plan.is_reserved(a.value));
        assert_eq!(plan.for_range(rng).count(), 1);
    }

    #[test]
    fn test_duplicate_assign_is_rejected() {
        let (mut g, _, acc, _) = sum_loop();
        let one = g.const_float(DType::F32, 1.0).unwrap();
        g.assign(acc, one).unwrap();
        let arena = Bump::new();
        let mut s = LoweringSession::new(&arena);
        let err = plan_accumulators(&g, &mut s, None).unwrap_err();
        assert_eq!(err, CompileError::DuplicateAssign { acc });
    }

    #[test]
    fn test_accumulator_phi_uses_entry_and_latch_values() {
        let (g, rng, acc, _) = sum_loop();
        let arena = Bump::new();
        let mut s = LoweringSession::new(&arena);
        let plan = plan_accumulators(&g, &mut s, None).unwrap();
        s.bind(g[acc].src[0], "0.0");
        let phis = accumulator_phis(&g, &mut s, &plan, rng).unwrap();
        assert_eq!(phis, vec!["  %acc1 = phi float [0.0, %loop_entry_0], [%assign0, %loop_latch_0]".to_string()]);
        assert_eq!(s.lookup(acc), Some("%acc1"));
    }
}
