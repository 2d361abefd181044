// This module defines the parallel AMD GPU target. It layers its rules in front of the
// shared ones: parallel indices become workgroup/workitem id intrinsic calls, a barrier
// becomes a release fence, s.barrier and an acquire fence at workgroup scope, and the
// matrix-multiply node maps directly onto the WMMA intrinsics, which take their operand
// vectors and accumulator by value. WMMA on this family wants 16-lane half operands, so
// an 8-lane half accumulator is legalized into a 16-lane one wrapped in width casts, and
// those casts are selected as fixed even/odd shuffles. Workgroup-local buffers are
// supported and declared as addrspace(3) globals. The kernel uses the amdgpu_kernel
// calling convention; the arch string is carried for the caller and the CLI.

//! Parallel AMD GPU target.

use crate::core::dtype::{DType, ScalarType};
use crate::core::error::{CompileError, CompileResult};
use crate::core::node::{Arg, NodeId, Op};
use crate::core::pattern::{Match, Pattern, RuleSet};
use crate::core::target::{LegalizeFn, SelectFn, Target};
use crate::llvm::legalize::{self, Legalizer};
use crate::llvm::rules::{self, rule, Renderer};

const HALF8: DType = DType::F16.vec(8);
const HALF16: DType = DType::F16.vec(16);

impl Target {
    pub fn amdgpu(arch: &str) -> Target {
        Target {
            name: "amdgpu",
            arch: Some(arch.to_string()),
            abi: Some("amdgpu_kernel"),
            has_local: true,
            has_shared: true,
            supports_float4: true,
            legalize: legalize::base_rules().prepend(legalize_rules()),
            select: rules::base_rules().prepend(select_rules()),
            prepass: None,
        }
    }
}

/// Intrinsic reading a parallel index such as `gidx0` or `lidx2`.
fn workitem_intrinsic(name: &str) -> Option<String> {
    let kind = match name.chars().next()? {
        'g' => "workgroup",
        'l' => "workitem",
        _ => return None,
    };
    let axis = match name.chars().last()? {
        '0' => 'x',
        '1' => 'y',
        '2' => 'z',
        _ => return None,
    };
    Some(format!("@llvm.amdgcn.{kind}.id.{axis}"))
}

fn special(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let Arg::Special { name, .. } = &r.node(x).arg else {
        return Ok(None);
    };
    let Some(func) = workitem_intrinsic(name) else {
        return Ok(None);
    };
    r.declare(&format!("declare i32 {func}()"));
    Ok(Some(format!("  {} = tail call i32 {func}()", r.name(x)?)))
}

fn barrier(r: &mut Renderer<'_, '_, '_>, _m: &Match) -> CompileResult<Option<String>> {
    r.declare("declare void @llvm.amdgcn.s.barrier()");
    Ok(Some(
        "  fence syncscope(\"workgroup\") release\n  tail call void @llvm.amdgcn.s.barrier()\n  fence syncscope(\"workgroup\") acquire"
            .to_string(),
    ))
}

/// Interleave lanes with zeros: lane i goes to 2i, a zero lane to 2i+1.
fn widen_half(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let mask = (0..8).map(|i| format!("i32 {}, i32 {}", i, i + 8)).collect::<Vec<_>>().join(", ");
    Ok(Some(format!(
        "  {} = shufflevector <8 x half> {}, <8 x half> zeroinitializer, <16 x i32> <{mask}>",
        r.name(m.root)?,
        r.name(m["y"])?
    )))
}

/// Keep the even lanes.
fn narrow_half(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let mask = (0..16).step_by(2).map(|i| format!("i32 {i}")).collect::<Vec<_>>().join(", ");
    Ok(Some(format!(
        "  {} = shufflevector <16 x half> {}, <16 x half> undef, <8 x i32> <{mask}>",
        r.name(m.root)?,
        r.name(m["y"])?
    )))
}

fn wmma_type(scalar: ScalarType) -> Option<&'static str> {
    match scalar {
        ScalarType::F16 => Some("f16"),
        ScalarType::F32 => Some("f32"),
        _ => None,
    }
}

fn wmma(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let src = &r.node(x).src;
    let (Some(&a), Some(&c)) = (src.first(), src.last()) else {
        return Ok(None);
    };
    let (Some(out), Some(input)) = (wmma_type(r.dtype(c).scalar), wmma_type(r.dtype(a).scalar)) else {
        return Ok(None);
    };
    let ty = r.ty(x);
    let args = src.iter().map(|&s| r.typed(s)).collect::<CompileResult<Vec<_>>>()?;
    let clamp = if r.dtype(x).scalar != ScalarType::F32 { ", i1 false" } else { "" };
    let func = format!("@llvm.amdgcn.wmma.{out}.16x16x16.{input}");
    let params = src.iter().map(|&s| r.ty(s)).collect::<Vec<_>>().join(", ");
    let decl_clamp = if clamp.is_empty() { "" } else { ", i1" };
    r.declare(&format!("declare {ty} {func}({params}{decl_clamp})"));
    Ok(Some(format!("  {} = call {ty} {func}({}{clamp})", r.name(x)?, args.join(", "))))
}

fn select_rules() -> RuleSet<SelectFn> {
    RuleSet::new(vec![
        rule(Pattern::op(Op::Special), special),
        rule(Pattern::op(Op::Barrier), barrier),
        rule(Pattern::op(Op::Cast).dtype(HALF16).src(vec![Pattern::var("y").dtype(HALF8)]), widen_half),
        rule(Pattern::op(Op::Cast).dtype(HALF8).src(vec![Pattern::var("y").dtype(HALF16)]), narrow_half),
        rule(Pattern::op(Op::Wmma), wmma),
    ])
}

/// An 8-lane half accumulator runs through the 16-lane instruction.
fn widen_wmma(lz: &mut Legalizer<'_>, m: &Match) -> CompileResult<Option<NodeId>> {
    let x = m.root;
    let node = lz.node(x).clone();
    let Arg::Wmma(arg) = node.arg else {
        return Err(CompileError::InvalidNode { node: x, reason: "wmma without a shape".to_string() });
    };
    let (a, b, c) = (node.src[0], node.src[1], node.src[2]);
    let wide_c = lz.cast(c, HALF16)?;
    let w = lz.build(|g| g.wmma(HALF16, a, b, wide_c, arg))?;
    lz.cast(w, HALF8).map(Some)
}

fn legalize_rules() -> RuleSet<LegalizeFn> {
    RuleSet::new(vec![legalize::rule(Pattern::op(Op::Wmma).dtype(HALF8), widen_wmma)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::{Graph, WmmaArg};
    use crate::llvm::lower;

    #[test]
    fn test_workitem_intrinsics() {
        assert_eq!(workitem_intrinsic("gidx0").as_deref(), Some("@llvm.amdgcn.workgroup.id.x"));
        assert_eq!(workitem_intrinsic("lidx2").as_deref(), Some("@llvm.amdgcn.workitem.id.z"));
        assert_eq!(workitem_intrinsic("ridx0"), None);
    }

    #[test]
    fn test_special_barrier_and_local() {
        let mut g = Graph::new();
        g.name("k").unwrap();
        let out = g.define_global(0, DType::F32.ptr()).unwrap();
        let tmp = g.define_local(0, DType::F32.local_ptr(256)).unwrap();
        let gid = g.special("gidx0", 16).unwrap();
        let lid = g.special("lidx1", 4).unwrap();
        let one = g.const_float(DType::F32, 1.0).unwrap();
        let lidx = g.index(tmp, lid).unwrap();
        g.store(lidx, one).unwrap();
        g.barrier().unwrap();
        let v = g.load(lidx).unwrap();
        let gidx = g.index(out, gid).unwrap();
        g.store(gidx, v).unwrap();

        let text = lower(&g, &Target::amdgpu("gfx1100")).unwrap();
        assert!(text.starts_with(
            "@local_0 = internal unnamed_addr addrspace(3) global [256 x float] undef, align 16\n\
             define amdgpu_kernel void @k(float* noalias align 32 %data0) #0 {\n"
        ), "{text}");
        assert!(text.contains("  %v0 = tail call i32 @llvm.amdgcn.workgroup.id.x()\n"), "{text}");
        assert!(text.contains("  %v1 = tail call i32 @llvm.amdgcn.workitem.id.y()\n"), "{text}");
        assert!(text.contains(
            "  fence syncscope(\"workgroup\") release\n  tail call void @llvm.amdgcn.s.barrier()\n  fence syncscope(\"workgroup\") acquire\n"
        ), "{text}");
        assert!(text.contains("getelementptr inbounds float, float addrspace(3)* @local_0, i32 %v1"), "{text}");
        assert!(text.contains("declare i32 @llvm.amdgcn.workgroup.id.x()\n"), "{text}");
    }

    fn half_wmma(out: DType, c_lanes: u32) -> Graph {
        let mut g = Graph::new();
        let buf = g.define_global(0, out.ptr()).unwrap();
        let h = g.define_var("h", DType::F16, 0, 1).unwrap();
        let ab = g.vectorize(&[h; 16]).unwrap();
        let zero = g.constant(out.scalar_type(), crate::core::node::ConstValue::Float(0.0)).unwrap();
        let c = g.vectorize(&vec![zero; c_lanes as usize]).unwrap();
        let arg = WmmaArg {
            name: "WMMA_16_16_16_half".to_string(),
            dtype_in: ScalarType::F16,
            dtype_out: out.scalar,
            upcast: [16, 16, c_lanes],
        };
        let w = g.wmma(out, ab, ab, c, arg).unwrap();
        let i = g.const_int(DType::I32, 0).unwrap();
        let idx = g.index(buf, i).unwrap();
        g.store(idx, w).unwrap();
        g
    }

    #[test]
    fn test_wmma_float_accumulator() {
        let text = lower(&half_wmma(DType::F32.vec(8), 8), &Target::amdgpu("gfx1100")).unwrap();
        assert!(text.contains(
            "= call <8 x float> @llvm.amdgcn.wmma.f32.16x16x16.f16(<16 x half> %v0, <16 x half> %v0, <8 x float> %v1)\n"
        ), "{text}");
    }

    #[test]
    fn test_wmma_half_accumulator_is_widened() {
        let text = lower(&half_wmma(HALF8, 8), &Target::amdgpu("gfx1100")).unwrap();
        assert!(text.contains("<16 x i32> <i32 0, i32 8, i32 1, i32 9, i32 2, i32 10, i32 3, i32 11, i32 4, i32 12, i32 5, i32 13, i32 6, i32 14, i32 7, i32 15>"), "{text}");
        assert!(text.contains("@llvm.amdgcn.wmma.f16.16x16x16.f16(<16 x half> %v0, <16 x half> %v0, <16 x half> %v2, i1 false)\n"), "{text}");
        assert!(text.contains("<8 x i32> <i32 0, i32 2, i32 4, i32 6, i32 8, i32 10, i32 12, i32 14>"), "{text}");
        assert!(text.contains("store <8 x half> %v4, <8 x half>* "), "{text}");
    }
}
