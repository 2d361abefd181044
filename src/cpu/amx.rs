// This module lowers the matrix-multiply node onto Apple's AMX unit
// (https://github.com/corsix/amx). AMX instructions have no IR form; each one is an
// opaque `asm sideeffect ".word ..."` call whose immediate selects the operation and
// whose register operand carries a packed address. AMX also loads only from memory, so
// pass 1 reserves three stack slots per multiply (A, B and the C/Z accumulator) and
// their integer addresses before any instruction is emitted. Selection then stores the
// operands into the slots, enables AMX, loads the 16 Z rows, loads X and Y, issues one
// fma32, stores the 16 Z rows back, disables AMX and reloads the result from the C slot.
// The templates are parameterized only by generated names and byte offsets.

//! AMX instruction templates for the CPU target.

use log::trace;

use crate::core::dtype::DType;
use crate::core::error::{CompileError, CompileResult};
use crate::core::node::{Arg, Graph, NodeId, Op};
use crate::core::pattern::Match;
use crate::core::session::LoweringSession;
use crate::llvm::rules::Renderer;
use crate::llvm::types::ldt;

/// Base encoding of the AMX instruction space.
const AMX_BASE: u32 = 0x201000;
/// Operation 17 toggles AMX: operand 0 enables it, operand 1 disables it.
const AMX_SET: u32 = AMX_BASE + (17 << 5);
const AMX_CLR: u32 = AMX_BASE + (17 << 5) + 1;

const LDX: u32 = 0;
const LDY: u32 = 1;
const LDZ: u32 = 4;
const STZ: u32 = 5;
const FMA32: u32 = 12;

/// One AMX instruction taking a general-purpose register operand.
fn amx(op: u32, gpr: &str) -> String {
    format!(
        "call void asm sideeffect \".word (0x201000+($0<<5)+0$1-((0$1>>4)*6))\", \"i,r,~{{memory}}\"(i32 {op}, i64 {gpr}) #0; AMX"
    )
}

/// An AMX instruction without operands, padded with nops.
fn amx_toggle(word: u32) -> String {
    format!("call void asm sideeffect \"nop\\0Anop\\0Anop\\0A.word ({word})\", \"~{{memory}}\"() #0; AMX")
}

/// Packed operand of row `i` of Z: register index in the high byte, byte offset below.
fn z_row(i: u64) -> u64 {
    ((i * 4) << 56) | (i * 64)
}

fn staging_types(graph: &Graph, id: NodeId) -> CompileResult<[DType; 3]> {
    match &graph[id].arg {
        Arg::Wmma(w) => Ok(w.upcast.map(|n| DType::scalar(w.dtype_in).vec(n))),
        _ => Err(CompileError::InvalidNode { node: id, reason: "wmma without a shape".to_string() }),
    }
}

/// Pass-1 hook: allocate the staging slots of every multiply.
pub fn allocate_staging(session: &mut LoweringSession<'_>, graph: &Graph, id: NodeId) -> CompileResult<()> {
    if graph[id].op != Op::Wmma {
        return Ok(());
    }
    let prefix = session.fresh("wmma");
    session.bind(id, prefix);
    session.bind_scratch(id, prefix);
    for (i, dtype) in staging_types(graph, id)?.into_iter().enumerate() {
        let ty = ldt(dtype);
        session.emit(&format!("  {prefix}_amx{i} = alloca {ty}, align {}", dtype.itemsize()));
        session.emit(&format!("  {prefix}_ptr_amx{i} = ptrtoint {ty}* {prefix}_amx{i} to i64"));
    }
    trace!("staging slots {} for {}", prefix, id);
    Ok(())
}

pub fn render_wmma(r: &mut Renderer<'_, '_, '_>, m: &Match) -> CompileResult<Option<String>> {
    let x = m.root;
    let Some(p) = r.session().scratch(x) else {
        return Err(CompileError::InvalidNode { node: x, reason: "wmma without staging slots".to_string() });
    };
    let mut lines = Vec::new();
    for (i, &src) in r.node(x).src.iter().enumerate() {
        let dtype = r.dtype(src);
        lines.push(format!("  store {}, {}* {p}_amx{i}, align {}", r.typed(src)?, ldt(dtype), dtype.itemsize()));
    }
    lines.push(format!("  {} set", amx_toggle(AMX_SET)));
    for i in 0..16u64 {
        lines.push(format!("  {p}_ld{i} = add i64 {p}_ptr_amx2, {}", z_row(i)));
        lines.push(format!("  {} ldz", amx(LDZ, &format!("{p}_ld{i}"))));
    }
    lines.push(format!("  {} ldx", amx(LDX, &format!("{p}_ptr_amx1"))));
    lines.push(format!("  {} ldy", amx(LDY, &format!("{p}_ptr_amx0"))));
    lines.push(format!("  {} fma32", amx(FMA32, "0")));
    for i in 0..16u64 {
        lines.push(format!("  {p}_st{i} = add i64 {p}_ptr_amx2, {}", z_row(i)));
        lines.push(format!("  {} stz", amx(STZ, &format!("{p}_st{i}"))));
    }
    lines.push(format!("  {} clr", amx_toggle(AMX_CLR)));
    let ty = r.ty(x);
    lines.push(format!("  {} = load {ty}, {ty}* {p}_amx2, align {}", r.name(x)?, r.dtype(x).itemsize()));
    Ok(Some(lines.join("\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dtype::ScalarType;
    use crate::core::node::WmmaArg;
    use crate::core::target::Target;
    use crate::llvm::lower;

    fn amx_graph() -> Graph {
        let mut g = Graph::new();
        let out = g.define_global(0, DType::F32.vec(256).ptr()).unwrap();
        let a = g.define_var("a", DType::F32, 0, 1).unwrap();
        let va = g.vectorize(&[a; 16]).unwrap();
        let zero = g.const_float(DType::F32, 0.0).unwrap();
        let vc = g.vectorize(&[zero; 256]).unwrap();
        let arg = WmmaArg {
            name: "WMMA_16_16_1_float_float".to_string(),
            dtype_in: ScalarType::F32,
            dtype_out: ScalarType::F32,
            upcast: [16, 16, 256],
        };
        let w = g.wmma(DType::F32.vec(256), va, va, vc, arg).unwrap();
        let i = g.const_int(DType::I32, 0).unwrap();
        let idx = g.index(out, i).unwrap();
        g.store(idx, w).unwrap();
        g
    }

    #[test]
    fn test_toggle_words() {
        assert_eq!(AMX_SET, 2101792);
        assert_eq!(AMX_CLR, 2101793);
        assert_eq!(z_row(1), (4u64 << 56) | 64);
    }

    #[test]
    fn test_amx_sequence() {
        let out = lower(&amx_graph(), &Target::cpu_amx()).unwrap();
        assert!(out.contains("  %wmma0_amx0 = alloca <16 x float>, align 64\n"), "{out}");
        assert!(out.contains("  %wmma0_ptr_amx2 = ptrtoint <256 x float>* %wmma0_amx2 to i64\n"), "{out}");
        assert!(out.contains("A.word (2101792)\", \"~{memory}\"() #0; AMX set\n"), "{out}");
        assert!(out.contains("A.word (2101793)\", \"~{memory}\"() #0; AMX clr\n"), "{out}");
        assert_eq!(out.matches(" ldz\n").count(), 16);
        assert_eq!(out.matches(" stz\n").count(), 16);
        assert!(out.contains("(i32 12, i64 0) #0; AMX fma32\n"), "{out}");
        assert!(out.contains("  %wmma0_st15 = add i64 %wmma0_ptr_amx2, 4323455642275677120\n"), "{out}");
        assert!(out.contains("  %wmma0 = load <256 x float>, <256 x float>* %wmma0_amx2, align 1024\n"), "{out}");
    }

    #[test]
    fn test_plain_cpu_rejects_wmma() {
        let err = lower(&amx_graph(), &Target::cpu()).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedLowering { op: Op::Wmma, .. }));
    }
}
