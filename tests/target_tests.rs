//! Target-specific lowering checked through the reference evaluator.

use kernelgen::core::{ConstValue, DType, Graph, ScalarType, Target, WmmaArg};
use kernelgen::eval::{self, EvalError, Machine, Value};
use kernelgen::llvm::lower;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_amdgpu_workgroup_ids_select_elements() {
    init_logging();
    let mut g = Graph::new();
    g.name("double_it").unwrap();
    let input = g.define_global(0, DType::F32.ptr()).unwrap();
    let out = g.define_global(1, DType::F32.ptr()).unwrap();
    let gid = g.special("gidx0", 4).unwrap();
    let two = g.const_float(DType::F32, 2.0).unwrap();
    let i = g.index(input, gid).unwrap();
    let x = g.load(i).unwrap();
    let y = g.alu(kernelgen::Op::Mul, x, two).unwrap();
    let o = g.index(out, gid).unwrap();
    g.store(o, y).unwrap();

    let text = lower(&g, &Target::amdgpu("gfx1100")).unwrap();
    assert!(text.starts_with("define amdgpu_kernel void @double_it("), "{text}");
    let program = eval::parse(&text).unwrap();
    for wg in 0..4u32 {
        let mut m = Machine::new(&program).with_ids([wg, 0, 0], [0, 0, 0]);
        let input = m.alloc_f32(&[1.0, -2.0, 3.5, 0.25]);
        let out = m.alloc_f32(&[0.0; 4]);
        m.run(&[input, out.clone()]).unwrap();
        let mut expected = [0.0f32; 4];
        expected[wg as usize] = [2.0, -4.0, 7.0, 0.5][wg as usize];
        assert_eq!(m.read_f32(&out).unwrap(), expected.to_vec());
    }
}

#[test]
fn test_amdgpu_local_buffer_round_trip() {
    init_logging();
    let mut g = Graph::new();
    let out = g.define_global(0, DType::F32.ptr()).unwrap();
    let tmp = g.define_local(0, DType::F32.local_ptr(16)).unwrap();
    let gid = g.special("gidx0", 4).unwrap();
    let lid = g.special("lidx0", 16).unwrap();
    let v = g.const_float(DType::F32, 0.5).unwrap();
    let lidx = g.index(tmp, lid).unwrap();
    g.store(lidx, v).unwrap();
    g.barrier().unwrap();
    let back = g.load(lidx).unwrap();
    let oidx = g.index(out, gid).unwrap();
    g.store(oidx, back).unwrap();

    let text = lower(&g, &Target::amdgpu("gfx1201")).unwrap();
    assert!(text.starts_with("@local_0 = internal unnamed_addr addrspace(3) global [16 x float] undef, align 16\n"), "{text}");
    let program = eval::parse(&text).unwrap();
    let mut m = Machine::new(&program).with_ids([2, 0, 0], [5, 0, 0]);
    let buf = m.alloc_f32(&[0.0; 4]);
    m.run(&[buf.clone()]).unwrap();
    assert_eq!(m.read_f32(&buf).unwrap(), vec![0.0, 0.0, 0.5, 0.0]);
}

#[test]
fn test_bf16_load_widens_to_f32() {
    init_logging();
    let mut g = Graph::new();
    let input = g.define_global(0, DType::BF16.ptr()).unwrap();
    let out = g.define_global(1, DType::F32.ptr()).unwrap();
    let i = g.define_var("i", DType::I32, 0, 3).unwrap();
    let idx = g.index(input, i).unwrap();
    let x = g.load(idx).unwrap();
    let y = g.cast(x, DType::F32).unwrap();
    let zero = g.const_int(DType::I32, 0).unwrap();
    let o = g.index(out, zero).unwrap();
    g.store(o, y).unwrap();

    for target in [Target::cpu(), Target::amdgpu("gfx1100")] {
        let text = lower(&g, &target).unwrap();
        assert!(!text.contains("load bfloat"), "{text}");
        let program = eval::parse(&text).unwrap();
        // 1.5, -2.0, 3.140625 and 65280.0 in bfloat16
        for (i, expected) in [(0, 1.5f32), (1, -2.0), (2, 3.140625), (3, 65280.0)] {
            let mut m = Machine::new(&program);
            let input = m.alloc_u16(&[0x3FC0, 0xC000, 0x4049, 0x477F]);
            let out = m.alloc_f32(&[0.0]);
            m.run(&[input, out.clone(), Value::int(32, i)]).unwrap();
            assert_eq!(m.read_f32(&out).unwrap(), vec![expected]);
        }
    }
}

#[test]
fn test_bf16_store_keeps_high_half() {
    init_logging();
    let mut g = Graph::new();
    let out = g.define_global(0, DType::BF16.ptr()).unwrap();
    let x = g.define_var("x", DType::F32, 0, 0).unwrap();
    let h = g.cast(x, DType::BF16).unwrap();
    let zero = g.const_int(DType::I32, 0).unwrap();
    let o = g.index(out, zero).unwrap();
    g.store(o, h).unwrap();

    let text = lower(&g, &Target::cpu()).unwrap();
    assert!(text.contains("store i16 "), "{text}");
    let program = eval::parse(&text).unwrap();
    for (x, bits) in [(3.0f32, 0x4040u16), (1.5, 0x3FC0), (-2.0, 0xC000), (0.0, 0x0000)] {
        let mut m = Machine::new(&program);
        let buf = m.alloc_u16(&[0xFFFF]);
        m.run(&[buf.clone(), Value::Float(x as f64)]).unwrap();
        assert_eq!(m.read_u16(&buf).unwrap(), vec![bits], "{x}\n{text}");
    }
}

#[test]
fn test_bf16_transcendental_computes_in_f32() {
    init_logging();
    let mut g = Graph::new();
    let out = g.define_global(0, DType::F32.ptr()).unwrap();
    let x = g.define_var("x", DType::F32, 0, 0).unwrap();
    let h = g.cast(x, DType::BF16).unwrap();
    let s = g.unary(kernelgen::Op::Sqrt, h).unwrap();
    let f = g.cast(s, DType::F32).unwrap();
    let zero = g.const_int(DType::I32, 0).unwrap();
    let o = g.index(out, zero).unwrap();
    g.store(o, f).unwrap();

    let text = lower(&g, &Target::cpu()).unwrap();
    assert!(text.contains("@llvm.sqrt.f32(float "), "{text}");
    assert!(!text.contains("@llvm.sqrt.bf16"), "{text}");
}

fn amx_kernel() -> Graph {
    let mut g = Graph::new();
    let out = g.define_global(0, DType::F32.vec(256).ptr()).unwrap();
    let a = g.define_var("a", DType::F32, 0, 1).unwrap();
    let va = g.vectorize(&[a; 16]).unwrap();
    let zero = g.constant(DType::F32, ConstValue::Float(0.0)).unwrap();
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
fn test_amx_program_is_well_formed() {
    init_logging();
    let text = lower(&amx_kernel(), &Target::cpu_amx()).unwrap();
    assert_eq!(text.matches("; AMX set\n").count(), 1, "{text}");
    assert_eq!(text.matches("; AMX clr\n").count(), 1, "{text}");
    assert!(text.find("; AMX set").unwrap() < text.find("; AMX fma32").unwrap());
    assert!(text.find("; AMX fma32").unwrap() < text.find("; AMX clr").unwrap());

    // Every line still parses; executing the opaque AMX words is out of reach.
    let program = eval::parse(&text).unwrap();
    let mut m = Machine::new(&program);
    let out = m.alloc_bytes(1024);
    let err = m.run(&[out, Value::Float(1.0)]).unwrap_err();
    assert!(matches!(err, EvalError::Unsupported(_)), "{err}");
}
