//! Execution of parsed programs over byte buffers.

use hashbrown::HashMap;
use log::trace;

use super::parser::{BinOp, CastOp, Inst, Operand, Program, Typed};
use super::{mask, sext, EvalError, EvalResult, Pointer, Type, Value};
use crate::core::dtype::ScalarType;
use crate::llvm::types::{bf16_bits_to_f32, f16_bits_to_f32, f32_to_bf16_bits, f32_to_f16_bits, truncate_float};

/// Default bound on executed instructions.
pub const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

/// Interpreter state for one program.
pub struct Machine<'p> {
    program: &'p Program,
    memory: Vec<Vec<u8>>,
    globals: HashMap<String, Pointer>,
    values: HashMap<String, Value>,
    /// Results of `llvm.amdgcn.{workgroup,workitem}.id.{x,y,z}`.
    workgroup_id: [u32; 3],
    workitem_id: [u32; 3],
    step_limit: u64,
    steps: u64,
    trace: Vec<String>,
}

impl<'p> Machine<'p> {
    pub fn new(program: &'p Program) -> Self {
        let mut machine = Self {
            program,
            memory: Vec::new(),
            globals: HashMap::new(),
            values: HashMap::new(),
            workgroup_id: [0; 3],
            workitem_id: [0; 3],
            step_limit: DEFAULT_STEP_LIMIT,
            steps: 0,
            trace: Vec::new(),
        };
        for (name, ty) in &program.globals {
            let ptr = machine.alloc(ty.size());
            machine.globals.insert(name.clone(), ptr);
        }
        machine
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Ids returned by the workgroup and workitem id intrinsics.
    pub fn with_ids(mut self, workgroup: [u32; 3], workitem: [u32; 3]) -> Self {
        self.workgroup_id = workgroup;
        self.workitem_id = workitem;
        self
    }

    fn alloc(&mut self, size: usize) -> Pointer {
        self.memory.push(vec![0; size]);
        Pointer { buffer: self.memory.len() - 1, offset: 0 }
    }

    /// Zero-filled buffer of `size` bytes, returned as a pointer argument.
    pub fn alloc_bytes(&mut self, size: usize) -> Value {
        Value::Ptr(self.alloc(size))
    }

    pub fn alloc_f32(&mut self, data: &[f32]) -> Value {
        let ptr = self.alloc(0);
        self.memory[ptr.buffer] = data.iter().flat_map(|x| x.to_le_bytes()).collect();
        Value::Ptr(ptr)
    }

    pub fn alloc_i32(&mut self, data: &[i32]) -> Value {
        let ptr = self.alloc(0);
        self.memory[ptr.buffer] = data.iter().flat_map(|x| x.to_le_bytes()).collect();
        Value::Ptr(ptr)
    }

    pub fn alloc_u16(&mut self, data: &[u16]) -> Value {
        let ptr = self.alloc(0);
        self.memory[ptr.buffer] = data.iter().flat_map(|x| x.to_le_bytes()).collect();
        Value::Ptr(ptr)
    }

    /// Raw contents of the buffer behind `ptr`.
    pub fn bytes(&self, ptr: &Value) -> EvalResult<&[u8]> {
        let p = ptr
            .as_ptr()
            .ok_or_else(|| EvalError::TypeError { expected: "pointer".to_string(), got: ptr.kind().to_string() })?;
        self.memory.get(p.buffer).map(Vec::as_slice).ok_or(EvalError::OutOfBounds {
            buffer: p.buffer,
            offset: p.offset,
            size: 0,
            len: 0,
        })
    }

    pub fn read_f32(&self, ptr: &Value) -> EvalResult<Vec<f32>> {
        Ok(self.bytes(ptr)?.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
    }

    pub fn read_i32(&self, ptr: &Value) -> EvalResult<Vec<i32>> {
        Ok(self.bytes(ptr)?.chunks_exact(4).map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
    }

    pub fn read_u16(&self, ptr: &Value) -> EvalResult<Vec<u16>> {
        Ok(self.bytes(ptr)?.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect())
    }

    /// Labels of the blocks entered by the last run, in order.
    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Value of a named register after the run.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name.trim_start_matches('%'))
    }

    /// Run the kernel once with `args` bound to its parameters.
    pub fn run(&mut self, args: &[Value]) -> EvalResult<()> {
        let program = self.program;
        if args.len() != program.params.len() {
            return Err(EvalError::ArgumentCount { expected: program.params.len(), got: args.len() });
        }
        self.values.clear();
        self.trace.clear();
        self.steps = 0;
        for ((_, name), arg) in program.params.iter().zip(args) {
            self.values.insert(name.clone(), arg.clone());
        }

        let mut block = 0usize;
        let mut prev: Option<usize> = None;
        'blocks: loop {
            let Some(current) = program.blocks.get(block) else {
                return Err(EvalError::Unsupported("control reaches the end of the function".to_string()));
            };
            self.trace.push(current.label.clone());
            trace!("enter {}", current.label);

            // phis read their inputs before any of them is written
            let mut phis = Vec::new();
            for inst in &current.insts {
                let Inst::Phi { dst, ty, incoming } = inst else {
                    break;
                };
                let from = prev.map(|p| program.blocks[p].label.as_str()).unwrap_or("");
                let (value, _) = incoming.iter().find(|(_, b)| b == from).ok_or_else(|| EvalError::MissingIncoming {
                    phi: dst.clone(),
                    block: from.to_string(),
                })?;
                phis.push((dst.clone(), self.operand(ty, value)?));
            }
            let skip = phis.len();
            self.steps += skip as u64;
            for (dst, value) in phis {
                self.values.insert(dst, value);
            }

            for inst in &current.insts[skip..] {
                self.steps += 1;
                if self.steps > self.step_limit {
                    return Err(EvalError::StepLimit(self.step_limit));
                }
                let target = match inst {
                    Inst::Ret => return Ok(()),
                    Inst::Br(label) => Some(label),
                    Inst::CondBr { cond, then, otherwise } => {
                        let c = self.typed(cond)?;
                        Some(if self.truth(&c)? { then } else { otherwise })
                    }
                    other => {
                        self.execute(other)?;
                        None
                    }
                };
                if let Some(label) = target {
                    prev = Some(block);
                    block = program.block_index(label).ok_or_else(|| EvalError::UnknownLabel(label.clone()))?;
                    continue 'blocks;
                }
            }
            // fall through into the next block, as a label directly after code does
            prev = Some(block);
            block += 1;
        }
    }

    fn truth(&self, v: &Value) -> EvalResult<bool> {
        match v {
            Value::Int(n) => Ok(*n & 1 == 1),
            other => Err(EvalError::TypeError { expected: "i1".to_string(), got: other.kind().to_string() }),
        }
    }

    fn set(&mut self, dst: &str, value: Value) {
        trace!("%{dst} = {value:?}");
        self.values.insert(dst.to_string(), value);
    }

    fn typed(&self, t: &Typed) -> EvalResult<Value> {
        self.operand(&t.ty, &t.value)
    }

    /// Evaluate an operand of type `ty`.
    fn operand(&self, ty: &Type, op: &Operand) -> EvalResult<Value> {
        match op {
            Operand::Local(name) => self.values.get(name).cloned().ok_or_else(|| EvalError::UndefinedValue(format!("%{name}"))),
            Operand::Global(name) => {
                self.globals.get(name).copied().map(Value::Ptr).ok_or_else(|| EvalError::UndefinedValue(format!("@{name}")))
            }
            Operand::Literal(text) => literal(ty, text),
            Operand::Vector(lanes) => Ok(Value::Vector(lanes.iter().map(|t| self.typed(t)).collect::<EvalResult<_>>()?)),
            Operand::Zero => Ok(zero(ty)),
            Operand::Poison => Ok(match ty {
                Type::Vector(n, _) => Value::Vector(vec![Value::Poison; *n as usize]),
                _ => Value::Poison,
            }),
        }
    }

    fn execute(&mut self, inst: &Inst) -> EvalResult<()> {
        match inst {
            Inst::Binary { dst, op, ty, a, b } => {
                let (a, b) = (self.operand(ty, a)?, self.operand(ty, b)?);
                let elem = ty.element();
                let v = lanewise2(&a, &b, |x, y| binary(*op, elem, x, y))?;
                self.set(dst, v);
            }
            Inst::ICmp { dst, pred, ty, a, b } => {
                let (a, b) = (self.operand(ty, a)?, self.operand(ty, b)?);
                let bits = match ty.element() {
                    Type::Int(bits) => *bits,
                    Type::Ptr(_) => 64,
                    other => return Err(EvalError::TypeError { expected: "integer".to_string(), got: other.to_string() }),
                };
                let v = lanewise2(&a, &b, |x, y| icmp(pred, bits, x, y))?;
                self.set(dst, v);
            }
            Inst::FCmp { dst, pred, ty, a, b } => {
                let (a, b) = (self.operand(ty, a)?, self.operand(ty, b)?);
                let v = lanewise2(&a, &b, |x, y| fcmp(pred, x, y))?;
                self.set(dst, v);
            }
            Inst::Select { dst, cond, a, b } => {
                let (c, a, b) = (self.typed(cond)?, self.typed(a)?, self.typed(b)?);
                let v = match (&c, &a, &b) {
                    (Value::Vector(cs), Value::Vector(xs), Value::Vector(ys)) => Value::Vector(
                        cs.iter()
                            .zip(xs.iter().zip(ys))
                            .map(|(c, (x, y))| -> EvalResult<Value> { Ok(if self.truth(c)? { x.clone() } else { y.clone() }) })
                            .collect::<EvalResult<_>>()?,
                    ),
                    _ => {
                        if self.truth(&c)? {
                            a
                        } else {
                            b
                        }
                    }
                };
                self.set(dst, v);
            }
            Inst::Cast { dst, op, value, to } => {
                let v = self.typed(value)?;
                let out = if *op == CastOp::Bitcast {
                    bitcast(&value.ty, v, to)?
                } else {
                    let (from, to_elem) = (value.ty.element(), to.element());
                    lanewise1(&v, |x| cast(*op, from, to_elem, x))?
                };
                self.set(dst, out);
            }
            Inst::Gep { dst, elem, ptr, index } => {
                let base = expect_ptr(self.typed(ptr)?)?;
                let i = match (&index.ty, self.typed(index)?) {
                    (Type::Int(bits), Value::Int(n)) => sext(n, *bits),
                    (_, other) => return Err(EvalError::TypeError { expected: "integer index".to_string(), got: other.kind().to_string() }),
                };
                let offset = base.offset + i * elem.size() as i64;
                self.set(dst, Value::Ptr(Pointer { buffer: base.buffer, offset }));
            }
            Inst::Load { dst, ty, ptr } => {
                let p = expect_ptr(self.typed(ptr)?)?;
                let bytes = self.slice(p, ty.size())?;
                let v = decode(ty, bytes)?;
                self.set(dst, v);
            }
            Inst::Store { value, ptr } => {
                let p = expect_ptr(self.typed(ptr)?)?;
                let v = self.typed(value)?;
                let mut bytes = Vec::with_capacity(value.ty.size());
                encode(&value.ty, &v, &mut bytes)?;
                self.write(p, &bytes)?;
            }
            Inst::Alloca { dst, ty } => {
                let p = self.alloc(ty.size());
                self.set(dst, Value::Ptr(p));
            }
            Inst::ExtractElement { dst, vector, index } => {
                let lanes = expect_vector(self.typed(vector)?)?;
                let i = expect_int(self.typed(index)?)? as usize;
                let v = lanes.get(i).cloned().unwrap_or(Value::Poison);
                self.set(dst, v);
            }
            Inst::InsertElement { dst, vector, elem, index } => {
                let mut lanes = expect_vector(self.typed(vector)?)?;
                let i = expect_int(self.typed(index)?)? as usize;
                let v = self.typed(elem)?;
                match lanes.get_mut(i) {
                    Some(lane) => *lane = v,
                    None => return Err(EvalError::Unsupported(format!("insertelement lane {i} of {}", vector.ty))),
                }
                self.set(dst, Value::Vector(lanes));
            }
            Inst::Shuffle { dst, a, b, mask } => {
                let mut lanes = expect_vector(self.typed(a)?)?;
                lanes.extend(expect_vector(self.typed(b)?)?);
                let out = match self.typed(mask)? {
                    Value::Vector(m) => m
                        .iter()
                        .map(|i| match i {
                            Value::Int(i) => Ok(lanes.get(*i as usize).cloned().unwrap_or(Value::Poison)),
                            _ => Ok(Value::Poison),
                        })
                        .collect::<EvalResult<Vec<_>>>()?,
                    other => return Err(EvalError::TypeError { expected: "shuffle mask".to_string(), got: other.kind().to_string() }),
                };
                self.set(dst, Value::Vector(out));
            }
            Inst::Call { dst, ret, func, args } => {
                let args = args.iter().map(|a| self.typed(a)).collect::<EvalResult<Vec<_>>>()?;
                if let Some(v) = self.call(ret, func, &args)? {
                    if let Some(dst) = dst {
                        self.set(dst, v);
                    }
                }
            }
            Inst::Fence => {}
            Inst::Asm(text) => return Err(EvalError::Unsupported(format!("inline assembly {text}"))),
            Inst::Phi { dst, .. } => return Err(EvalError::Unsupported(format!("phi %{dst} after the head of its block"))),
            Inst::Ret | Inst::Br(_) | Inst::CondBr { .. } => {}
        }
        Ok(())
    }

    fn call(&self, ret: &Type, func: &str, args: &[Value]) -> EvalResult<Option<Value>> {
        if let Some(rest) = func.strip_prefix("llvm.amdgcn.") {
            let ids = match rest.split('.').collect::<Vec<_>>().as_slice() {
                ["workgroup", "id", axis] => Some((self.workgroup_id, *axis)),
                ["workitem", "id", axis] => Some((self.workitem_id, *axis)),
                ["s", "barrier"] => return Ok(None),
                _ => None,
            };
            let axis = ids.and_then(|(ids, axis)| match axis {
                "x" => Some(ids[0]),
                "y" => Some(ids[1]),
                "z" => Some(ids[2]),
                _ => None,
            });
            return match axis {
                Some(id) => Ok(Some(Value::Int(id as u64))),
                None => Err(EvalError::Unsupported(format!("call @{func}"))),
            };
        }
        let unary: fn(f64) -> f64 = match func.split('.').nth(1) {
            Some("sqrt") if func.starts_with("llvm.") => f64::sqrt,
            Some("exp2") if func.starts_with("llvm.") => f64::exp2,
            Some("log2") if func.starts_with("llvm.") => f64::log2,
            Some("sin") if func.starts_with("llvm.") => f64::sin,
            _ => return Err(EvalError::Unsupported(format!("call @{func}"))),
        };
        let [x] = args else {
            return Err(EvalError::ArgumentCount { expected: 1, got: args.len() });
        };
        let elem = ret.element();
        lanewise1(x, |v| match v {
            Value::Float(f) => Ok(Value::Float(round(elem, unary(*f)))),
            other => Err(EvalError::TypeError { expected: "float".to_string(), got: other.kind().to_string() }),
        })
        .map(Some)
    }

    fn slice(&self, p: Pointer, size: usize) -> EvalResult<&[u8]> {
        let buf = self.memory.get(p.buffer).map(Vec::as_slice).unwrap_or(&[]);
        let oob = EvalError::OutOfBounds { buffer: p.buffer, offset: p.offset, size, len: buf.len() };
        let start = usize::try_from(p.offset).map_err(|_| oob.clone())?;
        buf.get(start..start + size).ok_or(oob)
    }

    fn write(&mut self, p: Pointer, bytes: &[u8]) -> EvalResult<()> {
        let len = self.memory.get(p.buffer).map_or(0, Vec::len);
        let oob = EvalError::OutOfBounds { buffer: p.buffer, offset: p.offset, size: bytes.len(), len };
        let start = usize::try_from(p.offset).map_err(|_| oob.clone())?;
        let dst = self
            .memory
            .get_mut(p.buffer)
            .and_then(|buf| buf.get_mut(start..start + bytes.len()))
            .ok_or(oob)?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

fn expect_ptr(v: Value) -> EvalResult<Pointer> {
    v.as_ptr().ok_or_else(|| EvalError::TypeError { expected: "pointer".to_string(), got: v.kind().to_string() })
}

fn expect_int(v: Value) -> EvalResult<u64> {
    v.as_u64().ok_or_else(|| EvalError::TypeError { expected: "integer".to_string(), got: v.kind().to_string() })
}

fn expect_vector(v: Value) -> EvalResult<Vec<Value>> {
    match v {
        Value::Vector(lanes) => Ok(lanes),
        other => Err(EvalError::TypeError { expected: "vector".to_string(), got: other.kind().to_string() }),
    }
}

fn lanewise1(v: &Value, f: impl Fn(&Value) -> EvalResult<Value>) -> EvalResult<Value> {
    match v {
        Value::Vector(lanes) => Ok(Value::Vector(lanes.iter().map(f).collect::<EvalResult<_>>()?)),
        other => f(other),
    }
}

fn lanewise2(a: &Value, b: &Value, f: impl Fn(&Value, &Value) -> EvalResult<Value>) -> EvalResult<Value> {
    match (a, b) {
        (Value::Vector(xs), Value::Vector(ys)) => {
            Ok(Value::Vector(xs.iter().zip(ys).map(|(x, y)| f(x, y)).collect::<EvalResult<_>>()?))
        }
        (x, y) => f(x, y),
    }
}

fn round(ty: &Type, x: f64) -> f64 {
    truncate_float(x, ty.float_kind().unwrap_or(ScalarType::F64))
}

fn zero(ty: &Type) -> Value {
    match ty {
        Type::Vector(n, elem) => Value::Vector(vec![zero(elem); *n as usize]),
        t if t.is_float() => Value::Float(0.0),
        _ => Value::Int(0),
    }
}

fn literal(ty: &Type, text: &str) -> EvalResult<Value> {
    let bad = || EvalError::TypeError { expected: ty.to_string(), got: format!("literal '{text}'") };
    match ty {
        Type::Int(bits) => match text {
            "true" => Ok(Value::Int(1)),
            "false" => Ok(Value::Int(0)),
            _ => text.parse::<i64>().map(|v| Value::int(*bits, v)).map_err(|_| bad()),
        },
        t if t.is_float() => {
            let x = match text.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).map(f64::from_bits).map_err(|_| bad())?,
                None => text.parse::<f64>().map_err(|_| bad())?,
            };
            Ok(Value::Float(round(t, x)))
        }
        _ => Err(bad()),
    }
}

fn binary(op: BinOp, ty: &Type, a: &Value, b: &Value) -> EvalResult<Value> {
    if matches!(a, Value::Poison) || matches!(b, Value::Poison) {
        return Ok(Value::Poison);
    }
    use BinOp::*;
    match op {
        FAdd | FSub | FMul | FDiv => {
            let (Value::Float(x), Value::Float(y)) = (a, b) else {
                return Err(EvalError::TypeError { expected: "float".to_string(), got: a.kind().to_string() });
            };
            let r = match op {
                FAdd => x + y,
                FSub => x - y,
                FMul => x * y,
                _ => x / y,
            };
            Ok(Value::Float(round(ty, r)))
        }
        _ => {
            let (Value::Int(x), Value::Int(y), Type::Int(bits)) = (a, b, ty) else {
                return Err(EvalError::TypeError { expected: "integer".to_string(), got: a.kind().to_string() });
            };
            let (x, y, bits) = (*x, *y, *bits);
            let (sx, sy) = (sext(x, bits), sext(y, bits));
            let r = match op {
                Add => x.wrapping_add(y),
                Sub => x.wrapping_sub(y),
                Mul => x.wrapping_mul(y),
                UDiv | URem | SDiv | SRem if y == 0 => return Err(EvalError::DivisionByZero),
                UDiv => x / y,
                URem => x % y,
                SDiv => sx.wrapping_div(sy) as u64,
                SRem => sx.wrapping_rem(sy) as u64,
                And => x & y,
                Or => x | y,
                Xor => x ^ y,
                Shl | LShr | AShr if y >= bits as u64 => return Ok(Value::Poison),
                Shl => x << y,
                LShr => x >> y,
                AShr => (sx >> y) as u64,
                FAdd | FSub | FMul | FDiv => {
                    return Err(EvalError::TypeError { expected: "float".to_string(), got: "integer".to_string() })
                }
            };
            Ok(Value::Int(mask(r, bits)))
        }
    }
}

fn icmp(pred: &str, bits: u32, a: &Value, b: &Value) -> EvalResult<Value> {
    let (x, y) = match (a, b) {
        (Value::Int(x), Value::Int(y)) => (*x, *y),
        (Value::Ptr(p), Value::Ptr(q)) if p.buffer == q.buffer => (p.offset as u64, q.offset as u64),
        _ => return Ok(Value::Poison),
    };
    let (sx, sy) = (sext(x, bits), sext(y, bits));
    let r = match pred {
        "eq" => x == y,
        "ne" => x != y,
        "ult" => x < y,
        "ule" => x <= y,
        "ugt" => x > y,
        "uge" => x >= y,
        "slt" => sx < sy,
        "sle" => sx <= sy,
        "sgt" => sx > sy,
        "sge" => sx >= sy,
        other => return Err(EvalError::Unsupported(format!("icmp {other}"))),
    };
    Ok(Value::Int(r as u64))
}

fn fcmp(pred: &str, a: &Value, b: &Value) -> EvalResult<Value> {
    let (x, y) = match (a, b) {
        (Value::Float(x), Value::Float(y)) => (*x, *y),
        _ => return Ok(Value::Poison),
    };
    let unordered = x.is_nan() || y.is_nan();
    let r = match pred {
        "false" => false,
        "true" => true,
        "oeq" => !unordered && x == y,
        "one" => !unordered && x != y,
        "olt" => !unordered && x < y,
        "ole" => !unordered && x <= y,
        "ogt" => !unordered && x > y,
        "oge" => !unordered && x >= y,
        "ord" => !unordered,
        "ueq" => unordered || x == y,
        "une" => unordered || x != y,
        "ult" => unordered || x < y,
        "ule" => unordered || x <= y,
        "ugt" => unordered || x > y,
        "uge" => unordered || x >= y,
        "uno" => unordered,
        other => return Err(EvalError::Unsupported(format!("fcmp {other}"))),
    };
    Ok(Value::Int(r as u64))
}

fn cast(op: CastOp, from: &Type, to: &Type, v: &Value) -> EvalResult<Value> {
    use CastOp::*;
    let bits = |t: &Type| match t {
        Type::Int(b) => Ok(*b),
        other => Err(EvalError::TypeError { expected: "integer type".to_string(), got: other.to_string() }),
    };
    Ok(match (op, v) {
        (_, Value::Poison) => Value::Poison,
        (Trunc | ZExt, Value::Int(x)) => Value::Int(mask(*x, bits(to)?)),
        (SExt, Value::Int(x)) => Value::int(bits(to)?, sext(*x, bits(from)?)),
        (UIToFP, Value::Int(x)) => Value::Float(round(to, *x as f64)),
        (SIToFP, Value::Int(x)) => Value::Float(round(to, sext(*x, bits(from)?) as f64)),
        (FPTrunc | FPExt, Value::Float(x)) => Value::Float(round(to, *x)),
        (FPToUI, Value::Float(x)) => {
            if x.is_nan() || *x <= -1.0 {
                Value::Poison
            } else {
                Value::Int(mask(x.trunc() as u64, bits(to)?))
            }
        }
        (FPToSI, Value::Float(x)) => {
            if x.is_nan() {
                Value::Poison
            } else {
                Value::int(bits(to)?, x.trunc() as i64)
            }
        }
        (PtrToInt, Value::Ptr(p)) => Value::Int(mask(((p.buffer as u64) << 32) | (p.offset as u64 & 0xffff_ffff), bits(to)?)),
        (op, v) => {
            return Err(EvalError::TypeError { expected: format!("operand of {op:?}"), got: v.kind().to_string() });
        }
    })
}

/// Reinterpret the bits of `v` as `to`. Pointer-to-pointer casts keep the address.
fn bitcast(from: &Type, v: Value, to: &Type) -> EvalResult<Value> {
    if let Value::Ptr(_) = v {
        return Ok(v);
    }
    if from.size() != to.size() {
        return Err(EvalError::TypeError { expected: format!("{}-byte type", from.size()), got: to.to_string() });
    }
    let mut bytes = Vec::with_capacity(from.size());
    encode(from, &v, &mut bytes)?;
    decode(to, &bytes)
}

fn encode(ty: &Type, v: &Value, out: &mut Vec<u8>) -> EvalResult<()> {
    match (ty, v) {
        (Type::Vector(_, elem) | Type::Array(_, elem), Value::Vector(lanes)) => {
            for lane in lanes {
                encode(elem, lane, out)?;
            }
        }
        (_, Value::Poison) => out.extend(std::iter::repeat(0).take(ty.size())),
        (Type::Int(_), Value::Int(x)) => out.extend_from_slice(&x.to_le_bytes()[..ty.size()]),
        (Type::Half, Value::Float(x)) => out.extend_from_slice(&f32_to_f16_bits(*x as f32).to_le_bytes()),
        (Type::BFloat, Value::Float(x)) => out.extend_from_slice(&f32_to_bf16_bits(*x as f32).to_le_bytes()),
        (Type::Float, Value::Float(x)) => out.extend_from_slice(&(*x as f32).to_le_bytes()),
        (Type::Double, Value::Float(x)) => out.extend_from_slice(&x.to_le_bytes()),
        (ty, v) => return Err(EvalError::TypeError { expected: ty.to_string(), got: v.kind().to_string() }),
    }
    Ok(())
}

fn decode(ty: &Type, bytes: &[u8]) -> EvalResult<Value> {
    let mut word = [0u8; 8];
    let n = ty.size().min(8);
    word[..n].copy_from_slice(&bytes[..n]);
    let raw = u64::from_le_bytes(word);
    Ok(match ty {
        Type::Vector(n, elem) | Type::Array(n, elem) => {
            let size = elem.size();
            Value::Vector(
                (0..*n as usize).map(|i| decode(elem, &bytes[i * size..(i + 1) * size])).collect::<EvalResult<_>>()?,
            )
        }
        Type::Int(bits) => Value::Int(mask(raw, *bits)),
        Type::Half => Value::Float(f16_bits_to_f32(raw as u16) as f64),
        Type::BFloat => Value::Float(bf16_bits_to_f32(raw as u16) as f64),
        Type::Float => Value::Float(f32::from_bits(raw as u32) as f64),
        Type::Double => Value::Float(f64::from_bits(raw)),
        other => return Err(EvalError::Unsupported(format!("load of {other}"))),
    })
}
