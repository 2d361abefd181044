//! Type, constant and cast-opcode rendering for the textual IR.

use crate::core::dtype::{DType, ScalarType};
use crate::core::error::{CompileError, CompileResult};
use crate::core::node::ConstValue;

/// Textual name of a scalar kind.
pub fn scalar_name(scalar: ScalarType) -> &'static str {
    use ScalarType::*;
    match scalar {
        Void => "void",
        Bool => "i1",
        I8 | U8 => "i8",
        I16 | U16 => "i16",
        I32 | U32 => "i32",
        I64 | U64 => "i64",
        F16 => "half",
        BF16 => "bfloat",
        F32 => "float",
        F64 => "double",
    }
}

/// Textual type of `dt`.
pub fn ldt(dt: DType) -> String {
    if let Some(ptr) = dt.ptr {
        let base = ldt(dt.base());
        return if ptr.local { format!("{base} addrspace(3)*") } else { format!("{base}*") };
    }
    if dt.count > 1 {
        return format!("<{} x {}>", dt.count, scalar_name(dt.scalar));
    }
    scalar_name(dt.scalar).to_string()
}

/// Overloaded-intrinsic suffix, e.g. `f32` or `v4f32`.
pub fn intrinsic_suffix(dt: DType) -> String {
    let s = match dt.scalar {
        ScalarType::F16 => "f16",
        ScalarType::BF16 => "bf16",
        ScalarType::F32 => "f32",
        ScalarType::F64 => "f64",
        other => scalar_name(other),
    };
    if dt.count > 1 {
        format!("v{}{}", dt.count, s)
    } else {
        s.to_string()
    }
}

/// Round to the nearest IEEE half, ties to even. Returns the half's bit pattern.
pub fn f32_to_f16_bits(x: f32) -> u16 {
    let bits = x.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let man = bits & 0x7f_ffff;
    if exp == 0xff {
        return sign | 0x7c00 | if man != 0 { 0x200 } else { 0 };
    }
    let e = exp - 127 + 15;
    if e >= 0x1f {
        return sign | 0x7c00;
    }
    if e <= 0 {
        if e < -10 {
            return sign;
        }
        let m = man | 0x80_0000;
        let shift = (14 - e) as u32;
        let mut r = m >> shift;
        let rem = m & ((1 << shift) - 1);
        let halfway = 1 << (shift - 1);
        if rem > halfway || (rem == halfway && r & 1 == 1) {
            r += 1;
        }
        return sign | r as u16;
    }
    let mut r = ((e as u32) << 10) | (man >> 13);
    let rem = man & 0x1fff;
    if rem > 0x1000 || (rem == 0x1000 && r & 1 == 1) {
        // A carry out of the mantissa correctly bumps the exponent (up to infinity).
        r += 1;
    }
    sign | r as u16
}

pub fn f16_bits_to_f32(h: u16) -> f32 {
    let negative = h & 0x8000 != 0;
    let exp = ((h >> 10) & 0x1f) as u32;
    let man = (h & 0x3ff) as u32;
    let magnitude = if exp == 0 {
        man as f32 * 2f32.powi(-24)
    } else if exp == 0x1f {
        f32::from_bits(0x7f80_0000 | (man << 13))
    } else {
        f32::from_bits(((exp + 127 - 15) << 23) | (man << 13))
    };
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// Round to the nearest bfloat16, ties to even. Returns the bfloat's bit pattern.
pub fn f32_to_bf16_bits(x: f32) -> u16 {
    let bits = x.to_bits();
    if x.is_nan() {
        return ((bits >> 16) | 0x40) as u16;
    }
    let rounded = bits.wrapping_add(0x7fff + ((bits >> 16) & 1));
    (rounded >> 16) as u16
}

pub fn bf16_bits_to_f32(h: u16) -> f32 {
    f32::from_bits((h as u32) << 16)
}

/// The value a float constant of `scalar` kind actually holds.
pub fn truncate_float(x: f64, scalar: ScalarType) -> f64 {
    match scalar {
        ScalarType::F64 => x,
        ScalarType::F32 => x as f32 as f64,
        ScalarType::F16 => f16_bits_to_f32(f32_to_f16_bits(x as f32)) as f64,
        ScalarType::BF16 => bf16_bits_to_f32(f32_to_bf16_bits(x as f32)) as f64,
        _ => x,
    }
}

/// Decimal literal that always carries a fractional point (`1.0`, `1.0e20`).
fn decimal(x: f64) -> String {
    let s = format!("{:?}", x);
    if s.contains('.') {
        s
    } else if let Some(pos) = s.find('e') {
        format!("{}.0{}", &s[..pos], &s[pos..])
    } else {
        format!("{s}.0")
    }
}

/// Render a constant of type `dtype`.
pub fn lconst(value: ConstValue, dtype: DType) -> String {
    if dtype.scalar.is_float() {
        let x = truncate_float(value.as_f64(), dtype.scalar);
        if x.is_finite() {
            decimal(x)
        } else {
            format!("0x{:016X}", x.to_bits())
        }
    } else if dtype.scalar.is_bool() {
        if value.as_f64() != 0.0 { "true" } else { "false" }.to_string()
    } else {
        value.as_i64().to_string()
    }
}

/// Cast opcode from `from` to `to`.
pub fn lcast(from: DType, to: DType) -> CompileResult<&'static str> {
    let (fs, ts) = (from.scalar, to.scalar);
    let op = if fs.is_float() {
        if ts.is_float() {
            Some(if ts.itemsize() > fs.itemsize() { "fpext" } else { "fptrunc" })
        } else if ts.is_int() {
            Some(if ts.is_unsigned() { "fptoui" } else { "fptosi" })
        } else {
            None
        }
    } else if fs.is_unsigned() || fs.is_bool() {
        if ts.is_float() {
            Some("uitofp")
        } else if ts.is_int() {
            Some(if ts.itemsize() < fs.itemsize() { "trunc" } else { "zext" })
        } else {
            None
        }
    } else if fs.is_int() {
        if ts.is_float() {
            Some("sitofp")
        } else if ts.is_int() {
            Some(if ts.itemsize() < fs.itemsize() { "trunc" } else { "sext" })
        } else {
            None
        }
    } else {
        None
    };
    op.ok_or(CompileError::UnsupportedCast { from, to })
}
