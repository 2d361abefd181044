// This module defines the semantic types carried by every kernel node. A DType is a
// small Copy value: a scalar kind, a lane count and an optional pointer marker. The
// pointer marker records the address space (global or workgroup-local) and, when the
// producer knows it, the element count of the buffer behind the pointer. Vector and
// pointer-to-vector types share the same lane field; for a pointer it describes the
// pointee. The textual names produced by Display are the same names the text module
// parses, so a printed graph can be read back.

//! Semantic types for kernel nodes.

use std::fmt;

/// Scalar kinds understood by the lowering engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarType {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    BF16,
    F32,
    F64,
}

impl ScalarType {
    /// Size of one element in bytes.
    pub const fn itemsize(self) -> u32 {
        use ScalarType::*;
        match self {
            Void => 0,
            Bool | I8 | U8 => 1,
            I16 | U16 | F16 | BF16 => 2,
            I32 | U32 | F32 => 4,
            I64 | U64 | F64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, ScalarType::F16 | ScalarType::BF16 | ScalarType::F32 | ScalarType::F64)
    }

    pub const fn is_unsigned(self) -> bool {
        matches!(self, ScalarType::U8 | ScalarType::U16 | ScalarType::U32 | ScalarType::U64)
    }

    pub const fn is_signed(self) -> bool {
        matches!(self, ScalarType::I8 | ScalarType::I16 | ScalarType::I32 | ScalarType::I64)
    }

    /// Integer kinds, signed or unsigned. Bool is not an integer here.
    pub const fn is_int(self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub const fn is_bool(self) -> bool {
        matches!(self, ScalarType::Bool)
    }

    pub const fn name(self) -> &'static str {
        use ScalarType::*;
        match self {
            Void => "void",
            Bool => "bool",
            I8 => "i8",
            I16 => "i16",
            I32 => "i32",
            I64 => "i64",
            U8 => "u8",
            U16 => "u16",
            U32 => "u32",
            U64 => "u64",
            F16 => "f16",
            BF16 => "bf16",
            F32 => "f32",
            F64 => "f64",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        use ScalarType::*;
        Some(match s {
            "void" => Void,
            "bool" => Bool,
            "i8" => I8,
            "i16" => I16,
            "i32" => I32,
            "i64" => I64,
            "u8" => U8,
            "u16" => U16,
            "u32" => U32,
            "u64" => U64,
            "f16" => F16,
            "bf16" => BF16,
            "f32" => F32,
            "f64" => F64,
            _ => return None,
        })
    }
}

/// Pointer marker: address space plus optional buffer length in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PtrInfo {
    /// Workgroup-local (shared) memory instead of global memory.
    pub local: bool,
    pub size: Option<u32>,
}

/// A node's result type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    pub scalar: ScalarType,
    /// Lane count of the value, or of the pointee for pointers.
    pub count: u32,
    pub ptr: Option<PtrInfo>,
}

impl DType {
    pub const VOID: DType = DType::scalar(ScalarType::Void);
    pub const BOOL: DType = DType::scalar(ScalarType::Bool);
    pub const I32: DType = DType::scalar(ScalarType::I32);
    pub const U16: DType = DType::scalar(ScalarType::U16);
    pub const U32: DType = DType::scalar(ScalarType::U32);
    pub const F16: DType = DType::scalar(ScalarType::F16);
    pub const BF16: DType = DType::scalar(ScalarType::BF16);
    pub const F32: DType = DType::scalar(ScalarType::F32);

    pub const fn scalar(scalar: ScalarType) -> Self {
        Self { scalar, count: 1, ptr: None }
    }

    /// Vector of `count` lanes of this type's scalar kind.
    pub const fn vec(self, count: u32) -> Self {
        Self { scalar: self.scalar, count, ptr: None }
    }

    /// Global pointer to this type.
    pub const fn ptr(self) -> Self {
        Self { scalar: self.scalar, count: self.count, ptr: Some(PtrInfo { local: false, size: None }) }
    }

    pub const fn ptr_sized(self, size: u32) -> Self {
        Self { scalar: self.scalar, count: self.count, ptr: Some(PtrInfo { local: false, size: Some(size) }) }
    }

    /// Workgroup-local pointer to a buffer of `size` elements.
    pub const fn local_ptr(self, size: u32) -> Self {
        Self { scalar: self.scalar, count: self.count, ptr: Some(PtrInfo { local: true, size: Some(size) }) }
    }

    pub const fn is_ptr(&self) -> bool {
        self.ptr.is_some()
    }

    pub fn is_local_ptr(&self) -> bool {
        matches!(self.ptr, Some(PtrInfo { local: true, .. }))
    }

    /// Pointee type for pointers, the type itself otherwise.
    pub const fn base(self) -> Self {
        Self { scalar: self.scalar, count: self.count, ptr: None }
    }

    /// Single-lane, non-pointer version of this type.
    pub const fn scalar_type(self) -> Self {
        Self::scalar(self.scalar)
    }

    /// Lane count of the value itself. Pointers are single values.
    pub const fn vcount(&self) -> u32 {
        if self.ptr.is_some() {
            1
        } else {
            self.count
        }
    }

    pub const fn itemsize(&self) -> u32 {
        if self.ptr.is_some() {
            8
        } else {
            self.scalar.itemsize() * self.count
        }
    }

    /// Same pointer marker, different pointee scalar kind.
    pub const fn with_scalar(self, scalar: ScalarType) -> Self {
        Self { scalar, count: self.count, ptr: self.ptr }
    }

    pub fn is_float(&self) -> bool {
        self.ptr.is_none() && self.scalar.is_float()
    }
}

impl From<ScalarType> for DType {
    fn from(scalar: ScalarType) -> Self {
        DType::scalar(scalar)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ptr) = self.ptr {
            f.write_str("*")?;
            if ptr.local {
                f.write_str("local ")?;
            }
        }
        f.write_str(self.scalar.name())?;
        if self.count > 1 {
            write!(f, "x{}", self.count)?;
        }
        if let Some(PtrInfo { size: Some(size), .. }) = self.ptr {
            write!(f, "[{}]", size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_pointer_shapes() {
        let f4 = DType::F32.vec(4);
        assert_eq!(f4.vcount(), 4);
        assert_eq!(f4.itemsize(), 16);

        let p = f4.ptr();
        assert!(p.is_ptr());
        assert_eq!(p.vcount(), 1);
        assert_eq!(p.base(), f4);
        assert_eq!(p.scalar_type(), DType::F32);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(DType::F32.to_string(), "f32");
        assert_eq!(DType::F16.vec(8).to_string(), "f16x8");
        assert_eq!(DType::F32.ptr_sized(16).to_string(), "*f32[16]");
        assert_eq!(DType::F32.local_ptr(256).to_string(), "*local f32[256]");
    }

    #[test]
    fn test_kind_predicates() {
        assert!(ScalarType::BF16.is_float());
        assert!(ScalarType::U8.is_unsigned() && ScalarType::U8.is_int());
        assert!(!ScalarType::Bool.is_int());
        assert!(!DType::F32.ptr().is_float());
        assert_eq!(ScalarType::parse("bf16"), Some(ScalarType::BF16));
        assert_eq!(ScalarType::parse("float"), None);
    }
}
