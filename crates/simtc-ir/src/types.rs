//! Type system for the simtc IR.
//!
//! Types are interned in a [`TypeContext`]; two types are equal iff their
//! handles are equal. Types are never mutated after interning.

use std::fmt;
use std::str::FromStr;

use crate::arena::{Handle, UniqueArena};
use crate::error::{CompilationError, Result, Status};
use crate::location::Location;

/// Sentinel for a shape or stride entry that is only known at kernel launch.
pub const DYNAMIC: i64 = i64::MIN;

/// Returns `true` if `value` is the [`DYNAMIC`] sentinel.
pub fn is_dynamic_value(value: i64) -> bool {
    value == DYNAMIC
}

/// Scalar element types.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ScalarType {
    I8,
    I16,
    I32,
    I64,
    /// Pointer-width integer used for indices and sizes (64 bit).
    Index,
    Bf16,
    F16,
    F32,
    F64,
    /// Complex number with `f32` components.
    C32,
    /// Complex number with `f64` components.
    C64,
}

impl ScalarType {
    pub const ALL: [Self; 11] = [
        Self::I8,
        Self::I16,
        Self::I32,
        Self::I64,
        Self::Index,
        Self::Bf16,
        Self::F16,
        Self::F32,
        Self::F64,
        Self::C32,
        Self::C64,
    ];

    /// Size in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::I8 => 1,
            Self::I16 | Self::Bf16 | Self::F16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::Index | Self::F64 | Self::C32 => 8,
            Self::C64 => 16,
        }
    }

    /// Required alignment in bytes.
    pub fn alignment(self) -> usize {
        self.size()
    }

    /// Number of bits of the integer or floating point representation.
    pub fn bits(self) -> u32 {
        (self.size() * 8) as u32
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::Index
        )
    }

    pub fn is_floating(self) -> bool {
        matches!(self, Self::Bf16 | Self::F16 | Self::F32 | Self::F64)
    }

    pub fn is_complex(self) -> bool {
        matches!(self, Self::C32 | Self::C64)
    }

    /// Component type of a complex type; the type itself otherwise.
    pub fn component_type(self) -> Self {
        match self {
            Self::C32 => Self::F32,
            Self::C64 => Self::F64,
            other => other,
        }
    }

    /// Returns `true` if values of `self` may be implicitly promoted to `to`.
    pub fn promotable(self, to: Self) -> bool {
        if self == to {
            return true;
        }
        if self.is_integer() {
            return if to.is_integer() {
                self.size() <= to.size()
            } else {
                true
            };
        }
        if self.is_floating() {
            return if to.is_floating() {
                self.size() < to.size()
            } else if to.is_complex() {
                self.promotable(to.component_type())
            } else {
                false
            };
        }
        to.is_complex() && self.size() <= to.size()
    }

    /// The common type of `a` and `b`, if one promotes to the other.
    pub fn promote(a: Self, b: Self) -> Option<Self> {
        if a.promotable(b) {
            Some(b)
        } else if b.promotable(a) {
            Some(a)
        } else {
            None
        }
    }

    /// Textual mnemonic (`f32`, `index`, ...).
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Index => "index",
            Self::Bf16 => "bf16",
            Self::F16 => "f16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::C32 => "c32",
            Self::C64 => "c64",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl FromStr for ScalarType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.mnemonic() == s)
            .ok_or_else(|| format!("unknown scalar type '{s}'"))
    }
}

/// Memory address space of a memref.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum AddressSpace {
    /// Device memory visible to all work-groups.
    Global,
    /// Work-group shared memory.
    Local,
}

impl AddressSpace {
    pub const ALL: [Self; 2] = [Self::Global, Self::Local];

    /// The single-space flag set for this address space.
    pub fn flag(self) -> AddressSpaces {
        match self {
            Self::Global => AddressSpaces::GLOBAL,
            Self::Local => AddressSpaces::LOCAL,
        }
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Global => "global",
            Self::Local => "local",
        })
    }
}

/// Bitflags over address spaces, used for barrier fences.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct AddressSpaces(u8);

impl AddressSpaces {
    pub const EMPTY: Self = Self(0);
    pub const GLOBAL: Self = Self(1);
    pub const LOCAL: Self = Self(2);

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the address spaces contained in the set.
    pub fn iter(self) -> impl Iterator<Item = AddressSpace> {
        AddressSpace::ALL
            .into_iter()
            .filter(move |space| self.contains(space.flag()))
    }
}

impl std::ops::BitOr for AddressSpaces {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for AddressSpaces {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Strided multi-dimensional view of memory.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct MemrefType {
    pub element: ScalarType,
    pub shape: Vec<i64>,
    pub stride: Vec<i64>,
    pub addrspace: AddressSpace,
}

impl MemrefType {
    /// Order (number of modes).
    pub fn dim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self, mode: usize) -> i64 {
        self.shape[mode]
    }

    pub fn stride(&self, mode: usize) -> i64 {
        self.stride[mode]
    }

    /// Returns `true` if any shape or stride entry is dynamic.
    pub fn is_dynamic(&self) -> bool {
        self.shape.iter().chain(&self.stride).any(|&v| is_dynamic_value(v))
    }

    /// Returns `true` if the shape has a dynamic entry.
    pub fn is_dynamic_shape(&self) -> bool {
        self.shape.iter().any(|&v| is_dynamic_value(v))
    }

    /// Bytes spanned by the memref, if statically known.
    pub fn size_in_bytes(&self) -> Option<i64> {
        if self.is_dynamic() {
            return None;
        }
        let elements = match (self.shape.last(), self.stride.last()) {
            (Some(&shape), Some(&stride)) => stride * shape,
            _ => 1,
        };
        Some(elements * self.element.size() as i64)
    }

    /// Packed column-major strides for `shape`.
    pub fn canonical_stride(shape: &[i64]) -> Vec<i64> {
        let mut stride = Vec::with_capacity(shape.len());
        let mut s = 1_i64;
        for &extent in shape {
            stride.push(s);
            s = if is_dynamic_value(s) || is_dynamic_value(extent) {
                DYNAMIC
            } else {
                s * extent
            };
        }
        stride
    }
}

/// A batch of memrefs sharing one memref type.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct GroupType {
    /// Handle of the (memref) element type.
    pub memref: Handle<Type>,
    /// Number of batch entries (may be [`DYNAMIC`]).
    pub size: i64,
    /// Element offset added to every batch entry (may be [`DYNAMIC`]).
    pub offset: i64,
}

/// Role of a cooperative matrix in a multiply-add.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum MatrixUse {
    A,
    B,
    Acc,
}

impl fmt::Display for MatrixUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::A => "matrix_a",
            Self::B => "matrix_b",
            Self::Acc => "matrix_acc",
        })
    }
}

/// A matrix distributed across the lanes of a subgroup.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct CoopMatrixType {
    pub component: ScalarType,
    pub rows: i64,
    pub cols: i64,
    pub usage: MatrixUse,
}

/// An IR type.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Type {
    Void,
    Bool,
    Scalar(ScalarType),
    Memref(MemrefType),
    Group(GroupType),
    CoopMatrix(CoopMatrixType),
}

impl Type {
    pub fn as_scalar(&self) -> Option<ScalarType> {
        match self {
            Self::Scalar(ty) => Some(*ty),
            _ => None,
        }
    }

    pub fn as_memref(&self) -> Option<&MemrefType> {
        match self {
            Self::Memref(mr) => Some(mr),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&GroupType> {
        match self {
            Self::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    /// Returns `true` for `index` and the other integer scalars.
    pub fn is_integer(&self) -> bool {
        self.as_scalar().is_some_and(ScalarType::is_integer)
    }
}

/// Interning context for types.
///
/// Not synchronized: compile programs concurrently with independent contexts.
#[derive(Clone, Debug, Default)]
pub struct TypeContext {
    types: UniqueArena<Type>,
}

impl TypeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ty: Handle<Type>) -> &Type {
        &self.types[ty]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<Type>, &Type)> {
        self.types.iter()
    }

    pub fn void(&mut self) -> Handle<Type> {
        self.types.insert(Type::Void)
    }

    pub fn bool(&mut self) -> Handle<Type> {
        self.types.insert(Type::Bool)
    }

    pub fn scalar(&mut self, ty: ScalarType) -> Handle<Type> {
        self.types.insert(Type::Scalar(ty))
    }

    pub fn index(&mut self) -> Handle<Type> {
        self.scalar(ScalarType::Index)
    }

    /// Interns a memref type.
    ///
    /// An empty `stride` selects the packed column-major layout.
    pub fn memref(
        &mut self,
        element: ScalarType,
        shape: &[i64],
        stride: &[i64],
        addrspace: AddressSpace,
        loc: Option<Location>,
    ) -> Result<Handle<Type>> {
        if shape.iter().any(|&s| s < 0 && !is_dynamic_value(s)) {
            return Err(CompilationError::new(Status::IrInvalidShape).at(loc));
        }
        let stride = if stride.is_empty() {
            MemrefType::canonical_stride(shape)
        } else {
            if stride.len() != shape.len() {
                return Err(CompilationError::new(Status::IrShapeStrideMismatch).at(loc));
            }
            if stride.iter().any(|&s| s < 0 && !is_dynamic_value(s)) {
                return Err(CompilationError::new(Status::IrInvalidShape)
                    .at(loc)
                    .with_extra("negative stride"));
            }
            stride.to_vec()
        };
        Ok(self.types.insert(Type::Memref(MemrefType {
            element,
            shape: shape.to_vec(),
            stride,
            addrspace,
        })))
    }

    /// Interns a memref type from an already validated description.
    pub fn memref_from(&mut self, memref: MemrefType) -> Handle<Type> {
        self.types.insert(Type::Memref(memref))
    }

    /// Interns a group type over the memref type `memref`.
    pub fn group(
        &mut self,
        memref: Handle<Type>,
        size: i64,
        offset: i64,
        loc: Option<Location>,
    ) -> Result<Handle<Type>> {
        if self.get(memref).as_memref().is_none() {
            return Err(CompilationError::new(Status::IrExpectedMemref).at(loc));
        }
        if (size < 0 && !is_dynamic_value(size)) || (offset < 0 && !is_dynamic_value(offset)) {
            return Err(CompilationError::new(Status::IrInvalidShape).at(loc));
        }
        Ok(self.types.insert(Type::Group(GroupType {
            memref,
            size,
            offset,
        })))
    }

    /// Interns a cooperative matrix type.
    pub fn coopmatrix(
        &mut self,
        component: ScalarType,
        rows: i64,
        cols: i64,
        usage: MatrixUse,
        loc: Option<Location>,
    ) -> Result<Handle<Type>> {
        if rows <= 0 || cols <= 0 {
            return Err(CompilationError::new(Status::IrInvalidShape).at(loc));
        }
        Ok(self.types.insert(Type::CoopMatrix(CoopMatrixType {
            component,
            rows,
            cols,
            usage,
        })))
    }

    /// Convenience accessor for memref types.
    pub fn memref_type(&self, ty: Handle<Type>) -> Option<&MemrefType> {
        self.get(ty).as_memref()
    }

    /// Convenience accessor for scalar types.
    pub fn scalar_type(&self, ty: Handle<Type>) -> Option<ScalarType> {
        self.get(ty).as_scalar()
    }
}
