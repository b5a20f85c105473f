//! Status codes and the compilation error carried through the pipeline.

use std::fmt;

use crate::location::Location;

/// Closed set of status codes reported by the compiler core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    BadAlloc,
    InvalidArguments,
    InternalCompilerError,
    UnsupportedSubgroupSize,
    UnsupportedWorkGroupSize,
    IrOutOfBounds,
    IrInvalidShape,
    IrIncompatibleShapes,
    IrShapeStrideMismatch,
    IrScalarMismatch,
    IrInvalidNumberOfIndices,
    IrExpectedScalar,
    IrExpectedIndex,
    IrExpectedBoolean,
    IrExpectedInteger,
    IrExpectedMemref,
    IrExpectedMemrefOrGroup,
    IrExpectedVectorOrMatrix,
    IrExpectedLocalAddressSpace,
    IrUnexpectedYield,
    IrYieldMismatch,
    IrMultipleDynamicModes,
    IrInvalidSlice,
    IrExpandShapeOrderTooSmall,
    IrExpandShapeMismatch,
    IrInvalidFusionRange,
    IrCollectiveCalledFromSpmd,
    IrSpmdCalledFromCollective,
    IrForbiddenCast,
    IrForbiddenPromotion,
    IrConstantMismatch,
    IrFpUnsupported,
    IrIntUnsupported,
    IrBooleanUnsupported,
    IrComplexUnsupported,
    IrDuplicateName,
}

impl Status {
    /// Human-readable description of the status.
    pub fn message(self) -> &'static str {
        match self {
            Self::BadAlloc => "bad allocation",
            Self::InvalidArguments => "invalid arguments",
            Self::InternalCompilerError => "internal compiler error",
            Self::UnsupportedSubgroupSize => "subgroup size is not supported by the device",
            Self::UnsupportedWorkGroupSize => "work-group size is not supported by the device",
            Self::IrOutOfBounds => "argument is out of bounds",
            Self::IrInvalidShape => "invalid tensor shape",
            Self::IrIncompatibleShapes => "tensor shapes are incompatible",
            Self::IrShapeStrideMismatch => "dimension of shape and stride must match",
            Self::IrScalarMismatch => "scalar types of operands must match",
            Self::IrInvalidNumberOfIndices => "number of indices must match memref order",
            Self::IrExpectedScalar => "expected scalar type",
            Self::IrExpectedIndex => "expected index type",
            Self::IrExpectedBoolean => "expected boolean type",
            Self::IrExpectedInteger => "expected integer type",
            Self::IrExpectedMemref => "expected memref type",
            Self::IrExpectedMemrefOrGroup => "expected memref or group type",
            Self::IrExpectedVectorOrMatrix => "expected memref of order 1 or 2",
            Self::IrExpectedLocalAddressSpace => "expected memref in local address space",
            Self::IrUnexpectedYield => "yield is only allowed as the last instruction of a region",
            Self::IrYieldMismatch => "yielded values do not match the expected result types",
            Self::IrMultipleDynamicModes => "at most one mode may be inferred",
            Self::IrInvalidSlice => "static offsets and sizes must be non-negative",
            Self::IrExpandShapeOrderTooSmall => "expand shape must have at least two modes",
            Self::IrExpandShapeMismatch => "product of expand shape must equal the expanded mode",
            Self::IrInvalidFusionRange => "fuse range must satisfy from < to < order",
            Self::IrCollectiveCalledFromSpmd => "collective instruction must not be called from SPMD region",
            Self::IrSpmdCalledFromCollective => "SPMD instruction must not be called from collective region",
            Self::IrForbiddenCast => "cast between these types is forbidden",
            Self::IrForbiddenPromotion => "type promotion is forbidden",
            Self::IrConstantMismatch => "constant value does not match its type",
            Self::IrFpUnsupported => "floating point type unsupported by instruction",
            Self::IrIntUnsupported => "integer type unsupported by instruction",
            Self::IrBooleanUnsupported => "boolean type unsupported by instruction",
            Self::IrComplexUnsupported => "complex type unsupported by instruction",
            Self::IrDuplicateName => "duplicate name",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// The single error type of the compiler core.
///
/// Carries a status code, the source location of the offending construct when
/// known, and optional free-form context.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{}{status}{}", location_prefix(.location), extra_suffix(.extra))]
pub struct CompilationError {
    pub status: Status,
    pub location: Option<Location>,
    pub extra: String,
}

fn location_prefix(location: &Option<Location>) -> String {
    location.map(|loc| format!("{loc}: ")).unwrap_or_default()
}

fn extra_suffix(extra: &str) -> String {
    if extra.is_empty() {
        String::new()
    } else {
        format!(" ({extra})")
    }
}

impl CompilationError {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            location: None,
            extra: String::new(),
        }
    }

    /// Attaches a source location (keeps an existing one if `location` is `None`).
    pub fn at(mut self, location: Option<Location>) -> Self {
        if location.is_some() {
            self.location = location;
        }
        self
    }

    /// Attaches free-form context.
    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = extra.into();
        self
    }

    /// Shorthand for an internal compiler error with context.
    pub fn internal(extra: impl Into<String>) -> Self {
        Self::new(Status::InternalCompilerError).with_extra(extra)
    }
}

impl From<Status> for CompilationError {
    fn from(status: Status) -> Self {
        Self::new(status)
    }
}

/// Result alias used throughout the compiler core.
pub type Result<T, E = CompilationError> = std::result::Result<T, E>;
