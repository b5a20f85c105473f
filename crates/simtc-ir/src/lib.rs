//! simtc intermediate representation.
//!
//! An arena-based SSA IR for tensor and BLAS kernels targeting SIMT
//! accelerators. Types are interned in a [`TypeContext`]; every [`Function`]
//! owns the values and instructions it contains, addressed by [`Handle`]s.

pub mod arena;
mod builder;
mod device;
mod diagnostic;
mod display;
mod error;
mod func;
mod inst;
mod location;
mod region;
mod types;
mod value;

pub use arena::{Arena, Handle, UniqueArena};
pub use builder::Builder;
pub use device::{CoreConfig, CoreFeatureFlags, CorePreset};
pub use diagnostic::{CollectingSink, DiagnosticSink, NullSink, report};
pub use display::{dump_function, dump_program, format_type};
pub use error::{CompilationError, Result, Status};
pub use func::{Function, ValueMap};
pub use inst::{
    ArithOp, BlasOperands, Builtin, CmpCondition, ConstValue, ExecKind, Extent, Inst, Op, Slice,
    StoreFlag, Transpose, UnaryOp,
};
pub use location::{Location, Position};
pub use region::{Region, RegionKind, RegionRef};
pub use types::{
    AddressSpace, AddressSpaces, CoopMatrixType, DYNAMIC, GroupType, MatrixUse, MemrefType,
    ScalarType, Type, TypeContext, is_dynamic_value,
};
pub use value::{Use, Value, ValueDef};

/// A compilation unit: interned types plus kernel functions.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub types: TypeContext,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a function by name.
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Adds a function, rejecting duplicate names.
    pub fn add_function(&mut self, func: Function) -> Result<()> {
        if self.function(&func.name).is_some() {
            return Err(CompilationError::new(Status::IrDuplicateName)
                .at(func.loc)
                .with_extra(func.name));
        }
        self.functions.push(func);
        Ok(())
    }
}
