//! SSA values and their use-lists.

use crate::arena::Handle;
use crate::inst::Inst;
use crate::location::Location;
use crate::types::Type;

/// One use of a value: operand slot `operand` of instruction `inst`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Use {
    pub inst: Handle<Inst>,
    pub operand: u32,
}

/// Where a value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueDef {
    /// Function parameter at the given position.
    Param(u32),
    /// Result `index` of instruction `inst`.
    Result { inst: Handle<Inst>, index: u32 },
    /// Parameter `index` of child region `region` of instruction `inst`.
    RegionParam {
        inst: Handle<Inst>,
        region: u32,
        index: u32,
    },
    /// Not yet attached to a producer.
    Detached,
}

/// An SSA value.
///
/// The use-list is a side table maintained by [`crate::Function`]; it is
/// never edited directly by passes.
#[derive(Clone, Debug)]
pub struct Value {
    pub ty: Handle<Type>,
    pub name: Option<String>,
    pub loc: Option<Location>,
    pub def: ValueDef,
    pub(crate) uses: Vec<Use>,
}

impl Value {
    pub fn new(ty: Handle<Type>, loc: Option<Location>) -> Self {
        Self {
            ty,
            name: None,
            loc,
            def: ValueDef::Detached,
            uses: Vec::new(),
        }
    }

    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    pub fn has_uses(&self) -> bool {
        !self.uses.is_empty()
    }

    /// The instruction producing this value as a result, if any.
    pub fn defining_inst(&self) -> Option<Handle<Inst>> {
        match self.def {
            ValueDef::Result { inst, .. } => Some(inst),
            _ => None,
        }
    }
}
