//! Regions: ordered instruction lists owned by a function or an instruction.

use crate::arena::Handle;
use crate::inst::{ExecKind, Inst};
use crate::value::Value;

/// Execution context a region establishes for its instructions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Work-group wide code (function bodies).
    #[default]
    Collective,
    /// Inherits the kind of the enclosing region (`for`, `if` bodies).
    Mixed,
    /// Per-lane code (`foreach`, `parallel` bodies).
    Spmd,
}

impl RegionKind {
    /// The effective kind inside this region given the enclosing effective kind.
    pub fn resolve(self, enclosing: RegionKind) -> RegionKind {
        match self {
            Self::Mixed => enclosing,
            other => other,
        }
    }

    /// Returns `true` if an instruction of kind `kind` may appear in a region
    /// whose effective kind is `self`.
    pub fn admits(self, kind: ExecKind) -> bool {
        !matches!(
            (self, kind),
            (Self::Spmd, ExecKind::Collective) | (Self::Collective, ExecKind::Spmd)
        )
    }
}

/// An ordered list of instructions plus block parameters.
#[derive(Clone, Debug, Default)]
pub struct Region {
    pub params: Vec<Handle<Value>>,
    pub insts: Vec<Handle<Inst>>,
    pub kind: RegionKind,
}

impl Region {
    pub fn new(kind: RegionKind) -> Self {
        Self {
            params: Vec::new(),
            insts: Vec::new(),
            kind,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    /// Position of `inst` in this region.
    pub fn position(&self, inst: Handle<Inst>) -> Option<usize> {
        self.insts.iter().position(|&h| h == inst)
    }
}

/// Addresses a region inside a function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionRef {
    /// The function body.
    Body,
    /// Child region `index` of instruction `inst`.
    Child { inst: Handle<Inst>, index: u32 },
}
