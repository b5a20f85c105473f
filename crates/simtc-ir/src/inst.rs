//! Instructions: a closed set of opcodes with inline properties.
//!
//! Operands, results and child regions are stored uniformly on [`Inst`] so
//! that use-list maintenance, cloning and substitution need not know the
//! opcode. The opcode-specific, immutable payload lives in [`Op`].

use std::fmt;

use crate::arena::Handle;
use crate::location::Location;
use crate::region::Region;
use crate::types::AddressSpaces;
use crate::value::Value;

/// Where an instruction may legally appear.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecKind {
    /// Works on the whole work-group; illegal inside SPMD regions.
    Collective,
    /// Ordinary scalar code; legal anywhere.
    Mixed,
    /// Per-lane code; legal only inside SPMD regions.
    Spmd,
}

/// Binary arithmetic operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    Min,
    Max,
}

impl ArithOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Rem => "rem",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    /// Operations defined on integers and booleans only.
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            Self::Shl | Self::Shr | Self::And | Self::Or | Self::Xor
        )
    }
}

/// Unary arithmetic operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
    Abs,
    Conj,
    Im,
    Re,
}

impl UnaryOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Not => "not",
            Self::Abs => "abs",
            Self::Conj => "conj",
            Self::Im => "im",
            Self::Re => "re",
        }
    }
}

/// Comparison conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmpCondition {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpCondition {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Le => "le",
        }
    }
}

/// How a store combines with memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreFlag {
    Regular,
    Atomic,
    AtomicAdd,
}

/// Transposition flag of a BLAS operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transpose {
    N,
    T,
}

impl Transpose {
    pub fn is_transposed(self) -> bool {
        self == Self::T
    }

    /// Maps a mode index of `op(A)` to the mode index of `A`.
    pub fn mode(self, mode: usize) -> usize {
        match self {
            Self::N => mode,
            Self::T => 1 - mode,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::N => "n",
            Self::T => "t",
        }
    }
}

/// Built-in work-item queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Builtin {
    GroupId,
    NumGroups,
    NumSubgroups,
    SubgroupSize,
    SubgroupId,
    SubgroupLocalId,
}

impl Builtin {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::GroupId => "group_id",
            Self::NumGroups => "num_groups",
            Self::NumSubgroups => "num_subgroups",
            Self::SubgroupSize => "subgroup_size",
            Self::SubgroupId => "subgroup_id",
            Self::SubgroupLocalId => "subgroup_local_id",
        }
    }
}

/// Literal payload of a `constant` instruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConstValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(f64, f64),
}

impl ConstValue {
    pub fn is_zero(self) -> bool {
        match self {
            Self::Bool(b) => !b,
            Self::Int(i) => i == 0,
            Self::Float(f) => f == 0.0,
            Self::Complex(re, im) => re == 0.0 && im == 0.0,
        }
    }

    pub fn is_one(self) -> bool {
        match self {
            Self::Bool(b) => b,
            Self::Int(i) => i == 1,
            Self::Float(f) => f == 1.0,
            Self::Complex(re, im) => re == 1.0 && im == 0.0,
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Complex(re, im) => write!(f, "[{re:?},{im:?}]"),
        }
    }
}

/// A static or dynamic extent; `Dynamic` consumes the next dynamic operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Extent {
    Static(i64),
    Dynamic,
    /// Derived from the parent memref (remaining extent or expand ratio).
    Infer,
}

impl Extent {
    pub fn is_dynamic(self) -> bool {
        self == Self::Dynamic
    }
}

/// One mode of a `subview`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slice {
    /// A single index; the mode is dropped from the result.
    Index(Extent),
    /// `offset:size`; `size` may be `Infer` for "up to the end".
    Range { offset: Extent, size: Extent },
}

/// Opcodes with their immutable properties.
///
/// Operand layouts:
/// - `arith`/`cmp`: `a, b`; `arith_unary`/`cast`: `a`
/// - `load`: `operand, index...`; `store`: `value, memref, index...`
/// - `subview`: `memref, (offset, size)...` dynamic entries in mode order
/// - `expand`: `memref, shape...` dynamic entries; `fuse`/`size`: `memref`
/// - `lifetime_stop`: `alloca result`
/// - `axpby`/`sum`: `alpha, A, beta, B`; `gemm`/`gemv`/`ger`/`hadamard`: `alpha, A, B, beta, C`
/// - `for`: `from, to, [step], init...`; `if`: `condition`; `yield`: `values...`
/// - `foreach`: `from..., to...`
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Constant(ConstValue),
    Arith(ArithOp),
    ArithUnary(UnaryOp),
    Cast,
    Cmp(CmpCondition),
    Builtin(Builtin),
    Load,
    Store(StoreFlag),
    Subview {
        slices: Vec<Slice>,
    },
    Expand {
        mode: u32,
        shape: Vec<Extent>,
    },
    Fuse {
        from: u32,
        to: u32,
    },
    Size {
        mode: u32,
    },
    Alloca {
        /// Byte offset into the work-group scratch buffer, set by stack allocation.
        stack_ptr: Option<i64>,
    },
    LifetimeStop,
    Barrier(AddressSpaces),
    Axpby {
        atomic: bool,
        trans_a: Transpose,
    },
    Gemm {
        atomic: bool,
        trans_a: Transpose,
        trans_b: Transpose,
    },
    Gemv {
        atomic: bool,
        trans_a: Transpose,
    },
    Ger {
        atomic: bool,
    },
    Hadamard {
        atomic: bool,
    },
    Sum {
        atomic: bool,
        trans_a: Transpose,
    },
    For {
        has_step: bool,
    },
    If,
    Yield,
    Foreach {
        dim: u32,
    },
    Parallel,
}

impl Op {
    /// Execution kind of the opcode.
    pub fn kind(&self) -> ExecKind {
        match self {
            Self::Alloca { .. }
            | Self::LifetimeStop
            | Self::Barrier(_)
            | Self::Axpby { .. }
            | Self::Gemm { .. }
            | Self::Gemv { .. }
            | Self::Ger { .. }
            | Self::Hadamard { .. }
            | Self::Sum { .. }
            | Self::Foreach { .. }
            | Self::Parallel => ExecKind::Collective,
            Self::Builtin(Builtin::SubgroupId | Builtin::SubgroupLocalId) => ExecKind::Spmd,
            _ => ExecKind::Mixed,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Constant(_) => "constant",
            Self::Arith(op) => op.mnemonic(),
            Self::ArithUnary(op) => op.mnemonic(),
            Self::Cast => "cast",
            Self::Cmp(cond) => match cond {
                CmpCondition::Eq => "cmp.eq",
                CmpCondition::Ne => "cmp.ne",
                CmpCondition::Gt => "cmp.gt",
                CmpCondition::Ge => "cmp.ge",
                CmpCondition::Lt => "cmp.lt",
                CmpCondition::Le => "cmp.le",
            },
            Self::Builtin(b) => b.mnemonic(),
            Self::Load => "load",
            Self::Store(_) => "store",
            Self::Subview { .. } => "subview",
            Self::Expand { .. } => "expand",
            Self::Fuse { .. } => "fuse",
            Self::Size { .. } => "size",
            Self::Alloca { .. } => "alloca",
            Self::LifetimeStop => "lifetime_stop",
            Self::Barrier(_) => "barrier",
            Self::Axpby { .. } => "axpby",
            Self::Gemm { .. } => "gemm",
            Self::Gemv { .. } => "gemv",
            Self::Ger { .. } => "ger",
            Self::Hadamard { .. } => "hadamard",
            Self::Sum { .. } => "sum",
            Self::For { .. } => "for",
            Self::If => "if",
            Self::Yield => "yield",
            Self::Foreach { .. } => "foreach",
            Self::Parallel => "parallel",
        }
    }

    /// Returns `true` for instructions that write memory, synchronize or
    /// steer control flow, i.e. that may not be removed when unused.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Self::Store(_)
                | Self::LifetimeStop
                | Self::Barrier(_)
                | Self::Axpby { .. }
                | Self::Gemm { .. }
                | Self::Gemv { .. }
                | Self::Ger { .. }
                | Self::Hadamard { .. }
                | Self::Sum { .. }
                | Self::For { .. }
                | Self::If
                | Self::Yield
                | Self::Foreach { .. }
                | Self::Parallel
        )
    }

    /// Returns `true` for the collective BLAS-class opcodes.
    pub fn is_blas(&self) -> bool {
        matches!(
            self,
            Self::Axpby { .. }
                | Self::Gemm { .. }
                | Self::Gemv { .. }
                | Self::Ger { .. }
                | Self::Hadamard { .. }
                | Self::Sum { .. }
        )
    }

    /// Returns `true` for `subview`, `expand` and `fuse`, whose result aliases operand 0.
    pub fn is_view(&self) -> bool {
        matches!(
            self,
            Self::Subview { .. } | Self::Expand { .. } | Self::Fuse { .. }
        )
    }

    /// The `atomic` flag of BLAS opcodes.
    pub fn is_atomic(&self) -> bool {
        match self {
            Self::Axpby { atomic, .. }
            | Self::Gemm { atomic, .. }
            | Self::Gemv { atomic, .. }
            | Self::Ger { atomic }
            | Self::Hadamard { atomic }
            | Self::Sum { atomic, .. } => *atomic,
            _ => false,
        }
    }
}

/// Named operands of a BLAS-class instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlasOperands {
    pub alpha: Handle<Value>,
    pub a: Handle<Value>,
    /// Second input; `None` for `axpby` and `sum`.
    pub b: Option<Handle<Value>>,
    pub beta: Handle<Value>,
    /// The updated output.
    pub out: Handle<Value>,
}

/// An instruction node.
#[derive(Clone, Debug)]
pub struct Inst {
    pub op: Op,
    pub(crate) operands: Vec<Handle<Value>>,
    pub(crate) results: Vec<Handle<Value>>,
    pub regions: Vec<Region>,
    pub loc: Option<Location>,
}

impl Inst {
    pub fn operands(&self) -> &[Handle<Value>] {
        &self.operands
    }

    pub fn operand(&self, index: usize) -> Handle<Value> {
        self.operands[index]
    }

    pub fn results(&self) -> &[Handle<Value>] {
        &self.results
    }

    /// The single result of the instruction, if it has exactly one.
    pub fn result(&self) -> Option<Handle<Value>> {
        match self.results.as_slice() {
            [r] => Some(*r),
            _ => None,
        }
    }

    pub fn blas_operands(&self) -> Option<BlasOperands> {
        match self.op {
            Op::Axpby { .. } | Op::Sum { .. } => Some(BlasOperands {
                alpha: self.operands[0],
                a: self.operands[1],
                b: None,
                beta: self.operands[2],
                out: self.operands[3],
            }),
            Op::Gemm { .. } | Op::Gemv { .. } | Op::Ger { .. } | Op::Hadamard { .. } => {
                Some(BlasOperands {
                    alpha: self.operands[0],
                    a: self.operands[1],
                    b: Some(self.operands[2]),
                    beta: self.operands[3],
                    out: self.operands[4],
                })
            }
            _ => None,
        }
    }

    /// `(from, to, step)` of a `for` instruction.
    pub fn loop_bounds(&self) -> Option<(Handle<Value>, Handle<Value>, Option<Handle<Value>>)> {
        match self.op {
            Op::For { has_step } => Some((
                self.operands[0],
                self.operands[1],
                has_step.then(|| self.operands[2]),
            )),
            _ => None,
        }
    }

    /// Initial values of the loop-carried variables of a `for` instruction.
    pub fn loop_init(&self) -> &[Handle<Value>] {
        match self.op {
            Op::For { has_step } => &self.operands[if has_step { 3 } else { 2 }..],
            _ => &[],
        }
    }

    /// Values read from memory (first) and written (second) by this instruction itself.
    pub fn memory_effects(&self) -> (Vec<Handle<Value>>, Vec<Handle<Value>>) {
        match &self.op {
            Op::Load => (vec![self.operands[0]], Vec::new()),
            Op::Store(_) => (Vec::new(), vec![self.operands[1]]),
            _ => match self.blas_operands() {
                Some(blas) => {
                    let mut reads = vec![blas.a];
                    reads.extend(blas.b);
                    (reads, vec![blas.out])
                }
                None => (Vec::new(), Vec::new()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_kinds() {
        assert_eq!(
            Op::Gemm {
                atomic: false,
                trans_a: Transpose::N,
                trans_b: Transpose::N
            }
            .kind(),
            ExecKind::Collective
        );
        assert_eq!(Op::Arith(ArithOp::Add).kind(), ExecKind::Mixed);
        assert_eq!(
            Op::Builtin(Builtin::SubgroupLocalId).kind(),
            ExecKind::Spmd
        );
        assert_eq!(Op::Builtin(Builtin::GroupId).kind(), ExecKind::Mixed);
    }

    #[test]
    fn const_value_predicates() {
        assert!(ConstValue::Int(0).is_zero());
        assert!(ConstValue::Float(1.0).is_one());
        assert!(ConstValue::Complex(1.0, 0.0).is_one());
        assert!(!ConstValue::Complex(1.0, 1.0).is_one());
        assert!(ConstValue::Float(-0.0).is_zero());
        assert!(!ConstValue::Float(f64::NAN).is_zero());
    }

    #[test]
    fn transpose_mode_mapping() {
        assert_eq!(Transpose::N.mode(0), 0);
        assert_eq!(Transpose::T.mode(0), 1);
        assert_eq!(Transpose::T.mode(1), 0);
    }

    #[test]
    fn side_effects() {
        assert!(Op::Store(StoreFlag::Regular).has_side_effects());
        assert!(!Op::Load.has_side_effects());
        assert!(!Op::Constant(ConstValue::Int(1)).has_side_effects());
        assert!(Op::Subview { slices: vec![] }.is_view());
    }
}
