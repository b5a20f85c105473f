//! Constant folding pass.
//!
//! Evaluates scalar instructions on `constant` operands in the operand's
//! numeric domain and applies algebraic identities when only one operand is
//! constant. Instructions are visited after their predecessors and nested
//! regions, so chains such as `(2 + 3) * x` fold in a single run.

use half::{bf16, f16};
use simtc_ir::{
    ArithOp, CmpCondition, ConstValue, Function, Handle, Op, Program, RegionRef, Result,
    ScalarType, Type, TypeContext, UnaryOp, Value, is_dynamic_value,
};

use crate::Pass;

/// Folds constant expressions at compile time.
#[derive(Debug, Default)]
pub struct ConstantFolding {
    /// Allows `x * 0 -> 0` on floating point values (wrong for NaN and infinity).
    pub unsafe_fp_math: bool,
}

impl ConstantFolding {
    pub fn new(unsafe_fp_math: bool) -> Self {
        Self { unsafe_fp_math }
    }
}

impl Pass for ConstantFolding {
    fn name(&self) -> &str {
        "constant-folding"
    }

    fn run(&self, program: &mut Program) -> Result<bool> {
        let mut changed = false;
        for func in &mut program.functions {
            let folded = fold_region(func, &program.types, RegionRef::Body, self.unsafe_fp_math);
            if folded > 0 {
                log::debug!("folded {folded} instructions in `{}`", func.name);
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Outcome of folding one operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Folded {
    /// The result is this literal.
    Constant(ConstValue),
    /// The result equals an existing value.
    Value(Handle<Value>),
}

fn fold_region(
    func: &mut Function,
    types: &TypeContext,
    region: RegionRef,
    unsafe_fp_math: bool,
) -> usize {
    let mut folded = 0;
    let mut pos = 0;
    while pos < func.region(region).insts.len() {
        let inst = func.region(region).insts[pos];
        for index in 0..func.inst(inst).regions.len() {
            let child = RegionRef::Child {
                inst,
                index: index as u32,
            };
            folded += fold_region(func, types, child, unsafe_fp_math);
        }

        let node = func.inst(inst);
        let Some(result) = node.result() else {
            pos += 1;
            continue;
        };
        let result_ty = func.value_type(result);
        let outcome = fold_operation(
            func,
            types,
            &node.op,
            node.operands(),
            result_ty,
            unsafe_fp_math,
        );
        match outcome {
            Some(Folded::Constant(c)) => {
                let loc = node.loc;
                let constant = func.create_inst(Op::Constant(c), Vec::new(), &[result_ty], Vec::new(), loc);
                func.region_mut(region).insts.insert(pos, constant);
                if let Some(new) = func.inst(constant).result() {
                    func.replace_all_uses_with(result, new);
                }
                func.erase(region, pos + 1);
                folded += 1;
                pos += 1;
            }
            Some(Folded::Value(value)) => {
                func.replace_all_uses_with(result, value);
                func.erase(region, pos);
                folded += 1;
            }
            _ => pos += 1,
        }
    }
    folded
}

/// Tries to fold `op` applied to `operands` producing a value of `result_ty`.
pub fn fold_operation(
    func: &Function,
    types: &TypeContext,
    op: &Op,
    operands: &[Handle<Value>],
    result_ty: Handle<Type>,
    unsafe_fp_math: bool,
) -> Option<Folded> {
    let constant = |i: usize| operands.get(i).and_then(|&v| func.constant_value(v));
    let operand_ty = |i: usize| types.get(func.value_type(operands[i]));
    match op {
        Op::Arith(arith) => {
            let ty = operand_ty(0);
            match (constant(0), constant(1)) {
                (Some(a), Some(b)) => fold_arith(*arith, ty, a, b).map(Folded::Constant),
                (Some(a), None) => {
                    fold_identity(*arith, ty, operands[1], a, true, unsafe_fp_math)
                }
                (None, Some(b)) => {
                    fold_identity(*arith, ty, operands[0], b, false, unsafe_fp_math)
                }
                (None, None) => None,
            }
        }
        Op::ArithUnary(unary) => {
            fold_unary(*unary, operand_ty(0), constant(0)?).map(Folded::Constant)
        }
        Op::Cast => {
            let to = types.get(result_ty).as_scalar()?;
            fold_cast(to, constant(0)?).map(Folded::Constant)
        }
        Op::Cmp(cond) => fold_cmp(*cond, constant(0)?, constant(1)?).map(Folded::Constant),
        Op::Size { mode } => {
            let extent = match operand_ty(0) {
                Type::Memref(mr) => mr.shape(*mode as usize),
                Type::Group(g) => g.size,
                _ => return None,
            };
            (!is_dynamic_value(extent)).then_some(Folded::Constant(ConstValue::Int(extent)))
        }
        _ => None,
    }
}

/// Sign-extends the low `bits` of `value` for integer type `ty`.
fn wrap_int(ty: ScalarType, value: i64) -> i64 {
    match ty {
        ScalarType::I8 => value as i8 as i64,
        ScalarType::I16 => value as i16 as i64,
        ScalarType::I32 => value as i32 as i64,
        _ => value,
    }
}

/// Rounds `value` to the precision of floating point type `ty`.
fn round_float(ty: ScalarType, value: f64) -> f64 {
    match ty {
        ScalarType::F16 => f16::from_f64(value).to_f64(),
        ScalarType::Bf16 => bf16::from_f64(value).to_f64(),
        ScalarType::F32 | ScalarType::C32 => value as f32 as f64,
        _ => value,
    }
}

fn round_complex(ty: ScalarType, re: f64, im: f64) -> ConstValue {
    ConstValue::Complex(round_float(ty, re), round_float(ty, im))
}

fn as_complex(c: ConstValue) -> Option<(f64, f64)> {
    match c {
        ConstValue::Complex(re, im) => Some((re, im)),
        ConstValue::Float(re) => Some((re, 0.0)),
        _ => None,
    }
}

/// Evaluates a binary operation on two literals of type `ty`.
pub fn fold_arith(op: ArithOp, ty: &Type, a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    match ty {
        Type::Bool => {
            let (ConstValue::Bool(a), ConstValue::Bool(b)) = (a, b) else {
                return None;
            };
            match op {
                ArithOp::And => Some(ConstValue::Bool(a && b)),
                ArithOp::Or => Some(ConstValue::Bool(a || b)),
                ArithOp::Xor => Some(ConstValue::Bool(a ^ b)),
                _ => None,
            }
        }
        Type::Scalar(s) if s.is_integer() => {
            let (ConstValue::Int(a), ConstValue::Int(b)) = (a, b) else {
                return None;
            };
            let shift = (b.rem_euclid(i64::from(s.bits()))) as u32;
            let v = match op {
                ArithOp::Add => a.wrapping_add(b),
                ArithOp::Sub => a.wrapping_sub(b),
                ArithOp::Mul => a.wrapping_mul(b),
                ArithOp::Div if b != 0 => a.wrapping_div(b),
                ArithOp::Rem if b != 0 => a.wrapping_rem(b),
                ArithOp::Div | ArithOp::Rem => return None,
                ArithOp::Shl => a.wrapping_shl(shift),
                ArithOp::Shr => a.wrapping_shr(shift),
                ArithOp::And => a & b,
                ArithOp::Or => a | b,
                ArithOp::Xor => a ^ b,
                ArithOp::Min => a.min(b),
                ArithOp::Max => a.max(b),
            };
            Some(ConstValue::Int(wrap_int(*s, v)))
        }
        Type::Scalar(s) if s.is_floating() => {
            let (ConstValue::Float(a), ConstValue::Float(b)) = (a, b) else {
                return None;
            };
            let v = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => a / b,
                ArithOp::Rem => a % b,
                ArithOp::Min => a.min(b),
                ArithOp::Max => a.max(b),
                _ => return None,
            };
            Some(ConstValue::Float(round_float(*s, v)))
        }
        Type::Scalar(s) if s.is_complex() => {
            let (ar, ai) = as_complex(a)?;
            let (br, bi) = as_complex(b)?;
            let (re, im) = match op {
                ArithOp::Add => (ar + br, ai + bi),
                ArithOp::Sub => (ar - br, ai - bi),
                ArithOp::Mul => (ar * br - ai * bi, ar * bi + ai * br),
                ArithOp::Div => {
                    let d = br * br + bi * bi;
                    ((ar * br + ai * bi) / d, (ai * br - ar * bi) / d)
                }
                _ => return None,
            };
            Some(round_complex(*s, re, im))
        }
        _ => None,
    }
}

/// Identities with one literal operand; `literal_first` tells which side it is on.
fn fold_identity(
    op: ArithOp,
    ty: &Type,
    other: Handle<Value>,
    literal: ConstValue,
    literal_first: bool,
    unsafe_fp_math: bool,
) -> Option<Folded> {
    let keep = Some(Folded::Value(other));
    match ty {
        Type::Bool => {
            let ConstValue::Bool(l) = literal else {
                return None;
            };
            match (op, l) {
                (ArithOp::And, true) | (ArithOp::Or, false) | (ArithOp::Xor, false) => keep,
                (ArithOp::And, false) => Some(Folded::Constant(ConstValue::Bool(false))),
                (ArithOp::Or, true) => Some(Folded::Constant(ConstValue::Bool(true))),
                _ => None,
            }
        }
        Type::Scalar(s) if s.is_integer() => {
            let ConstValue::Int(l) = literal else {
                return None;
            };
            let zero = Some(Folded::Constant(ConstValue::Int(0)));
            match (op, l, literal_first) {
                (ArithOp::Add, 0, _) | (ArithOp::Mul, 1, _) => keep,
                (ArithOp::Sub | ArithOp::Shl | ArithOp::Shr, 0, false) => keep,
                (ArithOp::Div, 1, false) => keep,
                (ArithOp::Rem, 1, false) => zero,
                (ArithOp::Mul, 0, _) | (ArithOp::And, 0, _) => zero,
                (ArithOp::And, -1, _) | (ArithOp::Or, 0, _) | (ArithOp::Xor, 0, _) => keep,
                (ArithOp::Or, -1, _) => Some(Folded::Constant(ConstValue::Int(-1))),
                _ => None,
            }
        }
        Type::Scalar(s) if s.is_floating() || s.is_complex() => {
            let complex = s.is_complex();
            match op {
                ArithOp::Add if literal.is_zero() => keep,
                ArithOp::Sub if literal.is_zero() && !literal_first => keep,
                ArithOp::Mul if literal.is_one() => keep,
                ArithOp::Div if literal.is_one() && !literal_first => keep,
                ArithOp::Mul if literal.is_zero() => {
                    fold_fp_mul_by_zero(complex, unsafe_fp_math)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// `x * 0` on floating point values is `0` only when NaN and infinity can be
/// ignored, since `NaN * 0` and `inf * 0` are NaN.
fn fold_fp_mul_by_zero(complex: bool, unsafe_fp_math: bool) -> Option<Folded> {
    if !unsafe_fp_math {
        return None;
    }
    let zero = if complex {
        ConstValue::Complex(0.0, 0.0)
    } else {
        ConstValue::Float(0.0)
    };
    Some(Folded::Constant(zero))
}

/// Evaluates a unary operation on a literal of type `ty`.
pub fn fold_unary(op: UnaryOp, ty: &Type, a: ConstValue) -> Option<ConstValue> {
    match (ty, a) {
        (Type::Bool, ConstValue::Bool(b)) if op == UnaryOp::Not => Some(ConstValue::Bool(!b)),
        (Type::Scalar(s), ConstValue::Int(i)) => {
            let v = match op {
                UnaryOp::Neg => i.wrapping_neg(),
                UnaryOp::Not => !i,
                UnaryOp::Abs => i.wrapping_abs(),
                _ => return None,
            };
            Some(ConstValue::Int(wrap_int(*s, v)))
        }
        (Type::Scalar(s), ConstValue::Float(f)) if s.is_floating() => {
            let v = match op {
                UnaryOp::Neg => -f,
                UnaryOp::Abs => f.abs(),
                _ => return None,
            };
            Some(ConstValue::Float(round_float(*s, v)))
        }
        (Type::Scalar(s), ConstValue::Complex(re, im)) => match op {
            UnaryOp::Neg => Some(round_complex(*s, -re, -im)),
            UnaryOp::Conj => Some(round_complex(*s, re, -im)),
            UnaryOp::Abs => Some(ConstValue::Float(round_float(*s, re.hypot(im)))),
            UnaryOp::Re => Some(ConstValue::Float(re)),
            UnaryOp::Im => Some(ConstValue::Float(im)),
            UnaryOp::Not => None,
        },
        _ => None,
    }
}

/// Converts a literal to scalar type `to`.
pub fn fold_cast(to: ScalarType, a: ConstValue) -> Option<ConstValue> {
    let value = match a {
        ConstValue::Int(i) => {
            if to.is_integer() {
                ConstValue::Int(wrap_int(to, i))
            } else if to.is_complex() {
                round_complex(to, i as f64, 0.0)
            } else {
                ConstValue::Float(round_float(to, i as f64))
            }
        }
        ConstValue::Float(f) => {
            if to.is_integer() {
                ConstValue::Int(wrap_int(to, f as i64))
            } else if to.is_complex() {
                round_complex(to, f, 0.0)
            } else {
                ConstValue::Float(round_float(to, f))
            }
        }
        ConstValue::Complex(re, im) if to.is_complex() => round_complex(to, re, im),
        _ => return None,
    };
    Some(value)
}

/// Evaluates a comparison of two literals of the same type.
pub fn fold_cmp(cond: CmpCondition, a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    use std::cmp::Ordering;
    let ordering = match (a, b) {
        (ConstValue::Int(a), ConstValue::Int(b)) => Some(a.cmp(&b)),
        (ConstValue::Float(a), ConstValue::Float(b)) => a.partial_cmp(&b),
        (ConstValue::Bool(a), ConstValue::Bool(b)) => Some(a.cmp(&b)),
        (ConstValue::Complex(..), ConstValue::Complex(..)) => {
            return match cond {
                CmpCondition::Eq => Some(ConstValue::Bool(a == b)),
                CmpCondition::Ne => Some(ConstValue::Bool(a != b)),
                _ => None,
            };
        }
        _ => return None,
    };
    let result = match (cond, ordering) {
        // Unordered (NaN) compares false except for `ne`.
        (CmpCondition::Ne, None) => true,
        (_, None) => false,
        (CmpCondition::Eq, Some(o)) => o == Ordering::Equal,
        (CmpCondition::Ne, Some(o)) => o != Ordering::Equal,
        (CmpCondition::Gt, Some(o)) => o == Ordering::Greater,
        (CmpCondition::Ge, Some(o)) => o != Ordering::Less,
        (CmpCondition::Lt, Some(o)) => o == Ordering::Less,
        (CmpCondition::Le, Some(o)) => o != Ordering::Greater,
    };
    Some(ConstValue::Bool(result))
}
