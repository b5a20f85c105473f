//! Mapping of IR types and scalar semantics onto OpenCL C.

use simtc_backend_core::clir::{BinaryOp, BuiltinType, DataType, Expr, Space, UnaryOp as ClUnary};
use simtc_ir::{
    AddressSpace, ArithOp, CmpCondition, CompilationError, ConstValue, CoopMatrixType, MemrefType,
    Result, ScalarType, Status, UnaryOp,
};

/// Type a scalar lives in while held in registers.
pub fn register_type(ty: ScalarType) -> BuiltinType {
    match ty {
        ScalarType::I8 => BuiltinType::Char,
        ScalarType::I16 => BuiltinType::Short,
        ScalarType::I32 => BuiltinType::Int,
        ScalarType::I64 | ScalarType::Index => BuiltinType::Long,
        ScalarType::F16 => BuiltinType::Half,
        // bf16 arithmetic happens in single precision.
        ScalarType::Bf16 | ScalarType::F32 => BuiltinType::Float,
        ScalarType::F64 => BuiltinType::Double,
        ScalarType::C32 => BuiltinType::Float2,
        ScalarType::C64 => BuiltinType::Double2,
    }
}

/// Type a scalar has in memory.
pub fn storage_type(ty: ScalarType) -> BuiltinType {
    match ty {
        ScalarType::Bf16 => BuiltinType::Ushort,
        other => register_type(other),
    }
}

pub fn space(addrspace: AddressSpace) -> Space {
    match addrspace {
        AddressSpace::Global => Space::Global,
        AddressSpace::Local => Space::Local,
    }
}

/// Pointer to the first element of a memref.
pub fn memref_pointer(mr: &MemrefType) -> DataType {
    DataType::from(storage_type(mr.element)).pointer(space(mr.addrspace))
}

/// Per-lane register array holding a cooperative matrix: component type and length.
pub fn coopmatrix_registers(ct: &CoopMatrixType, subgroup_size: u32) -> (BuiltinType, i64) {
    let sgs = i64::from(subgroup_size.max(1));
    let len = (ct.rows * ct.cols + sgs - 1) / sgs;
    (register_type(ct.component), len)
}

/// Extension that must be enabled before `ty` may be used.
pub fn extension(ty: ScalarType) -> Option<&'static str> {
    match ty {
        ScalarType::F16 => Some("cl_khr_fp16"),
        ScalarType::F64 | ScalarType::C64 => Some("cl_khr_fp64"),
        ScalarType::Bf16 => Some("cl_intel_bfloat16_conversions"),
        _ => None,
    }
}

/// Reads a stored element into its register type.
pub fn load_value(ty: ScalarType, place: Expr) -> Expr {
    match ty {
        ScalarType::Bf16 => Expr::call("intel_convert_as_bfloat16_float", vec![place]),
        _ => place,
    }
}

/// Converts a register value into its storage representation.
pub fn store_value(ty: ScalarType, value: Expr) -> Expr {
    match ty {
        ScalarType::Bf16 => Expr::call("intel_convert_bfloat16_as_ushort", vec![value]),
        _ => value,
    }
}

/// Literal of type `ty`.
pub fn literal(value: ConstValue, ty: ScalarType) -> Result<Expr> {
    let reg = register_type(ty);
    Ok(match value {
        ConstValue::Bool(b) => Expr::Bool(b),
        ConstValue::Int(i) if ty.is_integer() => Expr::Int(i),
        ConstValue::Int(i) => return literal(ConstValue::Float(i as f64), ty),
        ConstValue::Float(f) if ty.is_complex() => complex(f, 0.0, reg),
        ConstValue::Float(f) if ty.is_floating() => Expr::float(f, reg),
        ConstValue::Complex(re, im) if ty.is_complex() => complex(re, im, reg),
        _ => {
            return Err(CompilationError::new(Status::IrConstantMismatch)
                .with_extra(format!("{value} as {ty}")));
        }
    })
}

fn complex(re: f64, im: f64, reg: BuiltinType) -> Expr {
    let component = reg.component();
    Expr::vector(reg, vec![Expr::float(re, component), Expr::float(im, component)])
}

pub fn zero(ty: ScalarType) -> Expr {
    if ty.is_integer() {
        Expr::Int(0)
    } else if ty.is_complex() {
        complex(0.0, 0.0, register_type(ty))
    } else {
        Expr::float(0.0, register_type(ty))
    }
}

/// Converts `a` from `from` to `to`.
pub fn convert(a: Expr, from: ScalarType, to: ScalarType) -> Result<Expr> {
    if register_type(from) == register_type(to) {
        return Ok(a);
    }
    let reg = register_type(to);
    match (from.is_complex(), to.is_complex()) {
        (true, true) => Ok(Expr::call(format!("convert_{}", reg.name()), vec![a])),
        (false, true) => Ok(Expr::vector(
            reg,
            vec![Expr::cast(reg.component(), a), zero(to.component_type())],
        )),
        (true, false) => Err(CompilationError::new(Status::IrForbiddenCast)
            .with_extra(format!("{from} to {to}"))),
        (false, false) => Ok(Expr::cast(reg, a)),
    }
}

/// Product of two values of the same type, expanded for complex numbers.
pub fn multiply(ty: ScalarType, a: Expr, b: Expr) -> Expr {
    if ty.is_complex() {
        let reg = register_type(ty);
        let re = Expr::binary(
            BinaryOp::Sub,
            Expr::binary(BinaryOp::Mul, a.clone().re(), b.clone().re()),
            Expr::binary(BinaryOp::Mul, a.clone().im(), b.clone().im()),
        );
        let im = Expr::binary(
            BinaryOp::Add,
            Expr::binary(BinaryOp::Mul, a.clone().re(), b.clone().im()),
            Expr::binary(BinaryOp::Mul, a.im(), b.re()),
        );
        Expr::vector(reg, vec![re, im])
    } else {
        Expr::binary(BinaryOp::Mul, a, b)
    }
}

fn divide(ty: ScalarType, a: Expr, b: Expr) -> Expr {
    if !ty.is_complex() {
        return Expr::binary(BinaryOp::Div, a, b);
    }
    let reg = register_type(ty);
    let mul = |x: Expr, y: Expr| Expr::binary(BinaryOp::Mul, x, y);
    let norm = Expr::binary(
        BinaryOp::Add,
        mul(b.clone().re(), b.clone().re()),
        mul(b.clone().im(), b.clone().im()),
    );
    let re = Expr::binary(
        BinaryOp::Add,
        mul(a.clone().re(), b.clone().re()),
        mul(a.clone().im(), b.clone().im()),
    );
    let im = Expr::binary(
        BinaryOp::Sub,
        mul(a.clone().im(), b.clone().re()),
        mul(a.re(), b.im()),
    );
    Expr::vector(
        reg,
        vec![
            Expr::binary(BinaryOp::Div, re, norm.clone()),
            Expr::binary(BinaryOp::Div, im, norm),
        ],
    )
}

/// Binary arithmetic; `ty` is `None` for booleans.
pub fn arith(op: ArithOp, ty: Option<ScalarType>, a: Expr, b: Expr) -> Result<Expr> {
    let Some(ty) = ty else {
        return match op {
            ArithOp::And => Ok(Expr::binary(BinaryOp::And, a, b)),
            ArithOp::Or => Ok(Expr::binary(BinaryOp::Or, a, b)),
            ArithOp::Xor => Ok(Expr::binary(BinaryOp::Ne, a, b)),
            _ => Err(CompilationError::new(Status::IrBooleanUnsupported).with_extra(op.mnemonic())),
        };
    };
    let binary = |op| Ok(Expr::binary(op, a.clone(), b.clone()));
    if ty.is_complex() {
        return match op {
            ArithOp::Add => binary(BinaryOp::Add),
            ArithOp::Sub => binary(BinaryOp::Sub),
            ArithOp::Mul => Ok(multiply(ty, a, b)),
            ArithOp::Div => Ok(divide(ty, a, b)),
            _ => Err(CompilationError::new(Status::IrComplexUnsupported).with_extra(op.mnemonic())),
        };
    }
    let floating = ty.is_floating();
    match op {
        ArithOp::Add => binary(BinaryOp::Add),
        ArithOp::Sub => binary(BinaryOp::Sub),
        ArithOp::Mul => binary(BinaryOp::Mul),
        ArithOp::Div => binary(BinaryOp::Div),
        ArithOp::Rem if floating => Ok(Expr::call("fmod", vec![a, b])),
        ArithOp::Rem => binary(BinaryOp::Rem),
        ArithOp::Min => Ok(Expr::call(if floating { "fmin" } else { "min" }, vec![a, b])),
        ArithOp::Max => Ok(Expr::call(if floating { "fmax" } else { "max" }, vec![a, b])),
        _ if floating => {
            Err(CompilationError::new(Status::IrFpUnsupported).with_extra(op.mnemonic()))
        }
        ArithOp::Shl => binary(BinaryOp::Shl),
        ArithOp::Shr => binary(BinaryOp::Shr),
        ArithOp::And => binary(BinaryOp::BitAnd),
        ArithOp::Or => binary(BinaryOp::BitOr),
        ArithOp::Xor => binary(BinaryOp::BitXor),
    }
}

/// Unary arithmetic; `ty` is `None` for booleans.
pub fn arith_unary(op: UnaryOp, ty: Option<ScalarType>, a: Expr) -> Result<Expr> {
    let Some(ty) = ty else {
        return match op {
            UnaryOp::Not => Ok(Expr::unary(ClUnary::Not, a)),
            _ => Err(CompilationError::new(Status::IrBooleanUnsupported).with_extra(op.mnemonic())),
        };
    };
    let reg = register_type(ty);
    Ok(match op {
        UnaryOp::Neg => Expr::unary(ClUnary::Neg, a),
        UnaryOp::Not if ty.is_integer() => Expr::unary(ClUnary::BitNot, a),
        UnaryOp::Not => {
            return Err(CompilationError::new(Status::IrIntUnsupported).with_extra("not"));
        }
        UnaryOp::Abs if ty.is_complex() => {
            let sq = |x: Expr| Expr::binary(BinaryOp::Mul, x.clone(), x);
            Expr::call(
                "sqrt",
                vec![Expr::binary(BinaryOp::Add, sq(a.clone().re()), sq(a.im()))],
            )
        }
        UnaryOp::Abs if ty.is_floating() => Expr::call("fabs", vec![a]),
        UnaryOp::Abs => Expr::cast(reg, Expr::call("abs", vec![a])),
        UnaryOp::Conj if ty.is_complex() => {
            Expr::vector(reg, vec![a.clone().re(), Expr::unary(ClUnary::Neg, a.im())])
        }
        UnaryOp::Conj => a,
        UnaryOp::Re if ty.is_complex() => a.re(),
        UnaryOp::Re => a,
        UnaryOp::Im if ty.is_complex() => a.im(),
        UnaryOp::Im => zero(ty),
    })
}

pub fn compare(cond: CmpCondition, ty: Option<ScalarType>, a: Expr, b: Expr) -> Result<Expr> {
    if ty.is_some_and(ScalarType::is_complex) {
        let component = |op| {
            (
                Expr::binary(op, a.clone().re(), b.clone().re()),
                Expr::binary(op, a.clone().im(), b.clone().im()),
            )
        };
        return match cond {
            CmpCondition::Eq => {
                let (re, im) = component(BinaryOp::Eq);
                Ok(Expr::binary(BinaryOp::And, re, im))
            }
            CmpCondition::Ne => {
                let (re, im) = component(BinaryOp::Ne);
                Ok(Expr::binary(BinaryOp::Or, re, im))
            }
            _ => Err(CompilationError::new(Status::IrComplexUnsupported)
                .with_extra("ordered comparison of complex numbers")),
        };
    }
    let op = match cond {
        CmpCondition::Eq => BinaryOp::Eq,
        CmpCondition::Ne => BinaryOp::Ne,
        CmpCondition::Gt => BinaryOp::Gt,
        CmpCondition::Ge => BinaryOp::Ge,
        CmpCondition::Lt => BinaryOp::Lt,
        CmpCondition::Le => BinaryOp::Le,
    };
    Ok(Expr::binary(op, a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use simtc_backend_core::printer::print_expr;

    #[test]
    fn scalar_mapping() {
        assert_eq!(register_type(ScalarType::Index), BuiltinType::Long);
        assert_eq!(register_type(ScalarType::Bf16), BuiltinType::Float);
        assert_eq!(storage_type(ScalarType::Bf16), BuiltinType::Ushort);
        assert_eq!(storage_type(ScalarType::C64), BuiltinType::Double2);
        assert_eq!(extension(ScalarType::C64), Some("cl_khr_fp64"));
        assert_eq!(extension(ScalarType::I32), None);
    }

    #[test]
    fn complex_product_is_expanded() {
        let e = multiply(ScalarType::C32, Expr::var("a"), Expr::var("b"));
        assert_eq!(
            print_expr(&e),
            "(float2)(a.s0 * b.s0 - a.s1 * b.s1, a.s0 * b.s1 + a.s1 * b.s0)"
        );
    }

    #[test]
    fn float_remainder_uses_fmod() {
        let e = arith(ArithOp::Rem, Some(ScalarType::F32), Expr::var("a"), Expr::var("b")).unwrap();
        assert_eq!(print_expr(&e), "fmod(a, b)");
        let e = arith(ArithOp::Max, Some(ScalarType::I32), Expr::var("a"), Expr::var("b")).unwrap();
        assert_eq!(print_expr(&e), "max(a, b)");
    }

    #[test]
    fn bitwise_on_floats_is_rejected() {
        let err = arith(ArithOp::Shl, Some(ScalarType::F32), Expr::var("a"), Expr::var("b"))
            .unwrap_err();
        assert_eq!(err.status, Status::IrFpUnsupported);
        let err = arith(ArithOp::Min, Some(ScalarType::C32), Expr::var("a"), Expr::var("b"))
            .unwrap_err();
        assert_eq!(err.status, Status::IrComplexUnsupported);
    }

    #[test]
    fn boolean_logic() {
        let e = arith(ArithOp::Or, None, Expr::var("p"), Expr::var("q")).unwrap();
        assert_eq!(print_expr(&e), "p || q");
        let e = arith_unary(UnaryOp::Not, None, Expr::var("p")).unwrap();
        assert_eq!(print_expr(&e), "!p");
    }

    #[test]
    fn conversions() {
        let e = convert(Expr::var("x"), ScalarType::F32, ScalarType::C64).unwrap();
        assert_eq!(print_expr(&e), "(double2)((double)x, 0.0)");
        let e = convert(Expr::var("z"), ScalarType::C32, ScalarType::C64).unwrap();
        assert_eq!(print_expr(&e), "convert_double2(z)");
        let e = convert(Expr::var("x"), ScalarType::Bf16, ScalarType::F32).unwrap();
        assert_eq!(e, Expr::var("x"));
        let err = convert(Expr::var("z"), ScalarType::C32, ScalarType::F32).unwrap_err();
        assert_eq!(err.status, Status::IrForbiddenCast);
    }

    #[test]
    fn literals() {
        let e = literal(ConstValue::Float(0.5), ScalarType::F32).unwrap();
        assert_eq!(print_expr(&e), "0.5f");
        let e = literal(ConstValue::Complex(1.0, -2.0), ScalarType::C32).unwrap();
        assert_eq!(print_expr(&e), "(float2)(1.0f, -2.0f)");
        let err = literal(ConstValue::Complex(1.0, 0.0), ScalarType::F32).unwrap_err();
        assert_eq!(err.status, Status::IrConstantMismatch);
    }

    #[test]
    fn cooperative_matrix_registers() {
        let ct = CoopMatrixType {
            component: ScalarType::F16,
            rows: 8,
            cols: 16,
            usage: simtc_ir::MatrixUse::A,
        };
        assert_eq!(coopmatrix_registers(&ct, 16), (BuiltinType::Half, 8));
    }
}
