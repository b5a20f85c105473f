//! Plain and atomic updates of a memory location.
//!
//! `*dst = value + beta * *dst`, with the strategy chosen by the atomic flag
//! and the literal value of `beta` when it is fixed.

use simtc_backend_core::clir::{
    BinaryOp, Block, BuiltinType, DataType, Expr, Namer, Stmt, UnaryOp,
};
use simtc_ir::{AddressSpace, CompilationError, ConstValue, Result, ScalarType, Status};

use crate::types::{load_value, multiply, register_type, space, store_value};

/// A scalar operand of a BLAS update that may be a compile-time constant.
#[derive(Clone, Debug, PartialEq)]
pub struct Coefficient {
    pub expr: Expr,
    pub ty: ScalarType,
    pub fixed: Option<ConstValue>,
}

impl Coefficient {
    pub fn is_zero(&self) -> bool {
        self.fixed.is_some_and(ConstValue::is_zero)
    }

    pub fn is_one(&self) -> bool {
        self.fixed.is_some_and(ConstValue::is_one)
    }
}

/// Where and how to write.
#[derive(Clone, Debug, PartialEq)]
pub struct Destination {
    /// Pointer to the element.
    pub ptr: Expr,
    pub ty: ScalarType,
    pub addrspace: AddressSpace,
    pub atomic: bool,
}

fn memory_scope(addrspace: AddressSpace) -> Expr {
    Expr::var(match addrspace {
        AddressSpace::Global => "memory_scope_device",
        AddressSpace::Local => "memory_scope_work_group",
    })
}

fn relaxed() -> Expr {
    Expr::var("memory_order_relaxed")
}

/// Rejects element types without atomic support.
pub fn check_atomic(ty: ScalarType) -> Result<()> {
    match ty {
        ScalarType::F16 | ScalarType::Bf16 => Err(CompilationError::new(Status::IrFpUnsupported)
            .with_extra(format!("atomics on {ty}"))),
        ScalarType::I8 | ScalarType::I16 => Err(CompilationError::new(Status::IrIntUnsupported)
            .with_extra(format!("atomics on {ty}"))),
        _ => Ok(()),
    }
}

/// `beta * old` in the register type of `ty`.
fn scaled(ty: ScalarType, beta: &Coefficient, old: Expr) -> Expr {
    if beta.is_one() {
        old
    } else {
        multiply(ty, beta.expr.clone(), old)
    }
}

/// Emits the update of `dst` with `value` (already in the register type of `dst.ty`).
pub fn store_update(
    bb: &mut Block,
    namer: &mut Namer,
    dst: &Destination,
    value: Expr,
    beta: &Coefficient,
) -> Result<()> {
    let ty = dst.ty;
    if !dst.atomic {
        let place = dst.ptr.clone().deref();
        let value = if beta.is_zero() {
            value
        } else {
            let old = load_value(ty, place.clone());
            Expr::binary(BinaryOp::Add, value, scaled(ty, beta, old))
        };
        bb.assign(place, store_value(ty, value));
        return Ok(());
    }

    check_atomic(ty)?;
    if beta.is_zero() {
        atomic_store(bb, dst, value);
        Ok(())
    } else if beta.is_one() {
        atomic_add(bb, dst, value);
        Ok(())
    } else if ty.is_complex() {
        Err(CompilationError::new(Status::IrComplexUnsupported)
            .with_extra("compare-exchange update of a complex number"))
    } else {
        atomic_cas(bb, namer, dst, value, beta);
        Ok(())
    }
}

/// Atomic pointer(s) to the element, one per complex component.
fn atomic_pointers(dst: &Destination) -> Vec<Expr> {
    let component = register_type(dst.ty).component();
    let cl_space = space(dst.addrspace);
    let atomic_ptr = DataType::Atomic(component).volatile_pointer(cl_space);
    if dst.ty.is_complex() {
        let base = Expr::cast(
            DataType::from(component).pointer(cl_space),
            dst.ptr.clone(),
        );
        (0..2)
            .map(|i| Expr::cast(atomic_ptr.clone(), base.clone() + Expr::Int(i)))
            .collect()
    } else {
        vec![Expr::cast(atomic_ptr, dst.ptr.clone())]
    }
}

fn components(ty: ScalarType, value: Expr) -> Vec<Expr> {
    if ty.is_complex() {
        vec![value.clone().re(), value.im()]
    } else {
        vec![value]
    }
}

fn atomic_store(bb: &mut Block, dst: &Destination, value: Expr) {
    for (ptr, v) in atomic_pointers(dst).into_iter().zip(components(dst.ty, value)) {
        bb.expr(Expr::call(
            "atomic_store_explicit",
            vec![ptr, v, relaxed(), memory_scope(dst.addrspace)],
        ));
    }
}

fn atomic_add(bb: &mut Block, dst: &Destination, value: Expr) {
    for (ptr, v) in atomic_pointers(dst).into_iter().zip(components(dst.ty, value)) {
        bb.expr(Expr::call(
            "atomic_fetch_add_explicit",
            vec![ptr, v, relaxed(), memory_scope(dst.addrspace)],
        ));
    }
}

/// Compare-exchange retry loop computing `desired = value + beta * expected`.
fn atomic_cas(
    bb: &mut Block,
    namer: &mut Namer,
    dst: &Destination,
    value: Expr,
    beta: &Coefficient,
) {
    let reg = register_type(dst.ty);
    let mut inner = Block::new();
    let ptr = atomic_pointers(dst).swap_remove(0);
    let ptr = inner.declare_assign(
        DataType::Atomic(reg).volatile_pointer(space(dst.addrspace)),
        namer.fresh("ptr"),
        ptr,
    );
    let expected = inner.declare_assign(
        reg,
        namer.fresh("expected"),
        Expr::call(
            "atomic_load_explicit",
            vec![ptr.clone(), relaxed(), memory_scope(dst.addrspace)],
        ),
    );
    let desired = inner.declare(reg, namer.fresh("desired"));
    let mut body = Block::new();
    body.assign(
        desired.clone(),
        Expr::binary(BinaryOp::Add, value, scaled(dst.ty, beta, expected.clone())),
    );
    let exchanged = Expr::call(
        "atomic_compare_exchange_strong_explicit",
        vec![
            ptr,
            expected.address_of(),
            desired,
            relaxed(),
            relaxed(),
            memory_scope(dst.addrspace),
        ],
    );
    inner.add(Stmt::DoWhile {
        body: body.into_stmts(),
        cond: Expr::unary(UnaryOp::Not, exchanged),
    });
    bb.scope(inner);
}

/// Extension needed for atomics on `ty`.
pub fn atomic_extension(ty: ScalarType) -> Option<&'static str> {
    match register_type(ty).component() {
        BuiltinType::Float | BuiltinType::Double => Some("cl_ext_float_atomics"),
        BuiltinType::Long => Some("cl_khr_int64_base_atomics"),
        _ => None,
    }
}
