//! Element-wise and reduction BLAS kernels: GER, Hadamard, sum and AXPBY.
//!
//! GER, Hadamard and sum become memoized device functions like GEMM; AXPBY
//! is emitted inline. All of them distribute output elements with the same
//! subgroup tile loops as the GEMM generator.

use std::fmt::Write;

use simtc_backend_core::clir::{self, Block, BuiltinType, DataType, Expr, Namer};
use simtc_ir::{AddressSpace, ConstValue, Result, ScalarType, Transpose, is_dynamic_value};
use simtc_opt::tiling::LocalTiling;

use crate::gemm::{coefficient, generic_pointer, static_or};
use crate::store::{Coefficient, Destination, store_update};
use crate::tile::{Lanes, tile_loop_by_sgs};
use crate::types::{convert, load_value, multiply, register_type, zero};

/// A strided operand: base pointer, element type and per-mode strides.
#[derive(Clone, Debug, PartialEq)]
pub struct Operand {
    pub ptr: Expr,
    pub ty: ScalarType,
    pub stride: Vec<Expr>,
    pub addrspace: AddressSpace,
}

impl Operand {
    fn place(&self, idx: &[Expr]) -> Expr {
        let offset = idx
            .iter()
            .zip(&self.stride)
            .fold(Expr::Int(0), |acc, (i, s)| acc + i.clone() * s.clone());
        self.ptr.clone().index(offset)
    }

    /// Pointer to the element at `idx`.
    pub fn element(&self, idx: &[Expr]) -> Expr {
        self.place(idx).address_of()
    }

    /// Value at `idx` converted to the register type of `to`.
    pub fn load(&self, idx: &[Expr], to: ScalarType) -> Result<Expr> {
        convert(load_value(self.ty, self.place(idx)), self.ty, to)
    }
}

/// Index pair of a possibly transposed matrix operand for the element `(i, j)` of `op(A)`.
fn op_index(trans: Transpose, i: Expr, j: Expr) -> [Expr; 2] {
    match trans {
        Transpose::N => [i, j],
        Transpose::T => [j, i],
    }
}

/// Calls `body` with the indices of every output element owned by the
/// calling work-item.
///
/// Scalars go to the first lane of the first subgroup; vectors are split over
/// all subgroups; matrices distribute columns over the `n_tiles` subgroup
/// columns and rows over the `m_tiles` subgroup rows.
pub fn for_each_element<F>(
    bb: &mut Block,
    namer: &mut Namer,
    lanes: &Lanes,
    subgroup_size: u32,
    tiling: LocalTiling,
    extents: &[Expr],
    mut body: F,
) -> Result<()>
where
    F: FnMut(&mut Block, &mut Namer, &[Expr]) -> Result<()>,
{
    let sgs = i64::from(subgroup_size);
    let lane = lanes.lane.clone();
    if extents.is_empty() {
        let mut inner = Block::new();
        body(&mut inner, namer, &[])?;
        bb.if_then(
            lanes.sg.clone().eq(Expr::Int(0)).and(lane.eq(Expr::Int(0))),
            inner,
        );
        return Ok(());
    }
    let mut rows = |bb: &mut Block,
                    namer: &mut Namer,
                    size: Expr,
                    tiles: i64,
                    sg: Expr,
                    col: Option<Expr>|
     -> Result<()> {
        tile_loop_by_sgs(bb, namer, size, sgs, tiles, sg, |bb, namer, blk, trip, tail| {
            let row = blk + lane.clone();
            let mut idx = vec![row];
            idx.extend(col.clone());
            let mut inner = Block::new();
            body(&mut inner, namer, &idx)?;
            if tail {
                bb.if_then(lane.clone().lt(trip), inner);
            } else {
                bb.extend(inner.into_stmts());
            }
            Ok(())
        })
    };
    match extents {
        [m] => rows(
            bb,
            namer,
            m.clone(),
            i64::from(tiling.num_tiles()),
            lanes.sg.clone(),
            None,
        ),
        [m, n] => tile_loop_by_sgs(
            bb,
            namer,
            n.clone(),
            1,
            i64::from(tiling.n_tiles),
            lanes.sg_n.clone(),
            |bb, namer, col, _, _| {
                rows(
                    bb,
                    namer,
                    m.clone(),
                    i64::from(tiling.m_tiles),
                    lanes.sg_m.clone(),
                    Some(col),
                )
            },
        ),
        _ => Err(simtc_ir::CompilationError::new(simtc_ir::Status::IrExpectedVectorOrMatrix)),
    }
}

/// `alpha * value` unless alpha is the literal one.
fn scale(alpha: &Coefficient, value: Expr) -> Expr {
    if alpha.is_one() {
        value
    } else {
        multiply(alpha.ty, alpha.expr.clone(), value)
    }
}

#[allow(clippy::too_many_arguments)]
fn update(
    bb: &mut Block,
    namer: &mut Namer,
    out: &Operand,
    idx: &[Expr],
    value: Expr,
    alpha: &Coefficient,
    beta: &Coefficient,
    atomic: bool,
) -> Result<()> {
    let dst = Destination {
        ptr: out.element(idx),
        ty: out.ty,
        addrspace: out.addrspace,
        atomic,
    };
    store_update(bb, namer, &dst, scale(alpha, value), beta)
}

/// Operands of an inline AXPBY: `B := alpha * op(A) + beta * B`.
#[derive(Clone, Debug, PartialEq)]
pub struct Axpby {
    pub trans_a: Transpose,
    pub atomic: bool,
    pub alpha: Coefficient,
    pub a: Operand,
    pub beta: Coefficient,
    pub b: Operand,
    /// Shape of `B`.
    pub shape: Vec<Expr>,
}

/// Emits an AXPBY into the kernel body.
pub fn emit_axpby(
    bb: &mut Block,
    namer: &mut Namer,
    subgroup_size: u32,
    tiling: LocalTiling,
    op: &Axpby,
) -> Result<()> {
    let mut inner = Block::new();
    let lanes = Lanes::declare(&mut inner, namer, i64::from(tiling.m_tiles));
    let c_ty = op.b.ty;
    for_each_element(
        &mut inner,
        namer,
        &lanes,
        subgroup_size,
        tiling,
        &op.shape,
        |bb, namer, idx| {
            let a_idx = match idx {
                [i, j] => op_index(op.trans_a, i.clone(), j.clone()).to_vec(),
                other => other.to_vec(),
            };
            let value = op.a.load(&a_idx, c_ty)?;
            update(bb, namer, &op.b, idx, value, &op.alpha, &op.beta, op.atomic)
        },
    )?;
    bb.scope(inner);
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlasKind {
    /// `C := alpha * a * b^T + beta * C`.
    Ger,
    /// `C := alpha * A .* B + beta * C`.
    Hadamard,
    /// `b := alpha * sum(op(A), 1) + beta * b`.
    Sum,
}

impl BlasKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Ger => "ger",
            Self::Hadamard => "hadamard",
            Self::Sum => "sum",
        }
    }
}

/// Element type and static strides of an operand.
#[derive(Clone, Debug, PartialEq)]
pub struct OperandLayout {
    pub ty: ScalarType,
    pub stride: Vec<i64>,
}

/// Static description of a GER, Hadamard or sum device function.
#[derive(Clone, Debug, PartialEq)]
pub struct BlasConfig {
    pub kind: BlasKind,
    pub alpha_ty: ScalarType,
    pub beta_ty: ScalarType,
    pub inputs: Vec<OperandLayout>,
    pub output: OperandLayout,
    pub trans_a: Transpose,
    /// Iteration extents: `[M, N]` for GER, the output shape for Hadamard,
    /// `[M, K]` or `[K]` for sum.
    pub shape: Vec<i64>,
    pub alpha: Option<ConstValue>,
    pub beta: Option<ConstValue>,
    pub atomic: bool,
    pub c_addrspace: AddressSpace,
}

const INPUT_NAMES: [&str; 2] = ["A", "B"];

fn code(v: i64) -> String {
    if is_dynamic_value(v) {
        "d".to_owned()
    } else {
        v.to_string()
    }
}

impl BlasConfig {
    /// Names of the extent parameters.
    pub fn extent_names(&self) -> &'static [&'static str] {
        match (self.kind, self.shape.len()) {
            (BlasKind::Sum, 1) => &["K"],
            (BlasKind::Sum, _) => &["M", "K"],
            (BlasKind::Hadamard, 1) => &["M"],
            _ => &["M", "N"],
        }
    }

    /// Name of the output parameter.
    pub fn output_name(&self) -> &'static str {
        match self.kind {
            BlasKind::Sum => "B",
            _ => "C",
        }
    }

    pub fn identifier(&self) -> String {
        let mut id = format!("{}_", self.kind.prefix());
        if self.atomic {
            id.push_str("atomic_");
        }
        id.push_str(self.alpha_ty.mnemonic());
        for input in &self.inputs {
            id.push_str(input.ty.mnemonic());
        }
        id.push_str(self.beta_ty.mnemonic());
        id.push_str(self.output.ty.mnemonic());
        if self.kind == BlasKind::Sum {
            let _ = write!(id, "_A{}", self.trans_a.mnemonic());
        }
        for (name, &extent) in self.extent_names().iter().zip(&self.shape) {
            let _ = write!(id, "_{name}{}", code(extent));
        }
        let outputs = [(self.output_name(), &self.output)];
        for (name, layout) in INPUT_NAMES.iter().copied().zip(&self.inputs).chain(outputs) {
            let _ = write!(id, "_{name}stride");
            for (i, &s) in layout.stride.iter().enumerate() {
                let sep = if i == 0 { "" } else { "_" };
                let _ = write!(id, "{sep}{}", code(s));
            }
        }
        let fixed = |v: Option<ConstValue>| match v {
            None => "d".to_owned(),
            Some(ConstValue::Complex(re, im)) => format!("{:x}_{:x}", re.to_bits(), im.to_bits()),
            Some(ConstValue::Float(f)) => format!("{:x}", f.to_bits()),
            Some(ConstValue::Int(i)) => format!("{:x}", (i as f64).to_bits()),
            Some(ConstValue::Bool(b)) => format!("{:x}", f64::from(u8::from(b)).to_bits()),
        };
        let _ = write!(id, "_alpha{}_beta{}", fixed(self.alpha), fixed(self.beta));
        if self.c_addrspace == AddressSpace::Local {
            id.push_str("_local");
        }
        id
    }
}

/// Declares the pointer and stride parameters of an operand.
fn operand_params(
    f: &mut clir::Function,
    name: &str,
    layout: &OperandLayout,
    addrspace: AddressSpace,
) -> Operand {
    let ptr = f.param(generic_pointer(layout.ty), name);
    let stride = layout
        .stride
        .iter()
        .enumerate()
        .map(|(i, &s)| static_or(s, f.param(BuiltinType::Long, format!("{name}_stride{i}"))))
        .collect();
    Operand {
        ptr,
        ty: layout.ty,
        stride,
        addrspace,
    }
}

/// Generates the device function `name` for `cfg`.
pub fn generate_blas(
    cfg: &BlasConfig,
    name: &str,
    subgroup_size: u32,
    tiling: LocalTiling,
) -> Result<clir::Function> {
    let mut f = clir::Function::new(name);
    let mut namer = Namer::new();
    let extents: Vec<Expr> = cfg
        .extent_names()
        .iter()
        .zip(&cfg.shape)
        .map(|(n, &v)| static_or(v, f.param(BuiltinType::Long, *n)))
        .collect();
    let alpha = f.param(register_type(cfg.alpha_ty), "alpha");
    let inputs: Vec<Operand> = INPUT_NAMES
        .iter()
        .zip(&cfg.inputs)
        .map(|(n, layout)| operand_params(&mut f, n, layout, AddressSpace::Global))
        .collect();
    let beta = f.param(register_type(cfg.beta_ty), "beta");
    let out = operand_params(&mut f, cfg.output_name(), &cfg.output, cfg.c_addrspace);
    for p in &f.params {
        namer.fresh(&p.name);
    }

    let c_ty = cfg.output.ty;
    let alpha = coefficient(cfg.alpha, cfg.alpha_ty, alpha, c_ty)?;
    let beta = coefficient(cfg.beta, cfg.beta_ty, beta, c_ty)?;
    log::debug!("{name}: {} over {:?}, tiling {tiling}", cfg.kind.prefix(), cfg.shape);

    let mut bb = Block::new();
    let lanes = Lanes::declare(&mut bb, &mut namer, i64::from(tiling.m_tiles));
    let atomic = cfg.atomic;
    match (cfg.kind, inputs.as_slice()) {
        (BlasKind::Ger, [a, b]) => for_each_element(
            &mut bb,
            &mut namer,
            &lanes,
            subgroup_size,
            tiling,
            &extents,
            |bb, namer, idx| {
                let value = multiply(
                    c_ty,
                    a.load(&idx[..1], c_ty)?,
                    b.load(&idx[1..], c_ty)?,
                );
                update(bb, namer, &out, idx, value, &alpha, &beta, atomic)
            },
        )?,
        (BlasKind::Hadamard, [a, b]) => for_each_element(
            &mut bb,
            &mut namer,
            &lanes,
            subgroup_size,
            tiling,
            &extents,
            |bb, namer, idx| {
                let value = multiply(c_ty, a.load(idx, c_ty)?, b.load(idx, c_ty)?);
                update(bb, namer, &out, idx, value, &alpha, &beta, atomic)
            },
        )?,
        (BlasKind::Sum, [a]) if extents.len() == 2 => for_each_element(
            &mut bb,
            &mut namer,
            &lanes,
            subgroup_size,
            tiling,
            &extents[..1],
            |bb, namer, idx| {
                let acc = bb.declare_assign(register_type(c_ty), namer.fresh("acc"), zero(c_ty));
                let k = namer.fresh("k");
                let [i, j] = op_index(cfg.trans_a, idx[0].clone(), Expr::var(&k));
                let mut body = Block::new();
                body.expr(acc.clone().add_assign(a.load(&[i, j], c_ty)?));
                bb.for_loop(
                    BuiltinType::Long,
                    &k,
                    Expr::Int(0),
                    extents[1].clone(),
                    Expr::Int(1),
                    body,
                    None,
                );
                update(bb, namer, &out, idx, acc, &alpha, &beta, atomic)
            },
        )?,
        (BlasKind::Sum, [a]) => {
            let acc = reduce_work_group(
                &mut bb,
                &mut namer,
                &lanes,
                subgroup_size,
                tiling,
                a,
                extents[0].clone(),
                c_ty,
            )?;
            let mut store = Block::new();
            update(&mut store, &mut namer, &out, &[], acc, &alpha, &beta, atomic)?;
            bb.if_then(
                lanes
                    .sg
                    .clone()
                    .eq(Expr::Int(0))
                    .and(lanes.lane.clone().eq(Expr::Int(0))),
                store,
            );
        }
        _ => {
            return Err(simtc_ir::CompilationError::internal(format!(
                "{} with {} inputs",
                cfg.kind.prefix(),
                inputs.len()
            )));
        }
    }
    f.body = bb.into_stmts();
    Ok(f)
}

/// Sum of the `k` elements of the vector `a` over the whole work-group.
#[allow(clippy::too_many_arguments)]
fn reduce_work_group(
    bb: &mut Block,
    namer: &mut Namer,
    lanes: &Lanes,
    subgroup_size: u32,
    tiling: LocalTiling,
    a: &Operand,
    k: Expr,
    c_ty: ScalarType,
) -> Result<Expr> {
    let reg = register_type(c_ty);
    let acc = bb.declare_assign(reg, namer.fresh("acc"), zero(c_ty));
    let sgs = i64::from(subgroup_size);
    let wgs = sgs * i64::from(tiling.num_tiles());
    let kv = namer.fresh("k");
    let mut body = Block::new();
    body.expr(acc.clone().add_assign(a.load(&[Expr::var(&kv)], c_ty)?));
    bb.for_loop(
        BuiltinType::Long,
        &kv,
        lanes.sg.clone() * Expr::Int(sgs) + lanes.lane.clone(),
        k,
        Expr::Int(wgs),
        body,
        None,
    );
    let reduced = if reg.is_vector() {
        let component = reg.component();
        Expr::vector(
            reg,
            vec![
                work_group_reduce(acc.clone().re(), component),
                work_group_reduce(acc.clone().im(), component),
            ],
        )
    } else {
        work_group_reduce(acc.clone(), reg)
    };
    bb.assign(acc.clone(), reduced);
    Ok(acc)
}

/// `work_group_reduce_add`, widening types it is not defined for.
fn work_group_reduce(value: Expr, ty: BuiltinType) -> Expr {
    match ty {
        BuiltinType::Char | BuiltinType::Short => Expr::cast(
            DataType::from(ty),
            Expr::call(
                "work_group_reduce_add",
                vec![Expr::cast(BuiltinType::Int, value)],
            ),
        ),
        _ => Expr::call("work_group_reduce_add", vec![value]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simtc_backend_core::printer::{print_function, print_stmt};
    use simtc_ir::DYNAMIC;

    fn tiling() -> LocalTiling {
        LocalTiling {
            m_tiles: 2,
            n_tiles: 2,
        }
    }

    fn layout(ty: ScalarType, stride: &[i64]) -> OperandLayout {
        OperandLayout {
            ty,
            stride: stride.to_vec(),
        }
    }

    fn config(kind: BlasKind, shape: &[i64]) -> BlasConfig {
        let f32 = ScalarType::F32;
        let (inputs, output) = match kind {
            BlasKind::Ger => (vec![layout(f32, &[1]), layout(f32, &[1])], layout(f32, &[1, DYNAMIC])),
            BlasKind::Hadamard => (vec![layout(f32, &[1]), layout(f32, &[1])], layout(f32, &[1])),
            BlasKind::Sum => (vec![layout(f32, &[1, DYNAMIC])], layout(f32, &[1])),
        };
        BlasConfig {
            kind,
            alpha_ty: f32,
            beta_ty: f32,
            inputs,
            output,
            trans_a: Transpose::N,
            shape: shape.to_vec(),
            alpha: Some(ConstValue::Float(1.0)),
            beta: Some(ConstValue::Float(0.0)),
            atomic: false,
            c_addrspace: AddressSpace::Global,
        }
    }

    #[test]
    fn identifiers_have_own_prefixes() {
        let ger = config(BlasKind::Ger, &[DYNAMIC, 32]);
        assert_eq!(
            ger.identifier(),
            "ger_f32f32f32f32f32_Md_N32_Astride1_Bstride1_Cstride1_d_alpha3ff0000000000000_beta0"
        );
        let sum = config(BlasKind::Sum, &[16, DYNAMIC]);
        assert!(sum.identifier().starts_with("sum_f32f32f32f32_An_M16_Kd_"));
        let mut local = config(BlasKind::Hadamard, &[64]);
        local.c_addrspace = AddressSpace::Local;
        assert!(local.identifier().ends_with("_local"));
    }

    #[test]
    fn ger_signature_and_body() {
        let cfg = config(BlasKind::Ger, &[DYNAMIC, DYNAMIC]);
        let text = print_function(&generate_blas(&cfg, "ger", 16, tiling()).unwrap());
        assert!(text.starts_with(
            "void ger(long M, long N, float alpha, float* A, long A_stride0, float* B, long B_stride0, float beta, float* C, long C_stride0, long C_stride1) {"
        ), "{text}");
        assert!(text.contains("for (long blk = sg_n; blk < N; blk += 2) {"));
        assert!(text.contains("C[blk1 + m + blk * C_stride1] = A[blk1 + m] * B[blk];"));
    }

    #[test]
    fn hadamard_vector_uses_all_tiles() {
        let cfg = config(BlasKind::Hadamard, &[64]);
        let text = print_function(&generate_blas(&cfg, "hadamard", 16, tiling()).unwrap());
        assert!(text.contains("for (long blk = 16 * sg_id; blk < 64; blk += 64) {"), "{text}");
    }

    #[test]
    fn sum_of_matrix_loops_over_k() {
        let cfg = config(BlasKind::Sum, &[DYNAMIC, DYNAMIC]);
        let text = print_function(&generate_blas(&cfg, "sum", 16, tiling()).unwrap());
        assert!(text.contains("float acc = 0.0f;"), "{text}");
        assert!(text.contains("for (long k = 0; k < K; ++k) {"));
        assert!(text.contains("acc += A[blk + m + k * A_stride1];"));
    }

    #[test]
    fn sum_of_vector_reduces_over_work_group() {
        let mut cfg = config(BlasKind::Sum, &[DYNAMIC]);
        cfg.inputs = vec![layout(ScalarType::C32, &[1])];
        cfg.output = layout(ScalarType::C32, &[]);
        cfg.alpha_ty = ScalarType::C32;
        cfg.beta_ty = ScalarType::C32;
        cfg.alpha = Some(ConstValue::Complex(1.0, 0.0));
        cfg.beta = Some(ConstValue::Complex(0.0, 0.0));
        let text = print_function(&generate_blas(&cfg, "sum", 16, tiling()).unwrap());
        assert!(text.contains("for (long k = sg_id * 16 + m; k < K; k += 64) {"), "{text}");
        assert!(text.contains(
            "acc = (float2)(work_group_reduce_add(acc.s0), work_group_reduce_add(acc.s1));"
        ));
        assert!(text.contains("if (sg_id == 0 && m == 0) {"));
    }

    #[test]
    fn small_integers_widen_for_reduction() {
        let e = work_group_reduce(Expr::var("x"), BuiltinType::Short);
        let mut out = String::new();
        print_stmt(&mut out, &clir::Stmt::Expr(e), 0);
        assert_eq!(out, "(short)work_group_reduce_add((int)x);\n");
    }

    #[test]
    fn inline_axpby_transposes_a() {
        let mut bb = Block::new();
        let mut namer = Namer::new();
        let f32 = ScalarType::F32;
        let op = Axpby {
            trans_a: Transpose::T,
            atomic: false,
            alpha: Coefficient {
                expr: Expr::var("alpha"),
                ty: f32,
                fixed: None,
            },
            a: Operand {
                ptr: Expr::var("A"),
                ty: f32,
                stride: vec![Expr::Int(1), Expr::Int(8)],
                addrspace: AddressSpace::Global,
            },
            beta: Coefficient {
                expr: Expr::float(0.0, BuiltinType::Float),
                ty: f32,
                fixed: Some(ConstValue::Float(0.0)),
            },
            b: Operand {
                ptr: Expr::var("B"),
                ty: f32,
                stride: vec![Expr::Int(1), Expr::Int(8)],
                addrspace: AddressSpace::Global,
            },
            shape: vec![Expr::Int(8), Expr::Int(8)],
        };
        emit_axpby(&mut bb, &mut namer, 8, tiling(), &op).unwrap();
        let mut out = String::new();
        for stmt in bb.into_stmts() {
            print_stmt(&mut out, &stmt, 0);
        }
        assert!(out.starts_with("{\n"), "{out}");
        assert!(out.contains("B[blk1 + m + blk * 8] = alpha * A[blk + (blk1 + m) * 8];"), "{out}");
    }

    #[test]
    fn scalar_axpby_runs_on_one_work_item() {
        let mut bb = Block::new();
        let mut namer = Namer::new();
        let f64 = ScalarType::F64;
        let scalar = |name: &str| Operand {
            ptr: Expr::var(name),
            ty: f64,
            stride: Vec::new(),
            addrspace: AddressSpace::Global,
        };
        let op = Axpby {
            trans_a: Transpose::N,
            atomic: true,
            alpha: Coefficient {
                expr: Expr::float(1.0, BuiltinType::Double),
                ty: f64,
                fixed: Some(ConstValue::Float(1.0)),
            },
            a: scalar("a"),
            beta: Coefficient {
                expr: Expr::float(1.0, BuiltinType::Double),
                ty: f64,
                fixed: Some(ConstValue::Float(1.0)),
            },
            b: scalar("b"),
            shape: Vec::new(),
        };
        emit_axpby(&mut bb, &mut namer, 16, tiling(), &op).unwrap();
        let mut out = String::new();
        for stmt in bb.into_stmts() {
            print_stmt(&mut out, &stmt, 0);
        }
        assert!(out.contains("if (sg_id == 0 && m == 0) {"), "{out}");
        assert!(out.contains(
            "atomic_fetch_add_explicit((volatile global atomic_double*)&b[0], a[0], memory_order_relaxed, memory_scope_device);"
        ));
    }
}
