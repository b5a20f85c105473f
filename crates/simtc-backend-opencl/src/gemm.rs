//! Register-blocked GEMM and GEMV device functions.
//!
//! Each subgroup owns a `rows x cols` block of C held in registers. The
//! N range is split uniformly across the subgroup columns of the work-group,
//! the M range round-robin across its rows with a guarded tail. Every lane
//! loads a slice of the B panel and broadcasts it across the subgroup.

use std::fmt::Write;

use simtc_backend_core::clir::{self, Block, BuiltinType, DataType, Expr, Namer, Space};
use simtc_ir::{
    AddressSpace, ConstValue, Result, ScalarType, Transpose, is_dynamic_value,
};
use simtc_opt::tiling::{LocalTiling, c_blocks, k_unroll, max_register_block, shrink_rows};

use crate::store::{Coefficient, Destination, store_update};
use crate::tile::{Lanes, tile_loop_by_sgs, tile_loop_uniform, uniform_max_block};
use crate::types::{convert, literal, load_value, multiply, register_type, storage_type, zero};

/// Static description of a GEMM-class update `C := alpha * op(A) * op(B) + beta * C`.
#[derive(Clone, Debug, PartialEq)]
pub struct GemmConfig {
    pub alpha_ty: ScalarType,
    pub a_ty: ScalarType,
    pub b_ty: ScalarType,
    pub beta_ty: ScalarType,
    pub c_ty: ScalarType,
    pub trans_a: Transpose,
    pub trans_b: Transpose,
    /// Extents; [`simtc_ir::DYNAMIC`] when only known at run time.
    pub m: i64,
    pub n: i64,
    pub k: i64,
    pub a_stride: [i64; 2],
    pub b_stride: [i64; 2],
    pub c_stride: [i64; 2],
    pub alpha: Option<ConstValue>,
    pub beta: Option<ConstValue>,
    pub atomic: bool,
    pub c_addrspace: AddressSpace,
    /// `B` and `C` are vectors (`N == 1`).
    pub vector: bool,
}

fn extent_code(v: i64) -> String {
    if is_dynamic_value(v) {
        "d".to_owned()
    } else {
        v.to_string()
    }
}

fn fixed_code(v: Option<ConstValue>) -> String {
    match v {
        None => "d".to_owned(),
        Some(ConstValue::Bool(b)) => format!("{:x}", f64::from(u8::from(b)).to_bits()),
        Some(ConstValue::Int(i)) => format!("{:x}", (i as f64).to_bits()),
        Some(ConstValue::Float(f)) => format!("{:x}", f.to_bits()),
        Some(ConstValue::Complex(re, im)) => format!("{:x}_{:x}", re.to_bits(), im.to_bits()),
    }
}

impl GemmConfig {
    /// Canonical name of the device function implementing this configuration.
    pub fn identifier(&self) -> String {
        let mut id = String::from(if self.vector { "gemv_" } else { "gemm_" });
        if self.atomic {
            id.push_str("atomic_");
        }
        for ty in [self.alpha_ty, self.a_ty, self.b_ty, self.beta_ty, self.c_ty] {
            id.push_str(ty.mnemonic());
        }
        let _ = write!(
            id,
            "_A{}_B{}_M{}_N{}_K{}",
            self.trans_a.mnemonic(),
            self.trans_b.mnemonic(),
            extent_code(self.m),
            extent_code(self.n),
            extent_code(self.k)
        );
        for (name, stride) in [("A", self.a_stride), ("B", self.b_stride), ("C", self.c_stride)] {
            let _ = write!(
                id,
                "_{name}stride{}_{}",
                extent_code(stride[0]),
                extent_code(stride[1])
            );
        }
        let _ = write!(
            id,
            "_alpha{}_beta{}",
            fixed_code(self.alpha),
            fixed_code(self.beta)
        );
        if self.c_addrspace == AddressSpace::Local {
            id.push_str("_local");
        }
        id
    }
}

/// Names of the device function parameters, in order.
pub const PARAMS: [&str; 14] = [
    "M",
    "N",
    "K",
    "alpha",
    "A",
    "A_stride0",
    "A_stride1",
    "B",
    "B_stride0",
    "B_stride1",
    "beta",
    "C",
    "C_stride0",
    "C_stride1",
];

/// Generic-address-space pointer to the stored elements of `ty`.
pub(crate) fn generic_pointer(ty: ScalarType) -> DataType {
    DataType::from(storage_type(ty)).pointer(Space::Private)
}

/// Static value when known, else the run-time parameter.
pub(crate) fn static_or(value: i64, param: Expr) -> Expr {
    if is_dynamic_value(value) {
        param
    } else {
        Expr::Int(value)
    }
}

/// A scalar coefficient in the register type of `c_ty`.
pub(crate) fn coefficient(
    fixed: Option<ConstValue>,
    ty: ScalarType,
    param: Expr,
    c_ty: ScalarType,
) -> Result<Coefficient> {
    let expr = match fixed {
        Some(value) => literal(value, ty)?,
        None => param,
    };
    Ok(Coefficient {
        expr: convert(expr, ty, c_ty)?,
        ty: c_ty,
        fixed,
    })
}

/// Values shared by all parts of one generated function.
struct Kernel<'a> {
    cfg: &'a GemmConfig,
    sgs: i64,
    row_blocks: i64,
    cols: i64,
    lanes: Lanes,
    a_stride_m: Expr,
    a_stride_k: Expr,
    b_stride_k: Expr,
    b_stride_n: Expr,
    c_stride: [Expr; 2],
    k: Expr,
    alpha: Coefficient,
    beta: Coefficient,
    acc: Expr,
    acc_im: Option<Expr>,
}

/// Generates the device function `name` for `cfg`.
pub fn generate_gemm(
    cfg: &GemmConfig,
    name: &str,
    subgroup_size: u32,
    register_space: u32,
    tiling: LocalTiling,
) -> Result<clir::Function> {
    let mut f = clir::Function::new(name);
    let mut namer = Namer::new();
    for p in PARAMS {
        namer.fresh(p);
    }
    let long = BuiltinType::Long;
    let m_param = f.param(long, "M");
    let n_param = f.param(long, "N");
    let k_param = f.param(long, "K");
    let alpha = f.param(register_type(cfg.alpha_ty), "alpha");
    let a = f.param(generic_pointer(cfg.a_ty), "A");
    let a_stride = [f.param(long, "A_stride0"), f.param(long, "A_stride1")];
    let b = f.param(generic_pointer(cfg.b_ty), "B");
    let b_stride = [f.param(long, "B_stride0"), f.param(long, "B_stride1")];
    let beta = f.param(register_type(cfg.beta_ty), "beta");
    let c = f.param(generic_pointer(cfg.c_ty), "C");
    let c_stride = [f.param(long, "C_stride0"), f.param(long, "C_stride1")];

    let [as0, as1] = a_stride;
    let a_stride = [static_or(cfg.a_stride[0], as0), static_or(cfg.a_stride[1], as1)];
    let [bs0, bs1] = b_stride;
    let b_stride = [static_or(cfg.b_stride[0], bs0), static_or(cfg.b_stride[1], bs1)];
    let [cs0, cs1] = c_stride;
    let c_stride = [static_or(cfg.c_stride[0], cs0), static_or(cfg.c_stride[1], cs1)];
    let m_size = static_or(cfg.m, m_param);
    let n_size = static_or(cfg.n, n_param);

    let sgs = i64::from(subgroup_size);
    let cb = c_blocks(cfg.a_ty, cfg.b_ty);
    let block = max_register_block(cfg.c_ty.size() as u32, subgroup_size, register_space, cb);
    let rows = i64::from(shrink_rows(block.rows, subgroup_size, cfg.m, tiling.m_tiles));
    let cols = if is_dynamic_value(cfg.n) {
        i64::from(block.cols)
    } else {
        uniform_max_block(cfg.n, i64::from(block.cols), i64::from(tiling.n_tiles)).max(1)
    };
    log::debug!(
        "{name}: register block {rows}x{cols} (max {block}), tiling {tiling}, subgroup size {subgroup_size}"
    );

    let mut bb = Block::new();
    let row_blocks = rows / sgs;
    let c_reg = register_type(cfg.c_ty);
    let acc = bb.declare_array(c_reg, namer.fresh("c"), row_blocks * cols);
    let acc_im = (cb == 2).then(|| bb.declare_array(c_reg, namer.fresh("c_im"), row_blocks * cols));
    let lanes = Lanes::declare(&mut bb, &mut namer, i64::from(tiling.m_tiles));

    let (a_stride_m, a_stride_k) = match cfg.trans_a {
        Transpose::N => (a_stride[0].clone(), a_stride[1].clone()),
        Transpose::T => (a_stride[1].clone(), a_stride[0].clone()),
    };
    let (b_stride_k, b_stride_n) = match cfg.trans_b {
        Transpose::N => (b_stride[0].clone(), b_stride[1].clone()),
        Transpose::T => (b_stride[1].clone(), b_stride[0].clone()),
    };
    let kernel = Kernel {
        cfg,
        sgs,
        row_blocks,
        cols,
        lanes: lanes.clone(),
        a_stride_m,
        a_stride_k,
        b_stride_k,
        b_stride_n,
        c_stride,
        k: static_or(cfg.k, k_param),
        alpha: coefficient(cfg.alpha, cfg.alpha_ty, alpha, cfg.c_ty)?,
        beta: coefficient(cfg.beta, cfg.beta_ty, beta, cfg.c_ty)?,
        acc,
        acc_im,
    };

    let m_tiles = i64::from(tiling.m_tiles);
    tile_loop_uniform(
        &mut bb,
        &mut namer,
        n_size,
        cols,
        i64::from(tiling.n_tiles),
        lanes.sg_n.clone(),
        |bb, namer, n_blk, n_trip| {
            let b_block = bb.declare_assign(
                generic_pointer(cfg.b_ty),
                namer.fresh("Bb"),
                b.clone() + kernel.b_stride_n.clone() * n_blk.clone(),
            );
            tile_loop_by_sgs(
                bb,
                namer,
                m_size.clone(),
                rows,
                m_tiles,
                lanes.sg_m.clone(),
                |bb, namer, m_blk, m_trip, tail| {
                    let a_block = bb.declare_assign(
                        generic_pointer(cfg.a_ty),
                        namer.fresh("Ab"),
                        a.clone() + kernel.a_stride_m.clone() * m_blk.clone(),
                    );
                    let c_block = bb.declare_assign(
                        generic_pointer(cfg.c_ty),
                        namer.fresh("Cb"),
                        c.clone()
                            + kernel.c_stride[0].clone() * m_blk
                            + kernel.c_stride[1].clone() * n_blk.clone(),
                    );
                    let mut body = Block::new();
                    kernel.micro_kernel(
                        &mut body,
                        namer,
                        &a_block,
                        &b_block,
                        &c_block,
                        &m_trip,
                        &n_trip,
                        tail,
                    )?;
                    bb.scope(body);
                    Ok(())
                },
            )
        },
    )?;
    f.body = bb.into_stmts();
    Ok(f)
}

impl Kernel<'_> {
    fn acc_len(&self) -> i64 {
        self.row_blocks * self.cols
    }

    /// `mb * sgs + lane`.
    fn row(&self, mb: Expr) -> Expr {
        mb * Expr::Int(self.sgs) + self.lanes.lane.clone()
    }

    /// Elementwise loop over the accumulators.
    fn for_each_acc(&self, bb: &mut Block, namer: &mut Namer, body: impl Fn(Expr) -> Block) {
        let i = namer.fresh("i");
        let len = self.acc_len();
        bb.for_loop(
            BuiltinType::Long,
            &i,
            Expr::Int(0),
            Expr::Int(len),
            Expr::Int(1),
            body(Expr::var(&i)),
            Some(len as u32),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn micro_kernel(
        &self,
        bb: &mut Block,
        namer: &mut Namer,
        a: &Expr,
        b: &Expr,
        c: &Expr,
        m_trip: &Expr,
        n_trip: &Expr,
        tail: bool,
    ) -> Result<()> {
        let c_ty = self.cfg.c_ty;
        self.for_each_acc(bb, namer, |i| {
            let mut zeroing = Block::new();
            zeroing.assign(self.acc.clone().index(i.clone()), zero(c_ty));
            if let Some(im) = &self.acc_im {
                zeroing.assign(im.clone().index(i), zero(c_ty));
            }
            zeroing
        });

        let kb = k_unroll(self.cfg.k);
        let k_full = crate::tile::bind(
            bb,
            namer,
            "KmultipleKb",
            self.k.clone() / Expr::Int(kb) * Expr::Int(kb),
        );
        let kvar = namer.fresh("kb");
        let mut full = Block::new();
        self.add_rank(&mut full, namer, a, b, Expr::var(&kvar), kb, m_trip, n_trip, tail)?;
        bb.for_loop(
            BuiltinType::Long,
            &kvar,
            Expr::Int(0),
            k_full.clone(),
            Expr::Int(kb),
            full,
            None,
        );
        if kb > 1 {
            let kvar = namer.fresh("kb");
            let mut single = Block::new();
            self.add_rank(&mut single, namer, a, b, Expr::var(&kvar), 1, m_trip, n_trip, tail)?;
            let mut rest = Block::new();
            rest.for_loop(
                BuiltinType::Long,
                &kvar,
                k_full.clone(),
                self.k.clone(),
                Expr::Int(1),
                single,
                None,
            );
            bb.if_then((self.k.clone() - k_full).gt(Expr::Int(0)), rest);
        }

        if let Some(im) = &self.acc_im {
            let reg = register_type(c_ty);
            self.for_each_acc(bb, namer, |i| {
                let mut merge = Block::new();
                let cross = im.clone().index(i.clone());
                merge.expr(self.acc.clone().index(i).add_assign(Expr::vector(
                    reg,
                    vec![-cross.clone().im(), cross.re()],
                )));
                merge
            });
        }
        self.write_back(bb, namer, c, m_trip, n_trip, tail)
    }

    /// Operand in the type the products are computed in.
    fn compute_operand(&self, value: Expr, ty: ScalarType) -> Result<Expr> {
        let c_ty = self.cfg.c_ty;
        if ty.is_complex() {
            convert(value, ty, c_ty)
        } else {
            convert(value, ty, c_ty.component_type())
        }
    }

    fn broadcast(&self, value: Expr, lane: i64) -> Expr {
        let ty = register_type(self.cfg.b_ty);
        let bcast = |v: Expr| Expr::call("sub_group_broadcast", vec![v, Expr::Int(lane)]);
        if ty.is_vector() {
            Expr::vector(ty, vec![bcast(value.clone().re()), bcast(value.im())])
        } else {
            bcast(value)
        }
    }

    /// Accumulates `kcount` rank-1 updates starting at K index `kb`.
    #[allow(clippy::too_many_arguments)]
    fn add_rank(
        &self,
        bb: &mut Block,
        namer: &mut Namer,
        a: &Expr,
        b: &Expr,
        kb: Expr,
        kcount: i64,
        m_trip: &Expr,
        n_trip: &Expr,
        tail: bool,
    ) -> Result<()> {
        let cfg = self.cfg;
        let sgs = self.sgs;
        let n_blocks = (self.cols + sgs - 1) / sgs;
        let a_regs = bb.declare_array(
            register_type(cfg.a_ty),
            namer.fresh("a"),
            self.row_blocks * kcount,
        );
        let b_regs = bb.declare_array(register_type(cfg.b_ty), namer.fresh("b"), n_blocks * kcount);

        // A panel: lane `m` holds rows `mb * sgs + m`.
        let k = namer.fresh("k");
        let mb = namer.fresh("mb");
        let row = self.row(Expr::var(&mb));
        let kk = kb.clone() + Expr::var(&k);
        let a_value = load_value(
            cfg.a_ty,
            a.clone()
                .index(row.clone() * self.a_stride_m.clone() + kk.clone() * self.a_stride_k.clone()),
        );
        let a_value = if tail {
            Expr::ternary(row.lt(m_trip.clone()), a_value, zero(cfg.a_ty))
        } else {
            a_value
        };
        let mut load_a = Block::new();
        load_a.assign(
            a_regs
                .clone()
                .index(Expr::var(&mb) + Expr::Int(self.row_blocks) * Expr::var(&k)),
            a_value,
        );
        let mut over_m = Block::new();
        over_m.for_loop(
            BuiltinType::Long,
            &mb,
            Expr::Int(0),
            Expr::Int(self.row_blocks),
            Expr::Int(1),
            load_a,
            Some(self.row_blocks as u32),
        );

        // B panel: lane `m` holds columns `nb * sgs + m`.
        let nb = namer.fresh("nb");
        let col = Expr::var(&nb) * Expr::Int(sgs) + self.lanes.lane.clone();
        let b_value = load_value(
            cfg.b_ty,
            b.clone()
                .index(kk * self.b_stride_k.clone() + col.clone() * self.b_stride_n.clone()),
        );
        let needs_guard = n_trip.as_int().is_none_or(|n| n < n_blocks * sgs);
        let b_value = if needs_guard {
            Expr::ternary(col.lt(n_trip.clone()), b_value, zero(cfg.b_ty))
        } else {
            b_value
        };
        let mut load_b = Block::new();
        load_b.assign(
            b_regs
                .clone()
                .index(Expr::var(&nb) + Expr::Int(n_blocks) * Expr::var(&k)),
            b_value,
        );
        over_m.for_loop(
            BuiltinType::Long,
            &nb,
            Expr::Int(0),
            Expr::Int(n_blocks),
            Expr::Int(1),
            load_b,
            Some(n_blocks as u32),
        );
        bb.for_loop(
            BuiltinType::Long,
            &k,
            Expr::Int(0),
            Expr::Int(kcount),
            Expr::Int(1),
            over_m,
            Some(kcount as u32),
        );

        // Rank-1 updates.
        let k = namer.fresh("k");
        let bc = namer.fresh("b_bc");
        let mut over_k = Block::new();
        for n in 0..self.cols {
            let mut column = Block::new();
            let b_elem = b_regs
                .clone()
                .index(Expr::Int(n / sgs) + Expr::Int(n_blocks) * Expr::var(&k));
            let b_bc = column.declare_assign(
                register_type(cfg.b_ty),
                bc.clone(),
                self.broadcast(b_elem, n % sgs),
            );
            let mb = namer.fresh("mb");
            let a_elem = a_regs
                .clone()
                .index(Expr::var(&mb) + Expr::Int(self.row_blocks) * Expr::var(&k));
            let idx = Expr::var(&mb) + Expr::Int(self.row_blocks * n);
            let mut update = Block::new();
            self.update(&mut update, idx, a_elem, b_bc)?;
            column.for_loop(
                BuiltinType::Long,
                &mb,
                Expr::Int(0),
                Expr::Int(self.row_blocks),
                Expr::Int(1),
                update,
                Some(self.row_blocks as u32),
            );
            over_k.scope(column);
        }
        bb.for_loop(
            BuiltinType::Long,
            &k,
            Expr::Int(0),
            Expr::Int(kcount),
            Expr::Int(1),
            over_k,
            Some(kcount as u32),
        );
        Ok(())
    }

    /// `c[idx] += a * b` for one accumulator.
    fn update(&self, bb: &mut Block, idx: Expr, a: Expr, b: Expr) -> Result<()> {
        let cfg = self.cfg;
        let c = self.acc.clone().index(idx.clone());
        if let Some(im) = &self.acc_im {
            // (a_re + i a_im)(b_re + i b_im): real and imaginary parts of b
            // scale a separately, merged after the K loop.
            let a = convert(a, cfg.a_ty, cfg.c_ty)?;
            let component = |part: Expr| {
                if register_type(cfg.b_ty).component() == register_type(cfg.c_ty).component() {
                    part
                } else {
                    Expr::cast(register_type(cfg.c_ty).component(), part)
                }
            };
            bb.expr(c.add_assign(Expr::binary(
                clir::BinaryOp::Mul,
                a.clone(),
                component(b.clone().re()),
            )));
            bb.expr(im.clone().index(idx).add_assign(Expr::binary(
                clir::BinaryOp::Mul,
                a,
                component(b.im()),
            )));
            return Ok(());
        }
        let same = cfg.a_ty == cfg.b_ty && cfg.b_ty == cfg.c_ty;
        if same && !cfg.c_ty.is_complex() {
            bb.assign(c.clone(), Expr::call("fma", vec![a, b, c]));
            return Ok(());
        }
        let a = self.compute_operand(a, cfg.a_ty)?;
        let b = self.compute_operand(b, cfg.b_ty)?;
        let product = Expr::binary(clir::BinaryOp::Mul, a, b);
        let product = if cfg.c_ty.is_complex() && !cfg.a_ty.is_complex() && !cfg.b_ty.is_complex()
        {
            convert(product, cfg.c_ty.component_type(), cfg.c_ty)?
        } else {
            product
        };
        bb.expr(c.add_assign(product));
        Ok(())
    }

    fn write_back(
        &self,
        bb: &mut Block,
        namer: &mut Namer,
        c: &Expr,
        m_trip: &Expr,
        n_trip: &Expr,
        tail: bool,
    ) -> Result<()> {
        let cfg = self.cfg;
        let n = namer.fresh("n");
        let mb = namer.fresh("mb");
        let row = self.row(Expr::var(&mb));
        let acc = self
            .acc
            .clone()
            .index(Expr::var(&mb) + Expr::Int(self.row_blocks) * Expr::var(&n));
        let value = if self.alpha.is_one() {
            acc
        } else {
            multiply(cfg.c_ty, self.alpha.expr.clone(), acc)
        };
        let dst = Destination {
            ptr: c
                .clone()
                .index(row.clone() * self.c_stride[0].clone() + Expr::var(&n) * self.c_stride[1].clone())
                .address_of(),
            ty: cfg.c_ty,
            addrspace: cfg.c_addrspace,
            atomic: cfg.atomic,
        };
        let mut store = Block::new();
        store_update(&mut store, namer, &dst, value, &self.beta)?;
        let mut element = Block::new();
        if tail {
            element.if_then(row.lt(m_trip.clone()), store);
        } else {
            element = store;
        }
        let mut over_m = Block::new();
        over_m.for_loop(
            BuiltinType::Long,
            &mb,
            Expr::Int(0),
            Expr::Int(self.row_blocks),
            Expr::Int(1),
            element,
            Some(self.row_blocks as u32),
        );
        let mut column = Block::new();
        column.if_then(Expr::var(&n).lt(n_trip.clone()), over_m);
        bb.for_loop(
            BuiltinType::Long,
            &n,
            Expr::Int(0),
            Expr::Int(self.cols),
            Expr::Int(1),
            column,
            None,
        );
        Ok(())
    }
}
