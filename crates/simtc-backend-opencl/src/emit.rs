//! Lowering of IR functions to OpenCL C kernels.
//!
//! Every IR function becomes one kernel. Memref and group parameters carry a
//! dope vector: each dynamic shape or stride entry turns into an extra
//! trailing parameter. BLAS instructions call memoized device functions
//! except AXPBY, which is expanded inline.

use std::collections::HashMap;

use simtc_backend_core::clir::{
    self, BinaryOp, Block, BuiltinType, DataType, Declaration, Expr, KernelAttributes, Module,
    Namer, Space, Stmt,
};
use simtc_ir::{
    AddressSpaces, Builtin, CompilationError, ConstValue, CoreConfig, Function, Handle, Inst,
    MemrefType, Op, Program, Region, Result, ScalarType, Status, StoreFlag, Transpose, Type,
    TypeContext, Value, is_dynamic_value,
};
use simtc_opt::tiling::LocalTiling;

use crate::blas::{Axpby, BlasConfig, BlasKind, Operand, OperandLayout, emit_axpby, generate_blas};
use crate::dope::{DopeKind, DopeVector};
use crate::gemm::{GemmConfig, coefficient, generate_gemm};
use crate::session::EmissionSession;
use crate::store::{Coefficient, Destination, atomic_extension, store_update};
use crate::tile::bind;
use crate::types::{
    arith, arith_unary, compare, convert, coopmatrix_registers, literal, load_value,
    memref_pointer, register_type, storage_type, store_value,
};

/// Alignment of the work-group scratch buffer in bytes.
const STACK_ALIGNMENT: u32 = 64;

/// Emits every function of `program` as a kernel, plus the device functions they call.
pub fn emit_program(program: &Program, core: &CoreConfig) -> Result<Module> {
    let mut session = EmissionSession::new(program.functions.iter().map(|f| f.name.as_str()));
    let mut kernels = Vec::with_capacity(program.functions.len());
    for func in &program.functions {
        let emitter = KernelEmitter::new(&program.types, func, &mut session, core)?;
        kernels.push(emitter.emit()?);
    }
    Ok(session.finish(kernels))
}

/// Emitted form of an IR value.
#[derive(Clone, Debug)]
enum Emitted {
    /// Scalar or boolean expression.
    Scalar(Expr),
    Memref {
        ptr: Expr,
        dope: DopeVector,
    },
    /// Batch of memrefs: pointer to the entry pointers, per-entry dope arrays
    /// (static entries are literals), batch size and element offset.
    Group {
        ptr: Expr,
        dope: DopeVector,
        size: Expr,
        offset: Expr,
    },
    /// Per-lane register array.
    CoopMatrix {
        regs: Expr,
        len: i64,
    },
}

struct KernelEmitter<'a> {
    types: &'a TypeContext,
    func: &'a Function,
    session: &'a mut EmissionSession,
    namer: Namer,
    values: HashMap<Handle<Value>, Emitted>,
    /// Variables receiving the operands of `yield`, innermost last.
    yields: Vec<Vec<Handle<Value>>>,
    stack: Option<Expr>,
    subgroup_size: u32,
    tiling: LocalTiling,
    register_space: u32,
}

impl<'a> KernelEmitter<'a> {
    fn new(
        types: &'a TypeContext,
        func: &'a Function,
        session: &'a mut EmissionSession,
        core: &CoreConfig,
    ) -> Result<Self> {
        if func.subgroup_size == 0 || func.work_group_size.contains(&0) {
            return Err(CompilationError::new(Status::UnsupportedWorkGroupSize)
                .at(func.loc)
                .with_extra(format!("{} has no work-group size", func.name)));
        }
        Ok(Self {
            types,
            func,
            session,
            namer: Namer::new(),
            values: HashMap::new(),
            yields: Vec::new(),
            stack: None,
            subgroup_size: func.subgroup_size,
            tiling: LocalTiling::from_work_group_size(func.subgroup_size, func.work_group_size),
            register_space: core.effective_register_space(),
        })
    }

    fn emit(mut self) -> Result<clir::Function> {
        let func = self.func;
        log::debug!(
            "emitting kernel {}: subgroup size {}, tiling {}, scratch {} B",
            func.name,
            self.subgroup_size,
            self.tiling,
            func.scratch_size
        );
        let mut kernel = clir::Function::new(&func.name);
        self.namer.fresh(&func.name);
        kernel.kernel = Some(KernelAttributes {
            work_group_size: func.work_group_size,
            subgroup_size: self.subgroup_size,
        });
        for &param in &func.params {
            self.param(&mut kernel, param)?;
        }

        let mut bb = Block::new();
        if func.scratch_size > 0 {
            let name = self.namer.fresh("stack");
            bb.add(Stmt::Decl(Declaration {
                ty: BuiltinType::Uchar.into(),
                name: name.clone(),
                space: Space::Local,
                array: Some(func.scratch_size),
                init: None,
                aligned: Some(STACK_ALIGNMENT),
            }));
            self.stack = Some(Expr::var(name));
        }
        self.region(&mut bb, &func.body)?;
        kernel.body = bb.into_stmts();
        Ok(kernel)
    }

    // -------------------------------------------------------------------
    // Values
    // -------------------------------------------------------------------

    fn ty(&self, value: Handle<Value>) -> &'a Type {
        self.types.get(self.func.value_type(value))
    }

    fn scalar_type(&self, value: Handle<Value>) -> Option<ScalarType> {
        self.ty(value).as_scalar()
    }

    fn hint(&self, value: Handle<Value>, default: &str) -> String {
        self.func
            .value(value)
            .name
            .clone()
            .unwrap_or_else(|| default.to_owned())
    }

    fn get(&self, value: Handle<Value>) -> Result<&Emitted> {
        self.values
            .get(&value)
            .ok_or_else(|| CompilationError::internal(format!("value {value:?} used before definition")))
    }

    fn scalar(&self, value: Handle<Value>) -> Result<Expr> {
        match self.get(value)? {
            Emitted::Scalar(e) => Ok(e.clone()),
            _ => Err(CompilationError::new(Status::IrExpectedScalar)),
        }
    }

    fn memref(&self, value: Handle<Value>) -> Result<(Expr, DopeVector, &'a MemrefType)> {
        let mr = self
            .ty(value)
            .as_memref()
            .ok_or_else(|| CompilationError::new(Status::IrExpectedMemref))?;
        match self.get(value)? {
            Emitted::Memref { ptr, dope } => Ok((ptr.clone(), dope.clone(), mr)),
            _ => Err(CompilationError::new(Status::IrExpectedMemref)),
        }
    }

    /// Declares a variable of the register type of `value`.
    fn declare(&mut self, bb: &mut Block, value: Handle<Value>, init: Option<Expr>) -> Result<Emitted> {
        let name = self.namer.fresh(&self.hint(value, "x"));
        let ty = match self.ty(value) {
            Type::Bool => BuiltinType::Bool,
            Type::Scalar(s) => register_type(*s),
            Type::CoopMatrix(ct) if init.is_none() => {
                let (component, len) = coopmatrix_registers(ct, self.subgroup_size);
                let regs = bb.declare_array(component, name, len);
                return Ok(Emitted::CoopMatrix { regs, len });
            }
            other => {
                return Err(CompilationError::internal(format!(
                    "cannot hold {other:?} in a variable"
                )));
            }
        };
        Ok(Emitted::Scalar(match init {
            Some(init) => bb.declare_assign(ty, name, init),
            None => bb.declare(ty, name),
        }))
    }

    fn define_scalar(&mut self, bb: &mut Block, value: Handle<Value>, init: Expr) -> Result<()> {
        let emitted = self.declare(bb, value, Some(init))?;
        self.values.insert(value, emitted);
        Ok(())
    }

    // -------------------------------------------------------------------
    // Parameters
    // -------------------------------------------------------------------

    fn param(&mut self, kernel: &mut clir::Function, value: Handle<Value>) -> Result<()> {
        let name = self.namer.fresh(&self.hint(value, "arg"));
        let emitted = match self.ty(value) {
            Type::Bool => Emitted::Scalar(Expr::cast(
                BuiltinType::Bool,
                kernel.param(BuiltinType::Char, name),
            )),
            Type::Scalar(s) => {
                Emitted::Scalar(load_value(*s, kernel.param(storage_type(*s), name)))
            }
            Type::Memref(mr) => {
                let ptr = kernel.param(memref_pointer(mr), &name);
                let dope = self.dope_params(kernel, &name, mr, BuiltinType::Long.into());
                Emitted::Memref { ptr, dope }
            }
            Type::Group(g) => {
                let mr = self
                    .types
                    .memref_type(g.memref)
                    .ok_or_else(|| CompilationError::new(Status::IrExpectedMemref))?;
                let ptr = kernel.param(memref_pointer(mr).pointer(Space::Global), &name);
                let dope = self.dope_params(
                    kernel,
                    &name,
                    mr,
                    DataType::from(BuiltinType::Long).pointer(Space::Global),
                );
                let mut scalar = |suffix: &str, v: i64| {
                    if is_dynamic_value(v) {
                        let pname = self.namer.fresh(&format!("{name}_{suffix}"));
                        kernel.param(BuiltinType::Long, pname)
                    } else {
                        Expr::Int(v)
                    }
                };
                let size = scalar("size", g.size);
                let offset = scalar("offset", g.offset);
                Emitted::Group {
                    ptr,
                    dope,
                    size,
                    offset,
                }
            }
            other => {
                return Err(CompilationError::new(Status::InvalidArguments)
                    .at(self.func.value(value).loc)
                    .with_extra(format!("kernel parameter {name} of type {other:?}")));
            }
        };
        self.values.insert(value, emitted);
        Ok(())
    }

    /// Adds a parameter of type `ty` for every dynamic dope entry of `mr`.
    fn dope_params(
        &mut self,
        kernel: &mut clir::Function,
        name: &str,
        mr: &MemrefType,
        ty: DataType,
    ) -> DopeVector {
        DopeVector::from_type(mr, |kind, mode| {
            let pname = self.namer.fresh(&format!("{name}_{}{mode}", kind.suffix()));
            kernel.param(ty.clone(), pname)
        })
    }

    /// Binds the non-trivial entries of `dope` to variables named after `name`.
    fn bind_dope(&mut self, bb: &mut Block, name: &str, dope: DopeVector) -> DopeVector {
        let mut entries = |kind: DopeKind, values: Vec<Expr>| -> Vec<Expr> {
            values
                .into_iter()
                .enumerate()
                .map(|(mode, e)| {
                    bind(
                        bb,
                        &mut self.namer,
                        &format!("{name}_{}{mode}", kind.suffix()),
                        e,
                    )
                })
                .collect()
        };
        let shape = entries(DopeKind::Shape, dope.shape);
        let stride = entries(DopeKind::Stride, dope.stride);
        DopeVector { shape, stride }
    }

    // -------------------------------------------------------------------
    // Instructions
    // -------------------------------------------------------------------

    fn region(&mut self, bb: &mut Block, region: &Region) -> Result<()> {
        for &inst in &region.insts {
            let loc = self.func.inst(inst).loc;
            self.inst(bb, inst).map_err(|e| {
                if e.location.is_none() { e.at(loc) } else { e }
            })?;
        }
        Ok(())
    }

    fn inst(&mut self, bb: &mut Block, handle: Handle<Inst>) -> Result<()> {
        let func = self.func;
        let inst = func.inst(handle);
        let ops = inst.operands();
        let result = inst.result();
        let result_or_err =
            || result.ok_or_else(|| CompilationError::internal(format!("{} without result", inst.op.mnemonic())));
        match &inst.op {
            Op::Constant(value) => {
                let r = result_or_err()?;
                let expr = match self.ty(r) {
                    Type::Bool => Expr::Bool(!value.is_zero()),
                    Type::Scalar(s) => literal(*value, *s)?,
                    _ => return Err(CompilationError::new(Status::IrConstantMismatch)),
                };
                self.values.insert(r, Emitted::Scalar(expr));
            }
            Op::Arith(op) => {
                let r = result_or_err()?;
                let expr = arith(*op, self.scalar_type(r), self.scalar(ops[0])?, self.scalar(ops[1])?)?;
                self.define_scalar(bb, r, expr)?;
            }
            Op::ArithUnary(op) => {
                let r = result_or_err()?;
                let expr = arith_unary(*op, self.scalar_type(ops[0]), self.scalar(ops[0])?)?;
                self.define_scalar(bb, r, expr)?;
            }
            Op::Cast => {
                let r = result_or_err()?;
                let (Some(from), Some(to)) = (self.scalar_type(ops[0]), self.scalar_type(r)) else {
                    return Err(CompilationError::new(Status::IrExpectedScalar));
                };
                let expr = convert(self.scalar(ops[0])?, from, to)?;
                self.define_scalar(bb, r, expr)?;
            }
            Op::Cmp(cond) => {
                let r = result_or_err()?;
                let ty = self.scalar_type(ops[0]);
                let expr = compare(*cond, ty, self.scalar(ops[0])?, self.scalar(ops[1])?)?;
                self.define_scalar(bb, r, expr)?;
            }
            Op::Builtin(builtin) => {
                let r = result_or_err()?;
                let call = |name: &str, args: Vec<Expr>| Expr::call(name, args);
                let expr = match builtin {
                    Builtin::GroupId => call("get_global_id", vec![Expr::Int(2)]),
                    Builtin::NumGroups => call("get_global_size", vec![Expr::Int(2)]),
                    Builtin::NumSubgroups => call("get_num_sub_groups", Vec::new()),
                    Builtin::SubgroupSize => call("get_sub_group_size", Vec::new()),
                    Builtin::SubgroupId => call("get_sub_group_id", Vec::new()),
                    Builtin::SubgroupLocalId => call("get_sub_group_local_id", Vec::new()),
                };
                self.define_scalar(bb, r, expr)?;
            }
            Op::Load => self.load(bb, inst)?,
            Op::Store(flag) => self.store(bb, inst, *flag)?,
            Op::Subview { slices } => {
                let r = result_or_err()?;
                let (ptr, dope, _) = self.memref(ops[0])?;
                let dynamic = ops[1..]
                    .iter()
                    .map(|&v| self.scalar(v))
                    .collect::<Result<Vec<_>>>()?;
                let (offset, sub) = dope.subview(slices, &dynamic)?;
                self.define_view(bb, r, ptr + offset, sub)?;
            }
            Op::Expand { mode, shape } => {
                let r = result_or_err()?;
                let (ptr, dope, _) = self.memref(ops[0])?;
                let dynamic = ops[1..]
                    .iter()
                    .map(|&v| self.scalar(v))
                    .collect::<Result<Vec<_>>>()?;
                let expanded = dope.expand(*mode as usize, shape, &dynamic)?;
                self.define_view(bb, r, ptr, expanded)?;
            }
            Op::Fuse { from, to } => {
                let r = result_or_err()?;
                let (ptr, dope, _) = self.memref(ops[0])?;
                let fused = dope.fuse(*from as usize, *to as usize)?;
                self.define_view(bb, r, ptr, fused)?;
            }
            Op::Size { mode } => {
                let r = result_or_err()?;
                let expr = match self.get(ops[0])? {
                    Emitted::Memref { dope, .. } => dope.shape(*mode as usize),
                    Emitted::Group { size, .. } => size.clone(),
                    _ => return Err(CompilationError::new(Status::IrExpectedMemrefOrGroup)),
                };
                self.values.insert(r, Emitted::Scalar(expr));
            }
            Op::Alloca { stack_ptr } => {
                let r = result_or_err()?;
                let mr = self
                    .ty(r)
                    .as_memref()
                    .ok_or_else(|| CompilationError::new(Status::IrExpectedMemref))?;
                let (Some(offset), Some(stack)) = (stack_ptr, self.stack.clone()) else {
                    return Err(CompilationError::internal("alloca without stack pointer"));
                };
                let ty = memref_pointer(mr);
                let name = self.namer.fresh(&self.hint(r, "tmp"));
                let ptr = bb.declare_assign(
                    ty.clone(),
                    name,
                    Expr::cast(ty, stack + Expr::Int(*offset)),
                );
                let dope = DopeVector::from_type(mr, |_, _| Expr::Int(0));
                self.values.insert(r, Emitted::Memref { ptr, dope });
            }
            Op::LifetimeStop => {}
            Op::Barrier(fence) => bb.expr(barrier(*fence)),
            Op::Axpby { atomic, trans_a } => self.axpby(bb, inst, *trans_a, *atomic)?,
            Op::Gemm {
                atomic,
                trans_a,
                trans_b,
            } => self.gemm(bb, inst, *trans_a, *trans_b, *atomic, false)?,
            Op::Gemv { atomic, trans_a } => {
                self.gemm(bb, inst, *trans_a, Transpose::N, *atomic, true)?
            }
            Op::Ger { atomic } => self.blas(bb, inst, BlasKind::Ger, Transpose::N, *atomic)?,
            Op::Hadamard { atomic } => {
                self.blas(bb, inst, BlasKind::Hadamard, Transpose::N, *atomic)?
            }
            Op::Sum { atomic, trans_a } => self.blas(bb, inst, BlasKind::Sum, *trans_a, *atomic)?,
            Op::For { .. } => self.for_loop(bb, inst)?,
            Op::If => self.if_else(bb, inst)?,
            Op::Yield => self.yield_values(bb, inst)?,
            Op::Foreach { .. } => {
                return Err(CompilationError::internal(
                    "foreach must be lowered before emission",
                ));
            }
            Op::Parallel => {
                let mut body = Block::new();
                for region in &inst.regions {
                    self.region(&mut body, region)?;
                }
                bb.scope(body);
            }
        }
        Ok(())
    }

    /// Declares the pointer and non-trivial dope entries of a view.
    fn define_view(
        &mut self,
        bb: &mut Block,
        value: Handle<Value>,
        ptr: Expr,
        dope: DopeVector,
    ) -> Result<()> {
        let mr = self
            .ty(value)
            .as_memref()
            .ok_or_else(|| CompilationError::new(Status::IrExpectedMemref))?;
        let name = self.namer.fresh(&self.hint(value, "view"));
        let ptr = bb.declare_assign(memref_pointer(mr), &name, ptr);
        let dope = self.bind_dope(bb, &name, dope.specialize(mr));
        self.values.insert(value, Emitted::Memref { ptr, dope });
        Ok(())
    }

    fn indices(&self, ops: &[Handle<Value>]) -> Result<Vec<Expr>> {
        ops.iter().map(|&v| self.scalar(v)).collect()
    }

    fn load(&mut self, bb: &mut Block, inst: &Inst) -> Result<()> {
        let ops = inst.operands();
        let r = inst
            .result()
            .ok_or_else(|| CompilationError::internal("load without result"))?;
        let idx = self.indices(&ops[1..])?;
        match self.get(ops[0])?.clone() {
            Emitted::Memref { ptr, dope } => {
                let ty = self
                    .scalar_type(r)
                    .ok_or_else(|| CompilationError::new(Status::IrExpectedScalar))?;
                let value = load_value(ty, ptr.index(dope.offset(&idx)));
                self.define_scalar(bb, r, value)
            }
            Emitted::Group {
                ptr, dope, offset, ..
            } => {
                let [i] = idx.as_slice() else {
                    return Err(CompilationError::new(Status::IrInvalidNumberOfIndices));
                };
                let mr = self
                    .ty(r)
                    .as_memref()
                    .ok_or_else(|| CompilationError::new(Status::IrExpectedMemref))?;
                let name = self.namer.fresh(&self.hint(r, "entry"));
                let entry = bb.declare_assign(memref_pointer(mr), &name, ptr.index(i.clone()) + offset);
                let at = |e: Expr| match e {
                    Expr::Int(_) => e,
                    array => array.index(i.clone()),
                };
                let dope = DopeVector {
                    shape: dope.shape.into_iter().map(at).collect(),
                    stride: dope.stride.into_iter().map(at).collect(),
                };
                let dope = self.bind_dope(bb, &name, dope);
                self.values.insert(r, Emitted::Memref { ptr: entry, dope });
                Ok(())
            }
            _ => Err(CompilationError::new(Status::IrExpectedMemrefOrGroup)),
        }
    }

    fn store(&mut self, bb: &mut Block, inst: &Inst, flag: StoreFlag) -> Result<()> {
        let ops = inst.operands();
        let value = self.scalar(ops[0])?;
        let (ptr, dope, mr) = self.memref(ops[1])?;
        let idx = self.indices(&ops[2..])?;
        let place = ptr.index(dope.offset(&idx));
        let ty = mr.element;
        let beta = match flag {
            StoreFlag::Regular => {
                bb.assign(place, store_value(ty, value));
                return Ok(());
            }
            StoreFlag::Atomic => ConstValue::Int(0),
            StoreFlag::AtomicAdd => ConstValue::Int(1),
        };
        if let Some(ext) = atomic_extension(ty) {
            self.session.enable(ext);
        }
        let dst = Destination {
            ptr: place.address_of(),
            ty,
            addrspace: mr.addrspace,
            atomic: true,
        };
        let beta = Coefficient {
            expr: literal(beta, ty)?,
            ty,
            fixed: Some(beta),
        };
        store_update(bb, &mut self.namer, &dst, value, &beta)
    }

    // -------------------------------------------------------------------
    // Control flow
    // -------------------------------------------------------------------

    fn for_loop(&mut self, bb: &mut Block, inst: &Inst) -> Result<()> {
        let (from, to, step) = inst
            .loop_bounds()
            .ok_or_else(|| CompilationError::internal("for without bounds"))?;
        let region = inst
            .regions
            .first()
            .ok_or_else(|| CompilationError::internal("for without body"))?;
        let iv_ty = self
            .scalar_type(from)
            .map(register_type)
            .ok_or_else(|| CompilationError::new(Status::IrExpectedInteger))?;
        let from = self.scalar(from)?;
        let to = self.scalar(to)?;
        let step = step.map(|s| self.scalar(s)).transpose()?.unwrap_or(Expr::Int(1));

        for (&r, &init) in inst.results().iter().zip(inst.loop_init()) {
            let init = self.scalar(init)?;
            self.define_scalar(bb, r, init)?;
        }
        let Some((&iv, carried)) = region.params.split_first() else {
            return Err(CompilationError::internal("for without induction variable"));
        };
        let iv_name = self.namer.fresh(&self.hint(iv, "i"));
        self.values.insert(iv, Emitted::Scalar(Expr::var(&iv_name)));
        for (&param, &r) in carried.iter().zip(inst.results()) {
            let emitted = self.get(r)?.clone();
            self.values.insert(param, emitted);
        }

        let mut body = Block::new();
        self.yields.push(inst.results().to_vec());
        let res = self.region(&mut body, region);
        self.yields.pop();
        res?;
        bb.for_loop(iv_ty, &iv_name, from, to, step, body, None);
        Ok(())
    }

    fn if_else(&mut self, bb: &mut Block, inst: &Inst) -> Result<()> {
        let cond = self.scalar(inst.operand(0))?;
        for &r in inst.results() {
            let emitted = self.declare(bb, r, None)?;
            self.values.insert(r, emitted);
        }
        let mut branches = [Block::new(), Block::new()];
        self.yields.push(inst.results().to_vec());
        for (branch, region) in branches.iter_mut().zip(&inst.regions) {
            if let Err(e) = self.region(branch, region) {
                self.yields.pop();
                return Err(e);
            }
        }
        self.yields.pop();
        let [then, otherwise] = branches;
        bb.if_else(cond, then, otherwise);
        Ok(())
    }

    fn yield_values(&mut self, bb: &mut Block, inst: &Inst) -> Result<()> {
        let targets = self
            .yields
            .last()
            .cloned()
            .ok_or_else(|| CompilationError::new(Status::IrUnexpectedYield))?;
        let ops = inst.operands();
        if ops.len() != targets.len() {
            return Err(CompilationError::new(Status::IrYieldMismatch));
        }
        // With several values, a yielded value may be another target that is
        // overwritten first.
        let staged = if ops.len() > 1 {
            let mut staged = Vec::with_capacity(ops.len());
            for &v in ops {
                staged.push(match self.get(v)?.clone() {
                    Emitted::Scalar(e) => {
                        let ty = match self.ty(v) {
                            Type::Bool => BuiltinType::Bool,
                            Type::Scalar(s) => register_type(*s),
                            _ => return Err(CompilationError::new(Status::IrExpectedScalar)),
                        };
                        let name = self.namer.fresh("yield");
                        Emitted::Scalar(bb.declare_assign(ty, name, e))
                    }
                    other => other,
                });
            }
            staged
        } else {
            ops.iter()
                .map(|&v| self.get(v).cloned())
                .collect::<Result<Vec<_>>>()?
        };
        for (target, value) in targets.iter().zip(staged) {
            match (self.get(*target)?.clone(), value) {
                (Emitted::Scalar(dst), Emitted::Scalar(src)) => bb.assign(dst, src),
                (Emitted::CoopMatrix { regs: dst, len }, Emitted::CoopMatrix { regs: src, .. }) => {
                    let i = self.namer.fresh("i");
                    let mut copy = Block::new();
                    copy.assign(dst.index(Expr::var(&i)), src.index(Expr::var(&i)));
                    bb.for_loop(
                        BuiltinType::Long,
                        &i,
                        Expr::Int(0),
                        Expr::Int(len),
                        Expr::Int(1),
                        copy,
                        None,
                    );
                }
                _ => return Err(CompilationError::new(Status::IrYieldMismatch)),
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // BLAS
    // -------------------------------------------------------------------

    fn fixed(&self, value: Handle<Value>) -> Option<ConstValue> {
        self.func.constant_value(value)
    }

    fn operand(&self, value: Handle<Value>) -> Result<(Operand, &'a MemrefType, DopeVector)> {
        let (ptr, dope, mr) = self.memref(value)?;
        Ok((
            Operand {
                ptr,
                ty: mr.element,
                stride: dope.stride.clone(),
                addrspace: mr.addrspace,
            },
            mr,
            dope,
        ))
    }

    fn enable_atomics(&mut self, atomic: bool, ty: ScalarType) {
        if let Some(ext) = atomic.then(|| atomic_extension(ty)).flatten() {
            self.session.enable(ext);
        }
    }

    fn axpby(&mut self, bb: &mut Block, inst: &Inst, trans_a: Transpose, atomic: bool) -> Result<()> {
        let blas = inst
            .blas_operands()
            .ok_or_else(|| CompilationError::internal("axpby operands"))?;
        let (a, _, _) = self.operand(blas.a)?;
        let (b, _, b_dope) = self.operand(blas.out)?;
        let coeff = |this: &Self, v: Handle<Value>| -> Result<Coefficient> {
            let ty = this
                .scalar_type(v)
                .ok_or_else(|| CompilationError::new(Status::IrExpectedScalar))?;
            coefficient(this.fixed(v), ty, this.scalar(v)?, b.ty)
        };
        let op = Axpby {
            trans_a,
            atomic,
            alpha: coeff(self, blas.alpha)?,
            beta: coeff(self, blas.beta)?,
            a,
            shape: b_dope.shape.clone(),
            b,
        };
        self.enable_atomics(atomic, op.b.ty);
        emit_axpby(bb, &mut self.namer, self.subgroup_size, self.tiling, &op)
    }

    fn coefficient_type(&self, value: Handle<Value>) -> Result<ScalarType> {
        self.scalar_type(value)
            .ok_or_else(|| CompilationError::new(Status::IrExpectedScalar))
    }

    fn gemm(
        &mut self,
        bb: &mut Block,
        inst: &Inst,
        trans_a: Transpose,
        trans_b: Transpose,
        atomic: bool,
        vector: bool,
    ) -> Result<()> {
        let blas = inst
            .blas_operands()
            .ok_or_else(|| CompilationError::internal("gemm operands"))?;
        let b_handle = blas
            .b
            .ok_or_else(|| CompilationError::internal("gemm without B"))?;
        let (a_ptr, a_dope, a) = self.memref(blas.a)?;
        let (b_ptr, b_dope, b) = self.memref(b_handle)?;
        let (c_ptr, c_dope, c) = self.memref(blas.out)?;
        let stride2 = |mr: &MemrefType| {
            if vector && mr.dim() == 1 {
                [mr.stride(0), 0]
            } else {
                [mr.stride(0), mr.stride(1)]
            }
        };
        let cfg = GemmConfig {
            alpha_ty: self.coefficient_type(blas.alpha)?,
            a_ty: a.element,
            b_ty: b.element,
            beta_ty: self.coefficient_type(blas.beta)?,
            c_ty: c.element,
            trans_a,
            trans_b,
            m: c.shape(0),
            n: if vector { 1 } else { c.shape(1) },
            k: a.shape(trans_a.mode(1)),
            a_stride: stride2(a),
            b_stride: stride2(b),
            c_stride: stride2(c),
            alpha: self.fixed(blas.alpha),
            beta: self.fixed(blas.beta),
            atomic,
            c_addrspace: c.addrspace,
            vector,
        };
        self.enable_atomics(atomic, c.element);

        let (sgs, tiling, rs) = (self.subgroup_size, self.tiling, self.register_space);
        let name = self
            .session
            .device_function(&cfg.identifier(), sgs, tiling, |name| {
                generate_gemm(&cfg, name, sgs, rs, tiling)
            })?;
        let dope_stride2 = |dope: &DopeVector| {
            if vector && dope.dim() == 1 {
                [dope.stride(0), Expr::Int(0)]
            } else {
                [dope.stride(0), dope.stride(1)]
            }
        };
        let [as0, as1] = dope_stride2(&a_dope);
        let [bs0, bs1] = dope_stride2(&b_dope);
        let [cs0, cs1] = dope_stride2(&c_dope);
        let args = vec![
            c_dope.shape(0),
            if vector { Expr::Int(1) } else { c_dope.shape(1) },
            a_dope.shape(trans_a.mode(1)),
            self.scalar(blas.alpha)?,
            a_ptr,
            as0,
            as1,
            b_ptr,
            bs0,
            bs1,
            self.scalar(blas.beta)?,
            c_ptr,
            cs0,
            cs1,
        ];
        bb.expr(Expr::call(name, args));
        Ok(())
    }

    fn blas(
        &mut self,
        bb: &mut Block,
        inst: &Inst,
        kind: BlasKind,
        trans_a: Transpose,
        atomic: bool,
    ) -> Result<()> {
        let blas = inst
            .blas_operands()
            .ok_or_else(|| CompilationError::internal(format!("{} operands", kind.prefix())))?;
        let mut inputs = vec![self.memref(blas.a)?];
        if let Some(b) = blas.b {
            inputs.push(self.memref(b)?);
        }
        let (out_ptr, out_dope, out) = self.memref(blas.out)?;
        let (_, a_dope, a) = &inputs[0];

        let (shape, extents): (Vec<i64>, Vec<Expr>) = match kind {
            BlasKind::Ger => (
                out.shape.clone(),
                vec![out_dope.shape(0), out_dope.shape(1)],
            ),
            BlasKind::Hadamard => (out.shape.clone(), out_dope.shape.clone()),
            BlasKind::Sum if a.dim() == 2 => (
                vec![a.shape(trans_a.mode(0)), a.shape(trans_a.mode(1))],
                vec![a_dope.shape(trans_a.mode(0)), a_dope.shape(trans_a.mode(1))],
            ),
            BlasKind::Sum => (vec![a.shape(0)], vec![a_dope.shape(0)]),
        };
        let cfg = BlasConfig {
            kind,
            alpha_ty: self.coefficient_type(blas.alpha)?,
            beta_ty: self.coefficient_type(blas.beta)?,
            inputs: inputs
                .iter()
                .map(|(_, _, mr)| OperandLayout {
                    ty: mr.element,
                    stride: mr.stride.clone(),
                })
                .collect(),
            output: OperandLayout {
                ty: out.element,
                stride: out.stride.clone(),
            },
            trans_a,
            shape,
            alpha: self.fixed(blas.alpha),
            beta: self.fixed(blas.beta),
            atomic,
            c_addrspace: out.addrspace,
        };
        self.enable_atomics(atomic, out.element);

        let (sgs, tiling) = (self.subgroup_size, self.tiling);
        let name = self
            .session
            .device_function(&cfg.identifier(), sgs, tiling, |name| {
                generate_blas(&cfg, name, sgs, tiling)
            })?;
        let mut args = extents;
        args.push(self.scalar(blas.alpha)?);
        for (ptr, dope, _) in inputs {
            args.push(ptr);
            args.extend(dope.stride);
        }
        args.push(self.scalar(blas.beta)?);
        args.push(out_ptr);
        args.extend(out_dope.stride);
        bb.expr(Expr::call(name, args));
        Ok(())
    }
}

/// `barrier(...)` with the fences of `fence`.
fn barrier(fence: AddressSpaces) -> Expr {
    let flags = fence
        .iter()
        .map(|space| {
            Expr::var(match space {
                simtc_ir::AddressSpace::Global => "CLK_GLOBAL_MEM_FENCE",
                simtc_ir::AddressSpace::Local => "CLK_LOCAL_MEM_FENCE",
            })
        })
        .reduce(|a, b| Expr::binary(BinaryOp::BitOr, a, b))
        .unwrap_or(Expr::Int(0));
    Expr::call("barrier", vec![flags])
}

#[cfg(test)]
mod tests {
    use super::*;
    use simtc_backend_core::printer::print_module;
    use simtc_ir::{AddressSpace, ArithOp, Builder, CmpCondition, DYNAMIC, Extent, Slice};

    fn core() -> CoreConfig {
        CoreConfig::for_target("pvc").unwrap()
    }

    fn finish(mut f: Function, sgs: u32, wgs: [u32; 2]) -> Function {
        f.subgroup_size = sgs;
        f.work_group_size = wgs;
        f
    }

    fn emit(program: &Program) -> String {
        print_module(&emit_program(program, &core()).unwrap())
    }

    #[test]
    fn copy_kernel_with_dynamic_shape() {
        let mut p = Program::new();
        let mut f = Function::new("copy");
        let mt = p
            .types
            .memref(ScalarType::F32, &[DYNAMIC], &[], AddressSpace::Global, None)
            .unwrap();
        let a = f.add_param(mt, "A");
        let b = f.add_param(mt, "B");
        Builder::build_body(&mut p.types, &mut f, |bb| {
            bb.parallel(|bb| {
                let i = bb.builtin(Builtin::SubgroupLocalId)?;
                let i = bb.cast(i, ScalarType::Index)?;
                let x = bb.load(a, &[i])?;
                bb.store(StoreFlag::Regular, x, b, &[i])?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
        p.add_function(finish(f, 16, [16, 1])).unwrap();
        let text = emit(&p);
        assert!(
            text.contains("kernel __attribute__((reqd_work_group_size(16, 1, 1))) __attribute__((intel_reqd_sub_group_size(16))) void copy(global float* A, long A_shape0, global float* B, long B_shape0) {"),
            "{text}"
        );
        assert!(text.contains("int x = get_sub_group_local_id();"));
        assert!(text.contains("long x1 = (long)x;"));
        assert!(text.contains("float x2 = A[x1];"));
        assert!(text.contains("B[x1] = x2;"));
    }

    #[test]
    fn for_loop_carries_values() {
        let mut p = Program::new();
        let mut f = Function::new("acc");
        let mt = p
            .types
            .memref(ScalarType::F64, &[8], &[], AddressSpace::Global, None)
            .unwrap();
        let a = f.add_param(mt, "A");
        Builder::build_body(&mut p.types, &mut f, |bb| {
            let lb = bb.constant_index(0)?;
            let ub = bb.constant_index(8)?;
            let zero = bb.constant_float(0.0, ScalarType::F64)?;
            let sum = bb.for_loop(lb, ub, None, &[zero], |bb, params| {
                let x = bb.load(a, &[params[0]])?;
                let s = bb.arith(ArithOp::Add, params[1], x)?;
                bb.yield_values(&[s])?;
                Ok(())
            })?;
            bb.store(StoreFlag::Regular, sum[0], a, &[lb])?;
            Ok(())
        })
        .unwrap();
        p.add_function(finish(f, 16, [16, 1])).unwrap();
        let text = emit(&p);
        assert!(text.contains("double x = 0.0;"), "{text}");
        assert!(text.contains("for (long i = 0; i < 8; ++i) {"));
        assert!(text.contains("x = x2;"));
        assert!(text.contains("A[0] = x;"));
        assert!(text.contains("#pragma OPENCL EXTENSION cl_khr_fp64 : enable"));
    }

    #[test]
    fn if_with_results_declares_first() {
        let mut p = Program::new();
        let mut f = Function::new("select");
        let it = p.types.scalar(ScalarType::I32);
        let mt = p
            .types
            .memref(ScalarType::I32, &[1], &[], AddressSpace::Global, None)
            .unwrap();
        let x = f.add_param(it, "x");
        let out = f.add_param(mt, "out");
        Builder::build_body(&mut p.types, &mut f, |bb| {
            let zero = bb.constant_int(0, ScalarType::I32)?;
            let c = bb.cmp(CmpCondition::Gt, x, zero)?;
            let r = bb.if_else(
                c,
                &[it],
                |bb| {
                    bb.yield_values(&[x])?;
                    Ok(())
                },
                |bb| {
                    let n = bb.arith_unary(simtc_ir::UnaryOp::Neg, x)?;
                    bb.yield_values(&[n])?;
                    Ok(())
                },
            )?;
            let i = bb.constant_index(0)?;
            bb.store(StoreFlag::AtomicAdd, r[0], out, &[i])?;
            Ok(())
        })
        .unwrap();
        p.add_function(finish(f, 16, [16, 1])).unwrap();
        let text = emit(&p);
        assert!(text.contains("bool x1 = x > 0;"), "{text}");
        assert!(text.contains("int x2;\n"));
        assert!(text.contains("if (x1) {"));
        assert!(text.contains("x2 = x;"));
        assert!(text.contains("x2 = x3;"));
        assert!(text.contains("atomic_fetch_add_explicit((volatile global atomic_int*)&out[0], x2"));
    }

    #[test]
    fn subview_binds_dope_entries() {
        let mut p = Program::new();
        let mut f = Function::new("view");
        let mt = p
            .types
            .memref(ScalarType::F32, &[DYNAMIC, DYNAMIC], &[], AddressSpace::Global, None)
            .unwrap();
        let it = p.types.index();
        let a = f.add_param(mt, "A");
        let j = f.add_param(it, "j");
        Builder::build_body(&mut p.types, &mut f, |bb| {
            let slices = [
                Slice::Range {
                    offset: Extent::Static(2),
                    size: Extent::Infer,
                },
                Slice::Index(Extent::Dynamic),
            ];
            let v = bb.subview(a, &slices, &[j])?;
            bb.size(v, 0)?;
            let zero = bb.constant_index(0)?;
            bb.load(v, &[zero])?;
            Ok(())
        })
        .unwrap();
        p.add_function(finish(f, 16, [16, 1])).unwrap();
        let text = emit(&p);
        assert!(text.contains("void view(global float* A, long A_shape0, long A_shape1, long A_stride1, long j) {"), "{text}");
        assert!(text.contains("global float* view1 = A + (2 + j * A_stride1);"), "{text}");
        assert!(text.contains("long view1_shape0 = A_shape0 - 2;"));
    }

    #[test]
    fn gemm_is_memoized_across_kernels() {
        let mut p = Program::new();
        let mt = p
            .types
            .memref(ScalarType::F32, &[32, 32], &[], AddressSpace::Global, None)
            .unwrap();
        for name in ["k0", "k1"] {
            let mut f = Function::new(name);
            let a = f.add_param(mt, "A");
            let b = f.add_param(mt, "B");
            let c = f.add_param(mt, "C");
            Builder::build_body(&mut p.types, &mut f, |bb| {
                let one = bb.constant_float(1.0, ScalarType::F32)?;
                let zero = bb.constant_float(0.0, ScalarType::F32)?;
                bb.gemm(Transpose::N, Transpose::N, false, one, a, b, zero, c)?;
                Ok(())
            })
            .unwrap();
            p.add_function(finish(f, 16, [32, 2])).unwrap();
        }
        let module = emit_program(&p, &core()).unwrap();
        assert_eq!(module.functions.len(), 3);
        let gemm = &module.functions[0].name;
        assert!(gemm.starts_with("gemm_f32f32f32f32f32_An_Bn_M32_N32_K32_"), "{gemm}");
        let text = print_module(&module);
        assert_eq!(text.matches(&format!("{gemm}(32, 32, 32, 1.0f, A, 1, 32, B, 1, 32, 0.0f, C, 1, 32);")).count(), 2);
    }

    #[test]
    fn group_load_reads_entry_pointer() {
        let mut p = Program::new();
        let mut f = Function::new("batched");
        let mt = p
            .types
            .memref(ScalarType::F32, &[DYNAMIC], &[], AddressSpace::Global, None)
            .unwrap();
        let gt = p.types.group(mt, DYNAMIC, 0, None).unwrap();
        let g = f.add_param(gt, "G");
        Builder::build_body(&mut p.types, &mut f, |bb| {
            let id = bb.builtin(Builtin::GroupId)?;
            let m = bb.load(g, &[id])?;
            bb.size(m, 0)?;
            bb.size(g, 0)?;
            Ok(())
        })
        .unwrap();
        p.add_function(finish(f, 16, [16, 1])).unwrap();
        let text = emit(&p);
        assert!(
            text.contains("void batched(global float* global* G, global long* G_shape0, long G_size) {"),
            "{text}"
        );
        assert!(text.contains("long x = get_global_id(2);"));
        assert!(text.contains("global float* entry = G[x];"));
        assert!(text.contains("long entry_shape0 = G_shape0[x];"));
    }

    #[test]
    fn unlowered_foreach_is_internal_error() {
        let mut p = Program::new();
        let mut f = Function::new("raw");
        Builder::build_body(&mut p.types, &mut f, |bb| {
            let lb = bb.constant_index(0)?;
            let ub = bb.constant_index(4)?;
            bb.foreach(&[lb], &[ub], |_, _| Ok(()))?;
            Ok(())
        })
        .unwrap();
        p.add_function(finish(f, 16, [16, 1])).unwrap();
        let err = emit_program(&p, &core()).unwrap_err();
        assert_eq!(err.status, Status::InternalCompilerError);
    }

    #[test]
    fn missing_work_group_size_is_rejected() {
        let mut p = Program::new();
        p.add_function(Function::new("empty")).unwrap();
        let err = emit_program(&p, &core()).unwrap_err();
        assert_eq!(err.status, Status::UnsupportedWorkGroupSize);
    }

    #[test]
    fn barrier_fences() {
        let text = simtc_backend_core::printer::print_expr(&barrier(
            AddressSpaces::GLOBAL | AddressSpaces::LOCAL,
        ));
        assert_eq!(text, "barrier(CLK_GLOBAL_MEM_FENCE | CLK_LOCAL_MEM_FENCE)");
        let text = simtc_backend_core::printer::print_expr(&barrier(AddressSpaces::EMPTY));
        assert_eq!(text, "barrier(0)");
    }
}
