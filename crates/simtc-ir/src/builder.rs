//! Validating instruction builder.
//!
//! Every creation method checks operand categories, shapes, index counts and
//! execution-kind nesting. On a violation the error is reported to the
//! attached [`DiagnosticSink`] and returned; no instruction is created.

use crate::arena::Handle;
use crate::diagnostic::DiagnosticSink;
use crate::error::{CompilationError, Result, Status};
use crate::func::{Function, ValueMap};
use crate::inst::{
    ArithOp, Builtin, CmpCondition, ConstValue, ExecKind, Extent, Inst, Op, Slice, StoreFlag,
    Transpose, UnaryOp,
};
use crate::location::Location;
use crate::region::{Region, RegionKind};
use crate::types::{
    AddressSpace, AddressSpaces, DYNAMIC, MemrefType, ScalarType, Type, TypeContext,
    is_dynamic_value,
};
use crate::value::Value;

struct Frame {
    insts: Vec<Handle<Inst>>,
    /// Effective kind (never `Mixed`).
    kind: RegionKind,
    /// `true` for `for`/`if` bodies, where `yield` is legal.
    yields: bool,
}

/// Appends validated instructions to a function.
pub struct Builder<'a> {
    types: &'a mut TypeContext,
    func: &'a mut Function,
    frames: Vec<Frame>,
    loc: Option<Location>,
    sink: Option<&'a mut dyn DiagnosticSink>,
}

impl<'a> Builder<'a> {
    /// Creates a builder whose root region is collective (a function body).
    pub fn new(types: &'a mut TypeContext, func: &'a mut Function) -> Self {
        Self::with_kind(types, func, RegionKind::Collective)
    }

    /// Creates a builder whose root region has the given effective kind.
    pub fn with_kind(
        types: &'a mut TypeContext,
        func: &'a mut Function,
        kind: RegionKind,
    ) -> Self {
        let kind = kind.resolve(RegionKind::Collective);
        Self {
            types,
            func,
            frames: vec![Frame {
                insts: Vec::new(),
                kind,
                yields: false,
            }],
            loc: None,
            sink: None,
        }
    }

    /// Reports every construction error to `sink`.
    pub fn with_sink(mut self, sink: &'a mut dyn DiagnosticSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the body of `func` with `body` and appends it to `func.body`.
    pub fn build_body<F>(types: &mut TypeContext, func: &mut Function, body: F) -> Result<()>
    where
        F: FnOnce(&mut Builder<'_>) -> Result<()>,
    {
        let mut builder = Builder::new(types, func);
        body(&mut builder)?;
        let insts = builder.finish();
        func.body.insts.extend(insts);
        Ok(())
    }

    /// Location attached to subsequently created instructions.
    pub fn set_location(&mut self, loc: Option<Location>) {
        self.loc = loc;
    }

    pub fn types(&self) -> &TypeContext {
        &*self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeContext {
        &mut *self.types
    }

    pub fn func(&self) -> &Function {
        &*self.func
    }

    /// Consumes the builder and returns the instructions of the root region.
    pub fn finish(mut self) -> Vec<Handle<Inst>> {
        self.frames
            .drain(..)
            .next()
            .map(|frame| frame.insts)
            .unwrap_or_default()
    }

    fn current_kind(&self) -> RegionKind {
        self.frames
            .last()
            .map_or(RegionKind::Collective, |frame| frame.kind)
    }

    fn fail(&mut self, status: Status) -> CompilationError {
        self.fail_with(CompilationError::new(status))
    }

    fn fail_with(&mut self, err: CompilationError) -> CompilationError {
        let err = err.at(self.loc);
        if let Some(sink) = self.sink.as_deref_mut() {
            sink.report(err.location.as_ref(), &err.to_string());
        }
        err
    }

    fn value_ty(&self, value: Handle<Value>) -> &Type {
        self.types.get(self.func.value_type(value))
    }

    fn scalar_of(&mut self, value: Handle<Value>) -> Result<ScalarType> {
        match self.value_ty(value).as_scalar() {
            Some(ty) => Ok(ty),
            None => Err(self.fail(Status::IrExpectedScalar)),
        }
    }

    fn memref_of(&mut self, value: Handle<Value>) -> Result<MemrefType> {
        match self.value_ty(value).as_memref() {
            Some(mr) => Ok(mr.clone()),
            None => Err(self.fail(Status::IrExpectedMemref)),
        }
    }

    fn expect_index(&mut self, value: Handle<Value>) -> Result<()> {
        if self.value_ty(value).as_scalar() == Some(ScalarType::Index) {
            Ok(())
        } else {
            Err(self.fail(Status::IrExpectedIndex))
        }
    }

    fn expect_integer(&mut self, value: Handle<Value>) -> Result<ScalarType> {
        match self.value_ty(value).as_scalar() {
            Some(ty) if ty.is_integer() => Ok(ty),
            _ => Err(self.fail(Status::IrExpectedInteger)),
        }
    }

    fn add(
        &mut self,
        op: Op,
        operands: Vec<Handle<Value>>,
        result_types: &[Handle<Type>],
        regions: Vec<Region>,
    ) -> Result<Handle<Inst>> {
        let kind = self.current_kind();
        if !kind.admits(op.kind()) {
            let status = if op.kind() == ExecKind::Collective {
                Status::IrCollectiveCalledFromSpmd
            } else {
                Status::IrSpmdCalledFromCollective
            };
            return Err(self.fail_with(CompilationError::new(status).with_extra(op.mnemonic())));
        }
        let inst = self
            .func
            .create_inst(op, operands, result_types, regions, self.loc);
        if let Some(frame) = self.frames.last_mut() {
            frame.insts.push(inst);
        }
        Ok(inst)
    }

    fn add_value(
        &mut self,
        op: Op,
        operands: Vec<Handle<Value>>,
        result_type: Handle<Type>,
    ) -> Result<Handle<Value>> {
        let inst = self.add(op, operands, &[result_type], Vec::new())?;
        self.func
            .inst(inst)
            .result()
            .ok_or_else(|| CompilationError::internal("instruction without result"))
    }

    fn region<F>(
        &mut self,
        kind: RegionKind,
        params: Vec<Handle<Value>>,
        yields: bool,
        body: F,
    ) -> Result<Region>
    where
        F: FnOnce(&mut Self, &[Handle<Value>]) -> Result<()>,
    {
        let effective = kind.resolve(self.current_kind());
        self.frames.push(Frame {
            insts: Vec::new(),
            kind: effective,
            yields,
        });
        let res = body(self, &params);
        let insts = self.frames.pop().map(|f| f.insts).unwrap_or_default();
        if let Err(err) = res {
            for inst in insts {
                self.func.drop_uses(inst);
            }
            return Err(err);
        }
        Ok(Region {
            params,
            insts,
            kind,
        })
    }

    /// Checks that `region` ends in a `yield` matching `types` (or yields nothing).
    fn check_yield(&mut self, region: &Region, types: &[Handle<Type>]) -> Result<()> {
        let last_yield = region
            .insts
            .last()
            .filter(|&&h| self.func.inst(h).op == Op::Yield)
            .map(|&h| self.func.inst(h).operands().to_vec());
        let yielded = match last_yield {
            Some(values) => values,
            None if types.is_empty() => return Ok(()),
            None => return Err(self.fail(Status::IrYieldMismatch)),
        };
        let yielded_types: Vec<_> = yielded.iter().map(|&v| self.func.value_type(v)).collect();
        if yielded_types != types {
            return Err(self.fail(Status::IrYieldMismatch));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Scalar instructions
    // ---------------------------------------------------------------

    /// `constant` of type `ty`.
    pub fn constant(&mut self, value: ConstValue, ty: Handle<Type>) -> Result<Handle<Value>> {
        let ok = match (self.types.get(ty), value) {
            (Type::Bool, ConstValue::Bool(_)) => true,
            (Type::Scalar(s), ConstValue::Int(_)) => s.is_integer(),
            (Type::Scalar(s), ConstValue::Float(_)) => s.is_floating() || s.is_complex(),
            (Type::Scalar(s), ConstValue::Complex(..)) => s.is_complex(),
            _ => false,
        };
        if !ok {
            return Err(self.fail(Status::IrConstantMismatch));
        }
        let value = match (self.types.get(ty), value) {
            (Type::Scalar(s), ConstValue::Float(re)) if s.is_complex() => {
                ConstValue::Complex(re, 0.0)
            }
            _ => value,
        };
        self.add_value(Op::Constant(value), Vec::new(), ty)
    }

    pub fn constant_bool(&mut self, value: bool) -> Result<Handle<Value>> {
        let ty = self.types.bool();
        self.constant(ConstValue::Bool(value), ty)
    }

    pub fn constant_int(&mut self, value: i64, ty: ScalarType) -> Result<Handle<Value>> {
        let ty = self.types.scalar(ty);
        self.constant(ConstValue::Int(value), ty)
    }

    pub fn constant_index(&mut self, value: i64) -> Result<Handle<Value>> {
        self.constant_int(value, ScalarType::Index)
    }

    pub fn constant_float(&mut self, value: f64, ty: ScalarType) -> Result<Handle<Value>> {
        let ty = self.types.scalar(ty);
        self.constant(ConstValue::Float(value), ty)
    }

    /// Binary arithmetic; both operands must have the same type.
    pub fn arith(
        &mut self,
        op: ArithOp,
        a: Handle<Value>,
        b: Handle<Value>,
    ) -> Result<Handle<Value>> {
        let ty = self.func.value_type(a);
        if ty != self.func.value_type(b) {
            return Err(self.fail(Status::IrScalarMismatch));
        }
        match self.types.get(ty) {
            Type::Bool => {
                if !matches!(op, ArithOp::And | ArithOp::Or | ArithOp::Xor) {
                    return Err(self.fail(Status::IrBooleanUnsupported));
                }
            }
            Type::Scalar(s) => {
                let s = *s;
                if op.is_bitwise() && s.is_floating() {
                    return Err(self.fail(Status::IrFpUnsupported));
                }
                if s.is_complex()
                    && (op.is_bitwise() || matches!(op, ArithOp::Rem | ArithOp::Min | ArithOp::Max))
                {
                    return Err(self.fail(Status::IrComplexUnsupported));
                }
            }
            _ => return Err(self.fail(Status::IrExpectedScalar)),
        }
        self.add_value(Op::Arith(op), vec![a, b], ty)
    }

    /// Unary arithmetic.
    pub fn arith_unary(&mut self, op: UnaryOp, a: Handle<Value>) -> Result<Handle<Value>> {
        let ty = self.func.value_type(a);
        let result_ty = match (self.types.get(ty).clone(), op) {
            (Type::Bool, UnaryOp::Not) => ty,
            (Type::Bool, _) => return Err(self.fail(Status::IrBooleanUnsupported)),
            (Type::Scalar(_), UnaryOp::Neg) => ty,
            (Type::Scalar(s), UnaryOp::Not) => {
                if s.is_floating() {
                    return Err(self.fail(Status::IrFpUnsupported));
                }
                if s.is_complex() {
                    return Err(self.fail(Status::IrComplexUnsupported));
                }
                ty
            }
            (Type::Scalar(s), UnaryOp::Abs) => self.types.scalar(s.component_type()),
            (Type::Scalar(s), UnaryOp::Conj) if s.is_complex() => ty,
            (Type::Scalar(s), UnaryOp::Im | UnaryOp::Re) if s.is_complex() => {
                self.types.scalar(s.component_type())
            }
            (Type::Scalar(s), _) => {
                let status = if s.is_integer() {
                    Status::IrIntUnsupported
                } else {
                    Status::IrFpUnsupported
                };
                return Err(self.fail(status));
            }
            _ => return Err(self.fail(Status::IrExpectedScalar)),
        };
        self.add_value(Op::ArithUnary(op), vec![a], result_ty)
    }

    /// Converts a scalar to scalar type `to`.
    pub fn cast(&mut self, a: Handle<Value>, to: ScalarType) -> Result<Handle<Value>> {
        let from = self.scalar_of(a)?;
        if from.is_complex() && !to.is_complex() {
            return Err(self.fail(Status::IrForbiddenCast));
        }
        let ty = self.types.scalar(to);
        self.add_value(Op::Cast, vec![a], ty)
    }

    /// Comparison producing a boolean.
    pub fn cmp(
        &mut self,
        cond: CmpCondition,
        a: Handle<Value>,
        b: Handle<Value>,
    ) -> Result<Handle<Value>> {
        let ty = self.func.value_type(a);
        if ty != self.func.value_type(b) {
            return Err(self.fail(Status::IrScalarMismatch));
        }
        let equality = matches!(cond, CmpCondition::Eq | CmpCondition::Ne);
        match self.types.get(ty) {
            Type::Bool if !equality => return Err(self.fail(Status::IrBooleanUnsupported)),
            Type::Scalar(s) if s.is_complex() && !equality => {
                return Err(self.fail(Status::IrComplexUnsupported));
            }
            Type::Bool | Type::Scalar(_) => {}
            _ => return Err(self.fail(Status::IrExpectedScalar)),
        }
        let bool_ty = self.types.bool();
        self.add_value(Op::Cmp(cond), vec![a, b], bool_ty)
    }

    /// Work-item query.
    pub fn builtin(&mut self, builtin: Builtin) -> Result<Handle<Value>> {
        let ty = match builtin {
            Builtin::GroupId | Builtin::NumGroups => self.types.index(),
            _ => self.types.scalar(ScalarType::I32),
        };
        self.add_value(Op::Builtin(builtin), Vec::new(), ty)
    }

    // ---------------------------------------------------------------
    // Memory instructions
    // ---------------------------------------------------------------

    fn check_static_index(&mut self, index: Handle<Value>, extent: i64) -> Result<()> {
        if let Some(ConstValue::Int(i)) = self.func.constant_value(index) {
            if i < 0 || (!is_dynamic_value(extent) && i >= extent) {
                return Err(self.fail(Status::IrOutOfBounds));
            }
        }
        Ok(())
    }

    /// Loads an element of a memref or a memref of a group.
    pub fn load(&mut self, operand: Handle<Value>, indices: &[Handle<Value>]) -> Result<Handle<Value>> {
        let (result_ty, extents) = match self.value_ty(operand).clone() {
            Type::Memref(mr) => (self.types.scalar(mr.element), mr.shape.clone()),
            Type::Group(g) => (g.memref, vec![g.size]),
            _ => return Err(self.fail(Status::IrExpectedMemrefOrGroup)),
        };
        if indices.len() != extents.len() {
            return Err(self.fail(Status::IrInvalidNumberOfIndices));
        }
        for (&index, &extent) in indices.iter().zip(&extents) {
            self.expect_index(index)?;
            self.check_static_index(index, extent)?;
        }
        let mut operands = vec![operand];
        operands.extend_from_slice(indices);
        self.add_value(Op::Load, operands, result_ty)
    }

    /// Stores a scalar into a memref.
    pub fn store(
        &mut self,
        flag: StoreFlag,
        value: Handle<Value>,
        memref: Handle<Value>,
        indices: &[Handle<Value>],
    ) -> Result<Handle<Inst>> {
        let mr = self.memref_of(memref)?;
        let vt = self.scalar_of(value)?;
        if vt != mr.element {
            return Err(self.fail(Status::IrScalarMismatch));
        }
        if indices.len() != mr.dim() {
            return Err(self.fail(Status::IrInvalidNumberOfIndices));
        }
        for (&index, &extent) in indices.iter().zip(&mr.shape) {
            self.expect_index(index)?;
            self.check_static_index(index, extent)?;
        }
        let mut operands = vec![value, memref];
        operands.extend_from_slice(indices);
        self.add(Op::Store(flag), operands, &[], Vec::new())
    }

    fn check_dynamic_operands(&mut self, expected: usize, dynamic: &[Handle<Value>]) -> Result<()> {
        if expected != dynamic.len() {
            return Err(self.fail_with(
                CompilationError::new(Status::InvalidArguments)
                    .with_extra(format!("expected {expected} dynamic operands")),
            ));
        }
        for &value in dynamic {
            self.expect_index(value)?;
        }
        Ok(())
    }

    /// A view on a slice of `operand`.
    pub fn subview(
        &mut self,
        operand: Handle<Value>,
        slices: &[Slice],
        dynamic: &[Handle<Value>],
    ) -> Result<Handle<Value>> {
        let mr = self.memref_of(operand)?;
        if slices.len() != mr.dim() {
            return Err(self.fail(Status::IrInvalidNumberOfIndices));
        }
        let mut dynamic_count = 0;
        let mut shape = Vec::new();
        let mut stride = Vec::new();
        for (mode, slice) in slices.iter().enumerate() {
            let extent = mr.shape[mode];
            let (offset, size) = match *slice {
                Slice::Index(offset) => (offset, None),
                Slice::Range { offset, size } => (offset, Some(size)),
            };
            let offset = match offset {
                Extent::Static(o) if o < 0 => return Err(self.fail(Status::IrInvalidSlice)),
                Extent::Static(o) => {
                    if !is_dynamic_value(extent) && o >= extent && size.is_none() {
                        return Err(self.fail(Status::IrOutOfBounds));
                    }
                    Some(o)
                }
                Extent::Dynamic => {
                    dynamic_count += 1;
                    None
                }
                Extent::Infer => return Err(self.fail(Status::IrInvalidSlice)),
            };
            let Some(size) = size else { continue };
            let size = match size {
                Extent::Static(s) if s < 0 => return Err(self.fail(Status::IrInvalidSlice)),
                Extent::Static(s) => {
                    if let Some(o) = offset {
                        if !is_dynamic_value(extent) && o + s > extent {
                            return Err(self.fail(Status::IrOutOfBounds));
                        }
                    }
                    s
                }
                Extent::Dynamic => {
                    dynamic_count += 1;
                    DYNAMIC
                }
                Extent::Infer => match offset {
                    Some(o) if !is_dynamic_value(extent) => {
                        if o > extent {
                            return Err(self.fail(Status::IrOutOfBounds));
                        }
                        extent - o
                    }
                    _ => DYNAMIC,
                },
            };
            shape.push(size);
            stride.push(mr.stride[mode]);
        }
        self.check_dynamic_operands(dynamic_count, dynamic)?;
        let result_ty = self.types.memref_from(MemrefType {
            element: mr.element,
            shape,
            stride,
            addrspace: mr.addrspace,
        });
        let mut operands = vec![operand];
        operands.extend_from_slice(dynamic);
        self.add_value(
            Op::Subview {
                slices: slices.to_vec(),
            },
            operands,
            result_ty,
        )
    }

    /// Splits mode `mode` of `operand` into `shape.len()` modes.
    pub fn expand(
        &mut self,
        operand: Handle<Value>,
        mode: u32,
        shape: &[Extent],
        dynamic: &[Handle<Value>],
    ) -> Result<Handle<Value>> {
        let mr = self.memref_of(operand)?;
        let m = mode as usize;
        if m >= mr.dim() {
            return Err(self.fail(Status::IrOutOfBounds));
        }
        if shape.len() < 2 {
            return Err(self.fail(Status::IrExpandShapeOrderTooSmall));
        }
        if shape.iter().filter(|e| **e == Extent::Infer).count() > 1 {
            return Err(self.fail(Status::IrMultipleDynamicModes));
        }
        if shape
            .iter()
            .any(|e| matches!(e, Extent::Static(s) if *s < 0))
        {
            return Err(self.fail(Status::IrInvalidShape));
        }
        let dynamic_count = shape.iter().filter(|e| e.is_dynamic()).count();
        self.check_dynamic_operands(dynamic_count, dynamic)?;

        let parent = mr.shape[m];
        let static_product: i64 = shape
            .iter()
            .filter_map(|e| match e {
                Extent::Static(s) => Some(*s),
                _ => None,
            })
            .product();
        let inferable = !is_dynamic_value(parent) && !shape.iter().any(|e| e.is_dynamic());
        let mut expanded = Vec::with_capacity(shape.len());
        for e in shape {
            expanded.push(match e {
                Extent::Static(s) => *s,
                Extent::Dynamic => DYNAMIC,
                Extent::Infer if inferable => {
                    if static_product == 0 || parent % static_product != 0 {
                        return Err(self.fail(Status::IrExpandShapeMismatch));
                    }
                    parent / static_product
                }
                Extent::Infer => DYNAMIC,
            });
        }
        if !is_dynamic_value(parent) && expanded.iter().all(|&s| !is_dynamic_value(s)) {
            let product: i64 = expanded.iter().product();
            if product != parent {
                return Err(self.fail(Status::IrExpandShapeMismatch));
            }
        }

        let mut new_shape = mr.shape[..m].to_vec();
        let mut new_stride = mr.stride[..m].to_vec();
        let mut s = mr.stride[m];
        for &extent in &expanded {
            new_shape.push(extent);
            new_stride.push(s);
            s = if is_dynamic_value(s) || is_dynamic_value(extent) {
                DYNAMIC
            } else {
                s * extent
            };
        }
        new_shape.extend_from_slice(&mr.shape[m + 1..]);
        new_stride.extend_from_slice(&mr.stride[m + 1..]);

        let result_ty = self.types.memref_from(MemrefType {
            element: mr.element,
            shape: new_shape,
            stride: new_stride,
            addrspace: mr.addrspace,
        });
        let mut operands = vec![operand];
        operands.extend_from_slice(dynamic);
        self.add_value(
            Op::Expand {
                mode,
                shape: shape.to_vec(),
            },
            operands,
            result_ty,
        )
    }

    /// Fuses modes `from..=to` of `operand` into one mode.
    pub fn fuse(&mut self, operand: Handle<Value>, from: u32, to: u32) -> Result<Handle<Value>> {
        let mr = self.memref_of(operand)?;
        let (f, t) = (from as usize, to as usize);
        if f >= t || t >= mr.dim() {
            return Err(self.fail(Status::IrInvalidFusionRange));
        }
        for i in f..t {
            let (s0, s1, n) = (mr.stride[i], mr.stride[i + 1], mr.shape[i]);
            if [s0, s1, n].iter().all(|&v| !is_dynamic_value(v)) && s1 != s0 * n {
                return Err(self.fail_with(
                    CompilationError::new(Status::IrInvalidFusionRange)
                        .with_extra("modes are not contiguous"),
                ));
            }
        }
        let fused = mr.shape[f..=t].iter().try_fold(1_i64, |acc, &s| {
            (!is_dynamic_value(s)).then_some(acc * s)
        });
        let mut shape = mr.shape[..f].to_vec();
        shape.push(fused.unwrap_or(DYNAMIC));
        shape.extend_from_slice(&mr.shape[t + 1..]);
        let mut stride = mr.stride[..=f].to_vec();
        stride.extend_from_slice(&mr.stride[t + 1..]);
        let result_ty = self.types.memref_from(MemrefType {
            element: mr.element,
            shape,
            stride,
            addrspace: mr.addrspace,
        });
        self.add_value(Op::Fuse { from, to }, vec![operand], result_ty)
    }

    /// Extent of mode `mode` of a memref, or the size of a group.
    pub fn size(&mut self, operand: Handle<Value>, mode: u32) -> Result<Handle<Value>> {
        let order = match self.value_ty(operand) {
            Type::Memref(mr) => mr.dim(),
            Type::Group(_) => 1,
            _ => return Err(self.fail(Status::IrExpectedMemrefOrGroup)),
        };
        if mode as usize >= order {
            return Err(self.fail(Status::IrOutOfBounds));
        }
        let index = self.types.index();
        self.add_value(Op::Size { mode }, vec![operand], index)
    }

    /// Allocates a work-group local scratch memref.
    pub fn alloca(&mut self, ty: Handle<Type>) -> Result<Handle<Value>> {
        let Some(mr) = self.types.get(ty).as_memref() else {
            return Err(self.fail(Status::IrExpectedMemref));
        };
        if mr.addrspace != AddressSpace::Local {
            return Err(self.fail(Status::IrExpectedLocalAddressSpace));
        }
        if mr.is_dynamic() {
            return Err(self.fail_with(
                CompilationError::new(Status::IrInvalidShape).with_extra("alloca must be static"),
            ));
        }
        self.add_value(Op::Alloca { stack_ptr: None }, Vec::new(), ty)
    }

    /// Ends the lifetime of an `alloca` result.
    pub fn lifetime_stop(&mut self, value: Handle<Value>) -> Result<Handle<Inst>> {
        if !matches!(self.func.defining_op(value), Some(Op::Alloca { .. })) {
            return Err(self.fail_with(
                CompilationError::new(Status::InvalidArguments)
                    .with_extra("lifetime_stop expects an alloca result"),
            ));
        }
        self.add(Op::LifetimeStop, vec![value], &[], Vec::new())
    }

    /// Work-group barrier with memory fences for `fence`.
    pub fn barrier(&mut self, fence: AddressSpaces) -> Result<Handle<Inst>> {
        self.add(Op::Barrier(fence), Vec::new(), &[], Vec::new())
    }

    // ---------------------------------------------------------------
    // BLAS instructions
    // ---------------------------------------------------------------

    fn check_blas_scalars(
        &mut self,
        alpha: Handle<Value>,
        beta: Handle<Value>,
        inputs: &[&MemrefType],
        out: &MemrefType,
    ) -> Result<()> {
        let alpha_ty = self.scalar_of(alpha)?;
        let beta_ty = self.scalar_of(beta)?;
        let promotable = inputs
            .iter()
            .map(|m| m.element)
            .chain([alpha_ty, beta_ty])
            .all(|ty| ty.promotable(out.element));
        if !promotable {
            return Err(self.fail(Status::IrForbiddenPromotion));
        }
        Ok(())
    }

    fn check_order(&mut self, mr: &MemrefType, order: usize) -> Result<()> {
        if mr.dim() != order {
            return Err(self.fail_with(
                CompilationError::new(Status::IrExpectedVectorOrMatrix)
                    .with_extra(format!("expected order {order}, got {}", mr.dim())),
            ));
        }
        Ok(())
    }

    fn check_extent(&mut self, a: i64, b: i64) -> Result<()> {
        if !is_dynamic_value(a) && !is_dynamic_value(b) && a != b {
            return Err(self.fail_with(
                CompilationError::new(Status::IrIncompatibleShapes)
                    .with_extra(format!("{a} != {b}")),
            ));
        }
        Ok(())
    }

    /// `B := alpha * op(A) + beta * B`.
    pub fn axpby(
        &mut self,
        trans_a: Transpose,
        atomic: bool,
        alpha: Handle<Value>,
        a: Handle<Value>,
        beta: Handle<Value>,
        b: Handle<Value>,
    ) -> Result<Handle<Inst>> {
        let am = self.memref_of(a)?;
        let bm = self.memref_of(b)?;
        if bm.dim() > 2 {
            return Err(self.fail(Status::IrExpectedVectorOrMatrix));
        }
        self.check_order(&am, bm.dim())?;
        for mode in 0..bm.dim() {
            let a_mode = if bm.dim() == 2 { trans_a.mode(mode) } else { mode };
            self.check_extent(am.shape[a_mode], bm.shape[mode])?;
        }
        self.check_blas_scalars(alpha, beta, &[&am], &bm)?;
        self.add(
            Op::Axpby { atomic, trans_a },
            vec![alpha, a, beta, b],
            &[],
            Vec::new(),
        )
    }

    /// `C := alpha * op(A) * op(B) + beta * C`.
    #[allow(clippy::too_many_arguments)]
    pub fn gemm(
        &mut self,
        trans_a: Transpose,
        trans_b: Transpose,
        atomic: bool,
        alpha: Handle<Value>,
        a: Handle<Value>,
        b: Handle<Value>,
        beta: Handle<Value>,
        c: Handle<Value>,
    ) -> Result<Handle<Inst>> {
        let am = self.memref_of(a)?;
        let bm = self.memref_of(b)?;
        let cm = self.memref_of(c)?;
        self.check_order(&am, 2)?;
        self.check_order(&bm, 2)?;
        self.check_order(&cm, 2)?;
        let k = am.shape[trans_a.mode(1)];
        self.check_extent(am.shape[trans_a.mode(0)], cm.shape[0])?;
        self.check_extent(bm.shape[trans_b.mode(0)], k)?;
        self.check_extent(bm.shape[trans_b.mode(1)], cm.shape[1])?;
        self.check_blas_scalars(alpha, beta, &[&am, &bm], &cm)?;
        self.add(
            Op::Gemm {
                atomic,
                trans_a,
                trans_b,
            },
            vec![alpha, a, b, beta, c],
            &[],
            Vec::new(),
        )
    }

    /// `c := alpha * op(A) * b + beta * c`.
    #[allow(clippy::too_many_arguments)]
    pub fn gemv(
        &mut self,
        trans_a: Transpose,
        atomic: bool,
        alpha: Handle<Value>,
        a: Handle<Value>,
        b: Handle<Value>,
        beta: Handle<Value>,
        c: Handle<Value>,
    ) -> Result<Handle<Inst>> {
        let am = self.memref_of(a)?;
        let bm = self.memref_of(b)?;
        let cm = self.memref_of(c)?;
        self.check_order(&am, 2)?;
        self.check_order(&bm, 1)?;
        self.check_order(&cm, 1)?;
        self.check_extent(am.shape[trans_a.mode(0)], cm.shape[0])?;
        self.check_extent(am.shape[trans_a.mode(1)], bm.shape[0])?;
        self.check_blas_scalars(alpha, beta, &[&am, &bm], &cm)?;
        self.add(
            Op::Gemv { atomic, trans_a },
            vec![alpha, a, b, beta, c],
            &[],
            Vec::new(),
        )
    }

    /// `C := alpha * a * b^T + beta * C`.
    pub fn ger(
        &mut self,
        atomic: bool,
        alpha: Handle<Value>,
        a: Handle<Value>,
        b: Handle<Value>,
        beta: Handle<Value>,
        c: Handle<Value>,
    ) -> Result<Handle<Inst>> {
        let am = self.memref_of(a)?;
        let bm = self.memref_of(b)?;
        let cm = self.memref_of(c)?;
        self.check_order(&am, 1)?;
        self.check_order(&bm, 1)?;
        self.check_order(&cm, 2)?;
        self.check_extent(am.shape[0], cm.shape[0])?;
        self.check_extent(bm.shape[0], cm.shape[1])?;
        self.check_blas_scalars(alpha, beta, &[&am, &bm], &cm)?;
        self.add(
            Op::Ger { atomic },
            vec![alpha, a, b, beta, c],
            &[],
            Vec::new(),
        )
    }

    /// `C := alpha * A .* B + beta * C` (element-wise product).
    pub fn hadamard(
        &mut self,
        atomic: bool,
        alpha: Handle<Value>,
        a: Handle<Value>,
        b: Handle<Value>,
        beta: Handle<Value>,
        c: Handle<Value>,
    ) -> Result<Handle<Inst>> {
        let am = self.memref_of(a)?;
        let bm = self.memref_of(b)?;
        let cm = self.memref_of(c)?;
        if cm.dim() == 0 || cm.dim() > 2 {
            return Err(self.fail(Status::IrExpectedVectorOrMatrix));
        }
        self.check_order(&am, cm.dim())?;
        self.check_order(&bm, cm.dim())?;
        for mode in 0..cm.dim() {
            self.check_extent(am.shape[mode], cm.shape[mode])?;
            self.check_extent(bm.shape[mode], cm.shape[mode])?;
        }
        self.check_blas_scalars(alpha, beta, &[&am, &bm], &cm)?;
        self.add(
            Op::Hadamard { atomic },
            vec![alpha, a, b, beta, c],
            &[],
            Vec::new(),
        )
    }

    /// `b := alpha * sum(op(A), 1) + beta * b`; a vector `A` reduces to a scalar `b`.
    pub fn sum(
        &mut self,
        trans_a: Transpose,
        atomic: bool,
        alpha: Handle<Value>,
        a: Handle<Value>,
        beta: Handle<Value>,
        b: Handle<Value>,
    ) -> Result<Handle<Inst>> {
        let am = self.memref_of(a)?;
        let bm = self.memref_of(b)?;
        if am.dim() == 0 || am.dim() > 2 {
            return Err(self.fail(Status::IrExpectedVectorOrMatrix));
        }
        self.check_order(&bm, am.dim() - 1)?;
        if am.dim() == 2 {
            self.check_extent(am.shape[trans_a.mode(0)], bm.shape[0])?;
        }
        self.check_blas_scalars(alpha, beta, &[&am], &bm)?;
        self.add(
            Op::Sum { atomic, trans_a },
            vec![alpha, a, beta, b],
            &[],
            Vec::new(),
        )
    }

    /// Appends deep clones of `insts` to the current region.
    ///
    /// Operands found in `map` are substituted; the clones are not re-validated.
    pub fn clone_insts(&mut self, insts: &[Handle<Inst>], map: &mut ValueMap) {
        for &inst in insts {
            let clone = self.func.clone_inst(inst, map);
            if let Some(frame) = self.frames.last_mut() {
                frame.insts.push(clone);
            }
        }
    }

    // ---------------------------------------------------------------
    // Control flow
    // ---------------------------------------------------------------

    /// `for` loop over `[from, to)` with loop-carried values initialized by `init`.
    ///
    /// `body` receives the loop variable followed by the loop-carried values.
    pub fn for_loop<F>(
        &mut self,
        from: Handle<Value>,
        to: Handle<Value>,
        step: Option<Handle<Value>>,
        init: &[Handle<Value>],
        body: F,
    ) -> Result<Vec<Handle<Value>>>
    where
        F: FnOnce(&mut Self, &[Handle<Value>]) -> Result<()>,
    {
        self.expect_integer(from)?;
        let ty = self.func.value_type(from);
        let bounds = [Some(to), step];
        for value in bounds.into_iter().flatten() {
            if self.func.value_type(value) != ty {
                return Err(self.fail(Status::IrScalarMismatch));
            }
        }
        let carried: Vec<_> = init.iter().map(|&v| self.func.value_type(v)).collect();
        let mut params = vec![self.func.new_value(ty, self.loc)];
        for &t in &carried {
            params.push(self.func.new_value(t, self.loc));
        }
        let region = self.region(RegionKind::Mixed, params, true, body)?;
        self.check_yield(&region, &carried)?;
        let mut operands = vec![from, to];
        operands.extend(step);
        operands.extend_from_slice(init);
        let inst = self.add(
            Op::For {
                has_step: step.is_some(),
            },
            operands,
            &carried,
            vec![region],
        )?;
        Ok(self.func.inst(inst).results().to_vec())
    }

    /// `for` loop without loop-carried values.
    pub fn for_range<F>(
        &mut self,
        from: Handle<Value>,
        to: Handle<Value>,
        step: Option<Handle<Value>>,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Self, Handle<Value>) -> Result<()>,
    {
        self.for_loop(from, to, step, &[], |b, params| body(b, params[0]))?;
        Ok(())
    }

    /// `if`/`else` producing values of `result_types` through `yield`.
    pub fn if_else<T, E>(
        &mut self,
        condition: Handle<Value>,
        result_types: &[Handle<Type>],
        then: T,
        otherwise: E,
    ) -> Result<Vec<Handle<Value>>>
    where
        T: FnOnce(&mut Self) -> Result<()>,
        E: FnOnce(&mut Self) -> Result<()>,
    {
        if !self.value_ty(condition).is_bool() {
            return Err(self.fail(Status::IrExpectedBoolean));
        }
        let then_region = self.region(RegionKind::Mixed, Vec::new(), true, |b, _| then(b))?;
        self.check_yield(&then_region, result_types)?;
        let else_region = self.region(RegionKind::Mixed, Vec::new(), true, |b, _| otherwise(b))?;
        self.check_yield(&else_region, result_types)?;
        let inst = self.add(
            Op::If,
            vec![condition],
            result_types,
            vec![then_region, else_region],
        )?;
        Ok(self.func.inst(inst).results().to_vec())
    }

    /// `if` without else branch and results.
    pub fn if_then<T>(&mut self, condition: Handle<Value>, then: T) -> Result<()>
    where
        T: FnOnce(&mut Self) -> Result<()>,
    {
        self.if_else(condition, &[], then, |_| Ok(()))?;
        Ok(())
    }

    /// Terminates a `for` or `if` body, passing `values` to the parent.
    pub fn yield_values(&mut self, values: &[Handle<Value>]) -> Result<Handle<Inst>> {
        if !self.frames.last().is_some_and(|frame| frame.yields) {
            return Err(self.fail(Status::IrUnexpectedYield));
        }
        self.add(Op::Yield, values.to_vec(), &[], Vec::new())
    }

    /// Data-parallel loop over a 1-D or 2-D index space.
    pub fn foreach<F>(
        &mut self,
        from: &[Handle<Value>],
        to: &[Handle<Value>],
        body: F,
    ) -> Result<Handle<Inst>>
    where
        F: FnOnce(&mut Self, &[Handle<Value>]) -> Result<()>,
    {
        if from.is_empty() || from.len() > 2 || from.len() != to.len() {
            return Err(self.fail_with(
                CompilationError::new(Status::InvalidArguments)
                    .with_extra("foreach expects one or two (from, to) pairs"),
            ));
        }
        let mut params = Vec::with_capacity(from.len());
        for (&f, &t) in from.iter().zip(to) {
            self.expect_integer(f)?;
            let ty = self.func.value_type(f);
            if self.func.value_type(t) != ty {
                return Err(self.fail(Status::IrScalarMismatch));
            }
            params.push(self.func.new_value(ty, self.loc));
        }
        // Kind check before building the body so nesting errors point at the foreach.
        if !self.current_kind().admits(ExecKind::Collective) {
            return Err(self.fail_with(
                CompilationError::new(Status::IrCollectiveCalledFromSpmd).with_extra("foreach"),
            ));
        }
        let region = self.region(RegionKind::Spmd, params, false, body)?;
        let mut operands = from.to_vec();
        operands.extend_from_slice(to);
        self.add(
            Op::Foreach {
                dim: from.len() as u32,
            },
            operands,
            &[],
            vec![region],
        )
    }

    /// SPMD region executed by every lane of the work-group.
    pub fn parallel<F>(&mut self, body: F) -> Result<Handle<Inst>>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let region = self.region(RegionKind::Spmd, Vec::new(), false, |b, _| body(b))?;
        self.add(Op::Parallel, Vec::new(), &[], vec![region])
    }
}
