//! Integration test: build a batched GEMM kernel programmatically and verify
//! use-lists, region structure and the text dump.

use simtc_ir::*;

/// Builds
///
/// ```text
/// func @batched(%A: group<memref<f32x32x8>x?>, %B: memref<f32x8x16x?>, %C: memref<f32x32x16x?>) {
///   %gid = group_id
///   %a = load %A[%gid]
///   %b = subview %B[0:*,0:*,%gid]
///   %c = subview %C[0:*,0:*,%gid]
///   gemm.n.n %alpha, %a, %b, %beta, %c
/// }
/// ```
fn build_batched_gemm(program: &mut Program) -> Result<()> {
    let f32_ = ScalarType::F32;
    let a_ty = program
        .types
        .memref(f32_, &[32, 8], &[], AddressSpace::Global, None)?;
    let group_ty = program.types.group(a_ty, DYNAMIC, 0, None)?;
    let b_ty = program
        .types
        .memref(f32_, &[8, 16, DYNAMIC], &[], AddressSpace::Global, None)?;
    let c_ty = program
        .types
        .memref(f32_, &[32, 16, DYNAMIC], &[], AddressSpace::Global, None)?;

    let mut f = Function::new("batched");
    let a = f.add_param(group_ty, "A");
    let b = f.add_param(b_ty, "B");
    let c = f.add_param(c_ty, "C");
    let full = Slice::Range {
        offset: Extent::Static(0),
        size: Extent::Infer,
    };
    Builder::build_body(&mut program.types, &mut f, |bld| {
        bld.set_location(Some(Location::line(2, 3, 20)));
        let gid = bld.builtin(Builtin::GroupId)?;
        let a_view = bld.load(a, &[gid])?;
        let b_view = bld.subview(b, &[full, full, Slice::Index(Extent::Dynamic)], &[gid])?;
        let c_view = bld.subview(c, &[full, full, Slice::Index(Extent::Dynamic)], &[gid])?;
        let alpha = bld.constant_float(1.0, f32_)?;
        let beta = bld.constant_float(0.0, f32_)?;
        bld.gemm(
            Transpose::N,
            Transpose::N,
            false,
            alpha,
            a_view,
            b_view,
            beta,
            c_view,
        )?;
        Ok(())
    })?;
    program.add_function(f)
}

#[test]
fn batched_gemm_structure() {
    let mut program = Program::new();
    build_batched_gemm(&mut program).unwrap();

    let f = program.function("batched").unwrap();
    assert_eq!(f.params.len(), 3);
    assert_eq!(f.body.len(), 7);

    let last = *f.body.insts.last().unwrap();
    let gemm = f.inst(last);
    assert!(gemm.op.is_blas());
    assert_eq!(gemm.op.kind(), ExecKind::Collective);
    let blas = gemm.blas_operands().unwrap();
    assert_eq!(f.value(blas.out).uses().len(), 1);

    // The subview drops the batch mode and keeps the static extents.
    let c_view_ty = f.value_type(blas.out);
    let mr = program.types.memref_type(c_view_ty).unwrap();
    assert_eq!(mr.shape, vec![32, 16]);
    assert_eq!(mr.stride, vec![1, 32]);

    // group_id feeds the load and both subviews.
    let gid = f.inst(f.body.insts[0]).result().unwrap();
    assert_eq!(f.value(gid).uses().len(), 3);
    assert_eq!(f.inst(f.body.insts[0]).loc, Some(Location::line(2, 3, 20)));
}

#[test]
fn batched_gemm_dump() {
    let mut program = Program::new();
    build_batched_gemm(&mut program).unwrap();
    let text = dump_program(&program);
    assert!(text.contains("func @batched(%A: group<memref<f32x32x8>x?>"));
    assert!(text.contains("= group_id"));
    assert!(text.contains("subview %B[0:*,0:*,?]"));
    assert!(text.contains("gemm.n.n"));
}

#[test]
fn duplicate_function_names_are_rejected() {
    let mut program = Program::new();
    program.add_function(Function::new("k")).unwrap();
    let err = program.add_function(Function::new("k")).unwrap_err();
    assert_eq!(err.status, Status::IrDuplicateName);
}

#[test]
fn diagnostics_reach_the_sink() {
    let mut types = TypeContext::new();
    let mut f = Function::new("bad");
    let mut sink = CollectingSink::default();
    let mut builder = Builder::new(&mut types, &mut f).with_sink(&mut sink);
    builder.set_location(Some(Location::line(7, 5, 12)));
    let x = builder.constant_int(1, ScalarType::I32).unwrap();
    builder.cast(x, ScalarType::C32).unwrap();
    let y = builder.constant_float(1.0, ScalarType::F32).unwrap();
    let err = builder.arith(ArithOp::Add, x, y).unwrap_err();
    assert_eq!(err.status, Status::IrScalarMismatch);
    drop(builder);
    assert_eq!(sink.reports.len(), 1);
    let (loc, message) = &sink.reports[0];
    assert_eq!(*loc, Some(Location::line(7, 5, 12)));
    assert!(message.contains("scalar types of operands must match"));
}
