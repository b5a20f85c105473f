mod common;

use simtc_ir::{AddressSpace, Builder, Function, Program, ScalarType, Transpose};

fn single_kernel(
    program: &mut Program,
    name: &str,
    params: &[(simtc_ir::Handle<simtc_ir::Type>, &str)],
    body: impl FnOnce(&mut Builder<'_>, &[simtc_ir::Handle<simtc_ir::Value>]) -> simtc_ir::Result<()>,
) {
    let mut f = Function::new(name);
    let values: Vec<_> = params.iter().map(|&(ty, n)| f.add_param(ty, n)).collect();
    Builder::build_body(&mut program.types, &mut f, |bb| body(bb, &values)).unwrap();
    program.add_function(f).unwrap();
}

#[test]
fn ger_outer_product() {
    let mut program = Program::new();
    let x = common::global(&mut program, ScalarType::F32, &[32]);
    let y = common::global(&mut program, ScalarType::F32, &[16]);
    let c = common::global(&mut program, ScalarType::F32, &[32, 16]);
    single_kernel(&mut program, "ger", &[(x, "x"), (y, "y"), (c, "C")], |bb, v| {
        let one = bb.constant_float(1.0, ScalarType::F32)?;
        let zero = bb.constant_float(0.0, ScalarType::F32)?;
        bb.ger(false, one, v[0], v[1], zero, v[2])?;
        Ok(())
    });
    let output = common::compile(&program);
    let text = common::first_text(&output);
    assert!(text.contains("ger_f32f32f32f32f32_M32_N16_"), "{text}");
    assert!(text.contains("(32, 16, 1.0f, x, 1, y, 1, 0.0f, C, 1, 32);"));
}

#[test]
fn hadamard_on_vectors() {
    let mut program = Program::new();
    let v = common::global(&mut program, ScalarType::F64, &[100]);
    single_kernel(&mut program, "mul", &[(v, "a"), (v, "b"), (v, "c")], |bb, p| {
        let one = bb.constant_float(1.0, ScalarType::F64)?;
        let zero = bb.constant_float(0.0, ScalarType::F64)?;
        bb.hadamard(false, one, p[0], p[1], zero, p[2])?;
        Ok(())
    });
    let output = common::compile(&program);
    let text = common::first_text(&output);
    assert!(text.contains("hadamard_f64f64f64f64f64_M100_"), "{text}");
    assert!(text.contains("(100, 1.0, a, 1, b, 1, 0.0, c, 1);"));
}

#[test]
fn row_sum_of_transposed_matrix() {
    let mut program = Program::new();
    let at = common::global(&mut program, ScalarType::F32, &[8, 24]);
    let bt = common::global(&mut program, ScalarType::F32, &[24]);
    single_kernel(&mut program, "rowsum", &[(at, "A"), (bt, "B")], |bb, p| {
        let one = bb.constant_float(1.0, ScalarType::F32)?;
        let zero = bb.constant_float(0.0, ScalarType::F32)?;
        bb.sum(Transpose::T, false, one, p[0], zero, p[1])?;
        Ok(())
    });
    let output = common::compile(&program);
    let text = common::first_text(&output);
    assert!(text.contains("sum_f32f32f32f32_At_M24_K8_"), "{text}");
    assert!(text.contains("(24, 8, 1.0f, A, 1, 8, 0.0f, B, 1);"));
}

#[test]
fn vector_sum_reduces_over_work_group() {
    let mut program = Program::new();
    let at = common::global(&mut program, ScalarType::F32, &[1000]);
    let bt = common::global(&mut program, ScalarType::F32, &[]);
    single_kernel(&mut program, "total", &[(at, "A"), (bt, "out")], |bb, p| {
        let one = bb.constant_float(1.0, ScalarType::F32)?;
        let zero = bb.constant_float(0.0, ScalarType::F32)?;
        bb.sum(Transpose::N, false, one, p[0], zero, p[1])?;
        Ok(())
    });
    let output = common::compile(&program);
    let text = common::first_text(&output);
    assert!(text.contains("work_group_reduce_add("), "{text}");
}

#[test]
fn axpby_is_expanded_inline() {
    let mut program = Program::new();
    let mt = common::global(&mut program, ScalarType::F32, &[16, 16]);
    single_kernel(&mut program, "copy", &[(mt, "A"), (mt, "B")], |bb, p| {
        let one = bb.constant_float(1.0, ScalarType::F32)?;
        let zero = bb.constant_float(0.0, ScalarType::F32)?;
        bb.axpby(Transpose::N, false, one, p[0], zero, p[1])?;
        Ok(())
    });
    let output = common::compile(&program);
    let text = common::first_text(&output);
    assert_eq!(output.kernels.len(), 1);
    assert!(!text.contains("axpby_"), "{text}");
    assert!(text.contains("get_sub_group_local_id()"));
    assert!(text.contains("] = A["));
}

#[test]
fn local_scratch_gets_stack_and_barrier() {
    let mut program = Program::new();
    let gt = common::global(&mut program, ScalarType::F32, &[32]);
    let lt = program
        .types
        .memref(ScalarType::F32, &[32], &[], AddressSpace::Local, None)
        .unwrap();
    single_kernel(&mut program, "staged", &[(gt, "A"), (gt, "B")], |bb, p| {
        let one = bb.constant_float(1.0, ScalarType::F32)?;
        let zero = bb.constant_float(0.0, ScalarType::F32)?;
        let tmp = bb.alloca(lt)?;
        bb.axpby(Transpose::N, false, one, p[0], zero, tmp)?;
        bb.axpby(Transpose::N, false, one, tmp, zero, p[1])?;
        Ok(())
    });
    let output = common::compile(&program);
    let text = common::first_text(&output);
    assert!(output.kernels[0].scratch_size >= 128);
    assert!(text.contains("local uchar stack["), "{text}");
    assert!(text.contains("__attribute__((aligned(64)))"));
    assert!(text.contains("(local float*)"));
    assert!(text.contains("CLK_LOCAL_MEM_FENCE"));
}
