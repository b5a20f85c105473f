mod common;

use simtc_backend_core::BackendError;
use simtc_ir::{Builder, DYNAMIC, Function, Program, ScalarType, Status, Transpose};
use simtc_opt::OptLevel;

#[test]
fn static_gemm_calls_generated_device_function() {
    let program = common::gemm_program(
        ScalarType::F32,
        64,
        64,
        64,
        Transpose::N,
        Transpose::N,
        false,
        0.0,
    );
    let output = common::compile(&program);
    let text = common::first_text(&output);

    let id = "gemm_f32f32f32f32f32_An_Bn_M64_N64_K64_Astride1_64_Bstride1_64_Cstride1_64_alpha3ff0000000000000_beta0";
    assert!(text.contains(&format!("void {id}(long M, long N, long K, ")), "{text}");
    assert!(text.contains(&format!("{id}(64, 64, 64, 1.0f, A, 1, 64, B, 1, 64, 0.0f, C, 1, 64);")));
    assert!(text.contains("void gemm(global float* A, global float* B, global float* C) {"));
    // Static K is a multiple of the unroll factor: no remainder loop.
    assert!(!text.contains("KmultipleKb"));
}

#[test]
fn launch_configuration_is_legal_for_the_core() {
    let program = common::gemm_program(
        ScalarType::F32,
        128,
        128,
        32,
        Transpose::N,
        Transpose::N,
        false,
        0.0,
    );
    for core in ["pvc", "tgl", "generic"] {
        let opts = common::options(core, OptLevel::O1);
        let output = common::try_compile(&program, &opts).unwrap();
        let kernel = &output.kernels[0];
        assert!(opts.core.supports_subgroup_size(kernel.subgroup_size));
        let [x, y] = kernel.work_group_size;
        assert_eq!(x % kernel.subgroup_size, 0);
        assert!(x * y <= opts.core.max_work_group_size);
        let header = format!(
            "reqd_work_group_size({x}, {y}, 1))) __attribute__((intel_reqd_sub_group_size({})))",
            kernel.subgroup_size
        );
        assert!(common::first_text(&output).contains(&header));
    }
}

#[test]
fn dynamic_gemm_threads_dope_vector() {
    let program = common::gemm_program(
        ScalarType::F64,
        DYNAMIC,
        DYNAMIC,
        DYNAMIC,
        Transpose::N,
        Transpose::N,
        false,
        1.0,
    );
    let output = common::compile(&program);
    let text = common::first_text(&output);
    assert!(text.contains("#pragma OPENCL EXTENSION cl_khr_fp64 : enable"));
    assert!(text.contains(
        "void gemm(global double* A, long A_shape0, long A_shape1, long A_stride1, \
         global double* B, long B_shape0, long B_shape1, long B_stride1, \
         global double* C, long C_shape0, long C_shape1, long C_stride1) {"
    ), "{text}");
    assert!(text.contains("_Md_Nd_Kd_Astride1_d_Bstride1_d_Cstride1_d_"));
    assert!(text.contains("(C_shape0, C_shape1, A_shape1, 1.0, A, 1, A_stride1, B, 1, B_stride1, 1.0, C, 1, C_stride1);"));
    // Dynamic K needs the remainder loop.
    assert!(text.contains("KmultipleKb"));
}

#[test]
fn transposed_operands_change_identifier() {
    let program = common::gemm_program(
        ScalarType::F32,
        32,
        16,
        8,
        Transpose::T,
        Transpose::T,
        false,
        0.0,
    );
    let output = common::compile(&program);
    let text = common::first_text(&output);
    assert!(text.contains("_At_Bt_M32_N16_K8_Astride1_8_Bstride1_16_"), "{text}");
}

#[test]
fn complex_gemm_uses_vector_registers() {
    let program = common::gemm_program(
        ScalarType::C32,
        32,
        32,
        32,
        Transpose::N,
        Transpose::N,
        false,
        0.0,
    );
    let output = common::compile(&program);
    let text = common::first_text(&output);
    assert!(text.contains("gemm_c32c32c32c32c32_"));
    assert!(text.contains("float2 c["), "{text}");
}

#[test]
fn atomic_gemm_enables_float_atomics() {
    let program = common::gemm_program(
        ScalarType::F32,
        32,
        32,
        32,
        Transpose::N,
        Transpose::N,
        true,
        1.0,
    );
    let output = common::compile(&program);
    let text = common::first_text(&output);
    assert!(text.contains("#pragma OPENCL EXTENSION cl_ext_float_atomics : enable"));
    assert!(text.contains("gemm_atomic_f32"));
    assert!(text.contains("atomic_fetch_add_explicit("));
}

#[test]
fn complex_atomic_with_runtime_beta_is_rejected() {
    let mut program = Program::new();
    let mt = common::global(&mut program, ScalarType::C64, &[16, 16]);
    let st = program.types.scalar(ScalarType::C64);
    let mut f = Function::new("zgemm");
    let a = f.add_param(mt, "A");
    let b = f.add_param(mt, "B");
    let beta = f.add_param(st, "beta");
    let c = f.add_param(mt, "C");
    Builder::build_body(&mut program.types, &mut f, |bb| {
        let alpha = bb.constant_float(1.0, ScalarType::C64)?;
        bb.gemm(Transpose::N, Transpose::N, true, alpha, a, b, beta, c)?;
        Ok(())
    })
    .unwrap();
    program.add_function(f).unwrap();

    let err = common::try_compile(&program, &common::options("pvc", OptLevel::O1)).unwrap_err();
    match err {
        BackendError::Compilation(e) => assert_eq!(e.status, Status::IrComplexUnsupported),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn gemv_uses_its_own_generator() {
    let mut program = Program::new();
    let at = common::global(&mut program, ScalarType::F32, &[64, 32]);
    let bt = common::global(&mut program, ScalarType::F32, &[32]);
    let ct = common::global(&mut program, ScalarType::F32, &[64]);
    let mut f = Function::new("gemv");
    let a = f.add_param(at, "A");
    let b = f.add_param(bt, "x");
    let c = f.add_param(ct, "y");
    Builder::build_body(&mut program.types, &mut f, |bb| {
        let one = bb.constant_float(1.0, ScalarType::F32)?;
        let zero = bb.constant_float(0.0, ScalarType::F32)?;
        bb.gemv(Transpose::N, false, one, a, b, zero, c)?;
        Ok(())
    })
    .unwrap();
    program.add_function(f).unwrap();

    let output = common::compile(&program);
    let text = common::first_text(&output);
    let id = "gemv_f32f32f32f32f32_An_Bn_M64_N1_K32_Astride1_64_Bstride1_0_Cstride1_0_";
    assert!(text.contains(id), "{text}");
    assert!(text.contains("(64, 1, 32, 1.0f, A, 1, 64, x, 1, 0, 0.0f, y, 1, 0);"));
}

#[test]
fn identical_gemms_share_one_device_function() {
    let mut program = Program::new();
    let mt = common::global(&mut program, ScalarType::F32, &[32, 32]);
    for name in ["first", "second"] {
        let mut f = Function::new(name);
        let a = f.add_param(mt, "A");
        let b = f.add_param(mt, "B");
        let c = f.add_param(mt, "C");
        Builder::build_body(&mut program.types, &mut f, |bb| {
            let one = bb.constant_float(1.0, ScalarType::F32)?;
            let zero = bb.constant_float(0.0, ScalarType::F32)?;
            bb.gemm(Transpose::N, Transpose::N, false, one, a, b, zero, c)?;
            bb.gemm(Transpose::N, Transpose::N, false, one, a, b, zero, c)?;
            Ok(())
        })
        .unwrap();
        program.add_function(f).unwrap();
    }
    let output = common::compile(&program);
    let text = common::first_text(&output);
    assert_eq!(text.matches("void gemm_f32f32f32f32f32_").count(), 1, "{text}");
    assert!(output.diagnostics.iter().any(|d| d.message == "1 BLAS device function(s) generated"));
}
