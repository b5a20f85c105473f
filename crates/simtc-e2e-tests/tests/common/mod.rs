use simtc_backend_core::{Backend, BackendError, BackendOptions, BackendOutput};
use simtc_backend_opencl::OpenClBackend;
use simtc_ir::{
    AddressSpace, Builder, CoreConfig, Function, Handle, Program, ScalarType, Transpose, Type,
};
use simtc_opt::{OptLevel, PassOptions};

/// Backend options for a named core preset at the given optimization level.
#[allow(dead_code)]
pub fn options(core: &str, opt_level: OptLevel) -> BackendOptions {
    BackendOptions {
        core: CoreConfig::for_target(core).expect("unknown core preset"),
        passes: PassOptions {
            opt_level,
            unsafe_fp_math: false,
        },
    }
}

/// Compiles with the OpenCL backend for the `pvc` preset at O1.
#[allow(dead_code)]
pub fn compile(program: &Program) -> BackendOutput {
    try_compile(program, &options("pvc", OptLevel::O1)).expect("backend compilation failed")
}

/// Like [`compile`] but returns a Result instead of panicking.
#[allow(dead_code)]
pub fn try_compile(program: &Program, opts: &BackendOptions) -> Result<BackendOutput, BackendError> {
    OpenClBackend.compile(program, opts)
}

/// The emitted kernel source, or the IR listing for the dump backend.
#[allow(dead_code)]
pub fn first_text(output: &BackendOutput) -> &str {
    &output.files[0].text
}

/// Global memref type of `ty` with canonical strides.
#[allow(dead_code)]
pub fn global(program: &mut Program, ty: ScalarType, shape: &[i64]) -> Handle<Type> {
    program
        .types
        .memref(ty, shape, &[], AddressSpace::Global, None)
        .expect("invalid memref")
}

/// Single-kernel GEMM program with literal alpha and beta.
#[allow(dead_code, clippy::too_many_arguments)]
pub fn gemm_program(
    ty: ScalarType,
    m: i64,
    n: i64,
    k: i64,
    trans_a: Transpose,
    trans_b: Transpose,
    atomic: bool,
    beta: f64,
) -> Program {
    let mut program = Program::new();
    let a_shape = if trans_a == Transpose::T { [k, m] } else { [m, k] };
    let b_shape = if trans_b == Transpose::T { [n, k] } else { [k, n] };
    let at = global(&mut program, ty, &a_shape);
    let bt = global(&mut program, ty, &b_shape);
    let ct = global(&mut program, ty, &[m, n]);
    let mut f = Function::new("gemm");
    let a = f.add_param(at, "A");
    let b = f.add_param(bt, "B");
    let c = f.add_param(ct, "C");
    Builder::build_body(&mut program.types, &mut f, |bb| {
        let alpha = bb.constant_float(1.0, ty)?;
        let beta = bb.constant_float(beta, ty)?;
        bb.gemm(trans_a, trans_b, atomic, alpha, a, b, beta, c)?;
        Ok(())
    })
    .expect("GEMM construction failed");
    program.add_function(f).expect("duplicate kernel");
    program
}
