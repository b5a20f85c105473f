#![no_main]

use libfuzzer_sys::fuzz_target;
use simtc_backend_core::{Backend, BackendOptions};
use simtc_backend_opencl::OpenClBackend;
use simtc_ir::{
    AddressSpace, Builder, CoreConfig, DYNAMIC, Function, Program, ScalarType, Transpose,
};

const TYPES: [ScalarType; 6] = [
    ScalarType::I32,
    ScalarType::F16,
    ScalarType::F32,
    ScalarType::F64,
    ScalarType::C32,
    ScalarType::C64,
];

fn extent(byte: u8) -> i64 {
    match byte {
        0 => DYNAMIC,
        b => 1 + i64::from(b % 96),
    }
}

// Random GEMM configurations must compile or fail with an error, never panic.
fuzz_target!(|data: &[u8]| {
    let [ty, m, n, k, flags, core, ..] = *data else {
        return;
    };
    let ty = TYPES[usize::from(ty) % TYPES.len()];
    let (m, n, k) = (extent(m), extent(n), extent(k));
    let trans = |bit: u8| if flags & bit != 0 { Transpose::T } else { Transpose::N };
    let (trans_a, trans_b) = (trans(1), trans(2));
    let atomic = flags & 4 != 0;
    let beta = f64::from((flags >> 3) % 3);

    let a_shape = if trans_a == Transpose::T { [k, m] } else { [m, k] };
    let b_shape = if trans_b == Transpose::T { [n, k] } else { [k, n] };
    let mut program = Program::new();
    let Ok(at) = program.types.memref(ty, &a_shape, &[], AddressSpace::Global, None) else {
        return;
    };
    let Ok(bt) = program.types.memref(ty, &b_shape, &[], AddressSpace::Global, None) else {
        return;
    };
    let Ok(ct) = program.types.memref(ty, &[m, n], &[], AddressSpace::Global, None) else {
        return;
    };
    let mut f = Function::new("gemm");
    let a = f.add_param(at, "A");
    let b = f.add_param(bt, "B");
    let c = f.add_param(ct, "C");
    let built = Builder::build_body(&mut program.types, &mut f, |bb| {
        let (alpha, beta) = if ty.is_integer() {
            (bb.constant_int(1, ty)?, bb.constant_int(beta as i64, ty)?)
        } else {
            (bb.constant_float(1.0, ty)?, bb.constant_float(beta, ty)?)
        };
        bb.gemm(trans_a, trans_b, atomic, alpha, a, b, beta, c)?;
        Ok(())
    });
    if built.is_err() || program.add_function(f).is_err() {
        return;
    }

    let preset = ["pvc", "tgl", "generic"][usize::from(core) % 3];
    let Ok(core) = CoreConfig::for_target(preset) else {
        return;
    };
    let opts = BackendOptions {
        core,
        ..BackendOptions::default()
    };
    if let Ok(output) = OpenClBackend.compile(&program, &opts) {
        assert_eq!(output.kernels.len(), 1);
        assert!(output.text().is_some_and(|t| t.contains("kernel ")));
    }
});
