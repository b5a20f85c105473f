mod common;

use simtc_ir::{ArithOp, Builder, DYNAMIC, Function, Program, ScalarType, StoreFlag};
use simtc_opt::OptLevel;

/// `B[i] = A[i] + 1` over a dynamic range, written with `foreach`.
fn increment_program() -> Program {
    let mut program = Program::new();
    let mt = common::global(&mut program, ScalarType::F32, &[DYNAMIC]);
    let mut f = Function::new("increment");
    let a = f.add_param(mt, "A");
    let b = f.add_param(mt, "B");
    Builder::build_body(&mut program.types, &mut f, |bb| {
        let from = bb.constant_index(0)?;
        let to = bb.size(a, 0)?;
        bb.foreach(&[from], &[to], |bb, iv| {
            let x = bb.load(a, &[iv[0]])?;
            let one = bb.constant_float(1.0, ScalarType::F32)?;
            let y = bb.arith(ArithOp::Add, x, one)?;
            bb.store(StoreFlag::Regular, y, b, &[iv[0]])?;
            Ok(())
        })?;
        Ok(())
    })
    .unwrap();
    program.add_function(f).unwrap();
    program
}

#[test]
fn foreach_is_lowered_to_subgroup_loops() {
    let output = common::compile(&increment_program());
    let text = common::first_text(&output);
    assert!(text.contains("void increment(global float* A, long A_shape0, global float* B, long B_shape0)"), "{text}");
    assert!(text.contains("get_sub_group_id()"));
    assert!(text.contains("get_sub_group_local_id()"));
    assert!(text.contains(" + 1.0f;"));
    assert!(text.contains("for (long "));
}

#[test]
fn every_opt_level_compiles() {
    let program = increment_program();
    for level in [OptLevel::O0, OptLevel::O1, OptLevel::O2] {
        let output = common::try_compile(&program, &common::options("pvc", level)).unwrap();
        assert_eq!(output.kernels.len(), 1, "O{level}");
    }
}

#[test]
fn constants_fold_above_o0() {
    let mut program = Program::new();
    let mt = common::global(&mut program, ScalarType::I32, &[4]);
    let mut f = Function::new("fold");
    let a = f.add_param(mt, "A");
    Builder::build_body(&mut program.types, &mut f, |bb| {
        let two = bb.constant_int(2, ScalarType::I32)?;
        let three = bb.constant_int(3, ScalarType::I32)?;
        let five = bb.arith(ArithOp::Add, two, three)?;
        let i = bb.constant_index(0)?;
        bb.store(StoreFlag::Regular, five, a, &[i])?;
        Ok(())
    })
    .unwrap();
    program.add_function(f).unwrap();

    let folded = common::try_compile(&program, &common::options("pvc", OptLevel::O1)).unwrap();
    let text = common::first_text(&folded);
    assert!(text.contains("A[0] = 5;"), "{text}");

    let plain = common::try_compile(&program, &common::options("pvc", OptLevel::O0)).unwrap();
    let text = common::first_text(&plain);
    assert!(text.contains("= 2 + 3;"), "{text}");
}

#[test]
fn backend_leaves_input_program_untouched() {
    let program = increment_program();
    let before = simtc_ir::dump_program(&program);
    common::compile(&program);
    assert_eq!(simtc_ir::dump_program(&program), before);
    assert_eq!(program.functions[0].subgroup_size, 0);
}
