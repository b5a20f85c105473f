//! IR checking pass.
//!
//! Re-validates structural invariants that passes and hand-assembled IR can
//! break after construction. This pass never modifies the program.

use simtc_ir::{
    CompilationError, ExecKind, Function, Handle, Op, Program, Region, RegionKind, Result, Status,
    Type, TypeContext, Value,
};

use crate::Pass;

/// Checks execution-kind nesting, memref arity, yield placement and foreach rank.
#[derive(Debug)]
pub struct CheckIr;

impl Pass for CheckIr {
    fn name(&self) -> &str {
        "check-ir"
    }

    fn run(&self, program: &mut Program) -> Result<bool> {
        for func in &program.functions {
            for &param in &func.params {
                check_value(func, &program.types, param)?;
            }
            check_region(func, &program.types, &func.body, func.body.kind, false)?;
        }
        Ok(false)
    }
}

fn check_value(func: &Function, types: &TypeContext, value: Handle<Value>) -> Result<()> {
    let mr = match types.get(func.value_type(value)) {
        Type::Memref(mr) => mr,
        Type::Group(g) => match types.memref_type(g.memref) {
            Some(mr) => mr,
            None => return Err(CompilationError::new(Status::IrExpectedMemref)),
        },
        _ => return Ok(()),
    };
    if mr.shape.len() != mr.stride.len() {
        return Err(CompilationError::new(Status::IrShapeStrideMismatch).with_extra(format!(
            "{} shape entries, {} stride entries",
            mr.shape.len(),
            mr.stride.len()
        )));
    }
    Ok(())
}

fn check_region(
    func: &Function,
    types: &TypeContext,
    region: &Region,
    kind: RegionKind,
    yields: bool,
) -> Result<()> {
    let last = region.insts.len().saturating_sub(1);
    for (pos, &inst) in region.insts.iter().enumerate() {
        let node = func.inst(inst);
        let fail = |status: Status, extra: &str| {
            Err(CompilationError::new(status)
                .at(node.loc)
                .with_extra(extra.to_owned()))
        };
        if !kind.admits(node.op.kind()) {
            let status = if node.op.kind() == ExecKind::Collective {
                Status::IrCollectiveCalledFromSpmd
            } else {
                Status::IrSpmdCalledFromCollective
            };
            return fail(status, node.op.mnemonic());
        }
        match node.op {
            Op::Yield if !yields || pos != last => {
                return fail(Status::IrUnexpectedYield, "yield must end a for or if body");
            }
            Op::Foreach { dim } if !(1..=2).contains(&dim) => {
                return fail(Status::InvalidArguments, "foreach must be 1-D or 2-D");
            }
            _ => {}
        }
        for &result in node.results() {
            check_value(func, types, result).map_err(|e| e.at(node.loc))?;
        }
        let child_yields = matches!(node.op, Op::For { .. } | Op::If);
        for child in &node.regions {
            check_region(func, types, child, child.kind.resolve(kind), child_yields)?;
        }
    }
    Ok(())
}
