//! Work-group size advisor pass.
//!
//! Chooses a subgroup size and a subgroup grid for every function whose
//! launch configuration is not fully set, based on the outputs of the BLAS
//! instructions it contains, and checks the result against the core.

use simtc_ir::{CoreConfig, Function, Program, Region, Result, Type, TypeContext};

use crate::Pass;
use crate::tiling::{BlasShape, suggest_local_tiling, suggest_subgroup_size};

/// Fills in `subgroup_size` and `work_group_size` of functions.
#[derive(Debug)]
pub struct WorkGroupSize {
    core: CoreConfig,
}

impl WorkGroupSize {
    pub fn new(core: CoreConfig) -> Self {
        Self { core }
    }
}

impl Pass for WorkGroupSize {
    fn name(&self) -> &str {
        "work-group-size"
    }

    fn run(&self, program: &mut Program) -> Result<bool> {
        let mut changed = false;
        for func in &mut program.functions {
            changed |= self.run_on_function(func, &program.types)?;
        }
        Ok(changed)
    }
}

impl WorkGroupSize {
    fn run_on_function(&self, func: &mut Function, types: &TypeContext) -> Result<bool> {
        let set_sgs = func.subgroup_size != 0;
        let set_wgs = func.work_group_size != [0, 0];
        if !(set_sgs && set_wgs) {
            let mut shapes = Vec::new();
            collect_blas_shapes(func, types, &func.body, &mut shapes);
            if !set_sgs {
                func.subgroup_size = suggest_subgroup_size(&shapes, &self.core)?;
            }
            if !set_wgs {
                let tiling = suggest_local_tiling(&shapes, func.subgroup_size, &self.core);
                func.work_group_size = tiling.work_group_size(func.subgroup_size);
            }
            log::debug!(
                "`{}`: subgroup size {}, work-group size {:?}",
                func.name,
                func.subgroup_size,
                func.work_group_size
            );
        }
        self.core
            .check_launch(func.subgroup_size, func.work_group_size)
            .map_err(|e| e.at(func.loc))?;
        Ok(!(set_sgs && set_wgs))
    }
}

/// Collects the distinct `(element, [rows, cols])` pairs of BLAS outputs.
fn collect_blas_shapes(
    func: &Function,
    types: &TypeContext,
    region: &Region,
    out: &mut Vec<BlasShape>,
) {
    for &inst in &region.insts {
        let node = func.inst(inst);
        if let Some(blas) = node.blas_operands() {
            if let Type::Memref(mr) = types.get(func.value_type(blas.out)) {
                let shape = BlasShape {
                    ty: mr.element,
                    shape: [
                        mr.shape.first().copied().unwrap_or(1),
                        mr.shape.get(1).copied().unwrap_or(1),
                    ],
                };
                if !out.contains(&shape) {
                    out.push(shape);
                }
            }
        }
        for child in &node.regions {
            collect_blas_shapes(func, types, child, out);
        }
    }
}
