//! Dead code elimination pass.
//!
//! Removes instructions without side effects and nested regions whose
//! results have no uses. Regions are scanned back to front so that chains of
//! dead instructions disappear in one sweep; the sweep repeats until stable.

use simtc_ir::{Function, Program, RegionRef, Result};

use crate::Pass;

/// Removes unused side-effect-free instructions.
#[derive(Debug)]
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &str {
        "dead-code-elimination"
    }

    fn run(&self, program: &mut Program) -> Result<bool> {
        let mut changed = false;
        for func in &mut program.functions {
            let mut removed = 0;
            loop {
                let n = sweep_region(func, RegionRef::Body);
                if n == 0 {
                    break;
                }
                removed += n;
            }
            if removed > 0 {
                log::debug!("removed {removed} dead instructions from `{}`", func.name);
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn sweep_region(func: &mut Function, region: RegionRef) -> usize {
    let mut removed = 0;
    let mut pos = func.region(region).insts.len();
    while pos > 0 {
        pos -= 1;
        let inst = func.region(region).insts[pos];
        for index in 0..func.inst(inst).regions.len() {
            let child = RegionRef::Child {
                inst,
                index: index as u32,
            };
            removed += sweep_region(func, child);
        }
        let node = func.inst(inst);
        let dead = !node.op.has_side_effects()
            && node.regions.is_empty()
            && node.results().iter().all(|&r| !func.value(r).has_uses());
        if dead {
            func.erase(region, pos);
            removed += 1;
        }
    }
    removed
}
