//! Lifetime-stop insertion pass.
//!
//! Every `alloca` without a matching `lifetime_stop` gets one right after the
//! last instruction of its region that touches the allocation or a view of it.

use std::collections::HashSet;

use simtc_ir::{Function, Handle, Inst, Op, Program, RegionRef, Result, Value};

use crate::Pass;

/// Inserts missing `lifetime_stop` instructions.
#[derive(Debug)]
pub struct InsertLifetimeStop;

impl Pass for InsertLifetimeStop {
    fn name(&self) -> &str {
        "insert-lifetime-stop"
    }

    fn run(&self, program: &mut Program) -> Result<bool> {
        let mut changed = false;
        for func in &mut program.functions {
            changed |= insert_in_region(func, RegionRef::Body) > 0;
        }
        Ok(changed)
    }
}

fn insert_in_region(func: &mut Function, region: RegionRef) -> usize {
    let mut inserted = 0;
    let insts = func.region(region).insts.clone();
    for &inst in &insts {
        for index in 0..func.inst(inst).regions.len() {
            let child = RegionRef::Child {
                inst,
                index: index as u32,
            };
            inserted += insert_in_region(func, child);
        }
    }

    for alloca in insts {
        if !matches!(func.inst(alloca).op, Op::Alloca { .. }) {
            continue;
        }
        let Some(value) = func.inst(alloca).result() else {
            continue;
        };
        let stopped = func
            .value(value)
            .uses()
            .iter()
            .any(|u| func.inst(u.inst).op == Op::LifetimeStop);
        if stopped {
            continue;
        }
        let aliases = views_of(func, value);
        let Some(start) = func.region(region).position(alloca) else {
            continue;
        };
        let last_use = func.region(region).insts[start..]
            .iter()
            .rposition(|&i| subtree_uses(func, i, &aliases))
            .map_or(start, |offset| start + offset);
        let loc = func.inst(alloca).loc;
        let stop = func.create_inst(Op::LifetimeStop, vec![value], &[], Vec::new(), loc);
        func.region_mut(region).insts.insert(last_use + 1, stop);
        inserted += 1;
    }
    inserted
}

/// `value` plus every view derived from it through `subview`, `expand` or `fuse`.
fn views_of(func: &Function, value: Handle<Value>) -> HashSet<Handle<Value>> {
    let mut set = HashSet::from([value]);
    let mut worklist = vec![value];
    while let Some(v) = worklist.pop() {
        for u in func.value(v).uses() {
            let user = func.inst(u.inst);
            if user.op.is_view() && u.operand == 0 {
                for &r in user.results() {
                    if set.insert(r) {
                        worklist.push(r);
                    }
                }
            }
        }
    }
    set
}

fn subtree_uses(func: &Function, inst: Handle<Inst>, values: &HashSet<Handle<Value>>) -> bool {
    let node = func.inst(inst);
    node.operands().iter().any(|v| values.contains(v))
        || node
            .regions
            .iter()
            .flat_map(|r| r.insts.iter())
            .any(|&child| subtree_uses(func, child, values))
}
