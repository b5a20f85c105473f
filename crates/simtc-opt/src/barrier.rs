//! Barrier insertion pass.
//!
//! Tracks, per region and address space, the memrefs read and written since
//! the last barrier. An instruction that reads after a write, or writes after
//! a read or write, of a possibly aliasing memref in the same address space
//! gets a barrier for that space inserted in front of it. Nested regions are
//! analyzed once and their accesses are attributed to the instruction owning
//! them. No barriers are placed inside SPMD regions.

use simtc_ir::{
    AddressSpace, AddressSpaces, Function, Handle, Inst, Op, Program, RegionKind, RegionRef,
    Result, TypeContext, Value,
};

use crate::Pass;
use crate::alias::{AliasAnalysis, address_space};

/// Inserts barriers between conflicting collective memory accesses.
#[derive(Debug)]
pub struct InsertBarrier;

impl Pass for InsertBarrier {
    fn name(&self) -> &str {
        "insert-barrier"
    }

    fn run(&self, program: &mut Program) -> Result<bool> {
        let mut changed = false;
        for func in &mut program.functions {
            let aa = AliasAnalysis::new(func, &program.types);
            let mut ctx = Context {
                types: &program.types,
                aa: &aa,
                inserted: 0,
            };
            let kind = func.body.kind;
            ctx.run_on_region(func, RegionRef::Body, kind);
            if ctx.inserted > 0 {
                log::debug!("inserted {} barriers in `{}`", ctx.inserted, func.name);
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Memrefs accessed per address space.
#[derive(Clone, Debug, Default)]
struct AccessSet {
    by_space: [Vec<Handle<Value>>; 2],
}

fn slot(space: AddressSpace) -> usize {
    match space {
        AddressSpace::Global => 0,
        AddressSpace::Local => 1,
    }
}

impl AccessSet {
    fn insert(&mut self, space: AddressSpace, value: Handle<Value>) {
        let values = &mut self.by_space[slot(space)];
        if !values.contains(&value) {
            values.push(value);
        }
    }

    fn merge(&mut self, other: &AccessSet) {
        for space in AddressSpace::ALL {
            for &v in &other.by_space[slot(space)] {
                self.insert(space, v);
            }
        }
    }

    fn clear(&mut self, spaces: AddressSpaces) {
        for space in spaces.iter() {
            self.by_space[slot(space)].clear();
        }
    }

    /// Spaces in which some value of `self` may alias a value of `other` in the same space.
    fn conflicts(&self, other: &AccessSet, aa: &AliasAnalysis) -> AddressSpaces {
        let mut spaces = AddressSpaces::EMPTY;
        for space in AddressSpace::ALL {
            let hit = self.by_space[slot(space)]
                .iter()
                .any(|&a| other.by_space[slot(space)].iter().any(|&b| aa.may_alias(a, b)));
            if hit {
                spaces |= space.flag();
            }
        }
        spaces
    }
}

#[derive(Clone, Debug, Default)]
struct ReadWrite {
    reads: AccessSet,
    writes: AccessSet,
}

impl ReadWrite {
    fn merge(&mut self, other: &ReadWrite) {
        self.reads.merge(&other.reads);
        self.writes.merge(&other.writes);
    }

    fn clear(&mut self, spaces: AddressSpaces) {
        self.reads.clear(spaces);
        self.writes.clear(spaces);
    }

    /// Spaces with a read-after-write, write-after-read or write-after-write
    /// hazard when `next` follows `self`.
    fn hazards(&self, next: &ReadWrite, aa: &AliasAnalysis) -> AddressSpaces {
        next.reads.conflicts(&self.writes, aa)
            | next.writes.conflicts(&self.reads, aa)
            | next.writes.conflicts(&self.writes, aa)
    }
}

struct Context<'a> {
    types: &'a TypeContext,
    aa: &'a AliasAnalysis,
    inserted: usize,
}

impl Context<'_> {
    /// Inserts barriers in `region` and returns every access made in it.
    fn run_on_region(&mut self, func: &mut Function, region: RegionRef, kind: RegionKind) -> ReadWrite {
        let mut total = ReadWrite::default();
        let mut current = ReadWrite::default();
        let mut pos = 0;
        while pos < func.region(region).insts.len() {
            let inst = func.region(region).insts[pos];
            if let Op::Barrier(spaces) = func.inst(inst).op {
                current.clear(spaces);
                pos += 1;
                continue;
            }

            let mut rw = self.own_accesses(func, inst);
            for index in 0..func.inst(inst).regions.len() {
                let child_kind = func.inst(inst).regions[index].kind.resolve(kind);
                let child = RegionRef::Child {
                    inst,
                    index: index as u32,
                };
                let child_rw = self.run_on_region(func, child, child_kind);
                rw.merge(&child_rw);
            }

            let hazards = current.hazards(&rw, self.aa);
            if !hazards.is_empty() && kind != RegionKind::Spmd {
                let loc = func.inst(inst).loc;
                let barrier = func.create_inst(Op::Barrier(hazards), Vec::new(), &[], Vec::new(), loc);
                func.region_mut(region).insts.insert(pos, barrier);
                log::trace!("barrier({hazards}) before {}", func.inst(inst).op.mnemonic());
                self.inserted += 1;
                pos += 1;
                current.clear(hazards);
            }
            current.merge(&rw);
            total.merge(&rw);
            pos += 1;
        }
        total
    }

    fn own_accesses(&self, func: &Function, inst: Handle<Inst>) -> ReadWrite {
        let (reads, writes) = func.inst(inst).memory_effects();
        let mut rw = ReadWrite::default();
        for (values, set) in [(reads, &mut rw.reads), (writes, &mut rw.writes)] {
            for v in values {
                if let Some(space) = address_space(func, self.types, v) {
                    set.insert(space, v);
                }
            }
        }
        rw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simtc_ir::{Builder, ScalarType, StoreFlag, Transpose, Type, dump_program};

    fn local(program: &mut Program, shape: &[i64]) -> Handle<Type> {
        program
            .types
            .memref(ScalarType::F32, shape, &[], AddressSpace::Local, None)
            .unwrap()
    }

    fn global(program: &mut Program, shape: &[i64]) -> Handle<Type> {
        program
            .types
            .memref(ScalarType::F32, shape, &[], AddressSpace::Global, None)
            .unwrap()
    }

    /// `tmp := A * B` into local memory, then `C := tmp * B`.
    fn gemm_chain(with_barrier: bool) -> Program {
        let mut program = Program::new();
        let g = global(&mut program, &[16, 16]);
        let l = local(&mut program, &[16, 16]);
        let mut f = Function::new("chain");
        let a = f.add_param(g, "A");
        let b = f.add_param(g, "B");
        let c = f.add_param(g, "C");
        Builder::build_body(&mut program.types, &mut f, |bld| {
            let one = bld.constant_float(1.0, ScalarType::F32)?;
            let zero = bld.constant_float(0.0, ScalarType::F32)?;
            let tmp = bld.alloca(l)?;
            bld.gemm(Transpose::N, Transpose::N, false, one, a, b, zero, tmp)?;
            if with_barrier {
                bld.barrier(AddressSpaces::LOCAL)?;
            }
            bld.gemm(Transpose::N, Transpose::N, false, one, tmp, b, zero, c)?;
            bld.lifetime_stop(tmp)?;
            Ok(())
        })
        .unwrap();
        program.functions.push(f);
        program
    }

    fn barriers(f: &Function) -> Vec<(usize, AddressSpaces)> {
        f.body
            .insts
            .iter()
            .enumerate()
            .filter_map(|(i, &inst)| match f.inst(inst).op {
                Op::Barrier(spaces) => Some((i, spaces)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn read_after_write_gets_local_barrier() {
        let mut program = gemm_chain(false);
        assert!(InsertBarrier.run(&mut program).unwrap());
        let f = &program.functions[0];
        assert_eq!(barriers(f), vec![(4, AddressSpaces::LOCAL)]);
        assert!(dump_program(&program).contains("barrier"));
    }

    #[test]
    fn existing_barrier_is_respected() {
        let mut program = gemm_chain(true);
        assert!(!InsertBarrier.run(&mut program).unwrap());
        assert_eq!(barriers(&program.functions[0]).len(), 1);
    }

    #[test]
    fn independent_accesses_need_no_barrier() {
        let mut program = Program::new();
        let g = global(&mut program, &[8]);
        let mut f = Function::new("k");
        let x = f.add_param(g, "x");
        let y = f.add_param(g, "y");
        Builder::build_body(&mut program.types, &mut f, |b| {
            let v = b.constant_float(1.0, ScalarType::F32)?;
            let i = b.constant_index(0)?;
            b.store(StoreFlag::Regular, v, x, &[i])?;
            b.store(StoreFlag::Regular, v, y, &[i])?;
            b.load(y, &[i])?;
            Ok(())
        })
        .unwrap();
        program.functions.push(f);
        assert!(InsertBarrier.run(&mut program).unwrap());
        // Only the load of y after the store to y conflicts.
        assert_eq!(
            barriers(&program.functions[0]),
            vec![(4, AddressSpaces::GLOBAL)]
        );
    }

    #[test]
    fn loop_accesses_are_merged_into_the_loop() {
        let mut program = Program::new();
        let l = local(&mut program, &[16]);
        let mut f = Function::new("k");
        Builder::build_body(&mut program.types, &mut f, |b| {
            let tmp = b.alloca(l)?;
            let from = b.constant_index(0)?;
            let to = b.constant_index(16)?;
            let v = b.constant_float(0.0, ScalarType::F32)?;
            b.for_range(from, to, None, |b, i| {
                b.store(StoreFlag::Regular, v, tmp, &[i])?;
                Ok(())
            })?;
            b.load(tmp, &[from])?;
            Ok(())
        })
        .unwrap();
        program.functions.push(f);
        InsertBarrier.run(&mut program).unwrap();
        let f = &program.functions[0];
        let found = barriers(f);
        assert_eq!(found.len(), 1);
        assert_eq!(f.inst(f.body.insts[found[0].0 + 1]).op.mnemonic(), "load");
    }

    #[test]
    fn spmd_regions_get_no_barriers() {
        let mut program = Program::new();
        let g = global(&mut program, &[64]);
        let mut f = Function::new("k");
        let x = f.add_param(g, "x");
        f.subgroup_size = 16;
        Builder::build_body(&mut program.types, &mut f, |b| {
            let from = b.constant_index(0)?;
            let to = b.constant_index(64)?;
            b.foreach(&[from], &[to], |b, vars| {
                let v = b.load(x, &[vars[0]])?;
                b.store(StoreFlag::Regular, v, x, &[vars[0]])?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
        program.functions.push(f);
        InsertBarrier.run(&mut program).unwrap();
        let f = &program.functions[0];
        let foreach = *f.body.insts.last().unwrap();
        let inner = &f.inst(foreach).regions[0];
        assert!(inner
            .insts
            .iter()
            .all(|&i| !matches!(f.inst(i).op, Op::Barrier(_))));
    }

    /// Every conflicting pair in the body with no access to the same space in
    /// between is separated by a barrier.
    #[test]
    fn barrier_soundness_on_straight_line_code() {
        let mut program = Program::new();
        let g = global(&mut program, &[8]);
        let l = local(&mut program, &[8]);
        let mut f = Function::new("k");
        let x = f.add_param(g, "x");
        Builder::build_body(&mut program.types, &mut f, |b| {
            let tmp = b.alloca(l)?;
            let i = b.constant_index(1)?;
            let v = b.load(x, &[i])?;
            b.store(StoreFlag::Regular, v, tmp, &[i])?;
            let w = b.load(tmp, &[i])?;
            b.store(StoreFlag::Regular, w, x, &[i])?;
            b.store(StoreFlag::Regular, w, tmp, &[i])?;
            b.lifetime_stop(tmp)?;
            Ok(())
        })
        .unwrap();
        program.functions.push(f);
        InsertBarrier.run(&mut program).unwrap();

        let f = &program.functions[0];
        let types = &program.types;
        let aa = AliasAnalysis::new(f, types);
        let insts = &f.body.insts;
        for (i, &first) in insts.iter().enumerate() {
            let (r1, w1) = f.inst(first).memory_effects();
            for (j, &second) in insts.iter().enumerate().skip(i + 1) {
                let (r2, w2) = f.inst(second).memory_effects();
                let conflict = w1.iter().any(|&a| {
                    r2.iter().chain(&w2).any(|&b| aa.may_alias(a, b))
                }) || r1.iter().any(|&a| w2.iter().any(|&b| aa.may_alias(a, b)));
                if !conflict {
                    continue;
                }
                let space = address_space(f, types, w1.first().or(r1.first()).copied().unwrap());
                let separated = insts[i + 1..j].iter().any(|&k| match f.inst(k).op {
                    Op::Barrier(spaces) => spaces.contains(space.unwrap().flag()),
                    _ => false,
                });
                assert!(separated, "no barrier between {i} and {j}");
            }
        }
    }
}
