//! Stack allocation for work-group local scratch memory.
//!
//! Walks each function in program order keeping the live `alloca`s sorted by
//! offset. A new allocation takes the first gap that fits, or goes after the
//! last live allocation; `lifetime_stop` frees it again. Loop bodies are
//! visited once, so their allocations occupy the stack as if executed once.

use simtc_ir::{
    CompilationError, Function, Handle, Op, Program, RegionRef, Result, Status, TypeContext, Value,
};

use crate::Pass;

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// A live allocation occupying bytes `[start, stop)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub value: Handle<Value>,
    pub start: i64,
    pub stop: i64,
}

/// First-fit allocator over a growing byte range.
#[derive(Debug, Default)]
pub struct StackAllocator {
    /// Live allocations sorted by `start`.
    live: Vec<Allocation>,
    high_water_mark: i64,
}

fn align_up(offset: i64, align: i64) -> i64 {
    let align = align.max(1);
    (offset + align - 1) / align * align
}

impl StackAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `size` bytes aligned to `align` and returns the offset.
    pub fn allocate(&mut self, value: Handle<Value>, size: i64, align: i64) -> i64 {
        let mut ptr = 0;
        let mut index = self.live.len();
        for (i, a) in self.live.iter().enumerate() {
            if a.start - ptr >= size {
                index = i;
                break;
            }
            ptr = align_up(a.stop, align);
        }
        let allocation = Allocation {
            value,
            start: ptr,
            stop: ptr + size,
        };
        self.live.insert(index, allocation);
        self.high_water_mark = self.high_water_mark.max(allocation.stop);
        ptr
    }

    /// Frees the allocation of `value`, which must be live exactly once.
    pub fn free(&mut self, value: Handle<Value>) -> Result<Allocation> {
        let positions: Vec<usize> = self
            .live
            .iter()
            .enumerate()
            .filter(|(_, a)| a.value == value)
            .map(|(i, _)| i)
            .collect();
        match positions.as_slice() {
            &[index] => Ok(self.live.remove(index)),
            _ => Err(CompilationError::internal(
                "Incorrect lifetime_stop: value not found in list of allocations",
            )),
        }
    }

    /// Live allocations ordered by offset.
    pub fn live(&self) -> &[Allocation] {
        &self.live
    }

    /// Largest end offset seen so far.
    pub fn high_water_mark(&self) -> i64 {
        self.high_water_mark
    }
}

// ---------------------------------------------------------------------------
// Pass
// ---------------------------------------------------------------------------

/// Assigns `stack_ptr` offsets to `alloca`s and sets `scratch_size`.
#[derive(Debug)]
pub struct SetStackPtr {
    local_memory_size: u32,
}

impl SetStackPtr {
    pub fn new(local_memory_size: u32) -> Self {
        Self { local_memory_size }
    }
}

impl Pass for SetStackPtr {
    fn name(&self) -> &str {
        "set-stack-ptr"
    }

    fn run(&self, program: &mut Program) -> Result<bool> {
        let mut changed = false;
        for func in &mut program.functions {
            let mut stack = StackAllocator::new();
            changed |= assign_region(func, &program.types, RegionRef::Body, &mut stack)?;
            let size = stack.high_water_mark();
            if size > i64::from(self.local_memory_size) {
                return Err(CompilationError::new(Status::BadAlloc)
                    .at(func.loc)
                    .with_extra(format!(
                        "`{}` needs {size} bytes of local memory, {} available",
                        func.name, self.local_memory_size
                    )));
            }
            if size > 0 {
                log::debug!("`{}`: scratch size {size} B", func.name);
            }
            func.scratch_size = size;
        }
        Ok(changed)
    }
}

fn assign_region(
    func: &mut Function,
    types: &TypeContext,
    region: RegionRef,
    stack: &mut StackAllocator,
) -> Result<bool> {
    let mut changed = false;
    let insts = func.region(region).insts.clone();
    for inst in insts {
        match func.inst(inst).op {
            Op::Alloca { stack_ptr } => {
                let node = func.inst(inst);
                let value = node
                    .result()
                    .ok_or_else(|| CompilationError::internal("alloca without result"))?;
                let mr = types
                    .memref_type(func.value_type(value))
                    .ok_or_else(|| CompilationError::internal("alloca of non-memref type"))?;
                let size = mr.size_in_bytes().ok_or_else(|| {
                    CompilationError::internal("alloca of dynamic size").at(node.loc)
                })?;
                let align = mr.element.alignment() as i64;
                let offset = stack.allocate(value, size, align);
                if stack_ptr != Some(offset) {
                    func.inst_mut(inst).op = Op::Alloca {
                        stack_ptr: Some(offset),
                    };
                    changed = true;
                }
            }
            Op::LifetimeStop => {
                let node = func.inst(inst);
                let loc = node.loc;
                stack.free(node.operand(0)).map_err(|e| e.at(loc))?;
            }
            _ => {
                for index in 0..func.inst(inst).regions.len() {
                    let child = RegionRef::Child {
                        inst,
                        index: index as u32,
                    };
                    changed |= assign_region(func, types, child, stack)?;
                }
            }
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use simtc_ir::{AddressSpace, Builder, ScalarType};

    fn values(n: usize) -> Vec<Handle<Value>> {
        let mut types = TypeContext::new();
        let ty = types.index();
        let mut f = Function::new("v");
        (0..n).map(|i| f.add_param(ty, format!("v{i}"))).collect()
    }

    #[test]
    fn first_fit_reuses_freed_gap() {
        let v = values(3);
        let mut stack = StackAllocator::new();
        assert_eq!(stack.allocate(v[0], 64, 4), 0);
        assert_eq!(stack.allocate(v[1], 32, 4), 64);
        stack.free(v[0]).unwrap();
        assert_eq!(stack.allocate(v[2], 48, 4), 0);
        assert_eq!(stack.high_water_mark(), 96);
    }

    #[test]
    fn too_small_gap_is_skipped() {
        let v = values(3);
        let mut stack = StackAllocator::new();
        stack.allocate(v[0], 16, 4);
        stack.allocate(v[1], 16, 4);
        stack.free(v[0]).unwrap();
        assert_eq!(stack.allocate(v[2], 32, 4), 32);
    }

    #[test]
    fn alignment_is_respected() {
        let v = values(2);
        let mut stack = StackAllocator::new();
        stack.allocate(v[0], 6, 2);
        assert_eq!(stack.allocate(v[1], 16, 8), 8);
    }

    #[test]
    fn unmatched_free_is_internal_error() {
        let v = values(2);
        let mut stack = StackAllocator::new();
        stack.allocate(v[0], 8, 4);
        let err = stack.free(v[1]).unwrap_err();
        assert_eq!(err.status, Status::InternalCompilerError);
        assert!(err.to_string().contains("Incorrect lifetime_stop"));
    }

    #[test]
    fn live_allocations_are_disjoint() {
        let v = values(16);
        let mut stack = StackAllocator::new();
        let mut state = 12345_u64;
        let mut live = Vec::new();
        for (i, &value) in v.iter().enumerate() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let size = 4 * (1 + (state >> 33) as i64 % 32);
            stack.allocate(value, size, 4);
            live.push(value);
            if i % 3 == 2 {
                let victim = live.remove((state >> 40) as usize % live.len());
                stack.free(victim).unwrap();
            }
            for pair in stack.live().windows(2) {
                assert!(pair[0].stop <= pair[1].start);
            }
        }
    }

    fn scratch_program(sizes: &[i64], stop_first: bool) -> Program {
        let mut program = Program::new();
        let mut f = Function::new("k");
        let tys: Vec<_> = sizes
            .iter()
            .map(|&n| {
                program
                    .types
                    .memref(ScalarType::F32, &[n / 4], &[], AddressSpace::Local, None)
                    .unwrap()
            })
            .collect();
        Builder::build_body(&mut program.types, &mut f, |b| {
            let first = b.alloca(tys[0])?;
            b.alloca(tys[1])?;
            if stop_first {
                b.lifetime_stop(first)?;
            }
            b.alloca(tys[2])?;
            Ok(())
        })
        .unwrap();
        program.functions.push(f);
        program
    }

    fn stack_ptrs(f: &Function) -> Vec<i64> {
        f.body
            .insts
            .iter()
            .filter_map(|&i| match f.inst(i).op {
                Op::Alloca { stack_ptr } => stack_ptr,
                _ => None,
            })
            .collect()
    }

    #[test]
    fn pass_records_offsets_and_scratch_size() {
        let mut program = scratch_program(&[64, 32, 48], true);
        assert!(SetStackPtr::new(65536).run(&mut program).unwrap());
        let f = &program.functions[0];
        assert_eq!(stack_ptrs(f), vec![0, 64, 0]);
        assert_eq!(f.scratch_size, 96);
    }

    #[test]
    fn overflowing_local_memory_is_bad_alloc() {
        let mut program = scratch_program(&[64, 32, 48], false);
        let err = SetStackPtr::new(128).run(&mut program).unwrap_err();
        assert_eq!(err.status, Status::BadAlloc);
    }
}
