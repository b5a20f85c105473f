//! May-alias analysis.
//!
//! Views (`subview`, `expand`, `fuse`) alias the memref they are taken from,
//! transitively. Stack-allocated `alloca`s alias when their byte ranges
//! overlap. Distinct roots are otherwise assumed not to alias.

use std::collections::HashMap;

use simtc_ir::{AddressSpace, Function, Handle, Op, Type, TypeContext, Value};

/// Alias oracle for one function.
#[derive(Debug, Default)]
pub struct AliasAnalysis {
    /// View result to the value it is ultimately derived from.
    root: HashMap<Handle<Value>, Handle<Value>>,
    /// Byte range `[start, stop)` of allocas with an assigned stack offset.
    ranges: HashMap<Handle<Value>, (i64, i64)>,
}

impl AliasAnalysis {
    pub fn new(func: &Function, types: &TypeContext) -> Self {
        let mut aa = Self::default();
        // Pre-order visits every view after the value it is derived from.
        for inst in func.collect_insts(&func.body) {
            let node = func.inst(inst);
            let Some(result) = node.result() else {
                continue;
            };
            match node.op {
                Op::Alloca {
                    stack_ptr: Some(start),
                } => {
                    let size = types
                        .memref_type(func.value_type(result))
                        .and_then(|mr| mr.size_in_bytes())
                        .unwrap_or(0);
                    aa.ranges.insert(result, (start, start + size));
                }
                _ if node.op.is_view() => {
                    let source = aa.root(node.operand(0));
                    aa.root.insert(result, source);
                }
                _ => {}
            }
        }
        aa
    }

    /// The value `value` is derived from (itself if it is not a view).
    pub fn root(&self, value: Handle<Value>) -> Handle<Value> {
        self.root.get(&value).copied().unwrap_or(value)
    }

    /// Returns `true` if `a` and `b` may refer to overlapping memory.
    pub fn may_alias(&self, a: Handle<Value>, b: Handle<Value>) -> bool {
        let (ra, rb) = (self.root(a), self.root(b));
        if ra == rb {
            return true;
        }
        match (self.ranges.get(&ra), self.ranges.get(&rb)) {
            (Some(&(a0, a1)), Some(&(b0, b1))) => a0 < b1 && b0 < a1,
            _ => false,
        }
    }
}

/// Address space of a memref or group value.
pub fn address_space(func: &Function, types: &TypeContext, value: Handle<Value>) -> Option<AddressSpace> {
    match types.get(func.value_type(value)) {
        Type::Memref(mr) => Some(mr.addrspace),
        Type::Group(g) => types.memref_type(g.memref).map(|mr| mr.addrspace),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simtc_ir::{Builder, Extent, ScalarType, Slice};

    #[test]
    fn views_alias_their_source() {
        let mut types = TypeContext::new();
        let ty = types
            .memref(ScalarType::F32, &[16, 16], &[], AddressSpace::Global, None)
            .unwrap();
        let mut f = Function::new("k");
        let a = f.add_param(ty, "A");
        let b = f.add_param(ty, "B");
        let mut views = Vec::new();
        Builder::build_body(&mut types, &mut f, |bld| {
            let rows = Slice::Range {
                offset: Extent::Static(0),
                size: Extent::Static(16),
            };
            let cols = Slice::Range {
                offset: Extent::Static(4),
                size: Extent::Static(8),
            };
            let v = bld.subview(a, &[rows, cols], &[])?;
            let w = bld.fuse(v, 0, 1)?;
            views.extend([v, w]);
            Ok(())
        })
        .unwrap();
        let aa = AliasAnalysis::new(&f, &types);
        assert_eq!(aa.root(views[1]), a);
        assert!(aa.may_alias(views[1], a));
        assert!(!aa.may_alias(views[1], b));
        assert_eq!(address_space(&f, &types, views[0]), Some(AddressSpace::Global));
    }

    #[test]
    fn allocas_alias_by_range() {
        let mut types = TypeContext::new();
        let ty = types
            .memref(ScalarType::F32, &[16], &[], AddressSpace::Local, None)
            .unwrap();
        let mut f = Function::new("k");
        let mut tmp = Vec::new();
        Builder::build_body(&mut types, &mut f, |bld| {
            for _ in 0..3 {
                tmp.push(bld.alloca(ty)?);
            }
            Ok(())
        })
        .unwrap();
        for (i, start) in [0, 64, 32].into_iter().enumerate() {
            let inst = f.body.insts[i];
            f.inst_mut(inst).op = Op::Alloca {
                stack_ptr: Some(start),
            };
        }
        let aa = AliasAnalysis::new(&f, &types);
        assert!(!aa.may_alias(tmp[0], tmp[1]));
        assert!(aa.may_alias(tmp[0], tmp[2]));
        assert!(aa.may_alias(tmp[1], tmp[2]));
    }
}
