//! Foreach lowering pass.
//!
//! Replaces every `foreach` by a `parallel` region in which each subgroup
//! walks its share of the index space in subgroup-sized blocks. The first
//! axis is distributed round-robin with the tail handled by the last tile;
//! the second axis of a 2-D range is split uniformly over the tiles.

use simtc_ir::{
    ArithOp, Builder, Builtin, CmpCondition, CompilationError, ConstValue, Function, Handle, Inst,
    Op, Program, RegionKind, RegionRef, Result, ScalarType, TypeContext, Value, ValueMap,
};

use crate::Pass;
use crate::const_fold::{Folded, fold_operation};
use crate::tiling::LocalTiling;

/// Lowers `foreach` to `parallel` plus tile loops.
#[derive(Debug)]
pub struct LowerForeach;

impl Pass for LowerForeach {
    fn name(&self) -> &str {
        "lower-foreach"
    }

    fn run(&self, program: &mut Program) -> Result<bool> {
        let mut changed = false;
        for func in &mut program.functions {
            changed |= lower_region(func, &mut program.types, RegionRef::Body)?;
        }
        Ok(changed)
    }
}

fn lower_region(func: &mut Function, types: &mut TypeContext, region: RegionRef) -> Result<bool> {
    let mut changed = false;
    let mut pos = 0;
    while pos < func.region(region).insts.len() {
        let inst = func.region(region).insts[pos];
        if let Op::Foreach { dim } = func.inst(inst).op {
            let lowered = lower_foreach(func, types, inst, dim)?;
            func.erase(region, pos);
            let count = lowered.len();
            let insts = &mut func.region_mut(region).insts;
            let tail = insts.split_off(pos);
            insts.extend(lowered);
            insts.extend(tail);
            pos += count;
            changed = true;
            continue;
        }
        // foreach is collective, so it never sits below an spmd region.
        for index in 0..func.inst(inst).regions.len() {
            if func.inst(inst).regions[index].kind != RegionKind::Spmd {
                let child = RegionRef::Child {
                    inst,
                    index: index as u32,
                };
                changed |= lower_region(func, types, child)?;
            }
        }
        pos += 1;
    }
    Ok(changed)
}

/// Builds the replacement of `foreach` and returns its instructions.
fn lower_foreach(
    func: &mut Function,
    types: &mut TypeContext,
    foreach: Handle<Inst>,
    dim: u32,
) -> Result<Vec<Handle<Inst>>> {
    let sgs = func.subgroup_size;
    if sgs == 0 {
        return Err(CompilationError::internal(
            "foreach lowering requires a subgroup size",
        ));
    }
    let tiling = LocalTiling::from_work_group_size(sgs, func.work_group_size);
    let node = func.inst(foreach);
    let loc = node.loc;
    let dim = dim as usize;
    let from = node.operands()[..dim].to_vec();
    let to = node.operands()[dim..2 * dim].to_vec();
    let body = &node.regions[0];
    let params = body.params.clone();
    let body_insts = body.insts.clone();
    log::trace!("lowering {dim}-D foreach with tiling {tiling}");

    let mut b = Builder::with_kind(types, func, RegionKind::Collective);
    b.set_location(loc);
    b.parallel(|b| {
        let loop_ty = b.func().value_type(from[0]);
        let scalar = b
            .types()
            .scalar_type(loop_ty)
            .ok_or_else(|| CompilationError::internal("foreach bounds must be integers"))?;
        let sg_id = builtin_as(b, Builtin::SubgroupId, scalar)?;
        let lane = builtin_as(b, Builtin::SubgroupLocalId, scalar)?;
        let clone_body = |b: &mut Builder<'_>, vars: &[Handle<Value>]| -> Result<()> {
            let mut map: ValueMap = params.iter().copied().zip(vars.iter().copied()).collect();
            b.clone_insts(&body_insts, &mut map);
            Ok(())
        };
        if dim == 1 {
            let axis = Axis {
                from: from[0],
                to: to[0],
                num_tiles: i64::from(tiling.num_tiles()),
                tile: sg_id,
            };
            tile_loop_by_subgroup(b, scalar, &axis, i64::from(sgs), lane, &mut |b, i| {
                clone_body(b, &[i])
            })
        } else {
            let m_tiles = constant(b, scalar, i64::from(tiling.m_tiles))?;
            let sg_m = arith(b, ArithOp::Rem, sg_id, m_tiles)?;
            let sg_n = arith(b, ArithOp::Div, sg_id, m_tiles)?;
            let axis_n = Axis {
                from: from[1],
                to: to[1],
                num_tiles: i64::from(tiling.n_tiles),
                tile: sg_n,
            };
            let axis_m = Axis {
                from: from[0],
                to: to[0],
                num_tiles: i64::from(tiling.m_tiles),
                tile: sg_m,
            };
            // Row blocks outside, the column range of the tile innermost.
            tile_loop_uniform(b, scalar, &axis_n, i64::from(sgs), &mut |b, begin, end| {
                tile_loop_by_subgroup(b, scalar, &axis_m, i64::from(sgs), lane, &mut |b, i| {
                    b.for_range(begin, end, None, |b, j| clone_body(b, &[i, j]))
                })
            })
        }
    })?;
    Ok(b.finish())
}

/// One axis of the index space and the tile walking it.
struct Axis {
    from: Handle<Value>,
    to: Handle<Value>,
    num_tiles: i64,
    tile: Handle<Value>,
}

type AxisBody<'b, 'a> = dyn FnMut(&mut Builder<'a>, Handle<Value>) -> Result<()> + 'b;
type RangeBody<'b, 'a> = dyn FnMut(&mut Builder<'a>, Handle<Value>, Handle<Value>) -> Result<()> + 'b;

/// `for block = tile*sgs; block < blocks*sgs; block += sgs*num_tiles` over
/// full subgroup blocks, then the tail executed by the last tile.
fn tile_loop_by_subgroup<'a>(
    b: &mut Builder<'a>,
    ty: ScalarType,
    axis: &Axis,
    sgs: i64,
    lane: Handle<Value>,
    body: &mut AxisBody<'_, 'a>,
) -> Result<()> {
    let size = arith(b, ArithOp::Sub, axis.to, axis.from)?;
    let sgs_c = constant(b, ty, sgs)?;
    let blocks = arith(b, ArithOp::Div, size, sgs_c)?;
    let rem = arith(b, ArithOp::Rem, size, sgs_c)?;
    let block_start = arith(b, ArithOp::Mul, axis.tile, sgs_c)?;
    let block_end = arith(b, ArithOp::Mul, blocks, sgs_c)?;

    if !is_literal(b, block_end, 0) {
        let step = constant(b, ty, sgs * axis.num_tiles)?;
        b.for_range(block_start, block_end, Some(step), |b, block| {
            let base = arith(b, ArithOp::Add, axis.from, block)?;
            let i = arith(b, ArithOp::Add, base, lane)?;
            body(b, i)
        })?;
    }
    if !is_literal(b, rem, 0) {
        let last = constant(b, ty, axis.num_tiles - 1)?;
        let is_last = b.cmp(CmpCondition::Eq, axis.tile, last)?;
        b.if_then(is_last, |b| {
            let in_range = b.cmp(CmpCondition::Lt, lane, rem)?;
            b.if_then(in_range, |b| {
                let base = arith(b, ArithOp::Add, axis.from, block_end)?;
                let i = arith(b, ArithOp::Add, base, lane)?;
                body(b, i)
            })
        })?;
    }
    Ok(())
}

/// Splits the axis into a multiple of `num_tiles` chunks whose sizes differ by
/// at most one and hands `[begin, end)` of each chunk of this tile to `body`.
fn tile_loop_uniform<'a>(
    b: &mut Builder<'a>,
    ty: ScalarType,
    axis: &Axis,
    block_size: i64,
    body: &mut RangeBody<'_, 'a>,
) -> Result<()> {
    let one = constant(b, ty, 1)?;
    let tiles = constant(b, ty, axis.num_tiles)?;
    let block_size = constant(b, ty, block_size)?;
    let size = arith(b, ArithOp::Sub, axis.to, axis.from)?;

    // blocks = (1 + ((size - 1) / block_size) / tiles) * tiles
    let size_m1 = arith(b, ArithOp::Sub, size, one)?;
    let full = arith(b, ArithOp::Div, size_m1, block_size)?;
    let per_tile = arith(b, ArithOp::Div, full, tiles)?;
    let per_tile = arith(b, ArithOp::Add, one, per_tile)?;
    let blocks = arith(b, ArithOp::Mul, per_tile, tiles)?;

    let bs = arith(b, ArithOp::Div, size, blocks)?;
    let bs1 = arith(b, ArithOp::Add, bs, one)?;
    let rem = arith(b, ArithOp::Rem, size, blocks)?;

    // rem chunks of bs1 elements
    let start = arith(b, ArithOp::Mul, bs1, axis.tile)?;
    let end = arith(b, ArithOp::Mul, bs1, rem)?;
    if !is_literal(b, end, 0) {
        let step = arith(b, ArithOp::Mul, bs1, tiles)?;
        b.for_range(start, end, Some(step), |b, block| {
            let begin = arith(b, ArithOp::Add, axis.from, block)?;
            let stop = arith(b, ArithOp::Add, begin, bs1)?;
            body(b, begin, stop)
        })?;
    }

    // then blocks - rem chunks of bs elements, rotated so the tiles that got a
    // long chunk start last
    if !is_literal(b, bs, 0) {
        let rotation = arith(b, ArithOp::Rem, rem, tiles)?;
        let rotated = arith(b, ArithOp::Add, axis.tile, rotation)?;
        let rotated = arith(b, ArithOp::Rem, rotated, tiles)?;
        let offset = arith(b, ArithOp::Mul, bs, rotated)?;
        let start = arith(b, ArithOp::Add, end, offset)?;
        let step = arith(b, ArithOp::Mul, bs, tiles)?;
        b.for_range(start, size, Some(step), |b, block| {
            let begin = arith(b, ArithOp::Add, axis.from, block)?;
            let stop = arith(b, ArithOp::Add, begin, bs)?;
            body(b, begin, stop)
        })?;
    }
    Ok(())
}

fn builtin_as(b: &mut Builder<'_>, builtin: Builtin, ty: ScalarType) -> Result<Handle<Value>> {
    let value = b.builtin(builtin)?;
    if ty == ScalarType::I32 {
        Ok(value)
    } else {
        b.cast(value, ty)
    }
}

fn constant(b: &mut Builder<'_>, ty: ScalarType, value: i64) -> Result<Handle<Value>> {
    b.constant_int(value, ty)
}

fn is_literal(b: &Builder<'_>, value: Handle<Value>, literal: i64) -> bool {
    b.func().constant_value(value) == Some(ConstValue::Int(literal))
}

/// Builds `a op c`, folding it on the spot when possible.
fn arith(
    b: &mut Builder<'_>,
    op: ArithOp,
    a: Handle<Value>,
    c: Handle<Value>,
) -> Result<Handle<Value>> {
    let ty = b.func().value_type(a);
    match fold_operation(b.func(), b.types(), &Op::Arith(op), &[a, c], ty, false) {
        Some(Folded::Constant(value)) => b.constant(value, ty),
        Some(Folded::Value(value)) => Ok(value),
        None => b.arith(op, a, c),
    }
}
