//! Subgroup tile loops over a 1-D index range, emitted as OpenCL C.
//!
//! These are the run-time counterparts of the schedules in
//! [`simtc_opt::tiling`]: with static sizes every bound folds to a literal.

use simtc_backend_core::clir::{Block, BuiltinType, Expr, Namer};
use simtc_ir::Result;

/// Binds `value` to a fresh `long` unless it is a literal or a variable.
pub fn bind(bb: &mut Block, namer: &mut Namer, hint: &str, value: Expr) -> Expr {
    match value {
        Expr::Int(_) | Expr::Var(_) => value,
        other => bb.declare_assign(BuiltinType::Long, namer.fresh(hint), other),
    }
}

/// Lane and subgroup coordinates of the calling work-item.
#[derive(Clone, Debug, PartialEq)]
pub struct Lanes {
    /// Subgroup local id.
    pub lane: Expr,
    /// Subgroup id within the work-group.
    pub sg: Expr,
    /// Row of the subgroup in the `m_tiles x n_tiles` grid.
    pub sg_m: Expr,
    /// Column of the subgroup in the grid.
    pub sg_n: Expr,
}

impl Lanes {
    pub fn declare(bb: &mut Block, namer: &mut Namer, m_tiles: i64) -> Self {
        let lane = bb.declare_assign(
            BuiltinType::Long,
            namer.fresh("m"),
            Expr::call("get_sub_group_local_id", Vec::new()),
        );
        let sg = bb.declare_assign(
            BuiltinType::Long,
            namer.fresh("sg_id"),
            Expr::call("get_sub_group_id", Vec::new()),
        );
        let sg_m = bind(bb, namer, "sg_m", sg.clone() % Expr::Int(m_tiles));
        let sg_n = bind(bb, namer, "sg_n", sg.clone() / Expr::Int(m_tiles));
        Self {
            lane,
            sg,
            sg_m,
            sg_n,
        }
    }
}

/// Distributes blocks of `block` elements of `0..size` round-robin over
/// `tiles` subgroups; the tail goes to the last tile.
///
/// `body` receives the first element, the number of elements and whether the
/// block is the tail.
pub fn tile_loop_by_sgs<F>(
    bb: &mut Block,
    namer: &mut Namer,
    size: Expr,
    block: i64,
    tiles: i64,
    sg: Expr,
    mut body: F,
) -> Result<()>
where
    F: FnMut(&mut Block, &mut Namer, Expr, Expr, bool) -> Result<()>,
{
    let blocks = bind(bb, namer, "blocks", size.clone() / Expr::Int(block));
    let rem = bind(bb, namer, "rem", size % Expr::Int(block));

    let blk = namer.fresh("blk");
    let mut full = Block::new();
    body(&mut full, namer, Expr::var(&blk), Expr::Int(block), false)?;
    let mut full_loop = Block::new();
    full_loop.for_loop(
        BuiltinType::Long,
        &blk,
        Expr::Int(block) * sg.clone(),
        Expr::Int(block) * blocks.clone(),
        Expr::Int(block * tiles),
        full,
        None,
    );
    bb.if_then(blocks.clone().gt(Expr::Int(0)), full_loop);

    let mut tail = Block::new();
    body(&mut tail, namer, Expr::Int(block) * blocks, rem.clone(), true)?;
    let last = if tiles == 1 {
        Expr::Bool(true)
    } else {
        sg.eq(Expr::Int(tiles - 1))
    };
    bb.if_then(rem.gt(Expr::Int(0)).and(last), tail);
    Ok(())
}

/// Splits `0..size` into a multiple of `tiles` chunks of at most roughly
/// `block_size` elements whose sizes differ by at most one.
///
/// `body` receives the first element and the chunk size.
pub fn tile_loop_uniform<F>(
    bb: &mut Block,
    namer: &mut Namer,
    size: Expr,
    block_size: i64,
    tiles: i64,
    sg: Expr,
    mut body: F,
) -> Result<()>
where
    F: FnMut(&mut Block, &mut Namer, Expr, Expr) -> Result<()>,
{
    let blocks = bind(
        bb,
        namer,
        "blocks",
        (Expr::Int(1) + (size.clone() - Expr::Int(1)) / Expr::Int(block_size) / Expr::Int(tiles))
            * Expr::Int(tiles),
    );
    let bs = bind(bb, namer, "bs", size.clone() / blocks.clone());
    let bs1 = bind(bb, namer, "bs1", bs.clone() + Expr::Int(1));
    let rem = bind(bb, namer, "rem", size.clone() % blocks);

    if rem.as_int() != Some(0) {
        let blk = namer.fresh("blk");
        let mut chunk = Block::new();
        body(&mut chunk, namer, Expr::var(&blk), bs1.clone())?;
        bb.for_loop(
            BuiltinType::Long,
            &blk,
            bs1.clone() * sg.clone(),
            bs1.clone() * rem.clone(),
            bs1.clone() * Expr::Int(tiles),
            chunk,
            None,
        );
    }

    let blk = namer.fresh("blk");
    let mut chunk = Block::new();
    body(&mut chunk, namer, Expr::var(&blk), bs.clone())?;
    let start = bs1 * rem.clone() + bs.clone() * ((sg + rem % Expr::Int(tiles)) % Expr::Int(tiles));
    let mut rest = Block::new();
    rest.for_loop(
        BuiltinType::Long,
        &blk,
        start,
        size,
        bs.clone() * Expr::Int(tiles),
        chunk,
        None,
    );
    bb.if_then(bs.gt(Expr::Int(0)), rest);
    Ok(())
}

/// Largest chunk [`tile_loop_uniform`] hands out for a static `size`.
pub fn uniform_max_block(size: i64, block_size: i64, tiles: i64) -> i64 {
    if size <= 0 {
        return 0;
    }
    let blocks = (1 + ((size - 1) / block_size) / tiles) * tiles;
    let bs = size / blocks;
    if size % blocks > 0 { bs + 1 } else { bs }
}
