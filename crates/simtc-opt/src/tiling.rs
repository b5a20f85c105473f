//! Register blocking and subgroup tiling.
//!
//! Pure arithmetic shared by the work-group size advisor, foreach lowering
//! and the GEMM generator of the backend.

use std::fmt;

use simtc_ir::{CompilationError, CoreConfig, Result, ScalarType, Status, is_dynamic_value};

/// Maximum unroll factor of the K loop.
pub const MAX_K_UNROLL: i64 = 8;

/// Output block held in registers by one subgroup: `rows` (a multiple of the
/// subgroup size) times `cols` elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterBlock {
    pub rows: u32,
    pub cols: u32,
}

impl RegisterBlock {
    /// Arithmetic intensity `rows * cols / (rows + cols)`.
    pub fn intensity(self) -> f64 {
        intensity(i64::from(self.rows), i64::from(self.cols))
    }

    /// Scalars held in registers for this block: C block plus the A and B panels.
    pub fn scalar_count(self, c_blocks: u32) -> i64 {
        let (r, c) = (i64::from(self.rows), i64::from(self.cols));
        r * (c * i64::from(c_blocks) + MAX_K_UNROLL) + c * MAX_K_UNROLL
    }
}

impl fmt::Display for RegisterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

fn intensity(a: i64, b: i64) -> f64 {
    (a * b) as f64 / (a + b) as f64
}

/// Number of accumulator buffers per C element: complex times complex keeps
/// the real and imaginary cross terms apart.
pub fn c_blocks(a: ScalarType, b: ScalarType) -> u32 {
    if a.is_complex() && b.is_complex() { 2 } else { 1 }
}

/// Largest register block fitting `register_space` bytes.
///
/// Searches `rows = sgs, 2 sgs, ...` and `cols = 1, 2, ...` maximizing the
/// arithmetic intensity subject to
/// `rows * (cols * c_blocks + K) + cols * K <= register_space / element_size`.
/// Ties keep the first candidate found. When not even `sgs x 1` satisfies the
/// bound, `sgs x 1` is returned anyway and exceeds the budget.
pub fn max_register_block(
    element_size: u32,
    subgroup_size: u32,
    register_space: u32,
    c_blocks: u32,
) -> RegisterBlock {
    let budget = i64::from(register_space / element_size.max(1));
    let sgs = i64::from(subgroup_size.max(1));
    let cb = i64::from(c_blocks.max(1));
    let k = MAX_K_UNROLL;
    let max_rows = |c: i64| ((budget - c * k) / (sgs * (c * cb + k))) * sgs;
    let max_cols = |r: i64| (budget - r * k) / (r * cb + k);

    let mut best = RegisterBlock {
        rows: subgroup_size,
        cols: 1,
    };
    let mut best_intensity = 0.0;
    let mut rows = sgs;
    while rows <= max_rows(1) {
        for cols in 1..=max_cols(rows) {
            let candidate = intensity(rows, cols);
            if candidate > best_intensity {
                best_intensity = candidate;
                best = RegisterBlock {
                    rows: rows as u32,
                    cols: cols as u32,
                };
            }
        }
        rows += sgs;
    }
    best
}

/// K-loop unroll factor: [`MAX_K_UNROLL`], halved while a static `k` is smaller.
pub fn k_unroll(k: i64) -> i64 {
    let mut unroll = MAX_K_UNROLL;
    if !is_dynamic_value(k) {
        while unroll > 1 && k < unroll {
            unroll /= 2;
        }
    }
    unroll
}

/// Shrinks the row count of a register block for a static `m`.
///
/// First to the minimum number of subgroup-sized row blocks covering `m`,
/// then by powers of two while fewer than `m_tiles` tiles would receive work.
pub fn shrink_rows(rows: u32, subgroup_size: u32, m: i64, m_tiles: u32) -> u32 {
    let sgs = i64::from(subgroup_size.max(1));
    let mut row_blocks = (i64::from(rows) / sgs).max(1);
    if !is_dynamic_value(m) {
        let needed = (m + sgs - 1) / sgs;
        if needed < row_blocks {
            row_blocks = needed.max(1);
        } else {
            let block_tiles = |blocks: i64| (m + blocks * sgs - 1) / (blocks * sgs);
            while row_blocks > 1 && block_tiles(row_blocks) < i64::from(m_tiles) {
                row_blocks /= 2;
            }
        }
    }
    (row_blocks * sgs) as u32
}

/// Element type and 2-D shape of an output touched by a BLAS instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlasShape {
    pub ty: ScalarType,
    /// `[rows, cols]`; entries may be dynamic.
    pub shape: [i64; 2],
}

/// Subgroup sizes worth considering for element size `max_size`.
///
/// The smallest offered size always qualifies. For element types narrower
/// than 8 bytes, a larger size qualifies if it is at most the square root of
/// the number of elements fitting half the register space.
fn sensible_subgroup_sizes(core: &CoreConfig, max_size: usize) -> Vec<u32> {
    let mut sizes = core.subgroup_sizes.iter().copied();
    let mut sensible: Vec<u32> = sizes.next().into_iter().collect();
    if max_size < 8 {
        let reals = (core.effective_register_space() as usize / 2) / max_size.max(1);
        let limit = (reals as f64).sqrt() as u32;
        sensible.extend(sizes.filter(|&size| size <= limit));
    }
    sensible
}

/// Chooses the subgroup size for a function touching `shapes`.
///
/// Picks among [`sensible_subgroup_sizes`] the smallest one covering the
/// largest static row count, falling back to the largest sensible size.
/// 8-byte (or wider) element types only ever get the smallest offered size.
pub fn suggest_subgroup_size(shapes: &[BlasShape], core: &CoreConfig) -> Result<u32> {
    let max_size = shapes.iter().map(|s| s.ty.size()).max().unwrap_or(1);
    let sensible = sensible_subgroup_sizes(core, max_size);
    let (Some(&smallest), Some(&largest)) = (sensible.first(), sensible.last()) else {
        return Err(CompilationError::new(Status::UnsupportedSubgroupSize)
            .with_extra("core offers no subgroup size"));
    };
    if sensible.len() == 1 {
        return Ok(smallest);
    }
    let max_rows = largest_static_extent(shapes, 0).unwrap_or(0);
    Ok(sensible
        .iter()
        .copied()
        .find(|&size| i64::from(size) >= max_rows)
        .unwrap_or(largest))
}

/// Largest static extent of `mode` over `shapes`, `None` if all are dynamic.
fn largest_static_extent(shapes: &[BlasShape], mode: usize) -> Option<i64> {
    shapes
        .iter()
        .map(|s| s.shape[mode])
        .filter(|&e| !is_dynamic_value(e))
        .max()
}

/// Grid of subgroups in a work-group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalTiling {
    pub m_tiles: u32,
    pub n_tiles: u32,
}

impl LocalTiling {
    /// Work-group size `[subgroup_size * m_tiles, n_tiles]`.
    pub fn work_group_size(self, subgroup_size: u32) -> [u32; 2] {
        [subgroup_size * self.m_tiles, self.n_tiles]
    }

    /// Inverse of [`LocalTiling::work_group_size`].
    pub fn from_work_group_size(subgroup_size: u32, work_group_size: [u32; 2]) -> Self {
        Self {
            m_tiles: (work_group_size[0] / subgroup_size.max(1)).max(1),
            n_tiles: work_group_size[1].max(1),
        }
    }

    pub fn num_tiles(self) -> u32 {
        self.m_tiles * self.n_tiles
    }
}

impl fmt::Display for LocalTiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.m_tiles, self.n_tiles)
    }
}

/// Blocks of size `block` covering `extent`; unbounded for a dynamic extent.
fn blocks_needed(extent: Option<i64>, block: u32) -> i64 {
    match extent {
        None => i64::MAX,
        Some(extent) => {
            let block = i64::from(block.max(1));
            ((extent + block - 1) / block).max(1)
        }
    }
}

/// Chooses the subgroup grid maximizing `LM * LN / (LM + LN)`.
///
/// `LM = m * rows` and `LN = n * cols` for powers of two `m`, `n` bounded by
/// the blocks the largest static extent of each mode needs and by
/// `max_work_group_size / sgs`. A mode is unbounded only when it is dynamic in
/// every shape.
pub fn suggest_local_tiling(
    shapes: &[BlasShape],
    subgroup_size: u32,
    core: &CoreConfig,
) -> LocalTiling {
    let Some(element_size) = shapes.iter().map(|s| s.ty.size() as u32).max() else {
        return LocalTiling {
            m_tiles: 1,
            n_tiles: 1,
        };
    };
    let cb = if shapes.iter().any(|s| s.ty.is_complex()) { 2 } else { 1 };
    let block = max_register_block(
        element_size,
        subgroup_size,
        core.effective_register_space(),
        cb,
    );
    let m_limit = blocks_needed(largest_static_extent(shapes, 0), block.rows);
    let n_limit = blocks_needed(largest_static_extent(shapes, 1), block.cols);
    let max_threads = i64::from((core.max_work_group_size / subgroup_size.max(1)).max(1));

    let mut best = LocalTiling {
        m_tiles: 1,
        n_tiles: 1,
    };
    let mut best_intensity = 0.0;
    let mut m = 1_i64;
    while m <= m_limit.min(max_threads) {
        let n_bound = n_limit.min(max_threads / m);
        let mut n = 1_i64;
        while 2 * n <= n_bound {
            n *= 2;
        }
        let lm = m * i64::from(block.rows);
        let ln = n * i64::from(block.cols);
        let candidate = intensity(lm, ln);
        if candidate > best_intensity {
            best_intensity = candidate;
            best = LocalTiling {
                m_tiles: m as u32,
                n_tiles: n as u32,
            };
        }
        m *= 2;
    }
    log::trace!("register block {block} -> local tiling {best}");
    best
}

/// One iteration of a subgroup tile loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileIteration {
    /// First element of the block.
    pub block: i64,
    /// Number of elements in the block.
    pub trip: i64,
    /// `true` for the tail block, guarded per lane.
    pub remainder: bool,
}

/// Blocks of `size` visited by tile `tile` when full subgroup-sized blocks
/// are distributed round-robin and the tail goes to the last tile.
pub fn tile_schedule_by_subgroup(
    size: i64,
    subgroup_size: i64,
    num_tiles: i64,
    tile: i64,
) -> Vec<TileIteration> {
    let blocks = size / subgroup_size;
    let rem = size % subgroup_size;
    let mut out = Vec::new();
    let mut block = subgroup_size * tile;
    while block < subgroup_size * blocks {
        out.push(TileIteration {
            block,
            trip: subgroup_size,
            remainder: false,
        });
        block += subgroup_size * num_tiles;
    }
    if rem > 0 && tile == num_tiles - 1 {
        out.push(TileIteration {
            block: blocks * subgroup_size,
            trip: rem,
            remainder: true,
        });
    }
    out
}

/// Chunks of `size` visited by tile `tile` when `size` is split into a
/// multiple of `num_tiles` chunks whose sizes differ by at most one.
pub fn tile_schedule_uniform(
    size: i64,
    block_size: i64,
    num_tiles: i64,
    tile: i64,
) -> Vec<TileIteration> {
    let mut out = Vec::new();
    if size <= 0 {
        return out;
    }
    let blocks = (1 + ((size - 1) / block_size) / num_tiles) * num_tiles;
    let bs = size / blocks;
    let bs1 = bs + 1;
    let rem = size % blocks;
    let mut block = bs1 * tile;
    while block < bs1 * rem {
        out.push(TileIteration {
            block,
            trip: bs1,
            remainder: false,
        });
        block += bs1 * num_tiles;
    }
    if bs > 0 {
        let mut block = bs1 * rem + bs * ((tile + rem % num_tiles) % num_tiles);
        while block < size {
            out.push(TileIteration {
                block,
                trip: bs,
                remainder: false,
            });
            block += bs * num_tiles;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use simtc_ir::{CorePreset, DYNAMIC};

    #[test]
    fn register_block_f32_sgs16() {
        let block = max_register_block(4, 16, 4096, 1);
        assert_eq!(block, RegisterBlock { rows: 32, cols: 19 });
        assert_eq!(block.rows % 16, 0);
        assert!(block.scalar_count(1) <= 4096 / 4);
        // Deterministic across runs.
        assert_eq!(max_register_block(4, 16, 4096, 1), block);
    }

    #[test]
    fn register_block_respects_budget() {
        for &(size, sgs, space, cb) in &[
            (4, 16, 4096, 1),
            (8, 16, 8192, 1),
            (8, 8, 4096, 2),
            (16, 16, 8192, 2),
            (2, 32, 16384, 1),
        ] {
            let block = max_register_block(size, sgs, space, cb);
            assert_eq!(block.rows % sgs, 0);
            assert!(block.cols >= 1);
            assert!(
                block.scalar_count(cb) <= i64::from(space / size),
                "{block} exceeds the budget for {size} B / sgs {sgs}"
            );
        }
    }

    #[test]
    fn single_row_block_is_returned_even_over_budget() {
        let block = max_register_block(8, 32, 512, 1);
        assert_eq!(block, RegisterBlock { rows: 32, cols: 1 });
        assert!(block.scalar_count(1) > 512 / 8);
    }

    #[test]
    fn complex_double_buffering_shrinks_block() {
        let real = max_register_block(8, 16, 8192, 1);
        let complex = max_register_block(8, 16, 8192, 2);
        assert!(complex.intensity() < real.intensity());
        assert_eq!(c_blocks(ScalarType::C32, ScalarType::C32), 2);
        assert_eq!(c_blocks(ScalarType::F32, ScalarType::C32), 1);
    }

    #[test]
    fn k_unroll_halves_for_small_k() {
        assert_eq!(k_unroll(64), 8);
        assert_eq!(k_unroll(5), 4);
        assert_eq!(k_unroll(1), 1);
        assert_eq!(k_unroll(DYNAMIC), 8);
    }

    #[test]
    fn shrink_rows_to_cover_m() {
        assert_eq!(shrink_rows(64, 16, 20, 1), 32);
        assert_eq!(shrink_rows(64, 16, DYNAMIC, 4), 64);
        // 128 rows over 4 tiles: 64-row blocks would leave two tiles idle.
        assert_eq!(shrink_rows(64, 16, 128, 4), 32);
    }

    #[test]
    fn subgroup_size_choice() {
        let core = CoreConfig::preset(CorePreset::Tgl);
        let f64_shape = BlasShape {
            ty: ScalarType::F64,
            shape: [128, 128],
        };
        assert_eq!(suggest_subgroup_size(&[f64_shape], &core).unwrap(), 8);
        let small = BlasShape {
            ty: ScalarType::F32,
            shape: [12, 64],
        };
        assert_eq!(suggest_subgroup_size(&[small], &core).unwrap(), 16);
        let big = BlasShape {
            ty: ScalarType::F32,
            shape: [1024, 64],
        };
        // sqrt(4096 / 2 / 4) = 22 rules out 32 on tgl but not on pvc.
        assert_eq!(suggest_subgroup_size(&[big], &core).unwrap(), 16);
        let pvc = CoreConfig::preset(CorePreset::Pvc);
        assert_eq!(suggest_subgroup_size(&[big], &pvc).unwrap(), 32);
        let dynamic = BlasShape {
            ty: ScalarType::F32,
            shape: [DYNAMIC, 64],
        };
        assert_eq!(suggest_subgroup_size(&[dynamic], &core).unwrap(), 8);
    }

    #[test]
    fn small_register_file_caps_subgroup_size() {
        let big = BlasShape {
            ty: ScalarType::F32,
            shape: [1024, 1024],
        };
        let core = CoreConfig {
            register_space: 2048,
            ..CoreConfig::preset(CorePreset::Tgl)
        };
        assert_eq!(sensible_subgroup_sizes(&core, 4), [8, 16]);
        assert_eq!(suggest_subgroup_size(&[big], &core).unwrap(), 16);

        let tiny = CoreConfig {
            register_space: 512,
            ..core
        };
        assert_eq!(sensible_subgroup_sizes(&tiny, 4), [8]);
        assert_eq!(suggest_subgroup_size(&[big], &tiny).unwrap(), 8);
        let half = BlasShape {
            ty: ScalarType::F16,
            shape: [1024, 1024],
        };
        assert_eq!(suggest_subgroup_size(&[half], &tiny).unwrap(), 8);
    }

    #[test]
    fn static_shape_bounds_tiling_next_to_dynamic_one() {
        let core = CoreConfig::preset(CorePreset::Tgl);
        let fixed = BlasShape {
            ty: ScalarType::F32,
            shape: [64, 64],
        };
        let open = BlasShape {
            ty: ScalarType::F32,
            shape: [DYNAMIC, DYNAMIC],
        };
        let alone = suggest_local_tiling(&[fixed], 16, &core);
        assert_eq!(suggest_local_tiling(&[fixed, open], 16, &core), alone);
        assert_eq!(suggest_local_tiling(&[open, fixed], 16, &core), alone);

        let unbounded = suggest_local_tiling(&[open], 16, &core);
        assert!(unbounded.num_tiles() >= alone.num_tiles());
        let half_open = BlasShape {
            ty: ScalarType::F32,
            shape: [DYNAMIC, 64],
        };
        let rows_open = suggest_local_tiling(&[half_open, fixed], 16, &core);
        assert_eq!(rows_open, alone);
    }

    #[test]
    fn local_tiling_is_legal() {
        for preset in CorePreset::ALL {
            let core = CoreConfig::preset(preset);
            for &sgs in &core.subgroup_sizes {
                for shape in [[64, 64], [1024, 1024], [DYNAMIC, DYNAMIC], [8, 4096]] {
                    let shapes = [BlasShape {
                        ty: ScalarType::F32,
                        shape,
                    }];
                    let tiling = suggest_local_tiling(&shapes, sgs, &core);
                    let wgs = tiling.work_group_size(sgs);
                    assert_eq!(wgs[0] % sgs, 0);
                    assert!(wgs[0] * wgs[1] <= core.max_work_group_size);
                    assert!(core.check_launch(sgs, wgs).is_ok());
                }
            }
        }
    }

    #[test]
    fn empty_shapes_give_single_subgroup() {
        let core = CoreConfig::default();
        let tiling = suggest_local_tiling(&[], 16, &core);
        assert_eq!(tiling.work_group_size(16), [16, 1]);
    }

    #[test]
    fn subgroup_schedule_37_by_16_over_2_tiles() {
        let t0 = tile_schedule_by_subgroup(37, 16, 2, 0);
        let t1 = tile_schedule_by_subgroup(37, 16, 2, 1);
        assert_eq!(
            t0,
            vec![TileIteration {
                block: 0,
                trip: 16,
                remainder: false
            }]
        );
        assert_eq!(
            t1,
            vec![
                TileIteration {
                    block: 16,
                    trip: 16,
                    remainder: false
                },
                TileIteration {
                    block: 32,
                    trip: 5,
                    remainder: true
                }
            ]
        );
    }

    #[test]
    fn uniform_schedule_covers_range_once() {
        for size in [0, 1, 7, 37, 100, 129] {
            for tiles in [1, 2, 3, 4] {
                let mut covered = vec![0; size as usize];
                let mut trips = Vec::new();
                for tile in 0..tiles {
                    for it in tile_schedule_uniform(size, 16, tiles, tile) {
                        trips.push(it.trip);
                        for i in it.block..it.block + it.trip {
                            covered[i as usize] += 1;
                        }
                    }
                }
                assert!(covered.iter().all(|&c| c == 1), "size {size} tiles {tiles}");
                if let (Some(min), Some(max)) = (trips.iter().min(), trips.iter().max()) {
                    assert!(max - min <= 1);
                }
            }
        }
    }
}
