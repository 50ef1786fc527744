//! Tile-to-owner maps.
//!
//! Owners are injected functions of the tile coordinate, so any mapping can
//! be plugged in. The defaults implement the 2D block-cyclic layout over a
//! column-major `p × q` process grid, with accelerators cycled over the
//! block columns a rank owns.

use std::sync::Arc;

/// Maps a tile coordinate `(i, j)` to a rank or a device index.
pub type TileFn = Arc<dyn Fn(usize, usize) -> usize + Send + Sync>;

/// Shape of a 2D process grid. Rank `r` sits at row `r % p`, column `r / p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGrid {
    pub p: usize,
    pub q: usize,
}

impl ProcessGrid {
    pub fn new(p: usize, q: usize) -> Self {
        Self { p, q }
    }

    pub fn size(&self) -> usize {
        self.p * self.q
    }

    /// Grid coordinates `(row, col)` of `rank`.
    pub fn coords(&self, rank: usize) -> (usize, usize) {
        (rank % self.p, rank / self.p)
    }
}

/// Owner rank of tile `(i, j)` in the 2D block-cyclic layout.
pub fn block_cyclic_rank(grid: ProcessGrid) -> TileFn {
    let ProcessGrid { p, q } = grid;
    Arc::new(move |i: usize, j: usize| (i % p) + (j % q) * p)
}

/// Owner device of tile `(i, j)`: the rank's block columns are dealt out to
/// its devices in turn. Always 0 without devices.
pub fn block_cyclic_device(grid: ProcessGrid, num_devices: usize) -> TileFn {
    let q = grid.q;
    Arc::new(move |_i: usize, j: usize| if num_devices == 0 { 0 } else { (j / q) % num_devices })
}

/// Rank and device maps of a matrix.
#[derive(Clone)]
pub struct Distribution {
    pub(crate) rank: TileFn,
    pub(crate) device: TileFn,
}

impl Distribution {
    pub fn new(rank: TileFn, device: TileFn) -> Self {
        Self { rank, device }
    }

    pub fn block_cyclic(grid: ProcessGrid, num_devices: usize) -> Self {
        Self {
            rank: block_cyclic_rank(grid),
            device: block_cyclic_device(grid, num_devices),
        }
    }

    pub fn rank_of(&self, i: usize, j: usize) -> usize {
        (self.rank)(i, j)
    }

    pub fn device_of(&self, i: usize, j: usize) -> usize {
        (self.device)(i, j)
    }
}

impl std::fmt::Debug for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Distribution { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_cyclic_is_column_major_over_grid() {
        let grid = ProcessGrid::new(2, 3);
        let rank = block_cyclic_rank(grid);
        assert_eq!(rank(0, 0), 0);
        assert_eq!(rank(1, 0), 1);
        assert_eq!(rank(0, 1), 2);
        assert_eq!(rank(3, 5), 1 + 2 * 2);
        assert_eq!(grid.coords(5), (1, 2));
        assert_eq!(rank(2, 3), 0);
    }

    #[test]
    fn test_devices_cycle_over_block_columns() {
        let device = block_cyclic_device(ProcessGrid::new(1, 2), 2);
        let owned: Vec<_> = (0..8).map(|j| device(0, j)).collect();
        assert_eq!(owned, vec![0, 0, 1, 1, 0, 0, 1, 1]);
        assert_eq!(block_cyclic_device(ProcessGrid::new(1, 1), 0)(4, 4), 0);
    }
}
