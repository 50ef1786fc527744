//! Stage-level operations.
//!
//! Each function applies one stage of an algorithm to the local tiles of a
//! region as a batch of independent tile jobs, grouped by shape and device,
//! and hands the batch to the execution backend. Operands are read where
//! the written tile lives: on the host, or on the tile's device for the
//! accelerator target. Every read is recorded so the copies it used are
//! ticked once the batch has finished.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use tessera_compute::{create_backend, ComputeError, ExecutionBackend, GroupKey, Job, JobGroup, Target};

use crate::error::{Result, TileError};
use crate::matrix::Matrix;
use crate::options::Options;
use crate::scalar::Scalar;
use crate::tile::Tile;
use crate::tile_blas;
use crate::types::{Diag, MatrixKind, Residency, Side, Uplo};

/// Jobs of one stage and the tile uses they will consume.
pub(crate) struct Stage<T: Scalar> {
    backend: Arc<dyn ExecutionBackend>,
    groups: BTreeMap<GroupKey, Vec<Job>>,
    uses: Vec<(Matrix<T>, usize, usize, Residency)>,
}

impl<T: Scalar> Stage<T> {
    pub(crate) fn new(backend: &Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend: Arc::clone(backend),
            groups: BTreeMap::new(),
            uses: Vec::new(),
        }
    }

    pub(crate) fn target(&self) -> Target {
        self.backend.target()
    }

    /// Where output tile `(i, j)` of `c` is computed.
    pub(crate) fn residency(&self, c: &Matrix<T>, i: usize, j: usize) -> Residency {
        c.target_residency(i, j, self.target())
    }

    /// Tile `(i, j)` of `a` readable at `at`, counted as one use.
    pub(crate) fn read(&mut self, a: &Matrix<T>, i: usize, j: usize, at: Residency) -> Result<Tile<T>> {
        let tile = match at {
            Residency::Host => a.tile(i, j)?,
            device => match a.tile_at(i, j, device) {
                Ok(tile) => tile,
                Err(TileError::NotLocal { .. }) => a.copy_tile_to(i, j, device, 1)?,
                Err(e) => return Err(e),
            },
        };
        self.uses.push((a.clone(), i, j, at));
        Ok(tile)
    }

    /// Tile `(i, j)` of `c`, writable at `at`.
    pub(crate) fn write(&self, c: &Matrix<T>, i: usize, j: usize, at: Residency) -> Result<Tile<T>> {
        c.tile_for_write(i, j, at)
    }

    pub(crate) fn push<F>(&mut self, out: &Tile<T>, k: usize, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let key = GroupKey {
            m: out.mb(),
            n: out.nb(),
            k,
            device: out.residency().device(),
        };
        let job: Job = Box::new(move || job().map_err(ComputeError::from));
        self.groups.entry(key).or_default().push(job);
    }

    /// Run every job, then tick the copies they read.
    pub(crate) fn run(self) -> Result<()> {
        let groups: Vec<JobGroup> = self
            .groups
            .into_iter()
            .map(|(key, jobs)| JobGroup { key, jobs })
            .collect();
        let result = if groups.is_empty() {
            Ok(())
        } else {
            self.backend.run_grouped(groups)
        };
        for (a, i, j, at) in &self.uses {
            if *at != Residency::Host {
                a.tick_at(*i, *j, *at);
            }
            a.tick(*i, *j);
        }
        result.map_err(TileError::from)
    }
}

/// The backend selected by `opts` for the ranks and devices of `a`.
pub(crate) fn backend_for<T: Scalar>(a: &Matrix<T>, opts: &Options) -> Result<Arc<dyn ExecutionBackend>> {
    Ok(create_backend(opts.target, a.context())?)
}

pub(crate) fn check_shape(what: &str, got: (usize, usize), want: (usize, usize)) -> Result<()> {
    if got != want {
        return Err(TileError::ShapeMismatch(format!(
            "{what}: got {}x{}, expected {}x{}",
            got.0, got.1, want.0, want.1
        )));
    }
    Ok(())
}

fn conj_transposed<T: Scalar>(tile: &Tile<T>, conj: bool) -> Result<Tile<T>> {
    let flipped = if conj {
        tile.conj_transpose()
    } else {
        tile.transpose()
    };
    flipped.ok_or_else(|| {
        TileError::ShapeMismatch("cannot mix transpose and conjugate transpose of a tile".into())
    })
}

/// Whether `(i, j)` lies in the `uplo` triangle of the tile grid.
pub(crate) fn in_triangle(uplo: Uplo, i: usize, j: usize) -> bool {
    match uplo {
        Uplo::Lower => i >= j,
        Uplo::Upper => i <= j,
        Uplo::General => true,
    }
}

/// Whether tile `(i, j)` of a view of `kind` holds stored entries.
pub(crate) fn holds_entries(kind: MatrixKind, nb: usize, i: usize, j: usize) -> bool {
    let nb = nb.max(1);
    let within = |lower: usize, upper: usize| j <= i + upper.div_ceil(nb) && i <= j + lower.div_ceil(nb);
    match kind {
        MatrixKind::General => true,
        MatrixKind::Band { kl, ku } => within(kl, ku),
        MatrixKind::Triangular { uplo, .. }
        | MatrixKind::Hermitian { uplo }
        | MatrixKind::Symmetric { uplo } => in_triangle(uplo, i, j),
        MatrixKind::TriangularBand { uplo, kd, .. } => in_triangle(uplo, i, j) && within(kd, kd),
    }
}

/// Write back device results and drop every copy made of `c`'s tiles.
pub(crate) fn finish<T: Scalar>(c: &Matrix<T>) {
    c.update_all_origin();
    c.release_copies();
}

/// `C = alpha A B + beta C` for a column panel `A` (`c.mt() × 1`) and a
/// row panel `B` (`1 × c.nt()`).
pub(crate) fn gemm<T: Scalar>(
    alpha: T,
    a: &Matrix<T>,
    b: &Matrix<T>,
    beta: T,
    c: &Matrix<T>,
    backend: &Arc<dyn ExecutionBackend>,
) -> Result<()> {
    let mut stage = Stage::new(backend);
    for (i, j) in c.local_tiles() {
        let at = stage.residency(c, i, j);
        let ta = stage.read(a, i, 0, at)?;
        let tb = stage.read(b, 0, j, at)?;
        let tc = stage.write(c, i, j, at)?;
        stage.push(&tc.clone(), ta.nb(), move || tile_blas::gemm(alpha, &ta, &tb, beta, &tc));
    }
    stage.run()
}

/// One column of a Hermitian (`conj`) or symmetric multiply from the left:
/// `C(i, :) = alpha A(i, k) B(k, :) + beta C(i, :)` for every tile row `i`,
/// where `A(i, k)` is read from whichever triangle of `a` is stored.
#[allow(clippy::too_many_arguments)]
pub(crate) fn hemm_column<T: Scalar>(
    alpha: T,
    a: &Matrix<T>,
    k: usize,
    b: &Matrix<T>,
    beta: T,
    c: &Matrix<T>,
    conj: bool,
    backend: &Arc<dyn ExecutionBackend>,
) -> Result<()> {
    let uplo = a.uplo();
    let mut stage = Stage::new(backend);
    for (i, j) in c.local_tiles() {
        let at = stage.residency(c, i, j);
        let tb = stage.read(b, 0, j, at)?;
        let tc = stage.write(c, i, j, at)?;
        if i == k {
            let ta = stage.read(a, k, k, at)?;
            stage.push(&tc.clone(), ta.nb(), move || {
                if conj {
                    tile_blas::hemm(Side::Left, alpha, &ta, &tb, beta, &tc)
                } else {
                    tile_blas::symm(Side::Left, alpha, &ta, &tb, beta, &tc)
                }
            });
        } else {
            let ta = if in_triangle(uplo, i, k) {
                stage.read(a, i, k, at)?
            } else {
                conj_transposed(&stage.read(a, k, i, at)?, conj)?
            };
            stage.push(&tc.clone(), ta.nb(), move || tile_blas::gemm(alpha, &ta, &tb, beta, &tc));
        }
    }
    stage.run()
}

/// Rank-1-tile update of columns `cols` of the stored triangle of `c`:
/// `C(i, j) = alpha A(i) A(j)^H + beta C(i, j)`, with `A^T` instead of
/// `A^H` when `conj` is false. `a` is a column panel with `c.mt()` tiles.
/// Diagonal tiles keep a real diagonal in the Hermitian case.
#[allow(clippy::too_many_arguments)]
pub(crate) fn rank_k<T: Scalar>(
    alpha: T,
    a: &Matrix<T>,
    beta: T,
    c: &Matrix<T>,
    cols: Range<usize>,
    conj: bool,
    backend: &Arc<dyn ExecutionBackend>,
) -> Result<()> {
    let uplo = c.uplo();
    if uplo == Uplo::General {
        return Err(TileError::ShapeMismatch(
            "rank-k update needs a Hermitian or symmetric C".into(),
        ));
    }
    let mut stage = Stage::new(backend);
    for (i, j) in c.local_tiles() {
        if !cols.contains(&j) || !in_triangle(uplo, i, j) {
            continue;
        }
        let at = stage.residency(c, i, j);
        let ai = stage.read(a, i, 0, at)?;
        let tc = stage.write(c, i, j, at)?;
        if i == j {
            stage.push(&tc.clone(), ai.nb(), move || {
                if conj {
                    tile_blas::herk(alpha.re(), &ai, beta.re(), &tc)
                } else {
                    tile_blas::syrk(alpha, &ai, beta, &tc)
                }
            });
        } else {
            let aj = conj_transposed(&stage.read(a, j, 0, at)?, conj)?;
            stage.push(&tc.clone(), ai.nb(), move || tile_blas::gemm(alpha, &ai, &aj, beta, &tc));
        }
    }
    stage.run()
}

/// Views of `c` owning the tiles that consume panel tile `i` in
/// [`rank_k`]: the parts of tile row `i` and tile column `i` inside the
/// stored triangle.
pub(crate) fn rank_k_consumers<T: Scalar>(c: &Matrix<T>, i: usize) -> Result<Vec<Matrix<T>>> {
    let nt = c.nt();
    Ok(match c.uplo() {
        Uplo::Upper => vec![c.sub(i..i + 1, i..nt)?, c.sub(0..i, i..i + 1)?],
        _ => vec![c.sub(i..i + 1, 0..i + 1)?, c.sub(i + 1..nt, i..i + 1)?],
    })
}

/// Triangular solve of every local tile of the panel `b` against the single
/// tile of `a`.
pub(crate) fn trsm<T: Scalar>(
    side: Side,
    diag: Diag,
    alpha: T,
    a: &Matrix<T>,
    b: &Matrix<T>,
    backend: &Arc<dyn ExecutionBackend>,
) -> Result<()> {
    let mut stage = Stage::new(backend);
    for (i, j) in b.local_tiles() {
        let at = stage.residency(b, i, j);
        let ta = stage.read(a, 0, 0, at)?;
        let tb = stage.write(b, i, j, at)?;
        stage.push(&tb.clone(), ta.nb(), move || tile_blas::trsm(side, diag, alpha, &ta, &tb));
    }
    stage.run()
}

/// `C = alpha C` on every local tile.
pub(crate) fn scale<T: Scalar>(alpha: T, c: &Matrix<T>, backend: &Arc<dyn ExecutionBackend>) -> Result<()> {
    let mut stage = Stage::new(backend);
    for (i, j) in c.local_tiles() {
        let at = stage.residency(c, i, j);
        let tc = stage.write(c, i, j, at)?;
        stage.push(&tc.clone(), 0, move || {
            tile_blas::scale(alpha, &tc);
            Ok(())
        });
    }
    stage.run()
}
