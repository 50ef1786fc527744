//! Distributed matrices and their views.
//!
//! A [`Matrix`] is a cheap view onto shared [`storage::MatrixStorage`]: a
//! rectangular range of tiles, an orientation and a structural kind.
//! Cloning, slicing and transposing a view never touches tile data.
//!
//! Tile coordinates passed to a view are *logical*: relative to the view and
//! after its orientation is applied.
//!
//! Every view registers the tiles it covers with the storage and
//! unregisters them when dropped or released, so scratch tiles live exactly
//! as long as some view still covers them.

mod storage;

use std::ops::Range;
use std::sync::Arc;

use ndarray::{s, Array2};
use tessera_compute::{Context, MessageKey, Target};

use crate::distribution::{Distribution, ProcessGrid, TileFn};
use crate::error::{Result, TileError};
use crate::scalar::Scalar;
use crate::tile::Tile;
use crate::types::{Diag, Layout, MatrixKind, Op, Residency, Uplo};

use storage::{InstanceKind, MatrixStorage, TileSpan};

/// Message tag reserved for the all-gather of [`Matrix::to_dense`].
const GATHER_TAG: i64 = -1;

/// A view of a tile-distributed matrix.
pub struct Matrix<T: Scalar> {
    storage: Arc<MatrixStorage<T>>,
    view: u64,
    ioff: usize,
    joff: usize,
    pmt: usize,
    pnt: usize,
    op: Op,
    kind: MatrixKind,
}

impl<T: Scalar> Clone for Matrix<T> {
    fn clone(&self) -> Self {
        self.with_parts(self.op, self.kind)
    }
}

impl<T: Scalar> Drop for Matrix<T> {
    fn drop(&mut self) {
        self.storage.retire(self.view);
    }
}

impl<T: Scalar> std::fmt::Debug for Matrix<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matrix")
            .field("uid", &self.storage.uid)
            .field("m", &self.m())
            .field("n", &self.n())
            .field("mt", &self.mt())
            .field("nt", &self.nt())
            .field("op", &self.op)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<T: Scalar> Matrix<T> {
    // ─────────────────────────────────────────────────────────────
    // Construction
    // ─────────────────────────────────────────────────────────────

    /// An `m × n` matrix with `nb × nb` tiles, 2D block-cyclic over a
    /// `p × q` grid. No tiles are allocated.
    pub fn new(m: usize, n: usize, nb: usize, p: usize, q: usize, ctx: &Context) -> Result<Self> {
        let grid = ProcessGrid::new(p, q);
        if grid.size() != ctx.size() {
            return Err(TileError::ShapeMismatch(format!(
                "process grid {p}x{q} does not match {} ranks",
                ctx.size()
            )));
        }
        Self::with_distribution(m, n, nb, Distribution::block_cyclic(grid, ctx.num_devices()), ctx)
    }

    /// An `m × n` matrix with caller-supplied owner maps.
    pub fn with_distribution(
        m: usize,
        n: usize,
        nb: usize,
        dist: Distribution,
        ctx: &Context,
    ) -> Result<Self> {
        if nb == 0 {
            return Err(TileError::ShapeMismatch("tile size must be positive".into()));
        }
        let storage = Arc::new(MatrixStorage::new(m, n, nb, dist, ctx.clone()));
        log::debug!(
            "matrix {}: {m}x{n}, nb {nb}, {}x{} tiles",
            storage.uid,
            storage.mt,
            storage.nt
        );
        Ok(Self::from_storage(storage))
    }

    fn from_storage(storage: Arc<MatrixStorage<T>>) -> Self {
        let extent = (storage.mt, storage.nt);
        Self::attach(storage, (0, 0), extent, Op::NoTrans, MatrixKind::General)
    }

    /// Register a view of `extent` tiles starting at physical tile `offset`.
    fn attach(
        storage: Arc<MatrixStorage<T>>,
        offset: (usize, usize),
        extent: (usize, usize),
        op: Op,
        kind: MatrixKind,
    ) -> Self {
        let (ioff, joff) = offset;
        let (pmt, pnt) = extent;
        let view = storage.attach(TileSpan::new(ioff..ioff + pmt, joff..joff + pnt));
        Self {
            storage,
            view,
            ioff,
            joff,
            pmt,
            pnt,
            op,
            kind,
        }
    }

    /// Another view of the same tiles with a different orientation or kind.
    fn with_parts(&self, op: Op, kind: MatrixKind) -> Self {
        Self::attach(
            Arc::clone(&self.storage),
            (self.ioff, self.joff),
            (self.pmt, self.pnt),
            op,
            kind,
        )
    }

    fn span(&self) -> TileSpan {
        TileSpan::new(self.ioff..self.ioff + self.pmt, self.joff..self.joff + self.pnt)
    }

    /// Copy the local tiles out of a full `m × n` buffer. `data[i + j * lda]`
    /// holds entry `(i, j)` in column-major layout.
    #[allow(clippy::too_many_arguments)]
    pub fn from_col_major(
        m: usize,
        n: usize,
        data: &[T],
        lda: usize,
        nb: usize,
        p: usize,
        q: usize,
        ctx: &Context,
    ) -> Result<Self> {
        Self::from_buffer(m, n, data, lda, Layout::ColMajor, nb, p, q, ctx)
    }

    /// Copy the local tiles out of a full buffer in either layout.
    #[allow(clippy::too_many_arguments)]
    pub fn from_buffer(
        m: usize,
        n: usize,
        data: &[T],
        ld: usize,
        layout: Layout,
        nb: usize,
        p: usize,
        q: usize,
        ctx: &Context,
    ) -> Result<Self> {
        let (rows, cols) = match layout {
            Layout::ColMajor => (m, n),
            Layout::RowMajor => (n, m),
        };
        check_buffer(data.len(), rows, cols, ld)?;
        let a = Self::new(m, n, nb, p, q, ctx)?;
        let st = &a.storage;
        for (i, j) in a.local_tiles() {
            let (r0, c0) = (i * nb, j * nb);
            let block = Array2::from_shape_fn((st.tile_mb(i), st.tile_nb(j)), |(r, c)| {
                match layout {
                    Layout::ColMajor => data[(r0 + r) + (c0 + c) * ld],
                    Layout::RowMajor => data[(c0 + c) + (r0 + r) * ld],
                }
            });
            st.insert_origin(i, j, Residency::Host, InstanceKind::Origin, block)?;
        }
        Ok(a)
    }

    /// Copy the local tiles out of this rank's part of a 2D block-cyclic
    /// distributed buffer (column-major, leading dimension `lld`).
    #[allow(clippy::too_many_arguments)]
    pub fn from_block_cyclic(
        m: usize,
        n: usize,
        local: &[T],
        lld: usize,
        nb: usize,
        p: usize,
        q: usize,
        ctx: &Context,
    ) -> Result<Self> {
        let a = Self::new(m, n, nb, p, q, ctx)?;
        let grid = ProcessGrid::new(p, q);
        let (myrow, mycol) = grid.coords(ctx.rank());
        let local_m = local_extent(m, nb, myrow, p);
        let local_n = local_extent(n, nb, mycol, q);
        check_buffer(local.len(), local_m, local_n, lld)?;
        let st = &a.storage;
        for (i, j) in a.local_tiles() {
            let (r0, c0) = ((i / p) * nb, (j / q) * nb);
            let block = Array2::from_shape_fn((st.tile_mb(i), st.tile_nb(j)), |(r, c)| {
                local[(r0 + r) + (c0 + c) * lld]
            });
            st.insert_origin(i, j, Residency::Host, InstanceKind::Origin, block)?;
        }
        Ok(a)
    }

    /// Write the local tiles back into this rank's part of a 2D
    /// block-cyclic buffer. The view must be a whole, untransposed matrix
    /// distributed over the `p × q` grid.
    pub fn copy_to_block_cyclic(&self, local: &mut [T], lld: usize, p: usize, q: usize) -> Result<()> {
        if self.op != Op::NoTrans || self.ioff != 0 || self.joff != 0 {
            return Err(TileError::ShapeMismatch(
                "block-cyclic export needs a whole untransposed matrix".into(),
            ));
        }
        let nb = self.storage.nb;
        let (myrow, mycol) = ProcessGrid::new(p, q).coords(self.storage.ctx.rank());
        check_buffer(
            local.len(),
            local_extent(self.storage.m, nb, myrow, p),
            local_extent(self.storage.n, nb, mycol, q),
            lld,
        )?;
        for (i, j) in self.local_tiles() {
            let block = self.tile(i, j)?.to_logical();
            let (r0, c0) = ((i / p) * nb, (j / q) * nb);
            for ((r, c), x) in block.indexed_iter() {
                local[(r0 + r) + (c0 + c) * lld] = *x;
            }
        }
        Ok(())
    }

    /// Fresh storage with this view's shape and distribution, possibly of
    /// another element type. No tiles are allocated.
    pub fn empty_like<U: Scalar>(&self) -> Matrix<U> {
        let st = &self.storage;
        let (ioff, joff) = (self.ioff, self.joff);
        let rank = Arc::clone(&st.dist.rank);
        let device = Arc::clone(&st.dist.device);
        let dist = Distribution::new(
            Arc::new(move |i: usize, j: usize| rank(i + ioff, j + joff)) as TileFn,
            Arc::new(move |i: usize, j: usize| device(i + ioff, j + joff)) as TileFn,
        );
        let storage = Arc::new(MatrixStorage::<U>::new(
            self.physical_rows(),
            self.physical_cols(),
            st.nb,
            dist,
            st.ctx.clone(),
        ));
        Matrix::<U>::attach(storage, (0, 0), (self.pmt, self.pnt), self.op, self.kind)
    }

    // ─────────────────────────────────────────────────────────────
    // Shape and ownership
    // ─────────────────────────────────────────────────────────────

    fn transposed(&self) -> bool {
        self.op.is_transposed()
    }

    fn physical_rows(&self) -> usize {
        let nb = self.storage.nb;
        self.storage.m.min((self.ioff + self.pmt) * nb) - (self.ioff * nb).min(self.storage.m)
    }

    fn physical_cols(&self) -> usize {
        let nb = self.storage.nb;
        self.storage.n.min((self.joff + self.pnt) * nb) - (self.joff * nb).min(self.storage.n)
    }

    pub fn m(&self) -> usize {
        if self.transposed() {
            self.physical_cols()
        } else {
            self.physical_rows()
        }
    }

    pub fn n(&self) -> usize {
        if self.transposed() {
            self.physical_rows()
        } else {
            self.physical_cols()
        }
    }

    pub fn mt(&self) -> usize {
        if self.transposed() {
            self.pnt
        } else {
            self.pmt
        }
    }

    pub fn nt(&self) -> usize {
        if self.transposed() {
            self.pmt
        } else {
            self.pnt
        }
    }

    /// Nominal tile size.
    pub fn nb(&self) -> usize {
        self.storage.nb
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn kind(&self) -> MatrixKind {
        self.kind
    }

    pub fn uplo(&self) -> Uplo {
        self.kind.uplo()
    }

    pub fn diag(&self) -> Diag {
        self.kind.diag()
    }

    pub fn context(&self) -> &Context {
        &self.storage.ctx
    }

    /// Identifier shared by all views of the same storage.
    pub fn uid(&self) -> u64 {
        self.storage.uid
    }

    /// Whether two views share storage.
    pub fn same_storage<U: Scalar>(&self, other: &Matrix<U>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.storage) as *const (),
            Arc::as_ptr(&other.storage) as *const (),
        )
    }

    /// Physical coordinates of logical tile `(i, j)`.
    pub(crate) fn phys(&self, i: usize, j: usize) -> (usize, usize) {
        if self.transposed() {
            (self.ioff + j, self.joff + i)
        } else {
            (self.ioff + i, self.joff + j)
        }
    }

    fn check(&self, i: usize, j: usize) -> Result<(usize, usize)> {
        if i >= self.mt() || j >= self.nt() {
            return Err(TileError::IndexOutOfRange(format!(
                "tile ({i}, {j}) outside {}x{} tiles",
                self.mt(),
                self.nt()
            )));
        }
        Ok(self.phys(i, j))
    }

    /// Rows of logical tile row `i`.
    pub fn tile_mb(&self, i: usize) -> Result<usize> {
        if i >= self.mt() {
            return Err(TileError::IndexOutOfRange(format!(
                "tile row {i} outside {} tile rows",
                self.mt()
            )));
        }
        Ok(if self.transposed() {
            self.storage.tile_nb(self.joff + i)
        } else {
            self.storage.tile_mb(self.ioff + i)
        })
    }

    /// Columns of logical tile column `j`.
    pub fn tile_nb(&self, j: usize) -> Result<usize> {
        if j >= self.nt() {
            return Err(TileError::IndexOutOfRange(format!(
                "tile column {j} outside {} tile columns",
                self.nt()
            )));
        }
        Ok(if self.transposed() {
            self.storage.tile_mb(self.ioff + j)
        } else {
            self.storage.tile_nb(self.joff + j)
        })
    }

    pub fn tile_rank(&self, i: usize, j: usize) -> usize {
        let (pi, pj) = self.phys(i, j);
        self.storage.rank_of(pi, pj)
    }

    pub fn tile_device(&self, i: usize, j: usize) -> usize {
        let (pi, pj) = self.phys(i, j);
        self.storage.device_of(pi, pj)
    }

    pub fn is_local(&self, i: usize, j: usize) -> bool {
        self.tile_rank(i, j) == self.storage.ctx.rank()
    }

    /// Logical coordinates of every local tile of the view, column by column.
    pub fn local_tiles(&self) -> Vec<(usize, usize)> {
        let mut tiles = Vec::new();
        for j in 0..self.nt() {
            for i in 0..self.mt() {
                if self.is_local(i, j) {
                    tiles.push((i, j));
                }
            }
        }
        tiles
    }

    /// Residency used for tile `(i, j)` by `target`.
    pub fn target_residency(&self, i: usize, j: usize, target: Target) -> Residency {
        match target {
            Target::Devices => Residency::Device(self.tile_device(i, j)),
            _ => Residency::Host,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Views
    // ─────────────────────────────────────────────────────────────

    /// Tiles `rows × cols` of this view. A square block on the diagonal
    /// keeps the view's kind; any other block is general.
    pub fn sub(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Self> {
        if rows.start > rows.end || rows.end > self.mt() || cols.start > cols.end || cols.end > self.nt() {
            return Err(TileError::IndexOutOfRange(format!(
                "sub-range {rows:?} x {cols:?} outside {}x{} tiles",
                self.mt(),
                self.nt()
            )));
        }
        let kind = if rows == cols {
            self.kind
        } else {
            MatrixKind::General
        };
        let (prows, pcols) = if self.transposed() {
            (cols, rows)
        } else {
            (rows, cols)
        };
        Ok(Self::attach(
            Arc::clone(&self.storage),
            (self.ioff + prows.start, self.joff + pcols.start),
            (prows.len(), pcols.len()),
            self.op,
            kind,
        ))
    }

    fn with_op(&self, op: Op) -> Result<Self> {
        let op = match self.op.compose(op) {
            Some(op) => op,
            None if !T::IS_COMPLEX => Op::NoTrans,
            None => {
                return Err(TileError::ShapeMismatch(
                    "mixing transpose and conjugate transpose of a complex view".into(),
                ))
            }
        };
        Ok(self.with_parts(op, self.kind.transposed()))
    }

    pub fn transpose(&self) -> Result<Self> {
        self.with_op(Op::Trans)
    }

    pub fn conj_transpose(&self) -> Result<Self> {
        self.with_op(Op::ConjTrans)
    }

    fn with_kind(&self, kind: MatrixKind) -> Result<Self> {
        let square = !matches!(kind, MatrixKind::General | MatrixKind::Band { .. });
        if square && (self.mt() != self.nt() || self.m() != self.n()) {
            return Err(TileError::ShapeMismatch(format!(
                "{kind:?} view needs a square matrix, got {}x{}",
                self.m(),
                self.n()
            )));
        }
        Ok(self.with_parts(self.op, kind))
    }

    pub fn general(&self) -> Self {
        self.with_parts(self.op, MatrixKind::General)
    }

    pub fn hermitian(&self, uplo: Uplo) -> Result<Self> {
        self.with_kind(MatrixKind::Hermitian { uplo })
    }

    pub fn symmetric(&self, uplo: Uplo) -> Result<Self> {
        self.with_kind(MatrixKind::Symmetric { uplo })
    }

    pub fn triangular(&self, uplo: Uplo, diag: Diag) -> Result<Self> {
        self.with_kind(MatrixKind::Triangular { uplo, diag })
    }

    pub fn band(&self, kl: usize, ku: usize) -> Result<Self> {
        self.with_kind(MatrixKind::Band { kl, ku })
    }

    pub fn triangular_band(&self, uplo: Uplo, diag: Diag, kd: usize) -> Result<Self> {
        self.with_kind(MatrixKind::TriangularBand { uplo, diag, kd })
    }

    // ─────────────────────────────────────────────────────────────
    // Tile access
    // ─────────────────────────────────────────────────────────────

    /// Stored triangle of tile `(i, j)`: the view's triangle on the
    /// view's diagonal, general elsewhere.
    fn stored_uplo(&self, i: usize, j: usize) -> Uplo {
        if i == j {
            self.kind.uplo().under(self.op)
        } else {
            Uplo::General
        }
    }

    fn handle(&self, i: usize, j: usize, data: crate::tile::TileData<T>, residency: Residency) -> Tile<T> {
        Tile::new(data, self.op, self.stored_uplo(i, j), residency)
    }

    /// The origin of a local tile or the replica of a received one.
    pub fn tile(&self, i: usize, j: usize) -> Result<Tile<T>> {
        let (pi, pj) = self.check(i, j)?;
        let residency = self.storage.origin_of(pi, pj).unwrap_or(Residency::Host);
        let data = self.storage.find(pi, pj, residency)?;
        Ok(self.handle(i, j, data, residency))
    }

    /// The valid instance of tile `(i, j)` at `residency`.
    pub fn tile_at(&self, i: usize, j: usize, residency: Residency) -> Result<Tile<T>> {
        let (pi, pj) = self.check(i, j)?;
        let data = self.storage.find(pi, pj, residency)?;
        Ok(self.handle(i, j, data, residency))
    }

    /// Tile `(i, j)` prepared for writing at `residency`; every other
    /// instance becomes stale.
    pub fn tile_for_write(&self, i: usize, j: usize, residency: Residency) -> Result<Tile<T>> {
        let (pi, pj) = self.check(i, j)?;
        let data = self.storage.acquire_write(pi, pj, residency)?;
        Ok(self.handle(i, j, data, residency))
    }

    /// Whether this rank holds any instance of tile `(i, j)`.
    pub fn has_tile(&self, i: usize, j: usize) -> bool {
        self.check(i, j)
            .map(|(pi, pj)| self.storage.has_tile(pi, pj))
            .unwrap_or(false)
    }

    // ─────────────────────────────────────────────────────────────
    // Tile lifecycle
    // ─────────────────────────────────────────────────────────────

    fn insert_tiles(&self, target: Target, kind: InstanceKind) -> Result<()> {
        for (i, j) in self.local_tiles() {
            let (pi, pj) = self.phys(i, j);
            let residency = self.target_residency(i, j, target);
            let block = Array2::zeros((self.storage.tile_mb(pi), self.storage.tile_nb(pj)));
            self.storage.insert_origin(pi, pj, residency, kind, block)?;
        }
        Ok(())
    }

    /// Allocate zeroed origin tiles for every local tile of the view.
    pub fn insert_local_tiles(&self, target: Target) -> Result<()> {
        self.insert_tiles(target, InstanceKind::Origin)
    }

    /// Allocate zeroed scratch tiles. Each one is freed once every view
    /// covering it has been released or dropped.
    pub fn insert_workspace_tiles(&self, target: Target) -> Result<()> {
        self.storage.reattach(self.view, self.span());
        self.insert_tiles(target, InstanceKind::Workspace)
    }

    /// Bring a writable copy of tile `(i, j)` to `residency`.
    pub fn move_tile(&self, i: usize, j: usize, residency: Residency) -> Result<()> {
        self.tile_for_write(i, j, residency).map(|_| ())
    }

    /// Add a read-only copy of tile `(i, j)` at `residency`, valid for
    /// `life` more uses.
    pub fn copy_tile_to(&self, i: usize, j: usize, residency: Residency, life: i64) -> Result<Tile<T>> {
        let (pi, pj) = self.check(i, j)?;
        let data = self.storage.copy_to(pi, pj, residency, life)?;
        Ok(self.handle(i, j, data, residency))
    }

    /// Record one use of a received tile; evicted after its last use.
    /// Local tiles are unaffected.
    pub fn tick(&self, i: usize, j: usize) {
        if i < self.mt() && j < self.nt() && !self.is_local(i, j) {
            let (pi, pj) = self.phys(i, j);
            self.storage.tick_at(pi, pj, Residency::Host);
        }
    }

    /// Record one use of the copy of tile `(i, j)` at `residency`.
    pub fn tick_at(&self, i: usize, j: usize, residency: Residency) {
        if i < self.mt() && j < self.nt() {
            let (pi, pj) = self.phys(i, j);
            self.storage.tick_at(pi, pj, residency);
        }
    }

    pub(crate) fn insert_replica(
        &self,
        i: usize,
        j: usize,
        residency: Residency,
        block: Array2<T>,
        life: i64,
    ) -> Result<()> {
        let (pi, pj) = self.check(i, j)?;
        self.storage.insert_replica(pi, pj, residency, block, life)
    }

    /// Refresh every stale local origin in the view.
    pub fn update_all_origin(&self) {
        for (i, j) in self.local_tiles() {
            let (pi, pj) = self.phys(i, j);
            self.storage.update_origin(pi, pj);
        }
    }

    /// Release the copies of every tile in the view and this view's hold
    /// on the tiles inserted by [`Self::insert_workspace_tiles`]. Scratch
    /// tiles still covered by another live view are kept.
    pub fn release_workspace(&self) {
        self.release_copies();
        self.storage.retire(self.view);
    }

    /// Release the copies an algorithm made of the view's tiles, keeping
    /// every origin.
    pub(crate) fn release_copies(&self) {
        for j in 0..self.nt() {
            for i in 0..self.mt() {
                let (pi, pj) = self.phys(i, j);
                self.storage.release_instances(pi, pj);
            }
        }
    }

    /// Non-origin instances of this matrix at `residency` on this rank.
    pub fn replica_count(&self, residency: Residency) -> usize {
        self.storage.replica_count(residency)
    }

    // ─────────────────────────────────────────────────────────────
    // Gather
    // ─────────────────────────────────────────────────────────────

    /// Gather the whole view on every rank. Collective.
    pub fn to_dense(&self) -> Result<Array2<T>> {
        let comm = self.storage.ctx.comm();
        let nb = self.storage.nb;
        let mut dense = Array2::zeros((self.m(), self.n()));
        for j in 0..self.nt() {
            for i in 0..self.mt() {
                let (pi, pj) = self.phys(i, j);
                let key = MessageKey::new(self.storage.uid, pi, pj, GATHER_TAG);
                let owner = self.tile_rank(i, j);
                let block = if owner == comm.rank() {
                    let block = self.tile(i, j)?.to_logical();
                    for dest in (0..comm.size()).filter(|&r| r != owner) {
                        comm.send(dest, key, block.clone())?;
                    }
                    block
                } else {
                    comm.recv::<Array2<T>>(owner, key)?
                };
                let (r0, c0) = (i * nb, j * nb);
                dense
                    .slice_mut(s![r0..r0 + block.nrows(), c0..c0 + block.ncols()])
                    .assign(&block);
            }
        }
        Ok(dense)
    }
}

fn check_buffer(len: usize, rows: usize, cols: usize, ld: usize) -> Result<()> {
    if ld < rows.max(1) || (cols > 0 && len < ld * (cols - 1) + rows) {
        return Err(TileError::ShapeMismatch(format!(
            "buffer of {len} elements with leading dimension {ld} cannot hold {rows}x{cols}"
        )));
    }
    Ok(())
}

/// Rows (or columns) of an `n`-long dimension held by grid row (or
/// column) `coord` of `procs` in a block-cyclic layout.
fn local_extent(n: usize, nb: usize, coord: usize, procs: usize) -> usize {
    let blocks = n.div_ceil(nb);
    (0..blocks)
        .filter(|b| b % procs == coord)
        .map(|b| nb.min(n - b * nb))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_compute::{Communicator, DeviceSet};

    fn numbered(m: usize, n: usize) -> Vec<f64> {
        (0..m * n).map(|k| k as f64).collect()
    }

    #[test]
    fn test_edge_tiles_are_smaller() {
        let ctx = Context::local();
        let a = Matrix::<f64>::new(10, 7, 4, 1, 1, &ctx).unwrap();
        assert_eq!((a.mt(), a.nt()), (3, 2));
        assert_eq!(a.tile_mb(2).unwrap(), 2);
        assert_eq!(a.tile_nb(1).unwrap(), 3);
        assert!(matches!(a.tile_mb(3), Err(TileError::IndexOutOfRange(_))));
        assert!(matches!(a.transpose().unwrap().tile_nb(3), Err(TileError::IndexOutOfRange(_))));
        assert!(matches!(a.tile(0, 0), Err(TileError::NotLocal { .. })));
        assert!(matches!(a.tile(3, 0), Err(TileError::IndexOutOfRange(_))));
    }

    #[test]
    fn test_col_major_round_trip_through_views() {
        let ctx = Context::local();
        let data = numbered(5, 6);
        let a = Matrix::from_col_major(5, 6, &data, 5, 2, 1, 1, &ctx).unwrap();
        let dense = a.to_dense().unwrap();
        assert_eq!(dense[[4, 5]], data[4 + 5 * 5]);
        let at = a.transpose().unwrap();
        assert_eq!((at.m(), at.n()), (6, 5));
        assert_eq!(at.to_dense().unwrap(), dense.t());
        let s = a.sub(1..3, 1..3).unwrap();
        assert_eq!((s.m(), s.n()), (3, 4));
        assert_eq!(s.to_dense().unwrap(), dense.slice(s![2..5, 2..6]));
    }

    #[test]
    fn test_transposed_sub_maps_coordinates() {
        let ctx = Context::local();
        let a = Matrix::<f64>::new(8, 12, 2, 1, 1, &ctx).unwrap();
        let v = a.transpose().unwrap().sub(1..4, 0..2).unwrap();
        assert_eq!((v.mt(), v.nt()), (3, 2));
        assert_eq!(v.phys(0, 1), (1, 1));
        assert_eq!(v.phys(2, 0), (0, 3));
    }

    #[test]
    fn test_diagonal_sub_keeps_kind() {
        let ctx = Context::local();
        let a = Matrix::<f64>::new(8, 8, 2, 1, 1, &ctx)
            .unwrap()
            .hermitian(Uplo::Lower)
            .unwrap();
        assert_eq!(a.sub(1..3, 1..3).unwrap().kind(), a.kind());
        assert_eq!(a.sub(2..3, 0..1).unwrap().kind(), MatrixKind::General);
        assert_eq!(a.conj_transpose().unwrap().uplo(), Uplo::Upper);
        assert!(a.sub(0..2, 0..5).is_err());
        assert!(Matrix::<f64>::new(4, 6, 2, 1, 1, &ctx)
            .unwrap()
            .hermitian(Uplo::Lower)
            .is_err());
    }

    #[test]
    fn test_write_invalidates_other_instances() {
        let devices = DeviceSet::new(1, 1 << 20).unwrap();
        let ctx = Context::new(Communicator::single(), devices);
        let a = Matrix::<f64>::new(4, 4, 4, 1, 1, &ctx).unwrap();
        a.insert_local_tiles(Target::HostTask).unwrap();
        let dev = Residency::Device(0);
        a.tile_for_write(0, 0, dev)
            .unwrap()
            .with_view_mut(|mut v| v.fill(3.0));
        assert_eq!(a.replica_count(dev), 1);
        assert_eq!(ctx.devices().get(0).unwrap().used(), 4 * 4 * 8);
        a.update_all_origin();
        assert_eq!(a.tile(0, 0).unwrap().to_logical()[[2, 2]], 3.0);
        a.release_workspace();
        assert_eq!(a.replica_count(dev), 0);
        assert_eq!(ctx.devices().get(0).unwrap().used(), 0);
    }

    #[test]
    fn test_device_allocation_failure() {
        let devices = DeviceSet::new(1, 100).unwrap();
        let ctx = Context::new(Communicator::single(), devices);
        let a = Matrix::<f64>::new(8, 8, 8, 1, 1, &ctx).unwrap();
        a.insert_local_tiles(Target::HostTask).unwrap();
        let err = a.move_tile(0, 0, Residency::Device(0)).unwrap_err();
        assert!(matches!(err, TileError::AllocationFailure(_)));
    }

    #[test]
    fn test_replica_evicted_after_last_tick() {
        let devices = DeviceSet::new(1, 1 << 20).unwrap();
        let ctx = Context::new(Communicator::single(), devices);
        let a = Matrix::<f64>::new(2, 2, 2, 1, 1, &ctx).unwrap();
        a.insert_local_tiles(Target::HostTask).unwrap();
        let dev = Residency::Device(0);
        a.copy_tile_to(0, 0, dev, 2).unwrap();
        a.copy_tile_to(0, 0, dev, 1).unwrap();
        a.tick_at(0, 0, dev);
        a.tick_at(0, 0, dev);
        assert_eq!(a.replica_count(dev), 1);
        a.tick_at(0, 0, dev);
        assert_eq!(a.replica_count(dev), 0);
        assert_eq!(ctx.devices().get(0).unwrap().used(), 0);
    }

    #[test]
    fn test_empty_like_converts_type_and_keeps_distribution() {
        let ctx = Context::local();
        let a = Matrix::<f64>::new(9, 9, 4, 1, 1, &ctx).unwrap();
        let b: Matrix<f32> = a.sub(1..3, 0..2).unwrap().empty_like();
        assert_eq!((b.m(), b.n()), (5, 8));
        assert!(!b.same_storage(&a));
        assert_ne!(b.uid(), a.uid());
    }

    #[test]
    fn test_local_extent_matches_block_cyclic() {
        assert_eq!(local_extent(10, 3, 0, 2), 3 + 3);
        assert_eq!(local_extent(10, 3, 1, 2), 3 + 1);
    }
}
