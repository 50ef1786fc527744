use crate::broadcast::{list_bcast, BcastEntry};
use crate::error::{Result, TileError};
use crate::internal;
use crate::matrix::Matrix;
use crate::options::Options;
use crate::pipeline::Pipeline;
use crate::scalar::Scalar;
use crate::types::{MatrixKind, Side, Uplo};

/// Solve `A X = alpha B` (left) or `X A = alpha B` (right) for a triangular
/// view `A`, overwriting `B` with `X`. Transposed systems are solved by
/// passing a transposed view of `A`.
pub fn trsm<T: Scalar>(side: Side, alpha: T, a: &Matrix<T>, b: &Matrix<T>, opts: &Options) -> Result<()> {
    if !matches!(a.kind(), MatrixKind::Triangular { .. }) {
        return Err(TileError::ShapeMismatch("trsm needs a triangular A".into()));
    }
    oriented(side, alpha, a, b, opts, None)
}

/// [`trsm`] for a triangular band view `A`: only the `kd` off-diagonals
/// are referenced. No pivoting.
pub fn tbsm<T: Scalar>(side: Side, alpha: T, a: &Matrix<T>, b: &Matrix<T>, opts: &Options) -> Result<()> {
    let MatrixKind::TriangularBand { kd, .. } = a.kind() else {
        return Err(TileError::ShapeMismatch("tbsm needs a triangular band A".into()));
    };
    oriented(side, alpha, a, b, opts, Some(kd.div_ceil(a.nb().max(1))))
}

fn oriented<T: Scalar>(
    side: Side,
    alpha: T,
    a: &Matrix<T>,
    b: &Matrix<T>,
    opts: &Options,
    band: Option<usize>,
) -> Result<()> {
    match side {
        Side::Left => sweep(alpha, a, b, opts, band),
        // X A = alpha B  <=>  A^H X^H = conj(alpha) B^H
        Side::Right => match (a.conj_transpose(), b.conj_transpose()) {
            (Ok(ah), Ok(bh)) => sweep(alpha.conj(), &ah, &bh, opts, band),
            _ => sweep(alpha, &a.transpose()?, &b.transpose()?, opts, band),
        },
    }
}

/// Left-side solve, forward for a lower and backward for an upper view.
/// Only tile rows within `band` of the diagonal are updated when a band
/// width (in tiles) is given.
fn sweep<T: Scalar>(alpha: T, a: &Matrix<T>, b: &Matrix<T>, opts: &Options, band: Option<usize>) -> Result<()> {
    internal::check_shape("trsm A", (a.m(), a.n()), (b.m(), b.m()))?;
    let backend = internal::backend_for(b, opts)?;
    let (mt, nt) = (b.mt(), b.nt());
    let lower = a.uplo() == Uplo::Lower;
    let diag = a.diag();
    let width = band.unwrap_or(mt);
    log::debug!(
        "trsm: {mt}x{nt} tiles, {}, lookahead {}",
        if lower { "forward" } else { "backward" },
        opts.lookahead
    );

    if alpha != T::one() {
        internal::scale(alpha, b, &backend)?;
    }
    if mt == 0 {
        internal::finish(b);
        return Ok(());
    }

    // Stage s eliminates tile row k; `below` are the rows it updates.
    let row = |s: usize| if lower { s } else { mt - 1 - s };
    let below = |k: usize| {
        if lower {
            k + 1..(k + 1 + width).min(mt)
        } else {
            k.saturating_sub(width)..k
        }
    };

    let pipeline = Pipeline::new(mt, opts.lookahead);
    let broadcast = |s: usize| -> Result<()> {
        let k = row(s);
        let mut entries = vec![BcastEntry::new(k, k, vec![b.sub(k..k + 1, 0..nt)?]).with_tag(s as i64)];
        for i in below(k) {
            entries.push(BcastEntry::new(i, k, vec![b.sub(i..i + 1, 0..nt)?]).with_tag(s as i64));
        }
        list_bcast(a, &entries, opts.target)
    };
    let compute = |s: usize| -> Result<()> {
        let k = row(s);
        internal::trsm(
            Side::Left,
            diag,
            T::one(),
            &a.sub(k..k + 1, k..k + 1)?,
            &b.sub(k..k + 1, 0..nt)?,
            &backend,
        )?;
        let rows = below(k);
        if rows.is_empty() {
            return Ok(());
        }
        let mut entries = Vec::with_capacity(nt);
        for j in 0..nt {
            entries.push(BcastEntry::new(k, j, vec![b.sub(rows.clone(), j..j + 1)?]).with_tag(s as i64));
        }
        list_bcast(b, &entries, opts.target)?;
        internal::gemm(
            -T::one(),
            &a.sub(rows.clone(), k..k + 1)?,
            &b.sub(k..k + 1, 0..nt)?,
            T::one(),
            &b.sub(rows, 0..nt)?,
            &backend,
        )
    };
    let result = pipeline.run(broadcast, compute);
    internal::finish(b);
    result
}
