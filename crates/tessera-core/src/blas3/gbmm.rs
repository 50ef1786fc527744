use crate::broadcast::{list_bcast, BcastEntry};
use crate::error::{Result, TileError};
use crate::internal;
use crate::matrix::Matrix;
use crate::options::Options;
use crate::pipeline::Pipeline;
use crate::scalar::Scalar;
use crate::types::MatrixKind;

/// `C = alpha A B + beta C` for a band view `A` with `kl` sub- and `ku`
/// super-diagonals. Tiles of `A` entirely outside the band are never read;
/// entries outside the band inside a band tile must be zero.
pub fn gbmm<T: Scalar>(
    alpha: T,
    a: &Matrix<T>,
    b: &Matrix<T>,
    beta: T,
    c: &Matrix<T>,
    opts: &Options,
) -> Result<()> {
    let MatrixKind::Band { kl, ku } = a.kind() else {
        return Err(TileError::ShapeMismatch("gbmm needs a band A".into()));
    };
    internal::check_shape("gbmm A", (a.m(), a.n()), (c.m(), b.m()))?;
    internal::check_shape("gbmm B", (b.m(), b.n()), (a.n(), c.n()))?;
    let backend = internal::backend_for(c, opts)?;
    let (mt, nt, kt) = (c.mt(), c.nt(), a.nt());
    let nb = a.nb().max(1);
    let (klt, kut) = (kl.div_ceil(nb), ku.div_ceil(nb));
    log::debug!("gbmm: {mt}x{nt} tiles, band {klt}/{kut} tiles, lookahead {}", opts.lookahead);

    internal::scale(beta, c, &backend)?;
    if kt == 0 {
        internal::finish(c);
        return Ok(());
    }

    // Tile rows of A holding band entries of tile column k.
    let band = |k: usize| k.saturating_sub(kut)..(k + klt + 1).min(mt);

    let pipeline = Pipeline::new(kt, opts.lookahead);
    let broadcast = |k: usize| -> Result<()> {
        let rows = band(k);
        let mut a_entries = Vec::with_capacity(rows.len());
        for i in rows.clone() {
            a_entries.push(BcastEntry::new(i, k, vec![c.sub(i..i + 1, 0..nt)?]).with_tag(k as i64));
        }
        list_bcast(a, &a_entries, opts.target)?;
        let mut b_entries = Vec::with_capacity(nt);
        for j in 0..nt {
            b_entries.push(BcastEntry::new(k, j, vec![c.sub(rows.clone(), j..j + 1)?]).with_tag(k as i64));
        }
        list_bcast(b, &b_entries, opts.target)
    };
    let compute = |k: usize| -> Result<()> {
        let rows = band(k);
        if rows.is_empty() {
            return Ok(());
        }
        internal::gemm(
            alpha,
            &a.sub(rows.clone(), k..k + 1)?,
            &b.sub(k..k + 1, 0..nt)?,
            T::one(),
            &c.sub(rows, 0..nt)?,
            &backend,
        )
    };
    let result = pipeline.run(broadcast, compute);
    internal::finish(c);
    result
}
