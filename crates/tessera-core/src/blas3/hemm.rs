use crate::broadcast::{list_bcast, BcastEntry};
use crate::error::{Result, TileError};
use crate::internal;
use crate::matrix::Matrix;
use crate::options::Options;
use crate::pipeline::Pipeline;
use crate::scalar::Scalar;
use crate::types::{Side, Uplo};

/// `C = alpha A B + beta C` (left) or `C = alpha B A + beta C` (right) with
/// `A` Hermitian, stored in the triangle of its view.
pub fn hemm<T: Scalar>(
    side: Side,
    alpha: T,
    a: &Matrix<T>,
    b: &Matrix<T>,
    beta: T,
    c: &Matrix<T>,
    opts: &Options,
) -> Result<()> {
    structured(side, alpha, a, b, beta, c, opts, true)
}

/// Symmetric counterpart of [`hemm`].
pub fn symm<T: Scalar>(
    side: Side,
    alpha: T,
    a: &Matrix<T>,
    b: &Matrix<T>,
    beta: T,
    c: &Matrix<T>,
    opts: &Options,
) -> Result<()> {
    structured(side, alpha, a, b, beta, c, opts, false)
}

#[allow(clippy::too_many_arguments)]
fn structured<T: Scalar>(
    side: Side,
    alpha: T,
    a: &Matrix<T>,
    b: &Matrix<T>,
    beta: T,
    c: &Matrix<T>,
    opts: &Options,
    conj: bool,
) -> Result<()> {
    if a.uplo() == Uplo::General {
        return Err(TileError::ShapeMismatch(
            "hemm needs a Hermitian or symmetric A".into(),
        ));
    }
    match side {
        Side::Left => left(alpha, a, b, beta, c, opts, conj),
        // C^H = A B^H + C^H, transposed instead for the symmetric case.
        Side::Right if conj => left(
            alpha.conj(),
            a,
            &b.conj_transpose()?,
            beta.conj(),
            &c.conj_transpose()?,
            opts,
            conj,
        ),
        Side::Right => left(alpha, a, &b.transpose()?, beta, &c.transpose()?, opts, conj),
    }
}

#[allow(clippy::too_many_arguments)]
fn left<T: Scalar>(
    alpha: T,
    a: &Matrix<T>,
    b: &Matrix<T>,
    beta: T,
    c: &Matrix<T>,
    opts: &Options,
    conj: bool,
) -> Result<()> {
    internal::check_shape("hemm A", (a.m(), a.n()), (c.m(), c.m()))?;
    internal::check_shape("hemm B", (b.m(), b.n()), (c.m(), c.n()))?;
    let backend = internal::backend_for(c, opts)?;
    let (mt, nt) = (c.mt(), c.nt());
    let uplo = a.uplo();
    log::debug!("hemm: {mt}x{nt} tiles, lookahead {}", opts.lookahead);

    if mt == 0 {
        internal::scale(beta, c, &backend)?;
        internal::finish(c);
        return Ok(());
    }

    // Column k of the full matrix, one stored tile per tile row.
    let stored = |i: usize, k: usize| {
        if internal::in_triangle(uplo, i, k) {
            (i, k)
        } else {
            (k, i)
        }
    };
    let pipeline = Pipeline::new(mt, opts.lookahead);
    let broadcast = |k: usize| -> Result<()> {
        let mut a_entries = Vec::with_capacity(mt);
        for i in 0..mt {
            let (si, sj) = stored(i, k);
            a_entries.push(BcastEntry::new(si, sj, vec![c.sub(i..i + 1, 0..nt)?]).with_tag(k as i64));
        }
        list_bcast(a, &a_entries, opts.target)?;
        let mut b_entries = Vec::with_capacity(nt);
        for j in 0..nt {
            b_entries.push(BcastEntry::new(k, j, vec![c.sub(0..mt, j..j + 1)?]).with_tag(k as i64));
        }
        list_bcast(b, &b_entries, opts.target)
    };
    let compute = |k: usize| -> Result<()> {
        let beta_k = if k == 0 { beta } else { T::one() };
        internal::hemm_column(alpha, a, k, &b.sub(k..k + 1, 0..nt)?, beta_k, c, conj, &backend)
    };
    let result = pipeline.run(broadcast, compute);
    internal::finish(c);
    result
}
