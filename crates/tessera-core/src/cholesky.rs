//! Cholesky factorization and solve of Hermitian positive definite systems.
//!
//! [`potrf`] is a right-looking sweep over tile columns. The panel of
//! column `k` is factored on the main thread together with the next
//! `lookahead` columns of the trailing matrix, while the update of the
//! remaining columns from stage `k - 1` runs in the background.

use std::thread::ScopedJoinHandle;

use crate::blas3;
use crate::broadcast::{list_bcast, BcastEntry};
use crate::error::{Result, TileError};
use crate::internal;
use crate::matrix::Matrix;
use crate::options::Options;
use crate::scalar::Scalar;
use crate::tile_blas;
use crate::types::{Diag, Residency, Side, Uplo};

/// Factor `A = L L^H` (lower view) or `A = U^H U` (upper view) in place.
///
/// Fails on every rank with [`TileError::FactorizationFailure`] carrying
/// the 1-based order of the first leading minor that is not positive
/// definite.
pub fn potrf<T: Scalar>(a: &Matrix<T>, opts: &Options) -> Result<()> {
    match a.uplo() {
        Uplo::Lower => potrf_lower(a, opts),
        Uplo::Upper => potrf_lower(&a.conj_transpose()?, opts),
        Uplo::General => Err(TileError::ShapeMismatch(
            "potrf needs a Hermitian A with a stored triangle".into(),
        )),
    }
}

fn join(pending: &mut Option<ScopedJoinHandle<'_, Result<()>>>) -> Result<()> {
    match pending.take() {
        Some(handle) => match handle.join() {
            Ok(r) => r,
            Err(panic) => std::panic::resume_unwind(panic),
        },
        None => Ok(()),
    }
}

fn potrf_lower<T: Scalar>(a: &Matrix<T>, opts: &Options) -> Result<()> {
    let backend = internal::backend_for(a, opts)?;
    let comm = a.context().comm();
    let nt = a.nt();
    let nb = a.nb();
    let la = opts.lookahead.min(nt.saturating_sub(1));
    log::debug!("potrf: {nt}x{nt} tiles, lookahead {la}");

    let result = std::thread::scope(|s| -> Result<()> {
        let mut pending: Option<ScopedJoinHandle<'_, Result<()>>> = None;
        for k in 0..nt {
            if la == 0 {
                join(&mut pending)?;
            }

            // Panel, always on the host.
            let mut info = [0.0];
            if a.is_local(k, k) {
                let tile = a.tile_for_write(k, k, Residency::Host)?;
                match tile_blas::potrf(&tile) {
                    Ok(()) => {}
                    Err(TileError::FactorizationFailure { index }) => info[0] = (k * nb + index) as f64,
                    Err(e) => return Err(e),
                }
            }
            comm.all_reduce_max(&mut info)?;
            if info[0] > 0.0 {
                let index = info[0] as usize;
                log::debug!("potrf: leading minor {index} is not positive definite");
                return Err(TileError::FactorizationFailure { index });
            }
            if k + 1 == nt {
                break;
            }

            let tag = k as i64;
            let column = a.sub(k + 1..nt, k..k + 1)?;
            list_bcast(a, &[BcastEntry::new(k, k, vec![column.clone()]).with_tag(tag)], opts.target)?;
            internal::trsm(
                Side::Right,
                Diag::NonUnit,
                T::one(),
                &a.sub(k..k + 1, k..k + 1)?.conj_transpose()?,
                &column,
                &backend,
            )?;

            let trailing = a.sub(k + 1..nt, k + 1..nt)?;
            let mut entries = Vec::with_capacity(nt - k - 1);
            for i in k + 1..nt {
                entries.push(BcastEntry::new(i, k, internal::rank_k_consumers(&trailing, i - k - 1)?).with_tag(tag));
            }
            list_bcast(a, &entries, opts.target)?;

            let ahead = la.min(trailing.nt());
            for j in 0..ahead {
                if j + 1 == la {
                    join(&mut pending)?;
                }
                internal::rank_k(-T::one(), &column, T::one(), &trailing, j..j + 1, true, &backend)?;
            }
            join(&mut pending)?;
            if ahead < trailing.nt() {
                let backend = &backend;
                pending = Some(s.spawn(move || {
                    internal::rank_k(-T::one(), &column, T::one(), &trailing, ahead..trailing.nt(), true, backend)
                }));
            }
        }
        join(&mut pending)
    });
    internal::finish(a);
    result
}

/// Solve `A X = B` with the factor computed by [`potrf`], overwriting `B`.
pub fn potrs<T: Scalar>(a: &Matrix<T>, b: &Matrix<T>, opts: &Options) -> Result<()> {
    let uplo = a.uplo();
    if uplo == Uplo::General {
        return Err(TileError::ShapeMismatch(
            "potrs needs a factored Hermitian A".into(),
        ));
    }
    let factor = a.triangular(uplo, Diag::NonUnit)?;
    // L^{-H} L^{-1} B, or U^{-1} U^{-H} B.
    let first = match uplo {
        Uplo::Lower => factor,
        _ => factor.conj_transpose()?,
    };
    blas3::trsm(Side::Left, T::one(), &first, b, opts)?;
    blas3::trsm(Side::Left, T::one(), &first.conj_transpose()?, b, opts)
}

/// Factor `A` and solve `A X = B`, overwriting `A` with its factor and `B`
/// with `X`.
pub fn posv<T: Scalar>(a: &Matrix<T>, b: &Matrix<T>, opts: &Options) -> Result<()> {
    potrf(a, opts)?;
    potrs(a, b, opts)
}
