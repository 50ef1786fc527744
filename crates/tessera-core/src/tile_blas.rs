//! Reference single-tile kernels.
//!
//! Every kernel works on the logical block of its [`Tile`] arguments, so
//! transposed and conjugate-transposed handles are honoured without
//! copying storage. Only [`potrf`] can fail.
//!
//! Output tiles must not share storage with input tiles.

use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Zip};
use num_traits::{One, Zero};

use crate::error::{Result, TileError};
use crate::scalar::{ConvertFrom, Scalar};
use crate::tile::Tile;
use crate::types::{Diag, Side, Uplo};

// ─────────────────────────────────────────────────────────────
// Structure helpers
// ─────────────────────────────────────────────────────────────

/// Full block of a Hermitian (`conj = true`) or symmetric tile whose
/// `uplo` triangle is stored.
pub fn reflect<T: Scalar>(v: ArrayView2<'_, T>, uplo: Uplo, conj: bool) -> Array2<T> {
    let n = v.nrows();
    Array2::from_shape_fn((n, v.ncols()), |(i, j)| {
        let stored = match uplo {
            Uplo::Lower => i >= j,
            Uplo::Upper => i <= j,
            Uplo::General => true,
        };
        if i == j && conj {
            T::from_f64(v[[i, i]].re())
        } else if stored {
            v[[i, j]]
        } else if conj {
            v[[j, i]].conj()
        } else {
            v[[j, i]]
        }
    })
}

/// Full block of a triangular tile: the other triangle is zero, a unit
/// diagonal is one.
pub fn triangle<T: Scalar>(v: ArrayView2<'_, T>, uplo: Uplo, diag: Diag) -> Array2<T> {
    Array2::from_shape_fn(v.dim(), |(i, j)| {
        if i == j && diag == Diag::Unit {
            T::one()
        } else {
            let keep = match uplo {
                Uplo::Lower => i >= j,
                Uplo::Upper => i <= j,
                Uplo::General => true,
            };
            if keep {
                v[[i, j]]
            } else {
                T::zero()
            }
        }
    })
}

fn in_triangle(uplo: Uplo, i: usize, j: usize) -> bool {
    match uplo {
        Uplo::Lower => i >= j,
        Uplo::Upper => i <= j,
        Uplo::General => true,
    }
}

fn check_dims(what: &str, got: (usize, usize), want: (usize, usize)) -> Result<()> {
    if got != want {
        return Err(TileError::ShapeMismatch(format!(
            "{what}: got {}x{}, expected {}x{}",
            got.0, got.1, want.0, want.1
        )));
    }
    Ok(())
}

fn mat_mul<T: Scalar>(
    alpha: T,
    a: &ArrayView2<'_, T>,
    b: &ArrayView2<'_, T>,
    beta: T,
    c: &mut ArrayViewMut2<'_, T>,
) {
    if Zero::is_zero(&beta) {
        c.fill(T::zero());
    }
    general_mat_mul(alpha, a, b, beta, c);
}

// ─────────────────────────────────────────────────────────────
// Level 3
// ─────────────────────────────────────────────────────────────

/// `C = alpha op(A) op(B) + beta C`.
pub fn gemm<T: Scalar>(alpha: T, a: &Tile<T>, b: &Tile<T>, beta: T, c: &Tile<T>) -> Result<()> {
    check_dims("gemm A", (a.mb(), a.nb()), (c.mb(), b.mb()))?;
    check_dims("gemm B", (b.mb(), b.nb()), (a.nb(), c.nb()))?;
    a.with_view(|av| b.with_view(|bv| c.with_view_mut(|mut cv| mat_mul(alpha, &av, &bv, beta, &mut cv))));
    Ok(())
}

/// `C = alpha A B + beta C` (left) or `C = alpha B A + beta C` (right) with
/// `A` Hermitian, stored in its logical triangle.
pub fn hemm<T: Scalar>(side: Side, alpha: T, a: &Tile<T>, b: &Tile<T>, beta: T, c: &Tile<T>) -> Result<()> {
    structured_mm(side, alpha, a, b, beta, c, true)
}

/// Symmetric counterpart of [`hemm`].
pub fn symm<T: Scalar>(side: Side, alpha: T, a: &Tile<T>, b: &Tile<T>, beta: T, c: &Tile<T>) -> Result<()> {
    structured_mm(side, alpha, a, b, beta, c, false)
}

fn structured_mm<T: Scalar>(
    side: Side,
    alpha: T,
    a: &Tile<T>,
    b: &Tile<T>,
    beta: T,
    c: &Tile<T>,
    conj: bool,
) -> Result<()> {
    let full = a.with_view(|av| reflect(av, a.uplo(), conj));
    b.with_view(|bv| {
        c.with_view_mut(|mut cv| match side {
            Side::Left => {
                check_dims("hemm B", bv.dim(), (full.ncols(), cv.ncols()))?;
                check_dims("hemm C", cv.dim(), (full.nrows(), bv.ncols()))?;
                mat_mul(alpha, &full.view(), &bv, beta, &mut cv);
                Ok(())
            }
            Side::Right => {
                check_dims("hemm B", bv.dim(), (cv.nrows(), full.nrows()))?;
                check_dims("hemm C", cv.dim(), (bv.nrows(), full.ncols()))?;
                mat_mul(alpha, &bv, &full.view(), beta, &mut cv);
                Ok(())
            }
        })
    })
}

/// Rank-k update of the logical triangle of `C`:
/// `C = alpha op(A) op(A)^H + beta C`. The other triangle is not touched and
/// the diagonal stays real.
pub fn herk<T: Scalar>(alpha: f64, a: &Tile<T>, beta: f64, c: &Tile<T>) -> Result<()> {
    rank_k(T::from_f64(alpha), a, T::from_f64(beta), c, true)
}

/// `C = alpha op(A) op(A)^T + beta C` on the logical triangle of `C`.
pub fn syrk<T: Scalar>(alpha: T, a: &Tile<T>, beta: T, c: &Tile<T>) -> Result<()> {
    rank_k(alpha, a, beta, c, false)
}

fn rank_k<T: Scalar>(alpha: T, a: &Tile<T>, beta: T, c: &Tile<T>, conj: bool) -> Result<()> {
    check_dims("herk C", (c.mb(), c.nb()), (a.mb(), a.mb()))?;
    let uplo = c.uplo();
    let product = a.with_view(|av| {
        let at = if conj {
            av.t().mapv(|x| x.conj())
        } else {
            av.t().to_owned()
        };
        let mut p = Array2::zeros((av.nrows(), av.nrows()));
        general_mat_mul(alpha, &av, &at, T::zero(), &mut p);
        p
    });
    c.with_view_mut(|mut cv| {
        for ((i, j), x) in cv.indexed_iter_mut() {
            if !in_triangle(uplo, i, j) {
                continue;
            }
            let old = if Zero::is_zero(&beta) { T::zero() } else { beta * *x };
            let mut v = product[[i, j]] + old;
            if conj && i == j {
                v = T::from_f64(v.re());
            }
            *x = v;
        }
    });
    Ok(())
}

/// Solve `op(A) X = alpha B` (left) or `X op(A) = alpha B` (right) in place
/// of `B`, with `A` triangular in its logical triangle.
pub fn trsm<T: Scalar>(side: Side, diag: Diag, alpha: T, a: &Tile<T>, b: &Tile<T>) -> Result<()> {
    let uplo = a.uplo();
    if uplo == Uplo::General {
        return Err(TileError::ShapeMismatch("trsm needs a triangular tile".into()));
    }
    let t = a.with_view(|av| triangle(av, uplo, diag));
    let n = t.nrows();
    b.with_view_mut(|mut bv| {
        match side {
            Side::Left => check_dims("trsm B", (bv.nrows(), n), (n, n))?,
            Side::Right => check_dims("trsm B", (n, bv.ncols()), (n, n))?,
        }
        if !One::is_one(&alpha) {
            bv.mapv_inplace(|x| alpha * x);
        }
        match (side, uplo) {
            (Side::Left, Uplo::Lower) => {
                for i in 0..n {
                    for k in 0..i {
                        let l = t[[i, k]];
                        let (done, mut rest) = bv.view_mut().split_at(ndarray::Axis(0), i);
                        Zip::from(rest.row_mut(0)).and(done.row(k)).for_each(|x, &y| *x -= l * y);
                    }
                    let d = t[[i, i]];
                    bv.row_mut(i).mapv_inplace(|x| x / d);
                }
            }
            (Side::Left, _) => {
                for i in (0..n).rev() {
                    for k in i + 1..n {
                        let u = t[[i, k]];
                        let (mut head, tail) = bv.view_mut().split_at(ndarray::Axis(0), i + 1);
                        Zip::from(head.row_mut(i)).and(tail.row(k - i - 1)).for_each(|x, &y| *x -= u * y);
                    }
                    let d = t[[i, i]];
                    bv.row_mut(i).mapv_inplace(|x| x / d);
                }
            }
            (Side::Right, Uplo::Lower) => {
                for j in (0..n).rev() {
                    for k in j + 1..n {
                        let l = t[[k, j]];
                        let (mut head, tail) = bv.view_mut().split_at(ndarray::Axis(1), j + 1);
                        Zip::from(head.column_mut(j)).and(tail.column(k - j - 1)).for_each(|x, &y| *x -= y * l);
                    }
                    let d = t[[j, j]];
                    bv.column_mut(j).mapv_inplace(|x| x / d);
                }
            }
            (Side::Right, _) => {
                for j in 0..n {
                    for k in 0..j {
                        let u = t[[k, j]];
                        let (done, mut rest) = bv.view_mut().split_at(ndarray::Axis(1), j);
                        Zip::from(rest.column_mut(0)).and(done.column(k)).for_each(|x, &y| *x -= y * u);
                    }
                    let d = t[[j, j]];
                    bv.column_mut(j).mapv_inplace(|x| x / d);
                }
            }
        }
        Ok(())
    })
}

/// Cholesky factor of a Hermitian positive definite tile, in place of its
/// logical triangle: `A = L L^H` (lower) or `A = U^H U` (upper).
///
/// Fails with the 1-based order of the first leading minor that is not
/// positive definite.
pub fn potrf<T: Scalar>(a: &Tile<T>) -> Result<()> {
    match a.uplo() {
        Uplo::Lower => a.with_view_mut(|av| cholesky_lower(av)),
        Uplo::Upper => {
            let lower = a
                .conj_transpose()
                .or_else(|| a.transpose().filter(|_| !T::IS_COMPLEX))
                .ok_or_else(|| TileError::ShapeMismatch("cannot reorient tile for potrf".into()))?;
            lower.with_view_mut(|av| cholesky_lower(av))
        }
        Uplo::General => Err(TileError::ShapeMismatch(
            "potrf needs a lower or upper tile".into(),
        )),
    }
}

fn cholesky_lower<T: Scalar>(mut a: ArrayViewMut2<'_, T>) -> Result<()> {
    let n = a.nrows();
    for j in 0..n {
        let mut d = a[[j, j]].re();
        for k in 0..j {
            let l = a[[j, k]].abs();
            d -= l * l;
        }
        if d.is_nan() || d <= 0.0 {
            return Err(TileError::FactorizationFailure { index: j + 1 });
        }
        let d = d.sqrt();
        a[[j, j]] = T::from_f64(d);
        for i in j + 1..n {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= a[[i, k]] * a[[j, k]].conj();
            }
            a[[i, j]] = s * T::from_f64(1.0 / d);
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
// Level 1 style
// ─────────────────────────────────────────────────────────────

pub fn scale<T: Scalar>(alpha: T, a: &Tile<T>) {
    a.with_view_mut(|mut v| v.mapv_inplace(|x| alpha * x));
}

/// `B = alpha A + beta B`.
pub fn add<T: Scalar>(alpha: T, a: &Tile<T>, beta: T, b: &Tile<T>) -> Result<()> {
    check_dims("add", (a.mb(), a.nb()), (b.mb(), b.nb()))?;
    a.with_view(|av| {
        b.with_view_mut(|mut bv| {
            Zip::from(&mut bv).and(&av).for_each(|y, &x| *y = alpha * x + beta * *y);
        })
    });
    Ok(())
}

/// Copy `A` into `B`, converting the element type.
pub fn copy<S: Scalar, T: Scalar + ConvertFrom<S>>(a: &Tile<S>, b: &Tile<T>) -> Result<()> {
    check_dims("copy", (a.mb(), a.nb()), (b.mb(), b.nb()))?;
    a.with_view(|av| {
        b.with_view_mut(|mut bv| {
            Zip::from(&mut bv).and(&av).for_each(|y, &x| *y = T::convert_from(x));
        })
    });
    Ok(())
}

/// Set off-diagonal entries to `offdiag` and diagonal entries to `diag`.
pub fn set<T: Scalar>(offdiag: T, diag: T, a: &Tile<T>) {
    a.with_view_mut(|mut v| {
        for ((i, j), x) in v.indexed_iter_mut() {
            *x = if i == j { diag } else { offdiag };
        }
    });
}

// ─────────────────────────────────────────────────────────────
// Norm pieces
// ─────────────────────────────────────────────────────────────

pub fn max_abs<T: Scalar>(v: &ArrayView2<'_, T>) -> f64 {
    v.iter().fold(0.0_f64, |m, x| {
        let a = x.abs();
        if a.is_nan() || a > m {
            a
        } else {
            m
        }
    })
}

/// Sum of moduli of each column.
pub fn col_abs_sums<T: Scalar>(v: &ArrayView2<'_, T>) -> Vec<f64> {
    v.columns().into_iter().map(|c| c.iter().map(|x| x.abs()).sum()).collect()
}

/// Sum of moduli of each row.
pub fn row_abs_sums<T: Scalar>(v: &ArrayView2<'_, T>) -> Vec<f64> {
    v.rows().into_iter().map(|r| r.iter().map(|x| x.abs()).sum()).collect()
}

/// Largest modulus of each column.
pub fn col_max_abs<T: Scalar>(v: &ArrayView2<'_, T>) -> Vec<f64> {
    v.columns()
        .into_iter()
        .map(|c| c.iter().fold(0.0_f64, |m, x| m.max(x.abs())))
        .collect()
}

pub fn sum_squares<T: Scalar>(v: &ArrayView2<'_, T>) -> f64 {
    v.iter().map(|x| {
        let a = x.abs();
        a * a
    }).sum()
}
