//! Matrix norms.
//!
//! Each rank reduces its local tiles in parallel, then the partial results
//! are combined across ranks. Only tiles holding stored entries are read:
//! the stored triangle of Hermitian, symmetric and triangular views, the
//! band of band views. Off-diagonal tiles of Hermitian and symmetric views
//! stand for their mirror image as well.

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use crate::error::{Result, TileError};
use crate::internal;
use crate::matrix::Matrix;
use crate::scalar::Scalar;
use crate::tile::Tile;
use crate::tile_blas::{col_abs_sums, col_max_abs, max_abs, reflect, row_abs_sums, sum_squares, triangle};
use crate::types::{MatrixKind, Norm};

struct LocalTile<T: Scalar> {
    i: usize,
    j: usize,
    tile: Tile<T>,
    mirrored: bool,
}

fn local_tiles<T: Scalar>(a: &Matrix<T>) -> Result<Vec<LocalTile<T>>> {
    let kind = a.kind();
    let mut tiles = Vec::new();
    for (i, j) in a.local_tiles() {
        if !internal::holds_entries(kind, a.nb(), i, j) {
            continue;
        }
        let mirrored = i != j && matches!(kind, MatrixKind::Hermitian { .. } | MatrixKind::Symmetric { .. });
        tiles.push(LocalTile {
            i,
            j,
            tile: a.tile(i, j)?,
            mirrored,
        });
    }
    Ok(tiles)
}

/// The entries a tile stands for, with the implicit parts of diagonal
/// tiles filled in.
fn logical_block<T: Scalar>(kind: MatrixKind, t: &LocalTile<T>) -> Array2<T> {
    let uplo = t.tile.uplo();
    let diagonal = t.i == t.j;
    t.tile.with_view(|v: ArrayView2<'_, T>| match kind {
        MatrixKind::Hermitian { .. } if diagonal => reflect(v, uplo, true),
        MatrixKind::Symmetric { .. } if diagonal => reflect(v, uplo, false),
        MatrixKind::Triangular { diag, .. } | MatrixKind::TriangularBand { diag, .. } if diagonal => {
            triangle(v, uplo, diag)
        }
        _ => v.to_owned(),
    })
}

fn add_at(acc: &mut [f64], offset: usize, part: &[f64]) {
    for (x, p) in acc[offset..offset + part.len()].iter_mut().zip(part) {
        *x += p;
    }
}

/// `norm` of the whole view. Collective.
pub fn norm<T: Scalar>(norm: Norm, a: &Matrix<T>) -> Result<f64> {
    let kind = a.kind();
    let nb = a.nb();
    let comm = a.context().comm();
    let tiles = local_tiles(a)?;
    log::debug!("norm {norm:?} of {}x{} view, {} local tiles", a.m(), a.n(), tiles.len());

    let value = match norm {
        Norm::Max => {
            let local = tiles
                .par_iter()
                .map(|t| max_abs(&logical_block(kind, t).view()))
                .reduce(|| 0.0, f64::max);
            let mut v = [local];
            comm.all_reduce_max(&mut v)?;
            v[0]
        }
        Norm::One | Norm::Inf => {
            // Column sums for the one norm, row sums for the infinity norm.
            let len = if norm == Norm::One { a.n() } else { a.m() };
            let mut sums = tiles
                .par_iter()
                .map(|t| {
                    let block = logical_block(kind, t);
                    let (own, across) = match norm {
                        Norm::One => (col_abs_sums(&block.view()), row_abs_sums(&block.view())),
                        _ => (row_abs_sums(&block.view()), col_abs_sums(&block.view())),
                    };
                    let (here, there) = if norm == Norm::One { (t.j, t.i) } else { (t.i, t.j) };
                    let mut acc = vec![0.0; len];
                    add_at(&mut acc, here * nb, &own);
                    if t.mirrored {
                        add_at(&mut acc, there * nb, &across);
                    }
                    acc
                })
                .reduce(
                    || vec![0.0; len],
                    |mut x, y| {
                        add_at(&mut x, 0, &y);
                        x
                    },
                );
            comm.all_reduce_sum(&mut sums)?;
            sums.into_iter().fold(0.0, f64::max)
        }
        Norm::Fro => {
            let local: f64 = tiles
                .par_iter()
                .map(|t| {
                    let s = sum_squares(&logical_block(kind, t).view());
                    if t.mirrored {
                        2.0 * s
                    } else {
                        s
                    }
                })
                .sum();
            let mut v = [local];
            comm.all_reduce_sum(&mut v)?;
            v[0].sqrt()
        }
    };
    Ok(value)
}

/// Per-column norms of a general view. Only [`Norm::Max`] is supported.
/// Collective.
pub fn col_norms<T: Scalar>(norm: Norm, a: &Matrix<T>) -> Result<Vec<f64>> {
    if norm != Norm::Max {
        return Err(TileError::ShapeMismatch(format!(
            "column norms support only the max norm, got {norm:?}"
        )));
    }
    if a.kind() != MatrixKind::General {
        return Err(TileError::ShapeMismatch(
            "column norms need a general view".into(),
        ));
    }
    let nb = a.nb();
    let n = a.n();
    let tiles = local_tiles(a)?;
    let mut values = tiles
        .par_iter()
        .map(|t| {
            let mut acc = vec![0.0; n];
            let part = t.tile.with_view(|v| col_max_abs(&v));
            acc[t.j * nb..t.j * nb + part.len()].copy_from_slice(&part);
            acc
        })
        .reduce(
            || vec![0.0; n],
            |mut x, y| {
                for (m, v) in x.iter_mut().zip(y) {
                    *m = m.max(v);
                }
                x
            },
        );
    a.context().comm().all_reduce_max(&mut values)?;
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tessera_compute::Context;

    use crate::types::{Diag, Uplo};

    fn matrix(ctx: &Context) -> (Matrix<f64>, Array2<f64>) {
        let n = 5;
        let dense = Array2::from_shape_fn((n, n), |(i, j)| {
            let sign = if (i + j) % 2 == 0 { 1.0 } else { -1.0 };
            sign * (i as f64 + 1.0) + j as f64
        });
        let data: Vec<f64> = dense.t().iter().copied().collect();
        (Matrix::from_col_major(n, n, &data, n, 2, 1, 1, ctx).unwrap(), dense)
    }

    #[test]
    fn test_general_norms_match_dense() {
        let ctx = Context::local();
        let (a, dense) = matrix(&ctx);
        let abs = dense.mapv(f64::abs);
        let one = abs.sum_axis(ndarray::Axis(0)).fold(0.0_f64, |m, &x| m.max(x));
        let inf = abs.sum_axis(ndarray::Axis(1)).fold(0.0_f64, |m, &x| m.max(x));
        assert_abs_diff_eq!(norm(Norm::Max, &a).unwrap(), abs.fold(0.0_f64, |m, &x| m.max(x)));
        assert_abs_diff_eq!(norm(Norm::One, &a).unwrap(), one, epsilon = 1e-12);
        assert_abs_diff_eq!(norm(Norm::Inf, &a).unwrap(), inf, epsilon = 1e-12);
        assert_abs_diff_eq!(
            norm(Norm::Fro, &a).unwrap(),
            dense.mapv(|x| x * x).sum().sqrt(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(norm(Norm::One, &a.transpose().unwrap()).unwrap(), inf, epsilon = 1e-12);
    }

    #[test]
    fn test_hermitian_norm_uses_both_triangles() {
        let ctx = Context::local();
        let (a, dense) = matrix(&ctx);
        let lower = a.hermitian(Uplo::Lower).unwrap();
        let full = Array2::from_shape_fn(dense.dim(), |(i, j)| if i >= j { dense[[i, j]] } else { dense[[j, i]] });
        let one = full.mapv(f64::abs).sum_axis(ndarray::Axis(0)).fold(0.0_f64, |m, &x| m.max(x));
        assert_abs_diff_eq!(norm(Norm::One, &lower).unwrap(), one, epsilon = 1e-12);
        assert_abs_diff_eq!(norm(Norm::Inf, &lower).unwrap(), one, epsilon = 1e-12);
        assert_abs_diff_eq!(
            norm(Norm::Fro, &lower).unwrap(),
            full.mapv(|x| x * x).sum().sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_unit_triangular_norm_ignores_diagonal() {
        let ctx = Context::local();
        let (a, dense) = matrix(&ctx);
        let upper = a.triangular(Uplo::Upper, Diag::Unit).unwrap();
        let tri = Array2::from_shape_fn(dense.dim(), |(i, j)| match i.cmp(&j) {
            std::cmp::Ordering::Equal => 1.0,
            std::cmp::Ordering::Less => dense[[i, j]],
            std::cmp::Ordering::Greater => 0.0,
        });
        let inf = tri.mapv(f64::abs).sum_axis(ndarray::Axis(1)).fold(0.0_f64, |m, &x| m.max(x));
        assert_abs_diff_eq!(norm(Norm::Inf, &upper).unwrap(), inf, epsilon = 1e-12);
    }

    #[test]
    fn test_col_norms() {
        let ctx = Context::local();
        let (a, dense) = matrix(&ctx);
        let expected: Vec<f64> = dense
            .columns()
            .into_iter()
            .map(|c| c.fold(0.0_f64, |m, &x| m.max(x.abs())))
            .collect();
        assert_eq!(col_norms(Norm::Max, &a).unwrap(), expected);
        assert!(col_norms(Norm::One, &a).is_err());
    }
}
