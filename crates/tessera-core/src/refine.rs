//! Mixed-precision iterative refinement.
//!
//! [`posv_mixed`] factors a low precision copy of `A` and refines the
//! solution in high precision until every residual column is small
//! relative to its solution column. When the low precision factorization
//! fails, or refinement does not converge within [`MAX_ITERATIONS`], the
//! system is solved directly in high precision.

use crate::blas3;
use crate::cholesky;
use crate::elementwise;
use crate::error::{Result, TileError};
use crate::internal;
use crate::matrix::Matrix;
use crate::norm::{col_norms, norm};
use crate::options::Options;
use crate::scalar::{ConvertFrom, MixedPrecision};
use crate::types::{MatrixKind, Norm, Side, Uplo};

pub const MAX_ITERATIONS: usize = 30;

/// How [`posv_mixed`] produced its solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementOutcome {
    /// Refined solution after this many correction steps; 0 when the first
    /// low precision solve was already accurate.
    Converged { iterations: usize },
    /// Direct high precision solution. `A` holds its factor.
    Fallback,
}

impl RefinementOutcome {
    /// The iteration count, or `-(MAX_ITERATIONS + 1)` after a fallback.
    pub fn iter_code(self) -> i64 {
        match self {
            RefinementOutcome::Converged { iterations } => iterations as i64,
            RefinementOutcome::Fallback => -(MAX_ITERATIONS as i64) - 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    LowPrecisionSolve,
    ResidualCheck { iteration: usize },
    Refine { iteration: usize },
    Converged { iterations: usize },
    Fallback,
}

/// Scratch copies at the low precision and the high precision residual.
struct Workspace<T: MixedPrecision> {
    a_lo: Matrix<T::Low>,
    x_lo: Matrix<T::Low>,
    r: Matrix<T>,
}

impl<T: MixedPrecision> Workspace<T> {
    fn new(a: &Matrix<T>, b: &Matrix<T>, opts: &Options) -> Result<Self> {
        let ws = Self {
            a_lo: a.empty_like(),
            x_lo: b.empty_like(),
            r: b.empty_like(),
        };
        ws.a_lo.insert_workspace_tiles(opts.target)?;
        ws.x_lo.insert_workspace_tiles(opts.target)?;
        ws.r.insert_workspace_tiles(opts.target)?;
        Ok(ws)
    }

    fn release(&self) {
        self.a_lo.release_workspace();
        self.x_lo.release_workspace();
        self.r.release_workspace();
    }
}

/// Solve `A X = B` for Hermitian positive definite `A` by refining a low
/// precision Cholesky solve. Collective.
///
/// `A` and `B` are left untouched unless the outcome is
/// [`RefinementOutcome::Fallback`], in which case `A` is overwritten by
/// its high precision factor. A failure of that factorization is returned
/// as [`TileError::FactorizationFailure`].
pub fn posv_mixed<T>(a: &Matrix<T>, b: &Matrix<T>, x: &Matrix<T>, opts: &Options) -> Result<RefinementOutcome>
where
    T: MixedPrecision + ConvertFrom<T::Low>,
    T::Low: ConvertFrom<T>,
{
    if a.uplo() == Uplo::General {
        return Err(TileError::ShapeMismatch(
            "posv_mixed needs a Hermitian A".into(),
        ));
    }
    if x.kind() != MatrixKind::General {
        return Err(TileError::ShapeMismatch(
            "posv_mixed needs a general X".into(),
        ));
    }
    internal::check_shape("posv_mixed A", (a.m(), a.n()), (b.m(), b.m()))?;
    internal::check_shape("posv_mixed X", (x.m(), x.n()), (b.m(), b.n()))?;

    let n = a.n();
    let tolerance = norm(Norm::Inf, a)? * T::EPSILON * (n as f64).sqrt();
    log::debug!("posv_mixed: n = {n}, {} right-hand sides, tolerance {tolerance:e}", b.n());

    let ws = Workspace::<T>::new(a, b, opts)?;
    let outcome = refine(a, b, x, &ws, tolerance, opts);
    ws.release();

    match outcome? {
        RefinementOutcome::Fallback => {
            elementwise::copy(b, x, opts)?;
            cholesky::posv(a, x, opts)?;
            Ok(RefinementOutcome::Fallback)
        }
        converged => Ok(converged),
    }
}

fn refine<T>(
    a: &Matrix<T>,
    b: &Matrix<T>,
    x: &Matrix<T>,
    ws: &Workspace<T>,
    tolerance: f64,
    opts: &Options,
) -> Result<RefinementOutcome>
where
    T: MixedPrecision + ConvertFrom<T::Low>,
    T::Low: ConvertFrom<T>,
{
    let mut state = State::LowPrecisionSolve;
    loop {
        state = match state {
            State::LowPrecisionSolve => {
                elementwise::copy(a, &ws.a_lo, opts)?;
                match cholesky::potrf(&ws.a_lo, opts) {
                    Ok(()) => {
                        elementwise::copy(b, &ws.x_lo, opts)?;
                        cholesky::potrs(&ws.a_lo, &ws.x_lo, opts)?;
                        elementwise::copy(&ws.x_lo, x, opts)?;
                        State::ResidualCheck { iteration: 0 }
                    }
                    Err(TileError::FactorizationFailure { index }) => {
                        log::warn!("posv_mixed: low precision factorization failed at minor {index}");
                        State::Fallback
                    }
                    Err(e) => return Err(e),
                }
            }
            State::ResidualCheck { iteration } => {
                elementwise::copy(b, &ws.r, opts)?;
                blas3::hemm(Side::Left, -T::one(), a, x, T::one(), &ws.r, opts)?;
                let r_norms = col_norms(Norm::Max, &ws.r)?;
                let x_norms = col_norms(Norm::Max, x)?;
                let converged = r_norms
                    .iter()
                    .zip(&x_norms)
                    .all(|(rn, xn)| *rn <= xn * tolerance);
                let worst = r_norms.iter().copied().fold(0.0, f64::max);
                log::debug!("posv_mixed: iteration {iteration}, max residual {worst:e}");
                if converged {
                    State::Converged { iterations: iteration }
                } else if iteration == MAX_ITERATIONS {
                    log::warn!("posv_mixed: no convergence after {MAX_ITERATIONS} iterations");
                    State::Fallback
                } else {
                    State::Refine { iteration }
                }
            }
            State::Refine { iteration } => {
                // Correction from the low precision factor, added in high
                // precision.
                elementwise::copy(&ws.r, &ws.x_lo, opts)?;
                cholesky::potrs(&ws.a_lo, &ws.x_lo, opts)?;
                elementwise::copy(&ws.x_lo, &ws.r, opts)?;
                elementwise::add(T::one(), &ws.r, T::one(), x, opts)?;
                State::ResidualCheck { iteration: iteration + 1 }
            }
            State::Converged { iterations } => return Ok(RefinementOutcome::Converged { iterations }),
            State::Fallback => return Ok(RefinementOutcome::Fallback),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tessera_compute::Context;

    #[test]
    fn test_iter_code() {
        assert_eq!(RefinementOutcome::Converged { iterations: 2 }.iter_code(), 2);
        assert_eq!(RefinementOutcome::Fallback.iter_code(), -31);
    }

    #[test]
    fn test_diagonal_system_converges_immediately() {
        let ctx = Context::local();
        let n = 6;
        let dense = Array2::from_shape_fn((n, n), |(i, j)| if i == j { 2.0 } else { 0.0 });
        let data: Vec<f64> = dense.t().iter().copied().collect();
        let a = Matrix::from_col_major(n, n, &data, n, 4, 1, 1, &ctx)
            .unwrap()
            .hermitian(Uplo::Lower)
            .unwrap();
        let rhs: Vec<f64> = (0..n).map(|i| 2.0 * i as f64).collect();
        let b = Matrix::from_col_major(n, 1, &rhs, n, 4, 1, 1, &ctx).unwrap();
        let x: Matrix<f64> = b.empty_like();
        x.insert_local_tiles(Options::default().target).unwrap();

        let outcome = posv_mixed(&a, &b, &x, &Options::default()).unwrap();
        assert_eq!(outcome, RefinementOutcome::Converged { iterations: 0 });
        let solution = x.to_dense().unwrap();
        for i in 0..n {
            assert_eq!(solution[[i, 0]], i as f64);
        }
    }
}
