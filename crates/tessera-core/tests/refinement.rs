//! Mixed-precision refinement: convergence, fallback and agreement with a
//! direct LU solve.

mod common;

use faer::linalg::solvers::SpSolver;
use ndarray::Array2;
use tessera_compute::run_spmd;
use tessera_core::{posv_mixed, potrf, Communicator, Matrix, Options, RefinementOutcome, Target, Uplo};

use common::{col_major, context, init_logging, random, spd};

/// Direct solve of every column of `b` with faer's partial pivoting LU.
fn lu_solve(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let n = a.nrows();
    let lu = faer::Mat::<f64>::from_fn(n, n, |i, j| a[[i, j]]).partial_piv_lu();
    let mut x = Array2::zeros(b.dim());
    for c in 0..b.ncols() {
        let rhs = faer::Col::<f64>::from_fn(n, |i| b[[i, c]]);
        let sol = lu.solve(&rhs);
        for i in 0..n {
            x[[i, c]] = sol[i];
        }
    }
    x
}

fn assert_columns_accurate(a: &Array2<f64>, x: &Array2<f64>, b: &Array2<f64>) {
    assert_backward_error(a, x, b, 1.0);
}

/// Every residual column within `slack` times the high precision bound
/// `||x_j|| ||A|| eps sqrt(n)`.
fn assert_backward_error(a: &Array2<f64>, x: &Array2<f64>, b: &Array2<f64>, slack: f64) {
    let n = a.nrows();
    let a_norm = a
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max);
    let residual = a.dot(x) - b;
    for c in 0..b.ncols() {
        let r = residual.column(c).iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let xn = x.column(c).iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let bound = slack * xn * a_norm * f64::EPSILON * (n as f64).sqrt();
        assert!(r <= bound, "column {c}: residual {r:e} above {bound:e}");
    }
}

// ─────────────────────────────────────────────────────────────
// Convergence
// ─────────────────────────────────────────────────────────────

#[test]
fn test_refinement_converges_for_spd_system() {
    init_logging();
    let n = 100;
    let da = spd(n, 41);
    let db = random(n, 2, 42);
    let direct = lu_solve(&da, &db);

    let ctx = context(Communicator::single(), 2);
    for target in [Target::HostTask, Target::HostBatch, Target::Devices] {
        let opts = Options::default().with_target(target);
        let a = Matrix::from_col_major(n, n, &col_major(&da), n, 16, 1, 1, &ctx)
            .unwrap()
            .hermitian(Uplo::Lower)
            .unwrap();
        let b = Matrix::from_col_major(n, 2, &col_major(&db), n, 16, 1, 1, &ctx).unwrap();
        let x: Matrix<f64> = b.empty_like();
        x.insert_local_tiles(Target::HostTask).unwrap();

        let outcome = posv_mixed(&a, &b, &x, &opts).unwrap();
        let RefinementOutcome::Converged { iterations } = outcome else {
            panic!("{target}: expected convergence, got {outcome:?}");
        };
        assert!(iterations <= 30);
        assert!(outcome.iter_code() >= 0);

        let solution = x.to_dense().unwrap();
        assert_columns_accurate(&da, &solution, &db);
        let diff = solution
            .iter()
            .zip(direct.iter())
            .fold(0.0_f64, |m, (s, d)| m.max((s - d).abs()));
        assert!(diff < 1e-10, "{target}: differs from LU by {diff:e}");

        // A and B are left untouched.
        assert_eq!(a.general().to_dense().unwrap(), da);
        assert_eq!(b.to_dense().unwrap(), db);
        for d in ctx.devices().iter() {
            assert_eq!(d.used(), 0, "{target}");
        }
    }
}

#[test]
fn test_refinement_on_process_grid() {
    init_logging();
    let n = 48;
    let da = spd(n, 43);
    let db = random(n, 1, 44);
    let (da, db) = (&da, &db);
    let solutions = run_spmd(4, |comm| {
        let ctx = context(comm, 0);
        let a = Matrix::from_col_major(n, n, &col_major(da), n, 8, 2, 2, &ctx)
            .unwrap()
            .hermitian(Uplo::Upper)
            .unwrap();
        let b = Matrix::from_col_major(n, 1, &col_major(db), n, 8, 2, 2, &ctx).unwrap();
        let x: Matrix<f64> = b.empty_like();
        x.insert_local_tiles(Target::HostTask).unwrap();
        let outcome = posv_mixed(&a, &b, &x, &Options::default()).unwrap();
        (outcome, x.to_dense().unwrap())
    });
    let (first, reference) = &solutions[0];
    assert!(matches!(first, RefinementOutcome::Converged { .. }));
    for (outcome, x) in &solutions {
        assert_eq!(outcome, first);
        assert_eq!(x, reference);
    }
    assert_columns_accurate(da, reference, db);
}

// ─────────────────────────────────────────────────────────────
// Fallback
// ─────────────────────────────────────────────────────────────

#[test]
fn test_fallback_when_low_precision_factorization_fails() {
    init_logging();
    // Positive definite in f64, singular once rounded to f32.
    let off = 1.0 - 1e-9;
    let da = ndarray::array![[1.0, off], [off, 1.0]];
    let db = ndarray::array![[1.0], [2.0]];

    let ctx = context(Communicator::single(), 0);
    let a = Matrix::from_col_major(2, 2, &col_major(&da), 2, 2, 1, 1, &ctx)
        .unwrap()
        .hermitian(Uplo::Lower)
        .unwrap();
    let b = Matrix::from_col_major(2, 1, &col_major(&db), 2, 2, 1, 1, &ctx).unwrap();
    let x: Matrix<f64> = b.empty_like();
    x.insert_local_tiles(Target::HostTask).unwrap();

    let outcome = posv_mixed(&a, &b, &x, &Options::default()).unwrap();
    assert_eq!(outcome, RefinementOutcome::Fallback);
    assert_eq!(outcome.iter_code(), -31);

    let direct = lu_solve(&da, &db);
    let solution = x.to_dense().unwrap();
    for i in 0..2 {
        let rel = (solution[[i, 0]] - direct[[i, 0]]).abs() / direct[[i, 0]].abs();
        assert!(rel < 1e-5, "entry {i}: {} vs {}", solution[[i, 0]], direct[[i, 0]]);
    }
}

#[test]
fn test_fallback_after_iteration_limit() {
    init_logging();
    // Both diagonal entries round down by 0.49 ulp in f32. The rounded
    // matrix is still positive definite, but its smallest eigenvalue is
    // half the true one, so each correction overshoots by a factor of
    // about two and the error shrinks by only ~2% per iteration.
    let ulp = f32::EPSILON as f64;
    let da = ndarray::array![[1.0 + 0.49 * ulp, 1.0], [1.0, 1.0 + 1.49 * ulp]];
    let db = ndarray::array![[1.0], [2.0]];
    let ctx = context(Communicator::single(), 0);

    let rounded: Vec<f32> = col_major(&da).iter().map(|&v| v as f32).collect();
    let low = Matrix::from_col_major(2, 2, &rounded, 2, 2, 1, 1, &ctx)
        .unwrap()
        .hermitian(Uplo::Lower)
        .unwrap();
    potrf(&low, &Options::default()).expect("rounded matrix stays positive definite");

    let a = Matrix::from_col_major(2, 2, &col_major(&da), 2, 2, 1, 1, &ctx)
        .unwrap()
        .hermitian(Uplo::Lower)
        .unwrap();
    let b = Matrix::from_col_major(2, 1, &col_major(&db), 2, 2, 1, 1, &ctx).unwrap();
    let x: Matrix<f64> = b.empty_like();
    x.insert_local_tiles(Target::HostTask).unwrap();

    let outcome = posv_mixed(&a, &b, &x, &Options::default()).unwrap();
    assert_eq!(outcome, RefinementOutcome::Fallback);
    assert_eq!(outcome.iter_code(), -31);
    assert_backward_error(&da, &x.to_dense().unwrap(), &db, 32.0);
}

#[test]
fn test_indefinite_matrix_fails_in_high_precision_too() {
    let da = ndarray::array![[1.0, 2.0], [2.0, 1.0]];
    let db = ndarray::array![[1.0], [1.0]];
    let ctx = context(Communicator::single(), 0);
    let a = Matrix::from_col_major(2, 2, &col_major(&da), 2, 1, 1, 1, &ctx)
        .unwrap()
        .hermitian(Uplo::Lower)
        .unwrap();
    let b = Matrix::from_col_major(2, 1, &col_major(&db), 2, 1, 1, 1, &ctx).unwrap();
    let x: Matrix<f64> = b.empty_like();
    x.insert_local_tiles(Target::HostTask).unwrap();
    let err = posv_mixed(&a, &b, &x, &Options::default()).unwrap_err();
    assert!(matches!(err, tessera_core::TileError::FactorizationFailure { index: 2 }));
}
