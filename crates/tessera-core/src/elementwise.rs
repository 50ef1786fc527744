//! Element-wise routines on local tiles: copy, add, scale and set.
//!
//! Operands must share their tile distribution, so no communication is
//! needed. Only tiles holding stored entries of the output view are
//! touched.

use crate::error::Result;
use crate::internal::{self, Stage};
use crate::matrix::Matrix;
use crate::options::Options;
use crate::scalar::{ConvertFrom, Scalar};
use crate::tile_blas;

fn check_same_shape<S: Scalar, T: Scalar>(what: &str, a: &Matrix<S>, b: &Matrix<T>) -> Result<()> {
    internal::check_shape(what, (a.m(), a.n()), (b.m(), b.n()))
}

/// Copy `A` into `B`, converting the element type.
pub fn copy<S: Scalar, T: Scalar + ConvertFrom<S>>(a: &Matrix<S>, b: &Matrix<T>, opts: &Options) -> Result<()> {
    check_same_shape("copy", a, b)?;
    let backend = internal::backend_for(b, opts)?;
    let mut stage = Stage::new(&backend);
    for (i, j) in b.local_tiles() {
        if !internal::holds_entries(b.kind(), b.nb(), i, j) {
            continue;
        }
        let ta = a.tile(i, j)?;
        let at = stage.residency(b, i, j);
        let tb = stage.write(b, i, j, at)?;
        stage.push(&tb.clone(), 0, move || tile_blas::copy(&ta, &tb));
    }
    let result = stage.run();
    internal::finish(b);
    result
}

/// `B = alpha A + beta B`.
pub fn add<T: Scalar>(alpha: T, a: &Matrix<T>, beta: T, b: &Matrix<T>, opts: &Options) -> Result<()> {
    check_same_shape("add", a, b)?;
    let backend = internal::backend_for(b, opts)?;
    let mut stage = Stage::new(&backend);
    for (i, j) in b.local_tiles() {
        if !internal::holds_entries(b.kind(), b.nb(), i, j) {
            continue;
        }
        let at = stage.residency(b, i, j);
        let ta = stage.read(a, i, j, at)?;
        let tb = stage.write(b, i, j, at)?;
        stage.push(&tb.clone(), 0, move || tile_blas::add(alpha, &ta, beta, &tb));
    }
    let result = stage.run();
    internal::finish(b);
    result
}

/// `A = alpha A`.
pub fn scale<T: Scalar>(alpha: T, a: &Matrix<T>, opts: &Options) -> Result<()> {
    let backend = internal::backend_for(a, opts)?;
    let mut stage = Stage::new(&backend);
    for (i, j) in a.local_tiles() {
        if !internal::holds_entries(a.kind(), a.nb(), i, j) {
            continue;
        }
        let at = stage.residency(a, i, j);
        let ta = stage.write(a, i, j, at)?;
        stage.push(&ta.clone(), 0, move || {
            tile_blas::scale(alpha, &ta);
            Ok(())
        });
    }
    let result = stage.run();
    internal::finish(a);
    result
}

/// Set the off-diagonal entries of `A` to `offdiag` and its diagonal to
/// `diag`.
pub fn set<T: Scalar>(offdiag: T, diag: T, a: &Matrix<T>, opts: &Options) -> Result<()> {
    let backend = internal::backend_for(a, opts)?;
    let mut stage = Stage::new(&backend);
    for (i, j) in a.local_tiles() {
        if !internal::holds_entries(a.kind(), a.nb(), i, j) {
            continue;
        }
        let at = stage.residency(a, i, j);
        let ta = stage.write(a, i, j, at)?;
        let d = if i == j { diag } else { offdiag };
        stage.push(&ta.clone(), 0, move || {
            tile_blas::set(offdiag, d, &ta);
            Ok(())
        });
    }
    let result = stage.run();
    internal::finish(a);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tessera_compute::{Communicator, Context, DeviceSet, Target};

    #[test]
    fn test_set_copy_add_scale() {
        let devices = DeviceSet::new(1, 1 << 20).unwrap();
        let ctx = Context::new(Communicator::single(), devices);
        for target in Target::ALL {
            let opts = Options::default().with_target(target);
            let a = Matrix::<f64>::new(5, 3, 2, 1, 1, &ctx).unwrap();
            a.insert_local_tiles(Target::HostTask).unwrap();
            set(1.0, 4.0, &a, &opts).unwrap();
            let low: Matrix<f32> = a.empty_like();
            low.insert_workspace_tiles(target).unwrap();
            copy(&a, &low, &opts).unwrap();
            let back: Matrix<f64> = a.empty_like();
            back.insert_local_tiles(Target::HostTask).unwrap();
            copy(&low, &back, &opts).unwrap();
            add(2.0, &a, 1.0, &back, &opts).unwrap();
            scale(0.5, &back, &opts).unwrap();
            let expected = Array2::from_shape_fn((5, 3), |(i, j)| if i == j { 6.0 } else { 1.5 });
            assert_eq!(back.to_dense().unwrap(), expected, "{target}");
            low.release_workspace();
            assert_eq!(ctx.devices().get(0).unwrap().used(), 0, "{target}");
        }
    }
}
