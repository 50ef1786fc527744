use crate::broadcast::{list_bcast, BcastEntry};
use crate::error::{Result, TileError};
use crate::internal;
use crate::matrix::Matrix;
use crate::options::Options;
use crate::pipeline::Pipeline;
use crate::scalar::Scalar;
use crate::types::Uplo;

/// Hermitian rank-k update `C = alpha A A^H + beta C` of the stored
/// triangle of `C`.
pub fn herk<T: Scalar>(alpha: f64, a: &Matrix<T>, beta: f64, c: &Matrix<T>, opts: &Options) -> Result<()> {
    rank_k(T::from_f64(alpha), a, T::from_f64(beta), c, opts, true)
}

/// Symmetric rank-k update `C = alpha A A^T + beta C`.
pub fn syrk<T: Scalar>(alpha: T, a: &Matrix<T>, beta: T, c: &Matrix<T>, opts: &Options) -> Result<()> {
    rank_k(alpha, a, beta, c, opts, false)
}

fn rank_k<T: Scalar>(alpha: T, a: &Matrix<T>, beta: T, c: &Matrix<T>, opts: &Options, conj: bool) -> Result<()> {
    if c.uplo() == Uplo::General {
        return Err(TileError::ShapeMismatch(
            "herk needs a Hermitian or symmetric C".into(),
        ));
    }
    internal::check_shape("herk A", (a.m(), a.mt()), (c.m(), c.mt()))?;
    let backend = internal::backend_for(c, opts)?;
    let (nt, kt) = (c.nt(), a.nt());
    log::debug!("herk: {nt}x{nt} tiles, {kt} stages, lookahead {}", opts.lookahead);

    if kt == 0 {
        internal::scale(beta, c, &backend)?;
        internal::finish(c);
        return Ok(());
    }

    let pipeline = Pipeline::new(kt, opts.lookahead);
    let broadcast = |k: usize| -> Result<()> {
        let mut entries = Vec::with_capacity(nt);
        for i in 0..nt {
            entries.push(BcastEntry::new(i, k, internal::rank_k_consumers(c, i)?).with_tag(k as i64));
        }
        list_bcast(a, &entries, opts.target)
    };
    let compute = |k: usize| -> Result<()> {
        let beta_k = if k == 0 { beta } else { T::one() };
        internal::rank_k(alpha, &a.sub(0..nt, k..k + 1)?, beta_k, c, 0..nt, conj, &backend)
    };
    let result = pipeline.run(broadcast, compute);
    internal::finish(c);
    result
}
