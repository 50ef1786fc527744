use crate::broadcast::{list_bcast, BcastEntry};
use crate::error::Result;
use crate::internal;
use crate::matrix::Matrix;
use crate::options::Options;
use crate::pipeline::Pipeline;
use crate::scalar::Scalar;

/// `C = alpha A B + beta C`.
///
/// Stage `k` broadcasts tile column `k` of `A` along the rows of `C` and
/// tile row `k` of `B` along its columns, then adds their product to `C`.
/// Transposed operands are passed as transposed views.
pub fn gemm<T: Scalar>(
    alpha: T,
    a: &Matrix<T>,
    b: &Matrix<T>,
    beta: T,
    c: &Matrix<T>,
    opts: &Options,
) -> Result<()> {
    internal::check_shape("gemm A", (a.m(), a.n()), (c.m(), b.m()))?;
    internal::check_shape("gemm B", (b.m(), b.n()), (a.n(), c.n()))?;
    internal::check_shape("gemm tiles", (a.mt(), b.nt()), (c.mt(), c.nt()))?;
    let backend = internal::backend_for(c, opts)?;
    let (mt, nt, kt) = (c.mt(), c.nt(), a.nt());
    log::debug!("gemm: {mt}x{nt} tiles, {kt} stages, lookahead {}", opts.lookahead);

    if kt == 0 {
        internal::scale(beta, c, &backend)?;
        internal::finish(c);
        return Ok(());
    }

    let pipeline = Pipeline::new(kt, opts.lookahead);
    let broadcast = |k: usize| -> Result<()> {
        let mut a_entries = Vec::with_capacity(mt);
        for i in 0..mt {
            a_entries.push(BcastEntry::new(i, k, vec![c.sub(i..i + 1, 0..nt)?]).with_tag(k as i64));
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
        internal::gemm(
            alpha,
            &a.sub(0..mt, k..k + 1)?,
            &b.sub(k..k + 1, 0..nt)?,
            beta_k,
            c,
            &backend,
        )
    };
    let result = pipeline.run(broadcast, compute);
    internal::finish(c);
    result
}
