//! Distributed level-3 algorithms.
//!
//! Every algorithm is a sweep over the tiles of the inner dimension driven
//! by a [`Pipeline`](crate::pipeline::Pipeline): the broadcast lane
//! replicates the panels stage `k` consumes to the ranks owning the output
//! tiles, the compute lane applies stage `k` through the backend chosen by
//! [`Options::target`](crate::options::Options). All algorithms are
//! collective over the ranks of the matrices' context.

mod gbmm;
mod gemm;
mod hemm;
mod herk;
mod trsm;

pub use gbmm::gbmm;
pub use gemm::gemm;
pub use hemm::{hemm, symm};
pub use herk::{herk, syrk};
pub use trsm::{tbsm, trsm};
