//! # Tessera Core
//!
//! Tile-distributed dense linear algebra. A logical matrix is a grid of
//! independently owned tiles spread over the ranks of a communicator and
//! the accelerators of each rank. Algorithms sweep over tile columns,
//! overlapping the broadcast of upcoming panels with the computation of
//! the current one.
//!
//! ## Architecture
//!
//! Every level-3 algorithm follows the same template: a
//! [`pipeline::Pipeline`] drives a broadcast lane ([`broadcast::list_bcast`])
//! and a compute lane that hands batches of tile kernels to the
//! [`tessera_compute::ExecutionBackend`] selected by [`Options::target`].
//!
//! ## Modules
//!
//! - [`matrix`]: Distributed matrices, views and the tile lifecycle.
//! - [`tile`]: Tile handles carrying orientation and stored triangle.
//! - [`distribution`]: Tile-to-rank and tile-to-device maps.
//! - [`broadcast`]: Tree-based tile replication with batching.
//! - [`pipeline`]: The two-lane lookahead scheduler.
//! - [`blas3`]: gemm, hemm/symm, herk/syrk, trsm/tbsm, gbmm.
//! - [`cholesky`]: potrf, potrs, posv.
//! - [`refine`]: Mixed-precision iterative refinement.
//! - [`norm`]: Matrix and column norms.
//! - [`elementwise`]: copy, add, scale and set.
//! - [`tile_blas`]: Single-tile kernels.

pub mod blas3;
pub mod broadcast;
pub mod cholesky;
pub mod distribution;
pub mod elementwise;
pub mod error;
pub(crate) mod internal;
pub mod matrix;
pub mod norm;
pub mod options;
pub mod pipeline;
pub mod refine;
pub mod scalar;
pub mod tile;
pub mod tile_blas;
pub mod types;

pub use blas3::{gbmm, gemm, hemm, herk, symm, syrk, tbsm, trsm};
pub use cholesky::{posv, potrf, potrs};
pub use distribution::{Distribution, ProcessGrid};
pub use error::{Result, TileError};
pub use matrix::Matrix;
pub use norm::{col_norms, norm};
pub use options::Options;
pub use refine::{posv_mixed, RefinementOutcome};
pub use scalar::{ConvertFrom, MixedPrecision, Scalar};
pub use tile::Tile;
pub use types::{Diag, Layout, MatrixKind, Norm, Op, Residency, Side, Uplo};

pub use tessera_compute::{Communicator, Context, DeviceSet, Target};
