//! # Tessera Compute
//!
//! Execution resources for the Tessera tile runtime. This crate provides an
//! [`ExecutionBackend`](backend::ExecutionBackend) trait that isolates the
//! tile algorithms from how a stage's tile updates are scheduled, the
//! simulated accelerators those updates may run on, and the communication
//! domain connecting the ranks of a job.
//!
//! ## Available targets
//!
//! | Target | Backend | Scheduling |
//! |--------|---------|------------|
//! | `host-task` | [`HostTaskBackend`] | one Rayon task per tile |
//! | `host-nest` | [`HostNestBackend`] | one parallel loop per stage |
//! | `host-batch` | [`HostBatchBackend`] | one grouped call per tile shape |
//! | `devices` | [`DeviceBackend`] | grouped calls on per-device streams |

pub mod backend;
pub mod config;
pub mod context;
pub mod cpu;
pub mod device;
pub mod distributed;

pub use backend::{ComputeError, DeviceInfo, ExecutionBackend, GroupKey, Job, JobGroup, Target};
pub use config::RuntimeConfig;
pub use context::{create_backend, Context};
pub use cpu::{HostBatchBackend, HostNestBackend, HostTaskBackend};
pub use device::{Device, DeviceBackend, DeviceSet, StreamEvent};
pub use distributed::{run_spmd, Communicator, MessageKey, ReduceOp, Universe};
