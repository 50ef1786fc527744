//! Execution backend trait and target selection.
//!
//! The [`ExecutionBackend`] trait abstracts over the four ways a stage of a
//! tile algorithm can be executed (per-task, nested loop, host batched,
//! accelerator batched) so that the algorithms in `tessera-core` only build
//! lists of independent tile jobs and never care how they are scheduled.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors originating from compute backends, devices and the communication
/// domain.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Backend not available: {0}")]
    Unavailable(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Out of memory on device {device}: requested {requested} bytes, available {available}")]
    OutOfMemory {
        device: usize,
        requested: usize,
        available: usize,
    },

    #[error("Communication failure: {0}")]
    Communication(String),

    #[error("Tile job failed: {0}")]
    JobFailed(String),
}

/// Implementation target for the compute step of an algorithm stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Target {
    /// Every tile update is an independent task on the work-stealing pool.
    #[default]
    #[serde(alias = "per-task", alias = "host")]
    HostTask,
    /// All tile updates of a stage form one flat parallel loop.
    #[serde(alias = "nested-loop")]
    HostNest,
    /// Same-shaped tile updates are coalesced into grouped kernel calls.
    #[serde(alias = "host-batched")]
    HostBatch,
    /// Grouped kernel calls on accelerator-resident copies of the tiles.
    #[serde(alias = "accelerator-batched")]
    Devices,
}

impl Target {
    pub const ALL: [Target; 4] = [
        Target::HostTask,
        Target::HostNest,
        Target::HostBatch,
        Target::Devices,
    ];
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::HostTask => write!(f, "host-task"),
            Target::HostNest => write!(f, "host-nest"),
            Target::HostBatch => write!(f, "host-batch"),
            Target::Devices => write!(f, "devices"),
        }
    }
}

impl FromStr for Target {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" | "host-task" | "hosttask" | "per-task" => Ok(Target::HostTask),
            "host-nest" | "hostnest" | "nested-loop" => Ok(Target::HostNest),
            "host-batch" | "hostbatch" | "host-batched" => Ok(Target::HostBatch),
            "devices" | "device" | "accelerator-batched" => Ok(Target::Devices),
            other => Err(ComputeError::Unavailable(format!("unknown target '{other}'"))),
        }
    }
}

/// Describes the capabilities of a compute backend.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub target: Target,
    pub memory_bytes: Option<usize>,
    pub compute_units: Option<usize>,
}

/// One independent tile update. Jobs own everything they touch (tile
/// handles are reference counted), so they may run on any thread.
pub type Job = Box<dyn FnOnce() -> Result<(), ComputeError> + Send + 'static>;

/// Shape signature shared by every job of a group: the `(m, n, k)` extents
/// of the kernel call plus the device the operands live on, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub device: Option<usize>,
}

/// Jobs sharing one [`GroupKey`], executed as a single grouped call.
pub struct JobGroup {
    pub key: GroupKey,
    pub jobs: Vec<Job>,
}

impl JobGroup {
    pub fn new(key: GroupKey) -> Self {
        Self {
            key,
            jobs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Abstraction over execution targets.
///
/// Algorithms hand a backend either a flat list of jobs (tile updates of
/// arbitrary shapes) or a list of same-shaped groups. Backends that have no
/// notion of grouping simply flatten the groups.
pub trait ExecutionBackend: Send + Sync {
    /// Return information about the execution resources.
    fn device_info(&self) -> DeviceInfo;

    /// The target this backend implements.
    fn target(&self) -> Target;

    /// Execute independent jobs and wait for all of them.
    ///
    /// The first error is reported after every job has finished.
    fn run(&self, jobs: Vec<Job>) -> Result<(), ComputeError>;

    /// Execute groups of same-shaped jobs and wait for all of them.
    fn run_grouped(&self, groups: Vec<JobGroup>) -> Result<(), ComputeError> {
        let jobs = groups.into_iter().flat_map(|g| g.jobs).collect();
        self.run(jobs)
    }
}
