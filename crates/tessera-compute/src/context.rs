//! Execution context: a rank's communicator plus its accelerators.

use std::sync::Arc;

use crate::backend::{ComputeError, ExecutionBackend, Target};
use crate::config::RuntimeConfig;
use crate::cpu::{HostBatchBackend, HostNestBackend, HostTaskBackend};
use crate::device::{DeviceBackend, DeviceSet};
use crate::distributed::Communicator;

/// Shared by every matrix created on a rank.
#[derive(Clone)]
pub struct Context {
    comm: Arc<Communicator>,
    devices: Arc<DeviceSet>,
}

impl Context {
    pub fn new(comm: Communicator, devices: DeviceSet) -> Self {
        Self {
            comm: Arc::new(comm),
            devices: Arc::new(devices),
        }
    }

    /// Single rank, no accelerators.
    pub fn local() -> Self {
        Self::new(Communicator::single(), DeviceSet::empty())
    }

    /// Build the devices described by `config` for `comm`.
    ///
    /// The communicator's timeout is fixed by its universe; `config`'s
    /// timeout applies when the universe is built with [`Self::universe`].
    pub fn from_config(comm: Communicator, config: &RuntimeConfig) -> Result<Self, ComputeError> {
        let devices = DeviceSet::new(config.devices, config.device_memory_bytes)?;
        log::debug!(
            "rank {}/{}: {} device(s) of {} bytes",
            comm.rank(),
            comm.size(),
            config.devices,
            config.device_memory_bytes
        );
        Ok(Self::new(comm, devices))
    }

    /// A universe of `size` ranks using `config`'s receive timeout.
    pub fn universe(size: usize, config: &RuntimeConfig) -> crate::distributed::Universe {
        crate::distributed::Universe::new(size).with_timeout(config.comm_timeout())
    }

    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    pub fn devices(&self) -> &Arc<DeviceSet> {
        &self.devices
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }
}

/// Instantiate the backend implementing `target`.
pub fn create_backend(
    target: Target,
    ctx: &Context,
) -> Result<Arc<dyn ExecutionBackend>, ComputeError> {
    let backend: Arc<dyn ExecutionBackend> = match target {
        Target::HostTask => Arc::new(HostTaskBackend::new()),
        Target::HostNest => Arc::new(HostNestBackend::new()),
        Target::HostBatch => Arc::new(HostBatchBackend::new()),
        Target::Devices => Arc::new(DeviceBackend::new(Arc::clone(ctx.devices()))?),
    };
    Ok(backend)
}
