//! Simulated accelerator devices.
//!
//! Each device owns a bounded memory pool (a byte counter, tiles themselves
//! stay in host memory) and one execution stream. A stream is a worker
//! thread fed through a channel; submitting work returns a [`StreamEvent`]
//! that can be waited on, so submissions to different devices overlap.
//!
//! # Memory accounting
//!
//! Every device-resident tile instance and every pointer-array staging
//! buffer reserves its size in the pool before use and releases it when
//! evicted. A reservation that does not fit fails with
//! [`ComputeError::OutOfMemory`] instead of blocking.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::backend::{ComputeError, DeviceInfo, ExecutionBackend, Job, JobGroup, Target};
use crate::cpu::HostBatchBackend;

/// Work submitted to a stream together with the channel its completion is
/// reported on.
struct StreamItem {
    jobs: Vec<Job>,
    done: mpsc::Sender<Result<(), ComputeError>>,
}

/// Completion handle for one stream submission.
pub struct StreamEvent {
    device: usize,
    done: mpsc::Receiver<Result<(), ComputeError>>,
}

impl StreamEvent {
    /// Block until the submission has executed.
    pub fn wait(self) -> Result<(), ComputeError> {
        self.done.recv().map_err(|_| {
            ComputeError::DeviceError(format!("stream of device {} terminated", self.device))
        })?
    }
}

/// Report `result` to the submitter. A submitter that stopped waiting
/// cannot observe it, so the outcome is logged instead.
fn deliver(
    device: usize,
    done: &mpsc::Sender<Result<(), ComputeError>>,
    result: Result<(), ComputeError>,
) -> bool {
    match done.send(result) {
        Ok(()) => true,
        Err(mpsc::SendError(Err(e))) => {
            log::warn!("device {device}: submission failed with no one waiting: {e}");
            false
        }
        Err(mpsc::SendError(Ok(()))) => {
            log::warn!("device {device}: submission finished with no one waiting");
            false
        }
    }
}

/// In-order execution queue of one device.
struct DeviceStream {
    sender: Mutex<Option<mpsc::Sender<StreamItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceStream {
    fn spawn(device: usize, lanes: usize) -> Result<Self, ComputeError> {
        let (sender, receiver) = mpsc::channel::<StreamItem>();
        let worker = std::thread::Builder::new()
            .name(format!("tessera-device-{device}"))
            .spawn(move || {
                for item in receiver {
                    let result = HostBatchBackend::batched_call(item.jobs, lanes);
                    deliver(device, &item.done, result);
                }
            })
            .map_err(|e| ComputeError::DeviceError(format!("failed to start stream: {e}")))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

/// One simulated accelerator.
pub struct Device {
    id: usize,
    capacity: usize,
    used: Mutex<usize>,
    stream: DeviceStream,
}

impl Device {
    pub fn new(id: usize, capacity: usize) -> Result<Self, ComputeError> {
        let lanes = rayon::current_num_threads();
        Ok(Self {
            id,
            capacity,
            used: Mutex::new(0),
            stream: DeviceStream::spawn(id, lanes)?,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Total pool size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> usize {
        *self.used.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    /// Reserve `bytes` in the pool.
    pub fn reserve(&self, bytes: usize) -> Result<(), ComputeError> {
        let mut used = self.used.lock().unwrap_or_else(|p| p.into_inner());
        let available = self.capacity.saturating_sub(*used);
        if bytes > available {
            return Err(ComputeError::OutOfMemory {
                device: self.id,
                requested: bytes,
                available,
            });
        }
        *used += bytes;
        log::trace!("device {}: reserved {} bytes ({} in use)", self.id, bytes, *used);
        Ok(())
    }

    /// Return `bytes` to the pool.
    pub fn release(&self, bytes: usize) {
        let mut used = self.used.lock().unwrap_or_else(|p| p.into_inner());
        debug_assert!(*used >= bytes, "device {} released more than reserved", self.id);
        *used = used.saturating_sub(bytes);
    }

    /// Enqueue jobs on the device stream. They execute as one grouped call
    /// after everything submitted earlier.
    pub fn submit(&self, jobs: Vec<Job>) -> Result<StreamEvent, ComputeError> {
        let (done, event) = mpsc::channel();
        let sender = self.stream.sender.lock().unwrap_or_else(|p| p.into_inner());
        let sender = sender
            .as_ref()
            .ok_or_else(|| ComputeError::DeviceError(format!("device {} is shut down", self.id)))?;
        sender
            .send(StreamItem { jobs, done })
            .map_err(|_| ComputeError::DeviceError(format!("stream of device {} closed", self.id)))?;
        Ok(StreamEvent {
            device: self.id,
            done: event,
        })
    }
}

/// The accelerators visible to one process.
pub struct DeviceSet {
    devices: Vec<Arc<Device>>,
}

impl DeviceSet {
    /// Create `count` devices of `memory_bytes` each.
    pub fn new(count: usize, memory_bytes: usize) -> Result<Self, ComputeError> {
        let devices = (0..count)
            .map(|id| Device::new(id, memory_bytes).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { devices })
    }

    /// A process without accelerators.
    pub fn empty() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, device: usize) -> Result<&Arc<Device>, ComputeError> {
        self.devices.get(device).ok_or_else(|| {
            ComputeError::Unavailable(format!(
                "device {device} requested but only {} configured",
                self.devices.len()
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.iter()
    }
}

/// Bytes of one pointer-array staging buffer for a group of `len` jobs
/// (one pointer each for A, B and C).
pub fn pointer_array_bytes(len: usize) -> usize {
    3 * len * std::mem::size_of::<usize>()
}

/// Accelerator-batched backend: each group goes to the stream of the device
/// its operands live on. Groups on different devices run concurrently.
pub struct DeviceBackend {
    devices: Arc<DeviceSet>,
}

impl DeviceBackend {
    pub fn new(devices: Arc<DeviceSet>) -> Result<Self, ComputeError> {
        if devices.is_empty() {
            return Err(ComputeError::Unavailable(
                "accelerator target selected but no devices are configured".into(),
            ));
        }
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &Arc<DeviceSet> {
        &self.devices
    }
}

impl ExecutionBackend for DeviceBackend {
    fn device_info(&self) -> DeviceInfo {
        let memory = self.devices.iter().map(|d| d.capacity()).sum();
        DeviceInfo {
            name: format!("{} simulated accelerator(s)", self.devices.len()),
            target: Target::Devices,
            memory_bytes: Some(memory),
            compute_units: Some(self.devices.len()),
        }
    }

    fn target(&self) -> Target {
        Target::Devices
    }

    fn run(&self, jobs: Vec<Job>) -> Result<(), ComputeError> {
        self.devices.get(0)?.submit(jobs)?.wait()
    }

    fn run_grouped(&self, groups: Vec<JobGroup>) -> Result<(), ComputeError> {
        let mut pending = Vec::with_capacity(groups.len());
        let mut first_error = None;
        for group in groups {
            let device = match self.devices.get(group.key.device.unwrap_or(0)) {
                Ok(device) => Arc::clone(device),
                Err(e) => {
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            let staging = pointer_array_bytes(group.len());
            if let Err(e) = device.reserve(staging) {
                first_error.get_or_insert(e);
                continue;
            }
            log::trace!(
                "device {}: submitting {} jobs of shape {}x{}x{}",
                device.id(),
                group.len(),
                group.key.m,
                group.key.n,
                group.key.k
            );
            match device.submit(group.jobs) {
                Ok(event) => pending.push((device, staging, event)),
                Err(e) => {
                    device.release(staging);
                    first_error.get_or_insert(e);
                }
            }
        }
        for (device, staging, event) in pending {
            let result = event.wait();
            device.release(staging);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GroupKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_reserve_beyond_capacity_fails() {
        let device = Device::new(0, 1024).unwrap();
        device.reserve(1000).unwrap();
        let err = device.reserve(100).unwrap_err();
        match err {
            ComputeError::OutOfMemory {
                device,
                requested,
                available,
            } => {
                assert_eq!(device, 0);
                assert_eq!(requested, 100);
                assert_eq!(available, 24);
            }
            other => panic!("unexpected error: {other}"),
        }
        device.release(1000);
        assert_eq!(device.used(), 0);
        assert_eq!(device.available(), 1024);
    }

    #[test]
    fn test_stream_executes_in_submission_order() {
        let device = Device::new(0, 0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let events: Vec<_> = (0..5)
            .map(|k| {
                let log = Arc::clone(&log);
                let job: Job = Box::new(move || {
                    log.lock().unwrap().push(k);
                    Ok(())
                });
                device.submit(vec![job]).unwrap()
            })
            .collect();
        for event in events {
            event.wait().unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_backend_releases_staging_buffers() {
        let devices = Arc::new(DeviceSet::new(2, 1 << 20).unwrap());
        let backend = DeviceBackend::new(Arc::clone(&devices)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let groups = (0..4)
            .map(|g| {
                let mut group = JobGroup::new(GroupKey {
                    m: 8,
                    n: 8,
                    k: 8,
                    device: Some(g % 2),
                });
                for _ in 0..3 {
                    let counter = Arc::clone(&counter);
                    group.jobs.push(Box::new(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }));
                }
                group
            })
            .collect();
        backend.run_grouped(groups).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 12);
        for device in devices.iter() {
            assert_eq!(device.used(), 0);
        }
    }

    #[test]
    fn test_result_without_waiter_is_not_delivered() {
        let (done, event) = mpsc::channel();
        assert!(deliver(0, &done, Ok(())));
        assert!(event.recv().unwrap().is_ok());
        drop(event);
        assert!(!deliver(0, &done, Err(ComputeError::JobFailed("late".into()))));
    }

    #[test]
    fn test_backend_requires_devices() {
        assert!(DeviceBackend::new(Arc::new(DeviceSet::empty())).is_err());
    }
}
