//! Host backends using Rayon for shared-memory parallelism.
//!
//! Three flavours share the same thread pool and differ only in how a stage
//! is cut into work items:
//!
//! - [`HostTaskBackend`]: one pool task per tile job.
//! - [`HostNestBackend`]: one flat parallel loop, dynamically chunked by one job.
//! - [`HostBatchBackend`]: one batched call per same-shaped group, with the
//!   group's tile list cut into one contiguous run per lane.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;

use crate::backend::{ComputeError, DeviceInfo, ExecutionBackend, Job, JobGroup, Target};

/// Keep the first error reported by any job.
fn record_first(slot: &Mutex<Option<ComputeError>>, result: Result<(), ComputeError>) {
    if let Err(e) = result {
        let mut slot = slot.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}

/// The first error of `results`, in order.
fn first_error(results: Vec<Result<(), ComputeError>>) -> Result<(), ComputeError> {
    results.into_iter().fold(Ok(()), |acc, r| acc.and(r))
}

fn host_info(name: &str, target: Target, num_threads: usize) -> DeviceInfo {
    DeviceInfo {
        name: format!("{name} ({num_threads} threads)"),
        target,
        memory_bytes: None,
        compute_units: Some(num_threads),
    }
}

/// Per-task backend: every job is spawned into a Rayon scope.
pub struct HostTaskBackend {
    num_threads: usize,
}

impl HostTaskBackend {
    pub fn new() -> Self {
        Self {
            num_threads: rayon::current_num_threads(),
        }
    }
}

impl Default for HostTaskBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBackend for HostTaskBackend {
    fn device_info(&self) -> DeviceInfo {
        host_info("CPU tasks", Target::HostTask, self.num_threads)
    }

    fn target(&self) -> Target {
        Target::HostTask
    }

    fn run(&self, jobs: Vec<Job>) -> Result<(), ComputeError> {
        let first_error = Mutex::new(None);
        rayon::scope(|s| {
            for job in jobs {
                let first_error = &first_error;
                s.spawn(move |_| record_first(first_error, job()));
            }
        });
        match first_error.into_inner().unwrap_or_else(|p| p.into_inner()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Nested-loop backend: the whole stage is a single parallel iterator with
/// dynamic scheduling of one job per chunk.
pub struct HostNestBackend {
    num_threads: usize,
}

impl HostNestBackend {
    pub fn new() -> Self {
        Self {
            num_threads: rayon::current_num_threads(),
        }
    }
}

impl Default for HostNestBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBackend for HostNestBackend {
    fn device_info(&self) -> DeviceInfo {
        host_info("CPU parallel loop", Target::HostNest, self.num_threads)
    }

    fn target(&self) -> Target {
        Target::HostNest
    }

    fn run(&self, jobs: Vec<Job>) -> Result<(), ComputeError> {
        jobs.into_par_iter()
            .with_max_len(1)
            .map(|job| job())
            .collect::<Result<Vec<()>, ComputeError>>()
            .map(|_| ())
    }
}

/// Host batched backend. Groups run concurrently and each group is one
/// batched call over its tile list.
pub struct HostBatchBackend {
    num_threads: usize,
    calls: AtomicUsize,
}

impl HostBatchBackend {
    pub fn new() -> Self {
        Self {
            num_threads: rayon::current_num_threads(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Batched calls issued so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Execute one batch as a single call. The tile list is split into at
    /// most `lanes` contiguous runs; each run executes in order on one pool
    /// task. Every job runs even if an earlier one fails.
    pub(crate) fn batched_call(jobs: Vec<Job>, lanes: usize) -> Result<(), ComputeError> {
        let per_lane = jobs.len().div_ceil(lanes.max(1)).max(1);
        let mut runs: Vec<Vec<Job>> = Vec::with_capacity(lanes);
        let mut jobs = jobs.into_iter().peekable();
        while jobs.peek().is_some() {
            runs.push(jobs.by_ref().take(per_lane).collect());
        }
        let results = runs
            .into_par_iter()
            .map(|run| first_error(run.into_iter().map(|job| job()).collect()))
            .collect();
        first_error(results)
    }

    fn dispatch(&self, group: JobGroup) -> Result<(), ComputeError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "host batch: {} jobs of shape {}x{}x{}",
            group.len(),
            group.key.m,
            group.key.n,
            group.key.k
        );
        Self::batched_call(group.jobs, self.num_threads)
    }
}

impl Default for HostBatchBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBackend for HostBatchBackend {
    fn device_info(&self) -> DeviceInfo {
        host_info("CPU batched", Target::HostBatch, self.num_threads)
    }

    fn target(&self) -> Target {
        Target::HostBatch
    }

    fn run(&self, jobs: Vec<Job>) -> Result<(), ComputeError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Self::batched_call(jobs, self.num_threads)
    }

    fn run_grouped(&self, groups: Vec<JobGroup>) -> Result<(), ComputeError> {
        let results = groups
            .into_par_iter()
            .with_max_len(1)
            .map(|group| self.dispatch(group))
            .collect();
        first_error(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GroupKey;
    use std::sync::Arc;

    fn counting_jobs(counter: &Arc<AtomicUsize>, n: usize) -> Vec<Job> {
        (0..n)
            .map(|_| {
                let counter = Arc::clone(counter);
                Box::new(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }) as Job
            })
            .collect()
    }

    #[test]
    fn test_every_host_backend_runs_all_jobs() {
        let backends: Vec<Box<dyn ExecutionBackend>> = vec![
            Box::new(HostTaskBackend::new()),
            Box::new(HostNestBackend::new()),
            Box::new(HostBatchBackend::new()),
        ];
        for backend in backends {
            let counter = Arc::new(AtomicUsize::new(0));
            backend.run(counting_jobs(&counter, 37)).unwrap();
            assert_eq!(counter.load(Ordering::Relaxed), 37, "{}", backend.target());
        }
    }

    #[test]
    fn test_grouped_run_executes_every_group() {
        let counter = Arc::new(AtomicUsize::new(0));
        let groups = (0..3)
            .map(|g| JobGroup {
                key: GroupKey {
                    m: g + 1,
                    n: 4,
                    k: 4,
                    device: None,
                },
                jobs: counting_jobs(&counter, 5),
            })
            .collect();
        let backend = HostBatchBackend::new();
        backend.run_grouped(groups).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 15);
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn test_batched_call_splits_into_contiguous_runs() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let jobs: Vec<Job> = (0..7)
            .map(|k| {
                let order = Arc::clone(&order);
                Box::new(move || {
                    let lane = rayon::current_thread_index();
                    order.lock().unwrap().push((k, lane));
                    Ok(())
                }) as Job
            })
            .collect();
        HostBatchBackend::batched_call(jobs, 1).unwrap();
        let order = order.lock().unwrap();
        // A single lane runs the whole tile list in order on one thread.
        assert_eq!(order.iter().map(|(k, _)| *k).collect::<Vec<_>>(), (0..7).collect::<Vec<_>>());
        assert!(order.iter().all(|(_, lane)| *lane == order[0].1));
    }

    #[test]
    fn test_batched_call_reports_error_after_every_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut jobs = counting_jobs(&counter, 3);
        jobs.insert(1, Box::new(|| Err(ComputeError::JobFailed("singular tile".into()))));
        let backend = HostBatchBackend::new();
        let err = backend.run(jobs).unwrap_err();
        assert!(matches!(err, ComputeError::JobFailed(_)));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert_eq!(backend.calls(), 1);
    }

    #[test]
    fn test_job_error_is_reported_after_all_jobs_ran() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut jobs = counting_jobs(&counter, 8);
        jobs.push(Box::new(|| Err(ComputeError::JobFailed("boom".into()))));
        let err = HostTaskBackend::new().run(jobs).unwrap_err();
        assert!(matches!(err, ComputeError::JobFailed(_)));
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }
}
