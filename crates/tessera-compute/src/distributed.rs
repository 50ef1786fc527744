//! In-process communication domain.
//!
//! A [`Universe`] of `size` ranks is a set of mailboxes, one per rank.
//! Each rank holds a [`Communicator`] giving it point-to-point messaging and
//! a few collectives. Messages are addressed by `(source, MessageKey)` and
//! are delivered in FIFO order per address; `send` never blocks, `recv`
//! blocks until a matching message arrives or the timeout elapses.
//!
//! Collectives are built from point-to-point messages on a reserved key
//! space, numbered by a per-communicator sequence counter. All ranks must
//! therefore call collectives in the same order, which is the usual SPMD
//! contract.
//!
//! [`run_spmd`] starts one OS thread per rank and is what the tests use to
//! emulate a multi-process job.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::backend::ComputeError;

/// Key reserved for collective operations.
const COLLECTIVE_UID: u64 = u64::MAX;

/// Default receive timeout used by [`run_spmd`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Address of a message within a `(source, destination)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    /// Identifier of the matrix storage the tile belongs to.
    pub uid: u64,
    pub i: usize,
    pub j: usize,
    pub tag: i64,
}

impl MessageKey {
    pub fn new(uid: u64, i: usize, j: usize, tag: i64) -> Self {
        Self { uid, i, j, tag }
    }

    fn collective(seq: u64) -> Self {
        Self {
            uid: COLLECTIVE_UID,
            i: 0,
            j: 0,
            tag: seq as i64,
        }
    }
}

type Payload = Box<dyn Any + Send>;

#[derive(Default)]
struct Mailbox {
    queues: Mutex<HashMap<(usize, MessageKey), VecDeque<Payload>>>,
    arrived: Condvar,
}

/// Reduction operator for [`Communicator::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    fn combine(self, acc: &mut [f64], values: &[f64]) {
        for (a, v) in acc.iter_mut().zip(values) {
            match self {
                ReduceOp::Sum => *a += *v,
                ReduceOp::Max => *a = a.max(*v),
            }
        }
    }
}

/// A set of ranks sharing mailboxes.
pub struct Universe {
    mailboxes: Arc<Vec<Mailbox>>,
    timeout: Option<Duration>,
}

impl Universe {
    pub fn new(size: usize) -> Self {
        let mailboxes = (0..size.max(1)).map(|_| Mailbox::default()).collect();
        Self {
            mailboxes: Arc::new(mailboxes),
            timeout: None,
        }
    }

    /// Bound every blocking receive by `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn size(&self) -> usize {
        self.mailboxes.len()
    }

    /// The communicator of `rank`. Each rank must be handed out once.
    pub fn communicator(&self, rank: usize) -> Result<Communicator, ComputeError> {
        if rank >= self.size() {
            return Err(ComputeError::Communication(format!(
                "rank {rank} outside universe of size {}",
                self.size()
            )));
        }
        Ok(Communicator {
            rank,
            size: self.size(),
            mailboxes: Arc::clone(&self.mailboxes),
            timeout: self.timeout,
            collective_seq: AtomicU64::new(0),
            storage_uid: AtomicU64::new(0),
        })
    }

    /// One communicator per rank, in rank order.
    pub fn communicators(&self) -> Vec<Communicator> {
        (0..self.size())
            .filter_map(|rank| self.communicator(rank).ok())
            .collect()
    }
}

/// A rank's endpoint into its [`Universe`].
pub struct Communicator {
    rank: usize,
    size: usize,
    mailboxes: Arc<Vec<Mailbox>>,
    timeout: Option<Duration>,
    collective_seq: AtomicU64,
    storage_uid: AtomicU64,
}

impl Communicator {
    /// A universe of one rank.
    pub fn single() -> Self {
        Self {
            rank: 0,
            size: 1,
            mailboxes: Arc::new(vec![Mailbox::default()]),
            timeout: None,
            collective_seq: AtomicU64::new(0),
            storage_uid: AtomicU64::new(0),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Next identifier for a matrix storage. Ranks that create matrices in
    /// the same order agree on the identifiers.
    pub fn next_uid(&self) -> u64 {
        self.storage_uid.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver `payload` to `dest`. Never blocks.
    pub fn send<T: Send + 'static>(
        &self,
        dest: usize,
        key: MessageKey,
        payload: T,
    ) -> Result<(), ComputeError> {
        let mailbox = self.mailboxes.get(dest).ok_or_else(|| {
            ComputeError::Communication(format!("send to rank {dest} outside universe of size {}", self.size))
        })?;
        let mut queues = mailbox.queues.lock().unwrap_or_else(|p| p.into_inner());
        queues
            .entry((self.rank, key))
            .or_default()
            .push_back(Box::new(payload));
        mailbox.arrived.notify_all();
        Ok(())
    }

    /// Receive the oldest message sent by `src` under `key`.
    pub fn recv<T: Send + 'static>(&self, src: usize, key: MessageKey) -> Result<T, ComputeError> {
        if src >= self.size {
            return Err(ComputeError::Communication(format!(
                "receive from rank {src} outside universe of size {}",
                self.size
            )));
        }
        let mailbox = &self.mailboxes[self.rank];
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut queues = mailbox.queues.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(queue) = queues.get_mut(&(src, key)) {
                if let Some(payload) = queue.pop_front() {
                    if queue.is_empty() {
                        queues.remove(&(src, key));
                    }
                    return payload.downcast::<T>().map(|b| *b).map_err(|_| {
                        ComputeError::Communication(format!(
                            "message {key:?} from rank {src} has an unexpected payload type"
                        ))
                    });
                }
            }
            queues = match deadline {
                None => mailbox.arrived.wait(queues).unwrap_or_else(|p| p.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ComputeError::Communication(format!(
                            "rank {} timed out waiting for {key:?} from rank {src}",
                            self.rank
                        )));
                    }
                    mailbox
                        .arrived
                        .wait_timeout(queues, deadline - now)
                        .unwrap_or_else(|p| p.into_inner())
                        .0
                }
            };
        }
    }

    fn next_collective(&self) -> MessageKey {
        MessageKey::collective(self.collective_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Element-wise reduction of `values` over all ranks; every rank ends
    /// with the reduced vector.
    pub fn all_reduce(&self, values: &mut [f64], op: ReduceOp) -> Result<(), ComputeError> {
        let key = self.next_collective();
        if self.size == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            for src in 1..self.size {
                let part: Vec<f64> = self.recv(src, key)?;
                if part.len() != values.len() {
                    return Err(ComputeError::Communication(format!(
                        "all_reduce length mismatch: rank {src} sent {}, expected {}",
                        part.len(),
                        values.len()
                    )));
                }
                op.combine(values, &part);
            }
            for dest in 1..self.size {
                self.send(dest, key, values.to_vec())?;
            }
        } else {
            self.send(0, key, values.to_vec())?;
            let reduced: Vec<f64> = self.recv(0, key)?;
            values.copy_from_slice(&reduced);
        }
        Ok(())
    }

    pub fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), ComputeError> {
        self.all_reduce(values, ReduceOp::Sum)
    }

    pub fn all_reduce_max(&self, values: &mut [f64]) -> Result<(), ComputeError> {
        self.all_reduce(values, ReduceOp::Max)
    }

    /// Wait until every rank has reached the barrier.
    pub fn barrier(&self) -> Result<(), ComputeError> {
        self.all_reduce(&mut [], ReduceOp::Sum)
    }
}

/// Run `f` once per rank of a fresh universe, each on its own thread, and
/// return the results in rank order. A panic on any rank is propagated.
pub fn run_spmd<F, R>(size: usize, f: F) -> Vec<R>
where
    F: Fn(Communicator) -> R + Sync,
    R: Send,
{
    let universe = Universe::new(size).with_timeout(Some(DEFAULT_TIMEOUT));
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = universe
            .communicators()
            .into_iter()
            .map(|comm| s.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(r) => r,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_to_point_is_fifo_per_key() {
        let universe = Universe::new(2);
        let comms = universe.communicators();
        let key = MessageKey::new(7, 1, 2, 0);
        comms[0].send(1, key, 1.0_f64).unwrap();
        comms[0].send(1, key, 2.0_f64).unwrap();
        comms[0].send(1, MessageKey::new(7, 1, 2, 5), 9.0_f64).unwrap();
        assert_eq!(comms[1].recv::<f64>(0, MessageKey::new(7, 1, 2, 5)).unwrap(), 9.0);
        assert_eq!(comms[1].recv::<f64>(0, key).unwrap(), 1.0);
        assert_eq!(comms[1].recv::<f64>(0, key).unwrap(), 2.0);
    }

    #[test]
    fn test_recv_times_out() {
        let universe = Universe::new(2).with_timeout(Some(Duration::from_millis(20)));
        let comm = universe.communicator(1).unwrap();
        let err = comm.recv::<f64>(0, MessageKey::new(0, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, ComputeError::Communication(_)));
    }

    #[test]
    fn test_wrong_payload_type_is_an_error() {
        let universe = Universe::new(1);
        let comm = universe.communicator(0).unwrap();
        let key = MessageKey::new(0, 0, 0, 0);
        comm.send(0, key, 3_u32).unwrap();
        assert!(comm.recv::<f64>(0, key).is_err());
    }

    #[test]
    fn test_all_reduce_sum_and_max() {
        let results = run_spmd(4, |comm| {
            let r = comm.rank() as f64;
            let mut sum = vec![r, 1.0];
            comm.all_reduce_sum(&mut sum).unwrap();
            let mut max = vec![r, -r];
            comm.all_reduce_max(&mut max).unwrap();
            comm.barrier().unwrap();
            (sum, max)
        });
        for (sum, max) in results {
            assert_eq!(sum, vec![6.0, 4.0]);
            assert_eq!(max, vec![3.0, 0.0]);
        }
    }

    #[test]
    fn test_uids_agree_across_ranks() {
        let uids = run_spmd(3, |comm| (comm.next_uid(), comm.next_uid()));
        assert!(uids.iter().all(|&u| u == (0, 1)));
    }
}
