//! Lookahead pipeline.
//!
//! A sweep over `K` stages is driven by two lanes: a broadcast lane that
//! replicates the data stage `k` needs, and a compute lane that applies the
//! stage. Per-stage [`Token`]s order them:
//!
//! 1. broadcast `k` waits for compute `k - lookahead - 1`,
//! 2. compute `k` waits for broadcast `k` and compute `k - 1`.
//!
//! At most `lookahead + 1` stages are therefore replicated ahead of the
//! computation, and `lookahead = 0` serializes the sweep. A failure in
//! either lane poisons every token, so the other lane stops instead of
//! waiting forever.

use std::sync::{Condvar, Mutex};

use crate::error::{Result, TileError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Pending,
    Done,
    Poisoned,
}

/// One-shot completion flag.
pub struct Token {
    state: Mutex<TokenState>,
    changed: Condvar,
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl Token {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TokenState::Pending),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> TokenState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set(&self, to: TokenState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == TokenState::Pending {
            *state = to;
            self.changed.notify_all();
        }
    }

    pub fn complete(&self) {
        self.set(TokenState::Done);
    }

    pub fn poison(&self) {
        self.set(TokenState::Poisoned);
    }

    /// Block until the token is done. Fails if it was poisoned.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        while *state == TokenState::Pending {
            state = self.changed.wait(state).unwrap_or_else(|p| p.into_inner());
        }
        match *state {
            TokenState::Done => Ok(()),
            _ => Err(TileError::Backend("pipeline aborted".into())),
        }
    }
}

/// Entries of the pipeline's event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    BroadcastStart(usize),
    BroadcastDone(usize),
    ComputeStart(usize),
    ComputeDone(usize),
}

pub struct Pipeline {
    stages: usize,
    lookahead: usize,
    bcast: Vec<Token>,
    compute: Vec<Token>,
    events: Mutex<Vec<StageEvent>>,
    first_error: Mutex<Option<TileError>>,
}

/// Poisons the pipeline if the compute lane unwinds.
struct PoisonOnUnwind<'a>(&'a Pipeline);

impl Drop for PoisonOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.poison_all();
        }
    }
}

impl Pipeline {
    /// `lookahead` is clamped to `[0, stages - 1]`.
    pub fn new(stages: usize, lookahead: usize) -> Self {
        let clamped = lookahead.min(stages.saturating_sub(1));
        if clamped != lookahead {
            log::debug!("lookahead {lookahead} clamped to {clamped} for {stages} stages");
        }
        Self {
            stages,
            lookahead: clamped,
            bcast: (0..stages).map(|_| Token::new()).collect(),
            compute: (0..stages).map(|_| Token::new()).collect(),
            events: Mutex::new(Vec::with_capacity(4 * stages)),
            first_error: Mutex::new(None),
        }
    }

    pub fn stages(&self) -> usize {
        self.stages
    }

    pub fn lookahead(&self) -> usize {
        self.lookahead
    }

    /// Snapshot of the recorded stage events, in the order they happened.
    pub fn events(&self) -> Vec<StageEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn record(&self, event: StageEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }

    fn poison_all(&self) {
        for token in self.bcast.iter().chain(&self.compute) {
            token.poison();
        }
    }

    fn fail(&self, e: TileError) -> TileError {
        let mut first = self.first_error.lock().unwrap_or_else(|p| p.into_inner());
        if first.is_none() {
            *first = Some(e);
        }
        drop(first);
        self.poison_all();
        TileError::Backend("pipeline aborted".into())
    }

    fn broadcast_lane<B>(&self, mut broadcast: B) -> Result<()>
    where
        B: FnMut(usize) -> Result<()>,
    {
        for k in 0..self.stages {
            if k > self.lookahead {
                self.compute[k - self.lookahead - 1].wait()?;
            }
            self.record(StageEvent::BroadcastStart(k));
            broadcast(k).map_err(|e| self.fail(e))?;
            self.record(StageEvent::BroadcastDone(k));
            self.bcast[k].complete();
        }
        Ok(())
    }

    fn compute_lane<C>(&self, mut compute: C) -> Result<()>
    where
        C: FnMut(usize) -> Result<()>,
    {
        let _guard = PoisonOnUnwind(self);
        for k in 0..self.stages {
            self.bcast[k].wait()?;
            log::debug!("stage {k}/{}", self.stages);
            self.record(StageEvent::ComputeStart(k));
            compute(k).map_err(|e| self.fail(e))?;
            self.record(StageEvent::ComputeDone(k));
            self.compute[k].complete();
        }
        Ok(())
    }

    /// Run the sweep. `broadcast` runs on its own thread, `compute` on the
    /// caller's. Returns the first error raised by either lane.
    pub fn run<B, C>(&self, broadcast: B, compute: C) -> Result<()>
    where
        B: FnMut(usize) -> Result<()> + Send,
        C: FnMut(usize) -> Result<()>,
    {
        let (bcast_result, compute_result) = std::thread::scope(|s| {
            let lane = s.spawn(|| self.broadcast_lane(broadcast));
            let compute_result = self.compute_lane(compute);
            let bcast_result = match lane.join() {
                Ok(r) => r,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            (bcast_result, compute_result)
        });
        if let Some(e) = self
            .first_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            return Err(e);
        }
        bcast_result.and(compute_result)
    }
}
