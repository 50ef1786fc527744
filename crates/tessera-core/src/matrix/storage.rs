//! Shared tile storage behind every view of a matrix.
//!
//! Coordinates here are *physical* tile indices of the full matrix; views
//! translate their logical coordinates before calling in.
//!
//! Each coordinate maps to a [`TileNode`] holding the tile's instances, at
//! most one per residency. A local tile has exactly one origin instance.
//! Writing through an instance invalidates the others, and an invalid
//! origin is refreshed from a valid instance by [`MatrixStorage::update_origin`].
//!
//! Every live view is registered with the span of tiles it covers. The life
//! of a scratch origin (inserted as workspace) is the number of registered
//! views covering it; the instance is freed when that count reaches zero.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use ndarray::Array2;
use tessera_compute::Context;

use crate::distribution::Distribution;
use crate::error::{Result, TileError};
use crate::scalar::Scalar;
use crate::tile::{new_data, TileData};
use crate::types::Residency;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstanceKind {
    /// The authoritative copy of a local tile.
    Origin,
    /// Scratch instance, freed by `release_workspace`.
    Workspace,
    /// Read-only copy, freed when its life counter reaches zero.
    Replica,
}

pub(crate) struct TileInstance<T> {
    pub(crate) data: TileData<T>,
    pub(crate) kind: InstanceKind,
    pub(crate) valid: bool,
    pub(crate) life: i64,
}

pub(crate) struct TileNode<T> {
    pub(crate) origin: Option<Residency>,
    pub(crate) instances: HashMap<Residency, TileInstance<T>>,
}

impl<T> Default for TileNode<T> {
    fn default() -> Self {
        Self {
            origin: None,
            instances: HashMap::new(),
        }
    }
}

impl<T: Scalar> TileNode<T> {
    /// A valid instance to copy from, preferring the origin.
    fn valid_source(&self) -> Option<(Residency, TileData<T>)> {
        if let Some(origin) = self.origin {
            if let Some(inst) = self.instances.get(&origin) {
                if inst.valid {
                    return Some((origin, inst.data.clone()));
                }
            }
        }
        self.instances
            .iter()
            .filter(|(_, inst)| inst.valid)
            .min_by_key(|(res, _)| **res)
            .map(|(res, inst)| (*res, inst.data.clone()))
    }

    fn invalidate_others(&mut self, keep: Residency) {
        for (res, inst) in self.instances.iter_mut() {
            if *res != keep {
                inst.valid = false;
            }
        }
    }
}

/// Physical tile range covered by one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TileSpan {
    rows: Range<usize>,
    cols: Range<usize>,
}

impl TileSpan {
    pub(crate) fn new(rows: Range<usize>, cols: Range<usize>) -> Self {
        Self { rows, cols }
    }

    fn covers(&self, i: usize, j: usize) -> bool {
        self.rows.contains(&i) && self.cols.contains(&j)
    }
}

fn read_block<T: Scalar>(data: &TileData<T>) -> Array2<T> {
    data.read().unwrap_or_else(|p| p.into_inner()).clone()
}

fn write_block<T: Scalar>(data: &TileData<T>, block: &Array2<T>) {
    data.write()
        .unwrap_or_else(|p| p.into_inner())
        .assign(block);
}

pub(crate) struct MatrixStorage<T: Scalar> {
    pub(crate) uid: u64,
    pub(crate) m: usize,
    pub(crate) n: usize,
    pub(crate) nb: usize,
    pub(crate) mt: usize,
    pub(crate) nt: usize,
    pub(crate) dist: Distribution,
    pub(crate) ctx: Context,
    nodes: Mutex<HashMap<(usize, usize), TileNode<T>>>,
    views: Mutex<HashMap<u64, TileSpan>>,
    next_view: AtomicU64,
    has_scratch: AtomicBool,
}

impl<T: Scalar> MatrixStorage<T> {
    pub(crate) fn new(m: usize, n: usize, nb: usize, dist: Distribution, ctx: Context) -> Self {
        Self {
            uid: ctx.comm().next_uid(),
            m,
            n,
            nb,
            mt: m.div_ceil(nb),
            nt: n.div_ceil(nb),
            dist,
            ctx,
            nodes: Mutex::new(HashMap::new()),
            views: Mutex::new(HashMap::new()),
            next_view: AtomicU64::new(0),
            has_scratch: AtomicBool::new(false),
        }
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<(usize, usize), TileNode<T>>> {
        self.nodes.lock().unwrap_or_else(|p| p.into_inner())
    }

    // Lock order: `views` before `nodes`.
    fn views(&self) -> MutexGuard<'_, HashMap<u64, TileSpan>> {
        self.views.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a new view over `span` and return its id.
    pub(crate) fn attach(&self, span: TileSpan) -> u64 {
        let id = self.next_view.fetch_add(1, Ordering::Relaxed);
        self.reattach(id, span);
        id
    }

    /// Register view `id` again if it was retired.
    pub(crate) fn reattach(&self, id: u64, span: TileSpan) {
        let mut views = self.views();
        if views.contains_key(&id) {
            return;
        }
        self.adjust_scratch_life(&span, 1);
        views.insert(id, span);
    }

    /// Unregister view `id`, dropping its hold on the scratch origins it
    /// covers. Retiring an unregistered view does nothing.
    pub(crate) fn retire(&self, id: u64) {
        let mut views = self.views();
        if let Some(span) = views.remove(&id) {
            self.adjust_scratch_life(&span, -1);
        }
    }

    /// Add `delta` to the life of every scratch origin in `span`, freeing
    /// those that reach zero. Called with the `views` lock held.
    fn adjust_scratch_life(&self, span: &TileSpan, delta: i64) {
        if !self.has_scratch.load(Ordering::Acquire) {
            return;
        }
        let mut nodes = self.nodes();
        let mut emptied = Vec::new();
        for (&(i, j), node) in nodes.iter_mut() {
            if !span.covers(i, j) {
                continue;
            }
            let Some(origin) = node.origin else {
                continue;
            };
            let Some(inst) = node.instances.get_mut(&origin) else {
                continue;
            };
            if inst.kind != InstanceKind::Workspace {
                continue;
            }
            inst.life += delta;
            if inst.life <= 0 {
                node.instances.remove(&origin);
                node.origin = None;
                self.release(origin, self.bytes(i, j));
                log::trace!("scratch tile ({i}, {j}) freed from {origin:?}");
                if node.instances.is_empty() {
                    emptied.push((i, j));
                }
            }
        }
        for key in emptied {
            nodes.remove(&key);
        }
    }

    pub(crate) fn tile_mb(&self, i: usize) -> usize {
        self.nb.min(self.m - i * self.nb)
    }

    pub(crate) fn tile_nb(&self, j: usize) -> usize {
        self.nb.min(self.n - j * self.nb)
    }

    pub(crate) fn rank_of(&self, i: usize, j: usize) -> usize {
        self.dist.rank_of(i, j)
    }

    pub(crate) fn device_of(&self, i: usize, j: usize) -> usize {
        self.dist.device_of(i, j)
    }

    pub(crate) fn is_local(&self, i: usize, j: usize) -> bool {
        self.rank_of(i, j) == self.ctx.rank()
    }

    fn not_local(&self, i: usize, j: usize) -> TileError {
        TileError::NotLocal {
            i,
            j,
            rank: self.ctx.rank(),
        }
    }

    fn bytes(&self, i: usize, j: usize) -> usize {
        self.tile_mb(i) * self.tile_nb(j) * std::mem::size_of::<T>()
    }

    fn reserve(&self, residency: Residency, bytes: usize) -> Result<()> {
        if let Residency::Device(d) = residency {
            self.ctx.devices().get(d)?.reserve(bytes)?;
        }
        Ok(())
    }

    fn release(&self, residency: Residency, bytes: usize) {
        if let Residency::Device(d) = residency {
            if let Ok(device) = self.ctx.devices().get(d) {
                device.release(bytes);
            }
        }
    }

    /// Create the origin instance of `(i, j)` unless the tile already has one.
    pub(crate) fn insert_origin(
        &self,
        i: usize,
        j: usize,
        residency: Residency,
        kind: InstanceKind,
        block: Array2<T>,
    ) -> Result<()> {
        let views = self.views();
        let life = match kind {
            InstanceKind::Workspace => {
                views.values().filter(|span| span.covers(i, j)).count().max(1) as i64
            }
            _ => 1,
        };
        let mut nodes = self.nodes();
        let node = nodes.entry((i, j)).or_default();
        if node.origin.is_some() {
            return Ok(());
        }
        self.reserve(residency, self.bytes(i, j))?;
        if kind == InstanceKind::Workspace {
            self.has_scratch.store(true, Ordering::Release);
        }
        if let Some(old) = node.instances.remove(&residency) {
            if old.kind != InstanceKind::Origin {
                self.release(residency, self.bytes(i, j));
            }
        }
        node.origin = Some(residency);
        node.instances.insert(
            residency,
            TileInstance {
                data: new_data(block),
                kind,
                valid: true,
                life,
            },
        );
        Ok(())
    }

    /// The instance at `residency`, if present and valid. An invalid origin
    /// is refreshed first.
    pub(crate) fn find(&self, i: usize, j: usize, residency: Residency) -> Result<TileData<T>> {
        let mut nodes = self.nodes();
        let node = nodes.get_mut(&(i, j)).ok_or_else(|| self.not_local(i, j))?;
        if node.origin == Some(residency) {
            Self::refresh_origin(node);
        }
        match node.instances.get(&residency) {
            Some(inst) if inst.valid => Ok(inst.data.clone()),
            _ => Err(self.not_local(i, j)),
        }
    }

    /// Residency of the origin instance, if the tile has one on this rank.
    pub(crate) fn origin_of(&self, i: usize, j: usize) -> Option<Residency> {
        self.nodes().get(&(i, j)).and_then(|node| node.origin)
    }

    /// Whether any instance of `(i, j)` exists on this rank.
    pub(crate) fn has_tile(&self, i: usize, j: usize) -> bool {
        self.nodes().contains_key(&(i, j))
    }

    fn refresh_origin(node: &mut TileNode<T>) -> bool {
        let Some(origin) = node.origin else {
            return false;
        };
        let stale = node.instances.get(&origin).is_some_and(|inst| !inst.valid);
        if !stale {
            return false;
        }
        let Some((_, source)) = node.valid_source() else {
            return false;
        };
        if let Some(inst) = node.instances.get_mut(&origin) {
            write_block(&inst.data, &read_block(&source));
            inst.valid = true;
        }
        true
    }

    /// Make `(i, j)` writable at `residency`: bring a valid copy there and
    /// invalidate every other instance.
    pub(crate) fn acquire_write(
        &self,
        i: usize,
        j: usize,
        residency: Residency,
    ) -> Result<TileData<T>> {
        let mut nodes = self.nodes();
        let node = nodes.get_mut(&(i, j)).ok_or_else(|| self.not_local(i, j))?;
        if node.origin.is_none() {
            return Err(self.not_local(i, j));
        }
        let present = node.instances.get(&residency).map(|inst| inst.valid);
        let data = match present {
            Some(true) => node.instances[&residency].data.clone(),
            Some(false) => {
                let (_, source) = node.valid_source().ok_or_else(|| self.not_local(i, j))?;
                let inst = node
                    .instances
                    .get_mut(&residency)
                    .ok_or_else(|| self.not_local(i, j))?;
                write_block(&inst.data, &read_block(&source));
                inst.valid = true;
                inst.data.clone()
            }
            None => {
                let (_, source) = node.valid_source().ok_or_else(|| self.not_local(i, j))?;
                self.reserve(residency, self.bytes(i, j))?;
                let data = new_data(read_block(&source));
                node.instances.insert(
                    residency,
                    TileInstance {
                        data: data.clone(),
                        kind: InstanceKind::Workspace,
                        valid: true,
                        life: 1,
                    },
                );
                log::trace!("tile ({i}, {j}) moved to {residency:?}");
                data
            }
        };
        node.invalidate_others(residency);
        Ok(data)
    }

    /// Add a read-only copy at `residency` used `life` more times.
    pub(crate) fn copy_to(
        &self,
        i: usize,
        j: usize,
        residency: Residency,
        life: i64,
    ) -> Result<TileData<T>> {
        let mut nodes = self.nodes();
        let node = nodes.get_mut(&(i, j)).ok_or_else(|| self.not_local(i, j))?;
        if node.origin == Some(residency) {
            Self::refresh_origin(node);
        }
        if let Some(inst) = node.instances.get_mut(&residency) {
            if inst.kind == InstanceKind::Replica {
                inst.life += life;
            }
            if inst.valid {
                return Ok(inst.data.clone());
            }
        }
        let (_, source) = node.valid_source().ok_or_else(|| self.not_local(i, j))?;
        let block = read_block(&source);
        if let Some(inst) = node.instances.get_mut(&residency) {
            write_block(&inst.data, &block);
            inst.valid = true;
            return Ok(inst.data.clone());
        }
        self.reserve(residency, self.bytes(i, j))?;
        let data = new_data(block);
        node.instances.insert(
            residency,
            TileInstance {
                data: data.clone(),
                kind: InstanceKind::Replica,
                valid: true,
                life,
            },
        );
        log::trace!("tile ({i}, {j}) copied to {residency:?} with life {life}");
        Ok(data)
    }

    /// Store a received copy of a remote tile, or extend the life of the
    /// copy already held.
    pub(crate) fn insert_replica(
        &self,
        i: usize,
        j: usize,
        residency: Residency,
        block: Array2<T>,
        life: i64,
    ) -> Result<()> {
        let mut nodes = self.nodes();
        let node = nodes.entry((i, j)).or_default();
        if node.origin.is_some() {
            return Ok(());
        }
        match node.instances.get_mut(&residency) {
            Some(inst) => {
                write_block(&inst.data, &block);
                inst.valid = true;
                inst.life += life;
            }
            None => {
                self.reserve(residency, self.bytes(i, j))?;
                node.instances.insert(
                    residency,
                    TileInstance {
                        data: new_data(block),
                        kind: InstanceKind::Replica,
                        valid: true,
                        life,
                    },
                );
            }
        }
        Ok(())
    }

    /// Decrement the life of the replica at `residency`, evicting it at zero.
    pub(crate) fn tick_at(&self, i: usize, j: usize, residency: Residency) {
        let mut nodes = self.nodes();
        let Some(node) = nodes.get_mut(&(i, j)) else {
            return;
        };
        let evict = match node.instances.get_mut(&residency) {
            Some(inst) if inst.kind == InstanceKind::Replica => {
                inst.life -= 1;
                inst.life <= 0
            }
            _ => false,
        };
        if evict {
            node.instances.remove(&residency);
            self.release(residency, self.bytes(i, j));
            log::trace!("tile ({i}, {j}) evicted from {residency:?}");
            if node.instances.is_empty() {
                nodes.remove(&(i, j));
            }
        }
    }

    pub(crate) fn update_origin(&self, i: usize, j: usize) {
        if let Some(node) = self.nodes().get_mut(&(i, j)) {
            Self::refresh_origin(node);
        }
    }

    /// Decrement the copies of `(i, j)` (every instance but the origin),
    /// freeing those that reach zero. A stale origin is refreshed first.
    pub(crate) fn release_instances(&self, i: usize, j: usize) {
        let mut nodes = self.nodes();
        let Some(node) = nodes.get_mut(&(i, j)) else {
            return;
        };
        Self::refresh_origin(node);
        let origin = node.origin;
        let mut freed = Vec::new();
        for (res, inst) in node.instances.iter_mut() {
            if inst.kind == InstanceKind::Origin || origin == Some(*res) {
                continue;
            }
            inst.life -= 1;
            if inst.life <= 0 {
                freed.push(*res);
            }
        }
        for res in freed {
            node.instances.remove(&res);
            self.release(res, self.bytes(i, j));
        }
        if node.instances.is_empty() {
            nodes.remove(&(i, j));
        }
    }

    /// Non-origin instances held at `residency`.
    pub(crate) fn replica_count(&self, residency: Residency) -> usize {
        self.nodes()
            .values()
            .filter(|node| {
                node.instances.contains_key(&residency) && node.origin != Some(residency)
            })
            .count()
    }
}

impl<T: Scalar> Drop for MatrixStorage<T> {
    fn drop(&mut self) {
        let nodes = std::mem::take(&mut *self.nodes());
        for ((i, j), node) in nodes {
            for res in node.instances.keys() {
                self.release(*res, self.bytes(i, j));
            }
        }
    }
}
