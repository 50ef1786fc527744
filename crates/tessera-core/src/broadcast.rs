//! Tile broadcast engine.
//!
//! [`list_bcast`] replicates source tiles to every rank that owns a tile of
//! the entry's destination views. Each entry is sent down a binomial tree
//! rooted at the tile's owner, so no rank sends more than `⌈log2 P⌉`
//! messages per entry. Contiguous entries that share a tag, a root and a
//! participant set travel in a single message.
//!
//! Every rank walks the list in the same order. Sends never block, so a
//! rank waiting on its parent always makes progress once the parent reaches
//! the same entry.

use std::collections::BTreeMap;

use ndarray::Array2;
use tessera_compute::{MessageKey, Target};

use crate::error::Result;
use crate::matrix::Matrix;
use crate::scalar::Scalar;
use crate::types::Residency;

/// One tile to replicate and the views that will consume it.
#[derive(Clone, Debug)]
pub struct BcastEntry<T: Scalar> {
    pub i: usize,
    pub j: usize,
    pub destinations: Vec<Matrix<T>>,
    pub tag: i64,
}

impl<T: Scalar> BcastEntry<T> {
    pub fn new(i: usize, j: usize, destinations: Vec<Matrix<T>>) -> Self {
        Self {
            i,
            j,
            destinations,
            tag: 0,
        }
    }

    pub fn with_tag(mut self, tag: i64) -> Self {
        self.tag = tag;
        self
    }
}

/// Per-entry routing computed identically on every rank.
struct Route {
    root: usize,
    /// Root first, then the other participants in rank order.
    participants: Vec<usize>,
    /// Local destination tiles per residency on this rank.
    local_uses: BTreeMap<Residency, i64>,
}

impl Route {
    fn new<T: Scalar>(a: &Matrix<T>, entry: &BcastEntry<T>, target: Target) -> Self {
        let root = a.tile_rank(entry.i, entry.j);
        let me = a.context().rank();
        let mut owners = vec![false; a.context().size()];
        let mut local_uses = BTreeMap::new();
        for dest in &entry.destinations {
            for j in 0..dest.nt() {
                for i in 0..dest.mt() {
                    let owner = dest.tile_rank(i, j);
                    if let Some(slot) = owners.get_mut(owner) {
                        *slot = true;
                    }
                    if owner == me {
                        let residency = dest.target_residency(i, j, target);
                        *local_uses.entry(residency).or_insert(0) += 1;
                    }
                }
            }
        }
        let mut participants = vec![root];
        participants.extend(
            owners
                .iter()
                .enumerate()
                .filter(|&(r, &owns)| owns && r != root)
                .map(|(r, _)| r),
        );
        Self {
            root,
            participants,
            local_uses,
        }
    }

    fn host_uses(&self) -> i64 {
        self.local_uses.values().sum()
    }
}

/// Binomial tree over `size` participants: the parent of relative rank
/// `rel` and its children, in sending order.
fn binomial_tree(rel: usize, size: usize) -> (Option<usize>, Vec<usize>) {
    let mut parent = None;
    let mut mask = 1;
    while mask < size {
        if rel & mask != 0 {
            parent = Some(rel - mask);
            break;
        }
        mask <<= 1;
    }
    let mut children = Vec::new();
    mask >>= 1;
    while mask > 0 {
        if rel + mask < size {
            children.push(rel + mask);
        }
        mask >>= 1;
    }
    (parent, children)
}

/// Replicate the source tiles of `entries` to the owners of their
/// destination tiles. Collective over the ranks named by the entries.
///
/// Receivers hold a replica whose life equals their number of local
/// destination tiles. With the accelerator target, each tile is also copied
/// to the device of every local destination tile, with that device's count
/// as its life.
pub fn list_bcast<T: Scalar>(a: &Matrix<T>, entries: &[BcastEntry<T>], target: Target) -> Result<()> {
    let comm = a.context().comm();
    let me = comm.rank();
    let routes: Vec<Route> = entries.iter().map(|e| Route::new(a, e, target)).collect();

    let mut start = 0;
    while start < entries.len() {
        let mut end = start + 1;
        while end < entries.len()
            && entries[end].tag == entries[start].tag
            && routes[end].root == routes[start].root
            && routes[end].participants == routes[start].participants
        {
            end += 1;
        }
        bcast_batch(a, &entries[start..end], &routes[start..end], target, me)?;
        start = end;
    }
    Ok(())
}

fn bcast_batch<T: Scalar>(
    a: &Matrix<T>,
    entries: &[BcastEntry<T>],
    routes: &[Route],
    target: Target,
    me: usize,
) -> Result<()> {
    let comm = a.context().comm();
    let route = &routes[0];
    let Some(rel) = route.participants.iter().position(|&r| r == me) else {
        return Ok(());
    };
    let (pi, pj) = a.phys(entries[0].i, entries[0].j);
    let key = MessageKey::new(a.uid(), pi, pj, entries[0].tag);
    let (parent, children) = binomial_tree(rel, route.participants.len());

    let blocks: Vec<Array2<T>> = match parent {
        None => entries
            .iter()
            .map(|e| a.tile(e.i, e.j).map(|t| t.to_stored()))
            .collect::<Result<_>>()?,
        Some(p) => {
            let blocks: Vec<Array2<T>> = comm.recv(route.participants[p], key)?;
            for ((e, r), block) in entries.iter().zip(routes).zip(&blocks) {
                a.insert_replica(e.i, e.j, Residency::Host, block.clone(), r.host_uses())?;
            }
            blocks
        }
    };
    if !children.is_empty() {
        log::trace!(
            "bcast tile ({}, {}) x{} tag {}: rank {} -> {:?}",
            entries[0].i,
            entries[0].j,
            entries.len(),
            entries[0].tag,
            me,
            children.iter().map(|&c| route.participants[c]).collect::<Vec<_>>()
        );
    }
    for &child in &children {
        comm.send(route.participants[child], key, blocks.clone())?;
    }

    if target == Target::Devices {
        for (e, r) in entries.iter().zip(routes) {
            for (&residency, &uses) in &r.local_uses {
                if residency != Residency::Host {
                    a.copy_tile_to(e.i, e.j, residency, uses)?;
                }
            }
        }
    }
    Ok(())
}

/// Broadcast tile `(i, j)` of `a` to the owners of `destination`.
pub fn tile_bcast<T: Scalar>(
    a: &Matrix<T>,
    i: usize,
    j: usize,
    destination: &Matrix<T>,
    target: Target,
) -> Result<()> {
    list_bcast(a, &[BcastEntry::new(i, j, vec![destination.clone()])], target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binomial_tree_covers_every_rank_once() {
        for size in 1..=9 {
            let mut received = vec![0; size];
            received[0] = 1;
            for rel in 0..size {
                let (parent, children) = binomial_tree(rel, size);
                assert_eq!(parent.is_none(), rel == 0);
                assert!(children.len() <= (usize::BITS - size.leading_zeros()) as usize);
                for c in children {
                    assert_eq!(binomial_tree(c, size).0, Some(rel));
                    received[c] += 1;
                }
            }
            assert!(received.iter().all(|&n| n == 1), "size {size}");
        }
    }
}
