//! Ownership, views and the tile lifecycle of distributed matrices.

mod common;

use std::collections::HashMap;

use ndarray::Array2;
use tessera_compute::run_spmd;
use tessera_core::{tile_blas, Matrix, Residency, Target, Uplo};

use common::{col_major, context, init_logging, random};

// ─────────────────────────────────────────────────────────────
// Ownership
// ─────────────────────────────────────────────────────────────

#[test]
fn test_every_tile_has_exactly_one_owner() {
    init_logging();
    let (m, n, nb) = (7, 9, 2);
    let per_rank = run_spmd(4, |comm| {
        let ctx = context(comm, 0);
        let a = Matrix::<f64>::new(m, n, nb, 2, 2, &ctx).unwrap();
        let local = a.local_tiles();
        for &(i, j) in &local {
            assert_eq!(a.tile_rank(i, j), ctx.rank());
        }
        (ctx.rank(), local)
    });

    let mut owners: HashMap<(usize, usize), usize> = HashMap::new();
    for (rank, tiles) in per_rank {
        for tile in tiles {
            assert!(owners.insert(tile, rank).is_none(), "tile {tile:?} owned twice");
        }
    }
    assert_eq!(owners.len(), 4 * 5);
    // 2D block-cyclic over a column-major 2x2 grid.
    assert_eq!(owners[&(0, 0)], 0);
    assert_eq!(owners[&(1, 0)], 1);
    assert_eq!(owners[&(0, 1)], 2);
    assert_eq!(owners[&(3, 3)], 3);
}

#[test]
fn test_grid_must_match_communicator() {
    let results = run_spmd(2, |comm| {
        let ctx = context(comm, 0);
        Matrix::<f64>::new(4, 4, 2, 2, 2, &ctx).is_err()
    });
    assert!(results.into_iter().all(|failed| failed));
}

// ─────────────────────────────────────────────────────────────
// Views
// ─────────────────────────────────────────────────────────────

#[test]
fn test_sub_view_shares_storage() {
    let ctx = context(tessera_core::Communicator::single(), 0);
    let dense = random(6, 6, 3);
    let a = Matrix::from_col_major(6, 6, &col_major(&dense), 6, 2, 1, 1, &ctx).unwrap();
    let s = a.sub(1..3, 0..2).unwrap();
    assert_eq!((s.mt(), s.nt()), (2, 2));
    assert!(s.same_storage(&a));

    tile_blas::set(5.0, 5.0, &s.tile_for_write(0, 1, Residency::Host).unwrap());
    let after = a.to_dense().unwrap();
    for r in 2..4 {
        for c in 2..4 {
            assert_eq!(after[[r, c]], 5.0);
        }
    }
    assert_eq!(after[[0, 0]], dense[[0, 0]]);
}

#[test]
fn test_transposed_views_read_the_same_entries() {
    let ctx = context(tessera_core::Communicator::single(), 0);
    let dense = random(5, 3, 11);
    let a = Matrix::from_col_major(5, 3, &col_major(&dense), 5, 2, 1, 1, &ctx).unwrap();
    let at = a.transpose().unwrap();
    assert_eq!((at.m(), at.n()), (3, 5));
    assert_eq!(at.to_dense().unwrap(), dense.t().to_owned());
    assert_eq!(at.transpose().unwrap().to_dense().unwrap(), dense);

    // A tile of the transposed view is the transposed block.
    let block = at.tile(0, 2).unwrap().to_logical();
    assert_eq!(block.dim(), (2, 1));
    assert_eq!(block[[1, 0]], dense[[4, 1]]);
}

#[test]
fn test_structured_views_report_their_triangle() {
    let ctx = context(tessera_core::Communicator::single(), 0);
    let a = Matrix::<f64>::new(6, 6, 2, 1, 1, &ctx).unwrap();
    let lower = a.hermitian(Uplo::Lower).unwrap();
    assert_eq!(lower.uplo(), Uplo::Lower);
    assert_eq!(lower.conj_transpose().unwrap().uplo(), Uplo::Upper);
    assert_eq!(lower.sub(1..2, 1..2).unwrap().uplo(), Uplo::Lower);
    assert_eq!(lower.sub(1..3, 0..1).unwrap().uplo(), Uplo::General);
}

// ─────────────────────────────────────────────────────────────
// Ingestion and export
// ─────────────────────────────────────────────────────────────

#[test]
fn test_block_cyclic_round_trip() {
    init_logging();
    let (m, n, nb, p, q) = (9, 7, 2, 2, 2);
    let dense = random(m, n, 21);
    let dense = &dense;
    run_spmd(p * q, move |comm| {
        let ctx = context(comm, 0);
        let (myrow, mycol) = (ctx.rank() % p, ctx.rank() / p);
        let rows: Vec<usize> = (0..m).filter(|r| (r / nb) % p == myrow).collect();
        let cols: Vec<usize> = (0..n).filter(|c| (c / nb) % q == mycol).collect();
        let lld = rows.len().max(1);
        let mut local = vec![0.0; lld * cols.len()];
        for (lc, &c) in cols.iter().enumerate() {
            for (lr, &r) in rows.iter().enumerate() {
                local[lr + lc * lld] = dense[[r, c]];
            }
        }

        let a = Matrix::from_block_cyclic(m, n, &local, lld, nb, p, q, &ctx).unwrap();
        assert_eq!(&a.to_dense().unwrap(), dense);

        let mut out = vec![0.0; local.len()];
        a.copy_to_block_cyclic(&mut out, lld, p, q).unwrap();
        assert_eq!(out, local);
    });
}

#[test]
fn test_short_buffer_is_rejected() {
    let ctx = context(tessera_core::Communicator::single(), 0);
    let data = vec![0.0; 10];
    assert!(Matrix::from_col_major(4, 4, &data, 4, 2, 1, 1, &ctx).is_err());
    assert!(Matrix::from_col_major(4, 2, &data, 3, 2, 1, 1, &ctx).is_err());
}

// ─────────────────────────────────────────────────────────────
// Tile lifecycle
// ─────────────────────────────────────────────────────────────

#[test]
fn test_release_workspace_frees_device_memory() {
    let ctx = context(tessera_core::Communicator::single(), 2);
    let w = Matrix::<f64>::new(8, 8, 4, 1, 1, &ctx).unwrap();
    w.insert_workspace_tiles(Target::Devices).unwrap();
    let used: usize = ctx.devices().iter().map(|d| d.used()).sum();
    assert_eq!(used, 4 * 4 * 4 * std::mem::size_of::<f64>());
    assert!(w.has_tile(1, 1));

    w.release_workspace();
    assert!(!w.has_tile(1, 1));
    assert!(ctx.devices().iter().all(|d| d.used() == 0));
}

#[test]
fn test_workspace_outlives_release_through_one_view() {
    let ctx = context(tessera_core::Communicator::single(), 1);
    let device = ctx.devices().get(0).unwrap().clone();
    let tile_bytes = 4 * 4 * std::mem::size_of::<f64>();
    let a = Matrix::<f64>::new(8, 8, 4, 1, 1, &ctx).unwrap();
    a.insert_workspace_tiles(Target::Devices).unwrap();
    assert_eq!(device.used(), 4 * tile_bytes);

    // A sub-view gives up its hold; the parent still covers the tile.
    a.sub(0..1, 0..1).unwrap().release_workspace();
    assert!(a.has_tile(0, 0));
    assert!(a.tile_at(0, 0, Residency::Device(0)).is_ok());
    assert_eq!(device.used(), 4 * tile_bytes);

    // Releasing the parent frees only the tiles no other view covers.
    let row = a.sub(1..2, 0..2).unwrap();
    a.release_workspace();
    assert!(!a.has_tile(0, 0));
    assert!(!a.has_tile(0, 1));
    assert!(row.has_tile(0, 0));
    assert!(row.has_tile(0, 1));
    assert_eq!(device.used(), 2 * tile_bytes);

    drop(row);
    assert_eq!(device.used(), 0);
}

#[test]
fn test_device_copy_is_evicted_after_its_uses() {
    let ctx = context(tessera_core::Communicator::single(), 1);
    let dense = Array2::from_shape_fn((4, 4), |(i, j)| (i * 4 + j) as f64);
    let a = Matrix::from_col_major(4, 4, &col_major(&dense), 4, 2, 1, 1, &ctx).unwrap();
    let dev = Residency::Device(0);

    let copy = a.copy_tile_to(1, 0, dev, 2).unwrap();
    assert_eq!(copy.to_logical(), a.tile(1, 0).unwrap().to_logical());
    assert_eq!(a.replica_count(dev), 1);
    a.tick_at(1, 0, dev);
    assert_eq!(a.replica_count(dev), 1);
    a.tick_at(1, 0, dev);
    assert_eq!(a.replica_count(dev), 0);
    assert_eq!(ctx.devices().get(0).unwrap().used(), 0);
}

#[test]
fn test_write_on_device_updates_origin() {
    let ctx = context(tessera_core::Communicator::single(), 1);
    let a = Matrix::<f64>::new(4, 4, 2, 1, 1, &ctx).unwrap();
    a.insert_local_tiles(Target::HostTask).unwrap();
    let dev = Residency::Device(0);

    let t = a.tile_for_write(0, 1, dev).unwrap();
    tile_blas::set(3.0, 3.0, &t);
    assert_eq!(t.residency(), dev);
    // The host origin is refreshed from the device copy on access.
    a.update_all_origin();
    assert_eq!(a.tile(0, 1).unwrap().to_logical(), Array2::from_elem((2, 2), 3.0));
}
