//! Helpers shared by the integration tests.

#![allow(dead_code)]

use ndarray::Array2;
use tessera_core::{Communicator, Context, DeviceSet};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic uniform numbers in `[-1, 1)`.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    pub fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((self.0 >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
    }
}

pub fn random(m: usize, n: usize, seed: u64) -> Array2<f64> {
    let mut rng = Lcg::new(seed);
    Array2::from_shape_fn((m, n), |_| rng.next_f64())
}

/// Well conditioned symmetric positive definite matrix.
pub fn spd(n: usize, seed: u64) -> Array2<f64> {
    let r = random(n, n, seed);
    let mut a = r.dot(&r.t());
    for i in 0..n {
        a[[i, i]] += n as f64;
    }
    a
}

pub fn col_major(dense: &Array2<f64>) -> Vec<f64> {
    dense.t().iter().copied().collect()
}

/// Context with `devices` simulated accelerators of 64 MiB each.
pub fn context(comm: Communicator, devices: usize) -> Context {
    let devices = if devices == 0 {
        DeviceSet::empty()
    } else {
        DeviceSet::new(devices, 64 << 20).expect("device set")
    };
    Context::new(comm, devices)
}

pub fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    assert_eq!(a.dim(), b.dim());
    a.iter().zip(b.iter()).fold(0.0, |m, (x, y)| m.max((x - y).abs()))
}
