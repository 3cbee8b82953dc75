//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use gpubatch_core::{DeviceHandle, ExecutionError, SimulatedDevice};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const MIB: u64 = 1024 * 1024;

pub type KernelResult = Result<Vec<f64>, ExecutionError>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Simulated device the test keeps a handle on for counters.
pub fn sim_device(total_bytes: u64) -> (Arc<SimulatedDevice>, DeviceHandle) {
    let sim = Arc::new(SimulatedDevice::new(total_bytes));
    let handle = DeviceHandle::from_arc(sim.clone());
    (sim, handle)
}

/// `count` vectors of `len` values; element `i` is filled with `i`.
pub fn uniform_vectors(count: usize, len: usize) -> Vec<Vec<f64>> {
    (0..count).map(|i| vec![i as f64; len]).collect()
}

/// Reproducible vectors with lengths in `[1, max_len]`.
pub fn ragged_vectors(count: usize, max_len: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let len = rng.gen_range(1..=max_len);
            (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
        })
        .collect()
}

pub fn targets(count: usize) -> Vec<f64> {
    (0..count).map(|i| 1.0 + (i % 7) as f64).collect()
}

/// Per-element result every test kernel computes.
pub fn score(element: &[f64], target: f64) -> f64 {
    element.iter().sum::<f64>() * target + element.len() as f64
}

pub fn score_all(inputs: &[Vec<f64>], targets: &[f64]) -> Vec<f64> {
    inputs
        .iter()
        .zip(targets)
        .map(|(x, &t)| score(x, t))
        .collect()
}
