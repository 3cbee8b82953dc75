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

// Cooperative cancellation, deadlines and real allocator pressure.

mod common;

use std::cell::Cell;
use std::time::Duration;

use common::{KernelResult, score_all, sim_device, targets, uniform_vectors};
use gpubatch_core::{
    BatchEngine, BatchError, BatchInput, BatchOptions, CancelToken, LinearCostModel,
};

#[test]
fn cancel_stops_at_next_attempt() {
    let (_sim, device) = sim_device(1 << 30);
    let inputs = uniform_vectors(50, 4);
    let targets = targets(50);
    let token = CancelToken::new();
    let calls = Cell::new(0usize);
    let mut kernel = |x: &[Vec<f64>], t: &[f64]| -> KernelResult {
        calls.set(calls.get() + 1);
        if calls.get() == 2 {
            token.cancel();
        }
        Ok(score_all(x, t))
    };
    let options = BatchOptions::default()
        .with_batch_size(10)
        .with_cancel_token(token.clone());
    let result = BatchEngine::new(device, options)
        .unwrap()
        .run(&mut kernel, BatchInput::materialized(&inputs), &targets);
    assert!(matches!(result, Err(BatchError::Cancelled)));
    assert_eq!(calls.get(), 2);
}

#[test]
fn deadline_is_checked_between_chunks() {
    let (_sim, device) = sim_device(1 << 30);
    let inputs = uniform_vectors(20, 4);
    let targets = targets(20);
    let calls = Cell::new(0usize);
    let mut kernel = |x: &[Vec<f64>], t: &[f64]| -> KernelResult {
        calls.set(calls.get() + 1);
        std::thread::sleep(Duration::from_millis(60));
        Ok(score_all(x, t))
    };
    let options = BatchOptions::default()
        .with_batch_size(5)
        .with_sample_size(5)
        .with_deadline(Duration::from_millis(30));
    let result = BatchEngine::new(device, options)
        .unwrap()
        .run(&mut kernel, BatchInput::streamed(inputs), &targets);
    match result {
        Err(BatchError::DeadlineExceeded { elapsed }) => {
            assert!(elapsed >= Duration::from_millis(30));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(calls.get(), 1);
}

#[test]
fn estimated_chunks_fit_the_allocator() {
    common::init_logging();
    // 64 KiB device; each element is 16 f64 values (128 B on device).
    let (sim, device) = sim_device(64 * 1024);
    let inputs = uniform_vectors(1000, 16);
    let targets = targets(1000);
    let mut kernel = |x: &[Vec<f64>], t: &[f64]| -> KernelResult {
        let bytes: u64 = x.iter().map(|v| (v.len() * 8) as u64).sum();
        let _block = sim.allocate(bytes)?;
        Ok(score_all(x, t))
    };
    let output = BatchEngine::new(device, BatchOptions::default())
        .unwrap()
        .run(&mut kernel, BatchInput::materialized(&inputs), &targets)
        .unwrap();

    assert_eq!(output.values, score_all(&inputs, &targets));
    // floor(0.8 * 65536 / 128) = 409
    assert_eq!(output.stats.initial_batch_size, 409);
    assert_eq!(output.stats.chunks, 3);
    assert!(!output.stats.had_oom());
    assert_eq!(sim.failed_allocations(), 0);
    assert!(sim.peak_allocated_bytes() <= 409 * 128);
}

#[test]
fn underestimated_cost_is_recovered_by_bisection() {
    let (sim, device) = sim_device(64 * 1024);
    let inputs = uniform_vectors(1000, 16);
    let targets = targets(1000);
    let mut kernel = |x: &[Vec<f64>], t: &[f64]| -> KernelResult {
        let bytes: u64 = x.iter().map(|v| (v.len() * 8) as u64).sum();
        let _block = sim.allocate(bytes)?;
        Ok(score_all(x, t))
    };
    // Plans 2 B per value while the kernel really allocates 8.
    let cost = LinearCostModel::new(1, 2);
    let output = BatchEngine::new(device, BatchOptions::default())
        .unwrap()
        .run_with_cost(&mut kernel, BatchInput::materialized(&inputs), &targets, &cost)
        .unwrap();

    assert_eq!(output.values, score_all(&inputs, &targets));
    assert_eq!(output.stats.initial_batch_size, 1000);
    assert!(output.stats.had_oom());
    assert_eq!(sim.failed_allocations(), 1);
    assert_eq!(output.stats.final_batch_size, 500);
}

#[test]
fn f32_workloads_use_their_width() {
    let (sim, device) = sim_device(64 * 1024);
    let inputs: Vec<Vec<f32>> = (0..1000).map(|i| vec![i as f32; 16]).collect();
    let targets = vec![0.5f32; 1000];
    let mut kernel = |x: &[Vec<f32>], t: &[f32]| -> Result<Vec<f32>, gpubatch_core::ExecutionError> {
        let bytes: u64 = x.iter().map(|v| (v.len() * 4) as u64).sum();
        let _block = sim.allocate(bytes)?;
        Ok(x.iter().zip(t).map(|(v, &w)| v[0] * w).collect())
    };
    let output = BatchEngine::new(device, BatchOptions::default())
        .unwrap()
        .run(&mut kernel, BatchInput::materialized(&inputs), &targets)
        .unwrap();
    // floor(0.8 * 65536 / 64) = 819
    assert_eq!(output.stats.initial_batch_size, 819);
    assert_eq!(output.values[999], 499.5);
}
