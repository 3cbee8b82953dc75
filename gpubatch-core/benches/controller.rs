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

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use gpubatch_core::{
    BatchEngine, BatchInput, BatchOptions, DeviceHandle, ExecutionError, SimulatedDevice,
};

fn workload(count: usize, len: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
    let inputs = (0..count).map(|i| vec![i as f64; len]).collect();
    let targets = (0..count).map(|i| 1.0 + (i % 5) as f64).collect();
    (inputs, targets)
}

fn dot(inputs: &[Vec<f64>], targets: &[f64]) -> Vec<f64> {
    inputs
        .iter()
        .zip(targets)
        .map(|(x, t)| x.iter().sum::<f64>() * t)
        .collect()
}

fn bench_materialized(c: &mut Criterion) {
    let mut group = c.benchmark_group("controller_materialized");
    let (inputs, targets) = workload(10_000, 32);
    let device = DeviceHandle::new(SimulatedDevice::new(1 << 30));
    for batch_size in [64usize, 1024, 10_000] {
        let engine =
            BatchEngine::new(device.clone(), BatchOptions::default().with_batch_size(batch_size))
                .expect("valid options");
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, _| {
            b.iter(|| {
                let mut kernel = |x: &[Vec<f64>], t: &[f64]| Ok::<_, ExecutionError>(dot(x, t));
                engine
                    .run(&mut kernel, BatchInput::materialized(black_box(&inputs)), &targets)
                    .expect("run failed")
            });
        });
    }
    group.finish();
}

fn bench_oom_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("controller_oom_recovery");
    let (inputs, targets) = workload(10_000, 32);
    let device = DeviceHandle::new(SimulatedDevice::new(1 << 30));
    for limit in [16usize, 256] {
        let engine = BatchEngine::new(device.clone(), BatchOptions::default().with_batch_size(4096))
            .expect("valid options");
        group.bench_with_input(BenchmarkId::new("limit", limit), &limit, |b, &limit| {
            b.iter(|| {
                let mut kernel = |x: &[Vec<f64>], t: &[f64]| {
                    if x.len() > limit {
                        Err(ExecutionError::OutOfMemory)
                    } else {
                        Ok(dot(x, t))
                    }
                };
                engine
                    .run(&mut kernel, BatchInput::materialized(black_box(&inputs)), &targets)
                    .expect("run failed")
            });
        });
    }
    group.finish();
}

fn bench_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("controller_stream");
    let (inputs, targets) = workload(10_000, 32);
    let device = DeviceHandle::new(SimulatedDevice::new(1 << 30));
    let engine = BatchEngine::new(device, BatchOptions::default().with_batch_size(512))
        .expect("valid options");
    group.bench_function("batch_512", |b| {
        b.iter(|| {
            let mut kernel = |x: &[Vec<f64>], t: &[f64]| Ok::<_, ExecutionError>(dot(x, t));
            engine
                .run(&mut kernel, BatchInput::streamed(inputs.iter().cloned()), &targets)
                .expect("run failed")
        });
    });
    group.finish();
}

criterion_group!(benches, bench_materialized, bench_oom_recovery, bench_stream);
criterion_main!(benches);
