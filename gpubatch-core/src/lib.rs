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

//! Adaptive batch execution on a memory-constrained accelerator.
//!
//! A caller-supplied kernel runs over variable-length elements in chunks sized from
//! the device's free memory. Allocation failures are recovered by bisecting the
//! failing chunk and shrinking later ones, without losing completed results.
//! Inputs may be a slice or a one-shot iterator.

#[macro_use]
mod profiling;

pub mod assembler;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod estimator;
pub mod executor;
pub mod input;
pub mod stats;
pub mod stream;
pub mod types;

pub use assembler::{ChunkRange, ResultBuffer};
pub use config::{BatchOptions, CancelToken};
pub use controller::AdaptiveBatchController;
pub use device::{DeviceBackend, DeviceHandle, MemoryInfo, SimulatedDevice};
#[cfg(feature = "cuda")]
pub use device::CudaMemoryOracle;
pub use error::{BatchError, ExecutionError, Result};
pub use estimator::{CostModel, LinearCostModel, SizeEstimator, estimate_batch_size};
pub use executor::{BatchKernel, Chunk, ChunkExecutor};
pub use input::BatchInput;
pub use stats::RunStats;
pub use stream::StreamController;
pub use types::Scalar;

use crate::executor::JobGuard;

/// Results of one job plus what it took to get them.
#[derive(Clone, Debug)]
pub struct BatchOutput<T> {
    pub values: Vec<T>,
    pub stats: RunStats,
}

/// Main entry point: a device plus validated options.
#[derive(Clone, Debug)]
pub struct BatchEngine {
    device: DeviceHandle,
    options: BatchOptions,
}

impl BatchEngine {
    pub fn new(device: DeviceHandle, options: BatchOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { device, options })
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Run `kernel` over `inputs` with the linear cost model of `T`-wide values.
    pub fn run<E, T, I, K>(
        &self,
        kernel: &mut K,
        inputs: BatchInput<'_, E, I>,
        targets: &[T],
    ) -> Result<BatchOutput<T>>
    where
        E: AsRef<[T]>,
        T: Scalar,
        I: Iterator<Item = E>,
        K: BatchKernel<E, T> + ?Sized,
    {
        let cost = LinearCostModel::for_scalar::<T>(self.options.per_sample_multiplier);
        self.run_with_cost(kernel, inputs, targets, &cost)
    }

    /// Run with a caller-supplied per-element cost model.
    ///
    /// Materialized input is fully validated before the device is touched. Streamed
    /// input has its targets validated up front and its elements as they arrive.
    pub fn run_with_cost<E, T, I, K>(
        &self,
        kernel: &mut K,
        inputs: BatchInput<'_, E, I>,
        targets: &[T],
        cost: &dyn CostModel,
    ) -> Result<BatchOutput<T>>
    where
        E: AsRef<[T]>,
        T: Scalar,
        I: Iterator<Item = E>,
        K: BatchKernel<E, T> + ?Sized,
    {
        profile_scope!("Engine::Run");
        let guard = JobGuard::new(&self.options);
        let mut stats = RunStats::default();
        let total = targets.len();

        let buffer = match inputs {
            BatchInput::Materialized(elements) => {
                input::validate_materialized(elements, targets, self.options.max_element_len)?;
                let initial = match self.options.explicit_batch_size(total) {
                    Some(size) => size,
                    None => {
                        let lengths: Vec<usize> =
                            elements.iter().map(|e| e.as_ref().len()).collect();
                        SizeEstimator::from_options(&self.options)
                            .estimate(&self.device, &lengths, total, cost)?
                            .batch_size
                    }
                };
                AdaptiveBatchController::with_guard(&self.device, &self.options, guard)
                    .run(kernel, elements, targets, initial, &mut stats)?
            }
            BatchInput::Streamed(source) => {
                input::validate_targets(targets)?;
                StreamController::with_guard(&self.device, &self.options, guard).run(
                    kernel,
                    source,
                    targets,
                    self.options.explicit_batch_size(total),
                    cost,
                    &mut stats,
                )?
            }
        };

        let values = buffer.into_values()?;
        log::debug!("{}: {} job done, {}", self.device.name(), T::TYPE_NAME, stats);
        Ok(BatchOutput { values, stats })
    }
}

/// One-shot form of [`BatchEngine::run`].
pub fn process_in_batches<E, T, I, K>(
    device: &DeviceHandle,
    kernel: &mut K,
    inputs: BatchInput<'_, E, I>,
    targets: &[T],
    options: &BatchOptions,
) -> Result<Vec<T>>
where
    E: AsRef<[T]>,
    T: Scalar,
    I: Iterator<Item = E>,
    K: BatchKernel<E, T> + ?Sized,
{
    BatchEngine::new(device.clone(), options.clone())?
        .run(kernel, inputs, targets)
        .map(|output| output.values)
}
