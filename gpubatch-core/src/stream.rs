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

//! Stream controller: the adaptive policy over a one-shot iterator.
//!
//! Only a prefix sample of `sample_size` elements is used for estimation. After that
//! the controller tops up a chunk buffer to the current batch size, runs it, and
//! drops what was committed, so at most `max(sample_size, batch_size)` elements are
//! held at once. The iterator is pulled strictly in order and never rewound.

use std::iter::Fuse;

use crate::assembler::ResultBuffer;
use crate::config::BatchOptions;
use crate::controller::{AdaptiveBatchController, SizePolicy};
use crate::device::DeviceHandle;
use crate::error::{BatchError, Result};
use crate::estimator::{CostModel, SizeEstimator};
use crate::executor::{BatchKernel, Chunk, JobGuard};
use crate::input::check_element_len;
use crate::stats::RunStats;
use crate::types::Scalar;

/// Chunks between advisory progress records.
const PROGRESS_INTERVAL: usize = 10;

pub struct StreamController<'d> {
    controller: AdaptiveBatchController<'d>,
    estimator: SizeEstimator,
    growth_factor: f64,
    sample_size: usize,
    max_element_len: Option<usize>,
}

struct Puller<I: Iterator> {
    source: Fuse<I>,
    pulled: usize,
    total: usize,
    max_element_len: Option<usize>,
}

impl<I: Iterator> Puller<I> {
    /// Append up to `want` elements to `pending`; false once the source is dry.
    fn pull<T>(&mut self, pending: &mut Vec<I::Item>, want: usize) -> Result<bool>
    where
        I::Item: AsRef<[T]>,
    {
        for _ in 0..want {
            let Some(element) = self.source.next() else {
                return Ok(false);
            };
            if self.pulled >= self.total {
                return Err(self.overflow());
            }
            check_element_len(self.pulled, element.as_ref().len(), self.max_element_len)?;
            pending.push(element);
            self.pulled += 1;
        }
        Ok(true)
    }

    fn overflow(&self) -> BatchError {
        BatchError::InvalidInput(format!(
            "stream yielded more elements than the {} targets",
            self.total
        ))
    }

    fn short(&self) -> BatchError {
        BatchError::InvalidInput(format!(
            "stream ended after {} elements but {} targets were given",
            self.pulled, self.total
        ))
    }
}

impl<'d> StreamController<'d> {
    pub fn new(device: &'d DeviceHandle, options: &BatchOptions) -> Self {
        Self::with_guard(device, options, JobGuard::new(options))
    }

    pub(crate) fn with_guard(device: &'d DeviceHandle, options: &BatchOptions, guard: JobGuard) -> Self {
        Self {
            controller: AdaptiveBatchController::with_guard(device, options, guard),
            estimator: SizeEstimator::from_options(options),
            growth_factor: options.growth_factor,
            sample_size: options.sample_size.max(1),
            max_element_len: options.max_element_len,
        }
    }

    /// Process a streamed job with one target per element.
    ///
    /// `initial_size_hint` skips estimation. Element count mismatches are reported as
    /// `InvalidInput` as soon as they are observed.
    pub fn run<E, T, I, K>(
        &self,
        kernel: &mut K,
        source: I,
        targets: &[T],
        initial_size_hint: Option<usize>,
        cost: &dyn CostModel,
        stats: &mut RunStats,
    ) -> Result<ResultBuffer<T>>
    where
        E: AsRef<[T]>,
        T: Scalar,
        I: IntoIterator<Item = E>,
        K: BatchKernel<E, T> + ?Sized,
    {
        profile_scope!("Stream::Run");
        let total = targets.len();
        if total == 0 {
            return Err(BatchError::InvalidInput("no targets for streamed input".to_string()));
        }
        let device = self.controller.device();
        let mut puller = Puller {
            source: source.into_iter().fuse(),
            pulled: 0,
            total,
            max_element_len: self.max_element_len,
        };

        let mut pending: Vec<E> = Vec::with_capacity(self.sample_size.min(total));
        let more = puller.pull::<T>(&mut pending, self.sample_size)?;
        if pending.is_empty() {
            return Err(BatchError::InvalidInput("input stream is empty".to_string()));
        }

        let initial = if !more {
            if puller.pulled != total {
                return Err(puller.short());
            }
            log::debug!("{}: stream of {} elements runs as one chunk", device.name(), total);
            total
        } else if let Some(hint) = initial_size_hint {
            hint.clamp(1, total)
        } else {
            let lengths: Vec<usize> = pending.iter().map(|e| e.as_ref().len()).collect();
            self.estimator.estimate(device, &lengths, total, cost)?.batch_size
        };

        let mut buffer = ResultBuffer::new(total);
        let mut policy = SizePolicy::new(initial, self.growth_factor);
        stats.initial_batch_size = policy.batch_size();
        stats.peak_buffered_elements = stats.peak_buffered_elements.max(pending.len());

        let mut processed = 0;
        let mut chunks_done = 0usize;
        while processed < total {
            let current = policy.chunk_size(total - processed);
            if pending.len() < current {
                let want = current - pending.len();
                puller.pull::<T>(&mut pending, want)?;
                if pending.len() < current {
                    return Err(puller.short());
                }
                stats.peak_buffered_elements = stats.peak_buffered_elements.max(pending.len());
            }

            let chunk = Chunk::new(
                &pending[..current],
                &targets[processed..processed + current],
                processed,
            );
            let committed = self.controller.step(kernel, chunk, total, &mut buffer, &mut policy, stats)?;
            pending.drain(..committed);
            processed += committed;

            if committed == current {
                chunks_done += 1;
                if chunks_done % PROGRESS_INTERVAL == 0 {
                    log::info!(
                        "{}: {}/{} elements processed ({:.0}%)",
                        device.name(),
                        processed,
                        total,
                        processed as f64 * 100.0 / total as f64
                    );
                }
                if processed < total {
                    device.reclaim();
                    stats.reclaim_hints += 1;
                }
            }
        }

        if puller.source.next().is_some() {
            return Err(puller.overflow());
        }
        stats.final_batch_size = policy.batch_size();
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::SimulatedDevice;
    use crate::error::ExecutionError;
    use crate::estimator::LinearCostModel;

    fn sum_kernel(inputs: &[Vec<f64>], targets: &[f64]) -> std::result::Result<Vec<f64>, ExecutionError> {
        Ok(inputs
            .iter()
            .zip(targets)
            .map(|(x, t)| x.iter().sum::<f64>() * t)
            .collect())
    }

    fn cost() -> LinearCostModel {
        LinearCostModel::for_scalar::<f64>(1)
    }

    #[test]
    fn short_stream_is_one_chunk() {
        let sim = Arc::new(SimulatedDevice::new(1 << 20));
        let device = DeviceHandle::from_arc(sim.clone());
        let controller = StreamController::new(&device, &BatchOptions::default());
        let source = (0..3).map(|i| vec![i as f64; 2]);
        let mut stats = RunStats::default();
        let buffer = controller
            .run(&mut sum_kernel, source, &[1.0, 1.0, 1.0], None, &cost(), &mut stats)
            .unwrap();
        assert_eq!(buffer.into_values().unwrap(), vec![0.0, 2.0, 4.0]);
        assert_eq!(stats.chunks, 1);
        // No estimation, so the device was never queried.
        assert_eq!(sim.query_count(), 0);
        assert_eq!(sim.reclaim_count(), 0);
    }

    #[test]
    fn buffered_elements_stay_bounded() {
        let device = DeviceHandle::new(SimulatedDevice::new(1 << 30));
        let options = BatchOptions::default().with_sample_size(8);
        let controller = StreamController::new(&device, &options);
        let total = 500;
        let targets = vec![2.0f64; total];
        let mut largest_chunk = 0;
        let mut kernel = |inputs: &[Vec<f64>], targets: &[f64]| {
            largest_chunk = largest_chunk.max(inputs.len());
            sum_kernel(inputs, targets)
        };
        let source = (0..total).map(|i| vec![i as f64]);
        let mut stats = RunStats::default();
        let buffer = controller
            .run(&mut kernel, source, &targets, Some(16), &cost(), &mut stats)
            .unwrap();
        let values = buffer.into_values().unwrap();
        assert_eq!(values[499], 998.0);
        assert_eq!(largest_chunk, 16);
        assert!(stats.peak_buffered_elements <= 16);
        assert_eq!(stats.chunks, 32);
        assert_eq!(stats.reclaim_hints, 31);
    }

    #[test]
    fn estimates_from_the_sample() {
        // 4 KiB free, 8 B per value, 4 values per element -> 128 elements fit.
        let device = DeviceHandle::new(SimulatedDevice::new(4096));
        let options = BatchOptions::default().with_budget_fraction(1.0).with_sample_size(4);
        let controller = StreamController::new(&device, &options);
        let targets = vec![1.0f64; 300];
        let source = (0..300).map(|_| vec![1.0f64; 4]);
        let mut stats = RunStats::default();
        controller
            .run(&mut sum_kernel, source, &targets, None, &cost(), &mut stats)
            .unwrap();
        assert_eq!(stats.initial_batch_size, 128);
        assert_eq!(stats.chunks, 3);
    }

    #[test]
    fn count_mismatches_are_invalid_input() {
        let device = DeviceHandle::new(SimulatedDevice::new(1 << 20));
        let options = BatchOptions::default().with_sample_size(2);
        let controller = StreamController::new(&device, &options);
        let mut stats = RunStats::default();

        let too_many = (0..5).map(|i| vec![i as f64]);
        let err = controller
            .run(&mut sum_kernel, too_many, &[1.0; 4], Some(2), &cost(), &mut stats)
            .unwrap_err();
        assert!(err.to_string().contains("more elements"));

        let too_few = (0..3).map(|i| vec![i as f64]);
        let err = controller
            .run(&mut sum_kernel, too_few, &[1.0; 4], Some(2), &cost(), &mut stats)
            .unwrap_err();
        assert!(err.to_string().contains("ended after 3"));

        let short_sample = (0..1).map(|i| vec![i as f64]);
        let err = controller
            .run(&mut sum_kernel, short_sample, &[1.0; 4], None, &cost(), &mut stats)
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidInput(_)));
    }

    #[test]
    fn oversized_element_is_rejected_on_pull() {
        let device = DeviceHandle::new(SimulatedDevice::new(1 << 20));
        let options = BatchOptions::default().with_sample_size(2).with_max_element_len(3);
        let controller = StreamController::new(&device, &options);
        let source = (1..=6).map(|i| vec![0.0f64; i]);
        let mut stats = RunStats::default();
        let err = controller
            .run(&mut sum_kernel, source, &[1.0; 6], Some(2), &cost(), &mut stats)
            .unwrap_err();
        assert!(err.to_string().contains("element 3"));
    }
}
