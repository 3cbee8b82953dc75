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

//! Adaptive batch controller for materialized input.
//!
//! Walks `[0, N)` in strictly increasing offsets. Chunk size shrinks when the
//! executor needed bisection or ran out of retries, and ramps back up by
//! `growth_factor` after clean successes, never past one below the smallest size
//! that failed in this run.

use crate::assembler::{ChunkRange, ResultBuffer};
use crate::config::BatchOptions;
use crate::device::DeviceHandle;
use crate::error::{BatchError, Result};
use crate::executor::{BatchKernel, Chunk, ChunkExecutor, ChunkOutcome, JobGuard};
use crate::stats::RunStats;
use crate::types::Scalar;

/// The controller's current belief about a memory-safe chunk size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SizePolicy {
    batch_size: usize,
    ceiling: usize,
    growth_factor: f64,
}

impl SizePolicy {
    pub(crate) fn new(initial_size: usize, growth_factor: f64) -> Self {
        let initial_size = initial_size.max(1);
        Self {
            batch_size: initial_size,
            ceiling: initial_size,
            growth_factor,
        }
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub(crate) fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub(crate) fn chunk_size(&self, remaining: usize) -> usize {
        self.batch_size.min(remaining)
    }

    fn learn_failure(&mut self, smallest_failed: Option<usize>) {
        if let Some(failed) = smallest_failed {
            self.ceiling = self.ceiling.min(failed.saturating_sub(1)).max(1);
        }
    }

    /// Chunk completed. Recovered chunks pin the size to what worked; clean ones
    /// grow toward the ceiling while work remains.
    pub(crate) fn on_success<T>(
        &mut self,
        outcome: &ChunkOutcome<T>,
        work_remains: bool,
        stats: &mut RunStats,
    ) {
        if outcome.recovered() {
            self.learn_failure(outcome.smallest_failed);
            self.batch_size = outcome.largest_succeeded.clamp(1, self.ceiling);
            log::debug!(
                "chunk recovered by bisection, batch size now {} (ceiling {})",
                self.batch_size,
                self.ceiling
            );
            return;
        }
        if !work_remains || self.batch_size >= self.ceiling {
            return;
        }
        let grown = ((self.batch_size as f64) * self.growth_factor).ceil() as usize;
        let grown = grown.min(self.ceiling);
        if grown > self.batch_size {
            log::debug!("batch size {} -> {}", self.batch_size, grown);
            self.batch_size = grown;
            stats.growths += 1;
        }
    }

    /// Executor gave up on a chunk of `current` elements: halve for the retry.
    pub(crate) fn on_exhausted(
        &mut self,
        current: usize,
        smallest_failed: Option<usize>,
        stats: &mut RunStats,
    ) {
        self.learn_failure(smallest_failed);
        self.batch_size = (current / 2).clamp(1, self.ceiling);
        stats.shrinks += 1;
    }
}

/// Drives sequential chunk execution over a slice of inputs.
pub struct AdaptiveBatchController<'d> {
    executor: ChunkExecutor<'d>,
    growth_factor: f64,
}

impl<'d> AdaptiveBatchController<'d> {
    pub fn new(device: &'d DeviceHandle, options: &BatchOptions) -> Self {
        Self::with_guard(device, options, JobGuard::new(options))
    }

    pub(crate) fn with_guard(device: &'d DeviceHandle, options: &BatchOptions, guard: JobGuard) -> Self {
        Self {
            executor: ChunkExecutor::new(device, options.max_retries, guard),
            growth_factor: options.growth_factor,
        }
    }

    pub fn device(&self) -> &'d DeviceHandle {
        self.executor.device()
    }

    /// Process `inputs` starting at chunk size `initial_size`.
    pub fn run<E, T, K>(
        &self,
        kernel: &mut K,
        inputs: &[E],
        targets: &[T],
        initial_size: usize,
        stats: &mut RunStats,
    ) -> Result<ResultBuffer<T>>
    where
        T: Scalar,
        K: BatchKernel<E, T> + ?Sized,
    {
        profile_scope!("Controller::Run");
        let total = inputs.len();
        if total != targets.len() {
            return Err(BatchError::InvalidInput(format!(
                "{} inputs but {} targets",
                total,
                targets.len()
            )));
        }

        let mut buffer = ResultBuffer::new(total);
        let mut policy = SizePolicy::new(initial_size, self.growth_factor);
        stats.initial_batch_size = policy.batch_size();

        let mut processed = 0;
        while processed < total {
            let current = policy.chunk_size(total - processed);
            let chunk = Chunk::new(
                &inputs[processed..processed + current],
                &targets[processed..processed + current],
                processed,
            );
            processed += self.step(kernel, chunk, total, &mut buffer, &mut policy, stats)?;
        }

        stats.final_batch_size = policy.batch_size();
        Ok(buffer)
    }

    /// Execute one chunk and fold the outcome into `buffer` and `policy`.
    ///
    /// Returns how many elements were committed, which is less than the chunk size
    /// only when the executor ran out of retries and the controller shrank.
    pub(crate) fn step<E, T, K>(
        &self,
        kernel: &mut K,
        chunk: Chunk<'_, E, T>,
        total: usize,
        buffer: &mut ResultBuffer<T>,
        policy: &mut SizePolicy,
        stats: &mut RunStats,
    ) -> Result<usize>
    where
        T: Scalar,
        K: BatchKernel<E, T> + ?Sized,
    {
        let offset = chunk.offset;
        let current = chunk.size();
        match self.executor.execute(kernel, chunk, stats) {
            Ok(outcome) => {
                buffer.write(ChunkRange::new(offset, current), &outcome.values)?;
                policy.on_success(&outcome, offset + current < total, stats);
                Ok(current)
            }
            Err(abort) => {
                let done = abort.completed.len();
                if done > 0 {
                    buffer.write(ChunkRange::new(offset, done), &abort.completed)?;
                }
                match abort.error {
                    BatchError::MaxRetriesExceeded { size, retries, .. } => {
                        policy.on_exhausted(current, abort.smallest_failed, stats);
                        log::warn!(
                            "{}: chunk of {} at offset {} still failed at {} elements after {} bisections; \
                             kept {} results, retrying with batch size {} (ceiling {})",
                            self.device().name(),
                            current,
                            offset,
                            size,
                            retries,
                            done,
                            policy.batch_size(),
                            policy.ceiling()
                        );
                        self.device().reclaim();
                        stats.reclaim_hints += 1;
                        Ok(done)
                    }
                    error => Err(error),
                }
            }
        }
    }
}
