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

//! Chunk executor: runs the kernel on one chunk and recovers from allocation
//! failures by bisection.
//!
//! Pending sub-ranges live on an explicit worklist, left half on top, so results
//! come back in index order and stack depth stays constant. A range that fails at
//! bisection depth `max_retries` aborts the chunk with `MaxRetriesExceeded`; a single
//! element that fails aborts it with `UnrecoverableOom`. Non-memory failures are
//! never retried.

use std::time::Instant;

use crate::assembler::ChunkRange;
use crate::config::{BatchOptions, CancelToken};
use crate::device::DeviceHandle;
use crate::error::{BatchError, ExecutionError, Result};
use crate::stats::RunStats;

/// Caller-supplied compute function: one result per input element.
pub trait BatchKernel<E, T> {
    fn launch(&mut self, inputs: &[E], targets: &[T])
    -> std::result::Result<Vec<T>, ExecutionError>;
}

impl<E, T, F> BatchKernel<E, T> for F
where
    F: FnMut(&[E], &[T]) -> std::result::Result<Vec<T>, ExecutionError> + ?Sized,
{
    fn launch(
        &mut self,
        inputs: &[E],
        targets: &[T],
    ) -> std::result::Result<Vec<T>, ExecutionError> {
        self(inputs, targets)
    }
}

/// Inputs and targets of one chunk, positioned at `offset` in the whole job.
#[derive(Debug)]
pub struct Chunk<'a, E, T> {
    pub inputs: &'a [E],
    pub targets: &'a [T],
    pub offset: usize,
}

impl<'a, E, T> Chunk<'a, E, T> {
    pub fn new(inputs: &'a [E], targets: &'a [T], offset: usize) -> Self {
        debug_assert_eq!(inputs.len(), targets.len());
        Self {
            inputs,
            targets,
            offset,
        }
    }

    pub fn size(&self) -> usize {
        self.inputs.len()
    }

    pub fn range(&self) -> ChunkRange {
        ChunkRange::new(self.offset, self.size())
    }
}

/// A chunk that completed, possibly after bisection.
#[derive(Debug)]
pub struct ChunkOutcome<T> {
    pub values: Vec<T>,
    /// Smallest sub-range size that ran out of memory, if any did.
    pub smallest_failed: Option<usize>,
    /// Largest sub-range size that succeeded.
    pub largest_succeeded: usize,
}

impl<T> ChunkOutcome<T> {
    pub fn recovered(&self) -> bool {
        self.smallest_failed.is_some()
    }
}

/// A chunk that did not complete. `completed` holds the results of the leading
/// sub-ranges that did succeed; they cover `[offset, offset + completed.len())`.
#[derive(Debug)]
pub struct ChunkAbort<T> {
    pub completed: Vec<T>,
    pub smallest_failed: Option<usize>,
    pub error: BatchError,
}

/// Deadline and cancellation checks shared by every attempt of one job.
#[derive(Clone, Debug)]
pub struct JobGuard {
    started: Instant,
    deadline: Option<std::time::Duration>,
    cancel: Option<CancelToken>,
}

impl JobGuard {
    pub fn new(options: &BatchOptions) -> Self {
        Self {
            started: Instant::now(),
            deadline: options.deadline,
            cancel: options.cancel.clone(),
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(BatchError::Cancelled);
        }
        if let Some(limit) = self.deadline {
            let elapsed = self.started.elapsed();
            if elapsed > limit {
                return Err(BatchError::DeadlineExceeded { elapsed });
            }
        }
        Ok(())
    }
}

pub struct ChunkExecutor<'d> {
    device: &'d DeviceHandle,
    max_retries: usize,
    guard: JobGuard,
}

impl<'d> ChunkExecutor<'d> {
    pub fn new(device: &'d DeviceHandle, max_retries: usize, guard: JobGuard) -> Self {
        Self {
            device,
            max_retries,
            guard,
        }
    }

    pub fn device(&self) -> &'d DeviceHandle {
        self.device
    }

    /// Run `kernel` over `chunk`, bisecting on allocation failure.
    pub fn execute<E, T, K>(
        &self,
        kernel: &mut K,
        chunk: Chunk<'_, E, T>,
        stats: &mut RunStats,
    ) -> std::result::Result<ChunkOutcome<T>, ChunkAbort<T>>
    where
        K: BatchKernel<E, T> + ?Sized,
    {
        profile_scope!("Executor::Chunk");
        stats.chunks += 1;

        let mut values: Vec<T> = Vec::with_capacity(chunk.size());
        let mut smallest_failed: Option<usize> = None;
        let mut largest_succeeded = 0usize;
        // (range relative to the chunk, bisection depth)
        let mut pending = vec![(ChunkRange::new(0, chunk.size()), 0usize)];

        macro_rules! abort {
            ($err:expr) => {
                return Err(ChunkAbort {
                    completed: values,
                    smallest_failed,
                    error: $err,
                })
            };
        }

        while let Some((range, depth)) = pending.pop() {
            if let Err(e) = self.guard.check() {
                abort!(e);
            }
            let inputs = &chunk.inputs[range.offset..range.end()];
            let targets = &chunk.targets[range.offset..range.end()];
            let offset = chunk.offset + range.offset;

            stats.kernel_attempts += 1;
            match kernel.launch(inputs, targets) {
                Ok(out) => {
                    if out.len() != range.size {
                        abort!(BatchError::Kernel(format!(
                            "kernel returned {} results for {} elements at offset {}",
                            out.len(),
                            range.size,
                            offset
                        )));
                    }
                    values.extend(out);
                    largest_succeeded = largest_succeeded.max(range.size);
                }
                Err(ExecutionError::OutOfMemory) => {
                    stats.oom_events += 1;
                    smallest_failed = Some(smallest_failed.map_or(range.size, |s| s.min(range.size)));
                    self.log_oom(offset, range.size, depth);

                    if range.size == 1 {
                        log::error!(
                            "{}: element {} does not fit on the device even alone",
                            self.device.name(),
                            offset
                        );
                        abort!(BatchError::UnrecoverableOom { offset });
                    }
                    if depth >= self.max_retries {
                        abort!(BatchError::MaxRetriesExceeded {
                            offset,
                            size: range.size,
                            retries: self.max_retries,
                        });
                    }

                    self.device.reclaim();
                    stats.reclaim_hints += 1;
                    stats.bisections += 1;
                    let (left, right) = range.bisect();
                    pending.push((right, depth + 1));
                    pending.push((left, depth + 1));
                }
                Err(ExecutionError::NonMemoryFailure(details)) => {
                    abort!(BatchError::Kernel(format!(
                        "chunk of {} elements at offset {}: {}",
                        range.size, offset, details
                    )));
                }
            }
        }

        Ok(ChunkOutcome {
            values,
            smallest_failed,
            largest_succeeded,
        })
    }

    fn log_oom(&self, offset: usize, size: usize, depth: usize) {
        match self.device.query_memory() {
            Ok(info) => log::warn!(
                "{}: OOM on {} elements at offset {} (bisection level {}/{}), {}",
                self.device.name(),
                size,
                offset,
                depth,
                self.max_retries,
                info
            ),
            Err(e) => log::warn!(
                "{}: OOM on {} elements at offset {} (bisection level {}/{}); memory query failed: {}",
                self.device.name(),
                size,
                offset,
                depth,
                self.max_retries,
                e
            ),
        }
    }
}

/// Run one chunk with a fresh executor, without deadline or cancellation.
pub fn execute_chunk<E, T, K>(
    device: &DeviceHandle,
    kernel: &mut K,
    chunk: Chunk<'_, E, T>,
    max_retries: usize,
) -> Result<Vec<T>>
where
    K: BatchKernel<E, T> + ?Sized,
{
    let executor = ChunkExecutor::new(device, max_retries, JobGuard::new(&BatchOptions::default()));
    let mut stats = RunStats::default();
    executor
        .execute(kernel, chunk, &mut stats)
        .map(|outcome| outcome.values)
        .map_err(|abort| abort.error)
}
