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

//! Per-job execution counters.

use std::fmt;

/// What one `process_in_batches` call did on the device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Chunk size the job started with (estimated or explicit).
    pub initial_batch_size: usize,
    /// Controller batch size when the job finished.
    pub final_batch_size: usize,
    /// Chunks handed to the executor by a controller.
    pub chunks: usize,
    /// Kernel invocations, including bisection retries.
    pub kernel_attempts: usize,
    pub oom_events: usize,
    pub bisections: usize,
    /// Controller-level halvings after the executor ran out of retries.
    pub shrinks: usize,
    pub growths: usize,
    pub reclaim_hints: usize,
    /// Largest number of stream elements held at once (0 for materialized input).
    pub peak_buffered_elements: usize,
}

impl RunStats {
    /// Kernel attempts beyond the first attempt of each chunk.
    pub fn retries(&self) -> usize {
        self.kernel_attempts.saturating_sub(self.chunks)
    }

    pub fn had_oom(&self) -> bool {
        self.oom_events > 0
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch size {} -> {}, {} chunks, {} kernel attempts, {} OOM, {} bisections, {} shrinks, {} growths, {} reclaims",
            self.initial_batch_size,
            self.final_batch_size,
            self.chunks,
            self.kernel_attempts,
            self.oom_events,
            self.bisections,
            self.shrinks,
            self.growths,
            self.reclaim_hints,
        )?;
        if self.peak_buffered_elements > 0 {
            write!(f, ", peak {} buffered", self.peak_buffered_elements)?;
        }
        Ok(())
    }
}
