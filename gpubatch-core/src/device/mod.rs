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

//! Device memory oracle and reclaim hint.
//!
//! The accelerator is passed explicitly as a [`DeviceHandle`] into every call that
//! touches it, so tests can substitute a [`SimulatedDevice`].

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod simulated;

use std::fmt;
use std::sync::Arc;

use crate::error::{ExecutionError, Result};

#[cfg(feature = "cuda")]
pub use cuda::CudaMemoryOracle;
pub use simulated::{SimAllocation, SimulatedDevice};

pub(crate) fn bytes_to_mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Diagnostic text for an allocation request the device cannot satisfy.
pub fn build_oom_message(context: &str, requested_bytes: u64, free: u64, total: u64) -> String {
    format!(
        "GPU out of memory during {context}: requested {:.2} MiB, free {:.2} MiB / total {:.2} MiB",
        bytes_to_mib(requested_bytes),
        bytes_to_mib(free),
        bytes_to_mib(total),
    )
}

/// Snapshot of the device allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryInfo {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    /// Bytes a job may plan against: `free_bytes * budget_fraction`.
    pub fn budget(&self, budget_fraction: f64) -> f64 {
        self.free_bytes as f64 * budget_fraction
    }
}

impl fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "free {:.2} MiB / total {:.2} MiB",
            bytes_to_mib(self.free_bytes),
            bytes_to_mib(self.total_bytes)
        )
    }
}

/// One accelerator context.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Current free/total memory. Cheap, synchronous, no side effects.
    fn query_memory(&self) -> Result<MemoryInfo>;

    /// Advisory request to release cached allocations. Idempotent; blocks until done.
    fn reclaim(&self);
}

/// Cloneable handle to the device a job runs on.
#[derive(Clone)]
pub struct DeviceHandle {
    backend: Arc<dyn DeviceBackend>,
}

impl DeviceHandle {
    pub fn new(backend: impl DeviceBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Wrap a backend the caller keeps a reference to (e.g. a simulated device in tests).
    pub fn from_arc(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn query_memory(&self) -> Result<MemoryInfo> {
        self.backend.query_memory()
    }

    pub fn reclaim(&self) {
        self.backend.reclaim();
    }

    /// Guard that checks free device memory before a kernel commits to a large allocation.
    ///
    /// Returns `OutOfMemory` when the request exceeds the currently reported free memory,
    /// so kernels can fail fast instead of tripping the allocator. Oracle failures are
    /// reported as non-memory failures.
    pub fn ensure_available(
        &self,
        requested_bytes: u64,
        context: &str,
    ) -> std::result::Result<(), ExecutionError> {
        let info = self
            .query_memory()
            .map_err(|e| ExecutionError::failure(format!("memory query failed: {e}")))?;
        if requested_bytes > info.free_bytes {
            log::debug!(
                "{}",
                build_oom_message(context, requested_bytes, info.free_bytes, info.total_bytes)
            );
            return Err(ExecutionError::OutOfMemory);
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("backend", &self.backend.name())
            .finish()
    }
}
