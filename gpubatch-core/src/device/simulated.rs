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

//! In-process accelerator model for tests and dry runs.
//!
//! Behaves like a caching device allocator: freed blocks stay cached in the pool and
//! keep counting against the free memory reported by the oracle until a reclaim hint
//! releases them, but the pool itself can reuse them for new allocations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{DeviceBackend, MemoryInfo, build_oom_message};
use crate::error::{ExecutionError, Result};

#[derive(Debug, Default)]
struct SimState {
    allocated: u64,
    cached: u64,
    peak_allocated: u64,
    failed_allocations: usize,
    /// Readings returned by the next queries instead of the computed value.
    scripted_free: VecDeque<u64>,
}

#[derive(Debug)]
pub struct SimulatedDevice {
    total_bytes: u64,
    /// Memory held by the runtime or other tenants; never reclaimable.
    reserved_bytes: u64,
    state: Mutex<SimState>,
    queries: AtomicUsize,
    reclaims: AtomicUsize,
}

impl SimulatedDevice {
    pub fn new(total_bytes: u64) -> Self {
        Self::with_reserved(total_bytes, 0)
    }

    pub fn with_reserved(total_bytes: u64, reserved_bytes: u64) -> Self {
        Self {
            total_bytes,
            reserved_bytes: reserved_bytes.min(total_bytes),
            state: Mutex::new(SimState::default()),
            queries: AtomicUsize::new(0),
            reclaims: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next query report `free_bytes` regardless of allocator state.
    pub fn push_free_reading(&self, free_bytes: u64) {
        self.state().scripted_free.push_back(free_bytes.min(self.total_bytes));
    }

    /// Allocate `bytes` from the pool, reusing cached blocks first.
    ///
    /// The allocation is returned to the cache when the guard is dropped.
    pub fn allocate(&self, bytes: u64) -> std::result::Result<SimAllocation<'_>, ExecutionError> {
        let mut state = self.state();
        let capacity = self.total_bytes - self.reserved_bytes;
        if state.allocated.saturating_add(bytes) > capacity {
            state.failed_allocations += 1;
            log::debug!(
                "{}",
                build_oom_message(
                    "simulated allocation",
                    bytes,
                    capacity - state.allocated,
                    self.total_bytes
                )
            );
            return Err(ExecutionError::OutOfMemory);
        }
        let from_cache = bytes.min(state.cached);
        state.cached -= from_cache;
        state.allocated += bytes;
        state.peak_allocated = state.peak_allocated.max(state.allocated);
        Ok(SimAllocation {
            device: self,
            bytes,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.state().allocated
    }

    pub fn cached_bytes(&self) -> u64 {
        self.state().cached
    }

    pub fn peak_allocated_bytes(&self) -> u64 {
        self.state().peak_allocated
    }

    pub fn failed_allocations(&self) -> usize {
        self.state().failed_allocations
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn reclaim_count(&self) -> usize {
        self.reclaims.load(Ordering::Relaxed)
    }

    fn release(&self, bytes: u64) {
        let mut state = self.state();
        state.allocated = state.allocated.saturating_sub(bytes);
        state.cached += bytes;
    }
}

impl DeviceBackend for SimulatedDevice {
    fn name(&self) -> &str {
        "simulated"
    }

    fn query_memory(&self) -> Result<MemoryInfo> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        let free_bytes = match state.scripted_free.pop_front() {
            Some(free) => free,
            None => self
                .total_bytes
                .saturating_sub(self.reserved_bytes + state.allocated + state.cached),
        };
        Ok(MemoryInfo {
            free_bytes,
            total_bytes: self.total_bytes,
        })
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        self.state().cached = 0;
    }
}

/// Live simulated allocation; returns its bytes to the pool cache on drop.
#[derive(Debug)]
pub struct SimAllocation<'a> {
    device: &'a SimulatedDevice,
    bytes: u64,
}

impl SimAllocation<'_> {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for SimAllocation<'_> {
    fn drop(&mut self) {
        self.device.release(self.bytes);
    }
}
