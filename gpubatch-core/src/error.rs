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

//! Error taxonomy for the batch engine.
//!
//! Kernels report failures through [`ExecutionError`], a closed sum type that lets
//! the chunk executor pattern-match allocation failures. Everything the caller sees
//! is a [`BatchError`].

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a compute kernel for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The device allocator refused a request. Recoverable by bisection.
    #[error("out of device memory")]
    OutOfMemory,
    /// Any other kernel failure (shape mismatch, numerical error, launch failure).
    #[error("{0}")]
    NonMemoryFailure(String),
}

impl ExecutionError {
    pub fn failure(details: impl Into<String>) -> Self {
        ExecutionError::NonMemoryFailure(details.into())
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, ExecutionError::OutOfMemory)
    }
}

/// Error type for all engine operations.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Non-finite target at index {index}: {value}")]
    NonFiniteTarget { index: usize, value: f64 },

    #[error("Invalid cost model: {0}")]
    InvalidCostModel(String),

    #[error("Out of device memory: {0}")]
    OutOfDeviceMemory(String),

    #[error("Unrecoverable OOM at minimum granularity (element {offset} does not fit on the device)")]
    UnrecoverableOom { offset: usize },

    #[error(
        "Max retries exceeded: {size} elements at offset {offset} still out of memory after {retries} bisection levels"
    )]
    MaxRetriesExceeded {
        offset: usize,
        size: usize,
        retries: usize,
    },

    #[error("Kernel failure: {0}")]
    Kernel(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Batch job cancelled")]
    Cancelled,

    #[error("Batch job deadline exceeded after {elapsed:?}")]
    DeadlineExceeded { elapsed: Duration },
}

impl BatchError {
    /// True for errors produced by memory pressure rather than by the inputs or the kernel.
    pub fn is_memory_related(&self) -> bool {
        matches!(
            self,
            BatchError::OutOfDeviceMemory(_)
                | BatchError::UnrecoverableOom { .. }
                | BatchError::MaxRetriesExceeded { .. }
        )
    }
}

impl From<ExecutionError> for BatchError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::OutOfMemory => {
                BatchError::OutOfDeviceMemory("kernel allocation failed".to_string())
            }
            ExecutionError::NonMemoryFailure(details) => BatchError::Kernel(details),
        }
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
