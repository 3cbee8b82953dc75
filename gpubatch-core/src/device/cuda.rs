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

//! CUDA memory oracle over cudarc.
//!
//! `query_memory` binds the device context to the calling thread and reads
//! `cuMemGetInfo`; `reclaim` synchronizes the device so frees issued by dropped
//! buffers have completed before the next allocation attempt.

use std::sync::Arc;

use cudarc::driver::{CudaDevice, DriverError, result, sys};

use super::{DeviceBackend, MemoryInfo, build_oom_message};
use crate::error::{BatchError, ExecutionError, Result};

pub struct CudaMemoryOracle {
    device: Arc<CudaDevice>,
    name: String,
}

impl CudaMemoryOracle {
    /// Initialize the CUDA context for `ordinal`.
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = CudaDevice::new(ordinal).map_err(|e| {
            BatchError::Device(format!(
                "Failed to initialize CUDA device {}: {:?}",
                ordinal, e
            ))
        })?;
        Ok(Self::from_device(device))
    }

    pub fn from_device(device: Arc<CudaDevice>) -> Self {
        let name = format!("cuda:{}", device.ordinal());
        Self { device, name }
    }

    /// Get CUDA device reference for kernels launched by the caller
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    /// Classify a cudarc error raised while a kernel allocated or launched.
    ///
    /// `CUDA_ERROR_OUT_OF_MEMORY` becomes `OutOfMemory` (logged with the current free
    /// memory); anything else is a non-memory failure and will not be retried.
    pub fn classify_error(
        &self,
        requested_bytes: u64,
        context: &str,
        err: DriverError,
    ) -> ExecutionError {
        if err.0 != sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY {
            return ExecutionError::failure(format!("{context}: CUDA error {:?}", err));
        }
        match self.query_memory() {
            Ok(info) => log::warn!(
                "{}",
                build_oom_message(context, requested_bytes, info.free_bytes, info.total_bytes)
            ),
            Err(e) => log::warn!(
                "GPU allocation failed during {context}; unable to fetch memory info: {e}"
            ),
        }
        ExecutionError::OutOfMemory
    }
}

impl DeviceBackend for CudaMemoryOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_memory(&self) -> Result<MemoryInfo> {
        self.device
            .bind_to_thread()
            .map_err(|e| BatchError::Device(format!("Failed to bind CUDA context: {:?}", e)))?;
        let (free, total) = result::mem_get_info()
            .map_err(|e| BatchError::Device(format!("cuMemGetInfo failed: {:?}", e)))?;
        Ok(MemoryInfo {
            free_bytes: free as u64,
            total_bytes: total as u64,
        })
    }

    fn reclaim(&self) {
        if let Err(e) = self.device.synchronize() {
            log::warn!("{}: reclaim synchronize failed: {:?}", self.name, e);
        }
    }
}
