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

//! Result buffer: one slot per input element, filled chunk by chunk.
//!
//! Controllers hand out disjoint, increasing ranges, so release builds only check
//! lengths and bounds. Debug builds additionally track every written slot.

use crate::error::{BatchError, Result};
use crate::types::Scalar;

/// Contiguous range of the logical input sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    pub offset: usize,
    pub size: usize,
}

impl ChunkRange {
    pub fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    /// Split at `size / 2` into `[offset, offset+mid)` and `[offset+mid, end)`.
    ///
    /// Only meaningful for `size >= 2`; both halves are then non-empty.
    pub fn bisect(&self) -> (ChunkRange, ChunkRange) {
        let mid = (self.size / 2).max(1);
        (
            ChunkRange::new(self.offset, mid),
            ChunkRange::new(self.offset + mid, self.size - mid),
        )
    }
}

#[derive(Debug)]
pub struct ResultBuffer<T> {
    values: Vec<T>,
    filled: usize,
    #[cfg(debug_assertions)]
    written: Vec<bool>,
}

impl<T: Scalar> ResultBuffer<T> {
    /// Allocate `len` zeroed slots up front.
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![T::zero(); len],
            filled: 0,
            #[cfg(debug_assertions)]
            written: vec![false; len],
        }
    }

    /// Copy one chunk's results into `range`.
    pub fn write(&mut self, range: ChunkRange, values: &[T]) -> Result<()> {
        if values.len() != range.size {
            return Err(BatchError::Kernel(format!(
                "kernel returned {} results for a chunk of {} elements at offset {}",
                values.len(),
                range.size,
                range.offset
            )));
        }
        if range.end() > self.values.len() {
            return Err(BatchError::InvalidInput(format!(
                "result range [{}, {}) exceeds buffer of {} slots",
                range.offset,
                range.end(),
                self.values.len()
            )));
        }
        #[cfg(debug_assertions)]
        {
            let slots = &mut self.written[range.offset..range.end()];
            debug_assert!(
                slots.iter().all(|w| !w),
                "result range [{}, {}) overlaps a previous write",
                range.offset,
                range.end()
            );
            slots.fill(true);
        }
        self.values[range.offset..range.end()].copy_from_slice(values);
        self.filled += range.size;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Slots written so far.
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.values.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }

    /// Hand the values to the caller; fails unless every slot was written.
    pub fn into_values(self) -> Result<Vec<T>> {
        if !self.is_complete() {
            return Err(BatchError::InvalidInput(format!(
                "result buffer incomplete: {} of {} slots written",
                self.filled,
                self.values.len()
            )));
        }
        Ok(self.values)
    }
}
