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

//! Initial chunk sizing from element-length statistics and a per-element memory model.
//!
//! Low-variance workloads are planned at the mean element cost. When lengths spread
//! out (coefficient of variation >= 0.1) the plan blends in the longest element:
//! `0.7 * cost(mean) + 0.3 * cost(max)`. The result is the number of elements whose
//! planned cost fits in `budget_fraction` of the free device memory.

use crate::config::BatchOptions;
use crate::device::DeviceHandle;
use crate::error::{BatchError, Result};
use crate::types::Scalar;

/// Coefficient of variation below which lengths count as uniform.
pub const LOW_VARIANCE_CV: f64 = 0.1;
/// Weight of `cost(mean)` in the high-variance blend.
pub const MEAN_COST_WEIGHT: f64 = 0.7;
/// Weight of `cost(max)` in the high-variance blend.
pub const TAIL_COST_WEIGHT: f64 = 0.3;

/// Device bytes one element of a given length costs while the kernel runs.
///
/// Must be non-decreasing in `len`.
pub trait CostModel {
    fn bytes_for(&self, len: f64) -> f64;
}

impl<F> CostModel for F
where
    F: Fn(f64) -> f64,
{
    fn bytes_for(&self, len: f64) -> f64 {
        self(len)
    }
}

/// `per_sample_multiplier * len * bytes_per_value + overhead_bytes`.
///
/// The multiplier covers the kernel's temporaries per input value (e.g. one row of a
/// distance matrix per class).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearCostModel {
    pub per_sample_multiplier: usize,
    pub bytes_per_value: usize,
    pub overhead_bytes: usize,
}

impl LinearCostModel {
    pub fn new(per_sample_multiplier: usize, bytes_per_value: usize) -> Self {
        Self {
            per_sample_multiplier,
            bytes_per_value,
            overhead_bytes: 0,
        }
    }

    /// Values of width `T`.
    pub fn for_scalar<T: Scalar>(per_sample_multiplier: usize) -> Self {
        Self::new(per_sample_multiplier, T::size_bytes())
    }

    pub fn with_overhead(mut self, overhead_bytes: usize) -> Self {
        self.overhead_bytes = overhead_bytes;
        self
    }
}

impl CostModel for LinearCostModel {
    fn bytes_for(&self, len: f64) -> f64 {
        self.per_sample_multiplier as f64 * len * self.bytes_per_value as f64
            + self.overhead_bytes as f64
    }
}

/// Population statistics over element lengths.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LengthStats {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub mean: f64,
    pub stddev: f64,
}

impl LengthStats {
    pub fn from_lengths(lengths: &[usize]) -> Result<Self> {
        if lengths.is_empty() {
            return Err(BatchError::InvalidInput(
                "cannot estimate a batch size from zero elements".to_string(),
            ));
        }
        let count = lengths.len();
        let min = lengths.iter().copied().min().unwrap_or(0);
        let max = lengths.iter().copied().max().unwrap_or(0);
        let mean = lengths.iter().map(|&l| l as f64).sum::<f64>() / count as f64;
        let variance = lengths
            .iter()
            .map(|&l| {
                let d = l as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / count as f64;
        Ok(Self {
            count,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
        })
    }

    /// `stddev / mean`; zero when every element is empty.
    pub fn coefficient_of_variation(&self) -> f64 {
        if self.mean > 0.0 {
            self.stddev / self.mean
        } else {
            0.0
        }
    }

    pub fn is_low_variance(&self) -> bool {
        self.coefficient_of_variation() < LOW_VARIANCE_CV
    }
}

/// Outcome of one estimation, kept for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SizeEstimate {
    pub batch_size: usize,
    /// Planned bytes per element.
    pub target_cost: f64,
    /// `budget_fraction * free_bytes` at estimation time.
    pub usable_bytes: f64,
    pub stats: LengthStats,
}

#[derive(Clone, Copy, Debug)]
pub struct SizeEstimator {
    budget_fraction: f64,
    hard_cap: Option<usize>,
}

impl SizeEstimator {
    pub fn new(budget_fraction: f64, hard_cap: Option<usize>) -> Self {
        Self {
            budget_fraction,
            hard_cap,
        }
    }

    pub fn from_options(options: &BatchOptions) -> Self {
        Self::new(options.budget_fraction, options.hard_cap)
    }

    /// Planned per-element cost for a length distribution.
    pub fn target_cost(stats: &LengthStats, cost: &dyn CostModel) -> Result<f64> {
        let mean_cost = cost.bytes_for(stats.mean);
        let target = if stats.is_low_variance() {
            mean_cost
        } else {
            MEAN_COST_WEIGHT * mean_cost + TAIL_COST_WEIGHT * cost.bytes_for(stats.max as f64)
        };
        if !target.is_finite() || target <= 0.0 {
            return Err(BatchError::InvalidCostModel(format!(
                "per-element cost must be positive and finite, got {} (mean length {:.2}, max length {})",
                target, stats.mean, stats.max
            )));
        }
        Ok(target)
    }

    /// Elements per chunk, in `[1, min(total_count, hard_cap)]`.
    ///
    /// `lengths` may be a prefix sample of the input; `total_count` bounds the result.
    pub fn estimate(
        &self,
        device: &DeviceHandle,
        lengths: &[usize],
        total_count: usize,
        cost: &dyn CostModel,
    ) -> Result<SizeEstimate> {
        profile_scope!("Estimator::Estimate");
        let stats = LengthStats::from_lengths(lengths)?;
        let target_cost = Self::target_cost(&stats, cost)?;

        let info = device.query_memory()?;
        let usable_bytes = info.budget(self.budget_fraction);

        let upper = total_count
            .min(self.hard_cap.unwrap_or(usize::MAX))
            .max(1);
        // Float-to-int casts saturate, so an enormous budget lands on `upper`.
        let fit = (usable_bytes / target_cost).floor() as usize;
        let batch_size = fit.clamp(1, upper);

        log::debug!(
            "{}: lengths min {} / mean {:.1} / max {} (cv {:.3}), {:.0} B per element, {} -> batch size {}",
            device.name(),
            stats.min,
            stats.mean,
            stats.max,
            stats.coefficient_of_variation(),
            target_cost,
            info,
            batch_size
        );

        Ok(SizeEstimate {
            batch_size,
            target_cost,
            usable_bytes,
            stats,
        })
    }
}

/// Batch size for `lengths` under the linear cost model of f64 values.
pub fn estimate_batch_size(
    device: &DeviceHandle,
    lengths: &[usize],
    per_sample_multiplier: usize,
    budget_fraction: f64,
) -> Result<usize> {
    let cost = LinearCostModel::for_scalar::<f64>(per_sample_multiplier);
    SizeEstimator::new(budget_fraction, None)
        .estimate(device, lengths, lengths.len(), &cost)
        .map(|e| e.batch_size)
}
