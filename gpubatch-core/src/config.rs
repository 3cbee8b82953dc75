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

//! Batch job options: chunk sizing, retry budget and safety margins, with env override.
//!
//! **Env:** `GPUBATCH_BATCH_SIZE`, `GPUBATCH_SAMPLE_SIZE`, `GPUBATCH_BUDGET_FRACTION`,
//! `GPUBATCH_MAX_RETRIES`, `GPUBATCH_HARD_CAP`, `GPUBATCH_MAX_ELEMENT_LEN`. Parse failure
//! leaves the field at its default.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{BatchError, Result};

/// Elements pulled from a stream to seed the size estimator.
pub const DEFAULT_SAMPLE_SIZE: usize = 50;
/// Fraction of free device memory a job may plan against.
pub const DEFAULT_BUDGET_FRACTION: f64 = 0.8;
/// Bisection levels the chunk executor may descend before giving up on a chunk.
pub const DEFAULT_MAX_RETRIES: usize = 3;
/// Multiplicative ramp-up applied after a successful chunk below the growth ceiling.
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.2;

/// Shared flag checked before every kernel attempt.
///
/// Cancellation is cooperative: a kernel call that is already running is not interrupted.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Explicit chunk size; skips estimation when set.
    pub batch_size: Option<usize>,
    /// Prefix length used for estimation on streamed input.
    pub sample_size: usize,
    /// Share of free device memory the estimator may plan against, in (0, 1].
    pub budget_fraction: f64,
    /// Bisection depth budget of the chunk executor.
    pub max_retries: usize,
    /// Upper bound on any chunk, however much memory is free.
    pub hard_cap: Option<usize>,
    /// Elements longer than this are rejected as invalid input.
    pub max_element_len: Option<usize>,
    /// Multiplier of the default linear cost model (device bytes per input value per element).
    pub per_sample_multiplier: usize,
    /// Ramp-up factor after success, must be > 1.
    pub growth_factor: f64,
    /// Wall-clock budget for the whole job, checked before each kernel attempt.
    pub deadline: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            sample_size: DEFAULT_SAMPLE_SIZE,
            budget_fraction: DEFAULT_BUDGET_FRACTION,
            max_retries: DEFAULT_MAX_RETRIES,
            hard_cap: None,
            max_element_len: None,
            per_sample_multiplier: 1,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            deadline: None,
            cancel: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl BatchOptions {
    /// Defaults overridden by any well-formed `GPUBATCH_*` variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(size) = env_parse("GPUBATCH_BATCH_SIZE") {
            options.batch_size = Some(size);
        }
        if let Some(size) = env_parse("GPUBATCH_SAMPLE_SIZE") {
            options.sample_size = size;
        }
        if let Some(fraction) = env_parse("GPUBATCH_BUDGET_FRACTION") {
            options.budget_fraction = fraction;
        }
        if let Some(retries) = env_parse("GPUBATCH_MAX_RETRIES") {
            options.max_retries = retries;
        }
        if let Some(cap) = env_parse("GPUBATCH_HARD_CAP") {
            options.hard_cap = Some(cap);
        }
        if let Some(len) = env_parse("GPUBATCH_MAX_ELEMENT_LEN") {
            options.max_element_len = Some(len);
        }
        options
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn with_budget_fraction(mut self, budget_fraction: f64) -> Self {
        self.budget_fraction = budget_fraction;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_hard_cap(mut self, hard_cap: usize) -> Self {
        self.hard_cap = Some(hard_cap);
        self
    }

    pub fn with_max_element_len(mut self, max_element_len: usize) -> Self {
        self.max_element_len = Some(max_element_len);
        self
    }

    pub fn with_per_sample_multiplier(mut self, multiplier: usize) -> Self {
        self.per_sample_multiplier = multiplier;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Validate: budget fraction in (0, 1], sizes >= 1 when set, growth factor > 1.
    pub fn validate(&self) -> Result<()> {
        if !(self.budget_fraction > 0.0 && self.budget_fraction <= 1.0) {
            return Err(BatchError::InvalidInput(format!(
                "budget_fraction must be in (0, 1], got {}",
                self.budget_fraction
            )));
        }
        if self.sample_size == 0 {
            return Err(BatchError::InvalidInput(
                "sample_size must be at least 1".to_string(),
            ));
        }
        if self.batch_size == Some(0) {
            return Err(BatchError::InvalidInput(
                "batch_size must be at least 1 when set".to_string(),
            ));
        }
        if self.hard_cap == Some(0) {
            return Err(BatchError::InvalidInput(
                "hard_cap must be at least 1 when set".to_string(),
            ));
        }
        if self.per_sample_multiplier == 0 {
            return Err(BatchError::InvalidInput(
                "per_sample_multiplier must be at least 1".to_string(),
            ));
        }
        if !(self.growth_factor.is_finite() && self.growth_factor > 1.0) {
            return Err(BatchError::InvalidInput(format!(
                "growth_factor must be finite and > 1, got {}",
                self.growth_factor
            )));
        }
        Ok(())
    }

    /// Largest chunk allowed for a job of `total` elements.
    pub(crate) fn size_ceiling(&self, total: usize) -> usize {
        total.min(self.hard_cap.unwrap_or(usize::MAX)).max(1)
    }

    /// Explicit `batch_size` clamped into `[1, size_ceiling(total)]`.
    pub(crate) fn explicit_batch_size(&self, total: usize) -> Option<usize> {
        self.batch_size
            .map(|size| size.clamp(1, self.size_ceiling(total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialize env-dependent tests so parallel runs don't cross-talk.
    static ENV_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    const ENV_KEYS: [&str; 6] = [
        "GPUBATCH_BATCH_SIZE",
        "GPUBATCH_SAMPLE_SIZE",
        "GPUBATCH_BUDGET_FRACTION",
        "GPUBATCH_MAX_RETRIES",
        "GPUBATCH_HARD_CAP",
        "GPUBATCH_MAX_ELEMENT_LEN",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            unsafe {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn from_env_unset() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        clear_env();
        let c = BatchOptions::from_env();
        assert!(c.batch_size.is_none());
        assert!(c.hard_cap.is_none());
        assert_eq!(c.sample_size, DEFAULT_SAMPLE_SIZE);
        assert_eq!(c.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(c.budget_fraction, DEFAULT_BUDGET_FRACTION);
    }

    #[test]
    fn from_env_parses() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("GPUBATCH_BATCH_SIZE", "64");
            std::env::set_var("GPUBATCH_BUDGET_FRACTION", "0.9");
            std::env::set_var("GPUBATCH_HARD_CAP", " 512 ");
            std::env::set_var("GPUBATCH_MAX_RETRIES", "not-a-number");
        }
        let c = BatchOptions::from_env();
        assert_eq!(c.batch_size, Some(64));
        assert_eq!(c.budget_fraction, 0.9);
        assert_eq!(c.hard_cap, Some(512));
        assert_eq!(c.max_retries, DEFAULT_MAX_RETRIES);
        clear_env();
    }

    #[test]
    fn validate_bounds() {
        let c = BatchOptions::default();
        assert!(c.validate().is_ok());
        assert!(c.clone().with_budget_fraction(0.0).validate().is_err());
        assert!(c.clone().with_budget_fraction(1.5).validate().is_err());
        assert!(c.clone().with_budget_fraction(f64::NAN).validate().is_err());
        assert!(c.clone().with_budget_fraction(1.0).validate().is_ok());
        assert!(c.clone().with_sample_size(0).validate().is_err());
        assert!(c.clone().with_batch_size(0).validate().is_err());
        assert!(c.clone().with_hard_cap(0).validate().is_err());
        assert!(c.clone().with_per_sample_multiplier(0).validate().is_err());
        let no_growth = BatchOptions {
            growth_factor: 1.0,
            ..c.clone()
        };
        assert!(no_growth.validate().is_err());
    }

    #[test]
    fn explicit_batch_size_is_clamped() {
        let c = BatchOptions::default().with_batch_size(100).with_hard_cap(16);
        assert_eq!(c.explicit_batch_size(10), Some(10));
        assert_eq!(c.explicit_batch_size(1000), Some(16));
        assert_eq!(BatchOptions::default().explicit_batch_size(10), None);
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
