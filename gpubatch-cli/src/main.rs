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

//! `gpubatch`: drive the batch engine over a synthetic workload.
//!
//! Runs on the simulated accelerator, so memory pressure, forced allocation
//! failures and stream mode can be tried without a GPU. Set `RUST_LOG=debug` to
//! see every sizing decision.

use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gpubatch_core::{
    BatchEngine, BatchError, BatchInput, BatchOptions, DeviceHandle, ExecutionError,
    LinearCostModel, SimulatedDevice, SizeEstimator,
};

const MIB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Adaptive batch execution on a simulated accelerator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process a synthetic workload and print the run statistics.
    Run {
        #[command(flatten)]
        workload: WorkloadArgs,
        #[command(flatten)]
        tuning: TuningArgs,
        /// Feed the inputs as a one-shot stream instead of a slice.
        #[arg(long)]
        stream: bool,
        /// Fail every kernel call with more than this many elements.
        #[arg(long, value_name = "ELEMENTS")]
        oom_above: Option<usize>,
        /// Abort once the job has run this long.
        #[arg(long, value_name = "MS")]
        deadline_ms: Option<u64>,
    },
    /// Print the initial batch size the estimator would choose.
    Estimate {
        #[command(flatten)]
        workload: WorkloadArgs,
        #[command(flatten)]
        tuning: TuningArgs,
        /// Query CUDA device ORDINAL instead of the simulated device.
        #[cfg(feature = "cuda")]
        #[arg(long, value_name = "ORDINAL")]
        cuda: Option<usize>,
    },
}

#[derive(Args, Debug)]
struct WorkloadArgs {
    /// Number of input elements.
    #[arg(long, default_value_t = 10_000)]
    count: usize,
    /// Shortest element length.
    #[arg(long, default_value_t = 16)]
    min_len: usize,
    /// Longest element length.
    #[arg(long, default_value_t = 256)]
    max_len: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Simulated device memory.
    #[arg(long, value_name = "MIB", default_value_t = 64)]
    memory_mib: u64,
    /// Simulated memory held by other tenants.
    #[arg(long, value_name = "MIB", default_value_t = 0)]
    reserved_mib: u64,
}

#[derive(Args, Debug)]
struct TuningArgs {
    /// Skip estimation and start at this chunk size.
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    sample_size: Option<usize>,
    #[arg(long)]
    budget_fraction: Option<f64>,
    #[arg(long)]
    max_retries: Option<usize>,
    #[arg(long)]
    hard_cap: Option<usize>,
    /// Device bytes per input value, in units of one f64.
    #[arg(long, default_value_t = 4)]
    multiplier: usize,
}

impl TuningArgs {
    /// Environment defaults (`GPUBATCH_*`) overridden by flags.
    fn options(&self) -> BatchOptions {
        let mut options = BatchOptions::from_env().with_per_sample_multiplier(self.multiplier);
        if let Some(size) = self.batch_size {
            options = options.with_batch_size(size);
        }
        if let Some(size) = self.sample_size {
            options = options.with_sample_size(size);
        }
        if let Some(fraction) = self.budget_fraction {
            options = options.with_budget_fraction(fraction);
        }
        if let Some(retries) = self.max_retries {
            options = options.with_max_retries(retries);
        }
        if let Some(cap) = self.hard_cap {
            options = options.with_hard_cap(cap);
        }
        options
    }
}

impl WorkloadArgs {
    fn validate(&self) -> Result<(), BatchError> {
        if self.count == 0 {
            return Err(BatchError::InvalidInput("--count must be at least 1".to_string()));
        }
        if self.min_len == 0 || self.min_len > self.max_len {
            return Err(BatchError::InvalidInput(format!(
                "need 1 <= --min-len <= --max-len, got {} and {}",
                self.min_len, self.max_len
            )));
        }
        if self.reserved_mib > self.memory_mib {
            return Err(BatchError::InvalidInput(
                "--reserved-mib exceeds --memory-mib".to_string(),
            ));
        }
        Ok(())
    }

    fn device(&self) -> Arc<SimulatedDevice> {
        Arc::new(SimulatedDevice::with_reserved(
            self.memory_mib * MIB,
            self.reserved_mib * MIB,
        ))
    }

    fn generate(&self) -> (Vec<Vec<f64>>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let inputs = (0..self.count)
            .map(|_| {
                let len = rng.gen_range(self.min_len..=self.max_len);
                (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
            })
            .collect();
        let targets = (0..self.count).map(|_| rng.gen_range(0.5..2.0)).collect();
        (inputs, targets)
    }
}

fn main() {
    let _ = env_logger::Builder::from_default_env().try_init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run {
            workload,
            tuning,
            stream,
            oom_above,
            deadline_ms,
        } => run(&workload, &tuning, stream, oom_above, deadline_ms),
        #[cfg(feature = "cuda")]
        Command::Estimate {
            workload,
            tuning,
            cuda,
        } => estimate(&workload, &tuning, cuda),
        #[cfg(not(feature = "cuda"))]
        Command::Estimate { workload, tuning } => estimate(&workload, &tuning, None),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(
    workload: &WorkloadArgs,
    tuning: &TuningArgs,
    stream: bool,
    oom_above: Option<usize>,
    deadline_ms: Option<u64>,
) -> Result<(), BatchError> {
    workload.validate()?;
    let mut options = tuning.options();
    if let Some(ms) = deadline_ms {
        options = options.with_deadline(Duration::from_millis(ms));
    }
    let sim = workload.device();
    let engine = BatchEngine::new(DeviceHandle::from_arc(sim.clone()), options)?;
    let (inputs, targets) = workload.generate();
    let bytes_per_value = (tuning.multiplier * std::mem::size_of::<f64>()) as u64;

    let mut kernel = |x: &[Vec<f64>], t: &[f64]| -> Result<Vec<f64>, ExecutionError> {
        if oom_above.is_some_and(|limit| x.len() > limit) {
            return Err(ExecutionError::OutOfMemory);
        }
        let values: usize = x.iter().map(Vec::len).sum();
        let _workspace = sim.allocate(values as u64 * bytes_per_value)?;
        Ok(x.iter()
            .zip(t)
            .map(|(v, &w)| v.iter().map(|a| a * a).sum::<f64>().sqrt() * w)
            .collect())
    };

    let started = Instant::now();
    let output = if stream {
        engine.run(&mut kernel, BatchInput::streamed(inputs), &targets)?
    } else {
        engine.run(&mut kernel, BatchInput::materialized(&inputs), &targets)?
    };
    let elapsed = started.elapsed();

    let checksum: f64 = output.values.iter().sum();
    println!(
        "processed {} elements in {:.2?} ({})",
        output.values.len(),
        elapsed,
        if stream { "stream" } else { "materialized" }
    );
    println!("checksum: {checksum:.6}");
    println!("stats: {}", output.stats);
    println!(
        "device: peak {:.1} MiB allocated, {} failed allocations, {} queries",
        sim.peak_allocated_bytes() as f64 / MIB as f64,
        sim.failed_allocations(),
        sim.query_count()
    );
    Ok(())
}

fn estimate(
    workload: &WorkloadArgs,
    tuning: &TuningArgs,
    cuda_ordinal: Option<usize>,
) -> Result<(), BatchError> {
    workload.validate()?;
    let options = tuning.options();
    options.validate()?;
    let device = match cuda_ordinal {
        #[cfg(feature = "cuda")]
        Some(ordinal) => DeviceHandle::new(gpubatch_core::CudaMemoryOracle::new(ordinal)?),
        _ => DeviceHandle::from_arc(workload.device()),
    };
    let (inputs, _) = workload.generate();
    let lengths: Vec<usize> = inputs.iter().map(Vec::len).collect();
    let cost = LinearCostModel::for_scalar::<f64>(options.per_sample_multiplier);
    let estimate = SizeEstimator::from_options(&options).estimate(&device, &lengths, lengths.len(), &cost)?;

    println!("device: {} ({})", device.name(), device.query_memory()?);
    println!(
        "lengths: min {} / mean {:.1} / max {} (cv {:.3})",
        estimate.stats.min,
        estimate.stats.mean,
        estimate.stats.max,
        estimate.stats.coefficient_of_variation()
    );
    println!("planned cost: {:.0} B per element", estimate.target_cost);
    println!("batch size: {}", estimate.batch_size);
    Ok(())
}
