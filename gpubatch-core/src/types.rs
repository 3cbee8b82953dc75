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

//! Scalar type system
//!
//! Targets and kernel results are scalars of one floating-point width per job.
//! Both f32 and f64 are supported.

/// Floating-point type carried through a batch job.
///
/// Input elements are sequences of this type, targets and results are single values.
pub trait Scalar:
    Copy + Send + Sync + 'static + num_traits::Float + std::fmt::Debug + std::fmt::Display
{
    /// Human-readable type name for diagnostics
    const TYPE_NAME: &'static str;

    /// Size in bytes
    fn size_bytes() -> usize {
        std::mem::size_of::<Self>()
    }

    /// Lossless widening used in error reports.
    fn as_f64(self) -> f64;
}

impl Scalar for f32 {
    const TYPE_NAME: &'static str = "f32";

    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Scalar for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn as_f64(self) -> f64 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_widths() {
        assert_eq!(f32::size_bytes(), 4);
        assert_eq!(f64::size_bytes(), 8);
        assert_eq!(<f32 as Scalar>::TYPE_NAME, "f32");
        assert_eq!(1.5f32.as_f64(), 1.5);
    }
}
