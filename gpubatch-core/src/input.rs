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

//! Input shapes accepted by the engine and the checks run before any device work.

use crate::error::{BatchError, Result};
use crate::types::Scalar;

/// Elements handed to the engine: a slice, or a one-shot iterator.
///
/// ```ignore
/// let materialized = BatchInput::materialized(&vectors);
/// let streamed = BatchInput::streamed(reader.lines().map(parse));
/// ```
pub enum BatchInput<'a, E, I = std::iter::Empty<E>> {
    Materialized(&'a [E]),
    Streamed(I),
}

impl<'a, E> BatchInput<'a, E> {
    pub fn materialized(inputs: &'a [E]) -> Self {
        BatchInput::Materialized(inputs)
    }
}

impl<'a, E, I> BatchInput<'a, E, I>
where
    I: Iterator<Item = E>,
{
    pub fn streamed(source: impl IntoIterator<Item = E, IntoIter = I>) -> Self {
        BatchInput::Streamed(source.into_iter())
    }

    pub fn is_streamed(&self) -> bool {
        matches!(self, BatchInput::Streamed(_))
    }

    /// Element count when it is known without consuming anything.
    pub fn known_len(&self) -> Option<usize> {
        match self {
            BatchInput::Materialized(inputs) => Some(inputs.len()),
            BatchInput::Streamed(_) => None,
        }
    }
}

impl<'a, E> From<&'a [E]> for BatchInput<'a, E> {
    fn from(inputs: &'a [E]) -> Self {
        BatchInput::Materialized(inputs)
    }
}

impl<'a, E> From<&'a Vec<E>> for BatchInput<'a, E> {
    fn from(inputs: &'a Vec<E>) -> Self {
        BatchInput::Materialized(inputs.as_slice())
    }
}

/// Targets must be non-empty and finite.
pub fn validate_targets<T: Scalar>(targets: &[T]) -> Result<()> {
    if targets.is_empty() {
        return Err(BatchError::InvalidInput("input collection is empty".to_string()));
    }
    if let Some((index, value)) = targets.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(BatchError::NonFiniteTarget {
            index,
            value: value.as_f64(),
        });
    }
    Ok(())
}

pub fn check_element_len(index: usize, len: usize, max_element_len: Option<usize>) -> Result<()> {
    match max_element_len {
        Some(max) if len > max => Err(BatchError::InvalidInput(format!(
            "element {} has length {}, above the configured maximum of {}",
            index, len, max
        ))),
        _ => Ok(()),
    }
}

/// Full check of a materialized job.
pub fn validate_materialized<E, T>(
    inputs: &[E],
    targets: &[T],
    max_element_len: Option<usize>,
) -> Result<()>
where
    E: AsRef<[T]>,
    T: Scalar,
{
    if inputs.is_empty() {
        return Err(BatchError::InvalidInput("input collection is empty".to_string()));
    }
    if inputs.len() != targets.len() {
        return Err(BatchError::InvalidInput(format!(
            "{} inputs but {} targets",
            inputs.len(),
            targets.len()
        )));
    }
    for (index, element) in inputs.iter().enumerate() {
        check_element_len(index, element.as_ref().len(), max_element_len)?;
    }
    validate_targets(targets)
}
