// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Aggregate function kernels over raw state pointers.
//!
//! Responsibilities:
//! - Defines the stateful aggregate contract the hash table drives: fixed-size
//!   states stored inline in tuple rows, updated/combined in batches.
//! - Provides the shared arena that variable-width state data lives in.
//!
//! Key exported interfaces:
//! - Types: `AggregateFunction`, `AggregateExpr`, `AggAllocator`, `AggStatePtr`.
//!
//! State ownership: `combine_batch` MOVES the source state into the destination.
//! A state that has been combined away (or whose bytes were memcpy'd into
//! another row collection) must not be destroyed; `destroy_state` is only ever
//! called on live states, exactly once.

use std::fmt;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;

pub mod arena;
pub mod functions;

pub use arena::AggAllocator;

/// Raw address of one aggregate's state inside a tuple row.
pub type AggStatePtr = usize;

/// A stateful aggregate function.
///
/// States are plain byte blobs of `state_layout()` size; the engine positions
/// them inside tuple rows and hands out resolved addresses. Implementations
/// read and write states through raw pointers, in batches.
pub trait AggregateFunction: Send + Sync {
    fn name(&self) -> &str;

    fn output_type(&self) -> DataType;

    /// `(size, align)` of one state.
    fn state_layout(&self) -> (usize, usize);

    fn init_state(&self, state: AggStatePtr);

    /// Accumulate input rows into states: `states[i]` receives input row
    /// `sel[i]`. `input` is `None` for zero-argument aggregates.
    fn update_batch(
        &self,
        states: &[AggStatePtr],
        sel: &[usize],
        input: Option<&ArrayRef>,
        allocator: &AggAllocator,
    ) -> Result<(), String>;

    /// Merge `src[i]` into `dst[i]`, consuming the source state.
    fn combine_batch(
        &self,
        src: &[AggStatePtr],
        dst: &[AggStatePtr],
        allocator: &AggAllocator,
    ) -> Result<(), String>;

    /// Produce one output value per state.
    fn finalize_batch(&self, states: &[AggStatePtr]) -> Result<ArrayRef, String>;

    fn has_destructor(&self) -> bool {
        false
    }

    fn destroy_state(&self, _state: AggStatePtr) {}
}

/// An aggregate bound to its payload input column.
#[derive(Clone)]
pub struct AggregateExpr {
    pub function: Arc<dyn AggregateFunction>,
    /// Index into the payload chunk, `None` for zero-argument aggregates.
    pub payload_index: Option<usize>,
}

impl AggregateExpr {
    pub fn new(function: Arc<dyn AggregateFunction>, payload_index: Option<usize>) -> Self {
        Self {
            function,
            payload_index,
        }
    }
}

impl fmt::Debug for AggregateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateExpr")
            .field("function", &self.function.name())
            .field("payload_index", &self.payload_index)
            .finish()
    }
}
