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
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Float64Builder, Int32Builder, Int64Builder, StringArray,
    StringBuilder,
};
use arrow::datatypes::DataType;

use super::super::{AggAllocator, AggStatePtr, AggregateFunction};
use super::common::{IntArrayView, downcast, required};

#[derive(Clone, Copy)]
struct I64State {
    value: i64,
    has_value: bool,
}

#[derive(Clone, Copy)]
struct F64State {
    value: f64,
    has_value: bool,
}

/// Points at bytes in the aggregate arena. The arena outlives the state via
/// the stored-allocators keepalive list, so copying the pointer on combine is
/// sound even across hash tables.
#[derive(Clone, Copy)]
struct BytesState {
    ptr: usize,
    len: usize,
    has_value: bool,
}

impl BytesState {
    unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MinMaxKind {
    Int32,
    Int64,
    Float64,
    Utf8,
}

/// `min(col)` / `max(col)` preserving the input type.
pub struct MinMaxAgg {
    is_min: bool,
    kind: MinMaxKind,
}

impl MinMaxAgg {
    pub fn try_new_min(input_type: &DataType) -> Result<Self, String> {
        Self::try_new(true, input_type)
    }

    pub fn try_new_max(input_type: &DataType) -> Result<Self, String> {
        Self::try_new(false, input_type)
    }

    fn try_new(is_min: bool, input_type: &DataType) -> Result<Self, String> {
        let kind = match input_type {
            DataType::Int32 => MinMaxKind::Int32,
            DataType::Int64 => MinMaxKind::Int64,
            DataType::Float64 => MinMaxKind::Float64,
            DataType::Utf8 => MinMaxKind::Utf8,
            other => return Err(format!("min/max unsupported input type: {:?}", other)),
        };
        Ok(Self { is_min, kind })
    }

    fn better_i64(&self, candidate: i64, current: i64) -> bool {
        if self.is_min {
            candidate < current
        } else {
            candidate > current
        }
    }

    fn better_f64(&self, candidate: f64, current: f64) -> bool {
        if self.is_min {
            candidate < current
        } else {
            candidate > current
        }
    }

    fn better_bytes(&self, candidate: &[u8], current: &[u8]) -> bool {
        if self.is_min {
            candidate < current
        } else {
            candidate > current
        }
    }
}

impl AggregateFunction for MinMaxAgg {
    fn name(&self) -> &str {
        if self.is_min { "min" } else { "max" }
    }

    fn output_type(&self) -> DataType {
        match self.kind {
            MinMaxKind::Int32 => DataType::Int32,
            MinMaxKind::Int64 => DataType::Int64,
            MinMaxKind::Float64 => DataType::Float64,
            MinMaxKind::Utf8 => DataType::Utf8,
        }
    }

    fn state_layout(&self) -> (usize, usize) {
        match self.kind {
            MinMaxKind::Int32 | MinMaxKind::Int64 => (
                std::mem::size_of::<I64State>(),
                std::mem::align_of::<I64State>(),
            ),
            MinMaxKind::Float64 => (
                std::mem::size_of::<F64State>(),
                std::mem::align_of::<F64State>(),
            ),
            MinMaxKind::Utf8 => (
                std::mem::size_of::<BytesState>(),
                std::mem::align_of::<BytesState>(),
            ),
        }
    }

    fn init_state(&self, state: AggStatePtr) {
        match self.kind {
            MinMaxKind::Int32 | MinMaxKind::Int64 => unsafe {
                std::ptr::write(
                    state as *mut I64State,
                    I64State {
                        value: 0,
                        has_value: false,
                    },
                );
            },
            MinMaxKind::Float64 => unsafe {
                std::ptr::write(
                    state as *mut F64State,
                    F64State {
                        value: 0.0,
                        has_value: false,
                    },
                );
            },
            MinMaxKind::Utf8 => unsafe {
                std::ptr::write(
                    state as *mut BytesState,
                    BytesState {
                        ptr: 0,
                        len: 0,
                        has_value: false,
                    },
                );
            },
        }
    }

    fn update_batch(
        &self,
        states: &[AggStatePtr],
        sel: &[usize],
        input: Option<&ArrayRef>,
        allocator: &AggAllocator,
    ) -> Result<(), String> {
        let array = required(input, self.name())?;
        match self.kind {
            MinMaxKind::Int32 | MinMaxKind::Int64 => {
                let view = IntArrayView::new(array)?;
                for (&state, &row) in states.iter().zip(sel.iter()) {
                    if let Some(v) = view.value_at(row) {
                        let state = unsafe { &mut *(state as *mut I64State) };
                        if !state.has_value || self.better_i64(v, state.value) {
                            state.value = v;
                            state.has_value = true;
                        }
                    }
                }
            }
            MinMaxKind::Float64 => {
                let arr = downcast::<Float64Array>(array)?;
                for (&state, &row) in states.iter().zip(sel.iter()) {
                    if arr.is_null(row) {
                        continue;
                    }
                    let v = arr.value(row);
                    let state = unsafe { &mut *(state as *mut F64State) };
                    if !state.has_value || self.better_f64(v, state.value) {
                        state.value = v;
                        state.has_value = true;
                    }
                }
            }
            MinMaxKind::Utf8 => {
                let arr = downcast::<StringArray>(array)?;
                for (&state, &row) in states.iter().zip(sel.iter()) {
                    if arr.is_null(row) {
                        continue;
                    }
                    let candidate = arr.value(row).as_bytes();
                    let state = unsafe { &mut *(state as *mut BytesState) };
                    if !state.has_value || self.better_bytes(candidate, unsafe { state.as_slice() })
                    {
                        state.ptr = allocator.alloc_copy(candidate);
                        state.len = candidate.len();
                        state.has_value = true;
                    }
                }
            }
        }
        Ok(())
    }

    fn combine_batch(
        &self,
        src: &[AggStatePtr],
        dst: &[AggStatePtr],
        _allocator: &AggAllocator,
    ) -> Result<(), String> {
        match self.kind {
            MinMaxKind::Int32 | MinMaxKind::Int64 => {
                for (&src, &dst) in src.iter().zip(dst.iter()) {
                    let src = unsafe { &*(src as *const I64State) };
                    if !src.has_value {
                        continue;
                    }
                    let dst = unsafe { &mut *(dst as *mut I64State) };
                    if !dst.has_value || self.better_i64(src.value, dst.value) {
                        *dst = *src;
                    }
                }
            }
            MinMaxKind::Float64 => {
                for (&src, &dst) in src.iter().zip(dst.iter()) {
                    let src = unsafe { &*(src as *const F64State) };
                    if !src.has_value {
                        continue;
                    }
                    let dst = unsafe { &mut *(dst as *mut F64State) };
                    if !dst.has_value || self.better_f64(src.value, dst.value) {
                        *dst = *src;
                    }
                }
            }
            MinMaxKind::Utf8 => {
                for (&src, &dst) in src.iter().zip(dst.iter()) {
                    let src = unsafe { &*(src as *const BytesState) };
                    if !src.has_value {
                        continue;
                    }
                    let dst = unsafe { &mut *(dst as *mut BytesState) };
                    if !dst.has_value
                        || self.better_bytes(unsafe { src.as_slice() }, unsafe { dst.as_slice() })
                    {
                        *dst = *src;
                    }
                }
            }
        }
        Ok(())
    }

    fn finalize_batch(&self, states: &[AggStatePtr]) -> Result<ArrayRef, String> {
        match self.kind {
            MinMaxKind::Int32 => {
                let mut builder = Int32Builder::with_capacity(states.len());
                for &state in states {
                    let state = unsafe { &*(state as *const I64State) };
                    if state.has_value {
                        let value = i32::try_from(state.value)
                            .map_err(|_| "min/max int32 value out of range".to_string())?;
                        builder.append_value(value);
                    } else {
                        builder.append_null();
                    }
                }
                Ok(Arc::new(builder.finish()))
            }
            MinMaxKind::Int64 => {
                let mut builder = Int64Builder::with_capacity(states.len());
                for &state in states {
                    let state = unsafe { &*(state as *const I64State) };
                    if state.has_value {
                        builder.append_value(state.value);
                    } else {
                        builder.append_null();
                    }
                }
                Ok(Arc::new(builder.finish()))
            }
            MinMaxKind::Float64 => {
                let mut builder = Float64Builder::with_capacity(states.len());
                for &state in states {
                    let state = unsafe { &*(state as *const F64State) };
                    if state.has_value {
                        builder.append_value(state.value);
                    } else {
                        builder.append_null();
                    }
                }
                Ok(Arc::new(builder.finish()))
            }
            MinMaxKind::Utf8 => {
                let mut builder = StringBuilder::new();
                for &state in states {
                    let state = unsafe { &*(state as *const BytesState) };
                    if state.has_value {
                        let value = std::str::from_utf8(unsafe { state.as_slice() })
                            .map_err(|_| "min/max utf8 state is not valid utf8".to_string())?;
                        builder.append_value(value);
                    } else {
                        builder.append_null();
                    }
                }
                Ok(Arc::new(builder.finish()))
            }
        }
    }
}
