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

use arrow::array::{ArrayRef, Float64Builder, Int64Builder};
use arrow::datatypes::DataType;

use super::super::{AggAllocator, AggStatePtr, AggregateFunction};
use super::common::{FloatArrayView, IntArrayView, required};

#[derive(Clone, Copy)]
struct SumIntState {
    sum: i64,
    has_value: bool,
}

#[derive(Clone, Copy)]
struct SumFloatState {
    sum: f64,
    has_value: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SumKind {
    Int,
    Float,
}

/// `sum(col)`. Integer inputs accumulate into Int64, float inputs into
/// Float64. All-NULL (or empty) input finalizes to NULL.
pub struct SumAgg {
    kind: SumKind,
}

impl SumAgg {
    pub fn try_new(input_type: &DataType) -> Result<Self, String> {
        let kind = match input_type {
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => SumKind::Int,
            DataType::Float32 | DataType::Float64 => SumKind::Float,
            other => return Err(format!("sum unsupported input type: {:?}", other)),
        };
        Ok(Self { kind })
    }
}

impl AggregateFunction for SumAgg {
    fn name(&self) -> &str {
        "sum"
    }

    fn output_type(&self) -> DataType {
        match self.kind {
            SumKind::Int => DataType::Int64,
            SumKind::Float => DataType::Float64,
        }
    }

    fn state_layout(&self) -> (usize, usize) {
        match self.kind {
            SumKind::Int => (
                std::mem::size_of::<SumIntState>(),
                std::mem::align_of::<SumIntState>(),
            ),
            SumKind::Float => (
                std::mem::size_of::<SumFloatState>(),
                std::mem::align_of::<SumFloatState>(),
            ),
        }
    }

    fn init_state(&self, state: AggStatePtr) {
        match self.kind {
            SumKind::Int => unsafe {
                std::ptr::write(
                    state as *mut SumIntState,
                    SumIntState {
                        sum: 0,
                        has_value: false,
                    },
                );
            },
            SumKind::Float => unsafe {
                std::ptr::write(
                    state as *mut SumFloatState,
                    SumFloatState {
                        sum: 0.0,
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
        _allocator: &AggAllocator,
    ) -> Result<(), String> {
        let array = required(input, "sum")?;
        match self.kind {
            SumKind::Int => {
                let view = IntArrayView::new(array)?;
                for (&state, &row) in states.iter().zip(sel.iter()) {
                    if let Some(v) = view.value_at(row) {
                        let state = unsafe { &mut *(state as *mut SumIntState) };
                        state.sum = state.sum.wrapping_add(v);
                        state.has_value = true;
                    }
                }
            }
            SumKind::Float => {
                let view = FloatArrayView::new(array)?;
                for (&state, &row) in states.iter().zip(sel.iter()) {
                    if let Some(v) = view.value_at(row) {
                        let state = unsafe { &mut *(state as *mut SumFloatState) };
                        state.sum += v;
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
            SumKind::Int => {
                for (&src, &dst) in src.iter().zip(dst.iter()) {
                    let src = unsafe { &*(src as *const SumIntState) };
                    if !src.has_value {
                        continue;
                    }
                    let dst = unsafe { &mut *(dst as *mut SumIntState) };
                    dst.sum = dst.sum.wrapping_add(src.sum);
                    dst.has_value = true;
                }
            }
            SumKind::Float => {
                for (&src, &dst) in src.iter().zip(dst.iter()) {
                    let src = unsafe { &*(src as *const SumFloatState) };
                    if !src.has_value {
                        continue;
                    }
                    let dst = unsafe { &mut *(dst as *mut SumFloatState) };
                    dst.sum += src.sum;
                    dst.has_value = true;
                }
            }
        }
        Ok(())
    }

    fn finalize_batch(&self, states: &[AggStatePtr]) -> Result<ArrayRef, String> {
        match self.kind {
            SumKind::Int => {
                let mut builder = Int64Builder::with_capacity(states.len());
                for &state in states {
                    let state = unsafe { &*(state as *const SumIntState) };
                    if state.has_value {
                        builder.append_value(state.sum);
                    } else {
                        builder.append_null();
                    }
                }
                Ok(Arc::new(builder.finish()))
            }
            SumKind::Float => {
                let mut builder = Float64Builder::with_capacity(states.len());
                for &state in states {
                    let state = unsafe { &*(state as *const SumFloatState) };
                    if state.has_value {
                        builder.append_value(state.sum);
                    } else {
                        builder.append_null();
                    }
                }
                Ok(Arc::new(builder.finish()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, Int64Array};

    #[test]
    fn sum_int_accumulates_and_combines() {
        let arena = AggAllocator::default();
        let agg = SumAgg::try_new(&DataType::Int32).unwrap();
        let (size, align) = agg.state_layout();
        let a = arena.alloc(size, align);
        let b = arena.alloc(size, align);
        agg.init_state(a);
        agg.init_state(b);

        let input: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), Some(2), None, Some(4)]));
        agg.update_batch(&[a, a, b, b], &[0, 1, 2, 3], Some(&input), &arena)
            .unwrap();
        agg.combine_batch(&[b], &[a], &arena).unwrap();

        let out = agg.finalize_batch(&[a]).unwrap();
        let out = out.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(out.value(0), 7);
    }

    #[test]
    fn sum_without_values_is_null() {
        let arena = AggAllocator::default();
        let agg = SumAgg::try_new(&DataType::Int64).unwrap();
        let (size, align) = agg.state_layout();
        let state = arena.alloc(size, align);
        agg.init_state(state);
        let out = agg.finalize_batch(&[state]).unwrap();
        assert!(out.is_null(0));
    }
}
