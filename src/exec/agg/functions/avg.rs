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

use arrow::array::{ArrayRef, Float64Builder};
use arrow::datatypes::DataType;

use super::super::{AggAllocator, AggStatePtr, AggregateFunction};
use super::common::{NumericArrayView, required};

#[derive(Clone, Copy)]
struct AvgState {
    sum: f64,
    count: i64,
}

/// `avg(col)` over any numeric input, widened to Float64.
pub struct AvgAgg;

impl AvgAgg {
    pub fn try_new(input_type: &DataType) -> Result<Self, String> {
        match input_type {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::Float32
            | DataType::Float64 => Ok(Self),
            other => Err(format!("avg unsupported input type: {:?}", other)),
        }
    }
}

impl AggregateFunction for AvgAgg {
    fn name(&self) -> &str {
        "avg"
    }

    fn output_type(&self) -> DataType {
        DataType::Float64
    }

    fn state_layout(&self) -> (usize, usize) {
        (
            std::mem::size_of::<AvgState>(),
            std::mem::align_of::<AvgState>(),
        )
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe {
            std::ptr::write(state as *mut AvgState, AvgState { sum: 0.0, count: 0 });
        }
    }

    fn update_batch(
        &self,
        states: &[AggStatePtr],
        sel: &[usize],
        input: Option<&ArrayRef>,
        _allocator: &AggAllocator,
    ) -> Result<(), String> {
        let array = required(input, "avg")?;
        let view = NumericArrayView::new(array)?;
        for (&state, &row) in states.iter().zip(sel.iter()) {
            if let Some(v) = view.value_at(row) {
                let state = unsafe { &mut *(state as *mut AvgState) };
                state.sum += v;
                state.count += 1;
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
        for (&src, &dst) in src.iter().zip(dst.iter()) {
            let src = unsafe { &*(src as *const AvgState) };
            if src.count == 0 {
                continue;
            }
            let dst = unsafe { &mut *(dst as *mut AvgState) };
            dst.sum += src.sum;
            dst.count += src.count;
        }
        Ok(())
    }

    fn finalize_batch(&self, states: &[AggStatePtr]) -> Result<ArrayRef, String> {
        let mut builder = Float64Builder::with_capacity(states.len());
        for &state in states {
            let state = unsafe { &*(state as *const AvgState) };
            if state.count > 0 {
                builder.append_value(state.sum / state.count as f64);
            } else {
                builder.append_null();
            }
        }
        Ok(Arc::new(builder.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int64Array};

    #[test]
    fn avg_widens_integers() {
        let arena = AggAllocator::default();
        let agg = AvgAgg::try_new(&DataType::Int64).unwrap();
        let (size, align) = agg.state_layout();
        let state = arena.alloc(size, align);
        agg.init_state(state);
        let input: ArrayRef = Arc::new(Int64Array::from(vec![Some(1), Some(2), Some(6)]));
        agg.update_batch(&[state; 3], &[0, 1, 2], Some(&input), &arena)
            .unwrap();
        let out = agg.finalize_batch(&[state]).unwrap();
        let out = out.as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(out.value(0), 3.0);
    }
}
