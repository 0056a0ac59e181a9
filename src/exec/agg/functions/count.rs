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

use arrow::array::{Array, ArrayRef, Int64Builder};
use arrow::datatypes::DataType;

use super::super::{AggAllocator, AggStatePtr, AggregateFunction};
use super::common;

#[derive(Clone, Copy)]
struct CountState {
    count: i64,
}

/// `count(*)` / `count(col)`. Empty input finalizes to 0, never NULL.
pub struct CountAgg {
    count_star: bool,
}

impl CountAgg {
    pub fn star() -> Self {
        Self { count_star: true }
    }

    pub fn column() -> Self {
        Self { count_star: false }
    }

    fn state_at(state: AggStatePtr) -> *mut CountState {
        state as *mut CountState
    }
}

impl AggregateFunction for CountAgg {
    fn name(&self) -> &str {
        "count"
    }

    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn state_layout(&self) -> (usize, usize) {
        (
            std::mem::size_of::<CountState>(),
            std::mem::align_of::<CountState>(),
        )
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe {
            std::ptr::write(Self::state_at(state), CountState { count: 0 });
        }
    }

    fn update_batch(
        &self,
        states: &[AggStatePtr],
        sel: &[usize],
        input: Option<&ArrayRef>,
        _allocator: &AggAllocator,
    ) -> Result<(), String> {
        if self.count_star {
            if input.is_some() {
                return Err("count(*) takes no input".to_string());
            }
            for &state in states {
                unsafe {
                    (*Self::state_at(state)).count += 1;
                }
            }
            return Ok(());
        }
        let array = common::required(input, "count")?;
        for (&state, &row) in states.iter().zip(sel.iter()) {
            if array.is_null(row) {
                continue;
            }
            unsafe {
                (*Self::state_at(state)).count += 1;
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
            unsafe {
                (*Self::state_at(dst)).count += (*Self::state_at(src)).count;
            }
        }
        Ok(())
    }

    fn finalize_batch(&self, states: &[AggStatePtr]) -> Result<ArrayRef, String> {
        let mut builder = Int64Builder::with_capacity(states.len());
        for &state in states {
            let value = unsafe { (*Self::state_at(state)).count };
            builder.append_value(value);
        }
        Ok(Arc::new(builder.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;

    fn alloc_states(arena: &AggAllocator, agg: &dyn AggregateFunction, n: usize) -> Vec<AggStatePtr> {
        let (size, align) = agg.state_layout();
        (0..n)
            .map(|_| {
                let ptr = arena.alloc(size, align);
                agg.init_state(ptr);
                ptr
            })
            .collect()
    }

    #[test]
    fn count_star_counts_every_row() {
        let arena = AggAllocator::default();
        let agg = CountAgg::star();
        let states = alloc_states(&arena, &agg, 1);
        let targets = vec![states[0]; 5];
        agg.update_batch(&targets, &[0, 1, 2, 3, 4], None, &arena)
            .unwrap();
        let out = agg.finalize_batch(&states).unwrap();
        let out = out.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(out.value(0), 5);
    }

    #[test]
    fn count_column_skips_nulls() {
        let arena = AggAllocator::default();
        let agg = CountAgg::column();
        let states = alloc_states(&arena, &agg, 1);
        let input: ArrayRef = Arc::new(Int64Array::from(vec![Some(1), None, Some(3)]));
        let targets = vec![states[0]; 3];
        agg.update_batch(&targets, &[0, 1, 2], Some(&input), &arena)
            .unwrap();
        let out = agg.finalize_batch(&states).unwrap();
        let out = out.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(out.value(0), 2);
    }

    #[test]
    fn empty_input_finalizes_to_zero() {
        let arena = AggAllocator::default();
        let agg = CountAgg::star();
        let states = alloc_states(&arena, &agg, 1);
        let out = agg.finalize_batch(&states).unwrap();
        let out = out.as_any().downcast_ref::<Int64Array>().unwrap();
        assert!(!out.is_null(0));
        assert_eq!(out.value(0), 0);
    }
}
